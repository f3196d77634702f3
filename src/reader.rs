//! Read traversal.
//!
//! Walks a selection tree against the composed store view and materializes a
//! JSON payload in response shape. Missing data never errors: an unknown
//! record or never-written field flips `is_missing_data` and leaves a JSON
//! null in place, so callers can render partial data and let the diff engine
//! fetch the rest.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::query::{RootSelection, Selection, SelectionKind};
use crate::store::record::{FieldValue, Record, RecordId};
use crate::store::{RecordState, RecordStore};

/// Outcome of one read traversal.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub data: Value,
    /// True when any requested field or record was never written.
    pub is_missing_data: bool,
    /// Every record identifier the traversal touched. Subscription watch
    /// sets are built from this.
    pub seen_ids: HashSet<RecordId>,
}

impl ReadResult {
    fn missing() -> Self {
        Self {
            data: Value::Null,
            is_missing_data: true,
            seen_ids: HashSet::new(),
        }
    }
}

/// Read a root call out of the store.
pub fn lookup_root(store: &RecordStore, root: &RootSelection) -> ReadResult {
    let Some(id) = store.root_record_id(&root.root_call_key()) else {
        return ReadResult::missing();
    };
    lookup(store, &id, &root.selections)
}

/// Read a selection tree rooted at a known record identifier.
pub fn lookup(store: &RecordStore, id: &str, selections: &[Selection]) -> ReadResult {
    let mut reader = Reader {
        store,
        missing: false,
        seen: HashSet::new(),
    };
    let data = reader.read_record(id, selections);
    ReadResult {
        data,
        is_missing_data: reader.missing,
        seen_ids: reader.seen,
    }
}

struct Reader<'a> {
    store: &'a RecordStore,
    missing: bool,
    seen: HashSet<RecordId>,
}

impl Reader<'_> {
    fn read_record(&mut self, id: &str, selections: &[Selection]) -> Value {
        match self.store.record_state(id) {
            RecordState::Unknown => {
                self.missing = true;
                return Value::Null;
            }
            // Known-deleted reads as null without flagging missing data.
            RecordState::Nonexistent => return Value::Null,
            RecordState::Existent => {}
        }
        self.seen.insert(id.to_string());

        let mut obj = Map::new();
        if let Some(FieldValue::Scalar(v)) = self.store.field(id, "id") {
            obj.insert("id".to_string(), v);
        }
        if let Some(type_name) = self.store.type_name(id) {
            obj.insert("__typename".to_string(), Value::String(type_name));
        }
        for sel in selections {
            self.read_selection(id, sel, &mut obj);
        }
        Value::Object(obj)
    }

    fn read_selection(&mut self, id: &str, sel: &Selection, out: &mut Map<String, Value>) {
        let key = sel.response_key().to_string();
        match &sel.kind {
            SelectionKind::Scalar => match self.store.field(id, &sel.storage_key) {
                None => {
                    self.missing = true;
                    out.insert(key, Value::Null);
                }
                Some(FieldValue::Null) => {
                    out.insert(key, Value::Null);
                }
                Some(FieldValue::Scalar(v)) => {
                    out.insert(key, v);
                }
                Some(other) => {
                    // A link where a scalar was requested: treat as missing
                    // rather than leak an identifier as data.
                    tracing::warn!(id = %id, field = %sel.storage_key, value = ?other,
                        "non-scalar value under scalar selection");
                    self.missing = true;
                    out.insert(key, Value::Null);
                }
            },
            SelectionKind::LinkedSingular(children) => {
                match self.store.field(id, &sel.storage_key) {
                    None => {
                        self.missing = true;
                        out.insert(key, Value::Null);
                    }
                    Some(FieldValue::Null) => {
                        out.insert(key, Value::Null);
                    }
                    Some(FieldValue::Link(child_id)) => {
                        let value = self.read_record(&child_id, children);
                        out.insert(key, value);
                    }
                    Some(FieldValue::Inline(rec)) => {
                        let value = self.read_inline(&rec, children);
                        out.insert(key, value);
                    }
                    Some(_) => {
                        self.missing = true;
                        out.insert(key, Value::Null);
                    }
                }
            }
            SelectionKind::LinkedPlural(children) => {
                match self.store.field(id, &sel.storage_key) {
                    None => {
                        self.missing = true;
                        out.insert(key, Value::Null);
                    }
                    Some(FieldValue::Null) => {
                        out.insert(key, Value::Null);
                    }
                    Some(FieldValue::Links(ids)) => {
                        let elements = ids
                            .iter()
                            .map(|child_id| self.read_record(child_id, children))
                            .collect();
                        out.insert(key, Value::Array(elements));
                    }
                    Some(_) => {
                        self.missing = true;
                        out.insert(key, Value::Null);
                    }
                }
            }
            SelectionKind::Connection {
                args,
                edge_selections,
            } => {
                let conn_id = match self.store.field(id, &sel.storage_key) {
                    None => {
                        self.missing = true;
                        out.insert(key, Value::Null);
                        return;
                    }
                    Some(FieldValue::Null) => {
                        out.insert(key, Value::Null);
                        return;
                    }
                    Some(FieldValue::Link(conn_id)) => conn_id,
                    Some(_) => {
                        self.missing = true;
                        out.insert(key, Value::Null);
                        return;
                    }
                };
                let value = self.read_connection(&conn_id, args, edge_selections);
                out.insert(key, value);
            }
            SelectionKind::TypeRefinement {
                type_condition,
                selections,
            } => match self.store.type_name(id) {
                Some(t) if t == *type_condition => {
                    for child in selections {
                        self.read_selection(id, child, out);
                    }
                }
                Some(_) => {
                    // Concrete type known and different: fields do not apply.
                }
                None => {
                    // Type unknown, so the refinement may apply: the fields
                    // could be present on the server and must count missing.
                    self.missing = true;
                }
            },
            SelectionKind::FragmentReference { selections, .. } => {
                for child in selections {
                    self.read_selection(id, child, out);
                }
            }
        }
    }

    /// Materialize a connection: the satisfied edges in order, their
    /// cursors, and page info derived from the range.
    fn read_connection(
        &mut self,
        conn_id: &str,
        args: &crate::query::ConnectionArgs,
        edge_selections: &[Selection],
    ) -> Value {
        self.seen.insert(conn_id.to_string());

        let Some(snap) = self.store.range_metadata(conn_id, args) else {
            // Connection record exists but no page was ever written.
            self.missing = true;
            return Value::Null;
        };
        if snap.diff_args.is_some() {
            // Part of the requested window is unfetched.
            self.missing = true;
        }

        let mut edges = Vec::with_capacity(snap.edge_ids.len());
        for (edge_id, cursor) in snap.edge_ids.iter().zip(&snap.cursors) {
            let mut edge = match self.read_record(edge_id, edge_selections) {
                Value::Object(obj) => obj,
                _ => Map::new(),
            };
            if let Some(c) = cursor {
                edge.insert("cursor".to_string(), Value::String(c.clone()));
            }
            edges.push(Value::Object(edge));
        }

        let mut conn = Map::new();
        conn.insert("edges".to_string(), Value::Array(edges));
        conn.insert(
            "pageInfo".to_string(),
            serde_json::json!({
                "hasNextPage": snap.page_info.has_next_page,
                "hasPreviousPage": snap.page_info.has_previous_page,
            }),
        );
        Value::Object(conn)
    }

    /// Read an identity-less inline record. Fields come from the embedded
    /// record itself; linked children with identity go back through the
    /// store.
    fn read_inline(&mut self, rec: &Record, selections: &[Selection]) -> Value {
        let mut obj = Map::new();
        if let Some(type_name) = rec.type_name() {
            obj.insert("__typename".to_string(), Value::String(type_name.to_string()));
        }
        for sel in selections {
            let key = sel.response_key().to_string();
            match &sel.kind {
                SelectionKind::Scalar => match rec.get(&sel.storage_key) {
                    None => {
                        self.missing = true;
                        obj.insert(key, Value::Null);
                    }
                    Some(FieldValue::Null) => {
                        obj.insert(key, Value::Null);
                    }
                    Some(FieldValue::Scalar(v)) => {
                        obj.insert(key, v.clone());
                    }
                    Some(_) => {
                        self.missing = true;
                        obj.insert(key, Value::Null);
                    }
                },
                SelectionKind::LinkedSingular(children) => match rec.get(&sel.storage_key) {
                    None => {
                        self.missing = true;
                        obj.insert(key, Value::Null);
                    }
                    Some(FieldValue::Null) => {
                        obj.insert(key, Value::Null);
                    }
                    Some(FieldValue::Link(child_id)) => {
                        let value = self.read_record(child_id, children);
                        obj.insert(key, value);
                    }
                    Some(FieldValue::Inline(inner)) => {
                        let value = self.read_inline(inner, children);
                        obj.insert(key, value);
                    }
                    Some(_) => {
                        self.missing = true;
                        obj.insert(key, Value::Null);
                    }
                },
                SelectionKind::LinkedPlural(children) => match rec.get(&sel.storage_key) {
                    Some(FieldValue::Links(ids)) => {
                        let elements = ids
                            .iter()
                            .map(|child_id| self.read_record(child_id, children))
                            .collect();
                        obj.insert(key, Value::Array(elements));
                    }
                    Some(FieldValue::Null) => {
                        obj.insert(key, Value::Null);
                    }
                    _ => {
                        self.missing = true;
                        obj.insert(key, Value::Null);
                    }
                },
                SelectionKind::TypeRefinement {
                    type_condition,
                    selections,
                } => {
                    if rec.type_name() == Some(type_condition.as_str()) {
                        if let Value::Object(inner) = self.read_inline(rec, selections) {
                            for (k, v) in inner {
                                obj.insert(k, v);
                            }
                        }
                    }
                }
                SelectionKind::FragmentReference { selections, .. } => {
                    if let Value::Object(inner) = self.read_inline(rec, selections) {
                        for (k, v) in inner {
                            obj.insert(k, v);
                        }
                    }
                }
                SelectionKind::Connection {
                    args,
                    edge_selections,
                } => match rec.get(&sel.storage_key) {
                    // Connections on inline records link out to a synthetic
                    // container record in the store.
                    Some(FieldValue::Link(conn_id)) => {
                        let value = self.read_connection(conn_id, args, edge_selections);
                        obj.insert(key, value);
                    }
                    Some(FieldValue::Null) => {
                        obj.insert(key, Value::Null);
                    }
                    _ => {
                        self.missing = true;
                        obj.insert(key, Value::Null);
                    }
                },
            }
        }
        Value::Object(obj)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
