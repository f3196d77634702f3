//! Payload normalization.
//!
//! The normalizer walks a query selection against a response payload and
//! writes scalar fields, linked records, plural lists and connection edges
//! into one tier of the record store, producing a change-set of created and
//! updated record identifiers.
//!
//! Shape errors are fatal to the single write: the whole payload subtree is
//! structurally validated before any mutation, so a rejected write commits
//! nothing.

use serde_json::{Map, Value};

use crate::error::{CacheError, Result};
use crate::query::{ConnectionArgs, RootSelection, Selection, SelectionKind};
use crate::store::range::{EdgeEntry, PageInfo};
use crate::store::record::{FieldValue, Record, RecordId, CLIENT_ID_PREFIX};
use crate::store::{RecordStore, TierKind};
use crate::tracker::QueryTracker;

/// Payload keys with fixed meaning.
const KEY_ID: &str = "id";
const KEY_TYPENAME: &str = "__typename";
const KEY_EDGES: &str = "edges";
const KEY_CURSOR: &str = "cursor";
const KEY_PAGE_INFO: &str = "pageInfo";
const KEY_HAS_NEXT_PAGE: &str = "hasNextPage";
const KEY_HAS_PREVIOUS_PAGE: &str = "hasPreviousPage";

// ── Change-set ─────────────────────────────────────────────────────

/// Record identifiers touched by one write. `created` is the subset of
/// `updated` that had no prior entry in the target tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub created: Vec<RecordId>,
    pub updated: Vec<RecordId>,
}

impl ChangeSet {
    fn visit(&mut self, id: &str, created: bool) {
        if created && !self.created.iter().any(|x| x == id) {
            self.created.push(id.to_string());
        }
        if !self.updated.iter().any(|x| x == id) {
            self.updated.push(id.to_string());
        }
    }
}

// ── Normalizer ─────────────────────────────────────────────────────

/// One-shot payload writer targeting a single tier.
pub struct NormalizerWriter<'a> {
    store: &'a mut RecordStore,
    tracker: &'a mut QueryTracker,
    tier: TierKind,
    change: ChangeSet,
}

impl<'a> NormalizerWriter<'a> {
    pub fn new(
        store: &'a mut RecordStore,
        tracker: &'a mut QueryTracker,
        tier: TierKind,
    ) -> Self {
        Self {
            store,
            tracker,
            tier,
            change: ChangeSet::default(),
        }
    }

    /// Normalize one root-level payload into the target tier.
    pub fn write_root(mut self, root: &RootSelection, payload: &Value) -> Result<ChangeSet> {
        let Value::Object(obj) = payload else {
            return Err(shape_error("$", "object", payload));
        };

        let root_key = root.root_call_key();
        let Some(field_payload) = obj.get(&root.field_name) else {
            tracing::debug!(root = %root_key, "root field absent from payload, nothing written");
            return Ok(self.change);
        };

        // Structural validation of the whole subtree before any mutation.
        validate_selections(&root.selections, field_payload, &root.field_name)?;

        match field_payload {
            Value::Null => {
                // The server answered: this root resolves to nothing.
                if let Some(id) = self.store.root_record_id(&root_key) {
                    self.store.delete_record(self.tier, &id);
                    self.change.visit(&id, false);
                }
            }
            Value::Object(map) => {
                let id = self.resolve_root_id(&root_key, map);
                self.store.put_root_record(self.tier, &root_key, &id);
                self.visit_record(&id, &root.selections, map)?;
            }
            other => return Err(shape_error(&root.field_name, "object or null", other)),
        }

        tracing::debug!(
            root = %root_key,
            created = self.change.created.len(),
            updated = self.change.updated.len(),
            "payload normalized"
        );
        Ok(self.change)
    }

    fn resolve_root_id(&mut self, root_key: &str, map: &Map<String, Value>) -> RecordId {
        if let Some(id) = payload_id(map) {
            return id;
        }
        if let Some(existing) = self.store.root_record_id(root_key) {
            return existing;
        }
        self.store.next_client_id()
    }

    /// Normalize one payload object into the record for `id`.
    fn visit_record(
        &mut self,
        id: &str,
        selections: &[Selection],
        obj: &Map<String, Value>,
    ) -> Result<()> {
        let created = !self.store.has_entry_in(self.tier, id);
        self.store.record_mut(self.tier, id);
        self.change.visit(id, created);

        if let Some(Value::String(type_name)) = obj.get(KEY_TYPENAME) {
            self.store.set_type_name(self.tier, id, type_name);
        }
        if let Some(id_value) = obj.get(KEY_ID) {
            self.store
                .put_field(self.tier, id, KEY_ID, FieldValue::Scalar(id_value.clone()));
        }

        for sel in selections {
            self.visit_selection(id, sel, obj)?;
        }
        Ok(())
    }

    fn visit_selection(
        &mut self,
        id: &str,
        sel: &Selection,
        obj: &Map<String, Value>,
    ) -> Result<()> {
        match &sel.kind {
            SelectionKind::Scalar => {
                if let Some(value) = obj.get(sel.response_key()) {
                    let field = match value {
                        Value::Null => FieldValue::Null,
                        other => FieldValue::Scalar(other.clone()),
                    };
                    self.store.put_field(self.tier, id, &sel.storage_key, field);
                }
            }
            SelectionKind::LinkedSingular(children) => {
                match obj.get(sel.response_key()) {
                    None => {}
                    Some(Value::Null) => {
                        self.store
                            .put_field(self.tier, id, &sel.storage_key, FieldValue::Null);
                    }
                    Some(Value::Object(map)) => {
                        if let Some(child_id) = payload_id(map) {
                            self.store.put_field(
                                self.tier,
                                id,
                                &sel.storage_key,
                                FieldValue::Link(child_id.clone()),
                            );
                            self.visit_record(&child_id, children, map)?;
                        } else {
                            // No server identity: embed in place, readable
                            // only through this pointer.
                            let path = format!("{id}:{}", sel.storage_key);
                            let inline = self.build_inline(&path, children, map)?;
                            self.store.put_field(
                                self.tier,
                                id,
                                &sel.storage_key,
                                FieldValue::Inline(Box::new(inline)),
                            );
                        }
                    }
                    // Unreachable after validation; kept as a hard stop.
                    Some(other) => return Err(shape_error(&sel.storage_key, "object or null", other)),
                }
            }
            SelectionKind::LinkedPlural(children) => {
                match obj.get(sel.response_key()) {
                    None => {}
                    Some(Value::Null) => {
                        self.store
                            .put_field(self.tier, id, &sel.storage_key, FieldValue::Null);
                    }
                    Some(Value::Array(elements)) => {
                        let mut ids = Vec::with_capacity(elements.len());
                        for (i, element) in elements.iter().enumerate() {
                            let Value::Object(map) = element else {
                                tracing::warn!(
                                    field = %sel.storage_key,
                                    index = i,
                                    "non-object plural element skipped"
                                );
                                continue;
                            };
                            let child_id = payload_id(map).unwrap_or_else(|| {
                                synthetic_id(&format!("{id}:{}", sel.storage_key), &i.to_string())
                            });
                            self.visit_record(&child_id, children, map)?;
                            ids.push(child_id);
                        }
                        self.store
                            .put_field(self.tier, id, &sel.storage_key, FieldValue::Links(ids));
                    }
                    Some(other) => return Err(shape_error(&sel.storage_key, "array or null", other)),
                }
            }
            SelectionKind::Connection {
                args,
                edge_selections,
            } => {
                match obj.get(sel.response_key()) {
                    None => {}
                    Some(Value::Null) => {
                        self.store
                            .put_field(self.tier, id, &sel.storage_key, FieldValue::Null);
                    }
                    Some(Value::Object(map)) => {
                        let conn_id = payload_id(map)
                            .unwrap_or_else(|| synthetic_id(id, &sel.storage_key));
                        self.store.put_field(
                            self.tier,
                            id,
                            &sel.storage_key,
                            FieldValue::Link(conn_id.clone()),
                        );
                        self.write_connection(&conn_id, args, edge_selections, map)?;
                    }
                    Some(other) => return Err(shape_error(&sel.storage_key, "object or null", other)),
                }
            }
            SelectionKind::TypeRefinement {
                type_condition,
                selections,
            } => {
                let resolved = match obj.get(KEY_TYPENAME) {
                    Some(Value::String(t)) => Some(t.clone()),
                    _ => self.store.type_name(id),
                };
                match resolved {
                    Some(t) if t == *type_condition => {
                        for child in selections {
                            self.visit_selection(id, child, obj)?;
                        }
                    }
                    Some(_) => {
                        tracing::debug!(
                            id = %id,
                            condition = %type_condition,
                            "type refinement skipped: concrete type differs"
                        );
                    }
                    None => {
                        // Unknown type: never write fields the server may
                        // not have intended for this record.
                        tracing::debug!(
                            id = %id,
                            condition = %type_condition,
                            "type refinement skipped: type not yet known"
                        );
                    }
                }
            }
            SelectionKind::FragmentReference {
                composite_hash,
                deferred,
                selections,
                ..
            } => {
                for child in selections {
                    self.visit_selection(id, child, obj)?;
                }
                // A deferred fragment is satisfied by a follow-up payload,
                // so the initial write never marks it tracked.
                if !*deferred {
                    self.tracker.track(id, *composite_hash);
                }
            }
        }
        Ok(())
    }

    /// Normalize a connection payload into the container record `conn_id`.
    /// The caller has already written the parent's link to it.
    fn write_connection(
        &mut self,
        conn_id: &str,
        args: &ConnectionArgs,
        edge_selections: &[Selection],
        map: &Map<String, Value>,
    ) -> Result<()> {
        let created = !self.store.has_entry_in(self.tier, conn_id);
        self.store.record_mut(self.tier, conn_id);
        self.change.visit(conn_id, created);
        if let Some(Value::String(type_name)) = map.get(KEY_TYPENAME) {
            self.store.set_type_name(self.tier, conn_id, type_name);
        }

        let page_info = parse_page_info(map.get(KEY_PAGE_INFO));

        let Some(edges_value) = map.get(KEY_EDGES) else {
            return Ok(());
        };
        let Value::Array(edges) = edges_value else {
            return Err(shape_error(KEY_EDGES, "array", edges_value));
        };

        let mut entries = Vec::with_capacity(edges.len());
        for (i, edge_value) in edges.iter().enumerate() {
            let Value::Object(edge_obj) = edge_value else {
                return Err(shape_error(KEY_EDGES, "object", edge_value));
            };

            let cursor = match edge_obj.get(KEY_CURSOR) {
                Some(Value::String(c)) => Some(c.clone()),
                _ => None,
            };
            let edge_id = edge_identity(conn_id, edge_obj, i);

            self.visit_record(&edge_id, edge_selections, edge_obj)?;
            if let Some(c) = &cursor {
                self.store.put_field(
                    self.tier,
                    &edge_id,
                    KEY_CURSOR,
                    FieldValue::Scalar(Value::String(c.clone())),
                );
            }
            entries.push(EdgeEntry {
                edge_id,
                cursor,
            });
        }

        self.store
            .range_for_write(self.tier, conn_id)
            .add_items(args, &entries, &page_info)
    }

    /// Normalize an identity-less object into an inline record. Children
    /// that do carry identity are still normalized into the record table
    /// and linked from the inline record.
    fn build_inline(
        &mut self,
        path: &str,
        selections: &[Selection],
        obj: &Map<String, Value>,
    ) -> Result<Record> {
        let mut rec = Record::new();
        if let Some(Value::String(type_name)) = obj.get(KEY_TYPENAME) {
            rec.observe_type_name(type_name);
        }

        for sel in selections {
            match &sel.kind {
                SelectionKind::Scalar => {
                    if let Some(value) = obj.get(sel.response_key()) {
                        let field = match value {
                            Value::Null => FieldValue::Null,
                            other => FieldValue::Scalar(other.clone()),
                        };
                        rec.set(sel.storage_key.clone(), field);
                    }
                }
                SelectionKind::LinkedSingular(children) => match obj.get(sel.response_key()) {
                    None => {}
                    Some(Value::Null) => rec.set(sel.storage_key.clone(), FieldValue::Null),
                    Some(Value::Object(map)) => {
                        if let Some(child_id) = payload_id(map) {
                            rec.set(sel.storage_key.clone(), FieldValue::Link(child_id.clone()));
                            self.visit_record(&child_id, children, map)?;
                        } else {
                            let nested_path = format!("{path}:{}", sel.storage_key);
                            let inner = self.build_inline(&nested_path, children, map)?;
                            rec.set(
                                sel.storage_key.clone(),
                                FieldValue::Inline(Box::new(inner)),
                            );
                        }
                    }
                    Some(other) => {
                        return Err(shape_error(&sel.storage_key, "object or null", other))
                    }
                },
                SelectionKind::LinkedPlural(children) => match obj.get(sel.response_key()) {
                    None => {}
                    Some(Value::Null) => rec.set(sel.storage_key.clone(), FieldValue::Null),
                    Some(Value::Array(elements)) => {
                        let mut ids = Vec::with_capacity(elements.len());
                        for (i, element) in elements.iter().enumerate() {
                            let Value::Object(map) = element else {
                                continue;
                            };
                            let child_id = payload_id(map).unwrap_or_else(|| {
                                synthetic_id(
                                    &format!("{path}:{}", sel.storage_key),
                                    &i.to_string(),
                                )
                            });
                            self.visit_record(&child_id, children, map)?;
                            ids.push(child_id);
                        }
                        rec.set(sel.storage_key.clone(), FieldValue::Links(ids));
                    }
                    Some(other) => {
                        return Err(shape_error(&sel.storage_key, "array or null", other))
                    }
                },
                SelectionKind::Connection {
                    args,
                    edge_selections,
                } => match obj.get(sel.response_key()) {
                    None => {}
                    Some(Value::Null) => rec.set(sel.storage_key.clone(), FieldValue::Null),
                    Some(Value::Object(map)) => {
                        // The container record holding the range lives in
                        // the store under an id hung off the inline path;
                        // the inline record links out to it.
                        let conn_id = payload_id(map)
                            .unwrap_or_else(|| synthetic_id(path, &sel.storage_key));
                        rec.set(sel.storage_key.clone(), FieldValue::Link(conn_id.clone()));
                        self.write_connection(&conn_id, args, edge_selections, map)?;
                    }
                    Some(other) => {
                        return Err(shape_error(&sel.storage_key, "object or null", other))
                    }
                },
                SelectionKind::TypeRefinement {
                    type_condition,
                    selections,
                } => {
                    let matches = matches!(
                        obj.get(KEY_TYPENAME),
                        Some(Value::String(t)) if t == type_condition
                    ) || rec.type_name() == Some(type_condition.as_str());
                    if matches {
                        let inner = self.build_inline(path, selections, obj)?;
                        for (key, value) in inner.field_values() {
                            rec.set(key.clone(), value.clone());
                        }
                    }
                }
                SelectionKind::FragmentReference { selections, .. } => {
                    // Identity-less records cannot be tracked; just write.
                    let inner = self.build_inline(path, selections, obj)?;
                    for (key, value) in inner.field_values() {
                        rec.set(key.clone(), value.clone());
                    }
                }
            }
        }
        Ok(rec)
    }
}

// ── Identity helpers ───────────────────────────────────────────────

fn payload_id(map: &Map<String, Value>) -> Option<RecordId> {
    match map.get(KEY_ID) {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Deterministic client identifier for a record with no server identity,
/// derived from its parent identifier and storage path so repeated writes
/// of the same payload are idempotent.
fn synthetic_id(parent: &str, key: &str) -> RecordId {
    if let Some(stripped) = parent.strip_prefix(CLIENT_ID_PREFIX) {
        format!("{CLIENT_ID_PREFIX}{stripped}:{key}")
    } else {
        format!("{CLIENT_ID_PREFIX}{parent}:{key}")
    }
}

fn edge_identity(conn_id: &str, edge_obj: &Map<String, Value>, index: usize) -> RecordId {
    if let Some(id) = payload_id(edge_obj) {
        return id;
    }
    let node_id = edge_obj
        .get("node")
        .and_then(|n| n.as_object())
        .and_then(payload_id);
    match node_id {
        Some(node_id) => synthetic_id(conn_id, &format!("edge:{node_id}")),
        None => synthetic_id(conn_id, &format!("edge:{index}")),
    }
}

fn parse_page_info(value: Option<&Value>) -> PageInfo {
    let mut info = PageInfo::default();
    if let Some(Value::Object(map)) = value {
        if let Some(Value::Bool(b)) = map.get(KEY_HAS_NEXT_PAGE) {
            info.has_next_page = *b;
        }
        if let Some(Value::Bool(b)) = map.get(KEY_HAS_PREVIOUS_PAGE) {
            info.has_previous_page = *b;
        }
    }
    info
}

// ── Shape validation ───────────────────────────────────────────────

fn shape_error(path: &str, expected: &'static str, actual: &Value) -> CacheError {
    CacheError::ShapeMismatch {
        path: path.to_string(),
        expected,
        actual: kind_name(actual).to_string(),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Structural pre-pass: checks every present payload key against its
/// selection's expected kind, recursively, without mutating anything.
fn validate_selections(selections: &[Selection], value: &Value, path: &str) -> Result<()> {
    let obj = match value {
        Value::Null => return Ok(()),
        Value::Object(obj) => obj,
        other => return Err(shape_error(path, "object or null", other)),
    };

    for sel in selections {
        let child_path = format!("{path}.{}", sel.response_key());
        match &sel.kind {
            SelectionKind::Scalar => {
                if let Some(v) = obj.get(sel.response_key()) {
                    validate_scalar(v, &child_path)?;
                }
            }
            SelectionKind::LinkedSingular(children) => {
                if let Some(v) = obj.get(sel.response_key()) {
                    validate_selections(children, v, &child_path)?;
                }
            }
            SelectionKind::LinkedPlural(children) => {
                if let Some(v) = obj.get(sel.response_key()) {
                    match v {
                        Value::Null => {}
                        Value::Array(elements) => {
                            for element in elements {
                                validate_selections(children, element, &child_path)?;
                            }
                        }
                        other => return Err(shape_error(&child_path, "array or null", other)),
                    }
                }
            }
            SelectionKind::Connection {
                edge_selections, ..
            } => {
                if let Some(v) = obj.get(sel.response_key()) {
                    validate_connection(edge_selections, v, &child_path)?;
                }
            }
            SelectionKind::TypeRefinement {
                type_condition,
                selections,
            } => {
                // A refinement for a different concrete type never applies,
                // so its shape expectations must not reject the payload.
                // With no type name in the payload, any refinement may
                // apply and is checked.
                let applies = match obj.get(KEY_TYPENAME) {
                    Some(Value::String(t)) => t == type_condition,
                    _ => true,
                };
                if applies {
                    validate_selections(selections, value, path)?;
                }
            }
            SelectionKind::FragmentReference { selections, .. } => {
                validate_selections(selections, value, path)?;
            }
        }
    }
    Ok(())
}

fn validate_scalar(value: &Value, path: &str) -> Result<()> {
    match value {
        Value::Object(_) => Err(shape_error(path, "scalar", value)),
        Value::Array(elements) => {
            for element in elements {
                if matches!(element, Value::Object(_) | Value::Array(_)) {
                    return Err(shape_error(path, "array of scalars", element));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_connection(edge_selections: &[Selection], value: &Value, path: &str) -> Result<()> {
    let map = match value {
        Value::Null => return Ok(()),
        Value::Object(map) => map,
        other => return Err(shape_error(path, "object or null", other)),
    };

    if let Some(page_info) = map.get(KEY_PAGE_INFO) {
        if !matches!(page_info, Value::Object(_) | Value::Null) {
            return Err(shape_error(
                &format!("{path}.{KEY_PAGE_INFO}"),
                "object or null",
                page_info,
            ));
        }
    }

    let Some(edges) = map.get(KEY_EDGES) else {
        return Ok(());
    };
    let Value::Array(edges) = edges else {
        return Err(shape_error(&format!("{path}.{KEY_EDGES}"), "array", edges));
    };
    for (i, edge) in edges.iter().enumerate() {
        let edge_path = format!("{path}.{KEY_EDGES}[{i}]");
        let Value::Object(edge_obj) = edge else {
            return Err(shape_error(&edge_path, "object", edge));
        };
        if let Some(cursor) = edge_obj.get(KEY_CURSOR) {
            if !matches!(cursor, Value::String(_) | Value::Null) {
                return Err(shape_error(
                    &format!("{edge_path}.{KEY_CURSOR}"),
                    "string",
                    cursor,
                ));
            }
        }
        validate_selections(edge_selections, edge, &edge_path)?;
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ConnectionArgs;
    use serde_json::json;

    fn write(
        store: &mut RecordStore,
        tracker: &mut QueryTracker,
        tier: TierKind,
        root: &RootSelection,
        payload: Value,
    ) -> Result<ChangeSet> {
        NormalizerWriter::new(store, tracker, tier).write_root(root, &payload)
    }

    fn me_query() -> RootSelection {
        RootSelection::new(
            "me",
            "",
            vec![Selection::scalar("id"), Selection::scalar("name")],
        )
    }

    #[test]
    fn writes_scalars_and_roots() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();

        let change = write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &me_query(),
            json!({"me": {"id": "1", "name": "Joe"}}),
        )
        .unwrap();

        assert_eq!(change.created, vec!["1"]);
        assert_eq!(change.updated, vec!["1"]);
        assert_eq!(store.root_record_id("me()"), Some("1".to_string()));
        assert_eq!(
            store.field("1", "name"),
            Some(FieldValue::Scalar(json!("Joe")))
        );
    }

    #[test]
    fn idempotent_write_creates_nothing_second_time() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();
        let payload = json!({"me": {"id": "1", "name": "Joe"}});

        let first = write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &me_query(),
            payload.clone(),
        )
        .unwrap();
        assert_eq!(first.created, vec!["1"]);

        let second = write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &me_query(),
            payload,
        )
        .unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.updated, vec!["1"]);
        assert_eq!(
            store.field("1", "name"),
            Some(FieldValue::Scalar(json!("Joe")))
        );
    }

    #[test]
    fn linked_records_are_normalized() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();
        let root = RootSelection::new(
            "me",
            "",
            vec![
                Selection::scalar("id"),
                Selection::linked(
                    "bestFriend",
                    vec![Selection::scalar("id"), Selection::scalar("name")],
                ),
            ],
        );

        write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &root,
            json!({"me": {"id": "1", "bestFriend": {"id": "2", "name": "Sarah"}}}),
        )
        .unwrap();

        assert_eq!(
            store.field("1", "bestFriend"),
            Some(FieldValue::Link("2".into()))
        );
        assert_eq!(
            store.field("2", "name"),
            Some(FieldValue::Scalar(json!("Sarah")))
        );
    }

    #[test]
    fn identity_less_object_is_embedded_inline() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();
        let root = RootSelection::new(
            "me",
            "",
            vec![
                Selection::scalar("id"),
                Selection::linked("address", vec![Selection::scalar("city")]),
            ],
        );

        write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &root,
            json!({"me": {"id": "1", "address": {"city": "Menlo Park"}}}),
        )
        .unwrap();

        // Readable only via the parent's pointer, never by identifier.
        match store.field("1", "address") {
            Some(FieldValue::Inline(rec)) => {
                assert_eq!(
                    rec.get("city"),
                    Some(&FieldValue::Scalar(json!("Menlo Park")))
                );
            }
            other => panic!("expected inline record, got {other:?}"),
        }
    }

    #[test]
    fn plural_elements_without_identity_get_stable_synthetic_ids() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();
        let root = RootSelection::new(
            "me",
            "",
            vec![
                Selection::scalar("id"),
                Selection::plural("phoneNumbers", vec![Selection::scalar("number")]),
            ],
        );
        let payload = json!({"me": {"id": "1", "phoneNumbers": [
            {"number": "555-0100"},
            {"number": "555-0101"}
        ]}});

        let first = write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &root,
            payload.clone(),
        )
        .unwrap();
        assert_eq!(first.created.len(), 3); // parent + two synthesized

        let second = write(&mut store, &mut tracker, TierKind::Base, &root, payload).unwrap();
        assert!(
            second.created.is_empty(),
            "synthetic ids must be stable across rewrites"
        );
    }

    #[test]
    fn shape_error_aborts_without_partial_write() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();
        let root = RootSelection::new(
            "me",
            "",
            vec![
                Selection::scalar("id"),
                Selection::scalar("name"),
                Selection::linked("bestFriend", vec![Selection::scalar("id")]),
            ],
        );

        // `bestFriend` is a scalar in the payload: shape error.
        let err = write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &root,
            json!({"me": {"id": "1", "name": "Joe", "bestFriend": "2"}}),
        )
        .unwrap_err();
        assert!(matches!(err, CacheError::ShapeMismatch { .. }));

        // Nothing was committed, not even the valid leading fields.
        assert_eq!(store.field("1", "name"), None);
        assert_eq!(store.root_record_id("me()"), None);
    }

    #[test]
    fn null_root_marks_record_deleted() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();

        write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &me_query(),
            json!({"me": {"id": "1", "name": "Joe"}}),
        )
        .unwrap();

        write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &me_query(),
            json!({"me": null}),
        )
        .unwrap();

        assert_eq!(
            store.record_state("1"),
            crate::store::RecordState::Nonexistent
        );
    }

    #[test]
    fn type_refinement_gated_on_type_name() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();
        let root = RootSelection::new(
            "node",
            "1",
            vec![
                Selection::scalar("id"),
                Selection::refinement("User", vec![Selection::scalar("name")]),
                Selection::refinement("Page", vec![Selection::scalar("likes")]),
            ],
        );

        write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &root,
            json!({"node": {
                "id": "1",
                "__typename": "User",
                "name": "Joe",
                "likes": 9000
            }}),
        )
        .unwrap();

        assert_eq!(
            store.field("1", "name"),
            Some(FieldValue::Scalar(json!("Joe")))
        );
        // The Page refinement must not leak fields onto a User record.
        assert_eq!(store.field("1", "likes"), None);
    }

    #[test]
    fn non_matching_refinement_never_rejects_the_payload() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();
        // "about" is a scalar on User but a linked object on Page.
        let root = RootSelection::new(
            "node",
            "1",
            vec![
                Selection::scalar("id"),
                Selection::refinement("User", vec![Selection::scalar("about")]),
                Selection::refinement(
                    "Page",
                    vec![Selection::linked("about", vec![Selection::scalar("body")])],
                ),
            ],
        );

        write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &root,
            json!({"node": {"id": "1", "__typename": "User", "about": "climber"}}),
        )
        .unwrap();

        assert_eq!(
            store.field("1", "about"),
            Some(FieldValue::Scalar(json!("climber")))
        );
    }

    #[test]
    fn fragments_are_tracked_per_record() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();
        let fragment = Selection::fragment("UserName", vec![Selection::scalar("name")]);
        let hash = crate::query::fragment_hash("UserName", &[Selection::scalar("name")]);
        let root = RootSelection::new("me", "", vec![Selection::scalar("id"), fragment]);

        write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &root,
            json!({"me": {"id": "1", "name": "Joe"}}),
        )
        .unwrap();

        assert!(tracker.is_tracked("1", hash));
        assert_eq!(
            store.field("1", "name"),
            Some(FieldValue::Scalar(json!("Joe")))
        );
    }

    #[test]
    fn deferred_fragments_write_but_stay_untracked() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();
        let children = vec![Selection::scalar("name")];
        let fragment = Selection::deferred_fragment("UserName", children.clone());
        let hash = crate::query::fragment_hash("UserName", &children);
        let root = RootSelection::new("me", "", vec![Selection::scalar("id"), fragment]);

        write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &root,
            json!({"me": {"id": "1", "name": "Joe"}}),
        )
        .unwrap();

        // Any fields already present are written, but the fragment stays
        // untracked until its follow-up payload lands.
        assert_eq!(
            store.field("1", "name"),
            Some(FieldValue::Scalar(json!("Joe")))
        );
        assert!(!tracker.is_tracked("1", hash));
    }

    #[test]
    fn connection_edges_land_in_range() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();
        let root = RootSelection::new(
            "me",
            "",
            vec![
                Selection::scalar("id"),
                Selection::connection(
                    "friends",
                    ConnectionArgs::first(2),
                    vec![Selection::linked(
                        "node",
                        vec![Selection::scalar("id"), Selection::scalar("name")],
                    )],
                ),
            ],
        );

        let change = write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &root,
            json!({"me": {"id": "1", "friends": {
                "edges": [
                    {"cursor": "c1", "node": {"id": "2", "name": "Sarah"}},
                    {"cursor": "c2", "node": {"id": "3", "name": "Dave"}}
                ],
                "pageInfo": {"hasNextPage": true, "hasPreviousPage": false}
            }}}),
        )
        .unwrap();

        let conn_id = match store.field("1", "friends") {
            Some(FieldValue::Link(id)) => id,
            other => panic!("expected connection link, got {other:?}"),
        };
        assert!(conn_id.starts_with(CLIENT_ID_PREFIX));

        let snap = store
            .range_metadata(&conn_id, &ConnectionArgs::first(2))
            .unwrap();
        assert_eq!(snap.edge_ids.len(), 2);
        assert!(snap.diff_args.is_none());

        // Node records were normalized normally.
        assert_eq!(
            store.field("3", "name"),
            Some(FieldValue::Scalar(json!("Dave")))
        );
        // Edge records carry their cursors and created entries.
        assert!(change.created.contains(&conn_id));
    }

    #[test]
    fn rewriting_a_connection_page_is_idempotent() {
        let mut store = RecordStore::new();
        let mut tracker = QueryTracker::new();
        let root = RootSelection::new(
            "me",
            "",
            vec![
                Selection::scalar("id"),
                Selection::connection(
                    "friends",
                    ConnectionArgs::first(1),
                    vec![Selection::linked("node", vec![Selection::scalar("id")])],
                ),
            ],
        );
        let payload = json!({"me": {"id": "1", "friends": {
            "edges": [{"cursor": "c1", "node": {"id": "2"}}],
            "pageInfo": {"hasNextPage": true, "hasPreviousPage": false}
        }}});

        write(
            &mut store,
            &mut tracker,
            TierKind::Base,
            &root,
            payload.clone(),
        )
        .unwrap();
        let second = write(&mut store, &mut tracker, TierKind::Base, &root, payload).unwrap();
        assert!(second.created.is_empty());
    }
}
