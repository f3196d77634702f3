//! Diff engine.
//!
//! Compares a selection tree against the composed store view and produces
//! the minimal follow-up query for what is actually missing. Satisfied
//! fields are pruned; unknown records are fetched whole; records known
//! deleted are not fetched at all. Connections request only the unfetched
//! remainder of their window.

use crate::query::{RootSelection, Selection, SelectionKind};
use crate::store::record::{FieldValue, Record};
use crate::store::{RecordState, RecordStore};
use crate::tracker::QueryTracker;

/// Minimal follow-up for a root call. `None` when the cache fully
/// satisfies the query.
pub fn diff_root(
    store: &RecordStore,
    tracker: &QueryTracker,
    root: &RootSelection,
) -> Option<RootSelection> {
    let Some(id) = store.root_record_id(&root.root_call_key()) else {
        return Some(root.clone());
    };
    let missing = diff_record(store, tracker, &id, &root.selections);
    if missing.is_empty() {
        tracing::debug!(root = %root.root_call_key(), "query fully satisfied from cache");
        None
    } else {
        tracing::debug!(
            root = %root.root_call_key(),
            fields = missing.len(),
            "follow-up fetch required"
        );
        Some(RootSelection::new(
            root.field_name.clone(),
            root.arg_signature.clone(),
            missing,
        ))
    }
}

/// Missing subset of a selection tree for a known record identifier.
pub fn diff_record(
    store: &RecordStore,
    tracker: &QueryTracker,
    id: &str,
    selections: &[Selection],
) -> Vec<Selection> {
    match store.record_state(id) {
        // Never heard of it: everything is missing.
        RecordState::Unknown => return selections.to_vec(),
        // Known deleted: there is nothing to fetch.
        RecordState::Nonexistent => return Vec::new(),
        RecordState::Existent => {}
    }

    let mut missing = Vec::new();
    for sel in selections {
        diff_selection(store, tracker, id, sel, &mut missing);
    }
    missing
}

fn diff_selection(
    store: &RecordStore,
    tracker: &QueryTracker,
    id: &str,
    sel: &Selection,
    missing: &mut Vec<Selection>,
) {
    match &sel.kind {
        SelectionKind::Scalar => {
            if store.field(id, &sel.storage_key).is_none() {
                missing.push(sel.clone());
            }
        }
        SelectionKind::LinkedSingular(children) => {
            match store.field(id, &sel.storage_key) {
                None => missing.push(sel.clone()),
                // Known-null link: the children cannot be missing.
                Some(FieldValue::Null) => {}
                Some(FieldValue::Link(child_id)) => {
                    let child_missing = diff_record(store, tracker, &child_id, children);
                    if !child_missing.is_empty() {
                        missing.push(rewrap(sel, SelectionKind::LinkedSingular(child_missing)));
                    }
                }
                Some(FieldValue::Inline(rec)) => {
                    let child_missing = diff_inline(store, tracker, &rec, children);
                    if !child_missing.is_empty() {
                        missing.push(rewrap(sel, SelectionKind::LinkedSingular(child_missing)));
                    }
                }
                Some(_) => missing.push(sel.clone()),
            }
        }
        SelectionKind::LinkedPlural(children) => {
            match store.field(id, &sel.storage_key) {
                None => missing.push(sel.clone()),
                Some(FieldValue::Null) => {}
                Some(FieldValue::Links(ids)) => {
                    // Union of per-element gaps; one fetch covers them all.
                    let mut union: Vec<Selection> = Vec::new();
                    for child_id in &ids {
                        for child in diff_record(store, tracker, child_id, children) {
                            if !union.contains(&child) {
                                union.push(child);
                            }
                        }
                    }
                    if !union.is_empty() {
                        missing.push(rewrap(sel, SelectionKind::LinkedPlural(union)));
                    }
                }
                Some(_) => missing.push(sel.clone()),
            }
        }
        SelectionKind::Connection {
            args,
            edge_selections,
        } => {
            let conn_id = match store.field(id, &sel.storage_key) {
                None => {
                    missing.push(sel.clone());
                    return;
                }
                Some(FieldValue::Null) => return,
                Some(FieldValue::Link(conn_id)) => conn_id,
                Some(_) => {
                    missing.push(sel.clone());
                    return;
                }
            };
            let Some(snap) = store.range_metadata(&conn_id, args) else {
                missing.push(sel.clone());
                return;
            };

            // Unfetched remainder of the window, with the full edge shape.
            if let Some(diff_args) = snap.diff_args {
                missing.push(rewrap(
                    sel,
                    SelectionKind::Connection {
                        args: diff_args,
                        edge_selections: edge_selections.clone(),
                    },
                ));
            }

            // Already-fetched edges missing some of the edge shape.
            let mut union: Vec<Selection> = Vec::new();
            for edge_id in &snap.edge_ids {
                for child in diff_record(store, tracker, edge_id, edge_selections) {
                    if !union.contains(&child) {
                        union.push(child);
                    }
                }
            }
            if !union.is_empty() {
                missing.push(rewrap(
                    sel,
                    SelectionKind::Connection {
                        args: args.clone(),
                        edge_selections: union,
                    },
                ));
            }
        }
        SelectionKind::TypeRefinement {
            type_condition,
            selections,
        } => match store.type_name(id) {
            Some(t) if t == *type_condition => {
                let inner = diff_record(store, tracker, id, selections);
                if !inner.is_empty() {
                    missing.push(rewrap(
                        sel,
                        SelectionKind::TypeRefinement {
                            type_condition: type_condition.clone(),
                            selections: inner,
                        },
                    ));
                }
            }
            Some(_) => {
                // Concrete type known and different: nothing to fetch.
            }
            None => {
                // Type unknown, so the refinement may apply. Conservative
                // must-fetch of the whole refinement.
                missing.push(sel.clone());
            }
        },
        SelectionKind::FragmentReference {
            fragment_name,
            composite_hash,
            deferred,
            selections,
        } => {
            // A tracked fragment is assumed satisfied without descending.
            // This over-trusts the tracker when a later write deleted a
            // field, and is accepted as an approximation.
            if tracker.is_tracked(id, *composite_hash) {
                return;
            }
            let inner = diff_record(store, tracker, id, selections);
            if !inner.is_empty() {
                missing.push(rewrap(
                    sel,
                    SelectionKind::FragmentReference {
                        fragment_name: fragment_name.clone(),
                        composite_hash: *composite_hash,
                        deferred: *deferred,
                        selections: inner,
                    },
                ));
            }
        }
    }
}

/// Diff against an identity-less inline record.
fn diff_inline(
    store: &RecordStore,
    tracker: &QueryTracker,
    rec: &Record,
    selections: &[Selection],
) -> Vec<Selection> {
    let mut missing = Vec::new();
    for sel in selections {
        match &sel.kind {
            SelectionKind::Scalar => {
                if rec.get(&sel.storage_key).is_none() {
                    missing.push(sel.clone());
                }
            }
            SelectionKind::LinkedSingular(children) => match rec.get(&sel.storage_key) {
                None => missing.push(sel.clone()),
                Some(FieldValue::Null) => {}
                Some(FieldValue::Link(child_id)) => {
                    let inner = diff_record(store, tracker, child_id, children);
                    if !inner.is_empty() {
                        missing.push(rewrap(sel, SelectionKind::LinkedSingular(inner)));
                    }
                }
                Some(FieldValue::Inline(inner_rec)) => {
                    let inner = diff_inline(store, tracker, inner_rec, children);
                    if !inner.is_empty() {
                        missing.push(rewrap(sel, SelectionKind::LinkedSingular(inner)));
                    }
                }
                Some(_) => missing.push(sel.clone()),
            },
            SelectionKind::LinkedPlural(children) => match rec.get(&sel.storage_key) {
                Some(FieldValue::Links(ids)) => {
                    let mut union: Vec<Selection> = Vec::new();
                    for child_id in ids {
                        for child in diff_record(store, tracker, child_id, children) {
                            if !union.contains(&child) {
                                union.push(child);
                            }
                        }
                    }
                    if !union.is_empty() {
                        missing.push(rewrap(sel, SelectionKind::LinkedPlural(union)));
                    }
                }
                Some(FieldValue::Null) => {}
                _ => missing.push(sel.clone()),
            },
            // Inline records carry no identity to refetch against; fetch
            // the rest of the shape whole if any of it is absent.
            _ => missing.push(sel.clone()),
        }
    }
    missing
}

fn rewrap(sel: &Selection, kind: SelectionKind) -> Selection {
    Selection {
        name: sel.name.clone(),
        alias: sel.alias.clone(),
        storage_key: sel.storage_key.clone(),
        kind,
    }
}

// ── Tests ──────────────────────────────────────────────────────────
