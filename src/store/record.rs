//! Normalized records.
//!
//! A record is the field map for one entity, keyed by a stable record
//! identifier. Cross-record links are stored as identifiers, never as direct
//! references, so the record universe is an arena and garbage collection is
//! a reachability scan over an index.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::range::Range;

/// Stable key identifying one record across tiers: a server node id, or a
/// client-synthesized id for records with no server identity.
pub type RecordId = String;

/// Argument-qualified field storage key.
pub type StorageKey = String;

/// Prefix of client-generated record identifiers.
pub const CLIENT_ID_PREFIX: &str = "client:";

/// Whether an identifier was synthesized on the client.
pub fn is_client_id(id: &str) -> bool {
    id.starts_with(CLIENT_ID_PREFIX)
}

// ── Field values ───────────────────────────────────────────────────

/// One stored field value.
///
/// `Null` is "known-absent" and is distinct from a field that was never
/// written: tier composition stops at `Null` but falls through on a missing
/// entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Known-absent.
    Null,
    /// Scalar, or array of scalars, stored as received (post coercion).
    Scalar(serde_json::Value),
    /// Reference to a single linked record.
    Link(RecordId),
    /// References to a list of linked records.
    Links(Vec<RecordId>),
    /// Identity-less embedded object, readable only through this pointer,
    /// never via identifier lookup.
    Inline(Box<Record>),
}

// ── Record ─────────────────────────────────────────────────────────

/// Normalized field map for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    fields: HashMap<StorageKey, FieldValue>,
    /// Implicit type-name field. Monotonic: once a concrete type is
    /// recorded it is never replaced.
    type_name: Option<String>,
    /// Range metadata, present on connection records only.
    range: Option<Range>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: impl Into<StorageKey>, value: FieldValue) {
        self.fields.insert(key.into(), value);
    }

    pub fn field_values(&self) -> impl Iterator<Item = (&StorageKey, &FieldValue)> {
        self.fields.iter()
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    /// Record an observed type name. The first concrete type wins; a
    /// conflicting later observation is logged and ignored.
    pub fn observe_type_name(&mut self, type_name: &str) {
        match &self.type_name {
            None => self.type_name = Some(type_name.to_string()),
            Some(existing) if existing == type_name => {}
            Some(existing) => {
                tracing::warn!(
                    existing = %existing,
                    observed = %type_name,
                    "conflicting type name observation ignored"
                );
            }
        }
    }

    pub fn range(&self) -> Option<&Range> {
        self.range.as_ref()
    }

    pub fn set_range(&mut self, range: Range) {
        self.range = Some(range);
    }

    /// Range for mutation, created empty if this record has none yet.
    pub fn range_mut_or_default(&mut self) -> &mut Range {
        self.range.get_or_insert_with(Range::new)
    }
}
