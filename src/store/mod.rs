//! Tiered record store.
//!
//! Three logical tiers hold the record universe: `cached` (disk-hydrated,
//! read-only seed), `base` (confirmed server data) and `queued` (optimistic
//! overlay). All reads compose tiers queued → base → cached: a tier's
//! version of a record shadows lower tiers whole-record, with field-level
//! fallthrough when its version lacks a field a lower tier has. Composition
//! falls through on a never-written field but stops at an explicit `Null`
//! (known-absent).
//!
//! All mutation goes through the normalizer/writer or the mutation queue's
//! rebuild path; no other component touches records directly.

pub mod disk;
pub mod range;
pub mod record;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::query::ConnectionArgs;
use crate::store::range::{Range, RangeSnapshot};
use crate::store::record::{FieldValue, Record, RecordId, CLIENT_ID_PREFIX};

// ── Tiers ──────────────────────────────────────────────────────────

/// Write-target tier selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierKind {
    Cached,
    Base,
    Queued,
}

/// Existence of a record identifier in the composed view.
///
/// `Unknown` (no tier has any entry) is distinct from `Nonexistent` (some
/// tier explicitly recorded the record as deleted): the diff engine fetches
/// the former and not the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Existent,
    Nonexistent,
    Unknown,
}

/// One tier: record slots plus a root-call index.
///
/// A `None` slot is an explicit deletion marker, the record-level analogue
/// of a tombstone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Tier {
    records: HashMap<RecordId, Option<Record>>,
    roots: HashMap<String, RecordId>,
}

// ── Record store ───────────────────────────────────────────────────

/// The tiered record arena plus root-call index.
pub struct RecordStore {
    cached: Tier,
    base: Tier,
    queued: Tier,
    client_id_counter: u64,
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            cached: Tier::default(),
            base: Tier::default(),
            queued: Tier::default(),
            client_id_counter: 0,
        }
    }

    fn tier(&self, kind: TierKind) -> &Tier {
        match kind {
            TierKind::Cached => &self.cached,
            TierKind::Base => &self.base,
            TierKind::Queued => &self.queued,
        }
    }

    fn tier_mut(&mut self, kind: TierKind) -> &mut Tier {
        match kind {
            TierKind::Cached => &mut self.cached,
            TierKind::Base => &mut self.base,
            TierKind::Queued => &mut self.queued,
        }
    }

    /// Tiers in composition (read precedence) order.
    fn composed(&self) -> [&Tier; 3] {
        [&self.queued, &self.base, &self.cached]
    }

    // ── Composed reads ─────────────────────────────────────────────

    pub fn record_state(&self, id: &str) -> RecordState {
        for tier in self.composed() {
            match tier.records.get(id) {
                Some(Some(_)) => return RecordState::Existent,
                Some(None) => return RecordState::Nonexistent,
                None => {}
            }
        }
        RecordState::Unknown
    }

    /// Composed field read. `None` means the field was never written in
    /// any tier; `Some(FieldValue::Null)` means some tier knows it absent.
    pub fn field(&self, id: &str, key: &str) -> Option<FieldValue> {
        for tier in self.composed() {
            match tier.records.get(id) {
                Some(Some(rec)) => {
                    if let Some(value) = rec.get(key) {
                        return Some(value.clone());
                    }
                    // Field not present in this tier's version: fall through.
                }
                // Deleted record shadows everything below it.
                Some(None) => return Some(FieldValue::Null),
                None => {}
            }
        }
        None
    }

    /// Composed type-name read.
    pub fn type_name(&self, id: &str) -> Option<String> {
        for tier in self.composed() {
            match tier.records.get(id) {
                Some(Some(rec)) => {
                    if let Some(name) = rec.type_name() {
                        return Some(name.to_string());
                    }
                }
                Some(None) => return None,
                None => {}
            }
        }
        None
    }

    /// Range metadata for a connection record: the satisfied edges,
    /// derived page info, and the calls still missing for `args`.
    pub fn range_metadata(&self, id: &str, args: &ConnectionArgs) -> Option<RangeSnapshot> {
        for tier in self.composed() {
            if let Some(Some(rec)) = tier.records.get(id) {
                if let Some(range) = rec.range() {
                    return Some(range.retrieve(args));
                }
            }
        }
        None
    }

    fn composed_range(&self, id: &str) -> Option<Range> {
        for tier in self.composed() {
            if let Some(Some(rec)) = tier.records.get(id) {
                if let Some(range) = rec.range() {
                    return Some(range.clone());
                }
            }
        }
        None
    }

    // ── Root-call index ────────────────────────────────────────────

    pub fn root_record_id(&self, root_call_key: &str) -> Option<RecordId> {
        for tier in self.composed() {
            if let Some(id) = tier.roots.get(root_call_key) {
                return Some(id.clone());
            }
        }
        None
    }

    pub fn put_root_record(&mut self, tier: TierKind, root_call_key: &str, id: &str) {
        self.tier_mut(tier)
            .roots
            .insert(root_call_key.to_string(), id.to_string());
    }

    /// All record identifiers directly reachable from root-call entries
    /// in any tier. These are GC roots.
    pub fn root_ids(&self) -> HashSet<RecordId> {
        self.composed()
            .iter()
            .flat_map(|t| t.roots.values().cloned())
            .collect()
    }

    // ── Tier writes ────────────────────────────────────────────────

    /// Whether the target tier has any entry (record or deletion marker)
    /// for this identifier.
    pub fn has_entry_in(&self, tier: TierKind, id: &str) -> bool {
        self.tier(tier).records.contains_key(id)
    }

    /// Record for mutation in the target tier, created (or revived from a
    /// deletion marker) as needed.
    pub fn record_mut(&mut self, tier: TierKind, id: &str) -> &mut Record {
        let slot = self
            .tier_mut(tier)
            .records
            .entry(id.to_string())
            .or_insert_with(|| Some(Record::new()));
        if slot.is_none() {
            *slot = Some(Record::new());
        }
        match slot {
            Some(rec) => rec,
            None => unreachable!("slot populated above"),
        }
    }

    pub fn put_field(&mut self, tier: TierKind, id: &str, key: &str, value: FieldValue) {
        self.record_mut(tier, id).set(key, value);
    }

    /// Record an observed type name, monotonic across the composed view:
    /// once any tier holds a concrete type for this identifier, a
    /// conflicting observation is ignored.
    pub fn set_type_name(&mut self, tier: TierKind, id: &str, type_name: &str) {
        if let Some(existing) = self.type_name(id) {
            if existing != type_name {
                tracing::warn!(
                    id = %id,
                    existing = %existing,
                    observed = %type_name,
                    "conflicting type name across tiers ignored"
                );
                return;
            }
        }
        self.record_mut(tier, id).observe_type_name(type_name);
    }

    /// Mark a record explicitly deleted in the target tier.
    pub fn delete_record(&mut self, tier: TierKind, id: &str) {
        self.tier_mut(tier).records.insert(id.to_string(), None);
    }

    /// Range of a connection record for mutation in the target tier.
    ///
    /// Copy-on-write: if the target tier's record has no range yet, the
    /// composed range from lower tiers is cloned in first, so optimistic
    /// edge writes never touch confirmed range state.
    pub fn range_for_write(&mut self, tier: TierKind, id: &str) -> &mut Range {
        let needs_seed = match self.tier(tier).records.get(id) {
            Some(Some(rec)) => rec.range().is_none(),
            _ => true,
        };
        let seed = if needs_seed { self.composed_range(id) } else { None };

        let rec = self.record_mut(tier, id);
        if let Some(range) = seed {
            if rec.range().is_none() {
                rec.set_range(range);
            }
        }
        rec.range_mut_or_default()
    }

    // ── Queued tier lifecycle ──────────────────────────────────────

    /// Record identifiers currently present in the queued tier.
    pub fn queued_record_ids(&self) -> Vec<RecordId> {
        self.queued.records.keys().cloned().collect()
    }

    /// Drop the entire optimistic overlay, returning the identifiers it
    /// held (their composed values may have changed).
    pub fn clear_queued(&mut self) -> Vec<RecordId> {
        let ids = self.queued_record_ids();
        self.queued = Tier::default();
        ids
    }

    // ── Eviction ───────────────────────────────────────────────────

    /// Remove records from the mutable tiers. The cached tier is a
    /// read-only seed and is left alone.
    pub fn evict(&mut self, ids: &HashSet<RecordId>) {
        for id in ids {
            self.base.records.remove(id);
            self.queued.records.remove(id);
        }
    }

    // ── Identifier links (for GC reachability) ─────────────────────

    /// Every record identifier referenced by any tier's version of this
    /// record: links, plural links, inline-record links, range edges.
    pub fn links_of(&self, id: &str) -> HashSet<RecordId> {
        let mut out = HashSet::new();
        for tier in self.composed() {
            if let Some(Some(rec)) = tier.records.get(id) {
                collect_record_links(rec, &mut out);
            }
        }
        out
    }

    // ── Client identifiers ─────────────────────────────────────────

    /// Fresh client-generated identifier.
    pub fn next_client_id(&mut self) -> RecordId {
        self.client_id_counter += 1;
        format!("{CLIENT_ID_PREFIX}{}", self.client_id_counter)
    }

    // ── Snapshot hydration ─────────────────────────────────────────

    /// Seed the cached tier from a disk snapshot.
    pub fn hydrate_cached(&mut self, snapshot: disk::CacheSnapshot) {
        for (id, rec) in snapshot.records {
            self.cached.records.insert(id, Some(rec));
        }
        for (key, id) in snapshot.roots {
            self.cached.roots.insert(key, id);
        }
    }

    /// Snapshot of the confirmed (base) tier for persistence.
    pub fn export_base(&self) -> disk::CacheSnapshot {
        let records = self
            .base
            .records
            .iter()
            .filter_map(|(id, slot)| slot.as_ref().map(|rec| (id.clone(), rec.clone())))
            .collect();
        disk::CacheSnapshot::new(records, self.base.roots.clone())
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_record_links(rec: &Record, out: &mut HashSet<RecordId>) {
    for (_, value) in rec.field_values() {
        match value {
            FieldValue::Link(id) => {
                out.insert(id.clone());
            }
            FieldValue::Links(ids) => {
                out.extend(ids.iter().cloned());
            }
            FieldValue::Inline(inner) => collect_record_links(inner, out),
            FieldValue::Null | FieldValue::Scalar(_) => {}
        }
    }
    if let Some(range) = rec.range() {
        out.extend(range.edge_ids().into_iter().cloned());
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scalar(v: serde_json::Value) -> FieldValue {
        FieldValue::Scalar(v)
    }

    #[test]
    fn tier_precedence_queued_over_base_over_cached() {
        let mut store = RecordStore::new();
        store.put_field(TierKind::Cached, "1", "name", scalar(json!("cached")));
        store.put_field(TierKind::Base, "1", "name", scalar(json!("base")));
        store.put_field(TierKind::Queued, "1", "name", scalar(json!("queued")));

        assert_eq!(store.field("1", "name"), Some(scalar(json!("queued"))));

        store.clear_queued();
        assert_eq!(store.field("1", "name"), Some(scalar(json!("base"))));
    }

    #[test]
    fn field_falls_through_but_null_stops() {
        let mut store = RecordStore::new();
        store.put_field(TierKind::Base, "1", "name", scalar(json!("Joe")));
        store.put_field(TierKind::Base, "1", "address", scalar(json!("Menlo Park")));

        // Queued has the record but not the `address` field: fallthrough.
        store.put_field(TierKind::Queued, "1", "name", scalar(json!("Joseph")));
        assert_eq!(store.field("1", "name"), Some(scalar(json!("Joseph"))));
        assert_eq!(
            store.field("1", "address"),
            Some(scalar(json!("Menlo Park")))
        );

        // An explicit null in the queued tier stops composition.
        store.put_field(TierKind::Queued, "1", "address", FieldValue::Null);
        assert_eq!(store.field("1", "address"), Some(FieldValue::Null));

        // Never-written fields are undefined, not null.
        assert_eq!(store.field("1", "lastName"), None);
    }

    #[test]
    fn record_states_distinguish_unknown_from_nonexistent() {
        let mut store = RecordStore::new();
        assert_eq!(store.record_state("1"), RecordState::Unknown);

        store.put_field(TierKind::Base, "1", "name", scalar(json!("Joe")));
        assert_eq!(store.record_state("1"), RecordState::Existent);

        store.delete_record(TierKind::Queued, "1");
        assert_eq!(store.record_state("1"), RecordState::Nonexistent);

        // Clearing the overlay revives the confirmed record.
        store.clear_queued();
        assert_eq!(store.record_state("1"), RecordState::Existent);
    }

    #[test]
    fn deleted_record_reads_as_known_absent() {
        let mut store = RecordStore::new();
        store.put_field(TierKind::Base, "1", "name", scalar(json!("Joe")));
        store.delete_record(TierKind::Queued, "1");

        assert_eq!(store.field("1", "name"), Some(FieldValue::Null));
    }

    #[test]
    fn type_name_is_monotonic_across_tiers() {
        let mut store = RecordStore::new();
        store.set_type_name(TierKind::Base, "1", "User");
        store.set_type_name(TierKind::Queued, "1", "Actor");

        assert_eq!(store.type_name("1"), Some("User".to_string()));
    }

    #[test]
    fn root_index_composes_and_rolls_back() {
        let mut store = RecordStore::new();
        store.put_root_record(TierKind::Base, "viewer()", "1");
        assert_eq!(store.root_record_id("viewer()"), Some("1".to_string()));

        store.put_root_record(TierKind::Queued, "viewer()", "client:1");
        assert_eq!(
            store.root_record_id("viewer()"),
            Some("client:1".to_string())
        );

        store.clear_queued();
        assert_eq!(store.root_record_id("viewer()"), Some("1".to_string()));
    }

    #[test]
    fn range_for_write_copies_composed_range() {
        use crate::store::range::{EdgeEntry, PageInfo};

        let mut store = RecordStore::new();
        let range = store.range_for_write(TierKind::Base, "conn");
        range
            .add_items(
                &ConnectionArgs::first(1),
                &[EdgeEntry {
                    edge_id: "e1".into(),
                    cursor: Some("c1".into()),
                }],
                &PageInfo::default(),
            )
            .unwrap();

        // An optimistic edge write sees the confirmed edges...
        let range = store.range_for_write(TierKind::Queued, "conn");
        range
            .add_items(
                &ConnectionArgs::first_after(1, "c1"),
                &[EdgeEntry {
                    edge_id: "e2".into(),
                    cursor: Some("c2".into()),
                }],
                &PageInfo::default(),
            )
            .unwrap();

        let snap = store
            .range_metadata("conn", &ConnectionArgs::first(2))
            .unwrap();
        assert_eq!(snap.edge_ids, vec!["e1", "e2"]);

        // ...and clearing the overlay restores the confirmed range.
        store.clear_queued();
        let snap = store
            .range_metadata("conn", &ConnectionArgs::first(2))
            .unwrap();
        assert_eq!(snap.edge_ids, vec!["e1"]);
    }

    #[test]
    fn evict_leaves_cached_seed() {
        let mut store = RecordStore::new();
        store.put_field(TierKind::Cached, "1", "name", scalar(json!("seed")));
        store.put_field(TierKind::Base, "1", "name", scalar(json!("fresh")));

        let ids: HashSet<RecordId> = ["1".to_string()].into_iter().collect();
        store.evict(&ids);

        assert_eq!(store.field("1", "name"), Some(scalar(json!("seed"))));
    }

    #[test]
    fn links_of_walks_all_reference_kinds() {
        let mut store = RecordStore::new();
        store.put_field(TierKind::Base, "1", "friend", FieldValue::Link("2".into()));
        store.put_field(
            TierKind::Base,
            "1",
            "pets",
            FieldValue::Links(vec!["3".into(), "4".into()]),
        );

        let mut inline = Record::new();
        inline.set("author", FieldValue::Link("5".into()));
        store.put_field(TierKind::Base, "1", "address", FieldValue::Inline(Box::new(inline)));

        let links = store.links_of("1");
        for id in ["2", "3", "4", "5"] {
            assert!(links.contains(id), "missing link {id}");
        }
    }

    #[test]
    fn client_ids_are_unique_and_prefixed() {
        let mut store = RecordStore::new();
        let a = store.next_client_id();
        let b = store.next_client_id();
        assert_ne!(a, b);
        assert!(a.starts_with(CLIENT_ID_PREFIX));
    }
}
