//! Cursor-addressable ranges for paginated connections.
//!
//! A `Range` tracks which edges of one connection have been fetched and in
//! what order, as zero or more `Segment`s. A segment is an ordered run of
//! (edge identifier, cursor, deleted) entries with two parallel position
//! indices. Deleted entries are retained as tombstones rather than
//! compacted, so position-based concatenation of two segments stays valid;
//! length (including deleted) and count (excluding deleted) are tracked
//! separately.
//!
//! Positions are monotonically increasing insertion slots: the position of
//! `entries[i]` is `base_position + i`, and front insertion decrements
//! `base_position` instead of shifting anything.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::query::ConnectionArgs;
use crate::store::record::RecordId;

// ── Page info ──────────────────────────────────────────────────────

/// Connection page metadata, either as received from a payload or as
/// derived for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

impl Default for PageInfo {
    /// Absent page info must not mark the connection complete: assume more
    /// pages may exist in both directions.
    fn default() -> Self {
        Self {
            has_next_page: true,
            has_previous_page: true,
        }
    }
}

/// One incoming edge of a page write.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeEntry {
    pub edge_id: RecordId,
    pub cursor: Option<String>,
}

/// Result of reading a cursor window out of a range.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RangeSnapshot {
    /// Satisfied edge identifiers, in connection order.
    pub edge_ids: Vec<RecordId>,
    /// Cursors aligned with `edge_ids`.
    pub cursors: Vec<Option<String>>,
    /// Derived page info for the requested window.
    pub page_info: PageInfo,
    /// Minimal follow-up request for the unsatisfied remainder, if any.
    pub diff_args: Option<ConnectionArgs>,
}

// ── Segment ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SegmentEntry {
    edge_id: RecordId,
    cursor: Option<String>,
    deleted: bool,
}

/// Ordered, cursor-indexed run of contiguously-fetched edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    entries: VecDeque<SegmentEntry>,
    /// Position of `entries[0]`.
    base_position: i64,
    index_by_edge: HashMap<RecordId, i64>,
    index_by_cursor: HashMap<String, i64>,
    live_count: usize,
}

impl Segment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length including tombstoned entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Live entry count, excluding tombstones.
    pub fn count(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_edge(&self, edge_id: &str) -> bool {
        self.index_by_edge.contains_key(edge_id)
    }

    pub fn contains_cursor(&self, cursor: &str) -> bool {
        self.index_by_cursor.contains_key(cursor)
    }

    fn iter_live(&self) -> impl Iterator<Item = &SegmentEntry> {
        self.entries.iter().filter(|e| !e.deleted)
    }

    pub fn first_edge_id(&self) -> Option<&str> {
        self.iter_live().next().map(|e| e.edge_id.as_str())
    }

    pub fn last_edge_id(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| !e.deleted)
            .map(|e| e.edge_id.as_str())
    }

    pub fn first_cursor(&self) -> Option<&str> {
        self.iter_live().find_map(|e| e.cursor.as_deref())
    }

    pub fn last_cursor(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .filter(|e| !e.deleted)
            .find_map(|e| e.cursor.as_deref())
    }

    /// Append one edge at the back. Rejects identifiers already present.
    pub fn push_back(&mut self, edge_id: RecordId, cursor: Option<String>) -> Result<()> {
        if self.contains_edge(&edge_id) {
            return Err(CacheError::DuplicateEdge(edge_id));
        }
        let position = self.base_position + self.entries.len() as i64;
        self.index_edge(&edge_id, cursor.as_deref(), position);
        self.entries.push_back(SegmentEntry {
            edge_id,
            cursor,
            deleted: false,
        });
        self.live_count += 1;
        Ok(())
    }

    /// Prepend one edge at the front. Rejects identifiers already present.
    pub fn push_front(&mut self, edge_id: RecordId, cursor: Option<String>) -> Result<()> {
        if self.contains_edge(&edge_id) {
            return Err(CacheError::DuplicateEdge(edge_id));
        }
        let position = self.base_position - 1;
        self.index_edge(&edge_id, cursor.as_deref(), position);
        self.entries.push_front(SegmentEntry {
            edge_id,
            cursor,
            deleted: false,
        });
        self.base_position = position;
        self.live_count += 1;
        Ok(())
    }

    fn index_edge(&mut self, edge_id: &str, cursor: Option<&str>, position: i64) {
        self.index_by_edge.insert(edge_id.to_string(), position);
        if let Some(cursor) = cursor {
            self.index_by_cursor.insert(cursor.to_string(), position);
        }
    }

    /// Replace the cursor recorded for an already-present edge (a refetch
    /// may re-cursor an edge).
    pub fn update_cursor(&mut self, edge_id: &str, cursor: &str) {
        let Some(&position) = self.index_by_edge.get(edge_id) else {
            return;
        };
        let idx = (position - self.base_position) as usize;
        if let Some(entry) = self.entries.get_mut(idx) {
            if let Some(old) = entry.cursor.take() {
                if self.index_by_cursor.get(&old) == Some(&position) {
                    self.index_by_cursor.remove(&old);
                }
            }
            entry.cursor = Some(cursor.to_string());
            self.index_by_cursor.insert(cursor.to_string(), position);
        }
    }

    /// Tombstone an edge. The entry and both index slots are retained so
    /// positions stay valid for concatenation. Returns whether the edge
    /// was live.
    pub fn mark_deleted(&mut self, edge_id: &str) -> bool {
        let Some(&position) = self.index_by_edge.get(edge_id) else {
            return false;
        };
        let idx = (position - self.base_position) as usize;
        match self.entries.get_mut(idx) {
            Some(entry) if !entry.deleted => {
                entry.deleted = true;
                self.live_count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Live edges strictly after `cursor` (from the start when `None`),
    /// up to `limit`. The second result reports whether the slice ran to
    /// the segment's end.
    pub fn edges_after(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> (Vec<(RecordId, Option<String>)>, bool) {
        let start_idx = match cursor {
            None => 0,
            Some(c) => match self.index_by_cursor.get(c) {
                Some(&position) => (position - self.base_position) as usize + 1,
                None => return (Vec::new(), false),
            },
        };

        let mut out = Vec::new();
        let mut reached_end = true;
        for entry in self.entries.iter().skip(start_idx) {
            if entry.deleted {
                continue;
            }
            if out.len() == limit {
                reached_end = false;
                break;
            }
            out.push((entry.edge_id.clone(), entry.cursor.clone()));
        }
        (out, reached_end)
    }

    /// Live edges strictly before `cursor` (from the end when `None`), up
    /// to `limit`, returned in connection order. The second result reports
    /// whether the slice ran to the segment's start.
    pub fn edges_before(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> (Vec<(RecordId, Option<String>)>, bool) {
        let end_idx = match cursor {
            None => self.entries.len(),
            Some(c) => match self.index_by_cursor.get(c) {
                Some(&position) => (position - self.base_position) as usize,
                None => return (Vec::new(), false),
            },
        };

        let mut out = VecDeque::new();
        let mut reached_start = true;
        for entry in self.entries.iter().take(end_idx).rev() {
            if entry.deleted {
                continue;
            }
            if out.len() == limit {
                reached_start = false;
                break;
            }
            out.push_front((entry.edge_id.clone(), entry.cursor.clone()));
        }
        (out.into(), reached_start)
    }

    /// Concatenate `other` onto the back of this segment.
    ///
    /// Rejects the operation if any edge identifier is shared; on rejection
    /// this segment's entries, indices, length and count are restored to
    /// their pre-attempt state, and `other` is never mutated.
    pub fn concat(&mut self, other: &Segment) -> Result<()> {
        let added_from = self.entries.len();

        for entry in &other.entries {
            if self.contains_edge(&entry.edge_id) {
                let duplicate = entry.edge_id.clone();
                self.rollback_concat(added_from);
                return Err(CacheError::DuplicateEdge(duplicate));
            }
            let position = self.base_position + self.entries.len() as i64;
            self.index_by_edge.insert(entry.edge_id.clone(), position);
            if let Some(cursor) = &entry.cursor {
                // Never clobber an existing cursor slot; a pathological
                // duplicate cursor loses its index entry, not the data.
                self.index_by_cursor.entry(cursor.clone()).or_insert(position);
            }
            if !entry.deleted {
                self.live_count += 1;
            }
            self.entries.push_back(entry.clone());
        }
        Ok(())
    }

    fn rollback_concat(&mut self, added_from: usize) {
        while self.entries.len() > added_from {
            let Some(entry) = self.entries.pop_back() else {
                break;
            };
            let position = self.base_position + self.entries.len() as i64;
            if self.index_by_edge.get(&entry.edge_id) == Some(&position) {
                self.index_by_edge.remove(&entry.edge_id);
            }
            if let Some(cursor) = &entry.cursor {
                if self.index_by_cursor.get(cursor) == Some(&position) {
                    self.index_by_cursor.remove(cursor);
                }
            }
            if !entry.deleted {
                self.live_count -= 1;
            }
        }
    }

}

// ── Range ──────────────────────────────────────────────────────────

/// Ordered list of segments tracking the fetched portions of a connection.
///
/// `segments[0]` is anchored at the connection start once a fetch without
/// an `after` cursor lands (`has_first`); the end is known once a page
/// reporting `hasNextPage: false` lands on the trailing segment
/// (`has_last`). Gaps between segments are unfetched, never assumed empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Range {
    segments: Vec<Segment>,
    has_first: bool,
    has_last: bool,
}

impl Range {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.is_empty())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn first_cursor(&self) -> Option<&str> {
        self.segments.first().and_then(|s| s.first_cursor())
    }

    pub fn last_cursor(&self) -> Option<&str> {
        self.segments.last().and_then(|s| s.last_cursor())
    }

    /// All edge identifiers, tombstoned included (reachability scans must
    /// see every referenced record).
    pub fn edge_ids(&self) -> Vec<&RecordId> {
        self.segments
            .iter()
            .flat_map(|s| s.entries.iter().map(|e| &e.edge_id))
            .collect()
    }

    /// Live edge identifiers across all segments, in order.
    pub fn live_edge_ids(&self) -> Vec<RecordId> {
        self.segments
            .iter()
            .flat_map(|s| s.iter_live().map(|e| e.edge_id.clone()))
            .collect()
    }

    fn segment_of_cursor(&self, cursor: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.contains_cursor(cursor))
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Write one fetched page of edges into the range.
    ///
    /// Resolves (or creates) the segment covering the requested cursor
    /// window, inserts the incoming edges preserving cursor order, and
    /// merges adjacent segments when the page bridges the gap between
    /// them. Fails atomically on a duplicate edge identifier.
    pub fn add_items(
        &mut self,
        args: &ConnectionArgs,
        edges: &[EdgeEntry],
        page_info: &PageInfo,
    ) -> Result<()> {
        if args.is_forward() {
            let seg = match &args.after {
                None => {
                    self.has_first = true;
                    self.ensure_segment_front()
                }
                Some(cursor) => match self.segment_of_cursor(cursor) {
                    Some(i) => i,
                    None => {
                        // The server answered a cursor no segment knows
                        // (e.g. hydrated from a stale snapshot). The data
                        // is real; park it in a detached trailing segment.
                        tracing::warn!(cursor = %cursor, "page written after unknown cursor");
                        self.segments.push(Segment::new());
                        self.segments.len() - 1
                    }
                },
            };
            let seg = self.append_into(seg, edges)?;
            if !page_info.has_next_page && seg == self.segments.len() - 1 {
                self.has_last = true;
            }
        } else {
            let seg = match &args.before {
                None => {
                    self.has_last = true;
                    self.ensure_segment_back()
                }
                Some(cursor) => match self.segment_of_cursor(cursor) {
                    Some(i) => i,
                    None => {
                        tracing::warn!(cursor = %cursor, "page written before unknown cursor");
                        self.segments.insert(0, Segment::new());
                        0
                    }
                },
            };
            let seg = self.prepend_into(seg, edges)?;
            if !page_info.has_previous_page && seg == 0 {
                self.has_first = true;
            }
        }
        Ok(())
    }

    fn ensure_segment_front(&mut self) -> usize {
        if self.segments.is_empty() {
            self.segments.push(Segment::new());
        }
        0
    }

    fn ensure_segment_back(&mut self) -> usize {
        if self.segments.is_empty() {
            self.segments.push(Segment::new());
        }
        self.segments.len() - 1
    }

    /// Append edges onto segment `idx`, bridging into the following
    /// segment when an incoming edge matches its head. Returns the index
    /// of the segment that received the page (stable under merges).
    fn append_into(&mut self, idx: usize, edges: &[EdgeEntry]) -> Result<usize> {
        for edge in edges {
            let bridges = self
                .segments
                .get(idx + 1)
                .map(|next| next.first_edge_id() == Some(edge.edge_id.as_str()))
                .unwrap_or(false);
            if bridges {
                let next = self.segments.remove(idx + 1);
                if let Err(err) = self.segments[idx].concat(&next) {
                    self.segments.insert(idx + 1, next);
                    return Err(err);
                }
            }

            let seg = &mut self.segments[idx];
            if seg.contains_edge(&edge.edge_id) {
                if let Some(cursor) = &edge.cursor {
                    seg.update_cursor(&edge.edge_id, cursor);
                }
            } else {
                seg.push_back(edge.edge_id.clone(), edge.cursor.clone())?;
            }
        }
        Ok(idx)
    }

    /// Prepend edges onto segment `idx` (incoming order preserved),
    /// bridging into the preceding segment when an incoming edge matches
    /// its tail. Returns the index of the receiving segment.
    fn prepend_into(&mut self, mut idx: usize, edges: &[EdgeEntry]) -> Result<usize> {
        for edge in edges.iter().rev() {
            let bridges = idx > 0
                && self.segments[idx - 1].last_edge_id() == Some(edge.edge_id.as_str());
            if bridges {
                let mut prev = self.segments.remove(idx - 1);
                idx -= 1;
                match prev.concat(&self.segments[idx]) {
                    Ok(()) => self.segments[idx] = prev,
                    Err(err) => {
                        self.segments.insert(idx, prev);
                        return Err(err);
                    }
                }
            }

            let seg = &mut self.segments[idx];
            if seg.contains_edge(&edge.edge_id) {
                if let Some(cursor) = &edge.cursor {
                    seg.update_cursor(&edge.edge_id, cursor);
                }
            } else {
                seg.push_front(edge.edge_id.clone(), edge.cursor.clone())?;
            }
        }
        Ok(idx)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Read the edges satisfying a cursor window, plus the minimal
    /// follow-up request for whatever is missing.
    ///
    /// The satisfied prefix comes from the first segment (the suffix from
    /// the last segment for backward windows); the follow-up starts after
    /// the last known cursor and never re-requests fetched edges.
    pub fn retrieve(&self, args: &ConnectionArgs) -> RangeSnapshot {
        if args.is_forward() {
            self.retrieve_forward(args)
        } else {
            self.retrieve_backward(args)
        }
    }

    fn retrieve_forward(&self, args: &ConnectionArgs) -> RangeSnapshot {
        let requested = args.first.unwrap_or(usize::MAX);

        let seg_idx = match &args.after {
            None => {
                if !self.has_first || self.segments.is_empty() {
                    return RangeSnapshot {
                        page_info: PageInfo {
                            has_next_page: true,
                            has_previous_page: false,
                        },
                        diff_args: Some(args.clone()),
                        ..RangeSnapshot::default()
                    };
                }
                0
            }
            Some(cursor) => match self.segment_of_cursor(cursor) {
                Some(i) => i,
                None => {
                    return RangeSnapshot {
                        diff_args: Some(args.clone()),
                        ..RangeSnapshot::default()
                    }
                }
            },
        };

        let seg = &self.segments[seg_idx];
        let (collected, reached_end) = seg.edges_after(args.after.as_deref(), requested);
        let remaining = requested.saturating_sub(collected.len());
        let terminal = seg_idx == self.segments.len() - 1;

        // The connection is exhausted only when the slice ran to the end of
        // the trailing segment and that end is known to be the range end.
        let at_known_end = reached_end && terminal && self.has_last;

        let diff_args = if remaining == 0 || at_known_end {
            None
        } else {
            let resume_cursor = collected
                .iter()
                .rev()
                .find_map(|(_, c)| c.clone())
                .or_else(|| args.after.clone());
            match resume_cursor {
                Some(cursor) => Some(ConnectionArgs::first_after(remaining, cursor)),
                // No cursor to resume from; re-request the window.
                None => Some(args.clone()),
            }
        };

        let (edge_ids, cursors) = collected.into_iter().unzip();
        RangeSnapshot {
            edge_ids,
            cursors,
            page_info: PageInfo {
                has_next_page: !at_known_end,
                has_previous_page: args.after.is_some(),
            },
            diff_args,
        }
    }

    fn retrieve_backward(&self, args: &ConnectionArgs) -> RangeSnapshot {
        let requested = args.last.unwrap_or(usize::MAX);

        let seg_idx = match &args.before {
            None => {
                if !self.has_last || self.segments.is_empty() {
                    return RangeSnapshot {
                        page_info: PageInfo {
                            has_next_page: false,
                            has_previous_page: true,
                        },
                        diff_args: Some(args.clone()),
                        ..RangeSnapshot::default()
                    };
                }
                self.segments.len() - 1
            }
            Some(cursor) => match self.segment_of_cursor(cursor) {
                Some(i) => i,
                None => {
                    return RangeSnapshot {
                        diff_args: Some(args.clone()),
                        ..RangeSnapshot::default()
                    }
                }
            },
        };

        let seg = &self.segments[seg_idx];
        let (collected, reached_start) = seg.edges_before(args.before.as_deref(), requested);
        let remaining = requested.saturating_sub(collected.len());
        let at_known_start = reached_start && seg_idx == 0 && self.has_first;

        let diff_args = if remaining == 0 || at_known_start {
            None
        } else {
            let resume_cursor = collected
                .iter()
                .find_map(|(_, c)| c.clone())
                .or_else(|| args.before.clone());
            match resume_cursor {
                Some(cursor) => Some(ConnectionArgs::last_before(remaining, cursor)),
                None => Some(args.clone()),
            }
        };

        let (edge_ids, cursors) = collected.into_iter().unzip();
        RangeSnapshot {
            edge_ids,
            cursors,
            page_info: PageInfo {
                has_next_page: args.before.is_some(),
                has_previous_page: !at_known_start,
            },
            diff_args,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(id: &str, cursor: &str) -> EdgeEntry {
        EdgeEntry {
            edge_id: id.to_string(),
            cursor: Some(cursor.to_string()),
        }
    }

    fn more_pages() -> PageInfo {
        PageInfo {
            has_next_page: true,
            has_previous_page: false,
        }
    }

    fn final_page() -> PageInfo {
        PageInfo {
            has_next_page: false,
            has_previous_page: false,
        }
    }

    // ── Segment ────────────────────────────────────────────────────

    #[test]
    fn segment_push_and_slice() {
        let mut seg = Segment::new();
        seg.push_back("e1".into(), Some("c1".into())).unwrap();
        seg.push_back("e2".into(), Some("c2".into())).unwrap();
        seg.push_back("e3".into(), Some("c3".into())).unwrap();

        assert_eq!(seg.len(), 3);
        assert_eq!(seg.count(), 3);
        assert_eq!(seg.first_cursor(), Some("c1"));
        assert_eq!(seg.last_cursor(), Some("c3"));

        let (edges, reached_end) = seg.edges_after(Some("c1"), 10);
        assert_eq!(
            edges.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["e2", "e3"]
        );
        assert!(reached_end);

        let (edges, reached_end) = seg.edges_after(None, 2);
        assert_eq!(edges.len(), 2);
        assert!(!reached_end);
    }

    #[test]
    fn segment_push_front_keeps_positions() {
        let mut seg = Segment::new();
        seg.push_back("e2".into(), Some("c2".into())).unwrap();
        seg.push_front("e1".into(), Some("c1".into())).unwrap();

        assert_eq!(seg.first_edge_id(), Some("e1"));
        assert_eq!(seg.last_edge_id(), Some("e2"));

        let (edges, _) = seg.edges_after(Some("c1"), 10);
        assert_eq!(edges[0].0, "e2");
    }

    #[test]
    fn segment_duplicate_push_rejected() {
        let mut seg = Segment::new();
        seg.push_back("e1".into(), Some("c1".into())).unwrap();
        let err = seg.push_back("e1".into(), Some("c9".into())).unwrap_err();
        assert!(matches!(err, CacheError::DuplicateEdge(id) if id == "e1"));
    }

    #[test]
    fn tombstones_are_retained_not_compacted() {
        let mut seg = Segment::new();
        seg.push_back("e1".into(), Some("c1".into())).unwrap();
        seg.push_back("e2".into(), Some("c2".into())).unwrap();
        seg.push_back("e3".into(), Some("c3".into())).unwrap();

        assert!(seg.mark_deleted("e2"));
        assert_eq!(seg.len(), 3, "length includes tombstones");
        assert_eq!(seg.count(), 2, "count excludes tombstones");
        assert!(seg.contains_edge("e2"), "tombstoned entry keeps its index slot");

        let (edges, _) = seg.edges_after(None, 10);
        assert_eq!(
            edges.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["e1", "e3"]
        );

        // Deleting twice is a no-op.
        assert!(!seg.mark_deleted("e2"));
        assert_eq!(seg.count(), 2);
    }

    #[test]
    fn concat_appends_in_order() {
        let mut a = Segment::new();
        a.push_back("e1".into(), Some("c1".into())).unwrap();
        a.push_back("e2".into(), Some("c2".into())).unwrap();

        let mut b = Segment::new();
        b.push_back("e3".into(), Some("c3".into())).unwrap();
        b.push_back("e4".into(), Some("c4".into())).unwrap();

        a.concat(&b).unwrap();
        assert_eq!(a.len(), 4);
        assert_eq!(a.count(), 4);
        assert_eq!(a.last_cursor(), Some("c4"));

        let (edges, _) = a.edges_after(Some("c2"), 10);
        assert_eq!(
            edges.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["e3", "e4"]
        );
    }

    #[test]
    fn concat_rollback_restores_receiver_exactly() {
        let mut a = Segment::new();
        a.push_back("e1".into(), Some("c1".into())).unwrap();
        a.push_back("e2".into(), Some("c2".into())).unwrap();
        a.mark_deleted("e2");
        let before = a.clone();

        let mut b = Segment::new();
        b.push_back("e3".into(), Some("c3".into())).unwrap();
        b.push_back("e1".into(), Some("c9".into())).unwrap(); // collides with a
        b.push_back("e4".into(), Some("c4".into())).unwrap();
        let b_before = b.clone();

        let err = a.concat(&b).unwrap_err();
        assert!(matches!(err, CacheError::DuplicateEdge(id) if id == "e1"));

        // Receiving segment fully restored: entries, indices, length, count.
        assert_eq!(a, before);
        // Donor segment never mutated.
        assert_eq!(b, b_before);
    }

    // ── Range writes + reads ───────────────────────────────────────

    #[test]
    fn range_merge_correctness() {
        let mut range = Range::new();
        range
            .add_items(
                &ConnectionArgs::first(3),
                &[edge("e1", "c1"), edge("e2", "c2"), edge("e3", "c3")],
                &more_pages(),
            )
            .unwrap();
        range
            .add_items(
                &ConnectionArgs::first_after(3, "c3"),
                &[edge("e4", "c4"), edge("e5", "c5"), edge("e6", "c6")],
                &final_page(),
            )
            .unwrap();

        assert_eq!(range.segment_count(), 1);
        assert_eq!(
            range.live_edge_ids(),
            vec!["e1", "e2", "e3", "e4", "e5", "e6"]
        );
        assert_eq!(range.first_cursor(), Some("c1"));
        assert_eq!(range.last_cursor(), Some("c6"));
    }

    #[test]
    fn retrieve_satisfied_window_has_no_diff() {
        let mut range = Range::new();
        range
            .add_items(
                &ConnectionArgs::first(3),
                &[edge("e1", "c1"), edge("e2", "c2"), edge("e3", "c3")],
                &more_pages(),
            )
            .unwrap();

        let snap = range.retrieve(&ConnectionArgs::first(2));
        assert_eq!(snap.edge_ids, vec!["e1", "e2"]);
        assert!(snap.diff_args.is_none());
        assert!(snap.page_info.has_next_page);
    }

    #[test]
    fn retrieve_emits_minimal_followup() {
        let mut range = Range::new();
        range
            .add_items(
                &ConnectionArgs::first(3),
                &[edge("e1", "c1"), edge("e2", "c2"), edge("e3", "c3")],
                &more_pages(),
            )
            .unwrap();

        // Want 5, have 3: follow-up is the remaining 2 after the last
        // known cursor, never re-requesting e1..e3.
        let snap = range.retrieve(&ConnectionArgs::first(5));
        assert_eq!(snap.edge_ids, vec!["e1", "e2", "e3"]);
        assert_eq!(
            snap.diff_args,
            Some(ConnectionArgs::first_after(2, "c3"))
        );
    }

    #[test]
    fn retrieve_at_known_end_is_complete() {
        let mut range = Range::new();
        range
            .add_items(
                &ConnectionArgs::first(2),
                &[edge("e1", "c1"), edge("e2", "c2")],
                &final_page(),
            )
            .unwrap();

        // Asking past the known end yields no follow-up.
        let snap = range.retrieve(&ConnectionArgs::first(10));
        assert_eq!(snap.edge_ids, vec!["e1", "e2"]);
        assert!(snap.diff_args.is_none());
        assert!(!snap.page_info.has_next_page);
    }

    #[test]
    fn unfetched_gap_is_not_assumed_empty() {
        let mut range = Range::new();
        range
            .add_items(
                &ConnectionArgs::first(2),
                &[edge("e1", "c1"), edge("e2", "c2")],
                &more_pages(),
            )
            .unwrap();
        // A detached page lands beyond an unknown cursor.
        range
            .add_items(
                &ConnectionArgs::first_after(2, "c8"),
                &[edge("e9", "c9"), edge("e10", "c10")],
                &final_page(),
            )
            .unwrap();

        assert_eq!(range.segment_count(), 2);

        // Reading from the start only trusts the first segment; the gap
        // produces a follow-up even though later edges exist.
        let snap = range.retrieve(&ConnectionArgs::first(4));
        assert_eq!(snap.edge_ids, vec!["e1", "e2"]);
        assert_eq!(
            snap.diff_args,
            Some(ConnectionArgs::first_after(2, "c2"))
        );
    }

    #[test]
    fn bridging_page_merges_segments() {
        let mut range = Range::new();
        range
            .add_items(
                &ConnectionArgs::first(2),
                &[edge("e1", "c1"), edge("e2", "c2")],
                &more_pages(),
            )
            .unwrap();
        range
            .add_items(
                &ConnectionArgs::first_after(2, "c4"),
                &[edge("e5", "c5"), edge("e6", "c6")],
                &more_pages(),
            )
            .unwrap();
        assert_eq!(range.segment_count(), 2);

        // The bridge page covers the gap and overlaps the detached
        // segment's head; everything collapses into one segment.
        range
            .add_items(
                &ConnectionArgs::first_after(3, "c2"),
                &[edge("e3", "c3"), edge("e4", "c4"), edge("e5", "c5")],
                &more_pages(),
            )
            .unwrap();

        assert_eq!(range.segment_count(), 1);
        assert_eq!(
            range.live_edge_ids(),
            vec!["e1", "e2", "e3", "e4", "e5", "e6"]
        );
    }

    #[test]
    fn backward_pagination_prepends() {
        let mut range = Range::new();
        range
            .add_items(
                &ConnectionArgs::last(2),
                &[edge("e5", "c5"), edge("e6", "c6")],
                &PageInfo {
                    has_next_page: false,
                    has_previous_page: true,
                },
            )
            .unwrap();
        range
            .add_items(
                &ConnectionArgs::last_before(2, "c5"),
                &[edge("e3", "c3"), edge("e4", "c4")],
                &PageInfo {
                    has_next_page: true,
                    has_previous_page: false,
                },
            )
            .unwrap();

        assert_eq!(range.live_edge_ids(), vec!["e3", "e4", "e5", "e6"]);

        let snap = range.retrieve(&ConnectionArgs::last(3));
        assert_eq!(snap.edge_ids, vec!["e4", "e5", "e6"]);
        assert!(snap.diff_args.is_none());

        let snap = range.retrieve(&ConnectionArgs::last(10));
        assert_eq!(snap.edge_ids, vec!["e3", "e4", "e5", "e6"]);
        assert!(snap.diff_args.is_none(), "range start is known");
    }

    #[test]
    fn refetch_updates_cursor_in_place() {
        let mut range = Range::new();
        range
            .add_items(
                &ConnectionArgs::first(2),
                &[edge("e1", "c1"), edge("e2", "c2")],
                &more_pages(),
            )
            .unwrap();
        range
            .add_items(
                &ConnectionArgs::first(2),
                &[edge("e1", "c1"), edge("e2", "c2b")],
                &more_pages(),
            )
            .unwrap();

        assert_eq!(range.live_edge_ids(), vec!["e1", "e2"]);
        assert_eq!(range.last_cursor(), Some("c2b"));
    }

    // ── Property tests ─────────────────────────────────────────────

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Appending n distinct edges always yields len == count == n,
            /// and slicing from the start returns them in order.
            #[test]
            fn push_back_preserves_order(n in 1usize..40) {
                let mut seg = Segment::new();
                for i in 0..n {
                    seg.push_back(format!("e{i}"), Some(format!("c{i}"))).unwrap();
                }
                prop_assert_eq!(seg.len(), n);
                prop_assert_eq!(seg.count(), n);

                let (edges, reached_end) = seg.edges_after(None, n + 1);
                prop_assert!(reached_end);
                let ids: Vec<String> = edges.into_iter().map(|(id, _)| id).collect();
                let expected: Vec<String> = (0..n).map(|i| format!("e{i}")).collect();
                prop_assert_eq!(ids, expected);
            }

            /// Concat with a colliding donor restores the receiver exactly,
            /// whatever the collision position and tombstone pattern.
            #[test]
            fn concat_rollback_is_exact(
                receiver_n in 1usize..12,
                donor_prefix in 0usize..6,
                collide_at in 0usize..12,
                delete_mask in any::<u16>(),
            ) {
                let mut receiver = Segment::new();
                for i in 0..receiver_n {
                    receiver.push_back(format!("r{i}"), Some(format!("rc{i}"))).unwrap();
                    if delete_mask & (1 << i) != 0 {
                        receiver.mark_deleted(&format!("r{i}"));
                    }
                }
                let before = receiver.clone();

                let collide_at = collide_at % receiver_n;
                let mut donor = Segment::new();
                for i in 0..donor_prefix {
                    donor.push_back(format!("d{i}"), Some(format!("dc{i}"))).unwrap();
                }
                donor.push_back(format!("r{collide_at}"), Some("dupe".into())).unwrap();

                prop_assert!(receiver.concat(&donor).is_err());
                prop_assert_eq!(receiver, before);
            }
        }
    }
}
