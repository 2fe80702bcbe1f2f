//! Reference tracker: the registry that keeps reference tokens consistent
//! under structural document edits.
//!
//! Rather than scattering observer callbacks across token objects, every
//! live reference token is registered here by id. A structural change is
//! resolved as a single logical batch: every outcome is computed from the
//! registry's **before** snapshot and returned to the caller, which then
//! rewrites owning formulas and invalidates caches. A formula can therefore
//! never observe a partially-shifted reference set.

use ahash::AHashMap;
use gridcalc_model::{CellRef, Range};

/// Identifier of a registered reference token.
pub type RefId = u64;

/// Sheet index within the workbook.
pub type SheetId = u16;

/// How a registered token reacts to structural-change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationPolicy {
    /// Follow structural edits (the default).
    TrackLive,
    /// Detached from future notifications without being destroyed
    /// (static snapshots of copied formulas).
    Frozen,
    /// The token has already degraded to a reference error; nothing left
    /// to track.
    Error,
}

/// Kind of structural edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralChange {
    InsertRows,
    DeleteRows,
    InsertCols,
    DeleteCols,
}

impl StructuralChange {
    fn is_insert(self) -> bool {
        matches!(self, StructuralChange::InsertRows | StructuralChange::InsertCols)
    }

    fn is_row_axis(self) -> bool {
        matches!(self, StructuralChange::InsertRows | StructuralChange::DeleteRows)
    }
}

/// Whether a boundary anchored exactly at the insertion index is shifted.
///
/// Callers disagree on this, so it is an explicit per-call parameter rather
/// than a hidden per-sheet default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftPolicy {
    /// A boundary at exactly the insertion index moves.
    Inclusive,
    /// A boundary at exactly the insertion index stays.
    Exclusive,
}

/// A registered reference token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRef {
    pub sheet: SheetId,
    pub range: Range,
    pub policy: LocationPolicy,
    /// Sheet of the formula cell this token belongs to (not necessarily
    /// the sheet the range denotes).
    pub owner_sheet: SheetId,
    /// Cell owning the formula this token belongs to.
    pub owner: CellRef,
    /// Index of the token within the owning expression.
    pub token_index: usize,
}

/// Outcome of a structural change for one registered token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefOutcome {
    Unchanged,
    Shifted(Range),
    /// The denoted range was (partially) deleted; the token must degrade to
    /// a `#REF!` marker and the owning formula is flagged for forced
    /// recalculation.
    Deleted,
}

/// One entry of a structural-change batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub id: RefId,
    pub owner_sheet: SheetId,
    pub owner: CellRef,
    pub token_index: usize,
    pub outcome: RefOutcome,
}

#[derive(Debug, Default)]
pub struct ReferenceTracker {
    entries: AHashMap<RefId, TrackedRef>,
    next_id: RefId,
}

impl ReferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        sheet: SheetId,
        range: Range,
        owner_sheet: SheetId,
        owner: CellRef,
        token_index: usize,
    ) -> RefId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            TrackedRef {
                sheet,
                range,
                policy: LocationPolicy::TrackLive,
                owner_sheet,
                owner,
                token_index,
            },
        );
        id
    }

    /// Idempotent: removing an id that is not present is a no-op.
    pub fn unregister(&mut self, id: RefId) {
        self.entries.remove(&id);
    }

    pub fn get(&self, id: RefId) -> Option<&TrackedRef> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `false` when the id is unknown.
    pub fn set_location_policy(&mut self, id: RefId, policy: LocationPolicy) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.policy = policy;
                true
            }
            None => false,
        }
    }

    /// The owner cell of a tracked token moved (e.g. its row shifted).
    pub fn reown(&mut self, id: RefId, owner_sheet: SheetId, owner: CellRef) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.owner_sheet = owner_sheet;
            entry.owner = owner;
        }
    }

    /// Owners of live entries whose range intersects `range` on `sheet`
    /// (dirty propagation when a precedent cell changes).
    pub fn dependents_of(&self, sheet: SheetId, range: Range) -> Vec<(SheetId, CellRef)> {
        let mut owners: Vec<(SheetId, CellRef)> = self
            .entries
            .values()
            .filter(|e| e.sheet == sheet && e.policy == LocationPolicy::TrackLive)
            .filter(|e| e.range.intersects(range))
            .map(|e| (e.owner_sheet, e.owner))
            .collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    /// Resolve a structural change against the current registry.
    ///
    /// All outcomes are computed from the same before-snapshot; the
    /// registry itself is updated, and the batch is returned for the caller
    /// to rewrite owning expressions and invalidate caches afterwards.
    pub fn apply_structural_change(
        &mut self,
        sheet: SheetId,
        change: StructuralChange,
        at: u32,
        count: u32,
        policy: ShiftPolicy,
    ) -> Vec<RefUpdate> {
        let mut updates = Vec::new();
        if count == 0 {
            return updates;
        }

        let mut ids: Vec<RefId> = self.entries.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            let entry = &self.entries[&id];
            if entry.sheet != sheet || entry.policy != LocationPolicy::TrackLive {
                continue;
            }

            let (start, end) = if change.is_row_axis() {
                (entry.range.start.row, entry.range.end.row)
            } else {
                (entry.range.start.col, entry.range.end.col)
            };

            let outcome = if change.is_insert() {
                shift_for_insert(start, end, at, count, policy)
            } else {
                shift_for_delete(start, end, at, count)
            };

            let outcome = match outcome {
                AxisOutcome::Unchanged => RefOutcome::Unchanged,
                AxisOutcome::Deleted => RefOutcome::Deleted,
                AxisOutcome::Shifted(new_start, new_end) => {
                    let range = entry.range;
                    let shifted = if change.is_row_axis() {
                        Range::new(
                            CellRef::new(new_start, range.start.col),
                            CellRef::new(new_end, range.end.col),
                        )
                    } else {
                        Range::new(
                            CellRef::new(range.start.row, new_start),
                            CellRef::new(range.end.row, new_end),
                        )
                    };
                    RefOutcome::Shifted(shifted)
                }
            };

            match &outcome {
                RefOutcome::Unchanged => {}
                RefOutcome::Shifted(range) => {
                    let entry = self.entries.get_mut(&id).expect("id from snapshot");
                    entry.range = *range;
                }
                RefOutcome::Deleted => {
                    let entry = self.entries.get_mut(&id).expect("id from snapshot");
                    entry.policy = LocationPolicy::Error;
                }
            }

            if outcome != RefOutcome::Unchanged {
                let entry = &self.entries[&id];
                updates.push(RefUpdate {
                    id,
                    owner_sheet: entry.owner_sheet,
                    owner: entry.owner,
                    token_index: entry.token_index,
                    outcome,
                });
            }
        }

        updates
    }
}

enum AxisOutcome {
    Unchanged,
    Shifted(u32, u32),
    Deleted,
}

fn boundary_shifts(coord: u32, at: u32, policy: ShiftPolicy) -> bool {
    match policy {
        ShiftPolicy::Inclusive => coord >= at,
        ShiftPolicy::Exclusive => coord > at,
    }
}

fn shift_for_insert(start: u32, end: u32, at: u32, count: u32, policy: ShiftPolicy) -> AxisOutcome {
    let new_start = if boundary_shifts(start, at, policy) {
        start + count
    } else {
        start
    };
    // The far boundary follows the same policy gate as the near one: an
    // insertion strictly inside the span always grows it, but an insertion
    // exactly at a boundary moves that boundary only under Inclusive. A
    // single-cell span at the insertion index must keep both boundaries in
    // step or the registry diverges from the token it describes.
    let new_end = if boundary_shifts(end, at, policy) {
        end + count
    } else {
        end
    };
    if new_start == start && new_end == end {
        AxisOutcome::Unchanged
    } else {
        AxisOutcome::Shifted(new_start, new_end)
    }
}

fn shift_for_delete(start: u32, end: u32, at: u32, count: u32) -> AxisOutcome {
    let delete_end = at + count; // exclusive
    if end < at {
        return AxisOutcome::Unchanged;
    }
    if start >= delete_end {
        return AxisOutcome::Shifted(start - count, end - count);
    }
    // Any overlap with the deleted band degrades the reference.
    AxisOutcome::Deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn range(a1: &str) -> Range {
        Range::from_a1(a1).unwrap()
    }

    fn tracker_with(ranges: &[&str]) -> (ReferenceTracker, Vec<RefId>) {
        let mut tracker = ReferenceTracker::new();
        let ids = ranges
            .iter()
            .enumerate()
            .map(|(i, r)| tracker.register(0, range(r), 0, CellRef::new(0, 0), i))
            .collect();
        (tracker, ids)
    }

    #[test]
    fn insert_rows_shifts_only_at_or_after_the_insertion() {
        // Rows are 0-indexed: "A6" is row index 5.
        let (mut tracker, ids) = tracker_with(&["A2", "A6", "A10:A12"]);
        let updates =
            tracker.apply_structural_change(0, StructuralChange::InsertRows, 5, 2, ShiftPolicy::Inclusive);

        assert_eq!(updates.len(), 2);
        assert_eq!(tracker.get(ids[0]).unwrap().range, range("A2"));
        assert_eq!(tracker.get(ids[1]).unwrap().range, range("A8"));
        assert_eq!(tracker.get(ids[2]).unwrap().range, range("A12:A14"));
    }

    #[test]
    fn insert_boundary_policy_is_per_call() {
        let (mut tracker, ids) = tracker_with(&["A6:A8"]);
        tracker.apply_structural_change(0, StructuralChange::InsertRows, 5, 1, ShiftPolicy::Exclusive);
        // Exclusive: the start boundary at exactly row 5 stays, the range grows.
        assert_eq!(tracker.get(ids[0]).unwrap().range, range("A6:A9"));

        let (mut tracker, ids) = tracker_with(&["A6:A8"]);
        tracker.apply_structural_change(0, StructuralChange::InsertRows, 5, 1, ShiftPolicy::Inclusive);
        assert_eq!(tracker.get(ids[0]).unwrap().range, range("A7:A9"));
    }

    #[test]
    fn exclusive_insert_at_a_single_cell_keeps_it_single() {
        // Both boundaries sit on the insertion index; Exclusive must hold
        // them together instead of inflating the span.
        let (mut tracker, ids) = tracker_with(&["A3"]);
        let updates =
            tracker.apply_structural_change(0, StructuralChange::InsertRows, 2, 1, ShiftPolicy::Exclusive);
        assert!(updates.is_empty());
        assert_eq!(tracker.get(ids[0]).unwrap().range, range("A3"));

        // A later delete of the inserted row must not touch the reference.
        let updates =
            tracker.apply_structural_change(0, StructuralChange::DeleteRows, 3, 1, ShiftPolicy::Inclusive);
        assert!(updates.is_empty());
        assert_eq!(tracker.get(ids[0]).unwrap().range, range("A3"));
    }

    #[test]
    fn delete_rows_fully_covering_a_range_degrades_it() {
        let (mut tracker, ids) = tracker_with(&["A6:A8", "A20"]);
        let updates =
            tracker.apply_structural_change(0, StructuralChange::DeleteRows, 4, 6, ShiftPolicy::Inclusive);

        assert_eq!(
            updates
                .iter()
                .find(|u| u.id == ids[0])
                .map(|u| u.outcome.clone()),
            Some(RefOutcome::Deleted)
        );
        assert_eq!(tracker.get(ids[0]).unwrap().policy, LocationPolicy::Error);
        // The survivor shifts up by the deleted row count.
        assert_eq!(tracker.get(ids[1]).unwrap().range, range("A14"));
    }

    #[test]
    fn partial_deletion_also_degrades() {
        let (mut tracker, ids) = tracker_with(&["A6:A10"]);
        let updates =
            tracker.apply_structural_change(0, StructuralChange::DeleteRows, 7, 2, ShiftPolicy::Inclusive);
        assert_eq!(updates[0].outcome, RefOutcome::Deleted);
        assert_eq!(tracker.get(ids[0]).unwrap().policy, LocationPolicy::Error);
    }

    #[test]
    fn frozen_entries_ignore_structural_changes() {
        let (mut tracker, ids) = tracker_with(&["A10"]);
        tracker.set_location_policy(ids[0], LocationPolicy::Frozen);
        let updates =
            tracker.apply_structural_change(0, StructuralChange::InsertRows, 0, 4, ShiftPolicy::Inclusive);
        assert!(updates.is_empty());
        assert_eq!(tracker.get(ids[0]).unwrap().range, range("A10"));
    }

    #[test]
    fn column_changes_use_the_column_axis() {
        let (mut tracker, ids) = tracker_with(&["C1:D1"]);
        tracker.apply_structural_change(0, StructuralChange::InsertCols, 1, 2, ShiftPolicy::Inclusive);
        assert_eq!(tracker.get(ids[0]).unwrap().range, range("E1:F1"));
        tracker.apply_structural_change(0, StructuralChange::DeleteCols, 0, 1, ShiftPolicy::Inclusive);
        assert_eq!(tracker.get(ids[0]).unwrap().range, range("D1:E1"));
    }

    #[test]
    fn unregister_is_idempotent() {
        let (mut tracker, ids) = tracker_with(&["A1"]);
        tracker.unregister(ids[0]);
        tracker.unregister(ids[0]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn dependents_of_reports_live_intersections_only() {
        let mut tracker = ReferenceTracker::new();
        let owner_a = CellRef::new(9, 0);
        let owner_b = CellRef::new(10, 0);
        tracker.register(0, range("A1:B2"), 0, owner_a, 0);
        let frozen = tracker.register(0, range("A1"), 0, owner_b, 0);
        tracker.set_location_policy(frozen, LocationPolicy::Frozen);

        assert_eq!(tracker.dependents_of(0, range("B2")), vec![(0, owner_a)]);
        assert_eq!(
            tracker.dependents_of(1, range("B2")),
            Vec::<(SheetId, CellRef)>::new()
        );
    }
}
