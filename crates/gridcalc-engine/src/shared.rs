//! Shared formulas: one canonical expression logically replicated across a
//! contiguous cell range.
//!
//! Member cells store only a `PtgExp` pointer at the host's anchor; the
//! canonical token sequence is instantiated **lazily** at evaluation time by
//! applying the member's row/column delta to every relative reference token.

use ahash::AHashMap;
use gridcalc_model::{CellRef, Range, MAX_COLS, MAX_ROWS};

use gridcalc_biff::{AreaLoc, Ptg, RefLoc};

use crate::tracker::SheetId;

/// One shared-formula host: the canonical expression plus its member set.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedFormulaHost {
    /// Anchor cell (the range's top-left); `PtgExp` pointers name this cell.
    pub anchor: CellRef,
    pub range: Range,
    pub tokens: Vec<Ptg>,
    members: Vec<CellRef>,
}

impl SharedFormulaHost {
    pub fn members(&self) -> &[CellRef] {
        &self.members
    }
}

/// Registry of shared-formula hosts, keyed by `(sheet, anchor)`.
#[derive(Debug, Default)]
pub struct SharedFormulaManager {
    hosts: AHashMap<(SheetId, CellRef), SharedFormulaHost>,
}

/// Errors from shared-formula operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SharedFormulaError {
    #[error("no shared-formula host anchored at {0}")]
    MissingHost(CellRef),
    #[error("cell {cell} is outside the shared range {range}")]
    OutsideRange { cell: CellRef, range: Range },
}

impl SharedFormulaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a host for `range`; the anchor is the range's top-left cell.
    pub fn create_host(&mut self, sheet: SheetId, tokens: Vec<Ptg>, range: Range) -> CellRef {
        let anchor = range.start;
        self.hosts.insert(
            (sheet, anchor),
            SharedFormulaHost {
                anchor,
                range,
                tokens,
                members: Vec::new(),
            },
        );
        anchor
    }

    pub fn host(&self, sheet: SheetId, anchor: CellRef) -> Option<&SharedFormulaHost> {
        self.hosts.get(&(sheet, anchor))
    }

    /// Anchors of every host on `sheet`, in row-major order.
    pub fn anchors_on(&self, sheet: SheetId) -> Vec<CellRef> {
        let mut anchors: Vec<CellRef> = self
            .hosts
            .keys()
            .filter(|(s, _)| *s == sheet)
            .map(|(_, anchor)| *anchor)
            .collect();
        anchors.sort_unstable();
        anchors
    }

    /// Enroll a member cell. The member stores only the host pointer; no
    /// copy of the token sequence is made here.
    pub fn add_member(
        &mut self,
        sheet: SheetId,
        anchor: CellRef,
        member: CellRef,
    ) -> Result<(), SharedFormulaError> {
        let host = self
            .hosts
            .get_mut(&(sheet, anchor))
            .ok_or(SharedFormulaError::MissingHost(anchor))?;
        if !host.range.contains(member) {
            return Err(SharedFormulaError::OutsideRange {
                cell: member,
                range: host.range,
            });
        }
        if !host.members.contains(&member) {
            host.members.push(member);
        }
        Ok(())
    }

    /// Instantiate the canonical expression for `member` by applying the
    /// member's offset from the anchor to every relative reference token.
    pub fn instantiate(
        &self,
        sheet: SheetId,
        anchor: CellRef,
        member: CellRef,
    ) -> Result<Vec<Ptg>, SharedFormulaError> {
        let host = self
            .hosts
            .get(&(sheet, anchor))
            .ok_or(SharedFormulaError::MissingHost(anchor))?;
        let delta_row = member.row as i64 - host.anchor.row as i64;
        let delta_col = member.col as i64 - host.anchor.col as i64;
        Ok(materialize_tokens(&host.tokens, delta_row, delta_col))
    }

    /// Remove a member; idempotent. When the last member is removed the
    /// host is destroyed and its expression released. Returns `true` when
    /// the host was destroyed.
    pub fn remove_member(&mut self, sheet: SheetId, anchor: CellRef, member: CellRef) -> bool {
        let Some(host) = self.hosts.get_mut(&(sheet, anchor)) else {
            return false;
        };
        host.members.retain(|m| *m != member);
        if host.members.is_empty() {
            self.hosts.remove(&(sheet, anchor));
            true
        } else {
            false
        }
    }

    /// Materialize the instantiated token sequence for `member` and detach
    /// it from the host permanently. The caller installs the returned
    /// tokens as the member's own expression.
    pub fn convert_to_standalone(
        &mut self,
        sheet: SheetId,
        anchor: CellRef,
        member: CellRef,
    ) -> Result<Vec<Ptg>, SharedFormulaError> {
        let tokens = self.instantiate(sheet, anchor, member)?;
        self.remove_member(sheet, anchor, member);
        Ok(tokens)
    }
}

fn shift_loc(loc: &RefLoc, delta_row: i64, delta_col: i64) -> Option<RefLoc> {
    let row = if loc.row_rel {
        loc.row as i64 + delta_row
    } else {
        loc.row as i64
    };
    let col = if loc.col_rel {
        loc.col as i64 + delta_col
    } else {
        loc.col as i64
    };
    if row < 0 || row >= MAX_ROWS as i64 || col < 0 || col >= MAX_COLS as i64 {
        return None;
    }
    Some(RefLoc::new(row as u16, col as u16, loc.row_rel, loc.col_rel))
}

fn shift_area(area: &AreaLoc, delta_row: i64, delta_col: i64) -> Option<AreaLoc> {
    Some(AreaLoc::new(
        shift_loc(&area.first, delta_row, delta_col)?,
        shift_loc(&area.last, delta_row, delta_col)?,
    ))
}

/// Apply a row/column delta to every relative reference token.
///
/// Absolute references pass through unchanged; a reference pushed out of
/// the sheet bounds degrades to the matching `#REF!` token.
pub fn materialize_tokens(tokens: &[Ptg], delta_row: i64, delta_col: i64) -> Vec<Ptg> {
    tokens
        .iter()
        .map(|ptg| match ptg {
            Ptg::Ref { class, loc } => match shift_loc(loc, delta_row, delta_col) {
                Some(loc) => Ptg::Ref { class: *class, loc },
                None => Ptg::RefErr { class: *class },
            },
            Ptg::Area { class, area } => match shift_area(area, delta_row, delta_col) {
                Some(area) => Ptg::Area { class: *class, area },
                None => Ptg::AreaErr { class: *class },
            },
            Ptg::Ref3d { class, ixti, loc } => match shift_loc(loc, delta_row, delta_col) {
                Some(loc) => Ptg::Ref3d {
                    class: *class,
                    ixti: *ixti,
                    loc,
                },
                None => Ptg::RefErr3d {
                    class: *class,
                    ixti: *ixti,
                },
            },
            Ptg::Area3d { class, ixti, area } => match shift_area(area, delta_row, delta_col) {
                Some(area) => Ptg::Area3d {
                    class: *class,
                    ixti: *ixti,
                    area,
                },
                None => Ptg::AreaErr3d {
                    class: *class,
                    ixti: *ixti,
                },
            },
            other => other.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridcalc_biff::{render_text, PtgClass, RenderContext};
    use pretty_assertions::assert_eq;

    fn host_tokens() -> Vec<Ptg> {
        // =A1+1 with a fully relative reference.
        vec![
            Ptg::Ref {
                class: PtgClass::Value,
                loc: RefLoc::new(0, 0, true, true),
            },
            Ptg::Int(1),
            Ptg::Add,
        ]
    }

    #[test]
    fn instantiate_applies_member_delta_to_relative_refs() {
        let mut mgr = SharedFormulaManager::new();
        let range = Range::from_a1("A6:A10").unwrap(); // anchor at row 5
        let anchor = mgr.create_host(0, host_tokens(), range);
        mgr.add_member(0, anchor, CellRef::new(7, 0)).unwrap();

        let tokens = mgr.instantiate(0, anchor, CellRef::new(7, 0)).unwrap();
        let text = render_text(&tokens, &RenderContext::default()).unwrap();
        assert_eq!(text, "A3+1");
    }

    #[test]
    fn absolute_references_pass_through() {
        let tokens = vec![Ptg::Ref {
            class: PtgClass::Value,
            loc: RefLoc::new(0, 0, false, false),
        }];
        let shifted = materialize_tokens(&tokens, 10, 3);
        assert_eq!(shifted, tokens);
    }

    #[test]
    fn out_of_bounds_shift_degrades_to_ref_error() {
        let tokens = vec![Ptg::Ref {
            class: PtgClass::Value,
            loc: RefLoc::new(0, 0, true, true),
        }];
        let shifted = materialize_tokens(&tokens, -1, 0);
        assert_eq!(
            shifted,
            vec![Ptg::RefErr {
                class: PtgClass::Value
            }]
        );
    }

    #[test]
    fn removing_last_member_destroys_host_idempotently() {
        let mut mgr = SharedFormulaManager::new();
        let anchor = mgr.create_host(0, host_tokens(), Range::from_a1("A1:A2").unwrap());
        mgr.add_member(0, anchor, CellRef::new(0, 0)).unwrap();
        mgr.add_member(0, anchor, CellRef::new(1, 0)).unwrap();

        assert!(!mgr.remove_member(0, anchor, CellRef::new(0, 0)));
        assert!(mgr.remove_member(0, anchor, CellRef::new(1, 0)));
        assert!(mgr.host(0, anchor).is_none());
        // Second removal on a destroyed host is a no-op.
        assert!(!mgr.remove_member(0, anchor, CellRef::new(1, 0)));
    }

    #[test]
    fn convert_to_standalone_detaches_and_rewrites() {
        let mut mgr = SharedFormulaManager::new();
        let anchor = mgr.create_host(0, host_tokens(), Range::from_a1("B2:B4").unwrap());
        mgr.add_member(0, anchor, CellRef::new(3, 1)).unwrap();

        let tokens = mgr.convert_to_standalone(0, anchor, CellRef::new(3, 1)).unwrap();
        let text = render_text(&tokens, &RenderContext::default()).unwrap();
        // Member is two rows below the anchor; =A1+1 becomes =A3+1.
        assert_eq!(text, "A3+1");
        assert!(mgr.host(0, anchor).is_none());
    }

    #[test]
    fn member_outside_range_is_rejected() {
        let mut mgr = SharedFormulaManager::new();
        let anchor = mgr.create_host(0, host_tokens(), Range::from_a1("A1:A2").unwrap());
        let err = mgr.add_member(0, anchor, CellRef::new(9, 9)).unwrap_err();
        assert!(matches!(err, SharedFormulaError::OutsideRange { .. }));
    }
}
