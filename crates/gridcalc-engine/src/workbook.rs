//! Workbook: cell storage, the calculation cache, and the orchestration of
//! parsing, shared/array formulas, reference tracking, and evaluation.

use ahash::{AHashMap, AHashSet};
use gridcalc_model::{CalcMode, CellRef, CellValue, ErrorValue, NameDefinition, NameTable, Range};
use log::debug;

use gridcalc_biff::{
    check_stack_discipline, render_text, ArrayRecord, CachedValue, FormulaRecord, Ptg, RefLoc,
    RenderContext, RgceError, ShrFmlaRecord,
};

use crate::array::ArrayFormula;
use crate::eval::{evaluate, evaluate_matrix, CellResolver, EvalContext, EvalError,
    DEFAULT_MAX_RECURSION};
use crate::shared::{SharedFormulaError, SharedFormulaManager};
use crate::text::{parse_formula_text, FormulaParseError};
use crate::tracker::{
    RefId, RefOutcome, RefUpdate, ReferenceTracker, SheetId, ShiftPolicy, StructuralChange,
};

#[derive(Debug, thiserror::Error)]
pub enum WorkbookError {
    #[error("no sheet with index {0}")]
    UnknownSheet(SheetId),
    #[error(transparent)]
    Parse(#[from] FormulaParseError),
    #[error(transparent)]
    Malformed(#[from] RgceError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Shared(#[from] SharedFormulaError),
    #[error("array formula anchored at {0} cannot be changed in part")]
    ArrayPart(CellRef),
    #[error("the edit would split the array formula at {0}")]
    ArraySplit(CellRef),
    #[error("no shared or array host at {0} for a pointer cell")]
    DanglingPointer(CellRef),
}

/// How a formula cell stores its expression.
#[derive(Debug, Clone, PartialEq)]
enum Expression {
    /// The cell owns its token sequence outright.
    Owned(Vec<Ptg>),
    /// Member of a shared-formula host; tokens are instantiated on demand.
    SharedMember { anchor: CellRef },
    /// Member of an array formula; the value is a sub-result of the
    /// anchor's matrix.
    ArrayMember { anchor: CellRef },
}

#[derive(Debug, Clone, PartialEq)]
struct FormulaCell {
    expr: Expression,
    cached: Option<CellValue>,
    dirty: bool,
    /// Recalculate on every read regardless of the dirty flag.
    always_calc: bool,
    /// Tracker registrations for this cell's reference tokens, parallel to
    /// the token indices recorded in the tracker.
    refs: Vec<RefId>,
}

#[derive(Debug, Clone, PartialEq)]
enum CellContent {
    Value(CellValue),
    Formula(FormulaCell),
}

#[derive(Debug, Default)]
pub struct Sheet {
    pub name: String,
    cells: AHashMap<CellRef, CellContent>,
    /// Array formulas keyed by anchor (top-left of the binding range).
    arrays: AHashMap<CellRef, ArrayFormula>,
}

#[derive(Debug)]
pub struct Workbook {
    sheets: Vec<Sheet>,
    pub names: NameTable,
    calc_mode: CalcMode,
    tracker: ReferenceTracker,
    shared: SharedFormulaManager,
    max_recursion: u32,
}

impl Default for Workbook {
    fn default() -> Self {
        Self::new()
    }
}

impl Workbook {
    pub fn new() -> Self {
        Self {
            sheets: Vec::new(),
            names: NameTable::new(),
            calc_mode: CalcMode::Automatic,
            tracker: ReferenceTracker::new(),
            shared: SharedFormulaManager::new(),
            max_recursion: DEFAULT_MAX_RECURSION,
        }
    }

    pub fn add_sheet(&mut self, name: impl Into<String>) -> SheetId {
        self.sheets.push(Sheet {
            name: name.into(),
            ..Sheet::default()
        });
        (self.sheets.len() - 1) as SheetId
    }

    pub fn sheet_id(&self, name: &str) -> Option<SheetId> {
        self.sheets
            .iter()
            .position(|s| s.name == name)
            .map(|i| i as SheetId)
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.name.clone()).collect()
    }

    pub fn calc_mode(&self) -> CalcMode {
        self.calc_mode
    }

    pub fn set_calc_mode(&mut self, mode: CalcMode) {
        self.calc_mode = mode;
    }

    pub fn set_max_recursion(&mut self, depth: u32) {
        self.max_recursion = depth;
    }

    fn sheet(&self, sheet: SheetId) -> Result<&Sheet, WorkbookError> {
        self.sheets
            .get(sheet as usize)
            .ok_or(WorkbookError::UnknownSheet(sheet))
    }

    fn sheet_mut(&mut self, sheet: SheetId) -> Result<&mut Sheet, WorkbookError> {
        self.sheets
            .get_mut(sheet as usize)
            .ok_or(WorkbookError::UnknownSheet(sheet))
    }

    // ---- content entry ----------------------------------------------------

    /// Store a plain value, replacing whatever the cell held.
    pub fn set_value(
        &mut self,
        sheet: SheetId,
        cell: CellRef,
        value: CellValue,
    ) -> Result<(), WorkbookError> {
        self.clear_cell(sheet, cell)?;
        self.sheet_mut(sheet)?
            .cells
            .insert(cell, CellContent::Value(value));
        self.propagate_dirty(sheet, Range::single(cell));
        Ok(())
    }

    /// Parse formula text (leading `=`) and install it.
    pub fn set_formula_from_text(
        &mut self,
        sheet: SheetId,
        cell: CellRef,
        text: &str,
    ) -> Result<(), WorkbookError> {
        let tokens = parse_formula_text(text, &self.names)?;
        self.set_formula_tokens(sheet, cell, tokens)
    }

    /// Install a token sequence as the cell's own expression.
    pub fn set_formula_tokens(
        &mut self,
        sheet: SheetId,
        cell: CellRef,
        tokens: Vec<Ptg>,
    ) -> Result<(), WorkbookError> {
        check_stack_discipline(&tokens)?;
        self.clear_cell(sheet, cell)?;
        let refs = self.register_refs(&tokens, sheet, cell);
        self.sheet_mut(sheet)?.cells.insert(
            cell,
            CellContent::Formula(FormulaCell {
                expr: Expression::Owned(tokens),
                cached: None,
                dirty: true,
                always_calc: false,
                refs,
            }),
        );
        self.propagate_dirty(sheet, Range::single(cell));
        Ok(())
    }

    /// Bind one expression to every cell of `range` through a shared host
    /// anchored at the range's top-left.
    pub fn set_shared_formula(
        &mut self,
        sheet: SheetId,
        range: Range,
        tokens: Vec<Ptg>,
    ) -> Result<(), WorkbookError> {
        check_stack_discipline(&tokens)?;
        let members: Vec<CellRef> = range.cells().collect();
        for member in &members {
            self.clear_cell(sheet, *member)?;
        }
        let anchor = self.shared.create_host(sheet, tokens, range);
        // The canonical tokens are tracked once, owned by the anchor cell.
        let host_tokens = self.shared.host(sheet, anchor).expect("just created").tokens.clone();
        let refs = self.register_refs(&host_tokens, sheet, anchor);
        for (i, member) in members.iter().enumerate() {
            self.shared.add_member(sheet, anchor, *member)?;
            self.sheet_mut(sheet)?.cells.insert(
                *member,
                CellContent::Formula(FormulaCell {
                    expr: Expression::SharedMember { anchor },
                    cached: None,
                    dirty: true,
                    always_calc: false,
                    refs: if i == 0 { refs.clone() } else { Vec::new() },
                }),
            );
        }
        self.propagate_dirty(sheet, range);
        Ok(())
    }

    /// Bind an array formula to `range`; every member cell reads its value
    /// out of the anchor's result matrix.
    pub fn set_array_formula(
        &mut self,
        sheet: SheetId,
        range: Range,
        tokens: Vec<Ptg>,
    ) -> Result<(), WorkbookError> {
        check_stack_discipline(&tokens)?;
        for member in range.cells() {
            self.clear_cell(sheet, member)?;
        }
        let anchor = range.start;
        let refs = self.register_refs(&tokens, sheet, anchor);
        self.sheet_mut(sheet)?
            .arrays
            .insert(anchor, ArrayFormula::new(tokens, range));
        for member in range.cells() {
            self.sheet_mut(sheet)?.cells.insert(
                member,
                CellContent::Formula(FormulaCell {
                    expr: Expression::ArrayMember { anchor },
                    cached: None,
                    dirty: true,
                    always_calc: false,
                    refs: if member == anchor { refs.clone() } else { Vec::new() },
                }),
            );
        }
        self.propagate_dirty(sheet, range);
        Ok(())
    }

    /// Detach a shared member into a standalone formula with materialized
    /// tokens. The last member detached destroys the host.
    pub fn convert_shared_to_standalone(
        &mut self,
        sheet: SheetId,
        cell: CellRef,
    ) -> Result<(), WorkbookError> {
        let (anchor, cached, dirty, always_calc, old_refs) =
            match self.sheet(sheet)?.cells.get(&cell) {
                Some(CellContent::Formula(fc)) => match &fc.expr {
                    Expression::SharedMember { anchor } => (
                        *anchor,
                        fc.cached.clone(),
                        fc.dirty,
                        fc.always_calc,
                        fc.refs.clone(),
                    ),
                    _ => return Ok(()),
                },
                _ => return Ok(()),
            };
        for id in old_refs {
            self.tracker.unregister(id);
        }
        let tokens = self.shared.convert_to_standalone(sheet, anchor, cell)?;
        let refs = self.register_refs(&tokens, sheet, cell);
        self.sheet_mut(sheet)?.cells.insert(
            cell,
            CellContent::Formula(FormulaCell {
                expr: Expression::Owned(tokens),
                cached,
                dirty,
                always_calc,
                refs,
            }),
        );
        Ok(())
    }

    /// Remove the cell's content. Removing part of an array formula is
    /// refused; the whole binding range must be cleared via
    /// [`Workbook::clear_array_formula`].
    pub fn clear_cell(&mut self, sheet: SheetId, cell: CellRef) -> Result<(), WorkbookError> {
        let (refs, shared_anchor) = match self.sheet(sheet)?.cells.get(&cell) {
            None => return Ok(()),
            Some(CellContent::Value(_)) => (Vec::new(), None),
            Some(CellContent::Formula(fc)) => match &fc.expr {
                Expression::ArrayMember { anchor } => {
                    return Err(WorkbookError::ArrayPart(*anchor));
                }
                Expression::SharedMember { anchor } => (fc.refs.clone(), Some(*anchor)),
                Expression::Owned(_) => (fc.refs.clone(), None),
            },
        };
        for id in refs {
            self.tracker.unregister(id);
        }
        if let Some(anchor) = shared_anchor {
            // Membership removal is idempotent towards a vanished host.
            if self.shared.remove_member(sheet, anchor, cell) {
                debug!("shared host at {anchor} released with its last member");
            }
        }
        self.sheet_mut(sheet)?.cells.remove(&cell);
        self.propagate_dirty(sheet, Range::single(cell));
        Ok(())
    }

    /// Remove an array formula and all of its member cells.
    pub fn clear_array_formula(
        &mut self,
        sheet: SheetId,
        anchor: CellRef,
    ) -> Result<(), WorkbookError> {
        let Some(array) = self.sheet_mut(sheet)?.arrays.remove(&anchor) else {
            return Ok(());
        };
        for member in array.range.cells() {
            let refs = match self.sheet(sheet)?.cells.get(&member) {
                Some(CellContent::Formula(fc)) => fc.refs.clone(),
                _ => Vec::new(),
            };
            for id in refs {
                self.tracker.unregister(id);
            }
            self.sheet_mut(sheet)?.cells.remove(&member);
        }
        self.propagate_dirty(sheet, array.range);
        Ok(())
    }

    fn register_refs(&mut self, tokens: &[Ptg], sheet: SheetId, owner: CellRef) -> Vec<RefId> {
        let mut refs = Vec::new();
        for (index, ptg) in tokens.iter().enumerate() {
            let target = match ptg {
                Ptg::Ref { loc, .. } => Some((sheet, Range::single(loc.cell()))),
                Ptg::Area { area, .. } => Some((sheet, area.range())),
                Ptg::Ref3d { ixti, loc, .. } => Some((*ixti, Range::single(loc.cell()))),
                Ptg::Area3d { ixti, area, .. } => Some((*ixti, area.range())),
                _ => None,
            };
            if let Some((ref_sheet, range)) = target {
                refs.push(self.tracker.register(ref_sheet, range, sheet, owner, index));
            }
        }
        refs
    }

    // ---- reading ----------------------------------------------------------

    /// Raw stored content without triggering calculation.
    pub fn stored_value(&self, sheet: SheetId, cell: CellRef) -> Option<&CellValue> {
        match self.sheets.get(sheet as usize)?.cells.get(&cell)? {
            CellContent::Value(v) => Some(v),
            CellContent::Formula(fc) => fc.cached.as_ref(),
        }
    }

    /// The cell's current value, honoring the calculation mode: `Automatic`
    /// recalculates dirty formulas, `Manual` serves the last cached result
    /// however stale, and `Always` bypasses the cache entirely.
    pub fn cell_value(&mut self, sheet: SheetId, cell: CellRef) -> Result<CellValue, WorkbookError> {
        let Some(content) = self.sheet(sheet)?.cells.get(&cell) else {
            return Ok(CellValue::Empty);
        };
        let fc = match content {
            CellContent::Value(v) => return Ok(v.clone()),
            CellContent::Formula(fc) => fc,
        };

        let needs_eval = match self.calc_mode {
            CalcMode::Always => true,
            CalcMode::Automatic => fc.always_calc || fc.dirty || fc.cached.is_none(),
            CalcMode::Manual => fc.cached.is_none(),
        };
        if !needs_eval {
            return Ok(fc.cached.clone().expect("cache present when not evaluating"));
        }

        let value = self.evaluate_cell(sheet, cell)?;
        if let Some(CellContent::Formula(fc)) = self.sheet_mut(sheet)?.cells.get_mut(&cell) {
            fc.cached = Some(value.clone());
            fc.dirty = false;
        }
        Ok(value)
    }

    fn evaluate_cell(&mut self, sheet: SheetId, cell: CellRef) -> Result<CellValue, WorkbookError> {
        let Some(CellContent::Formula(fc)) = self.sheet(sheet)?.cells.get(&cell) else {
            return Ok(CellValue::Empty);
        };
        let expr = fc.expr.clone();
        let ctx = EvalContext {
            sheet,
            cell,
            depth: 0,
            max_depth: self.max_recursion,
        };
        match expr {
            Expression::Owned(tokens) => Ok(evaluate(&tokens, &*self, &ctx)?),
            Expression::SharedMember { anchor } => {
                let tokens = self.shared.instantiate(sheet, anchor, cell)?;
                Ok(evaluate(&tokens, &*self, &ctx)?)
            }
            Expression::ArrayMember { anchor } => {
                let array = self
                    .sheet(sheet)?
                    .arrays
                    .get(&anchor)
                    .ok_or(WorkbookError::DanglingPointer(anchor))?;
                if !array.is_evaluated() {
                    let tokens = array.tokens.clone();
                    let range = array.range;
                    let anchor_ctx = EvalContext { cell: anchor, ..ctx };
                    let matrix = evaluate_matrix(&tokens, &*self, &anchor_ctx, range)?;
                    self.sheet_mut(sheet)?
                        .arrays
                        .get_mut(&anchor)
                        .expect("array checked above")
                        .set_result(matrix);
                }
                Ok(self.sheet(sheet)?.arrays[&anchor].value_at(cell).clone())
            }
        }
    }

    /// Human-readable formula text for a formula cell (`None` for values
    /// and empty cells). Array members render in braces.
    pub fn formula_text(&self, sheet: SheetId, cell: CellRef) -> Result<Option<String>, WorkbookError> {
        let Some(CellContent::Formula(fc)) = self.sheet(sheet)?.cells.get(&cell) else {
            return Ok(None);
        };
        let render_ctx = RenderContext {
            names: Some(&self.names),
            sheet_names: &[],
        };
        let text = match &fc.expr {
            Expression::Owned(tokens) => format!("={}", render_text(tokens, &render_ctx)?),
            Expression::SharedMember { anchor } => {
                let tokens = self.shared.instantiate(sheet, *anchor, cell)?;
                format!("={}", render_text(&tokens, &render_ctx)?)
            }
            Expression::ArrayMember { anchor } => {
                let array = self
                    .sheet(sheet)?
                    .arrays
                    .get(anchor)
                    .ok_or(WorkbookError::DanglingPointer(*anchor))?;
                format!("{{={}}}", render_text(&array.tokens, &render_ctx)?)
            }
        };
        Ok(Some(text))
    }

    /// Force a full pass: every formula is marked dirty and re-evaluated.
    pub fn recalculate(&mut self) -> Result<(), WorkbookError> {
        let mut formulas = Vec::new();
        for (sheet_idx, sheet) in self.sheets.iter_mut().enumerate() {
            for array in sheet.arrays.values_mut() {
                array.invalidate();
            }
            for (cell, content) in sheet.cells.iter_mut() {
                if let CellContent::Formula(fc) = content {
                    fc.dirty = true;
                    fc.cached = None;
                    formulas.push((sheet_idx as SheetId, *cell));
                }
            }
        }
        formulas.sort_unstable();
        for (sheet, cell) in formulas {
            let value = self.evaluate_cell(sheet, cell)?;
            if let Some(CellContent::Formula(fc)) = self.sheet_mut(sheet)?.cells.get_mut(&cell) {
                fc.cached = Some(value);
                fc.dirty = false;
            }
        }
        Ok(())
    }

    /// Transitively mark formulas referencing `range` dirty and drop their
    /// array caches.
    fn propagate_dirty(&mut self, sheet: SheetId, range: Range) {
        let mut queue = vec![(sheet, range)];
        let mut seen: AHashSet<(SheetId, CellRef)> = AHashSet::new();
        while let Some((s, r)) = queue.pop() {
            for (owner_sheet, owner) in self.tracker.dependents_of(s, r) {
                if !seen.insert((owner_sheet, owner)) {
                    continue;
                }
                let Some(sheet_store) = self.sheets.get_mut(owner_sheet as usize) else {
                    continue;
                };
                // An owner that is an array anchor dirties the whole
                // binding range.
                if let Some(array) = sheet_store.arrays.get_mut(&owner) {
                    array.invalidate();
                    let array_range = array.range;
                    for member in array_range.cells() {
                        if let Some(CellContent::Formula(fc)) = sheet_store.cells.get_mut(&member) {
                            fc.dirty = true;
                        }
                    }
                    queue.push((owner_sheet, array_range));
                    continue;
                }
                if let Some(CellContent::Formula(fc)) = sheet_store.cells.get_mut(&owner) {
                    fc.dirty = true;
                }
                queue.push((owner_sheet, Range::single(owner)));
            }
        }
    }

    // ---- structural changes -----------------------------------------------

    pub fn insert_rows(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
        policy: ShiftPolicy,
    ) -> Result<(), WorkbookError> {
        self.structural_change(sheet, StructuralChange::InsertRows, at, count, policy)
    }

    pub fn delete_rows(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
    ) -> Result<(), WorkbookError> {
        self.structural_change(sheet, StructuralChange::DeleteRows, at, count, ShiftPolicy::Inclusive)
    }

    pub fn insert_cols(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
        policy: ShiftPolicy,
    ) -> Result<(), WorkbookError> {
        self.structural_change(sheet, StructuralChange::InsertCols, at, count, policy)
    }

    pub fn delete_cols(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
    ) -> Result<(), WorkbookError> {
        self.structural_change(sheet, StructuralChange::DeleteCols, at, count, ShiftPolicy::Inclusive)
    }

    /// Apply one structural edit as a consistent batch: references are
    /// resolved against the pre-change snapshot, owning token sequences are
    /// rewritten, cell storage is shifted, and affected caches invalidated.
    /// No formula can observe a half-applied shift.
    fn structural_change(
        &mut self,
        sheet: SheetId,
        change: StructuralChange,
        at: u32,
        count: u32,
        policy: ShiftPolicy,
    ) -> Result<(), WorkbookError> {
        self.sheet(sheet)?;
        if count == 0 {
            return Ok(());
        }
        self.guard_arrays(sheet, change, at, count)?;

        // Shared hosts do not survive structural edits on their sheet: every
        // member is detached with materialized tokens first, so the batch
        // below only ever rewrites owned expressions.
        for anchor in self.shared.anchors_on(sheet) {
            let members = self
                .shared
                .host(sheet, anchor)
                .expect("anchor from listing")
                .members()
                .to_vec();
            for member in members {
                self.convert_shared_to_standalone(sheet, member)?;
            }
        }

        let updates = self.tracker.apply_structural_change(sheet, change, at, count, policy);
        debug!(
            "structural change {change:?} at {at} (count {count}) touched {} reference(s)",
            updates.len()
        );
        self.rewrite_updates(&updates)?;

        self.shift_storage(sheet, change, at, count);

        let mut touched: Vec<(SheetId, CellRef)> =
            updates.iter().map(|u| (u.owner_sheet, u.owner)).collect();
        touched.sort_unstable();
        touched.dedup();
        for (owner_sheet, owner) in touched {
            // Owners on the edited sheet may themselves have moved.
            let owner = if owner_sheet == sheet {
                match shift_cell(owner, change, at, count) {
                    Some(moved) => moved,
                    None => continue,
                }
            } else {
                owner
            };
            if let Some(sheet_store) = self.sheets.get_mut(owner_sheet as usize) {
                if let Some(array) = sheet_store.arrays.get_mut(&owner) {
                    array.invalidate();
                }
                if let Some(CellContent::Formula(fc)) = sheet_store.cells.get_mut(&owner) {
                    fc.dirty = true;
                    fc.cached = None;
                }
            }
            self.propagate_dirty(owner_sheet, Range::single(owner));
        }
        Ok(())
    }

    /// Refuse edits that would move only part of an array formula's range.
    fn guard_arrays(
        &self,
        sheet: SheetId,
        change: StructuralChange,
        at: u32,
        count: u32,
    ) -> Result<(), WorkbookError> {
        for (anchor, array) in &self.sheets[sheet as usize].arrays {
            let (start, end) = match change {
                StructuralChange::InsertRows | StructuralChange::DeleteRows => {
                    (array.range.start.row, array.range.end.row)
                }
                StructuralChange::InsertCols | StructuralChange::DeleteCols => {
                    (array.range.start.col, array.range.end.col)
                }
            };
            let splits = match change {
                StructuralChange::InsertRows | StructuralChange::InsertCols => {
                    // An insertion strictly inside the range would tear it.
                    at > start && at <= end
                }
                StructuralChange::DeleteRows | StructuralChange::DeleteCols => {
                    // Partial overlap tears it; full coverage or no overlap
                    // is fine.
                    let band_end = at + count; // exclusive
                    let overlaps = at <= end && band_end > start;
                    overlaps && !(at <= start && band_end > end)
                }
            };
            if splits {
                return Err(WorkbookError::ArraySplit(*anchor));
            }
        }
        Ok(())
    }

    /// Rewrite the token an update points at: shifted ranges are written
    /// back preserving anchoring flags, deleted ones degrade to the
    /// matching `#REF!` token of the same class.
    fn rewrite_updates(&mut self, updates: &[RefUpdate]) -> Result<(), WorkbookError> {
        for update in updates {
            let owner_sheet = update.owner_sheet;
            let owner = update.owner;
            let sheet_store = self
                .sheets
                .get_mut(owner_sheet as usize)
                .ok_or(WorkbookError::UnknownSheet(owner_sheet))?;

            if let Some(array) = sheet_store.arrays.get_mut(&owner) {
                apply_outcome(&mut array.tokens, update);
                continue;
            }
            if let Some(CellContent::Formula(FormulaCell {
                expr: Expression::Owned(tokens),
                ..
            })) = sheet_store.cells.get_mut(&owner)
            {
                apply_outcome(tokens, update);
            }
        }
        Ok(())
    }

    /// Move cell and array storage for a structural edit, re-owning the
    /// tracked references of every moved formula.
    fn shift_storage(&mut self, sheet: SheetId, change: StructuralChange, at: u32, count: u32) {
        let sheet_store = &mut self.sheets[sheet as usize];

        let old_cells = std::mem::take(&mut sheet_store.cells);
        let mut moved_refs: Vec<(RefId, CellRef)> = Vec::new();
        let mut removed: Vec<Vec<RefId>> = Vec::new();
        for (cell, content) in old_cells {
            match shift_cell(cell, change, at, count) {
                Some(new_cell) => {
                    if new_cell != cell {
                        if let CellContent::Formula(fc) = &content {
                            for id in &fc.refs {
                                moved_refs.push((*id, new_cell));
                            }
                        }
                    }
                    sheet_store.cells.insert(new_cell, content);
                }
                None => {
                    if let CellContent::Formula(fc) = content {
                        removed.push(fc.refs);
                    }
                }
            }
        }

        let old_arrays = std::mem::take(&mut sheet_store.arrays);
        for (anchor, mut array) in old_arrays {
            let start = shift_cell(array.range.start, change, at, count);
            let end = shift_cell(array.range.end, change, at, count);
            match (start, end) {
                (Some(start), Some(end)) => {
                    array.range = Range::new(start, end);
                    let new_anchor = shift_cell(anchor, change, at, count).unwrap_or(start);
                    // Member pointers name the anchor; retarget them.
                    if new_anchor != anchor {
                        for member in array.range.cells() {
                            if let Some(CellContent::Formula(fc)) =
                                sheet_store.cells.get_mut(&member)
                            {
                                if fc.expr == (Expression::ArrayMember { anchor }) {
                                    fc.expr = Expression::ArrayMember { anchor: new_anchor };
                                }
                            }
                        }
                    }
                    sheet_store.arrays.insert(new_anchor, array);
                }
                // The guard only lets whole-range deletions through.
                _ => {}
            }
        }

        for (id, new_owner) in moved_refs {
            self.tracker.reown(id, sheet, new_owner);
        }
        for refs in removed {
            for id in refs {
                self.tracker.unregister(id);
            }
        }
    }

    // ---- record loading ---------------------------------------------------

    /// Install a parsed FORMULA record. Pointer cells (a lone `PtgExp`)
    /// attach to the shared host or array anchored at the pointer target,
    /// which must already be loaded.
    pub fn load_formula_record(
        &mut self,
        sheet: SheetId,
        record: &FormulaRecord,
    ) -> Result<(), WorkbookError> {
        let cell = record.cell;
        if let [Ptg::Exp { row, col }] = record.tokens.as_slice() {
            let anchor = CellRef::new(*row as u32, *col as u32);
            let expr = if self.shared.host(sheet, anchor).is_some() {
                self.shared.add_member(sheet, anchor, cell)?;
                Expression::SharedMember { anchor }
            } else if self.sheet(sheet)?.arrays.contains_key(&anchor) {
                Expression::ArrayMember { anchor }
            } else {
                return Err(WorkbookError::DanglingPointer(anchor));
            };
            self.sheet_mut(sheet)?.cells.insert(
                cell,
                CellContent::Formula(FormulaCell {
                    expr,
                    cached: cached_to_value(&record.cached),
                    dirty: record.calc_on_load(),
                    always_calc: record.always_calc(),
                    refs: Vec::new(),
                }),
            );
            return Ok(());
        }

        let refs = self.register_refs(&record.tokens, sheet, cell);
        self.sheet_mut(sheet)?.cells.insert(
            cell,
            CellContent::Formula(FormulaCell {
                expr: Expression::Owned(record.tokens.clone()),
                cached: cached_to_value(&record.cached),
                dirty: record.calc_on_load(),
                always_calc: record.always_calc(),
                refs,
            }),
        );
        Ok(())
    }

    /// Install a parsed SHRFMLA record, creating the host and converting an
    /// already-loaded anchor cell into a member.
    pub fn load_shared_record(
        &mut self,
        sheet: SheetId,
        record: &ShrFmlaRecord,
    ) -> Result<(), WorkbookError> {
        let anchor = self.shared.create_host(sheet, record.tokens.clone(), record.range);
        let host_refs = self.register_refs(&record.tokens, sheet, anchor);
        let anchor_cell = self.sheet(sheet)?.cells.get(&anchor).cloned();
        if let Some(CellContent::Formula(fc)) = anchor_cell {
            // The anchor's own FORMULA record carried a redundant copy of
            // the expression; drop it in favor of the host.
            if let Expression::Owned(_) = fc.expr {
                for id in fc.refs {
                    self.tracker.unregister(id);
                }
            }
            self.shared.add_member(sheet, anchor, anchor)?;
            self.sheet_mut(sheet)?.cells.insert(
                anchor,
                CellContent::Formula(FormulaCell {
                    expr: Expression::SharedMember { anchor },
                    cached: fc.cached,
                    dirty: fc.dirty,
                    always_calc: fc.always_calc,
                    refs: host_refs,
                }),
            );
        }
        Ok(())
    }

    /// Install a parsed ARRAY record, converting an already-loaded anchor
    /// pointer into an array member.
    pub fn load_array_record(
        &mut self,
        sheet: SheetId,
        record: &ArrayRecord,
    ) -> Result<(), WorkbookError> {
        let anchor = record.range.start;
        let refs = self.register_refs(&record.tokens, sheet, anchor);
        self.sheet_mut(sheet)?
            .arrays
            .insert(anchor, ArrayFormula::new(record.tokens.clone(), record.range));
        let anchor_cell = self.sheet(sheet)?.cells.get(&anchor).cloned();
        let (cached, dirty, always_calc) = match anchor_cell {
            Some(CellContent::Formula(fc)) => {
                for id in fc.refs {
                    self.tracker.unregister(id);
                }
                (fc.cached, fc.dirty, fc.always_calc)
            }
            _ => (None, true, false),
        };
        self.sheet_mut(sheet)?.cells.insert(
            anchor,
            CellContent::Formula(FormulaCell {
                expr: Expression::ArrayMember { anchor },
                cached,
                dirty,
                always_calc,
                refs,
            }),
        );
        Ok(())
    }
}

impl CellResolver for Workbook {
    fn sheet_exists(&self, sheet: SheetId) -> bool {
        (sheet as usize) < self.sheets.len()
    }

    fn cell_value(
        &self,
        sheet: SheetId,
        cell: CellRef,
        ctx: &EvalContext,
    ) -> Result<CellValue, EvalError> {
        if ctx.exhausted() {
            return Ok(CellValue::Error(ErrorValue::Circular));
        }
        let Some(sheet_store) = self.sheets.get(sheet as usize) else {
            return Ok(CellValue::Error(ErrorValue::Ref));
        };
        let Some(content) = sheet_store.cells.get(&cell) else {
            return Ok(CellValue::Empty);
        };
        let fc = match content {
            CellContent::Value(v) => return Ok(v.clone()),
            CellContent::Formula(fc) => fc,
        };
        // A clean cache is valid mid-recursion except in `Always` mode.
        if self.calc_mode != CalcMode::Always && !fc.always_calc && !fc.dirty {
            if let Some(v) = &fc.cached {
                return Ok(v.clone());
            }
        }

        let inner = ctx.descend(sheet, cell);
        match &fc.expr {
            Expression::Owned(tokens) => evaluate(tokens, self, &inner),
            Expression::SharedMember { anchor } => {
                let tokens = self
                    .shared
                    .instantiate(sheet, *anchor, cell)
                    .map_err(|_| EvalError::MissingSharedHost(*anchor))?;
                evaluate(&tokens, self, &inner)
            }
            Expression::ArrayMember { anchor } => {
                let Some(array) = sheet_store.arrays.get(anchor) else {
                    return Ok(CellValue::Error(ErrorValue::Ref));
                };
                if array.is_evaluated() {
                    return Ok(array.value_at(cell).clone());
                }
                // Uncached mid-recursion: compute the matrix transiently;
                // the anchor's own top-level read installs the cache.
                let anchor_ctx = EvalContext {
                    cell: *anchor,
                    ..inner
                };
                let matrix = evaluate_matrix(&array.tokens, self, &anchor_ctx, array.range)?;
                let r = (cell.row - array.range.start.row) as usize;
                let c = (cell.col - array.range.start.col) as usize;
                Ok(matrix
                    .get(r)
                    .and_then(|row| row.get(c))
                    .cloned()
                    .unwrap_or(CellValue::Error(ErrorValue::NA)))
            }
        }
    }

    fn name_definition(&self, iname: u16) -> Option<NameDefinition> {
        self.names.get(iname).map(|n| n.definition.clone())
    }
}

fn cached_to_value(cached: &CachedValue) -> Option<CellValue> {
    match cached {
        CachedValue::Number(n) => Some(CellValue::Number(*n)),
        CachedValue::Boolean(b) => Some(CellValue::Boolean(*b)),
        CachedValue::Error(e) => Some(CellValue::Error(*e)),
        CachedValue::EmptyString => Some(CellValue::Text(String::new())),
        // The string body lives in a separate STRING record; without it the
        // cache is not trustworthy.
        CachedValue::String | CachedValue::None => None,
    }
}

fn apply_outcome(tokens: &mut [Ptg], update: &RefUpdate) {
    let Some(token) = tokens.get_mut(update.token_index) else {
        return;
    };
    match &update.outcome {
        RefOutcome::Unchanged => {}
        RefOutcome::Shifted(range) => rewrite_shifted(token, *range),
        RefOutcome::Deleted => degrade_to_ref_err(token),
    }
}

/// Where a cell lands after a structural edit; `None` when it is deleted
/// or pushed off the sheet.
fn shift_cell(cell: CellRef, change: StructuralChange, at: u32, count: u32) -> Option<CellRef> {
    let (coord, limit) = match change {
        StructuralChange::InsertRows | StructuralChange::DeleteRows => {
            (cell.row, gridcalc_model::MAX_ROWS)
        }
        StructuralChange::InsertCols | StructuralChange::DeleteCols => {
            (cell.col, gridcalc_model::MAX_COLS)
        }
    };
    let new_coord = match change {
        StructuralChange::InsertRows | StructuralChange::InsertCols => {
            if coord >= at {
                let shifted = coord + count;
                if shifted >= limit {
                    return None;
                }
                shifted
            } else {
                coord
            }
        }
        StructuralChange::DeleteRows | StructuralChange::DeleteCols => {
            if coord >= at + count {
                coord - count
            } else if coord >= at {
                return None;
            } else {
                coord
            }
        }
    };
    Some(match change {
        StructuralChange::InsertRows | StructuralChange::DeleteRows => {
            CellRef::new(new_coord, cell.col)
        }
        StructuralChange::InsertCols | StructuralChange::DeleteCols => {
            CellRef::new(cell.row, new_coord)
        }
    })
}

/// Write a shifted range back into a reference token, preserving the
/// relative/absolute anchoring flags.
fn rewrite_shifted(token: &mut Ptg, range: Range) {
    match token {
        Ptg::Ref { loc, .. } | Ptg::Ref3d { loc, .. } => {
            *loc = RefLoc::new(
                range.start.row as u16,
                range.start.col as u16,
                loc.row_rel,
                loc.col_rel,
            );
        }
        Ptg::Area { area, .. } | Ptg::Area3d { area, .. } => {
            area.first = RefLoc::new(
                range.start.row as u16,
                range.start.col as u16,
                area.first.row_rel,
                area.first.col_rel,
            );
            area.last = RefLoc::new(
                range.end.row as u16,
                range.end.col as u16,
                area.last.row_rel,
                area.last.col_rel,
            );
        }
        _ => {}
    }
}

/// Degrade a reference token to its `#REF!` form, preserving the class.
fn degrade_to_ref_err(token: &mut Ptg) {
    let replacement = match token {
        Ptg::Ref { class, .. } => Ptg::RefErr { class: *class },
        Ptg::Area { class, .. } => Ptg::AreaErr { class: *class },
        Ptg::Ref3d { class, ixti, .. } => Ptg::RefErr3d {
            class: *class,
            ixti: *ixti,
        },
        Ptg::Area3d { class, ixti, .. } => Ptg::AreaErr3d {
            class: *class,
            ixti: *ixti,
        },
        _ => return,
    };
    *token = replacement;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cell(a1: &str) -> CellRef {
        CellRef::from_a1(a1).unwrap()
    }

    fn range(a1: &str) -> Range {
        Range::from_a1(a1).unwrap()
    }

    fn book() -> (Workbook, SheetId) {
        let mut wb = Workbook::new();
        let sheet = wb.add_sheet("Sheet1");
        (wb, sheet)
    }

    #[test]
    fn automatic_mode_recalculates_on_read() {
        let (mut wb, s) = book();
        wb.set_value(s, cell("A1"), CellValue::Number(2.0)).unwrap();
        wb.set_formula_from_text(s, cell("B1"), "=A1*10").unwrap();
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("B1")).unwrap(), CellValue::Number(20.0));

        wb.set_value(s, cell("A1"), CellValue::Number(3.0)).unwrap();
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("B1")).unwrap(), CellValue::Number(30.0));
    }

    #[test]
    fn manual_mode_serves_stale_cache_until_recalculate() {
        let (mut wb, s) = book();
        wb.set_value(s, cell("A1"), CellValue::Number(2.0)).unwrap();
        wb.set_formula_from_text(s, cell("B1"), "=A1*10").unwrap();
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("B1")).unwrap(), CellValue::Number(20.0));

        wb.set_calc_mode(CalcMode::Manual);
        wb.set_value(s, cell("A1"), CellValue::Number(5.0)).unwrap();
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("B1")).unwrap(), CellValue::Number(20.0));

        wb.recalculate().unwrap();
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("B1")).unwrap(), CellValue::Number(50.0));
    }

    #[test]
    fn two_cell_cycle_reports_circular() {
        let (mut wb, s) = book();
        wb.set_max_recursion(16);
        wb.set_formula_from_text(s, cell("A1"), "=B1+1").unwrap();
        wb.set_formula_from_text(s, cell("B1"), "=A1+1").unwrap();
        assert_eq!(
            Workbook::cell_value(&mut wb, s, cell("A1")).unwrap(),
            CellValue::Error(ErrorValue::Circular)
        );
    }

    #[test]
    fn dirty_propagation_is_transitive() {
        let (mut wb, s) = book();
        wb.set_value(s, cell("A1"), CellValue::Number(1.0)).unwrap();
        wb.set_formula_from_text(s, cell("B1"), "=A1+1").unwrap();
        wb.set_formula_from_text(s, cell("C1"), "=B1+1").unwrap();
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("C1")).unwrap(), CellValue::Number(3.0));

        wb.set_value(s, cell("A1"), CellValue::Number(10.0)).unwrap();
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("C1")).unwrap(), CellValue::Number(12.0));
    }

    #[test]
    fn shared_formula_members_evaluate_with_their_own_offsets() {
        let (mut wb, s) = book();
        for (a1, v) in [("A1", 1.0), ("A2", 2.0), ("A3", 3.0)] {
            wb.set_value(s, cell(a1), CellValue::Number(v)).unwrap();
        }
        // =A1*2 anchored at B1, shared down B1:B3.
        let tokens = parse_formula_text("=A1*2", &wb.names).unwrap();
        wb.set_shared_formula(s, range("B1:B3"), tokens).unwrap();

        assert_eq!(Workbook::cell_value(&mut wb, s, cell("B1")).unwrap(), CellValue::Number(2.0));
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("B3")).unwrap(), CellValue::Number(6.0));
        assert_eq!(
            wb.formula_text(s, cell("B3")).unwrap(),
            Some("=A3*2".to_string())
        );
    }

    #[test]
    fn array_formula_members_read_the_shared_matrix() {
        let (mut wb, s) = book();
        for (a1, v) in [("A1", 1.0), ("A2", 2.0), ("A3", 3.0)] {
            wb.set_value(s, cell(a1), CellValue::Number(v)).unwrap();
        }
        let tokens = parse_formula_text("=A1:A3*10", &wb.names).unwrap();
        wb.set_array_formula(s, range("C1:C3"), tokens).unwrap();

        assert_eq!(Workbook::cell_value(&mut wb, s, cell("C2")).unwrap(), CellValue::Number(20.0));
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("C3")).unwrap(), CellValue::Number(30.0));
        assert_eq!(
            wb.formula_text(s, cell("C2")).unwrap(),
            Some("{=A1:A3*10}".to_string())
        );
    }

    #[test]
    fn changing_part_of_an_array_is_refused() {
        let (mut wb, s) = book();
        let tokens = parse_formula_text("=1", &wb.names).unwrap();
        wb.set_array_formula(s, range("C1:C3"), tokens).unwrap();
        assert!(matches!(
            wb.set_value(s, cell("C2"), CellValue::Number(0.0)),
            Err(WorkbookError::ArrayPart(_))
        ));
        wb.clear_array_formula(s, cell("C1")).unwrap();
        wb.set_value(s, cell("C2"), CellValue::Number(0.0)).unwrap();
    }

    #[test]
    fn insert_rows_shifts_formulas_and_their_references() {
        let (mut wb, s) = book();
        wb.set_value(s, cell("A5"), CellValue::Number(7.0)).unwrap();
        wb.set_formula_from_text(s, cell("B10"), "=A5*2").unwrap();
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("B10")).unwrap(), CellValue::Number(14.0));

        wb.insert_rows(s, 2, 3, ShiftPolicy::Inclusive).unwrap();
        // Both the value and the formula moved down by three rows, and the
        // reference was rewritten to follow.
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("A8")).unwrap(), CellValue::Number(7.0));
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("B13")).unwrap(), CellValue::Number(14.0));
        assert_eq!(
            wb.formula_text(s, cell("B13")).unwrap(),
            Some("=A8*2".to_string())
        );
    }

    #[test]
    fn deleting_referenced_rows_degrades_to_ref_error() {
        let (mut wb, s) = book();
        wb.set_value(s, cell("A5"), CellValue::Number(7.0)).unwrap();
        wb.set_formula_from_text(s, cell("B10"), "=A5*2").unwrap();
        Workbook::cell_value(&mut wb, s, cell("B10")).unwrap();

        wb.delete_rows(s, 3, 4).unwrap();
        assert_eq!(
            Workbook::cell_value(&mut wb, s, cell("B6")).unwrap(),
            CellValue::Error(ErrorValue::Ref)
        );
        assert_eq!(
            wb.formula_text(s, cell("B6")).unwrap(),
            Some("=#REF!*2".to_string())
        );
    }

    #[test]
    fn structural_edit_refuses_to_split_an_array() {
        let (mut wb, s) = book();
        let tokens = parse_formula_text("=1", &wb.names).unwrap();
        wb.set_array_formula(s, range("C2:C4"), tokens).unwrap();
        assert!(matches!(
            wb.insert_rows(s, 2, 1, ShiftPolicy::Inclusive),
            Err(WorkbookError::ArraySplit(_))
        ));
        // An insertion above the array merely shifts it.
        wb.insert_rows(s, 0, 1, ShiftPolicy::Inclusive).unwrap();
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("C3")).unwrap(), CellValue::Number(1.0));
    }

    #[test]
    fn structural_edit_detaches_shared_members() {
        let (mut wb, s) = book();
        wb.set_value(s, cell("A1"), CellValue::Number(4.0)).unwrap();
        let tokens = parse_formula_text("=A1*2", &wb.names).unwrap();
        wb.set_shared_formula(s, range("B1:B2"), tokens).unwrap();

        wb.insert_rows(s, 5, 1, ShiftPolicy::Inclusive).unwrap();
        // Members still calculate with materialized standalone tokens.
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("B1")).unwrap(), CellValue::Number(8.0));
        assert_eq!(
            wb.formula_text(s, cell("B1")).unwrap(),
            Some("=A1*2".to_string())
        );
        assert!(wb.shared.anchors_on(s).is_empty());
    }

    #[test]
    fn clearing_shared_members_releases_the_host_with_the_last_one() {
        let (mut wb, s) = book();
        let tokens = parse_formula_text("=1", &wb.names).unwrap();
        wb.set_shared_formula(s, range("B1:B2"), tokens).unwrap();
        assert_eq!(wb.shared.anchors_on(s).len(), 1);

        wb.clear_cell(s, cell("B1")).unwrap();
        assert_eq!(wb.shared.anchors_on(s).len(), 1);
        wb.clear_cell(s, cell("B2")).unwrap();
        assert!(wb.shared.anchors_on(s).is_empty());
        // Clearing again is a no-op.
        wb.clear_cell(s, cell("B2")).unwrap();
    }

    #[test]
    fn always_mode_bypasses_the_cache() {
        let (mut wb, s) = book();
        wb.set_value(s, cell("A1"), CellValue::Number(1.0)).unwrap();
        wb.set_formula_from_text(s, cell("B1"), "=A1+1").unwrap();
        Workbook::cell_value(&mut wb, s, cell("B1")).unwrap();

        wb.set_calc_mode(CalcMode::Always);
        // Poke the precedent without going through set_value's dirty
        // propagation to prove the cache really is bypassed.
        wb.sheets[s as usize]
            .cells
            .insert(cell("A1"), CellContent::Value(CellValue::Number(9.0)));
        assert_eq!(Workbook::cell_value(&mut wb, s, cell("B1")).unwrap(), CellValue::Number(10.0));
    }
}
