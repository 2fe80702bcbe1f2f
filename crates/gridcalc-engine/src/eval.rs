//! Postfix stack evaluator.
//!
//! Each call is a fresh run of the stack machine over an ordered token
//! sequence; no evaluator state persists between calls. Reference tokens
//! resolve through a [`CellResolver`], which recurses into dependent
//! formula evaluation; the recursion depth rides in the [`EvalContext`]
//! that is threaded explicitly through every call, so independent
//! top-level calculations never share a counter.
//!
//! User-visible problems (`#REF!`, `#DIV/0!`, circular references, ...)
//! are **values** that flow through the stack like any other operand.
//! [`EvalError`] is reserved for corrupt expressions and unimplemented
//! function ids.

use gridcalc_model::{format_number, CellRef, CellValue, ErrorValue, NameDefinition, Range};
use smallvec::SmallVec;

use gridcalc_biff::ftab::{self, iftab};
use gridcalc_biff::{Attr, Ptg};

use crate::array::Matrix;
use crate::tracker::SheetId;

/// Default recursion bound for circular-reference detection.
pub const DEFAULT_MAX_RECURSION: u32 = 100;

/// Per-evaluation context, threaded through recursive calls.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    pub sheet: SheetId,
    /// The formula cell being calculated (implicit-intersection anchor).
    pub cell: CellRef,
    /// Current recursion depth; incremented by the resolver on entry into a
    /// referenced formula cell.
    pub depth: u32,
    pub max_depth: u32,
}

impl EvalContext {
    pub fn new(sheet: SheetId, cell: CellRef) -> Self {
        Self {
            sheet,
            cell,
            depth: 0,
            max_depth: DEFAULT_MAX_RECURSION,
        }
    }

    /// Context for descending into a referenced formula cell.
    pub fn descend(&self, sheet: SheetId, cell: CellRef) -> Self {
        Self {
            sheet,
            cell,
            depth: self.depth + 1,
            max_depth: self.max_depth,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.depth > self.max_depth
    }
}

/// The evaluator's view of the cell-storage collaborator.
pub trait CellResolver {
    fn sheet_exists(&self, sheet: SheetId) -> bool;

    /// Evaluated value of a cell, recursing into its formula if needed.
    /// Circular-reference cutoff is the resolver's job (via `ctx.depth`).
    fn cell_value(&self, sheet: SheetId, cell: CellRef, ctx: &EvalContext)
        -> Result<CellValue, EvalError>;

    /// Definition of a workbook name (1-based wire index).
    fn name_definition(&self, iname: u16) -> Option<NameDefinition>;
}

/// Hard evaluation failures (data corruption or missing capability).
/// These are reported to the embedding application and never become cell
/// values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("function id {0} has no implementation")]
    FunctionNotSupported(u16),
    #[error("operand stack underflow at token {index}")]
    StackUnderflow { index: usize },
    #[error("shared-formula pointer encountered during evaluation")]
    UnexpectedSharedPointer,
    #[error("shared-formula host missing at {0}")]
    MissingSharedHost(CellRef),
}

/// A stack operand: a scalar, an unresolved reference set, or an array
/// literal.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Scalar(CellValue),
    Refs {
        sheet: SheetId,
        areas: SmallVec<[Range; 1]>,
    },
    Array(Matrix),
}

impl Operand {
    fn single_ref(sheet: SheetId, range: Range) -> Self {
        Operand::Refs {
            sheet,
            areas: SmallVec::from_elem(range, 1),
        }
    }

    fn error(e: ErrorValue) -> Self {
        Operand::Scalar(CellValue::Error(e))
    }
}

/// Evaluate a token sequence to a scalar result.
pub fn evaluate<R: CellResolver>(
    tokens: &[Ptg],
    resolver: &R,
    ctx: &EvalContext,
) -> Result<CellValue, EvalError> {
    let operand = eval_operand(tokens, resolver, ctx)?;
    scalar_of(operand, resolver, ctx)
}

/// Evaluate a token sequence in array context, producing the matrix for an
/// array formula bound to `range`.
pub fn evaluate_matrix<R: CellResolver>(
    tokens: &[Ptg],
    resolver: &R,
    ctx: &EvalContext,
    range: Range,
) -> Result<Matrix, EvalError> {
    match eval_operand(tokens, resolver, ctx)? {
        Operand::Refs { sheet, areas } if areas.len() == 1 => {
            let area = areas[0];
            let mut matrix = Vec::with_capacity(area.rows() as usize);
            for row in area.start.row..=area.end.row {
                let mut out_row = Vec::with_capacity(area.cols() as usize);
                for col in area.start.col..=area.end.col {
                    out_row.push(resolver.cell_value(sheet, CellRef::new(row, col), ctx)?);
                }
                matrix.push(out_row);
            }
            Ok(matrix)
        }
        Operand::Array(matrix) => Ok(matrix),
        _ => {
            // Scalar expression (possibly over ranges): broadcast by
            // evaluating per output cell so implicit intersection aligns
            // with each cell's own position.
            let mut matrix = Vec::with_capacity(range.rows() as usize);
            for row in range.start.row..=range.end.row {
                let mut out_row = Vec::with_capacity(range.cols() as usize);
                for col in range.start.col..=range.end.col {
                    let cell_ctx = EvalContext {
                        cell: CellRef::new(row, col),
                        ..*ctx
                    };
                    out_row.push(evaluate(tokens, resolver, &cell_ctx)?);
                }
                matrix.push(out_row);
            }
            Ok(matrix)
        }
    }
}

fn eval_operand<R: CellResolver>(
    tokens: &[Ptg],
    resolver: &R,
    ctx: &EvalContext,
) -> Result<Operand, EvalError> {
    let mut stack: SmallVec<[Operand; 8]> = SmallVec::new();

    for (index, ptg) in tokens.iter().enumerate() {
        match ptg {
            Ptg::Int(n) => stack.push(Operand::Scalar(CellValue::Number(*n as f64))),
            Ptg::Num(n) => stack.push(Operand::Scalar(CellValue::Number(*n))),
            Ptg::Bool(b) => stack.push(Operand::Scalar(CellValue::Boolean(*b))),
            Ptg::Str(s) => stack.push(Operand::Scalar(CellValue::Text(s.clone()))),
            Ptg::Err(e) => stack.push(Operand::error(*e)),
            Ptg::MissingArg => stack.push(Operand::Scalar(CellValue::Empty)),
            Ptg::Array { literal, .. } => {
                if literal.is_empty() {
                    stack.push(Operand::error(ErrorValue::Ref));
                } else {
                    let matrix: Matrix = (0..literal.rows as usize)
                        .map(|r| {
                            (0..literal.cols as usize)
                                .map(|c| literal.get(r, c).cloned().unwrap_or_default())
                                .collect()
                        })
                        .collect();
                    stack.push(Operand::Array(matrix));
                }
            }

            Ptg::Ref { loc, .. } => {
                stack.push(Operand::single_ref(ctx.sheet, Range::single(loc.cell())))
            }
            Ptg::Area { area, .. } => stack.push(Operand::single_ref(ctx.sheet, area.range())),
            Ptg::Ref3d { ixti, loc, .. } => {
                if resolver.sheet_exists(*ixti) {
                    stack.push(Operand::single_ref(*ixti, Range::single(loc.cell())));
                } else {
                    stack.push(Operand::error(ErrorValue::Ref));
                }
            }
            Ptg::Area3d { ixti, area, .. } => {
                if resolver.sheet_exists(*ixti) {
                    stack.push(Operand::single_ref(*ixti, area.range()));
                } else {
                    stack.push(Operand::error(ErrorValue::Ref));
                }
            }
            Ptg::RefErr { .. }
            | Ptg::AreaErr { .. }
            | Ptg::RefErr3d { .. }
            | Ptg::AreaErr3d { .. } => stack.push(Operand::error(ErrorValue::Ref)),
            Ptg::MemArea { ranges, .. } => {
                if ranges.is_empty() {
                    stack.push(Operand::error(ErrorValue::Ref));
                } else {
                    stack.push(Operand::Refs {
                        sheet: ctx.sheet,
                        areas: SmallVec::from_vec(ranges.clone()),
                    });
                }
            }
            Ptg::Name { iname, .. } => match resolver.name_definition(*iname) {
                Some(NameDefinition::Range(range)) => {
                    stack.push(Operand::single_ref(ctx.sheet, range))
                }
                Some(NameDefinition::Constant(value)) => stack.push(Operand::Scalar(value)),
                Some(NameDefinition::Missing) | None => {
                    stack.push(Operand::error(ErrorValue::Name))
                }
            },

            Ptg::Add | Ptg::Sub | Ptg::Mul | Ptg::Div | Ptg::Power => {
                let (a, b) = pop2(&mut stack, index)?;
                stack.push(numeric_binary(ptg, a, b, resolver, ctx)?);
            }
            Ptg::Concat => {
                let (a, b) = pop2(&mut stack, index)?;
                stack.push(concat(a, b, resolver, ctx)?);
            }
            Ptg::Lt | Ptg::Le | Ptg::Eq | Ptg::Ge | Ptg::Gt | Ptg::Ne => {
                let (a, b) = pop2(&mut stack, index)?;
                stack.push(compare(ptg, a, b, resolver, ctx)?);
            }
            Ptg::UnaryPlus => {
                let v = pop1(&mut stack, index)?;
                stack.push(unary_numeric(v, resolver, ctx, |n| n)?);
            }
            Ptg::UnaryMinus => {
                let v = pop1(&mut stack, index)?;
                stack.push(unary_numeric(v, resolver, ctx, |n| -n)?);
            }
            Ptg::Percent => {
                let v = pop1(&mut stack, index)?;
                stack.push(unary_numeric(v, resolver, ctx, |n| n / 100.0)?);
            }
            Ptg::Paren => {
                let v = pop1(&mut stack, index)?;
                stack.push(v);
            }
            Ptg::RangeOp => {
                let (a, b) = pop2(&mut stack, index)?;
                stack.push(range_join(a, b));
            }
            Ptg::Union => {
                let (a, b) = pop2(&mut stack, index)?;
                stack.push(range_union(a, b));
            }
            Ptg::Isect => {
                let (a, b) = pop2(&mut stack, index)?;
                stack.push(range_intersect(a, b));
            }

            Ptg::Attr(Attr::Sum) => {
                let v = pop1(&mut stack, index)?;
                stack.push(Operand::Scalar(apply_function(
                    iftab::SUM,
                    vec![v],
                    resolver,
                    ctx,
                )?));
            }
            // Jump hints / volatile markers / preserved whitespace.
            Ptg::Attr(_) => {}

            Ptg::Func { iftab, .. } => {
                let spec = ftab::function_spec_from_id(*iftab)
                    .ok_or(EvalError::FunctionNotSupported(*iftab))?;
                let args = pop_n(&mut stack, spec.min_args as usize, index)?;
                stack.push(Operand::Scalar(apply_function(*iftab, args, resolver, ctx)?));
            }
            Ptg::FuncVar { iftab, argc, .. } => {
                let args = pop_n(&mut stack, *argc as usize, index)?;
                stack.push(Operand::Scalar(apply_function(*iftab, args, resolver, ctx)?));
            }

            Ptg::Exp { .. } => return Err(EvalError::UnexpectedSharedPointer),
        }
    }

    match stack.len() {
        1 => Ok(stack.pop().expect("len checked")),
        // A non-singular final stack is the same corruption class as
        // underflow.
        _ => Err(EvalError::StackUnderflow {
            index: tokens.len(),
        }),
    }
}

fn pop1(stack: &mut SmallVec<[Operand; 8]>, index: usize) -> Result<Operand, EvalError> {
    stack.pop().ok_or(EvalError::StackUnderflow { index })
}

fn pop2(
    stack: &mut SmallVec<[Operand; 8]>,
    index: usize,
) -> Result<(Operand, Operand), EvalError> {
    let b = pop1(stack, index)?;
    let a = pop1(stack, index)?;
    Ok((a, b))
}

fn pop_n(
    stack: &mut SmallVec<[Operand; 8]>,
    n: usize,
    index: usize,
) -> Result<Vec<Operand>, EvalError> {
    if stack.len() < n {
        return Err(EvalError::StackUnderflow { index });
    }
    Ok(stack.drain(stack.len() - n..).collect())
}

/// Collapse an operand to a scalar, applying implicit intersection for
/// reference/array operands.
fn scalar_of<R: CellResolver>(
    operand: Operand,
    resolver: &R,
    ctx: &EvalContext,
) -> Result<CellValue, EvalError> {
    match operand {
        Operand::Scalar(v) => Ok(v),
        Operand::Refs { sheet, areas } => {
            if areas.len() != 1 {
                return Ok(CellValue::Error(ErrorValue::Value));
            }
            let area = areas[0];
            let cell = if area.is_single_cell() {
                area.start
            } else if area.cols() == 1
                && ctx.cell.row >= area.start.row
                && ctx.cell.row <= area.end.row
            {
                CellRef::new(ctx.cell.row, area.start.col)
            } else if area.rows() == 1
                && ctx.cell.col >= area.start.col
                && ctx.cell.col <= area.end.col
            {
                CellRef::new(area.start.row, ctx.cell.col)
            } else {
                return Ok(CellValue::Error(ErrorValue::Value));
            };
            resolver.cell_value(sheet, cell, ctx)
        }
        Operand::Array(matrix) => Ok(matrix
            .first()
            .and_then(|row| row.first())
            .cloned()
            .unwrap_or(CellValue::Error(ErrorValue::Value))),
    }
}

/// All values denoted by an operand, in range order. Used by variadic
/// functions; the `from_range` flag marks values that came from a
/// reference/array rather than a direct scalar argument.
fn values_of<R: CellResolver>(
    operand: &Operand,
    resolver: &R,
    ctx: &EvalContext,
) -> Result<Vec<(CellValue, bool)>, EvalError> {
    match operand {
        Operand::Scalar(v) => Ok(vec![(v.clone(), false)]),
        Operand::Refs { sheet, areas } => {
            let mut out = Vec::new();
            for area in areas {
                for cell in area.cells() {
                    out.push((resolver.cell_value(*sheet, cell, ctx)?, true));
                }
            }
            Ok(out)
        }
        Operand::Array(matrix) => Ok(matrix
            .iter()
            .flatten()
            .map(|v| (v.clone(), true))
            .collect()),
    }
}

/// Numeric coercion. Strings parse as numbers when possible; recognized
/// error-code strings short-circuit to the corresponding error.
fn to_number(value: &CellValue) -> Result<f64, ErrorValue> {
    match value {
        CellValue::Empty => Ok(0.0),
        CellValue::Number(n) => Ok(*n),
        CellValue::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        CellValue::Text(s) => {
            if let Some(e) = ErrorValue::from_str_opt(s.trim()) {
                return Err(e);
            }
            s.trim().parse::<f64>().map_err(|_| ErrorValue::Value)
        }
        CellValue::Error(e) => Err(*e),
    }
}

fn to_text(value: &CellValue) -> Result<String, ErrorValue> {
    match value {
        CellValue::Error(e) => Err(*e),
        CellValue::Number(n) => Ok(format_number(*n)),
        other => Ok(other.display()),
    }
}

/// Boolean coercion: zero is false, nonzero true.
fn to_bool(value: &CellValue) -> Result<bool, ErrorValue> {
    match value {
        CellValue::Boolean(b) => Ok(*b),
        CellValue::Empty => Ok(false),
        CellValue::Number(n) => Ok(*n != 0.0),
        CellValue::Text(s) => match s.trim().to_ascii_uppercase().as_str() {
            "TRUE" => Ok(true),
            "FALSE" => Ok(false),
            other => match ErrorValue::from_str_opt(other) {
                Some(e) => Err(e),
                None => Err(ErrorValue::Value),
            },
        },
        CellValue::Error(e) => Err(*e),
    }
}

macro_rules! try_value {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return Ok(Operand::error(e)),
        }
    };
}

fn numeric_binary<R: CellResolver>(
    op: &Ptg,
    a: Operand,
    b: Operand,
    resolver: &R,
    ctx: &EvalContext,
) -> Result<Operand, EvalError> {
    let lhs = try_value!(to_number(&scalar_of(a, resolver, ctx)?));
    let rhs = try_value!(to_number(&scalar_of(b, resolver, ctx)?));
    let out = match op {
        Ptg::Add => lhs + rhs,
        Ptg::Sub => lhs - rhs,
        Ptg::Mul => lhs * rhs,
        Ptg::Div => {
            if rhs == 0.0 {
                return Ok(Operand::error(ErrorValue::Div0));
            }
            lhs / rhs
        }
        Ptg::Power => lhs.powf(rhs),
        _ => unreachable!("numeric_binary called with non-numeric op"),
    };
    if out.is_nan() || out.is_infinite() {
        Ok(Operand::error(ErrorValue::Num))
    } else {
        Ok(Operand::Scalar(CellValue::Number(out)))
    }
}

fn unary_numeric<R: CellResolver>(
    v: Operand,
    resolver: &R,
    ctx: &EvalContext,
    f: impl Fn(f64) -> f64,
) -> Result<Operand, EvalError> {
    let n = try_value!(to_number(&scalar_of(v, resolver, ctx)?));
    Ok(Operand::Scalar(CellValue::Number(f(n))))
}

fn concat<R: CellResolver>(
    a: Operand,
    b: Operand,
    resolver: &R,
    ctx: &EvalContext,
) -> Result<Operand, EvalError> {
    let lhs = try_value!(to_text(&scalar_of(a, resolver, ctx)?));
    let rhs = try_value!(to_text(&scalar_of(b, resolver, ctx)?));
    Ok(Operand::Scalar(CellValue::Text(format!("{lhs}{rhs}"))))
}

fn compare<R: CellResolver>(
    op: &Ptg,
    a: Operand,
    b: Operand,
    resolver: &R,
    ctx: &EvalContext,
) -> Result<Operand, EvalError> {
    use std::cmp::Ordering;

    let lhs = scalar_of(a, resolver, ctx)?;
    let rhs = scalar_of(b, resolver, ctx)?;
    if let CellValue::Error(e) = lhs {
        return Ok(Operand::error(e));
    }
    if let CellValue::Error(e) = rhs {
        return Ok(Operand::error(e));
    }

    // Same-type comparisons compare values (strings case-insensitively);
    // mixed types order by type rank: numbers < text < booleans.
    fn rank(v: &CellValue) -> u8 {
        match v {
            CellValue::Empty | CellValue::Number(_) => 0,
            CellValue::Text(_) => 1,
            CellValue::Boolean(_) => 2,
            CellValue::Error(_) => 3,
        }
    }

    let ordering = match (&lhs, &rhs) {
        (CellValue::Text(a), CellValue::Text(b)) => a
            .to_ascii_lowercase()
            .cmp(&b.to_ascii_lowercase()),
        (CellValue::Boolean(a), CellValue::Boolean(b)) => a.cmp(b),
        (a, b) if rank(a) == 0 && rank(b) == 0 => {
            let (x, y) = match (to_number(a), to_number(b)) {
                (Ok(x), Ok(y)) => (x, y),
                _ => return Ok(Operand::error(ErrorValue::Value)),
            };
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (a, b) => rank(a).cmp(&rank(b)),
    };

    let result = match op {
        Ptg::Lt => ordering == Ordering::Less,
        Ptg::Le => ordering != Ordering::Greater,
        Ptg::Eq => ordering == Ordering::Equal,
        Ptg::Ge => ordering != Ordering::Less,
        Ptg::Gt => ordering == Ordering::Greater,
        Ptg::Ne => ordering != Ordering::Equal,
        _ => unreachable!("compare called with non-comparison op"),
    };
    Ok(Operand::Scalar(CellValue::Boolean(result)))
}

fn range_join(a: Operand, b: Operand) -> Operand {
    match (a, b) {
        (
            Operand::Refs {
                sheet: sa,
                areas: aa,
            },
            Operand::Refs {
                sheet: sb,
                areas: ab,
            },
        ) if sa == sb && aa.len() == 1 && ab.len() == 1 => {
            let bounding = Range::new(
                CellRef::new(
                    aa[0].start.row.min(ab[0].start.row),
                    aa[0].start.col.min(ab[0].start.col),
                ),
                CellRef::new(
                    aa[0].end.row.max(ab[0].end.row),
                    aa[0].end.col.max(ab[0].end.col),
                ),
            );
            Operand::single_ref(sa, bounding)
        }
        _ => Operand::error(ErrorValue::Value),
    }
}

fn range_union(a: Operand, b: Operand) -> Operand {
    match (a, b) {
        (
            Operand::Refs {
                sheet: sa,
                areas: mut aa,
            },
            Operand::Refs {
                sheet: sb,
                areas: ab,
            },
        ) if sa == sb => {
            aa.extend(ab);
            Operand::Refs {
                sheet: sa,
                areas: aa,
            }
        }
        _ => Operand::error(ErrorValue::Value),
    }
}

fn range_intersect(a: Operand, b: Operand) -> Operand {
    match (a, b) {
        (
            Operand::Refs {
                sheet: sa,
                areas: aa,
            },
            Operand::Refs {
                sheet: sb,
                areas: ab,
            },
        ) if sa == sb => {
            let mut out: SmallVec<[Range; 1]> = SmallVec::new();
            for x in &aa {
                for y in &ab {
                    if x.intersects(*y) {
                        out.push(Range::new(
                            CellRef::new(
                                x.start.row.max(y.start.row),
                                x.start.col.max(y.start.col),
                            ),
                            CellRef::new(x.end.row.min(y.end.row), x.end.col.min(y.end.col)),
                        ));
                    }
                }
            }
            if out.is_empty() {
                Operand::error(ErrorValue::Null)
            } else {
                Operand::Refs {
                    sheet: sa,
                    areas: out,
                }
            }
        }
        _ => Operand::error(ErrorValue::Value),
    }
}

macro_rules! try_scalar {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return Ok(CellValue::Error(e)),
        }
    };
}

/// Apply a built-in function to its popped arguments.
fn apply_function<R: CellResolver>(
    id: u16,
    args: Vec<Operand>,
    resolver: &R,
    ctx: &EvalContext,
) -> Result<CellValue, EvalError> {
    // Numeric fold over direct scalars + the numeric cells of ranges.
    // Errors anywhere propagate; text/bool/empty cells inside ranges are
    // skipped, direct scalar arguments are coerced.
    let numeric_args = |args: &[Operand]| -> Result<Result<Vec<f64>, ErrorValue>, EvalError> {
        let mut out = Vec::new();
        for op in args {
            for (value, from_range) in values_of(op, resolver, ctx)? {
                match (&value, from_range) {
                    (CellValue::Error(e), _) => return Ok(Err(*e)),
                    (CellValue::Number(n), true) => out.push(*n),
                    (_, true) => {}
                    (CellValue::Empty, false) => {}
                    (v, false) => match to_number(v) {
                        Ok(n) => out.push(n),
                        Err(e) => return Ok(Err(e)),
                    },
                }
            }
        }
        Ok(Ok(out))
    };

    let scalar_arg = |args: &[Operand], i: usize| -> Result<CellValue, EvalError> {
        match args.get(i) {
            Some(op) => scalar_of(op.clone(), resolver, ctx),
            None => Ok(CellValue::Empty),
        }
    };

    match id {
        iftab::SUM => {
            let nums = try_scalar!(numeric_args(&args)?);
            Ok(CellValue::Number(nums.iter().sum()))
        }
        iftab::PRODUCT => {
            let nums = try_scalar!(numeric_args(&args)?);
            Ok(CellValue::Number(nums.iter().product()))
        }
        iftab::AVERAGE => {
            let nums = try_scalar!(numeric_args(&args)?);
            if nums.is_empty() {
                Ok(CellValue::Error(ErrorValue::Div0))
            } else {
                Ok(CellValue::Number(nums.iter().sum::<f64>() / nums.len() as f64))
            }
        }
        iftab::MIN | iftab::MAX => {
            let nums = try_scalar!(numeric_args(&args)?);
            let folded = if id == iftab::MIN {
                nums.iter().cloned().fold(f64::INFINITY, f64::min)
            } else {
                nums.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            };
            Ok(CellValue::Number(if nums.is_empty() { 0.0 } else { folded }))
        }
        iftab::COUNT => {
            let nums = try_scalar!(numeric_args(&args)?);
            Ok(CellValue::Number(nums.len() as f64))
        }
        iftab::COUNTA => {
            let mut count = 0usize;
            for op in &args {
                for (value, _) in values_of(op, resolver, ctx)? {
                    if !value.is_empty() {
                        count += 1;
                    }
                }
            }
            Ok(CellValue::Number(count as f64))
        }

        iftab::IF => {
            let cond = try_scalar!(to_bool(&scalar_arg(&args, 0)?));
            if cond {
                scalar_arg(&args, 1)
            } else if args.len() > 2 {
                scalar_arg(&args, 2)
            } else {
                Ok(CellValue::Boolean(false))
            }
        }
        iftab::AND | iftab::OR => {
            let mut acc: Option<bool> = None;
            for op in &args {
                for (value, from_range) in values_of(op, resolver, ctx)? {
                    if from_range && matches!(value, CellValue::Empty | CellValue::Text(_)) {
                        continue;
                    }
                    if value.is_empty() {
                        continue;
                    }
                    let b = try_scalar!(to_bool(&value));
                    acc = Some(match (acc, id == iftab::AND) {
                        (None, _) => b,
                        (Some(prev), true) => prev && b,
                        (Some(prev), false) => prev || b,
                    });
                }
            }
            match acc {
                Some(b) => Ok(CellValue::Boolean(b)),
                None => Ok(CellValue::Error(ErrorValue::Value)),
            }
        }
        iftab::NOT => {
            let b = try_scalar!(to_bool(&scalar_arg(&args, 0)?));
            Ok(CellValue::Boolean(!b))
        }
        iftab::TRUE => Ok(CellValue::Boolean(true)),
        iftab::FALSE => Ok(CellValue::Boolean(false)),

        iftab::ISNA => Ok(CellValue::Boolean(matches!(
            scalar_arg(&args, 0)?,
            CellValue::Error(ErrorValue::NA)
        ))),
        iftab::ISERROR => Ok(CellValue::Boolean(scalar_arg(&args, 0)?.is_error())),
        iftab::ISBLANK => Ok(CellValue::Boolean(scalar_arg(&args, 0)?.is_empty())),
        iftab::ISTEXT => Ok(CellValue::Boolean(matches!(
            scalar_arg(&args, 0)?,
            CellValue::Text(_)
        ))),
        iftab::ISNUMBER => Ok(CellValue::Boolean(matches!(
            scalar_arg(&args, 0)?,
            CellValue::Number(_)
        ))),

        iftab::NA => Ok(CellValue::Error(ErrorValue::NA)),
        iftab::PI => Ok(CellValue::Number(std::f64::consts::PI)),
        iftab::ABS | iftab::INT | iftab::SIGN | iftab::SQRT | iftab::EXP | iftab::LN
        | iftab::LOG10 => {
            let n = try_scalar!(to_number(&scalar_arg(&args, 0)?));
            let out = match id {
                iftab::ABS => n.abs(),
                iftab::INT => n.floor(),
                iftab::SIGN => {
                    if n > 0.0 {
                        1.0
                    } else if n < 0.0 {
                        -1.0
                    } else {
                        0.0
                    }
                }
                iftab::SQRT => {
                    if n < 0.0 {
                        return Ok(CellValue::Error(ErrorValue::Num));
                    }
                    n.sqrt()
                }
                iftab::EXP => n.exp(),
                iftab::LN | iftab::LOG10 => {
                    if n <= 0.0 {
                        return Ok(CellValue::Error(ErrorValue::Num));
                    }
                    if id == iftab::LN {
                        n.ln()
                    } else {
                        n.log10()
                    }
                }
                _ => unreachable!(),
            };
            if out.is_finite() {
                Ok(CellValue::Number(out))
            } else {
                Ok(CellValue::Error(ErrorValue::Num))
            }
        }
        iftab::MOD => {
            let a = try_scalar!(to_number(&scalar_arg(&args, 0)?));
            let b = try_scalar!(to_number(&scalar_arg(&args, 1)?));
            if b == 0.0 {
                return Ok(CellValue::Error(ErrorValue::Div0));
            }
            // Result sign follows the divisor.
            Ok(CellValue::Number(a - b * (a / b).floor()))
        }
        iftab::POWER => {
            let a = try_scalar!(to_number(&scalar_arg(&args, 0)?));
            let b = try_scalar!(to_number(&scalar_arg(&args, 1)?));
            let out = a.powf(b);
            if out.is_finite() {
                Ok(CellValue::Number(out))
            } else {
                Ok(CellValue::Error(ErrorValue::Num))
            }
        }
        iftab::ROUND | iftab::ROUNDUP | iftab::ROUNDDOWN => {
            let n = try_scalar!(to_number(&scalar_arg(&args, 0)?));
            let digits = try_scalar!(to_number(&scalar_arg(&args, 1)?)) as i32;
            let factor = 10f64.powi(digits);
            let scaled = n * factor;
            let rounded = match id {
                iftab::ROUND => scaled.abs().round() * scaled.signum(),
                iftab::ROUNDUP => scaled.abs().ceil() * scaled.signum(),
                iftab::ROUNDDOWN => scaled.abs().floor() * scaled.signum(),
                _ => unreachable!(),
            };
            Ok(CellValue::Number(rounded / factor))
        }

        iftab::ROW | iftab::COLUMN => {
            let coord = match args.first() {
                None => {
                    if id == iftab::ROW {
                        ctx.cell.row
                    } else {
                        ctx.cell.col
                    }
                }
                Some(Operand::Refs { areas, .. }) if !areas.is_empty() => {
                    if id == iftab::ROW {
                        areas[0].start.row
                    } else {
                        areas[0].start.col
                    }
                }
                Some(_) => return Ok(CellValue::Error(ErrorValue::Value)),
            };
            Ok(CellValue::Number((coord + 1) as f64))
        }
        iftab::CHOOSE => {
            let k = try_scalar!(to_number(&scalar_arg(&args, 0)?)) as i64;
            if k < 1 || k as usize >= args.len() {
                return Ok(CellValue::Error(ErrorValue::Value));
            }
            scalar_arg(&args, k as usize)
        }

        iftab::LEN => {
            let s = try_scalar!(to_text(&scalar_arg(&args, 0)?));
            Ok(CellValue::Number(s.chars().count() as f64))
        }
        iftab::VALUE => {
            let s = try_scalar!(to_text(&scalar_arg(&args, 0)?));
            match s.trim().parse::<f64>() {
                Ok(n) => Ok(CellValue::Number(n)),
                Err(_) => Ok(CellValue::Error(ErrorValue::Value)),
            }
        }
        iftab::LOWER | iftab::UPPER | iftab::TRIM => {
            let s = try_scalar!(to_text(&scalar_arg(&args, 0)?));
            let out = match id {
                iftab::LOWER => s.to_lowercase(),
                iftab::UPPER => s.to_uppercase(),
                iftab::TRIM => s.split_whitespace().collect::<Vec<_>>().join(" "),
                _ => unreachable!(),
            };
            Ok(CellValue::Text(out))
        }
        iftab::LEFT | iftab::RIGHT => {
            let s = try_scalar!(to_text(&scalar_arg(&args, 0)?));
            let count = if args.len() > 1 {
                let n = try_scalar!(to_number(&scalar_arg(&args, 1)?));
                if n < 0.0 {
                    return Ok(CellValue::Error(ErrorValue::Value));
                }
                n as usize
            } else {
                1
            };
            let chars: Vec<char> = s.chars().collect();
            let taken = count.min(chars.len());
            let out: String = if id == iftab::LEFT {
                chars[..taken].iter().collect()
            } else {
                chars[chars.len() - taken..].iter().collect()
            };
            Ok(CellValue::Text(out))
        }
        iftab::MID => {
            let s = try_scalar!(to_text(&scalar_arg(&args, 0)?));
            let start = try_scalar!(to_number(&scalar_arg(&args, 1)?));
            let len = try_scalar!(to_number(&scalar_arg(&args, 2)?));
            if start < 1.0 || len < 0.0 {
                return Ok(CellValue::Error(ErrorValue::Value));
            }
            let out: String = s
                .chars()
                .skip(start as usize - 1)
                .take(len as usize)
                .collect();
            Ok(CellValue::Text(out))
        }
        iftab::CONCATENATE => {
            let mut out = String::new();
            for i in 0..args.len() {
                out.push_str(&try_scalar!(to_text(&scalar_arg(&args, i)?)));
            }
            Ok(CellValue::Text(out))
        }

        other => Err(EvalError::FunctionNotSupported(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap;
    use gridcalc_biff::{AreaLoc, PtgClass, RefLoc};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FixedCells {
        cells: AHashMap<(SheetId, CellRef), CellValue>,
        names: AHashMap<u16, NameDefinition>,
    }

    impl FixedCells {
        fn with(values: &[(&str, CellValue)]) -> Self {
            let mut out = Self::default();
            for (a1, v) in values {
                out.cells
                    .insert((0, CellRef::from_a1(a1).unwrap()), v.clone());
            }
            out
        }
    }

    impl CellResolver for FixedCells {
        fn sheet_exists(&self, sheet: SheetId) -> bool {
            sheet == 0
        }

        fn cell_value(
            &self,
            sheet: SheetId,
            cell: CellRef,
            _ctx: &EvalContext,
        ) -> Result<CellValue, EvalError> {
            Ok(self
                .cells
                .get(&(sheet, cell))
                .cloned()
                .unwrap_or_default())
        }

        fn name_definition(&self, iname: u16) -> Option<NameDefinition> {
            self.names.get(&iname).cloned()
        }
    }

    fn ctx_at(a1: &str) -> EvalContext {
        EvalContext::new(0, CellRef::from_a1(a1).unwrap())
    }

    fn vref(a1: &str) -> Ptg {
        Ptg::Ref {
            class: PtgClass::Value,
            loc: RefLoc::relative(CellRef::from_a1(a1).unwrap()),
        }
    }

    fn varea(a1: &str) -> Ptg {
        let range = Range::from_a1(a1).unwrap();
        Ptg::Area {
            class: PtgClass::Reference,
            area: AreaLoc::new(RefLoc::relative(range.start), RefLoc::relative(range.end)),
        }
    }

    fn sum_var(argc: u8) -> Ptg {
        Ptg::FuncVar {
            class: PtgClass::Value,
            iftab: iftab::SUM,
            argc,
        }
    }

    #[test]
    fn arithmetic_with_coercion() {
        let cells = FixedCells::with(&[
            ("A1", CellValue::Text("3".into())),
            ("B1", CellValue::Number(4.0)),
        ]);
        let tokens = vec![vref("A1"), vref("B1"), Ptg::Add];
        let out = evaluate(&tokens, &cells, &ctx_at("C1")).unwrap();
        assert_eq!(out, CellValue::Number(7.0));
    }

    #[test]
    fn errors_flow_through_operators() {
        let cells = FixedCells::with(&[("A1", CellValue::Error(ErrorValue::Ref))]);
        let tokens = vec![vref("A1"), Ptg::Int(1), Ptg::Add];
        let out = evaluate(&tokens, &cells, &ctx_at("C1")).unwrap();
        assert_eq!(out, CellValue::Error(ErrorValue::Ref));
    }

    #[test]
    fn division_by_zero_is_a_value_not_a_failure() {
        let cells = FixedCells::default();
        let tokens = vec![Ptg::Int(1), Ptg::Int(0), Ptg::Div];
        let out = evaluate(&tokens, &cells, &ctx_at("A1")).unwrap();
        assert_eq!(out, CellValue::Error(ErrorValue::Div0));
    }

    #[test]
    fn sum_over_range_skips_text_cells() {
        let cells = FixedCells::with(&[
            ("A1", CellValue::Number(1.0)),
            ("A2", CellValue::Text("noise".into())),
            ("A3", CellValue::Number(2.0)),
        ]);
        let tokens = vec![varea("A1:A3"), sum_var(1)];
        let out = evaluate(&tokens, &cells, &ctx_at("C1")).unwrap();
        assert_eq!(out, CellValue::Number(3.0));
    }

    #[test]
    fn union_operand_feeds_function_as_multiple_areas() {
        let cells = FixedCells::with(&[
            ("A1", CellValue::Number(1.0)),
            ("C1", CellValue::Number(10.0)),
        ]);
        let tokens = vec![varea("A1"), varea("C1"), Ptg::Union, sum_var(1)];
        let out = evaluate(&tokens, &cells, &ctx_at("E1")).unwrap();
        assert_eq!(out, CellValue::Number(11.0));
    }

    #[test]
    fn intersection_of_disjoint_ranges_is_null_error() {
        let cells = FixedCells::default();
        let tokens = vec![varea("A1:A3"), varea("C1:C3"), Ptg::Isect];
        let out = evaluate(&tokens, &cells, &ctx_at("E1")).unwrap();
        assert_eq!(out, CellValue::Error(ErrorValue::Null));
    }

    #[test]
    fn implicit_intersection_picks_the_row_aligned_cell() {
        let cells = FixedCells::with(&[
            ("A1", CellValue::Number(10.0)),
            ("A2", CellValue::Number(20.0)),
            ("A3", CellValue::Number(30.0)),
        ]);
        // =A1:A3*2 evaluated in row 2 picks A2.
        let tokens = vec![varea("A1:A3"), Ptg::Int(2), Ptg::Mul];
        let out = evaluate(&tokens, &cells, &ctx_at("C2")).unwrap();
        assert_eq!(out, CellValue::Number(40.0));
        // Outside the range's rows, scalar context fails.
        let out = evaluate(&tokens, &cells, &ctx_at("C9")).unwrap();
        assert_eq!(out, CellValue::Error(ErrorValue::Value));
    }

    #[test]
    fn if_and_comparisons() {
        let cells = FixedCells::with(&[("A1", CellValue::Number(5.0))]);
        // IF(A1>0, "pos", "neg")
        let tokens = vec![
            vref("A1"),
            Ptg::Int(0),
            Ptg::Gt,
            Ptg::Str("pos".into()),
            Ptg::Str("neg".into()),
            Ptg::FuncVar {
                class: PtgClass::Value,
                iftab: iftab::IF,
                argc: 3,
            },
        ];
        let out = evaluate(&tokens, &cells, &ctx_at("B1")).unwrap();
        assert_eq!(out, CellValue::Text("pos".into()));
    }

    #[test]
    fn concat_uses_canonical_number_text() {
        let cells = FixedCells::default();
        let tokens = vec![Ptg::Num(2.0), Ptg::Str(" apples".into()), Ptg::Concat];
        let out = evaluate(&tokens, &cells, &ctx_at("A1")).unwrap();
        assert_eq!(out, CellValue::Text("2 apples".into()));
    }

    #[test]
    fn percent_and_unary_minus() {
        let cells = FixedCells::default();
        let tokens = vec![Ptg::Int(50), Ptg::Percent, Ptg::UnaryMinus];
        let out = evaluate(&tokens, &cells, &ctx_at("A1")).unwrap();
        assert_eq!(out, CellValue::Number(-0.5));
    }

    #[test]
    fn unknown_function_is_a_hard_error() {
        let cells = FixedCells::default();
        let tokens = vec![
            Ptg::Int(1),
            Ptg::FuncVar {
                class: PtgClass::Value,
                iftab: 499,
                argc: 1,
            },
        ];
        assert_eq!(
            evaluate(&tokens, &cells, &ctx_at("A1")),
            Err(EvalError::FunctionNotSupported(499))
        );
    }

    #[test]
    fn stack_underflow_is_a_hard_error() {
        let cells = FixedCells::default();
        let tokens = vec![Ptg::Add];
        assert_eq!(
            evaluate(&tokens, &cells, &ctx_at("A1")),
            Err(EvalError::StackUnderflow { index: 0 })
        );
    }

    #[test]
    fn name_tokens_resolve_through_the_resolver() {
        let mut cells = FixedCells::with(&[("A1", CellValue::Number(2.0))]);
        cells
            .names
            .insert(1, NameDefinition::Range(Range::from_a1("A1").unwrap()));
        cells.names.insert(2, NameDefinition::Missing);

        let tokens = vec![Ptg::Name {
            class: PtgClass::Value,
            iname: 1,
        }];
        assert_eq!(
            evaluate(&tokens, &cells, &ctx_at("B1")).unwrap(),
            CellValue::Number(2.0)
        );
        let tokens = vec![Ptg::Name {
            class: PtgClass::Value,
            iname: 2,
        }];
        assert_eq!(
            evaluate(&tokens, &cells, &ctx_at("B1")).unwrap(),
            CellValue::Error(ErrorValue::Name)
        );
    }

    #[test]
    fn matrix_evaluation_of_a_range_operand() {
        let cells = FixedCells::with(&[
            ("A1", CellValue::Number(1.0)),
            ("A2", CellValue::Number(2.0)),
            ("B1", CellValue::Number(3.0)),
            ("B2", CellValue::Number(4.0)),
        ]);
        let tokens = vec![varea("A1:B2")];
        let out = evaluate_matrix(
            &tokens,
            &cells,
            &ctx_at("D1"),
            Range::from_a1("D1:E2").unwrap(),
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                vec![CellValue::Number(1.0), CellValue::Number(3.0)],
                vec![CellValue::Number(2.0), CellValue::Number(4.0)],
            ]
        );
    }

    #[test]
    fn matrix_evaluation_broadcasts_scalar_expressions_per_cell() {
        let cells = FixedCells::with(&[
            ("A1", CellValue::Number(1.0)),
            ("A2", CellValue::Number(2.0)),
            ("A3", CellValue::Number(3.0)),
        ]);
        // {=A1:A3*10} bound to C1:C3.
        let tokens = vec![varea("A1:A3"), Ptg::Int(10), Ptg::Mul];
        let out = evaluate_matrix(
            &tokens,
            &cells,
            &ctx_at("C1"),
            Range::from_a1("C1:C3").unwrap(),
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                vec![CellValue::Number(10.0)],
                vec![CellValue::Number(20.0)],
                vec![CellValue::Number(30.0)],
            ]
        );
    }

    #[test]
    fn text_functions() {
        let cells = FixedCells::default();
        let tokens = vec![
            Ptg::Str("  hello   world ".into()),
            Ptg::Func {
                class: PtgClass::Value,
                iftab: iftab::TRIM,
            },
            Ptg::Func {
                class: PtgClass::Value,
                iftab: iftab::UPPER,
            },
        ];
        assert_eq!(
            evaluate(&tokens, &cells, &ctx_at("A1")).unwrap(),
            CellValue::Text("HELLO WORLD".into())
        );
    }

    #[test]
    fn mod_sign_follows_divisor() {
        let cells = FixedCells::default();
        let tokens = vec![
            Ptg::Num(-3.0),
            Ptg::Num(2.0),
            Ptg::Func {
                class: PtgClass::Value,
                iftab: iftab::MOD,
            },
        ];
        assert_eq!(
            evaluate(&tokens, &cells, &ctx_at("A1")).unwrap(),
            CellValue::Number(1.0)
        );
    }
}
