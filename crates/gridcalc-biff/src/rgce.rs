//! rgce (tokenized expression) codec: byte stream <-> ordered token
//! sequences, stack-discipline validation, and formula-text rendering.
//!
//! Token order is semantically significant: it is the postfix/RPN order the
//! stack evaluator consumes, not tree order. Array literals and area markers
//! place their bulk data in a trailing `rgcb` region that follows the
//! declared `cce` bytes and is not counted in `cce`; parsing therefore runs
//! a primary scan over `cce` bytes and a second pass that lets each token
//! consume its share of the trailing region.

use gridcalc_model::Range;

use crate::ftab;
use crate::ptg::{array_literal_text, Attr, Ptg, PtgDecodeError};

/// Errors for rgce parsing/validation. Truncation of the **primary** token
/// stream is fatal; trailing-payload damage is recovered (see
/// [`ParsedRgce::warnings`]).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RgceError {
    #[error("declared rgce length {cce} exceeds available bytes {available}")]
    DeclaredLengthOverrun { cce: usize, available: usize },
    #[error("token at offset {offset} overruns the declared rgce length")]
    TokenOverrun { offset: usize },
    #[error(transparent)]
    Decode(#[from] PtgDecodeError),
    #[error("operand stack underflow at token {index}")]
    StackUnderflow { index: usize },
    #[error("expression leaves {depth} operands on the stack (expected 1)")]
    UnbalancedStack { depth: usize },
    #[error("function id {0} is not in the function table")]
    UnknownFunction(u16),
}

/// Result of parsing an rgce + trailing rgcb region.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRgce {
    pub tokens: Vec<Ptg>,
    /// Non-fatal trailing-payload problems (logged and recovered).
    pub warnings: Vec<String>,
    /// Bytes consumed from the trailing region (after `cce`).
    pub rgcb_len: usize,
}

/// Parse `cce` bytes of rgce from the front of `data`; bytes after `cce`
/// are the trailing rgcb region.
pub fn parse_rgce(data: &[u8], cce: usize) -> Result<ParsedRgce, RgceError> {
    if cce > data.len() {
        return Err(RgceError::DeclaredLengthOverrun {
            cce,
            available: data.len(),
        });
    }

    // Primary scan: decode tokens in order until exactly `cce` bytes are
    // consumed.
    let mut tokens = Vec::new();
    let mut cursor = 0usize;
    while cursor < cce {
        let (ptg, consumed) = Ptg::decode(data, cursor)?;
        if cursor + consumed > cce {
            return Err(RgceError::TokenOverrun { offset: cursor });
        }
        cursor += consumed;
        tokens.push(ptg);
    }

    // Second pass: walk tokens in order and let every trailing-data token
    // consume its share of the region after `cce`. A malformed or truncated
    // share is non-fatal: the token keeps an empty literal and parsing
    // continues with the remaining tokens.
    let mut warnings = Vec::new();
    let mut extra_cursor = cce;
    for (index, ptg) in tokens.iter_mut().enumerate() {
        if !ptg.has_rgcb() {
            continue;
        }
        if let Err(err) = ptg.read_rgcb(data, &mut extra_cursor) {
            let warning =
                format!("token {index}: malformed trailing payload ({err}); using empty literal");
            log::warn!("{warning}");
            warnings.push(warning);
        }
    }

    Ok(ParsedRgce {
        tokens,
        warnings,
        rgcb_len: extra_cursor - cce,
    })
}

/// An encoded expression: primary stream plus the trailing payload that
/// writers append after the declared-length region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedRgce {
    pub rgce: Vec<u8>,
    pub rgcb: Vec<u8>,
}

impl EncodedRgce {
    pub fn cce(&self) -> u16 {
        self.rgce.len() as u16
    }
}

/// Serialize tokens; the rgcb is rebuilt from scratch in token order.
pub fn encode_rgce(tokens: &[Ptg]) -> EncodedRgce {
    let mut out = EncodedRgce::default();
    for ptg in tokens {
        ptg.encode(&mut out.rgce);
    }
    for ptg in tokens {
        ptg.write_rgcb(&mut out.rgcb);
    }
    out
}

/// Simulate operand counts over the token sequence.
///
/// Underflow or a non-singular final stack indicates a corrupt expression
/// and is a hard error, not a user-visible formula error.
pub fn check_stack_discipline(tokens: &[Ptg]) -> Result<(), RgceError> {
    // A lone shared-formula pointer stands for a whole expression.
    if let [Ptg::Exp { .. }] = tokens {
        return Ok(());
    }
    let mut depth = 0usize;
    for (index, ptg) in tokens.iter().enumerate() {
        let (pops, pushes) = match ptg.stack_effect() {
            Some(effect) => effect,
            None => {
                let iftab = match ptg {
                    Ptg::Func { iftab, .. } => *iftab,
                    _ => unreachable!("only fixed-arity functions lack a static stack effect"),
                };
                return Err(RgceError::UnknownFunction(iftab));
            }
        };
        if depth < pops {
            return Err(RgceError::StackUnderflow { index });
        }
        depth = depth - pops + pushes;
    }
    if depth != 1 {
        return Err(RgceError::UnbalancedStack { depth });
    }
    Ok(())
}

/// All ranges denoted by reference tokens in the expression.
pub fn referenced_ranges(tokens: &[Ptg]) -> Vec<Range> {
    tokens
        .iter()
        .flat_map(|t| t.referenced_ranges())
        .collect()
}

/// Context for rendering tokens to formula text.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderContext<'a> {
    /// Workbook name table for `PtgName` lookups; placeholder names are
    /// emitted when absent.
    pub names: Option<&'a gridcalc_model::NameTable>,
    /// Sheet names indexed by `ixti` for 3-D references.
    pub sheet_names: &'a [String],
}

impl RenderContext<'_> {
    fn name_text(&self, iname: u16) -> String {
        match self.names.and_then(|t| t.get(iname)) {
            Some(def) => def.name.clone(),
            None => format!("Name{iname}"),
        }
    }

    fn sheet_prefix(&self, ixti: u16) -> String {
        match self.sheet_names.get(ixti as usize) {
            Some(name) if name.contains(' ') => format!("'{name}'!"),
            Some(name) => format!("{name}!"),
            None => format!("Sheet{}!", ixti + 1),
        }
    }
}

// Binding strength for parenthesization when lowering RPN to infix.
const PREC_COMPARE: u8 = 1;
const PREC_CONCAT: u8 = 2;
const PREC_ADD: u8 = 3;
const PREC_MUL: u8 = 4;
const PREC_POWER: u8 = 5;
const PREC_UNARY: u8 = 6;
const PREC_PERCENT: u8 = 7;
const PREC_REF_OP: u8 = 8;
const PREC_OPERAND: u8 = 10;

struct Rendered {
    text: String,
    prec: u8,
}

impl Rendered {
    fn operand(text: String) -> Self {
        Self {
            text,
            prec: PREC_OPERAND,
        }
    }
}

/// Render a postfix token sequence to human-readable formula text (no
/// leading `=`).
pub fn render_text(tokens: &[Ptg], ctx: &RenderContext<'_>) -> Result<String, RgceError> {
    let mut stack: Vec<Rendered> = Vec::new();

    let binary = |stack: &mut Vec<Rendered>,
                  index: usize,
                  op: &str,
                  prec: u8,
                  chain_sensitive: bool|
     -> Result<(), RgceError> {
        let right = stack.pop().ok_or(RgceError::StackUnderflow { index })?;
        let left = stack.pop().ok_or(RgceError::StackUnderflow { index })?;
        let lhs = if left.prec < prec {
            format!("({})", left.text)
        } else {
            left.text
        };
        let rhs = if right.prec < prec || (right.prec == prec && chain_sensitive) {
            format!("({})", right.text)
        } else {
            right.text
        };
        stack.push(Rendered {
            text: format!("{lhs}{op}{rhs}"),
            prec,
        });
        Ok(())
    };

    for (index, ptg) in tokens.iter().enumerate() {
        match ptg {
            Ptg::Add => binary(&mut stack, index, "+", PREC_ADD, false)?,
            Ptg::Sub => binary(&mut stack, index, "-", PREC_ADD, true)?,
            Ptg::Mul => binary(&mut stack, index, "*", PREC_MUL, false)?,
            Ptg::Div => binary(&mut stack, index, "/", PREC_MUL, true)?,
            Ptg::Power => binary(&mut stack, index, "^", PREC_POWER, true)?,
            Ptg::Concat => binary(&mut stack, index, "&", PREC_CONCAT, false)?,
            Ptg::Lt => binary(&mut stack, index, "<", PREC_COMPARE, true)?,
            Ptg::Le => binary(&mut stack, index, "<=", PREC_COMPARE, true)?,
            Ptg::Eq => binary(&mut stack, index, "=", PREC_COMPARE, true)?,
            Ptg::Ge => binary(&mut stack, index, ">=", PREC_COMPARE, true)?,
            Ptg::Gt => binary(&mut stack, index, ">", PREC_COMPARE, true)?,
            Ptg::Ne => binary(&mut stack, index, "<>", PREC_COMPARE, true)?,
            Ptg::RangeOp => binary(&mut stack, index, ":", PREC_REF_OP, false)?,
            Ptg::Isect => binary(&mut stack, index, " ", PREC_REF_OP, false)?,
            Ptg::Union => binary(&mut stack, index, ",", PREC_REF_OP, false)?,
            Ptg::UnaryPlus | Ptg::UnaryMinus => {
                let sign = if matches!(ptg, Ptg::UnaryMinus) { "-" } else { "+" };
                let v = stack.pop().ok_or(RgceError::StackUnderflow { index })?;
                let inner = if v.prec < PREC_UNARY {
                    format!("({})", v.text)
                } else {
                    v.text
                };
                stack.push(Rendered {
                    text: format!("{sign}{inner}"),
                    prec: PREC_UNARY,
                });
            }
            Ptg::Percent => {
                let v = stack.pop().ok_or(RgceError::StackUnderflow { index })?;
                let inner = if v.prec < PREC_PERCENT {
                    format!("({})", v.text)
                } else {
                    v.text
                };
                stack.push(Rendered {
                    text: format!("{inner}%"),
                    prec: PREC_PERCENT,
                });
            }
            Ptg::Paren => {
                let v = stack.pop().ok_or(RgceError::StackUnderflow { index })?;
                stack.push(Rendered::operand(format!("({})", v.text)));
            }
            Ptg::MissingArg => stack.push(Rendered::operand(String::new())),
            Ptg::Str(s) => {
                stack.push(Rendered::operand(format!("\"{}\"", s.replace('"', "\"\""))))
            }
            Ptg::Err(e) => stack.push(Rendered::operand(e.as_str().to_string())),
            Ptg::Bool(b) => {
                stack.push(Rendered::operand(if *b { "TRUE" } else { "FALSE" }.to_string()))
            }
            Ptg::Int(n) => stack.push(Rendered::operand(n.to_string())),
            Ptg::Num(n) => stack.push(Rendered::operand(gridcalc_model::format_number(*n))),
            Ptg::Array { literal, .. } => {
                stack.push(Rendered::operand(array_literal_text(literal)))
            }
            Ptg::Attr(Attr::Sum) => {
                let v = stack.pop().ok_or(RgceError::StackUnderflow { index })?;
                stack.push(Rendered::operand(format!("SUM({})", v.text)));
            }
            // Jump hints and preserved whitespace have no textual effect.
            Ptg::Attr(_) => {}
            Ptg::Func { iftab, .. } => {
                let spec =
                    ftab::function_spec_from_id(*iftab).ok_or(RgceError::UnknownFunction(*iftab))?;
                let argc = spec.min_args as usize;
                if stack.len() < argc {
                    return Err(RgceError::StackUnderflow { index });
                }
                let args: Vec<String> =
                    stack.drain(stack.len() - argc..).map(|r| r.text).collect();
                stack.push(Rendered::operand(format!(
                    "{}({})",
                    spec.name,
                    args.join(",")
                )));
            }
            Ptg::FuncVar { iftab, argc, .. } => {
                let name = ftab::function_name_from_id(*iftab)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("FUNC.{iftab}"));
                let argc = *argc as usize;
                if stack.len() < argc {
                    return Err(RgceError::StackUnderflow { index });
                }
                let args: Vec<String> =
                    stack.drain(stack.len() - argc..).map(|r| r.text).collect();
                stack.push(Rendered::operand(format!("{name}({})", args.join(","))));
            }
            Ptg::Name { iname, .. } => stack.push(Rendered::operand(ctx.name_text(*iname))),
            Ptg::Ref { loc, .. } => stack.push(Rendered::operand(loc.to_a1())),
            Ptg::Area { area, .. } => stack.push(Rendered::operand(area.to_a1())),
            Ptg::MemArea { ranges, .. } => {
                let text = if ranges.is_empty() {
                    gridcalc_model::ErrorValue::Ref.as_str().to_string()
                } else {
                    ranges
                        .iter()
                        .map(Range::to_a1)
                        .collect::<Vec<_>>()
                        .join(",")
                };
                stack.push(Rendered::operand(text));
            }
            Ptg::RefErr { .. } | Ptg::AreaErr { .. } => stack.push(Rendered::operand(
                gridcalc_model::ErrorValue::Ref.as_str().to_string(),
            )),
            Ptg::Ref3d { ixti, loc, .. } => stack.push(Rendered::operand(format!(
                "{}{}",
                ctx.sheet_prefix(*ixti),
                loc.to_a1()
            ))),
            Ptg::Area3d { ixti, area, .. } => stack.push(Rendered::operand(format!(
                "{}{}",
                ctx.sheet_prefix(*ixti),
                area.to_a1()
            ))),
            Ptg::RefErr3d { ixti, .. } | Ptg::AreaErr3d { ixti, .. } => {
                stack.push(Rendered::operand(format!(
                    "{}{}",
                    ctx.sheet_prefix(*ixti),
                    gridcalc_model::ErrorValue::Ref.as_str()
                )))
            }
            // A shared-formula pointer is resolved against its host before
            // rendering; if one leaks through, surface a placeholder rather
            // than failing the whole render.
            Ptg::Exp { .. } => stack.push(Rendered::operand("#UNKNOWN!".to_string())),
        }
    }

    match stack.len() {
        1 => Ok(stack.pop().expect("len checked").text),
        depth => Err(RgceError::UnbalancedStack { depth }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptg::{AreaLoc, PtgClass, RefLoc};
    use gridcalc_model::CellRef;
    use pretty_assertions::assert_eq;

    fn ref_value(row: u16, col: u16) -> Ptg {
        Ptg::Ref {
            class: PtgClass::Value,
            loc: RefLoc::new(row, col, true, true),
        }
    }

    #[test]
    fn parse_stops_exactly_at_cce() {
        let tokens = vec![ref_value(0, 0), Ptg::Int(1), Ptg::Add];
        let enc = encode_rgce(&tokens);
        let parsed = parse_rgce(&enc.rgce, enc.rgce.len()).unwrap();
        assert_eq!(parsed.tokens, tokens);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn token_overrunning_cce_is_fatal() {
        let tokens = vec![Ptg::Num(3.5)];
        let enc = encode_rgce(&tokens);
        // Lie about the declared length: the PtgNum crosses the boundary.
        let err = parse_rgce(&enc.rgce, enc.rgce.len() - 2).unwrap_err();
        assert_eq!(err, RgceError::TokenOverrun { offset: 0 });
    }

    #[test]
    fn truncated_rgcb_recovers_with_empty_literal() {
        let tokens = vec![Ptg::Array {
            class: PtgClass::Array,
            literal: crate::ptg::ArrayLiteral::new(
                1,
                2,
                vec![1.0.into(), 2.0.into()],
            ),
        }];
        let enc = encode_rgce(&tokens);
        let cce = enc.rgce.len();
        let mut data = enc.rgce.clone();
        // Keep only the first 2 bytes of the trailing payload.
        data.extend_from_slice(&enc.rgcb[..2]);

        let parsed = parse_rgce(&data, cce).unwrap();
        assert_eq!(parsed.warnings.len(), 1);
        match &parsed.tokens[0] {
            Ptg::Array { literal, .. } => assert!(literal.is_empty()),
            other => panic!("unexpected token {other:?}"),
        }
    }

    #[test]
    fn stack_discipline_catches_underflow_and_imbalance() {
        assert_eq!(
            check_stack_discipline(&[Ptg::Int(1), Ptg::Add]),
            Err(RgceError::StackUnderflow { index: 1 })
        );
        assert_eq!(
            check_stack_discipline(&[Ptg::Int(1), Ptg::Int(2)]),
            Err(RgceError::UnbalancedStack { depth: 2 })
        );
        assert!(check_stack_discipline(&[Ptg::Int(1), Ptg::Int(2), Ptg::Mul]).is_ok());
        // A lone shared-formula pointer is a complete expression.
        assert!(check_stack_discipline(&[Ptg::Exp { row: 0, col: 0 }]).is_ok());
    }

    #[test]
    fn render_applies_operator_precedence() {
        let ctx = RenderContext::default();
        // 1+2*3 stays unparenthesized.
        let t = vec![Ptg::Int(1), Ptg::Int(2), Ptg::Int(3), Ptg::Mul, Ptg::Add];
        assert_eq!(render_text(&t, &ctx).unwrap(), "1+2*3");
        // (1+2)*3 needs parens.
        let t = vec![Ptg::Int(1), Ptg::Int(2), Ptg::Add, Ptg::Int(3), Ptg::Mul];
        assert_eq!(render_text(&t, &ctx).unwrap(), "(1+2)*3");
        // 1-(2-3): right operand of `-` keeps parens.
        let t = vec![Ptg::Int(1), Ptg::Int(2), Ptg::Int(3), Ptg::Sub, Ptg::Sub];
        assert_eq!(render_text(&t, &ctx).unwrap(), "1-(2-3)");
    }

    #[test]
    fn render_refs_functions_and_literals() {
        let ctx = RenderContext::default();
        let t = vec![
            Ptg::Ref {
                class: PtgClass::Value,
                loc: RefLoc::new(0, 1, true, false),
            },
            Ptg::Num(0.5),
            Ptg::Gt,
        ];
        assert_eq!(render_text(&t, &ctx).unwrap(), "$B1>0.5");

        let t = vec![
            Ptg::Area {
                class: PtgClass::Reference,
                area: AreaLoc::new(RefLoc::new(0, 0, true, true), RefLoc::new(2, 0, true, true)),
            },
            Ptg::FuncVar {
                class: PtgClass::Value,
                iftab: ftab::iftab::SUM,
                argc: 1,
            },
        ];
        assert_eq!(render_text(&t, &ctx).unwrap(), "SUM(A1:A3)");

        let t = vec![Ptg::Str("he said \"hi\"".into())];
        assert_eq!(render_text(&t, &ctx).unwrap(), "\"he said \"\"hi\"\"\"");
    }

    #[test]
    fn render_3d_refs_use_sheet_names() {
        let sheets = vec!["Data".to_string(), "My Sheet".to_string()];
        let ctx = RenderContext {
            names: None,
            sheet_names: &sheets,
        };
        let t = vec![Ptg::Ref3d {
            class: PtgClass::Value,
            ixti: 1,
            loc: RefLoc::new(0, 0, false, false),
        }];
        assert_eq!(render_text(&t, &ctx).unwrap(), "'My Sheet'!$A$1");
    }

    #[test]
    fn referenced_ranges_skips_non_reference_tokens() {
        let t = vec![
            ref_value(1, 1),
            Ptg::Int(7),
            Ptg::Add,
            Ptg::Area {
                class: PtgClass::Reference,
                area: AreaLoc::new(RefLoc::new(3, 0, true, true), RefLoc::new(5, 1, true, true)),
            },
            Ptg::Isect,
        ];
        let ranges = referenced_ranges(&t);
        assert_eq!(
            ranges,
            vec![
                Range::single(CellRef::new(1, 1)),
                Range::new(CellRef::new(3, 0), CellRef::new(5, 1)),
            ]
        );
    }
}
