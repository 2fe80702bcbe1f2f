use gridcalc_biff::{
    encode_rgce, parse_rgce, render_text, ArrayLiteral, AreaLoc, Ptg, PtgClass, RefLoc,
    RenderContext,
};
use gridcalc_model::{CellValue, ErrorValue};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn roundtrip(tokens: Vec<Ptg>) {
    let enc = encode_rgce(&tokens);
    let mut data = enc.rgce.clone();
    data.extend_from_slice(&enc.rgcb);
    let parsed = parse_rgce(&data, enc.rgce.len()).expect("parse");
    assert_eq!(parsed.tokens, tokens);
    assert_eq!(parsed.rgcb_len, enc.rgcb.len());
    assert!(parsed.warnings.is_empty());
}

#[test]
fn roundtrip_arithmetic_with_refs() {
    roundtrip(vec![
        Ptg::Ref {
            class: PtgClass::Value,
            loc: RefLoc::new(0, 1, true, true),
        },
        Ptg::Int(2),
        Ptg::Mul,
    ]);
}

#[test]
fn roundtrip_function_over_area() {
    roundtrip(vec![
        Ptg::Area {
            class: PtgClass::Reference,
            area: AreaLoc::new(RefLoc::new(0, 0, true, true), RefLoc::new(2, 0, true, true)),
        },
        Ptg::FuncVar {
            class: PtgClass::Value,
            iftab: 4, // SUM
            argc: 1,
        },
    ]);
}

#[test]
fn roundtrip_cross_sheet_references() {
    roundtrip(vec![
        Ptg::Ref3d {
            class: PtgClass::Value,
            ixti: 3,
            loc: RefLoc::new(9, 9, false, true),
        },
        Ptg::Area3d {
            class: PtgClass::Reference,
            ixti: 1,
            area: AreaLoc::new(RefLoc::new(0, 0, false, false), RefLoc::new(5, 5, true, true)),
        },
        Ptg::Isect,
    ]);
}

#[test]
fn roundtrip_array_literal_keeps_rgcb_in_token_order() {
    // Two array literals: rgcb shares must be consumed in token order.
    let first = Ptg::Array {
        class: PtgClass::Array,
        literal: ArrayLiteral::new(1, 2, vec![CellValue::Number(1.0), CellValue::Number(2.0)]),
    };
    let second = Ptg::Array {
        class: PtgClass::Array,
        literal: ArrayLiteral::new(
            2,
            1,
            vec![
                CellValue::Text("a".to_string()),
                CellValue::Error(ErrorValue::NA),
            ],
        ),
    };
    roundtrip(vec![first, second, Ptg::Concat]);
}

#[test]
fn render_of_parsed_stream_matches_original_text_shape() {
    let tokens = vec![
        Ptg::Ref {
            class: PtgClass::Value,
            loc: RefLoc::new(0, 0, true, true),
        },
        Ptg::Num(1.0),
        Ptg::Add,
    ];
    let enc = encode_rgce(&tokens);
    let parsed = parse_rgce(&enc.rgce, enc.rgce.len()).unwrap();
    let text = render_text(&parsed.tokens, &RenderContext::default()).unwrap();
    assert_eq!(text, "A1+1");
}

fn literal_token() -> impl Strategy<Value = Ptg> {
    prop_oneof![
        any::<u16>().prop_map(Ptg::Int),
        (-1.0e12..1.0e12f64).prop_map(Ptg::Num),
        any::<bool>().prop_map(Ptg::Bool),
        "[ -~]{0,40}".prop_map(Ptg::Str),
        prop_oneof![
            Just(ErrorValue::Null),
            Just(ErrorValue::Div0),
            Just(ErrorValue::Value),
            Just(ErrorValue::Ref),
            Just(ErrorValue::Name),
            Just(ErrorValue::Num),
            Just(ErrorValue::NA),
        ]
        .prop_map(Ptg::Err),
    ]
}

fn ref_token() -> impl Strategy<Value = Ptg> {
    (any::<u16>(), 0u16..256, any::<bool>(), any::<bool>()).prop_map(|(row, col, rr, cr)| Ptg::Ref {
        class: PtgClass::Value,
        loc: RefLoc::new(row, col, rr, cr),
    })
}

proptest! {
    // Every operand stream, regardless of content, must round-trip through
    // the byte codec exactly.
    #[test]
    fn prop_operand_streams_roundtrip(
        tokens in proptest::collection::vec(prop_oneof![literal_token(), ref_token()], 1..24)
    ) {
        let enc = encode_rgce(&tokens);
        let parsed = parse_rgce(&enc.rgce, enc.rgce.len()).unwrap();
        prop_assert_eq!(parsed.tokens, tokens);
    }
}
