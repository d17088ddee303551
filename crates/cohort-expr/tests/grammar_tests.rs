//! Grammar-level tests for composition expressions.
//!
//! Covers rendering stability on generated trees and the serde shape.

use cohort_expr::{parse, CompositionExpression, ExprError};
use proptest::prelude::*;

fn arb_expression() -> impl Strategy<Value = CompositionExpression> {
    let leaf = prop_oneof![
        Just("onArt"),
        Just("pregnant"),
        Just("ltfu"),
        Just("inHivProgram"),
        Just("vl_1000"),
    ]
    .prop_map(CompositionExpression::search);

    leaf.prop_recursive(5, 32, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| CompositionExpression::and(l, r)),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| CompositionExpression::or(l, r)),
            inner.prop_map(CompositionExpression::not),
        ]
    })
}

proptest! {
    #[test]
    fn rendered_expression_parses_back(expr in arb_expression()) {
        let rendered = expr.to_string();
        let reparsed = parse(&rendered).expect("canonical rendering must parse");
        prop_assert_eq!(reparsed, expr);
    }

    #[test]
    fn lowercase_keywords_parse_identically(expr in arb_expression()) {
        let rendered = expr.to_string();
        let lowered = rendered
            .replace(" AND ", " and ")
            .replace(" OR ", " or ")
            .replace("NOT ", "not ");
        prop_assert_eq!(parse(&lowered).unwrap(), expr);
    }
}

#[test]
fn test_composition_strings_from_report_libraries() {
    // Shapes used by cohort libraries: long conjunction chains with exclusions.
    let expr = parse(
        "htsScreened AND screenedFromMobileDepartment AND NOT htsKnownPositive",
    )
    .unwrap();
    assert_eq!(expr.identifiers().len(), 3);
    assert!(expr.uses_complement());

    let expr = parse("(txCurr AND vlResult) AND NOT (ltfu OR died OR transferredOut)").unwrap();
    assert_eq!(
        expr.to_string(),
        "txCurr AND vlResult AND NOT (ltfu OR died OR transferredOut)"
    );
}

#[test]
fn test_error_positions_point_at_problem() {
    // The unclosed group cannot be consumed, so parsing stops at the `AND` before it.
    match parse("onArt AND (pregnant OR").unwrap_err() {
        ExprError::ParseError { position, message } => {
            assert_eq!(position, 6);
            assert!(message.contains("AND (pregnant"));
        }
        other => panic!("Expected ParseError, got {:?}", other),
    }
    match parse("onArt AND").unwrap_err() {
        ExprError::ParseError { position, .. } => assert_eq!(position, 6),
        other => panic!("Expected ParseError, got {:?}", other),
    }
}

#[test]
fn test_identifiers_are_case_sensitive() {
    let expr = parse("OnArt OR onArt").unwrap();
    assert_eq!(expr.identifiers().len(), 2);
}

#[cfg(feature = "serde")]
#[test]
fn test_serde_shape() {
    use serde_json::json;

    let expr = parse("onArt AND NOT (pregnant OR ltfu)").unwrap();
    let value = serde_json::to_value(&expr).unwrap();
    assert_eq!(
        value,
        json!({
            "And": [
                { "Search": "onArt" },
                { "Not": { "Or": [{ "Search": "pregnant" }, { "Search": "ltfu" }] } }
            ]
        })
    );

    let back: CompositionExpression = serde_json::from_value(value).unwrap();
    assert_eq!(back, expr);
}
