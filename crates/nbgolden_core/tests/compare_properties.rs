//! Property tests for the golden comparison rule.
//!
//! Run with: `cargo test -p nbgolden_core --test compare_properties`

use nbgolden_core::{Output, OutputMismatch, compare_outputs, skips_comparison};
use proptest::prelude::*;
use serde_json::{Map, Value};

fn field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-z \\n]{0,12}".prop_map(Value::String),
    ]
}

fn output() -> impl Strategy<Value = Output> {
    prop::collection::btree_map("[a-z_]{1,8}", field_value(), 0..5).prop_map(|fields| {
        let map: Map<String, Value> = fields.into_iter().collect();
        Output::new(map)
    })
}

fn outputs() -> impl Strategy<Value = Vec<Output>> {
    prop::collection::vec(output(), 0..4)
}

proptest! {
    #[test]
    fn comparison_is_reflexive(outs in outputs()) {
        prop_assert_eq!(compare_outputs(&outs, &outs.clone()), Ok(()));
    }

    #[test]
    fn length_difference_is_a_count_mismatch(outs in outputs(), extra in output()) {
        let mut longer = outs.clone();
        longer.push(extra);
        let is_count_mismatch = matches!(
            compare_outputs(&outs, &longer),
            Err(OutputMismatch::Count { .. })
        );
        prop_assert!(is_count_mismatch);
    }

    #[test]
    fn match_agrees_with_field_wise_rule(before in outputs(), after in outputs()) {
        let expected_ok = before.len() == after.len()
            && before.iter().zip(&after).all(|(b, a)| {
                b.len() == a.len() && b.fields().iter().all(|(k, v)| a.get(k) == Some(v))
            });
        prop_assert_eq!(compare_outputs(&before, &after).is_ok(), expected_ok);
    }

    #[test]
    fn marker_is_detected_anywhere(prefix in "[a-z =()\\n]{0,20}", suffix in "[a-z =()\\n]{0,20}") {
        let source = format!("{prefix}#SKIP_COMPARE_OUTPUT{suffix}");
        prop_assert!(skips_comparison(&source));
    }
}
