//! In-band markers understood by the runner.

use crate::notebook::Output;

/// A cell whose source contains this text is executed but never compared against its stored outputs.
pub const SKIP_COMPARE_MARKER: &str = "#SKIP_COMPARE_OUTPUT";

/// Substring of an output's `text` field by which a notebook asks for a fresh kernel and a full rerun.
pub const RESTART_SIGNAL: &str = "restart kernel";

/// Whether the cell source opts out of output comparison.
pub fn skips_comparison(source: &str) -> bool {
    source.contains(SKIP_COMPARE_MARKER)
}

/// Whether any of the freshly produced outputs carries the restart signal.
pub fn requests_restart(outputs: &[Output]) -> bool {
    outputs
        .iter()
        .any(|output| output.text().is_some_and(|text| text.contains(RESTART_SIGNAL)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value, json};

    #[test]
    fn test_marker_anywhere_in_source() {
        assert!(skips_comparison("x = now()  #SKIP_COMPARE_OUTPUT\nprint(x)"));
        assert!(!skips_comparison("# SKIP_COMPARE_OUTPUT"));
    }

    #[test]
    fn test_restart_signal_in_stream_text() {
        let outputs = vec![
            Output::stream("stdout", "installing...\n"),
            Output::stream("stdout", "Please restart kernel after installing\n"),
        ];
        assert!(requests_restart(&outputs));
    }

    #[test]
    fn test_restart_signal_only_looks_at_text_field() {
        let fields: Map<String, Value> = json!({
            "output_type": "display_data",
            "data": {"text/plain": "restart kernel"},
            "metadata": {}
        })
        .as_object()
        .cloned()
        .unwrap();
        assert!(!requests_restart(&[Output::new(fields)]));
        assert!(!requests_restart(&[]));
    }
}
