//! Golden comparison of cell outputs.
//!
//! Two output lists match when they have the same length and, index by index, each pair of outputs has the
//! same number of fields and the same value for every field of the stored ("expected") output.

use miette::Diagnostic;
use thiserror::Error;

use crate::markers::skips_comparison;
use crate::notebook::{CodeCell, Notebook, Output};

/// Why a freshly produced output list differs from the stored one.
///
/// Every variant keeps the full payload so the failure can be diagnosed from the message alone.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum OutputMismatch {
    #[error(
        "outputs do not match: expected {} output(s), got {}. Expected {} got {}",
        .expected.len(),
        .actual.len(),
        render(.expected),
        render(.actual)
    )]
    #[diagnostic(code(nbgolden::compare::count))]
    Count { expected: Vec<Output>, actual: Vec<Output> },

    #[error(
        "outputs do not match: output {index} has {actual_fields} field(s), expected {expected_fields}. \
         Expected {} got {}",
        render(.expected),
        render(.actual)
    )]
    #[diagnostic(code(nbgolden::compare::field_count))]
    FieldCount {
        index: usize,
        expected_fields: usize,
        actual_fields: usize,
        expected: Vec<Output>,
        actual: Vec<Output>,
    },

    #[error("outputs do not match for field `{key}` of output {index}. Expected {expected} got {actual}")]
    #[diagnostic(
        code(nbgolden::compare::field_value),
        help("add `#SKIP_COMPARE_OUTPUT` to the cell source if this output is not deterministic")
    )]
    FieldValue {
        index: usize,
        key: String,
        expected: Output,
        actual: Output,
    },
}

impl OutputMismatch {
    /// Index of the first differing output, when the lists have the same length.
    pub fn output_index(&self) -> Option<usize> {
        match self {
            OutputMismatch::Count { .. } => None,
            OutputMismatch::FieldCount { index, .. } | OutputMismatch::FieldValue { index, .. } => Some(*index),
        }
    }
}

/// Compare stored outputs against freshly produced ones.
///
/// ## Parameters
/// - `expected`: the outputs loaded from the notebook on disk.
/// - `actual`: the outputs the kernel just produced for the same cell.
///
/// ## Returns
/// - `Ok(())` when the lists match, otherwise the first [`OutputMismatch`] found.
///
/// ## Notes
/// - A field present in `expected` but absent from `actual` is a value mismatch; the field counts already
///   being equal means some other field took its place.
pub fn compare_outputs(expected: &[Output], actual: &[Output]) -> Result<(), OutputMismatch> {
    if expected.len() != actual.len() {
        return Err(OutputMismatch::Count {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }

    for (index, (before, after)) in expected.iter().zip(actual).enumerate() {
        if before.len() != after.len() {
            return Err(OutputMismatch::FieldCount {
                index,
                expected_fields: before.len(),
                actual_fields: after.len(),
                expected: expected.to_vec(),
                actual: actual.to_vec(),
            });
        }
        for (key, value) in before.fields() {
            if after.get(key) != Some(value) {
                return Err(OutputMismatch::FieldValue {
                    index,
                    key: key.clone(),
                    expected: before.clone(),
                    actual: after.clone(),
                });
            }
        }
    }

    Ok(())
}

/// A code cell whose outputs differ between two notebooks.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
#[error("code cell {cell}: {mismatch}")]
pub struct CellMismatch {
    /// Position among the compared notebooks' code cells.
    pub cell: usize,
    #[diagnostic_source]
    pub mismatch: OutputMismatch,
}

#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
#[error("notebooks have different numbers of code cells: expected {expected}, got {actual}")]
#[diagnostic(code(nbgolden::compare::cell_count))]
pub struct CellCountMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Result of comparing every code cell of two notebooks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NotebookComparison {
    pub checked: usize,
    /// Cells carrying the opt-out marker.
    pub skipped: usize,
    pub mismatches: Vec<CellMismatch>,
}

impl NotebookComparison {
    pub fn is_match(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Compare the outputs of two notebooks code cell by code cell.
///
/// Cells with blank source are ignored on both sides, as they never execute. A cell is skipped when either
/// side carries the opt-out marker.
pub fn compare_notebooks(expected: &Notebook, actual: &Notebook) -> Result<NotebookComparison, CellCountMismatch> {
    let expected_cells: Vec<&CodeCell> = executable_cells(expected).collect();
    let actual_cells: Vec<&CodeCell> = executable_cells(actual).collect();
    if expected_cells.len() != actual_cells.len() {
        return Err(CellCountMismatch {
            expected: expected_cells.len(),
            actual: actual_cells.len(),
        });
    }

    let mut comparison = NotebookComparison::default();
    for (cell, (before, after)) in expected_cells.iter().zip(&actual_cells).enumerate() {
        if skips_comparison(&before.source) || skips_comparison(&after.source) {
            comparison.skipped += 1;
            continue;
        }
        comparison.checked += 1;
        if let Err(mismatch) = compare_outputs(&before.outputs, &after.outputs) {
            comparison.mismatches.push(CellMismatch { cell, mismatch });
        }
    }
    Ok(comparison)
}

fn executable_cells(notebook: &Notebook) -> impl Iterator<Item = &CodeCell> {
    notebook.code_cells().filter(|cell| !cell.source.trim().is_empty())
}

fn render(outputs: &[Output]) -> String {
    let items: Vec<String> = outputs.iter().map(Output::to_string).collect();
    format!("[{}]", items.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(count: u32, text: &str) -> Output {
        Output::new(
            json!({
                "data": {"text/plain": text},
                "execution_count": count,
                "metadata": {},
                "output_type": "execute_result"
            })
            .as_object()
            .cloned()
            .unwrap(),
        )
    }

    #[test]
    fn test_identical_outputs_match() {
        let outputs = vec![Output::stream("stdout", "a\n"), result(1, "2")];
        assert_eq!(compare_outputs(&outputs, &outputs.clone()), Ok(()));
    }

    #[test]
    fn test_empty_lists_match() {
        assert_eq!(compare_outputs(&[], &[]), Ok(()));
    }

    #[test]
    fn test_count_mismatch() {
        let err = compare_outputs(&[Output::stream("stdout", "a\n")], &[]).unwrap_err();
        assert!(matches!(err, OutputMismatch::Count { .. }));
        assert_eq!(err.output_index(), None);
    }

    #[test]
    fn test_field_count_mismatch() {
        let before = vec![result(1, "2")];
        let after = vec![Output::stream("stdout", "2")];
        let err = compare_outputs(&before, &after).unwrap_err();
        assert!(matches!(err, OutputMismatch::FieldCount { index: 0, .. }));
    }

    #[test]
    fn test_field_value_mismatch_names_the_field() {
        let before = vec![Output::stream("stdout", "a\n"), result(2, "4")];
        let after = vec![Output::stream("stdout", "a\n"), result(3, "4")];
        let err = compare_outputs(&before, &after).unwrap_err();
        match &err {
            OutputMismatch::FieldValue { index, key, .. } => {
                assert_eq!(*index, 1);
                assert_eq!(key, "execution_count");
            }
            other => panic!("unexpected mismatch: {other:?}"),
        }
        assert!(err.to_string().contains("field `execution_count` of output 1"));
    }

    #[test]
    fn test_same_count_different_keys_is_value_mismatch() {
        let before = vec![Output::new(json!({"a": 1}).as_object().cloned().unwrap())];
        let after = vec![Output::new(json!({"b": 1}).as_object().cloned().unwrap())];
        let err = compare_outputs(&before, &after).unwrap_err();
        assert!(matches!(err, OutputMismatch::FieldValue { ref key, .. } if key == "a"));
    }

    fn notebook(cells: Vec<CodeCell>) -> Notebook {
        let mut nb = Notebook::from_json_str(r#"{"cells": [], "metadata": {}, "nbformat": 4, "nbformat_minor": 2}"#)
            .unwrap();
        nb.cells = cells.into_iter().map(crate::notebook::Cell::Code).collect();
        nb
    }

    #[test]
    fn test_compare_notebooks_reports_each_differing_cell() {
        let expected = notebook(vec![
            CodeCell::new("print('a')").with_outputs(vec![Output::stream("stdout", "a\n")]),
            CodeCell::new("   "),
            CodeCell::new("now()  #SKIP_COMPARE_OUTPUT").with_outputs(vec![result(2, "t0")]),
            CodeCell::new("1 + 1").with_outputs(vec![result(3, "2")]),
        ]);
        let actual = notebook(vec![
            CodeCell::new("print('a')").with_outputs(vec![Output::stream("stdout", "b\n")]),
            CodeCell::new("now()  #SKIP_COMPARE_OUTPUT").with_outputs(vec![result(2, "t1")]),
            CodeCell::new("1 + 1").with_outputs(vec![result(3, "2")]),
        ]);

        let comparison = compare_notebooks(&expected, &actual).unwrap();
        assert_eq!(comparison.checked, 2);
        assert_eq!(comparison.skipped, 1);
        assert_eq!(comparison.mismatches.len(), 1);
        assert_eq!(comparison.mismatches[0].cell, 0);
        assert!(!comparison.is_match());
    }

    #[test]
    fn test_compare_notebooks_cell_count() {
        let expected = notebook(vec![CodeCell::new("1"), CodeCell::new("2")]);
        let actual = notebook(vec![CodeCell::new("1")]);
        assert_eq!(
            compare_notebooks(&expected, &actual),
            Err(CellCountMismatch { expected: 2, actual: 1 })
        );
    }

    #[test]
    fn test_count_message_snapshot() {
        let err = compare_outputs(&[Output::stream("stdout", "x\n")], &[]).unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @r#"outputs do not match: expected 1 output(s), got 0. Expected [{"name":"stdout","output_type":"stream","text":"x\n"}] got []"#
        );
    }
}
