//! Notebook document model and golden-output semantics shared by the nbgolden runner and tooling.
//!
//! It knows how notebooks look on disk (nbformat v4 JSON) and how two sets of cell outputs are compared. It
//! never touches the filesystem or a kernel.
//!
//! ## Modules
//!
//! - [`notebook`]: the `Notebook`/`Cell`/`Output` model with serde support
//! - [`multiline`]: on-disk "string or list of lines" normalization
//! - [`compare`]: the golden comparison rule and its mismatch payloads
//! - [`markers`]: in-band markers (comparison opt-out, restart signal)

pub mod compare;
pub mod markers;
pub mod multiline;
pub mod notebook;

pub use compare::{
    CellCountMismatch, CellMismatch, NotebookComparison, OutputMismatch, compare_notebooks, compare_outputs,
};
pub use markers::{RESTART_SIGNAL, SKIP_COMPARE_MARKER, requests_restart, skips_comparison};
pub use notebook::{Cell, CodeCell, Notebook, NotebookError, Output, TextCell};
