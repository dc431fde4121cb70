//! nbformat v4 notebook model.
//!
//! Only the parts of the format the runner reads or rewrites are typed. Everything else (cell and notebook
//! metadata, attachments, output payloads) is carried as raw JSON so a load/write cycle does not drop it.

use std::fmt;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::multiline;

/// The only major notebook format version this crate reads.
pub const NBFORMAT_MAJOR: u32 = 4;

/// Errors raised while decoding or encoding a notebook document.
#[derive(Debug, Error, Diagnostic)]
pub enum NotebookError {
    #[error("notebook is not valid nbformat JSON: {0}")]
    #[diagnostic(code(nbgolden::notebook::json))]
    Json(#[from] serde_json::Error),

    #[error("unsupported notebook format {major}.{minor} (expected {NBFORMAT_MAJOR}.x)")]
    #[diagnostic(
        code(nbgolden::notebook::version),
        help("convert it first, e.g. `jupyter nbconvert --to notebook --nbformat 4`")
    )]
    UnsupportedVersion { major: u32, minor: u32 },
}

/// A notebook document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub nbformat: u32,
    pub nbformat_minor: u32,
}

impl Notebook {
    /// Parse a notebook from its JSON text.
    ///
    /// ## Errors
    /// - [`NotebookError::Json`] if the text is not a well-formed v4 document.
    /// - [`NotebookError::UnsupportedVersion`] for any other major version.
    pub fn from_json_str(text: &str) -> Result<Self, NotebookError> {
        // Check the version before the typed decode so v3 documents get a useful error.
        let raw: Value = serde_json::from_str(text)?;
        let major = raw.get("nbformat").and_then(Value::as_u64).unwrap_or(0) as u32;
        if major != NBFORMAT_MAJOR {
            let minor = raw.get("nbformat_minor").and_then(Value::as_u64).unwrap_or(0) as u32;
            return Err(NotebookError::UnsupportedVersion { major, minor });
        }
        Ok(serde_json::from_value(raw)?)
    }

    /// Encode the notebook the way Jupyter writes it: one-space indentation and a trailing newline.
    pub fn to_json_string(&self) -> Result<String, NotebookError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)?;
        let mut text = String::from_utf8_lossy(&buf).into_owned();
        text.push('\n');
        Ok(text)
    }

    /// The kernel name declared in `metadata.kernelspec.name`, if any.
    pub fn kernel_name(&self) -> Option<&str> {
        self.metadata.get("kernelspec")?.get("name")?.as_str()
    }

    /// Bind the notebook to `name`, creating the `kernelspec` metadata object when it is missing.
    pub fn set_kernel_name(&mut self, name: &str) {
        match self.metadata.get_mut("kernelspec") {
            Some(Value::Object(spec)) => {
                spec.insert("name".to_string(), Value::String(name.to_string()));
            }
            _ => {
                let mut spec = Map::new();
                spec.insert("display_name".to_string(), Value::String(name.to_string()));
                spec.insert("name".to_string(), Value::String(name.to_string()));
                self.metadata.insert("kernelspec".to_string(), Value::Object(spec));
            }
        }
    }

    /// Iterate over the code cells in document order.
    pub fn code_cells(&self) -> impl Iterator<Item = &CodeCell> {
        self.cells.iter().filter_map(Cell::as_code)
    }
}

/// One notebook cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cell_type", rename_all = "lowercase")]
pub enum Cell {
    Code(CodeCell),
    Markdown(TextCell),
    Raw(TextCell),
}

impl Cell {
    pub fn source(&self) -> &str {
        match self {
            Cell::Code(cell) => &cell.source,
            Cell::Markdown(cell) | Cell::Raw(cell) => &cell.source,
        }
    }

    pub fn as_code(&self) -> Option<&CodeCell> {
        match self {
            Cell::Code(cell) => Some(cell),
            _ => None,
        }
    }

    pub fn as_code_mut(&mut self) -> Option<&mut CodeCell> {
        match self {
            Cell::Code(cell) => Some(cell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CodeCell {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(with = "multiline::source")]
    pub source: String,
    #[serde(default)]
    pub execution_count: Option<u32>,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

impl CodeCell {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<Output>) -> Self {
        self.outputs = outputs;
        self
    }
}

/// Markdown and raw cells: never executed, written back as read.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TextCell {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(with = "multiline::source")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
}

/// One cell output: a mapping of named fields (`output_type`, `text`, `data`, ...).
///
/// Multiline fields are joined on the way in and split on the way out, so two outputs compare equal
/// regardless of how they were laid out on disk.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Output {
    fields: Map<String, Value>,
}

impl Output {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self::from(fields)
    }

    /// A `stream` output as produced by `print`.
    pub fn stream(name: &str, text: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("name".to_string(), Value::String(name.to_string()));
        fields.insert("output_type".to_string(), Value::String("stream".to_string()));
        fields.insert("text".to_string(), Value::String(text.to_string()));
        Self { fields }
    }

    pub fn output_type(&self) -> Option<&str> {
        self.fields.get("output_type").and_then(Value::as_str)
    }

    /// The `text` field, present on stream outputs.
    pub fn text(&self) -> Option<&str> {
        self.fields.get("text").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<Map<String, Value>> for Output {
    fn from(mut fields: Map<String, Value>) -> Self {
        multiline::rejoin_output_fields(&mut fields);
        Self { fields }
    }
}

impl From<Output> for Map<String, Value> {
    fn from(output: Output) -> Self {
        let mut fields = output.fields;
        multiline::split_output_fields(&mut fields);
        fields
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.fields) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.fields),
        }
    }
}
