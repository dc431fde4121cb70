//! Multiline string normalization.
//!
//! nbformat allows `source`, stream `text` and most mime bundle values to be stored either as one string or as
//! a list of lines. In memory we always hold the joined string; on disk we write the list form, one entry per
//! line with its trailing newline kept.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Output keys whose string values may be stored as a list of lines.
const MULTILINE_OUTPUT_KEYS: &[&str] = &["text"];

/// Join a stored value into a single string if it is a list of strings.
///
/// Any other shape (including a list with non-string entries) is returned untouched.
pub fn rejoin(value: Value) -> Value {
    match value {
        Value::Array(items) if items.iter().all(Value::is_string) => {
            let mut joined = String::new();
            for item in items {
                if let Value::String(s) = item {
                    joined.push_str(&s);
                }
            }
            Value::String(joined)
        }
        other => other,
    }
}

/// Split a string into lines, keeping each line's terminating `\n`.
///
/// ## Examples
/// ```rust
/// use nbgolden_core::multiline::split_lines;
/// assert_eq!(split_lines("a\nb"), vec!["a\n".to_string(), "b".to_string()]);
/// assert!(split_lines("").is_empty());
/// ```
pub fn split_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

/// Split a string value into a list of lines; other values are returned untouched.
pub fn split(value: Value) -> Value {
    match value {
        Value::String(s) => Value::Array(split_lines(&s).into_iter().map(Value::String).collect()),
        other => other,
    }
}

/// Whether a mime type carries JSON payloads, which are stored as structured values rather than text.
pub fn is_json_mime(mime: &str) -> bool {
    mime == "application/json" || mime.ends_with("+json")
}

/// Rejoin the multiline fields of a raw output mapping.
pub fn rejoin_output_fields(fields: &mut Map<String, Value>) {
    for key in MULTILINE_OUTPUT_KEYS {
        if let Some(value) = fields.get_mut(*key) {
            *value = rejoin(value.take());
        }
    }
    if let Some(Value::Object(data)) = fields.get_mut("data") {
        for (mime, value) in data.iter_mut() {
            if !is_json_mime(mime) {
                *value = rejoin(value.take());
            }
        }
    }
}

/// Split the multiline fields of an output mapping for writing.
pub fn split_output_fields(fields: &mut Map<String, Value>) {
    for key in MULTILINE_OUTPUT_KEYS {
        if let Some(value) = fields.get_mut(*key) {
            *value = split(value.take());
        }
    }
    if let Some(Value::Object(data)) = fields.get_mut("data") {
        for (mime, value) in data.iter_mut() {
            if !is_json_mime(mime) {
                *value = split(value.take());
            }
        }
    }
}

/// Serde adapter for `source`-style fields: accepts a string or a list of lines, writes a list of lines.
pub mod source {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Stored {
        Joined(String),
        Lines(Vec<String>),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Stored::deserialize(deserializer)? {
            Stored::Joined(s) => s,
            Stored::Lines(lines) => lines.concat(),
        })
    }

    pub fn serialize<S>(source: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        split_lines(source).serialize(serializer)
    }
}
