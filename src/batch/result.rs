//! Decoded batch output.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use super::{BATCH_SENTINEL, BatchError, OutputFormat};

/// One decoded result value.
///
/// Structured formats decode into the full range of variants; `Raw` and
/// `Separator` results are always [`BatchValue::String`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchValue {
    /// JSON `null`, or a command that produced nothing.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number, kept in its JSON representation.
    Number(serde_json::Number),
    /// Text.
    String(String),
    /// An ordered list.
    List(Vec<BatchValue>),
    /// A keyed map.
    Map(BTreeMap<String, BatchValue>),
}

impl BatchValue {
    /// Returns the text when this value is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the flag when this value is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(flag) => Some(*flag),
            _ => None,
        }
    }

    /// Returns the number when it fits an `i64`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(number) => number.as_i64(),
            _ => None,
        }
    }

    /// Returns `true` for [`BatchValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Renders the value as display text.
    ///
    /// Strings are returned verbatim, `null` becomes the empty string, and
    /// lists and maps are rendered as compact JSON.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(flag) => flag.to_string(),
            Self::Number(number) => number.to_string(),
            Self::String(text) => text.clone(),
            Self::List(_) | Self::Map(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

impl From<Value> for BatchValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => Self::Number(number),
            Value::String(text) => Self::String(text),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(key, item)| (key, Self::from(item)))
                    .collect(),
            ),
        }
    }
}

/// Results decoded from a batch, aligned with the batch's commands.
///
/// `Array`, `Raw` and `Separator` results are positional; `Object` results
/// are keyed.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchResult {
    format: OutputFormat,
    values: Vec<BatchValue>,
    fields: BTreeMap<String, BatchValue>,
    diagnostic: Option<String>,
}

impl BatchResult {
    pub(crate) const fn empty(format: OutputFormat) -> Self {
        Self {
            format,
            values: Vec::new(),
            fields: BTreeMap::new(),
            diagnostic: None,
        }
    }

    /// Attaches the remote diagnostic of a batch that exited non-zero.
    pub(crate) fn with_diagnostic(mut self, diagnostic: String) -> Self {
        self.diagnostic = Some(diagnostic);
        self
    }

    fn positional(format: OutputFormat, values: Vec<BatchValue>) -> Self {
        Self {
            format,
            values,
            fields: BTreeMap::new(),
            diagnostic: None,
        }
    }

    /// Format the result was decoded under.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Number of positional results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` when there are no positional results.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Positional results in command order.
    #[must_use]
    pub fn values(&self) -> &[BatchValue] {
        &self.values
    }

    /// Cleaned error output of a `Separator` batch in which some commands
    /// failed without stopping the rest; `None` when the batch exited zero.
    #[must_use]
    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    /// Keyed results of an `Object` batch.
    #[must_use]
    pub const fn fields(&self) -> &BTreeMap<String, BatchValue> {
        &self.fields
    }

    /// Returns the result at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::IndexOutOfRange`] when `index` is not below
    /// [`BatchResult::len`].
    pub fn get(&self, index: usize) -> Result<&BatchValue, BatchError> {
        self.values.get(index).ok_or(BatchError::IndexOutOfRange {
            index,
            len: self.values.len(),
        })
    }

    /// Returns the result at `index` rendered as text.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::IndexOutOfRange`] when `index` is invalid.
    pub fn get_string(&self, index: usize) -> Result<String, BatchError> {
        self.get(index).map(BatchValue::to_text)
    }

    /// Returns the keyed result stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::MissingField`] when the key is absent.
    pub fn field(&self, key: &str) -> Result<&BatchValue, BatchError> {
        self.fields.get(key).ok_or_else(|| BatchError::MissingField {
            key: key.to_owned(),
        })
    }
}

/// Decodes the combined output of a batch framed with `format`.
///
/// `Separator` output always yields one segment per sentinel-delimited
/// region, preserving empty segments; `Raw` output drops empty lines.
///
/// # Errors
///
/// Returns [`BatchError::Parse`] when `Array` or `Object` output is not
/// valid JSON of the expected shape.
pub fn parse_batch_result(output: &str, format: OutputFormat) -> Result<BatchResult, BatchError> {
    match format {
        OutputFormat::None => Ok(BatchResult::positional(format, Vec::new())),
        OutputFormat::Raw => Ok(BatchResult::positional(
            format,
            output
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| BatchValue::String(line.to_owned()))
                .collect(),
        )),
        OutputFormat::Separator => Ok(BatchResult::positional(
            format,
            output
                .split(BATCH_SENTINEL)
                .map(|segment| BatchValue::String(segment.trim().to_owned()))
                .collect(),
        )),
        OutputFormat::Array => match decode_json(output, format)? {
            Value::Array(items) => Ok(BatchResult::positional(
                format,
                items.into_iter().map(BatchValue::from).collect(),
            )),
            single => Ok(BatchResult::positional(format, vec![BatchValue::from(single)])),
        },
        OutputFormat::Object => match decode_json(output, format)? {
            Value::Object(map) => Ok(BatchResult {
                format,
                values: Vec::new(),
                fields: map
                    .into_iter()
                    .map(|(key, item)| (key, BatchValue::from(item)))
                    .collect(),
                diagnostic: None,
            }),
            other => Err(BatchError::Parse {
                format,
                message: format!("expected a JSON object, found {}", json_kind(&other)),
            }),
        },
    }
}

fn decode_json(output: &str, format: OutputFormat) -> Result<Value, BatchError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(BatchError::Parse {
            format,
            message: String::from("output was empty"),
        });
    }
    serde_json::from_str(trimmed).map_err(|err| BatchError::Parse {
        format,
        message: err.to_string(),
    })
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
