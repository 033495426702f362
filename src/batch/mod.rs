//! Batching of several logical commands into one remote round trip.
//!
//! A [`BatchBuilder`] collects commands in order and renders them into a
//! single PowerShell script whose output is framed according to an
//! [`OutputFormat`]. [`parse_batch_result`] reverses the framing, yielding a
//! [`BatchResult`] aligned with the order in which commands were added.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::encoding::quote;

mod result;

pub use result::{BatchResult, BatchValue, parse_batch_result};

/// Statement separator used when joining batched commands.
pub const DEFAULT_SEPARATOR: &str = "; ";

/// Marker printed between command outputs under [`OutputFormat::Separator`].
pub const BATCH_SENTINEL: &str = "<<<SHELLPOOL-BATCH-BOUNDARY-7f3a9c>>>";

/// Variable that collects results under the `Array` and `Object` formats.
pub const RESULTS_VARIABLE: &str = "$shellpool_results";

/// Error action applied when none is configured explicitly.
pub const DEFAULT_ERROR_ACTION: &str = "Stop";

/// Error action applied to `Separator` batches unless overridden, so one
/// failing command does not abort the ones after it.
pub const SEPARATOR_ERROR_ACTION: &str = "Continue";

const JSON_DEPTH: u8 = 10;

/// Strategy used to frame the combined output of a batch.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum OutputFormat {
    /// Commands run for side effects only; output is not decoded.
    #[default]
    None,
    /// Each command's value is appended to a list serialised as JSON.
    Array,
    /// Commands assign into a shared map serialised as JSON.
    Object,
    /// Each command prints one line.
    Raw,
    /// A sentinel line is printed between command outputs.
    Separator,
}

impl OutputFormat {
    /// Lowercase name used in configuration and on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Array => "array",
            Self::Object => "object",
            Self::Raw => "raw",
            Self::Separator => "separator",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = BatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "array" => Ok(Self::Array),
            "object" => Ok(Self::Object),
            "raw" => Ok(Self::Raw),
            "separator" => Ok(Self::Separator),
            _ => Err(BatchError::UnknownFormat(value.to_owned())),
        }
    }
}

/// Errors raised while decoding or reading batch results.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BatchError {
    /// The combined output could not be decoded under the declared format.
    #[error("failed to parse {format} batch output: {message}")]
    Parse {
        /// Format the output was decoded under.
        format: OutputFormat,
        /// Decoder message.
        message: String,
    },
    /// A positional accessor was called with an invalid index.
    #[error("result index {index} out of range (valid range 0..{len})")]
    IndexOutOfRange {
        /// Requested position.
        index: usize,
        /// Number of results available.
        len: usize,
    },
    /// A keyed accessor was called with a key the map does not hold.
    #[error("result field {key:?} not present")]
    MissingField {
        /// Requested key.
        key: String,
    },
    /// An output format name was not recognised.
    #[error("unknown output format: {0}")]
    UnknownFormat(String),
}

/// Accumulates commands for a single batched round trip.
///
/// ```
/// use shellpool::batch::{BatchBuilder, OutputFormat};
///
/// let script = BatchBuilder::new()
///     .output_format(OutputFormat::Separator)
///     .add("hostname")
///     .add("(Get-Service W3SVC).Status")
///     .build();
/// assert_eq!(script.len(), 2);
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchBuilder {
    commands: Vec<String>,
    format: OutputFormat,
    error_action: Option<String>,
    separator: Option<String>,
}

impl BatchBuilder {
    /// Creates an empty builder using [`OutputFormat::None`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a command; its position becomes its result index.
    #[must_use]
    pub fn add(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    /// Appends every command from `commands` in iteration order.
    #[must_use]
    pub fn add_all<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
        self
    }

    /// Appends a command that only runs when `condition` is truthy remotely.
    #[must_use]
    pub fn add_conditional(self, condition: &str, command: &str) -> Self {
        self.add(format!("if ({condition}) {{ {command} }}"))
    }

    /// Selects the output framing strategy.
    #[must_use]
    pub const fn output_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Overrides `$ErrorActionPreference` for the batch. An empty policy
    /// omits the preamble entirely.
    #[must_use]
    pub fn error_action(mut self, policy: impl Into<String>) -> Self {
        self.error_action = Some(policy.into());
        self
    }

    /// Overrides the statement separator (default `; `).
    #[must_use]
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    /// Number of commands added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns `true` when no command has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Renders the batch into an immutable [`BatchScript`].
    ///
    /// An empty batch renders an empty script; running it is a no-op.
    #[must_use]
    pub fn build(self) -> BatchScript {
        let error_action = self.error_action.unwrap_or_else(|| {
            if self.format == OutputFormat::Separator {
                SEPARATOR_ERROR_ACTION.to_owned()
            } else {
                DEFAULT_ERROR_ACTION.to_owned()
            }
        });
        let separator = self
            .separator
            .unwrap_or_else(|| DEFAULT_SEPARATOR.to_owned());
        let script = if self.commands.is_empty() {
            String::new()
        } else {
            render(&self.commands, self.format, &error_action, &separator)
        };

        BatchScript {
            commands: self.commands,
            format: self.format,
            error_action,
            script,
        }
    }
}

/// A rendered batch ready to run through a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchScript {
    commands: Vec<String>,
    format: OutputFormat,
    error_action: String,
    script: String,
}

impl BatchScript {
    /// The rendered script text.
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// The framing strategy the script was rendered with.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// The error action applied by the script preamble.
    #[must_use]
    pub fn error_action(&self) -> &str {
        &self.error_action
    }

    /// The commands in the order they were added.
    #[must_use]
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Number of commands in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns `true` when the batch holds no commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Decodes `output` produced by running this script.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Parse`] when the output does not match the
    /// script's framing.
    pub fn parse(&self, output: &str) -> Result<BatchResult, BatchError> {
        parse_batch_result(output, self.format)
    }
}

/// Renders an `Object`-format assignment of `expression` under `key`.
#[must_use]
pub fn object_assignment(key: &str, expression: &str) -> String {
    format!("{RESULTS_VARIABLE}[{}] = ({expression})", quote(key))
}

fn render(commands: &[String], format: OutputFormat, error_action: &str, separator: &str) -> String {
    let mut statements = Vec::with_capacity(commands.len().saturating_mul(2) + 3);
    if !error_action.trim().is_empty() {
        statements.push(format!("$ErrorActionPreference = {}", quote(error_action)));
    }

    match format {
        OutputFormat::None | OutputFormat::Raw => {
            statements.extend(commands.iter().cloned());
        }
        OutputFormat::Separator => {
            let marker = format!("Write-Output {}", quote(BATCH_SENTINEL));
            for (index, command) in commands.iter().enumerate() {
                if index > 0 {
                    statements.push(marker.clone());
                }
                statements.push(command.clone());
            }
        }
        OutputFormat::Array => {
            statements.push(format!("{RESULTS_VARIABLE} = @()"));
            statements.extend(
                commands
                    .iter()
                    .map(|command| format!("{RESULTS_VARIABLE} += ,({command})")),
            );
            statements.push(serialise_results());
        }
        OutputFormat::Object => {
            statements.push(format!("{RESULTS_VARIABLE} = @{{}}"));
            statements.extend(commands.iter().cloned());
            statements.push(serialise_results());
        }
    }

    statements.join(separator)
}

fn serialise_results() -> String {
    format!("ConvertTo-Json -InputObject {RESULTS_VARIABLE} -Compress -Depth {JSON_DEPTH}")
}
