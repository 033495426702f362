//! Cleanup of PowerShell error streams.
//!
//! A non-interactive PowerShell host serialises its streams as CLIXML on
//! stderr, so an error read from the wire often looks like
//! `#< CLIXML <Objs><S S="Error">Boom_x000D__x000A_</S></Objs>` rather than
//! `Boom`. [`clean_error_output`] recovers the readable message and never
//! fails; anything it cannot interpret is returned unchanged.

use std::sync::LazyLock;

use quick_xml::Reader;
use quick_xml::escape::unescape;
use quick_xml::events::Event;
use regex::{Captures, Regex};

/// Header line emitted ahead of a CLIXML envelope.
pub const CLIXML_HEADER: &str = "#< CLIXML";

const ENVELOPE_OPEN: &str = "<Objs";
const ERROR_STREAM: &str = "Error";
const POSITION_MARKER: &str = "At line:";
const COMMAND_DELIMITER: &str = " : ";

static ERROR_NODE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?s)<S\s+S="Error"\s*>(.*?)</S>"#).ok());

static ESCAPED_CODE_UNIT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"_x([0-9A-Fa-f]{4})_").ok());

/// Extracts readable diagnostics from a possibly CLIXML-wrapped stream.
///
/// Plain text is returned as-is. For an envelope, every `Error` stream node
/// is collected by a strict XML parse, falling back to a pattern scan when
/// the envelope is malformed or truncated. Extracted text has its `_xHHHH_`
/// escapes decoded, stack continuation lines (`+ ...`) and `At line:`
/// markers removed, and blank lines dropped.
///
/// ```
/// use shellpool::interpreter::clean_error_output;
/// let raw = "#< CLIXML\n<Objs><S S=\"Error\">Boom_x000D__x000A_</S></Objs>";
/// assert_eq!(clean_error_output(raw), "Boom");
/// ```
#[must_use]
pub fn clean_error_output(text: &str) -> String {
    if !is_envelope(text) {
        return text.to_owned();
    }

    let nodes = match strict_error_nodes(text) {
        Ok(nodes) if !nodes.is_empty() => nodes,
        _ => lenient_error_nodes(text),
    };
    if nodes.is_empty() {
        return text.to_owned();
    }

    clean_lines(&nodes.concat())
}

/// Returns the first message segment of an error for concise display.
///
/// PowerShell formats errors as `Command : message`, so the first segment
/// delimited by ` : ` names the failing command, not the failure. That
/// segment is skipped and the one after it returned; for
/// `Get-Item : Cannot find path 'C:\x' because it does not exist.` the
/// result is the sentence after the command name. Only the spaced
/// delimiter counts, so drive letters and `HKLM:` paths are never split.
/// Without a delimiter the first non-blank line is returned.
#[must_use]
pub fn extract_primary_error(text: &str) -> String {
    let cleaned = clean_error_output(text);
    let Some(first_line) = cleaned.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return String::new();
    };

    let mut segments = first_line
        .split(COMMAND_DELIMITER)
        .map(str::trim)
        .filter(|segment| !segment.is_empty());
    match (segments.next(), segments.next()) {
        (Some(_), Some(message)) => message.to_owned(),
        (Some(only), None) => only.to_owned(),
        _ => first_line.to_owned(),
    }
}

fn is_envelope(text: &str) -> bool {
    text.contains(CLIXML_HEADER) || text.contains(ENVELOPE_OPEN)
}

fn strict_error_nodes(text: &str) -> Result<Vec<String>, String> {
    let start = text
        .find(ENVELOPE_OPEN)
        .ok_or_else(|| String::from("no envelope found"))?;
    let xml = text.get(start..).unwrap_or_default();
    let mut reader = Reader::from_str(xml);

    let mut nodes = Vec::new();
    let mut current: Option<String> = None;
    let mut depth = 0_usize;
    loop {
        match reader.read_event().map_err(|err| err.to_string())? {
            Event::Start(tag) => {
                depth += 1;
                if tag.name().as_ref() == b"S" {
                    let stream = tag
                        .try_get_attribute("S")
                        .map_err(|err| err.to_string())?
                        .map(|attr| attr.unescape_value().map(|value| value.into_owned()))
                        .transpose()
                        .map_err(|err| err.to_string())?;
                    current = (stream.as_deref() == Some(ERROR_STREAM)).then(String::new);
                }
            }
            Event::Text(body) => {
                if let Some(buffer) = current.as_mut() {
                    buffer.push_str(&body.unescape().map_err(|err| err.to_string())?);
                }
            }
            Event::End(tag) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| String::from("unbalanced closing tag"))?;
                if tag.name().as_ref() == b"S"
                    && let Some(buffer) = current.take()
                {
                    nodes.push(buffer);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth == 0 {
        Ok(nodes)
    } else {
        Err(String::from("envelope truncated"))
    }
}

fn lenient_error_nodes(text: &str) -> Vec<String> {
    let Some(pattern) = ERROR_NODE.as_ref() else {
        return Vec::new();
    };
    pattern
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .map(|body| {
            unescape(body.as_str()).map_or_else(|_| body.as_str().to_owned(), |value| value.into_owned())
        })
        .collect()
}

fn decode_code_units(text: &str) -> String {
    let Some(pattern) = ESCAPED_CODE_UNIT.as_ref() else {
        return text.to_owned();
    };
    pattern
        .replace_all(text, |captures: &Captures<'_>| {
            captures
                .get(1)
                .and_then(|hex| u32::from_str_radix(hex.as_str(), 16).ok())
                .and_then(char::from_u32)
                .map_or_else(
                    || captures.get(0).map_or("", |whole| whole.as_str()).to_owned(),
                    String::from,
                )
        })
        .into_owned()
}

fn clean_lines(raw: &str) -> String {
    decode_code_units(raw)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('+') && !line.starts_with(POSITION_MARKER))
        .collect::<Vec<_>>()
        .join("\n")
}
