//! Command encoding for transport to a remote PowerShell interpreter.
//!
//! Three tools live here. [`quote`] embeds a value inside a larger command
//! template. [`encode`] turns a whole command into a single opaque token
//! that survives any transport. [`validate_argument`] is a conservative
//! check applied to untrusted input before interpolation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

/// Interpreter invocation used when shipping an encoded command.
pub const POWERSHELL_INVOCATION: &str = "powershell.exe -NoLogo -NoProfile -NonInteractive";

/// Characters rejected by [`validate_argument`].
///
/// The hyphen is included even though it rejects legitimate data such as a
/// registry value of `-1`; relaxing it changes the security posture.
pub const FORBIDDEN_ARGUMENT_CHARS: &[char] = &[
    ';', '|', '&', '$', '(', ')', '`', '<', '>', '{', '}', '\n', '\r', '\0', '-',
];

/// Errors raised while encoding, decoding, or validating command content.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EncodingError {
    /// The argument contains a character associated with chaining or
    /// substitution.
    #[error("argument contains forbidden character {character:?}: {argument}")]
    ForbiddenCharacter {
        /// Offending argument, as supplied.
        argument: String,
        /// First forbidden character found.
        character: char,
    },
    /// The encoded payload is not valid base64.
    #[error("encoded command is not valid base64: {0}")]
    Base64(String),
    /// The decoded payload does not hold whole UTF-16 code units.
    #[error("encoded command has an odd byte length ({0})")]
    OddLength(usize),
    /// The decoded payload is not valid UTF-16.
    #[error("encoded command is not valid UTF-16: {0}")]
    Utf16(String),
}

/// Wraps `value` in a single-quoted PowerShell string literal.
///
/// Single quotes inside the value are doubled, which is the only escape a
/// single-quoted PowerShell literal recognises.
///
/// ```
/// use shellpool::encoding::quote;
/// assert_eq!(quote("C:\\Program Files"), "'C:\\Program Files'");
/// assert_eq!(quote("it's"), "'it''s'");
/// ```
#[must_use]
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push('\'');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

/// Encodes `command` as base64 over its UTF-16LE code units.
///
/// This is the representation accepted by `powershell.exe -EncodedCommand`.
/// The output alphabet contains no shell metacharacters, so the token can be
/// passed through any intermediate shell untouched.
#[must_use]
#[expect(
    clippy::little_endian_bytes,
    reason = "PowerShell expects UTF-16LE regardless of host byte order"
)]
pub fn encode(command: &str) -> String {
    let bytes = command
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect::<Vec<u8>>();
    STANDARD.encode(bytes)
}

/// Reverses [`encode`].
///
/// # Errors
///
/// Returns [`EncodingError`] when the payload is not base64, has an odd byte
/// count, or contains unpaired surrogates.
#[expect(
    clippy::little_endian_bytes,
    reason = "PowerShell emits UTF-16LE regardless of host byte order"
)]
pub fn decode(encoded: &str) -> Result<String, EncodingError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|err| EncodingError::Base64(err.to_string()))?;
    let pairs = bytes.chunks_exact(2);
    if !pairs.remainder().is_empty() {
        return Err(EncodingError::OddLength(bytes.len()));
    }

    let units = pairs
        .map(|pair| match pair {
            [low, high] => u16::from_le_bytes([*low, *high]),
            _ => 0,
        })
        .collect::<Vec<u16>>();
    String::from_utf16(&units).map_err(|err| EncodingError::Utf16(err.to_string()))
}

/// Renders the interpreter invocation that runs `command` as one opaque unit.
#[must_use]
pub fn encoded_command(command: &str) -> String {
    format!("{POWERSHELL_INVOCATION} -EncodedCommand {}", encode(command))
}

/// Rejects arguments containing shell metacharacters.
///
/// This is a defence-in-depth check for untrusted values before they are
/// interpolated into a command template. It is independent of [`quote`] and
/// [`encode`].
///
/// # Errors
///
/// Returns [`EncodingError::ForbiddenCharacter`] naming the first offending
/// character.
pub fn validate_argument(argument: &str) -> Result<(), EncodingError> {
    argument
        .chars()
        .find(|ch| FORBIDDEN_ARGUMENT_CHARS.contains(ch))
        .map_or(Ok(()), |character| {
            Err(EncodingError::ForbiddenCharacter {
                argument: argument.to_owned(),
                character,
            })
        })
}
