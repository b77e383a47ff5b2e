//! Wire encodings shared across the receipt and ledger surfaces.
//!
//! Binary receipt fields travel as base64url without padding; leaf and root
//! hashes travel as lowercase hex. Decoding is lenient about the encoding a
//! peer produced (padded or standard-alphabet base64 is normalized before
//! decoding), encoding is not: this crate only ever emits the canonical
//! forms.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Errors from decoding wire-format fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    InvalidBase64 { field: &'static str },
    InvalidHex { field: &'static str },
    BadLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl EncodingError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidBase64 { .. } | Self::InvalidHex { .. } => "E_STRUCT_TYPE",
            Self::BadLength { .. } => "E_STRUCT_LEN",
        }
    }
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBase64 { field } => {
                write!(f, "E_STRUCT_TYPE: field {field} is not valid base64url")
            }
            Self::InvalidHex { field } => {
                write!(f, "E_STRUCT_TYPE: field {field} is not valid hex")
            }
            Self::BadLength {
                field,
                expected,
                actual,
            } => write!(
                f,
                "E_STRUCT_LEN: field {field} decodes to {actual} bytes, expected {expected}"
            ),
        }
    }
}

impl std::error::Error for EncodingError {}

/// Encode bytes as base64url without padding.
#[must_use]
pub fn b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode a base64url value, normalizing candidate encodings first:
/// padding is stripped and the standard alphabet (`+`, `/`) is mapped to the
/// url-safe one (`-`, `_`).
pub fn decode_b64url(field: &'static str, value: &str) -> Result<Vec<u8>, EncodingError> {
    let normalized: String = value
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|_| EncodingError::InvalidBase64 { field })
}

/// Decode a base64url value and require an exact byte length.
pub fn decode_b64url_exact(
    field: &'static str,
    value: &str,
    expected: usize,
) -> Result<Vec<u8>, EncodingError> {
    let bytes = decode_b64url(field, value)?;
    if bytes.len() != expected {
        return Err(EncodingError::BadLength {
            field,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Decode a lowercase-hex 32-byte digest (leaf hashes, tree roots).
pub fn decode_hex32(field: &'static str, value: &str) -> Result<[u8; 32], EncodingError> {
    let bytes = hex::decode(value).map_err(|_| EncodingError::InvalidHex { field })?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| EncodingError::BadLength {
            field,
            expected: 32,
            actual: len,
        })
}
