//! Canonical byte representation of receipt-shaped values.
//!
//! The rules are frozen: compact JSON, UTF-8, object keys sorted ascending by
//! code point, arrays in caller order, integers only, binary fields carried
//! as the base64url strings the caller supplied. Every signature and every
//! leaf hash in the system is computed over these bytes, so any change here
//! invalidates all previously issued receipts.

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Errors raised when a value cannot be canonicalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalError {
    /// Non-integer number in the signed payload.
    Float { path: String },
    /// The same key appeared twice in one object.
    DuplicateKey { key: String },
    /// A value kind the canonical form does not admit.
    UnsupportedType { path: String, kind: &'static str },
}

impl CanonicalError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Float { .. } => "E_C14N_FLOAT",
            Self::DuplicateKey { .. } => "E_C14N_DUPLICATE_KEY",
            Self::UnsupportedType { .. } => "E_C14N_TYPE",
        }
    }
}

impl std::fmt::Display for CanonicalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float { path } => {
                write!(f, "E_C14N_FLOAT: non-integer number at {path}")
            }
            Self::DuplicateKey { key } => {
                write!(f, "E_C14N_DUPLICATE_KEY: key {key} appears more than once")
            }
            Self::UnsupportedType { path, kind } => {
                write!(f, "E_C14N_TYPE: {kind} at {path} is not canonicalizable")
            }
        }
    }
}

impl std::error::Error for CanonicalError {}

/// Produce the canonical byte representation of a JSON value.
///
/// Keys are emitted in ascending code-point order regardless of how the
/// value was assembled; numbers must be integers.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let canonical = canonicalize_value(value, "$")?;
    // serde_json writes compact output with standard JSON escaping only.
    let text = serde_json::to_string(&canonical).map_err(|_| CanonicalError::UnsupportedType {
        path: "$".to_string(),
        kind: "unserializable",
    })?;
    Ok(text.into_bytes())
}

/// Parse raw JSON text and canonicalize it, rejecting duplicate object keys.
///
/// `serde_json` silently keeps the last duplicate, which would let two
/// distinct byte strings canonicalize to the same payload; untrusted receipt
/// text therefore goes through this entry point.
pub fn canonical_bytes_from_slice(text: &[u8]) -> Result<Vec<u8>, CanonicalError> {
    let mut deserializer = serde_json::Deserializer::from_slice(text);
    let checked = DupCheckedValue::deserialize(&mut deserializer).map_err(classify_parse_error)?;
    deserializer.end().map_err(classify_parse_error)?;
    canonical_bytes(&checked.0)
}

/// SHA-256 over the canonical bytes of a value.
pub fn canonical_digest(value: &Value) -> Result<[u8; 32], CanonicalError> {
    let bytes = canonical_bytes(value)?;
    Ok(sha256(&bytes))
}

/// Plain SHA-256, used for canonical digests and opaque input/output hashing.
#[must_use]
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn canonicalize_value(value: &Value, path: &str) -> Result<Value, CanonicalError> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            let mut canonical = Map::with_capacity(entries.len());
            for (key, nested) in entries {
                let child_path = format!("{path}.{key}");
                canonical.insert(key.clone(), canonicalize_value(nested, &child_path)?);
            }
            Ok(Value::Object(canonical))
        }
        Value::Array(values) => {
            let mut canonical = Vec::with_capacity(values.len());
            for (idx, nested) in values.iter().enumerate() {
                let child_path = format!("{path}[{idx}]");
                canonical.push(canonicalize_value(nested, &child_path)?);
            }
            Ok(Value::Array(canonical))
        }
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Ok(value.clone())
            } else {
                Err(CanonicalError::Float {
                    path: path.to_string(),
                })
            }
        }
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(value.clone()),
    }
}

const DUPLICATE_KEY_MARKER: &str = "duplicate object key: ";

fn classify_parse_error(err: serde_json::Error) -> CanonicalError {
    let message = err.to_string();
    if let Some(rest) = message.strip_prefix(DUPLICATE_KEY_MARKER) {
        let key = rest.split(" at ").next().unwrap_or(rest);
        return CanonicalError::DuplicateKey {
            key: key.to_string(),
        };
    }
    CanonicalError::UnsupportedType {
        path: "$".to_string(),
        kind: "malformed JSON",
    }
}

/// A `serde_json::Value` that fails deserialization on duplicate map keys.
struct DupCheckedValue(Value);

impl<'de> Deserialize<'de> for DupCheckedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = DupCheckedValue;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("any JSON value without duplicate object keys")
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(DupCheckedValue(Value::Bool(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(DupCheckedValue(Value::from(v)))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
                Ok(DupCheckedValue(Value::from(v)))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
                Ok(DupCheckedValue(Value::from(v)))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(DupCheckedValue(Value::String(v.to_string())))
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(DupCheckedValue(Value::Null))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut values = Vec::new();
                while let Some(element) = seq.next_element::<DupCheckedValue>()? {
                    values.push(element.0);
                }
                Ok(DupCheckedValue(Value::Array(values)))
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut map = Map::new();
                while let Some(key) = access.next_key::<String>()? {
                    let value = access.next_value::<DupCheckedValue>()?;
                    if map.insert(key.clone(), value.0).is_some() {
                        return Err(de::Error::custom(format!("{DUPLICATE_KEY_MARKER}{key}")));
                    }
                }
                Ok(DupCheckedValue(Value::Object(map)))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}
