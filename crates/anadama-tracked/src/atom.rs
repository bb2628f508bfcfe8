use std::fmt;

use serde::{Deserialize, Serialize};

/// A single comparison value produced by [`crate::Tracked::compare`].
///
/// Atoms are persisted to the fingerprint store as a JSON array, so the
/// set of variants is restricted to what JSON can carry losslessly.
/// Variant order matters for deserialization: untagged decoding tries
/// `Uint` before `Int` so that non-negative integers round-trip into the
/// same variant they were written from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fingerprint {
    Null,
    Bool(bool),
    Uint(u64),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Fingerprint {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Fingerprint::Uint(u) => Some(*u as f64),
            Fingerprint::Int(i) => Some(*i as f64),
            Fingerprint::Float(f) => Some(*f),
            _ => None,
        }
    }
}

// Numeric atoms compare across variants: a function dependency may yield
// `Int(5)` which deserializes from the store as `Uint(5)`.
impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        use Fingerprint::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Uint(a), Uint(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Uint(a), Int(b)) | (Int(b), Uint(a)) => {
                i64::try_from(*a).map(|a| a == *b).unwrap_or(false)
            }
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Null => f.write_str("null"),
            Fingerprint::Bool(b) => b.fmt(f),
            Fingerprint::Uint(u) => u.fmt(f),
            Fingerprint::Int(i) => i.fmt(f),
            Fingerprint::Float(x) => x.fmt(f),
            Fingerprint::Text(s) => s.fmt(f),
        }
    }
}

impl From<u64> for Fingerprint {
    fn from(value: u64) -> Self {
        Fingerprint::Uint(value)
    }
}

impl From<i64> for Fingerprint {
    fn from(value: i64) -> Self {
        Fingerprint::Int(value)
    }
}

impl From<f64> for Fingerprint {
    fn from(value: f64) -> Self {
        Fingerprint::Float(value)
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Fingerprint::Text(value)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Fingerprint::Text(value.to_owned())
    }
}
