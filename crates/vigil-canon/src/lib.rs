#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-canon** – Deterministic canonical byte encoding (§4.A).
//!
//! [`CanonValue`] is a small closed value tree covering every type
//! spec.md's canonical serializer must accept: strings, integers, finite
//! floats, booleans, null, byte strings, timestamps, UUIDs, ordered
//! sequences, and nested maps. [`canonicalize`] turns a value into the
//! unique UTF-8 byte string defined by spec.md 4.A: NFKC-normalized
//! strings, object keys in ascending code-point order, no whitespace,
//! seconds-precision UTC timestamps, lowercase UUIDs, lowercase hex
//! bytes. The function is pure, total on valid input, and rejects
//! non-finite floats as a fatal error (never silently coerced).

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;
use vigil_types::{VigilError, VigilResult};

/// A value accepted by the canonical serializer.
///
/// Map keys are plain (pre-normalization) `String`s; normalization and
/// ordering both happen inside [`canonicalize`] so equal keys that differ
/// only by Unicode representation collapse to the same canonical byte
/// string.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonValue {
    /// JSON-style null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer. Used for any whole-number field.
    Int(i64),
    /// Finite floating point number. Non-finite values are rejected at
    /// encode time, never at construction time, so callers can build a
    /// tree first and learn about the violation from `canonicalize`.
    Float(f64),
    /// UTF-8 string, NFKC-normalized during encoding.
    Str(String),
    /// Raw bytes, encoded as lowercase hex.
    Bytes(Vec<u8>),
    /// UTC timestamp, encoded with seconds precision.
    Timestamp(DateTime<Utc>),
    /// UUID, encoded in lowercase canonical (hyphenated) form.
    Uuid(Uuid),
    /// Ordered sequence; order is preserved exactly as given.
    Seq(Vec<CanonValue>),
    /// Map from string key to value. Keys are sorted by ascending
    /// Unicode code point (post NFKC-normalization) during encoding,
    /// independent of insertion order.
    Map(BTreeMap<String, CanonValue>),
}

impl CanonValue {
    /// Convenience constructor for a map from an iterator of pairs.
    pub fn map<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, CanonValue)>,
        K: Into<String>,
    {
        CanonValue::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Convert an arbitrary `serde_json::Value` into a `CanonValue` tree.
    ///
    /// Integral JSON numbers become [`CanonValue::Int`]; everything else
    /// numeric becomes [`CanonValue::Float`] (validated at encode time).
    /// This lets callers accept free-form JSON payloads (job payloads,
    /// deliberation result content) and still get a canonical hash.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => CanonValue::Null,
            serde_json::Value::Bool(b) => CanonValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CanonValue::Int(i)
                } else {
                    CanonValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => CanonValue::Str(s),
            serde_json::Value::Array(arr) => {
                CanonValue::Seq(arr.into_iter().map(CanonValue::from_json).collect())
            }
            serde_json::Value::Object(map) => CanonValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, CanonValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Encode `value` into the unique canonical UTF-8 byte string defined by
/// spec.md 4.A.
///
/// # Errors
/// Returns [`VigilError::Validation`] if a [`CanonValue::Float`] is NaN
/// or infinite. This is the only way encoding can fail.
pub fn canonicalize(value: &CanonValue) -> VigilResult<Vec<u8>> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out.into_bytes())
}

/// Canonicalize `value` and return its SHA-256 digest as a lowercase hex
/// string (64 characters).
pub fn canonical_hash(value: &CanonValue) -> VigilResult<String> {
    let bytes = canonicalize(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex_lower(&digest))
}

fn write_value(value: &CanonValue, out: &mut String) -> VigilResult<()> {
    match value {
        CanonValue::Null => out.push_str("null"),
        CanonValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        CanonValue::Int(i) => {
            let _ = write!(out, "{i}");
        }
        CanonValue::Float(f) => {
            if !f.is_finite() {
                return Err(VigilError::Validation(
                    "non-finite float in canonical payload".into(),
                ));
            }
            let _ = write!(out, "{f}");
        }
        CanonValue::Str(s) => write_json_string(&normalize(s), out),
        CanonValue::Bytes(b) => write_json_string(&hex_lower(b), out),
        CanonValue::Timestamp(ts) => {
            write_json_string(&ts.to_rfc3339_opts(SecondsFormat::Secs, true), out)
        }
        CanonValue::Uuid(u) => write_json_string(&u.hyphenated().to_string(), out),
        CanonValue::Seq(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        CanonValue::Map(map) => {
            // `BTreeMap<String, _>` already iterates in ascending
            // byte (== code-point, for valid UTF-8) order of its keys,
            // but keys must be normalized before comparison and before
            // emission, so normalize first into a fresh sorted map.
            let normalized: BTreeMap<String, &CanonValue> =
                map.iter().map(|(k, v)| (normalize(k), v)).collect();
            out.push('{');
            for (i, (k, v)) in normalized.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(k, out);
                out.push(':');
                write_value(v, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn normalize(s: &str) -> String {
    s.nfkc().collect()
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}
