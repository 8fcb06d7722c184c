//! Canonical CBOR encoding and strict decoding.
//!
//! Every digest and signature in this crate is computed over the byte output
//! of [`to_vec`], so encoding must be deterministic: the same logical value
//! always yields identical bytes. [`from_slice`] is the strict inverse and
//! rejects truncated input, trailing bytes, duplicate map keys and
//! non-canonical encodings.

use std::io::Cursor;

use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{de, ser, Deserialize, Serialize};

/// Errors raised while encoding or decoding CBOR.
#[derive(Debug, thiserror::Error)]
pub enum CborError {
    #[error("CBOR encoding failed: {0}")]
    Encoding(String),
    #[error("malformed CBOR: {0}")]
    Malformed(String),
    #[error("trailing bytes after CBOR value")]
    TrailingBytes,
    #[error("duplicate key in CBOR map")]
    DuplicateKey,
    #[error("non-canonical CBOR encoding")]
    NonCanonical,
    #[error("CBOR value does not match the expected structure: {0}")]
    Structure(String),
}

/// Encode a value to its canonical CBOR byte representation.
///
/// # Errors
/// Returns [`CborError::Encoding`] when the value cannot be represented as
/// CBOR (for example, a map key that does not serialize).
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, CborError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CborError::Encoding(e.to_string()))?;
    Ok(buf)
}

/// Decode a value from canonical CBOR bytes.
///
/// # Errors
/// Fails on truncated input ([`CborError::Malformed`]), bytes remaining after
/// the value ([`CborError::TrailingBytes`]), duplicate map keys
/// ([`CborError::DuplicateKey`]) and input whose re-encoding does not
/// reproduce the original bytes ([`CborError::NonCanonical`]).
pub fn from_slice<T: DeserializeOwned>(slice: &[u8]) -> Result<T, CborError> {
    let mut cursor = Cursor::new(slice);
    let value: Value =
        ciborium::from_reader(&mut cursor).map_err(|e| CborError::Malformed(e.to_string()))?;
    if usize::try_from(cursor.position()).unwrap_or(usize::MAX) != slice.len() {
        return Err(CborError::TrailingBytes);
    }
    check_unique_keys(&value)?;
    // The canonical form is whatever our own encoder produces, so an input is
    // canonical exactly when re-encoding the decoded value reproduces it.
    if to_vec(&value)? != slice {
        return Err(CborError::NonCanonical);
    }
    value.deserialized().map_err(|e| CborError::Structure(e.to_string()))
}

fn check_unique_keys(value: &Value) -> Result<(), CborError> {
    match value {
        Value::Map(entries) => {
            for (i, (key, val)) in entries.iter().enumerate() {
                if entries.iter().skip(i + 1).any(|(other, _)| other == key) {
                    return Err(CborError::DuplicateKey);
                }
                check_unique_keys(key)?;
                check_unique_keys(val)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(check_unique_keys),
        Value::Tag(_, inner) => check_unique_keys(inner),
        _ => Ok(()),
    }
}

/// Wrapper for types that are embedded as tagged CBOR bytes:
/// `#6.24(bstr .cbor T)`.
///
/// The tagged byte string is the unit over which digests are computed, so the
/// inner value is re-encoded with [`to_vec`] whenever bytes are needed.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag24<T>(pub T);

impl<T: Serialize> Tag24<T> {
    /// Canonical encoding of the tagged value, including the tag.
    ///
    /// # Errors
    /// Propagates encoding failures of the inner value.
    pub fn to_vec(&self) -> Result<Vec<u8>, CborError> {
        to_vec(self)
    }

    /// Canonical encoding of the inner value, without the tag.
    ///
    /// # Errors
    /// Propagates encoding failures of the inner value.
    pub fn inner_bytes(&self) -> Result<Vec<u8>, CborError> {
        to_vec(&self.0)
    }
}

impl<T: DeserializeOwned> TryFrom<Value> for Tag24<T> {
    type Error = CborError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Tag(24, inner) => match inner.as_ref() {
                Value::Bytes(bytes) => Ok(Self(from_slice(bytes)?)),
                other => Err(CborError::Structure(format!("tag 24 content is not bstr: {other:?}"))),
            },
            other => Err(CborError::Structure(format!("expected tag 24, found {other:?}"))),
        }
    }
}

impl<T: Serialize> Serialize for Tag24<T> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = to_vec(&self.0).map_err(ser::Error::custom)?;
        Value::Tag(24, Box::new(Value::Bytes(bytes))).serialize(serializer)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Tag24<T> {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        value.try_into().map_err(de::Error::custom)
    }
}

/// Serde adapter for `DateTime<Utc>` as a CBOR tag 0 (RFC 3339 text) value.
pub mod tdate {
    use chrono::{DateTime, SecondsFormat, Utc};
    use ciborium::Value;
    use serde::{de, Deserialize, Deserializer, Serialize as _, Serializer};

    /// Serialize a timestamp as `#6.0(tstr)`.
    ///
    /// # Errors
    /// Propagates serializer failures.
    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        let text = dt.to_rfc3339_opts(SecondsFormat::Secs, true);
        Value::Tag(0, Box::new(Value::Text(text))).serialize(serializer)
    }

    /// Deserialize a `#6.0(tstr)` timestamp.
    ///
    /// # Errors
    /// Fails when the value is not tag 0 text or not valid RFC 3339.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Value::Tag(0, inner) = value else {
            return Err(de::Error::custom("expected tag 0 date"));
        };
        let Value::Text(text) = *inner else {
            return Err(de::Error::custom("tag 0 content is not text"));
        };
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}
