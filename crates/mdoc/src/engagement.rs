//! Session binding structures: device engagement, handover and the session
//! transcript.
//!
//! The transcript is the ordered tuple of device-engagement bytes, reader
//! key bytes and the handover structure. Its hash is signed into both the
//! reader and device authentication signatures, which is what prevents a
//! response from being replayed into a different session.

use ciborium::Value;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;

use crate::cbor::Tag24;
use crate::cose::CoseKey;
use crate::mdoc::{DeviceNameSpaces, DocType};

/// Tagged engagement bytes as bound into the transcript.
pub type DeviceEngagementBytes = Tag24<DeviceEngagement>;

/// Tagged reader ephemeral key bytes as bound into the transcript.
pub type EReaderKeyBytes = Tag24<CoseKey>;

/// Describes the device's capabilities and ephemeral session key, produced
/// when a disclosure session is started.
///
/// Encoded as an integer-keyed map: `{0: version, 1: security}`.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceEngagement {
    /// Engagement structure version.
    pub version: String,

    /// Cipher suite and the device's ephemeral public key.
    pub security: Security,
}

impl DeviceEngagement {
    pub(crate) const VERSION: &'static str = "1.0";
}

/// Cipher suite identifier plus the device ephemeral key, encoded as a
/// 2-element array.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Security(pub u64, pub Tag24<CoseKey>);

/// Cipher suite 1: EC on P-256.
pub const CIPHER_SUITE_P256: u64 = 1;

impl Serialize for DeviceEngagement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let security =
            Value::serialized(&self.security).map_err(serde::ser::Error::custom)?;
        Value::Map(vec![
            (Value::Integer(0.into()), Value::Text(self.version.clone())),
            (Value::Integer(1.into()), security),
        ])
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DeviceEngagement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Value::Map(entries) = Value::deserialize(deserializer)? else {
            return Err(de::Error::custom("device engagement is not a map"));
        };

        let mut version = None;
        let mut security = None;
        for (key, value) in entries {
            match key {
                Value::Integer(i) if i == 0.into() => {
                    version = value.into_text().ok();
                }
                Value::Integer(i) if i == 1.into() => {
                    security = Some(value.deserialized().map_err(de::Error::custom)?);
                }
                _ => {}
            }
        }

        Ok(Self {
            version: version.ok_or_else(|| de::Error::custom("missing engagement version"))?,
            security: security.ok_or_else(|| de::Error::custom("missing engagement security"))?,
        })
    }
}

/// How the engagement was handed from device to reader.
#[derive(Clone, Debug, PartialEq)]
pub enum Handover {
    /// QR engagement: encoded as null.
    Qr,
    /// NFC engagement: handover select message plus optional request message.
    Nfc {
        handover_select: ByteBuf,
        handover_request: Option<ByteBuf>,
    },
}

impl Serialize for Handover {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Qr => Value::Null.serialize(serializer),
            Self::Nfc { handover_select, handover_request } => {
                let request = handover_request
                    .as_ref()
                    .map_or(Value::Null, |bytes| Value::Bytes(bytes.to_vec()));
                Value::Array(vec![Value::Bytes(handover_select.to_vec()), request])
                    .serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for Handover {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(Self::Qr),
            Value::Array(items) => {
                let mut items = items.into_iter();
                let select = match items.next() {
                    Some(Value::Bytes(bytes)) => ByteBuf::from(bytes),
                    _ => return Err(de::Error::custom("missing handover select message")),
                };
                let request = match items.next() {
                    None | Some(Value::Null) => None,
                    Some(Value::Bytes(bytes)) => Some(ByteBuf::from(bytes)),
                    Some(_) => return Err(de::Error::custom("malformed handover request message")),
                };
                Ok(Self::Nfc { handover_select: select, handover_request: request })
            }
            _ => Err(de::Error::custom("malformed handover")),
        }
    }
}

/// The transcript of the session so far, encoded as a 3-element array. Both
/// sides compute it independently; it is never transmitted.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SessionTranscript(
    pub DeviceEngagementBytes,
    pub EReaderKeyBytes,
    pub Handover,
);

/// The structure the device signs when disclosing: a fixed context string,
/// the session transcript, the doc type and the device-signed attributes.
/// Acts as the challenge in the challenge-response between reader and
/// device.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DeviceAuthentication(
    String,
    pub SessionTranscript,
    pub DocType,
    pub Tag24<DeviceNameSpaces>,
);

impl DeviceAuthentication {
    const CONTEXT: &'static str = "DeviceAuthentication";

    #[must_use]
    pub fn new(
        transcript: SessionTranscript, doc_type: DocType, name_spaces: Tag24<DeviceNameSpaces>,
    ) -> Self {
        Self(Self::CONTEXT.to_string(), transcript, doc_type, name_spaces)
    }
}

/// The structure a reader signs over its request: a fixed context string,
/// the session transcript and the request bytes.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ReaderAuthentication(
    String,
    pub SessionTranscript,
    pub Tag24<crate::request::ItemsRequest>,
);

impl ReaderAuthentication {
    const CONTEXT: &'static str = "ReaderAuthentication";

    #[must_use]
    pub fn new(
        transcript: SessionTranscript, items_request: Tag24<crate::request::ItemsRequest>,
    ) -> Self {
        Self(Self::CONTEXT.to_string(), transcript, items_request)
    }
}
