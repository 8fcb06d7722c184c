//! The attestation data model: issuer-signed attributes and the disclosure
//! response returned to a verifier.

use ciborium::Value;
use coset::CoseSign1;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::cbor::Tag24;
use crate::cose::CoseCbor;
use crate::mso::{DigestId, IssuerAuth, MobileSecurityObject};

pub type DocType = String;
pub type NameSpace = String;
pub type ElementIdentifier = String;

/// Length of the per-attribute random salt, in bytes.
pub const ATTRIBUTE_RANDOM_LENGTH: usize = 32;

/// Attributes disclosed per namespace, each hashed and signed by the issuer
/// in the mobile security object.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSigned {
    /// Disclosed data elements for each namespace.
    pub name_spaces: IndexMap<NameSpace, Vec<IssuerSignedItemBytes>>,

    /// The signed envelope over the mobile security object.
    pub issuer_auth: IssuerAuth,
}

/// An `IssuerSignedItem` as it travels and is digested: tagged CBOR bytes.
pub type IssuerSignedItemBytes = Tag24<IssuerSignedItem>;

/// A single issuer-signed attribute.
///
/// The digest listed in the mobile security object is the SHA-256 of the
/// tagged CBOR encoding of this structure, salt included, so an undisclosed
/// attribute cannot be brute-forced from its digest.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct IssuerSignedItem {
    /// Matches this item to its digest in the mobile security object.
    /// Unique within a namespace.
    #[serde(rename = "digestID")]
    pub digest_id: DigestId,

    /// Fresh random salt, generated once at issuance and never reused.
    pub random: ByteBuf,

    /// Data element identifier, for example `family_name`.
    #[serde(rename = "elementIdentifier")]
    pub element_identifier: ElementIdentifier,

    /// Data element value, for example `Jansen`.
    #[serde(rename = "elementValue")]
    pub element_value: Value,
}

/// The disclosure response sent to a verifier.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    /// Version of the response structure.
    pub version: String,

    /// Returned documents; absent when the request was declined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<Document>>,

    /// Overall status code. 0 is OK.
    pub status: u64,
}

impl DeviceResponse {
    pub(crate) const VERSION: &'static str = "1.0";
    pub(crate) const STATUS_OK: u64 = 0;
}

/// One disclosed document within a [`DeviceResponse`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Document type of the attestation, for example `org.iso.18013.5.1.mDL`.
    pub doc_type: DocType,

    /// The disclosed issuer-signed attributes and the security object.
    pub issuer_signed: IssuerSigned,

    /// Device-signed attributes and the device authentication signature.
    pub device_signed: DeviceSigned,
}

/// Data signed by the device rather than the issuer.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSigned {
    /// Self-asserted attributes, signed only by the device.
    pub name_spaces: Tag24<DeviceNameSpaces>,

    /// The device's signature binding this response to one session.
    pub device_auth: DeviceAuth,
}

/// Device-only attributes per namespace.
pub type DeviceNameSpaces = IndexMap<NameSpace, IndexMap<ElementIdentifier, Value>>;

/// The device authentication over the session transcript.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceAuth {
    /// ECDSA signature made with the device private key.
    DeviceSignature(CoseCbor<CoseSign1>),
}

/// A stored attestation on the holder side: the issuer-signed data plus the
/// identifier of the device private key it is bound to.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mdoc {
    /// Document type of the attestation.
    pub doc_type: DocType,

    /// All issuer-signed attributes, as received at issuance.
    pub issuer_signed: IssuerSigned,

    /// Key store identifier of the bound device private key.
    pub device_key_id: String,
}

/// Identifies one attribute across doc types and namespaces.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttributeIdentifier {
    pub doc_type: DocType,
    pub namespace: NameSpace,
    pub attribute: ElementIdentifier,
}

impl Mdoc {
    /// All attribute identifiers present in this attestation.
    #[must_use]
    pub fn attribute_identifiers(&self) -> IndexSet<AttributeIdentifier> {
        self.issuer_signed
            .name_spaces
            .iter()
            .flat_map(|(namespace, items)| {
                items.iter().map(|item| AttributeIdentifier {
                    doc_type: self.doc_type.clone(),
                    namespace: namespace.clone(),
                    attribute: item.0.element_identifier.clone(),
                })
            })
            .collect()
    }

    /// The mobile security object carried in `issuer_auth`.
    ///
    /// # Errors
    /// Fails when the envelope has no payload or the payload does not decode.
    pub fn mso(&self) -> Result<MobileSecurityObject, crate::cbor::CborError> {
        mso_from_auth(&self.issuer_signed.issuer_auth)
    }
}

pub(crate) fn mso_from_auth(
    issuer_auth: &IssuerAuth,
) -> Result<MobileSecurityObject, crate::cbor::CborError> {
    let payload = issuer_auth
        .0
        .payload
        .as_ref()
        .ok_or_else(|| crate::cbor::CborError::Structure("issuerAuth has no payload".into()))?;
    let tagged: Tag24<MobileSecurityObject> = crate::cbor::from_slice(payload)?;
    Ok(tagged.0)
}

/// A disclosed attribute as returned by the verifier: identifier plus value.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Entry {
    /// The element identifier.
    pub name: ElementIdentifier,
    /// The element value.
    pub value: Value,
}

/// Verified output of the disclosure engine: disclosed attributes per doc
/// type and namespace. Contains exactly the disclosed attributes, nothing
/// else.
pub type DisclosedAttributes = IndexMap<DocType, IndexMap<NameSpace, Vec<Entry>>>;
