//! The mobile security object (MSO): the issuer-signed structure listing the
//! digest of every attribute and the device key the attestation is bound to.
//!
//! Verifying a disclosure means recomputing the digest of each disclosed
//! attribute and checking it against this list, then checking the device
//! signature against the key bound here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use coset::CoseSign1;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::cbor;
use crate::cose::{CoseCbor, CoseKey};
use crate::mdoc::{DocType, NameSpace};

/// The issuer's signed envelope: `COSE_Sign1` with a payload of
/// `MobileSecurityObjectBytes`.
pub type IssuerAuth = CoseCbor<CoseSign1>;

/// Digests per namespace, keyed by digest id.
pub type ValueDigests = BTreeMap<NameSpace, DigestIds>;
pub type DigestIds = BTreeMap<DigestId, Digest>;

/// Matches a digest in the MSO to an attribute in the response. Unique
/// within a namespace.
pub type DigestId = u64;

/// SHA-256 over the tagged CBOR encoding of an `IssuerSignedItem`.
pub type Digest = ByteBuf;

/// The security object itself.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MobileSecurityObject {
    /// Structure version. Must be `1.0`.
    pub version: Version,

    /// Digest algorithm used for `value_digests`.
    pub digest_algorithm: DigestAlgorithm,

    /// Digest of every attribute in every namespace, disclosed or not.
    pub value_digests: ValueDigests,

    /// The device public key this attestation is bound to.
    pub device_key_info: DeviceKeyInfo,

    /// Document type of the attestation.
    pub doc_type: DocType,

    /// Validity window of the attestation.
    pub validity_info: ValidityInfo,
}

/// MSO structure version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Version {
    #[serde(rename = "1.0")]
    V1_0,
}

/// Digest algorithm used in the MSO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum DigestAlgorithm {
    #[serde(rename = "SHA-256")]
    Sha256,
}

/// The device public key and what it is authorized to sign for.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeyInfo {
    /// The device public key, as an untagged `COSE_Key`.
    pub device_key: CoseKey,

    /// Namespaces and data elements the key may sign for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_authorizations: Option<KeyAuthorizations>,
}

/// Namespaces and data elements a device key is authorized for.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAuthorizations {
    /// Entire namespaces the key is authorized for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_spaces: Option<Vec<NameSpace>>,

    /// Individual data elements per namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_elements: Option<BTreeMap<NameSpace, Vec<String>>>,
}

/// Validity window of the attestation.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidityInfo {
    /// Time the MSO was signed.
    #[serde(with = "cbor::tdate")]
    pub signed: DateTime<Utc>,

    /// Start of the validity window. Not before `signed`.
    #[serde(with = "cbor::tdate")]
    pub valid_from: DateTime<Utc>,

    /// End of the validity window. After `valid_from`.
    #[serde(with = "cbor::tdate")]
    pub valid_until: DateTime<Utc>,
}

impl ValidityInfo {
    /// Whether `at_time` falls inside the validity window.
    #[must_use]
    pub fn contains(&self, at_time: DateTime<Utc>) -> bool {
        self.valid_from <= at_time && at_time <= self.valid_until
    }
}

/// Allocates digest ids within one namespace: deterministic, gapless,
/// monotonically increasing from zero.
#[derive(Debug, Default)]
pub struct DigestIdGenerator {
    next: DigestId,
}

impl DigestIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next digest id.
    pub fn gen(&mut self) -> DigestId {
        let id = self.next;
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn digest_ids_are_gapless_from_zero() {
        let mut gen = DigestIdGenerator::new();
        let ids: Vec<_> = (0..5).map(|_| gen.gen()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn validity_window_bounds_are_inclusive() {
        let now = Utc::now();
        let validity = ValidityInfo {
            signed: now,
            valid_from: now,
            valid_until: now + Duration::days(365),
        };

        assert!(validity.contains(now));
        assert!(validity.contains(now + Duration::days(365)));
        assert!(!validity.contains(now - Duration::seconds(1)));
        assert!(!validity.contains(now + Duration::days(366)));
    }

    #[test]
    fn validity_info_roundtrips_through_cbor() {
        let now = Utc::now();
        let validity = ValidityInfo {
            signed: now,
            valid_from: now,
            valid_until: now + Duration::days(30),
        };

        let bytes = cbor::to_vec(&validity).unwrap();
        let decoded: ValidityInfo = cbor::from_slice(&bytes).unwrap();
        // Tag 0 text has second precision.
        assert_eq!(decoded.signed.timestamp(), validity.signed.timestamp());
        assert_eq!(decoded.valid_until.timestamp(), validity.valid_until.timestamp());
    }
}
