//! The issuance engine: turns attribute values into a digested,
//! issuer-signed attestation bound to a device key.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use ciborium::Value;
use indexmap::IndexMap;
use p256::ecdsa::VerifyingKey;
use rand::{thread_rng, Rng};
use serde_bytes::ByteBuf;
use sha2::{Digest as _, Sha256};

use crate::cbor::{CborError, Tag24};
use crate::cose::{self, CoseError};
use crate::keys::Signer;
use crate::mdoc::{
    ElementIdentifier, IssuerSigned, IssuerSignedItem, NameSpace, ATTRIBUTE_RANDOM_LENGTH,
};
use crate::mso::{
    DeviceKeyInfo, DigestAlgorithm, DigestIdGenerator, KeyAuthorizations, MobileSecurityObject,
    ValidityInfo, Version,
};
use crate::x509::Certificate;

/// Attribute values to issue, per namespace, in issuance order.
pub type UnsignedAttributes = IndexMap<NameSpace, Vec<(ElementIdentifier, Value)>>;

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("no attributes to issue")]
    NoAttributes,
    #[error("validity window is inverted")]
    InvalidValidity,
    #[error(transparent)]
    Cbor(#[from] CborError),
    #[error(transparent)]
    Cose(#[from] CoseError),
}

/// Issue an attestation over `attributes`, bound to `device_key` and signed
/// by the issuer key behind `signer`.
///
/// Every attribute gets a fresh 32-byte random salt and a digest id that is
/// gapless and monotonically increasing within its namespace. The issuer
/// private key is used through the [`Signer`] seam only; its bytes never
/// enter this process.
///
/// # Errors
/// [`IssueError::NoAttributes`] when `attributes` is empty or contains an
/// empty namespace (issuance is all-or-nothing), [`IssueError::InvalidValidity`]
/// when the window is inverted, otherwise encoding and signing failures.
pub async fn issue(
    doc_type: &str, attributes: UnsignedAttributes, device_key: &VerifyingKey,
    validity: ValidityInfo, chain: &[Certificate], signer: &impl Signer,
) -> Result<IssuerSigned, IssueError> {
    if attributes.is_empty() || attributes.values().any(Vec::is_empty) {
        return Err(IssueError::NoAttributes);
    }
    if validity.valid_from > validity.valid_until || validity.signed > validity.valid_from {
        return Err(IssueError::InvalidValidity);
    }

    let mut mso = MobileSecurityObject {
        version: Version::V1_0,
        digest_algorithm: DigestAlgorithm::Sha256,
        value_digests: std::collections::BTreeMap::new(),
        device_key_info: DeviceKeyInfo {
            device_key: device_key.try_into()?,
            key_authorizations: Some(KeyAuthorizations {
                name_spaces: Some(attributes.keys().cloned().collect()),
                data_elements: None,
            }),
        },
        doc_type: doc_type.to_string(),
        validity_info: validity,
    };

    let mut name_spaces = IndexMap::new();
    let mut used_salts = HashSet::new();

    for (name_space, elements) in attributes {
        let mut id_gen = DigestIdGenerator::new();
        let mut items = Vec::with_capacity(elements.len());

        for (element_identifier, element_value) in elements {
            let item = Tag24(IssuerSignedItem {
                digest_id: id_gen.gen(),
                random: fresh_salt(&mut used_salts),
                element_identifier,
                element_value,
            });

            let digest = Sha256::digest(item.to_vec()?);
            mso.value_digests
                .entry(name_space.clone())
                .or_default()
                .insert(item.0.digest_id, ByteBuf::from(digest.to_vec()));

            items.push(item);
        }

        name_spaces.insert(name_space, items);
    }

    let mso_bytes = Tag24(mso).to_vec()?;
    let issuer_auth = cose::sign(mso_bytes, chain, signer).await?;

    tracing::debug!(doc_type, "issued attestation");

    Ok(IssuerSigned { name_spaces, issuer_auth: crate::cose::CoseCbor(issuer_auth) })
}

/// Helper to issue at a fixed validity window starting now.
#[must_use]
pub fn validity_for(now: DateTime<Utc>, valid_days: i64) -> ValidityInfo {
    ValidityInfo {
        signed: now,
        valid_from: now,
        valid_until: now + chrono::Duration::days(valid_days),
    }
}

// Salts must never repeat within an attestation; a 32-byte collision from the
// OS RNG is effectively impossible, but the invariant is cheap to enforce.
fn fresh_salt(used: &mut HashSet<[u8; ATTRIBUTE_RANDOM_LENGTH]>) -> ByteBuf {
    loop {
        let salt: [u8; ATTRIBUTE_RANDOM_LENGTH] = thread_rng().gen();
        if used.insert(salt) {
            return ByteBuf::from(salt.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use indexmap::indexmap;

    use super::*;
    use crate::keys::SoftwareEcdsaKey;

    fn dataset() -> UnsignedAttributes {
        indexmap! {
            "org.iso.18013.5.1".to_string() => vec![
                ("family_name".to_string(), Value::Text("Jansen".into())),
                ("given_name".to_string(), Value::Text("Willeke".into())),
            ],
        }
    }

    #[tokio::test]
    async fn issuance_digests_every_attribute() {
        let issuer = SoftwareEcdsaKey::random();
        let device = SoftwareEcdsaKey::random();

        let signed = issue(
            "org.iso.18013.5.1.mDL",
            dataset(),
            &device.public_key(),
            validity_for(Utc::now(), 365),
            &[],
            &issuer,
        )
        .await
        .unwrap();

        let mso = crate::mdoc::mso_from_auth(&signed.issuer_auth).unwrap();
        let digests = &mso.value_digests["org.iso.18013.5.1"];
        assert_eq!(digests.len(), 2);
        // Gapless ids from zero.
        assert_eq!(digests.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn salts_are_fresh_per_issuance() {
        let issuer = SoftwareEcdsaKey::random();
        let device = SoftwareEcdsaKey::random();
        let validity = validity_for(Utc::now(), 365);

        let first = issue(
            "doc", dataset(), &device.public_key(), validity.clone(), &[], &issuer,
        )
        .await
        .unwrap();
        let second = issue(
            "doc", dataset(), &device.public_key(), validity, &[], &issuer,
        )
        .await
        .unwrap();

        let salt = |signed: &IssuerSigned, i: usize| {
            signed.name_spaces["org.iso.18013.5.1"][i].0.random.clone()
        };
        // Distinct between issuances of identical values, and within one.
        assert_ne!(salt(&first, 0), salt(&second, 0));
        assert_ne!(salt(&first, 0), salt(&first, 1));
        assert_eq!(salt(&first, 0).len(), ATTRIBUTE_RANDOM_LENGTH);

        // Different salts mean different digests for the same value.
        let mso_first = crate::mdoc::mso_from_auth(&first.issuer_auth).unwrap();
        let mso_second = crate::mdoc::mso_from_auth(&second.issuer_auth).unwrap();
        assert_ne!(
            mso_first.value_digests["org.iso.18013.5.1"][&0],
            mso_second.value_digests["org.iso.18013.5.1"][&0],
        );
    }

    #[tokio::test]
    async fn empty_attribute_set_is_rejected() {
        let issuer = SoftwareEcdsaKey::random();
        let device = SoftwareEcdsaKey::random();

        let err = issue(
            "doc",
            UnsignedAttributes::new(),
            &device.public_key(),
            validity_for(Utc::now(), 365),
            &[],
            &issuer,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IssueError::NoAttributes));
    }

    #[tokio::test]
    async fn inverted_validity_is_rejected() {
        let issuer = SoftwareEcdsaKey::random();
        let device = SoftwareEcdsaKey::random();
        let now = Utc::now();
        let validity = ValidityInfo {
            signed: now,
            valid_from: now,
            valid_until: now - chrono::Duration::days(1),
        };

        let err = issue("doc", dataset(), &device.public_key(), validity, &[], &issuer)
            .await
            .unwrap_err();
        assert!(matches!(err, IssueError::InvalidValidity));
    }
}
