//! The verifier side of the disclosure engine.
//!
//! Verification is stateless and all-or-nothing: each step is a hard
//! failure point, and a single bad digest or signature rejects the entire
//! response. Tamper failures are deliberately coarse-grained so a malicious
//! holder cannot use error detail as an oracle.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use p256::ecdsa::VerifyingKey;
use sha2::{Digest as _, Sha256};

use crate::cbor::{CborError, Tag24};
use crate::cose::{self, CoseError};
use crate::engagement::{DeviceAuthentication, SessionTranscript};
use crate::mdoc::{
    mso_from_auth, DeviceAuth, DisclosedAttributes, DeviceResponse, Document, Entry,
};
use crate::mso::MobileSecurityObject;
use crate::x509::{self, CertificateUsage, TrustAnchors, TrustError};

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("cannot verify issuer: {0}")]
    Trust(#[from] TrustError),
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("attribute digest mismatch")]
    DigestMismatch,
    #[error("attestation is not valid at the evaluation time")]
    Expired,
    #[error("response contains no documents")]
    NoDocuments,
    #[error("document type does not match the security object")]
    DocTypeMismatch,
    #[error(transparent)]
    Malformed(#[from] CborError),
}

impl From<CoseError> for VerificationError {
    fn from(error: CoseError) -> Self {
        match error {
            CoseError::Cbor(e) => Self::Malformed(e),
            // Everything else about a bad envelope reads as a bad signature;
            // detail would leak which check tripped.
            _ => Self::SignatureInvalid,
        }
    }
}

/// Verify a disclosure response end to end.
///
/// Steps, in order, each a hard failure: the issuer certificate chain is
/// validated against `trust_anchors`; the issuer signature over the security
/// object is verified; the validity window must contain `at_time`; every
/// disclosed attribute's recomputed digest must equal the digest listed for
/// its id; and the device signature is verified against the device key bound
/// in the security object, over the locally expected `transcript` — so a
/// response relayed from another session fails closed.
///
/// Returns exactly the disclosed attributes, per doc type and namespace.
///
/// # Errors
/// See [`VerificationError`]; no partial result is ever returned.
pub fn verify(
    response: &DeviceResponse, trust_anchors: &TrustAnchors, transcript: &SessionTranscript,
    at_time: DateTime<Utc>,
) -> Result<DisclosedAttributes, VerificationError> {
    let documents = response.documents.as_ref().ok_or(VerificationError::NoDocuments)?;
    if documents.is_empty() {
        return Err(VerificationError::NoDocuments);
    }

    let mut disclosed = DisclosedAttributes::new();
    for document in documents {
        let (doc_type, attributes) = verify_document(document, trust_anchors, transcript, at_time)?;
        disclosed.insert(doc_type, attributes);
    }
    Ok(disclosed)
}

fn verify_document(
    document: &Document, trust_anchors: &TrustAnchors, transcript: &SessionTranscript,
    at_time: DateTime<Utc>,
) -> Result<(String, IndexMap<String, Vec<Entry>>), VerificationError> {
    let issuer_auth = &document.issuer_signed.issuer_auth;

    // (1) The issuer certificate chain must terminate in a trust anchor.
    let chain = cose::x5chain(&issuer_auth.0)?;
    let [leaf, intermediates @ ..] = chain.as_slice() else {
        return Err(VerificationError::SignatureInvalid);
    };
    let issuer_key = x509::validate_chain(
        leaf,
        intermediates,
        trust_anchors,
        CertificateUsage::IssuerAuth,
        at_time,
    )?;

    // (2) The issuer signature over the security object.
    cose::verify(&issuer_auth.0, &issuer_key)?;
    let mso = mso_from_auth(issuer_auth)?;

    if mso.doc_type != document.doc_type {
        return Err(VerificationError::DocTypeMismatch);
    }

    // (3) The attestation must be inside its validity window.
    if !mso.validity_info.contains(at_time) {
        return Err(VerificationError::Expired);
    }

    // (4) Recompute every disclosed attribute's digest.
    let mut attributes = IndexMap::new();
    for (name_space, items) in &document.issuer_signed.name_spaces {
        let digests =
            mso.value_digests.get(name_space).ok_or(VerificationError::DigestMismatch)?;
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let listed = digests.get(&item.0.digest_id).ok_or(VerificationError::DigestMismatch)?;
            let computed = Sha256::digest(item.to_vec()?);
            if listed.as_slice() != computed.as_slice() {
                tracing::debug!(%name_space, "digest mismatch, rejecting response");
                return Err(VerificationError::DigestMismatch);
            }
            entries.push(Entry {
                name: item.0.element_identifier.clone(),
                value: item.0.element_value.clone(),
            });
        }
        attributes.insert(name_space.clone(), entries);
    }

    // (5) Device authentication over the expected transcript, against the
    // device key bound in the security object.
    verify_device_auth(document, &mso, transcript)?;

    Ok((document.doc_type.clone(), attributes))
}

fn verify_device_auth(
    document: &Document, mso: &MobileSecurityObject, transcript: &SessionTranscript,
) -> Result<(), VerificationError> {
    let device_key: VerifyingKey = (&mso.device_key_info.device_key)
        .try_into()
        .map_err(|_| VerificationError::SignatureInvalid)?;

    let authentication = DeviceAuthentication::new(
        transcript.clone(),
        document.doc_type.clone(),
        document.device_signed.name_spaces.clone(),
    );
    let payload = Tag24(authentication).to_vec()?;

    let DeviceAuth::DeviceSignature(signature) = &document.device_signed.device_auth;
    let mut signed = signature.0.clone();
    signed.payload = Some(payload);
    cose::verify(&signed, &device_key).map_err(|_| VerificationError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use indexmap::indexmap;

    use super::*;
    use crate::engagement::Handover;
    use crate::holder::{Disclosed, Discloser};
    use crate::keys::SoftwareEcdsaKey;
    use crate::request::DeviceRequest;

    // End-to-end paths, including trusted issuance, live in
    // tests/disclosure.rs; these cover the isolated failure points.

    async fn session() -> (DeviceResponse, SessionTranscript) {
        let device = SoftwareEcdsaKey::random();
        let mdoc = crate::holder::tests::issued_mdoc(&device).await;
        let mut discloser = Discloser::new(mdoc);

        let engagement = discloser.engage().unwrap();
        let reader_key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let e_reader_key = Tag24((reader_key.verifying_key()).try_into().unwrap());

        let request = DeviceRequest::new(
            "org.iso.18013.5.1.mDL".to_string(),
            indexmap! {
                "org.iso.18013.5.1".to_string() => indexmap! {
                    "family_name".to_string() => true,
                },
            },
        );
        let disclosed = discloser
            .respond(
                &request,
                e_reader_key.clone(),
                Handover::Qr,
                None,
                Utc::now(),
                &device,
            )
            .await
            .unwrap();
        let Disclosed::Response(response) = disclosed else {
            panic!("expected response");
        };

        (response, SessionTranscript(engagement, e_reader_key, Handover::Qr))
    }

    fn untrusting_anchors() -> TrustAnchors {
        let (ca, _) = crate::x509::Certificate::new_ca("unrelated ca").unwrap();
        TrustAnchors::try_from_certificates(vec![ca]).unwrap()
    }

    #[tokio::test]
    async fn response_without_documents_is_rejected() {
        let (_, transcript) = session().await;
        let response = DeviceResponse {
            version: DeviceResponse::VERSION.to_string(),
            documents: None,
            status: DeviceResponse::STATUS_OK,
        };
        let err =
            verify(&response, &untrusting_anchors(), &transcript, Utc::now()).unwrap_err();
        assert!(matches!(err, VerificationError::NoDocuments));
    }

    #[tokio::test]
    async fn untrusted_issuer_is_rejected() {
        // The test issuer signs with a bare key and no certificate chain, so
        // any anchor set must reject it.
        let (response, transcript) = session().await;
        let err =
            verify(&response, &untrusting_anchors(), &transcript, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            VerificationError::SignatureInvalid | VerificationError::Trust(_)
        ));
    }

    #[tokio::test]
    async fn expired_attestation_is_rejected_after_trust() {
        // Validity is checked after trust; with an untrusted issuer the
        // trust failure wins even far in the future.
        let (response, transcript) = session().await;
        let far_future = Utc::now() + Duration::days(10 * 365);
        let err = verify(&response, &untrusting_anchors(), &transcript, far_future).unwrap_err();
        assert!(matches!(
            err,
            VerificationError::SignatureInvalid | VerificationError::Trust(_)
        ));
    }
}
