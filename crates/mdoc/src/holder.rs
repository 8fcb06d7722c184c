//! The discloser side of the disclosure engine: a state machine that runs
//! one disclosure session for one stored attestation.
//!
//! `Idle → EngagementSent → ResponseBuilt → Done`. Disclosure is
//! all-or-nothing: a request that cannot be satisfied in full, a reader that
//! cannot be trusted, or a user rejection all end the session with
//! [`Disclosed::Declined`] — a partial response is never emitted.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use p256::ecdsa::SigningKey;

use crate::cbor::{CborError, Tag24};
use crate::cose::{self, CoseError, CoseKey};
use crate::engagement::{
    DeviceAuthentication, DeviceEngagement, DeviceEngagementBytes, EReaderKeyBytes, Handover,
    ReaderAuthentication, Security, SessionTranscript, CIPHER_SUITE_P256,
};
use crate::keys::Signer;
use crate::mdoc::{
    DeviceAuth, DeviceNameSpaces, DeviceResponse, DeviceSigned, Document, IssuerSigned, Mdoc,
};
use crate::request::DeviceRequest;
use crate::x509::{self, CertificateUsage, TrustAnchors};

#[derive(Debug, thiserror::Error)]
pub enum DisclosureError {
    #[error("operation not valid in state {0}")]
    InvalidState(&'static str),
    #[error("device key signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Cbor(#[from] CborError),
    #[error(transparent)]
    Cose(#[from] CoseError),
}

/// Outcome of a disclosure session.
#[derive(Debug, Clone, PartialEq)]
pub enum Disclosed {
    /// The full requested attribute set, device-signed for this session.
    Response(DeviceResponse),
    /// The request was declined; nothing was disclosed.
    Declined,
}

enum State {
    Idle,
    EngagementSent { engagement: DeviceEngagementBytes },
    ResponseBuilt,
    Done,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::EngagementSent { .. } => "EngagementSent",
            Self::ResponseBuilt => "ResponseBuilt",
            Self::Done => "Done",
        }
    }
}

/// One disclosure session for one stored attestation. Single-threaded per
/// session: one device runs one ongoing disclosure at a time.
pub struct Discloser {
    mdoc: Mdoc,
    state: State,
}

impl Discloser {
    /// Start a session for a stored attestation.
    #[must_use]
    pub fn new(mdoc: Mdoc) -> Self {
        Self { mdoc, state: State::Idle }
    }

    /// Generate the engagement message announcing the device's ephemeral
    /// session key. `Idle → EngagementSent`.
    ///
    /// # Errors
    /// [`DisclosureError::InvalidState`] outside `Idle`.
    pub fn engage(&mut self) -> Result<DeviceEngagementBytes, DisclosureError> {
        let State::Idle = &self.state else {
            return Err(DisclosureError::InvalidState(self.state.name()));
        };

        // The ephemeral key only serves to bind the transcript to this
        // session; its private half is not used further without session
        // encryption.
        let ephemeral = SigningKey::random(&mut rand::rngs::OsRng);
        let e_device_key: CoseKey = (ephemeral.verifying_key()).try_into()?;

        let engagement = Tag24(DeviceEngagement {
            version: DeviceEngagement::VERSION.to_string(),
            security: Security(CIPHER_SUITE_P256, Tag24(e_device_key)),
        });

        self.state = State::EngagementSent { engagement: engagement.clone() };
        Ok(engagement)
    }

    /// Answer a verifier request. `EngagementSent → ResponseBuilt`, or
    /// `→ Done` with [`Disclosed::Declined`] when the request cannot be
    /// satisfied in full or the reader is not trusted.
    ///
    /// Selects exactly the requested attributes, never more; builds the
    /// session transcript from the engagement and handover data; signs the
    /// device authentication structure with the device key through `signer`.
    ///
    /// # Errors
    /// [`DisclosureError::InvalidState`] outside `EngagementSent`, otherwise
    /// encoding or signing failures.
    pub async fn respond(
        &mut self, request: &DeviceRequest, e_reader_key: EReaderKeyBytes, handover: Handover,
        reader_anchors: Option<&TrustAnchors>, at_time: DateTime<Utc>, signer: &impl Signer,
    ) -> Result<Disclosed, DisclosureError> {
        let State::EngagementSent { engagement } = &self.state else {
            return Err(DisclosureError::InvalidState(self.state.name()));
        };
        let transcript =
            SessionTranscript(engagement.clone(), e_reader_key, handover);

        // Every document request must name this attestation's doc type, be
        // satisfiable in full, and carry a trustworthy reader signature when
        // reader authentication is in play.
        let available = self.mdoc.attribute_identifiers();
        for doc_request in &request.doc_requests {
            let items = &doc_request.items_request;
            if items.0.doc_type != self.mdoc.doc_type {
                tracing::debug!(requested = %items.0.doc_type, "doc type not in wallet, declining");
                self.state = State::Done;
                return Ok(Disclosed::Declined);
            }
            if items.0.attribute_identifiers().iter().any(|id| !available.contains(id)) {
                tracing::debug!("requested attribute not present, declining");
                self.state = State::Done;
                return Ok(Disclosed::Declined);
            }
            if let Some(anchors) = reader_anchors {
                if !reader_is_trusted(doc_request, &transcript, anchors, at_time) {
                    tracing::warn!("reader authentication failed, declining");
                    self.state = State::Done;
                    return Ok(Disclosed::Declined);
                }
            }
        }

        let requested = request
            .doc_requests
            .iter()
            .flat_map(|doc_request| doc_request.items_request.0.attribute_identifiers())
            .collect::<indexmap::IndexSet<_>>();

        // Exactly the matching items, preserving issuance order.
        let name_spaces = self
            .mdoc
            .issuer_signed
            .name_spaces
            .iter()
            .filter_map(|(name_space, items)| {
                let disclosed: Vec<_> = items
                    .iter()
                    .filter(|item| {
                        requested.contains(&crate::mdoc::AttributeIdentifier {
                            doc_type: self.mdoc.doc_type.clone(),
                            namespace: name_space.clone(),
                            attribute: item.0.element_identifier.clone(),
                        })
                    })
                    .cloned()
                    .collect();
                (!disclosed.is_empty()).then(|| (name_space.clone(), disclosed))
            })
            .collect::<IndexMap<_, _>>();

        let device_name_spaces = Tag24(DeviceNameSpaces::new());
        let device_authentication = DeviceAuthentication::new(
            transcript,
            self.mdoc.doc_type.clone(),
            device_name_spaces.clone(),
        );
        let auth_bytes = Tag24(device_authentication).to_vec()?;
        let signature = signer
            .try_sign(&auth_bytes)
            .await
            .map_err(|e| DisclosureError::Signing(e.to_string()))?;

        // Detached payload: the verifier reconstructs DeviceAuthentication
        // from its own transcript, so a relayed session fails verification.
        let device_signature = coset::CoseSign1Builder::new()
            .protected(
                coset::HeaderBuilder::new().algorithm(coset::iana::Algorithm::ES256).build(),
            )
            .signature(signature.to_vec())
            .build();

        let document = Document {
            doc_type: self.mdoc.doc_type.clone(),
            issuer_signed: IssuerSigned {
                name_spaces,
                issuer_auth: self.mdoc.issuer_signed.issuer_auth.clone(),
            },
            device_signed: DeviceSigned {
                name_spaces: device_name_spaces,
                device_auth: DeviceAuth::DeviceSignature(cose::CoseCbor(device_signature)),
            },
        };

        self.state = State::ResponseBuilt;
        Ok(Disclosed::Response(DeviceResponse {
            version: DeviceResponse::VERSION.to_string(),
            documents: Some(vec![document]),
            status: DeviceResponse::STATUS_OK,
        }))
    }

    /// Close the session after the response has been handed over.
    /// `ResponseBuilt → Done`.
    ///
    /// # Errors
    /// [`DisclosureError::InvalidState`] outside `ResponseBuilt`.
    pub fn finish(&mut self) -> Result<(), DisclosureError> {
        let State::ResponseBuilt = &self.state else {
            return Err(DisclosureError::InvalidState(self.state.name()));
        };
        self.state = State::Done;
        Ok(())
    }

    /// Decline the session (user rejection). Valid in any state before
    /// `Done`; always transitions to `Done`.
    pub fn decline(&mut self) -> Disclosed {
        self.state = State::Done;
        Disclosed::Declined
    }
}

// The reader proves possession of its certificate key by signing the
// ReaderAuthentication structure for this very transcript.
fn reader_is_trusted(
    doc_request: &crate::request::DocRequest, transcript: &SessionTranscript,
    anchors: &TrustAnchors, at_time: DateTime<Utc>,
) -> bool {
    let Some(reader_auth) = &doc_request.reader_auth else {
        return false;
    };
    let Ok(chain) = cose::x5chain(&reader_auth.0) else {
        return false;
    };
    let [leaf, intermediates @ ..] = chain.as_slice() else {
        return false;
    };
    let Ok(reader_key) =
        x509::validate_chain(leaf, intermediates, anchors, CertificateUsage::ReaderAuth, at_time)
    else {
        return false;
    };

    let authentication =
        ReaderAuthentication::new(transcript.clone(), doc_request.items_request.clone());
    let Ok(payload) = Tag24(authentication).to_vec() else {
        return false;
    };

    // Reader auth uses a detached payload; attach the reconstructed bytes.
    let mut signed = reader_auth.0.clone();
    signed.payload = Some(payload);
    cose::verify(&signed, &reader_key).is_ok()
}
