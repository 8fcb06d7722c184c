//! The wallet-side instruction client and the remote key handle.
//!
//! [`InstructionClient`] turns an [`Instruction`] into an authenticated
//! envelope: fetch a challenge, sign the challenge-response payload with the
//! PIN-derived key and the platform hardware key, submit. A lost sequence
//! race is retried a bounded number of times, each time with a freshly
//! issued challenge. [`RemoteEcdsaKey`] plugs HSM-resident keys into the
//! `attesta-mdoc` signer seam, so issuance and disclosure can sign with a
//! key that never leaves the provider's hardware.

use std::future::Future;

use attesta_mdoc::cbor::{self, CborError};
use attesta_mdoc::keys::Signer;
use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};
use serde_bytes::ByteBuf;

use crate::hsm::Hsm;
use crate::instruction::{
    Challenge, ChallengeResponsePayload, DerSignature, Instruction, InstructionEnvelope,
    InstructionResult,
};
use crate::pin::{PinKey, PinKeyError};
use crate::repository::AccountRepository;
use crate::service::{InstructionError, InstructionService};

/// Bounded retries after a lost sequence race, fresh challenge each time.
const SEQUENCE_RETRIES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("provider rejected the instruction: {0}")]
    Instruction(#[from] InstructionError),
    #[error(transparent)]
    PinKey(#[from] PinKeyError),
    #[error("platform key signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Encoding(#[from] CborError),
    #[error("provider returned a result of the wrong kind")]
    UnexpectedResult,
}

/// How the wallet reaches the provider. In deployment this is an HTTP
/// client; in tests the service is called in-process.
pub trait AccountProviderClient: Send + Sync {
    fn challenge(
        &self, wallet_id: &str,
    ) -> impl Future<Output = Result<Challenge, InstructionError>> + Send;

    fn instruction(
        &self, wallet_id: &str, envelope: InstructionEnvelope,
    ) -> impl Future<Output = Result<InstructionResult, InstructionError>> + Send;
}

impl<R: AccountRepository, H: Hsm> AccountProviderClient for InstructionService<R, H> {
    async fn challenge(&self, wallet_id: &str) -> Result<Challenge, InstructionError> {
        self.issue_challenge(wallet_id).await
    }

    async fn instruction(
        &self, wallet_id: &str, envelope: InstructionEnvelope,
    ) -> Result<InstructionResult, InstructionError> {
        self.handle(wallet_id, &envelope).await
    }
}

/// Builds and submits authenticated instruction envelopes for one wallet.
pub struct InstructionClient<'a, K, A> {
    wallet_id: String,
    pin: String,
    pin_salt: Vec<u8>,
    hw_key: &'a K,
    provider: &'a A,
}

impl<'a, K: Signer, A: AccountProviderClient> InstructionClient<'a, K, A> {
    pub fn new(
        wallet_id: impl Into<String>, pin: impl Into<String>, pin_salt: Vec<u8>, hw_key: &'a K,
        provider: &'a A,
    ) -> Self {
        Self { wallet_id: wallet_id.into(), pin: pin.into(), pin_salt, hw_key, provider }
    }

    /// Authenticate and submit one instruction.
    ///
    /// # Errors
    /// Provider-side failures as [`ClientError::Instruction`]; a sequence
    /// conflict is retried up to the bound, then surfaced.
    pub async fn send(&self, instruction: Instruction) -> Result<InstructionResult, ClientError> {
        let mut retries_left = SEQUENCE_RETRIES;
        loop {
            let challenge = self.provider.challenge(&self.wallet_id).await?;
            let sequence_number = challenge.sequence_number + 1;

            let signed_bytes = cbor::to_vec(&ChallengeResponsePayload {
                challenge: challenge.challenge,
                sequence_number,
                instruction: instruction.clone(),
            })?;
            let pin_signature =
                DerSignature(PinKey::new(&self.pin, &self.pin_salt).try_sign(&signed_bytes)?);
            let hw_signature = DerSignature(
                self.hw_key
                    .try_sign(&signed_bytes)
                    .await
                    .map_err(|e| ClientError::Signing(e.to_string()))?,
            );

            let envelope = InstructionEnvelope {
                sequence_number,
                instruction: instruction.clone(),
                pin_signature,
                hw_signature,
            };
            match self.provider.instruction(&self.wallet_id, envelope).await {
                Err(InstructionError::SequenceConflict) if retries_left > 0 => {
                    retries_left -= 1;
                    tracing::debug!(
                        wallet_id = %self.wallet_id,
                        "lost a sequence race, retrying with a fresh challenge"
                    );
                }
                other => return Ok(other?),
            }
        }
    }

    /// Generate HSM-resident key pairs and return handles to them.
    ///
    /// # Errors
    /// As [`send`](Self::send).
    pub async fn generate_keys(
        &self, identifiers: Vec<String>,
    ) -> Result<Vec<RemoteEcdsaKey<'_, K, A>>, ClientError> {
        match self.send(Instruction::GenerateKey { identifiers }).await? {
            InstructionResult::GeneratedKeys { public_keys } => Ok(public_keys
                .into_iter()
                .map(|(identifier, public_key)| RemoteEcdsaKey {
                    identifier,
                    public_key: public_key.0,
                    client: self,
                })
                .collect()),
            InstructionResult::Signature(_) => Err(ClientError::UnexpectedResult),
        }
    }

    /// A handle to a previously generated key with a known public half.
    #[must_use]
    pub fn existing_key(
        &self, identifier: impl Into<String>, public_key: VerifyingKey,
    ) -> RemoteEcdsaKey<'_, K, A> {
        RemoteEcdsaKey { identifier: identifier.into(), public_key, client: self }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteEcdsaKeyError {
    #[error("error sending instruction to the provider: {0}")]
    Instruction(#[from] ClientError),
    #[error("invalid signature received from the provider: {0}")]
    Signature(#[from] p256::ecdsa::Error),
}

/// A handle to an HSM-resident key, usable wherever the `attesta-mdoc`
/// signer seam is expected. Every returned signature is verified against the
/// known public key before it is handed out.
pub struct RemoteEcdsaKey<'a, K, A> {
    identifier: String,
    public_key: VerifyingKey,
    client: &'a InstructionClient<'a, K, A>,
}

impl<K, A> RemoteEcdsaKey<'_, K, A> {
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn public_key(&self) -> VerifyingKey {
        self.public_key
    }
}

impl<K: Signer, A: AccountProviderClient> Signer for RemoteEcdsaKey<'_, K, A> {
    async fn verifying_key(&self) -> attesta_mdoc::keys::Result<VerifyingKey> {
        Ok(self.public_key)
    }

    async fn try_sign(&self, msg: &[u8]) -> attesta_mdoc::keys::Result<Signature> {
        let result = self
            .client
            .send(Instruction::Sign {
                key_identifier: self.identifier.clone(),
                payload: ByteBuf::from(msg.to_vec()),
            })
            .await
            .map_err(RemoteEcdsaKeyError::Instruction)?;

        let InstructionResult::Signature(signature) = result else {
            return Err(RemoteEcdsaKeyError::Instruction(ClientError::UnexpectedResult).into());
        };
        self.public_key.verify(msg, &signature.0).map_err(RemoteEcdsaKeyError::Signature)?;
        Ok(signature.0)
    }
}
