//! The instruction authentication service: the replay-protected,
//! PIN-authenticated gate in front of every HSM key operation.
//!
//! Protocol, per instruction: the wallet fetches a challenge bound to its
//! current sequence number, signs the challenge-response payload with both
//! the PIN-derived key and the hardware key, and submits the envelope. The
//! service checks lock state, the exact next sequence number and both
//! signatures before the HSM is touched, and commits the sequence advance
//! with an optimistic compare-and-swap after the HSM call returns — no
//! account state is held locked across the hardware boundary.

use attesta_mdoc::cbor::{self, CborError};
use rand::{thread_rng, Rng};
use serde_bytes::ByteBuf;

use crate::hsm::{Hsm, HsmError, HsmSession as _, SessionBroker};
use crate::instruction::{
    Challenge, ChallengeResponsePayload, DerSignature, DerVerifyingKey, Instruction,
    InstructionEnvelope, InstructionResult,
};
use crate::repository::{AccountError, AccountRepository, WalletAccount};

/// Default consecutive PIN failures before the wallet is terminally locked.
pub const DEFAULT_MAX_PIN_ATTEMPTS: u8 = 4;

const CHALLENGE_LENGTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum InstructionError {
    #[error("wallet '{0}' is not registered")]
    UnknownWallet(String),
    #[error("wallet '{0}' is already registered")]
    AlreadyRegistered(String),
    /// Terminal: the wallet must be re-registered, retrying cannot help.
    #[error("wallet is locked")]
    WalletLocked,
    #[error("no outstanding challenge for this wallet")]
    ChallengeMissing,
    /// The envelope lost the race on the sequence number; fetch a fresh
    /// challenge and retry.
    #[error("sequence number mismatch")]
    SequenceConflict,
    #[error("PIN proof rejected, {attempts_left} attempts left")]
    PinMismatch { attempts_left: u8 },
    #[error("hardware key signature rejected")]
    SignatureInvalid,
    #[error(transparent)]
    Hsm(#[from] HsmError),
    #[error(transparent)]
    Encoding(#[from] CborError),
}

impl From<AccountError> for InstructionError {
    fn from(error: AccountError) -> Self {
        match error {
            AccountError::Unknown(wallet_id) => Self::UnknownWallet(wallet_id),
            AccountError::Exists(wallet_id) => Self::AlreadyRegistered(wallet_id),
            AccountError::Conflict => Self::SequenceConflict,
        }
    }
}

/// The provider-side instruction service. Stateless apart from the injected
/// repository and HSM broker, so one instance serves all wallets.
pub struct InstructionService<R, H: Hsm> {
    accounts: R,
    broker: SessionBroker<H>,
    max_pin_attempts: u8,
}

impl<R: AccountRepository, H: Hsm> InstructionService<R, H> {
    pub fn new(accounts: R, broker: SessionBroker<H>) -> Self {
        Self { accounts, broker, max_pin_attempts: DEFAULT_MAX_PIN_ATTEMPTS }
    }

    #[must_use]
    pub fn with_max_pin_attempts(mut self, max_pin_attempts: u8) -> Self {
        self.max_pin_attempts = max_pin_attempts;
        self
    }

    /// Register a wallet: store its PIN and hardware public keys with a
    /// zeroed sequence number. Re-registration after a terminal lock means
    /// registering under a fresh wallet id.
    ///
    /// # Errors
    /// [`InstructionError::AlreadyRegistered`] when the wallet id is taken.
    pub async fn register(
        &self, wallet_id: &str, pin_public_key: &DerVerifyingKey, hw_public_key: &DerVerifyingKey,
    ) -> Result<(), InstructionError> {
        self.accounts
            .register(WalletAccount::new(
                wallet_id.to_string(),
                pin_public_key.0,
                hw_public_key.0,
            ))
            .await?;
        tracing::info!(wallet_id, "wallet registered");
        Ok(())
    }

    /// Issue a fresh single-use challenge bound to the wallet's current
    /// sequence number.
    ///
    /// # Errors
    /// [`InstructionError::WalletLocked`] for locked wallets,
    /// [`InstructionError::UnknownWallet`] for unregistered ones.
    pub async fn issue_challenge(&self, wallet_id: &str) -> Result<Challenge, InstructionError> {
        let account = self.accounts.fetch(wallet_id).await?;
        if account.locked {
            return Err(InstructionError::WalletLocked);
        }

        let challenge: [u8; CHALLENGE_LENGTH] = thread_rng().gen();
        self.accounts.store_challenge(wallet_id, challenge.to_vec()).await?;

        Ok(Challenge {
            challenge: ByteBuf::from(challenge.to_vec()),
            sequence_number: account.sequence_number,
        })
    }

    /// Authenticate and execute one instruction envelope.
    ///
    /// Checks run in order, each a hard failure: lock state, exact next
    /// sequence number, outstanding challenge, PIN signature, hardware
    /// signature. Only then is the instruction executed against the HSM, and
    /// the sequence advance committed with a compare-and-swap — a concurrent
    /// envelope racing on the same expected sequence number deterministically
    /// loses with [`InstructionError::SequenceConflict`]. The service never
    /// retries internally.
    ///
    /// # Errors
    /// See [`InstructionError`]; a PIN mismatch at the failure threshold
    /// locks the wallet terminally.
    pub async fn handle(
        &self, wallet_id: &str, envelope: &InstructionEnvelope,
    ) -> Result<InstructionResult, InstructionError> {
        let account = self.accounts.fetch(wallet_id).await?;
        if account.locked {
            return Err(InstructionError::WalletLocked);
        }
        // Exact match: gap-skipping and duplicates both fail. Checked before
        // the PIN proof so a stale envelope cannot burn a PIN attempt.
        if envelope.sequence_number != account.sequence_number + 1 {
            tracing::debug!(
                wallet_id,
                claimed = envelope.sequence_number,
                accepted = account.sequence_number,
                "sequence number rejected"
            );
            return Err(InstructionError::SequenceConflict);
        }
        let challenge = account.challenge.ok_or(InstructionError::ChallengeMissing)?;

        let signed_bytes = cbor::to_vec(&ChallengeResponsePayload {
            challenge: ByteBuf::from(challenge),
            sequence_number: envelope.sequence_number,
            instruction: envelope.instruction.clone(),
        })?;

        if DerVerifyingKey(account.pin_public_key)
            .verify(&signed_bytes, &envelope.pin_signature)
            .is_err()
        {
            let attempts_left =
                self.accounts.record_pin_failure(wallet_id, self.max_pin_attempts).await?;
            if attempts_left == 0 {
                tracing::warn!(wallet_id, "PIN failure threshold reached, wallet locked");
            }
            return Err(InstructionError::PinMismatch { attempts_left });
        }
        if DerVerifyingKey(account.hw_public_key)
            .verify(&signed_bytes, &envelope.hw_signature)
            .is_err()
        {
            return Err(InstructionError::SignatureInvalid);
        }

        // The HSM call runs without any account state held; the sequence
        // advance below decides the race.
        let instruction = envelope.instruction.clone();
        let result = self
            .broker
            .with_session(move |session| {
                Box::pin(async move {
                    match instruction {
                        Instruction::GenerateKey { identifiers } => {
                            let mut public_keys = Vec::with_capacity(identifiers.len());
                            for identifier in identifiers {
                                let key = session.generate_key(&identifier).await?;
                                public_keys.push((identifier, DerVerifyingKey(key)));
                            }
                            Ok(InstructionResult::GeneratedKeys { public_keys })
                        }
                        Instruction::Sign { key_identifier, payload } => {
                            let signature = session.sign(&key_identifier, &payload).await?;
                            Ok(InstructionResult::Signature(DerSignature(signature)))
                        }
                    }
                })
            })
            .await?;

        self.accounts.advance_sequence(wallet_id, envelope.sequence_number).await?;
        tracing::debug!(wallet_id, sequence = envelope.sequence_number, "instruction accepted");
        Ok(result)
    }
}
