//! The signing seam between the protocol engines and private key material.
//!
//! Private keys never enter this crate as raw bytes: issuer keys live in an
//! HSM behind the instruction authentication service, device keys live in the
//! platform key store. Both are reached through [`Signer`], the "signing
//! oracle" capability.

use std::future::Future;

use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};

/// Result type for external key providers.
pub type Result<T> = anyhow::Result<T>;

/// A handle to a private key held outside this process.
///
/// Implementations route signing to wherever the key actually lives: a
/// hardware-backed platform key store, or a remote HSM reached through the
/// instruction authentication service.
pub trait Signer: Send + Sync {
    /// The public half of the key pair.
    fn verifying_key(&self) -> impl Future<Output = Result<VerifyingKey>> + Send;

    /// Sign the message with the held private key.
    fn try_sign(&self, msg: &[u8]) -> impl Future<Output = Result<Signature>> + Send;
}

/// An in-memory P-256 key implementing [`Signer`].
///
/// Stands in for a platform key store in tests and local tooling. Not
/// hardware-backed; production code injects its own implementation.
#[derive(Debug, Clone)]
pub struct SoftwareEcdsaKey(SigningKey);

impl SoftwareEcdsaKey {
    /// Generate a fresh random key.
    pub fn random() -> Self {
        Self(SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// The public half of the key pair.
    #[must_use]
    pub fn public_key(&self) -> VerifyingKey {
        *self.0.verifying_key()
    }
}

impl From<SigningKey> for SoftwareEcdsaKey {
    fn from(key: SigningKey) -> Self {
        Self(key)
    }
}

impl Signer for SoftwareEcdsaKey {
    async fn verifying_key(&self) -> Result<VerifyingKey> {
        Ok(*self.0.verifying_key())
    }

    async fn try_sign(&self, msg: &[u8]) -> Result<Signature> {
        Ok(self.0.sign(msg))
    }
}
