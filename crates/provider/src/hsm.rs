//! Pooled access to the hardware security module.
//!
//! The HSM is an injected dependency behind the [`Hsm`] trait, so tests run
//! against [`SoftHsm`] and production wires in a PKCS#11 implementation. The
//! [`SessionBroker`] bounds parallelism to the hardware's session capacity
//! and guarantees that a session goes back to the pool on every exit path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use tokio::sync::{Mutex, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum HsmError {
    /// All hardware sessions are in use; retry with backoff.
    #[error("no hardware session available")]
    PoolExhausted,
    /// The HSM cannot be reached; fatal for the current request.
    #[error("hardware security module unavailable: {0}")]
    Unavailable(String),
    #[error("key '{0}' not found in the hardware security module")]
    KeyNotFound(String),
    #[error("hardware operation failed: {0}")]
    Operation(String),
}

/// A hardware security module that can open sessions.
pub trait Hsm: Send + Sync {
    type Session: HsmSession;

    /// Open a fresh session.
    fn connect(&self) -> impl Future<Output = Result<Self::Session, HsmError>> + Send;
}

/// One open hardware session. Never shared across concurrent operations.
pub trait HsmSession: Send {
    /// Generate a P-256 key pair stored under `identifier`, returning the
    /// public half. The private key never leaves the hardware.
    fn generate_key(
        &mut self, identifier: &str,
    ) -> impl Future<Output = Result<VerifyingKey, HsmError>> + Send;

    /// Sign `payload` with the key stored under `identifier`.
    fn sign(
        &mut self, identifier: &str, payload: &[u8],
    ) -> impl Future<Output = Result<Signature, HsmError>> + Send;
}

/// Bounded pool of hardware sessions.
pub struct SessionBroker<H: Hsm> {
    hsm: H,
    permits: Semaphore,
    idle: Mutex<Vec<H::Session>>,
}

impl<H: Hsm> SessionBroker<H> {
    /// A broker bounded to `capacity` concurrent sessions.
    pub fn new(hsm: H, capacity: usize) -> Self {
        Self { hsm, permits: Semaphore::new(capacity), idle: Mutex::new(Vec::new()) }
    }

    /// Run `op` with a scoped hardware session.
    ///
    /// The session is taken from the idle pool or opened fresh, and returned
    /// to the pool on every exit path. An [`HsmError::Unavailable`] failure
    /// drops the session instead: it is presumed broken.
    ///
    /// # Errors
    /// [`HsmError::PoolExhausted`] when the pool is saturated; otherwise
    /// whatever `op` or the connection attempt fails with.
    pub async fn with_session<T, F>(&self, op: F) -> Result<T, HsmError>
    where
        F: for<'s> FnOnce(&'s mut H::Session) -> BoxFuture<'s, Result<T, HsmError>> + Send,
    {
        let _permit = self.permits.try_acquire().map_err(|_| {
            tracing::debug!("hardware session pool saturated");
            HsmError::PoolExhausted
        })?;

        let pooled = self.idle.lock().await.pop();
        let mut session = match pooled {
            Some(session) => session,
            None => self.hsm.connect().await?,
        };

        let result = op(&mut session).await;
        if matches!(result, Err(HsmError::Unavailable(_))) {
            tracing::warn!("hardware session failed, dropping it from the pool");
            drop(session);
        } else {
            self.idle.lock().await.push(session);
        }
        result
    }
}

/// In-memory stand-in for a hardware security module.
///
/// Keys are plain P-256 keys in a shared map, which is exactly what a test
/// needs and nothing a deployment should use.
#[derive(Clone, Default)]
pub struct SoftHsm {
    keys: Arc<Mutex<HashMap<String, SigningKey>>>,
}

impl SoftHsm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct SoftHsmSession {
    keys: Arc<Mutex<HashMap<String, SigningKey>>>,
}

impl Hsm for SoftHsm {
    type Session = SoftHsmSession;

    async fn connect(&self) -> Result<Self::Session, HsmError> {
        Ok(SoftHsmSession { keys: Arc::clone(&self.keys) })
    }
}

impl HsmSession for SoftHsmSession {
    async fn generate_key(&mut self, identifier: &str) -> Result<VerifyingKey, HsmError> {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let public_key = *key.verifying_key();
        self.keys.lock().await.insert(identifier.to_string(), key);
        Ok(public_key)
    }

    async fn sign(&mut self, identifier: &str, payload: &[u8]) -> Result<Signature, HsmError> {
        let keys = self.keys.lock().await;
        let key = keys.get(identifier).ok_or_else(|| HsmError::KeyNotFound(identifier.to_string()))?;
        Ok(key.sign(payload))
    }
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::signature::Verifier;

    use super::*;

    #[tokio::test]
    async fn sessions_are_pooled_and_reused() {
        let broker = SessionBroker::new(SoftHsm::new(), 2);

        let public_key = broker
            .with_session(|session| Box::pin(session.generate_key("key-1")))
            .await
            .unwrap();
        let signature = broker
            .with_session(|session| Box::pin(session.sign("key-1", b"payload")))
            .await
            .unwrap();

        public_key.verify(b"payload", &signature).unwrap();
        assert_eq!(broker.idle.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn saturated_pool_fails_fast() {
        let broker = SessionBroker::new(SoftHsm::new(), 1);

        // Hold the only permit while a second acquisition is attempted.
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();

        let holding = broker.with_session(move |_session| {
            Box::pin(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(())
            })
        });
        let contending = async {
            let _ = started_rx.await;
            let second = broker.with_session(|_session| Box::pin(async { Ok(()) })).await;
            assert!(matches!(second, Err(HsmError::PoolExhausted)));
            let _ = release_tx.send(());
        };

        let (held, ()) = tokio::join!(holding, contending);
        held.unwrap();
    }

    #[tokio::test]
    async fn failed_operation_still_returns_the_session() {
        let broker = SessionBroker::new(SoftHsm::new(), 1);

        let result = broker
            .with_session(|session| Box::pin(session.sign("missing", b"payload")))
            .await;
        assert!(matches!(result, Err(HsmError::KeyNotFound(_))));

        // The session survived the failure and the pool is usable.
        broker
            .with_session(|session| Box::pin(session.generate_key("key-1")))
            .await
            .unwrap();
        assert_eq!(broker.idle.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_drops_the_session() {
        let broker = SessionBroker::new(SoftHsm::new(), 1);

        let result: Result<(), _> = broker
            .with_session(|_session| {
                Box::pin(async { Err(HsmError::Unavailable("power loss".to_string())) })
            })
            .await;
        assert!(matches!(result, Err(HsmError::Unavailable(_))));
        assert_eq!(broker.idle.lock().await.len(), 0);
    }
}
