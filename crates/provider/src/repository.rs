//! The storage seam for per-wallet account state.
//!
//! The instruction service owns no state of its own: sequence numbers, PIN
//! failure counts and challenges live behind [`AccountRepository`], and the
//! replay protection rests on the repository's compare-and-swap sequence
//! advance. Production deployments implement the trait over a transactional
//! store; [`InMemoryAccounts`] is the in-process implementation used in
//! tests.

use std::collections::HashMap;
use std::future::Future;

use p256::ecdsa::VerifyingKey;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("wallet '{0}' is not registered")]
    Unknown(String),
    #[error("wallet '{0}' is already registered")]
    Exists(String),
    /// The optimistic sequence advance lost a race; the caller must fetch a
    /// fresh challenge.
    #[error("sequence number advanced concurrently")]
    Conflict,
}

/// Per-wallet state as stored by the provider.
#[derive(Clone, Debug)]
pub struct WalletAccount {
    pub wallet_id: String,

    /// Public half of the PIN-derived key, registered at enrolment.
    pub pin_public_key: VerifyingKey,

    /// Public half of the device's hardware-backed key.
    pub hw_public_key: VerifyingKey,

    /// Last accepted instruction sequence number.
    pub sequence_number: u64,

    /// Consecutive failed PIN proofs since the last success.
    pub failed_pin_attempts: u8,

    /// Terminally locked. A locked wallet never accepts instructions again;
    /// the user must re-register.
    pub locked: bool,

    /// Outstanding single-use challenge, if one was issued.
    pub challenge: Option<Vec<u8>>,
}

impl WalletAccount {
    /// A fresh account as created at registration.
    #[must_use]
    pub fn new(wallet_id: String, pin_public_key: VerifyingKey, hw_public_key: VerifyingKey) -> Self {
        Self {
            wallet_id,
            pin_public_key,
            hw_public_key,
            sequence_number: 0,
            failed_pin_attempts: 0,
            locked: false,
            challenge: None,
        }
    }
}

/// Storage operations the instruction service needs, each atomic per wallet.
/// Unrelated wallets must never contend.
pub trait AccountRepository: Send + Sync {
    /// Create the account.
    fn register(
        &self, account: WalletAccount,
    ) -> impl Future<Output = Result<(), AccountError>> + Send;

    /// A snapshot of the account state.
    fn fetch(
        &self, wallet_id: &str,
    ) -> impl Future<Output = Result<WalletAccount, AccountError>> + Send;

    /// Store a newly issued single-use challenge.
    fn store_challenge(
        &self, wallet_id: &str, challenge: Vec<u8>,
    ) -> impl Future<Output = Result<(), AccountError>> + Send;

    /// Compare-and-swap sequence advance: succeeds only when the stored
    /// sequence number is exactly `accepted - 1`, then stores `accepted`,
    /// consumes the challenge and resets the failure count. A concurrent
    /// envelope racing on the same expected sequence number loses with
    /// [`AccountError::Conflict`].
    fn advance_sequence(
        &self, wallet_id: &str, accepted: u64,
    ) -> impl Future<Output = Result<(), AccountError>> + Send;

    /// Record a failed PIN proof and consume the challenge. Locks the wallet
    /// when the count reaches `max_attempts`. Returns the attempts left.
    fn record_pin_failure(
        &self, wallet_id: &str, max_attempts: u8,
    ) -> impl Future<Output = Result<u8, AccountError>> + Send;
}

/// Mutex-guarded in-process account store.
#[derive(Default)]
pub struct InMemoryAccounts {
    accounts: Mutex<HashMap<String, WalletAccount>>,
}

impl InMemoryAccounts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountRepository for InMemoryAccounts {
    async fn register(&self, account: WalletAccount) -> Result<(), AccountError> {
        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(&account.wallet_id) {
            return Err(AccountError::Exists(account.wallet_id));
        }
        accounts.insert(account.wallet_id.clone(), account);
        Ok(())
    }

    async fn fetch(&self, wallet_id: &str) -> Result<WalletAccount, AccountError> {
        self.accounts
            .lock()
            .await
            .get(wallet_id)
            .cloned()
            .ok_or_else(|| AccountError::Unknown(wallet_id.to_string()))
    }

    async fn store_challenge(&self, wallet_id: &str, challenge: Vec<u8>) -> Result<(), AccountError> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(wallet_id)
            .ok_or_else(|| AccountError::Unknown(wallet_id.to_string()))?;
        account.challenge = Some(challenge);
        Ok(())
    }

    async fn advance_sequence(&self, wallet_id: &str, accepted: u64) -> Result<(), AccountError> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(wallet_id)
            .ok_or_else(|| AccountError::Unknown(wallet_id.to_string()))?;
        if account.sequence_number + 1 != accepted {
            return Err(AccountError::Conflict);
        }
        account.sequence_number = accepted;
        account.failed_pin_attempts = 0;
        account.challenge = None;
        Ok(())
    }

    async fn record_pin_failure(&self, wallet_id: &str, max_attempts: u8) -> Result<u8, AccountError> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(wallet_id)
            .ok_or_else(|| AccountError::Unknown(wallet_id.to_string()))?;
        account.failed_pin_attempts = account.failed_pin_attempts.saturating_add(1);
        account.challenge = None;
        if account.failed_pin_attempts >= max_attempts {
            account.locked = true;
        }
        Ok(max_attempts.saturating_sub(account.failed_pin_attempts))
    }
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::SigningKey;

    use super::*;

    fn account(wallet_id: &str) -> WalletAccount {
        let key = *SigningKey::random(&mut rand::rngs::OsRng).verifying_key();
        WalletAccount::new(wallet_id.to_string(), key, key)
    }

    #[tokio::test]
    async fn registration_is_unique_per_wallet() {
        let accounts = InMemoryAccounts::new();
        accounts.register(account("w1")).await.unwrap();
        assert_eq!(
            accounts.register(account("w1")).await,
            Err(AccountError::Exists("w1".to_string()))
        );
        accounts.register(account("w2")).await.unwrap();
    }

    #[tokio::test]
    async fn sequence_advance_is_exact_match_only() {
        let accounts = InMemoryAccounts::new();
        accounts.register(account("w1")).await.unwrap();

        // Gap-skipping and replays both lose.
        assert_eq!(accounts.advance_sequence("w1", 2).await, Err(AccountError::Conflict));
        accounts.advance_sequence("w1", 1).await.unwrap();
        assert_eq!(accounts.advance_sequence("w1", 1).await, Err(AccountError::Conflict));
        accounts.advance_sequence("w1", 2).await.unwrap();
    }

    #[tokio::test]
    async fn pin_failures_lock_at_threshold() {
        let accounts = InMemoryAccounts::new();
        accounts.register(account("w1")).await.unwrap();

        assert_eq!(accounts.record_pin_failure("w1", 3).await.unwrap(), 2);
        assert_eq!(accounts.record_pin_failure("w1", 3).await.unwrap(), 1);
        assert!(!accounts.fetch("w1").await.unwrap().locked);
        assert_eq!(accounts.record_pin_failure("w1", 3).await.unwrap(), 0);
        assert!(accounts.fetch("w1").await.unwrap().locked);
    }

    #[tokio::test]
    async fn success_resets_the_failure_count() {
        let accounts = InMemoryAccounts::new();
        accounts.register(account("w1")).await.unwrap();

        accounts.record_pin_failure("w1", 3).await.unwrap();
        accounts.store_challenge("w1", vec![1; 32]).await.unwrap();
        accounts.advance_sequence("w1", 1).await.unwrap();

        let state = accounts.fetch("w1").await.unwrap();
        assert_eq!(state.failed_pin_attempts, 0);
        assert_eq!(state.challenge, None);
    }
}
