//! The instruction protocol end to end: registration, challenge issuance,
//! envelope authentication, replay protection, terminal PIN lockout and the
//! wallet-side client.

use attesta_mdoc::cbor;
use attesta_mdoc::keys::{Signer, SoftwareEcdsaKey};
use attesta_provider::instruction::{ChallengeResponsePayload, DerSignature, DerVerifyingKey};
use attesta_provider::pin::PinKey;
use attesta_provider::{
    InMemoryAccounts, Instruction, InstructionClient, InstructionEnvelope, InstructionError,
    InstructionResult, InstructionService, SessionBroker, SoftHsm,
};
use p256::ecdsa::signature::Verifier as _;
use serde_bytes::ByteBuf;

const WALLET_ID: &str = "wallet-1";
const PIN: &str = "902851";
const PIN_SALT: [u8; 32] = [7; 32];

struct TestWallet {
    service: InstructionService<InMemoryAccounts, SoftHsm>,
    hw_key: SoftwareEcdsaKey,
}

async fn registered_wallet() -> TestWallet {
    let service =
        InstructionService::new(InMemoryAccounts::new(), SessionBroker::new(SoftHsm::new(), 4));
    let hw_key = SoftwareEcdsaKey::random();

    let pin_public_key = PinKey::new(PIN, &PIN_SALT).verifying_key().expect("pin key");
    service
        .register(
            WALLET_ID,
            &DerVerifyingKey(pin_public_key),
            &DerVerifyingKey(hw_key.public_key()),
        )
        .await
        .expect("registration");

    TestWallet { service, hw_key }
}

/// Build an envelope by hand, signing with `pin` (which may be wrong).
async fn envelope(
    wallet: &TestWallet, challenge: ByteBuf, sequence_number: u64, pin: &str,
    instruction: Instruction,
) -> InstructionEnvelope {
    let signed_bytes = cbor::to_vec(&ChallengeResponsePayload {
        challenge,
        sequence_number,
        instruction: instruction.clone(),
    })
    .expect("encode");

    InstructionEnvelope {
        sequence_number,
        instruction,
        pin_signature: DerSignature(
            PinKey::new(pin, &PIN_SALT).try_sign(&signed_bytes).expect("pin signature"),
        ),
        hw_signature: DerSignature(wallet.hw_key.try_sign(&signed_bytes).await.expect("hw signature")),
    }
}

fn generate_key_instruction(identifier: &str) -> Instruction {
    Instruction::GenerateKey { identifiers: vec![identifier.to_string()] }
}

#[tokio::test]
async fn accepted_instruction_advances_the_sequence() {
    let wallet = registered_wallet().await;

    let challenge = wallet.service.issue_challenge(WALLET_ID).await.expect("challenge");
    assert_eq!(challenge.sequence_number, 0);

    let envelope =
        envelope(&wallet, challenge.challenge, 1, PIN, generate_key_instruction("key-1")).await;
    let result = wallet.service.handle(WALLET_ID, &envelope).await.expect("instruction");

    let InstructionResult::GeneratedKeys { public_keys } = result else {
        panic!("expected generated keys");
    };
    assert_eq!(public_keys.len(), 1);
    assert_eq!(public_keys[0].0, "key-1");

    // The next challenge reflects the advanced sequence.
    let next = wallet.service.issue_challenge(WALLET_ID).await.expect("challenge");
    assert_eq!(next.sequence_number, 1);
}

#[tokio::test]
async fn replayed_and_stale_sequence_numbers_are_rejected() {
    let wallet = registered_wallet().await;

    let challenge = wallet.service.issue_challenge(WALLET_ID).await.expect("challenge");
    let first =
        envelope(&wallet, challenge.challenge, 1, PIN, generate_key_instruction("key-1")).await;
    wallet.service.handle(WALLET_ID, &first).await.expect("instruction");

    // Replay of the accepted envelope, against a fresh outstanding challenge.
    wallet.service.issue_challenge(WALLET_ID).await.expect("challenge");
    let replay = wallet.service.handle(WALLET_ID, &first).await.unwrap_err();
    assert!(matches!(replay, InstructionError::SequenceConflict));

    // A gap-skipping claim loses too.
    let challenge = wallet.service.issue_challenge(WALLET_ID).await.expect("challenge");
    let skipping =
        envelope(&wallet, challenge.challenge, 3, PIN, generate_key_instruction("key-2")).await;
    let err = wallet.service.handle(WALLET_ID, &skipping).await.unwrap_err();
    assert!(matches!(err, InstructionError::SequenceConflict));
}

#[tokio::test]
async fn pin_failures_lock_the_wallet_terminally() {
    let wallet = registered_wallet().await;

    // Four consecutive bad PIN proofs, each against a fresh challenge.
    for expected_left in [3, 2, 1, 0] {
        let challenge = wallet.service.issue_challenge(WALLET_ID).await.expect("challenge");
        let bad = envelope(
            &wallet,
            challenge.challenge,
            1,
            "902852",
            generate_key_instruction("key-1"),
        )
        .await;
        let err = wallet.service.handle(WALLET_ID, &bad).await.unwrap_err();
        let InstructionError::PinMismatch { attempts_left } = err else {
            panic!("expected a PIN mismatch, got {err}");
        };
        assert_eq!(attempts_left, expected_left);
    }

    // The lock is terminal: the correct PIN no longer helps.
    let err = wallet.service.issue_challenge(WALLET_ID).await.unwrap_err();
    assert!(matches!(err, InstructionError::WalletLocked));
}

#[tokio::test]
async fn a_successful_instruction_resets_the_failure_count() {
    let wallet = registered_wallet().await;

    let challenge = wallet.service.issue_challenge(WALLET_ID).await.expect("challenge");
    let bad =
        envelope(&wallet, challenge.challenge, 1, "902852", generate_key_instruction("key-1")).await;
    let err = wallet.service.handle(WALLET_ID, &bad).await.unwrap_err();
    assert!(matches!(err, InstructionError::PinMismatch { attempts_left: 3 }));

    let challenge = wallet.service.issue_challenge(WALLET_ID).await.expect("challenge");
    let good =
        envelope(&wallet, challenge.challenge, 1, PIN, generate_key_instruction("key-1")).await;
    wallet.service.handle(WALLET_ID, &good).await.expect("instruction");

    // The counter started over: three failures do not lock.
    for _ in 0..3 {
        let challenge = wallet.service.issue_challenge(WALLET_ID).await.expect("challenge");
        let bad = envelope(
            &wallet,
            challenge.challenge,
            2,
            "902852",
            generate_key_instruction("key-2"),
        )
        .await;
        wallet.service.handle(WALLET_ID, &bad).await.unwrap_err();
    }
    wallet.service.issue_challenge(WALLET_ID).await.expect("not locked");
}

#[tokio::test]
async fn racing_envelopes_on_the_same_sequence_yield_one_winner() {
    let wallet = registered_wallet().await;

    let challenge = wallet.service.issue_challenge(WALLET_ID).await.expect("challenge");
    let first = envelope(
        &wallet,
        challenge.challenge.clone(),
        1,
        PIN,
        generate_key_instruction("key-a"),
    )
    .await;
    let second =
        envelope(&wallet, challenge.challenge, 1, PIN, generate_key_instruction("key-b")).await;

    let (left, right) = tokio::join!(
        wallet.service.handle(WALLET_ID, &first),
        wallet.service.handle(WALLET_ID, &second),
    );

    let successes = [&left, &right].iter().filter(|result| result.is_ok()).count();
    assert_eq!(successes, 1, "exactly one racing envelope may win");
    let loser = if left.is_ok() { right } else { left };
    assert!(matches!(loser.unwrap_err(), InstructionError::SequenceConflict));
}

#[tokio::test]
async fn unknown_wallets_and_missing_challenges_are_rejected() {
    let wallet = registered_wallet().await;

    let err = wallet.service.issue_challenge("nobody").await.unwrap_err();
    assert!(matches!(err, InstructionError::UnknownWallet(_)));

    // No challenge issued yet.
    let orphan = envelope(
        &wallet,
        ByteBuf::from(vec![0; 32]),
        1,
        PIN,
        generate_key_instruction("key-1"),
    )
    .await;
    let err = wallet.service.handle(WALLET_ID, &orphan).await.unwrap_err();
    assert!(matches!(err, InstructionError::ChallengeMissing));
}

#[tokio::test]
async fn client_generates_and_signs_with_remote_keys() {
    let wallet = registered_wallet().await;
    let client =
        InstructionClient::new(WALLET_ID, PIN, PIN_SALT.to_vec(), &wallet.hw_key, &wallet.service);

    let keys = client
        .generate_keys(vec!["key-1".to_string(), "key-2".to_string()])
        .await
        .expect("key generation");
    assert_eq!(keys.len(), 2);

    // Each signature round-trips through the instruction protocol and
    // verifies against the key's public half.
    let signature = keys[0].try_sign(b"device authentication").await.expect("remote signature");
    keys[0].public_key().verify(b"device authentication", &signature).expect("verification");

    let signature = keys[1].try_sign(b"another payload").await.expect("remote signature");
    keys[1].public_key().verify(b"another payload", &signature).expect("verification");
}
