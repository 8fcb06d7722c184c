//! The wallet instruction wire model.
//!
//! Every remote use of an HSM-resident key travels as an
//! [`InstructionEnvelope`]: the instruction itself, the sequence number it
//! claims, and two signatures over the [`ChallengeResponsePayload`] — one
//! with the PIN-derived key (proving PIN knowledge without transmitting the
//! PIN) and one with the device's hardware-backed key (proving the request
//! comes from the registered device).

use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;

/// One instruction, each variant carrying its own payload shape.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    /// Generate fresh key pairs in the HSM under the given identifiers.
    GenerateKey { identifiers: Vec<String> },

    /// Sign `payload` with the HSM key stored under `key_identifier`.
    Sign { key_identifier: String, payload: ByteBuf },
}

/// The result of a successfully executed instruction.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionResult {
    /// Public halves of the generated key pairs, per identifier.
    GeneratedKeys { public_keys: Vec<(String, DerVerifyingKey)> },

    /// The requested signature.
    Signature(DerSignature),
}

/// A challenge issued by the provider, bound to the wallet's current
/// sequence number. Single use: consumed by the next accepted instruction.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Challenge {
    /// Fresh random nonce.
    pub challenge: ByteBuf,

    /// The wallet's last accepted sequence number; the next envelope must
    /// claim exactly this plus one.
    pub sequence_number: u64,
}

/// The submitted instruction with its authentication signatures.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct InstructionEnvelope {
    /// Must equal the wallet's last accepted sequence number plus one.
    pub sequence_number: u64,

    /// The instruction to execute.
    pub instruction: Instruction,

    /// PIN-key signature over the [`ChallengeResponsePayload`] encoding.
    pub pin_signature: DerSignature,

    /// Hardware-key signature over the same bytes.
    pub hw_signature: DerSignature,
}

/// The structure both envelope signatures are computed over, in canonical
/// CBOR. Binding the challenge and the claimed sequence number into the
/// signed bytes is what makes an envelope single-use.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ChallengeResponsePayload {
    /// The nonce issued for this attempt.
    pub challenge: ByteBuf,

    /// The sequence number the envelope claims.
    pub sequence_number: u64,

    /// The instruction being authenticated.
    pub instruction: Instruction,
}

/// An ECDSA signature carried on the wire in DER form.
#[derive(Clone, Debug, PartialEq)]
pub struct DerSignature(pub Signature);

impl Serialize for DerSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ByteBuf::from(self.0.to_der().as_bytes()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DerSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = ByteBuf::deserialize(deserializer)?;
        Signature::from_der(&bytes).map(Self).map_err(de::Error::custom)
    }
}

/// A P-256 public key carried on the wire as DER SubjectPublicKeyInfo.
#[derive(Clone, Debug, PartialEq)]
pub struct DerVerifyingKey(pub VerifyingKey);

impl DerVerifyingKey {
    /// Verify `signature` over `msg` with this key.
    ///
    /// # Errors
    /// Fails when the signature does not verify.
    pub fn verify(&self, msg: &[u8], signature: &DerSignature) -> Result<(), p256::ecdsa::Error> {
        self.0.verify(msg, &signature.0)
    }
}

impl Serialize for DerVerifyingKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let der = self.0.to_public_key_der().map_err(ser::Error::custom)?;
        ByteBuf::from(der.as_bytes()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DerVerifyingKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = ByteBuf::deserialize(deserializer)?;
        VerifyingKey::from_public_key_der(&bytes).map(Self).map_err(de::Error::custom)
    }
}
