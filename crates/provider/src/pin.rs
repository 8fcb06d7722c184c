//! PIN validation and the PIN-derived signing key.
//!
//! The PIN never leaves the device. Instead, an ECDSA key pair is derived
//! deterministically from the PIN and a per-wallet salt; the provider stores
//! only the public half at registration, and every instruction proves PIN
//! knowledge by carrying a signature made with the derived private key.

use hkdf::Hkdf;
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest as _, Sha256};

/// Required PIN length, in digits.
pub const PIN_LENGTH: usize = 6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PinValidationError {
    #[error("PIN must be exactly {PIN_LENGTH} digits")]
    InvalidLength,
    #[error("PIN may only contain digits")]
    NonDigits,
    #[error("PIN may not be a single repeated digit")]
    RepeatedDigit,
    #[error("PIN may not be an ascending or descending run")]
    SequentialDigits,
}

/// Check that a PIN is usable: exactly six digits, not one repeated digit,
/// not an ascending or descending run such as `123456` or `654321`.
///
/// # Errors
/// The first [`PinValidationError`] the PIN trips.
pub fn validate_pin(pin: &str) -> Result<(), PinValidationError> {
    if pin.chars().count() != PIN_LENGTH {
        return Err(PinValidationError::InvalidLength);
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(PinValidationError::NonDigits);
    }

    let digits: Vec<i8> = pin.bytes().map(|b| (b - b'0') as i8).collect();
    if digits.windows(2).all(|pair| pair[1] == pair[0]) {
        return Err(PinValidationError::RepeatedDigit);
    }
    let ascending = digits.windows(2).all(|pair| pair[1] - pair[0] == 1);
    let descending = digits.windows(2).all(|pair| pair[0] - pair[1] == 1);
    if ascending || descending {
        return Err(PinValidationError::SequentialDigits);
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum PinKeyError {
    #[error("could not derive a valid key from the PIN")]
    Derivation,
}

/// An ECDSA key pair derived from a PIN and a per-wallet salt.
///
/// Derivation is HKDF-SHA256 with the salt's hash as HKDF salt and the PIN
/// as input key material, rejection-sampling the output into a valid P-256
/// scalar by bumping a counter in the info string. The same PIN and salt
/// always yield the same key, so the provider can verify against the public
/// key registered at enrolment.
pub struct PinKey<'a> {
    pin: &'a str,
    salt: &'a [u8],
}

impl<'a> PinKey<'a> {
    #[must_use]
    pub fn new(pin: &'a str, salt: &'a [u8]) -> Self {
        Self { pin, salt }
    }

    fn signing_key(&self) -> Result<SigningKey, PinKeyError> {
        let hkdf = Hkdf::<Sha256>::new(Some(&Sha256::digest(self.salt)), self.pin.as_bytes());
        // Nearly every 32-byte output is a valid scalar; the counter exists
        // for the negligible remainder.
        for counter in 0u8..=u8::MAX {
            let mut okm = [0u8; 32];
            hkdf.expand_multi_info(&[b"pin_key", &[counter]], &mut okm)
                .map_err(|_| PinKeyError::Derivation)?;
            if let Ok(key) = SigningKey::from_bytes(&okm.into()) {
                return Ok(key);
            }
        }
        Err(PinKeyError::Derivation)
    }

    /// The public half of the derived key pair.
    ///
    /// # Errors
    /// [`PinKeyError::Derivation`] when no valid scalar can be derived.
    pub fn verifying_key(&self) -> Result<VerifyingKey, PinKeyError> {
        Ok(*self.signing_key()?.verifying_key())
    }

    /// Sign `msg` with the derived private key.
    ///
    /// # Errors
    /// [`PinKeyError::Derivation`] when no valid scalar can be derived.
    pub fn try_sign(&self, msg: &[u8]) -> Result<Signature, PinKeyError> {
        Ok(self.signing_key()?.sign(msg))
    }
}
