//! `COSE_Sign1` signed envelopes and `COSE_Key` handling.
//!
//! The issuer signs the mobile security object, and the device signs the
//! session-bound device authentication structure, both as `COSE_Sign1`. The
//! protected header carries the signature algorithm and the signer's
//! certificate chain (x5chain), so a verifier can evaluate trust from the
//! envelope alone.

use ciborium::Value;
use coset::{iana, AsCborValue, CoseSign1, CoseSign1Builder, HeaderBuilder, Label};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::EncodedPoint;
use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};

use crate::cbor::CborError;
use crate::keys::Signer;
use crate::x509::Certificate;

/// Protected header label for the signer's certificate chain (RFC 9360).
pub const HEADER_LABEL_X5CHAIN: i64 = 33;

#[derive(Debug, thiserror::Error)]
pub enum CoseError {
    #[error("COSE envelope has no payload")]
    MissingPayload,
    #[error("protected header has no signer certificate chain")]
    MissingX5Chain,
    #[error("malformed signer certificate chain in protected header")]
    MalformedX5Chain,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("unsupported COSE key: {0}")]
    UnsupportedKey(String),
    #[error(transparent)]
    Cbor(#[from] CborError),
}

/// Serde adapter for `coset` types, which implement `AsCborValue` rather than
/// `Serialize`/`Deserialize`.
#[derive(Debug, Clone, PartialEq)]
pub struct CoseCbor<T: AsCborValue + Clone>(pub T);

impl<T: AsCborValue + Clone> Serialize for CoseCbor<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.clone().to_cbor_value().map_err(ser::Error::custom)?.serialize(serializer)
    }
}

impl<'de, T: AsCborValue + Clone> Deserialize<'de> for CoseCbor<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::from_cbor_value(Value::deserialize(deserializer)?).map_err(de::Error::custom).map(Self)
    }
}

/// An RFC 9052 `COSE_Key`, restricted to the EC2/P-256 keys this protocol
/// uses.
pub type CoseKey = CoseCbor<coset::CoseKey>;

impl TryFrom<&VerifyingKey> for CoseKey {
    type Error = CoseError;

    fn try_from(key: &VerifyingKey) -> Result<Self, Self::Error> {
        let point = key.to_encoded_point(false);
        let x = point.x().ok_or_else(|| CoseError::UnsupportedKey("missing x coordinate".into()))?;
        let y = point.y().ok_or_else(|| CoseError::UnsupportedKey("missing y coordinate".into()))?;
        let key = coset::CoseKeyBuilder::new_ec2_pub_key(
            iana::EllipticCurve::P_256,
            x.to_vec(),
            y.to_vec(),
        )
        .build();
        Ok(CoseCbor(key))
    }
}

impl TryFrom<&CoseKey> for VerifyingKey {
    type Error = CoseError;

    fn try_from(key: &CoseKey) -> Result<Self, Self::Error> {
        if key.0.kty != coset::RegisteredLabel::Assigned(iana::KeyType::EC2) {
            return Err(CoseError::UnsupportedKey("key type is not EC2".into()));
        }

        let curve = key
            .0
            .params
            .iter()
            .find(|(label, _)| *label == Label::Int(iana::Ec2KeyParameter::Crv as i64))
            .map(|(_, value)| value.clone())
            .ok_or_else(|| CoseError::UnsupportedKey("missing curve".into()))?;
        if curve != Value::Integer((iana::EllipticCurve::P_256 as u64).into()) {
            return Err(CoseError::UnsupportedKey("curve is not P-256".into()));
        }

        let coordinate = |param: iana::Ec2KeyParameter, name: &str| {
            key.0
                .params
                .iter()
                .find(|(label, _)| *label == Label::Int(param as i64))
                .and_then(|(_, value)| value.as_bytes().cloned())
                .ok_or_else(|| CoseError::UnsupportedKey(format!("missing {name} coordinate")))
        };
        let x = coordinate(iana::Ec2KeyParameter::X, "x")?;
        let y = coordinate(iana::Ec2KeyParameter::Y, "y")?;

        let point =
            EncodedPoint::from_affine_coordinates(x.as_slice().into(), y.as_slice().into(), false);
        VerifyingKey::from_encoded_point(&point)
            .map_err(|e| CoseError::UnsupportedKey(e.to_string()))
    }
}

/// Sign `payload` as a `COSE_Sign1` envelope.
///
/// The protected header carries ES256 and the signer's certificate chain.
/// Signing itself happens behind the [`Signer`] seam; the private key never
/// enters this function.
///
/// # Errors
/// Fails when the payload cannot be framed or the signer refuses.
pub async fn sign(
    payload: Vec<u8>, chain: &[Certificate], signer: &impl Signer,
) -> Result<CoseSign1, CoseError> {
    let x5chain = match chain {
        [single] => Value::Bytes(single.as_bytes().to_vec()),
        many => Value::Array(many.iter().map(|c| Value::Bytes(c.as_bytes().to_vec())).collect()),
    };
    let protected = HeaderBuilder::new()
        .algorithm(iana::Algorithm::ES256)
        .value(HEADER_LABEL_X5CHAIN, x5chain)
        .build();

    let sign1 = CoseSign1Builder::new().protected(protected).payload(payload).build();
    let tbs = coset::sig_structure_data(
        coset::SignatureContext::CoseSign1,
        sign1.protected.clone(),
        None,
        &[],
        sign1.payload.as_deref().unwrap_or_default(),
    );
    let signature = signer.try_sign(&tbs).await.map_err(|e| CoseError::Signing(e.to_string()))?;

    Ok(CoseSign1 { signature: signature.to_vec(), ..sign1 })
}

/// Verify a `COSE_Sign1` signature against a public key.
///
/// # Errors
/// [`CoseError::MissingPayload`] when the envelope is detached, otherwise
/// [`CoseError::SignatureInvalid`] on any parse or verification failure.
pub fn verify(sign1: &CoseSign1, key: &VerifyingKey) -> Result<(), CoseError> {
    let payload = sign1.payload.as_ref().ok_or(CoseError::MissingPayload)?;
    let tbs = coset::sig_structure_data(
        coset::SignatureContext::CoseSign1,
        sign1.protected.clone(),
        None,
        &[],
        payload,
    );
    let signature =
        Signature::from_slice(&sign1.signature).map_err(|_| CoseError::SignatureInvalid)?;
    key.verify(&tbs, &signature).map_err(|_| CoseError::SignatureInvalid)
}

/// Extract the signer certificate chain from the protected header.
///
/// Returns the chain leaf-first, as it was embedded at signing time.
///
/// # Errors
/// [`CoseError::MissingX5Chain`] when the header label is absent,
/// [`CoseError::MalformedX5Chain`] when its value is not one or more byte
/// strings.
pub fn x5chain(sign1: &CoseSign1) -> Result<Vec<Certificate>, CoseError> {
    let value = sign1
        .protected
        .header
        .rest
        .iter()
        .find(|(label, _)| *label == Label::Int(HEADER_LABEL_X5CHAIN))
        .map(|(_, value)| value)
        .ok_or(CoseError::MissingX5Chain)?;

    match value {
        Value::Bytes(der) => Ok(vec![Certificate::from(der.as_slice())]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_bytes()
                    .map(|der| Certificate::from(der.as_slice()))
                    .ok_or(CoseError::MalformedX5Chain)
            })
            .collect(),
        _ => Err(CoseError::MalformedX5Chain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SoftwareEcdsaKey;

    #[tokio::test]
    async fn sign_then_verify() {
        let signer = SoftwareEcdsaKey::random();
        let chain = vec![Certificate::from(b"not a real cert".as_slice())];

        let sign1 = sign(b"payload".to_vec(), &chain, &signer).await.unwrap();
        verify(&sign1, &signer.public_key()).unwrap();

        assert_eq!(x5chain(&sign1).unwrap(), chain);
    }

    #[tokio::test]
    async fn tampered_payload_fails_verification() {
        let signer = SoftwareEcdsaKey::random();
        let mut sign1 = sign(b"payload".to_vec(), &[], &signer).await.unwrap();

        sign1.payload = Some(b"payroll".to_vec());
        let err = verify(&sign1, &signer.public_key()).unwrap_err();
        assert!(matches!(err, CoseError::SignatureInvalid));
    }

    #[tokio::test]
    async fn wrong_key_fails_verification() {
        let signer = SoftwareEcdsaKey::random();
        let sign1 = sign(b"payload".to_vec(), &[], &signer).await.unwrap();

        let other = SoftwareEcdsaKey::random();
        assert!(verify(&sign1, &other.public_key()).is_err());
    }

    #[test]
    fn cose_key_roundtrips_through_verifying_key() {
        let key = SoftwareEcdsaKey::random().public_key();
        let cose: CoseKey = (&key).try_into().unwrap();
        let back: VerifyingKey = (&cose).try_into().unwrap();
        assert_eq!(key, back);
    }
}
