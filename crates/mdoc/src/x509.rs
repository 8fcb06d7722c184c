//! Certificate handling and chain validation.
//!
//! A [`Certificate`] is DER bytes with conversions into the crates that do
//! the actual work: `x509-parser` to read contents, `webpki` to validate
//! chains and, behind the `generate` feature, `rcgen` to mint test
//! hierarchies.
//!
//! Trust is anchored in a configured [`TrustAnchors`] set; anchors are
//! trusted a priori and must be self-signed. There is no discovery beyond
//! the configured set.

use chrono::{DateTime, Utc};
use p256::ecdsa::VerifyingKey;
use p256::elliptic_curve::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use webpki::{EndEntityCert, KeyUsage, Time, TrustAnchor, ECDSA_P256_SHA256};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Chain validation failures, ordered from "wrong configuration" to "wrong
/// certificate".
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("certificate chain does not terminate in a configured trust anchor")]
    UnknownAnchor,
    #[error("certificate is not valid at the evaluation time")]
    Expired,
    #[error("certificate key usage does not permit this operation")]
    UsageViolation,
    #[error("certificate chain is broken")]
    ChainBroken,
    #[error("certificate parsing failed: {0}")]
    Parsing(String),
}

/// An X.509 certificate as DER bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate(ByteBuf);

impl<T: AsRef<[u8]>> From<T> for Certificate {
    fn from(der: T) -> Self {
        Self(ByteBuf::from(der.as_ref()))
    }
}

impl Certificate {
    /// The raw DER encoding.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The subject public key as a P-256 verifying key.
    ///
    /// # Errors
    /// Fails when the certificate does not parse or its key is not P-256.
    pub fn public_key(&self) -> Result<VerifyingKey, TrustError> {
        let cert = self.to_x509()?;
        VerifyingKey::from_public_key_der(cert.public_key().raw)
            .map_err(|e| TrustError::Parsing(e.to_string()))
    }

    /// Parse into an `x509-parser` certificate to read its contents.
    ///
    /// # Errors
    /// Fails on malformed DER.
    pub fn to_x509(&self) -> Result<X509Certificate, TrustError> {
        let (_, cert) = X509Certificate::from_der(self.as_bytes())
            .map_err(|e| TrustError::Parsing(e.to_string()))?;
        Ok(cert)
    }
}

/// Extended key usage of a certificate within this protocol, enforced during
/// chain validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateUsage {
    /// Signing attestations (issuer certificates). OID 1.0.18013.5.1.2.
    IssuerAuth,
    /// Signing disclosure requests (reader certificates). OID 1.0.18013.5.1.6.
    ReaderAuth,
}

pub(crate) const EKU_ISSUER_AUTH: &[u8] = &[40, 129, 140, 93, 5, 1, 2];
pub(crate) const EKU_READER_AUTH: &[u8] = &[40, 129, 140, 93, 5, 1, 6];

impl CertificateUsage {
    pub(crate) fn eku(self) -> &'static [u8] {
        match self {
            Self::IssuerAuth => EKU_ISSUER_AUTH,
            Self::ReaderAuth => EKU_READER_AUTH,
        }
    }
}

/// The configured set of root certificates against which chains are
/// validated.
#[derive(Debug, Clone)]
pub struct TrustAnchors {
    roots: Vec<Certificate>,
}

impl TrustAnchors {
    /// Build an anchor set from root certificates.
    ///
    /// Each anchor must be self-signed: there is no chain of trust above the
    /// configured set, so an anchor that cannot vouch for itself is a
    /// configuration error.
    ///
    /// # Errors
    /// Fails when a certificate does not parse or is not self-signed.
    pub fn try_from_certificates(roots: Vec<Certificate>) -> Result<Self, TrustError> {
        for root in &roots {
            let cert = root.to_x509()?;
            cert.verify_signature(None).map_err(|_| TrustError::UnknownAnchor)?;
        }
        Ok(Self { roots })
    }

    /// The anchors as borrowed `webpki` trust anchors.
    fn webpki(&self) -> Result<Vec<TrustAnchor>, TrustError> {
        self.roots
            .iter()
            .map(|root| {
                TrustAnchor::try_from_cert_der(root.as_bytes())
                    .map_err(|e| TrustError::Parsing(e.to_string()))
            })
            .collect()
    }
}

/// Validate a certificate chain against the configured trust anchors.
///
/// Performs standard path validation: signature linking through the
/// intermediates to an anchor, validity window containing `at_time`, and the
/// extended-key-usage check for `usage` on the leaf. On success the leaf's
/// public key is returned for signature verification.
///
/// # Errors
/// [`TrustError::UnknownAnchor`] when no configured anchor terminates the
/// chain, [`TrustError::Expired`] when a certificate is outside its validity
/// window at `at_time`, [`TrustError::UsageViolation`] when the required key
/// usage is absent, [`TrustError::ChainBroken`] for any other path failure.
pub fn validate_chain(
    leaf: &Certificate, intermediates: &[Certificate], trust_anchors: &TrustAnchors,
    usage: CertificateUsage, at_time: DateTime<Utc>,
) -> Result<VerifyingKey, TrustError> {
    let anchors = trust_anchors.webpki()?;
    let intermediate_der: Vec<&[u8]> = intermediates.iter().map(Certificate::as_bytes).collect();
    let end_entity: EndEntityCert =
        leaf.as_bytes().try_into().map_err(|_| TrustError::ChainBroken)?;

    let timestamp =
        u64::try_from(at_time.timestamp()).map_err(|_| TrustError::Expired)?;
    end_entity
        .verify_for_usage(
            &[&ECDSA_P256_SHA256],
            &anchors,
            &intermediate_der,
            Time::from_seconds_since_unix_epoch(timestamp),
            KeyUsage::required(usage.eku()),
            &[],
        )
        .map_err(map_webpki_error)?;

    leaf.public_key()
}

fn map_webpki_error(error: webpki::Error) -> TrustError {
    match error {
        webpki::Error::CertExpired | webpki::Error::CertNotValidYet => TrustError::Expired,
        webpki::Error::RequiredEkuNotFound => TrustError::UsageViolation,
        webpki::Error::UnknownIssuer => TrustError::UnknownAnchor,
        _ => TrustError::ChainBroken,
    }
}

#[cfg(any(test, feature = "generate"))]
mod generate {
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::der::asn1::SequenceOf;
    use p256::pkcs8::der::Encode;
    use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, ObjectIdentifier};
    use rcgen::{
        BasicConstraints, Certificate as RcgenCertificate, CertificateParams, CustomExtension,
        DnType, IsCa,
    };

    use super::{Certificate, CertificateUsage};

    /// OID of the extendedKeyUsage extension.
    const OID_EXT_KEY_USAGE: &[u64] = &[2, 5, 29, 37];

    // rcgen's default window runs to the year 4096, which defeats expiry
    // checks. Generated certificates get a bounded window instead.
    fn bounded_validity(params: &mut CertificateParams) {
        params.not_before = rcgen::date_time_ymd(2023, 1, 1);
        params.not_after = rcgen::date_time_ymd(2033, 1, 1);
    }

    /// Certificate generation failures.
    #[derive(Debug, thiserror::Error)]
    pub enum GenerateError {
        #[error("certificate creation failed: {0}")]
        Creation(#[from] rcgen::RcgenError),
        #[error("private key conversion failed: {0}")]
        Key(String),
    }

    impl Certificate {
        /// Generate a new self-signed CA certificate and its key.
        ///
        /// # Errors
        /// Propagates `rcgen` generation failures.
        pub fn new_ca(common_name: &str) -> Result<(Certificate, SigningKey), GenerateError> {
            let mut params = CertificateParams::new(vec![]);
            params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
            params.distinguished_name.push(DnType::CommonName, common_name);
            bounded_validity(&mut params);
            let cert = RcgenCertificate::from_params(params)?;

            let key = rcgen_privkey(&cert)?;
            Ok((cert.serialize_der()?.into(), key))
        }

        /// Generate a leaf certificate signed by `ca`, carrying the extended
        /// key usage for `usage`.
        ///
        /// # Errors
        /// Propagates `rcgen` generation failures.
        pub fn new(
            ca: &Certificate, ca_key: &SigningKey, common_name: &str, usage: CertificateUsage,
        ) -> Result<(Certificate, SigningKey), GenerateError> {
            let mut params = CertificateParams::new(vec![]);
            params.is_ca = IsCa::NoCa;
            params.distinguished_name.push(DnType::CommonName, common_name);
            params.custom_extensions.push(eku_extension(usage));
            bounded_validity(&mut params);
            let unsigned = RcgenCertificate::from_params(params)?;

            let ca_keypair = rcgen::KeyPair::from_der(
                &ca_key.to_pkcs8_der().map_err(|e| GenerateError::Key(e.to_string()))?.to_bytes(),
            )?;
            let ca = RcgenCertificate::from_params(CertificateParams::from_ca_cert_der(
                ca.as_bytes(),
                ca_keypair,
            )?)?;

            let der = unsigned.serialize_der_with_signer(&ca)?;
            let key = rcgen_privkey(&unsigned)?;
            Ok((der.into(), key))
        }
    }

    fn rcgen_privkey(cert: &RcgenCertificate) -> Result<SigningKey, GenerateError> {
        SigningKey::from_pkcs8_der(cert.get_key_pair().serialized_der())
            .map_err(|e| GenerateError::Key(e.to_string()))
    }

    // rcgen only knows a whitelist of extended key usages, so the protocol
    // OIDs are DER-serialized by hand into a custom extension. The
    // serialization has fixed input and cannot fail.
    fn eku_extension(usage: CertificateUsage) -> CustomExtension {
        let mut seq = SequenceOf::<ObjectIdentifier, 1>::new();
        seq.add(ObjectIdentifier::from_bytes(usage.eku()).expect("fixed OID"))
            .expect("single element");
        let mut ext = CustomExtension::from_oid_content(
            OID_EXT_KEY_USAGE,
            seq.to_der().expect("fixed sequence"),
        );
        ext.set_criticality(true);
        ext
    }
}

#[cfg(any(test, feature = "generate"))]
pub use generate::GenerateError;
