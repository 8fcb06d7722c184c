//! # ISO mdoc attestations
//!
//! This crate implements the mdoc data model from ISO/IEC 18013-5: issuance
//! of selectively disclosable, issuer-signed attestations bound to a device
//! key, the holder-side disclosure state machine, and stateless verification
//! of disclosure responses.
//!
//! The model is deliberately split along the three roles:
//!
//! - [`issuer`] turns attribute values into a signed [`mdoc::IssuerSigned`],
//!   salting and digesting every attribute individually so the holder can
//!   later disclose any subset.
//! - [`holder`] holds a complete [`mdoc::Mdoc`] and answers disclosure
//!   requests with responses that reveal exactly the requested attributes.
//! - [`verifier`] checks a response end to end: issuer trust, issuer
//!   signature, validity window, per-attribute digests and the device
//!   signature over the session transcript.
//!
//! Private keys never appear in these APIs; all signing flows through the
//! [`keys::Signer`] trait so keys can live in hardware or behind a remote
//! instruction service.

pub mod cbor;
pub mod cose;
pub mod engagement;
pub mod holder;
pub mod issuer;
pub mod keys;
pub mod mdoc;
pub mod mso;
pub mod request;
pub mod verifier;
pub mod x509;

pub use cbor::Tag24;
pub use holder::{Disclosed, Discloser};
pub use issuer::{issue, UnsignedAttributes};
pub use mdoc::{DeviceResponse, DisclosedAttributes, IssuerSigned, Mdoc};
pub use verifier::verify;
pub use x509::{Certificate, TrustAnchors};
