//! # Wallet provider instruction service
//!
//! Every use of an HSM-resident wallet key goes through a replay-protected,
//! PIN-authenticated instruction:
//!
//! - [`instruction`] defines the wire model — tagged instruction variants,
//!   the signed challenge-response payload and the envelope carrying the PIN
//!   and hardware signatures.
//! - [`service`] is the provider side: challenge issuance, envelope
//!   authentication, terminal PIN lockout and the compare-and-swap sequence
//!   advance that makes every envelope single-use.
//! - [`hsm`] bounds access to the hardware security module with a pooled
//!   session broker; [`repository`] is the per-wallet storage seam.
//! - [`client`] is the wallet side: envelope construction, bounded retry on
//!   sequence races, and [`client::RemoteEcdsaKey`], which plugs HSM keys
//!   into the `attesta-mdoc` signer seam.
//! - [`pin`] derives the PIN key; [`authorization`] is the identity-provider
//!   seam.

pub mod authorization;
pub mod client;
pub mod hsm;
pub mod instruction;
pub mod pin;
pub mod repository;
pub mod service;

pub use client::{AccountProviderClient, InstructionClient, RemoteEcdsaKey};
pub use hsm::{Hsm, HsmError, SessionBroker, SoftHsm};
pub use instruction::{Instruction, InstructionEnvelope, InstructionResult};
pub use repository::{AccountRepository, InMemoryAccounts, WalletAccount};
pub use service::{InstructionError, InstructionService};
