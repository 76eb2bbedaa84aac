//! # tabvault-client
//!
//! Client engine for TabVault. Provides:
//! - [`keys`] - envelope encryption for the account DataKey, password and
//!   recovery-code unlock paths
//! - [`codec`] - snapshot encoding, fingerprinting and payload encryption
//! - [`VaultClient`] - the session facade interpreting the sync engine
//!   against a relay
//! - [`scheduler`] / [`receiver`] - tokio drivers for the sync timers and
//!   the push channel
//! - [`transport`] - the relay API trait, its HTTP implementation and an
//!   in-memory mock
//!
//! The relay never sees plaintext: encryption, fingerprinting and key
//! handling all happen here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod codec;
pub mod keys;
pub mod receiver;
pub mod scheduler;
pub mod transport;

pub use client::{ClientError, SyncOutcome, VaultClient};
pub use codec::{CodecError, EncryptedSnapshot};
pub use keys::{DataKey, KeyError, RecoveryCode};
pub use receiver::{run_push_loop, TabOpener};
pub use scheduler::{run_sync_loop, TabSource};
pub use transport::{HttpRelay, MockRelay, Relay, TransportError};
