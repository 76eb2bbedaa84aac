//! # tabvault-relay
//!
//! Untrusted relay server for TabVault.
//!
//! The relay stores encrypted tab snapshots, holds the account's
//! wrapped key envelopes, and routes restore requests between devices.
//! It never sees plaintext or a usable key:
//!
//! - Snapshot blobs and IVs are opaque base64 strings.
//! - Key envelopes are password- or recovery-wrapped ciphertext; the
//!   recovery envelope is gated on a salted verifier hash, which is
//!   itself useless for decryption.
//! - Restore routing uses only device ids and timestamps.
//!
//! ## API
//!
//! A JSON HTTP API under `/v1` (bearer-token authenticated), plus an
//! SSE event stream per device for live restore push. See
//! [`http::build_router`] for the route table.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod server;
pub mod storage;
