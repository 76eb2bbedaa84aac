//! # tabvault-core
//!
//! Pure logic for TabVault (no I/O, instant tests).
//!
//! This crate implements the state machines that decide *when* things
//! happen — when to capture and upload a snapshot, when to reconnect a
//! push channel, whether a restore request may still transition — without
//! any network, disk, or timer I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure**: they take events in and produce
//! a new state plus a list of actions. The actual I/O (network, timers,
//! persistent store) is performed by `tabvault-client`, which interprets
//! the actions. This keeps the debounce/fallback/fingerprint logic and the
//! reconnect/catch-up logic testable without real timers or sockets, and
//! lets one test process simulate several devices.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod engine;
pub mod restore;

pub use channel::{ChannelAction, ChannelEvent, ChannelState, Frame};
pub use engine::{
    EngineAction, EngineEvent, SyncEngine, TabEventKind, DEBOUNCE_WINDOW, FALLBACK_INTERVAL,
};
pub use restore::{transition, RestoreInbox, TransitionError};
