//! Change-detection and sync engine for TabVault.
//!
//! This module provides a pure, side-effect-free state machine that decides
//! when the client should capture and upload its tab state. The machine
//! takes events as input and produces a new state plus a list of actions
//! to execute.
//!
//! The actual I/O (timers, encoding, encrypting, uploading) is performed by
//! `tabvault-client`, not by this module. The hosting process may be
//! suspended at any point between events and lose its in-memory timers;
//! everything here is reconstructible from persisted state — a cold start
//! resets `last_fingerprint` to unknown, costing at worst one redundant
//! upload, never a missed one.

use std::time::Duration;
use tabvault_types::Fingerprint;

/// Debounce window: a burst of tab events within this window collapses
/// into a single sync attempt, measured from the *last* event.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(3);

/// Fallback period: an independent periodic check that re-validates state
/// even if the in-memory debounce timer was lost to a host suspend.
pub const FALLBACK_INTERVAL: Duration = Duration::from_secs(300);

/// Kinds of platform tab notifications the engine may observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabEventKind {
    /// A tab was opened.
    Created,
    /// A tab was closed.
    Removed,
    /// A tab navigated or its title/pin state changed.
    Updated,
    /// A tab moved within its window.
    Moved,
    /// A tab was attached to a window.
    Attached,
    /// A tab was detached from a window.
    Detached,
    /// The active tab changed. Does not alter the modeled state.
    Activated,
    /// Window focus changed. Does not alter the modeled state.
    WindowFocusChanged,
}

impl TabEventKind {
    /// Whether this notification changes the modeled workspace state.
    ///
    /// Pure focus changes fire at high frequency without changing what a
    /// snapshot would contain, so they must not set the dirty flag.
    pub fn changes_state(&self) -> bool {
        !matches!(
            self,
            TabEventKind::Activated | TabEventKind::WindowFocusChanged
        )
    }
}

/// Events fed into the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A platform tab notification arrived.
    Tab(TabEventKind),
    /// The debounce timer fired.
    DebounceFired,
    /// The periodic fallback timer ticked.
    FallbackTick {
        /// Current unix time (seconds).
        now: i64,
    },
    /// The host captured and encoded current state on request.
    SnapshotCaptured {
        /// Fingerprint of the encoded state.
        fingerprint: Fingerprint,
    },
    /// Capturing current state failed (platform error).
    CaptureFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The upload finished successfully.
    UploadSucceeded {
        /// Fingerprint of the uploaded state.
        fingerprint: Fingerprint,
        /// Unix time (seconds) of the success.
        at: i64,
    },
    /// The upload failed (transient transport failure).
    UploadFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The user logged in; forces one unconditional sync.
    LoggedIn,
    /// The user logged out; all timers and session material go away.
    LoggedOut,
}

/// Actions to be executed by the client.
///
/// These are instructions, not side effects. The client interprets them
/// and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// (Re)arm the debounce timer, replacing any armed one.
    ArmDebounce {
        /// How long to wait after the most recent event.
        window: Duration,
    },
    /// Read current tab state, encode it, and report the fingerprint
    /// back via [`EngineEvent::SnapshotCaptured`].
    CaptureSnapshot,
    /// Encrypt and upload the captured state, then report back via
    /// [`EngineEvent::UploadSucceeded`] / [`EngineEvent::UploadFailed`].
    UploadSnapshot,
    /// Cancel the debounce and fallback timers.
    CancelTimers,
    /// Evict key and session material for the account.
    ClearSessionState,
}

/// The per-device sync engine state.
///
/// One instance per logged-in device process. All fields are a cache over
/// persisted state; resetting them to defaults is always safe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncEngine {
    session: bool,
    dirty: bool,
    last_fingerprint: Option<Fingerprint>,
    last_synced_at: Option<i64>,
    last_error: Option<String>,
}

impl SyncEngine {
    /// Create a new engine with no active session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function — no side effects.
    pub fn on_event(mut self, event: EngineEvent) -> (Self, Vec<EngineAction>) {
        match event {
            EngineEvent::Tab(kind) => {
                if !self.session || !kind.changes_state() {
                    return (self, vec![]);
                }
                self.dirty = true;
                // Re-arming replaces any existing timer: a new event within
                // the window restarts the wait (coalescing debounce).
                (
                    self,
                    vec![EngineAction::ArmDebounce {
                        window: DEBOUNCE_WINDOW,
                    }],
                )
            }

            EngineEvent::DebounceFired => {
                if self.session && self.dirty {
                    (self, vec![EngineAction::CaptureSnapshot])
                } else {
                    (self, vec![])
                }
            }

            EngineEvent::FallbackTick { now } => {
                if !self.session {
                    return (self, vec![]);
                }
                let stale = self
                    .last_synced_at
                    .map_or(true, |at| now - at >= FALLBACK_INTERVAL.as_secs() as i64);
                if self.dirty || stale {
                    (self, vec![EngineAction::CaptureSnapshot])
                } else {
                    (self, vec![])
                }
            }

            EngineEvent::SnapshotCaptured { fingerprint } => {
                if !self.session {
                    return (self, vec![]);
                }
                if self.last_fingerprint == Some(fingerprint) {
                    // Nothing changed since the last upload: clear the flag
                    // and stop without a network call.
                    self.dirty = false;
                    (self, vec![])
                } else {
                    (self, vec![EngineAction::UploadSnapshot])
                }
            }

            EngineEvent::CaptureFailed { error } => {
                self.last_error = Some(error);
                (self, vec![])
            }

            EngineEvent::UploadSucceeded { fingerprint, at } => {
                self.last_fingerprint = Some(fingerprint);
                self.last_synced_at = Some(at);
                self.dirty = false;
                self.last_error = None;
                (self, vec![])
            }

            EngineEvent::UploadFailed { error } => {
                // Leave dirty set so a later timer retries; no immediate
                // retry loop against a down relay.
                self.dirty = true;
                self.last_error = Some(error);
                (self, vec![])
            }

            EngineEvent::LoggedIn => {
                self.session = true;
                self.dirty = true;
                // Unknown fingerprint forces the first capture to upload.
                self.last_fingerprint = None;
                self.last_error = None;
                (self, vec![EngineAction::CaptureSnapshot])
            }

            EngineEvent::LoggedOut => {
                self = Self::new();
                (
                    self,
                    vec![EngineAction::CancelTimers, EngineAction::ClearSessionState],
                )
            }
        }
    }

    /// Whether a session is active.
    pub fn has_session(&self) -> bool {
        self.session
    }

    /// Whether uncaptured changes are pending.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Fingerprint of the last successfully uploaded state.
    pub fn last_fingerprint(&self) -> Option<Fingerprint> {
        self.last_fingerprint
    }

    /// Unix time of the last successful sync.
    pub fn last_synced_at(&self) -> Option<i64> {
        self.last_synced_at
    }

    /// Last recorded error message, preserved for observability without
    /// blocking retries.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
