//! Push-channel connection state machine.
//!
//! Models the long-lived event stream a device holds against the relay:
//! connect, stream frames, reconnect with jittered exponential backoff,
//! and fetch any requests that were pushed while the stream was down.
//!
//! Like the sync engine, this is pure. `tabvault-client` owns the socket
//! and timers and feeds the resulting events back in.

use std::time::Duration;
use tabvault_types::PushFrame;

/// Ceiling for the reconnect backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Maximum random jitter added to each backoff delay, in milliseconds.
pub const JITTER_MS: u64 = 5_000;

/// A frame received on the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A periodic comment frame proving the connection is alive.
    Heartbeat,
    /// A pushed payload.
    Push(PushFrame),
}

/// Connection state of the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected and not trying.
    Idle,
    /// A connection attempt is in flight.
    Connecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
    },
    /// The stream is open and delivering frames.
    Streaming,
    /// Waiting out a backoff delay before reconnecting.
    Backoff {
        /// Consecutive failed attempts so far.
        attempt: u32,
    },
}

/// Events fed into the channel state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The client wants the channel up (login or startup).
    ConnectRequested,
    /// The transport established the stream.
    StreamOpened,
    /// A frame arrived on the stream.
    FrameReceived(Frame),
    /// The stream ended or the connection attempt failed.
    StreamClosed {
        /// Human-readable reason, for logging.
        reason: String,
    },
    /// The backoff timer fired.
    RetryTimerFired,
    /// The client wants the channel down (logout or shutdown).
    StopRequested,
}

/// Actions for the client to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// Open the event stream against the relay.
    OpenStream,
    /// Fetch pending restore requests addressed to this device.
    ///
    /// Issued on every successful (re)connect: a push sent while the
    /// stream was down is only reachable through this fetch.
    FetchPending,
    /// Hand a pushed payload to the application.
    DeliverPush(PushFrame),
    /// Start the reconnect timer.
    StartRetryTimer {
        /// How long to wait before retrying.
        delay: Duration,
    },
    /// Cancel any pending reconnect timer.
    CancelRetryTimer,
}

impl ChannelState {
    /// Process an event and return the new state plus actions.
    pub fn on_event(self, event: ChannelEvent) -> (Self, Vec<ChannelAction>) {
        match (self, event) {
            (ChannelState::Idle, ChannelEvent::ConnectRequested) => (
                ChannelState::Connecting { attempt: 0 },
                vec![ChannelAction::OpenStream],
            ),

            // Reconnect resets the attempt counter and always re-fetches
            // pending work: pushes sent during the outage were lost.
            (ChannelState::Connecting { .. }, ChannelEvent::StreamOpened) => (
                ChannelState::Streaming,
                vec![ChannelAction::FetchPending],
            ),

            (ChannelState::Streaming, ChannelEvent::FrameReceived(frame)) => match frame {
                Frame::Heartbeat => (ChannelState::Streaming, vec![]),
                Frame::Push(payload) => (
                    ChannelState::Streaming,
                    vec![ChannelAction::DeliverPush(payload)],
                ),
            },

            (ChannelState::Connecting { attempt }, ChannelEvent::StreamClosed { .. }) => {
                let attempt = attempt.saturating_add(1);
                (
                    ChannelState::Backoff { attempt },
                    vec![ChannelAction::StartRetryTimer {
                        delay: retry_delay(attempt),
                    }],
                )
            }

            (ChannelState::Streaming, ChannelEvent::StreamClosed { .. }) => (
                ChannelState::Backoff { attempt: 1 },
                vec![ChannelAction::StartRetryTimer {
                    delay: retry_delay(1),
                }],
            ),

            (ChannelState::Backoff { attempt }, ChannelEvent::RetryTimerFired) => (
                ChannelState::Connecting { attempt },
                vec![ChannelAction::OpenStream],
            ),

            (_, ChannelEvent::StopRequested) => {
                (ChannelState::Idle, vec![ChannelAction::CancelRetryTimer])
            }

            // Anything else is a stale event (e.g. a frame arriving after
            // the close was already processed) and is dropped.
            (state, _) => (state, vec![]),
        }
    }
}

/// Backoff delay for the given consecutive failure count.
///
/// Exponential with a 30s ceiling plus up to 5s of random jitter so that
/// a fleet of devices does not reconnect in lockstep after a relay
/// restart.
pub fn retry_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(2u64.saturating_pow(attempt.min(16))).min(MAX_BACKOFF);
    base + Duration::from_millis(jitter_ms())
}

fn jitter_ms() -> u64 {
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        return 0;
    }
    u64::from_le_bytes(buf) % JITTER_MS
}
