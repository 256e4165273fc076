//! Public types for the ably-realtime crate.

use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::protocol::{ErrorInfo, Message, PresenceMessage};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// States from which the client will reach `connected` again on its own
    /// (or once the current attempt settles).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Initialized
                | ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    #[default]
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A connection state transition. `previous == current` marks an UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<ErrorInfo>,
    /// Delay before the next automatic connection attempt, when one is
    /// scheduled.
    pub retry_in: Option<Duration>,
}

/// A channel state transition. `previous == current` marks an UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub reason: Option<ErrorInfo>,
    pub resumed: bool,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events delivered through a [`Subscription`](crate::Subscription).
#[derive(Debug, Clone)]
pub enum Event {
    ConnectionStateChange(ConnectionStateChange),
    ChannelStateChange {
        channel: String,
        change: ChannelStateChange,
    },
    /// A message received on an attached channel.
    Message { channel: String, message: Message },
    /// A presence event that changed the channel's member map.
    Presence {
        channel: String,
        message: PresenceMessage,
    },
}

impl Event {
    /// Name of the channel the event belongs to, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Event::ConnectionStateChange(_) => None,
            Event::ChannelStateChange { channel, .. }
            | Event::Message { channel, .. }
            | Event::Presence { channel, .. } => Some(channel),
        }
    }
}

// ---------------------------------------------------------------------------
// Completions
// ---------------------------------------------------------------------------

/// One-shot result slot for a queued operation (attach, detach, publish,
/// presence). Resolved by the event loop once the operation settles.
#[derive(Debug)]
pub struct Completion(Option<oneshot::Sender<Result<(), ErrorInfo>>>);

impl Completion {
    pub fn channel() -> (Self, oneshot::Receiver<Result<(), ErrorInfo>>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// A completion nobody waits for.
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn complete(self, result: Result<(), ErrorInfo>) {
        if let Some(tx) = self.0 {
            // Receiver may have been dropped by a caller that stopped waiting.
            let _ = tx.send(result);
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Client configuration. Connection details received in CONNECTED override
/// `connection_state_ttl` and `max_idle_interval`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Client id used for `Presence::enter` / `update` / `leave`.
    pub client_id: Option<String>,
    /// Queue outbound messages while the connection is not yet connected.
    pub queue_messages: bool,
    pub disconnected_retry_timeout: Duration,
    pub suspended_retry_timeout: Duration,
    pub channel_retry_timeout: Duration,
    /// Timeout for connect, attach, detach and close round trips.
    pub realtime_request_timeout: Duration,
    pub connection_state_ttl: Duration,
    pub max_idle_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            queue_messages: true,
            disconnected_retry_timeout: Duration::from_secs(15),
            suspended_retry_timeout: Duration::from_secs(30),
            channel_retry_timeout: Duration::from_secs(15),
            realtime_request_timeout: Duration::from_secs(10),
            connection_state_ttl: Duration::from_secs(120),
            max_idle_interval: Duration::from_secs(15),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Ably protocol error: {0}")]
    Ably(#[from] ErrorInfo),

    #[error("Client has shut down")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}
