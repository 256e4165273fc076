//! Ably realtime protocol engine.
//!
//! Implements the client side of the Ably realtime protocol on top of a
//! pluggable [`Transport`]: connection lifecycle, channel attach/detach and
//! presence, with all state owned by a single background task.
//!
//! # Features
//! - Connection resume, jittered incremental backoff and TTL-based suspension
//! - Channel attach/detach with automatic re-attach after server detach
//! - Presence member map with SYNC reconciliation and automatic re-entry
//! - Message queueing while disconnected and ACK/NACK tracking
//! - Idle (heartbeat) detection
//!
//! # Example
//! ```no_run
//! # use ably_realtime::{Error, ProtocolMessage, Transport, TransportSink};
//! # struct WebSocket;
//! # impl Transport for WebSocket {
//! #     fn open(&mut self, _: Option<&str>, _: TransportSink) {}
//! #     fn send(&mut self, _: ProtocolMessage) -> Result<(), Error> { Ok(()) }
//! #     fn close(&mut self) {}
//! # }
//! # async fn example() -> Result<(), Error> {
//! use ably_realtime::{ClientOptions, Event, Realtime};
//!
//! let options = ClientOptions {
//!     client_id: Some("alice".to_string()),
//!     ..Default::default()
//! };
//! let client = Realtime::new(options, WebSocket);
//! client.connect();
//!
//! let channel = client.channel("chat");
//! let mut events = channel.subscribe();
//! channel.attach().await?;
//! channel.presence().enter(None).await?;
//! channel.publish("greeting", serde_json::json!("hello")).await?;
//!
//! while let Some(event) = events.next().await {
//!     if let Event::Message { message, .. } = event {
//!         println!("got: {:?}", message.name);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod backoff;
mod channel;
mod clock;
mod connection;
mod event_loop;
mod presence;
mod protocol;
mod realtime;
mod retry;
mod subscribe;
mod transport;
mod types;

pub use backoff::{
    BackoffRetryDelayCalculator, DefaultJitterCoefficientGenerator, JitterCoefficientGenerator,
    StaticJitterCoefficients,
};
pub use channel::{ChannelEffect, ChannelEvent, ChannelInput, ChannelStateMachine, ChannelTimer};
pub use clock::{Clock, TokioClock};
pub use connection::{ConnectionEffect, ConnectionInput, ConnectionStateMachine, ConnectionTimer};
pub use presence::PresenceMap;
pub use protocol::{
    Action, ConnectionDetails, ErrorInfo, Message, PresenceAction, PresenceId, PresenceMessage,
    ProtocolMessage, error_code, flags,
};
pub use realtime::{Channel, Presence, Realtime, RealtimeBuilder};
pub use retry::{
    ChannelAttachRetryState, ConnectionRetryState, RetryAttempt, RetryDelayCalculator,
    RetrySequence,
};
pub use subscribe::Subscription;
pub use transport::{Transport, TransportSink};
pub use types::{
    ChannelState, ChannelStateChange, ClientOptions, Completion, ConnectionState,
    ConnectionStateChange, Error, Event,
};
