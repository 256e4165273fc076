//! Transport seam.
//!
//! The engine does not speak WebSocket itself. A [`Transport`] moves
//! [`ProtocolMessage`]s to and from the server and reports what happens to
//! the link through the [`TransportSink`] it is handed on `open`.

use tokio::sync::mpsc;

use crate::event_loop::{Command, TransportEvent};
use crate::protocol::{ErrorInfo, ProtocolMessage};
use crate::types::Error;

pub trait Transport: Send {
    /// Start connecting. `resume_key` is set when the previous connection
    /// may still be resumed. Progress is reported through `sink`.
    fn open(&mut self, resume_key: Option<&str>, sink: TransportSink);

    fn send(&mut self, message: ProtocolMessage) -> Result<(), Error>;

    /// Drop the link. No further callbacks are expected from the sink handed
    /// to the matching `open`.
    fn close(&mut self);
}

/// Callback handle given to a [`Transport`] for a single `open`.
///
/// Each sink is stamped with the transport generation it belongs to, so
/// callbacks from a link the engine has already replaced are ignored.
#[derive(Debug, Clone)]
pub struct TransportSink {
    tx: mpsc::WeakUnboundedSender<Command>,
    generation: u64,
}

impl TransportSink {
    pub(crate) fn new(tx: mpsc::WeakUnboundedSender<Command>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub fn opened(&self) {
        self.post(TransportEvent::Opened);
    }

    pub fn frame_received(&self, message: ProtocolMessage) {
        self.post(TransportEvent::Frame(message));
    }

    pub fn closed(&self, error: Option<ErrorInfo>) {
        self.post(TransportEvent::Closed(error));
    }

    fn post(&self, event: TransportEvent) {
        let Some(tx) = self.tx.upgrade() else {
            tracing::trace!("Transport event after client shut down");
            return;
        };
        let _ = tx.send(Command::Transport {
            generation: self.generation,
            event,
        });
    }
}
