//! Event subscriptions: [`Subscription`].

use tokio::sync::mpsc;

use crate::types::Event;

#[derive(Debug, Clone)]
pub(crate) enum Filter {
    All,
    Channel(String),
    Presence(String),
}

impl Filter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            Filter::All => true,
            Filter::Channel(name) => event.channel() == Some(name.as_str()),
            Filter::Presence(name) => {
                matches!(event, Event::Presence { channel, .. } if channel == name)
            }
        }
    }
}

/// Sending half of a [`Subscription`], held by the event loop.
#[derive(Debug)]
pub(crate) struct Subscriber {
    filter: Filter,
    tx: mpsc::UnboundedSender<Event>,
}

impl Subscriber {
    /// Returns `false` once the [`Subscription`] has been dropped.
    pub(crate) fn deliver(&self, event: &Event) -> bool {
        if self.tx.is_closed() {
            return false;
        }
        if !self.filter.matches(event) {
            return true;
        }
        self.tx.send(event.clone()).is_ok()
    }
}

pub(crate) fn subscription(filter: Filter) -> (Subscriber, Subscription) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Subscriber { filter, tx }, Subscription { rx })
}

/// Stream of [`Event`]s from a client, a channel, or a channel's presence.
///
/// Each subscription has its own unbounded queue, so a slow consumer never
/// loses events. Events emitted before the subscription was registered are
/// not replayed.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    /// Receive the next event. Returns `None` once the client has shut down.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
