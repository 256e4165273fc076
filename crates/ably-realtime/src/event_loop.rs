//! The single task that owns every state machine.
//!
//! Public handles, transport callbacks and timers all post a [`Command`];
//! the loop applies each one to the connection or channel machines and then
//! carries out the effects they return before taking the next command.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::channel::{ChannelEffect, ChannelEvent, ChannelInput, ChannelStateMachine, ChannelTimer};
use crate::connection::{ConnectionEffect, ConnectionInput, ConnectionStateMachine, ConnectionTimer};
use crate::protocol::{ErrorInfo, PresenceAction, PresenceMessage, ProtocolMessage, error_code};
use crate::retry::RetryDelayCalculator;
use crate::subscribe::Subscriber;
use crate::transport::{Transport, TransportSink};
use crate::types::{ChannelState, Completion, ConnectionState, Event};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum TransportEvent {
    Opened,
    Frame(ProtocolMessage),
    Closed(Option<ErrorInfo>),
}

#[derive(Debug, Clone)]
pub(crate) struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub id: Option<String>,
    pub error_reason: Option<ErrorInfo>,
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelSnapshot {
    pub state: ChannelState,
    pub error_reason: Option<ErrorInfo>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Close,
    ConnectionState(oneshot::Sender<ConnectionSnapshot>),
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    ConnectionTimer {
        timer: ConnectionTimer,
        generation: u64,
    },
    ChannelTimer {
        channel: String,
        timer: ChannelTimer,
        generation: u64,
    },
    /// Input for a channel, creating it on first use.
    Channel {
        name: String,
        params: Option<HashMap<String, String>>,
        input: ChannelInput,
    },
    ChannelState {
        name: String,
        reply: oneshot::Sender<ChannelSnapshot>,
    },
    PresenceGet {
        name: String,
        reply: oneshot::Sender<Vec<PresenceMessage>>,
    },
    Subscribe(Subscriber),
}

enum Work {
    Connection(ConnectionInput),
    Channel(String, ChannelInput),
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

pub(crate) struct EventLoopState {
    pub connection: ConnectionStateMachine,
    pub channels: HashMap<String, ChannelStateMachine>,
    pub transport: Box<dyn Transport>,
    pub transport_generation: u64,
    pub command_tx: mpsc::WeakUnboundedSender<Command>,
    pub subscribers: Vec<Subscriber>,
    pub channel_retry: Arc<dyn RetryDelayCalculator>,
    pub realtime_request_timeout: Duration,
}

pub(crate) async fn run_event_loop(mut p: EventLoopState, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        p.handle_command(command);
    }
    tracing::debug!("All client handles dropped, shutting down");
    p.transport.close();
}

impl EventLoopState {
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.dispatch(Work::Connection(ConnectionInput::Connect)),
            Command::Subscribe(subscriber) => self.subscribers.push(subscriber),
            Command::Close => self.dispatch(Work::Connection(ConnectionInput::Close)),
            Command::ConnectionState(reply) => {
                let _ = reply.send(ConnectionSnapshot {
                    state: self.connection.state(),
                    id: self.connection.connection_id().map(str::to_string),
                    error_reason: self.connection.error_reason().cloned(),
                });
            }
            Command::Transport { generation, event } => {
                if generation != self.transport_generation {
                    tracing::trace!(generation, current = self.transport_generation, "Event from replaced transport");
                    return;
                }
                let input = match event {
                    TransportEvent::Opened => ConnectionInput::TransportOpened,
                    TransportEvent::Frame(msg) => ConnectionInput::Inbound(msg),
                    TransportEvent::Closed(err) => ConnectionInput::TransportClosed(err),
                };
                self.dispatch(Work::Connection(input));
            }
            Command::ConnectionTimer { timer, generation } => {
                self.dispatch(Work::Connection(ConnectionInput::Timer(timer, generation)));
            }
            Command::ChannelTimer {
                channel,
                timer,
                generation,
            } => self.dispatch(Work::Channel(channel, ChannelInput::Timer(timer, generation))),
            Command::Channel {
                name,
                params,
                input,
            } => {
                self.ensure_channel(&name, params);
                self.dispatch(Work::Channel(name, input));
            }
            Command::ChannelState { name, reply } => {
                let snapshot = match self.channels.get(&name) {
                    Some(ch) => ChannelSnapshot {
                        state: ch.state(),
                        error_reason: ch.error_reason().cloned(),
                    },
                    None => ChannelSnapshot {
                        state: ChannelState::Initialized,
                        error_reason: None,
                    },
                };
                let _ = reply.send(snapshot);
            }
            Command::PresenceGet { name, reply } => {
                let mut members: Vec<PresenceMessage> = self
                    .channels
                    .get(&name)
                    .map(|ch| {
                        ch.presence()
                            .members()
                            .values()
                            .filter(|m| m.action != PresenceAction::Absent)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                members.sort_by_key(PresenceMessage::member_key);
                let _ = reply.send(members);
            }
        }
    }

    fn ensure_channel(&mut self, name: &str, params: Option<HashMap<String, String>>) {
        if self.channels.contains_key(name) {
            return;
        }
        tracing::debug!(channel = %name, "Creating channel");
        let mut channel = ChannelStateMachine::new(
            name,
            self.realtime_request_timeout,
            self.channel_retry.clone(),
            self.connection.watch_connection_id(),
        )
        .with_connection_state(self.connection.state());
        if let Some(params) = params {
            channel = channel.with_params(params);
        }
        self.channels.insert(name.to_string(), channel);
    }

    /// Run `first` and everything it triggers to completion.
    fn dispatch(&mut self, first: Work) {
        let mut queue = VecDeque::from([first]);
        while let Some(work) = queue.pop_front() {
            match work {
                Work::Connection(input) => {
                    for effect in self.connection.handle(input) {
                        self.apply_connection_effect(effect, &mut queue);
                    }
                }
                Work::Channel(name, input) => {
                    let Some(channel) = self.channels.get_mut(&name) else {
                        tracing::debug!(channel = %name, "Input for unknown channel");
                        continue;
                    };
                    for effect in channel.handle(input) {
                        self.apply_channel_effect(&name, effect, &mut queue);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Effects
    // -----------------------------------------------------------------------

    fn apply_connection_effect(&mut self, effect: ConnectionEffect, queue: &mut VecDeque<Work>) {
        match effect {
            ConnectionEffect::OpenTransport { resume_key } => {
                self.transport_generation += 1;
                let sink = TransportSink::new(self.command_tx.clone(), self.transport_generation);
                self.transport.open(resume_key.as_deref(), sink);
            }
            ConnectionEffect::CloseTransport => {
                self.transport.close();
                self.transport_generation += 1;
            }
            ConnectionEffect::SendFrame(msg) => {
                let action = msg.action;
                if let Err(e) = self.transport.send(msg) {
                    tracing::warn!(?action, "Transport send failed: {e}");
                    let err = ErrorInfo::new(error_code::DISCONNECTED, None, e.to_string());
                    queue.push_back(Work::Connection(ConnectionInput::TransportClosed(Some(err))));
                }
            }
            ConnectionEffect::ScheduleTimer {
                timer,
                delay,
                generation,
            } => self.spawn_timer(delay, Command::ConnectionTimer { timer, generation }),
            ConnectionEffect::Emit(change) => self.publish(Event::ConnectionStateChange(change)),
            ConnectionEffect::NotifyChannels { change, resumed } => {
                let mut names: Vec<&String> = self.channels.keys().collect();
                names.sort();
                for name in names {
                    queue.push_back(Work::Channel(
                        name.clone(),
                        ChannelInput::ConnectionStateChanged {
                            current: change.current,
                            reason: change.reason.clone(),
                            resumed,
                        },
                    ));
                }
            }
            ConnectionEffect::RouteToChannel(msg) => {
                let Some(name) = msg.channel.clone() else {
                    return;
                };
                if !self.channels.contains_key(&name) {
                    tracing::debug!(channel = %name, action = ?msg.action, "Frame for unknown channel");
                    return;
                }
                queue.push_back(Work::Channel(name, ChannelInput::Inbound(msg)));
            }
            ConnectionEffect::Complete { completion, result } => completion.complete(result),
        }
    }

    fn apply_channel_effect(&mut self, name: &str, effect: ChannelEffect, queue: &mut VecDeque<Work>) {
        match effect {
            ChannelEffect::Send {
                message,
                completion,
            } => queue.push_back(Work::Connection(ConnectionInput::Send {
                message,
                completion: completion.unwrap_or_else(Completion::noop),
            })),
            ChannelEffect::ScheduleTimer {
                timer,
                delay,
                generation,
            } => self.spawn_timer(
                delay,
                Command::ChannelTimer {
                    channel: name.to_string(),
                    timer,
                    generation,
                },
            ),
            ChannelEffect::Emit(event) => {
                let channel = name.to_string();
                self.publish(match event {
                    ChannelEvent::StateChange(change) => Event::ChannelStateChange { channel, change },
                    ChannelEvent::Message(message) => Event::Message { channel, message },
                    ChannelEvent::Presence(message) => Event::Presence { channel, message },
                });
            }
            ChannelEffect::Complete { completion, result } => completion.complete(result),
            ChannelEffect::RequestConnect => queue.push_back(Work::Connection(ConnectionInput::Connect)),
        }
    }

    fn publish(&mut self, event: Event) {
        self.subscribers.retain(|subscriber| subscriber.deliver(&event));
    }

    fn spawn_timer(&self, delay: Duration, command: Command) {
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(command);
            }
        });
    }
}
