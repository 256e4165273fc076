//! Public handles: [`Realtime`], [`Channel`] and [`Presence`].
//!
//! Every handle is a thin sender onto the event loop. Operations that settle
//! later (attach, publish, presence) return once the engine resolves them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::backoff::{
    BackoffRetryDelayCalculator, DefaultJitterCoefficientGenerator, JitterCoefficientGenerator,
};
use crate::channel::ChannelInput;
use crate::clock::{Clock, TokioClock};
use crate::connection::ConnectionStateMachine;
use crate::event_loop::{ChannelSnapshot, Command, ConnectionSnapshot, EventLoopState, run_event_loop};
use crate::protocol::{ErrorInfo, Message, PresenceAction, PresenceMessage, error_code};
use crate::retry::RetryDelayCalculator;
use crate::subscribe::{self, Filter, Subscription};
use crate::transport::Transport;
use crate::types::{ChannelState, ClientOptions, Completion, ConnectionState, Error};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures the injectable capabilities of a [`Realtime`] client.
pub struct RealtimeBuilder {
    options: ClientOptions,
    transport: Box<dyn Transport>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn JitterCoefficientGenerator>,
    connection_retry: Option<Arc<dyn RetryDelayCalculator>>,
    channel_retry: Option<Arc<dyn RetryDelayCalculator>>,
}

impl RealtimeBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Jitter used by the default backoff calculators.
    pub fn jitter(mut self, jitter: Arc<dyn JitterCoefficientGenerator>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn connection_retry_calculator(mut self, calculator: Arc<dyn RetryDelayCalculator>) -> Self {
        self.connection_retry = Some(calculator);
        self
    }

    pub fn channel_retry_calculator(mut self, calculator: Arc<dyn RetryDelayCalculator>) -> Self {
        self.channel_retry = Some(calculator);
        self
    }

    /// Spawn the event loop. Must be called from within a tokio runtime.
    pub fn build(self) -> Realtime {
        let Self {
            options,
            transport,
            clock,
            jitter,
            connection_retry,
            channel_retry,
        } = self;

        let connection_retry = connection_retry.unwrap_or_else(|| {
            Arc::new(BackoffRetryDelayCalculator::new(
                options.disconnected_retry_timeout,
                jitter.clone(),
            ))
        });
        let channel_retry = channel_retry.unwrap_or_else(|| {
            Arc::new(BackoffRetryDelayCalculator::new(
                options.channel_retry_timeout,
                jitter,
            ))
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let state = EventLoopState {
            connection: ConnectionStateMachine::new(&options, connection_retry, clock),
            channels: HashMap::new(),
            transport,
            transport_generation: 0,
            command_tx: command_tx.downgrade(),
            subscribers: Vec::new(),
            channel_retry,
            realtime_request_timeout: options.realtime_request_timeout,
        };
        tokio::spawn(run_event_loop(state, command_rx));

        Realtime {
            commands: command_tx,
            client_id: options.client_id.map(Arc::from),
        }
    }
}

// ---------------------------------------------------------------------------
// Realtime
// ---------------------------------------------------------------------------

/// Handle to a realtime client. Cheap to clone; the client shuts down once
/// every handle (including channel and presence handles) is dropped.
#[derive(Clone)]
pub struct Realtime {
    commands: mpsc::UnboundedSender<Command>,
    client_id: Option<Arc<str>>,
}

impl Realtime {
    pub fn new(options: ClientOptions, transport: impl Transport + 'static) -> Self {
        Self::builder(options, transport).build()
    }

    pub fn builder(options: ClientOptions, transport: impl Transport + 'static) -> RealtimeBuilder {
        RealtimeBuilder {
            options,
            transport: Box::new(transport),
            clock: Arc::new(TokioClock),
            jitter: Arc::new(DefaultJitterCoefficientGenerator),
            connection_retry: None,
            channel_retry: None,
        }
    }

    pub fn connect(&self) {
        self.post(Command::Connect);
    }

    pub fn close(&self) {
        self.post(Command::Close);
    }

    pub async fn state(&self) -> Result<ConnectionState, Error> {
        Ok(self.snapshot().await?.state)
    }

    pub async fn connection_id(&self) -> Result<Option<String>, Error> {
        Ok(self.snapshot().await?.id)
    }

    pub async fn error_reason(&self) -> Result<Option<ErrorInfo>, Error> {
        Ok(self.snapshot().await?.error_reason)
    }

    /// Every event the client emits.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with(Filter::All)
    }

    pub fn channel(&self, name: impl Into<String>) -> Channel {
        Channel {
            name: name.into(),
            params: None,
            client: self.clone(),
        }
    }

    /// Channel whose ATTACH carries `params`. Params apply when the channel is
    /// first used.
    pub fn channel_with_params(
        &self,
        name: impl Into<String>,
        params: HashMap<String, String>,
    ) -> Channel {
        Channel {
            name: name.into(),
            params: Some(params),
            client: self.clone(),
        }
    }

    fn subscribe_with(&self, filter: Filter) -> Subscription {
        let (subscriber, subscription) = subscribe::subscription(filter);
        self.post(Command::Subscribe(subscriber));
        subscription
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Event loop has exited");
        }
    }

    async fn snapshot(&self) -> Result<ConnectionSnapshot, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ConnectionState(tx))
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Channel {
    name: String,
    params: Option<HashMap<String, String>>,
    client: Realtime,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn attach(&self) -> Result<(), Error> {
        self.request(ChannelInput::Attach).await
    }

    pub async fn detach(&self) -> Result<(), Error> {
        self.request(ChannelInput::Detach).await
    }

    /// Publish a single message. Resolves when the server acknowledges it.
    pub async fn publish(&self, name: impl Into<String>, data: serde_json::Value) -> Result<(), Error> {
        self.publish_messages(vec![Message {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }])
        .await
    }

    pub async fn publish_messages(&self, messages: Vec<Message>) -> Result<(), Error> {
        self.request(|completion| ChannelInput::Publish {
            messages,
            completion,
        })
        .await
    }

    pub async fn state(&self) -> Result<ChannelState, Error> {
        Ok(self.snapshot().await?.state)
    }

    pub async fn error_reason(&self) -> Result<Option<ErrorInfo>, Error> {
        Ok(self.snapshot().await?.error_reason)
    }

    /// State changes and messages for this channel.
    pub fn subscribe(&self) -> Subscription {
        self.client.subscribe_with(Filter::Channel(self.name.clone()))
    }

    pub fn presence(&self) -> Presence {
        Presence {
            channel: self.clone(),
        }
    }

    async fn request(&self, input: impl FnOnce(Completion) -> ChannelInput) -> Result<(), Error> {
        let (completion, rx) = Completion::channel();
        self.client
            .commands
            .send(Command::Channel {
                name: self.name.clone(),
                params: self.params.clone(),
                input: input(completion),
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?.map_err(Error::from)
    }

    async fn snapshot(&self) -> Result<ChannelSnapshot, Error> {
        let (tx, rx) = oneshot::channel();
        self.client
            .commands
            .send(Command::ChannelState {
                name: self.name.clone(),
                reply: tx,
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Presence {
    channel: Channel,
}

impl Presence {
    /// Enter as the client's own `client_id`. Attaches the channel if needed.
    pub async fn enter(&self, data: Option<serde_json::Value>) -> Result<(), Error> {
        let client_id = self.own_client_id()?;
        self.enter_client(client_id, data).await
    }

    pub async fn update(&self, data: Option<serde_json::Value>) -> Result<(), Error> {
        let client_id = self.own_client_id()?;
        self.update_client(client_id, data).await
    }

    pub async fn leave(&self, data: Option<serde_json::Value>) -> Result<(), Error> {
        let client_id = self.own_client_id()?;
        self.leave_client(client_id, data).await
    }

    pub async fn enter_client(
        &self,
        client_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        self.send(PresenceAction::Enter, client_id.into(), data).await
    }

    pub async fn update_client(
        &self,
        client_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        self.send(PresenceAction::Update, client_id.into(), data).await
    }

    pub async fn leave_client(
        &self,
        client_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        self.send(PresenceAction::Leave, client_id.into(), data).await
    }

    /// Current members, ordered by member key.
    pub async fn get(&self) -> Result<Vec<PresenceMessage>, Error> {
        let (tx, rx) = oneshot::channel();
        self.channel
            .client
            .commands
            .send(Command::PresenceGet {
                name: self.channel.name.clone(),
                reply: tx,
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Presence events that changed this channel's member map.
    pub fn subscribe(&self) -> Subscription {
        self.channel
            .client
            .subscribe_with(Filter::Presence(self.channel.name.clone()))
    }

    fn own_client_id(&self) -> Result<String, Error> {
        match &self.channel.client.client_id {
            Some(id) => Ok(id.to_string()),
            None => Err(Error::Ably(ErrorInfo::new(
                error_code::PRESENCE_NO_CLIENT_ID,
                Some(400),
                "Presence requires a client_id in ClientOptions",
            ))),
        }
    }

    async fn send(
        &self,
        action: PresenceAction,
        client_id: String,
        data: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        let message = PresenceMessage {
            action,
            client_id: Some(client_id),
            data,
            ..Default::default()
        };
        self.channel
            .request(|completion| ChannelInput::Presence {
                message,
                completion,
            })
            .await
    }
}
