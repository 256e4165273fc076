//! Connection lifecycle state machine.
//!
//! Like the channel machine, [`ConnectionStateMachine::handle`] never blocks:
//! it updates state and returns the transport operations, timers and events
//! the event loop should apply.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::protocol::{Action, ErrorInfo, ProtocolMessage, error_code, error_or_unknown};
use crate::retry::{ConnectionRetryState, RetryDelayCalculator};
use crate::types::{ClientOptions, Completion, ConnectionState, ConnectionStateChange};

// ---------------------------------------------------------------------------
// Inputs and effects
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConnectionInput {
    Connect,
    Close,
    TransportOpened,
    TransportClosed(Option<ErrorInfo>),
    Inbound(ProtocolMessage),
    Timer(ConnectionTimer, u64),
    Send {
        message: ProtocolMessage,
        completion: Completion,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTimer {
    ConnectTimeout,
    Retry,
    /// Fires `connection_state_ttl` after the connection was first lost.
    Suspend,
    Idle,
    CloseTimeout,
}

#[derive(Debug)]
pub enum ConnectionEffect {
    OpenTransport {
        resume_key: Option<String>,
    },
    CloseTransport,
    SendFrame(ProtocolMessage),
    ScheduleTimer {
        timer: ConnectionTimer,
        delay: Duration,
        generation: u64,
    },
    Emit(ConnectionStateChange),
    NotifyChannels {
        change: ConnectionStateChange,
        resumed: bool,
    },
    RouteToChannel(ProtocolMessage),
    Complete {
        completion: Completion,
        result: Result<(), ErrorInfo>,
    },
}

type Effects = Vec<ConnectionEffect>;

#[derive(Debug)]
struct PendingMessage {
    serial: i64,
    message: ProtocolMessage,
    completion: Completion,
}

/// Returns true if the error is transient and the connection should retry.
/// Non-retriable: 4xx status codes outside the connection-error code list.
fn is_retriable(err: &ErrorInfo) -> bool {
    const CONNECTION_ERROR_CODES: &[i32] = &[
        error_code::DISCONNECTED,
        error_code::SUSPENDED,
        error_code::FAILED,
        error_code::CONNECTION_CLOSED,
        50002, // UNKNOWN_CONNECTION_ERR
        50001, // UNKNOWN_CHANNEL_ERR
    ];
    match err.status_code {
        None => true,
        Some(sc) if sc >= 500 => true,
        Some(_) => CONNECTION_ERROR_CODES.contains(&err.code),
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub struct ConnectionStateMachine {
    state: ConnectionState,
    error_reason: Option<ErrorInfo>,
    generation: u64,
    retry: ConnectionRetryState,
    clock: Arc<dyn Clock>,

    queue_messages: bool,
    realtime_request_timeout: Duration,
    suspended_retry_timeout: Duration,
    connection_state_ttl: Duration,
    max_idle_interval: Duration,

    connection_id: Option<String>,
    connection_id_tx: watch::Sender<Option<String>>,
    connection_key: Option<String>,
    has_connected: bool,

    /// When the current outage started; cleared on CONNECTED.
    connection_lost_at: Option<Instant>,
    /// Generation for the `Suspend` timer, which outlives individual
    /// transitions.
    lost_generation: u64,
    last_activity: Instant,

    msg_serial: i64,
    pending: VecDeque<PendingMessage>,
    queued: VecDeque<(ProtocolMessage, Completion)>,
    close_requested: bool,
}

impl ConnectionStateMachine {
    pub fn new(
        options: &ClientOptions,
        retry_calculator: Arc<dyn RetryDelayCalculator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (connection_id_tx, _) = watch::channel(None);
        let last_activity = clock.now();
        Self {
            state: ConnectionState::Initialized,
            error_reason: None,
            generation: 0,
            retry: ConnectionRetryState::new(retry_calculator),
            clock,
            queue_messages: options.queue_messages,
            realtime_request_timeout: options.realtime_request_timeout,
            suspended_retry_timeout: options.suspended_retry_timeout,
            connection_state_ttl: options.connection_state_ttl,
            max_idle_interval: options.max_idle_interval,
            connection_id: None,
            connection_id_tx,
            connection_key: None,
            has_connected: false,
            connection_lost_at: None,
            lost_generation: 0,
            last_activity,
            msg_serial: 0,
            pending: VecDeque::new(),
            queued: VecDeque::new(),
            close_requested: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Live view of the connection id, shared with every channel's presence
    /// map.
    pub fn watch_connection_id(&self) -> watch::Receiver<Option<String>> {
        self.connection_id_tx.subscribe()
    }

    pub fn handle(&mut self, input: ConnectionInput) -> Effects {
        let mut fx = Vec::new();
        match input {
            ConnectionInput::Connect => self.connect(&mut fx),
            ConnectionInput::Close => self.close(&mut fx),
            ConnectionInput::TransportOpened => {
                tracing::debug!(state = %self.state, "Transport opened, awaiting CONNECTED");
            }
            ConnectionInput::TransportClosed(err) => self.on_transport_closed(err, &mut fx),
            ConnectionInput::Inbound(msg) => self.on_inbound(msg, &mut fx),
            ConnectionInput::Timer(timer, generation) => self.on_timer(timer, generation, &mut fx),
            ConnectionInput::Send {
                message,
                completion,
            } => self.send(message, completion, &mut fx),
        }
        fx
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    fn connect(&mut self, fx: &mut Effects) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                tracing::debug!(state = %self.state, "Connect ignored");
            }
            ConnectionState::Closing => {
                self.close_requested = false;
                fx.push(ConnectionEffect::CloseTransport);
                self.start_connecting(fx);
            }
            _ => self.start_connecting(fx),
        }
    }

    fn close(&mut self, fx: &mut Effects) {
        match self.state {
            ConnectionState::Connected => {
                self.transition(ConnectionState::Closing, None, None, false, fx);
                fx.push(ConnectionEffect::SendFrame(ProtocolMessage::new(Action::Close)));
                fx.push(ConnectionEffect::ScheduleTimer {
                    timer: ConnectionTimer::CloseTimeout,
                    delay: self.realtime_request_timeout,
                    generation: self.generation,
                });
            }
            ConnectionState::Disconnected | ConnectionState::Suspended => {
                self.transition(ConnectionState::Closed, None, None, false, fx);
            }
            ConnectionState::Connecting => {
                tracing::debug!("Close deferred until the connection attempt settles");
                self.close_requested = true;
            }
            _ => {}
        }
    }

    fn send(&mut self, message: ProtocolMessage, completion: Completion, fx: &mut Effects) {
        match self.state {
            ConnectionState::Connected => self.send_now(message, completion, fx),
            ConnectionState::Initialized
            | ConnectionState::Connecting
            | ConnectionState::Disconnected
                if self.queue_messages =>
            {
                self.queued.push_back((message, completion));
            }
            _ => fx.push(ConnectionEffect::Complete {
                completion,
                result: Err(self.state_error()),
            }),
        }
    }

    fn send_now(&mut self, mut message: ProtocolMessage, completion: Completion, fx: &mut Effects) {
        if !message.action.ack_required() {
            fx.push(ConnectionEffect::SendFrame(message));
            fx.push(ConnectionEffect::Complete {
                completion,
                result: Ok(()),
            });
            return;
        }
        let serial = self.msg_serial;
        self.msg_serial += 1;
        message.msg_serial = Some(serial);
        fx.push(ConnectionEffect::SendFrame(message.clone()));
        self.pending.push_back(PendingMessage {
            serial,
            message,
            completion,
        });
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    fn on_inbound(&mut self, msg: ProtocolMessage, fx: &mut Effects) {
        self.last_activity = self.clock.now();
        match msg.action {
            Action::Heartbeat => tracing::trace!("Heartbeat"),
            Action::Connected => self.on_connected(msg, fx),
            Action::Disconnected => {
                let err = msg.error.unwrap_or_else(disconnected_error);
                if is_retriable(&err) {
                    tracing::info!(code = err.code, "Server requested disconnect: {}", err.message);
                    self.lost(err, fx);
                } else {
                    tracing::error!(code = err.code, "Non-retriable disconnect: {}", err.message);
                    self.fail(err, fx);
                }
            }
            Action::Error if msg.channel.is_some() => fx.push(ConnectionEffect::RouteToChannel(msg)),
            Action::Error => {
                let err = error_or_unknown(msg.error);
                tracing::error!(code = err.code, "Connection error: {}", err.message);
                self.fail(err, fx);
            }
            Action::Closed => {
                fx.push(ConnectionEffect::CloseTransport);
                self.close_requested = false;
                self.transition(ConnectionState::Closed, None, None, false, fx);
            }
            Action::Ack => self.on_ack(msg.msg_serial, msg.count, Ok(()), fx),
            Action::Nack => {
                let err = error_or_unknown(msg.error);
                tracing::warn!(serial = ?msg.msg_serial, code = err.code, "NACK: {}", err.message);
                self.on_ack(msg.msg_serial, msg.count, Err(err), fx);
            }
            _ if msg.channel.is_some() => fx.push(ConnectionEffect::RouteToChannel(msg)),
            other => tracing::debug!(action = ?other, "Ignoring connection frame"),
        }
    }

    fn on_connected(&mut self, msg: ProtocolMessage, fx: &mut Effects) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            tracing::debug!(state = %self.state, "Ignoring CONNECTED");
            return;
        }

        let resumed = msg.error.is_none()
            && match &self.connection_id {
                Some(previous) => msg.connection_id.as_ref() == Some(previous),
                None => !self.has_connected,
            };
        self.has_connected = true;

        if let Some(key) = &msg.connection_key {
            self.connection_key = Some(key.clone());
        }
        if let Some(details) = &msg.connection_details {
            if let Some(key) = &details.connection_key {
                self.connection_key = Some(key.clone());
            }
            if let Some(ttl) = details.connection_state_ttl {
                self.connection_state_ttl = millis(ttl);
            }
            if let Some(idle) = details.max_idle_interval {
                self.max_idle_interval = millis(idle);
            }
        }
        self.set_connection_id(msg.connection_id.clone());
        self.connection_lost_at = None;
        self.lost_generation += 1;

        tracing::info!(
            connection_id = ?self.connection_id,
            resumed,
            ttl_ms = self.connection_state_ttl.as_millis() as u64,
            "Connected",
        );

        if self.state == ConnectionState::Connected {
            self.error_reason = msg.error.clone();
            fx.push(ConnectionEffect::Emit(ConnectionStateChange {
                previous: ConnectionState::Connected,
                current: ConnectionState::Connected,
                reason: msg.error,
                retry_in: None,
            }));
        } else {
            self.transition(ConnectionState::Connected, msg.error, None, resumed, fx);
        }

        if !resumed {
            self.msg_serial = 0;
            for pending in &mut self.pending {
                pending.serial = self.msg_serial;
                pending.message.msg_serial = Some(self.msg_serial);
                self.msg_serial += 1;
            }
        }
        for pending in &self.pending {
            fx.push(ConnectionEffect::SendFrame(pending.message.clone()));
        }
        while let Some((message, completion)) = self.queued.pop_front() {
            self.send_now(message, completion, fx);
        }

        self.arm_idle_timer(self.idle_timeout(), fx);

        if std::mem::take(&mut self.close_requested) {
            self.close(fx);
        }
    }

    fn on_ack(
        &mut self,
        serial: Option<i64>,
        count: Option<i64>,
        result: Result<(), ErrorInfo>,
        fx: &mut Effects,
    ) {
        let Some(serial) = serial else {
            tracing::warn!("ACK/NACK without msgSerial");
            return;
        };
        let end = serial.saturating_add(count.unwrap_or(1));
        let mut resolved = 0usize;
        while self.pending.front().is_some_and(|p| p.serial < end) {
            let Some(pending) = self.pending.pop_front() else {
                break;
            };
            let result = if pending.serial < serial {
                Err(ErrorInfo::new(
                    error_code::FAILED,
                    None,
                    format!("Message {} was not acknowledged", pending.serial),
                ))
            } else {
                result.clone()
            };
            fx.push(ConnectionEffect::Complete {
                completion: pending.completion,
                result,
            });
            resolved += 1;
        }
        if resolved == 0 {
            tracing::warn!(serial, ?count, "Stale ACK/NACK for unknown serial");
        }
    }

    fn on_transport_closed(&mut self, err: Option<ErrorInfo>, fx: &mut Effects) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                let err = err.unwrap_or_else(disconnected_error);
                tracing::warn!(code = err.code, "Transport closed: {}", err.message);
                self.lost(err, fx);
            }
            ConnectionState::Closing => {
                self.transition(ConnectionState::Closed, None, None, false, fx);
            }
            state => tracing::debug!(%state, "Transport closed"),
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn on_timer(&mut self, timer: ConnectionTimer, generation: u64, fx: &mut Effects) {
        let current = match timer {
            ConnectionTimer::Suspend => self.lost_generation,
            _ => self.generation,
        };
        if generation != current {
            tracing::trace!(?timer, "Stale connection timer");
            return;
        }
        match (timer, self.state) {
            (ConnectionTimer::ConnectTimeout, ConnectionState::Connecting) => {
                tracing::warn!("Connection attempt timed out");
                let err = ErrorInfo::new(error_code::TIMEOUT, None, "Connection attempt timed out");
                self.lost(err, fx);
            }
            (ConnectionTimer::Retry, ConnectionState::Disconnected | ConnectionState::Suspended) => {
                self.start_connecting(fx);
            }
            (ConnectionTimer::Suspend, ConnectionState::Disconnected | ConnectionState::Connecting)
                if self.connection_lost_at.is_some() =>
            {
                tracing::warn!(
                    ttl_ms = self.connection_state_ttl.as_millis() as u64,
                    "Connection state TTL expired",
                );
                if self.state == ConnectionState::Connecting {
                    fx.push(ConnectionEffect::CloseTransport);
                }
                self.enter_suspended(fx);
            }
            (ConnectionTimer::Idle, ConnectionState::Connected) => {
                let now = self.clock.now();
                let deadline = self.last_activity + self.idle_timeout();
                if self.clock.is_after(deadline, now) {
                    self.arm_idle_timer(deadline - now, fx);
                } else {
                    tracing::warn!("Heartbeat timeout");
                    let err = ErrorInfo::new(
                        error_code::TIMEOUT,
                        None,
                        format!(
                            "No activity seen from realtime in {}ms",
                            self.idle_timeout().as_millis()
                        ),
                    );
                    self.lost(err, fx);
                }
            }
            (ConnectionTimer::CloseTimeout, ConnectionState::Closing) => {
                tracing::warn!("CLOSED not received, closing transport");
                fx.push(ConnectionEffect::CloseTransport);
                self.transition(ConnectionState::Closed, None, None, false, fx);
            }
            _ => {}
        }
    }

    fn idle_timeout(&self) -> Duration {
        self.max_idle_interval + self.realtime_request_timeout
    }

    fn arm_idle_timer(&self, delay: Duration, fx: &mut Effects) {
        if self.max_idle_interval.is_zero() {
            return;
        }
        fx.push(ConnectionEffect::ScheduleTimer {
            timer: ConnectionTimer::Idle,
            delay,
            generation: self.generation,
        });
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn start_connecting(&mut self, fx: &mut Effects) {
        let resume_key = match self.state {
            ConnectionState::Disconnected => self.connection_key.clone(),
            _ => None,
        };
        self.transition(ConnectionState::Connecting, None, None, false, fx);
        tracing::info!(resume = resume_key.is_some(), "Connecting");
        fx.push(ConnectionEffect::OpenTransport { resume_key });
        fx.push(ConnectionEffect::ScheduleTimer {
            timer: ConnectionTimer::ConnectTimeout,
            delay: self.realtime_request_timeout,
            generation: self.generation,
        });
    }

    /// Transport went away unexpectedly (or the server told us to go).
    fn lost(&mut self, reason: ErrorInfo, fx: &mut Effects) {
        fx.push(ConnectionEffect::CloseTransport);

        if self.state == ConnectionState::Closing || std::mem::take(&mut self.close_requested) {
            self.transition(ConnectionState::Closed, None, None, false, fx);
            return;
        }

        let now = self.clock.now();
        let lost_at = match self.connection_lost_at {
            Some(at) => at,
            None => {
                self.connection_lost_at = Some(now);
                self.lost_generation += 1;
                fx.push(ConnectionEffect::ScheduleTimer {
                    timer: ConnectionTimer::Suspend,
                    delay: self.connection_state_ttl,
                    generation: self.lost_generation,
                });
                now
            }
        };

        if self.clock.is_after(now, lost_at + self.connection_state_ttl) {
            self.enter_suspended(fx);
        } else {
            let attempt = self.retry.add_retry_attempt();
            tracing::info!(
                attempt = attempt.attempt_number,
                delay_ms = attempt.delay.as_millis() as u64,
                "Scheduling reconnect",
            );
            self.transition(
                ConnectionState::Disconnected,
                Some(reason),
                Some(attempt.delay),
                false,
                fx,
            );
            fx.push(ConnectionEffect::ScheduleTimer {
                timer: ConnectionTimer::Retry,
                delay: attempt.delay,
                generation: self.generation,
            });
        }
    }

    fn enter_suspended(&mut self, fx: &mut Effects) {
        let reason = ErrorInfo::new(
            error_code::SUSPENDED,
            Some(503),
            "Connection to server unavailable",
        );
        self.transition(
            ConnectionState::Suspended,
            Some(reason),
            Some(self.suspended_retry_timeout),
            false,
            fx,
        );
        fx.push(ConnectionEffect::ScheduleTimer {
            timer: ConnectionTimer::Retry,
            delay: self.suspended_retry_timeout,
            generation: self.generation,
        });
    }

    fn fail(&mut self, reason: ErrorInfo, fx: &mut Effects) {
        fx.push(ConnectionEffect::CloseTransport);
        self.close_requested = false;
        self.transition(ConnectionState::Failed, Some(reason), None, false, fx);
    }

    fn transition(
        &mut self,
        to: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
        resumed: bool,
        fx: &mut Effects,
    ) {
        let previous = self.state;
        self.retry.connection_will_transition(to);
        self.state = to;
        self.generation += 1;
        self.error_reason = reason.clone();
        tracing::info!(from = %previous, to = %to, reason = ?reason, "Connection state change");

        let change = ConnectionStateChange {
            previous,
            current: to,
            reason: reason.clone(),
            retry_in,
        };
        fx.push(ConnectionEffect::Emit(change.clone()));
        fx.push(ConnectionEffect::NotifyChannels { change, resumed });

        match to {
            ConnectionState::Suspended => {
                // The server discards connection state after the TTL.
                self.connection_key = None;
                self.set_connection_id(None);
                let err = self.state_error();
                self.fail_outstanding(&err, fx);
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                let err = self.state_error();
                self.fail_outstanding(&err, fx);
                self.connection_key = None;
                self.set_connection_id(None);
                self.connection_lost_at = None;
                self.lost_generation += 1;
                self.msg_serial = 0;
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn set_connection_id(&mut self, id: Option<String>) {
        self.connection_id.clone_from(&id);
        self.connection_id_tx.send_replace(id);
    }

    fn fail_outstanding(&mut self, err: &ErrorInfo, fx: &mut Effects) {
        for pending in self.pending.drain(..) {
            fx.push(ConnectionEffect::Complete {
                completion: pending.completion,
                result: Err(err.clone()),
            });
        }
        for (_, completion) in self.queued.drain(..) {
            fx.push(ConnectionEffect::Complete {
                completion,
                result: Err(err.clone()),
            });
        }
    }

    /// Error reported to operations the current state cannot accept.
    fn state_error(&self) -> ErrorInfo {
        if let Some(reason) = &self.error_reason {
            return reason.clone();
        }
        let (code, message) = match self.state {
            ConnectionState::Closing | ConnectionState::Closed => {
                (error_code::CONNECTION_CLOSED, "Connection closed")
            }
            ConnectionState::Suspended => (error_code::SUSPENDED, "Connection suspended"),
            ConnectionState::Failed => (error_code::FAILED, "Connection failed"),
            _ => (error_code::DISCONNECTED, "Connection not established"),
        };
        ErrorInfo::new(code, Some(400), message)
    }
}

fn disconnected_error() -> ErrorInfo {
    ErrorInfo::new(error_code::DISCONNECTED, None, "Connection to server lost")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
