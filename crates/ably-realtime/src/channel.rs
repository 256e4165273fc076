//! Per-channel attach/detach state machine.
//!
//! [`ChannelStateMachine::handle`] is a pure transition function: it mutates
//! the channel and returns the effects (frames to send, timers to arm, events
//! to emit, completions to resolve) for the event loop to carry out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::presence::{PresenceMap, synthetic_leave};
use crate::protocol::{
    Action, ErrorInfo, Message, PresenceAction, PresenceMessage, ProtocolMessage,
    build_attach_msg, build_detach_msg, error_code, error_or_unknown, flags,
};
use crate::retry::{ChannelAttachRetryState, RetryDelayCalculator};
use crate::types::{ChannelState, ChannelStateChange, Completion, ConnectionState};

// ---------------------------------------------------------------------------
// Inputs and effects
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ChannelInput {
    Attach(Completion),
    Detach(Completion),
    Inbound(ProtocolMessage),
    ConnectionStateChanged {
        current: ConnectionState,
        reason: Option<ErrorInfo>,
        resumed: bool,
    },
    Timer(ChannelTimer, u64),
    Publish {
        messages: Vec<Message>,
        completion: Completion,
    },
    Presence {
        message: PresenceMessage,
        completion: Completion,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTimer {
    AttachTimeout,
    DetachTimeout,
    Reattach,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChange(ChannelStateChange),
    Message(Message),
    Presence(PresenceMessage),
}

#[derive(Debug)]
pub enum ChannelEffect {
    /// Hand a frame to the connection. Frames with a completion are resolved
    /// when the server acknowledges them.
    Send {
        message: ProtocolMessage,
        completion: Option<Completion>,
    },
    ScheduleTimer {
        timer: ChannelTimer,
        delay: Duration,
        generation: u64,
    },
    Emit(ChannelEvent),
    Complete {
        completion: Completion,
        result: Result<(), ErrorInfo>,
    },
    /// Attach was requested while the connection has never been opened.
    RequestConnect,
}

type Effects = Vec<ChannelEffect>;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub struct ChannelStateMachine {
    name: String,
    params: Option<HashMap<String, String>>,
    state: ChannelState,
    error_reason: Option<ErrorInfo>,
    /// Bumped on every transition and every ATTACH/DETACH sent; timers from
    /// an older generation are ignored.
    generation: u64,
    connection_state: ConnectionState,
    connection_reason: Option<ErrorInfo>,
    realtime_request_timeout: Duration,
    retry: ChannelAttachRetryState,
    presence: PresenceMap,
    channel_serial: Option<String>,
    attach_completions: Vec<Completion>,
    detach_completions: Vec<Completion>,
    detach_after_attach: bool,
    pending_presence: Vec<(PresenceMessage, Completion)>,
}

impl ChannelStateMachine {
    pub fn new(
        name: impl Into<String>,
        realtime_request_timeout: Duration,
        retry_calculator: Arc<dyn RetryDelayCalculator>,
        connection_id: watch::Receiver<Option<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            params: None,
            state: ChannelState::Initialized,
            error_reason: None,
            generation: 0,
            connection_state: ConnectionState::Initialized,
            connection_reason: None,
            realtime_request_timeout,
            retry: ChannelAttachRetryState::new(retry_calculator),
            presence: PresenceMap::new(connection_id),
            channel_serial: None,
            attach_completions: Vec::new(),
            detach_completions: Vec::new(),
            detach_after_attach: false,
            pending_presence: Vec::new(),
        }
    }

    /// Channel params sent with every ATTACH (e.g. `{"rewind": "2m"}`).
    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = Some(params);
        self
    }

    /// Seed the connection state for a channel created after the client
    /// connected.
    pub fn with_connection_state(mut self, state: ConnectionState) -> Self {
        self.connection_state = state;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    pub fn presence(&self) -> &PresenceMap {
        &self.presence
    }

    pub fn handle(&mut self, input: ChannelInput) -> Effects {
        let mut fx = Vec::new();
        match input {
            ChannelInput::Attach(completion) => self.attach(completion, &mut fx),
            ChannelInput::Detach(completion) => self.detach(completion, &mut fx),
            ChannelInput::Inbound(msg) => self.on_inbound(msg, &mut fx),
            ChannelInput::ConnectionStateChanged {
                current,
                reason,
                resumed,
            } => self.on_connection_state(current, reason, resumed, &mut fx),
            ChannelInput::Timer(timer, generation) => self.on_timer(timer, generation, &mut fx),
            ChannelInput::Publish {
                messages,
                completion,
            } => self.publish(messages, completion, &mut fx),
            ChannelInput::Presence {
                message,
                completion,
            } => self.update_presence(message, completion, &mut fx),
        }
        fx
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    fn attach(&mut self, completion: Completion, fx: &mut Effects) {
        match self.state {
            ChannelState::Attached => fx.push(ChannelEffect::Complete {
                completion,
                result: Ok(()),
            }),
            ChannelState::Attaching => {
                self.attach_completions.push(completion);
                if std::mem::take(&mut self.detach_after_attach) {
                    let err = superseded("detach", "attach");
                    complete_all(&mut self.detach_completions, Err(err), fx);
                }
            }
            _ if matches!(
                self.connection_state,
                ConnectionState::Closing
                    | ConnectionState::Closed
                    | ConnectionState::Suspended
                    | ConnectionState::Failed
            ) =>
            {
                fx.push(ChannelEffect::Complete {
                    completion,
                    result: Err(self.connection_error()),
                });
            }
            _ => {
                if self.state == ChannelState::Detaching {
                    let err = superseded("detach", "attach");
                    complete_all(&mut self.detach_completions, Err(err), fx);
                }
                self.attach_completions.push(completion);
                self.start_attaching(None, fx);
            }
        }
    }

    fn detach(&mut self, completion: Completion, fx: &mut Effects) {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached => {
                fx.push(ChannelEffect::Complete {
                    completion,
                    result: Ok(()),
                });
            }
            ChannelState::Detaching => self.detach_completions.push(completion),
            ChannelState::Failed => fx.push(ChannelEffect::Complete {
                completion,
                result: Err(self.invalid_state("detach")),
            }),
            ChannelState::Suspended => {
                self.detach_completions.push(completion);
                self.transition(ChannelState::Detached, None, false, fx);
            }
            ChannelState::Attaching => {
                self.detach_completions.push(completion);
                self.detach_after_attach = true;
            }
            ChannelState::Attached => {
                self.detach_completions.push(completion);
                self.start_detaching(fx);
            }
        }
    }

    fn publish(&mut self, messages: Vec<Message>, completion: Completion, fx: &mut Effects) {
        if matches!(self.state, ChannelState::Suspended | ChannelState::Failed) {
            fx.push(ChannelEffect::Complete {
                completion,
                result: Err(self.invalid_state("publish to")),
            });
            return;
        }
        let message = ProtocolMessage {
            action: Action::Message,
            channel: Some(self.name.clone()),
            messages: Some(messages),
            ..Default::default()
        };
        fx.push(ChannelEffect::Send {
            message,
            completion: Some(completion),
        });
    }

    fn update_presence(&mut self, message: PresenceMessage, completion: Completion, fx: &mut Effects) {
        match self.state {
            ChannelState::Attached => fx.push(ChannelEffect::Send {
                message: self.presence_frame(vec![message]),
                completion: Some(completion),
            }),
            ChannelState::Initialized | ChannelState::Attaching => {
                self.pending_presence.push((message, completion));
                if self.state == ChannelState::Initialized {
                    self.attach(Completion::noop(), fx);
                    if self.state == ChannelState::Initialized {
                        let err = self.connection_error();
                        self.fail_pending_presence(&err, fx);
                    }
                }
            }
            state => fx.push(ChannelEffect::Complete {
                completion,
                result: Err(ErrorInfo::new(
                    error_code::PRESENCE_INVALID_CHANNEL_STATE,
                    Some(400),
                    format!(
                        "Unable to {} presence on channel {} in state {state}",
                        message.action, self.name
                    ),
                )),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    fn on_inbound(&mut self, msg: ProtocolMessage, fx: &mut Effects) {
        match msg.action {
            Action::Attached => self.on_attached(msg, fx),
            Action::Detached => self.on_detached(msg, fx),
            Action::Error => {
                let err = error_or_unknown(msg.error);
                tracing::warn!(channel = %self.name, code = err.code, "Channel error: {}", err.message);
                self.transition(ChannelState::Failed, Some(err), false, fx);
            }
            Action::Message => self.on_message(msg, fx),
            Action::Presence => self.on_presence(msg, fx),
            Action::Sync => self.on_sync(msg, fx),
            other => {
                tracing::debug!(channel = %self.name, action = ?other, "Ignoring channel frame");
            }
        }
    }

    fn on_attached(&mut self, msg: ProtocolMessage, fx: &mut Effects) {
        if let Some(serial) = msg.channel_serial.clone() {
            self.channel_serial = Some(serial);
        }
        let resumed = msg.has_flag(flags::RESUMED);
        let has_presence = msg.has_flag(flags::HAS_PRESENCE);
        tracing::info!(
            channel = %self.name,
            resumed,
            has_backlog = msg.has_flag(flags::HAS_BACKLOG),
            has_presence,
            "Channel attached",
        );

        match self.state {
            ChannelState::Attached => {
                if !resumed || msg.error.is_some() {
                    self.error_reason = msg.error.clone();
                    fx.push(ChannelEffect::Emit(ChannelEvent::StateChange(
                        ChannelStateChange {
                            previous: ChannelState::Attached,
                            current: ChannelState::Attached,
                            reason: msg.error.clone(),
                            resumed,
                        },
                    )));
                }
            }
            ChannelState::Attaching | ChannelState::Suspended => {
                self.transition(ChannelState::Attached, msg.error.clone(), resumed, fx);
            }
            state => {
                tracing::debug!(channel = %self.name, %state, "Ignoring ATTACHED");
                return;
            }
        }

        self.sync_presence_after_attach(has_presence, resumed, fx);

        if std::mem::take(&mut self.detach_after_attach) {
            self.start_detaching(fx);
        }
    }

    fn sync_presence_after_attach(&mut self, has_presence: bool, resumed: bool, fx: &mut Effects) {
        let own: Vec<PresenceMessage> = if resumed {
            Vec::new()
        } else {
            let mut own: Vec<_> = self.presence.internal_members().values().cloned().collect();
            own.sort_by_key(PresenceMessage::member_key);
            own
        };

        if has_presence {
            self.presence.restart_sync();
        } else if !self.presence.is_empty() {
            let now = chrono::Utc::now().timestamp_millis();
            let mut leaves: Vec<PresenceMessage> = self
                .presence
                .members()
                .values()
                .filter(|m| m.action != PresenceAction::Absent)
                .map(|m| synthetic_leave(m, now))
                .collect();
            leaves.sort_by_key(PresenceMessage::member_key);
            self.presence.clear();
            for leave in leaves {
                fx.push(ChannelEffect::Emit(ChannelEvent::Presence(leave)));
            }
        }

        for member in own {
            tracing::debug!(channel = %self.name, client_id = ?member.client_id, "Re-entering presence");
            let enter = PresenceMessage {
                action: PresenceAction::Enter,
                client_id: member.client_id,
                data: member.data,
                encoding: member.encoding,
                ..Default::default()
            };
            fx.push(ChannelEffect::Send {
                message: self.presence_frame(vec![enter]),
                completion: None,
            });
        }
    }

    fn on_detached(&mut self, msg: ProtocolMessage, fx: &mut Effects) {
        let reason = msg.error;
        match self.state {
            ChannelState::Detaching => self.transition(ChannelState::Detached, reason, false, fx),
            ChannelState::Attached | ChannelState::Suspended => {
                tracing::warn!(channel = %self.name, "Channel detached by server, re-attaching");
                self.start_attaching(reason, fx);
            }
            ChannelState::Attaching => {
                let err = reason.unwrap_or_else(detached_error);
                self.enter_suspended(err, true, fx);
            }
            state => {
                tracing::debug!(channel = %self.name, %state, "Ignoring DETACHED");
            }
        }
    }

    fn on_message(&mut self, msg: ProtocolMessage, fx: &mut Effects) {
        if self.state != ChannelState::Attached {
            tracing::debug!(channel = %self.name, state = %self.state, "Dropping MESSAGE on unattached channel");
            return;
        }
        let ProtocolMessage {
            id,
            connection_id,
            timestamp,
            messages,
            channel_serial,
            ..
        } = msg;
        if let Some(serial) = channel_serial {
            self.channel_serial = Some(serial);
        }
        for (i, mut m) in messages.unwrap_or_default().into_iter().enumerate() {
            if m.id.is_none() {
                m.id = id.as_ref().map(|pid| format!("{pid}:{i}"));
            }
            if m.connection_id.is_none() {
                m.connection_id = connection_id.clone();
            }
            if m.timestamp.is_none() {
                m.timestamp = timestamp;
            }
            fx.push(ChannelEffect::Emit(ChannelEvent::Message(m)));
        }
    }

    fn on_presence(&mut self, msg: ProtocolMessage, fx: &mut Effects) {
        if self.state != ChannelState::Attached {
            tracing::debug!(channel = %self.name, state = %self.state, "Dropping PRESENCE on unattached channel");
            return;
        }
        for member in normalize_presence(msg) {
            self.apply_member(member, fx);
        }
    }

    fn on_sync(&mut self, msg: ProtocolMessage, fx: &mut Effects) {
        if self.state != ChannelState::Attached {
            tracing::debug!(channel = %self.name, state = %self.state, "Dropping SYNC on unattached channel");
            return;
        }
        let (session, last_page) = parse_sync_serial(msg.channel_serial.as_deref());
        self.presence.begin_sync(session);
        for member in normalize_presence(msg) {
            self.apply_member(member, fx);
        }
        if last_page {
            for leave in self.presence.end_sync() {
                fx.push(ChannelEffect::Emit(ChannelEvent::Presence(leave)));
            }
        }
    }

    fn apply_member(&mut self, member: PresenceMessage, fx: &mut Effects) {
        if self.presence.process_member(&member) {
            fx.push(ChannelEffect::Emit(ChannelEvent::Presence(member)));
        }
    }

    // -----------------------------------------------------------------------
    // Connection notifications and timers
    // -----------------------------------------------------------------------

    fn on_connection_state(
        &mut self,
        current: ConnectionState,
        reason: Option<ErrorInfo>,
        resumed: bool,
        fx: &mut Effects,
    ) {
        self.connection_state = current;
        self.connection_reason = reason.clone();
        match (current, self.state) {
            (ConnectionState::Connected, ChannelState::Attaching) => self.send_attach(fx),
            (ConnectionState::Connected, ChannelState::Detaching) => self.send_detach(fx),
            (ConnectionState::Connected, ChannelState::Suspended) => self.start_attaching(None, fx),
            (ConnectionState::Connected, ChannelState::Attached) if !resumed => {
                self.start_attaching(reason, fx);
            }
            (ConnectionState::Suspended, ChannelState::Attaching | ChannelState::Attached) => {
                let err = self.connection_error();
                self.enter_suspended(err, false, fx);
            }
            (
                ConnectionState::Suspended | ConnectionState::Closed,
                ChannelState::Detaching,
            )
            | (
                ConnectionState::Closed,
                ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended,
            ) => {
                self.transition(ChannelState::Detached, reason, false, fx);
            }
            (
                ConnectionState::Failed,
                ChannelState::Attaching
                | ChannelState::Attached
                | ChannelState::Suspended
                | ChannelState::Detaching,
            ) => {
                let err = self.connection_error();
                self.transition(ChannelState::Failed, Some(err), false, fx);
            }
            _ => {}
        }
    }

    fn on_timer(&mut self, timer: ChannelTimer, generation: u64, fx: &mut Effects) {
        if generation != self.generation {
            tracing::trace!(channel = %self.name, ?timer, "Stale channel timer");
            return;
        }
        match (timer, self.state) {
            (ChannelTimer::AttachTimeout, ChannelState::Attaching) => {
                tracing::warn!(channel = %self.name, "Attach timed out");
                let err = ErrorInfo::new(
                    error_code::CHANNEL_ATTACH_TIMEOUT,
                    None,
                    format!("Attach to channel {} timed out", self.name),
                );
                self.enter_suspended(err, true, fx);
            }
            (ChannelTimer::DetachTimeout, ChannelState::Detaching) => {
                tracing::warn!(channel = %self.name, "Detach timed out");
                let err = ErrorInfo::new(
                    error_code::TIMEOUT,
                    None,
                    format!("Detach from channel {} timed out", self.name),
                );
                complete_all(&mut self.detach_completions, Err(err.clone()), fx);
                self.transition(ChannelState::Attached, Some(err), false, fx);
            }
            (ChannelTimer::Reattach, ChannelState::Suspended)
                if self.connection_state == ConnectionState::Connected =>
            {
                tracing::info!(channel = %self.name, "Retrying attach");
                self.start_attaching(None, fx);
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn start_attaching(&mut self, reason: Option<ErrorInfo>, fx: &mut Effects) {
        self.transition(ChannelState::Attaching, reason, false, fx);
        match self.connection_state {
            ConnectionState::Connected => self.send_attach(fx),
            ConnectionState::Initialized => fx.push(ChannelEffect::RequestConnect),
            _ => {}
        }
    }

    fn send_attach(&mut self, fx: &mut Effects) {
        self.generation += 1;
        fx.push(ChannelEffect::Send {
            message: build_attach_msg(
                &self.name,
                self.params.as_ref(),
                self.channel_serial.as_deref(),
            ),
            completion: None,
        });
        fx.push(ChannelEffect::ScheduleTimer {
            timer: ChannelTimer::AttachTimeout,
            delay: self.realtime_request_timeout,
            generation: self.generation,
        });
    }

    fn start_detaching(&mut self, fx: &mut Effects) {
        self.transition(ChannelState::Detaching, None, false, fx);
        if self.connection_state == ConnectionState::Connected {
            self.send_detach(fx);
        }
    }

    fn send_detach(&mut self, fx: &mut Effects) {
        self.generation += 1;
        fx.push(ChannelEffect::Send {
            message: build_detach_msg(&self.name),
            completion: None,
        });
        fx.push(ChannelEffect::ScheduleTimer {
            timer: ChannelTimer::DetachTimeout,
            delay: self.realtime_request_timeout,
            generation: self.generation,
        });
    }

    fn enter_suspended(&mut self, reason: ErrorInfo, schedule_retry: bool, fx: &mut Effects) {
        self.transition(ChannelState::Suspended, Some(reason), false, fx);
        if std::mem::take(&mut self.detach_after_attach) {
            self.transition(ChannelState::Detached, None, false, fx);
            return;
        }
        if schedule_retry {
            let attempt = self.retry.add_retry_attempt();
            tracing::info!(
                channel = %self.name,
                attempt = attempt.attempt_number,
                delay_ms = attempt.delay.as_millis() as u64,
                "Scheduling re-attach",
            );
            fx.push(ChannelEffect::ScheduleTimer {
                timer: ChannelTimer::Reattach,
                delay: attempt.delay,
                generation: self.generation,
            });
        }
    }

    fn transition(
        &mut self,
        to: ChannelState,
        reason: Option<ErrorInfo>,
        resumed: bool,
        fx: &mut Effects,
    ) {
        let previous = self.state;
        self.retry.channel_will_transition(to);
        self.state = to;
        self.generation += 1;
        self.error_reason = reason.clone();
        tracing::debug!(channel = %self.name, from = ?previous, to = ?to, reason = ?reason, "Channel state change");
        fx.push(ChannelEffect::Emit(ChannelEvent::StateChange(
            ChannelStateChange {
                previous,
                current: to,
                reason: reason.clone(),
                resumed,
            },
        )));

        match to {
            ChannelState::Attached => {
                complete_all(&mut self.attach_completions, Ok(()), fx);
                for (message, completion) in std::mem::take(&mut self.pending_presence) {
                    fx.push(ChannelEffect::Send {
                        message: self.presence_frame(vec![message]),
                        completion: Some(completion),
                    });
                }
            }
            ChannelState::Detached => {
                complete_all(&mut self.detach_completions, Ok(()), fx);
                let err = reason.unwrap_or_else(detached_error);
                complete_all(&mut self.attach_completions, Err(err.clone()), fx);
                self.fail_pending_presence(&err, fx);
                self.presence.clear();
                self.channel_serial = None;
            }
            ChannelState::Suspended => {
                let err = reason.unwrap_or_else(|| self.connection_error());
                complete_all(&mut self.attach_completions, Err(err.clone()), fx);
                if !self.detach_after_attach {
                    complete_all(&mut self.detach_completions, Err(err.clone()), fx);
                }
                self.fail_pending_presence(&err, fx);
            }
            ChannelState::Failed => {
                let err = error_or_unknown(reason);
                self.detach_after_attach = false;
                complete_all(&mut self.attach_completions, Err(err.clone()), fx);
                complete_all(&mut self.detach_completions, Err(err.clone()), fx);
                self.fail_pending_presence(&err, fx);
                self.presence.clear();
                self.channel_serial = None;
            }
            ChannelState::Initialized | ChannelState::Attaching | ChannelState::Detaching => {}
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn fail_pending_presence(&mut self, err: &ErrorInfo, fx: &mut Effects) {
        for (_, completion) in std::mem::take(&mut self.pending_presence) {
            fx.push(ChannelEffect::Complete {
                completion,
                result: Err(err.clone()),
            });
        }
    }

    fn presence_frame(&self, presence: Vec<PresenceMessage>) -> ProtocolMessage {
        ProtocolMessage {
            action: Action::Presence,
            channel: Some(self.name.clone()),
            presence: Some(presence),
            ..Default::default()
        }
    }

    fn invalid_state(&self, operation: &str) -> ErrorInfo {
        ErrorInfo::new(
            error_code::CHANNEL_OPERATION_FAILED_INVALID_STATE,
            Some(400),
            format!(
                "Unable to {operation} channel {} in state {}",
                self.name, self.state
            ),
        )
    }

    fn connection_error(&self) -> ErrorInfo {
        if let Some(reason) = &self.connection_reason {
            return reason.clone();
        }
        let (code, message) = match self.connection_state {
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

fn complete_all(completions: &mut Vec<Completion>, result: Result<(), ErrorInfo>, fx: &mut Effects) {
    for completion in completions.drain(..) {
        fx.push(ChannelEffect::Complete {
            completion,
            result: result.clone(),
        });
    }
}

fn detached_error() -> ErrorInfo {
    ErrorInfo::new(error_code::CHANNEL_DETACHED, None, "Channel detached")
}

fn superseded(operation: &str, by: &str) -> ErrorInfo {
    ErrorInfo::new(
        error_code::CHANNEL_OPERATION_FAILED,
        None,
        format!("{operation} superseded by a subsequent {by}"),
    )
}

/// Fill in member fields a presence frame leaves to its envelope.
fn normalize_presence(msg: ProtocolMessage) -> Vec<PresenceMessage> {
    let ProtocolMessage {
        id,
        connection_id,
        timestamp,
        presence,
        ..
    } = msg;
    presence
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, mut m)| {
            if m.id.is_none() {
                m.id = id.as_ref().map(|pid| format!("{pid}:{i}"));
            }
            if m.connection_id.is_none() {
                m.connection_id = connection_id.clone();
            }
            if m.timestamp.is_none() {
                m.timestamp = timestamp;
            }
            m
        })
        .collect()
}

/// Split a SYNC `channelSerial` into its sequence id and whether this is the
/// last page (empty cursor).
fn parse_sync_serial(serial: Option<&str>) -> (Option<String>, bool) {
    match serial.filter(|s| !s.is_empty()) {
        None => (None, true),
        Some(s) => match s.split_once(':') {
            Some((sequence, cursor)) => (Some(sequence.to_string()), cursor.is_empty()),
            None => (Some(s.to_string()), true),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    const T: i64 = 1_700_000_000_000;

    struct Linear;

    impl RetryDelayCalculator for Linear {
        fn delay(&self, retry_number: u32) -> Duration {
            Duration::from_secs(u64::from(retry_number))
        }
    }

    fn channel_with(
        connection: ConnectionState,
    ) -> (ChannelStateMachine, watch::Sender<Option<String>>) {
        let (tx, rx) = watch::channel(Some("local".to_string()));
        let ch = ChannelStateMachine::new("room", Duration::from_secs(10), Arc::new(Linear), rx)
            .with_connection_state(connection);
        (ch, tx)
    }

    fn connected_channel() -> (ChannelStateMachine, watch::Sender<Option<String>>) {
        channel_with(ConnectionState::Connected)
    }

    fn attached_channel(has_presence: bool) -> (ChannelStateMachine, watch::Sender<Option<String>>) {
        let (mut ch, tx) = connected_channel();
        ch.handle(ChannelInput::Attach(Completion::noop()));
        ch.handle(ChannelInput::Inbound(attached(if has_presence {
            flags::HAS_PRESENCE
        } else {
            0
        })));
        assert_eq!(ch.state(), ChannelState::Attached);
        (ch, tx)
    }

    fn attached(flag_bits: i32) -> ProtocolMessage {
        ProtocolMessage {
            action: Action::Attached,
            channel: Some("room".to_string()),
            channel_serial: Some("serial-1".to_string()),
            flags: Some(flag_bits),
            ..Default::default()
        }
    }

    fn frame(action: Action) -> ProtocolMessage {
        ProtocolMessage {
            action,
            channel: Some("room".to_string()),
            ..Default::default()
        }
    }

    fn member(action: PresenceAction, client: &str, conn: &str, id: &str) -> PresenceMessage {
        PresenceMessage {
            action,
            id: Some(id.to_string()),
            client_id: Some(client.to_string()),
            connection_id: Some(conn.to_string()),
            timestamp: Some(T),
            ..Default::default()
        }
    }

    fn presence_frame(action: Action, serial: Option<&str>, members: Vec<PresenceMessage>) -> ProtocolMessage {
        ProtocolMessage {
            action,
            channel: Some("room".to_string()),
            channel_serial: serial.map(str::to_string),
            presence: Some(members),
            ..Default::default()
        }
    }

    fn sent(fx: &Effects) -> Vec<&ProtocolMessage> {
        fx.iter()
            .filter_map(|e| match e {
                ChannelEffect::Send { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn timers(fx: &Effects) -> Vec<(ChannelTimer, Duration, u64)> {
        fx.iter()
            .filter_map(|e| match e {
                ChannelEffect::ScheduleTimer {
                    timer,
                    delay,
                    generation,
                } => Some((*timer, *delay, *generation)),
                _ => None,
            })
            .collect()
    }

    fn state_changes(fx: &Effects) -> Vec<ChannelStateChange> {
        fx.iter()
            .filter_map(|e| match e {
                ChannelEffect::Emit(ChannelEvent::StateChange(c)) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn presence_events(fx: &Effects) -> Vec<PresenceMessage> {
        fx.iter()
            .filter_map(|e| match e {
                ChannelEffect::Emit(ChannelEvent::Presence(p)) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Resolve every `Complete` effect so waiting receivers see the result.
    fn run_completions(fx: Effects) {
        for effect in fx {
            if let ChannelEffect::Complete { completion, result } = effect {
                completion.complete(result);
            }
        }
    }

    fn with_completion() -> (Completion, oneshot::Receiver<Result<(), ErrorInfo>>) {
        Completion::channel()
    }

    #[test]
    fn attach_sends_attach_and_arms_timeout() {
        let (mut ch, _tx) = connected_channel();
        let (c, mut rx) = with_completion();
        let fx = ch.handle(ChannelInput::Attach(c));

        assert_eq!(ch.state(), ChannelState::Attaching);
        let frames = sent(&fx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].action, Action::Attach);
        let t = timers(&fx);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].0, ChannelTimer::AttachTimeout);
        assert_eq!(t[0].1, Duration::from_secs(10));

        let fx = ch.handle(ChannelInput::Inbound(attached(0)));
        assert_eq!(ch.state(), ChannelState::Attached);
        run_completions(fx);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn attach_when_attached_completes_immediately() {
        let (mut ch, _tx) = attached_channel(false);
        let (c, mut rx) = with_completion();
        let fx = ch.handle(ChannelInput::Attach(c));
        assert!(sent(&fx).is_empty());
        run_completions(fx);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn attach_on_initialized_connection_requests_connect() {
        let (mut ch, _tx) = channel_with(ConnectionState::Initialized);
        let fx = ch.handle(ChannelInput::Attach(Completion::noop()));
        assert_eq!(ch.state(), ChannelState::Attaching);
        assert!(sent(&fx).is_empty());
        assert!(fx.iter().any(|e| matches!(e, ChannelEffect::RequestConnect)));

        let fx = ch.handle(ChannelInput::ConnectionStateChanged {
            current: ConnectionState::Connected,
            reason: None,
            resumed: true,
        });
        assert_eq!(sent(&fx)[0].action, Action::Attach);
    }

    #[test]
    fn attach_on_failed_connection_is_refused() {
        let (mut ch, _tx) = channel_with(ConnectionState::Failed);
        let (c, mut rx) = with_completion();
        let fx = ch.handle(ChannelInput::Attach(c));
        assert_eq!(ch.state(), ChannelState::Initialized);
        assert!(state_changes(&fx).is_empty());
        run_completions(fx);
        assert_eq!(rx.try_recv().unwrap().unwrap_err().code, error_code::FAILED);
    }

    #[test]
    fn attach_timeout_suspends_and_retries_with_backoff() {
        let (mut ch, _tx) = connected_channel();
        let (c, mut rx) = with_completion();
        let fx = ch.handle(ChannelInput::Attach(c));
        let (_, _, generation) = timers(&fx)[0];

        let fx = ch.handle(ChannelInput::Timer(ChannelTimer::AttachTimeout, generation));
        assert_eq!(ch.state(), ChannelState::Suspended);
        let t = timers(&fx);
        assert_eq!(t[0].0, ChannelTimer::Reattach);
        assert_eq!(t[0].1, Duration::from_secs(1));
        let reattach_gen = t[0].2;
        run_completions(fx);
        assert_eq!(
            rx.try_recv().unwrap().unwrap_err().code,
            error_code::CHANNEL_ATTACH_TIMEOUT
        );

        let fx = ch.handle(ChannelInput::Timer(ChannelTimer::Reattach, reattach_gen));
        assert_eq!(ch.state(), ChannelState::Attaching);
        let (_, _, generation) = timers(&fx)[0];

        let fx = ch.handle(ChannelInput::Timer(ChannelTimer::AttachTimeout, generation));
        assert_eq!(timers(&fx)[0].1, Duration::from_secs(2));

        // Reaching attached resets the sequence.
        let fx = ch.handle(ChannelInput::Timer(ChannelTimer::Reattach, timers(&fx)[0].2));
        let _ = fx;
        ch.handle(ChannelInput::Inbound(attached(0)));
        ch.handle(ChannelInput::Inbound(frame(Action::Detached)));
        let fx = ch.handle(ChannelInput::Inbound(frame(Action::Detached)));
        assert_eq!(ch.state(), ChannelState::Suspended);
        assert_eq!(timers(&fx)[0].1, Duration::from_secs(1));
    }

    #[test]
    fn stale_timer_is_ignored() {
        let (mut ch, _tx) = connected_channel();
        let fx = ch.handle(ChannelInput::Attach(Completion::noop()));
        let (_, _, generation) = timers(&fx)[0];
        ch.handle(ChannelInput::Inbound(attached(0)));

        let fx = ch.handle(ChannelInput::Timer(ChannelTimer::AttachTimeout, generation));
        assert!(fx.is_empty());
        assert_eq!(ch.state(), ChannelState::Attached);
    }

    #[test]
    fn reattach_waits_for_connected_connection() {
        let (mut ch, _tx) = connected_channel();
        let fx = ch.handle(ChannelInput::Attach(Completion::noop()));
        let fx = ch.handle(ChannelInput::Timer(ChannelTimer::AttachTimeout, timers(&fx)[0].2));
        let reattach_gen = timers(&fx)[0].2;

        ch.handle(ChannelInput::ConnectionStateChanged {
            current: ConnectionState::Disconnected,
            reason: None,
            resumed: false,
        });
        let fx = ch.handle(ChannelInput::Timer(ChannelTimer::Reattach, reattach_gen));
        assert!(fx.is_empty());
        assert_eq!(ch.state(), ChannelState::Suspended);

        let fx = ch.handle(ChannelInput::ConnectionStateChanged {
            current: ConnectionState::Connected,
            reason: None,
            resumed: true,
        });
        assert_eq!(ch.state(), ChannelState::Attaching);
        assert_eq!(sent(&fx)[0].action, Action::Attach);
    }

    #[test]
    fn detach_flow() {
        let (mut ch, _tx) = attached_channel(false);
        let (c, mut rx) = with_completion();
        let fx = ch.handle(ChannelInput::Detach(c));
        assert_eq!(ch.state(), ChannelState::Detaching);
        assert_eq!(sent(&fx)[0].action, Action::Detach);
        assert_eq!(timers(&fx)[0].0, ChannelTimer::DetachTimeout);

        let fx = ch.handle(ChannelInput::Inbound(frame(Action::Detached)));
        assert_eq!(ch.state(), ChannelState::Detached);
        run_completions(fx);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn detach_timeout_returns_to_attached() {
        let (mut ch, _tx) = attached_channel(false);
        let (c, mut rx) = with_completion();
        let fx = ch.handle(ChannelInput::Detach(c));
        let generation = timers(&fx)[0].2;

        let fx = ch.handle(ChannelInput::Timer(ChannelTimer::DetachTimeout, generation));
        assert_eq!(ch.state(), ChannelState::Attached);
        let changes = state_changes(&fx);
        assert_eq!(changes[0].reason.as_ref().unwrap().code, error_code::TIMEOUT);
        run_completions(fx);
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn detach_while_attaching_runs_after_attach() {
        let (mut ch, _tx) = connected_channel();
        let (attach_c, mut attach_rx) = with_completion();
        let (detach_c, mut detach_rx) = with_completion();
        ch.handle(ChannelInput::Attach(attach_c));
        let fx = ch.handle(ChannelInput::Detach(detach_c));
        assert!(fx.is_empty());

        let fx = ch.handle(ChannelInput::Inbound(attached(0)));
        assert_eq!(ch.state(), ChannelState::Detaching);
        assert!(sent(&fx).iter().any(|m| m.action == Action::Detach));
        run_completions(fx);
        assert_eq!(attach_rx.try_recv().unwrap(), Ok(()));

        let fx = ch.handle(ChannelInput::Inbound(frame(Action::Detached)));
        run_completions(fx);
        assert_eq!(detach_rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn detach_from_suspended_is_immediate() {
        let (mut ch, _tx) = connected_channel();
        let fx = ch.handle(ChannelInput::Attach(Completion::noop()));
        ch.handle(ChannelInput::Timer(ChannelTimer::AttachTimeout, timers(&fx)[0].2));
        let (c, mut rx) = with_completion();
        let fx = ch.handle(ChannelInput::Detach(c));
        assert_eq!(ch.state(), ChannelState::Detached);
        run_completions(fx);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn detach_on_failed_channel_is_refused() {
        let (mut ch, _tx) = attached_channel(false);
        ch.handle(ChannelInput::Inbound(frame(Action::Error)));
        let (c, mut rx) = with_completion();
        run_completions(ch.handle(ChannelInput::Detach(c)));
        assert_eq!(
            rx.try_recv().unwrap().unwrap_err().code,
            error_code::CHANNEL_OPERATION_FAILED_INVALID_STATE
        );
    }

    #[test]
    fn server_detach_while_attached_reattaches() {
        let (mut ch, _tx) = attached_channel(false);
        let mut detached = frame(Action::Detached);
        detached.error = Some(ErrorInfo::new(90198, Some(500), "server detach"));
        let fx = ch.handle(ChannelInput::Inbound(detached));
        assert_eq!(ch.state(), ChannelState::Attaching);
        let frames = sent(&fx);
        assert_eq!(frames[0].action, Action::Attach);
        assert_eq!(frames[0].channel_serial.as_deref(), Some("serial-1"));
        assert!(frames[0].has_flag(flags::ATTACH_RESUME));
        assert_eq!(state_changes(&fx)[0].reason.as_ref().unwrap().code, 90198);
    }

    #[test]
    fn server_detach_while_attaching_suspends() {
        let (mut ch, _tx) = connected_channel();
        ch.handle(ChannelInput::Attach(Completion::noop()));
        let fx = ch.handle(ChannelInput::Inbound(frame(Action::Detached)));
        assert_eq!(ch.state(), ChannelState::Suspended);
        assert_eq!(timers(&fx)[0].0, ChannelTimer::Reattach);
    }

    #[test]
    fn reattached_while_attached_emits_update() {
        let (mut ch, _tx) = attached_channel(false);
        let mut msg = attached(0);
        msg.error = Some(ErrorInfo::new(91005, None, "continuity lost"));
        let fx = ch.handle(ChannelInput::Inbound(msg));
        let changes = state_changes(&fx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous, ChannelState::Attached);
        assert_eq!(changes[0].current, ChannelState::Attached);
        assert!(!changes[0].resumed);

        let fx = ch.handle(ChannelInput::Inbound(attached(flags::RESUMED)));
        assert!(state_changes(&fx).is_empty());
    }

    #[test]
    fn error_fails_channel_and_clears_presence() {
        let (mut ch, _tx) = attached_channel(false);
        let mut members = Vec::new();
        for i in 0..3 {
            members.push(member(
                PresenceAction::Enter,
                &format!("me{i}"),
                "local",
                &format!("local:{i}:0"),
            ));
        }
        members.push(member(PresenceAction::Enter, "r1", "remote", "remote:0:0"));
        members.push(member(PresenceAction::Enter, "r2", "remote", "remote:1:0"));
        ch.handle(ChannelInput::Inbound(presence_frame(Action::Presence, None, members)));
        assert_eq!(ch.presence().len(), 5);
        assert_eq!(ch.presence().internal_members().len(), 3);

        let mut err = frame(Action::Error);
        err.error = Some(ErrorInfo::new(40160, Some(401), "not permitted"));
        let fx = ch.handle(ChannelInput::Inbound(err));

        assert_eq!(ch.state(), ChannelState::Failed);
        assert_eq!(ch.error_reason().unwrap().code, 40160);
        assert!(ch.presence().is_empty());
        assert!(ch.presence().internal_members().is_empty());
        assert!(presence_events(&fx).is_empty());
    }

    #[test]
    fn pending_presence_sent_on_attach() {
        let (mut ch, _tx) = channel_with(ConnectionState::Connected);
        let (c, mut rx) = with_completion();
        let fx = ch.handle(ChannelInput::Presence {
            message: member(PresenceAction::Enter, "me", "", "x"),
            completion: c,
        });
        // Implicit attach.
        assert_eq!(ch.state(), ChannelState::Attaching);
        assert_eq!(sent(&fx)[0].action, Action::Attach);

        let fx = ch.handle(ChannelInput::Inbound(attached(0)));
        let frames = sent(&fx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].action, Action::Presence);
        let has_completion = fx.iter().any(|e| {
            matches!(
                e,
                ChannelEffect::Send {
                    completion: Some(_),
                    ..
                }
            )
        });
        assert!(has_completion);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pending_presence_fails_when_channel_fails() {
        let (mut ch, _tx) = channel_with(ConnectionState::Connected);
        let (c, mut rx) = with_completion();
        ch.handle(ChannelInput::Presence {
            message: member(PresenceAction::Enter, "me", "", "x"),
            completion: c,
        });
        let mut err = frame(Action::Error);
        err.error = Some(ErrorInfo::new(40160, Some(401), "not permitted"));
        run_completions(ch.handle(ChannelInput::Inbound(err)));
        assert_eq!(rx.try_recv().unwrap().unwrap_err().code, 40160);
    }

    #[test]
    fn presence_refused_when_detached() {
        let (mut ch, _tx) = attached_channel(false);
        ch.handle(ChannelInput::Detach(Completion::noop()));
        ch.handle(ChannelInput::Inbound(frame(Action::Detached)));
        let (c, mut rx) = with_completion();
        run_completions(ch.handle(ChannelInput::Presence {
            message: member(PresenceAction::Enter, "me", "", "x"),
            completion: c,
        }));
        assert_eq!(
            rx.try_recv().unwrap().unwrap_err().code,
            error_code::PRESENCE_INVALID_CHANNEL_STATE
        );
    }

    #[test]
    fn publish_refused_when_suspended() {
        let (mut ch, _tx) = connected_channel();
        let fx = ch.handle(ChannelInput::Attach(Completion::noop()));
        ch.handle(ChannelInput::Timer(ChannelTimer::AttachTimeout, timers(&fx)[0].2));
        let (c, mut rx) = with_completion();
        run_completions(ch.handle(ChannelInput::Publish {
            messages: vec![Message::default()],
            completion: c,
        }));
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn publish_forwards_message_frame() {
        let (mut ch, _tx) = attached_channel(false);
        let fx = ch.handle(ChannelInput::Publish {
            messages: vec![Message {
                name: Some("greeting".to_string()),
                ..Default::default()
            }],
            completion: Completion::noop(),
        });
        let frames = sent(&fx);
        assert_eq!(frames[0].action, Action::Message);
        assert_eq!(frames[0].channel.as_deref(), Some("room"));
    }

    #[test]
    fn sync_pages_reconcile_members() {
        let (mut ch, _tx) = attached_channel(false);
        let members: Vec<_> = (0..4)
            .map(|i| {
                member(
                    PresenceAction::Enter,
                    &format!("c{i}"),
                    "remote",
                    &format!("remote:{i}:0"),
                )
            })
            .collect();
        ch.handle(ChannelInput::Inbound(presence_frame(Action::Presence, None, members.clone())));

        let mut first = members[0].clone();
        first.action = PresenceAction::Present;
        let fx = ch.handle(ChannelInput::Inbound(presence_frame(
            Action::Sync,
            Some("seq1:cursor1"),
            vec![first],
        )));
        assert!(ch.presence().sync_in_progress());
        assert!(presence_events(&fx).is_empty());

        let mut second = members[1].clone();
        second.action = PresenceAction::Present;
        let fx = ch.handle(ChannelInput::Inbound(presence_frame(
            Action::Sync,
            Some("seq1:"),
            vec![second],
        )));
        let leaves = presence_events(&fx);
        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|l| l.action == PresenceAction::Leave));
        assert_eq!(ch.presence().len(), 2);
        assert!(!ch.presence().sync_in_progress());
    }

    #[test]
    fn attached_with_presence_flag_starts_sync() {
        let (mut ch, _tx) = attached_channel(true);
        assert!(ch.presence().sync_in_progress());
        let fx = ch.handle(ChannelInput::Inbound(presence_frame(
            Action::Sync,
            None,
            vec![member(PresenceAction::Present, "a", "remote", "remote:0:0")],
        )));
        assert_eq!(presence_events(&fx).len(), 1);
        assert!(!ch.presence().sync_in_progress());
    }

    #[test]
    fn attached_without_presence_flag_removes_members() {
        let (mut ch, _tx) = attached_channel(false);
        ch.handle(ChannelInput::Inbound(presence_frame(
            Action::Presence,
            None,
            vec![
                member(PresenceAction::Enter, "a", "remote", "remote:0:0"),
                member(PresenceAction::Enter, "b", "remote", "remote:1:0"),
            ],
        )));

        let fx = ch.handle(ChannelInput::Inbound(attached(flags::RESUMED)));
        let leaves = presence_events(&fx);
        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|l| l.action == PresenceAction::Leave && l.id.is_none()));
        assert!(ch.presence().is_empty());
    }

    #[test]
    fn non_resumed_attach_reenters_own_members() {
        let (mut ch, _tx) = attached_channel(false);
        let mut mine = member(PresenceAction::Enter, "me", "local", "local:0:0");
        mine.data = Some(serde_json::json!({"status": "online"}));
        ch.handle(ChannelInput::Inbound(presence_frame(Action::Presence, None, vec![mine])));

        let fx = ch.handle(ChannelInput::Inbound(attached(flags::HAS_PRESENCE)));
        let frames = sent(&fx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].action, Action::Presence);
        let enter = &frames[0].presence.as_ref().unwrap()[0];
        assert_eq!(enter.action, PresenceAction::Enter);
        assert_eq!(enter.client_id.as_deref(), Some("me"));
        assert_eq!(enter.data, Some(serde_json::json!({"status": "online"})));
    }

    #[test]
    fn presence_normalized_from_envelope() {
        let (mut ch, _tx) = attached_channel(false);
        let msg = ProtocolMessage {
            action: Action::Presence,
            channel: Some("room".to_string()),
            id: Some("remote:5".to_string()),
            connection_id: Some("remote".to_string()),
            timestamp: Some(T),
            presence: Some(vec![PresenceMessage {
                action: PresenceAction::Enter,
                client_id: Some("a".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let fx = ch.handle(ChannelInput::Inbound(msg));
        let events = presence_events(&fx);
        assert_eq!(events[0].id.as_deref(), Some("remote:5:0"));
        assert_eq!(events[0].connection_id.as_deref(), Some("remote"));
        assert_eq!(events[0].timestamp, Some(T));
        assert!(ch.presence().get("a:remote").is_some());
    }

    #[test]
    fn messages_normalized_from_envelope() {
        let (mut ch, _tx) = attached_channel(false);
        let msg = ProtocolMessage {
            action: Action::Message,
            channel: Some("room".to_string()),
            id: Some("conn:9".to_string()),
            connection_id: Some("conn".to_string()),
            timestamp: Some(T),
            messages: Some(vec![Message::default(), Message::default()]),
            ..Default::default()
        };
        let fx = ch.handle(ChannelInput::Inbound(msg));
        let ids: Vec<_> = fx
            .iter()
            .filter_map(|e| match e {
                ChannelEffect::Emit(ChannelEvent::Message(m)) => m.id.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["conn:9:0", "conn:9:1"]);
    }

    #[test]
    fn messages_dropped_when_not_attached() {
        let (mut ch, _tx) = connected_channel();
        let mut msg = frame(Action::Message);
        msg.messages = Some(vec![Message::default()]);
        assert!(ch.handle(ChannelInput::Inbound(msg)).is_empty());
    }

    #[test]
    fn connection_suspended_suspends_channel() {
        let (mut ch, _tx) = attached_channel(false);
        let fx = ch.handle(ChannelInput::ConnectionStateChanged {
            current: ConnectionState::Suspended,
            reason: None,
            resumed: false,
        });
        assert_eq!(ch.state(), ChannelState::Suspended);
        assert!(timers(&fx).is_empty());
        assert_eq!(
            state_changes(&fx)[0].reason.as_ref().unwrap().code,
            error_code::SUSPENDED
        );

        let fx = ch.handle(ChannelInput::ConnectionStateChanged {
            current: ConnectionState::Connected,
            reason: None,
            resumed: false,
        });
        assert_eq!(ch.state(), ChannelState::Attaching);
        assert_eq!(sent(&fx)[0].action, Action::Attach);
    }

    #[test]
    fn connection_not_resumed_reattaches_attached_channel() {
        let (mut ch, _tx) = attached_channel(false);
        let fx = ch.handle(ChannelInput::ConnectionStateChanged {
            current: ConnectionState::Connected,
            reason: None,
            resumed: true,
        });
        assert!(fx.is_empty());

        let fx = ch.handle(ChannelInput::ConnectionStateChanged {
            current: ConnectionState::Connected,
            reason: Some(ErrorInfo::new(80008, Some(400), "unable to recover")),
            resumed: false,
        });
        assert_eq!(ch.state(), ChannelState::Attaching);
        assert_eq!(sent(&fx)[0].action, Action::Attach);
    }

    #[test]
    fn connection_closed_detaches_channel() {
        let (mut ch, _tx) = attached_channel(false);
        ch.handle(ChannelInput::ConnectionStateChanged {
            current: ConnectionState::Closed,
            reason: None,
            resumed: false,
        });
        assert_eq!(ch.state(), ChannelState::Detached);
    }

    #[test]
    fn connection_failed_fails_channel_with_its_error() {
        let (mut ch, _tx) = attached_channel(false);
        let fx = ch.handle(ChannelInput::ConnectionStateChanged {
            current: ConnectionState::Failed,
            reason: Some(ErrorInfo::new(40101, Some(401), "invalid credentials")),
            resumed: false,
        });
        assert_eq!(ch.state(), ChannelState::Failed);
        assert_eq!(state_changes(&fx)[0].reason.as_ref().unwrap().code, 40101);
    }

    #[test]
    fn sync_serial_parsing() {
        assert_eq!(parse_sync_serial(None), (None, true));
        assert_eq!(parse_sync_serial(Some("")), (None, true));
        assert_eq!(
            parse_sync_serial(Some("seq:cur")),
            (Some("seq".to_string()), false)
        );
        assert_eq!(parse_sync_serial(Some("seq:")), (Some("seq".to_string()), true));
        assert_eq!(parse_sync_serial(Some("seq")), (Some("seq".to_string()), true));
    }
}
