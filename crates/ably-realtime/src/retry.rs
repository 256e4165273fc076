//! Retry sequencing shared by the connection and channel state machines.
//!
//! A [`RetrySequence`] counts consecutive retries within one outage and asks
//! a [`RetryDelayCalculator`] how long to wait before each. The two retry
//! states own a sequence and drop it when a transition ends the outage, so
//! the next failure starts again from retry number 1.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::types::{ChannelState, ConnectionState};

/// Computes the wait before retry number `retry_number` (1-based).
pub trait RetryDelayCalculator: Send + Sync {
    fn delay(&self, retry_number: u32) -> Duration;
}

/// A retry that the caller is about to wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Id of the sequence this attempt belongs to.
    pub id: Uuid,
    pub attempt_number: u32,
    pub delay: Duration,
}

pub struct RetrySequence {
    id: Uuid,
    calculator: Arc<dyn RetryDelayCalculator>,
    retry_count: u32,
}

impl RetrySequence {
    pub fn new(calculator: Arc<dyn RetryDelayCalculator>) -> Self {
        Self {
            id: Uuid::new_v4(),
            calculator,
            retry_count: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn add_retry_attempt(&mut self) -> RetryAttempt {
        self.retry_count = self.retry_count.saturating_add(1);
        let attempt = RetryAttempt {
            id: self.id,
            attempt_number: self.retry_count,
            delay: self.calculator.delay(self.retry_count),
        };
        tracing::debug!(
            sequence = %self.id,
            attempt = attempt.attempt_number,
            delay_ms = attempt.delay.as_millis() as u64,
            "Retry attempt added",
        );
        attempt
    }
}

impl std::fmt::Debug for RetrySequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrySequence")
            .field("id", &self.id)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Per-state-machine retry states
// ---------------------------------------------------------------------------

/// Retry bookkeeping for connection attempts. Cycling between `connecting`
/// and `disconnected` continues the current sequence; any other destination
/// resets it.
pub struct ConnectionRetryState {
    calculator: Arc<dyn RetryDelayCalculator>,
    sequence: Option<RetrySequence>,
}

impl ConnectionRetryState {
    pub fn new(calculator: Arc<dyn RetryDelayCalculator>) -> Self {
        Self {
            calculator,
            sequence: None,
        }
    }

    pub fn add_retry_attempt(&mut self) -> RetryAttempt {
        let calculator = &self.calculator;
        self.sequence
            .get_or_insert_with(|| RetrySequence::new(Arc::clone(calculator)))
            .add_retry_attempt()
    }

    pub fn connection_will_transition(&mut self, to: ConnectionState) {
        if matches!(
            to,
            ConnectionState::Connecting | ConnectionState::Disconnected
        ) {
            return;
        }
        if let Some(seq) = self.sequence.take() {
            tracing::debug!(sequence = %seq.id(), to = ?to, "Connection retry sequence reset");
        }
    }
}

/// Retry bookkeeping for channel re-attach. Cycling between `attaching` and
/// `suspended` continues the current sequence; any other destination resets
/// it.
pub struct ChannelAttachRetryState {
    calculator: Arc<dyn RetryDelayCalculator>,
    sequence: Option<RetrySequence>,
}

impl ChannelAttachRetryState {
    pub fn new(calculator: Arc<dyn RetryDelayCalculator>) -> Self {
        Self {
            calculator,
            sequence: None,
        }
    }

    pub fn add_retry_attempt(&mut self) -> RetryAttempt {
        let calculator = &self.calculator;
        self.sequence
            .get_or_insert_with(|| RetrySequence::new(Arc::clone(calculator)))
            .add_retry_attempt()
    }

    pub fn channel_will_transition(&mut self, to: ChannelState) {
        if matches!(to, ChannelState::Suspended | ChannelState::Attaching) {
            return;
        }
        if let Some(seq) = self.sequence.take() {
            tracing::debug!(sequence = %seq.id(), to = ?to, "Channel attach retry sequence reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Delay of `retry_number` seconds, so assertions read the count back.
    struct Linear;

    impl RetryDelayCalculator for Linear {
        fn delay(&self, retry_number: u32) -> Duration {
            Duration::from_secs(u64::from(retry_number))
        }
    }

    fn linear() -> Arc<dyn RetryDelayCalculator> {
        Arc::new(Linear)
    }

    #[test]
    fn sequence_counts_from_one() {
        let mut seq = RetrySequence::new(linear());
        assert_eq!(seq.retry_count(), 0);

        let first = seq.add_retry_attempt();
        let second = seq.add_retry_attempt();
        let third = seq.add_retry_attempt();

        assert_eq!(first.attempt_number, 1);
        assert_eq!(first.delay, Duration::from_secs(1));
        assert_eq!(second.delay, Duration::from_secs(2));
        assert_eq!(third.attempt_number, 3);
        assert_eq!(seq.retry_count(), 3);
        assert_eq!(first.id, seq.id());
        assert_eq!(third.id, seq.id());
    }

    #[test]
    fn sequences_have_distinct_ids() {
        let a = RetrySequence::new(linear());
        let b = RetrySequence::new(linear());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn connection_retry_continues_through_connecting_and_disconnected() {
        let mut state = ConnectionRetryState::new(linear());
        assert_eq!(state.add_retry_attempt().attempt_number, 1);
        state.connection_will_transition(ConnectionState::Connecting);
        state.connection_will_transition(ConnectionState::Disconnected);
        assert_eq!(state.add_retry_attempt().attempt_number, 2);
    }

    #[test]
    fn connection_retry_resets_on_other_transitions() {
        for to in [
            ConnectionState::Initialized,
            ConnectionState::Connected,
            ConnectionState::Suspended,
            ConnectionState::Closing,
            ConnectionState::Closed,
            ConnectionState::Failed,
        ] {
            let mut state = ConnectionRetryState::new(linear());
            let before = state.add_retry_attempt();
            state.add_retry_attempt();
            state.connection_will_transition(to);
            let after = state.add_retry_attempt();
            assert_eq!(after.attempt_number, 1, "transition to {to} should reset");
            assert_ne!(after.id, before.id);
        }
    }

    #[test]
    fn channel_retry_continues_through_suspended_and_attaching() {
        let mut state = ChannelAttachRetryState::new(linear());
        state.add_retry_attempt();
        state.channel_will_transition(ChannelState::Attaching);
        state.channel_will_transition(ChannelState::Suspended);
        assert_eq!(state.add_retry_attempt().delay, Duration::from_secs(2));
    }

    #[test]
    fn channel_retry_resets_on_other_transitions() {
        for to in [
            ChannelState::Initialized,
            ChannelState::Attached,
            ChannelState::Detaching,
            ChannelState::Detached,
            ChannelState::Failed,
        ] {
            let mut state = ChannelAttachRetryState::new(linear());
            state.add_retry_attempt();
            state.add_retry_attempt();
            state.channel_will_transition(to);
            assert_eq!(
                state.add_retry_attempt().attempt_number,
                1,
                "transition to {to} should reset"
            );
        }
    }
}
