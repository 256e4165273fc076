//! Jittered incremental backoff for connection and channel retries.
//!
//! `delay(n) = initial × min((n + 2) / 3, 2) × jitter`, where jitter is drawn
//! from `[0.8, 1.0]`. Delays are rounded to whole milliseconds.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::retry::RetryDelayCalculator;

const MAX_BACKOFF_COEFFICIENT: f64 = 2.0;
const JITTER_MIN: f64 = 0.8;
const JITTER_MAX: f64 = 1.0;

/// Source of the random factor applied to each delay.
pub trait JitterCoefficientGenerator: Send + Sync {
    fn generate(&self) -> f64;
}

/// Uniform jitter in `[0.8, 1.0]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultJitterCoefficientGenerator;

impl JitterCoefficientGenerator for DefaultJitterCoefficientGenerator {
    fn generate(&self) -> f64 {
        rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX)
    }
}

/// Replays a fixed list of coefficients, wrapping around at the end.
#[derive(Debug)]
pub struct StaticJitterCoefficients {
    values: Vec<f64>,
    next: Mutex<usize>,
}

impl StaticJitterCoefficients {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            next: Mutex::new(0),
        }
    }
}

impl JitterCoefficientGenerator for StaticJitterCoefficients {
    fn generate(&self) -> f64 {
        if self.values.is_empty() {
            return JITTER_MAX;
        }
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        let value = self.values.get(*next).copied().unwrap_or(JITTER_MAX);
        *next = (*next + 1) % self.values.len();
        value
    }
}

pub struct BackoffRetryDelayCalculator {
    initial_retry_timeout: Duration,
    jitter: Arc<dyn JitterCoefficientGenerator>,
}

impl BackoffRetryDelayCalculator {
    pub fn new(
        initial_retry_timeout: Duration,
        jitter: Arc<dyn JitterCoefficientGenerator>,
    ) -> Self {
        Self {
            initial_retry_timeout,
            jitter,
        }
    }

    pub fn with_default_jitter(initial_retry_timeout: Duration) -> Self {
        Self::new(
            initial_retry_timeout,
            Arc::new(DefaultJitterCoefficientGenerator),
        )
    }
}

fn backoff_coefficient(retry_number: u32) -> f64 {
    let n = f64::from(retry_number.max(1));
    ((n + 2.0) / 3.0).min(MAX_BACKOFF_COEFFICIENT)
}

impl RetryDelayCalculator for BackoffRetryDelayCalculator {
    fn delay(&self, retry_number: u32) -> Duration {
        let initial_ms = self.initial_retry_timeout.as_millis() as f64;
        let ms = initial_ms * backoff_coefficient(retry_number) * self.jitter.generate();
        Duration::from_millis(ms.round().max(0.0) as u64)
    }
}
