//! Per-model request throttling and provider backoff.
//!
//! Every LLM request passes through the [`RateLimiter`]: `acquire` blocks
//! until a slot is free under the model's requests-per-minute cap, emitting
//! countdown ticks the shell can render; `record` charges the bucket after
//! the request is issued. [`retry_with_backoff`] wraps provider calls and
//! retries throttling and transient failures with exponential backoff.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::error::{ReplError, ReplResult};

/// RPM cap applied to models absent from the table.
pub const DEFAULT_RPM: u32 = 10;

/// Fraction of the published cap actually used, to stay clear of the edge.
pub const SAFETY_MARGIN: f64 = 0.9;

/// Maximum provider-call attempts before surfacing `RateExceeded`.
pub const MAX_ATTEMPTS: usize = 5;

const INITIAL_BACKOFF_SECS: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 1.5;
const MAX_BACKOFF_SECS: f64 = 60.0;

/// Default requests-per-minute table for known Gemini models.
pub fn default_rpm_table() -> HashMap<String, u32> {
    [
        ("gemini-2.0-flash-lite", 30),
        ("gemini-2.0-flash", 15),
        ("gemini-2.5-flash-lite-preview-06-17", 15),
        ("gemini-2.5-flash", 10),
        ("gemini-2.5-pro", 5),
    ]
    .into_iter()
    .map(|(model, rpm)| (model.to_string(), rpm))
    .collect()
}

/// Countdown events observable by the shell while a turn waits for a slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateEvent {
    Wait { model: String, seconds: f64 },
    Tick { remaining_secs: u64 },
    Resume,
}

/// Snapshot of a model's bucket.
#[derive(Debug, Clone, Serialize)]
pub struct RateStatus {
    pub model: String,
    pub current: usize,
    pub limit_rpm: u32,
    pub effective_limit: usize,
    pub remaining: usize,
}

pub struct RateLimiter {
    limits: HashMap<String, u32>,
    window: Duration,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
    events: Option<mpsc::UnboundedSender<RateEvent>>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, u32>) -> Self {
        Self {
            limits,
            window: Duration::from_secs(60),
            buckets: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Attach a channel for countdown events.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<RateEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Shrink the rolling window (tests).
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    fn effective_limit(&self, model: &str) -> usize {
        let rpm = self.limits.get(model).copied().unwrap_or(DEFAULT_RPM);
        ((rpm as f64 * SAFETY_MARGIN) as usize).max(1)
    }

    fn emit(&self, event: RateEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Block until a slot is free for `model` under its cap, emitting a
    /// `Wait` event followed by one `Tick` per second and a final `Resume`
    /// whenever sleeping is required. Does not charge the bucket; call
    /// [`record`](Self::record) once the request is issued.
    pub async fn acquire(&self, model: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets.entry(model.to_string()).or_default();
                let now = Instant::now();
                while bucket
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    bucket.pop_front();
                }
                if bucket.len() < self.effective_limit(model) {
                    return;
                }
                let oldest = *bucket.front().expect("bucket at capacity");
                (oldest + self.window).saturating_duration_since(now)
            };

            if wait.is_zero() {
                continue;
            }

            tracing::info!(model, wait_secs = wait.as_secs_f64(), "rate limit wait");
            self.emit(RateEvent::Wait {
                model: model.to_string(),
                seconds: wait.as_secs_f64(),
            });

            let mut remaining = wait;
            while !remaining.is_zero() {
                let step = remaining.min(Duration::from_secs(1));
                tokio::time::sleep(step).await;
                remaining = remaining.saturating_sub(step);
                self.emit(RateEvent::Tick {
                    remaining_secs: remaining.as_secs(),
                });
            }
            self.emit(RateEvent::Resume);
        }
    }

    /// Charge the bucket for a request just issued.
    pub async fn record(&self, model: &str) {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(model.to_string())
            .or_default()
            .push_back(Instant::now());
    }

    /// Current bucket occupancy for `model`.
    pub async fn status(&self, model: &str) -> RateStatus {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(model.to_string()).or_default();
        let now = Instant::now();
        while bucket
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            bucket.pop_front();
        }
        let effective = self.effective_limit(model);
        RateStatus {
            model: model.to_string(),
            current: bucket.len(),
            limit_rpm: self.limits.get(model).copied().unwrap_or(DEFAULT_RPM),
            effective_limit: effective,
            remaining: effective.saturating_sub(bucket.len()),
        }
    }
}

/// Backoff delay before retry attempt `attempt` (0-based): 2s, 3s, 4.5s, …
/// capped at 60s.
pub fn backoff_delay(attempt: usize) -> Duration {
    let secs = INITIAL_BACKOFF_SECS * BACKOFF_FACTOR.powi(attempt as i32);
    Duration::from_secs_f64(secs.min(MAX_BACKOFF_SECS))
}

/// Run a provider call, retrying throttled/transient failures up to
/// [`MAX_ATTEMPTS`] with exponential backoff. Exhaustion surfaces as
/// `RateExceeded`; non-retryable errors pass through unchanged.
pub async fn retry_with_backoff<T, F, Fut>(model: &str, mut op: F) -> ReplResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ReplResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    tracing::warn!(model, attempts = attempt, error = %e, "retries exhausted");
                    return Err(ReplError::RateExceeded {
                        model: model.to_string(),
                        attempts: attempt,
                    });
                }
                let delay = backoff_delay(attempt - 1);
                tracing::warn!(
                    model,
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    error = %e,
                    "provider throttled, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
