//! Retry combinator with exponential backoff and cancellation.
//!
//! Call sites supply the retry predicate; this module only provides the reason
//! sets and classifiers they commonly pick from.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetrySettings;
use crate::error::{Result, RowStreamError, RpcCode, TransportErrorKind};

/// Structured reasons retried for generic read calls.
pub const DEFAULT_RETRY_REASONS: &[&str] = &["backendError", "rateLimitExceeded"];

/// Structured reasons retried for job-adjacent calls.
pub const JOB_RETRY_REASONS: &[&str] = &["backendError", "rateLimitExceeded", "internalError"];

const RETRY_5XX_CODES: &[u16] = &[500, 502, 503, 504];

/// Caller-supplied predicate that replaces the per-call classification.
pub type ShouldRetryFn = Arc<dyn Fn(&RowStreamError) -> bool + Send + Sync>;

/// Jittered exponential backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            current: initial.max(Duration::from_nanos(1)),
            max: max.max(Duration::from_nanos(1)),
            multiplier: multiplier.max(1.0),
        }
    }

    /// Next pause, uniform in `[1ns, current]`; grows `current` toward `max`.
    pub fn pause(&mut self) -> Duration {
        let ceiling = self.current.as_nanos().min(u64::MAX as u128) as u64;
        let nanos = rand::rng().random_range(1..=ceiling.max(1));
        let grown = self.current.as_secs_f64() * self.multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.max.as_secs_f64()));
        Duration::from_nanos(nanos)
    }
}

impl From<&RetrySettings> for Backoff {
    fn from(s: &RetrySettings) -> Self {
        Self::new(s.initial(), s.max(), s.multiplier)
    }
}

/// Runs network calls until success, a non-retryable error, or cancellation.
#[derive(Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
    should_retry: Option<ShouldRetryFn>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("settings", &self.settings)
            .field("custom_predicate", &self.should_retry.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            should_retry: None,
        }
    }

    /// Replace every call site's predicate with `f`.
    pub fn with_should_retry(mut self, f: ShouldRetryFn) -> Self {
        self.should_retry = Some(f);
        self
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::from(&self.settings)
    }

    /// Run `work` under backoff. `call` names the operation in logs.
    ///
    /// # Errors
    /// Returns the first non-retryable error, or [`RowStreamError::Cancelled`] once
    /// `cancel` fires (also while a call is in flight).
    pub async fn run<T, F, Fut, P>(
        &self,
        call: &str,
        cancel: &CancellationToken,
        mut work: F,
        is_retryable: P,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&RowStreamError) -> bool,
    {
        let mut backoff = self.backoff();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RowStreamError::Cancelled),
                res = work() => res,
            };
            let err = match outcome {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            let retry = match &self.should_retry {
                Some(custom) => custom(&err),
                None => is_retryable(&err),
            };
            if !retry || err.is_cancelled() {
                return Err(err);
            }
            let delay = backoff.pause();
            crate::metrics::global_metrics().inc_retries(call);
            debug!(
                call,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying call after transient error"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RowStreamError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Classifies REST/transport errors against a structured reason set.
pub fn retryable_error(err: &RowStreamError, reasons: &[&str]) -> bool {
    match err {
        RowStreamError::Api(api) => {
            if let Some(reason) = &api.reason {
                if reasons.contains(&reason.as_str()) {
                    return true;
                }
            }
            RETRY_5XX_CODES.contains(&api.code)
        }
        RowStreamError::Transport { kind, .. } => !matches!(kind, TransportErrorKind::Other),
        RowStreamError::Context { source, .. } => retryable_error(source, reasons),
        _ => false,
    }
}

/// Classifies streaming read RPC failures (stream re-open and session creation).
pub fn retryable_rpc(err: &RowStreamError) -> bool {
    match err.root() {
        RowStreamError::Rpc { code, .. } => matches!(
            code,
            RpcCode::Aborted
                | RpcCode::Cancelled
                | RpcCode::DeadlineExceeded
                | RpcCode::FailedPrecondition
                | RpcCode::Internal
                | RpcCode::Unavailable
        ),
        RowStreamError::Transport { kind, .. } => !matches!(kind, TransportErrorKind::Other),
        _ => false,
    }
}
