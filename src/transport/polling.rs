//! Fallback result polling
//!
//! Used when a result will not arrive by push: the HTTP reply was only a
//! placeholder, or the push channel dropped mid-turn.

use super::http::HttpBackend;
use super::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Somewhere a finished result can be fetched from
#[async_trait]
pub trait ResultSource: Send + Sync + 'static {
    /// `Ok(None)` while the result is still pending
    async fn poll_result(&self, session_id: &str) -> Result<Option<String>, TransportError>;
}

#[async_trait]
impl<T: ResultSource> ResultSource for Arc<T> {
    async fn poll_result(&self, session_id: &str) -> Result<Option<String>, TransportError> {
        (**self).poll_result(session_id).await
    }
}

#[async_trait]
impl ResultSource for HttpBackend {
    async fn poll_result(&self, session_id: &str) -> Result<Option<String>, TransportError> {
        HttpBackend::poll_result(self, session_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(5),
        }
    }
}

impl PollPolicy {
    /// Longest a poll can run before giving up
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.attempts)
    }
}

/// Poll until a result is available or the budget is spent.
///
/// Transient errors count as a pending poll. Non-retryable errors end the
/// wait early.
pub async fn await_result<S: ResultSource + ?Sized>(
    source: &S,
    session_id: &str,
    policy: PollPolicy,
) -> Result<String, TransportError> {
    for attempt in 1..=policy.attempts {
        tokio::time::sleep(policy.interval).await;
        match source.poll_result(session_id).await {
            Ok(Some(result)) => {
                tracing::info!(session_id = %session_id, attempt, "Polled result ready");
                return Ok(result);
            }
            Ok(None) => {
                tracing::debug!(session_id = %session_id, attempt, "Result pending");
            }
            Err(e) if e.kind.is_retryable() => {
                tracing::debug!(session_id = %session_id, attempt, error = %e, "Poll failed, will retry");
            }
            Err(e) => return Err(e),
        }
    }
    tracing::warn!(session_id = %session_id, attempts = policy.attempts, "Polling budget exhausted");
    Err(TransportError::timeout(policy.budget()))
}
