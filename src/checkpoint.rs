use crate::errors::{AppError, AppResult};
use crate::models::{Session, SessionPatch, TimerSettings};
use crate::store::SessionStore;
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Clone)]
pub struct CheckpointWriter {
    store: Arc<dyn SessionStore>,
}

impl CheckpointWriter {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn write(&self, session_id: &str, patch: &SessionPatch) -> Option<Session> {
        match self.store.update(session_id, patch) {
            Ok(session) => {
                tracing::debug!(
                    session_id = %session_id,
                    remaining = patch.remaining_seconds_snapshot,
                    revision = patch.revision,
                    "checkpoint written"
                );
                Some(session)
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "checkpoint write failed; retrying next interval"
                );
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &TimerSettings) -> Self {
        Self {
            max_attempts: settings.durable_write_max_attempts.max(1),
            base_backoff: Duration::from_millis(settings.durable_write_backoff_ms),
            max_backoff: Duration::from_millis(settings.durable_write_max_backoff_ms),
        }
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Writes a patch that must not be lost (terminal transitions, pause/resume toggles),
/// retrying with exponential backoff before giving up.
pub async fn write_durable(
    store: &Arc<dyn SessionStore>,
    session_id: &str,
    patch: &SessionPatch,
    policy: RetryPolicy,
) -> AppResult<Session> {
    let mut attempt = 1;
    loop {
        match store.update(session_id, patch) {
            Ok(session) => return Ok(session),
            Err(AppError::NotFound(message)) => return Err(AppError::NotFound(message)),
            Err(error) if attempt >= policy.max_attempts => {
                tracing::error!(
                    session_id = %session_id,
                    attempts = attempt,
                    error = %error,
                    "durable session write failed; giving up"
                );
                return Err(AppError::Persistence(format!(
                    "session {} could not be saved after {} attempts: {}",
                    session_id, attempt, error
                )));
            }
            Err(error) => {
                let delay = policy.backoff_for(attempt);
                tracing::warn!(
                    session_id = %session_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "durable session write failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
