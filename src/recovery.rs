use crate::clock::elapsed_seconds;
use crate::errors::{AppError, AppResult};
use crate::models::{LifecycleState, Session};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Paused { remaining: u64 },
    Running { remaining: u64, drift_seconds: u64 },
    Expired { overdue_seconds: u64, stale: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RecoveryOutcome {
    Idle,
    Paused {
        session: Session,
    },
    #[serde(rename_all = "camelCase")]
    Running {
        session: Session,
        remaining_seconds: u64,
        drift_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    CompletedWhileAway {
        session: Session,
        stale: bool,
    },
}

/// Reconciles an active row against `now`.
///
/// A paused row is restored verbatim. A running row loses the whole seconds elapsed since its
/// last checkpoint; `last_checkpoint_at` is the lower bound on when the snapshot was true.
/// Rows that overran by more than their own planned duration are flagged stale; they still
/// complete normally.
pub fn reconcile(session: &Session, now: DateTime<Utc>) -> AppResult<Reconciliation> {
    let planned = session.planned_seconds();
    let snapshot = session.remaining_seconds_snapshot.min(planned);
    match session.lifecycle_state {
        LifecycleState::Paused => Ok(Reconciliation::Paused { remaining: snapshot }),
        LifecycleState::Running => {
            let drift = elapsed_seconds(session.last_checkpoint_at, now);
            if drift >= snapshot {
                let overdue_seconds = drift - snapshot;
                Ok(Reconciliation::Expired {
                    overdue_seconds,
                    stale: overdue_seconds > planned,
                })
            } else {
                Ok(Reconciliation::Running {
                    remaining: snapshot - drift,
                    drift_seconds: drift,
                })
            }
        }
        state => Err(AppError::InvalidTransition(format!(
            "session {} is already {} and cannot be recovered",
            session.id,
            state.as_str()
        ))),
    }
}
