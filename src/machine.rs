use crate::clock::{remaining_seconds, target_end};
use crate::errors::{AppError, AppResult};
use crate::models::{LifecycleState, Session, SessionPatch, TimerPhase, TimerSnapshot};
use crate::recovery::Reconciliation;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
struct RunningState {
    session: Session,
    target_end: DateTime<Utc>,
    remaining_at_resume: u64,
    reminder_fired: bool,
}

#[derive(Debug, Clone)]
struct PausedState {
    session: Session,
    reminder_fired: bool,
}

#[derive(Debug, Clone)]
enum TimerState {
    Idle,
    Running(RunningState),
    Paused(PausedState),
    Finished(Session),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub session: Session,
    pub patch: SessionPatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub session: Session,
    pub seconds_remaining: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub remaining_seconds: Option<u64>,
    pub reminder: Option<Reminder>,
    pub completed: Option<Transition>,
}

/// Synchronous session lifecycle. Every operation takes the evaluation instant explicitly and
/// performs no I/O; callers persist the returned patches and dispatch side effects.
#[derive(Debug)]
pub struct SessionMachine {
    state: TimerState,
    reminder_lead_seconds: u64,
}

impl SessionMachine {
    pub fn new(reminder_lead_seconds: u64) -> Self {
        Self {
            state: TimerState::Idle,
            reminder_lead_seconds,
        }
    }

    pub fn phase(&self) -> TimerPhase {
        match &self.state {
            TimerState::Idle => TimerPhase::Idle,
            TimerState::Running(_) => TimerPhase::Running,
            TimerState::Paused(_) => TimerPhase::Paused,
            TimerState::Finished(session) => match session.lifecycle_state {
                LifecycleState::Completed => TimerPhase::Completed,
                _ => TimerPhase::Interrupted,
            },
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, TimerState::Running(_) | TimerState::Paused(_))
    }

    pub fn session(&self) -> Option<&Session> {
        match &self.state {
            TimerState::Idle => None,
            TimerState::Running(run) => Some(&run.session),
            TimerState::Paused(paused) => Some(&paused.session),
            TimerState::Finished(session) => Some(session),
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> TimerSnapshot {
        let (remaining_seconds, target_end_at) = match &self.state {
            TimerState::Idle => (None, None),
            TimerState::Running(run) => {
                (Some(remaining_seconds(run.target_end, now)), Some(run.target_end))
            }
            TimerState::Paused(paused) => (Some(paused.session.remaining_seconds_snapshot), None),
            TimerState::Finished(session) => (Some(session.remaining_seconds_snapshot), None),
        };
        TimerSnapshot {
            phase: self.phase(),
            remaining_seconds,
            target_end_at,
            session: self.session().cloned(),
        }
    }

    pub fn begin(&mut self, session: Session, now: DateTime<Utc>) -> AppResult<()> {
        if self.is_active() {
            return Err(AppError::Conflict(format!(
                "session {} is still active",
                self.session().map(|session| session.id.as_str()).unwrap_or_default()
            )));
        }
        if session.lifecycle_state != LifecycleState::Running {
            return Err(AppError::InvalidTransition(format!(
                "session {} cannot begin in state {}",
                session.id,
                session.lifecycle_state.as_str()
            )));
        }

        let remaining = session.remaining_seconds_snapshot;
        self.state = TimerState::Running(RunningState {
            target_end: target_end(now, remaining),
            remaining_at_resume: remaining,
            reminder_fired: false,
            session,
        });
        Ok(())
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> AppResult<Option<Transition>> {
        let run = match &self.state {
            TimerState::Running(run) => run.clone(),
            TimerState::Paused(_) | TimerState::Finished(_) => return Ok(None),
            TimerState::Idle => {
                return Err(AppError::InvalidTransition("no session to pause".to_string()))
            }
        };

        let remaining = remaining_seconds(run.target_end, now);
        // Elapsed time is measured on the countdown's whole-second grid so that
        // accumulated + remaining stays equal to the planned duration.
        let elapsed_this_run = run.remaining_at_resume.saturating_sub(remaining);
        let mut session = run.session;
        let accumulated =
            (session.accumulated_seconds + elapsed_this_run).min(session.planned_seconds());
        let patch = SessionPatch::checkpoint(
            LifecycleState::Paused,
            remaining,
            accumulated,
            now,
            session.revision + 1,
        )
        .expecting(LifecycleState::Running);
        session.apply(&patch);

        self.state = TimerState::Paused(PausedState {
            session: session.clone(),
            reminder_fired: run.reminder_fired,
        });
        Ok(Some(Transition { session, patch }))
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> AppResult<Option<Transition>> {
        let paused = match &self.state {
            TimerState::Paused(paused) => paused.clone(),
            TimerState::Running(_) | TimerState::Finished(_) => return Ok(None),
            TimerState::Idle => {
                return Err(AppError::InvalidTransition("no session to resume".to_string()))
            }
        };

        let mut session = paused.session;
        let remaining = session.remaining_seconds_snapshot;
        let patch = SessionPatch::checkpoint(
            LifecycleState::Running,
            remaining,
            session.accumulated_seconds,
            now,
            session.revision + 1,
        )
        .expecting(LifecycleState::Paused);
        session.apply(&patch);

        self.state = TimerState::Running(RunningState {
            session: session.clone(),
            target_end: target_end(now, remaining),
            remaining_at_resume: remaining,
            reminder_fired: paused.reminder_fired,
        });
        Ok(Some(Transition { session, patch }))
    }

    pub fn stop(&mut self, now: DateTime<Utc>) -> AppResult<Option<Transition>> {
        let (session, remaining) = match &self.state {
            TimerState::Running(run) => {
                (run.session.clone(), remaining_seconds(run.target_end, now))
            }
            TimerState::Paused(paused) => {
                (paused.session.clone(), paused.session.remaining_seconds_snapshot)
            }
            TimerState::Finished(_) => return Ok(None),
            TimerState::Idle => {
                return Err(AppError::InvalidTransition("no session to stop".to_string()))
            }
        };
        Ok(Some(self.finish(session, LifecycleState::Interrupted, remaining, now)))
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let lead = self.reminder_lead_seconds;
        let run = match &mut self.state {
            TimerState::Running(run) => run,
            TimerState::Paused(paused) => {
                return TickOutcome {
                    remaining_seconds: Some(paused.session.remaining_seconds_snapshot),
                    ..TickOutcome::default()
                };
            }
            TimerState::Finished(session) => {
                return TickOutcome {
                    remaining_seconds: Some(session.remaining_seconds_snapshot),
                    ..TickOutcome::default()
                };
            }
            TimerState::Idle => return TickOutcome::default(),
        };

        let remaining = remaining_seconds(run.target_end, now);
        if remaining == 0 {
            return TickOutcome {
                remaining_seconds: Some(0),
                reminder: None,
                completed: self.complete(now),
            };
        }

        let mut reminder = None;
        if lead > 0 && remaining <= lead && !run.reminder_fired {
            run.reminder_fired = true;
            reminder = Some(Reminder {
                session: run.session.clone(),
                seconds_remaining: remaining,
                at: now,
            });
        }

        TickOutcome {
            remaining_seconds: Some(remaining),
            reminder,
            completed: None,
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        let TimerState::Running(run) = &self.state else {
            return None;
        };
        let session = run.session.clone();
        Some(self.finish(session, LifecycleState::Completed, 0, now))
    }

    pub fn checkpoint(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        let TimerState::Running(run) = &mut self.state else {
            return None;
        };
        let remaining = remaining_seconds(run.target_end, now);
        let accumulated = run.session.planned_seconds().saturating_sub(remaining);
        let patch = SessionPatch::checkpoint(
            LifecycleState::Running,
            remaining,
            accumulated,
            now,
            run.session.revision + 1,
        )
        .expecting(LifecycleState::Running);
        run.session.apply(&patch);
        Some(Transition {
            session: run.session.clone(),
            patch,
        })
    }

    pub fn restore(
        &mut self,
        mut session: Session,
        reconciliation: Reconciliation,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        match reconciliation {
            Reconciliation::Paused { remaining } => {
                session.remaining_seconds_snapshot = remaining;
                self.state = TimerState::Paused(PausedState {
                    session,
                    reminder_fired: false,
                });
                None
            }
            Reconciliation::Running { remaining, .. } => {
                session.remaining_seconds_snapshot = remaining;
                session.accumulated_seconds = session.planned_seconds().saturating_sub(remaining);
                self.state = TimerState::Running(RunningState {
                    session,
                    target_end: target_end(now, remaining),
                    remaining_at_resume: remaining,
                    reminder_fired: false,
                });
                None
            }
            Reconciliation::Expired { .. } => {
                self.state = TimerState::Running(RunningState {
                    session,
                    target_end: now,
                    remaining_at_resume: 0,
                    reminder_fired: true,
                });
                self.complete(now)
            }
        }
    }

    pub fn adopt_terminal(&mut self, session: Session) {
        if session.is_terminal() {
            self.state = TimerState::Finished(session);
        }
    }

    /// Moves the active session's revision up to one the store already holds, so that the next
    /// patch is not rejected as stale.
    pub fn align_revision(&mut self, session_id: &str, revision: u64) {
        let session = match &mut self.state {
            TimerState::Running(run) => &mut run.session,
            TimerState::Paused(paused) => &mut paused.session,
            TimerState::Idle | TimerState::Finished(_) => return,
        };
        if session.id == session_id && session.revision < revision {
            session.revision = revision;
        }
    }

    pub fn reset(&mut self) -> AppResult<()> {
        match &self.state {
            TimerState::Idle => Ok(()),
            TimerState::Finished(_) => {
                self.state = TimerState::Idle;
                Ok(())
            }
            TimerState::Running(_) | TimerState::Paused(_) => Err(AppError::InvalidTransition(
                "cannot reset while a session is active".to_string(),
            )),
        }
    }

    fn finish(
        &mut self,
        mut session: Session,
        state: LifecycleState,
        remaining: u64,
        now: DateTime<Utc>,
    ) -> Transition {
        let accumulated = session.planned_seconds().saturating_sub(remaining);
        let revision = session.revision + 1;
        let patch = SessionPatch::terminal(state, remaining, accumulated, now, revision);
        session.apply(&patch);
        self.state = TimerState::Finished(session.clone());
        Transition { session, patch }
    }
}
