use crate::checkpoint::{write_durable, CheckpointWriter, RetryPolicy};
use crate::clock::{Clock, SystemClock};
use crate::dispatcher::SideEffectDispatcher;
use crate::errors::{AppError, AppResult};
use crate::machine::{SessionMachine, TickOutcome, Transition};
use crate::models::{
    LifecycleState, Session, StartSessionPayload, TimerPhase, TimerSettings, TimerSnapshot,
};
use crate::recovery::{reconcile, Reconciliation, RecoveryOutcome};
use crate::store::SessionStore;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use uuid::Uuid;

struct TimerLoops {
    session_id: String,
    stop: watch::Sender<bool>,
}

impl TimerLoops {
    fn shutdown(self) {
        let _ = self.stop.send(true);
        tracing::debug!(session_id = %self.session_id, "timer loops stopped");
    }
}

pub struct FocusController {
    this: Weak<FocusController>,
    store: Arc<dyn SessionStore>,
    checkpoints: CheckpointWriter,
    dispatcher: SideEffectDispatcher,
    clock: Arc<dyn Clock>,
    settings: TimerSettings,
    retry: RetryPolicy,
    machine: Mutex<SessionMachine>,
    loops: Mutex<Option<TimerLoops>>,
    pending: Mutex<Option<JoinHandle<AppResult<Session>>>>,
    drive_loops: bool,
}

impl FocusController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        dispatcher: SideEffectDispatcher,
        settings: TimerSettings,
    ) -> Arc<Self> {
        Self::with_clock(store, dispatcher, settings, Arc::new(SystemClock), true)
    }

    pub fn with_clock(
        store: Arc<dyn SessionStore>,
        dispatcher: SideEffectDispatcher,
        settings: TimerSettings,
        clock: Arc<dyn Clock>,
        drive_loops: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            checkpoints: CheckpointWriter::new(store.clone()),
            store,
            dispatcher,
            clock,
            retry: RetryPolicy::from_settings(&settings),
            machine: Mutex::new(SessionMachine::new(settings.reminder_lead_seconds)),
            settings,
            loops: Mutex::new(None),
            pending: Mutex::new(None),
            drive_loops,
        })
    }

    pub fn settings(&self) -> &TimerSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> AppResult<TimerSnapshot> {
        let now = self.clock.now();
        Ok(self.machine()?.snapshot(now))
    }

    pub fn is_driving(&self) -> bool {
        self.loops_guard().is_some()
    }

    pub async fn start(&self, payload: StartSessionPayload) -> AppResult<Session> {
        if payload.planned_minutes == 0 {
            return Err(AppError::Validation("plannedMinutes must be positive".to_string()));
        }
        if let Some(entity) = &payload.linked_entity {
            if entity.id().trim().is_empty() {
                return Err(AppError::Validation(format!("{} id must not be empty", entity.kind())));
            }
        }

        {
            let mut machine = self.machine()?;
            if machine.is_active() {
                return Err(AppError::Conflict(
                    "a focus session is already active; resume or stop it first".to_string(),
                ));
            }
            machine.reset()?;
        }

        if let Some(active) = self.store.find_active_for_user(&self.settings.user_id)? {
            return Err(AppError::Conflict(format!(
                "session {} is still {}; resume or stop it first",
                active.id,
                active.lifecycle_state.as_str()
            )));
        }

        let now = self.clock.now();
        let session = Session::new(
            Uuid::new_v4().to_string(),
            &self.settings.user_id,
            payload.planned_minutes,
            payload.linked_entity,
            now,
        );
        let created = self.store.create(&session)?;
        self.machine()?.begin(created.clone(), now)?;

        tracing::info!(
            session_id = %created.id,
            planned_minutes = created.planned_minutes,
            linked_kind = created.linked_entity.as_ref().map(|entity| entity.kind()),
            "focus session started"
        );
        self.dispatcher.session_started(&created);
        self.arm_loops(&created.id);
        Ok(created)
    }

    pub async fn pause(&self) -> AppResult<TimerSnapshot> {
        let now = self.clock.now();
        let transition = self.machine()?.pause(now)?;
        let Some(transition) = transition else {
            tracing::debug!("pause ignored; session is not running");
            return self.snapshot();
        };

        self.disarm_loops();
        tracing::info!(
            session_id = %transition.session.id,
            remaining = transition.session.remaining_seconds_snapshot,
            "focus session paused"
        );
        self.persist_toggle(&transition).await?;
        self.snapshot()
    }

    pub async fn resume(&self) -> AppResult<TimerSnapshot> {
        let now = self.clock.now();
        let transition = self.machine()?.resume(now)?;
        let Some(transition) = transition else {
            tracing::debug!("resume ignored; session is not paused");
            return self.snapshot();
        };

        self.arm_loops(&transition.session.id);
        tracing::info!(
            session_id = %transition.session.id,
            remaining = transition.session.remaining_seconds_snapshot,
            "focus session resumed"
        );
        self.persist_toggle(&transition).await?;
        self.snapshot()
    }

    /// Interrupts the session. The write gets one immediate attempt; if the store is unavailable
    /// the retries continue in the background (see [`FocusController::flush`]) and the local
    /// terminal session is returned right away.
    pub async fn stop(&self) -> AppResult<Session> {
        let now = self.clock.now();
        let transition = self.machine()?.stop(now)?;
        self.disarm_loops();
        let Some(transition) = transition else {
            let finished = self.machine()?.session().cloned();
            return finished
                .ok_or_else(|| AppError::InvalidTransition("no session to stop".to_string()));
        };

        let single_attempt = RetryPolicy {
            max_attempts: 1,
            ..self.retry
        };
        match self.record_terminal(&transition, single_attempt).await {
            Ok(stored) => Ok(stored),
            Err(AppError::Persistence(error)) => {
                let Some(this) = self.this.upgrade() else {
                    return self.finalize(transition).await;
                };
                tracing::warn!(
                    session_id = %transition.session.id,
                    error = %error,
                    "stop not saved yet; retrying in the background"
                );
                let session = transition.session.clone();
                Self::finalize_in_background(this, transition);
                Ok(session)
            }
            Err(error) => {
                self.dispatch_terminal(&transition.session);
                Err(error)
            }
        }
    }

    /// Waits for a terminal write still retrying in the background.
    pub async fn flush(&self) -> AppResult<()> {
        let pending = self.pending_guard().take();
        let Some(pending) = pending else {
            return Ok(());
        };
        pending
            .await
            .map_err(|error| {
                AppError::Internal(format!("background session write panicked: {error}"))
            })?
            .map(|_| ())
    }

    pub fn reset(&self) -> AppResult<()> {
        self.machine()?.reset()
    }

    pub async fn tick(&self) -> AppResult<TickOutcome> {
        let now = self.clock.now();
        let outcome = self.machine()?.tick(now);

        if let Some(reminder) = &outcome.reminder {
            self.dispatcher
                .reminder_due(&reminder.session, reminder.seconds_remaining, reminder.at);
        }
        if let Some(transition) = outcome.completed.clone() {
            self.disarm_loops();
            self.finalize(transition).await?;
        }
        Ok(outcome)
    }

    pub async fn checkpoint(&self) -> AppResult<Option<Session>> {
        let now = self.clock.now();
        let transition = self.machine()?.checkpoint(now);
        let Some(transition) = transition else {
            return Ok(None);
        };
        let Some(stored) = self.checkpoints.write(&transition.session.id, &transition.patch) else {
            return Ok(None);
        };
        if !transition.patch.is_reflected_in(&stored) {
            self.resync(stored.clone()).await?;
        }
        Ok(Some(stored))
    }

    pub async fn recover(&self) -> AppResult<RecoveryOutcome> {
        self.disarm_loops();
        let Some(session) = self.store.find_active_for_user(&self.settings.user_id)? else {
            *self.machine()? = SessionMachine::new(self.settings.reminder_lead_seconds);
            tracing::info!(user_id = %self.settings.user_id, "no active focus session to recover");
            return Ok(RecoveryOutcome::Idle);
        };
        let outcome = self.enter(session).await?;
        match &outcome {
            RecoveryOutcome::Running {
                session,
                remaining_seconds,
                drift_seconds,
            } => tracing::info!(
                session_id = %session.id,
                remaining = remaining_seconds,
                drift = drift_seconds,
                "recovered running focus session"
            ),
            RecoveryOutcome::Paused { session } => tracing::info!(
                session_id = %session.id,
                remaining = session.remaining_seconds_snapshot,
                "recovered paused focus session"
            ),
            RecoveryOutcome::CompletedWhileAway { session, stale } => tracing::info!(
                session_id = %session.id,
                stale,
                "focus session completed while the timer was not running"
            ),
            RecoveryOutcome::Idle => {}
        }
        Ok(outcome)
    }

    async fn enter(&self, session: Session) -> AppResult<RecoveryOutcome> {
        let now = self.clock.now();
        let reconciliation = reconcile(&session, now)?;
        let (completion, restored) = {
            let mut machine = self.machine()?;
            let completion = machine.restore(session, reconciliation, now);
            (completion, machine.session().cloned())
        };
        let restored =
            restored.ok_or_else(|| AppError::Internal("restored session missing".to_string()))?;

        match reconciliation {
            Reconciliation::Paused { .. } => {
                self.disarm_loops();
                Ok(RecoveryOutcome::Paused { session: restored })
            }
            Reconciliation::Running {
                remaining,
                drift_seconds,
            } => {
                self.arm_loops(&restored.id);
                Ok(RecoveryOutcome::Running {
                    session: restored,
                    remaining_seconds: remaining,
                    drift_seconds,
                })
            }
            Reconciliation::Expired { overdue_seconds, stale } => {
                if stale {
                    tracing::warn!(
                        session_id = %restored.id,
                        overdue_seconds,
                        "stale recovery data; completing session"
                    );
                }
                self.disarm_loops();
                let transition = completion.ok_or_else(|| {
                    AppError::Internal("expired session did not complete".to_string())
                })?;
                let session = self.finalize(transition).await?;
                Ok(RecoveryOutcome::CompletedWhileAway { session, stale })
            }
        }
    }

    async fn resync(&self, stored: Session) -> AppResult<()> {
        {
            let mut machine = self.machine()?;
            let local = machine.session();
            let diverged = local
                .map(|local| {
                    local.id != stored.id || local.lifecycle_state != stored.lifecycle_state
                })
                .unwrap_or(true);
            if !diverged {
                machine.align_revision(&stored.id, stored.revision);
                return Ok(());
            }
            tracing::info!(
                session_id = %stored.id,
                state = stored.lifecycle_state.as_str(),
                "session changed outside this process; re-syncing"
            );
            if stored.is_terminal() {
                machine.adopt_terminal(stored);
                drop(machine);
                self.disarm_loops();
                return Ok(());
            }
        }
        self.enter(stored).await.map(|_| ())
    }

    async fn persist_toggle(&self, transition: &Transition) -> AppResult<Session> {
        let session_id = &transition.session.id;
        let mut patch = transition.patch.clone();
        let mut stored = write_durable(&self.store, session_id, &patch, self.retry).await?;

        if !patch.is_reflected_in(&stored) && !stored.is_terminal() && stored.id == *session_id {
            // The row missed an earlier toggle or holds a newer revision; the local phase wins
            // as long as nobody finished the session.
            patch.revision = stored.revision + 1;
            patch.expected_state = Some(stored.lifecycle_state);
            stored = write_durable(&self.store, session_id, &patch, self.retry).await?;
        }

        if patch.is_reflected_in(&stored) {
            self.machine()?.align_revision(session_id, stored.revision);
            return Ok(stored);
        }
        self.resync(stored.clone()).await?;
        Err(AppError::Conflict(format!(
            "session {} was changed elsewhere and is now {}",
            stored.id,
            stored.lifecycle_state.as_str()
        )))
    }

    /// Records a terminal transition and dispatches its side effects exactly once. If every
    /// write attempt fails the side effects still go out and the persistence error is returned.
    async fn finalize(&self, transition: Transition) -> AppResult<Session> {
        match self.record_terminal(&transition, self.retry).await {
            Ok(stored) => Ok(stored),
            Err(error) => {
                self.dispatch_terminal(&transition.session);
                Err(error)
            }
        }
    }

    fn finalize_in_background(this: Arc<Self>, transition: Transition) {
        let controller = this.clone();
        let handle = tokio::spawn(async move {
            let session = transition.session.clone();
            let result = controller.finalize(transition).await;
            if let Err(error) = &result {
                controller.dispatcher.persistence_failed(&session, &error.to_string());
            }
            result
        });
        *this.pending_guard() = Some(handle);
    }

    async fn record_terminal(
        &self,
        transition: &Transition,
        policy: RetryPolicy,
    ) -> AppResult<Session> {
        let session_id = &transition.session.id;
        let mut patch = transition.patch.clone();
        let mut stored = write_durable(&self.store, session_id, &patch, policy).await?;

        if !patch.is_reflected_in(&stored) && !stored.is_terminal() {
            // A newer non-terminal write from elsewhere; the terminal transition still wins.
            patch.revision = stored.revision + 1;
            stored = write_durable(&self.store, session_id, &patch, policy).await?;
        }

        let applied = patch.is_reflected_in(&stored);
        self.machine()?.adopt_terminal(stored.clone());
        if applied {
            self.dispatch_terminal(&stored);
        } else {
            tracing::warn!(
                session_id = %stored.id,
                state = stored.lifecycle_state.as_str(),
                "session was already finalized elsewhere; skipping side effects"
            );
        }
        Ok(stored)
    }

    fn dispatch_terminal(&self, session: &Session) {
        match session.lifecycle_state {
            LifecycleState::Completed => self.dispatcher.session_completed(session),
            LifecycleState::Interrupted => self.dispatcher.session_interrupted(session),
            LifecycleState::Running | LifecycleState::Paused => {}
        }
    }

    fn arm_loops(&self, session_id: &str) {
        if !self.drive_loops {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let mut loops = self.loops_guard();
        if loops
            .as_ref()
            .map(|current| current.session_id == session_id && !*current.stop.borrow())
            .unwrap_or(false)
        {
            return;
        }
        if let Some(previous) = loops.take() {
            previous.shutdown();
        }

        let (stop, stop_rx) = watch::channel(false);
        let tick_every = Duration::from_millis(self.settings.tick_interval_ms.max(1));
        let checkpoint_every = Duration::from_millis(self.settings.checkpoint_interval_ms.max(1));
        tokio::spawn(run_tick_loop(Arc::downgrade(&this), stop_rx.clone(), tick_every));
        tokio::spawn(run_checkpoint_loop(Arc::downgrade(&this), stop_rx, checkpoint_every));

        tracing::debug!(session_id = %session_id, "timer loops started");
        *loops = Some(TimerLoops {
            session_id: session_id.to_string(),
            stop,
        });
    }

    fn disarm_loops(&self) {
        if let Some(loops) = self.loops_guard().take() {
            loops.shutdown();
        }
    }

    fn machine(&self) -> AppResult<MutexGuard<'_, SessionMachine>> {
        self.machine
            .lock()
            .map_err(|_| AppError::Internal("session machine mutex poisoned".to_string()))
    }

    fn loops_guard(&self) -> MutexGuard<'_, Option<TimerLoops>> {
        self.loops.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending_guard(&self) -> MutexGuard<'_, Option<JoinHandle<AppResult<Session>>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> AppResult<TimerPhase> {
        Ok(self.machine()?.phase())
    }
}

async fn run_tick_loop(
    controller: Weak<FocusController>,
    mut stop: watch::Receiver<bool>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }
        let Some(controller) = controller.upgrade() else {
            break;
        };
        if let Err(error) = controller.tick().await {
            tracing::warn!(error = %error, "focus tick failed");
        }
    }
}

async fn run_checkpoint_loop(
    controller: Weak<FocusController>,
    mut stop: watch::Receiver<bool>,
    period: Duration,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }
        let Some(controller) = controller.upgrade() else {
            break;
        };
        if let Err(error) = controller.checkpoint().await {
            tracing::warn!(error = %error, "focus checkpoint failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FocusController;
    use crate::checkpoint::testing::FlakyStore;
    use crate::clock::ManualClock;
    use crate::dispatcher::testing::Recorder;
    use crate::dispatcher::SideEffectDispatcher;
    use crate::errors::AppError;
    use crate::models::{
        EntityStatus, LifecycleState, LinkedEntity, NotificationKind, StartSessionPayload,
        TimerPhase, TimerSettings,
    };
    use crate::recovery::RecoveryOutcome;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Arc;

    struct Harness {
        store: Arc<FlakyStore>,
        recorder: Arc<Recorder>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(FlakyStore::default()),
                recorder: Arc::new(Recorder::default()),
                clock: Arc::new(ManualClock::new(t0())),
            }
        }

        fn controller(&self, settings: TimerSettings) -> Arc<FocusController> {
            self.build(settings, false)
        }

        fn build(&self, settings: TimerSettings, drive_loops: bool) -> Arc<FocusController> {
            let dispatcher = SideEffectDispatcher::new(self.recorder.clone(), self.recorder.clone())
                .with_listener(self.recorder.clone());
            let clock = self.clock.clone();
            let store = self.store.clone();
            FocusController::with_clock(store, dispatcher, settings, clock, drive_loops)
        }

        fn at(&self, seconds: i64) {
            self.clock.set(t0() + Duration::seconds(seconds));
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 10, 0, 0).unwrap()
    }

    fn settings() -> TimerSettings {
        TimerSettings {
            reminder_lead_seconds: 60,
            durable_write_backoff_ms: 1,
            durable_write_max_backoff_ms: 2,
            durable_write_max_attempts: 3,
            ..TimerSettings::default()
        }
    }

    fn task(id: &str) -> Option<LinkedEntity> {
        Some(LinkedEntity::Task { id: id.to_string() })
    }

    fn payload(minutes: u32, linked_entity: Option<LinkedEntity>) -> StartSessionPayload {
        StartSessionPayload {
            planned_minutes: minutes,
            linked_entity,
        }
    }

    #[tokio::test]
    async fn full_session_with_pause_completes_and_updates_task() {
        let harness = Harness::new();
        let controller = harness.controller(settings());

        let session = controller.start(payload(25, task("task-1"))).await.expect("start");
        assert_eq!(
            harness.recorder.statuses(),
            vec![("task-1".to_string(), EntityStatus::InProgress)]
        );

        harness.at(300);
        let paused = controller.pause().await.expect("pause");
        let paused_session = paused.session.expect("session");
        assert_eq!(paused_session.accumulated_seconds, 300);
        assert_eq!(paused_session.remaining_seconds_snapshot, 1200);
        let row = harness.store.row(&session.id).expect("row");
        assert_eq!(row.lifecycle_state, LifecycleState::Paused);

        harness.at(600);
        let resumed = controller.resume().await.expect("resume");
        assert_eq!(resumed.target_end_at, Some(t0() + Duration::seconds(1800)));

        harness.at(1740);
        let outcome = controller.tick().await.expect("tick");
        assert_eq!(outcome.reminder.map(|reminder| reminder.seconds_remaining), Some(60));

        harness.at(1800);
        let outcome = controller.tick().await.expect("tick");
        let completed = outcome.completed.expect("completed").session;
        assert_eq!(completed.accumulated_seconds, 1500);

        let row = harness.store.row(&session.id).expect("row");
        assert_eq!(row.lifecycle_state, LifecycleState::Completed);
        assert!(row.completed && !row.interrupted);
        assert_eq!(row.accumulated_seconds, 1500);
        assert_eq!(
            harness.recorder.statuses(),
            vec![
                ("task-1".to_string(), EntityStatus::InProgress),
                ("task-1".to_string(), EntityStatus::Completed),
            ]
        );
        assert_eq!(
            harness.recorder.notification_kinds(),
            vec![NotificationKind::Reminder, NotificationKind::Completed]
        );
        assert_eq!(
            harness.recorder.events(),
            vec!["reminder:60".to_string(), format!("completed:{}", session.id)]
        );
    }

    #[tokio::test]
    async fn stop_while_running_interrupts_and_reverts_task() {
        let harness = Harness::new();
        let controller = harness.controller(settings());
        let session = controller.start(payload(10, task("task-2"))).await.expect("start");

        harness.at(240);
        let stopped = controller.stop().await.expect("stop");
        assert_eq!(stopped.accumulated_seconds, 240);
        assert_eq!(stopped.lifecycle_state, LifecycleState::Interrupted);
        assert!(stopped.interrupted && !stopped.completed);
        assert_eq!(
            harness.recorder.statuses().last(),
            Some(&("task-2".to_string(), EntityStatus::Todo))
        );
        assert_eq!(harness.recorder.events(), vec![format!("interrupted:{}", session.id)]);
        assert!(harness.recorder.notification_kinds().is_empty());
    }

    #[tokio::test]
    async fn second_start_conflicts_with_active_session() {
        let harness = Harness::new();
        let controller = harness.controller(settings());
        controller.start(payload(25, None)).await.expect("start");

        let error = controller.start(payload(5, None)).await.expect_err("conflict");
        assert!(matches!(error, AppError::Conflict(_)));

        let other_process = harness.controller(settings());
        let error = other_process.start(payload(5, None)).await.expect_err("conflict");
        assert!(matches!(error, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn zero_minute_sessions_are_rejected() {
        let harness = Harness::new();
        let controller = harness.controller(settings());
        let error = controller.start(payload(0, None)).await.expect_err("invalid");
        assert!(matches!(error, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn stop_racing_completion_dispatches_one_terminal_event() {
        let harness = Harness::new();
        let controller = harness.controller(settings());
        let session = controller.start(payload(1, task("task-3"))).await.expect("start");

        harness.at(60);
        let (stopped, ticked) = tokio::join!(controller.stop(), controller.tick());
        stopped.expect("stop");
        ticked.expect("tick");

        let terminal_events: Vec<String> = harness
            .recorder
            .events()
            .into_iter()
            .filter(|event| event.starts_with("completed") || event.starts_with("interrupted"))
            .collect();
        assert_eq!(terminal_events.len(), 1, "events: {terminal_events:?}");
        let row = harness.store.row(&session.id).expect("row");
        assert!(row.completed ^ row.interrupted);
    }

    #[tokio::test]
    async fn stop_reports_exhausted_writes_after_moving_locally() {
        let harness = Harness::new();
        let controller = harness.controller(settings());
        let session = controller.start(payload(10, task("task-4"))).await.expect("start");

        harness.at(120);
        harness.store.fail_next(50);
        let stopped = controller.stop().await.expect("stop");
        assert_eq!(stopped.lifecycle_state, LifecycleState::Interrupted);
        assert_eq!(stopped.accumulated_seconds, 120);
        assert_eq!(controller.phase().expect("phase"), TimerPhase::Interrupted);

        let error = controller.flush().await.expect_err("persistence failure");
        assert!(matches!(error, AppError::Persistence(_)));
        assert_eq!(
            harness.recorder.statuses().last(),
            Some(&("task-4".to_string(), EntityStatus::Todo))
        );
        assert_eq!(
            harness.recorder.events(),
            vec![format!("interrupted:{}", session.id), format!("unsaved:{}", session.id)]
        );
        let row = harness.store.row(&session.id).expect("row");
        assert_eq!(row.lifecycle_state, LifecycleState::Running);
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_write_backoff() {
        let harness = Harness::new();
        let controller = harness.controller(TimerSettings {
            durable_write_backoff_ms: 60_000,
            durable_write_max_backoff_ms: 60_000,
            ..settings()
        });
        controller.start(payload(10, None)).await.expect("start");

        harness.at(45);
        harness.store.fail_next(3);
        let stopped = tokio::time::timeout(std::time::Duration::from_secs(2), controller.stop())
            .await
            .expect("stop returned promptly")
            .expect("stop");
        assert_eq!(stopped.accumulated_seconds, 45);
        assert_eq!(controller.phase().expect("phase"), TimerPhase::Interrupted);
        assert!(harness.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn stop_written_in_background_dispatches_once() {
        let harness = Harness::new();
        let controller = harness.controller(settings());
        let session = controller.start(payload(10, task("task-6"))).await.expect("start");

        harness.at(200);
        harness.store.fail_next(2);
        controller.stop().await.expect("stop");
        controller.flush().await.expect("flush");
        controller.flush().await.expect("nothing pending");

        let row = harness.store.row(&session.id).expect("row");
        assert_eq!(row.lifecycle_state, LifecycleState::Interrupted);
        assert_eq!(row.accumulated_seconds, 200);
        assert_eq!(harness.recorder.events(), vec![format!("interrupted:{}", session.id)]);
    }

    #[tokio::test]
    async fn resume_after_unsaved_pause_is_persisted() {
        let harness = Harness::new();
        let controller = harness.controller(TimerSettings {
            durable_write_max_attempts: 2,
            ..settings()
        });
        let session = controller.start(payload(25, None)).await.expect("start");

        harness.at(300);
        harness.store.fail_next(2);
        let error = controller.pause().await.expect_err("pause not saved");
        assert!(matches!(error, AppError::Persistence(_)));
        assert_eq!(controller.phase().expect("phase"), TimerPhase::Paused);

        harness.at(400);
        let resumed = controller.resume().await.expect("resume");
        assert_eq!(resumed.phase, TimerPhase::Running);
        assert_eq!(resumed.target_end_at, Some(t0() + Duration::seconds(1600)));

        let row = harness.store.row(&session.id).expect("row");
        assert_eq!(row.lifecycle_state, LifecycleState::Running);
        assert_eq!(row.remaining_seconds_snapshot, 1200);
        assert_eq!(row.accumulated_seconds, 300);
        assert_eq!(row.last_checkpoint_at, t0() + Duration::seconds(400));

        harness.at(410);
        let stored = controller.checkpoint().await.expect("checkpoint").expect("written");
        assert_eq!(stored.last_checkpoint_at, t0() + Duration::seconds(410));
        assert_eq!(stored.remaining_seconds_snapshot, 1190);
    }

    #[tokio::test]
    async fn checkpoint_catches_up_with_a_newer_revision() {
        let harness = Harness::new();
        let controller = harness.controller(settings());
        let session = controller.start(payload(25, None)).await.expect("start");

        harness.at(60);
        let other = harness.controller(settings());
        other.recover().await.expect("recover");
        other.checkpoint().await.expect("checkpoint").expect("written");
        other.checkpoint().await.expect("checkpoint").expect("written");

        harness.at(70);
        let rejected = controller.checkpoint().await.expect("checkpoint").expect("row");
        assert_eq!(rejected.last_checkpoint_at, t0() + Duration::seconds(60));

        harness.at(80);
        let stored = controller.checkpoint().await.expect("checkpoint").expect("written");
        assert_eq!(stored.last_checkpoint_at, t0() + Duration::seconds(80));
        assert_eq!(harness.store.row(&session.id).expect("row").remaining_seconds_snapshot, 1420);
    }

    #[tokio::test]
    async fn failed_checkpoint_is_retried_on_next_interval() {
        let harness = Harness::new();
        let controller = harness.controller(settings());
        let session = controller.start(payload(25, None)).await.expect("start");

        harness.at(5);
        harness.store.fail_next(1);
        assert!(controller.checkpoint().await.expect("checkpoint").is_none());

        harness.at(10);
        let stored = controller.checkpoint().await.expect("checkpoint").expect("written");
        assert_eq!(stored.remaining_seconds_snapshot, 1490);
        assert_eq!(stored.last_checkpoint_at, t0() + Duration::seconds(10));
        assert_eq!(harness.store.row(&session.id).expect("row").accumulated_seconds, 10);
    }

    #[tokio::test]
    async fn checkpoint_then_restart_recovers_advanced_countdown() {
        let harness = Harness::new();
        let first = harness.controller(settings());
        first.start(payload(25, None)).await.expect("start");

        harness.at(600);
        first.checkpoint().await.expect("checkpoint").expect("written");
        drop(first);

        let gap = 7;
        harness.at(600 + gap);
        let second = harness.controller(settings());
        match second.recover().await.expect("recover") {
            RecoveryOutcome::Running { remaining_seconds, .. } => {
                assert!(remaining_seconds <= 900);
                assert!(remaining_seconds >= 900 - gap as u64);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(second.phase().expect("phase"), TimerPhase::Running);
    }

    #[tokio::test]
    async fn recovering_twice_yields_the_same_state() {
        let harness = Harness::new();
        let first = harness.controller(settings());
        first.start(payload(25, None)).await.expect("start");
        harness.at(300);
        first.checkpoint().await.expect("checkpoint");

        harness.at(333);
        let second = harness.controller(settings());
        let once = second.recover().await.expect("first recovery");
        let snapshot_once = second.snapshot().expect("snapshot");
        let twice = second.recover().await.expect("second recovery");
        let snapshot_twice = second.snapshot().expect("snapshot");
        assert_eq!(once, twice);
        assert_eq!(snapshot_once, snapshot_twice);
    }

    #[tokio::test]
    async fn paused_session_is_restored_verbatim() {
        let harness = Harness::new();
        let first = harness.controller(settings());
        first.start(payload(25, None)).await.expect("start");
        harness.at(300);
        first.pause().await.expect("pause");

        harness.at(86_400);
        let second = harness.controller(settings());
        match second.recover().await.expect("recover") {
            RecoveryOutcome::Paused { session } => {
                assert_eq!(session.remaining_seconds_snapshot, 1200)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(second.snapshot().expect("snapshot").remaining_seconds, Some(1200));
    }

    #[tokio::test]
    async fn session_that_expired_while_away_completes_once() {
        let harness = Harness::new();
        let first = harness.controller(settings());
        let session = first.start(payload(25, task("task-5"))).await.expect("start");
        drop(first);

        harness.at(4 * 3600);
        let second = harness.controller(settings());
        match second.recover().await.expect("recover") {
            RecoveryOutcome::CompletedWhileAway { session: done, stale } => {
                assert_eq!(done.id, session.id);
                assert_eq!(done.accumulated_seconds, 1500);
                assert!(stale);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(second.recover().await.expect("again"), RecoveryOutcome::Idle);
        assert_eq!(harness.recorder.events(), vec![format!("completed:{}", session.id)]);
    }

    #[tokio::test]
    async fn checkpoint_notices_pause_written_by_another_process() {
        let harness = Harness::new();
        let driver = harness.controller(settings());
        driver.start(payload(25, None)).await.expect("start");

        harness.at(100);
        let other = harness.controller(settings());
        other.recover().await.expect("recover");
        other.pause().await.expect("pause elsewhere");

        harness.at(105);
        driver.checkpoint().await.expect("checkpoint");
        assert_eq!(driver.phase().expect("phase"), TimerPhase::Paused);
        assert_eq!(driver.snapshot().expect("snapshot").remaining_seconds, Some(1400));
    }

    #[tokio::test]
    async fn start_after_finish_resets_implicitly() {
        let harness = Harness::new();
        let controller = harness.controller(settings());
        controller.start(payload(5, None)).await.expect("start");
        harness.at(30);
        controller.stop().await.expect("stop");

        harness.at(40);
        let next = controller.start(payload(5, None)).await.expect("second start");
        assert_eq!(next.lifecycle_state, LifecycleState::Running);
        assert_eq!(controller.phase().expect("phase"), TimerPhase::Running);
    }

    #[tokio::test]
    async fn reset_clears_a_finished_session_only() {
        let harness = Harness::new();
        let controller = harness.controller(settings());
        controller.start(payload(5, None)).await.expect("start");
        assert!(matches!(controller.reset(), Err(AppError::InvalidTransition(_))));

        harness.at(30);
        controller.stop().await.expect("stop");
        controller.reset().expect("reset");
        let snapshot = controller.snapshot().expect("snapshot");
        assert_eq!(snapshot.phase, TimerPhase::Idle);
        assert!(snapshot.session.is_none());
    }

    #[tokio::test]
    async fn background_loops_complete_the_session() {
        let harness = Harness::new();
        let controller = harness.build(
            TimerSettings {
                tick_interval_ms: 5,
                checkpoint_interval_ms: 10,
                reminder_lead_seconds: 0,
                ..settings()
            },
            true,
        );
        let session = controller.start(payload(1, None)).await.expect("start");
        assert!(controller.is_driving());

        harness.at(61);
        for _ in 0..200 {
            if controller.phase().expect("phase") == TimerPhase::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert_eq!(controller.phase().expect("phase"), TimerPhase::Completed);
        assert!(!controller.is_driving());
        let row = harness.store.row(&session.id).expect("row");
        assert_eq!(row.lifecycle_state, LifecycleState::Completed);
        assert_eq!(harness.recorder.events(), vec![format!("completed:{}", session.id)]);
    }
}
