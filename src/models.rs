use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Running,
    Paused,
    Completed,
    Interrupted,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LinkedEntity {
    Task { id: String },
    Habit { id: String },
}

impl LinkedEntity {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Task { .. } => "task",
            Self::Habit { .. } => "habit",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Task { id } | Self::Habit { id } => id,
        }
    }

    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "task" => Some(Self::Task { id }),
            "habit" => Some(Self::Habit { id }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Todo,
    InProgress,
    Completed,
}

impl EntityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Reminder,
    Completed,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reminder => "reminder",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub planned_minutes: u32,
    pub linked_entity: Option<LinkedEntity>,
    pub accumulated_seconds: u64,
    pub remaining_seconds_snapshot: u64,
    pub lifecycle_state: LifecycleState,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub interrupted: bool,
    pub revision: u64,
}

impl Session {
    pub fn new(
        id: String,
        user_id: &str,
        planned_minutes: u32,
        linked_entity: Option<LinkedEntity>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id: user_id.to_string(),
            planned_minutes,
            linked_entity,
            accumulated_seconds: 0,
            remaining_seconds_snapshot: u64::from(planned_minutes) * 60,
            lifecycle_state: LifecycleState::Running,
            started_at: now,
            last_checkpoint_at: now,
            ended_at: None,
            completed: false,
            interrupted: false,
            revision: 0,
        }
    }

    pub fn planned_seconds(&self) -> u64 {
        u64::from(self.planned_minutes) * 60
    }

    pub fn is_terminal(&self) -> bool {
        self.lifecycle_state.is_terminal()
    }

    pub fn apply(&mut self, patch: &SessionPatch) {
        if let Some(remaining) = patch.remaining_seconds_snapshot {
            self.remaining_seconds_snapshot = remaining;
        }
        if let Some(accumulated) = patch.accumulated_seconds {
            self.accumulated_seconds = self.accumulated_seconds.max(accumulated);
        }
        if let Some(state) = patch.lifecycle_state {
            self.lifecycle_state = state;
        }
        if let Some(at) = patch.last_checkpoint_at {
            self.last_checkpoint_at = at;
        }
        if let Some(at) = patch.ended_at {
            self.ended_at = Some(at);
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
        if let Some(interrupted) = patch.interrupted {
            self.interrupted = interrupted;
        }
        self.revision = patch.revision;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    pub remaining_seconds_snapshot: Option<u64>,
    pub accumulated_seconds: Option<u64>,
    pub lifecycle_state: Option<LifecycleState>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub completed: Option<bool>,
    pub interrupted: Option<bool>,
    /// The store applies the patch only while the row is still in this state.
    pub expected_state: Option<LifecycleState>,
    pub revision: u64,
}

impl SessionPatch {
    pub fn checkpoint(
        state: LifecycleState,
        remaining: u64,
        accumulated: u64,
        now: DateTime<Utc>,
        revision: u64,
    ) -> Self {
        Self {
            remaining_seconds_snapshot: Some(remaining),
            accumulated_seconds: Some(accumulated),
            lifecycle_state: Some(state),
            last_checkpoint_at: Some(now),
            revision,
            ..Self::default()
        }
    }

    pub fn expecting(mut self, state: LifecycleState) -> Self {
        self.expected_state = Some(state);
        self
    }

    pub fn terminal(
        state: LifecycleState,
        remaining: u64,
        accumulated: u64,
        now: DateTime<Utc>,
        revision: u64,
    ) -> Self {
        Self {
            remaining_seconds_snapshot: Some(remaining),
            accumulated_seconds: Some(accumulated),
            lifecycle_state: Some(state),
            last_checkpoint_at: Some(now),
            ended_at: Some(now),
            completed: Some(state == LifecycleState::Completed),
            interrupted: Some(state == LifecycleState::Interrupted),
            expected_state: None,
            revision,
        }
    }

    /// Whether `row`, as returned by the store, carries this patch rather than a competing write.
    pub fn is_reflected_in(&self, row: &Session) -> bool {
        row.revision == self.revision
            && self.lifecycle_state.map(|state| state == row.lifecycle_state).unwrap_or(true)
            && self.last_checkpoint_at.map(|at| at == row.last_checkpoint_at).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimerPhase {
    Idle,
    Running,
    Paused,
    Completed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub phase: TimerPhase,
    pub remaining_seconds: Option<u64>,
    pub target_end_at: Option<DateTime<Utc>>,
    pub session: Option<Session>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionPayload {
    pub planned_minutes: u32,
    pub linked_entity: Option<LinkedEntity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub status: EntityStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub kind: NotificationKind,
    pub session_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsFilters {
    pub user_id: Option<String>,
    pub lifecycle_state: Option<LifecycleState>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimerSettings {
    pub user_id: String,
    pub tick_interval_ms: u64,
    pub checkpoint_interval_ms: u64,
    pub reminder_lead_seconds: u64,
    pub durable_write_max_attempts: u32,
    pub durable_write_backoff_ms: u64,
    pub durable_write_max_backoff_ms: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            user_id: "local".to_string(),
            tick_interval_ms: 100,
            checkpoint_interval_ms: 5_000,
            reminder_lead_seconds: 60,
            durable_write_max_attempts: 5,
            durable_write_backoff_ms: 200,
            durable_write_max_backoff_ms: 5_000,
        }
    }
}
