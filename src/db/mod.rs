use crate::dispatcher::{EntityStatusSink, NotificationSink};
use crate::errors::{AppError, AppResult};
use crate::models::{
    EntityRecord, EntityStatus, LifecycleState, LinkedEntity, ListSessionsFilters, NotificationKind,
    NotificationRecord, Session, SessionPatch, TimerSettings,
};
use crate::store::SessionStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const SESSION_COLUMNS: &str = "id, user_id, planned_minutes, linked_kind, linked_id, accumulated_seconds, \
     remaining_seconds_snapshot, lifecycle_state, started_at, last_checkpoint_at, ended_at, completed, interrupted, revision";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn get_session(&self, id: &str) -> AppResult<Option<Session>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM focus_sessions WHERE id = ?1"),
                [id],
                parse_session_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn list_sessions(&self, filters: &ListSessionsFilters) -> AppResult<Vec<Session>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut query = format!("SELECT {SESSION_COLUMNS} FROM focus_sessions WHERE 1 = 1");
        let mut params_vec: Vec<String> = Vec::new();

        if let Some(user_id) = &filters.user_id {
            query.push_str(" AND user_id = ?");
            params_vec.push(user_id.clone());
        }
        if let Some(state) = filters.lifecycle_state {
            query.push_str(" AND lifecycle_state = ?");
            params_vec.push(state.as_str().to_string());
        }
        query.push_str(" ORDER BY started_at DESC LIMIT ?");
        let limit = i64::from(filters.limit.unwrap_or(50));

        let mut statement = conn.prepare(&query)?;
        let mut dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        dyn_params.push(&limit);

        let rows = statement.query_map(rusqlite::params_from_iter(dyn_params), parse_session_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn create_task(&self, title: &str) -> AppResult<EntityRecord> {
        self.create_entity("task", title)
    }

    pub fn create_habit(&self, title: &str) -> AppResult<EntityRecord> {
        self.create_entity("habit", title)
    }

    pub fn list_tasks(&self) -> AppResult<Vec<EntityRecord>> {
        self.list_entities("task")
    }

    pub fn list_habits(&self) -> AppResult<Vec<EntityRecord>> {
        self.list_entities("habit")
    }

    pub fn entity_status(&self, entity: &LinkedEntity) -> AppResult<Option<EntityStatus>> {
        let table = entity_table(entity.kind())?;
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let raw = conn
            .query_row(
                &format!("SELECT status FROM {table} WHERE id = ?1"),
                [entity.id()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|raw| parse_entity_status(&raw).map_err(AppError::from)).transpose()
    }

    pub fn list_notifications(&self, limit: u32) -> AppResult<Vec<NotificationRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut statement = conn.prepare(
            "SELECT id, kind, session_id, payload_json, created_at
             FROM notifications
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = statement.query_map([i64::from(limit)], parse_notification_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn get_timer_settings(&self) -> AppResult<TimerSettings> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'timer'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<TimerSettings>(&raw).unwrap_or_default()),
            None => Ok(TimerSettings::default()),
        }
    }

    pub fn update_timer_settings(&self, update: serde_json::Value) -> AppResult<TimerSettings> {
        let current = self.get_timer_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: TimerSettings = serde_json::from_value(merged)
            .map_err(|error| AppError::Validation(format!("invalid timer settings: {error}")))?;
        if settings.user_id.trim().is_empty() {
            return Err(AppError::Validation("userId must not be empty".to_string()));
        }
        if settings.tick_interval_ms == 0 || settings.checkpoint_interval_ms == 0 {
            return Err(AppError::Validation("timer intervals must be positive".to_string()));
        }

        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('timer', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = 'timer'", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('timer', ?1, ?2)",
                params![
                    serde_json::to_string(&TimerSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }

    fn create_entity(&self, kind: &str, title: &str) -> AppResult<EntityRecord> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::Validation(format!("{kind} title must not be empty")));
        }
        let table = entity_table(kind)?;
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            &format!("INSERT INTO {table} (id, title, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)"),
            params![id, title, EntityStatus::Todo.as_str(), now.to_rfc3339()],
        )?;

        Ok(EntityRecord {
            id,
            kind: kind.to_string(),
            title: title.to_string(),
            status: EntityStatus::Todo,
            created_at: now,
            updated_at: now,
        })
    }

    fn list_entities(&self, kind: &str) -> AppResult<Vec<EntityRecord>> {
        let table = entity_table(kind)?;
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut statement = conn.prepare(&format!(
            "SELECT id, title, status, created_at, updated_at FROM {table} ORDER BY created_at ASC"
        ))?;
        let rows = statement.query_map([], |row| {
            Ok(EntityRecord {
                id: row.get(0)?,
                kind: kind.to_string(),
                title: row.get(1)?,
                status: parse_entity_status(&row.get::<_, String>(2)?)?,
                created_at: parse_time(&row.get::<_, String>(3)?)?,
                updated_at: parse_time(&row.get::<_, String>(4)?)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

impl SessionStore for Database {
    fn create(&self, session: &Session) -> AppResult<Session> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO focus_sessions ({SESSION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                session.id,
                session.user_id,
                i64::from(session.planned_minutes),
                session.linked_entity.as_ref().map(LinkedEntity::kind),
                session.linked_entity.as_ref().map(LinkedEntity::id),
                to_sql_int(session.accumulated_seconds),
                to_sql_int(session.remaining_seconds_snapshot),
                session.lifecycle_state.as_str(),
                session.started_at.to_rfc3339(),
                session.last_checkpoint_at.to_rfc3339(),
                session.ended_at.map(|at| at.to_rfc3339()),
                session.completed,
                session.interrupted,
                to_sql_int(session.revision),
            ],
        );

        match inserted {
            Ok(_) => Ok(session.clone()),
            Err(rusqlite::Error::SqliteFailure(error, _)) if error.code == ErrorCode::ConstraintViolation => {
                Err(AppError::Conflict(format!(
                    "user {} already has an active focus session",
                    session.user_id
                )))
            }
            Err(error) => Err(AppError::from(error)),
        }
    }

    fn find_active_for_user(&self, user_id: &str) -> AppResult<Option<Session>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let session = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM focus_sessions
                     WHERE user_id = ?1 AND lifecycle_state IN ('running', 'paused')
                     ORDER BY started_at DESC
                     LIMIT 1"
                ),
                [user_id],
                parse_session_row,
            )
            .optional()?;
        Ok(session)
    }

    fn update(&self, id: &str, patch: &SessionPatch) -> AppResult<Session> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE focus_sessions SET
               remaining_seconds_snapshot = COALESCE(?2, remaining_seconds_snapshot),
               accumulated_seconds = MAX(accumulated_seconds, COALESCE(?3, accumulated_seconds)),
               lifecycle_state = COALESCE(?4, lifecycle_state),
               last_checkpoint_at = COALESCE(?5, last_checkpoint_at),
               ended_at = COALESCE(?6, ended_at),
               completed = COALESCE(?7, completed),
               interrupted = COALESCE(?8, interrupted),
               revision = ?9
             WHERE id = ?1
               AND completed = 0 AND interrupted = 0
               AND revision < ?9
               AND (?10 IS NULL OR lifecycle_state = ?10)",
            params![
                id,
                patch.remaining_seconds_snapshot.map(to_sql_int),
                patch.accumulated_seconds.map(to_sql_int),
                patch.lifecycle_state.map(LifecycleState::as_str),
                patch.last_checkpoint_at.map(|at| at.to_rfc3339()),
                patch.ended_at.map(|at| at.to_rfc3339()),
                patch.completed,
                patch.interrupted,
                to_sql_int(patch.revision),
                patch.expected_state.map(LifecycleState::as_str),
            ],
        )?;

        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM focus_sessions WHERE id = ?1"),
                [id],
                parse_session_row,
            )
            .optional()?
            .ok_or_else(|| AppError::NotFound(format!("focus session {id}")))?;

        if changed == 0 {
            tracing::debug!(
                session_id = %id,
                revision = patch.revision,
                stored_revision = session.revision,
                state = session.lifecycle_state.as_str(),
                "session update superseded"
            );
        }
        Ok(session)
    }
}

impl EntityStatusSink for Database {
    fn set_status(&self, entity: &LinkedEntity, status: EntityStatus) -> AppResult<()> {
        let table = entity_table(entity.kind())?;
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            &format!("UPDATE {table} SET status = ?1, updated_at = ?2 WHERE id = ?3"),
            params![status.as_str(), Utc::now().to_rfc3339(), entity.id()],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("{} {}", entity.kind(), entity.id())));
        }
        Ok(())
    }
}

impl NotificationSink for Database {
    fn dispatch(&self, kind: NotificationKind, payload: &serde_json::Value) -> AppResult<()> {
        let session_id = payload
            .get("sessionId")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string);
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO notifications (id, kind, session_id, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                kind.as_str(),
                session_id,
                serde_json::to_string(payload)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tracing::info!(kind = kind.as_str(), session_id = ?session_id, "notification recorded");
        Ok(())
    }
}

fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let linked_kind: Option<String> = row.get(3)?;
    let linked_id: Option<String> = row.get(4)?;
    let linked_entity = match (linked_kind, linked_id) {
        (Some(kind), Some(id)) => Some(LinkedEntity::from_parts(&kind, id).ok_or_else(|| conversion_error(3, &kind))?),
        _ => None,
    };

    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        planned_minutes: u32::try_from(row.get::<_, i64>(2)?).map_err(|_| conversion_error(2, "planned_minutes"))?,
        linked_entity,
        accumulated_seconds: from_sql_int(row.get(5)?),
        remaining_seconds_snapshot: from_sql_int(row.get(6)?),
        lifecycle_state: parse_lifecycle_state(&row.get::<_, String>(7)?)?,
        started_at: parse_time(&row.get::<_, String>(8)?)?,
        last_checkpoint_at: parse_time(&row.get::<_, String>(9)?)?,
        ended_at: row
            .get::<_, Option<String>>(10)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        completed: row.get(11)?,
        interrupted: row.get(12)?,
        revision: from_sql_int(row.get(13)?),
    })
}

fn parse_notification_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationRecord> {
    let payload_raw: String = row.get(3)?;
    Ok(NotificationRecord {
        id: row.get(0)?,
        kind: parse_notification_kind(&row.get::<_, String>(1)?)?,
        session_id: row.get(2)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        created_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_lifecycle_state(raw: &str) -> rusqlite::Result<LifecycleState> {
    match raw {
        "running" => Ok(LifecycleState::Running),
        "paused" => Ok(LifecycleState::Paused),
        "completed" => Ok(LifecycleState::Completed),
        "interrupted" => Ok(LifecycleState::Interrupted),
        other => Err(conversion_error(7, other)),
    }
}

fn parse_entity_status(raw: &str) -> rusqlite::Result<EntityStatus> {
    match raw {
        "todo" => Ok(EntityStatus::Todo),
        "in_progress" => Ok(EntityStatus::InProgress),
        "completed" => Ok(EntityStatus::Completed),
        other => Err(conversion_error(2, other)),
    }
}

fn parse_notification_kind(raw: &str) -> rusqlite::Result<NotificationKind> {
    match raw {
        "reminder" => Ok(NotificationKind::Reminder),
        "completed" => Ok(NotificationKind::Completed),
        other => Err(conversion_error(1, other)),
    }
}

fn entity_table(kind: &str) -> AppResult<&'static str> {
    match kind {
        "task" => Ok("tasks"),
        "habit" => Ok("habits"),
        other => Err(AppError::Validation(format!("unknown entity kind: {other}"))),
    }
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn conversion_error(column: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected value: {raw}"),
        )),
    )
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
