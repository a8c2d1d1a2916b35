use crate::errors::AppResult;
use crate::models::{EntityStatus, LinkedEntity, NotificationKind, Session};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;

pub trait EntityStatusSink: Send + Sync {
    fn set_status(&self, entity: &LinkedEntity, status: EntityStatus) -> AppResult<()>;
}

pub trait NotificationSink: Send + Sync {
    fn dispatch(&self, kind: NotificationKind, payload: &serde_json::Value) -> AppResult<()>;
}

pub trait SessionEvents: Send + Sync {
    fn on_reminder(&self, _session: &Session, _seconds_remaining: u64, _at: DateTime<Utc>) {}
    fn on_completed(&self, _session: &Session) {}
    fn on_interrupted(&self, _session: &Session) {}
    fn on_persistence_failed(&self, _session: &Session, _error: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TimerEvent {
    #[serde(rename_all = "camelCase")]
    Reminder {
        session_id: String,
        seconds_remaining: u64,
        at: DateTime<Utc>,
    },
    Completed {
        session: Session,
    },
    Interrupted {
        session: Session,
    },
    #[serde(rename_all = "camelCase")]
    PersistenceFailed {
        session_id: String,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TimerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: TimerEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl SessionEvents for EventBus {
    fn on_reminder(&self, session: &Session, seconds_remaining: u64, at: DateTime<Utc>) {
        self.publish(TimerEvent::Reminder {
            session_id: session.id.clone(),
            seconds_remaining,
            at,
        });
    }

    fn on_completed(&self, session: &Session) {
        self.publish(TimerEvent::Completed {
            session: session.clone(),
        });
    }

    fn on_interrupted(&self, session: &Session) {
        self.publish(TimerEvent::Interrupted {
            session: session.clone(),
        });
    }

    fn on_persistence_failed(&self, session: &Session, error: &str) {
        self.publish(TimerEvent::PersistenceFailed {
            session_id: session.id.clone(),
            error: error.to_string(),
        });
    }
}

#[derive(Clone)]
pub struct SideEffectDispatcher {
    entities: Arc<dyn EntityStatusSink>,
    notifier: Arc<dyn NotificationSink>,
    listeners: Vec<Arc<dyn SessionEvents>>,
}

impl SideEffectDispatcher {
    pub fn new(entities: Arc<dyn EntityStatusSink>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            entities,
            notifier,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn SessionEvents>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn session_started(&self, session: &Session) {
        self.set_linked_status(session, EntityStatus::InProgress);
    }

    pub fn reminder_due(&self, session: &Session, seconds_remaining: u64, at: DateTime<Utc>) {
        tracing::info!(session_id = %session.id, seconds_remaining, "focus reminder due");
        self.notify(
            NotificationKind::Reminder,
            json!({
                "sessionId": session.id,
                "secondsRemaining": seconds_remaining,
                "linkedEntity": session.linked_entity,
            }),
        );
        for listener in &self.listeners {
            listener.on_reminder(session, seconds_remaining, at);
        }
    }

    pub fn session_completed(&self, session: &Session) {
        tracing::info!(
            session_id = %session.id,
            accumulated_seconds = session.accumulated_seconds,
            "focus session completed"
        );
        self.set_linked_status(session, EntityStatus::Completed);
        self.notify(
            NotificationKind::Completed,
            json!({
                "sessionId": session.id,
                "plannedMinutes": session.planned_minutes,
                "accumulatedSeconds": session.accumulated_seconds,
                "linkedEntity": session.linked_entity,
            }),
        );
        for listener in &self.listeners {
            listener.on_completed(session);
        }
    }

    pub fn session_interrupted(&self, session: &Session) {
        tracing::info!(
            session_id = %session.id,
            accumulated_seconds = session.accumulated_seconds,
            "focus session interrupted"
        );
        self.set_linked_status(session, EntityStatus::Todo);
        for listener in &self.listeners {
            listener.on_interrupted(session);
        }
    }

    pub fn persistence_failed(&self, session: &Session, error: &str) {
        tracing::error!(session_id = %session.id, error, "focus session could not be saved");
        for listener in &self.listeners {
            listener.on_persistence_failed(session, error);
        }
    }

    fn set_linked_status(&self, session: &Session, status: EntityStatus) {
        let Some(entity) = session.linked_entity.as_ref() else {
            return;
        };
        if let Err(error) = self.entities.set_status(entity, status) {
            tracing::warn!(
                session_id = %session.id,
                entity_kind = entity.kind(),
                entity_id = entity.id(),
                status = status.as_str(),
                error = %error,
                "failed to update linked entity status"
            );
        }
    }

    fn notify(&self, kind: NotificationKind, payload: serde_json::Value) {
        if let Err(error) = self.notifier.dispatch(kind, &payload) {
            tracing::warn!(kind = kind.as_str(), error = %error, "notification dispatch failed");
        }
    }
}
