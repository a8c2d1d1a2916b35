use crate::errors::AppResult;
use crate::models::{Session, SessionPatch};

/// Durable home of focus sessions.
///
/// `update` applies only the `Some` fields of the patch. Implementations must ignore patches
/// whose revision is not newer than the stored one and must never modify a terminal row; in
/// both cases the current row is returned unchanged.
pub trait SessionStore: Send + Sync {
    fn create(&self, session: &Session) -> AppResult<Session>;
    fn find_active_for_user(&self, user_id: &str) -> AppResult<Option<Session>>;
    fn update(&self, id: &str, patch: &SessionPatch) -> AppResult<Session>;
}
