use crate::clock::{Clock, SystemClock};
use crate::controller::FocusController;
use crate::db::Database;
use crate::dispatcher::{EventBus, SideEffectDispatcher};
use crate::errors::AppResult;
use crate::models::TimerSettings;
use crate::recovery::RecoveryOutcome;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DATABASE_FILE: &str = "focus.sqlite";

pub struct FocusApp {
    db: Arc<Database>,
    controller: Arc<FocusController>,
    events: Arc<EventBus>,
    data_dir: PathBuf,
}

impl FocusApp {
    pub fn new(data_dir: PathBuf) -> AppResult<Arc<Self>> {
        Self::with_clock(data_dir, Arc::new(SystemClock), true)
    }

    pub fn with_clock(
        data_dir: PathBuf,
        clock: Arc<dyn Clock>,
        drive_loops: bool,
    ) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&data_dir.join(DATABASE_FILE))?);
        let settings = db.get_timer_settings()?;
        let events = Arc::new(EventBus::default());

        let dispatcher =
            SideEffectDispatcher::new(db.clone(), db.clone()).with_listener(events.clone());
        let controller =
            FocusController::with_clock(db.clone(), dispatcher, settings, clock, drive_loops);

        tracing::debug!(
            db_path = %db.path().display(),
            user_id = %controller.settings().user_id,
            "focus app initialized"
        );
        Ok(Arc::new(Self {
            db,
            controller,
            events,
            data_dir,
        }))
    }

    pub async fn recover(&self) -> AppResult<RecoveryOutcome> {
        self.controller.recover().await
    }

    pub fn controller(&self) -> &Arc<FocusController> {
        &self.controller
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<TimerSettings> {
        let settings = self.db.update_timer_settings(update)?;
        tracing::info!(settings = ?settings, "timer settings updated");
        Ok(settings)
    }
}
