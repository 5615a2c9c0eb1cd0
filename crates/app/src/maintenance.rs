use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde_json::json;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use funquiz_storage::{is_busy, Database, SessionError, StorageError};

use crate::tap::{StageEvent, StageKind, TapHub};

const BATCH_LIMIT: i64 = 500;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Background worker that purges expired login sessions and checkpoints the WAL.
#[derive(Clone)]
pub struct SessionSweeper {
    database: Database,
    tap: TapHub,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    interval: Duration,
}

impl SessionSweeper {
    pub fn new(database: Database, tap: TapHub) -> Self {
        Self {
            database,
            tap,
            clock: Arc::new(Utc::now),
            interval: DEFAULT_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "session sweep failed");
            }
        }
    }

    /// One sweep: delete expired sessions batch by batch, then checkpoint.
    /// Returns the number of sessions removed.
    pub async fn run_once(&self) -> Result<u64, MaintenanceError> {
        let now = (self.clock)();
        let sessions = self.database.sessions();

        let mut deleted = 0u64;
        let mut busy = false;
        loop {
            match sessions.delete_expired_batch(now, BATCH_LIMIT).await {
                Ok(0) => break,
                Ok(batch) => {
                    deleted += batch;
                    counter!("sessions_purged_total").increment(batch);
                }
                Err(SessionError::Database(err)) if is_busy(&err) => {
                    busy = true;
                    warn!(stage = "storage", error = %err, "session sweep hit busy timeout");
                    break;
                }
                Err(err) => return Err(MaintenanceError::Sweep(err)),
            }
        }

        info!(
            stage = "storage",
            deleted,
            busy,
            now = %now.to_rfc3339(),
            "expired sessions swept"
        );
        self.publish("sessions.swept", json!({ "deleted": deleted, "busy": busy }));

        self.checkpoint().await?;
        Ok(deleted)
    }

    async fn checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();
        match self.database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                if stats.busy {
                    warn!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        "WAL checkpoint blocked by a reader"
                    );
                }
                self.publish(
                    "wal.checkpoint",
                    json!({
                        "busy": stats.busy,
                        "log_frames": stats.log_frames,
                        "checkpointed_frames": stats.checkpointed_frames,
                        "duration_secs": duration,
                    }),
                );
                Ok(())
            }
            Err(StorageError::Database(err)) if is_busy(&err) => {
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                Ok(())
            }
            Err(err) => Err(MaintenanceError::Checkpoint(err)),
        }
    }

    fn publish(&self, message: &str, payload: serde_json::Value) {
        self.tap
            .publish(StageEvent::new((self.clock)(), StageKind::Storage, message).with_payload(payload));
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to delete expired sessions: {0}")]
    Sweep(#[source] SessionError),
    #[error("failed to run WAL checkpoint: {0}")]
    Checkpoint(#[source] StorageError),
}
