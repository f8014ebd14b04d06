//! Schedule manager
//!
//! Create, pause, unpause and delete schedules. Every mutation is a
//! read-modify-write against the store's version check, retried when a
//! concurrent writer got there first.

use std::sync::Arc;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    Schedule, ScheduleAction, ScheduleError, ScheduleRequest, ScheduleStatus, ScheduleStore,
};
use crate::clock::{self, Clock};
use crate::reliability::{retry_transient, TransientRetryConfig};

const MAX_VERSION_RETRIES: u32 = 8;

/// Manages the lifecycle of schedules
pub struct ScheduleManager {
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    transient_retry: TransientRetryConfig,
}

impl ScheduleManager {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self {
            store,
            clock: clock::system_clock(),
            transient_retry: TransientRetryConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_transient_retry(mut self, retry: TransientRetryConfig) -> Self {
        self.transient_retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Create an active schedule; the first firing is one period from now
    #[instrument(skip(self, request), fields(workflow_type = %request.workflow_type))]
    pub async fn create(&self, request: ScheduleRequest) -> Result<Schedule, ScheduleError> {
        request.trigger.validate()?;
        if request.workflow_type.trim().is_empty() {
            return Err(ScheduleError::Invalid("workflow type is required".to_string()));
        }
        let schedule_id = match request.schedule_id {
            Some(id) if id.trim().is_empty() => {
                return Err(ScheduleError::Invalid("schedule id must not be blank".to_string()))
            }
            Some(id) => id,
            None => Uuid::now_v7().to_string(),
        };

        let now = self.clock.now();
        let schedule = Schedule {
            schedule_id,
            next_fire_at: request.trigger.next_after(now)?,
            trigger: request.trigger,
            workflow_type: request.workflow_type,
            input: request.input,
            run_timeout: request.run_timeout,
            status: ScheduleStatus::Active,
            pause_reason: None,
            last_fired_at: None,
            fire_count: 0,
            recent_runs: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        };

        let stored = retry_transient(&self.transient_retry, "insert_schedule", || {
            self.store.insert(schedule.clone())
        })
        .await?;
        info!(
            schedule_id = %stored.schedule_id,
            next_fire_at = ?stored.next_fire_at,
            "schedule created"
        );
        Ok(stored)
    }

    /// Stop firing; pausing a paused schedule changes nothing
    pub async fn pause(
        &self,
        schedule_id: &str,
        reason: Option<String>,
    ) -> Result<Schedule, ScheduleError> {
        let schedule = self
            .mutate(schedule_id, |schedule, _| {
                if schedule.status == ScheduleStatus::Paused {
                    return Ok(false);
                }
                schedule.status = ScheduleStatus::Paused;
                schedule.pause_reason = reason.clone();
                schedule.next_fire_at = None;
                Ok(true)
            })
            .await?;
        info!(%schedule_id, reason = ?reason, "schedule paused");
        Ok(schedule)
    }

    /// Resume firing from now on
    ///
    /// Firings missed while paused are skipped.
    pub async fn unpause(
        &self,
        schedule_id: &str,
        reason: Option<String>,
    ) -> Result<Schedule, ScheduleError> {
        let schedule = self
            .mutate(schedule_id, |schedule, now| {
                if schedule.status == ScheduleStatus::Active {
                    return Ok(false);
                }
                schedule.status = ScheduleStatus::Active;
                schedule.pause_reason = None;
                schedule.next_fire_at = schedule.trigger.next_after(now)?;
                Ok(true)
            })
            .await?;
        info!(%schedule_id, reason = ?reason, next_fire_at = ?schedule.next_fire_at, "schedule unpaused");
        Ok(schedule)
    }

    /// Delete for good; later operations on the id fail with not-found
    pub async fn delete(
        &self,
        schedule_id: &str,
        reason: Option<String>,
    ) -> Result<Schedule, ScheduleError> {
        let schedule = self
            .mutate(schedule_id, |schedule, _| {
                schedule.status = ScheduleStatus::Deleted;
                schedule.next_fire_at = None;
                Ok(true)
            })
            .await?;
        info!(%schedule_id, reason = ?reason, "schedule deleted");
        Ok(schedule)
    }

    /// Apply an operator action
    pub async fn action(
        &self,
        schedule_id: &str,
        action: ScheduleAction,
        reason: Option<String>,
    ) -> Result<Schedule, ScheduleError> {
        match action {
            ScheduleAction::Cancel => self.delete(schedule_id, reason).await,
            ScheduleAction::Pause => self.pause(schedule_id, reason).await,
            ScheduleAction::Unpause => self.unpause(schedule_id, reason).await,
        }
    }

    /// A live schedule
    pub async fn describe(&self, schedule_id: &str) -> Result<Schedule, ScheduleError> {
        let schedule = retry_transient(&self.transient_retry, "get_schedule", || {
            self.store.get(schedule_id)
        })
        .await?;
        if schedule.status == ScheduleStatus::Deleted {
            return Err(ScheduleError::NotFound(schedule_id.to_string()));
        }
        Ok(schedule)
    }

    /// Every schedule that is not deleted
    pub async fn list(&self) -> Result<Vec<Schedule>, ScheduleError> {
        let schedules =
            retry_transient(&self.transient_retry, "list_schedules", || self.store.list()).await?;
        Ok(schedules
            .into_iter()
            .filter(|s| s.status != ScheduleStatus::Deleted)
            .collect())
    }

    /// Read-modify-write with version retries
    ///
    /// `change` returns whether it modified the schedule; unchanged
    /// schedules are returned without a write.
    async fn mutate<F>(&self, schedule_id: &str, mut change: F) -> Result<Schedule, ScheduleError>
    where
        F: FnMut(&mut Schedule, chrono::DateTime<chrono::Utc>) -> Result<bool, ScheduleError>,
    {
        for attempt in 1..=MAX_VERSION_RETRIES {
            let mut schedule = self.describe(schedule_id).await?;
            let now = self.clock.now();
            if !change(&mut schedule, now)? {
                return Ok(schedule);
            }
            schedule.updated_at = now;

            let written = retry_transient(&self.transient_retry, "update_schedule", || {
                self.store.update(schedule.clone())
            })
            .await;
            match written {
                Ok(stored) => return Ok(stored),
                Err(ScheduleError::VersionConflict(_)) => {
                    debug!(%schedule_id, attempt, "schedule changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ScheduleError::VersionConflict(schedule_id.to_string()))
    }
}
