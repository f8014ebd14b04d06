//! Schedule persistence

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{Schedule, ScheduleStatus};
use crate::error::ErrorCategory;
use crate::reliability::Transient;
use crate::workflow::RunKey;

/// Errors from schedule operations
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// Unknown or deleted schedule
    #[error("schedule not found: {0}")]
    NotFound(String),

    #[error("schedule already exists: {0}")]
    AlreadyExists(String),

    /// Action name that is not CANCEL, PAUSE or UNPAUSE
    #[error("invalid schedule action: {0}")]
    InvalidAction(String),

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("invalid schedule: {0}")]
    Invalid(String),

    /// Someone else wrote the schedule since it was read
    #[error("schedule {0} was modified concurrently")]
    VersionConflict(String),

    #[error("schedule store unavailable: {0}")]
    Unavailable(String),
}

impl ScheduleError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ScheduleError::NotFound(_) => ErrorCategory::NotFound,
            ScheduleError::AlreadyExists(_) | ScheduleError::VersionConflict(_) => {
                ErrorCategory::Conflict
            }
            ScheduleError::InvalidAction(_)
            | ScheduleError::InvalidTrigger(_)
            | ScheduleError::Invalid(_) => ErrorCategory::Validation,
            ScheduleError::Unavailable(_) => ErrorCategory::Transient,
        }
    }
}

impl Transient for ScheduleError {
    fn is_transient(&self) -> bool {
        matches!(self, ScheduleError::Unavailable(_))
    }
}

/// Storage for schedules
///
/// Writes are optimistic: [`update`](ScheduleStore::update) only succeeds
/// when the caller read the current version, and
/// [`claim_fire`](ScheduleStore::claim_fire) is a compare-and-swap on the
/// next fire time, so any number of coordinators can share one store.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    /// Fails with `AlreadyExists` if the id was ever used
    async fn insert(&self, schedule: Schedule) -> Result<Schedule, ScheduleError>;

    /// Any schedule, deleted ones included
    async fn get(&self, schedule_id: &str) -> Result<Schedule, ScheduleError>;

    /// All schedules, ordered by id
    async fn list(&self) -> Result<Vec<Schedule>, ScheduleError>;

    /// Replace a schedule read at `schedule.version`; returns the stored copy
    async fn update(&self, schedule: Schedule) -> Result<Schedule, ScheduleError>;

    /// Active schedules whose next fire time is at or before `now`, earliest first
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>, ScheduleError>;

    /// Consume the firing at `fire_at`
    ///
    /// Succeeds only if the schedule is still active and its next fire time
    /// is still `fire_at`; it then moves to `next_fire_at`. Returns `false`
    /// if another coordinator claimed it or the schedule changed.
    async fn claim_fire(
        &self,
        schedule_id: &str,
        fire_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError>;

    /// Remember a run started by the schedule
    async fn record_run(&self, schedule_id: &str, run: RunKey) -> Result<(), ScheduleError>;
}

/// In-memory implementation of [`ScheduleStore`]
#[derive(Default)]
pub struct InMemoryScheduleStore {
    schedules: DashMap<String, Schedule>,
    unavailable: AtomicBool,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    fn check_available(&self) -> Result<(), ScheduleError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ScheduleError::Unavailable(
                "in-memory schedule store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn insert(&self, schedule: Schedule) -> Result<Schedule, ScheduleError> {
        self.check_available()?;
        match self.schedules.entry(schedule.schedule_id.clone()) {
            Entry::Occupied(_) => Err(ScheduleError::AlreadyExists(schedule.schedule_id)),
            Entry::Vacant(vacant) => Ok(vacant.insert(schedule).clone()),
        }
    }

    async fn get(&self, schedule_id: &str) -> Result<Schedule, ScheduleError> {
        self.check_available()?;
        self.schedules
            .get(schedule_id)
            .map(|s| s.clone())
            .ok_or_else(|| ScheduleError::NotFound(schedule_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Schedule>, ScheduleError> {
        self.check_available()?;
        let mut schedules: Vec<Schedule> = self.schedules.iter().map(|s| s.clone()).collect();
        schedules.sort_by(|a, b| a.schedule_id.cmp(&b.schedule_id));
        Ok(schedules)
    }

    async fn update(&self, mut schedule: Schedule) -> Result<Schedule, ScheduleError> {
        self.check_available()?;
        let mut stored = self
            .schedules
            .get_mut(&schedule.schedule_id)
            .ok_or_else(|| ScheduleError::NotFound(schedule.schedule_id.clone()))?;
        if stored.version != schedule.version {
            return Err(ScheduleError::VersionConflict(schedule.schedule_id));
        }
        schedule.version += 1;
        *stored = schedule;
        Ok(stored.clone())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>, ScheduleError> {
        self.check_available()?;
        let mut due: Vec<Schedule> = self
            .schedules
            .iter()
            .filter(|s| s.is_due(now))
            .map(|s| s.clone())
            .collect();
        due.sort_by(|a, b| {
            (a.next_fire_at, &a.schedule_id).cmp(&(b.next_fire_at, &b.schedule_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_fire(
        &self,
        schedule_id: &str,
        fire_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        self.check_available()?;
        let Some(mut schedule) = self.schedules.get_mut(schedule_id) else {
            return Ok(false);
        };
        if schedule.status != ScheduleStatus::Active || schedule.next_fire_at != Some(fire_at) {
            return Ok(false);
        }
        schedule.next_fire_at = next_fire_at;
        schedule.last_fired_at = Some(fire_at);
        schedule.fire_count += 1;
        schedule.updated_at = now;
        schedule.version += 1;
        Ok(true)
    }

    async fn record_run(&self, schedule_id: &str, run: RunKey) -> Result<(), ScheduleError> {
        self.check_available()?;
        let mut schedule = self
            .schedules
            .get_mut(schedule_id)
            .ok_or_else(|| ScheduleError::NotFound(schedule_id.to_string()))?;
        schedule.push_run(run);
        Ok(())
    }
}
