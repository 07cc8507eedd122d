//! Hibernation schedule management and execution
//!
//! The [`Scheduler`] owns the schedule registry plus a bidirectional
//! instance index, evaluates every enabled schedule on a periodic tick,
//! and dispatches hibernation actions through the lifecycle capability.
//! A per-schedule active flag prevents overlapping runs; it is cleared
//! unconditionally once a run finishes.

use crate::collector::TelemetryIdleChecker;
use crate::error::{EngineError, Result};
use crate::lifecycle::InstanceLifecycle;
use crate::models::{DayOfWeek, Schedule, ScheduleAction, ScheduleKind};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Flat per-hour rate assumed when estimating savings; real billing data
/// is out of reach from here
const ASSUMED_HOURLY_RATE: f64 = 0.10;

static SCHEDULE_ID_SEQ: AtomicU64 = AtomicU64::new(0);

fn generate_schedule_id() -> String {
    let seq = SCHEDULE_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("sched-{}-{}", Utc::now().timestamp(), seq)
}

/// Partial schedule update; `None` fields keep their current value
///
/// `enabled` is always applied, so a schedule can be switched off without
/// touching anything else.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<ScheduleKind>,
    pub enabled: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub days_of_week: Option<Vec<DayOfWeek>>,
}

/// Outcome of one schedule execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRunSummary {
    pub schedule_id: String,
    pub schedule_name: String,
    pub succeeded: usize,
    pub failed: usize,
}

struct SchedulerInner {
    schedules: HashMap<String, Schedule>,
    /// Ids of schedules currently executing
    active: HashSet<String>,
    /// Instance name to assigned schedule ids
    instance_schedules: HashMap<String, Vec<String>>,
}

/// Hibernation scheduler
pub struct Scheduler {
    lifecycle: Arc<dyn InstanceLifecycle>,
    idle_checker: Option<Arc<TelemetryIdleChecker>>,
    tick_interval: Duration,
    inner: tokio::sync::RwLock<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        lifecycle: Arc<dyn InstanceLifecycle>,
        idle_checker: Option<Arc<TelemetryIdleChecker>>,
    ) -> Self {
        Self {
            lifecycle,
            idle_checker,
            tick_interval: Duration::from_secs(60),
            inner: tokio::sync::RwLock::new(SchedulerInner {
                schedules: HashMap::new(),
                active: HashSet::new(),
                instance_schedules: HashMap::new(),
            }),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Runs the evaluation loop until the shutdown signal arrives
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        info!(interval_secs = self.tick_interval.as_secs(), "Scheduler loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_due(Utc::now()).await;
                }
                _ = shutdown.recv() => {
                    info!("Scheduler loop stopping");
                    break;
                }
            }
        }
    }

    /// Evaluates every enabled schedule against `now` and executes the due
    /// ones sequentially, returning a summary per executed schedule
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<ScheduleRunSummary> {
        let candidates: Vec<Schedule> = {
            let inner = self.inner.read().await;
            inner
                .schedules
                .values()
                .filter(|s| s.enabled)
                .cloned()
                .collect()
        };

        let mut summaries = Vec::new();
        for schedule in candidates {
            if !self.should_execute(&schedule, now).await {
                continue;
            }
            if !self.begin_execution(&schedule.id).await {
                continue;
            }

            let summary = self.execute_schedule(&schedule).await;
            self.end_execution(&schedule.id).await;
            summaries.push(summary);
        }

        summaries
    }

    /// Marks a schedule active; false means a run is already in flight
    async fn begin_execution(&self, schedule_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.active.insert(schedule_id.to_string())
    }

    async fn end_execution(&self, schedule_id: &str) {
        let mut inner = self.inner.write().await;
        inner.active.remove(schedule_id);
    }

    async fn should_execute(&self, schedule: &Schedule, now: DateTime<Utc>) -> bool {
        match schedule.kind {
            ScheduleKind::Daily => self.should_execute_daily(schedule, now).await,
            ScheduleKind::Weekly => {
                let today = now.weekday();
                if !schedule.days_of_week.iter().any(|d| d.matches(today)) {
                    return false;
                }
                self.should_execute_daily(schedule, now).await
            }
            ScheduleKind::WorkHours => outside_work_hours(now),
            ScheduleKind::Idle => self.should_execute_idle(schedule).await,
            // Custom schedules carry no evaluable trigger yet
            ScheduleKind::Custom => false,
        }
    }

    async fn should_execute_daily(&self, schedule: &Schedule, now: DateTime<Utc>) -> bool {
        if !in_daily_window(&schedule.start_time, &schedule.end_time, now) {
            return false;
        }
        !self.inner.read().await.active.contains(&schedule.id)
    }

    /// An idle schedule fires once ANY target instance reports idle; the
    /// execution then covers all targets
    async fn should_execute_idle(&self, schedule: &Schedule) -> bool {
        if schedule.idle_minutes <= 0 {
            return false;
        }

        let Some(checker) = &self.idle_checker else {
            warn!(
                schedule = %schedule.name,
                "No telemetry checker configured, skipping idle schedule"
            );
            return false;
        };

        let instances = if schedule.target_instances.is_empty() {
            match self.lifecycle.list_instance_names().await {
                Ok(names) => names,
                Err(e) => {
                    warn!(error = %e, "Failed to list instances for idle evaluation");
                    return false;
                }
            }
        } else {
            schedule.target_instances.clone()
        };

        for name in &instances {
            let instance_id = match self.lifecycle.get_instance_id(name).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(instance = %name, error = %e, "Failed to resolve instance id");
                    continue;
                }
            };

            match checker.is_instance_idle(&instance_id, schedule).await {
                Ok(true) => {
                    info!(
                        instance = %name,
                        instance_id = %instance_id,
                        idle_minutes = schedule.idle_minutes,
                        "Instance under idle thresholds for the schedule window"
                    );
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(instance = %name, error = %e, "Idle check failed");
                }
            }
        }

        false
    }

    async fn execute_schedule(&self, schedule: &Schedule) -> ScheduleRunSummary {
        info!(
            event = "schedule_fired",
            schedule = %schedule.name,
            schedule_id = %schedule.id,
            "Executing hibernation schedule"
        );

        let mut summary = ScheduleRunSummary {
            schedule_id: schedule.id.clone(),
            schedule_name: schedule.name.clone(),
            succeeded: 0,
            failed: 0,
        };

        let targets = if !schedule.target_instances.is_empty() {
            schedule.target_instances.clone()
        } else {
            match self.lifecycle.list_instance_names().await {
                Ok(names) => names,
                Err(e) => {
                    warn!(schedule = %schedule.name, error = %e, "Failed to list target instances");
                    return summary;
                }
            }
        };

        for instance in &targets {
            match self.dispatch_action(schedule, instance).await {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    warn!(
                        instance = %instance,
                        schedule = %schedule.name,
                        error = %e,
                        "Schedule action failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        {
            let mut inner = self.inner.write().await;
            if let Some(stored) = inner.schedules.get_mut(&schedule.id) {
                stored.last_executed = Some(Utc::now());
            }
        }

        info!(
            schedule = %schedule.name,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Schedule execution complete"
        );
        summary
    }

    async fn dispatch_action(&self, schedule: &Schedule, instance: &str) -> Result<()> {
        match schedule.hibernate_action {
            ScheduleAction::Hibernate => self.lifecycle.hibernate(instance).await,
            ScheduleAction::Stop => self.lifecycle.stop(instance).await,
            // Refused for safety, termination is irreversible
            ScheduleAction::Terminate => Err(EngineError::validation(
                "terminate action not supported by the scheduler, use the CLI directly",
            )),
            ScheduleAction::Alert => {
                info!(
                    instance = %instance,
                    schedule = %schedule.name,
                    "Hibernation alert, no action taken"
                );
                Ok(())
            }
        }
    }

    /// Registers a schedule, assigning an id when absent and recomputing
    /// the savings estimate
    pub async fn create_schedule(&self, mut schedule: Schedule) -> Result<Schedule> {
        if schedule.id.is_empty() {
            schedule.id = generate_schedule_id();
        }
        validate_schedule(&schedule)?;
        schedule.estimated_monthly_savings = estimate_monthly_savings(&schedule);

        let mut inner = self.inner.write().await;
        inner
            .schedules
            .insert(schedule.id.clone(), schedule.clone());
        Ok(schedule)
    }

    /// Applies a partial update; the merged result is validated before
    /// anything is committed
    pub async fn update_schedule(&self, id: &str, updates: ScheduleUpdate) -> Result<Schedule> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .schedules
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("schedule", id))?;

        let mut updated = existing.clone();
        if let Some(name) = updates.name {
            updated.name = name;
        }
        if let Some(description) = updates.description {
            updated.description = description;
        }
        if let Some(kind) = updates.kind {
            updated.kind = kind;
        }
        updated.enabled = updates.enabled;
        if let Some(start_time) = updates.start_time {
            updated.start_time = start_time;
        }
        if let Some(end_time) = updates.end_time {
            updated.end_time = end_time;
        }
        if let Some(days) = updates.days_of_week {
            if !days.is_empty() {
                updated.days_of_week = days;
            }
        }

        validate_schedule(&updated)?;
        updated.estimated_monthly_savings = estimate_monthly_savings(&updated);

        *existing = updated.clone();
        Ok(updated)
    }

    /// Deletes a schedule and scrubs it from every instance's index
    pub async fn delete_schedule(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.schedules.remove(id).is_none() {
            return Err(EngineError::not_found("schedule", id));
        }

        inner.active.remove(id);
        inner.instance_schedules.retain(|_, ids| {
            ids.retain(|sid| sid != id);
            !ids.is_empty()
        });

        Ok(())
    }

    pub async fn schedule(&self, id: &str) -> Result<Schedule> {
        self.inner
            .read()
            .await
            .schedules
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("schedule", id))
    }

    pub async fn list_schedules(&self) -> Vec<Schedule> {
        self.inner.read().await.schedules.values().cloned().collect()
    }

    pub async fn schedule_count(&self) -> usize {
        self.inner.read().await.schedules.len()
    }

    /// Adds the instance to the schedule's targets and records the reverse
    /// mapping; assigning twice is a no-op
    pub async fn assign_to_instance(&self, schedule_id: &str, instance: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let schedule = inner
            .schedules
            .get_mut(schedule_id)
            .ok_or_else(|| EngineError::not_found("schedule", schedule_id))?;

        if !schedule.target_instances.iter().any(|t| t == instance) {
            schedule.target_instances.push(instance.to_string());
        }
        let schedule_name = schedule.name.clone();

        let ids = inner
            .instance_schedules
            .entry(instance.to_string())
            .or_default();
        if !ids.iter().any(|sid| sid == schedule_id) {
            ids.push(schedule_id.to_string());
        }

        info!(
            schedule_id = %schedule_id,
            schedule = %schedule_name,
            instance = %instance,
            "Assigned schedule to instance"
        );
        Ok(())
    }

    /// Removes the instance from the schedule's targets and the reverse
    /// mapping, dropping empty index entries
    pub async fn remove_from_instance(&self, schedule_id: &str, instance: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let schedule = inner
            .schedules
            .get_mut(schedule_id)
            .ok_or_else(|| EngineError::not_found("schedule", schedule_id))?;

        schedule.target_instances.retain(|t| t != instance);
        let schedule_name = schedule.name.clone();

        let drop_entry = match inner.instance_schedules.get_mut(instance) {
            Some(ids) => {
                ids.retain(|sid| sid != schedule_id);
                ids.is_empty()
            }
            None => false,
        };
        if drop_entry {
            inner.instance_schedules.remove(instance);
        }

        info!(
            schedule_id = %schedule_id,
            schedule = %schedule_name,
            instance = %instance,
            "Removed schedule from instance"
        );
        Ok(())
    }

    /// Schedules currently assigned to an instance
    pub async fn instance_schedules(&self, instance: &str) -> Vec<Schedule> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.instance_schedules.get(instance) else {
            return Vec::new();
        };

        ids.iter()
            .filter_map(|id| inner.schedules.get(id).cloned())
            .collect()
    }
}

/// Same-day window check by lexicographic HH:MM comparison, start
/// inclusive and end exclusive
///
/// Windows that cross midnight (`end < start`) never match under this
/// comparison; kept as-is until overnight semantics are settled.
fn in_daily_window(start: &str, end: &str, now: DateTime<Utc>) -> bool {
    let current = now.format("%H:%M").to_string();
    start <= current.as_str() && current.as_str() < end
}

/// Hibernation window for work-hours schedules: everything outside
/// Mon-Fri 09:00-18:00
fn outside_work_hours(now: DateTime<Utc>) -> bool {
    let weekday = now.weekday();
    if weekday == Weekday::Sat || weekday == Weekday::Sun {
        return true;
    }

    let hour = now.hour();
    hour < 9 || hour >= 18
}

fn validate_schedule(schedule: &Schedule) -> Result<()> {
    if schedule.name.is_empty() {
        return Err(EngineError::validation("schedule name is required"));
    }

    match schedule.kind {
        ScheduleKind::Daily | ScheduleKind::Weekly => {
            if schedule.start_time.is_empty() || schedule.end_time.is_empty() {
                return Err(EngineError::validation(format!(
                    "start and end times are required for {} schedules",
                    schedule.kind.as_str()
                )));
            }
            if parse_hhmm(&schedule.start_time).is_none() {
                return Err(EngineError::validation(format!(
                    "invalid start time {:?}, expected HH:MM",
                    schedule.start_time
                )));
            }
            if parse_hhmm(&schedule.end_time).is_none() {
                return Err(EngineError::validation(format!(
                    "invalid end time {:?}, expected HH:MM",
                    schedule.end_time
                )));
            }
        }
        ScheduleKind::Idle => {
            if schedule.idle_minutes <= 0 {
                return Err(EngineError::validation(
                    "idle minutes must be positive for idle schedules",
                ));
            }
        }
        ScheduleKind::WorkHours | ScheduleKind::Custom => {}
    }

    Ok(())
}

/// Rough monthly savings in dollars from hibernated hours at the assumed
/// hourly rate
fn estimate_monthly_savings(schedule: &Schedule) -> f64 {
    let (hours_per_day, days_per_month) = match schedule.kind {
        ScheduleKind::Daily => (
            hours_between(&schedule.start_time, &schedule.end_time),
            30.0,
        ),
        ScheduleKind::Weekly => (
            hours_between(&schedule.start_time, &schedule.end_time),
            // Roughly four weeks per month
            schedule.days_of_week.len() as f64 * 4.0,
        ),
        // 6 PM to 9 AM plus weekends averages out to about 15 hours a day
        ScheduleKind::WorkHours => (15.0, 30.0),
        // Assume eight idle periods a day
        ScheduleKind::Idle => (schedule.idle_minutes as f64 / 60.0 * 8.0, 30.0),
        ScheduleKind::Custom => (8.0, 30.0),
    };

    hours_per_day * days_per_month * ASSUMED_HOURLY_RATE
}

/// Window length in hours; windows that do not parse or do not end after
/// they start fall back to an eight hour estimate
pub(crate) fn hours_between(start: &str, end: &str) -> f64 {
    match (parse_hhmm(start), parse_hhmm(end)) {
        (Some((sh, sm)), Some((eh, em))) => {
            let start_min = i64::from(sh) * 60 + i64::from(sm);
            let end_min = i64::from(eh) * 60 + i64::from(em);
            if end_min > start_min {
                (end_min - start_min) as f64 / 60.0
            } else {
                8.0
            }
        }
        _ => 8.0,
    }
}

fn parse_hhmm(value: &str) -> Option<(u32, u32)> {
    let (h, m) = value.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some((hours, minutes))
}
