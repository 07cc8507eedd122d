//! Autonomous monitoring and action execution
//!
//! The [`AutonomousService`] is the top-level loop: every cycle it lists
//! the running instances, collects usage from each under a bounded worker
//! pool, feeds the snapshots into the [`IdleManager`], and, when
//! auto-execution is enabled, executes the actions that have come due.
//! Two safety nets sit in front of every execution: a dry-run flag that
//! stops strictly after the decision logging, and a rolling per-hour cap
//! on executed actions. State is snapshotted on a fixed interval and at
//! shutdown so a restart resumes idle tracking instead of resetting it.

use crate::collector::UsageCollector;
use crate::error::{EngineError, Result};
use crate::idle::IdleManager;
use crate::lifecycle::{InstanceLifecycle, InstanceProvider, InstanceTarget};
use crate::models::{HistoryEntry, IdleAction};
use crate::observability::AgentMetrics;
use crate::savings::{HibernationEvent, SavingsTracker, SavingsTrigger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Interval;
use tracing::{debug, error, info, warn};

use super::control::ControlCommand;
use super::persistence::{PersistentState, SaveReason, StateStore, STATE_SCHEMA_VERSION};

/// Service configuration
///
/// Defaults are deliberately conservative: nothing is executed until
/// auto-execution is switched on explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomousConfig {
    /// Execute due actions instead of only reporting them
    pub auto_execute: bool,
    pub monitor_interval_secs: u64,
    /// Upper bound on one instance's metrics collection
    pub collection_timeout_secs: u64,
    /// Rolling cap on executed actions per trailing hour
    pub max_actions_per_hour: usize,
    /// Log every decision but never call the lifecycle
    pub dry_run: bool,
    pub save_interval_secs: u64,
    /// Concurrent collections per cycle
    pub max_concurrent_collections: usize,
    /// Flat per-hour rate used when valuing hibernation savings
    pub assumed_hourly_rate: f64,
}

impl Default for AutonomousConfig {
    fn default() -> Self {
        Self {
            auto_execute: false,
            monitor_interval_secs: 60,
            collection_timeout_secs: 30,
            max_actions_per_hour: 10,
            dry_run: false,
            save_interval_secs: 30,
            max_concurrent_collections: 5,
            assumed_hourly_rate: 0.10,
        }
    }
}

impl AutonomousConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn collection_timeout(&self) -> Duration {
        Duration::from_secs(self.collection_timeout_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval_secs == 0 {
            return Err(EngineError::validation(
                "monitor interval must be at least one second",
            ));
        }
        if self.save_interval_secs == 0 {
            return Err(EngineError::validation(
                "save interval must be at least one second",
            ));
        }
        if self.collection_timeout_secs == 0 {
            return Err(EngineError::validation(
                "collection timeout must be at least one second",
            ));
        }
        if self.max_concurrent_collections == 0 {
            return Err(EngineError::validation(
                "at least one concurrent collection is required",
            ));
        }
        if self.assumed_hourly_rate < 0.0 {
            return Err(EngineError::validation(
                "assumed hourly rate cannot be negative",
            ));
        }
        Ok(())
    }
}

/// Counters from one monitoring cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Running instances reported by the provider
    pub running: usize,
    /// Running instances without a public address
    pub unreachable: usize,
    /// Snapshots collected and processed
    pub collected: usize,
    pub collection_failures: usize,
    /// Instances idle after this cycle's snapshots
    pub idle: usize,
    pub actions_due: usize,
    pub actions_executed: usize,
    pub actions_failed: usize,
    pub actions_rate_limited: usize,
    pub actions_dry_run: usize,
}

/// Point-in-time service status for operators
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub uptime_secs: i64,
    pub idle_detection_enabled: bool,
    pub auto_execute: bool,
    pub dry_run: bool,
    pub monitored_instances: usize,
    pub idle_instances: usize,
    /// States carrying a scheduled action, due or not
    pub pending_actions: usize,
    pub actions_last_hour: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_save: Option<DateTime<Utc>>,
    pub state_file: String,
}

/// Outcome of monitoring one instance within a cycle
enum InstanceOutcome {
    Idle,
    Active,
    CollectionFailed,
}

/// The autonomous idle detection and execution service
pub struct AutonomousService {
    idle: Arc<IdleManager>,
    lifecycle: Arc<dyn InstanceLifecycle>,
    provider: Arc<dyn InstanceProvider>,
    collector: Arc<dyn UsageCollector>,
    savings: Arc<SavingsTracker>,
    store: StateStore,
    config: RwLock<AutonomousConfig>,
    /// Timestamps of executed actions within the trailing hour
    executed: RwLock<VecDeque<DateTime<Utc>>>,
    started_at: DateTime<Utc>,
    last_cycle: RwLock<Option<DateTime<Utc>>>,
    last_save: RwLock<Option<DateTime<Utc>>>,
    metrics: AgentMetrics,
}

impl AutonomousService {
    /// Builds the service, preferring a configuration override document
    /// left by the operator over the supplied baseline
    pub fn new(
        idle: Arc<IdleManager>,
        lifecycle: Arc<dyn InstanceLifecycle>,
        provider: Arc<dyn InstanceProvider>,
        collector: Arc<dyn UsageCollector>,
        savings: Arc<SavingsTracker>,
        store: StateStore,
        config: AutonomousConfig,
    ) -> Result<Self> {
        config.validate()?;

        let config = match store.load_config() {
            Ok(Some(override_config)) => match override_config.validate() {
                Ok(()) => {
                    info!(
                        event = "config_override_loaded",
                        path = %store.config_path().display(),
                        "Loaded configuration override"
                    );
                    override_config
                }
                Err(e) => {
                    warn!(
                        event = "config_override_invalid",
                        path = %store.config_path().display(),
                        error = %e,
                        "Ignoring invalid configuration override"
                    );
                    config
                }
            },
            Ok(None) => config,
            Err(e) => {
                warn!(
                    event = "config_override_unreadable",
                    path = %store.config_path().display(),
                    error = %e,
                    "Ignoring unreadable configuration override"
                );
                config
            }
        };

        Ok(Self {
            idle,
            lifecycle,
            provider,
            collector,
            savings,
            store,
            config: RwLock::new(config),
            executed: RwLock::new(VecDeque::new()),
            started_at: Utc::now(),
            last_cycle: RwLock::new(None),
            last_save: RwLock::new(None),
            metrics: AgentMetrics::new(),
        })
    }

    pub async fn config(&self) -> AutonomousConfig {
        self.config.read().await.clone()
    }

    /// Restores the prior snapshot into the idle manager
    ///
    /// Downtime is reported relative to the snapshot timestamp; actions
    /// that came due while the daemon was down are logged and handled on
    /// the first cycle rather than dropped. Returns `false` on a fresh
    /// start. The embedded config is not applied; the override document
    /// and the baseline govern the running configuration.
    pub async fn recover(&self) -> Result<bool> {
        let Some(snapshot) = self.store.load()? else {
            info!(
                event = "state_fresh_start",
                path = %self.store.state_path().display(),
                "No prior state snapshot; starting fresh"
            );
            return Ok(false);
        };

        let now = Utc::now();
        let downtime = snapshot.downtime(now);
        info!(
            event = "state_recovered",
            last_saved = %snapshot.last_update,
            save_reason = %snapshot.save_reason,
            downtime_secs = downtime.num_seconds(),
            instances = snapshot.idle_states.len(),
            "Recovered persisted idle state"
        );

        for state in snapshot.idle_states.values() {
            debug!(
                event = "state_restoring",
                instance = %state.instance_name,
                is_idle = state.is_idle,
                "Restoring idle state"
            );
        }
        for (instance, action) in snapshot.overdue_actions(now) {
            warn!(
                event = "action_overdue",
                instance = %instance,
                action = %action.action,
                due = %action.time,
                "Action came due during downtime; evaluating on the first cycle"
            );
        }

        self.idle.restore_states(snapshot.idle_states).await;
        Ok(true)
    }

    /// Runs recovery plus the monitor, persistence, and control loops
    /// until a shutdown arrives on either channel
    ///
    /// The final snapshot is always attempted; a failed shutdown save is
    /// returned as an error since it risks losing idle tracking.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
        mut control: mpsc::Receiver<ControlCommand>,
    ) -> Result<()> {
        if let Err(e) = self.recover().await {
            warn!(
                event = "state_recovery_failed",
                error = %e,
                "Could not recover prior state; starting fresh"
            );
        }

        let (mut cycle_tick, mut save_tick) = self.tickers().await;
        {
            let config = self.config.read().await;
            info!(
                event = "service_started",
                auto_execute = config.auto_execute,
                dry_run = config.dry_run,
                monitor_interval_secs = config.monitor_interval_secs,
                save_interval_secs = config.save_interval_secs,
                state_file = %self.store.state_path().display(),
                "Autonomous idle service running"
            );
        }

        loop {
            tokio::select! {
                _ = cycle_tick.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(event = "cycle_failed", error = %e, "Monitoring cycle failed");
                    }
                }
                _ = save_tick.tick() => {
                    if let Err(e) = self.save_state(SaveReason::Periodic).await {
                        warn!(event = "state_save_failed", reason = "periodic", error = %e, "Periodic state save failed");
                    }
                }
                command = control.recv() => match command {
                    Some(ControlCommand::Reload) => {
                        if let Err(e) = self.save_state(SaveReason::Reload).await {
                            warn!(event = "state_save_failed", reason = "reload", error = %e, "State save before reload failed");
                        }
                        match self.reload_config().await {
                            Ok(()) => {
                                let (cycle, save) = self.tickers().await;
                                cycle_tick = cycle;
                                save_tick = save;
                            }
                            Err(e) => {
                                warn!(event = "config_reload_failed", error = %e, "Keeping current configuration");
                            }
                        }
                    }
                    Some(ControlCommand::Shutdown) | None => return self.flush_and_stop().await,
                },
                _ = shutdown.recv() => return self.flush_and_stop().await,
            }
        }
    }

    async fn tickers(&self) -> (Interval, Interval) {
        let config = self.config.read().await;
        (
            tokio::time::interval(config.monitor_interval()),
            tokio::time::interval(config.save_interval()),
        )
    }

    async fn flush_and_stop(&self) -> Result<()> {
        info!(event = "service_stopping", "Autonomous idle service stopping");
        if let Err(e) = self.save_state(SaveReason::Shutdown).await {
            error!(
                event = "state_save_failed",
                reason = "shutdown",
                error = %e,
                "Failed to persist state during shutdown; idle tracking may be lost"
            );
            return Err(e);
        }
        info!(event = "service_stopped", "Autonomous idle service stopped");
        Ok(())
    }

    /// Re-reads the configuration override document
    async fn reload_config(&self) -> Result<()> {
        match self.store.load_config()? {
            Some(new_config) => {
                new_config.validate()?;
                info!(
                    event = "config_reloaded",
                    auto_execute = new_config.auto_execute,
                    dry_run = new_config.dry_run,
                    monitor_interval_secs = new_config.monitor_interval_secs,
                    "Reloaded service configuration"
                );
                *self.config.write().await = new_config;
            }
            None => {
                info!(
                    event = "config_reload_skipped",
                    path = %self.store.config_path().display(),
                    "No configuration override; keeping current configuration"
                );
            }
        }
        Ok(())
    }

    /// One monitoring pass: collect from every reachable running instance
    /// under the concurrency cap, join, then evaluate pending actions
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let started = std::time::Instant::now();
        let mut summary = CycleSummary::default();

        if !self.idle.is_enabled().await {
            debug!(event = "detection_disabled", "Idle detection disabled; skipping cycle");
            return Ok(summary);
        }

        let config = self.config.read().await.clone();
        let instances = self.provider.list_running_instances().await?;
        summary.running = instances.len();

        let mut targets = Vec::new();
        for instance in instances {
            match instance.target() {
                Some(target) => targets.push(target),
                None => {
                    summary.unreachable += 1;
                    debug!(
                        event = "instance_unreachable",
                        instance = %instance.name,
                        "Running instance has no public address; skipping"
                    );
                }
            }
        }

        if targets.is_empty() {
            debug!(event = "cycle_no_instances", "No reachable running instances to monitor");
        } else {
            debug!(
                event = "cycle_collecting",
                instances = targets.len(),
                "Collecting usage from running instances"
            );
            let semaphore = Arc::new(Semaphore::new(config.max_concurrent_collections));
            let mut tasks: JoinSet<InstanceOutcome> = JoinSet::new();
            for target in targets {
                let semaphore = Arc::clone(&semaphore);
                let idle = Arc::clone(&self.idle);
                let collector = Arc::clone(&self.collector);
                let metrics = self.metrics.clone();
                let timeout = config.collection_timeout();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return InstanceOutcome::CollectionFailed;
                    };
                    monitor_instance(idle, collector, metrics, target, timeout).await
                });
            }

            // Join barrier: every collection settles before actions run
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(InstanceOutcome::Idle) => {
                        summary.collected += 1;
                        summary.idle += 1;
                    }
                    Ok(InstanceOutcome::Active) => summary.collected += 1,
                    Ok(InstanceOutcome::CollectionFailed) => summary.collection_failures += 1,
                    Err(e) => {
                        warn!(event = "collection_task_failed", error = %e, "Collection task aborted");
                        summary.collection_failures += 1;
                    }
                }
            }
        }

        if config.auto_execute {
            self.execute_due_actions(Utc::now(), &config, &mut summary)
                .await;
        }

        let states = self.idle.all_states().await;
        self.metrics.set_instances_monitored(states.len() as i64);
        self.metrics
            .set_instances_idle(states.values().filter(|s| s.is_idle).count() as i64);
        self.metrics.inc_cycles();
        self.metrics
            .observe_cycle_duration(started.elapsed().as_secs_f64());
        *self.last_cycle.write().await = Some(Utc::now());

        debug!(
            event = "cycle_completed",
            collected = summary.collected,
            failures = summary.collection_failures,
            idle = summary.idle,
            executed = summary.actions_executed,
            "Monitoring cycle completed"
        );
        Ok(summary)
    }

    /// Executes every action whose trigger time has arrived
    ///
    /// Gate order per action: hourly cap first, then the dry-run
    /// short-circuit, then the lifecycle call. Failures and rate-limit
    /// skips both leave `NextAction` in place for a later cycle; only a
    /// real execution clears it and lands in the history.
    async fn execute_due_actions(
        &self,
        now: DateTime<Utc>,
        config: &AutonomousConfig,
        summary: &mut CycleSummary,
    ) {
        let due = self.idle.check_pending_actions_at(now).await;
        if due.is_empty() {
            return;
        }
        info!(
            event = "actions_due",
            count = due.len(),
            "Instances ready for idle action"
        );

        for state in due {
            let Some(scheduled) = state.next_action.clone() else {
                continue;
            };
            summary.actions_due += 1;
            let idle_secs = state
                .idle_since
                .map(|since| (now - since).num_seconds())
                .unwrap_or(0);

            let at_cap = {
                let mut executed = self.executed.write().await;
                prune_window(&mut executed, now);
                executed.len() >= config.max_actions_per_hour
            };
            if at_cap {
                warn!(
                    event = "action_rate_limited",
                    instance = %state.instance_name,
                    action = %scheduled.action,
                    cap = config.max_actions_per_hour,
                    "Hourly action cap reached; leaving action pending"
                );
                self.metrics.inc_rate_limited();
                summary.actions_rate_limited += 1;
                continue;
            }

            if config.dry_run {
                info!(
                    event = "action_dry_run",
                    instance = %state.instance_name,
                    action = %scheduled.action,
                    idle_secs,
                    "Would execute idle action"
                );
                self.metrics.inc_dry_run();
                summary.actions_dry_run += 1;
                continue;
            }

            info!(
                event = "action_executing",
                instance = %state.instance_name,
                action = %scheduled.action,
                idle_secs,
                "Executing idle action"
            );
            if let Err(e) = self.dispatch(&state.instance_name, scheduled.action).await {
                warn!(
                    event = "action_failed",
                    instance = %state.instance_name,
                    action = %scheduled.action,
                    error = %e,
                    "Idle action failed; leaving it pending for retry"
                );
                self.metrics.inc_action_failed();
                summary.actions_failed += 1;
                continue;
            }

            self.executed.write().await.push_back(now);
            self.metrics
                .inc_action_executed(&scheduled.action.to_string());
            summary.actions_executed += 1;

            let entry = HistoryEntry {
                instance_id: state.instance_id.clone(),
                instance_name: state.instance_name.clone(),
                action: scheduled.action,
                time: now,
                idle_duration_secs: idle_secs,
                metrics: state.last_metrics.clone(),
            };
            if let Err(e) = self.idle.record_action(entry).await {
                warn!(
                    event = "history_write_failed",
                    instance = %state.instance_name,
                    error = %e,
                    "Failed to record action history"
                );
            }

            self.idle.clear_next_action(&state.instance_id).await;

            if matches!(scheduled.action, IdleAction::Stop | IdleAction::Hibernate) {
                if let Some(idle_since) = state.idle_since {
                    let hours = (now - idle_since).num_seconds() as f64 / 3600.0;
                    self.savings
                        .record(HibernationEvent {
                            instance_id: state.instance_id.clone(),
                            instance_name: state.instance_name.clone(),
                            hourly_rate: config.assumed_hourly_rate,
                            start_time: idle_since,
                            end_time: now,
                            duration_hours: hours,
                            saved_amount: hours * config.assumed_hourly_rate,
                            trigger: SavingsTrigger::Idle,
                            schedule_name: None,
                        })
                        .await;
                }
            }

            info!(
                event = "action_executed",
                instance = %state.instance_name,
                action = %scheduled.action,
                "Idle action completed"
            );
        }
    }

    async fn dispatch(&self, name: &str, action: IdleAction) -> Result<()> {
        match action {
            IdleAction::Stop => self.lifecycle.stop(name).await,
            IdleAction::Hibernate => self.lifecycle.hibernate(name).await,
            IdleAction::Notify => {
                info!(
                    event = "idle_notification",
                    instance = %name,
                    "Instance is idle and may be wasting money"
                );
                Ok(())
            }
        }
    }

    /// Snapshots the current idle states and configuration to disk
    pub async fn save_state(&self, reason: SaveReason) -> Result<()> {
        let idle_states = self.idle.all_states().await;
        let config = self.config.read().await.clone();
        let now = Utc::now();

        let snapshot = PersistentState {
            version: STATE_SCHEMA_VERSION,
            idle_states,
            config,
            last_update: now,
            daemon_uptime_secs: (now - self.started_at).num_seconds(),
            save_reason: reason,
        };
        self.store.save(&snapshot)?;

        *self.last_save.write().await = Some(now);
        self.metrics.inc_state_save(reason.as_str());
        debug!(
            event = "state_saved",
            reason = %reason,
            instances = snapshot.idle_states.len(),
            "Persisted service state"
        );
        Ok(())
    }

    /// Executed actions within the trailing hour
    pub async fn actions_last_hour(&self) -> usize {
        let mut executed = self.executed.write().await;
        prune_window(&mut executed, Utc::now());
        executed.len()
    }

    pub async fn status(&self) -> ServiceStatus {
        let config = self.config.read().await.clone();
        let states = self.idle.all_states().await;
        let idle_instances = states.values().filter(|s| s.is_idle).count();
        let pending_actions = states.values().filter(|s| s.next_action.is_some()).count();

        ServiceStatus {
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            idle_detection_enabled: self.idle.is_enabled().await,
            auto_execute: config.auto_execute,
            dry_run: config.dry_run,
            monitored_instances: states.len(),
            idle_instances,
            pending_actions,
            actions_last_hour: self.actions_last_hour().await,
            last_cycle: *self.last_cycle.read().await,
            last_save: *self.last_save.read().await,
            state_file: self.store.state_path().display().to_string(),
        }
    }
}

/// Collects one instance's usage and folds it into the idle manager
async fn monitor_instance(
    idle: Arc<IdleManager>,
    collector: Arc<dyn UsageCollector>,
    metrics: AgentMetrics,
    target: InstanceTarget,
    timeout: Duration,
) -> InstanceOutcome {
    let usage = match tokio::time::timeout(timeout, collector.collect(&target)).await {
        Ok(Ok(usage)) => usage,
        Ok(Err(e)) => {
            warn!(
                event = "collection_failed",
                instance = %target.name,
                collector = collector.name(),
                error = %e,
                "Metrics collection failed; skipping instance this cycle"
            );
            metrics.inc_collection_failures();
            return InstanceOutcome::CollectionFailed;
        }
        Err(_) => {
            warn!(
                event = "collection_failed",
                instance = %target.name,
                collector = collector.name(),
                timeout_secs = timeout.as_secs(),
                "Metrics collection timed out; skipping instance this cycle"
            );
            metrics.inc_collection_failures();
            return InstanceOutcome::CollectionFailed;
        }
    };

    let was_idle = idle
        .idle_state(&target.id)
        .await
        .map(|s| s.is_idle)
        .unwrap_or(false);

    let Some(state) = idle
        .process_metrics(&target.id, &target.name, usage.clone())
        .await
    else {
        return InstanceOutcome::Active;
    };

    if state.is_idle && !was_idle {
        info!(
            event = "idle_transition",
            instance = %target.name,
            profile = %state.profile,
            is_idle = true,
            "Instance went idle"
        );
    } else if !state.is_idle && was_idle {
        info!(
            event = "idle_transition",
            instance = %target.name,
            profile = %state.profile,
            is_idle = false,
            "Instance became active"
        );
    }

    if state.is_idle {
        let idle_secs = state
            .idle_since
            .map(|since| (usage.timestamp - since).num_seconds())
            .unwrap_or(0);
        debug!(
            event = "instance_idle",
            instance = %target.name,
            profile = %state.profile,
            idle_secs,
            next_action = ?state.next_action.as_ref().map(|a| a.action),
            "Instance is idle"
        );
        InstanceOutcome::Idle
    } else {
        debug!(
            event = "instance_active",
            instance = %target.name,
            cpu = usage.cpu,
            memory = usage.memory,
            has_activity = usage.has_activity,
            "Instance is active"
        );
        InstanceOutcome::Active
    }
}

/// Drops window entries older than one hour before `now`
fn prune_window(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    let cutoff = now - chrono::Duration::hours(1);
    while window.front().map_or(false, |t| *t <= cutoff) {
        window.pop_front();
    }
}
