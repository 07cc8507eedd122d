//! Idle detection management
//!
//! The [`IdleManager`] owns the idle configuration (profiles, domain
//! mappings, per-instance overrides), tracks per-instance idle state as
//! metrics arrive, and keeps an append-only history of executed actions.
//! Configuration and history live as JSON documents under the agent's
//! configuration directory.

use crate::error::{EngineError, Result};
use crate::models::{
    HistoryEntry, IdleAction, IdleConfig, IdleState, InstanceOverride, Profile, ScheduledAction,
    UsageMetrics,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Configuration directory created under the user's home
pub const CONFIG_DIR_NAME: &str = ".cloudworkstation";

const CONFIG_FILE: &str = "idle.json";
const HISTORY_FILE: &str = "idle_history.json";
const LOG_DIR: &str = "logs";
const ACTIONS_LOG_FILE: &str = "idle-actions.log";

/// Profiles that ship with the agent and cannot be removed
pub const BUILTIN_PROFILE_NAMES: [&str; 4] = ["standard", "batch", "gpu", "data-intensive"];

/// The profile set seeded into a fresh configuration
pub fn builtin_profiles() -> HashMap<String, Profile> {
    let profiles = [
        Profile {
            name: "standard".to_string(),
            cpu_threshold: 10.0,
            memory_threshold: 30.0,
            network_threshold: 50.0,
            disk_threshold: 100.0,
            gpu_threshold: 5.0,
            idle_minutes: 30,
            action: IdleAction::Stop,
            notification: true,
        },
        Profile {
            name: "batch".to_string(),
            cpu_threshold: 5.0,
            memory_threshold: 20.0,
            network_threshold: 25.0,
            disk_threshold: 50.0,
            gpu_threshold: 3.0,
            idle_minutes: 60,
            action: IdleAction::Hibernate,
            notification: true,
        },
        Profile {
            name: "gpu".to_string(),
            cpu_threshold: 5.0,
            memory_threshold: 20.0,
            network_threshold: 50.0,
            disk_threshold: 100.0,
            gpu_threshold: 3.0,
            idle_minutes: 15,
            action: IdleAction::Stop,
            notification: true,
        },
        Profile {
            name: "data-intensive".to_string(),
            cpu_threshold: 8.0,
            memory_threshold: 40.0,
            network_threshold: 100.0,
            disk_threshold: 200.0,
            gpu_threshold: 5.0,
            idle_minutes: 45,
            action: IdleAction::Stop,
            notification: true,
        },
    ];

    profiles.into_iter().map(|p| (p.name.clone(), p)).collect()
}

/// Research-domain to profile mappings seeded into a fresh configuration
pub fn default_domain_mappings() -> HashMap<String, String> {
    [
        ("machine-learning", "gpu"),
        ("genomics", "batch"),
        ("data-science", "standard"),
        ("climate-science", "batch"),
        ("visualization", "gpu"),
        ("neuroimaging", "gpu"),
        ("hpc", "batch"),
    ]
    .into_iter()
    .map(|(d, p)| (d.to_string(), p.to_string()))
    .collect()
}

/// Configuration written on first run
pub fn default_idle_config() -> IdleConfig {
    IdleConfig {
        enabled: true,
        default_profile: "standard".to_string(),
        profiles: builtin_profiles(),
        domain_mappings: default_domain_mappings(),
        instance_overrides: HashMap::new(),
    }
}

/// On-disk shape of the history document
#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default)]
    entries: Vec<HistoryEntry>,
}

struct ManagerInner {
    config: IdleConfig,
    history: Vec<HistoryEntry>,
    states: HashMap<String, IdleState>,
}

/// Idle detection manager
///
/// Idle states are in-memory only; durable snapshots are the concern of
/// the service-level state store. Configuration and history mutations are
/// written back to disk immediately.
pub struct IdleManager {
    config_path: PathBuf,
    history_path: PathBuf,
    actions_log_path: PathBuf,
    inner: RwLock<ManagerInner>,
}

impl IdleManager {
    /// Opens the manager rooted at `config_dir`, seeding a default
    /// configuration on first run
    pub fn new(config_dir: impl AsRef<Path>) -> Result<Self> {
        let config_dir = config_dir.as_ref();
        let log_dir = config_dir.join(LOG_DIR);
        fs::create_dir_all(&log_dir).map_err(|e| EngineError::persistence(&log_dir, e))?;

        let config_path = config_dir.join(CONFIG_FILE);
        let history_path = config_dir.join(HISTORY_FILE);
        let actions_log_path = log_dir.join(ACTIONS_LOG_FILE);

        let config = load_or_seed_config(&config_path)?;
        let history = load_history(&history_path)?;

        Ok(Self {
            config_path,
            history_path,
            actions_log_path,
            inner: RwLock::new(ManagerInner {
                config,
                history,
                states: HashMap::new(),
            }),
        })
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.read().await.config.enabled
    }

    pub async fn enable(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.config.enabled = true;
        self.persist_config(&inner.config)
    }

    pub async fn disable(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.config.enabled = false;
        self.persist_config(&inner.config)
    }

    pub async fn config(&self) -> IdleConfig {
        self.inner.read().await.config.clone()
    }

    pub async fn profiles(&self) -> HashMap<String, Profile> {
        self.inner.read().await.config.profiles.clone()
    }

    pub async fn profile(&self, name: &str) -> Result<Profile> {
        self.inner
            .read()
            .await
            .config
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("profile", name))
    }

    /// Adds or replaces a profile
    pub async fn add_profile(&self, profile: Profile) -> Result<()> {
        if profile.name.is_empty() {
            return Err(EngineError::validation("profile name cannot be empty"));
        }

        let mut inner = self.inner.write().await;
        inner.config.profiles.insert(profile.name.clone(), profile);
        self.persist_config(&inner.config)
    }

    /// Removes a custom profile
    ///
    /// Built-in profiles cannot be removed, and neither can the profile
    /// currently set as the default.
    pub async fn remove_profile(&self, name: &str) -> Result<()> {
        if BUILTIN_PROFILE_NAMES.contains(&name) {
            return Err(EngineError::validation(format!(
                "cannot remove built-in profile {name:?}"
            )));
        }

        let mut inner = self.inner.write().await;
        if !inner.config.profiles.contains_key(name) {
            return Err(EngineError::not_found("profile", name));
        }
        if inner.config.default_profile == name {
            return Err(EngineError::conflict(format!(
                "profile {name:?} is the default profile; change the default first"
            )));
        }

        inner.config.profiles.remove(name);
        self.persist_config(&inner.config)
    }

    pub async fn default_profile(&self) -> Result<Profile> {
        let inner = self.inner.read().await;
        inner
            .config
            .profiles
            .get(&inner.config.default_profile)
            .cloned()
            .ok_or_else(|| EngineError::not_found("profile", &inner.config.default_profile))
    }

    pub async fn set_default_profile(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.config.profiles.contains_key(name) {
            return Err(EngineError::not_found("profile", name));
        }

        inner.config.default_profile = name.to_string();
        self.persist_config(&inner.config)
    }

    pub async fn domain_mappings(&self) -> HashMap<String, String> {
        self.inner.read().await.config.domain_mappings.clone()
    }

    /// Profile name mapped to a research domain, if any
    pub async fn profile_for_domain(&self, domain: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .config
            .domain_mappings
            .get(domain)
            .cloned()
    }

    pub async fn set_domain_mapping(&self, domain: &str, profile: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.config.profiles.contains_key(profile) {
            return Err(EngineError::not_found("profile", profile));
        }

        inner
            .config
            .domain_mappings
            .insert(domain.to_string(), profile.to_string());
        self.persist_config(&inner.config)
    }

    pub async fn remove_domain_mapping(&self, domain: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.config.domain_mappings.remove(domain);
        self.persist_config(&inner.config)
    }

    pub async fn instance_overrides(&self) -> HashMap<String, InstanceOverride> {
        self.inner.read().await.config.instance_overrides.clone()
    }

    pub async fn instance_override(&self, instance: &str) -> Option<InstanceOverride> {
        self.inner
            .read()
            .await
            .config
            .instance_overrides
            .get(instance)
            .cloned()
    }

    /// Sets a per-instance override, keyed by instance name
    pub async fn set_instance_override(
        &self,
        instance: &str,
        override_: InstanceOverride,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !override_.profile.is_empty() && !inner.config.profiles.contains_key(&override_.profile)
        {
            return Err(EngineError::not_found("profile", &override_.profile));
        }

        inner
            .config
            .instance_overrides
            .insert(instance.to_string(), override_);
        self.persist_config(&inner.config)
    }

    pub async fn remove_instance_override(&self, instance: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.config.instance_overrides.remove(instance);
        self.persist_config(&inner.config)
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.inner.read().await.history.clone()
    }

    pub async fn instance_history(&self, instance_id: &str) -> Vec<HistoryEntry> {
        self.inner
            .read()
            .await
            .history
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// Most recent entries first, capped at `limit`
    pub async fn recent_history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.inner
            .read()
            .await
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Appends an executed action to the history and the actions log
    pub async fn record_action(&self, entry: HistoryEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.append_action_log(&entry)?;
        inner.history.push(entry);
        self.persist_history(&inner.history)
    }

    pub async fn clear_history(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.history.clear();
        self.persist_history(&inner.history)
    }

    pub async fn idle_state(&self, instance_id: &str) -> Option<IdleState> {
        self.inner.read().await.states.get(instance_id).cloned()
    }

    pub async fn set_idle_state(&self, state: IdleState) {
        let mut inner = self.inner.write().await;
        inner.states.insert(state.instance_id.clone(), state);
    }

    pub async fn remove_idle_state(&self, instance_id: &str) {
        let mut inner = self.inner.write().await;
        inner.states.remove(instance_id);
    }

    /// Clears a pending action once it has been dispatched
    pub async fn clear_next_action(&self, instance_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(state) = inner.states.get_mut(instance_id) {
            state.next_action = None;
        }
    }

    /// Snapshot of all tracked idle states, keyed by instance id
    pub async fn all_states(&self) -> HashMap<String, IdleState> {
        self.inner.read().await.states.clone()
    }

    /// Replaces the tracked states wholesale, used on daemon recovery
    pub async fn restore_states(&self, states: HashMap<String, IdleState>) {
        let mut inner = self.inner.write().await;
        inner.states = states;
    }

    /// Folds a metrics snapshot into the instance's idle state
    ///
    /// Returns `None` while idle detection is disabled. Explicit user
    /// activity always resets the state to active. Without activity the
    /// snapshot is idle when every metric sits at or below its profile
    /// threshold; the first idle snapshot starts the clock and schedules
    /// the profile action, later idle snapshots leave the clock alone.
    pub async fn process_metrics(
        &self,
        instance_id: &str,
        instance_name: &str,
        metrics: UsageMetrics,
    ) -> Option<IdleState> {
        let mut inner = self.inner.write().await;
        let ManagerInner { config, states, .. } = &mut *inner;

        if !config.enabled {
            return None;
        }

        let state = states
            .entry(instance_id.to_string())
            .or_insert_with(|| IdleState {
                instance_id: instance_id.to_string(),
                instance_name: instance_name.to_string(),
                profile: config.default_profile.clone(),
                is_idle: false,
                idle_since: None,
                last_activity: metrics.timestamp,
                next_action: None,
                last_metrics: None,
            });

        let profile = resolve_profile(config, &state.profile, instance_name);
        state.profile = profile.name.clone();
        state.last_metrics = Some(metrics.clone());

        if metrics.has_activity {
            state.last_activity = metrics.timestamp;
            state.is_idle = false;
            state.idle_since = None;
            state.next_action = None;
            return Some(state.clone());
        }

        let is_idle = within_thresholds(&metrics, &profile);

        if is_idle && !state.is_idle {
            state.is_idle = true;
            state.idle_since = Some(metrics.timestamp);
            state.next_action = Some(ScheduledAction {
                action: profile.action,
                time: metrics.timestamp + Duration::minutes(profile.idle_minutes),
            });
        } else if !is_idle && state.is_idle {
            state.is_idle = false;
            state.idle_since = None;
            state.next_action = None;
            state.last_activity = metrics.timestamp;
        }

        Some(state.clone())
    }

    /// States whose scheduled action has come due
    pub async fn check_pending_actions(&self) -> Vec<IdleState> {
        self.check_pending_actions_at(Utc::now()).await
    }

    /// Due means the scheduled time is at or before `now`
    pub async fn check_pending_actions_at(&self, now: DateTime<Utc>) -> Vec<IdleState> {
        let inner = self.inner.read().await;
        if !inner.config.enabled {
            return Vec::new();
        }

        inner
            .states
            .values()
            .filter(|s| s.next_action.as_ref().map_or(false, |a| a.time <= now))
            .cloned()
            .collect()
    }

    fn persist_config(&self, config: &IdleConfig) -> Result<()> {
        let data = serde_json::to_vec_pretty(config)?;
        fs::write(&self.config_path, data)
            .map_err(|e| EngineError::persistence(&self.config_path, e))
    }

    fn persist_history(&self, entries: &[HistoryEntry]) -> Result<()> {
        let file = HistoryFile {
            entries: entries.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&file)?;
        fs::write(&self.history_path, data)
            .map_err(|e| EngineError::persistence(&self.history_path, e))
    }

    fn append_action_log(&self, entry: &HistoryEntry) -> Result<()> {
        let line = format!(
            "[{}] {}: Instance {} ({}) {} after being idle for {}\n",
            entry.time.to_rfc3339(),
            entry.action,
            entry.instance_name,
            entry.instance_id,
            entry.action,
            format_idle_duration(entry.idle_duration_secs),
        );

        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.actions_log_path)
            .map_err(|e| EngineError::persistence(&self.actions_log_path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| EngineError::persistence(&self.actions_log_path, e))
    }
}

/// Profile used for a metrics snapshot
///
/// An instance override wins and may patch individual fields on top of its
/// base profile. Otherwise the profile already recorded on the state is
/// kept, so a renamed default does not silently retarget known instances.
fn resolve_profile(config: &IdleConfig, state_profile: &str, instance_name: &str) -> Profile {
    let fallback = |name: &str| {
        config
            .profiles
            .get(name)
            .or_else(|| config.profiles.get(&config.default_profile))
            .cloned()
            .unwrap_or_else(standard_profile)
    };

    match config.instance_overrides.get(instance_name) {
        Some(override_) => {
            let mut profile = fallback(&override_.profile);
            if let Some(v) = override_.cpu_threshold {
                profile.cpu_threshold = v;
            }
            if let Some(v) = override_.memory_threshold {
                profile.memory_threshold = v;
            }
            if let Some(v) = override_.network_threshold {
                profile.network_threshold = v;
            }
            if let Some(v) = override_.disk_threshold {
                profile.disk_threshold = v;
            }
            if let Some(v) = override_.gpu_threshold {
                profile.gpu_threshold = v;
            }
            if let Some(v) = override_.idle_minutes {
                profile.idle_minutes = v;
            }
            if let Some(v) = override_.action {
                profile.action = v;
            }
            if let Some(v) = override_.notification {
                profile.notification = v;
            }
            profile
        }
        None => fallback(state_profile),
    }
}

/// Every metric at or below its threshold counts as idle; the GPU
/// threshold applies only when the instance reports a GPU
fn within_thresholds(metrics: &UsageMetrics, profile: &Profile) -> bool {
    let mut idle = metrics.cpu <= profile.cpu_threshold
        && metrics.memory <= profile.memory_threshold
        && metrics.network <= profile.network_threshold
        && metrics.disk <= profile.disk_threshold;

    if let Some(gpu) = metrics.gpu {
        idle = idle && gpu <= profile.gpu_threshold;
    }

    idle
}

/// Last-resort profile when the configuration lost its default
fn standard_profile() -> Profile {
    builtin_profiles()
        .remove("standard")
        .unwrap_or_else(|| Profile {
            name: "standard".to_string(),
            cpu_threshold: 10.0,
            memory_threshold: 30.0,
            network_threshold: 50.0,
            disk_threshold: 100.0,
            gpu_threshold: 5.0,
            idle_minutes: 30,
            action: IdleAction::Stop,
            notification: true,
        })
}

fn format_idle_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else {
        format!("{minutes}m{seconds}s")
    }
}

fn load_or_seed_config(path: &Path) -> Result<IdleConfig> {
    if !path.exists() {
        let config = default_idle_config();
        let data = serde_json::to_vec_pretty(&config)?;
        fs::write(path, data).map_err(|e| EngineError::persistence(path, e))?;
        return Ok(config);
    }

    let data = fs::read(path).map_err(|e| EngineError::persistence(path, e))?;
    Ok(serde_json::from_slice(&data)?)
}

fn load_history(path: &Path) -> Result<Vec<HistoryEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let data = fs::read(path).map_err(|e| EngineError::persistence(path, e))?;
    let file: HistoryFile = serde_json::from_slice(&data)?;
    Ok(file.entries)
}
