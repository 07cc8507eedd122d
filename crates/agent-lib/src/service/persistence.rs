//! Durable snapshots of the service state
//!
//! The daemon must survive restarts and reboots without losing idle
//! tracking: a [`PersistentState`] document captures every instance's
//! idle state plus the active service configuration, and the
//! [`StateStore`] writes it atomically (write-temp-then-rename) so a
//! crash mid-save never corrupts the previous snapshot. A separate
//! configuration override document supports reload-without-restart.

use crate::error::{EngineError, Result};
use crate::models::{IdleState, ScheduledAction};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::autonomous::AutonomousConfig;

/// Bumped when the snapshot layout changes incompatibly
pub const STATE_SCHEMA_VERSION: u32 = 1;

const STATE_FILE: &str = "autonomous_state.json";
const CONFIG_OVERRIDE_FILE: &str = "autonomous_config.json";

/// Why a snapshot was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveReason {
    Periodic,
    Shutdown,
    Reload,
}

impl SaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveReason::Periodic => "periodic",
            SaveReason::Shutdown => "shutdown",
            SaveReason::Reload => "reload",
        }
    }
}

impl std::fmt::Display for SaveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the daemon needs to pick up where it left off
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default)]
    pub version: u32,
    pub idle_states: HashMap<String, IdleState>,
    pub config: AutonomousConfig,
    /// When this snapshot was written; downtime is measured against it
    pub last_update: DateTime<Utc>,
    /// How long the daemon had been up when the snapshot was written
    pub daemon_uptime_secs: i64,
    pub save_reason: SaveReason,
}

impl PersistentState {
    /// Wall-clock gap between the snapshot and `now`, clamped at zero
    pub fn downtime(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_update).max(Duration::zero())
    }

    /// Actions whose trigger time elapsed while the daemon was down
    ///
    /// These are reported so the first cycle can handle them immediately;
    /// they are never dropped from the restored states.
    pub fn overdue_actions(&self, now: DateTime<Utc>) -> Vec<(String, ScheduledAction)> {
        self.idle_states
            .values()
            .filter_map(|state| {
                let action = state.next_action.as_ref()?;
                (action.time <= now)
                    .then(|| (state.instance_name.clone(), action.clone()))
            })
            .collect()
    }
}

/// Reads and writes the snapshot and configuration override documents
///
/// Both documents live in the per-user state directory and are written
/// atomically with mode 0600; they hold instance names and usage data
/// that other users have no business reading.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    config_path: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let state_dir = state_dir.as_ref();
        Self {
            state_path: state_dir.join(STATE_FILE),
            config_path: state_dir.join(CONFIG_OVERRIDE_FILE),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Persists a snapshot atomically
    pub fn save(&self, state: &PersistentState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.state_path, &data)
    }

    /// Loads the prior snapshot, or `None` on a fresh start
    pub fn load(&self) -> Result<Option<PersistentState>> {
        let Some(data) = read_if_exists(&self.state_path)? else {
            return Ok(None);
        };
        let state: PersistentState = serde_json::from_slice(&data)?;
        if state.version != STATE_SCHEMA_VERSION {
            warn!(
                event = "state_version_mismatch",
                found = state.version,
                expected = STATE_SCHEMA_VERSION,
                "Snapshot was written by a different schema version"
            );
        }
        Ok(Some(state))
    }

    /// Persists the configuration override document atomically
    pub fn save_config(&self, config: &AutonomousConfig) -> Result<()> {
        let data = serde_json::to_vec_pretty(config)?;
        write_atomic(&self.config_path, &data)
    }

    /// Loads the configuration override, or `None` when the operator has
    /// not written one
    pub fn load_config(&self) -> Result<Option<AutonomousConfig>> {
        let Some(data) = read_if_exists(&self.config_path)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }
}

/// Write-temp-then-rename so readers only ever see a complete document
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::persistence(parent, e))?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|e| EngineError::persistence(&temp_path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| EngineError::persistence(&temp_path, e))?;
    }

    file.write_all(data)
        .map_err(|e| EngineError::persistence(&temp_path, e))?;
    file.sync_all()
        .map_err(|e| EngineError::persistence(&temp_path, e))?;

    fs::rename(&temp_path, path).map_err(|e| EngineError::persistence(path, e))
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EngineError::persistence(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IdleAction;
    use chrono::TimeZone;

    fn sample_state(instance: &str, next_action_at: Option<DateTime<Utc>>) -> IdleState {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap();
        IdleState {
            instance_id: format!("i-{instance}"),
            instance_name: instance.to_string(),
            profile: "standard".to_string(),
            is_idle: next_action_at.is_some(),
            idle_since: next_action_at.map(|_| t0),
            last_activity: t0,
            next_action: next_action_at.map(|time| ScheduledAction {
                action: IdleAction::Stop,
                time,
            }),
            last_metrics: None,
        }
    }

    fn sample_snapshot(states: Vec<IdleState>) -> PersistentState {
        PersistentState {
            version: STATE_SCHEMA_VERSION,
            idle_states: states
                .into_iter()
                .map(|s| (s.instance_id.clone(), s))
                .collect(),
            config: AutonomousConfig::default(),
            last_update: Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap(),
            daemon_uptime_secs: 3600,
            save_reason: SaveReason::Periodic,
        }
    }

    #[test]
    fn test_snapshot_round_trip_preserves_idle_states() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        let due = Utc.with_ymd_and_hms(2025, 6, 2, 9, 30, 0).unwrap();
        let snapshot = sample_snapshot(vec![
            sample_state("ws-idle", Some(due)),
            sample_state("ws-active", None),
        ]);
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.version, STATE_SCHEMA_VERSION);
        assert_eq!(loaded.save_reason, SaveReason::Periodic);
        assert_eq!(loaded.idle_states.len(), 2);
        assert_eq!(loaded.idle_states["i-ws-idle"], snapshot.idle_states["i-ws-idle"]);
        assert_eq!(
            loaded.idle_states["i-ws-idle"].idle_since,
            snapshot.idle_states["i-ws-idle"].idle_since
        );
    }

    #[test]
    fn test_load_without_snapshot_is_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&sample_snapshot(vec![])).unwrap();

        assert!(store.state_path().exists());
        assert!(!store.state_path().with_extension("tmp").exists());
    }

    #[test]
    fn test_save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store.save(&sample_snapshot(vec![])).unwrap();
        let mut second = sample_snapshot(vec![sample_state("ws-1", None)]);
        second.save_reason = SaveReason::Shutdown;
        store.save(&second).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.save_reason, SaveReason::Shutdown);
        assert_eq!(loaded.idle_states.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_is_user_readable_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&sample_snapshot(vec![])).unwrap();

        let mode = fs::metadata(store.state_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_snapshot_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(store.state_path(), b"{ not json").unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, EngineError::Serialization(_)));
    }

    #[test]
    fn test_missing_version_field_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        let mut doc = serde_json::to_value(sample_snapshot(vec![])).unwrap();
        doc.as_object_mut().unwrap().remove("version");
        fs::write(store.state_path(), serde_json::to_vec(&doc).unwrap()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.version, 0);
    }

    #[test]
    fn test_overdue_actions_only_reports_elapsed_triggers() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let snapshot = sample_snapshot(vec![
            sample_state("ws-overdue", Some(now - Duration::minutes(20))),
            sample_state("ws-later", Some(now + Duration::minutes(20))),
            sample_state("ws-none", None),
        ]);

        let overdue = snapshot.overdue_actions(now);
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].0, "ws-overdue");
        assert_eq!(overdue[0].1.action, IdleAction::Stop);
    }

    #[test]
    fn test_downtime_is_clamped_at_zero() {
        let snapshot = sample_snapshot(vec![]);
        let before = snapshot.last_update - Duration::minutes(5);
        assert_eq!(snapshot.downtime(before), Duration::zero());

        let after = snapshot.last_update + Duration::minutes(5);
        assert_eq!(snapshot.downtime(after), Duration::minutes(5));
    }

    #[test]
    fn test_config_override_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        assert!(store.load_config().unwrap().is_none());

        let config = AutonomousConfig {
            dry_run: true,
            max_actions_per_hour: 3,
            ..AutonomousConfig::default()
        };
        store.save_config(&config).unwrap();

        let loaded = store.load_config().unwrap().unwrap();
        assert!(loaded.dry_run);
        assert_eq!(loaded.max_actions_per_hour, 3);
    }
}
