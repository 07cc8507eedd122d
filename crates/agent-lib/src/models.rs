//! Core data models for the hibernation agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Action taken when an instance is determined to be idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleAction {
    Stop,
    Hibernate,
    Notify,
}

impl fmt::Display for IdleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleAction::Stop => write!(f, "stop"),
            IdleAction::Hibernate => write!(f, "hibernate"),
            IdleAction::Notify => write!(f, "notify"),
        }
    }
}

/// Idle detection profile with resource thresholds
///
/// An instance is considered idle only when every metric is at or below
/// its threshold and no user activity is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    /// CPU usage threshold, percent
    pub cpu_threshold: f64,
    /// Memory usage threshold, percent
    pub memory_threshold: f64,
    /// Network activity threshold, KBps
    pub network_threshold: f64,
    /// Disk I/O threshold, KBps
    pub disk_threshold: f64,
    /// GPU usage threshold, percent (checked only when GPU metrics exist)
    pub gpu_threshold: f64,
    /// Minutes of continuous idleness before the action fires
    pub idle_minutes: i64,
    pub action: IdleAction,
    pub notification: bool,
}

/// Per-instance override layered on top of a named profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceOverride {
    /// Profile name to use; empty falls back to the default profile
    pub profile: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<IdleAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<bool>,
}

/// Idle detection configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub enabled: bool,
    pub default_profile: String,
    pub profiles: HashMap<String, Profile>,
    pub domain_mappings: HashMap<String, String>,
    pub instance_overrides: HashMap<String, InstanceOverride>,
}

/// Resource usage snapshot for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub timestamp: DateTime<Utc>,
    /// CPU usage percentage (0-100)
    pub cpu: f64,
    /// Memory usage percentage (0-100)
    pub memory: f64,
    /// Network activity in KBps
    pub network: f64,
    /// Disk I/O in KBps
    pub disk: f64,
    /// GPU usage percentage, if a GPU is present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<f64>,
    /// Whether user activity (sessions, input, processes) was detected
    pub has_activity: bool,
}

/// An action scheduled to fire at a specific time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub action: IdleAction,
    pub time: DateTime<Utc>,
}

/// Idle tracking state for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleState {
    pub instance_id: String,
    pub instance_name: String,
    /// Name of the profile resolved for this instance
    pub profile: String,
    pub is_idle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_since: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_action: Option<ScheduledAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_metrics: Option<UsageMetrics>,
}

/// Audit record of an executed idle action, immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub instance_id: String,
    pub instance_name: String,
    pub action: IdleAction,
    pub time: DateTime<Utc>,
    /// How long the instance had been idle when the action fired
    pub idle_duration_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<UsageMetrics>,
}

/// Kind of hibernation schedule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleKind {
    #[default]
    Daily,
    Weekly,
    WorkHours,
    Idle,
    Custom,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Daily => "daily",
            ScheduleKind::Weekly => "weekly",
            ScheduleKind::WorkHours => "workHours",
            ScheduleKind::Idle => "idle",
            ScheduleKind::Custom => "custom",
        }
    }
}

/// Day of the week used in weekly schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    /// Whether this day matches a chrono weekday
    pub fn matches(&self, weekday: chrono::Weekday) -> bool {
        use chrono::Weekday;
        matches!(
            (self, weekday),
            (DayOfWeek::Monday, Weekday::Mon)
                | (DayOfWeek::Tuesday, Weekday::Tue)
                | (DayOfWeek::Wednesday, Weekday::Wed)
                | (DayOfWeek::Thursday, Weekday::Thu)
                | (DayOfWeek::Friday, Weekday::Fri)
                | (DayOfWeek::Saturday, Weekday::Sat)
                | (DayOfWeek::Sunday, Weekday::Sun)
        )
    }
}

/// Action dispatched when a schedule fires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleAction {
    #[default]
    Hibernate,
    Stop,
    /// Present in the catalog but refused by the dispatcher for safety
    Terminate,
    /// Log-only action used by conservative production policies
    Alert,
}

impl fmt::Display for ScheduleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleAction::Hibernate => write!(f, "hibernate"),
            ScheduleAction::Stop => write!(f, "stop"),
            ScheduleAction::Terminate => write!(f, "terminate"),
            ScheduleAction::Alert => write!(f, "alert"),
        }
    }
}

/// Wake action paired with a schedule's hibernate action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeAction {
    Resume,
    Start,
    #[default]
    None,
}

/// A named hibernation schedule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: ScheduleKind,
    pub enabled: bool,

    /// Specific instance names; empty means all known instances
    pub target_instances: Vec<String>,

    /// Window start in HH:MM format (daily and weekly schedules)
    pub start_time: String,
    /// Window end in HH:MM format (daily and weekly schedules)
    pub end_time: String,
    pub days_of_week: Vec<DayOfWeek>,

    /// Idle-triggered schedules: minutes and thresholds
    pub idle_minutes: i64,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub network_threshold: f64,

    pub hibernate_action: ScheduleAction,
    pub wake_action: WakeAction,

    pub grace_period_minutes: i64,
    pub ignore_tags: Vec<String>,
    pub require_tags: Vec<String>,

    /// Heuristic monthly savings estimate, recomputed on create and update
    pub estimated_monthly_savings: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<DateTime<Utc>>,
    pub total_savings: f64,
}

/// Category of a policy template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyCategory {
    Aggressive,
    Balanced,
    Conservative,
    Development,
    Production,
    Research,
    Custom,
}

/// Pre-configured hibernation policy bundling several schedules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: PolicyCategory,
    pub schedules: Vec<Schedule>,
    #[serde(default)]
    pub tags: HashMap<String, String>,

    pub estimated_savings_percent: f64,
    #[serde(default)]
    pub suitable_for: Vec<String>,

    pub auto_apply: bool,
    pub priority: i32,
    /// IDs of templates that cannot coexist with this one on an instance
    #[serde(default)]
    pub conflicts: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_kind_wire_names() {
        let json = serde_json::to_string(&ScheduleKind::WorkHours).unwrap();
        assert_eq!(json, "\"workHours\"");
        let kind: ScheduleKind = serde_json::from_str("\"daily\"").unwrap();
        assert_eq!(kind, ScheduleKind::Daily);
    }

    #[test]
    fn test_day_of_week_matches_chrono() {
        assert!(DayOfWeek::Saturday.matches(chrono::Weekday::Sat));
        assert!(!DayOfWeek::Saturday.matches(chrono::Weekday::Mon));
    }

    #[test]
    fn test_schedule_round_trip_with_partial_json() {
        // Persisted schedules may omit fields that were never set
        let json = r#"{"id":"sched-1","name":"Night","type":"daily","start_time":"20:00","end_time":"08:00","hibernate_action":"hibernate"}"#;
        let schedule: Schedule = serde_json::from_str(json).unwrap();
        assert_eq!(schedule.kind, ScheduleKind::Daily);
        assert_eq!(schedule.wake_action, WakeAction::None);
        assert!(!schedule.enabled);
        assert!(schedule.target_instances.is_empty());
    }

    #[test]
    fn test_idle_state_omits_empty_optionals() {
        let state = IdleState {
            instance_id: "i-123".to_string(),
            instance_name: "ws-1".to_string(),
            profile: "standard".to_string(),
            is_idle: false,
            idle_since: None,
            last_activity: Utc::now(),
            next_action: None,
            last_metrics: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("idle_since"));
        assert!(!json.contains("next_action"));
    }
}
