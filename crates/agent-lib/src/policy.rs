//! Hibernation policy templates and per-instance application.
//!
//! A [`PolicyTemplate`] bundles schedules with category-appropriate defaults
//! so operators do not have to hand-build schedules per instance. Applying a
//! template registers its schedules with the [`Scheduler`] (clones, never the
//! canonical template objects) and assigns them to the instance. The manager
//! remembers which scheduler ids a template's schedules were registered
//! under, so applying the same template to a second instance reuses them
//! instead of creating duplicates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::models::{
    DayOfWeek, PolicyCategory, PolicyTemplate, Schedule, ScheduleAction, ScheduleKind, WakeAction,
};
use crate::scheduler::{hours_between, Scheduler};

const HOURS_PER_WEEK: f64 = 24.0 * 7.0;

static TEMPLATE_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique id for custom templates; the sequence keeps ids distinct when
/// several are created within the same second
fn generate_template_id() -> String {
    let seq = TEMPLATE_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("custom-{}-{}", Utc::now().timestamp(), seq)
}

struct PolicyInner {
    templates: HashMap<String, PolicyTemplate>,
    /// Instance name to applied template ids
    applied: HashMap<String, Vec<String>>,
    /// Template id to the scheduler ids its schedules are registered under,
    /// positionally aligned with the template's schedule list
    template_schedules: HashMap<String, Vec<String>>,
}

impl PolicyInner {
    /// Bidirectional conflict check against the templates already applied to
    /// the instance
    fn check_conflicts(&self, instance: &str, template: &PolicyTemplate) -> Result<()> {
        let applied = match self.applied.get(instance) {
            Some(ids) => ids,
            None => return Ok(()),
        };

        for applied_id in applied {
            if template.conflicts.iter().any(|c| c == applied_id) {
                return Err(EngineError::conflict(format!(
                    "template {} conflicts with existing template {}",
                    template.id, applied_id
                )));
            }
            if let Some(existing) = self.templates.get(applied_id) {
                if existing.conflicts.iter().any(|c| c == &template.id) {
                    return Err(EngineError::conflict(format!(
                        "existing template {} conflicts with template {}",
                        applied_id, template.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Policy template catalog and per-instance application state
pub struct PolicyManager {
    scheduler: Arc<Scheduler>,
    inner: RwLock<PolicyInner>,
}

impl PolicyManager {
    /// Creates a manager seeded with the built-in template catalog
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let mut templates = HashMap::new();
        for template in builtin_templates() {
            templates.insert(template.id.clone(), template);
        }

        Self {
            scheduler,
            inner: RwLock::new(PolicyInner {
                templates,
                applied: HashMap::new(),
                template_schedules: HashMap::new(),
            }),
        }
    }

    pub async fn template(&self, id: &str) -> Result<PolicyTemplate> {
        self.inner
            .read()
            .await
            .templates
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("policy template", id))
    }

    /// All templates, ordered by priority then id for stable listings
    pub async fn templates(&self) -> Vec<PolicyTemplate> {
        let inner = self.inner.read().await;
        let mut templates: Vec<PolicyTemplate> = inner.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        templates
    }

    pub async fn templates_by_category(&self, category: PolicyCategory) -> Vec<PolicyTemplate> {
        self.templates()
            .await
            .into_iter()
            .filter(|t| t.category == category)
            .collect()
    }

    /// Applies a template to an instance and returns the scheduler ids that
    /// were assigned.
    ///
    /// Conflicts with already-applied templates are checked in both
    /// directions before anything is registered, so a rejected application
    /// leaves no partial state. The template's schedules are registered with
    /// the scheduler first (reusing registrations from earlier applications)
    /// and only assigned once all of them exist; the applied marker is
    /// committed last, after every assignment succeeded.
    pub async fn apply_template(&self, instance: &str, template_id: &str) -> Result<Vec<String>> {
        let (template, tracked) = {
            let inner = self.inner.read().await;
            let template = inner
                .templates
                .get(template_id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("policy template", template_id))?;

            let already = inner
                .applied
                .get(instance)
                .map(|ids| ids.iter().any(|id| id == template_id))
                .unwrap_or(false);
            if already {
                return Err(EngineError::conflict(format!(
                    "template {template_id} is already applied to instance {instance}"
                )));
            }
            inner.check_conflicts(instance, &template)?;

            let tracked = inner
                .template_schedules
                .get(template_id)
                .cloned()
                .unwrap_or_default();
            (template, tracked)
        };

        // Register each schedule, reusing a previously registered id when the
        // scheduler still knows it. The catalog lock is not held across
        // scheduler calls.
        let mut schedule_ids = Vec::with_capacity(template.schedules.len());
        let mut failure = None;
        for (position, schedule) in template.schedules.iter().enumerate() {
            let mut reused = None;
            if let Some(existing) = tracked.get(position) {
                if self.scheduler.schedule(existing).await.is_ok() {
                    reused = Some(existing.clone());
                }
            }

            let schedule_id = match reused {
                Some(id) => id,
                None => {
                    let mut fresh = schedule.clone();
                    fresh.id = String::new();
                    match self.scheduler.create_schedule(fresh).await {
                        Ok(created) => created.id,
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
            };
            schedule_ids.push(schedule_id);
        }

        // Registrations are remembered even when a later schedule failed
        // validation, so a retry reuses them instead of creating duplicates.
        {
            let mut inner = self.inner.write().await;
            inner
                .template_schedules
                .insert(template_id.to_string(), schedule_ids.clone());
        }
        if let Some(err) = failure {
            return Err(err);
        }

        for schedule_id in &schedule_ids {
            self.scheduler.assign_to_instance(schedule_id, instance).await?;
        }

        let mut inner = self.inner.write().await;
        inner
            .applied
            .entry(instance.to_string())
            .or_default()
            .push(template_id.to_string());
        info!(
            event = "template_applied",
            template = template_id,
            instance = instance,
            schedules = schedule_ids.len(),
            "Applied policy template"
        );

        Ok(schedule_ids)
    }

    /// Removes a template from an instance.
    ///
    /// Unassignment is best-effort: one schedule's failure is logged and the
    /// rest are still removed. The schedules themselves stay registered with
    /// the scheduler for other instances using the same template.
    pub async fn remove_template(&self, instance: &str, template_id: &str) -> Result<()> {
        let tracked = {
            let mut inner = self.inner.write().await;
            let applied = inner
                .applied
                .get_mut(instance)
                .ok_or_else(|| EngineError::not_found("applied policies", instance))?;

            let before = applied.len();
            applied.retain(|id| id != template_id);
            if applied.len() == before {
                return Err(EngineError::not_found("applied template", template_id));
            }
            let drop_entry = applied.is_empty();
            if drop_entry {
                inner.applied.remove(instance);
            }

            inner
                .template_schedules
                .get(template_id)
                .cloned()
                .unwrap_or_default()
        };

        for schedule_id in &tracked {
            if let Err(err) = self.scheduler.remove_from_instance(schedule_id, instance).await {
                warn!(
                    event = "schedule_unassign_failed",
                    schedule_id = %schedule_id,
                    instance = instance,
                    error = %err,
                    "Failed to unassign schedule while removing template"
                );
            }
        }

        info!(
            event = "template_removed",
            template = template_id,
            instance = instance,
            "Removed policy template"
        );
        Ok(())
    }

    /// Templates currently applied to an instance, skipping ids whose
    /// template no longer exists
    pub async fn applied_templates(&self, instance: &str) -> Vec<PolicyTemplate> {
        let inner = self.inner.read().await;
        match inner.applied.get(instance) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| inner.templates.get(id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Recommends a template from the environment class carried in the
    /// instance tags (`env`, falling back to `environment`); unclassified
    /// instances get the balanced template
    pub async fn recommend_template(
        &self,
        _instance_type: &str,
        tags: &HashMap<String, String>,
    ) -> Result<PolicyTemplate> {
        let env = tags
            .get("env")
            .or_else(|| tags.get("environment"))
            .map(String::as_str)
            .unwrap_or("");

        match env {
            "production" | "prod" => self.template("production").await,
            "development" | "dev" => self.template("development").await,
            "research" | "ml" | "datascience" => self.template("research").await,
            _ => self.template("balanced").await,
        }
    }

    /// Creates a custom template from the given schedules with a savings
    /// percentage estimated from their weekly hibernation hours
    pub async fn create_custom_template(
        &self,
        name: &str,
        description: &str,
        schedules: Vec<Schedule>,
    ) -> Result<PolicyTemplate> {
        let template = PolicyTemplate {
            id: generate_template_id(),
            name: name.to_string(),
            description: description.to_string(),
            category: PolicyCategory::Custom,
            estimated_savings_percent: estimate_savings_percent(&schedules),
            schedules,
            tags: HashMap::new(),
            suitable_for: Vec::new(),
            auto_apply: false,
            priority: 10,
            conflicts: Vec::new(),
        };

        let mut inner = self.inner.write().await;
        inner.templates.insert(template.id.clone(), template.clone());
        info!(event = "template_created", template = %template.id, "Created custom policy template");
        Ok(template)
    }
}

/// Fraction of the week the schedules would keep an instance hibernated,
/// as a percentage capped at 100
fn estimate_savings_percent(schedules: &[Schedule]) -> f64 {
    let mut hibernation_hours = 0.0;
    for schedule in schedules {
        match schedule.kind {
            ScheduleKind::Daily => {
                hibernation_hours += hours_between(&schedule.start_time, &schedule.end_time) * 7.0;
            }
            ScheduleKind::Weekly => {
                hibernation_hours += hours_between(&schedule.start_time, &schedule.end_time)
                    * schedule.days_of_week.len() as f64;
            }
            // Nights on weekdays plus full weekends
            ScheduleKind::WorkHours => hibernation_hours += 15.0 * 5.0 + 24.0 * 2.0,
            ScheduleKind::Idle => {
                hibernation_hours += schedule.idle_minutes as f64 / 60.0 * 24.0;
            }
            ScheduleKind::Custom => {}
        }
    }

    hibernation_hours.min(HOURS_PER_WEEK) / HOURS_PER_WEEK * 100.0
}

fn builtin_templates() -> Vec<PolicyTemplate> {
    vec![
        PolicyTemplate {
            id: "aggressive-cost".to_string(),
            name: "Aggressive Cost Optimization".to_string(),
            description: "Maximizes cost savings with frequent hibernation. Best for development and testing environments.".to_string(),
            category: PolicyCategory::Aggressive,
            schedules: vec![
                Schedule {
                    name: "Business Hours Only".to_string(),
                    kind: ScheduleKind::WorkHours,
                    hibernate_action: ScheduleAction::Hibernate,
                    wake_action: WakeAction::Resume,
                    idle_minutes: 10,
                    cpu_threshold: 5.0,
                    memory_threshold: 10.0,
                    ..Default::default()
                },
                Schedule {
                    name: "Weekend Shutdown".to_string(),
                    kind: ScheduleKind::Weekly,
                    days_of_week: vec![DayOfWeek::Saturday, DayOfWeek::Sunday],
                    start_time: "00:00".to_string(),
                    end_time: "23:59".to_string(),
                    hibernate_action: ScheduleAction::Stop,
                    ..Default::default()
                },
            ],
            tags: HashMap::new(),
            estimated_savings_percent: 65.0,
            suitable_for: vec![
                "development".to_string(),
                "testing".to_string(),
                "staging".to_string(),
            ],
            auto_apply: false,
            priority: 1,
            conflicts: Vec::new(),
        },
        PolicyTemplate {
            id: "balanced".to_string(),
            name: "Balanced Performance".to_string(),
            description: "Balances cost savings with availability. Suitable for most workloads.".to_string(),
            category: PolicyCategory::Balanced,
            schedules: vec![
                Schedule {
                    name: "Night Hibernation".to_string(),
                    kind: ScheduleKind::Daily,
                    start_time: "20:00".to_string(),
                    end_time: "08:00".to_string(),
                    hibernate_action: ScheduleAction::Hibernate,
                    wake_action: WakeAction::Resume,
                    ..Default::default()
                },
                Schedule {
                    name: "Idle Detection".to_string(),
                    kind: ScheduleKind::Idle,
                    idle_minutes: 30,
                    cpu_threshold: 10.0,
                    memory_threshold: 20.0,
                    hibernate_action: ScheduleAction::Hibernate,
                    ..Default::default()
                },
            ],
            tags: HashMap::new(),
            estimated_savings_percent: 40.0,
            suitable_for: vec!["general".to_string(), "web".to_string(), "api".to_string()],
            auto_apply: true,
            priority: 2,
            conflicts: Vec::new(),
        },
        PolicyTemplate {
            id: "conservative".to_string(),
            name: "Conservative Availability".to_string(),
            description: "Minimal hibernation for high-availability workloads.".to_string(),
            category: PolicyCategory::Conservative,
            schedules: vec![Schedule {
                name: "Extended Idle Only".to_string(),
                kind: ScheduleKind::Idle,
                idle_minutes: 60,
                cpu_threshold: 5.0,
                memory_threshold: 10.0,
                hibernate_action: ScheduleAction::Hibernate,
                grace_period_minutes: 15,
                ..Default::default()
            }],
            tags: HashMap::new(),
            estimated_savings_percent: 15.0,
            suitable_for: vec!["production".to_string(), "critical".to_string()],
            auto_apply: false,
            priority: 3,
            conflicts: Vec::new(),
        },
        PolicyTemplate {
            id: "research".to_string(),
            name: "Research Optimization".to_string(),
            description: "Optimized for research workloads with batch processing patterns.".to_string(),
            category: PolicyCategory::Research,
            schedules: vec![
                Schedule {
                    name: "Batch Window".to_string(),
                    kind: ScheduleKind::Daily,
                    start_time: "02:00".to_string(),
                    end_time: "06:00".to_string(),
                    hibernate_action: ScheduleAction::Hibernate,
                    // Manual wake keeps finished batch jobs from restarting
                    wake_action: WakeAction::None,
                    ..Default::default()
                },
                Schedule {
                    name: "GPU Idle Detection".to_string(),
                    kind: ScheduleKind::Idle,
                    idle_minutes: 15,
                    cpu_threshold: 20.0,
                    memory_threshold: 30.0,
                    network_threshold: 10.0,
                    // Stopping saves more than hibernation on GPU instances
                    hibernate_action: ScheduleAction::Stop,
                    ..Default::default()
                },
            ],
            tags: HashMap::from([
                ("workload".to_string(), "batch".to_string()),
                ("gpu".to_string(), "optimized".to_string()),
            ]),
            estimated_savings_percent: 45.0,
            suitable_for: vec!["ml".to_string(), "datascience".to_string(), "hpc".to_string()],
            auto_apply: false,
            priority: 2,
            conflicts: Vec::new(),
        },
        PolicyTemplate {
            id: "development".to_string(),
            name: "Development Environment".to_string(),
            description: "Aggressive hibernation for development instances.".to_string(),
            category: PolicyCategory::Development,
            schedules: vec![
                Schedule {
                    name: "After Hours".to_string(),
                    kind: ScheduleKind::Daily,
                    start_time: "18:00".to_string(),
                    end_time: "09:00".to_string(),
                    hibernate_action: ScheduleAction::Stop,
                    wake_action: WakeAction::Start,
                    ..Default::default()
                },
                Schedule {
                    name: "Quick Idle".to_string(),
                    kind: ScheduleKind::Idle,
                    idle_minutes: 5,
                    cpu_threshold: 5.0,
                    hibernate_action: ScheduleAction::Hibernate,
                    ..Default::default()
                },
                Schedule {
                    name: "Weekend Off".to_string(),
                    kind: ScheduleKind::Weekly,
                    days_of_week: vec![DayOfWeek::Saturday, DayOfWeek::Sunday],
                    hibernate_action: ScheduleAction::Terminate,
                    ..Default::default()
                },
            ],
            tags: HashMap::new(),
            estimated_savings_percent: 75.0,
            suitable_for: vec![
                "dev".to_string(),
                "sandbox".to_string(),
                "experiment".to_string(),
            ],
            auto_apply: true,
            priority: 1,
            conflicts: Vec::new(),
        },
        PolicyTemplate {
            id: "production".to_string(),
            name: "Production Safeguard".to_string(),
            description: "Minimal intervention for production workloads with safety checks.".to_string(),
            category: PolicyCategory::Production,
            schedules: vec![Schedule {
                name: "Emergency Idle".to_string(),
                kind: ScheduleKind::Idle,
                idle_minutes: 120,
                cpu_threshold: 2.0,
                memory_threshold: 5.0,
                // Alert only, production is never hibernated automatically
                hibernate_action: ScheduleAction::Alert,
                grace_period_minutes: 30,
                require_tags: vec!["env:production".to_string()],
                ..Default::default()
            }],
            tags: HashMap::new(),
            estimated_savings_percent: 5.0,
            suitable_for: vec![
                "production".to_string(),
                "critical".to_string(),
                "database".to_string(),
            ],
            auto_apply: false,
            priority: 5,
            conflicts: vec!["aggressive-cost".to_string(), "development".to_string()],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::InstanceLifecycle;
    use async_trait::async_trait;

    struct NullLifecycle;

    #[async_trait]
    impl InstanceLifecycle for NullLifecycle {
        async fn hibernate(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn resume(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn start(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn list_instance_names(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn get_instance_id(&self, name: &str) -> Result<String> {
            Ok(format!("id-{name}"))
        }
    }

    fn manager() -> (Arc<Scheduler>, PolicyManager) {
        let scheduler = Arc::new(Scheduler::new(Arc::new(NullLifecycle), None));
        let policies = PolicyManager::new(Arc::clone(&scheduler));
        (scheduler, policies)
    }

    #[tokio::test]
    async fn test_builtin_catalog() {
        let (_, policies) = manager();

        let templates = policies.templates().await;
        assert_eq!(templates.len(), 6);
        // Sorted by priority, then id
        assert_eq!(templates[0].id, "aggressive-cost");
        assert_eq!(templates[1].id, "development");
        assert_eq!(templates[5].id, "production");

        let balanced = policies.template("balanced").await.unwrap();
        assert!(balanced.auto_apply);
        assert_eq!(balanced.schedules.len(), 2);
        assert_eq!(balanced.schedules[0].kind, ScheduleKind::Daily);

        let production = policies.template("production").await.unwrap();
        assert_eq!(
            production.conflicts,
            vec!["aggressive-cost".to_string(), "development".to_string()]
        );
        assert_eq!(production.schedules[0].hibernate_action, ScheduleAction::Alert);

        let development = policies.template("development").await.unwrap();
        assert_eq!(development.schedules.len(), 3);
    }

    #[tokio::test]
    async fn test_templates_by_category() {
        let (_, policies) = manager();

        let research = policies.templates_by_category(PolicyCategory::Research).await;
        assert_eq!(research.len(), 1);
        assert_eq!(research[0].id, "research");

        assert!(policies
            .templates_by_category(PolicyCategory::Custom)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_template_not_found() {
        let (_, policies) = manager();

        let err = policies.template("nope").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_apply_registers_and_assigns_schedules() {
        let (scheduler, policies) = manager();

        let ids = policies.apply_template("ws-1", "balanced").await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(scheduler.schedule_count().await, 2);

        let assigned = scheduler.instance_schedules("ws-1").await;
        assert_eq!(assigned.len(), 2);

        let applied = policies.applied_templates("ws-1").await;
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].id, "balanced");

        // The canonical template is never mutated
        let canonical = policies.template("balanced").await.unwrap();
        assert!(canonical.schedules.iter().all(|s| s.id.is_empty()));
    }

    #[tokio::test]
    async fn test_apply_reuses_schedules_for_second_instance() {
        let (scheduler, policies) = manager();

        let first = policies.apply_template("ws-1", "balanced").await.unwrap();
        let second = policies.apply_template("ws-2", "balanced").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(scheduler.schedule_count().await, 2);
        assert_eq!(scheduler.instance_schedules("ws-2").await.len(), 2);
    }

    #[tokio::test]
    async fn test_apply_rejects_duplicate_application() {
        let (scheduler, policies) = manager();

        policies.apply_template("ws-1", "balanced").await.unwrap();
        let err = policies.apply_template("ws-1", "balanced").await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));

        assert_eq!(policies.applied_templates("ws-1").await.len(), 1);
        assert_eq!(scheduler.schedule_count().await, 2);
    }

    #[tokio::test]
    async fn test_apply_conflict_rejected_in_both_directions() {
        // Existing template lists the new one
        let (scheduler, policies) = manager();
        policies.apply_template("ws-1", "production").await.unwrap();
        let err = policies
            .apply_template("ws-1", "aggressive-cost")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));

        let applied = policies.applied_templates("ws-1").await;
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].id, "production");
        assert_eq!(scheduler.schedule_count().await, 1);

        // New template lists the existing one
        let (scheduler, policies) = manager();
        policies.apply_template("ws-1", "aggressive-cost").await.unwrap();
        let err = policies.apply_template("ws-1", "production").await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));

        let applied = policies.applied_templates("ws-1").await;
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].id, "aggressive-cost");
        assert_eq!(scheduler.schedule_count().await, 2);
    }

    #[tokio::test]
    async fn test_apply_development_fails_on_timeless_weekly() {
        let (scheduler, policies) = manager();

        // The third schedule (Weekend Off) has no window times and fails
        // validation; nothing gets assigned to the instance.
        let err = policies.apply_template("ws-1", "development").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        assert_eq!(scheduler.schedule_count().await, 2);
        assert!(scheduler.instance_schedules("ws-1").await.is_empty());
        assert!(policies.applied_templates("ws-1").await.is_empty());

        // A retry reuses the two registrations instead of duplicating them
        let err = policies.apply_template("ws-1", "development").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert_eq!(scheduler.schedule_count().await, 2);
    }

    #[tokio::test]
    async fn test_remove_template_unassigns_instance() {
        let (scheduler, policies) = manager();

        policies.apply_template("ws-1", "balanced").await.unwrap();
        policies.remove_template("ws-1", "balanced").await.unwrap();

        assert!(policies.applied_templates("ws-1").await.is_empty());
        assert!(scheduler.instance_schedules("ws-1").await.is_empty());
        // Schedules stay registered for other instances
        assert_eq!(scheduler.schedule_count().await, 2);

        let err = policies.remove_template("ws-1", "balanced").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_template_not_applied() {
        let (_, policies) = manager();

        policies.apply_template("ws-1", "balanced").await.unwrap();
        let err = policies.remove_template("ws-1", "research").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_template_is_best_effort() {
        let (scheduler, policies) = manager();

        let ids = policies.apply_template("ws-1", "balanced").await.unwrap();
        // One schedule disappears from the scheduler behind the manager's back
        scheduler.delete_schedule(&ids[0]).await.unwrap();

        policies.remove_template("ws-1", "balanced").await.unwrap();
        assert!(policies.applied_templates("ws-1").await.is_empty());
        assert!(scheduler.instance_schedules("ws-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_recommend_template() {
        let (_, policies) = manager();

        let tags = HashMap::from([("env".to_string(), "prod".to_string())]);
        assert_eq!(policies.recommend_template("t3.large", &tags).await.unwrap().id, "production");

        let tags = HashMap::from([("environment".to_string(), "development".to_string())]);
        assert_eq!(policies.recommend_template("t3.large", &tags).await.unwrap().id, "development");

        let tags = HashMap::from([("env".to_string(), "ml".to_string())]);
        assert_eq!(policies.recommend_template("p3.2xlarge", &tags).await.unwrap().id, "research");

        let tags = HashMap::from([("env".to_string(), "staging".to_string())]);
        assert_eq!(policies.recommend_template("t3.large", &tags).await.unwrap().id, "balanced");

        assert_eq!(
            policies.recommend_template("t3.large", &HashMap::new()).await.unwrap().id,
            "balanced"
        );
    }

    #[tokio::test]
    async fn test_custom_template_savings_estimate() {
        let (_, policies) = manager();

        // Overnight daily window falls back to the eight hour estimate,
        // idle contributes idle_minutes/60 * 24 hours per week
        let schedules = vec![
            Schedule {
                name: "Night".to_string(),
                kind: ScheduleKind::Daily,
                start_time: "20:00".to_string(),
                end_time: "08:00".to_string(),
                ..Default::default()
            },
            Schedule {
                name: "Idle".to_string(),
                kind: ScheduleKind::Idle,
                idle_minutes: 30,
                ..Default::default()
            },
        ];
        let template = policies
            .create_custom_template("night and idle", "test", schedules)
            .await
            .unwrap();

        assert!(template.id.starts_with("custom-"));
        assert_eq!(template.category, PolicyCategory::Custom);
        assert_eq!(template.priority, 10);
        assert!(!template.auto_apply);
        let expected = (8.0 * 7.0 + 12.0) / 168.0 * 100.0;
        assert!((template.estimated_savings_percent - expected).abs() < 1e-9);

        // Retrievable through the catalog afterwards
        let fetched = policies.template(&template.id).await.unwrap();
        assert_eq!(fetched.name, "night and idle");
    }

    #[tokio::test]
    async fn test_custom_template_savings_capped() {
        let (_, policies) = manager();

        let schedules = vec![
            Schedule {
                name: "Off hours".to_string(),
                kind: ScheduleKind::WorkHours,
                ..Default::default()
            },
            Schedule {
                name: "Days".to_string(),
                kind: ScheduleKind::Daily,
                start_time: "09:00".to_string(),
                end_time: "17:00".to_string(),
                ..Default::default()
            },
        ];
        let template = policies
            .create_custom_template("always off", "test", schedules)
            .await
            .unwrap();
        assert!((template.estimated_savings_percent - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_estimate_savings_weekly_days() {
        let schedules = vec![Schedule {
            name: "Weekends".to_string(),
            kind: ScheduleKind::Weekly,
            days_of_week: vec![DayOfWeek::Saturday, DayOfWeek::Sunday],
            start_time: "00:00".to_string(),
            end_time: "23:59".to_string(),
            ..Default::default()
        }];

        let expected = (1439.0 / 60.0) * 2.0 / 168.0 * 100.0;
        assert!((estimate_savings_percent(&schedules) - expected).abs() < 1e-9);
    }
}
