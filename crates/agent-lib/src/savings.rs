//! Hibernation savings tracking and reporting.
//!
//! The tracker accumulates one [`HibernationEvent`] per executed action and
//! turns them into a [`SavingsReport`]: period totals, a 30-day projection,
//! per-instance and per-schedule breakdowns, and optimization
//! recommendations. Events are kept in memory only; the report is a
//! point-in-time view, not an audit log (that is the idle manager's
//! history).

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Reporting window; events are attributed by their start time, bounds
/// exclusive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub days: i64,
}

impl Period {
    /// The trailing `days` days ending now
    pub fn last_days(days: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::days(days),
            end,
            days,
        }
    }

    fn contains(&self, at: DateTime<Utc>) -> bool {
        at > self.start && at < self.end
    }
}

/// What caused an instance to hibernate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SavingsTrigger {
    Schedule,
    Idle,
    Manual,
}

/// A single hibernation occurrence and the dollars it saved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HibernationEvent {
    pub instance_id: String,
    pub instance_name: String,
    pub hourly_rate: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_hours: f64,
    pub saved_amount: f64,
    pub trigger: SavingsTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
}

/// Savings accumulated by one instance over the period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSaving {
    pub instance_id: String,
    pub instance_name: String,
    pub hourly_rate: f64,
    pub hibernation_hours: f64,
    pub active_hours: f64,
    pub total_saved: f64,
    pub savings_percent: f64,
    pub hibernation_events: Vec<HibernationEvent>,
}

/// How much a named schedule contributed over the period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulePerformance {
    pub schedule_name: String,
    pub execution_count: usize,
    pub total_saved: f64,
    pub average_saving: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    ScheduleOptimization,
    InstancePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationPriority {
    High,
    Medium,
    Low,
}

/// A suggested optimization with its estimated monthly impact in dollars
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: RecommendationPriority,
    pub description: String,
    #[serde(rename = "estimated_monthly_impact")]
    pub impact: f64,
    #[serde(rename = "recommended_action")]
    pub action: String,
}

/// Hibernation cost savings analysis for one period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavingsReport {
    pub report_id: String,
    pub generated_at: DateTime<Utc>,
    pub period: Period,

    pub total_saved: f64,
    /// 30-day projection from the period's daily average
    pub projected_savings: f64,
    pub hibernation_hours: f64,
    pub active_hours: f64,
    pub savings_percentage: f64,

    pub instance_savings: Vec<InstanceSaving>,
    pub schedule_performance: Vec<SchedulePerformance>,
    pub recommendations: Vec<Recommendation>,
}

/// Records hibernation events and produces savings reports
pub struct SavingsTracker {
    events: RwLock<Vec<HibernationEvent>>,
}

impl SavingsTracker {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }

    pub async fn record(&self, event: HibernationEvent) {
        debug!(
            event = "savings_recorded",
            instance = %event.instance_name,
            saved = event.saved_amount,
            hours = event.duration_hours,
            "Recorded hibernation event"
        );
        self.events.write().await.push(event);
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn report(&self, period: Period) -> SavingsReport {
        let events = self.events.read().await;
        let in_period: Vec<&HibernationEvent> = events
            .iter()
            .filter(|e| period.contains(e.start_time))
            .collect();

        let total_saved: f64 = in_period.iter().map(|e| e.saved_amount).sum();
        let hibernation_hours: f64 = in_period.iter().map(|e| e.duration_hours).sum();
        let period_hours = (period.days * 24) as f64;
        let active_hours = period_hours - hibernation_hours;
        let savings_percentage = if period_hours > 0.0 {
            hibernation_hours / period_hours * 100.0
        } else {
            0.0
        };
        let projected_savings = if period.days > 0 {
            total_saved / period.days as f64 * 30.0
        } else {
            0.0
        };

        let instance_savings = instance_breakdown(&in_period, period_hours);
        let schedule_performance = schedule_breakdown(&in_period);
        let recommendations = recommend(total_saved, savings_percentage, &instance_savings);

        SavingsReport {
            report_id: format!("report-{}", Utc::now().timestamp()),
            generated_at: Utc::now(),
            period,
            total_saved,
            projected_savings,
            hibernation_hours,
            active_hours,
            savings_percentage,
            instance_savings,
            schedule_performance,
            recommendations,
        }
    }
}

impl Default for SavingsTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn instance_breakdown(events: &[&HibernationEvent], period_hours: f64) -> Vec<InstanceSaving> {
    let mut by_instance: HashMap<&str, InstanceSaving> = HashMap::new();
    for event in events {
        let entry = by_instance
            .entry(event.instance_id.as_str())
            .or_insert_with(|| InstanceSaving {
                instance_id: event.instance_id.clone(),
                instance_name: event.instance_name.clone(),
                hourly_rate: event.hourly_rate,
                hibernation_hours: 0.0,
                active_hours: 0.0,
                total_saved: 0.0,
                savings_percent: 0.0,
                hibernation_events: Vec::new(),
            });
        entry.hibernation_hours += event.duration_hours;
        entry.total_saved += event.saved_amount;
        entry.hibernation_events.push((*event).clone());
    }

    let mut breakdown: Vec<InstanceSaving> = by_instance.into_values().collect();
    for saving in &mut breakdown {
        saving.active_hours = period_hours - saving.hibernation_hours;
        saving.savings_percent = if period_hours > 0.0 {
            saving.hibernation_hours / period_hours * 100.0
        } else {
            0.0
        };
    }
    breakdown.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
    breakdown
}

fn schedule_breakdown(events: &[&HibernationEvent]) -> Vec<SchedulePerformance> {
    let mut by_schedule: HashMap<&str, SchedulePerformance> = HashMap::new();
    for event in events {
        let name = match event.schedule_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        let entry = by_schedule
            .entry(name)
            .or_insert_with(|| SchedulePerformance {
                schedule_name: name.to_string(),
                execution_count: 0,
                total_saved: 0.0,
                average_saving: 0.0,
            });
        entry.execution_count += 1;
        entry.total_saved += event.saved_amount;
    }

    let mut performances: Vec<SchedulePerformance> = by_schedule.into_values().collect();
    for perf in &mut performances {
        perf.average_saving = perf.total_saved / perf.execution_count as f64;
    }
    performances.sort_by(|a, b| a.schedule_name.cmp(&b.schedule_name));
    performances
}

fn recommend(
    total_saved: f64,
    savings_percentage: f64,
    instances: &[InstanceSaving],
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    if savings_percentage < 20.0 {
        recommendations.push(Recommendation {
            kind: RecommendationKind::ScheduleOptimization,
            priority: RecommendationPriority::High,
            description: "Low hibernation utilization detected".to_string(),
            impact: total_saved * 2.0,
            action: "Consider adding more aggressive hibernation schedules".to_string(),
        });
    }

    for instance in instances {
        if instance.hibernation_hours == 0.0 {
            recommendations.push(Recommendation {
                kind: RecommendationKind::InstancePolicy,
                priority: RecommendationPriority::Medium,
                description: format!("Instance {} has no hibernation", instance.instance_name),
                impact: instance.hourly_rate * 8.0 * 30.0,
                action: format!("Enable hibernation policy for {}", instance.instance_name),
            });
        }
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn period() -> Period {
        Period {
            start: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 3, 11, 0, 0, 0).unwrap(),
            days: 10,
        }
    }

    fn event(
        instance: &str,
        start: DateTime<Utc>,
        hours: f64,
        saved: f64,
        schedule: Option<&str>,
    ) -> HibernationEvent {
        HibernationEvent {
            instance_id: format!("i-{instance}"),
            instance_name: instance.to_string(),
            hourly_rate: 0.10,
            start_time: start,
            end_time: start + Duration::milliseconds((hours * 3_600_000.0) as i64),
            duration_hours: hours,
            saved_amount: saved,
            trigger: SavingsTrigger::Idle,
            schedule_name: schedule.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn test_report_totals_and_projection() {
        let tracker = SavingsTracker::new();
        let start = Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap();
        tracker.record(event("ws-1", start, 8.0, 0.80, None)).await;
        tracker
            .record(event("ws-1", start + Duration::days(1), 4.0, 0.40, None))
            .await;
        // Before the period, must not count
        tracker
            .record(event("ws-2", start - Duration::days(10), 5.0, 0.50, None))
            .await;

        let report = tracker.report(period()).await;
        assert!((report.total_saved - 1.20).abs() < 1e-9);
        assert!((report.hibernation_hours - 12.0).abs() < 1e-9);
        assert!((report.active_hours - 228.0).abs() < 1e-9);
        assert!((report.savings_percentage - 5.0).abs() < 1e-9);
        assert!((report.projected_savings - 3.60).abs() < 1e-9);
        assert!(report.report_id.starts_with("report-"));
    }

    #[tokio::test]
    async fn test_period_bounds_are_exclusive() {
        let tracker = SavingsTracker::new();
        let p = period();
        tracker.record(event("ws-1", p.start, 1.0, 0.10, None)).await;
        tracker.record(event("ws-1", p.end, 1.0, 0.10, None)).await;
        tracker
            .record(event("ws-1", p.start + Duration::seconds(1), 1.0, 0.10, None))
            .await;

        let report = tracker.report(p).await;
        assert!((report.total_saved - 0.10).abs() < 1e-9);
        assert_eq!(report.instance_savings[0].hibernation_events.len(), 1);
    }

    #[tokio::test]
    async fn test_instance_breakdown_groups_and_sorts() {
        let tracker = SavingsTracker::new();
        let start = Utc.with_ymd_and_hms(2025, 3, 5, 0, 0, 0).unwrap();
        tracker.record(event("beta", start, 6.0, 0.60, None)).await;
        tracker.record(event("alpha", start, 12.0, 1.20, None)).await;
        tracker
            .record(event("beta", start + Duration::hours(12), 6.0, 0.60, None))
            .await;

        let report = tracker.report(period()).await;
        assert_eq!(report.instance_savings.len(), 2);

        let alpha = &report.instance_savings[0];
        assert_eq!(alpha.instance_name, "alpha");
        assert!((alpha.hibernation_hours - 12.0).abs() < 1e-9);
        assert!((alpha.active_hours - 228.0).abs() < 1e-9);
        assert!((alpha.savings_percent - 5.0).abs() < 1e-9);

        let beta = &report.instance_savings[1];
        assert_eq!(beta.instance_name, "beta");
        assert!((beta.total_saved - 1.20).abs() < 1e-9);
        assert_eq!(beta.hibernation_events.len(), 2);
    }

    #[tokio::test]
    async fn test_schedule_performance_averages() {
        let tracker = SavingsTracker::new();
        let start = Utc.with_ymd_and_hms(2025, 3, 5, 0, 0, 0).unwrap();
        tracker
            .record(event("ws-1", start, 5.0, 0.50, Some("Night Hibernation")))
            .await;
        tracker
            .record(event("ws-1", start + Duration::days(1), 5.0, 1.50, Some("Night Hibernation")))
            .await;
        // No schedule name, ignored by the schedule breakdown
        tracker
            .record(event("ws-1", start + Duration::days(2), 5.0, 0.50, None))
            .await;

        let report = tracker.report(period()).await;
        assert_eq!(report.schedule_performance.len(), 1);

        let perf = &report.schedule_performance[0];
        assert_eq!(perf.schedule_name, "Night Hibernation");
        assert_eq!(perf.execution_count, 2);
        assert!((perf.total_saved - 2.0).abs() < 1e-9);
        assert!((perf.average_saving - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zero_hibernation_instance_recommendation() {
        let tracker = SavingsTracker::new();
        // One day period with six hibernated hours keeps utilization at 25%
        let p = Period {
            start: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap(),
            days: 1,
        };
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();
        tracker.record(event("ws-1", start, 6.0, 0.60, None)).await;
        tracker.record(event("ws-2", start, 0.0, 0.0, None)).await;

        let report = tracker.report(p).await;
        assert!((report.savings_percentage - 25.0).abs() < 1e-9);
        assert_eq!(report.recommendations.len(), 1);

        let rec = &report.recommendations[0];
        assert_eq!(rec.kind, RecommendationKind::InstancePolicy);
        assert_eq!(rec.priority, RecommendationPriority::Medium);
        assert!(rec.description.contains("ws-2"));
        assert!((rec.impact - 0.10 * 8.0 * 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_tracker_flags_low_utilization() {
        let tracker = SavingsTracker::new();
        let report = tracker.report(Period::last_days(7)).await;

        assert_eq!(report.total_saved, 0.0);
        assert_eq!(report.hibernation_hours, 0.0);
        assert!((report.active_hours - 168.0).abs() < 1e-9);
        assert_eq!(report.savings_percentage, 0.0);
        assert_eq!(report.projected_savings, 0.0);
        assert_eq!(report.recommendations.len(), 1);
        assert_eq!(
            report.recommendations[0].kind,
            RecommendationKind::ScheduleOptimization
        );
    }
}
