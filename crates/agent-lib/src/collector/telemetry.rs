//! Telemetry-backed idle evaluation
//!
//! Idle-triggered schedules are evaluated against windowed averages from
//! the cloud telemetry backend rather than a live probe, so instances the
//! transport cannot reach are still covered.

use crate::error::Result;
use crate::lifecycle::{MetricsSource, TelemetryMetric, TelemetrySample};
use crate::models::Schedule;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Applied when a schedule leaves the CPU threshold unset
const DEFAULT_CPU_THRESHOLD: f64 = 5.0;

/// Applied when a schedule leaves the network threshold unset, bytes/sec
const DEFAULT_NETWORK_THRESHOLD_BPS: f64 = 1000.0;

/// Windowed telemetry summary for one instance
#[derive(Debug, Clone, PartialEq)]
pub struct WindowedMetrics {
    pub instance_id: String,
    pub average_cpu: f64,
    pub average_network_bps: f64,
    pub period: Duration,
    pub collected_at: DateTime<Utc>,
}

/// Evaluates idle-triggered schedules against backend telemetry
pub struct TelemetryIdleChecker {
    source: Arc<dyn MetricsSource>,
}

impl TelemetryIdleChecker {
    pub fn new(source: Arc<dyn MetricsSource>) -> Self {
        Self { source }
    }

    /// Whether the instance stayed under the schedule thresholds for the
    /// schedule's whole idle window
    ///
    /// CPU is checked first and short-circuits the network query. An empty
    /// sample set averages to zero, which counts as idle: a window with no
    /// datapoints means the instance produced nothing worth reporting.
    pub async fn is_instance_idle(&self, instance_id: &str, schedule: &Schedule) -> Result<bool> {
        let window = idle_window(schedule);

        let cpu_threshold = if schedule.cpu_threshold == 0.0 {
            DEFAULT_CPU_THRESHOLD
        } else {
            schedule.cpu_threshold
        };
        let average_cpu = self.average_cpu(instance_id, window).await?;
        if average_cpu > cpu_threshold {
            return Ok(false);
        }

        let network_threshold = if schedule.network_threshold == 0.0 {
            DEFAULT_NETWORK_THRESHOLD_BPS
        } else {
            schedule.network_threshold
        };
        let average_network = self.average_network_bps(instance_id, window).await?;
        if average_network > network_threshold {
            return Ok(false);
        }

        Ok(true)
    }

    /// Windowed CPU and network summary for one instance
    pub async fn instance_metrics(
        &self,
        instance_id: &str,
        window: Duration,
    ) -> Result<WindowedMetrics> {
        let average_cpu = self.average_cpu(instance_id, window).await?;
        let average_network_bps = self.average_network_bps(instance_id, window).await?;

        Ok(WindowedMetrics {
            instance_id: instance_id.to_string(),
            average_cpu,
            average_network_bps,
            period: window,
            collected_at: Utc::now(),
        })
    }

    async fn average_cpu(&self, instance_id: &str, window: Duration) -> Result<f64> {
        let samples = self
            .source
            .telemetry_query(instance_id, TelemetryMetric::CpuUtilization, window)
            .await?;
        Ok(mean(&samples))
    }

    /// Combined in and out bytes per second over the window
    async fn average_network_bps(&self, instance_id: &str, window: Duration) -> Result<f64> {
        let inbound = self
            .source
            .telemetry_query(instance_id, TelemetryMetric::NetworkIn, window)
            .await?;
        let outbound = self
            .source
            .telemetry_query(instance_id, TelemetryMetric::NetworkOut, window)
            .await?;

        let total: f64 = inbound.iter().chain(outbound.iter()).map(|s| s.value).sum();
        Ok(total / window.as_secs_f64())
    }
}

fn idle_window(schedule: &Schedule) -> Duration {
    Duration::from_secs(schedule.idle_minutes.max(0) as u64 * 60)
}

fn mean(samples: &[TelemetrySample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.value).sum::<f64>() / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockTelemetry {
        cpu: Vec<f64>,
        network_in: Vec<f64>,
        network_out: Vec<f64>,
        queried: Mutex<Vec<TelemetryMetric>>,
    }

    impl MockTelemetry {
        fn new(cpu: Vec<f64>, network_in: Vec<f64>, network_out: Vec<f64>) -> Self {
            Self {
                cpu,
                network_in,
                network_out,
                queried: Mutex::new(Vec::new()),
            }
        }

        fn queried(&self) -> Vec<TelemetryMetric> {
            self.queried.lock().unwrap().clone()
        }
    }

    fn samples(values: &[f64]) -> Vec<TelemetrySample> {
        values
            .iter()
            .map(|v| TelemetrySample {
                timestamp: Utc::now(),
                value: *v,
            })
            .collect()
    }

    #[async_trait]
    impl MetricsSource for MockTelemetry {
        async fn remote_exec(&self, _host: &str, _command: &str) -> Result<String> {
            Err(EngineError::transport("not an exec source"))
        }

        async fn telemetry_query(
            &self,
            _instance_id: &str,
            metric: TelemetryMetric,
            _window: Duration,
        ) -> Result<Vec<TelemetrySample>> {
            self.queried.lock().unwrap().push(metric);
            Ok(match metric {
                TelemetryMetric::CpuUtilization => samples(&self.cpu),
                TelemetryMetric::NetworkIn => samples(&self.network_in),
                TelemetryMetric::NetworkOut => samples(&self.network_out),
            })
        }
    }

    fn idle_schedule(cpu_threshold: f64, network_threshold: f64) -> Schedule {
        Schedule {
            idle_minutes: 30,
            cpu_threshold,
            network_threshold,
            ..Schedule::default()
        }
    }

    #[tokio::test]
    async fn test_busy_cpu_short_circuits() {
        let source = Arc::new(MockTelemetry::new(vec![40.0, 60.0], vec![], vec![]));
        let checker = TelemetryIdleChecker::new(source.clone());

        let idle = checker
            .is_instance_idle("i-1", &idle_schedule(10.0, 0.0))
            .await
            .unwrap();
        assert!(!idle);
        assert_eq!(source.queried(), vec![TelemetryMetric::CpuUtilization]);
    }

    #[tokio::test]
    async fn test_busy_network_is_not_idle() {
        // 30 min window, 3.6 MB total -> 2000 B/s, over the default
        let source = Arc::new(MockTelemetry::new(
            vec![1.0],
            vec![1_800_000.0],
            vec![1_800_000.0],
        ));
        let checker = TelemetryIdleChecker::new(source);

        let idle = checker
            .is_instance_idle("i-1", &idle_schedule(0.0, 0.0))
            .await
            .unwrap();
        assert!(!idle);
    }

    #[tokio::test]
    async fn test_quiet_instance_is_idle() {
        let source = Arc::new(MockTelemetry::new(vec![1.0, 2.0], vec![100.0], vec![50.0]));
        let checker = TelemetryIdleChecker::new(source);

        let idle = checker
            .is_instance_idle("i-1", &idle_schedule(0.0, 0.0))
            .await
            .unwrap();
        assert!(idle);
    }

    #[tokio::test]
    async fn test_cpu_at_threshold_counts_as_idle() {
        let source = Arc::new(MockTelemetry::new(vec![10.0], vec![], vec![]));
        let checker = TelemetryIdleChecker::new(source);

        let idle = checker
            .is_instance_idle("i-1", &idle_schedule(10.0, 0.0))
            .await
            .unwrap();
        assert!(idle);
    }

    #[tokio::test]
    async fn test_no_datapoints_counts_as_idle() {
        let source = Arc::new(MockTelemetry::new(vec![], vec![], vec![]));
        let checker = TelemetryIdleChecker::new(source);

        let idle = checker
            .is_instance_idle("i-1", &idle_schedule(0.0, 0.0))
            .await
            .unwrap();
        assert!(idle);
    }

    #[tokio::test]
    async fn test_instance_metrics_summary() {
        let source = Arc::new(MockTelemetry::new(
            vec![4.0, 6.0],
            vec![300.0],
            vec![300.0],
        ));
        let checker = TelemetryIdleChecker::new(source);

        let metrics = checker
            .instance_metrics("i-1", Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(metrics.average_cpu, 5.0);
        assert_eq!(metrics.average_network_bps, 1.0);
        assert_eq!(metrics.period, Duration::from_secs(600));
    }
}
