//! Remote-exec usage collector
//!
//! Runs small probe pipelines on the instance over the metrics transport
//! and assembles a [`UsageMetrics`] snapshot. Probes read /proc so they
//! work unchanged on x86_64 and ARM64 images.

use crate::collector::UsageCollector;
use crate::error::{EngineError, Result};
use crate::lifecycle::{InstanceTarget, MetricsSource};
use crate::models::UsageMetrics;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// CPU utilization percentage from /proc/stat
const CPU_PROBE: &str = r"awk '/^cpu /{u=$2+$4; t=$2+$3+$4+$5; print (u/t*100)}' /proc/stat";

/// Fallback CPU probe for images where the awk form misbehaves
const CPU_FALLBACK_PROBE: &str =
    r#"top -bn1 | grep "Cpu(s)" | awk '{print $2}' | awk -F'%' '{print $1}'"#;

/// Memory utilization percentage from /proc/meminfo
const MEMORY_PROBE: &str =
    r#"awk '/^MemTotal:/{t=$2} /^MemAvailable:/{a=$2} END{printf "%.2f", (t-a)/t*100}' /proc/meminfo"#;

/// Cumulative network KB across all interfaces
const NETWORK_PROBE: &str =
    r"cat /proc/net/dev | grep -E ': ' | awk '{rx+=$2; tx+=$10} END{print (rx+tx)/1024}'";

/// Cumulative disk KB across block devices
const DISK_PROBE: &str =
    r"awk '/^(sd|nvme|xvd)/{rs+=$6; ws+=$10} END{print (rs+ws)*512/1024}' /proc/diskstats";

/// NVIDIA GPU utilization percentage, absent on CPU-only instances
const GPU_PROBE: &str = "nvidia-smi --query-gpu=utilization.gpu --format=csv,noheader,nounits";

/// Logged-in user sessions excluding root
const ACTIVE_USERS_PROBE: &str = r#"who | grep -v "^root" | wc -l"#;

/// Input device nodes touched within the last minute
const INPUT_EVENTS_PROBE: &str = r#"find /dev/input -name "event*" -newer <(date -d '1 minute ago' '+%Y-%m-%d %H:%M:%S') 2>/dev/null | wc -l"#;

/// Fallback input check via interrupt table entries
const INPUT_INTERRUPTS_PROBE: &str = r#"grep -i "input\|keyboard\|mouse" /proc/interrupts | wc -l"#;

/// Non-system user processes
const USER_PROCESSES_PROBE: &str = r#"ps aux | grep -v -E "^\[|root.*\[" | grep -v -E "(kthread|ksoftirq|migration|rcu_|systemd)" | grep -v "ps aux" | wc -l"#;

/// Listening sockets other than sshd
const LISTENER_PROBE: &str = r#"ss -tuln | grep -v ":22 " | grep LISTEN | wc -l"#;

/// A handful of user processes is normal on a booted image
const USER_PROCESS_FLOOR: i64 = 10;

/// Listeners beyond the base image services suggest user applications
const LISTENER_FLOOR: i64 = 5;

/// Collector that probes instances over the metrics transport
///
/// A failed resource probe is recorded as 0.0 so one broken pipeline does
/// not block collection. Collection itself fails only when every resource
/// probe fails, which means the instance is unreachable in practice.
pub struct RemoteUsageCollector {
    source: Arc<dyn MetricsSource>,
}

impl RemoteUsageCollector {
    pub fn new(source: Arc<dyn MetricsSource>) -> Self {
        Self { source }
    }

    async fn probe_value(&self, target: &InstanceTarget, command: &str) -> Result<f64> {
        let output = self.source.remote_exec(&target.host, command).await?;
        parse_probe_value(&output)
    }

    async fn probe_count(&self, target: &InstanceTarget, command: &str) -> Result<i64> {
        let output = self.source.remote_exec(&target.host, command).await?;
        parse_probe_count(&output)
    }

    async fn cpu_usage(&self, target: &InstanceTarget) -> Result<f64> {
        match self.probe_value(target, CPU_PROBE).await {
            Ok(v) => Ok(v),
            Err(_) => self.probe_value(target, CPU_FALLBACK_PROBE).await,
        }
    }

    /// GPU utilization, `None` when no NVIDIA GPU is present
    async fn gpu_usage(&self, target: &InstanceTarget) -> Option<f64> {
        self.probe_value(target, GPU_PROBE).await.ok()
    }

    /// Whether any of the user activity signals fires
    ///
    /// Signals are checked in order and short-circuit on the first hit. A
    /// probe that fails contributes no evidence either way.
    async fn detect_activity(&self, target: &InstanceTarget) -> bool {
        if let Ok(users) = self.probe_count(target, ACTIVE_USERS_PROBE).await {
            if users > 0 {
                return true;
            }
        }

        if self.input_activity(target).await {
            return true;
        }

        if let Ok(procs) = self.probe_count(target, USER_PROCESSES_PROBE).await {
            if procs > USER_PROCESS_FLOOR {
                return true;
            }
        }

        if let Ok(listeners) = self.probe_count(target, LISTENER_PROBE).await {
            if listeners > LISTENER_FLOOR {
                return true;
            }
        }

        false
    }

    async fn input_activity(&self, target: &InstanceTarget) -> bool {
        match self.probe_count(target, INPUT_EVENTS_PROBE).await {
            Ok(events) => events > 0,
            // Process substitution is unavailable on some shells
            Err(_) => self
                .probe_count(target, INPUT_INTERRUPTS_PROBE)
                .await
                .map(|n| n > 0)
                .unwrap_or(false),
        }
    }
}

#[async_trait]
impl UsageCollector for RemoteUsageCollector {
    async fn collect(&self, target: &InstanceTarget) -> Result<UsageMetrics> {
        let mut failed_probes = 0usize;

        let mut resource = |name: &'static str, result: Result<f64>| match result {
            Ok(v) => v,
            Err(e) => {
                debug!(
                    instance = %target.name,
                    probe = name,
                    error = %e,
                    "Resource probe failed, recording zero"
                );
                failed_probes += 1;
                0.0
            }
        };

        let cpu = resource("cpu", self.cpu_usage(target).await);
        let memory = resource("memory", self.probe_value(target, MEMORY_PROBE).await);
        let network = resource("network", self.probe_value(target, NETWORK_PROBE).await);
        let disk = resource("disk", self.probe_value(target, DISK_PROBE).await);

        if failed_probes == 4 {
            return Err(EngineError::transport(format!(
                "all resource probes failed for instance {}",
                target.name
            )));
        }

        let gpu = self.gpu_usage(target).await;
        let has_activity = self.detect_activity(target).await;

        Ok(UsageMetrics {
            timestamp: Utc::now(),
            cpu,
            memory,
            network,
            disk,
            gpu,
            has_activity,
        })
    }

    fn name(&self) -> &str {
        "remote-exec"
    }
}

fn parse_probe_value(output: &str) -> Result<f64> {
    let trimmed = output.trim();
    trimmed.parse::<f64>().map_err(|_| {
        EngineError::transport(format!("unparseable probe output: {trimmed:?}"))
    })
}

fn parse_probe_count(output: &str) -> Result<i64> {
    let trimmed = output.trim();
    trimmed.parse::<i64>().map_err(|_| {
        EngineError::transport(format!("unparseable probe count: {trimmed:?}"))
    })
}
