//! Capability traits for the surrounding orchestration layer
//!
//! The engine never talks to a cloud API directly. It consumes two narrow
//! capabilities: instance lifecycle control and a metrics transport. Both
//! are traits so tests can substitute doubles and deployments can swap
//! the production implementations.

use crate::error::{EngineError, Result};
use crate::models::UsageMetrics;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

pub use async_trait::async_trait;

/// Lifecycle control over workstation instances
#[async_trait]
pub trait InstanceLifecycle: Send + Sync {
    async fn hibernate(&self, name: &str) -> Result<()>;
    async fn resume(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn start(&self, name: &str) -> Result<()>;

    /// Names of all instances known to the orchestration layer
    async fn list_instance_names(&self) -> Result<Vec<String>>;

    /// Cloud instance id for a workstation name
    async fn get_instance_id(&self, name: &str) -> Result<String>;
}

/// Metric name understood by the telemetry backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMetric {
    CpuUtilization,
    NetworkIn,
    NetworkOut,
}

impl TelemetryMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryMetric::CpuUtilization => "CPUUtilization",
            TelemetryMetric::NetworkIn => "NetworkIn",
            TelemetryMetric::NetworkOut => "NetworkOut",
        }
    }
}

/// One aggregated telemetry datapoint
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    /// Aggregated value for the period: averages for CPU, sums for network
    pub value: f64,
}

/// Transport for reading metrics off an instance
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Run a command on the instance and return its stdout
    async fn remote_exec(&self, host: &str, command: &str) -> Result<String>;

    /// Query aggregated telemetry for an instance over a trailing window,
    /// one sample per backend period
    async fn telemetry_query(
        &self,
        instance_id: &str,
        metric: TelemetryMetric,
        window: Duration,
    ) -> Result<Vec<TelemetrySample>>;
}

/// Target descriptor handed to collectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget {
    pub name: String,
    pub id: String,
    /// Public address used for remote execution
    pub host: String,
}

/// Snapshot of a running instance as reported by the orchestration layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningInstance {
    pub name: String,
    pub id: String,
    pub public_ip: Option<String>,
}

impl RunningInstance {
    /// Collection target, if the instance is reachable
    pub fn target(&self) -> Option<InstanceTarget> {
        self.public_ip.as_ref().map(|ip| InstanceTarget {
            name: self.name.clone(),
            id: self.id.clone(),
            host: ip.clone(),
        })
    }
}

/// Source of the instances a monitoring cycle should look at
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Instances currently running; entries without a public address are
    /// reported but cannot be collected from
    async fn list_running_instances(&self) -> Result<Vec<RunningInstance>>;
}

/// Configuration for the command-based lifecycle implementation
#[derive(Debug, Clone)]
pub struct CommandLifecycleConfig {
    /// Orchestration CLI binary
    pub program: String,
    /// Timeout for a single CLI invocation
    pub command_timeout: Duration,
    /// Interval between state polls after issuing an action
    pub poll_interval: Duration,
    /// Upper bound on waiting for an instance to reach its target state
    pub state_deadline: Duration,
}

impl Default for CommandLifecycleConfig {
    fn default() -> Self {
        Self {
            program: "cws".to_string(),
            command_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            state_deadline: Duration::from_secs(600),
        }
    }
}

/// Lifecycle implementation that shells out to the orchestration CLI
///
/// Actions are fire-then-poll: the CLI call issues the transition and the
/// instance state is polled until it settles, bounded by `state_deadline`.
pub struct CommandLifecycle {
    config: CommandLifecycleConfig,
}

impl CommandLifecycle {
    pub fn new(config: CommandLifecycleConfig) -> Self {
        Self { config }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = tokio::time::timeout(
            self.config.command_timeout,
            Command::new(&self.config.program)
                .args(args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| {
            EngineError::transport(format!(
                "{} {} timed out after {:?}",
                self.config.program,
                args.join(" "),
                self.config.command_timeout
            ))
        })?
        .map_err(|e| EngineError::transport(format!("failed to run {}: {e}", self.config.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::transport(format!(
                "{} {} exited with {}: {}",
                self.config.program,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Issue an action and poll until the instance reports a settled state
    async fn act_and_await(&self, action: &str, name: &str, settled: &[&str]) -> Result<()> {
        self.run(&[action, name]).await.map_err(|e| {
            EngineError::action(name, action, e.to_string())
        })?;

        let deadline = tokio::time::Instant::now() + self.config.state_deadline;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::action(
                    name,
                    action,
                    format!("instance did not settle within {:?}", self.config.state_deadline),
                ));
            }

            tokio::time::sleep(self.config.poll_interval).await;

            match self.run(&["status", name]).await {
                Ok(out) => {
                    if let Some(state) = parse_instance_state(&out) {
                        debug!(instance = %name, state = %state, "Polled instance state");
                        if settled.contains(&state.as_str()) {
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    // Transient status failures are retried until the deadline
                    warn!(instance = %name, error = %e, "Status poll failed");
                }
            }
        }
    }
}

#[async_trait]
impl InstanceLifecycle for CommandLifecycle {
    async fn hibernate(&self, name: &str) -> Result<()> {
        self.act_and_await("hibernate", name, &["hibernated", "stopped"])
            .await
    }

    async fn resume(&self, name: &str) -> Result<()> {
        self.act_and_await("resume", name, &["running"]).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.act_and_await("stop", name, &["stopped"]).await
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.act_and_await("start", name, &["running"]).await
    }

    async fn list_instance_names(&self) -> Result<Vec<String>> {
        let out = self.run(&["list", "--names"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn get_instance_id(&self, name: &str) -> Result<String> {
        let out = self.run(&["id", name]).await?;
        let id = out.trim();
        if id.is_empty() {
            return Err(EngineError::not_found("instance", name));
        }
        Ok(id.to_string())
    }
}

#[async_trait]
impl InstanceProvider for CommandLifecycle {
    async fn list_running_instances(&self) -> Result<Vec<RunningInstance>> {
        let out = self.run(&["list", "--running"]).await?;
        Ok(parse_running_instances(&out))
    }
}

/// First whitespace-separated token of the status output, lowercased
fn parse_instance_state(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .next()
        .map(|s| s.to_ascii_lowercase())
}

/// One instance per line: name, id, and optionally a public address;
/// a `-` placeholder marks instances without one
fn parse_running_instances(output: &str) -> Vec<RunningInstance> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let id = fields.next()?;
            let public_ip = fields
                .next()
                .filter(|ip| *ip != "-")
                .map(String::from);
            Some(RunningInstance {
                name: name.to_string(),
                id: id.to_string(),
                public_ip,
            })
        })
        .collect()
}

/// Configuration for the SSH metrics transport
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub user: String,
    pub key_path: String,
    pub connect_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            key_path: "~/.ssh/cloudworkstation".to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Metrics transport that runs probes over ssh
pub struct SshMetricsSource {
    config: SshConfig,
}

impl SshMetricsSource {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MetricsSource for SshMetricsSource {
    async fn remote_exec(&self, host: &str, command: &str) -> Result<String> {
        let connect_secs = self.config.connect_timeout.as_secs().to_string();
        let destination = format!("{}@{}", self.config.user, host);

        let output = tokio::time::timeout(
            self.config.connect_timeout,
            Command::new("ssh")
                .arg("-i")
                .arg(&self.config.key_path)
                .arg("-o")
                .arg("BatchMode=yes")
                .arg("-o")
                .arg("StrictHostKeyChecking=accept-new")
                .arg("-o")
                .arg(format!("ConnectTimeout={connect_secs}"))
                .arg(&destination)
                .arg(command)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| {
            EngineError::transport(format!(
                "ssh to {host} timed out after {:?}",
                self.config.connect_timeout
            ))
        })?
        .map_err(|e| EngineError::transport(format!("failed to spawn ssh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::transport(format!(
                "remote command on {host} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn telemetry_query(
        &self,
        instance_id: &str,
        _metric: TelemetryMetric,
        _window: Duration,
    ) -> Result<Vec<TelemetrySample>> {
        Err(EngineError::transport(format!(
            "no telemetry backend configured for instance {instance_id}"
        )))
    }
}
