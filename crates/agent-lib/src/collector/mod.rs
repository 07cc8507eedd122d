//! Usage metrics collection from running workstations
//!
//! Two collection paths are provided: a remote-exec collector that runs
//! probe commands on the instance itself, and a telemetry checker that
//! evaluates windowed averages from the cloud metrics backend.

pub mod remote;
pub mod telemetry;

pub use remote::RemoteUsageCollector;
pub use telemetry::{TelemetryIdleChecker, WindowedMetrics};

use crate::error::Result;
use crate::lifecycle::InstanceTarget;
use crate::models::UsageMetrics;
use async_trait::async_trait;

/// Collects a point-in-time usage snapshot from one instance
#[async_trait]
pub trait UsageCollector: Send + Sync {
    async fn collect(&self, target: &InstanceTarget) -> Result<UsageMetrics>;

    /// Collector name for logging
    fn name(&self) -> &str;
}
