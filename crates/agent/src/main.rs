//! Hibernation agent daemon
//!
//! Watches cloud workstations for idleness, runs hibernation schedules,
//! and executes cost-saving actions autonomously. State survives restarts
//! through periodic snapshots.

use anyhow::{Context, Result};
use hibernate_agent_lib::collector::RemoteUsageCollector;
use hibernate_agent_lib::health::{components, HealthRegistry};
use hibernate_agent_lib::idle::IdleManager;
use hibernate_agent_lib::lifecycle::{
    CommandLifecycle, CommandLifecycleConfig, SshConfig, SshMetricsSource,
};
use hibernate_agent_lib::observability::AgentMetrics;
use hibernate_agent_lib::savings::SavingsTracker;
use hibernate_agent_lib::scheduler::Scheduler;
use hibernate_agent_lib::service::{
    control_channel, AutonomousService, ControlCommand, StateStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let agent_config = config::AgentConfig::load()?;
    info!(
        version = AGENT_VERSION,
        state_dir = %agent_config.state_dir.display(),
        "Starting hibernate-agent"
    );

    // Core components
    let idle = Arc::new(
        IdleManager::new(&agent_config.state_dir).context("opening idle manager")?,
    );
    let lifecycle = Arc::new(CommandLifecycle::new(CommandLifecycleConfig {
        program: agent_config.lifecycle_program.clone(),
        ..CommandLifecycleConfig::default()
    }));
    let ssh_source = Arc::new(SshMetricsSource::new(SshConfig {
        user: agent_config.ssh_user.clone(),
        key_path: agent_config.ssh_key_path.clone(),
        ..SshConfig::default()
    }));
    let collector = Arc::new(RemoteUsageCollector::new(ssh_source));
    let savings = Arc::new(SavingsTracker::new());
    let store = StateStore::new(&agent_config.state_dir);

    // The ssh transport has no telemetry backend, so schedules run without
    // the pre-hibernation idle check
    let scheduler = Arc::new(
        Scheduler::new(lifecycle.clone(), None)
            .with_tick_interval(Duration::from_secs(agent_config.schedule_tick_secs)),
    );

    let service = Arc::new(
        AutonomousService::new(
            idle,
            lifecycle.clone(),
            lifecycle,
            collector,
            savings,
            store,
            agent_config.autonomous.clone(),
        )
        .context("building autonomous service")?,
    );

    // Health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::COLLECTOR).await;
    health_registry.register(components::IDLE_MANAGER).await;
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::STATE_STORE).await;

    let metrics = AgentMetrics::new();

    // Shutdown fan-out and the service control channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (control_tx, control_rx) = control_channel();

    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));
    let service_handle = tokio::spawn(service.clone().run(shutdown_tx.subscribe(), control_rx));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        service,
    ));
    let _api_handle = tokio::spawn(api::serve(agent_config.api_port, app_state));

    health_registry.set_ready(true).await;

    // SIGINT/SIGTERM stop the agent, SIGHUP reloads configuration
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!(signal = "SIGINT", "Shutdown signal received");
                break;
            }
            _ = sigterm.recv() => {
                info!(signal = "SIGTERM", "Shutdown signal received");
                break;
            }
            _ = sighup.recv() => {
                info!(signal = "SIGHUP", "Reload signal received");
                if control_tx.send(ControlCommand::Reload).await.is_err() {
                    error!("Service control channel closed");
                    break;
                }
            }
        }
    }

    health_registry.set_ready(false).await;
    let _ = control_tx.send(ControlCommand::Shutdown).await;
    let _ = shutdown_tx.send(());

    // The service flushes state on its way out; surface a failed flush
    if let Err(e) = service_handle.await? {
        error!(error = %e, "Service stopped with error");
    }
    scheduler_handle.await?;

    info!("hibernate-agent stopped");
    Ok(())
}
