//! Agent configuration
//!
//! Layered: defaults, then an optional config file, then environment
//! variables prefixed `HIBERNATE_AGENT` (nested keys separated by `__`,
//! e.g. `HIBERNATE_AGENT_AUTONOMOUS__AUTO_EXECUTE=true`).

use anyhow::{Context, Result};
use hibernate_agent_lib::idle::CONFIG_DIR_NAME;
use hibernate_agent_lib::service::AutonomousConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Directory holding idle configuration, history, and state snapshots
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// API server port for health/metrics/status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Orchestration CLI used for lifecycle actions
    #[serde(default = "default_lifecycle_program")]
    pub lifecycle_program: String,

    /// SSH user for usage probes
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// SSH private key for usage probes
    #[serde(default = "default_ssh_key_path")]
    pub ssh_key_path: String,

    /// Interval between schedule evaluations in seconds
    #[serde(default = "default_schedule_tick_secs")]
    pub schedule_tick_secs: u64,

    /// Autonomous service settings
    #[serde(default)]
    pub autonomous: AutonomousConfig,
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

fn default_api_port() -> u16 {
    8080
}

fn default_lifecycle_program() -> String {
    "cws".to_string()
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

fn default_ssh_key_path() -> String {
    "~/.ssh/cloudworkstation".to_string()
}

fn default_schedule_tick_secs() -> u64 {
    60
}

impl AgentConfig {
    /// Load configuration from the default file location and environment
    pub fn load() -> Result<Self> {
        Self::load_from(std::env::var("HIBERNATE_AGENT_CONFIG").ok().as_deref())
    }

    /// Load configuration, optionally from an explicit file path
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(p) => config::File::with_name(p).required(true),
            None => config::File::with_name("hibernate-agent").required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("HIBERNATE_AGENT").separator("__"))
            .build()
            .context("building configuration")?;

        let agent_config: AgentConfig = settings
            .try_deserialize()
            .context("parsing configuration")?;
        agent_config
            .autonomous
            .validate()
            .context("validating autonomous settings")?;
        Ok(agent_config)
    }
}
