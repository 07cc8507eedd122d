//! Agent library for cloud workstation hibernation
//!
//! This crate provides the core functionality for:
//! - Usage metrics collection from remote instances
//! - Threshold-based idle detection
//! - Scheduled hibernation and wake windows
//! - Autonomous action execution with persistent state
//! - Health checks and observability

pub mod collector;
pub mod error;
pub mod health;
pub mod idle;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod policy;
pub mod savings;
pub mod scheduler;
pub mod service;

pub use error::{EngineError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::AgentMetrics;
