//! Long-running service wiring
//!
//! The autonomous loop plus the pieces that make it survive restarts:
//! state persistence and a control channel for shutdown and reload.

pub mod autonomous;
pub mod control;
pub mod persistence;

pub use autonomous::{AutonomousConfig, AutonomousService, CycleSummary, ServiceStatus};
pub use control::{control_channel, ControlCommand};
pub use persistence::{PersistentState, SaveReason, StateStore, STATE_SCHEMA_VERSION};
