//! Control channel for the running service
//!
//! Shutdown and reload are explicit commands on an mpsc channel instead of
//! OS signals. The binary's signal handlers only translate signals into
//! commands, so the same paths are exercised by tests without touching
//! process state.

use std::fmt;
use tokio::sync::mpsc;

/// Commands accepted by a running service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Flush state and stop all loops
    Shutdown,
    /// Re-read the configuration override and keep running
    Reload,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Shutdown => write!(f, "shutdown"),
            ControlCommand::Reload => write!(f, "reload"),
        }
    }
}

/// Creates the control channel pair
///
/// Control traffic is rare and a burst of identical commands collapses
/// into the same outcome, so the capacity stays small.
pub fn control_channel() -> (mpsc::Sender<ControlCommand>, mpsc::Receiver<ControlCommand>) {
    mpsc::channel(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_arrive_in_order() {
        let (tx, mut rx) = control_channel();
        tx.send(ControlCommand::Reload).await.unwrap();
        tx.send(ControlCommand::Shutdown).await.unwrap();

        assert_eq!(rx.recv().await, Some(ControlCommand::Reload));
        assert_eq!(rx.recv().await, Some(ControlCommand::Shutdown));
    }

    #[tokio::test]
    async fn test_closed_channel_yields_none() {
        let (tx, mut rx) = control_channel();
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_command_display() {
        assert_eq!(ControlCommand::Shutdown.to_string(), "shutdown");
        assert_eq!(ControlCommand::Reload.to_string(), "reload");
    }
}
