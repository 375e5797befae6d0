//! Inference server domain: launch arguments, process seam and supervisor.

mod launch;
mod process;
mod supervisor;

pub use launch::{completions_endpoint, LaunchConfig};
pub use process::{resolve_executable, OsSpawner, ServerChild, Spawner, StopSignal};
pub use supervisor::{
    stop_on_interrupt, stop_shared, ServerHandle, ServerState, SharedSupervisor, StopOutcome, Supervisor,
    DEFAULT_RUNG_TIMEOUT,
};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server executable '{0}' not found")]
    ExecutableNotFound(String),

    #[error("Failed to start {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid server port {0}")]
    InvalidPort(i64),

    #[error("Could not install interrupt handler: {0}")]
    SignalHandler(String),
}
