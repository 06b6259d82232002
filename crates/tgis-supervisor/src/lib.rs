//! # tgis-supervisor
//!
//! Keeps a locally owned TGIS inference server running and reachable.
//!
//! This crate provides:
//! - [`ProcessSupervisor`], which launches the server, watches it boot
//!   through its `/health` side channel and relaunches it when a failed RPC
//!   suggests it went down
//! - [`FaultDetectingCaller`], the handle RPCs are issued through; it refuses
//!   calls while the server is not ready and schedules recovery checks on
//!   transport-level failures
//! - Health probing, process launching, configuration and logging setup
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tgis_core::GenerationChannel;
//! use tgis_supervisor::{ProcessSupervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SupervisorConfig::default().with_num_shards(2);
//!     let supervisor = ProcessSupervisor::<GenerationChannel>::new(config)?;
//!
//!     supervisor.launch("ibm/granite-13b")?;
//!     supervisor.wait_until_ready(Duration::from_secs(300)).await?;
//!
//!     let caller = supervisor.caller().ok_or("TGIS is not ready")?;
//!     let _info = caller
//!         .call("ModelInfo", |client| async move {
//!             let _channel = client.channel();
//!             Ok::<_, tonic::Status>(())
//!         })
//!         .await;
//!
//!     supervisor.terminate();
//!     Ok(())
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

pub mod caller;
pub mod config;
pub mod health;
pub mod logging;
pub mod process;
pub mod supervisor;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use caller::FaultDetectingCaller;
pub use config::SupervisorConfig;
pub use health::{HealthProbe, HttpHealthProbe, ProbeError};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use process::{ChildProcess, CommandLauncher, LaunchSpec, ProcessHandle, ProcessLauncher};
pub use supervisor::{ProcessSupervisor, RecoveryAction, SupervisorState};

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Why a boot attempt was abandoned
///
/// Captured by the boot monitor and handed to every waiter of that attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootFailure {
    #[error("TGIS failed to boot model {model}: process exited ({status})")]
    Exited { model: String, status: String },

    #[error("TGIS failed to boot model {model}: process handle lost")]
    Vanished { model: String },

    #[error("TGIS failed to boot model {model} within {timeout:?}")]
    Timeout { model: String, timeout: Duration },

    #[error("TGIS booted model {model} but the client could not be built: {reason}")]
    Client { model: String, reason: String },
}

impl BootFailure {
    /// Check if the boot ran out of time rather than failing outright
    pub fn is_timeout(&self) -> bool {
        matches!(self, BootFailure::Timeout { .. })
    }

    /// Model the failed boot was for
    pub fn model(&self) -> &str {
        match self {
            BootFailure::Exited { model, .. }
            | BootFailure::Vanished { model }
            | BootFailure::Timeout { model, .. }
            | BootFailure::Client { model, .. } => model,
        }
    }
}

/// Errors that can occur while supervising a server
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to load configuration: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Failed to spawn TGIS: {0}")]
    Spawn(String),

    #[error("TGIS is already booting model {0}")]
    AlreadyBooting(String),

    #[error("No tokio runtime available; create the supervisor from within a runtime")]
    NoRuntime,

    #[error(transparent)]
    Boot(#[from] BootFailure),

    #[error("TGIS is stopped")]
    Stopped,

    #[error("TGIS did not become ready within {0:?}")]
    WaitTimeout(Duration),

    #[error("Health probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Check if waiting longer or relaunching could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SupervisorError::WaitTimeout(_) | SupervisorError::AlreadyBooting(_) => true,
            SupervisorError::Boot(failure) => failure.is_timeout(),
            SupervisorError::Probe(e) => e.is_not_listening(),
            _ => false,
        }
    }

    /// Check if the error is a timeout of any kind
    pub fn is_timeout(&self) -> bool {
        match self {
            SupervisorError::WaitTimeout(_) => true,
            SupervisorError::Boot(failure) => failure.is_timeout(),
            _ => false,
        }
    }
}
