//! Launching and stopping the TGIS server process

use crate::config::SupervisorConfig;
use crate::{Result, SupervisorError};
use std::fmt;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Command line and environment a server process is launched with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the inherited environment
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Launch spec for serving `model` with the given configuration
    pub fn for_model(config: &SupervisorConfig, model: &str) -> Self {
        let args = vec![
            "--num-shard".to_string(),
            config.num_shards.to_string(),
            "--model-name".to_string(),
            model.to_string(),
            "--port".to_string(),
            config.http_port.to_string(),
        ];

        let mut env = vec![("GRPC_PORT".to_string(), config.grpc_port.to_string())];
        if let Some(dir) = &config.prompt_cache_dir {
            env.push(("PREFIX_STORE_PATH".to_string(), dir.display().to_string()));
        }

        Self {
            program: config.launcher_command.clone(),
            args,
            env,
        }
    }

    /// Value of a variable this spec sets
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// An owned, running server process
pub trait ProcessHandle: Send {
    /// OS process id, if there is one
    fn id(&self) -> Option<u32>;

    /// Non-blocking check; returns a description of the exit if the process
    /// is gone
    fn check_exit(&mut self) -> Option<String>;

    /// Stop the process without waiting for it to exit
    fn terminate(self: Box<Self>);
}

/// Spawns server processes
pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>>;
}

/// Launcher that runs the spec as a child OS process
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    shutdown_grace: Duration,
}

impl CommandLauncher {
    /// `shutdown_grace` is how long a terminated child gets before SIGKILL
    pub fn new(shutdown_grace: Duration) -> Self {
        Self { shutdown_grace }
    }
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProcessLauncher for CommandLauncher {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        info!(command = %spec, "Launching TGIS");

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        // The server logs straight to our stdout/stderr
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let child = command
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {}", spec.program, e)))?;

        debug!(pid = child.id(), "TGIS process spawned");
        Ok(Box::new(ChildProcess {
            child,
            shutdown_grace: self.shutdown_grace,
        }))
    }
}

/// A child process started by [`CommandLauncher`]
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    shutdown_grace: Duration,
}

impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn check_exit(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {}", e)),
        }
    }

    fn terminate(self: Box<Self>) {
        let ChildProcess {
            mut child,
            shutdown_grace,
        } = *self;

        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(child.id() as i32);
            if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
                warn!(pid = child.id(), "Failed to send SIGTERM: {}", e);
            } else {
                debug!(pid = child.id(), "Sent SIGTERM to TGIS");
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = child.kill() {
                warn!(pid = child.id(), "Failed to kill process: {}", e);
            }
        }

        // Reap in the background so terminate never blocks its caller
        let reaper = thread::Builder::new()
            .name("tgis-reaper".to_string())
            .spawn(move || reap(child, shutdown_grace));
        if let Err(e) = reaper {
            error!("Failed to start reaper thread: {}", e);
        }
    }
}

fn reap(mut child: Child, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(pid = child.id(), %status, "TGIS process stopped");
                return;
            }
            Ok(None) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(50));
            }
            Ok(None) => {
                warn!(pid = child.id(), "Graceful shutdown timed out, forcing kill");
                if let Err(e) = child.kill() {
                    error!("Failed to kill process: {}", e);
                }
                if let Err(e) = child.wait() {
                    error!("Failed to wait for killed process: {}", e);
                }
                return;
            }
            Err(e) => {
                error!(pid = child.id(), "Failed to wait for process: {}", e);
                return;
            }
        }
    }
}
