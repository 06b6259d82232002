//! In-process stand-ins for the server process and its health endpoint

use crate::config::SupervisorConfig;
use crate::health::{HealthProbe, ProbeError};
use crate::process::{LaunchSpec, ProcessHandle, ProcessLauncher};
use crate::{Result, SupervisorError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Boot delay 10ms, probe timeout 10ms, load timeout 50ms
pub(crate) fn fast_config() -> SupervisorConfig {
    SupervisorConfig::default().with_boot_timing(
        Duration::from_millis(10),
        Duration::from_millis(10),
        Duration::from_millis(50),
    )
}

#[derive(Debug, Default)]
pub(crate) struct FakeProbe {
    healthy: AtomicBool,
    checks: AtomicUsize,
    delay: Mutex<Duration>,
}

impl FakeProbe {
    pub(crate) fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(healthy),
            checks: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Make every check take `delay` before answering
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn check(&self) -> std::result::Result<bool, ProbeError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(true)
        } else {
            Err(ProbeError::NotListening("connection refused".to_string()))
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeLauncher {
    exit_on_spawn: AtomicBool,
    fail_spawn: AtomicBool,
    spawns: Mutex<Vec<LaunchSpec>>,
    terminations: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Processes spawned from now on report an exit on their first check
    pub(crate) fn set_exit_on_spawn(&self, exit: bool) {
        self.exit_on_spawn.store(exit, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn spawns(&self) -> Vec<LaunchSpec> {
        self.spawns.lock().clone()
    }

    pub(crate) fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for FakeLauncher {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(SupervisorError::Spawn(format!("{}: not found", spec.program)));
        }

        let mut spawns = self.spawns.lock();
        spawns.push(spec.clone());
        Ok(Box::new(FakeProcess {
            id: spawns.len() as u32,
            exited: self.exit_on_spawn.load(Ordering::SeqCst),
            terminations: Arc::clone(&self.terminations),
        }))
    }
}

struct FakeProcess {
    id: u32,
    exited: bool,
    terminations: Arc<AtomicUsize>,
}

impl ProcessHandle for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.id)
    }

    fn check_exit(&mut self) -> Option<String> {
        self.exited.then(|| "exit status: 1".to_string())
    }

    fn terminate(self: Box<Self>) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }
}
