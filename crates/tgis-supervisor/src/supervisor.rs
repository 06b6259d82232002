//! Lifecycle of the supervised TGIS server
//!
//! The supervisor moves through three states:
//!
//! ```text
//!   STOPPED --launch--> BOOTING --healthy--> READY
//!      ^                   |                   |
//!      +---exit/timeout----+                   |
//!      +-------------terminate-----------------+
//! ```
//!
//! A background boot monitor drives BOOTING to READY or back to STOPPED and
//! is always bounded by the load timeout. Once READY, nothing polls the
//! server; a failed RPC seen by a [`FaultDetectingCaller`] schedules an
//! [`autorecover`](ProcessSupervisor::autorecover) check instead.
//!
//! Dropping the last handle terminates the process, but only when every
//! clone (including callers and in-flight recovery tasks) is gone. Call
//! [`terminate`](ProcessSupervisor::terminate) explicitly when done.

use crate::caller::FaultDetectingCaller;
use crate::config::SupervisorConfig;
use crate::health::{HealthProbe, HttpHealthProbe};
use crate::process::{CommandLauncher, LaunchSpec, ProcessHandle, ProcessLauncher};
use crate::{BootFailure, Result, SupervisorError};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tgis_core::ServiceContract;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::Endpoint;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Stopped = 0,
    Booting = 1,
    Ready = 2,
}

impl SupervisorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SupervisorState::Booting,
            2 => SupervisorState::Ready,
            _ => SupervisorState::Stopped,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Stopped => write!(f, "STOPPED"),
            SupervisorState::Booting => write!(f, "BOOTING"),
            SupervisorState::Ready => write!(f, "READY"),
        }
    }
}

/// Outcome of an autorecovery check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// A boot was already in flight
    SkippedBooting,
    /// The health probe passed
    SkippedHealthy,
    /// Nothing was ever launched, so there is no model to relaunch
    SkippedNoModel,
    /// The server was relaunched and is booting again
    Relaunched,
}

/// Supervises one TGIS server process
///
/// Cheap to clone; clones share the same process and state.
pub struct ProcessSupervisor<C: ServiceContract> {
    inner: Arc<Inner<C>>,
}

impl<C: ServiceContract> Clone for ProcessSupervisor<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C> {
    config: SupervisorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn HealthProbe>,
    runtime: Handle,
    /// Written only while `slot` is locked; read anywhere
    state: AtomicU8,
    state_tx: watch::Sender<SupervisorState>,
    slot: Mutex<Slot>,
    /// `Some` whenever `state` is READY
    client: RwLock<Option<C>>,
}

/// Everything guarded by the supervisor mutex
#[derive(Default)]
struct Slot {
    process: Option<Box<dyn ProcessHandle>>,
    boot: Option<BootAttempt>,
    last_failure: Option<BootFailure>,
    /// Last model launched, kept for relaunching
    model: Option<String>,
    /// Incremented per launch so a stale monitor can recognise itself
    epoch: u64,
}

struct BootAttempt {
    model: String,
    started: Instant,
    epoch: u64,
}

impl<C: ServiceContract> ProcessSupervisor<C> {
    /// Create a supervisor that launches `text-generation-launcher` and
    /// probes `http://localhost:{http_port}/health`
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let probe = HttpHealthProbe::new(config.http_port, config.health_poll_timeout)?;
        let launcher = CommandLauncher::new(config.shutdown_grace);
        Self::with_components(config, Arc::new(launcher), Arc::new(probe))
    }

    /// Create a supervisor with a custom launcher and health probe
    pub fn with_components(
        config: SupervisorConfig,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| SupervisorError::NoRuntime)?;
        let (state_tx, _) = watch::channel(SupervisorState::Stopped);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                probe,
                runtime,
                state: AtomicU8::new(SupervisorState::Stopped as u8),
                state_tx,
                slot: Mutex::new(Slot::default()),
                client: RwLock::new(None),
            }),
        })
    }

    /// Launch the server for `model`, replacing any previous process
    ///
    /// Fails with [`SupervisorError::AlreadyBooting`] while a boot is in
    /// flight; terminate first to start over.
    pub fn launch(&self, model: &str) -> Result<()> {
        let mut slot = self.inner.slot.lock();
        self.inner.launch_locked(&mut slot, model)
    }

    /// Wait until the server is READY
    ///
    /// Returns the captured [`BootFailure`] if the boot was abandoned,
    /// [`SupervisorError::Stopped`] if the server is stopped for any other
    /// reason and [`SupervisorError::WaitTimeout`] if `timeout` elapses
    /// first.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.state_tx.subscribe();

        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                debug!(%state, "wait_until_ready saw state");
                match state {
                    SupervisorState::Ready => return Ok(()),
                    SupervisorState::Stopped => {
                        return Err(match self.inner.slot.lock().last_failure.clone() {
                            Some(failure) => SupervisorError::Boot(failure),
                            None => SupervisorError::Stopped,
                        });
                    }
                    SupervisorState::Booting => {}
                }

                if rx.changed().await.is_err() {
                    return Err(SupervisorError::Stopped);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SupervisorError::WaitTimeout(timeout))?
    }

    /// Stop the server; safe to call any number of times
    pub fn terminate(&self) {
        let mut slot = self.inner.slot.lock();
        self.inner.ensure_terminated(&mut slot);
    }

    /// Whether the server is READY; never blocks
    pub fn is_ready(&self) -> bool {
        self.state() == SupervisorState::Ready
    }

    /// Current lifecycle state
    pub fn state(&self) -> SupervisorState {
        self.inner.state()
    }

    /// Client bound to the running server, only while READY
    pub fn client(&self) -> Option<C> {
        if !self.is_ready() {
            return None;
        }
        self.inner.client.read().clone()
    }

    /// Fault-detecting handle to issue RPCs through, only while READY
    pub fn caller(&self) -> Option<FaultDetectingCaller<C>> {
        if !self.is_ready() {
            warn!("caller requested while TGIS is {}", self.state());
            return None;
        }
        Some(FaultDetectingCaller::new(self.clone()))
    }

    /// Launch `model` if nothing is running, then wait until READY and
    /// return a caller
    pub async fn ensure_serving(
        &self,
        model: &str,
        timeout: Duration,
    ) -> Result<FaultDetectingCaller<C>> {
        {
            let mut slot = self.inner.slot.lock();
            if self.inner.state() == SupervisorState::Stopped {
                self.inner.launch_locked(&mut slot, model)?;
            }
        }

        self.wait_until_ready(timeout).await?;
        self.caller().ok_or(SupervisorError::Stopped)
    }

    /// [`ensure_serving`](Self::ensure_serving), abandoned when `shutdown`
    /// completes first
    ///
    /// On shutdown the server is terminated and `Ok(None)` is returned.
    pub async fn ensure_serving_until<F>(
        &self,
        model: &str,
        timeout: Duration,
        shutdown: F,
    ) -> Result<Option<FaultDetectingCaller<C>>>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.ensure_serving(model, timeout) => result.map(Some),
            _ = shutdown => {
                info!(model = %model, "Shutdown requested before TGIS was ready");
                self.terminate();
                Ok(None)
            }
        }
    }

    /// Check whether the server went down and relaunch it if so
    ///
    /// Does nothing while a boot is in flight or when the health probe
    /// passes.
    pub async fn autorecover(&self) -> Result<RecoveryAction> {
        if self.state() == SupervisorState::Booting {
            debug!("Autorecovery skipped because TGIS is booting");
            return Ok(RecoveryAction::SkippedBooting);
        }

        match self.inner.probe.check().await {
            Ok(true) => {
                debug!("Autorecovery skipped because TGIS is healthy");
                return Ok(RecoveryAction::SkippedHealthy);
            }
            Ok(false) => warn!("TGIS reported unhealthy"),
            Err(e) => warn!("TGIS health check failed: {}", e),
        }

        let mut slot = self.inner.slot.lock();
        // A concurrent recovery may have won the race
        if self.inner.state() == SupervisorState::Booting {
            debug!("Autorecovery skipped because another thread relaunched TGIS");
            return Ok(RecoveryAction::SkippedBooting);
        }

        let Some(model) = slot.model.clone() else {
            warn!("Autorecovery skipped because no model was ever launched");
            return Ok(RecoveryAction::SkippedNoModel);
        };

        warn!(model = %model, "Relaunching unhealthy TGIS");
        self.inner.launch_locked(&mut slot, &model)?;
        Ok(RecoveryAction::Relaunched)
    }

    /// Run [`autorecover`](Self::autorecover) in the background
    pub fn schedule_autorecovery(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        self.inner.runtime.spawn(async move {
            match supervisor.autorecover().await {
                Ok(action) => debug!(?action, "Autorecovery check finished"),
                Err(e) => error!("Autorecovery failed: {}", e),
            }
        })
    }

    /// Failure captured by the most recent boot attempt, if it failed
    pub fn last_failure(&self) -> Option<BootFailure> {
        self.inner.slot.lock().last_failure.clone()
    }

    /// Model most recently launched
    pub fn model(&self) -> Option<String> {
        self.inner.slot.lock().model.clone()
    }

    /// OS id of the running process
    pub fn process_id(&self) -> Option<u32> {
        self.inner.slot.lock().process.as_ref().and_then(|p| p.id())
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }
}

impl<C: ServiceContract> Inner<C> {
    fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Takes the locked slot to prove the mutex is held
    fn set_state(&self, _slot: &mut Slot, state: SupervisorState) {
        debug!(%state, "Setting TGIS state");
        self.state.store(state as u8, Ordering::Release);
        self.state_tx.send_replace(state);
    }

    fn launch_locked(self: &Arc<Self>, slot: &mut Slot, model: &str) -> Result<()> {
        if self.state() == SupervisorState::Booting {
            let booting = slot
                .boot
                .as_ref()
                .map(|boot| boot.model.clone())
                .unwrap_or_default();
            return Err(SupervisorError::AlreadyBooting(booting));
        }

        self.ensure_terminated(slot);
        slot.model = Some(model.to_string());
        slot.last_failure = None;

        let spec = LaunchSpec::for_model(&self.config, model);
        let process = self.launcher.spawn(&spec)?;

        slot.process = Some(process);
        slot.epoch += 1;
        slot.boot = Some(BootAttempt {
            model: model.to_string(),
            started: Instant::now(),
            epoch: slot.epoch,
        });
        self.set_state(slot, SupervisorState::Booting);

        // Detached; a monitor whose epoch is gone exits on its own
        self.runtime.spawn(monitor_boot(Arc::downgrade(self), slot.epoch));
        Ok(())
    }

    fn ensure_terminated(&self, slot: &mut Slot) {
        if let Some(process) = slot.process.take() {
            process.terminate();
        }
        slot.boot = None;

        if self.state() != SupervisorState::Stopped {
            self.set_state(slot, SupervisorState::Stopped);
        }
        *self.client.write() = None;
    }

    fn fail_boot(&self, slot: &mut Slot, failure: BootFailure) {
        error!(model = failure.model(), "{}", failure);
        self.ensure_terminated(slot);
        slot.last_failure = Some(failure);
    }

    /// The boot this monitor was started for, if it is still in flight
    fn current_boot<'a>(&self, slot: &'a Slot, epoch: u64) -> Option<&'a BootAttempt> {
        if self.state() != SupervisorState::Booting {
            return None;
        }
        slot.boot.as_ref().filter(|boot| boot.epoch == epoch)
    }

    fn connect(&self) -> std::result::Result<C, String> {
        let endpoint = Endpoint::from_shared(format!("http://localhost:{}", self.config.grpc_port))
            .map_err(|e| e.to_string())?;
        debug!(port = self.config.grpc_port, "Connecting to TGIS INSECURE");
        Ok(C::from_channel(endpoint.connect_lazy()))
    }
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        if let Some(process) = self.slot.get_mut().process.take() {
            debug!("Supervisor dropped, terminating TGIS");
            process.terminate();
        }
    }
}

/// Drive one boot attempt to READY or STOPPED
async fn monitor_boot<C: ServiceContract>(inner: Weak<Inner<C>>, epoch: u64) {
    loop {
        let Some(delay) = inner.upgrade().map(|i| i.config.bootup_poll_delay) else {
            return;
        };
        tokio::time::sleep(delay).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };

        // Did the process die?
        let (model, started) = {
            let mut slot = inner.slot.lock();
            let Some(boot) = inner.current_boot(&slot, epoch) else {
                return;
            };
            let model = boot.model.clone();
            let started = boot.started;

            let exited = match slot.process.as_mut() {
                Some(process) => process.check_exit().map(|status| BootFailure::Exited {
                    model: model.clone(),
                    status,
                }),
                None => Some(BootFailure::Vanished {
                    model: model.clone(),
                }),
            };
            if let Some(failure) = exited {
                inner.fail_boot(&mut slot, failure);
                return;
            }
            (model, started)
        };

        match inner.probe.check().await {
            Ok(true) => {
                let mut slot = inner.slot.lock();
                if inner.current_boot(&slot, epoch).is_none() {
                    return;
                }
                match inner.connect() {
                    Ok(client) => {
                        *inner.client.write() = Some(client);
                        slot.boot = None;
                        inner.set_state(&mut slot, SupervisorState::Ready);
                        info!(
                            model = %model,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "TGIS booted"
                        );
                    }
                    Err(reason) => inner.fail_boot(&mut slot, BootFailure::Client { model, reason }),
                }
                return;
            }
            Ok(false) => debug!("TGIS not healthy yet"),
            Err(e) if e.is_not_listening() => debug!("TGIS not listening yet"),
            Err(e) => warn!("TGIS health check failed while booting: {}", e),
        }

        let timeout = inner.config.load_timeout;
        if started.elapsed() >= timeout {
            let mut slot = inner.slot.lock();
            if inner.current_boot(&slot, epoch).is_none() {
                return;
            }
            inner.fail_boot(&mut slot, BootFailure::Timeout { model, timeout });
            return;
        }
    }
}
