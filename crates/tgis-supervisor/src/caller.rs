//! RPC handle that watches for server faults

use crate::supervisor::ProcessSupervisor;
use std::future::Future;
use tgis_core::{FaultClass, ServiceContract};
use tonic::Status;
use tracing::{debug, error, warn};

/// Forwards RPCs to the supervised server
///
/// Calls made while the server is not READY fail with `UNAVAILABLE` without
/// touching the network. Failed calls are always returned to the caller
/// unchanged; when the status code suggests the server itself is in trouble
/// a recovery check is scheduled in the background.
pub struct FaultDetectingCaller<C: ServiceContract> {
    supervisor: ProcessSupervisor<C>,
}

impl<C: ServiceContract> Clone for FaultDetectingCaller<C> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
        }
    }
}

impl<C: ServiceContract> FaultDetectingCaller<C> {
    pub(crate) fn new(supervisor: ProcessSupervisor<C>) -> Self {
        Self { supervisor }
    }

    /// Methods this caller forwards
    pub fn methods(&self) -> impl Iterator<Item = &'static str> {
        C::DESCRIPTOR.methods.iter().copied()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor<C> {
        &self.supervisor
    }

    /// Issue `method` through the current client
    ///
    /// `rpc` receives a clone of the client bound to the running server and
    /// performs the actual request. It must issue the RPC named by `method`:
    /// the name is what gets checked against the service descriptor and what
    /// failures are logged under.
    pub async fn call<R, F, Fut>(&self, method: &str, rpc: F) -> Result<R, Status>
    where
        F: FnOnce(C) -> Fut,
        Fut: Future<Output = Result<R, Status>>,
    {
        let Some(path) = C::DESCRIPTOR.path(method) else {
            return Err(Status::unimplemented(format!(
                "{} has no method {}",
                C::DESCRIPTOR,
                method
            )));
        };

        if !self.supervisor.is_ready() {
            return Err(Status::unavailable("TGIS is not ready"));
        }
        let Some(client) = self.supervisor.client() else {
            return Err(Status::unavailable("TGIS is not ready"));
        };

        match rpc(client).await {
            Ok(response) => Ok(response),
            Err(status) => {
                self.handle_failure(&path, &status);
                Err(status)
            }
        }
    }

    fn handle_failure(&self, path: &str, status: &Status) {
        match FaultClass::of_status(status) {
            FaultClass::Cancelled => {
                debug!(path, "RPC cancelled");
            }
            class if class.triggers_recovery() => {
                warn!(
                    path,
                    code = ?status.code(),
                    "RPC failed, checking whether TGIS needs recovery: {}",
                    status.message()
                );
                // Fire and forget; the failed call returns immediately
                drop(self.supervisor.schedule_autorecovery());
            }
            class => {
                error!(
                    path,
                    code = ?status.code(),
                    %class,
                    "Unexpected RPC failure: {}",
                    status.message()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorState;
    use crate::testing::{fast_config, FakeLauncher, FakeProbe};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tgis_core::GenerationChannel;
    use tonic::Code;

    async fn ready_caller(
        launcher: &Arc<FakeLauncher>,
        probe: &Arc<FakeProbe>,
    ) -> FaultDetectingCaller<GenerationChannel> {
        crate::logging::init_test_logging();
        // Long load timeout so a relaunch outlives the test's own polling
        let config = fast_config().with_boot_timing(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        let supervisor = ProcessSupervisor::<GenerationChannel>::with_components(
            config,
            launcher.clone(),
            probe.clone(),
        )
        .unwrap();
        supervisor
            .ensure_serving("flan-t5", Duration::from_secs(1))
            .await
            .unwrap()
    }

    /// Poll until `condition` holds or a second passes
    async fn eventually(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_forwards_successful_calls() {
        let launcher = FakeLauncher::new();
        let probe = FakeProbe::new(true);
        let caller = ready_caller(&launcher, &probe).await;

        let response = caller
            .call("Tokenize", |client| async move {
                let _channel = client.channel();
                Ok::<_, Status>(7)
            })
            .await
            .unwrap();
        assert_eq!(response, 7);

        let methods: Vec<_> = caller.methods().collect();
        assert!(methods.contains(&"Generate"));
    }

    #[tokio::test]
    async fn test_not_ready_fails_without_calling() {
        let launcher = FakeLauncher::new();
        let probe = FakeProbe::new(true);
        let caller = ready_caller(&launcher, &probe).await;
        caller.supervisor().terminate();

        let called = AtomicBool::new(false);
        let status = caller
            .call("Generate", |_client| async {
                called.store(true, Ordering::SeqCst);
                Ok::<_, Status>(())
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Unavailable);
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let launcher = FakeLauncher::new();
        let probe = FakeProbe::new(true);
        let caller = ready_caller(&launcher, &probe).await;

        let status = caller
            .call("Shutdown", |_client| async { Ok::<_, Status>(()) })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);
        assert!(status.message().contains("fmaas.GenerationService"));
    }

    #[tokio::test]
    async fn test_recoverable_failure_relaunches_dead_server() {
        let launcher = FakeLauncher::new();
        let probe = FakeProbe::new(true);
        let caller = ready_caller(&launcher, &probe).await;

        // The server dies under us
        probe.set_healthy(false);
        let status = caller
            .call("Generate", |_client| async {
                Err::<(), _>(Status::unavailable("connection reset"))
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "connection reset");

        assert!(eventually(|| launcher.spawns().len() == 2).await);
        assert_eq!(caller.supervisor().state(), SupervisorState::Booting);

        // Same handle works again once the relaunch boots
        probe.set_healthy(true);
        caller
            .supervisor()
            .wait_until_ready(Duration::from_secs(1))
            .await
            .unwrap();
        let response = caller
            .call("Generate", |_client| async { Ok::<_, Status>("ok") })
            .await
            .unwrap();
        assert_eq!(response, "ok");
    }

    #[tokio::test]
    async fn test_recoverable_failure_on_healthy_server_is_only_checked() {
        let launcher = FakeLauncher::new();
        let probe = FakeProbe::new(true);
        let caller = ready_caller(&launcher, &probe).await;
        let checks = probe.checks();

        let status = caller
            .call("Generate", |_client| async {
                Err::<(), _>(Status::deadline_exceeded("too slow"))
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);

        assert!(eventually(|| probe.checks() > checks).await);
        assert!(caller.supervisor().is_ready());
        assert_eq!(launcher.spawns().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_and_unexpected_do_not_recover() {
        let launcher = FakeLauncher::new();
        let probe = FakeProbe::new(true);
        let caller = ready_caller(&launcher, &probe).await;
        let checks = probe.checks();

        for status in [
            Status::cancelled("client went away"),
            Status::invalid_argument("max_new_tokens must be positive"),
        ] {
            let code = status.code();
            let returned = caller
                .call("Generate", move |_client| async move { Err::<(), _>(status) })
                .await
                .unwrap_err();
            assert_eq!(returned.code(), code);
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(probe.checks(), checks);
        assert_eq!(launcher.spawns().len(), 1);
    }
}
