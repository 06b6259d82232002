//! DNS-polling channel proxy
//!
//! [`ChannelPollingProxy`] is a client handle whose identity never changes
//! while the gRPC channel behind it may be rebuilt many times. A background
//! timer periodically resolves the target hostname; when the resolved
//! address set gains an address the channel is rebuilt so that the new
//! backend is dialed. Shrinkage is recorded but never triggers a rebuild:
//! tonic drops sub-channels to dead addresses on its own.
//!
//! The proxy holds the current [`ChannelBinding`] behind a swappable
//! reference. Every read takes a snapshot, so callers that already cloned a
//! client keep using the old channel while later reads see the new one.
//!
//! Polling stops when [`ChannelPollingProxy::shutdown`] is called. Dropping
//! every handle also stops it, but owners should call `shutdown` explicitly
//! rather than rely on that.

use crate::config::{LoadBalancingPolicy, ProxyConfig};
use crate::resolve::{AddressResolver, AddressSet, DnsResolver, Target};
use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tgis_core::ServiceContract;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, warn};

/// A client bound to one channel build
#[derive(Debug)]
pub struct ChannelBinding<C> {
    client: C,
    channel: Channel,
    generation: u64,
}

impl<C: Clone> ChannelBinding<C> {
    /// A clone of the bound client
    pub fn client(&self) -> C {
        self.client.clone()
    }

    /// The channel the client was built over
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// How many rebuilds preceded this binding (0 for the initial build)
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Long-lived client handle that follows DNS changes
pub struct ChannelPollingProxy<C: ServiceContract> {
    shared: Arc<Shared<C>>,
}

impl<C: ServiceContract> Clone for ChannelPollingProxy<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<C> {
    target: Target,
    config: ProxyConfig,
    tls: Option<ClientTlsConfig>,
    resolver: Arc<dyn AddressResolver>,
    binding: RwLock<Arc<ChannelBinding<C>>>,
    /// Held for a whole tick, across the DNS lookup
    tick_gate: tokio::sync::Mutex<()>,
    poll: Mutex<PollState>,
    shutdown: AtomicBool,
}

/// Guarded by the poll lock
struct PollState {
    addresses: AddressSet,
    generation: u64,
    timer: Option<PendingTimer>,
    next_timer_id: u64,
}

struct PendingTimer {
    id: u64,
    handle: JoinHandle<()>,
}

impl<C: ServiceContract> ChannelPollingProxy<C> {
    /// Build the proxy and start polling DNS through the system resolver
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn new(config: ProxyConfig) -> Result<Self> {
        Self::with_resolver(config, Arc::new(DnsResolver)).await
    }

    /// Build the proxy with a custom address resolver
    pub async fn with_resolver(
        config: ProxyConfig,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<Self> {
        let target = config.validate()?;
        let tls = match &config.tls {
            Some(tls) => tls.load_client_config(&target.host)?,
            None => None,
        };

        let addresses = match resolver.resolve(&target).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(target = %target, error = %e, "Initial DNS resolution failed");
                AddressSet::new()
            }
        };

        let channel = build_channel(&target, &config, tls.as_ref(), &addresses)?;
        info!(
            target = %target,
            policy = %config.lb_policy,
            secure = tls.is_some(),
            addresses = addresses.len(),
            "Created load-balancing client"
        );

        let binding = ChannelBinding {
            client: C::from_channel(channel.clone()),
            channel,
            generation: 0,
        };

        let shared = Arc::new(Shared {
            target,
            config,
            tls,
            resolver,
            binding: RwLock::new(Arc::new(binding)),
            tick_gate: tokio::sync::Mutex::new(()),
            poll: Mutex::new(PollState {
                addresses,
                generation: 0,
                timer: None,
                next_timer_id: 0,
            }),
            shutdown: AtomicBool::new(false),
        });

        if let Some(interval) = shared.config.poll_interval {
            debug!("Enabling DNS poll every {:?}", interval);
            let mut state = shared.poll.lock();
            Shared::arm_timer(&shared, &mut state, interval);
        }

        Ok(Self { shared })
    }

    /// The current client
    ///
    /// Do not hold on to the returned client across long periods: it keeps
    /// using the channel it was built over even after a rebuild.
    pub fn client(&self) -> C {
        self.shared.binding.read().client()
    }

    /// Snapshot of the current binding
    pub fn binding(&self) -> Arc<ChannelBinding<C>> {
        Arc::clone(&self.shared.binding.read())
    }

    /// Number of rebuilds so far
    pub fn generation(&self) -> u64 {
        self.shared.binding.read().generation
    }

    /// The dial target
    pub fn target(&self) -> &Target {
        &self.shared.target
    }

    /// The last observed address set
    pub fn addresses(&self) -> AddressSet {
        self.shared.poll.lock().addresses.clone()
    }

    /// Whether two handles refer to the same proxy
    pub fn same_proxy(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Run a poll tick now instead of waiting for the timer
    ///
    /// Re-arms the timer afterwards, replacing any pending one.
    pub async fn poll_now(&self) {
        Shared::tick(Arc::clone(&self.shared), None).await;
    }

    /// Stop polling for good
    ///
    /// Cancels the pending timer; no timer is armed afterwards. Safe to call
    /// more than once. The current binding stays usable.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.shared.poll.lock();
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        debug!(target = %self.shared.target, "DNS polling shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Whether a poll timer is currently armed
    pub fn has_pending_timer(&self) -> bool {
        self.shared
            .poll
            .lock()
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.handle.is_finished())
    }
}

impl<C: ServiceContract> Shared<C> {
    /// Poll DNS once and rebuild the channel if new addresses appeared
    ///
    /// `origin` is the id of the timer that fired this tick, if any.
    async fn tick(shared: Arc<Self>, origin: Option<u64>) {
        let _gate = shared.tick_gate.lock().await;
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        debug!(target = %shared.target, "Polling DNS for updates");
        let resolved = shared.resolver.resolve(&shared.target).await;

        let mut state = shared.poll.lock();
        match resolved {
            Ok(addresses) => {
                shared.apply(&mut state, addresses, |state, addresses| {
                    shared.rebuild(state, addresses)
                });
            }
            Err(e) => {
                warn!(target = %shared.target, error = %e, "Failed to poll DNS for updates");
            }
        }

        // Cancel any duplicate timer, unless it is the one running this tick
        if let Some(previous) = state.timer.take() {
            if Some(previous.id) != origin {
                previous.handle.abort();
            }
        }

        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if let Some(interval) = shared.config.poll_interval {
            Self::arm_timer(&shared, &mut state, interval);
        }
    }

    /// Record a fresh lookup, rebuilding through `rebuild` on growth
    ///
    /// The recorded set is left alone when the rebuild fails so the next
    /// tick sees the same growth and tries again.
    fn apply<F>(&self, state: &mut PollState, addresses: AddressSet, rebuild: F)
    where
        F: FnOnce(&mut PollState, &AddressSet) -> Result<u64>,
    {
        let added = addresses.difference(&state.addresses).count();
        if added > 0 {
            match rebuild(state, &addresses) {
                Ok(generation) => info!(
                    target = %self.target,
                    added,
                    generation,
                    "New addresses found, reconnected channel"
                ),
                Err(e) => {
                    warn!(
                        target = %self.target,
                        error = %e,
                        "Failed to rebuild channel"
                    );
                    return;
                }
            }
        } else if addresses != state.addresses {
            debug!(
                target = %self.target,
                removed = state.addresses.difference(&addresses).count(),
                "Addresses removed, keeping current channel"
            );
        }
        state.addresses = addresses;
    }

    fn arm_timer(shared: &Arc<Self>, state: &mut PollState, interval: Duration) {
        let id = state.next_timer_id;
        state.next_timer_id += 1;

        let weak: Weak<Self> = Arc::downgrade(shared);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(shared) = weak.upgrade() {
                Self::tick(shared, Some(id)).await;
            }
        });

        state.timer = Some(PendingTimer { id, handle });
    }

    /// Swap in a fresh channel and client; the caller holds the poll lock
    fn rebuild(&self, state: &mut PollState, addresses: &AddressSet) -> Result<u64> {
        debug!(target = %self.target, "Reconnecting channel");
        let channel = build_channel(&self.target, &self.config, self.tls.as_ref(), addresses)?;

        state.generation += 1;
        let binding = ChannelBinding {
            client: C::from_channel(channel.clone()),
            channel,
            generation: state.generation,
        };
        *self.binding.write() = Arc::new(binding);

        Ok(state.generation)
    }
}

impl<C> Drop for Shared<C> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(timer) = self.poll.get_mut().timer.take() {
            timer.handle.abort();
        }
    }
}

/// Build a lazily connecting channel for the target
fn build_channel(
    target: &Target,
    config: &ProxyConfig,
    tls: Option<&ClientTlsConfig>,
    addresses: &AddressSet,
) -> Result<Channel> {
    let scheme = if tls.is_some() { "https" } else { "http" };
    let endpoint = |authority: String| -> Result<Endpoint> {
        let mut endpoint = Endpoint::from_shared(format!("{}://{}", scheme, authority))?
            .connect_timeout(config.connect_timeout);
        if let Some(tls) = tls {
            endpoint = endpoint.tls_config(tls.clone())?;
        }
        Ok(endpoint)
    };

    match config.lb_policy {
        LoadBalancingPolicy::RoundRobin if !addresses.is_empty() => {
            let endpoints = addresses
                .iter()
                .map(|addr| endpoint(addr.to_string()))
                .collect::<Result<Vec<_>>>()?;
            Ok(Channel::balance_list(endpoints.into_iter()))
        }
        _ => Ok(endpoint(target.to_string())?.connect_lazy()),
    }
}
