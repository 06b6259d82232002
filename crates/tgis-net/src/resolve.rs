//! Target parsing and DNS resolution

use crate::{NetError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// The set of socket addresses a target currently resolves to
pub type AddressSet = BTreeSet<SocketAddr>;

/// A `host:port` dial target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Create a target from its parts
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Target {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        if s.matches(':').count() != 1 {
            return Err(NetError::InvalidTarget(format!(
                "{} (target must be provided in host:port format)",
                s
            )));
        }

        let (host, port) = s
            .split_once(':')
            .ok_or_else(|| NetError::InvalidTarget(s.to_string()))?;

        if host.parse::<IpAddr>().is_err() && !validate_hostname(host) {
            return Err(NetError::InvalidTarget(format!("{} (invalid hostname)", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| NetError::InvalidTarget(format!("{} (invalid port: {})", s, e)))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Resolves a target to its current address set
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, target: &Target) -> Result<AddressSet>;
}

/// Resolver backed by the system's `getaddrinfo`
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn resolve(&self, target: &Target) -> Result<AddressSet> {
        let address = target.to_string();

        // Try to parse as a direct socket address first
        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(AddressSet::from([addr]));
        }

        let lookup = address.clone();
        let resolved = tokio::task::spawn_blocking(move || {
            lookup
                .to_socket_addrs()
                .map(|addrs| addrs.collect::<AddressSet>())
        })
        .await
        .map_err(|e| NetError::DnsResolution(format!("resolution task failed: {}", e)))?;

        match resolved {
            Ok(addrs) if addrs.is_empty() => {
                warn!(target = %address, "DNS returned no addresses");
                Err(NetError::DnsResolution(format!("no addresses found for {}", address)))
            }
            Ok(addrs) => {
                debug!(target = %address, addresses = ?addrs, "Resolved target via DNS");
                Ok(addrs)
            }
            Err(e) => Err(NetError::DnsResolution(format!("{}: {}", address, e))),
        }
    }
}

/// Resolver that answers from a fixed, replaceable address set
///
/// Used for static backend lists and to drive the polling proxy in tests.
#[derive(Debug)]
pub struct StaticResolver {
    answer: Mutex<std::result::Result<AddressSet, String>>,
    lookups: AtomicUsize,
}

impl StaticResolver {
    pub fn new(addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            answer: Mutex::new(Ok(addresses.into_iter().collect())),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Replace the answer returned by subsequent lookups
    pub fn set(&self, addresses: impl IntoIterator<Item = SocketAddr>) {
        *self.answer.lock() = Ok(addresses.into_iter().collect());
    }

    /// Make subsequent lookups fail
    pub fn fail(&self, reason: impl Into<String>) {
        *self.answer.lock() = Err(reason.into());
    }

    /// Number of lookups served so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve(&self, target: &Target) -> Result<AddressSet> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.answer
            .lock()
            .clone()
            .map_err(|reason| NetError::DnsResolution(format!("{}: {}", target, reason)))
    }
}

/// Validate a hostname according to RFC standards
pub fn validate_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }

    for label in hostname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return false;
        }

        // Labels must start and end with alphanumeric characters
        if !label.starts_with(|c: char| c.is_ascii_alphanumeric())
            || !label.ends_with(|c: char| c.is_ascii_alphanumeric())
        {
            return false;
        }

        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let target: Target = "tgis.svc.cluster.local:8033".parse().unwrap();
        assert_eq!(target.host, "tgis.svc.cluster.local");
        assert_eq!(target.port, 8033);
        assert_eq!(target.to_string(), "tgis.svc.cluster.local:8033");

        let target: Target = "10.0.0.7:50055".parse().unwrap();
        assert_eq!(target, Target::new("10.0.0.7", 50055));
    }

    #[test]
    fn test_parse_target_rejects_bad_formats() {
        assert!("localhost".parse::<Target>().is_err());
        assert!("localhost:80:90".parse::<Target>().is_err());
        assert!("[::1]:8033".parse::<Target>().is_err());
        assert!("localhost:http".parse::<Target>().is_err());
        assert!("localhost:70000".parse::<Target>().is_err());
        assert!(":8033".parse::<Target>().is_err());
        assert!("bad host:8033".parse::<Target>().is_err());
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("example.com"));
        assert!(validate_hostname("sub.example.com"));
        assert!(validate_hostname("test-host"));

        assert!(!validate_hostname(""));
        assert!(!validate_hostname(".example.com"));
        assert!(!validate_hostname("example.com."));
        assert!(!validate_hostname("-example.com"));
        assert!(!validate_hostname("example-.com"));
        assert!(!validate_hostname("ex_ample.com"));
    }

    #[tokio::test]
    async fn test_dns_resolver_literal_address() {
        let target = Target::new("127.0.0.1", 8033);
        let addrs = DnsResolver.resolve(&target).await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs.contains(&"127.0.0.1:8033".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_dns_resolver_localhost() {
        let target = Target::new("localhost", 8033);
        let addrs = DnsResolver.resolve(&target).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 8033 && a.ip().is_loopback()));
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let p1: SocketAddr = "10.0.0.1:8033".parse().unwrap();
        let p2: SocketAddr = "10.0.0.2:8033".parse().unwrap();
        let resolver = StaticResolver::new([p1]);
        let target = Target::new("tgis", 8033);

        assert_eq!(resolver.resolve(&target).await.unwrap(), AddressSet::from([p1]));

        resolver.set([p1, p2]);
        assert_eq!(resolver.resolve(&target).await.unwrap().len(), 2);

        resolver.fail("SERVFAIL");
        let err = resolver.resolve(&target).await.unwrap_err();
        assert!(err.is_resolution());
        assert_eq!(resolver.lookups(), 3);
    }
}
