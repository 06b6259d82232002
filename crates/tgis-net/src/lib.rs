//! # tgis-net
//!
//! Networking helpers for TGIS clients.
//!
//! This crate provides:
//! - [`ChannelPollingProxy`], a long-lived client handle whose gRPC channel
//!   is rebuilt in place when DNS reveals new backend addresses
//! - DNS resolution of `host:port` targets into address sets
//! - Client TLS/mTLS configuration loaded from PEM files
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tgis_core::GenerationChannel;
//! use tgis_net::{ChannelPollingProxy, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::new("tgis.models.svc.cluster.local:8033")
//!         .with_poll_interval(Some(Duration::from_secs(10)));
//!
//!     let proxy = ChannelPollingProxy::<GenerationChannel>::new(config).await?;
//!     let _client = proxy.client();
//!
//!     proxy.shutdown();
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod config;
pub mod proxy;
pub mod resolve;
pub mod tls;

// Re-export commonly used types
pub use config::{LoadBalancingPolicy, ProxyConfig};
pub use proxy::{ChannelBinding, ChannelPollingProxy};
pub use resolve::{validate_hostname, AddressResolver, AddressSet, DnsResolver, StaticResolver, Target};
pub use tls::{TlsConfig, TlsConfigBuilder};

/// Result type for networking operations
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors that can occur during networking operations
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("DNS resolution error: {0}")]
    DnsResolution(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Check if this error is a (usually transient) name resolution failure
    pub fn is_resolution(&self) -> bool {
        matches!(self, NetError::DnsResolution(_))
    }

    /// Check if this error comes from invalid configuration or TLS material
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            NetError::InvalidTarget(_) | NetError::Configuration(_) | NetError::Certificate(_)
        )
    }
}
