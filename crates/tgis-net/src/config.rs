//! Channel polling proxy configuration

use crate::resolve::Target;
use crate::tls::TlsConfig;
use crate::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Load-balancing policy hint for the channel
///
/// The proxy does not balance requests itself; the policy only selects how
/// the tonic channel is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    /// Dial every resolved address through tonic's balanced channel
    #[default]
    RoundRobin,
    /// Dial the hostname through a single endpoint
    PickFirst,
}

/// Configuration for a [`ChannelPollingProxy`](crate::ChannelPollingProxy)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Dial target in `host:port` form
    pub target: String,

    /// Load-balancing policy hint
    #[serde(default)]
    pub lb_policy: LoadBalancingPolicy,

    /// Interval between DNS polls; `None` disables polling
    pub poll_interval: Option<Duration>,

    /// Timeout for establishing each connection
    pub connect_timeout: Duration,

    /// TLS material; `None` uses an insecure channel
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            target: "localhost:8033".to_string(),
            lb_policy: LoadBalancingPolicy::default(),
            poll_interval: Some(Duration::from_secs(10)),
            connect_timeout: Duration::from_secs(10),
            tls: None,
        }
    }
}

impl ProxyConfig {
    /// Create a configuration for a target with default settings
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Set the load-balancing policy
    pub fn with_policy(mut self, policy: LoadBalancingPolicy) -> Self {
        self.lb_policy = policy;
        self
    }

    /// Set or disable the DNS poll interval
    pub fn with_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Secure the channel
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Validate the configuration, returning the parsed target
    pub fn validate(&self) -> Result<Target> {
        let target = self.target.parse::<Target>()?;

        if self.poll_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(NetError::Configuration(
                "poll_interval must be greater than zero".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(NetError::Configuration(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }

        if let Some(tls) = &self.tls {
            tls.validate()?;
        }

        Ok(target)
    }
}

impl fmt::Display for LoadBalancingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancingPolicy::RoundRobin => write!(f, "round_robin"),
            LoadBalancingPolicy::PickFirst => write!(f, "pick_first"),
        }
    }
}

impl FromStr for LoadBalancingPolicy {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "round_robin" => Ok(LoadBalancingPolicy::RoundRobin),
            "pick_first" => Ok(LoadBalancingPolicy::PickFirst),
            _ => Err(NetError::Configuration(format!(
                "Unknown load-balancing policy: {}",
                s
            ))),
        }
    }
}
