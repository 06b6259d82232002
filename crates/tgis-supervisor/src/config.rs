//! Supervisor configuration

use crate::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration of a supervised TGIS server
///
/// Durations are written as seconds, fractional or whole, in files and
/// environment variables (`load_timeout = 120`, `TGIS_BOOTUP_POLL_DELAY=0.5`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Port the gRPC inference service listens on
    pub grpc_port: u16,

    /// Port of the HTTP side channel serving `/health`
    pub http_port: u16,

    /// Timeout of a single health probe
    #[serde(with = "seconds")]
    pub health_poll_timeout: Duration,

    /// Delay between boot monitor iterations
    #[serde(with = "seconds")]
    pub bootup_poll_delay: Duration,

    /// How long a boot may take before it is abandoned
    #[serde(with = "seconds")]
    pub load_timeout: Duration,

    /// Number of shards (GPUs) the model is split across
    pub num_shards: u32,

    /// Directory the server reads prompt prefix artifacts from
    pub prompt_cache_dir: Option<PathBuf>,

    /// Executable that launches the server
    pub launcher_command: String,

    /// How long a terminated process gets to exit before it is killed
    #[serde(with = "seconds")]
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grpc_port: 50055,
            http_port: 3000,
            health_poll_timeout: Duration::from_secs(1),
            bootup_poll_delay: Duration::from_secs(1),
            load_timeout: Duration::from_secs(30),
            num_shards: 1,
            prompt_cache_dir: None,
            launcher_command: "text-generation-launcher".to_string(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from defaults, an optional file and `TGIS_*`
    /// environment variables (`TGIS_GRPC_PORT`, ...), in increasing precedence
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TGIS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Set the service ports
    pub fn with_ports(mut self, grpc_port: u16, http_port: u16) -> Self {
        self.grpc_port = grpc_port;
        self.http_port = http_port;
        self
    }

    /// Set the boot timings
    pub fn with_boot_timing(
        mut self,
        bootup_poll_delay: Duration,
        health_poll_timeout: Duration,
        load_timeout: Duration,
    ) -> Self {
        self.bootup_poll_delay = bootup_poll_delay;
        self.health_poll_timeout = health_poll_timeout;
        self.load_timeout = load_timeout;
        self
    }

    /// Set the number of shards
    pub fn with_num_shards(mut self, num_shards: u32) -> Self {
        self.num_shards = num_shards;
        self
    }

    /// Set the prompt cache directory
    pub fn with_prompt_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.prompt_cache_dir = Some(dir.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.grpc_port == 0 || self.http_port == 0 {
            return Err(SupervisorError::Configuration(
                "grpc_port and http_port must be non-zero".to_string(),
            ));
        }

        if self.grpc_port == self.http_port {
            return Err(SupervisorError::Configuration(format!(
                "grpc_port and http_port must differ (both {})",
                self.grpc_port
            )));
        }

        for (name, value) in [
            ("health_poll_timeout", self.health_poll_timeout),
            ("bootup_poll_delay", self.bootup_poll_delay),
            ("load_timeout", self.load_timeout),
        ] {
            if value.is_zero() {
                return Err(SupervisorError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.num_shards == 0 {
            return Err(SupervisorError::Configuration(
                "num_shards must be at least 1".to_string(),
            ));
        }

        if self.launcher_command.trim().is_empty() {
            return Err(SupervisorError::Configuration(
                "launcher_command must not be empty".to_string(),
            ));
        }

        if let Some(dir) = &self.prompt_cache_dir {
            if !dir.is_dir() {
                return Err(SupervisorError::Configuration(format!(
                    "prompt_cache_dir {} is not a directory",
                    dir.display()
                )));
            }
        }

        Ok(())
    }
}

/// Serde adapter for durations written as seconds
mod seconds {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {}: {}", secs, e)))
    }
}
