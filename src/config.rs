//! Collector configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("unable to read configuration from {path}: {source}"))]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("configuration in {path} is not valid YAML: {source}"))]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[snafu(display("invalid configuration: {}", reasons.join("; ")))]
    Invalid { reasons: Vec<String> },
}

/// Configuration for the collector.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CollectorConfig {
    /// Address to bind the UDP listener to.
    pub host: IpAddr,

    /// UDP port to listen on. Required.
    pub port: Option<u16>,

    /// Maximum datagram size in bytes.
    pub buffer_size: usize,

    /// Number of decoder threads.
    pub workers: usize,

    /// Depth of the bounded work queue between the reader and the decoders.
    pub queue_size: usize,

    /// Template time-to-live in minutes. The window slides: every use of a
    /// template restarts it.
    pub cache_ttl: u64,

    /// Event field the decoded flow lands under.
    pub target: String,

    /// Accepted export versions, any subset of {5, 9, 10}.
    pub versions: Vec<u16>,

    /// Optional NetFlow v9 field definition overrides.
    pub netflow_definitions: Option<PathBuf>,

    /// Optional IPFIX field definition overrides.
    pub ipfix_definitions: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: None,
            buffer_size: default_buffer_size(),
            workers: default_workers(),
            queue_size: default_queue_size(),
            cache_ttl: default_cache_ttl(),
            target: default_target(),
            versions: default_versions(),
            netflow_definitions: None,
            ipfix_definitions: None,
        }
    }
}

const fn default_buffer_size() -> usize {
    65536
}

const fn default_workers() -> usize {
    2
}

const fn default_queue_size() -> usize {
    2000
}

const fn default_cache_ttl() -> u64 {
    4000
}

fn default_target() -> String {
    "netflow".to_owned()
}

fn default_versions() -> Vec<u16> {
    vec![5, 9, 10]
}

impl CollectorConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();

        if self.port.is_none() {
            reasons.push("port is required".to_owned());
        }
        if self.buffer_size == 0 {
            reasons.push("buffer_size must be greater than 0".to_owned());
        }
        if self.workers == 0 {
            reasons.push("workers must be greater than 0".to_owned());
        }
        if self.queue_size == 0 {
            reasons.push("queue_size must be greater than 0".to_owned());
        }
        if self.cache_ttl == 0 {
            reasons.push("cache_ttl must be greater than 0".to_owned());
        }
        if self.target.is_empty() {
            reasons.push("target must not be empty".to_owned());
        }
        if self.versions.is_empty() {
            reasons.push("versions must contain at least one of 5, 9, 10".to_owned());
        }
        for version in &self.versions {
            if ![5, 9, 10].contains(version) {
                reasons.push(format!("version {version} is not supported"));
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { reasons })
        }
    }

    /// Bind address; `None` until a port is configured.
    pub fn address(&self) -> Option<SocketAddr> {
        self.port.map(|port| SocketAddr::new(self.host, port))
    }

    /// Template TTL as a duration.
    pub fn template_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl * 60)
    }
}
