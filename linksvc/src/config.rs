//! Configuration loading for linksvc

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use linkgs::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};

use constants::*;

/// Load a microservice configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> RelayResult<ServiceConfig> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config: ServiceConfig = serde_json::from_reader(reader)?;
    config.validate()?;
    Ok(config)
}

/// Configuration of one connection microservice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Composite `SCOPE__KIND__NAME`. Falls back to the environment when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Targets whose commands or telemetry flow through the link
    #[serde(default)]
    pub target_names: Vec<String>,
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub link: LinkConfig,
}

impl ServiceConfig {
    pub fn validate(&self) -> RelayResult<()> {
        self.link.validate()?;
        self.endpoint.validate()
    }
}

/// Which endpoint implementation to build
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointConfig {
    /// Length-prefixed frames over a TCP connection we open
    TcpClient {
        address: String,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
    },
    /// Length-prefixed frames broadcast to every TCP client that connects to us
    TcpServer { address: String },
    /// Simulated link producing packets on a fixed interval
    Sim {
        #[serde(default = "default_sim_packet_size")]
        packet_size: usize,
        #[serde(default = "default_sim_interval_ms")]
        interval_ms: u64,
        #[serde(default = "default_true")]
        read_allowed: bool,
    },
}

impl EndpointConfig {
    pub fn validate(&self) -> RelayResult<()> {
        match self {
            EndpointConfig::TcpClient { address, .. } | EndpointConfig::TcpServer { address } => {
                if address.is_empty() {
                    return Err(RelayError::configuration("Missing address"));
                }
            }
            EndpointConfig::Sim { packet_size, .. } => {
                if *packet_size == 0 || *packet_size > MAX_FRAME_SIZE {
                    return Err(RelayError::configuration(format!(
                        "Invalid sim packet size: {}",
                        packet_size
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Tuning of the connection loop and its helper threads
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LinkConfig {
    /// Wait between failed connection attempts
    pub reconnect_delay_ms: u64,
    /// Reconnect after a link failure
    pub auto_reconnect: bool,
    /// Start in ATTEMPTING rather than DISCONNECTED
    pub connect_on_startup: bool,
    /// Heartbeat period of the status publisher
    pub status_period_ms: u64,
    /// Sleep between liveness checks when reading is not allowed
    pub monitor_interval_ms: u64,
    /// Command queue poll timeout
    pub command_poll_ms: u64,
    /// Bound on waiting for helper threads at shutdown
    pub join_timeout_ms: u64,
    /// Capacity of the command queue
    pub queue_capacity: usize,
    /// Zero endpoint counters on every successful connect
    pub reset_counters_on_connect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: millis(RECONNECT_DELAY),
            auto_reconnect: true,
            connect_on_startup: true,
            status_period_ms: millis(STATUS_PERIOD),
            monitor_interval_ms: millis(MONITOR_INTERVAL),
            command_poll_ms: millis(COMMAND_POLL),
            join_timeout_ms: millis(JOIN_TIMEOUT),
            queue_capacity: QUEUE_CAPACITY,
            reset_counters_on_connect: false,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> RelayResult<()> {
        if self.monitor_interval_ms == 0 || self.command_poll_ms == 0 || self.status_period_ms == 0 {
            return Err(RelayError::configuration(
                "Monitor, poll and status periods must be non-zero",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(RelayError::configuration("Queue capacity must be non-zero"));
        }
        Ok(())
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = millis(delay);
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn status_period(&self) -> Duration {
        Duration::from_millis(self.status_period_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn command_poll(&self) -> Duration {
        Duration::from_millis(self.command_poll_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn default_connect_timeout_ms() -> u64 {
    millis(CONNECT_TIMEOUT)
}

fn default_sim_packet_size() -> usize {
    SIM_PACKET_SIZE
}

fn default_sim_interval_ms() -> u64 {
    millis(SIM_INTERVAL)
}

fn default_true() -> bool {
    true
}

/// Configuration constants
pub mod constants {
    use std::time::Duration;

    /// Environment variable holding the microservice name
    pub const MICROSERVICE_NAME_ENV: &str = "LINK_MICROSERVICE_NAME";

    /// Default delay between connection attempts
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

    /// Liveness check interval when the link does not allow reads
    pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

    /// Status heartbeat period
    pub const STATUS_PERIOD: Duration = Duration::from_secs(5);

    /// Command queue poll timeout
    pub const COMMAND_POLL: Duration = Duration::from_millis(100);

    /// Bound on joining helper threads at shutdown
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

    /// Default command queue capacity
    pub const QUEUE_CAPACITY: usize = 64;

    /// TCP connect timeout
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Largest frame accepted from a TCP link
    pub const MAX_FRAME_SIZE: usize = 65535;

    /// Simulated packet size
    pub const SIM_PACKET_SIZE: usize = 12;

    /// Simulated packet interval
    pub const SIM_INTERVAL: Duration = Duration::from_millis(100);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let config_json = r#"{
            "name": "DEFAULT__INTERFACE__INST_INT",
            "target_names": ["INST"],
            "endpoint": {
                "type": "tcp_client",
                "address": "localhost:7779"
            },
            "link": {
                "reconnect_delay_ms": 250,
                "auto_reconnect": false
            }
        }"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_json.as_bytes()).unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.name.as_deref(), Some("DEFAULT__INTERFACE__INST_INT"));
        assert_eq!(config.target_names, vec!["INST".to_string()]);
        assert_eq!(
            config.endpoint,
            EndpointConfig::TcpClient {
                address: "localhost:7779".to_string(),
                connect_timeout_ms: 5000,
            }
        );
        assert_eq!(config.link.reconnect_delay(), Duration::from_millis(250));
        assert!(!config.link.auto_reconnect);
        // Unspecified fields keep their defaults
        assert!(config.link.connect_on_startup);
        assert_eq!(config.link.monitor_interval(), MONITOR_INTERVAL);
    }

    #[test]
    fn test_load_config_sim_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(br#"{ "endpoint": { "type": "sim", "read_allowed": false } }"#)
            .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert!(config.name.is_none());
        assert_eq!(
            config.endpoint,
            EndpointConfig::Sim {
                packet_size: SIM_PACKET_SIZE,
                interval_ms: 100,
                read_allowed: false,
            }
        );
        assert_eq!(config.link, LinkConfig::default());
    }

    #[test]
    fn test_load_config_rejects_bad_values() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(br#"{ "endpoint": { "type": "sim" }, "link": { "queue_capacity": 0 } }"#)
            .unwrap();
        assert!(matches!(load_config(temp_file.path()), Err(RelayError::Config(_))));

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(br#"{ "endpoint": { "type": "serial", "path": "/dev/ttyS0" } }"#)
            .unwrap();
        assert!(matches!(load_config(temp_file.path()), Err(RelayError::Json(_))));
    }

    #[test]
    fn test_default_link_config() {
        let config = LinkConfig::default();
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.status_period(), Duration::from_secs(5));
        assert_eq!(config.command_poll(), Duration::from_millis(100));
        assert!(config.auto_reconnect);
        assert!(config.validate().is_ok());

        let quick = config.with_reconnect_delay(Duration::from_millis(100));
        assert_eq!(quick.reconnect_delay_ms, 100);
    }
}
