//! Type definitions shared between the connection engine and its observers

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// Separator used in composite microservice names
pub const NAME_SEPARATOR: &str = "__";

/// Kind of link a microservice owns
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MicroserviceKind {
    /// Sends commands to and receives telemetry from an external system
    Interface,
    /// Redistributes processed telemetry to downstream clients
    Router,
}

impl MicroserviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MicroserviceKind::Interface => "INTERFACE",
            MicroserviceKind::Router => "ROUTER",
        }
    }
}

impl fmt::Display for MicroserviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MicroserviceKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INTERFACE" => Ok(MicroserviceKind::Interface),
            "ROUTER" => Ok(MicroserviceKind::Router),
            _ => Err(RelayError::identity(format!("Unknown microservice kind: {}", s))),
        }
    }
}

/// Identity of a connection microservice, parsed from `SCOPE__KIND__NAME`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MicroserviceIdentity {
    pub scope: String,
    pub kind: MicroserviceKind,
    pub name: String,
    pub target_names: Vec<String>,
}

impl MicroserviceIdentity {
    /// Parse a composite microservice name such as `DEFAULT__INTERFACE__TEST_INT`
    pub fn parse(full_name: &str, target_names: Vec<String>) -> RelayResult<Self> {
        let parts: Vec<&str> = full_name.split(NAME_SEPARATOR).collect();
        if parts.len() != 3 {
            return Err(RelayError::identity(format!(
                "Name {} doesn't match convention of SCOPE__TYPE__NAME",
                full_name
            )));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(RelayError::identity(format!(
                "Name {} has an empty component",
                full_name
            )));
        }

        Ok(Self {
            scope: parts[0].to_string(),
            kind: parts[1].parse()?,
            name: parts[2].to_string(),
            target_names,
        })
    }

    /// The composite `SCOPE__KIND__NAME` form
    pub fn full_name(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.scope,
            self.kind,
            self.name,
            sep = NAME_SEPARATOR
        )
    }
}

impl fmt::Display for MicroserviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// State of the link owned by a connection microservice
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Attempting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Attempting => "ATTEMPTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            ConnectionState::Attempting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Disconnected => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConnectionState::Attempting),
            1 => Some(ConnectionState::Connected),
            2 => Some(ConnectionState::Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte and packet counters reported by an endpoint
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counters {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub tx_queue_size: u64,
    pub rx_queue_size: u64,
    pub num_clients: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Opaque packet moved across a link
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Packet {
    /// Target the packet belongs to, if already identified
    pub target_name: Option<String>,
    /// Raw packet bytes
    pub buffer: Vec<u8>,
    /// Time the packet was received by the engine
    pub received_time: Option<DateTime<Utc>>,
}

impl Packet {
    pub fn new(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            ..Default::default()
        }
    }

    pub fn for_target(target_name: impl Into<String>, buffer: Vec<u8>) -> Self {
        Self {
            target_name: Some(target_name.into()),
            buffer,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Stamp the receive time unless the endpoint already did
    pub fn stamp(&mut self) {
        if self.received_time.is_none() {
            self.received_time = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_parse() {
        let id = MicroserviceIdentity::parse("DEFAULT__INTERFACE__TEST_INT", vec!["TEST".into()])
            .unwrap();
        assert_eq!(id.scope, "DEFAULT");
        assert_eq!(id.kind, MicroserviceKind::Interface);
        assert_eq!(id.name, "TEST_INT");
        assert_eq!(id.target_names, vec!["TEST".to_string()]);
        assert_eq!(id.full_name(), "DEFAULT__INTERFACE__TEST_INT");
    }

    #[test]
    fn test_identity_parse_router() {
        let id = MicroserviceIdentity::parse("OPS__ROUTER__PREIDENTIFIED", vec![]).unwrap();
        assert_eq!(id.kind, MicroserviceKind::Router);
        assert_eq!(id.to_string(), "OPS__ROUTER__PREIDENTIFIED");
    }

    #[test]
    fn test_identity_parse_rejects_malformed() {
        assert!(MicroserviceIdentity::parse("DEFAULT__TEST_INT", vec![]).is_err());
        assert!(MicroserviceIdentity::parse("DEFAULT__INTERFACE__A__B", vec![]).is_err());
        assert!(MicroserviceIdentity::parse("DEFAULT__GADGET__TEST_INT", vec![]).is_err());
        assert!(MicroserviceIdentity::parse("__INTERFACE__TEST_INT", vec![]).is_err());
    }

    #[test]
    fn test_connection_state_u8() {
        for state in [
            ConnectionState::Attempting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ] {
            assert_eq!(ConnectionState::from_u8(state.to_u8()), Some(state));
        }
        assert_eq!(ConnectionState::from_u8(7), None);
    }

    #[test]
    fn test_connection_state_json() {
        let json = serde_json::to_string(&ConnectionState::Disconnected).unwrap();
        assert_eq!(json, "\"DISCONNECTED\"");
    }

    #[test]
    fn test_packet_stamp_keeps_existing_time() {
        let mut packet = Packet::new(vec![1, 2, 3]);
        packet.stamp();
        let first = packet.received_time;
        assert!(first.is_some());
        packet.stamp();
        assert_eq!(packet.received_time, first);
    }
}
