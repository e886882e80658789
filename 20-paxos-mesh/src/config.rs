//! Tunables for a network node and parsing of peer table entries.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::message::{Endpoints, NodeUid};

/// Per-node settings. Identity and membership are supplied separately.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Pause between releasing a session's sockets and binding the same
    /// addresses again on reconnect.
    #[serde(with = "millis")]
    pub rebind_settle: Duration,

    /// Backoff between attempts to dial a peer that is not listening yet.
    #[serde(with = "millis")]
    pub connect_retry: Duration,

    /// Broadcasts buffered per subscriber before a slow one starts losing them.
    pub broadcast_capacity: usize,

    /// Unicasts queued per peer while its link is down. Sends beyond this
    /// are dropped.
    pub link_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rebind_settle: Duration::from_millis(50),
            connect_retry: Duration::from_millis(20),
            broadcast_capacity: 1024,
            link_capacity: 256,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Parses `UID=unicast_addr,broadcast_addr`.
pub fn parse_peer_spec(spec: &str) -> Result<(NodeUid, Endpoints)> {
    let (uid, addrs) = spec
        .split_once('=')
        .with_context(|| format!("peer '{spec}' must look like UID=UNICAST,BROADCAST"))?;
    let (unicast, broadcast) = addrs
        .split_once(',')
        .with_context(|| format!("peer '{spec}' needs both a unicast and a broadcast address"))?;

    let uid = uid.trim();
    let unicast = unicast.trim();
    let broadcast = broadcast.trim();
    if uid.is_empty() || unicast.is_empty() || broadcast.is_empty() {
        return Err(anyhow!("peer '{spec}' has an empty field"));
    }

    Ok((NodeUid::new(uid), Endpoints::new(unicast, broadcast)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_spec() {
        let (uid, endpoints) =
            parse_peer_spec("A=127.0.0.1:7001, 127.0.0.1:7101").expect("valid spec");
        assert_eq!(uid, NodeUid::new("A"));
        assert_eq!(endpoints, Endpoints::new("127.0.0.1:7001", "127.0.0.1:7101"));
    }

    #[test]
    fn rejects_malformed_peer_specs() {
        assert!(parse_peer_spec("A").is_err());
        assert!(parse_peer_spec("A=127.0.0.1:7001").is_err());
        assert!(parse_peer_spec("=127.0.0.1:7001,127.0.0.1:7101").is_err());
        assert!(parse_peer_spec("A=,127.0.0.1:7101").is_err());
    }

    #[test]
    fn config_fields_default_when_missing() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"connect_retry": 5}"#).expect("parse config");
        assert_eq!(config.connect_retry, Duration::from_millis(5));
        assert_eq!(config.rebind_settle, Duration::from_millis(50));
        assert_eq!(config.broadcast_capacity, 1024);
        assert_eq!(config.link_capacity, 256);
    }
}
