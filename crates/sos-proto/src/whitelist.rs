//! Pre-authorised (client, server) pairs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// A client allowed to have its transfers to a server accelerated
///
/// The client's source port is not known until its first packet arrives,
/// so only the client address takes part in matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
    pub client_ip: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
}

impl WhitelistEntry {
    pub fn new(server_ip: Ipv4Addr, server_port: u16, client_ip: Ipv4Addr) -> Self {
        Self {
            server_ip,
            server_port,
            client_ip,
            start_time: None,
            stop_time: None,
        }
    }

    pub fn with_window(mut self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.stop_time = Some(stop);
        self
    }

    /// Whether a packet from `src_ip` to `dst_ip:dst_port` is covered by this entry
    pub fn matches(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, dst_port: u16) -> bool {
        self.client_ip == src_ip && self.server_ip == dst_ip && self.server_port == dst_port
    }
}

impl fmt::Display for WhitelistEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}:{}",
            self.client_ip, self.server_ip, self.server_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_ignores_client_port() {
        let entry = WhitelistEntry::new(
            Ipv4Addr::new(10, 0, 0, 5),
            80,
            Ipv4Addr::new(10, 0, 0, 9),
        );

        assert!(entry.matches(Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(10, 0, 0, 5), 80));
        assert!(!entry.matches(Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(10, 0, 0, 5), 81));
        assert!(!entry.matches(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 9), 80));
    }

    #[test]
    fn test_equality_covers_time_window() {
        let base = WhitelistEntry::new(
            Ipv4Addr::new(10, 0, 0, 5),
            80,
            Ipv4Addr::new(10, 0, 0, 9),
        );
        let windowed = base.clone().with_window(Utc::now(), Utc::now());
        assert_ne!(base, windowed);
    }
}
