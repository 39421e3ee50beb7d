//! Controller configuration
//!
//! Every tunable has a default except the controller MAC, which has to be
//! given. [`ControllerConfig::validate`] must pass before a controller is
//! built; a controller never starts half-configured.

use serde::{Deserialize, Serialize};
use sos_proto::{MacAddr, SessionTunables};
use sos_router::StrategyKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("controller_mac is required")]
    MissingControllerMac,

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Source MAC of the datagrams the controller sends to agents
    #[serde(default)]
    pub controller_mac: Option<MacAddr>,

    /// How many retired sessions are kept for inspection
    #[serde(default = "default_connection_history_size")]
    pub connection_history_size: usize,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: u32,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: u32,

    #[serde(default = "default_parallel_tcp_sockets")]
    pub parallel_tcp_sockets: u32,

    /// Idle timeout of installed flows, in seconds
    ///
    /// 0 installs permanent flows: they stay until the transfer is retired
    /// or an operator clears them, even if an agent dies mid-transfer.
    #[serde(default = "default_flow_timeout")]
    pub flow_timeout: u16,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Agents whose path latencies differ by at most this much are treated
    /// as sitting at the same location
    #[serde(default = "default_latency_difference_threshold")]
    pub latency_difference_threshold: u64,

    #[serde(default)]
    pub strategy: StrategyKind,

    /// Single-hop only: rewrite the destination MAC at the redirecting switch
    #[serde(default = "default_rewrite_mac")]
    pub rewrite_mac: bool,

    #[serde(default = "default_monitor_initial_delay_secs")]
    pub monitor_initial_delay_secs: u64,

    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

fn default_connection_history_size() -> usize {
    100
}

fn default_buffer_size() -> u32 {
    30000
}

fn default_queue_capacity() -> u32 {
    3
}

fn default_parallel_tcp_sockets() -> u32 {
    1000
}

fn default_flow_timeout() -> u16 {
    60
}

fn default_enabled() -> bool {
    true
}

fn default_latency_difference_threshold() -> u64 {
    20
}

fn default_rewrite_mac() -> bool {
    true
}

fn default_monitor_initial_delay_secs() -> u64 {
    20
}

fn default_monitor_interval_secs() -> u64 {
    15
}

impl ControllerConfig {
    /// Defaults for everything, with the given controller MAC
    pub fn new(controller_mac: MacAddr) -> Self {
        Self {
            controller_mac: Some(controller_mac),
            connection_history_size: default_connection_history_size(),
            buffer_size: default_buffer_size(),
            queue_capacity: default_queue_capacity(),
            parallel_tcp_sockets: default_parallel_tcp_sockets(),
            flow_timeout: default_flow_timeout(),
            enabled: default_enabled(),
            latency_difference_threshold: default_latency_difference_threshold(),
            strategy: StrategyKind::default(),
            rewrite_mac: default_rewrite_mac(),
            monitor_initial_delay_secs: default_monitor_initial_delay_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_latency_difference_threshold(mut self, threshold: u64) -> Self {
        self.latency_difference_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller_mac.is_none() {
            return Err(ConfigError::MissingControllerMac);
        }

        let positive = [
            ("connection_history_size", self.connection_history_size as u64),
            ("buffer_size", self.buffer_size as u64),
            ("queue_capacity", self.queue_capacity as u64),
            ("parallel_tcp_sockets", self.parallel_tcp_sockets as u64),
            ("monitor_initial_delay_secs", self.monitor_initial_delay_secs),
            ("monitor_interval_secs", self.monitor_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::NotPositive(name));
            }
        }

        Ok(())
    }

    pub fn tunables(&self) -> SessionTunables {
        SessionTunables {
            parallel_sockets: self.parallel_tcp_sockets,
            queue_capacity: self.queue_capacity,
            buffer_size: self.buffer_size,
            flow_timeout: self.flow_timeout,
        }
    }

    pub fn monitor_initial_delay(&self) -> Duration {
        Duration::from_secs(self.monitor_initial_delay_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_document() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{"controller_mac": "00:00:00:00:00:fe"}"#).unwrap();

        assert_eq!(config, ControllerConfig::new(MacAddr([0, 0, 0, 0, 0, 0xfe])));
        assert_eq!(config.connection_history_size, 100);
        assert_eq!(config.buffer_size, 30000);
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.parallel_tcp_sockets, 1000);
        assert_eq!(config.flow_timeout, 60);
        assert!(config.enabled);
        assert_eq!(config.latency_difference_threshold, 20);
        assert_eq!(config.strategy, StrategyKind::SingleHop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_mac_is_rejected() {
        let config: ControllerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.validate(), Err(ConfigError::MissingControllerMac));
    }

    #[test]
    fn test_malformed_mac_fails_to_load() {
        let result =
            serde_json::from_str::<ControllerConfig>(r#"{"controller_mac": "not-a-mac"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_tunable_is_rejected() {
        let mut config = ControllerConfig::new(MacAddr::BROADCAST);
        config.queue_capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive("queue_capacity"))
        );
    }

    #[test]
    fn test_zero_flow_timeout_is_permanent() {
        let mut config = ControllerConfig::new(MacAddr::BROADCAST);
        config.flow_timeout = 0;
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.tunables().flow_timeout, 0);
    }

    #[test]
    fn test_strategy_by_name() {
        let config: ControllerConfig = serde_json::from_str(
            r#"{"controller_mac": "00:00:00:00:00:fe", "strategy": "first_hop_last_hop"}"#,
        )
        .unwrap();
        assert_eq!(config.strategy, StrategyKind::FirstHopLastHop);
    }

    #[test]
    fn test_tunables() {
        let tunables = ControllerConfig::new(MacAddr::BROADCAST).tunables();
        assert_eq!(tunables.parallel_sockets, 1000);
        assert_eq!(tunables.flow_timeout, 60);
    }
}
