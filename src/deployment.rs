//! Deployment file and packet replay loading
//!
//! A deployment describes the controller settings, the network it manages,
//! and the agents and whitelist entries to install at startup:
//!
//! ```yaml
//! controller:
//!   controller_mac: "02:00:00:00:00:fe"
//!   strategy: single_hop
//! topology:
//!   switches: [1, 2]
//!   links:
//!     - { a: { switch: 1, port: 3 }, b: { switch: 2, port: 3 }, latency_ms: 5 }
//!   hosts:
//!     - { ip: 10.0.0.9, mac: "00:00:00:00:00:09", attachment_points: [{ switch: 1, port: 1 }] }
//! agents:
//!   - { ip: 10.0.0.1, data_port: 9877, control_port: 9878, feedback_port: 9998, stats_port: 9999 }
//! whitelist:
//!   - { server_ip: 10.0.0.5, server_port: 80, client_ip: 10.0.0.9 }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sos_control::{ControllerConfig, TopologyConfig};
use sos_proto::{Agent, DatapathId, Frame, MacAddr, WhitelistEntry};
use std::net::SocketAddrV4;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub controller: ControllerConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub whitelist: Vec<WhitelistEntry>,
}

impl Deployment {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read deployment file: {:?}", path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let deployment: Deployment =
            serde_yaml::from_str(content).context("Failed to parse YAML deployment")?;
        deployment
            .controller
            .validate()
            .context("Invalid controller configuration")?;

        for link in &deployment.topology.links {
            for end in [link.a, link.b] {
                if !deployment.topology.switches.contains(&end.switch) {
                    anyhow::bail!("Link endpoint {} is on an undeclared switch", end);
                }
            }
        }
        Ok(deployment)
    }
}

/// A packet to feed the controller as if a switch had punted it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketEvent {
    pub switch: DatapathId,
    pub in_port: u16,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum EventPayload {
    Tcp {
        #[serde(default = "default_tcp_flags")]
        flags: u8,
    },
    Udp {
        #[serde(default)]
        body: String,
    },
}

fn default_tcp_flags() -> u8 {
    // SYN
    0x02
}

impl PacketEvent {
    pub fn frame(&self) -> Frame {
        match &self.payload {
            EventPayload::Tcp { flags } => {
                Frame::tcp(self.src_mac, self.dst_mac, self.src, self.dst, *flags, &[])
            }
            EventPayload::Udp { body } => Frame::udp(
                self.src_mac,
                self.dst_mac,
                self.src,
                self.dst,
                body.as_bytes(),
            ),
        }
    }
}

pub fn load_replay(path: &Path) -> Result<Vec<PacketEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read replay file: {:?}", path))?;
    serde_yaml::from_str(&content).context("Failed to parse replay file")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sos_router::StrategyKind;
    use std::io::Write;
    use std::net::Ipv4Addr;

    const DEPLOYMENT: &str = r#"
controller:
  controller_mac: "02:00:00:00:00:fe"
  strategy: first_hop_last_hop
  buffer_size: 65536
topology:
  switches: [1, 2]
  links:
    - { a: { switch: 1, port: 3 }, b: { switch: 2, port: 3 }, latency_ms: 5 }
  hosts:
    - { ip: 10.0.0.9, mac: "00:00:00:00:00:09", attachment_points: [{ switch: 1, port: 1 }] }
agents:
  - { ip: 10.0.0.1, data_port: 9877, control_port: 9878, feedback_port: 9998, stats_port: 9999 }
whitelist:
  - { server_ip: 10.0.0.5, server_port: 80, client_ip: 10.0.0.9 }
"#;

    #[test]
    fn test_parse_deployment() {
        let deployment = Deployment::parse(DEPLOYMENT).unwrap();

        assert_eq!(
            deployment.controller.controller_mac,
            Some(MacAddr([0x02, 0, 0, 0, 0, 0xfe]))
        );
        assert_eq!(deployment.controller.strategy, StrategyKind::FirstHopLastHop);
        assert_eq!(deployment.controller.buffer_size, 65536);
        assert_eq!(deployment.controller.queue_capacity, 3);
        assert_eq!(deployment.topology.links[0].latency_ms, 5);
        assert_eq!(deployment.agents[0].ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(deployment.agents[0].mac, None);
        assert_eq!(deployment.whitelist[0].server_port, 80);
    }

    #[test]
    fn test_missing_controller_mac_is_rejected() {
        let err = Deployment::parse("controller:\n  buffer_size: 10\n").unwrap_err();
        assert!(format!("{:#}", err).contains("controller_mac is required"));
    }

    #[test]
    fn test_link_on_undeclared_switch_is_rejected() {
        let yaml = r#"
controller:
  controller_mac: "02:00:00:00:00:fe"
topology:
  switches: [1]
  links:
    - { a: { switch: 1, port: 3 }, b: { switch: 7, port: 3 } }
"#;
        assert!(Deployment::parse(yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DEPLOYMENT.as_bytes()).unwrap();

        let deployment = Deployment::load(file.path()).unwrap();
        assert_eq!(deployment.topology.switches, vec![DatapathId(1), DatapathId(2)]);
        assert!(Deployment::load(Path::new("/nonexistent/sos.yaml")).is_err());
    }

    #[test]
    fn test_replay_events() {
        let yaml = r#"
- switch: 1
  in_port: 1
  src_mac: "00:00:00:00:00:09"
  dst_mac: "00:00:00:00:00:05"
  src: 10.0.0.9:51000
  dst: 10.0.0.5:80
  protocol: tcp
- switch: 3
  in_port: 2
  src_mac: "00:00:00:00:00:01"
  dst_mac: "02:00:00:00:00:fe"
  src: 10.0.0.1:40001
  dst: 10.0.0.254:9998
  protocol: udp
  body: '{"transfer_id": "00000000-0000-0000-0000-000000000001"}'
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let events = load_replay(file.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload, EventPayload::Tcp { flags: 0x02 });

        let syn = events[0].frame().flow().unwrap();
        assert_eq!(syn.dst_port, 80);
        let report = events[1].frame();
        assert!(report.udp_payload().unwrap().starts_with(b"{\"transfer_id\""));
    }
}
