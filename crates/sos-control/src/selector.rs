//! Picking the agent closest to a client or server
//!
//! Candidates are compared pairwise in registration order. Path latency is
//! the sum of link latencies along the path; two agents whose latencies are
//! within the configured threshold of each other are assumed to sit at the
//! same site, and the less loaded one wins (the earlier one on a tie).
//! Otherwise the lower-latency agent wins.

use crate::agent_registry::AgentRegistry;
use crate::topology::{true_attachment_point, Topology};
use sos_proto::{Agent, MacAddr, NodePort};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("{0} has no attachment point")]
    NoAttachmentPoint(Ipv4Addr),

    #[error("{0} has no true attachment point")]
    NoTrueAttachmentPoint(Ipv4Addr),

    #[error("No agent reachable from {0}")]
    NoAgentReachable(Ipv4Addr),

    #[error("Agent {0} is not known to the network")]
    AgentNotLocated(Ipv4Addr),

    #[error("No path from agent {src} to agent {dst}")]
    NoPathBetweenAgents { src: Ipv4Addr, dst: Ipv4Addr },
}

/// The chosen agent and the path from the device to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSelection {
    pub agent: Agent,
    pub path: Vec<NodePort>,
    pub latency: u64,
}

/// Which of two compared agents wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestAgent {
    First,
    Second,
}

/// Compare two candidates by `(latency, load)`
pub fn select_best(threshold: u64, first: (u64, usize), second: (u64, usize)) -> BestAgent {
    let (first_latency, first_load) = first;
    let (second_latency, second_load) = second;

    if first_latency.abs_diff(second_latency) <= threshold {
        if first_load <= second_load {
            BestAgent::First
        } else {
            BestAgent::Second
        }
    } else if first_latency <= second_latency {
        BestAgent::First
    } else {
        BestAgent::Second
    }
}

pub struct AgentSelector {
    topology: Arc<dyn Topology>,
    agents: AgentRegistry,
    latency_difference_threshold: u64,
}

impl AgentSelector {
    pub fn new(
        topology: Arc<dyn Topology>,
        agents: AgentRegistry,
        latency_difference_threshold: u64,
    ) -> Self {
        Self {
            topology,
            agents,
            latency_difference_threshold,
        }
    }

    /// Sum of link latencies over the inter-switch hops of `path`
    ///
    /// Paths alternate `[in, out, in, out, ...]`, so links leave through the
    /// odd positions. Positions without a known link add nothing.
    pub fn path_latency(&self, path: &[NodePort]) -> u64 {
        path.iter()
            .skip(1)
            .step_by(2)
            .filter_map(|np| self.topology.link_latency(*np))
            .sum()
    }

    /// Best agent for the device at `device_ip`, seen at `attachment_points`
    ///
    /// Agents at `avoid` are skipped. The winner's MAC is refreshed from the
    /// topology, in the registry and in the returned agent.
    pub fn select_agent(
        &self,
        device_ip: Ipv4Addr,
        attachment_points: &[NodePort],
        avoid: Option<Ipv4Addr>,
    ) -> Result<AgentSelection, SelectionError> {
        if attachment_points.is_empty() {
            return Err(SelectionError::NoAttachmentPoint(device_ip));
        }
        let device_ap = true_attachment_point(self.topology.as_ref(), attachment_points)
            .ok_or(SelectionError::NoTrueAttachmentPoint(device_ip))?;

        let mut best: Option<(AgentSelection, usize)> = None;

        for registered in self.agents.list() {
            let agent = registered.agent;
            if Some(agent.ip) == avoid {
                debug!(agent = %agent, "Skipping earmarked agent");
                continue;
            }

            let Some((agent_ap, mac)) = self.locate(agent.ip) else {
                debug!(agent = %agent, "Agent not located, trying the next one");
                continue;
            };
            let Some(path) = self.topology.shortest_path(device_ap, agent_ap) else {
                debug!(agent = %agent, from = %device_ap, "No path to agent");
                continue;
            };

            let latency = self.path_latency(&path);
            let load = registered.active_transfers.len();
            let candidate = AgentSelection {
                agent: agent.with_mac(mac),
                path,
                latency,
            };

            best = match best {
                None => {
                    debug!(agent = %candidate.agent, latency, load, "Found initial agent");
                    Some((candidate, load))
                }
                Some((current, current_load)) => {
                    match select_best(
                        self.latency_difference_threshold,
                        (current.latency, current_load),
                        (latency, load),
                    ) {
                        BestAgent::First => Some((current, current_load)),
                        BestAgent::Second => {
                            debug!(agent = %candidate.agent, latency, load, "Found better agent");
                            Some((candidate, load))
                        }
                    }
                }
            };
        }

        let (selection, _) = best.ok_or_else(|| {
            warn!(device = %device_ip, "Could not find a path to any agent");
            SelectionError::NoAgentReachable(device_ip)
        })?;

        if let Some(mac) = selection.agent.mac {
            self.agents.set_mac(&selection.agent, mac);
        }
        debug!(agent = %selection.agent, device = %device_ip, "Selected agent");
        Ok(selection)
    }

    /// Path between the two chosen agents
    pub fn route_between(&self, src: &Agent, dst: &Agent) -> Result<Vec<NodePort>, SelectionError> {
        let (src_ap, _) = self
            .locate(src.ip)
            .ok_or(SelectionError::AgentNotLocated(src.ip))?;
        let (dst_ap, _) = self
            .locate(dst.ip)
            .ok_or(SelectionError::AgentNotLocated(dst.ip))?;

        self.topology
            .shortest_path(src_ap, dst_ap)
            .ok_or(SelectionError::NoPathBetweenAgents {
                src: src.ip,
                dst: dst.ip,
            })
    }

    /// True attachment point and MAC of a device, if it is known
    pub fn locate(&self, ip: Ipv4Addr) -> Option<(NodePort, MacAddr)> {
        let record = self.topology.find_device(ip)?;
        let ap = true_attachment_point(self.topology.as_ref(), &record.attachment_points)?;
        Some((ap, record.mac))
    }
}
