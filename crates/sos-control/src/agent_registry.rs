//! Registry of the agents transfers can be steered through
//!
//! Besides the agents themselves the registry owns each agent's set of
//! in-flight transfer ids, which is what agent load is measured in. Agents
//! are kept in registration order so selection ties are resolved the same
//! way every time.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sos_proto::{Agent, MacAddr};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Agent {0} is already registered")]
    DuplicateAgent(String),

    #[error("Agent {0} is not registered")]
    UnknownAgent(String),
}

/// A registered agent with the transfers it is serving
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredAgent {
    pub agent: Agent,
    pub active_transfers: BTreeSet<Uuid>,
    pub registered_at: DateTime<Utc>,
}

impl RegisteredAgent {
    pub fn load(&self) -> usize {
        self.active_transfers.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<Vec<RegisteredAgent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        tracing::debug!("Creating new agent registry");
        Self::default()
    }

    /// Register an agent; agents are equal when their address and ports are
    pub fn register(&self, agent: Agent) -> Result<(), RegistryError> {
        let mut agents = self.agents.write();

        if agents.iter().any(|a| a.agent == agent) {
            tracing::warn!(agent = %agent, "Agent already registered");
            return Err(RegistryError::DuplicateAgent(agent.to_string()));
        }

        tracing::info!(agent = %agent, "Registered agent");
        agents.push(RegisteredAgent {
            agent,
            active_transfers: BTreeSet::new(),
            registered_at: Utc::now(),
        });
        Ok(())
    }

    pub fn unregister(&self, agent: &Agent) -> Result<RegisteredAgent, RegistryError> {
        let mut agents = self.agents.write();

        match agents.iter().position(|a| a.agent == *agent) {
            Some(index) => {
                let removed = agents.remove(index);
                tracing::info!(
                    agent = %agent,
                    active_transfers = removed.load(),
                    "Unregistered agent"
                );
                Ok(removed)
            }
            None => {
                tracing::warn!(agent = %agent, "Attempted to unregister unknown agent");
                Err(RegistryError::UnknownAgent(agent.to_string()))
            }
        }
    }

    pub fn get(&self, agent: &Agent) -> Option<RegisteredAgent> {
        self.agents
            .read()
            .iter()
            .find(|a| a.agent == *agent)
            .cloned()
    }

    /// The first registered agent at `ip` whose ports satisfy `pred`
    pub fn find_by_ip(&self, ip: Ipv4Addr, pred: impl Fn(&Agent) -> bool) -> Option<Agent> {
        self.agents
            .read()
            .iter()
            .find(|a| a.agent.ip == ip && pred(&a.agent))
            .map(|a| a.agent.clone())
    }

    /// All registered agents, in registration order
    pub fn list(&self) -> Vec<RegisteredAgent> {
        self.agents.read().clone()
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.agents.read().iter().map(|a| a.agent.clone()).collect()
    }

    pub fn ip_set(&self) -> BTreeSet<Ipv4Addr> {
        self.agents.read().iter().map(|a| a.agent.ip).collect()
    }

    pub fn count(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Number of in-flight transfers, zero for unknown agents
    pub fn load(&self, agent: &Agent) -> usize {
        self.get(agent).map(|a| a.load()).unwrap_or(0)
    }

    /// Agents with no in-flight transfer
    pub fn idle_count(&self) -> usize {
        self.agents
            .read()
            .iter()
            .filter(|a| a.active_transfers.is_empty())
            .count()
    }

    pub fn set_mac(&self, agent: &Agent, mac: MacAddr) -> bool {
        self.update(agent, |a| {
            if a.agent.mac != Some(mac) {
                tracing::debug!(agent = %a.agent, mac = %mac, "Learned agent MAC");
                a.agent.mac = Some(mac);
            }
        })
    }

    pub fn add_transfer(&self, agent: &Agent, transfer_id: Uuid) -> bool {
        self.update(agent, |a| {
            a.active_transfers.insert(transfer_id);
        })
    }

    /// Forget a transfer; false if the agent was not serving it
    pub fn remove_transfer(&self, agent: &Agent, transfer_id: Uuid) -> bool {
        let mut removed = false;
        self.update(agent, |a| removed = a.active_transfers.remove(&transfer_id));
        removed
    }

    pub fn is_serving(&self, agent: &Agent, transfer_id: Uuid) -> bool {
        self.agents
            .read()
            .iter()
            .any(|a| a.agent == *agent && a.active_transfers.contains(&transfer_id))
    }

    fn update(&self, agent: &Agent, f: impl FnOnce(&mut RegisteredAgent)) -> bool {
        let mut agents = self.agents.write();
        match agents.iter_mut().find(|a| a.agent == *agent) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_agent(last_octet: u8) -> Agent {
        Agent::new(Ipv4Addr::new(10, 0, 0, last_octet), 9877, 9878, 9998, 9999)
    }

    #[test]
    fn test_register_agent() {
        let registry = AgentRegistry::new();
        registry.register(create_test_agent(1)).unwrap();

        let retrieved = registry.get(&create_test_agent(1)).unwrap();
        assert_eq!(retrieved.agent.ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(retrieved.load(), 0);
    }

    #[test]
    fn test_register_duplicate_agent_ignores_mac() {
        let registry = AgentRegistry::new();
        registry.register(create_test_agent(1)).unwrap();

        let result = registry.register(create_test_agent(1).with_mac(MacAddr::BROADCAST));
        assert!(matches!(result, Err(RegistryError::DuplicateAgent(_))));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_same_ip_different_ports_is_another_agent() {
        let registry = AgentRegistry::new();
        registry.register(create_test_agent(1)).unwrap();
        registry
            .register(Agent::new(Ipv4Addr::new(10, 0, 0, 1), 7000, 7001, 7002, 7003))
            .unwrap();
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.ip_set().len(), 1);
    }

    #[test]
    fn test_unregister_unknown_agent_leaves_registry_untouched() {
        let registry = AgentRegistry::new();
        registry.register(create_test_agent(1)).unwrap();

        let result = registry.unregister(&create_test_agent(2));
        assert!(matches!(result, Err(RegistryError::UnknownAgent(_))));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_list_keeps_registration_order() {
        let registry = AgentRegistry::new();
        for octet in [3, 1, 2] {
            registry.register(create_test_agent(octet)).unwrap();
        }

        let ips: Vec<u8> = registry
            .agents()
            .iter()
            .map(|a| a.ip.octets()[3])
            .collect();
        assert_eq!(ips, vec![3, 1, 2]);
    }

    #[test]
    fn test_transfer_tracking() {
        let registry = AgentRegistry::new();
        let agent = create_test_agent(1);
        registry.register(agent.clone()).unwrap();
        registry.register(create_test_agent(2)).unwrap();
        let id = Uuid::new_v4();

        assert_eq!(registry.idle_count(), 2);
        assert!(registry.add_transfer(&agent, id));
        assert!(registry.is_serving(&agent, id));
        assert_eq!(registry.load(&agent), 1);
        assert_eq!(registry.idle_count(), 1);

        assert!(registry.remove_transfer(&agent, id));
        assert!(!registry.remove_transfer(&agent, id));
        assert_eq!(registry.load(&agent), 0);
        assert!(!registry.add_transfer(&create_test_agent(9), id));
    }

    #[test]
    fn test_find_by_ip_and_port() {
        let registry = AgentRegistry::new();
        registry.register(create_test_agent(1)).unwrap();
        let ip = Ipv4Addr::new(10, 0, 0, 1);

        assert!(registry.find_by_ip(ip, |a| a.feedback_port == 9998).is_some());
        assert!(registry.find_by_ip(ip, |a| a.feedback_port == 1).is_none());
        assert!(registry
            .find_by_ip(Ipv4Addr::new(10, 0, 0, 2), |_| true)
            .is_none());
    }

    #[test]
    fn test_set_mac() {
        let registry = AgentRegistry::new();
        let agent = create_test_agent(1);
        registry.register(agent.clone()).unwrap();
        let mac = MacAddr([0, 0, 0, 0, 0, 1]);

        assert!(registry.set_mac(&agent, mac));
        assert_eq!(registry.get(&agent).unwrap().agent.mac, Some(mac));
        assert!(!registry.set_mac(&create_test_agent(2), mac));
    }
}
