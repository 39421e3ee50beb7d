//! Agent liveness probing
//!
//! Agents rarely send traffic of their own, so the network's device tracking
//! can forget them. The monitor periodically floods an ARP request for every
//! registered agent to keep them known.

use crate::agent_registry::AgentRegistry;
use crate::topology::{true_attachment_point, Topology};
use parking_lot::Mutex;
use sos_proto::{Frame, MacAddr};
use sos_router::SwitchProgrammer;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// ARP request for `target` from a made-up `.254` host on the same /24
///
/// The broadcast sender MAC keeps hosts from caching the made-up address.
pub fn arp_probe(target: Ipv4Addr) -> Frame {
    let [a, b, c, _] = target.octets();
    Frame::arp_request(MacAddr::BROADCAST, Ipv4Addr::new(a, b, c, 254), target)
}

/// Flood a probe for `ip` on every switch
pub fn probe_everywhere(ip: Ipv4Addr, switches: &dyn SwitchProgrammer) {
    let probe = arp_probe(ip);
    for switch in switches.switches() {
        trace!(target_ip = %ip, switch = %switch, "ARPing");
        if let Err(e) = switches.flood(switch, &probe) {
            warn!(target_ip = %ip, switch = %switch, error = %e, "Failed to send ARP probe");
        }
    }
}

/// Probe an agent on the switch it is attached to, or everywhere if that is
/// not known
pub fn probe_agent(ip: Ipv4Addr, topology: &dyn Topology, switches: &dyn SwitchProgrammer) {
    let ap = topology
        .find_device(ip)
        .and_then(|record| true_attachment_point(topology, &record.attachment_points));

    match ap {
        Some(ap) => {
            trace!(agent = %ip, attachment_point = %ap, "ARPing for agent at known location");
            if let Err(e) = switches.flood(ap.switch, &arp_probe(ip)) {
                warn!(agent = %ip, switch = %ap.switch, error = %e, "Failed to send ARP probe");
            }
        }
        None => {
            warn!(agent = %ip, "Agent has no known attachment point, ARPing on all switches");
            probe_everywhere(ip, switches);
        }
    }
}

/// Owns the periodic probing task
pub struct AgentMonitor {
    task: Mutex<Option<JoinHandle<()>>>,
    initial_delay: Duration,
    interval: Duration,
}

impl AgentMonitor {
    pub fn new(initial_delay: Duration, interval: Duration) -> Self {
        Self {
            task: Mutex::new(None),
            initial_delay,
            interval,
        }
    }

    /// Start probing unless already running
    ///
    /// Needs a tokio runtime; without one nothing is started and `false` is
    /// returned.
    pub fn start(
        &self,
        agents: AgentRegistry,
        topology: Arc<dyn Topology>,
        switches: Arc<dyn SwitchProgrammer>,
    ) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, agent monitor not started");
            return false;
        };

        debug!(
            initial_delay = ?self.initial_delay,
            interval = ?self.interval,
            "Starting agent monitor"
        );
        let start = tokio::time::Instant::now() + self.initial_delay;
        let interval = self.interval;

        *task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                for agent in agents.agents() {
                    probe_agent(agent.ip, topology.as_ref(), switches.as_ref());
                }
            }
        }));
        true
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            debug!("Stopping agent monitor");
            handle.abort();
        }
    }
}

impl Drop for AgentMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
