//! Plain forwarding between the two agents of a transfer

use crate::flow::{FlowAction, FlowMatch};
use crate::strategy::{
    require_mac, FlowWriter, RoutingStrategy, SynthesisError, INTER_AGENT_FLOW_PREFIX,
};
use crate::switch::SwitchProgrammer;
use sos_proto::{Route, RouteType, Session};
use std::sync::Arc;

/// Agents address each other directly, so every hop just forwards on the
/// agents' L2/L3 addresses in both directions.
pub struct InterAgentStrategy {
    switches: Arc<dyn SwitchProgrammer>,
}

impl InterAgentStrategy {
    pub fn new(switches: Arc<dyn SwitchProgrammer>) -> Self {
        Self { switches }
    }
}

impl RoutingStrategy for InterAgentStrategy {
    fn name(&self) -> &'static str {
        "inter-agent"
    }

    fn push_route(&self, route: &Route, session: &mut Session) -> Result<(), SynthesisError> {
        if route.route_type() != RouteType::AgentToAgent {
            return Err(SynthesisError::UnsupportedRoute {
                strategy: self.name(),
                route_type: route.route_type(),
            });
        }

        let src_mac = require_mac(route.src())?;
        let dst_mac = require_mac(route.dst())?;
        let src_ip = route.src().ip();
        let dst_ip = route.dst().ip();
        let writer = FlowWriter::new(self.switches.as_ref(), INTER_AGENT_FLOW_PREFIX);

        for hop in route.hops_from_dst() {
            let switch = hop.ingress.switch;

            let forward = FlowMatch::tcp_on(hop.ingress.port)
                .with_eth_src(src_mac)
                .with_eth_dst(dst_mac)
                .with_ipv4_src(src_ip)
                .with_ipv4_dst(dst_ip);
            writer.install(
                session,
                switch,
                forward,
                vec![FlowAction::Output(hop.egress.port)],
            )?;

            let reverse = FlowMatch::tcp_on(hop.egress.port)
                .with_eth_src(dst_mac)
                .with_eth_dst(src_mac)
                .with_ipv4_src(dst_ip)
                .with_ipv4_dst(src_ip);
            writer.install(
                session,
                switch,
                reverse,
                vec![FlowAction::Output(hop.ingress.port)],
            )?;
        }

        Ok(())
    }
}
