//! MAC redirect at the edge, L3/L4 rewrite at the agent's switch, L2 in between
//!
//! For deployments where only the switch next to each agent can rewrite IPv4
//! and TCP headers. The endpoint's edge switch rewrites the destination MAC to
//! the agent's, so every switch in between only needs to forward on MAC
//! addresses; the agent's switch then rewrites the destination address and
//! port. Both are undone on the way back.

use crate::flow::{FlowAction, FlowMatch};
use crate::strategy::{
    AccessEndpoints, FlowWriter, RoutingStrategy, SynthesisError, ACCESS_FLOW_PREFIX,
};
use crate::switch::SwitchProgrammer;
use sos_proto::{Route, Session};
use std::sync::Arc;

pub struct FirstHopLastHopStrategy {
    switches: Arc<dyn SwitchProgrammer>,
}

impl FirstHopLastHopStrategy {
    pub fn new(switches: Arc<dyn SwitchProgrammer>) -> Self {
        Self { switches }
    }
}

impl RoutingStrategy for FirstHopLastHopStrategy {
    fn name(&self) -> &'static str {
        "first-hop-last-hop"
    }

    fn push_route(&self, route: &Route, session: &mut Session) -> Result<(), SynthesisError> {
        let ep = AccessEndpoints::resolve(self.name(), route, session)?;
        let writer = FlowWriter::new(self.switches.as_ref(), ACCESS_FLOW_PREFIX);
        let first_hop = route.first_hop();
        let last_hop = route.last_hop();

        for hop in route.hops_from_dst() {
            let switch = hop.ingress.switch;
            let (in_port, out_port) = (hop.ingress.port, hop.egress.port);
            let at_edge = hop.ingress == first_hop;
            let at_agent = hop.egress == last_hop;

            let mut forward_actions = Vec::with_capacity(4);
            let mut reverse_actions = Vec::with_capacity(4);

            if at_edge {
                forward_actions.push(FlowAction::SetEthDst(ep.agent_mac));
                reverse_actions.push(FlowAction::SetEthSrc(ep.peer_mac));
            }
            if at_agent {
                forward_actions.push(FlowAction::SetIpv4Dst(ep.agent_ip));
                forward_actions.push(FlowAction::SetTcpDst(ep.agent_port));
                reverse_actions.push(FlowAction::SetIpv4Src(ep.peer_ip));
                reverse_actions.push(FlowAction::SetTcpSrc(ep.peer_port));
            }
            forward_actions.push(FlowAction::Output(out_port));
            reverse_actions.push(FlowAction::Output(in_port));

            let forward = if at_edge || at_agent {
                ep.from_endpoint(in_port)
            } else {
                FlowMatch::on_port(in_port)
                    .with_eth_src(ep.endpoint_mac)
                    .with_eth_dst(ep.agent_mac)
            };

            let reverse = if at_agent {
                ep.to_endpoint_from_agent(out_port)
            } else if at_edge {
                ep.to_endpoint_from_peer(out_port)
            } else {
                FlowMatch::on_port(out_port)
                    .with_eth_src(ep.agent_mac)
                    .with_eth_dst(ep.endpoint_mac)
            };

            writer.install(session, switch, forward, forward_actions)?;
            writer.install(session, switch, reverse, reverse_actions)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::*;
    use crate::switch::RecordingSwitch;
    use sos_proto::wire::{TCP_ACK, TCP_SYN};
    use sos_proto::{DatapathId, Frame};
    use std::net::{Ipv4Addr, SocketAddrV4};

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const CLIENT_AGENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn setup() -> (RecordingSwitch, FirstHopLastHopStrategy) {
        let switches = RecordingSwitch::new((1..=4).map(DatapathId));
        let strategy = FirstHopLastHopStrategy::new(Arc::new(switches.clone()));
        (switches, strategy)
    }

    #[test]
    fn test_interior_hops_match_only_l2() {
        let (switches, strategy) = setup();
        let mut session = three_switch_session();
        let route = session.client_route().clone();
        strategy.push_route(&route, &mut session).unwrap();

        let interior = switches.flows_on(DatapathId(2));
        assert_eq!(interior.len(), 2);
        for flow in interior {
            assert!(!flow.matcher.tcp);
            assert!(flow.matcher.ipv4_src.is_none() && flow.matcher.ipv4_dst.is_none());
            assert_eq!(flow.actions.len(), 1);
        }

        for flow in switches.flows_on(DatapathId(1)) {
            assert!(flow.actions.iter().all(|a| !matches!(
                a,
                FlowAction::SetIpv4Dst(_) | FlowAction::SetIpv4Src(_)
            )));
        }
    }

    #[test]
    fn test_round_trip_through_three_switches() {
        let (switches, strategy) = setup();
        let mut session = three_switch_session();
        let route = session.client_route().clone();
        strategy.push_route(&route, &mut session).unwrap();

        let syn = Frame::tcp(
            CLIENT_MAC,
            SERVER_MAC,
            SocketAddrV4::new(CLIENT, 51000),
            SocketAddrV4::new(SERVER, 80),
            TCP_SYN,
            &[],
        );
        let (port, frame) = switches.forward(DatapathId(1), 1, &syn).unwrap();
        assert_eq!((port, frame.eth_dst()), (3, CLIENT_AGENT_MAC));
        assert_eq!(frame.flow().unwrap().dst_ip, SERVER);
        let (port, frame) = switches.forward(DatapathId(2), 4, &frame).unwrap();
        assert_eq!(port, 3);
        let (port, frame) = switches.forward(DatapathId(3), 4, &frame).unwrap();
        assert_eq!(port, 2);
        assert_eq!(frame.flow().unwrap().dst_ip, CLIENT_AGENT);
        assert_eq!(frame.flow().unwrap().dst_port, 9877);

        let reply = Frame::tcp(
            CLIENT_AGENT_MAC,
            CLIENT_MAC,
            SocketAddrV4::new(CLIENT_AGENT, 9877),
            SocketAddrV4::new(CLIENT, 51000),
            TCP_SYN | TCP_ACK,
            &[],
        );
        let (port, frame) = switches.forward(DatapathId(3), 2, &reply).unwrap();
        assert_eq!(port, 4);
        assert_eq!(frame.flow().unwrap().src_ip, SERVER);
        let (port, frame) = switches.forward(DatapathId(2), 3, &frame).unwrap();
        assert_eq!(port, 4);
        let (port, frame) = switches.forward(DatapathId(1), 3, &frame).unwrap();
        assert_eq!(port, 1);
        assert_eq!(frame.eth_src(), SERVER_MAC);
        assert_eq!(frame.flow().unwrap().src_port, 80);
    }

    #[test]
    fn test_single_switch_path_gets_both_rewrites() {
        let (switches, strategy) = setup();
        let mut session = three_switch_session();
        session.set_server_agent_port(40000);
        let route = session.server_route().clone();
        strategy.push_route(&route, &mut session).unwrap();

        let flows = switches.flows_on(DatapathId(4));
        assert_eq!(flows.len(), 2);
        assert!(flows.iter().all(|f| f.actions.len() == 4));
    }
}
