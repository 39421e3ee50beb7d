//! Redirect at the endpoint's edge switch, rewrite next to the agent
//!
//! Assumes every switch on the path can rewrite L2, L3 and L4 headers:
//!
//! - the switch the client or server is attached to redirects its traffic
//!   towards the agent (optionally rewriting the destination MAC) and restores
//!   the peer's MAC on the way back;
//! - the switch the agent is attached to rewrites destination IPv4 and TCP
//!   port to the agent's and restores the peer's address on the way back;
//! - switches in between forward the exact 5-tuple in both directions.
//!
//! When the endpoint and the agent share a switch, the redirect and rewrite
//! actions are folded into one flow per direction.

use crate::flow::{FlowAction, FlowMatch};
use crate::strategy::{
    AccessEndpoints, FlowWriter, RoutingStrategy, SynthesisError, ACCESS_FLOW_PREFIX,
};
use crate::switch::SwitchProgrammer;
use sos_proto::{Route, Session};
use std::sync::Arc;

pub struct SingleHopStrategy {
    switches: Arc<dyn SwitchProgrammer>,
    rewrite_mac: bool,
}

impl SingleHopStrategy {
    /// `rewrite_mac` selects whether the destination MAC is rewritten at the
    /// redirecting switch (so L2 learning switches in between see the agent)
    /// or only at the switch next to the agent.
    pub fn new(switches: Arc<dyn SwitchProgrammer>, rewrite_mac: bool) -> Self {
        Self {
            switches,
            rewrite_mac,
        }
    }

    fn transit_mac(&self, ep: &AccessEndpoints) -> sos_proto::MacAddr {
        if self.rewrite_mac {
            ep.agent_mac
        } else {
            ep.peer_mac
        }
    }
}

impl RoutingStrategy for SingleHopStrategy {
    fn name(&self) -> &'static str {
        "single-hop"
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

            let (forward, forward_actions, reverse, reverse_actions) = match (at_edge, at_agent) {
                (true, true) => (
                    ep.from_endpoint(in_port),
                    vec![
                        FlowAction::SetEthDst(ep.agent_mac),
                        FlowAction::SetIpv4Dst(ep.agent_ip),
                        FlowAction::SetTcpDst(ep.agent_port),
                        FlowAction::Output(out_port),
                    ],
                    ep.to_endpoint_from_agent(out_port),
                    vec![
                        FlowAction::SetEthSrc(ep.peer_mac),
                        FlowAction::SetIpv4Src(ep.peer_ip),
                        FlowAction::SetTcpSrc(ep.peer_port),
                        FlowAction::Output(in_port),
                    ],
                ),
                (true, false) => {
                    let mut forward_actions = Vec::with_capacity(2);
                    let mut reverse_actions = Vec::with_capacity(2);
                    if self.rewrite_mac {
                        forward_actions.push(FlowAction::SetEthDst(ep.agent_mac));
                        reverse_actions.push(FlowAction::SetEthSrc(ep.peer_mac));
                    }
                    forward_actions.push(FlowAction::Output(out_port));
                    reverse_actions.push(FlowAction::Output(in_port));
                    (
                        ep.from_endpoint(in_port),
                        forward_actions,
                        ep.to_endpoint_from_peer(out_port),
                        reverse_actions,
                    )
                }
                (false, true) => {
                    let mut forward_actions = Vec::with_capacity(4);
                    let mut reverse_actions = Vec::with_capacity(4);
                    if !self.rewrite_mac {
                        forward_actions.push(FlowAction::SetEthDst(ep.agent_mac));
                        reverse_actions.push(FlowAction::SetEthSrc(ep.peer_mac));
                    }
                    forward_actions.extend([
                        FlowAction::SetIpv4Dst(ep.agent_ip),
                        FlowAction::SetTcpDst(ep.agent_port),
                        FlowAction::Output(out_port),
                    ]);
                    reverse_actions.extend([
                        FlowAction::SetIpv4Src(ep.peer_ip),
                        FlowAction::SetTcpSrc(ep.peer_port),
                        FlowAction::Output(in_port),
                    ]);
                    (
                        ep.from_endpoint(in_port),
                        forward_actions,
                        ep.to_endpoint_from_agent(out_port),
                        reverse_actions,
                    )
                }
                (false, false) => {
                    let mac = self.transit_mac(&ep);
                    (
                        FlowMatch::tcp_on(in_port)
                            .with_eth_src(ep.endpoint_mac)
                            .with_eth_dst(mac)
                            .with_ipv4_src(ep.endpoint_ip)
                            .with_ipv4_dst(ep.peer_ip)
                            .with_tcp_src(ep.endpoint_port)
                            .with_tcp_dst(ep.peer_port),
                        vec![FlowAction::Output(out_port)],
                        FlowMatch::tcp_on(out_port)
                            .with_eth_src(mac)
                            .with_eth_dst(ep.endpoint_mac)
                            .with_ipv4_src(ep.peer_ip)
                            .with_ipv4_dst(ep.endpoint_ip)
                            .with_tcp_src(ep.peer_port)
                            .with_tcp_dst(ep.endpoint_port),
                        vec![FlowAction::Output(in_port)],
                    )
                }
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
    use sos_proto::{DatapathId, Frame, MacAddr};
    use std::net::{Ipv4Addr, SocketAddrV4};

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const CLIENT_AGENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const SERVER_AGENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn setup(rewrite_mac: bool) -> (RecordingSwitch, SingleHopStrategy) {
        let switches = RecordingSwitch::new((1..=4).map(DatapathId));
        let strategy = SingleHopStrategy::new(Arc::new(switches.clone()), rewrite_mac);
        (switches, strategy)
    }

    /// Walk a frame along `(switch, in_port)` hops, following each egress port
    fn walk(switches: &RecordingSwitch, hops: &[(u64, u16)], frame: Frame) -> (u16, Frame) {
        let mut current = frame;
        let mut egress = 0;
        for (switch, in_port) in hops {
            let (port, next) = switches
                .forward(DatapathId(*switch), *in_port, &current)
                .unwrap_or_else(|| panic!("table miss on s{} port {}", switch, in_port));
            egress = port;
            current = next;
        }
        (egress, current)
    }

    fn client_syn() -> Frame {
        Frame::tcp(
            CLIENT_MAC,
            SERVER_MAC,
            SocketAddrV4::new(CLIENT, 51000),
            SocketAddrV4::new(SERVER, 80),
            TCP_SYN,
            &[],
        )
    }

    fn agent_reply(src_mac: MacAddr) -> Frame {
        Frame::tcp(
            src_mac,
            CLIENT_MAC,
            SocketAddrV4::new(CLIENT_AGENT, 9877),
            SocketAddrV4::new(CLIENT, 51000),
            TCP_SYN | TCP_ACK,
            &[],
        )
    }

    #[test]
    fn test_two_flows_per_switch() {
        let (switches, strategy) = setup(true);
        let mut session = three_switch_session();
        let route = session.client_route().clone();

        strategy.push_route(&route, &mut session).unwrap();

        assert_eq!(switches.flow_count(), 6);
        for switch in 1..=3 {
            assert_eq!(switches.flows_on(DatapathId(switch)).len(), 2);
        }
        assert!(session
            .flow_names()
            .iter()
            .all(|n| n.starts_with("sos-aa-")));
    }

    #[test]
    fn test_client_traffic_reaches_agent_transparently() {
        for rewrite_mac in [true, false] {
            let (switches, strategy) = setup(rewrite_mac);
            let mut session = three_switch_session();
            let route = session.client_route().clone();
            strategy.push_route(&route, &mut session).unwrap();

            let (port, at_agent) = walk(&switches, &[(1, 1), (2, 4), (3, 4)], client_syn());
            let flow = at_agent.flow().unwrap();
            assert_eq!(port, 2);
            assert_eq!(at_agent.eth_dst(), CLIENT_AGENT_MAC);
            assert_eq!(flow.dst_ip, CLIENT_AGENT);
            assert_eq!(flow.dst_port, 9877);
            assert_eq!(flow.src_ip, CLIENT);
            assert!(at_agent.checksums_valid());

            let (port, at_client) = walk(
                &switches,
                &[(3, 2), (2, 3), (1, 3)],
                agent_reply(CLIENT_AGENT_MAC),
            );
            let flow = at_client.flow().unwrap();
            assert_eq!(port, 1);
            assert_eq!(at_client.eth_src(), SERVER_MAC);
            assert_eq!(flow.src_ip, SERVER);
            assert_eq!(flow.src_port, 80);
        }
    }

    #[test]
    fn test_single_switch_folds_redirect_and_rewrite() {
        let (switches, strategy) = setup(true);
        let mut session = three_switch_session();
        session.set_server_agent_port(40000);
        let route = session.server_route().clone();

        strategy.push_route(&route, &mut session).unwrap();
        assert_eq!(switches.flows_on(DatapathId(4)).len(), 2);

        let from_server = Frame::tcp(
            SERVER_MAC,
            CLIENT_MAC,
            SocketAddrV4::new(SERVER, 80),
            SocketAddrV4::new(CLIENT, 40000),
            TCP_SYN | TCP_ACK,
            &[],
        );
        let (port, at_agent) = switches.forward(DatapathId(4), 1, &from_server).unwrap();
        let flow = at_agent.flow().unwrap();
        assert_eq!(port, 2);
        assert_eq!(at_agent.eth_dst(), SERVER_AGENT_MAC);
        assert_eq!(flow.dst_ip, SERVER_AGENT);
        assert_eq!(flow.dst_port, 40000);

        let from_agent = Frame::tcp(
            SERVER_AGENT_MAC,
            SERVER_MAC,
            SocketAddrV4::new(SERVER_AGENT, 40000),
            SocketAddrV4::new(SERVER, 80),
            TCP_ACK,
            &[],
        );
        let (port, at_server) = switches.forward(DatapathId(4), 2, &from_agent).unwrap();
        let flow = at_server.flow().unwrap();
        assert_eq!(port, 1);
        assert_eq!(at_server.eth_src(), CLIENT_MAC);
        assert_eq!(flow.src_ip, CLIENT);
        assert_eq!(flow.src_port, 40000);
    }

    #[test]
    fn test_server_route_before_port_learned_fails() {
        let (switches, strategy) = setup(true);
        let mut session = three_switch_session();
        let route = session.server_route().clone();

        assert!(matches!(
            strategy.push_route(&route, &mut session),
            Err(SynthesisError::AgentPortUnknown(_))
        ));
        assert_eq!(switches.flow_count(), 0);
    }

    #[test]
    fn test_unknown_switch_is_fatal() {
        let switches = RecordingSwitch::new([DatapathId(3)]);
        let strategy = SingleHopStrategy::new(Arc::new(switches.clone()), true);
        let mut session = three_switch_session();
        let route = session.client_route().clone();

        assert!(matches!(
            strategy.push_route(&route, &mut session),
            Err(SynthesisError::UnresolvedSwitch(DatapathId(2)))
        ));
        // flows installed before the failure are still tracked for teardown
        assert_eq!(session.flow_names().len(), switches.flow_count());
    }
}
