//! The routing strategy interface and what the strategies share

use crate::flow::{FlowAction, FlowMatch, FlowSpec};
use crate::switch::{SwitchError, SwitchProgrammer};
use sos_proto::{DatapathId, Device, MacAddr, Route, RouteType, Session, FLOW_PRIORITY};
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Name prefix of flows steering traffic between an endpoint and its agent
pub const ACCESS_FLOW_PREFIX: &str = "sos-aa";
/// Name prefix of flows between the two agents
pub const INTER_AGENT_FLOW_PREFIX: &str = "sos-ia";

/// Failures turning a route into flows
///
/// All of these point at a broken deployment or a controller bug rather than
/// at something a retry would fix.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("The {strategy} strategy cannot push a {route_type} route")]
    UnsupportedRoute {
        strategy: &'static str,
        route_type: RouteType,
    },

    #[error("Switch {0} backing a route hop cannot be resolved")]
    UnresolvedSwitch(DatapathId),

    #[error("Failed to install flow {name}: {source}")]
    Install {
        name: String,
        #[source]
        source: SwitchError,
    },

    #[error("MAC address of {0} is not known")]
    UnknownMac(String),

    #[error("Server-side agent port of transfer {0} is not known yet")]
    AgentPortUnknown(Uuid),
}

/// Turns one route of a session into installed flows
pub trait RoutingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Install the flows for `route` and record their names on `session`
    fn push_route(&self, route: &Route, session: &mut Session) -> Result<(), SynthesisError>;
}

/// Installs flows for one session, naming them in sequence
pub(crate) struct FlowWriter<'a> {
    switches: &'a dyn SwitchProgrammer,
    prefix: &'static str,
}

impl<'a> FlowWriter<'a> {
    pub(crate) fn new(switches: &'a dyn SwitchProgrammer, prefix: &'static str) -> Self {
        Self { switches, prefix }
    }

    pub(crate) fn install(
        &self,
        session: &mut Session,
        switch: DatapathId,
        matcher: FlowMatch,
        actions: Vec<FlowAction>,
    ) -> Result<(), SynthesisError> {
        let name = session.next_flow_name(self.prefix);
        let flow = FlowSpec {
            name: name.clone(),
            switch,
            matcher,
            actions,
            priority: FLOW_PRIORITY,
            idle_timeout: session.flow_timeout(),
            hard_timeout: 0,
        };

        match self.switches.install_flow(flow) {
            Ok(()) => {
                info!(transfer_id = %session.transfer_id(), flow = %name, switch = %switch, "Added flow");
                session.add_flow_name(name);
                Ok(())
            }
            Err(SwitchError::UnknownSwitch(dpid)) => Err(SynthesisError::UnresolvedSwitch(dpid)),
            Err(source) => Err(SynthesisError::Install { name, source }),
        }
    }
}

pub(crate) fn require_mac(device: &Device) -> Result<MacAddr, SynthesisError> {
    device
        .mac()
        .ok_or_else(|| SynthesisError::UnknownMac(device.to_string()))
}

/// Addresses seen on an access route (client or server side)
///
/// `endpoint` is the client or server the route starts at, `peer` is who the
/// endpoint believes it is talking to, and `agent` is where its traffic is
/// really delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AccessEndpoints {
    pub endpoint_ip: Ipv4Addr,
    pub endpoint_port: u16,
    pub endpoint_mac: MacAddr,
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    pub peer_mac: MacAddr,
    pub agent_ip: Ipv4Addr,
    pub agent_port: u16,
    pub agent_mac: MacAddr,
}

impl AccessEndpoints {
    pub(crate) fn resolve(
        strategy: &'static str,
        route: &Route,
        session: &Session,
    ) -> Result<Self, SynthesisError> {
        let agent = route
            .dst_agent()
            .ok_or(SynthesisError::UnsupportedRoute {
                strategy,
                route_type: route.route_type(),
            })?;
        let agent_mac = require_mac(route.dst())?;
        let endpoint_mac = require_mac(route.src())?;

        match route.route_type() {
            RouteType::ClientToAgent => {
                let client = session.client();
                let server = session.server();
                Ok(Self {
                    endpoint_ip: client.ip,
                    endpoint_port: client.tcp_port,
                    endpoint_mac,
                    peer_ip: server.ip,
                    peer_port: server.tcp_port,
                    peer_mac: require_mac(session.server_route().src())?,
                    agent_ip: agent.ip,
                    agent_port: agent.data_port,
                    agent_mac,
                })
            }
            RouteType::ServerToAgent => {
                let client = session.client();
                let server = session.server();
                // The server sees the client's address with the port the
                // server-side agent connected from.
                let agent_port = session
                    .server_agent_port()
                    .ok_or(SynthesisError::AgentPortUnknown(session.transfer_id()))?;
                Ok(Self {
                    endpoint_ip: server.ip,
                    endpoint_port: server.tcp_port,
                    endpoint_mac,
                    peer_ip: client.ip,
                    peer_port: agent_port,
                    peer_mac: require_mac(session.client_route().src())?,
                    agent_ip: agent.ip,
                    agent_port,
                    agent_mac,
                })
            }
            RouteType::AgentToAgent => Err(SynthesisError::UnsupportedRoute {
                strategy,
                route_type: RouteType::AgentToAgent,
            }),
        }
    }

    /// Traffic from the endpoint to its peer entering on `in_port`
    pub(crate) fn from_endpoint(&self, in_port: u16) -> FlowMatch {
        FlowMatch::tcp_on(in_port)
            .with_ipv4_src(self.endpoint_ip)
            .with_tcp_src(self.endpoint_port)
            .with_tcp_dst(self.peer_port)
    }

    /// Traffic to the endpoint that already looks like it comes from the peer
    pub(crate) fn to_endpoint_from_peer(&self, in_port: u16) -> FlowMatch {
        FlowMatch::tcp_on(in_port)
            .with_ipv4_dst(self.endpoint_ip)
            .with_tcp_src(self.peer_port)
            .with_tcp_dst(self.endpoint_port)
    }

    /// Traffic to the endpoint still carrying the agent's address
    pub(crate) fn to_endpoint_from_agent(&self, in_port: u16) -> FlowMatch {
        FlowMatch::tcp_on(in_port)
            .with_ipv4_dst(self.endpoint_ip)
            .with_tcp_src(self.agent_port)
            .with_tcp_dst(self.endpoint_port)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use sos_proto::{
        Agent, Client, DatapathId, MacAddr, NodePort, Route, Server, Session, SessionTunables,
    };
    use std::net::Ipv4Addr;

    pub const CLIENT_MAC: MacAddr = MacAddr([0, 0, 0, 0, 0, 9]);
    pub const SERVER_MAC: MacAddr = MacAddr([0, 0, 0, 0, 0, 5]);
    pub const CLIENT_AGENT_MAC: MacAddr = MacAddr([0, 0, 0, 0, 0, 1]);
    pub const SERVER_AGENT_MAC: MacAddr = MacAddr([0, 0, 0, 0, 0, 2]);

    pub fn np(switch: u64, port: u16) -> NodePort {
        NodePort::new(DatapathId(switch), port)
    }

    pub fn client_agent() -> Agent {
        Agent::new(Ipv4Addr::new(10, 0, 0, 1), 9877, 9878, 9998, 9999).with_mac(CLIENT_AGENT_MAC)
    }

    pub fn server_agent() -> Agent {
        Agent::new(Ipv4Addr::new(10, 0, 0, 2), 9877, 9878, 9998, 9999).with_mac(SERVER_AGENT_MAC)
    }

    /// A session over the given client-side, inter-agent and server-side paths
    pub fn create_test_session(
        client_path: Vec<NodePort>,
        inter_agent_path: Vec<NodePort>,
        server_path: Vec<NodePort>,
    ) -> Session {
        let client = Client::new(Ipv4Addr::new(10, 0, 0, 9), 51000).with_mac(CLIENT_MAC);
        let server = Server::new(Ipv4Addr::new(10, 0, 0, 5), 80).with_mac(SERVER_MAC);

        Session::new(
            Route::new(client.into(), client_agent().into(), client_path).unwrap(),
            Route::new(client_agent().into(), server_agent().into(), inter_agent_path).unwrap(),
            Route::new(server.into(), server_agent().into(), server_path).unwrap(),
            SessionTunables {
                parallel_sockets: 1000,
                queue_capacity: 3,
                buffer_size: 30000,
                flow_timeout: 60,
            },
        )
        .unwrap()
    }

    /// Client at s1/1, client agent at s3/2, server at s4/1, server agent at s4/2,
    /// with s1-s2-s3 chained on ports 3/4
    pub fn three_switch_session() -> Session {
        create_test_session(
            vec![np(1, 1), np(1, 3), np(2, 4), np(2, 3), np(3, 4), np(3, 2)],
            vec![np(3, 2), np(3, 5), np(4, 5), np(4, 2)],
            vec![np(4, 1), np(4, 2)],
        )
    }
}
