//! State of one accelerated transfer

use crate::device::{Agent, Client, Device, Server};
use crate::route::{Route, RouteType};
use crate::stats::{TerminationStats, TransferStats};
use crate::status::PacketStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use thiserror::Error;
use uuid::Uuid;

/// Reasons three routes cannot form a session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Expected a {expected} route, got {actual}")]
    WrongRouteType {
        expected: RouteType,
        actual: RouteType,
    },

    #[error("Client-side route ends at {client_side} but the inter-agent route starts at {inter_agent}")]
    ClientAgentMismatch {
        client_side: String,
        inter_agent: String,
    },

    #[error("Server-side route ends at {server_side} but the inter-agent route ends at {inter_agent}")]
    ServerAgentMismatch {
        server_side: String,
        inter_agent: String,
    },
}

/// Agent tunables copied into every session at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionTunables {
    pub parallel_sockets: u32,
    pub queue_capacity: u32,
    pub buffer_size: u32,
    /// Idle timeout of installed flows, in seconds
    pub flow_timeout: u16,
}

/// An accelerated transfer: its three routes, the flows installed for it and
/// the reports its agents have sent
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    transfer_id: Uuid,
    client_route: Route,
    inter_agent_route: Route,
    server_route: Route,
    #[serde(skip)]
    endpoints: Endpoints,
    server_agent_port: Option<u16>,
    tunables: SessionTunables,
    flow_names: BTreeSet<String>,
    init_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    termination: Option<TerminationStats>,
    client_side_stats: Vec<TransferStats>,
    server_side_stats: Vec<TransferStats>,
}

/// The four devices of a session, taken from its routes
#[derive(Debug, Clone)]
struct Endpoints {
    client: Client,
    server: Server,
    client_agent: Agent,
    server_agent: Agent,
}

impl Endpoints {
    fn of(client_route: &Route, server_route: &Route) -> Result<Self, SessionError> {
        let (Device::Client(client), Device::Agent(client_agent)) =
            (client_route.src(), client_route.dst())
        else {
            return Err(SessionError::WrongRouteType {
                expected: RouteType::ClientToAgent,
                actual: client_route.route_type(),
            });
        };
        let (Device::Server(server), Device::Agent(server_agent)) =
            (server_route.src(), server_route.dst())
        else {
            return Err(SessionError::WrongRouteType {
                expected: RouteType::ServerToAgent,
                actual: server_route.route_type(),
            });
        };

        Ok(Self {
            client: client.clone(),
            server: server.clone(),
            client_agent: client_agent.clone(),
            server_agent: server_agent.clone(),
        })
    }
}

impl Session {
    pub fn new(
        client_route: Route,
        inter_agent_route: Route,
        server_route: Route,
        tunables: SessionTunables,
    ) -> Result<Self, SessionError> {
        let endpoints = Endpoints::of(&client_route, &server_route)?;
        if inter_agent_route.route_type() != RouteType::AgentToAgent {
            return Err(SessionError::WrongRouteType {
                expected: RouteType::AgentToAgent,
                actual: inter_agent_route.route_type(),
            });
        }

        if client_route.dst() != inter_agent_route.src() {
            return Err(SessionError::ClientAgentMismatch {
                client_side: client_route.dst().to_string(),
                inter_agent: inter_agent_route.src().to_string(),
            });
        }
        if server_route.dst() != inter_agent_route.dst() {
            return Err(SessionError::ServerAgentMismatch {
                server_side: server_route.dst().to_string(),
                inter_agent: inter_agent_route.dst().to_string(),
            });
        }

        Ok(Self {
            transfer_id: Uuid::new_v4(),
            client_route,
            inter_agent_route,
            server_route,
            endpoints,
            server_agent_port: None,
            tunables,
            flow_names: BTreeSet::new(),
            init_time: Utc::now(),
            start_time: None,
            stop_time: None,
            termination: None,
            client_side_stats: Vec::new(),
            server_side_stats: Vec::new(),
        })
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn client_route(&self) -> &Route {
        &self.client_route
    }

    pub fn inter_agent_route(&self) -> &Route {
        &self.inter_agent_route
    }

    pub fn server_route(&self) -> &Route {
        &self.server_route
    }

    pub fn client(&self) -> &Client {
        &self.endpoints.client
    }

    pub fn server(&self) -> &Server {
        &self.endpoints.server
    }

    pub fn client_side_agent(&self) -> &Agent {
        &self.endpoints.client_agent
    }

    pub fn server_side_agent(&self) -> &Agent {
        &self.endpoints.server_agent
    }

    pub fn tunables(&self) -> &SessionTunables {
        &self.tunables
    }

    pub fn flow_timeout(&self) -> u16 {
        self.tunables.flow_timeout
    }

    /// Source port the server-side agent uses towards the server, once known
    pub fn server_agent_port(&self) -> Option<u16> {
        self.server_agent_port
    }

    /// Record the server-side agent's port; the transfer starts now
    pub fn set_server_agent_port(&mut self, port: u16) {
        self.server_agent_port = Some(port);
        self.start_time = Some(Utc::now());
    }

    pub fn flow_names(&self) -> &BTreeSet<String> {
        &self.flow_names
    }

    /// Name for the next flow installed under `prefix`, e.g. `sos-aa-<id>-#3`
    pub fn next_flow_name(&self, prefix: &str) -> String {
        format!(
            "{}-{}-#{}",
            prefix,
            self.transfer_id,
            self.flow_names.len() + 1
        )
    }

    pub fn add_flow_name(&mut self, name: String) {
        self.flow_names.insert(name);
    }

    pub fn take_flow_names(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.flow_names)
    }

    pub fn init_time(&self) -> DateTime<Utc> {
        self.init_time
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn stop_time(&self) -> Option<DateTime<Utc>> {
        self.stop_time
    }

    pub fn mark_stopped(&mut self) {
        self.stop_time = Some(Utc::now());
    }

    pub fn termination_stats(&self) -> Option<&TerminationStats> {
        self.termination.as_ref()
    }

    pub fn set_termination_stats(&mut self, stats: TerminationStats) {
        self.termination = Some(stats);
    }

    pub fn client_side_stats(&self) -> &[TransferStats] {
        &self.client_side_stats
    }

    pub fn server_side_stats(&self) -> &[TransferStats] {
        &self.server_side_stats
    }

    /// Add a periodic report, merging it into an existing sample taken at the
    /// same collection time
    pub fn update_transfer_stats(&mut self, stats: TransferStats) {
        let series = if stats.is_client_side() {
            &mut self.client_side_stats
        } else {
            &mut self.server_side_stats
        };

        match series
            .iter_mut()
            .rev()
            .find(|s| s.collection_time == stats.collection_time)
        {
            Some(existing) => existing.append(&stats),
            None => series.push(stats),
        }
    }

    /// Role of a packet within this transfer, if it belongs to it
    ///
    /// Endpoint directions are checked before agent-to-agent traffic.
    pub fn classify(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Option<PacketStatus> {
        let client = self.client();
        let server = self.server();
        let client_agent = self.client_side_agent().ip;
        let server_agent = self.server_side_agent().ip;

        if client.ip == src_ip && client.tcp_port == src_port {
            Some(PacketStatus::ActiveClientToClientSideAgent)
        } else if server.ip == src_ip && server.tcp_port == src_port {
            Some(PacketStatus::ActiveServerToServerSideAgent)
        } else if server.ip == dst_ip && server.tcp_port == dst_port && server_agent == src_ip {
            Some(PacketStatus::ActiveServerSideAgentToServer)
        } else if client.ip == dst_ip && client.tcp_port == dst_port && client_agent == src_ip {
            Some(PacketStatus::ActiveClientSideAgentToClient)
        } else if client_agent == src_ip && server_agent == dst_ip {
            Some(PacketStatus::ActiveClientSideAgentToServerSideAgent)
        } else if server_agent == src_ip && client_agent == dst_ip {
            Some(PacketStatus::ActiveServerSideAgentToClientSideAgent)
        } else {
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::stats::{AgentSide, ThroughputTuple};

    #[test]
    fn test_derived_endpoints() {
        let session = create_test_session();
        assert_eq!(session.client().tcp_port, 51000);
        assert_eq!(session.server().tcp_port, 80);
        assert_eq!(session.client_side_agent(), &client_agent());
        assert_eq!(session.server_side_agent(), &server_agent());
        assert_eq!(session.server_agent_port(), None);
        assert!(session.start_time().is_none());
    }

    #[test]
    fn test_routes_are_chained() {
        let session = create_test_session();
        assert_eq!(
            session.client_route().dst(),
            session.inter_agent_route().src()
        );
        assert_eq!(
            session.inter_agent_route().dst(),
            session.server_route().dst()
        );
    }

    #[test]
    fn test_mismatched_agents_rejected() {
        let session = create_test_session();
        let other_agent = Agent::new(Ipv4Addr::new(10, 0, 0, 3), 9877, 9878, 9998, 9999);
        let bad_server_route = Route::new(
            session.server_route().src().clone(),
            other_agent.into(),
            vec![np(2, 3), np(2, 4)],
        )
        .unwrap();

        let err = Session::new(
            session.client_route().clone(),
            session.inter_agent_route().clone(),
            bad_server_route,
            *session.tunables(),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::ServerAgentMismatch { .. }));
    }

    #[test]
    fn test_routes_in_wrong_slots_rejected() {
        let session = create_test_session();
        let err = Session::new(
            session.inter_agent_route().clone(),
            session.client_route().clone(),
            session.server_route().clone(),
            *session.tunables(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            SessionError::WrongRouteType {
                expected: RouteType::ClientToAgent,
                actual: RouteType::AgentToAgent,
            }
        );
    }

    #[test]
    fn test_server_route_in_client_slot_rejected() {
        let session = create_test_session();
        let err = Session::new(
            session.server_route().clone(),
            session.inter_agent_route().clone(),
            session.server_route().clone(),
            *session.tunables(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            SessionError::WrongRouteType {
                expected: RouteType::ClientToAgent,
                actual: RouteType::ServerToAgent,
            }
        );

        let err = Session::new(
            session.client_route().clone(),
            session.inter_agent_route().clone(),
            session.client_route().clone(),
            *session.tunables(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::WrongRouteType {
                expected: RouteType::ServerToAgent,
                ..
            }
        ));
    }

    #[test]
    fn test_endpoints_survive_clone() {
        let session = create_test_session().clone();
        assert_eq!(session.client().ip, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(session.server().ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(session.client_side_agent(), session.client_route().dst_agent().unwrap());
        assert_eq!(session.server_side_agent(), session.server_route().dst_agent().unwrap());
    }

    #[test]
    fn test_learning_agent_port_starts_transfer() {
        let mut session = create_test_session();
        session.set_server_agent_port(40000);
        assert_eq!(session.server_agent_port(), Some(40000));
        assert!(session.start_time().is_some());
    }

    #[test]
    fn test_flow_names_are_numbered() {
        let mut session = create_test_session();
        let first = session.next_flow_name("sos-aa");
        session.add_flow_name(first.clone());
        let second = session.next_flow_name("sos-aa");

        assert!(first.ends_with("-#1"));
        assert!(second.ends_with("-#2"));
        assert!(first.contains(&session.transfer_id().to_string()));
        assert_eq!(session.take_flow_names().len(), 1);
        assert!(session.flow_names().is_empty());
    }

    #[test]
    fn test_stats_with_same_collection_time_merge() {
        let mut session = create_test_session();
        let id = session.transfer_id();

        let mut first = TransferStats::new(id, AgentSide::Client, 1000);
        first.overall = ThroughputTuple::new(10, 1);
        first.per_socket.insert(0, ThroughputTuple::new(5, 1));
        let mut second = TransferStats::new(id, AgentSide::Client, 1000);
        second.per_socket.insert(0, ThroughputTuple::new(6, 2));

        session.update_transfer_stats(first);
        session.update_transfer_stats(second);
        assert_eq!(session.client_side_stats().len(), 1);
        assert_eq!(
            session.client_side_stats()[0].per_socket[&0],
            ThroughputTuple::new(6, 2)
        );

        session.update_transfer_stats(TransferStats::new(id, AgentSide::Client, 2000));
        session.update_transfer_stats(TransferStats::new(id, AgentSide::Server, 2000));
        assert_eq!(session.client_side_stats().len(), 2);
        assert_eq!(session.server_side_stats().len(), 1);
    }

    #[test]
    fn test_classify_directions() {
        let session = create_test_session();
        let client = Ipv4Addr::new(10, 0, 0, 9);
        let server = Ipv4Addr::new(10, 0, 0, 5);
        let ca = Ipv4Addr::new(10, 0, 0, 1);
        let sa = Ipv4Addr::new(10, 0, 0, 2);

        assert_eq!(
            session.classify(client, server, 51000, 80),
            Some(PacketStatus::ActiveClientToClientSideAgent)
        );
        assert_eq!(
            session.classify(server, client, 80, 51000),
            Some(PacketStatus::ActiveServerToServerSideAgent)
        );
        assert_eq!(
            session.classify(sa, server, 40000, 80),
            Some(PacketStatus::ActiveServerSideAgentToServer)
        );
        assert_eq!(
            session.classify(ca, client, 9877, 51000),
            Some(PacketStatus::ActiveClientSideAgentToClient)
        );
        assert_eq!(
            session.classify(ca, sa, 1234, 9877),
            Some(PacketStatus::ActiveClientSideAgentToServerSideAgent)
        );
        assert_eq!(
            session.classify(sa, ca, 9877, 1234),
            Some(PacketStatus::ActiveServerSideAgentToClientSideAgent)
        );
        assert_eq!(
            session.classify(Ipv4Addr::new(10, 0, 0, 77), server, 1, 80),
            None
        );
    }
}
