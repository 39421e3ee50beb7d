//! The packet-driven controller
//!
//! [`SosController::handle_packet`] is fed every packet the switches punt to
//! the controller. Whitelisted TCP connections are admitted as new transfers:
//! an agent is selected on each side, the client-side and inter-agent flows
//! are installed and the triggering packet is handed to the client-side
//! agent. When the server-side agent opens its connection to the server the
//! server-side flows are installed the same way. Agents report back over UDP
//! and the transfer is retired once both of them have finished.
//!
//! Admission and configuration changes run one at a time; agent reports
//! only lock the session they are about.

use crate::agent_registry::{AgentRegistry, RegisteredAgent};
use crate::config::{ConfigError, ControllerConfig};
use crate::connection_registry::{ConnectionRegistry, SharedSession};
use crate::error::ControlError;
use crate::monitor::{probe_everywhere, AgentMonitor};
use crate::selector::{AgentSelector, SelectionError};
use crate::statistics::Statistics;
use crate::topology::Topology;
use parking_lot::{Mutex, RwLock};
use sos_proto::{
    Agent, AgentCommand, AgentSide, Client, DatapathId, DecodeError, Decoded, FieldWarning, FlowTuple, Frame, MacAddr,
    PacketStatus, ReturnCode, Route, Server, Session, SessionTunables, TerminationStats,
    TransferStats, TransportProtocol, WhitelistEntry,
};
use sos_router::{RouteSynthesizer, SwitchProgrammer};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Whether other packet handlers should still see a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVerdict {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    enabled: bool,
    tunables: SessionTunables,
}

pub struct SosController {
    controller_mac: MacAddr,
    settings: RwLock<Settings>,
    agents: AgentRegistry,
    connections: ConnectionRegistry,
    statistics: Statistics,
    selector: AgentSelector,
    synthesizer: RouteSynthesizer,
    topology: Arc<dyn Topology>,
    switches: Arc<dyn SwitchProgrammer>,
    monitor: AgentMonitor,
    admission: Mutex<()>,
}

impl SosController {
    pub fn new(
        config: ControllerConfig,
        topology: Arc<dyn Topology>,
        switches: Arc<dyn SwitchProgrammer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let controller_mac = config
            .controller_mac
            .ok_or(ConfigError::MissingControllerMac)?;

        let agents = AgentRegistry::new();
        let synthesizer =
            RouteSynthesizer::new(switches.clone(), config.strategy, config.rewrite_mac);

        info!(
            connection_history_size = config.connection_history_size,
            buffer_size = config.buffer_size,
            queue_capacity = config.queue_capacity,
            parallel_tcp_sockets = config.parallel_tcp_sockets,
            flow_timeout = config.flow_timeout,
            enabled = config.enabled,
            strategy = %config.strategy,
            "Initial configuration"
        );

        Ok(Self {
            controller_mac,
            settings: RwLock::new(Settings {
                enabled: config.enabled,
                tunables: config.tunables(),
            }),
            selector: AgentSelector::new(
                topology.clone(),
                agents.clone(),
                config.latency_difference_threshold,
            ),
            agents,
            connections: ConnectionRegistry::new(),
            statistics: Statistics::new(config.connection_history_size),
            synthesizer,
            topology,
            switches,
            monitor: AgentMonitor::new(config.monitor_initial_delay(), config.monitor_interval()),
            admission: Mutex::new(()),
        })
    }

    /// Handle a packet that arrived on `in_port` of `switch` with no
    /// matching flow
    pub fn handle_packet(&self, switch: DatapathId, in_port: u16, frame: &Frame) -> PacketVerdict {
        if !self.is_enabled() {
            trace!("Disabled, passing packet on");
            return PacketVerdict::Continue;
        }
        if !frame.is_ipv4() {
            return PacketVerdict::Continue;
        }

        let flow = match frame.flow() {
            Ok(flow) => flow,
            Err(e) => {
                trace!(switch = %switch, in_port, error = %e, "Ignoring malformed IPv4 packet");
                return PacketVerdict::Continue;
            }
        };

        match flow.protocol {
            TransportProtocol::Tcp => {
                debug!(switch = %switch, in_port, src = %flow.src_ip, dst = %flow.dst_ip, "Got TCP packet");
                self.handle_tcp(switch, frame, &flow)
            }
            TransportProtocol::Udp => self.handle_udp(frame, &flow),
            TransportProtocol::Other(_) => PacketVerdict::Continue,
        }
    }

    fn handle_tcp(&self, switch: DatapathId, frame: &Frame, flow: &FlowTuple) -> PacketVerdict {
        let _admission = self.admission.lock();
        let status =
            self.connections
                .classify(flow.src_ip, flow.dst_ip, flow.src_port, flow.dst_port);

        let result = match status {
            PacketStatus::InactiveRegistered => {
                info!(
                    client = %SocketAddrV4::new(flow.src_ip, flow.src_port),
                    server = %SocketAddrV4::new(flow.dst_ip, flow.dst_port),
                    "Whitelisted connection, admitting transfer"
                );
                self.admit(switch, frame, flow)
            }
            PacketStatus::ActiveServerSideAgentToServer => self.finalize(frame, flow),
            PacketStatus::InactiveUnregistered => {
                debug!("Unregistered TCP packet, passing it on");
                return PacketVerdict::Continue;
            }
            other => {
                error!(
                    status = ?other,
                    src = %SocketAddrV4::new(flow.src_ip, flow.src_port),
                    dst = %SocketAddrV4::new(flow.dst_ip, flow.dst_port),
                    "Packet of an ongoing transfer reached the controller"
                );
                return PacketVerdict::Stop;
            }
        };

        if let Err(e) = result {
            error!(error = %e, "Failed to handle TCP packet");
        }
        PacketVerdict::Stop
    }

    fn admit(&self, switch: DatapathId, frame: &Frame, flow: &FlowTuple) -> Result<(), ControlError> {
        let Some(src_device) = self.topology.find_device(flow.src_ip) else {
            error!(src = %flow.src_ip, "Source device is not known to the network");
            return Ok(());
        };
        let Some(dst_device) = self.topology.find_device(flow.dst_ip) else {
            warn!(dst = %flow.dst_ip, "Destination device is not known, ARPing for it");
            let probe = Frame::arp_request(frame.eth_src(), flow.src_ip, flow.dst_ip);
            self.switches.flood(switch, &probe)?;
            return Ok(());
        };

        let client = Client::new(flow.src_ip, flow.src_port).with_mac(src_device.mac);
        let server = Server::new(flow.dst_ip, flow.dst_port).with_mac(dst_device.mac);

        let client_side = match self
            .selector
            .select_agent(client.ip, &src_device.attachment_points, None)
        {
            Ok(selection) => selection,
            Err(e) => {
                self.probe_lost_agents(&e);
                return Ok(());
            }
        };
        let server_side = match self.selector.select_agent(
            server.ip,
            &dst_device.attachment_points,
            Some(client_side.agent.ip),
        ) {
            Ok(selection) => selection,
            Err(e) => {
                self.probe_lost_agents(&e);
                return Ok(());
            }
        };
        let inter_agent_path = self
            .selector
            .route_between(&client_side.agent, &server_side.agent)?;

        let client_agent = client_side.agent;
        let server_agent = server_side.agent;
        let session = Session::new(
            Route::new(client.into(), client_agent.clone().into(), client_side.path)?,
            Route::new(
                client_agent.clone().into(),
                server_agent.clone().into(),
                inter_agent_path,
            )?,
            Route::new(server.into(), server_agent.clone().into(), server_side.path)?,
            self.tunables(),
        )?;

        let transfer_id = session.transfer_id();
        self.agents.add_transfer(&client_agent, transfer_id);
        self.agents.add_transfer(&server_agent, transfer_id);
        let shared = self.connections.add_session(session);
        self.statistics.add_active(shared.clone());

        if let Err(e) = self.program(&shared, frame) {
            self.roll_back(&shared);
            return Err(e);
        }
        Ok(())
    }

    /// Tell the agents, install client-side and inter-agent flows and send
    /// the client's packet on to its agent
    fn program(&self, shared: &SharedSession, frame: &Frame) -> Result<(), ControlError> {
        let mut session = shared.lock();
        info!(
            transfer_id = %session.transfer_id(),
            client_route = %session.client_route(),
            inter_agent_route = %session.inter_agent_route(),
            server_route = %session.server_route(),
            "Starting transfer"
        );

        self.send_agent_command(&session, AgentSide::Client)?;
        self.send_agent_command(&session, AgentSide::Server)?;

        let client_route = session.client_route().clone();
        self.synthesizer.push_route(&client_route, &mut session)?;
        let inter_agent_route = session.inter_agent_route().clone();
        self.synthesizer
            .push_route(&inter_agent_route, &mut session)?;

        let agent = session.client_side_agent();
        let mut spark = frame.clone();
        spark.set_eth_dst(agent.mac_or_zero());
        spark.set_ipv4_dst(agent.ip)?;
        spark.set_tcp_dst_port(agent.data_port)?;

        let hop = session.client_route().last_hop();
        debug!(transfer_id = %session.transfer_id(), out = %hop, "Sending spark packet to client-side agent");
        self.switches.send_packet(hop.switch, hop.port, &spark)?;
        Ok(())
    }

    /// Undo a partially programmed admission
    fn roll_back(&self, shared: &SharedSession) {
        let mut session = shared.lock();
        let transfer_id = session.transfer_id();
        for name in session.take_flow_names() {
            if let Err(e) = self.switches.remove_flow(&name) {
                warn!(flow = %name, error = %e, "Failed to remove flow");
            }
        }
        self.agents
            .remove_transfer(session.client_side_agent(), transfer_id);
        self.agents
            .remove_transfer(session.server_side_agent(), transfer_id);
        drop(session);

        self.connections.remove_session(transfer_id);
        self.statistics.discard_active(shared);
        warn!(%transfer_id, "Rolled back transfer");
    }

    fn send_agent_command(&self, session: &Session, side: AgentSide) -> Result<(), ControlError> {
        let (command, agent, src_ip, hop) = match side {
            AgentSide::Client => (
                AgentCommand::for_client_agent(session),
                session.client_side_agent(),
                session.server_side_agent().ip,
                session.client_route().last_hop(),
            ),
            AgentSide::Server => (
                AgentCommand::for_server_agent(session),
                session.server_side_agent(),
                session.server().ip,
                session.server_route().last_hop(),
            ),
        };

        let datagram = Frame::udp(
            self.controller_mac,
            agent.mac_or_zero(),
            SocketAddrV4::new(src_ip, session.server().tcp_port),
            SocketAddrV4::new(agent.ip, agent.control_port),
            &command.encode(),
        );
        debug!(agent = %agent.ip, %command, "Sending transfer setup to agent");
        self.switches.send_packet(hop.switch, hop.port, &datagram)?;
        Ok(())
    }

    /// The server-side agent is connecting to the server: learn its port,
    /// install the server-side flows and send its packet on to the server
    fn finalize(&self, frame: &Frame, flow: &FlowTuple) -> Result<(), ControlError> {
        let Some(shared) = self
            .connections
            .find_server_side(flow.src_ip, flow.dst_ip, flow.dst_port)
        else {
            error!(
                agent = %flow.src_ip,
                server = %SocketAddrV4::new(flow.dst_ip, flow.dst_port),
                "No transfer waiting for a server-side agent port"
            );
            return Ok(());
        };

        let mut session = shared.lock();
        if let Some(learned) = session.server_agent_port() {
            error!(
                transfer_id = %session.transfer_id(),
                learned,
                seen = flow.src_port,
                "Server-side flows already installed"
            );
            return Ok(());
        }

        session.set_server_agent_port(flow.src_port);
        info!(transfer_id = %session.transfer_id(), agent_port = flow.src_port, "Finalizing transfer");

        let server_route = session.server_route().clone();
        self.synthesizer.push_route(&server_route, &mut session)?;

        let client = session.client();
        let mut spark = frame.clone();
        if let Some(mac) = client.mac {
            spark.set_eth_src(mac);
        }
        spark.set_ipv4_src(client.ip)?;
        spark.set_tcp_src_port(flow.src_port)?;

        let hop = session.server_route().first_hop();
        debug!(transfer_id = %session.transfer_id(), out = %hop, "Sending spark packet to server");
        self.switches.send_packet(hop.switch, hop.port, &spark)?;
        Ok(())
    }

    fn probe_lost_agents(&self, cause: &SelectionError) {
        warn!(error = %cause, "Could not route to an agent");
        for agent in self.agents.agents() {
            warn!(agent = %agent, "Possibly lost agent, ARPing for it everywhere");
            probe_everywhere(agent.ip, self.switches.as_ref());
        }
    }

    fn handle_udp(&self, frame: &Frame, flow: &FlowTuple) -> PacketVerdict {
        if let Some(agent) = self
            .agents
            .find_by_ip(flow.src_ip, |a| a.feedback_port == flow.dst_port)
        {
            match decode_report(frame, TerminationStats::from_slice) {
                Ok(stats) => {
                    log_warnings(&agent, &stats.warnings);
                    self.handle_termination(&agent, stats.value);
                }
                Err(e) => warn!(agent = %agent.ip, error = %e, "Unreadable termination report"),
            }
            return PacketVerdict::Stop;
        }

        if let Some(agent) = self
            .agents
            .find_by_ip(flow.src_ip, |a| a.stats_port == flow.dst_port)
        {
            match decode_report(frame, TransferStats::from_slice) {
                Ok(stats) => {
                    log_warnings(&agent, &stats.warnings);
                    self.handle_transfer_stats(&agent, stats.value);
                }
                Err(e) => warn!(agent = %agent.ip, error = %e, "Unreadable transfer stats"),
            }
            return PacketVerdict::Stop;
        }

        PacketVerdict::Continue
    }

    fn handle_termination(&self, reporter: &Agent, stats: TerminationStats) {
        let transfer_id = stats.transfer_id;
        debug!(agent = %reporter.ip, %transfer_id, side = %stats.side, "Got termination report");

        let Some(shared) = self.connections.get(transfer_id) else {
            error!(%transfer_id, "Termination report for an unknown transfer");
            return;
        };

        let mut session = shared.lock();
        let client_agent = session.client_side_agent().clone();
        let server_agent = session.server_side_agent().clone();
        let client_serving = self.agents.is_serving(&client_agent, transfer_id);
        let server_serving = self.agents.is_serving(&server_agent, transfer_id);

        if client_serving && client_agent.ip == reporter.ip && stats.is_client_side() {
            info!(agent = %client_agent.ip, %transfer_id, "Client-side agent finished");
            self.agents.remove_transfer(&client_agent, transfer_id);
        } else if server_serving && server_agent.ip == reporter.ip && !stats.is_client_side() {
            info!(agent = %server_agent.ip, %transfer_id, "Server-side agent finished");
            self.agents.remove_transfer(&server_agent, transfer_id);
        } else if !client_serving && !server_serving {
            error!(%transfer_id, "Termination report for a transfer both agents already finished");
            return;
        } else {
            error!(
                %transfer_id,
                agent = %reporter.ip,
                side = %stats.side,
                "Inconsistent state handling termination report"
            );
            return;
        }

        // only the sending direction reports usable counters
        if stats.has_sent_data() {
            debug!(%transfer_id, side = %stats.side, "Recording termination stats");
            session.set_termination_stats(stats);
        }

        if self.agents.is_serving(&client_agent, transfer_id)
            || self.agents.is_serving(&server_agent, transfer_id)
        {
            return;
        }

        let flow_names = session.flow_names().clone();
        for name in &flow_names {
            trace!(flow = %name, "Removing flow");
            if let Err(e) = self.switches.remove_flow(name) {
                warn!(flow = %name, error = %e, "Failed to remove flow");
            }
        }
        session.mark_stopped();
        drop(session);

        self.connections.remove_session(transfer_id);
        if !self.statistics.retire(&shared) {
            warn!(%transfer_id, "Terminated transfer was no longer in the active statistics");
        }
        info!(%transfer_id, flows = flow_names.len(), "Both agents finished, transfer terminated");
    }

    fn handle_transfer_stats(&self, reporter: &Agent, stats: TransferStats) {
        let transfer_id = stats.transfer_id;
        let Some(shared) = self.connections.get(transfer_id) else {
            error!(%transfer_id, "Transfer stats for an unknown transfer");
            return;
        };

        let mut session = shared.lock();
        let agent = if stats.is_client_side() {
            session.client_side_agent().clone()
        } else {
            session.server_side_agent().clone()
        };

        if agent.ip == reporter.ip && self.agents.is_serving(&agent, transfer_id) {
            trace!(%transfer_id, side = %stats.side, collection_time = stats.collection_time, "Recording transfer stats");
            session.update_transfer_stats(stats);
        } else {
            debug!(%transfer_id, agent = %reporter.ip, "Ignoring transfer stats from an agent not serving the transfer");
        }
    }

    fn tunables(&self) -> SessionTunables {
        self.settings.read().tunables
    }

    fn update_tunables(&self, f: impl FnOnce(&mut SessionTunables)) -> ReturnCode {
        let _admission = self.admission.lock();
        f(&mut self.settings.write().tunables);
        ReturnCode::ConfigSet
    }

    pub fn add_agent(&self, agent: Agent) -> ReturnCode {
        let _admission = self.admission.lock();
        let ip = agent.ip;
        if self.agents.register(agent).is_err() {
            return ReturnCode::ErrDuplicateAgent;
        }

        probe_everywhere(ip, self.switches.as_ref());
        if self.monitor.start(
            self.agents.clone(),
            self.topology.clone(),
            self.switches.clone(),
        ) {
            info!("Agent monitor started");
        }
        ReturnCode::AgentAdded
    }

    pub fn remove_agent(&self, agent: &Agent) -> ReturnCode {
        let _admission = self.admission.lock();
        match self.agents.unregister(agent) {
            Ok(_) => ReturnCode::AgentRemoved,
            Err(_) => ReturnCode::ErrUnknownAgent,
        }
    }

    pub fn agents(&self) -> Vec<RegisteredAgent> {
        self.agents.list()
    }

    pub fn agent_ip_set(&self) -> BTreeSet<Ipv4Addr> {
        self.agents.ip_set()
    }

    pub fn add_whitelist_entry(&self, entry: WhitelistEntry) -> ReturnCode {
        let _admission = self.admission.lock();
        self.connections.add_whitelist_entry(entry)
    }

    pub fn remove_whitelist_entry(&self, entry: &WhitelistEntry) -> ReturnCode {
        let _admission = self.admission.lock();
        self.connections.remove_whitelist_entry(entry)
    }

    pub fn whitelist(&self) -> Vec<WhitelistEntry> {
        self.connections.whitelist()
    }

    pub fn enable(&self) -> ReturnCode {
        let _admission = self.admission.lock();
        self.settings.write().enabled = true;
        warn!("Enabled");
        ReturnCode::Enabled
    }

    pub fn disable(&self) -> ReturnCode {
        let _admission = self.admission.lock();
        self.settings.write().enabled = false;
        warn!("Disabled");
        ReturnCode::Disabled
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.read().enabled
    }

    /// Only the idle timeout is configurable; flows never expire on a hard
    /// timeout. Negative values are ignored.
    pub fn set_flow_timeouts(&self, hard_seconds: i32, idle_seconds: i32) -> ReturnCode {
        if idle_seconds < 0 {
            return ReturnCode::ConfigSet;
        }
        let idle = u16::try_from(idle_seconds).unwrap_or(u16::MAX);
        warn!(idle, ignored_hard = hard_seconds, "Set flow idle timeout");
        self.update_tunables(|t| t.flow_timeout = idle)
    }

    pub fn flow_idle_timeout(&self) -> u16 {
        self.tunables().flow_timeout
    }

    pub fn flow_hard_timeout(&self) -> u16 {
        0
    }

    pub fn set_parallel_connections(&self, count: u32) -> ReturnCode {
        warn!(count, "Set number of parallel connections");
        self.update_tunables(|t| t.parallel_sockets = count)
    }

    pub fn parallel_connections(&self) -> u32 {
        self.tunables().parallel_sockets
    }

    pub fn set_buffer_size(&self, bytes: u32) -> ReturnCode {
        warn!(bytes, "Set buffer size");
        self.update_tunables(|t| t.buffer_size = bytes)
    }

    pub fn buffer_size(&self) -> u32 {
        self.tunables().buffer_size
    }

    pub fn set_queue_capacity(&self, packets: u32) -> ReturnCode {
        warn!(packets, "Set queue capacity");
        self.update_tunables(|t| t.queue_capacity = packets)
    }

    pub fn queue_capacity(&self) -> u32 {
        self.tunables().queue_capacity
    }

    pub fn active_sessions(&self) -> Vec<Session> {
        self.statistics.active()
    }

    pub fn terminated_sessions(&self) -> Vec<Session> {
        self.statistics.terminated()
    }

    /// Current state of a transfer still in progress
    pub fn session(&self, transfer_id: Uuid) -> Option<Session> {
        self.connections
            .get(transfer_id)
            .map(|s| s.lock().clone())
    }

    pub fn clear_statistics(&self) -> ReturnCode {
        let _admission = self.admission.lock();
        self.statistics.clear();
        ReturnCode::StatsCleared
    }

    /// Ready when at least two agents are idle
    pub fn ready(&self) -> ReturnCode {
        if self.agents.idle_count() > 1 {
            ReturnCode::Ready
        } else {
            ReturnCode::NotReady
        }
    }

    pub fn strategy(&self) -> &'static str {
        self.synthesizer.access_strategy()
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor.is_running()
    }

    pub fn shutdown(&self) {
        self.monitor.stop();
        info!(
            active_transfers = self.connections.session_count(),
            "Controller shut down"
        );
    }
}

fn decode_report<T>(
    frame: &Frame,
    decode: fn(&[u8]) -> Result<Decoded<T>, DecodeError>,
) -> Result<Decoded<T>, ControlError> {
    Ok(decode(frame.udp_payload()?)?)
}

fn log_warnings(agent: &Agent, warnings: &[FieldWarning]) {
    for warning in warnings {
        warn!(agent = %agent.ip, %warning, "Malformed report field");
    }
}
