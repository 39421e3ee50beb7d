//! Active sessions and whitelist, and packet classification over both

use parking_lot::{Mutex, RwLock};
use sos_proto::{PacketStatus, ReturnCode, Session, WhitelistEntry};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, trace, warn};
use uuid::Uuid;

/// A session shared between the registry, the statistics and packet handling
pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<Vec<SharedSession>>,
    whitelist: RwLock<Vec<WhitelistEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, session: Session) -> SharedSession {
        info!(transfer_id = %session.transfer_id(), "Added session");
        let shared = Arc::new(Mutex::new(session));
        self.sessions.write().push(shared.clone());
        shared
    }

    pub fn remove_session(&self, transfer_id: Uuid) -> Option<SharedSession> {
        let mut sessions = self.sessions.write();
        let index = sessions
            .iter()
            .position(|s| s.lock().transfer_id() == transfer_id)?;
        Some(sessions.remove(index))
    }

    pub fn get(&self, transfer_id: Uuid) -> Option<SharedSession> {
        self.sessions
            .read()
            .iter()
            .find(|s| s.lock().transfer_id() == transfer_id)
            .cloned()
    }

    /// The session whose server-side agent at `src_ip` is connecting to the
    /// server at `dst_ip:dst_port`
    ///
    /// Sessions still waiting to learn the agent's port are preferred.
    pub fn find_server_side(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Option<SharedSession> {
        let sessions = self.sessions.read();
        let candidates: Vec<&SharedSession> = sessions
            .iter()
            .filter(|s| {
                let session = s.lock();
                let server = session.server();
                server.ip == dst_ip
                    && server.tcp_port == dst_port
                    && session.server_side_agent().ip == src_ip
            })
            .collect();

        candidates
            .iter()
            .find(|s| s.lock().server_agent_port().is_none())
            .or_else(|| candidates.first())
            .map(|s| Arc::clone(s))
    }

    pub fn sessions(&self) -> Vec<SharedSession> {
        self.sessions.read().clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn add_whitelist_entry(&self, entry: WhitelistEntry) -> ReturnCode {
        let mut whitelist = self.whitelist.write();
        if whitelist.contains(&entry) {
            warn!(entry = %entry, "Whitelist entry already present");
            return ReturnCode::ErrDuplicateWhitelistEntry;
        }

        info!(entry = %entry, "Whitelist entry added");
        whitelist.push(entry);
        ReturnCode::WhitelistEntryAdded
    }

    pub fn remove_whitelist_entry(&self, entry: &WhitelistEntry) -> ReturnCode {
        let mut whitelist = self.whitelist.write();
        match whitelist.iter().position(|e| e == entry) {
            Some(index) => {
                whitelist.remove(index);
                info!(entry = %entry, "Whitelist entry removed");
                ReturnCode::WhitelistEntryRemoved
            }
            None => {
                warn!(entry = %entry, "Whitelist entry not found");
                ReturnCode::ErrUnknownWhitelistEntry
            }
        }
    }

    pub fn whitelist(&self) -> Vec<WhitelistEntry> {
        self.whitelist.read().clone()
    }

    /// Role of a TCP packet: part of a session, whitelisted, or neither
    ///
    /// Sessions are checked in the order they were admitted.
    pub fn classify(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> PacketStatus {
        let active = self.sessions.read().iter().find_map(|s| {
            s.lock()
                .classify(src_ip, dst_ip, src_port, dst_port)
        });

        let status = match active {
            Some(status) => status,
            None if self
                .whitelist
                .read()
                .iter()
                .any(|e| e.matches(src_ip, dst_ip, dst_port)) =>
            {
                PacketStatus::InactiveRegistered
            }
            None => PacketStatus::InactiveUnregistered,
        };

        trace!(%src_ip, src_port, %dst_ip, dst_port, ?status, "Classified packet");
        status
    }
}
