//! Active sessions and a bounded history of retired ones, for operators

use crate::connection_registry::SharedSession;
use parking_lot::Mutex;
use sos_proto::Session;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
pub struct Statistics {
    active: Mutex<Vec<SharedSession>>,
    terminated: Mutex<VecDeque<Session>>,
    history_size: usize,
}

impl Statistics {
    pub fn new(history_size: usize) -> Self {
        Self {
            active: Mutex::new(Vec::new()),
            terminated: Mutex::new(VecDeque::with_capacity(history_size)),
            history_size,
        }
    }

    pub fn add_active(&self, session: SharedSession) {
        self.active.lock().push(session);
    }

    /// Drop a session from the active set without recording it as terminated
    pub fn discard_active(&self, session: &SharedSession) -> bool {
        let mut active = self.active.lock();
        let before = active.len();
        active.retain(|s| !Arc::ptr_eq(s, session));
        active.len() != before
    }

    /// Move a session to the terminated history, evicting the oldest entry
    /// when full
    ///
    /// Returns whether the session was still in the active set; it is
    /// recorded as terminated either way. The session must not be locked by
    /// the caller.
    pub fn retire(&self, session: &SharedSession) -> bool {
        let snapshot = session.lock().clone();
        {
            let mut terminated = self.terminated.lock();
            if terminated.len() >= self.history_size {
                terminated.pop_front();
            }
            terminated.push_back(snapshot);
        }
        self.discard_active(session)
    }

    pub fn active(&self) -> Vec<Session> {
        self.active.lock().iter().map(|s| s.lock().clone()).collect()
    }

    /// Retired sessions, oldest first
    pub fn terminated(&self) -> Vec<Session> {
        self.terminated.lock().iter().cloned().collect()
    }

    pub fn history_size(&self) -> usize {
        self.history_size
    }

    pub fn clear(&self) {
        self.active.lock().clear();
        self.terminated.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sos_proto::{Agent, Client, DatapathId, NodePort, Route, Server, SessionTunables};
    use std::net::Ipv4Addr;

    fn np(port: u16) -> NodePort {
        NodePort::new(DatapathId(1), port)
    }

    fn shared_session() -> SharedSession {
        let client_agent = Agent::new(Ipv4Addr::new(10, 0, 0, 1), 9877, 9878, 9998, 9999);
        let server_agent = Agent::new(Ipv4Addr::new(10, 0, 0, 2), 9877, 9878, 9998, 9999);
        let session = Session::new(
            Route::new(
                Client::new(Ipv4Addr::new(10, 0, 0, 9), 51000).into(),
                client_agent.clone().into(),
                vec![np(1), np(2)],
            )
            .unwrap(),
            Route::new(
                client_agent.into(),
                server_agent.clone().into(),
                vec![np(2), np(3)],
            )
            .unwrap(),
            Route::new(
                Server::new(Ipv4Addr::new(10, 0, 0, 5), 80).into(),
                server_agent.into(),
                vec![np(4), np(3)],
            )
            .unwrap(),
            SessionTunables {
                parallel_sockets: 1,
                queue_capacity: 1,
                buffer_size: 1,
                flow_timeout: 0,
            },
        )
        .unwrap();
        Arc::new(Mutex::new(session))
    }

    #[test]
    fn test_retire_moves_to_history() {
        let stats = Statistics::new(10);
        let session = shared_session();
        let id = session.lock().transfer_id();
        stats.add_active(session.clone());

        assert!(stats.retire(&session));
        assert!(stats.active().is_empty());
        let terminated = stats.terminated();
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0].transfer_id(), id);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let stats = Statistics::new(2);
        let sessions: Vec<SharedSession> = (0..3).map(|_| shared_session()).collect();
        for session in &sessions {
            stats.add_active(session.clone());
            stats.retire(session);
        }

        let ids: Vec<_> = stats.terminated().iter().map(|s| s.transfer_id()).collect();
        assert_eq!(
            ids,
            vec![
                sessions[1].lock().transfer_id(),
                sessions[2].lock().transfer_id()
            ]
        );
    }

    #[test]
    fn test_retire_unknown_session_still_recorded() {
        let stats = Statistics::new(2);
        assert!(!stats.retire(&shared_session()));
        assert_eq!(stats.terminated().len(), 1);
    }

    #[test]
    fn test_clear() {
        let stats = Statistics::new(2);
        let session = shared_session();
        stats.add_active(session.clone());
        stats.add_active(shared_session());
        stats.retire(&session);

        stats.clear();
        assert!(stats.active().is_empty());
        assert!(stats.terminated().is_empty());
        assert_eq!(stats.history_size(), 2);
    }
}
