//! Access to the switches: flow installation and packet output
//!
//! [`SwitchProgrammer`] is implemented by whatever drives the real switches.
//! [`RecordingSwitch`] keeps everything in memory; it backs dry runs and
//! lets tests push frames through the installed flow tables.

use crate::flow::FlowSpec;
use dashmap::DashMap;
use parking_lot::Mutex;
use sos_proto::{DatapathId, Frame};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchError {
    #[error("Unknown switch: {0}")]
    UnknownSwitch(DatapathId),

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    #[error("Switch {switch} rejected the request: {reason}")]
    Rejected { switch: DatapathId, reason: String },
}

/// Operations the controller needs from the switches
pub trait SwitchProgrammer: Send + Sync {
    /// Install (or replace) a named flow
    fn install_flow(&self, flow: FlowSpec) -> Result<(), SwitchError>;

    /// Remove a flow previously installed under `name`
    fn remove_flow(&self, name: &str) -> Result<(), SwitchError>;

    /// Emit a frame out of `port` on `switch`
    fn send_packet(&self, switch: DatapathId, port: u16, frame: &Frame) -> Result<(), SwitchError>;

    /// Emit a frame out of every edge port of `switch`
    fn flood(&self, switch: DatapathId, frame: &Frame) -> Result<(), SwitchError>;

    /// All switches currently connected
    fn switches(&self) -> Vec<DatapathId>;
}

/// A frame handed to [`SwitchProgrammer::send_packet`] or [`SwitchProgrammer::flood`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub switch: DatapathId,
    /// `None` when flooded
    pub port: Option<u16>,
    pub frame: Frame,
}

/// In-memory flow tables for a fixed set of switches
#[derive(Debug, Clone)]
pub struct RecordingSwitch {
    switches: Arc<BTreeSet<DatapathId>>,
    flows: Arc<DashMap<String, FlowSpec>>,
    removed: Arc<Mutex<Vec<String>>>,
    sent: Arc<Mutex<Vec<SentPacket>>>,
}

impl RecordingSwitch {
    pub fn new(switches: impl IntoIterator<Item = DatapathId>) -> Self {
        Self {
            switches: Arc::new(switches.into_iter().collect()),
            flows: Arc::new(DashMap::new()),
            removed: Arc::new(Mutex::new(Vec::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn check_switch(&self, switch: DatapathId) -> Result<(), SwitchError> {
        if self.switches.contains(&switch) {
            Ok(())
        } else {
            Err(SwitchError::UnknownSwitch(switch))
        }
    }

    pub fn flow(&self, name: &str) -> Option<FlowSpec> {
        self.flows.get(name).map(|f| f.value().clone())
    }

    /// Installed flows, ordered by name
    pub fn flows(&self) -> Vec<FlowSpec> {
        let mut flows: Vec<FlowSpec> = self.flows.iter().map(|f| f.value().clone()).collect();
        flows.sort_by(|a, b| a.name.cmp(&b.name));
        flows
    }

    pub fn flows_on(&self, switch: DatapathId) -> Vec<FlowSpec> {
        self.flows()
            .into_iter()
            .filter(|f| f.switch == switch)
            .collect()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Names passed to `remove_flow`, in call order
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub fn sent(&self) -> Vec<SentPacket> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Look the frame up in `switch`'s table as if it arrived on `in_port`
    ///
    /// Returns the egress port and the rewritten frame of the highest-priority
    /// matching flow, or `None` on a table miss.
    pub fn forward(&self, switch: DatapathId, in_port: u16, frame: &Frame) -> Option<(u16, Frame)> {
        let hit = self
            .flows
            .iter()
            .filter(|f| f.switch == switch && f.matcher.matches(in_port, frame))
            .max_by_key(|f| f.priority)
            .map(|f| f.value().clone())?;

        trace!(flow = %hit.name, switch = %switch, in_port, "Table hit");
        hit.apply(frame).ok().flatten()
    }
}

impl SwitchProgrammer for RecordingSwitch {
    fn install_flow(&self, flow: FlowSpec) -> Result<(), SwitchError> {
        self.check_switch(flow.switch)?;
        debug!(flow = %flow, "Installed flow");
        self.flows.insert(flow.name.clone(), flow);
        Ok(())
    }

    fn remove_flow(&self, name: &str) -> Result<(), SwitchError> {
        self.removed.lock().push(name.to_string());
        match self.flows.remove(name) {
            Some(_) => {
                debug!(flow = %name, "Removed flow");
                Ok(())
            }
            None => Err(SwitchError::UnknownFlow(name.to_string())),
        }
    }

    fn send_packet(&self, switch: DatapathId, port: u16, frame: &Frame) -> Result<(), SwitchError> {
        self.check_switch(switch)?;
        debug!(switch = %switch, port, len = frame.as_bytes().len(), "Packet out");
        self.sent.lock().push(SentPacket {
            switch,
            port: Some(port),
            frame: frame.clone(),
        });
        Ok(())
    }

    fn flood(&self, switch: DatapathId, frame: &Frame) -> Result<(), SwitchError> {
        self.check_switch(switch)?;
        trace!(switch = %switch, len = frame.as_bytes().len(), "Packet flooded");
        self.sent.lock().push(SentPacket {
            switch,
            port: None,
            frame: frame.clone(),
        });
        Ok(())
    }

    fn switches(&self) -> Vec<DatapathId> {
        self.switches.iter().copied().collect()
    }
}
