//! Packet classification results and operator-facing return codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a packet plays relative to the known transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketStatus {
    ActiveClientToClientSideAgent,
    ActiveClientSideAgentToClient,
    ActiveClientSideAgentToServerSideAgent,
    ActiveServerSideAgentToClientSideAgent,
    ActiveServerToServerSideAgent,
    ActiveServerSideAgentToServer,
    /// Not part of a transfer yet, but whitelisted for acceleration
    InactiveRegistered,
    InactiveUnregistered,
}

impl PacketStatus {
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            PacketStatus::InactiveRegistered | PacketStatus::InactiveUnregistered
        )
    }
}

/// Outcome of an operator request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnCode {
    WhitelistEntryAdded,
    WhitelistEntryRemoved,
    ErrDuplicateWhitelistEntry,
    ErrUnknownWhitelistEntry,
    AgentAdded,
    AgentRemoved,
    ErrDuplicateAgent,
    ErrUnknownAgent,
    Enabled,
    Disabled,
    ConfigSet,
    Ready,
    NotReady,
    StatsCleared,
}

impl ReturnCode {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ReturnCode::ErrDuplicateWhitelistEntry
                | ReturnCode::ErrUnknownWhitelistEntry
                | ReturnCode::ErrDuplicateAgent
                | ReturnCode::ErrUnknownAgent
        )
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReturnCode::WhitelistEntryAdded => "Whitelist entry added",
            ReturnCode::WhitelistEntryRemoved => "Whitelist entry removed",
            ReturnCode::ErrDuplicateWhitelistEntry => "Whitelist entry already present",
            ReturnCode::ErrUnknownWhitelistEntry => "Whitelist entry not found",
            ReturnCode::AgentAdded => "Agent added",
            ReturnCode::AgentRemoved => "Agent removed",
            ReturnCode::ErrDuplicateAgent => "Agent already present",
            ReturnCode::ErrUnknownAgent => "Agent not found",
            ReturnCode::Enabled => "SOS enabled",
            ReturnCode::Disabled => "SOS disabled",
            ReturnCode::ConfigSet => "Configuration set",
            ReturnCode::Ready => "Ready",
            ReturnCode::NotReady => "Not ready",
            ReturnCode::StatsCleared => "Statistics cleared",
        };
        f.write_str(text)
    }
}
