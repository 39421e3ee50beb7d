//! Data model shared by the SOS controller crates
//!
//! Devices, routes, whitelist entries and sessions, the reports agents send
//! back, the control messages sent to them, and a small raw-frame codec for
//! the packets the controller inspects and emits.

pub mod device;
pub mod messages;
pub mod route;
pub mod session;
pub mod stats;
pub mod status;
pub mod whitelist;
pub mod wire;

pub use device::{Agent, Client, DatapathId, Device, DeviceKind, MacAddr, NodePort, Server};
pub use messages::{AgentCommand, MessageError, TransferParams};
pub use route::{Hop, Route, RouteError, RouteType};
pub use session::{Session, SessionError, SessionTunables};
pub use stats::{
    AgentSide, DecodeError, Decoded, FieldWarning, TerminationStats, ThroughputTuple,
    TransferStats,
};
pub use status::{PacketStatus, ReturnCode};
pub use whitelist::WhitelistEntry;
pub use wire::{FlowTuple, Frame, FrameError, TransportProtocol};

/// Priority of every flow installed for a transfer
pub const FLOW_PRIORITY: u16 = 32767;
