//! SOS controller core
//!
//! Decides which TCP connections are accelerated, picks the agents that
//! carry them, programs the switches along the way and tracks each transfer
//! until both agents report it finished.
//!
//! # Example
//!
//! ```ignore
//! use sos_control::{ControllerConfig, SosController, StaticTopology};
//! use sos_router::RecordingSwitch;
//!
//! let controller = SosController::new(
//!     ControllerConfig::new(controller_mac),
//!     Arc::new(StaticTopology::new(topology)),
//!     Arc::new(RecordingSwitch::new(switches)),
//! )?;
//! controller.add_agent(agent);
//! let verdict = controller.handle_packet(switch, in_port, &frame);
//! ```

pub mod agent_registry;
pub mod config;
pub mod connection_registry;
pub mod controller;
pub mod error;
pub mod monitor;
pub mod selector;
pub mod statistics;
pub mod topology;

pub use agent_registry::{AgentRegistry, RegisteredAgent, RegistryError};
pub use config::{ConfigError, ControllerConfig};
pub use connection_registry::{ConnectionRegistry, SharedSession};
pub use controller::{PacketVerdict, SosController};
pub use error::ControlError;
pub use monitor::{arp_probe, AgentMonitor};
pub use selector::{select_best, AgentSelection, AgentSelector, BestAgent, SelectionError};
pub use statistics::Statistics;
pub use topology::{DeviceRecord, LinkConfig, StaticTopology, Topology, TopologyConfig};
