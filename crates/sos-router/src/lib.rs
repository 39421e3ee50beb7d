//! Flow synthesis for accelerated transfers
//!
//! Turns the three routes of a session into flow table entries. Agent-to-agent
//! routes are always handled by [`InterAgentStrategy`]; client and server
//! routes use one access strategy chosen per deployment:
//!
//! - [`SingleHopStrategy`]: every switch can rewrite L2/L3/L4
//! - [`FirstHopLastHopStrategy`]: only the switch next to the agent rewrites L3/L4

pub mod first_hop_last_hop;
pub mod flow;
pub mod inter_agent;
pub mod single_hop;
pub mod strategy;
pub mod switch;

pub use first_hop_last_hop::FirstHopLastHopStrategy;
pub use flow::{FlowAction, FlowMatch, FlowSpec};
pub use inter_agent::InterAgentStrategy;
pub use single_hop::SingleHopStrategy;
pub use strategy::{RoutingStrategy, SynthesisError};
pub use switch::{RecordingSwitch, SentPacket, SwitchError, SwitchProgrammer};

use serde::{Deserialize, Serialize};
use sos_proto::{Route, RouteType, Session};
use std::fmt;
use std::sync::Arc;

/// Which access strategy a deployment uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    SingleHop,
    FirstHopLastHop,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::SingleHop => write!(f, "single_hop"),
            StrategyKind::FirstHopLastHop => write!(f, "first_hop_last_hop"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "single_hop" => Ok(StrategyKind::SingleHop),
            "first_hop_last_hop" => Ok(StrategyKind::FirstHopLastHop),
            other => Err(format!("Unknown routing strategy: {}", other)),
        }
    }
}

/// Pushes each route of a session with the strategy its type calls for
pub struct RouteSynthesizer {
    access: Box<dyn RoutingStrategy>,
    inter_agent: InterAgentStrategy,
}

impl RouteSynthesizer {
    pub fn new(switches: Arc<dyn SwitchProgrammer>, kind: StrategyKind, rewrite_mac: bool) -> Self {
        let access: Box<dyn RoutingStrategy> = match kind {
            StrategyKind::SingleHop => {
                Box::new(SingleHopStrategy::new(switches.clone(), rewrite_mac))
            }
            StrategyKind::FirstHopLastHop => {
                Box::new(FirstHopLastHopStrategy::new(switches.clone()))
            }
        };

        Self {
            access,
            inter_agent: InterAgentStrategy::new(switches),
        }
    }

    pub fn access_strategy(&self) -> &'static str {
        self.access.name()
    }

    pub fn push_route(&self, route: &Route, session: &mut Session) -> Result<(), SynthesisError> {
        match route.route_type() {
            RouteType::ClientToAgent | RouteType::ServerToAgent => {
                self.access.push_route(route, session)
            }
            RouteType::AgentToAgent => self.inter_agent.push_route(route, session),
        }
    }
}
