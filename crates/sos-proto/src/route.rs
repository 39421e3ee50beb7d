//! Typed paths between two devices

use crate::device::{Agent, Device, DeviceKind, NodePort};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Route construction errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("Route path is empty")]
    EmptyPath,

    #[error("Route source and destination are the same device: {0}")]
    SameEndpoints(String),

    #[error("Invalid route endpoints: {src} to {dst}")]
    InvalidEndpoints { src: DeviceKind, dst: DeviceKind },
}

/// The three kinds of route a transfer is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    ClientToAgent,
    AgentToAgent,
    ServerToAgent,
}

impl RouteType {
    /// Infer the route type from its endpoints
    pub fn infer(src: &Device, dst: &Device) -> Result<Self, RouteError> {
        match (src, dst) {
            (Device::Client(_), Device::Agent(_)) => Ok(RouteType::ClientToAgent),
            (Device::Agent(_), Device::Agent(_)) => Ok(RouteType::AgentToAgent),
            (Device::Server(_), Device::Agent(_)) => Ok(RouteType::ServerToAgent),
            _ => Err(RouteError::InvalidEndpoints {
                src: src.kind(),
                dst: dst.kind(),
            }),
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteType::ClientToAgent => write!(f, "client-to-agent"),
            RouteType::AgentToAgent => write!(f, "agent-to-agent"),
            RouteType::ServerToAgent => write!(f, "server-to-agent"),
        }
    }
}

/// One switch traversal: the port a packet enters on and the port it leaves by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop {
    pub ingress: NodePort,
    pub egress: NodePort,
}

/// A path from `src` to `dst`
///
/// The path alternates ingress and egress ports, one pair per switch,
/// starting at the source's attachment point and ending at the
/// destination's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    src: Device,
    dst: Device,
    route_type: RouteType,
    path: Vec<NodePort>,
}

impl Route {
    pub fn new(src: Device, dst: Device, path: Vec<NodePort>) -> Result<Self, RouteError> {
        if path.is_empty() {
            return Err(RouteError::EmptyPath);
        }
        if src == dst {
            return Err(RouteError::SameEndpoints(src.to_string()));
        }
        let route_type = RouteType::infer(&src, &dst)?;

        Ok(Self {
            src,
            dst,
            route_type,
            path,
        })
    }

    pub fn src(&self) -> &Device {
        &self.src
    }

    pub fn dst(&self) -> &Device {
        &self.dst
    }

    pub fn route_type(&self) -> RouteType {
        self.route_type
    }

    pub fn path(&self) -> &[NodePort] {
        &self.path
    }

    /// Attachment point of the source device
    pub fn first_hop(&self) -> NodePort {
        self.path[0]
    }

    /// Attachment point of the destination device
    pub fn last_hop(&self) -> NodePort {
        self.path[self.path.len() - 1]
    }

    /// The agent this route leads to; every route type ends at one
    pub fn dst_agent(&self) -> Option<&Agent> {
        self.dst.as_agent()
    }

    /// Switch traversals walked from the destination end back to the source
    pub fn hops_from_dst(&self) -> impl Iterator<Item = Hop> + '_ {
        (1..self.path.len()).rev().step_by(2).map(move |index| Hop {
            ingress: self.path[index - 1],
            egress: self.path[index],
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} route {} -> {} via", self.route_type, self.src, self.dst)?;
        for np in &self.path {
            write!(f, " {}", np)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Client, DatapathId, Server};
    use std::net::Ipv4Addr;

    fn agent(last: u8) -> Device {
        Agent::new(Ipv4Addr::new(10, 0, 0, last), 9877, 9878, 9998, 9999).into()
    }

    fn client() -> Device {
        Client::new(Ipv4Addr::new(10, 0, 0, 9), 51000).into()
    }

    fn path(len: usize) -> Vec<NodePort> {
        (0..len)
            .map(|i| NodePort::new(DatapathId(1 + i as u64 / 2), 1 + i as u16))
            .collect()
    }

    #[test]
    fn test_route_type_inference() {
        let server: Device = Server::new(Ipv4Addr::new(10, 0, 0, 5), 80).into();

        assert_eq!(
            Route::new(client(), agent(1), path(2)).unwrap().route_type(),
            RouteType::ClientToAgent
        );
        assert_eq!(
            Route::new(agent(1), agent(2), path(2)).unwrap().route_type(),
            RouteType::AgentToAgent
        );
        assert_eq!(
            Route::new(server, agent(2), path(2)).unwrap().route_type(),
            RouteType::ServerToAgent
        );
    }

    #[test]
    fn test_invalid_endpoints_rejected() {
        let err = Route::new(agent(1), client(), path(2)).unwrap_err();
        assert_eq!(
            err,
            RouteError::InvalidEndpoints {
                src: DeviceKind::Agent,
                dst: DeviceKind::Client
            }
        );
    }

    #[test]
    fn test_empty_path_rejected() {
        assert_eq!(
            Route::new(client(), agent(1), vec![]).unwrap_err(),
            RouteError::EmptyPath
        );
    }

    #[test]
    fn test_same_endpoints_rejected() {
        assert!(matches!(
            Route::new(agent(1), agent(1), path(2)),
            Err(RouteError::SameEndpoints(_))
        ));
    }

    #[test]
    fn test_first_and_last_hop() {
        let route = Route::new(client(), agent(1), path(4)).unwrap();
        assert_eq!(route.first_hop(), path(4)[0]);
        assert_eq!(route.last_hop(), path(4)[3]);
    }

    #[test]
    fn test_hops_walk_backwards_in_pairs() {
        let p = path(6);
        let route = Route::new(client(), agent(1), p.clone()).unwrap();
        let hops: Vec<Hop> = route.hops_from_dst().collect();

        assert_eq!(hops.len(), 3);
        assert_eq!(hops[0].ingress, p[4]);
        assert_eq!(hops[0].egress, p[5]);
        assert_eq!(hops[2].ingress, p[0]);
        assert_eq!(hops[2].egress, p[1]);
    }
}
