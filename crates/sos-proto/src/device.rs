//! Network devices taking part in an accelerated transfer
//!
//! A transfer always involves a client, a server and two agents. Clients and
//! servers are identified by their IPv4 address and TCP port, agents by their
//! IPv4 address and the four UDP/TCP ports they listen on. MAC addresses are
//! learned from the network as the controller goes and never take part in
//! equality or hashing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An Ethernet hardware address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Error returned when a MAC address string is malformed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid MAC address: {0}")]
pub struct ParseMacError(pub String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }

        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ParseMacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

/// OpenFlow datapath identifier of a switch
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatapathId(pub u64);

impl fmt::Display for DatapathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DatapathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A (switch, port) pair; paths are sequences of these
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePort {
    pub switch: DatapathId,
    pub port: u16,
}

impl NodePort {
    pub fn new(switch: DatapathId, port: u16) -> Self {
        Self { switch, port }
    }
}

impl fmt::Display for NodePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.switch, self.port)
    }
}

/// The role a device plays in a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Client,
    Server,
    Agent,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Client => write!(f, "client"),
            DeviceKind::Server => write!(f, "server"),
            DeviceKind::Agent => write!(f, "agent"),
        }
    }
}

/// The host that opened the TCP connection being accelerated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub ip: Ipv4Addr,
    pub tcp_port: u16,
    #[serde(default)]
    pub mac: Option<MacAddr>,
}

impl Client {
    pub fn new(ip: Ipv4Addr, tcp_port: u16) -> Self {
        Self {
            ip,
            tcp_port,
            mac: None,
        }
    }

    pub fn with_mac(mut self, mac: MacAddr) -> Self {
        self.mac = Some(mac);
        self
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.tcp_port == other.tcp_port
    }
}

impl Eq for Client {}

impl Hash for Client {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.tcp_port.hash(state);
    }
}

/// The host accepting the TCP connection being accelerated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub ip: Ipv4Addr,
    pub tcp_port: u16,
    #[serde(default)]
    pub mac: Option<MacAddr>,
}

impl Server {
    pub fn new(ip: Ipv4Addr, tcp_port: u16) -> Self {
        Self {
            ip,
            tcp_port,
            mac: None,
        }
    }

    pub fn with_mac(mut self, mac: MacAddr) -> Self {
        self.mac = Some(mac);
        self
    }
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.tcp_port == other.tcp_port
    }
}

impl Eq for Server {}

impl Hash for Server {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.tcp_port.hash(state);
    }
}

/// An acceleration proxy
///
/// `data_port` accepts the redirected TCP stream, `control_port` receives
/// session setup datagrams, `feedback_port` and `stats_port` are where the
/// agent sends termination and periodic reports to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub mac: Option<MacAddr>,
    pub data_port: u16,
    pub control_port: u16,
    pub feedback_port: u16,
    pub stats_port: u16,
}

impl Agent {
    pub fn new(
        ip: Ipv4Addr,
        data_port: u16,
        control_port: u16,
        feedback_port: u16,
        stats_port: u16,
    ) -> Self {
        Self {
            ip,
            mac: None,
            data_port,
            control_port,
            feedback_port,
            stats_port,
        }
    }

    pub fn with_mac(mut self, mac: MacAddr) -> Self {
        self.mac = Some(mac);
        self
    }

    /// The MAC address, or all-zeroes when it has not been learned yet
    pub fn mac_or_zero(&self) -> MacAddr {
        self.mac.unwrap_or(MacAddr::ZERO)
    }
}

impl PartialEq for Agent {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
            && self.data_port == other.data_port
            && self.control_port == other.control_port
            && self.feedback_port == other.feedback_port
            && self.stats_port == other.stats_port
    }
}

impl Eq for Agent {}

impl Hash for Agent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.data_port.hash(state);
        self.control_port.hash(state);
        self.feedback_port.hash(state);
        self.stats_port.hash(state);
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agent {} (data {}, control {}, feedback {}, stats {})",
            self.ip, self.data_port, self.control_port, self.feedback_port, self.stats_port
        )
    }
}

/// Any endpoint of a route
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Device {
    Client(Client),
    Server(Server),
    Agent(Agent),
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Client(_) => DeviceKind::Client,
            Device::Server(_) => DeviceKind::Server,
            Device::Agent(_) => DeviceKind::Agent,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        match self {
            Device::Client(c) => c.ip,
            Device::Server(s) => s.ip,
            Device::Agent(a) => a.ip,
        }
    }

    pub fn mac(&self) -> Option<MacAddr> {
        match self {
            Device::Client(c) => c.mac,
            Device::Server(s) => s.mac,
            Device::Agent(a) => a.mac,
        }
    }

    pub fn as_agent(&self) -> Option<&Agent> {
        match self {
            Device::Agent(a) => Some(a),
            _ => None,
        }
    }

    /// TCP port for clients and servers; agents have no single port
    pub fn tcp_port(&self) -> Option<u16> {
        match self {
            Device::Client(c) => Some(c.tcp_port),
            Device::Server(s) => Some(s.tcp_port),
            Device::Agent(_) => None,
        }
    }
}

impl From<Client> for Device {
    fn from(c: Client) -> Self {
        Device::Client(c)
    }
}

impl From<Server> for Device {
    fn from(s: Server) -> Self {
        Device::Server(s)
    }
}

impl From<Agent> for Device {
    fn from(a: Agent) -> Self {
        Device::Agent(a)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Client(c) => write!(f, "client {}:{}", c.ip, c.tcp_port),
            Device::Server(s) => write!(f, "server {}:{}", s.ip, s.tcp_port),
            Device::Agent(a) => fmt::Display::fmt(a, f),
        }
    }
}
