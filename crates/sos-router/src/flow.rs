//! Flow table entries: what to match, what to do with a match

use serde::Serialize;
use sos_proto::wire::{TransportProtocol, ETHERTYPE_IPV4};
use sos_proto::{DatapathId, Frame, FrameError, MacAddr};
use std::fmt;
use std::net::Ipv4Addr;

/// Exact-match fields of a flow; `None` is a wildcard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlowMatch {
    pub in_port: Option<u16>,
    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
    pub eth_type: Option<u16>,
    pub ipv4_src: Option<Ipv4Addr>,
    pub ipv4_dst: Option<Ipv4Addr>,
    /// Set whenever a TCP field is; only TCP is ever matched
    pub tcp: bool,
    pub tcp_src: Option<u16>,
    pub tcp_dst: Option<u16>,
}

impl FlowMatch {
    /// Match anything arriving on `in_port`
    pub fn on_port(in_port: u16) -> Self {
        Self {
            in_port: Some(in_port),
            ..Default::default()
        }
    }

    /// Match on TCP over IPv4 arriving on `in_port`
    pub fn tcp_on(in_port: u16) -> Self {
        Self {
            in_port: Some(in_port),
            eth_type: Some(ETHERTYPE_IPV4),
            tcp: true,
            ..Default::default()
        }
    }

    pub fn with_eth_src(mut self, mac: MacAddr) -> Self {
        self.eth_src = Some(mac);
        self
    }

    pub fn with_eth_dst(mut self, mac: MacAddr) -> Self {
        self.eth_dst = Some(mac);
        self
    }

    pub fn with_ipv4_src(mut self, ip: Ipv4Addr) -> Self {
        self.ipv4_src = Some(ip);
        self
    }

    pub fn with_ipv4_dst(mut self, ip: Ipv4Addr) -> Self {
        self.ipv4_dst = Some(ip);
        self
    }

    pub fn with_tcp_src(mut self, port: u16) -> Self {
        self.tcp_src = Some(port);
        self
    }

    pub fn with_tcp_dst(mut self, port: u16) -> Self {
        self.tcp_dst = Some(port);
        self
    }

    /// Whether a frame arriving on `in_port` hits this match
    pub fn matches(&self, in_port: u16, frame: &Frame) -> bool {
        if self.in_port.is_some_and(|p| p != in_port)
            || self.eth_src.is_some_and(|m| m != frame.eth_src())
            || self.eth_dst.is_some_and(|m| m != frame.eth_dst())
            || self.eth_type.is_some_and(|t| t != frame.ethertype())
        {
            return false;
        }

        let needs_l3 = self.ipv4_src.is_some() || self.ipv4_dst.is_some() || self.tcp;
        if !needs_l3 {
            return true;
        }

        let Ok(flow) = frame.flow() else {
            return false;
        };

        !(self.ipv4_src.is_some_and(|ip| ip != flow.src_ip)
            || self.ipv4_dst.is_some_and(|ip| ip != flow.dst_ip)
            || (self.tcp && flow.protocol != TransportProtocol::Tcp)
            || self.tcp_src.is_some_and(|p| p != flow.src_port)
            || self.tcp_dst.is_some_and(|p| p != flow.dst_port))
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Vec::new();
        if let Some(p) = self.in_port {
            fields.push(format!("in_port={}", p));
        }
        if let Some(m) = self.eth_src {
            fields.push(format!("eth_src={}", m));
        }
        if let Some(m) = self.eth_dst {
            fields.push(format!("eth_dst={}", m));
        }
        if let Some(ip) = self.ipv4_src {
            fields.push(format!("ipv4_src={}", ip));
        }
        if let Some(ip) = self.ipv4_dst {
            fields.push(format!("ipv4_dst={}", ip));
        }
        if self.tcp {
            fields.push("ip_proto=tcp".to_string());
        }
        if let Some(p) = self.tcp_src {
            fields.push(format!("tcp_src={}", p));
        }
        if let Some(p) = self.tcp_dst {
            fields.push(format!("tcp_dst={}", p));
        }
        write!(f, "{}", fields.join(","))
    }
}

/// A single flow action, applied in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FlowAction {
    SetEthSrc(MacAddr),
    SetEthDst(MacAddr),
    SetIpv4Src(Ipv4Addr),
    SetIpv4Dst(Ipv4Addr),
    SetTcpSrc(u16),
    SetTcpDst(u16),
    Output(u16),
}

impl FlowAction {
    /// Apply a header rewrite; `Output` leaves the frame untouched
    pub fn apply(&self, frame: &mut Frame) -> Result<(), FrameError> {
        match *self {
            FlowAction::SetEthSrc(mac) => frame.set_eth_src(mac),
            FlowAction::SetEthDst(mac) => frame.set_eth_dst(mac),
            FlowAction::SetIpv4Src(ip) => frame.set_ipv4_src(ip)?,
            FlowAction::SetIpv4Dst(ip) => frame.set_ipv4_dst(ip)?,
            FlowAction::SetTcpSrc(port) => frame.set_tcp_src_port(port)?,
            FlowAction::SetTcpDst(port) => frame.set_tcp_dst_port(port)?,
            FlowAction::Output(_) => {}
        }
        Ok(())
    }
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowAction::SetEthSrc(m) => write!(f, "set_eth_src:{}", m),
            FlowAction::SetEthDst(m) => write!(f, "set_eth_dst:{}", m),
            FlowAction::SetIpv4Src(ip) => write!(f, "set_ipv4_src:{}", ip),
            FlowAction::SetIpv4Dst(ip) => write!(f, "set_ipv4_dst:{}", ip),
            FlowAction::SetTcpSrc(p) => write!(f, "set_tcp_src:{}", p),
            FlowAction::SetTcpDst(p) => write!(f, "set_tcp_dst:{}", p),
            FlowAction::Output(p) => write!(f, "output:{}", p),
        }
    }
}

/// A named flow to install on one switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSpec {
    pub name: String,
    pub switch: DatapathId,
    pub matcher: FlowMatch,
    pub actions: Vec<FlowAction>,
    pub priority: u16,
    /// Seconds without a hit before the switch drops the flow
    pub idle_timeout: u16,
    pub hard_timeout: u16,
}

impl FlowSpec {
    /// Port the last `Output` action sends to
    pub fn output_port(&self) -> Option<u16> {
        self.actions.iter().rev().find_map(|a| match a {
            FlowAction::Output(port) => Some(*port),
            _ => None,
        })
    }

    /// Run the actions on a copy of `frame`, returning it with its egress port
    pub fn apply(&self, frame: &Frame) -> Result<Option<(u16, Frame)>, FrameError> {
        let mut out = frame.clone();
        let mut port = None;
        for action in &self.actions {
            action.apply(&mut out)?;
            if let FlowAction::Output(p) = action {
                port = Some(*p);
            }
        }
        Ok(port.map(|p| (p, out)))
    }
}

impl fmt::Display for FlowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions: Vec<String> = self.actions.iter().map(ToString::to_string).collect();
        write!(
            f,
            "{} on {} [{}] -> [{}] priority={} idle={}",
            self.name,
            self.switch,
            self.matcher,
            actions.join(","),
            self.priority,
            self.idle_timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sos_proto::wire::TCP_SYN;
    use std::net::SocketAddrV4;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, last])
    }

    fn syn() -> Frame {
        Frame::tcp(
            mac(9),
            mac(5),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 51000),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 80),
            TCP_SYN,
            &[],
        )
    }

    #[test]
    fn test_match_on_tcp_fields() {
        let m = FlowMatch::tcp_on(1)
            .with_ipv4_src(Ipv4Addr::new(10, 0, 0, 9))
            .with_tcp_src(51000)
            .with_tcp_dst(80);

        assert!(m.matches(1, &syn()));
        assert!(!m.matches(2, &syn()));
        assert!(!m.clone().with_tcp_dst(81).matches(1, &syn()));
        assert!(!m.with_eth_dst(mac(1)).matches(1, &syn()));
    }

    #[test]
    fn test_match_rejects_non_tcp() {
        let udp = Frame::udp(
            mac(9),
            mac(5),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 51000),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 80),
            b"x",
        );
        assert!(!FlowMatch::tcp_on(1).matches(1, &udp));
    }

    #[test]
    fn test_apply_rewrites_and_outputs() {
        let spec = FlowSpec {
            name: "test".to_string(),
            switch: DatapathId(1),
            matcher: FlowMatch::tcp_on(1),
            actions: vec![
                FlowAction::SetEthDst(mac(1)),
                FlowAction::SetIpv4Dst(Ipv4Addr::new(10, 0, 0, 1)),
                FlowAction::SetTcpDst(9877),
                FlowAction::Output(3),
            ],
            priority: 32767,
            idle_timeout: 60,
            hard_timeout: 0,
        };

        let (port, frame) = spec.apply(&syn()).unwrap().unwrap();
        assert_eq!(port, 3);
        assert_eq!(spec.output_port(), Some(3));
        assert_eq!(frame.eth_dst(), mac(1));
        assert_eq!(frame.flow().unwrap().dst_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(frame.flow().unwrap().dst_port, 9877);
        assert!(frame.checksums_valid());
    }

    #[test]
    fn test_display() {
        let m = FlowMatch::tcp_on(2).with_tcp_dst(80);
        assert_eq!(m.to_string(), "in_port=2,ip_proto=tcp,tcp_dst=80");
    }
}
