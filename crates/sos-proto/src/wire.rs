//! Raw Ethernet frame handling
//!
//! Just enough of Ethernet, ARP, IPv4, TCP and UDP to classify packet-in
//! events, rewrite the spark packet and build the datagrams and probes the
//! controller emits. Checksums are recomputed in full after every header
//! rewrite.

use crate::device::MacAddr;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_ACK: u8 = 0x10;

const ETH_HEADER_LEN: usize = 14;
const IPV4_MIN_HEADER_LEN: usize = 20;
const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const ARP_LEN: usize = 28;
const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Not an IPv4 frame (ethertype {0:#06x})")]
    NotIpv4(u16),

    #[error("Invalid IPv4 header")]
    InvalidIpv4Header,

    #[error("Truncated {0} header")]
    TruncatedTransport(&'static str),

    #[error("Not a {0} packet")]
    WrongProtocol(&'static str),
}

type Result<T> = std::result::Result<T, FrameError>;

/// Transport protocol of an IPv4 packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Other(u8),
}

impl TransportProtocol {
    pub fn from_protocol_number(n: u8) -> Self {
        match n {
            IPPROTO_TCP => TransportProtocol::Tcp,
            IPPROTO_UDP => TransportProtocol::Udp,
            other => TransportProtocol::Other(other),
        }
    }
}

/// Addressing of an IPv4 packet; ports are zero for protocols without them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub protocol: TransportProtocol,
    pub src_port: u16,
    pub dst_port: u16,
}

/// An owned Ethernet frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
}

impl Frame {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < ETH_HEADER_LEN {
            return Err(FrameError::TooShort(data.len()));
        }
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn eth_dst(&self) -> MacAddr {
        MacAddr(mac_at(&self.data, 0))
    }

    pub fn eth_src(&self) -> MacAddr {
        MacAddr(mac_at(&self.data, 6))
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.data[12], self.data[13]])
    }

    pub fn set_eth_dst(&mut self, mac: MacAddr) {
        self.data[0..6].copy_from_slice(&mac.octets());
    }

    pub fn set_eth_src(&mut self, mac: MacAddr) {
        self.data[6..12].copy_from_slice(&mac.octets());
    }

    pub fn is_ipv4(&self) -> bool {
        self.ethertype() == ETHERTYPE_IPV4
    }

    /// Addresses and ports of the IPv4 packet carried by this frame
    pub fn flow(&self) -> Result<FlowTuple> {
        let ihl = self.ipv4_header_len()?;
        let ip = &self.data[ETH_HEADER_LEN..];
        let src_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
        let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
        let protocol = TransportProtocol::from_protocol_number(ip[9]);

        let (src_port, dst_port) = match protocol {
            TransportProtocol::Tcp => self.ports(ihl, TCP_MIN_HEADER_LEN, "TCP")?,
            TransportProtocol::Udp => self.ports(ihl, UDP_HEADER_LEN, "UDP")?,
            TransportProtocol::Other(_) => (0, 0),
        };

        Ok(FlowTuple {
            src_ip,
            dst_ip,
            protocol,
            src_port,
            dst_port,
        })
    }

    /// TCP flags byte
    pub fn tcp_flags(&self) -> Result<u8> {
        let offset = self.transport_offset(IPPROTO_TCP, TCP_MIN_HEADER_LEN, "TCP")?;
        Ok(self.data[offset + 13])
    }

    /// Payload of a UDP datagram
    pub fn udp_payload(&self) -> Result<&[u8]> {
        let offset = self.transport_offset(IPPROTO_UDP, UDP_HEADER_LEN, "UDP")?;
        let end = self.ipv4_end();
        Ok(&self.data[(offset + UDP_HEADER_LEN).min(end)..end])
    }

    pub fn set_ipv4_src(&mut self, addr: Ipv4Addr) -> Result<()> {
        self.ipv4_header_len()?;
        let at = ETH_HEADER_LEN + 12;
        self.data[at..at + 4].copy_from_slice(&addr.octets());
        self.update_checksums()
    }

    pub fn set_ipv4_dst(&mut self, addr: Ipv4Addr) -> Result<()> {
        self.ipv4_header_len()?;
        let at = ETH_HEADER_LEN + 16;
        self.data[at..at + 4].copy_from_slice(&addr.octets());
        self.update_checksums()
    }

    pub fn set_tcp_src_port(&mut self, port: u16) -> Result<()> {
        let offset = self.transport_offset(IPPROTO_TCP, TCP_MIN_HEADER_LEN, "TCP")?;
        self.data[offset..offset + 2].copy_from_slice(&port.to_be_bytes());
        self.update_checksums()
    }

    pub fn set_tcp_dst_port(&mut self, port: u16) -> Result<()> {
        let offset = self.transport_offset(IPPROTO_TCP, TCP_MIN_HEADER_LEN, "TCP")?;
        self.data[offset + 2..offset + 4].copy_from_slice(&port.to_be_bytes());
        self.update_checksums()
    }

    /// Target protocol address of an ARP frame
    pub fn arp_target(&self) -> Option<Ipv4Addr> {
        if self.ethertype() != ETHERTYPE_ARP || self.data.len() < ETH_HEADER_LEN + ARP_LEN {
            return None;
        }
        let t = &self.data[ETH_HEADER_LEN + 24..ETH_HEADER_LEN + 28];
        Some(Ipv4Addr::new(t[0], t[1], t[2], t[3]))
    }

    /// Sender protocol address of an ARP frame
    pub fn arp_sender(&self) -> Option<Ipv4Addr> {
        if self.ethertype() != ETHERTYPE_ARP || self.data.len() < ETH_HEADER_LEN + ARP_LEN {
            return None;
        }
        let s = &self.data[ETH_HEADER_LEN + 14..ETH_HEADER_LEN + 18];
        Some(Ipv4Addr::new(s[0], s[1], s[2], s[3]))
    }

    /// A broadcast ARP who-has request for `target`
    pub fn arp_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target: Ipv4Addr) -> Self {
        let mut data = Vec::with_capacity(ETH_HEADER_LEN + ARP_LEN);
        push_ethernet(&mut data, MacAddr::BROADCAST, sender_mac, ETHERTYPE_ARP);

        data.extend_from_slice(&1u16.to_be_bytes()); // hardware type: Ethernet
        data.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        data.push(6);
        data.push(4);
        data.extend_from_slice(&1u16.to_be_bytes()); // request
        data.extend_from_slice(&sender_mac.octets());
        data.extend_from_slice(&sender_ip.octets());
        data.extend_from_slice(&MacAddr::ZERO.octets());
        data.extend_from_slice(&target.octets());

        Self { data }
    }

    pub fn udp(
        src_mac: MacAddr,
        dst_mac: MacAddr,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        payload: &[u8],
    ) -> Self {
        let mut data = Vec::with_capacity(ETH_HEADER_LEN + 28 + payload.len());
        push_ethernet(&mut data, dst_mac, src_mac, ETHERTYPE_IPV4);
        push_ipv4(
            &mut data,
            *src.ip(),
            *dst.ip(),
            IPPROTO_UDP,
            UDP_HEADER_LEN + payload.len(),
        );

        data.extend_from_slice(&src.port().to_be_bytes());
        data.extend_from_slice(&dst.port().to_be_bytes());
        data.extend_from_slice(&((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(payload);

        let mut frame = Self { data };
        frame.fill_checksums();
        frame
    }

    pub fn tcp(
        src_mac: MacAddr,
        dst_mac: MacAddr,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        flags: u8,
        payload: &[u8],
    ) -> Self {
        let mut data = Vec::with_capacity(ETH_HEADER_LEN + 40 + payload.len());
        push_ethernet(&mut data, dst_mac, src_mac, ETHERTYPE_IPV4);
        push_ipv4(
            &mut data,
            *src.ip(),
            *dst.ip(),
            IPPROTO_TCP,
            TCP_MIN_HEADER_LEN + payload.len(),
        );

        data.extend_from_slice(&src.port().to_be_bytes());
        data.extend_from_slice(&dst.port().to_be_bytes());
        data.extend_from_slice(&[0; 8]); // sequence and acknowledgement numbers
        data.push((TCP_MIN_HEADER_LEN as u8 / 4) << 4);
        data.push(flags);
        data.extend_from_slice(&u16::MAX.to_be_bytes()); // window
        data.extend_from_slice(&[0; 4]); // checksum and urgent pointer
        data.extend_from_slice(payload);

        let mut frame = Self { data };
        frame.fill_checksums();
        frame
    }

    /// Whether the IPv4 header checksum and the TCP/UDP checksum are correct
    pub fn checksums_valid(&self) -> bool {
        let Ok(ihl) = self.ipv4_header_len() else {
            return false;
        };
        let header = &self.data[ETH_HEADER_LEN..ETH_HEADER_LEN + ihl];
        if fold(sum_words(header, 0)) != 0xffff {
            return false;
        }
        match self.transport_sum() {
            Some(sum) => fold(sum) == 0xffff,
            None => true,
        }
    }

    fn ipv4_header_len(&self) -> Result<usize> {
        if !self.is_ipv4() {
            return Err(FrameError::NotIpv4(self.ethertype()));
        }
        if self.data.len() < ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN {
            return Err(FrameError::TooShort(self.data.len()));
        }
        let version_ihl = self.data[ETH_HEADER_LEN];
        let ihl = ((version_ihl & 0x0f) as usize) * 4;
        if version_ihl >> 4 != 4 || ihl < IPV4_MIN_HEADER_LEN {
            return Err(FrameError::InvalidIpv4Header);
        }
        if self.data.len() < ETH_HEADER_LEN + ihl {
            return Err(FrameError::InvalidIpv4Header);
        }
        Ok(ihl)
    }

    /// End of the IPv4 packet within the frame, ignoring Ethernet padding
    fn ipv4_end(&self) -> usize {
        let at = ETH_HEADER_LEN + 2;
        let total = u16::from_be_bytes([self.data[at], self.data[at + 1]]) as usize;
        (ETH_HEADER_LEN + total).min(self.data.len())
    }

    fn ports(&self, ihl: usize, min_len: usize, name: &'static str) -> Result<(u16, u16)> {
        let offset = ETH_HEADER_LEN + ihl;
        if self.data.len() < offset + min_len {
            return Err(FrameError::TruncatedTransport(name));
        }
        let t = &self.data[offset..];
        Ok((
            u16::from_be_bytes([t[0], t[1]]),
            u16::from_be_bytes([t[2], t[3]]),
        ))
    }

    fn transport_offset(&self, protocol: u8, min_len: usize, name: &'static str) -> Result<usize> {
        let ihl = self.ipv4_header_len()?;
        if self.data[ETH_HEADER_LEN + 9] != protocol {
            return Err(FrameError::WrongProtocol(name));
        }
        let offset = ETH_HEADER_LEN + ihl;
        if self.data.len() < offset + min_len {
            return Err(FrameError::TruncatedTransport(name));
        }
        Ok(offset)
    }

    fn update_checksums(&mut self) -> Result<()> {
        self.ipv4_header_len()?;
        self.fill_checksums();
        Ok(())
    }

    fn fill_checksums(&mut self) {
        let Ok(ihl) = self.ipv4_header_len() else {
            return;
        };

        let at = ETH_HEADER_LEN + 10;
        self.data[at..at + 2].copy_from_slice(&[0, 0]);
        let header_sum = !fold(sum_words(&self.data[ETH_HEADER_LEN..ETH_HEADER_LEN + ihl], 0));
        self.data[at..at + 2].copy_from_slice(&header_sum.to_be_bytes());

        let offset = ETH_HEADER_LEN + ihl;
        let checksum_at = match self.data[ETH_HEADER_LEN + 9] {
            IPPROTO_TCP if self.data.len() >= offset + TCP_MIN_HEADER_LEN => offset + 16,
            IPPROTO_UDP if self.data.len() >= offset + UDP_HEADER_LEN => offset + 6,
            _ => return,
        };

        self.data[checksum_at..checksum_at + 2].copy_from_slice(&[0, 0]);
        if let Some(sum) = self.transport_sum() {
            let mut checksum = !fold(sum);
            if checksum == 0 && self.data[ETH_HEADER_LEN + 9] == IPPROTO_UDP {
                checksum = 0xffff;
            }
            self.data[checksum_at..checksum_at + 2].copy_from_slice(&checksum.to_be_bytes());
        }
    }

    /// Ones' complement sum of the pseudo-header and transport segment
    fn transport_sum(&self) -> Option<u32> {
        let ihl = self.ipv4_header_len().ok()?;
        let protocol = self.data[ETH_HEADER_LEN + 9];
        if protocol != IPPROTO_TCP && protocol != IPPROTO_UDP {
            return None;
        }
        let end = self.ipv4_end();
        let start = ETH_HEADER_LEN + ihl;
        if end <= start {
            return None;
        }
        let segment = &self.data[start..end];

        let ip = &self.data[ETH_HEADER_LEN..];
        let mut sum = sum_words(&ip[12..20], 0);
        sum += protocol as u32;
        sum += segment.len() as u32;
        Some(sum_words(segment, sum))
    }
}

fn mac_at(data: &[u8], at: usize) -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&data[at..at + 6]);
    mac
}

fn push_ethernet(data: &mut Vec<u8>, dst: MacAddr, src: MacAddr, ethertype: u16) {
    data.extend_from_slice(&dst.octets());
    data.extend_from_slice(&src.octets());
    data.extend_from_slice(&ethertype.to_be_bytes());
}

fn push_ipv4(data: &mut Vec<u8>, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) {
    let total_len = (IPV4_MIN_HEADER_LEN + payload_len) as u16;
    data.push(0x45);
    data.push(0);
    data.extend_from_slice(&total_len.to_be_bytes());
    data.extend_from_slice(&[0, 0]); // identification
    data.extend_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    data.push(DEFAULT_TTL);
    data.push(protocol);
    data.extend_from_slice(&[0, 0]);
    data.extend_from_slice(&src.octets());
    data.extend_from_slice(&dst.octets());
}

fn sum_words(bytes: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = bytes.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}
