//! Where devices are and how to get between them
//!
//! [`Topology`] is what the controller needs from the network's device and
//! link discovery. [`StaticTopology`] answers from a fixed description, as
//! loaded from the deployment file.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sos_proto::{DatapathId, MacAddr, NodePort};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, trace};

/// A device as known to the network, with every place it has been seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub attachment_points: Vec<NodePort>,
}

pub trait Topology: Send + Sync {
    fn find_device(&self, ip: Ipv4Addr) -> Option<DeviceRecord>;

    /// Whether `port` is one end of an inter-switch link
    fn has_link_on_port(&self, port: NodePort) -> bool;

    /// Hop list from `src` to `dst` as `[src, out, in, out, ..., in, dst]`
    fn shortest_path(&self, src: NodePort, dst: NodePort) -> Option<Vec<NodePort>>;

    /// Latency of the link leaving through `port`, if there is one
    fn link_latency(&self, port: NodePort) -> Option<u64>;
}

/// Pick the attachment point a device is physically plugged into
///
/// A device seen from several islands shows up on inter-island link ports
/// everywhere but where it really is.
pub fn true_attachment_point(topology: &dyn Topology, aps: &[NodePort]) -> Option<NodePort> {
    let found = aps.iter().copied().find(|ap| !topology.has_link_on_port(*ap));
    match found {
        Some(ap) => trace!(attachment_point = %ap, "Found true attachment point"),
        None => debug!(?aps, "No true attachment point"),
    }
    found
}

/// A link between two switch ports; usable in both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub a: NodePort,
    pub b: NodePort,
    #[serde(default)]
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub switches: Vec<DatapathId>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub hosts: Vec<DeviceRecord>,
}

#[derive(Debug, Clone, Copy)]
struct DirectedLink {
    src: NodePort,
    dst: NodePort,
    latency: u64,
}

/// A topology that does not change except for hosts being learned
#[derive(Debug, Clone)]
pub struct StaticTopology {
    switches: Arc<BTreeSet<DatapathId>>,
    /// Outgoing links keyed by the port they leave through
    links: Arc<BTreeMap<NodePort, DirectedLink>>,
    hosts: Arc<RwLock<HashMap<Ipv4Addr, DeviceRecord>>>,
}

impl StaticTopology {
    pub fn new(config: TopologyConfig) -> Self {
        let mut switches: BTreeSet<DatapathId> = config.switches.into_iter().collect();
        let mut links = BTreeMap::new();

        for link in config.links {
            switches.insert(link.a.switch);
            switches.insert(link.b.switch);
            links.insert(
                link.a,
                DirectedLink {
                    src: link.a,
                    dst: link.b,
                    latency: link.latency_ms,
                },
            );
            links.insert(
                link.b,
                DirectedLink {
                    src: link.b,
                    dst: link.a,
                    latency: link.latency_ms,
                },
            );
        }

        let hosts = config
            .hosts
            .into_iter()
            .map(|host| (host.ip, host))
            .collect();

        Self {
            switches: Arc::new(switches),
            links: Arc::new(links),
            hosts: Arc::new(RwLock::new(hosts)),
        }
    }

    pub fn switches(&self) -> Vec<DatapathId> {
        self.switches.iter().copied().collect()
    }

    /// Learn (or move) a host
    pub fn insert_host(&self, record: DeviceRecord) {
        debug!(ip = %record.ip, mac = %record.mac, "Learned host");
        self.hosts.write().insert(record.ip, record);
    }

    pub fn remove_host(&self, ip: Ipv4Addr) -> Option<DeviceRecord> {
        self.hosts.write().remove(&ip)
    }

    /// Breadth-first search over switches, following links in port order
    fn switch_path(&self, from: DatapathId, to: DatapathId) -> Option<Vec<DirectedLink>> {
        let mut previous: HashMap<DatapathId, DirectedLink> = HashMap::new();
        let mut visited = BTreeSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(switch) = queue.pop_front() {
            if switch == to {
                let mut hops = Vec::new();
                let mut current = to;
                while current != from {
                    let link = previous.get(&current)?;
                    hops.push(*link);
                    current = link.src.switch;
                }
                hops.reverse();
                return Some(hops);
            }

            for link in self.links.values().filter(|l| l.src.switch == switch) {
                if visited.insert(link.dst.switch) {
                    previous.insert(link.dst.switch, *link);
                    queue.push_back(link.dst.switch);
                }
            }
        }

        None
    }
}

impl Topology for StaticTopology {
    fn find_device(&self, ip: Ipv4Addr) -> Option<DeviceRecord> {
        self.hosts.read().get(&ip).cloned()
    }

    fn has_link_on_port(&self, port: NodePort) -> bool {
        self.links.contains_key(&port)
    }

    fn shortest_path(&self, src: NodePort, dst: NodePort) -> Option<Vec<NodePort>> {
        if !self.switches.contains(&src.switch) || !self.switches.contains(&dst.switch) {
            return None;
        }

        let links = self.switch_path(src.switch, dst.switch)?;
        let mut path = Vec::with_capacity(2 * links.len() + 2);
        path.push(src);
        for link in links {
            path.push(link.src);
            path.push(link.dst);
        }
        path.push(dst);
        Some(path)
    }

    fn link_latency(&self, port: NodePort) -> Option<u64> {
        self.links.get(&port).map(|l| l.latency)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn np(switch: u64, port: u16) -> NodePort {
        NodePort::new(DatapathId(switch), port)
    }

    pub fn mac(last: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, last])
    }

    pub fn host(ip: [u8; 4], mac_last: u8, ap: NodePort) -> DeviceRecord {
        DeviceRecord {
            ip: Ipv4Addr::from(ip),
            mac: mac(mac_last),
            attachment_points: vec![ap],
        }
    }

    /// s1 - s2 - s3 - s4 chained through ports 3/4 (s3-s4 through port 5),
    /// with the s3-s4 link far slower than the others
    pub fn chain_topology() -> StaticTopology {
        StaticTopology::new(TopologyConfig {
            switches: (1..=4).map(DatapathId).collect(),
            links: vec![
                LinkConfig {
                    a: np(1, 3),
                    b: np(2, 4),
                    latency_ms: 1,
                },
                LinkConfig {
                    a: np(2, 3),
                    b: np(3, 4),
                    latency_ms: 1,
                },
                LinkConfig {
                    a: np(3, 5),
                    b: np(4, 5),
                    latency_ms: 40,
                },
            ],
            hosts: vec![
                host([10, 0, 0, 9], 9, np(1, 1)),
                host([10, 0, 0, 1], 1, np(3, 2)),
                host([10, 0, 0, 5], 5, np(4, 1)),
                host([10, 0, 0, 2], 2, np(4, 2)),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_path_across_switches() {
        let topology = chain_topology();
        let path = topology.shortest_path(np(1, 1), np(3, 2)).unwrap();
        assert_eq!(
            path,
            vec![np(1, 1), np(1, 3), np(2, 4), np(2, 3), np(3, 4), np(3, 2)]
        );
    }

    #[test]
    fn test_path_on_one_switch() {
        let topology = chain_topology();
        let path = topology.shortest_path(np(4, 1), np(4, 2)).unwrap();
        assert_eq!(path, vec![np(4, 1), np(4, 2)]);
    }

    #[test]
    fn test_no_path_to_unknown_or_disconnected_switch() {
        let topology = StaticTopology::new(TopologyConfig {
            switches: vec![DatapathId(1), DatapathId(2)],
            ..Default::default()
        });
        assert!(topology.shortest_path(np(1, 1), np(2, 1)).is_none());
        assert!(topology.shortest_path(np(1, 1), np(9, 1)).is_none());
    }

    #[test]
    fn test_links_in_both_directions() {
        let topology = chain_topology();
        assert!(topology.has_link_on_port(np(3, 5)));
        assert!(topology.has_link_on_port(np(4, 5)));
        assert!(!topology.has_link_on_port(np(4, 1)));
        assert_eq!(topology.link_latency(np(4, 5)), Some(40));
        assert_eq!(topology.link_latency(np(4, 1)), None);
    }

    #[test]
    fn test_true_attachment_point_skips_linked_ports() {
        let topology = chain_topology();
        let aps = [np(2, 4), np(1, 1)];
        assert_eq!(true_attachment_point(&topology, &aps), Some(np(1, 1)));
        assert_eq!(true_attachment_point(&topology, &[np(2, 4)]), None);
        assert_eq!(true_attachment_point(&topology, &[]), None);
    }

    #[test]
    fn test_hosts_can_be_learned() {
        let topology = chain_topology();
        let ip = Ipv4Addr::new(10, 0, 0, 77);
        assert!(topology.find_device(ip).is_none());

        topology.insert_host(host([10, 0, 0, 77], 77, np(2, 1)));
        assert_eq!(topology.find_device(ip).unwrap().mac, mac(77));
        assert!(topology.remove_host(ip).is_some());
    }
}
