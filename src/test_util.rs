use std::net::IpAddr;
use std::sync::Arc;

use bgp_rs::{AFI, SAFI};
use ipnetwork::IpNetwork;

use crate::peer::{GracefulRestart, SimPeer};
use crate::rib::{BgpTable, Community, Families, Family, PathAttributes, PathFlags};

pub(crate) fn ipv4_unicast() -> Family {
    Family::new(AFI::IPV4, SAFI::Unicast)
}

pub(crate) fn test_peer(addr: &str) -> Arc<SimPeer> {
    SimPeer::new(addr.parse().unwrap(), false, GracefulRestart::default())
}

pub(crate) fn xmpp_peer(addr: &str) -> Arc<SimPeer> {
    SimPeer::new(addr.parse().unwrap(), true, GracefulRestart::default())
}

/// Peer restarting gracefully for `time` seconds, long-lived for
/// `long_lived_time` seconds when non-zero
pub(crate) fn gr_peer(addr: &str, time: u32, long_lived_time: u32) -> Arc<SimPeer> {
    let graceful_restart = GracefulRestart {
        enabled: true,
        long_lived: long_lived_time > 0,
        time,
        long_lived_time,
        families: Families::new(vec![ipv4_unicast()]),
    };
    SimPeer::new(addr.parse().unwrap(), false, graceful_restart)
}

pub(crate) fn test_table(name: &str) -> Arc<BgpTable> {
    Arc::new(BgpTable::new(name, ipv4_unicast()))
}

pub(crate) fn prefix(index: usize) -> IpNetwork {
    format!("10.{}.{}.0/24", index / 256, index % 256).parse().unwrap()
}

/// Add `count` paths from `peer` to `table`
pub(crate) fn add_paths(table: &BgpTable, peer: IpAddr, count: usize) {
    add_paths_with(table, peer, count, vec![]);
}

pub(crate) fn add_paths_with(table: &BgpTable, peer: IpAddr, count: usize, communities: Vec<Community>) {
    let attributes = Arc::new(PathAttributes::new(Some(peer)).with_communities(communities));
    for index in 0..count {
        table.add_path(prefix(index), peer, 0, attributes.clone(), PathFlags::default());
    }
}
