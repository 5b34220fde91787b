use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use log::trace;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::rib::Route;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Bgp,
    Xmpp,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Encoding::Bgp => write!(f, "BGP"),
            Encoding::Xmpp => write!(f, "XMPP"),
        }
    }
}

/// Peers sharing an export policy for a table share one RibOut
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RibExportPolicy {
    pub encoding: Encoding,
    pub as_number: u32,
    // Peer understands LLGR_STALE paths
    #[serde(default)]
    pub llgr: bool,
}

impl RibExportPolicy {
    pub fn bgp(as_number: u32) -> Self {
        Self {
            encoding: Encoding::Bgp,
            as_number,
            llgr: false,
        }
    }

    pub fn xmpp() -> Self {
        Self {
            encoding: Encoding::Xmpp,
            as_number: 0,
            llgr: false,
        }
    }
}

impl Default for RibExportPolicy {
    fn default() -> Self {
        Self::bgp(0)
    }
}

impl fmt::Display for RibExportPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} AS{}", self.encoding, self.as_number)?;
        if self.llgr {
            write!(f, " llgr")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteUpdate {
    Advertise(IpNetwork),
    Withdraw(IpNetwork),
}

#[derive(Debug)]
struct RibOutPeer {
    addr: IpAddr,
    active: bool,
    queue: VecDeque<RouteUpdate>,
}

#[derive(Debug, Default)]
struct Inner {
    // peer index: peer
    peers: HashMap<usize, RibOutPeer>,
    indices: HashMap<IpAddr, usize>,
    // prefix: peer indices currently advertised to
    advertised: HashMap<IpNetwork, BTreeSet<usize>>,
}

impl Inner {
    /// Lowest index not held by a registered peer
    fn free_index(&self) -> usize {
        (0..).find(|i| !self.peers.contains_key(i)).unwrap_or_default()
    }

    fn enqueue(&mut self, index: usize, update: RouteUpdate) {
        if let Some(peer) = self.peers.get_mut(&index) {
            if peer.active {
                peer.queue.push_back(update);
            }
        }
    }
}

/// Advertisement state for one (table, export policy)
#[derive(Debug)]
pub struct RibOut {
    table: String,
    policy: RibExportPolicy,
    inner: Mutex<Inner>,
}

impl RibOut {
    pub fn new(table: &str, policy: RibExportPolicy) -> Self {
        Self {
            table: table.to_owned(),
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn policy(&self) -> &RibExportPolicy {
        &self.policy
    }

    /// Allocate an index for `peer`, returning the existing one if already registered
    pub fn register(&self, peer: IpAddr) -> usize {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.indices.get(&peer) {
            return *index;
        }
        let index = inner.free_index();
        inner.peers.insert(
            index,
            RibOutPeer {
                addr: peer,
                active: true,
                queue: VecDeque::new(),
            },
        );
        inner.indices.insert(peer, index);
        trace!("{} [{}] registered {} at index {}", self.table, self.policy, peer, index);
        index
    }

    pub fn peer_index(&self, peer: IpAddr) -> Option<usize> {
        self.inner.lock().indices.get(&peer).copied()
    }

    /// Stop sending updates to `peer`, its index stays reserved until unregister
    pub fn deactivate(&self, peer: IpAddr) {
        let mut inner = self.inner.lock();
        let index = match inner.indices.get(&peer) {
            Some(index) => *index,
            None => return,
        };
        if let Some(ribout_peer) = inner.peers.get_mut(&index) {
            ribout_peer.active = false;
            ribout_peer.queue.clear();
        }
    }

    pub fn unregister(&self, peer: IpAddr) {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.indices.remove(&peer) {
            inner.peers.remove(&index);
            for indices in inner.advertised.values_mut() {
                indices.remove(&index);
            }
            inner.advertised.retain(|_, indices| !indices.is_empty());
            trace!("{} [{}] unregistered {}", self.table, self.policy, peer);
        }
    }

    /// Start advertising `route` to the peers at `indices`
    pub fn join(&self, route: &Route, indices: &BTreeSet<usize>) {
        if indices.is_empty() {
            return;
        }
        let best = match route.best_path() {
            Some(best) => best,
            None => return,
        };
        if best.is_llgr_stale() && !self.policy.llgr {
            return;
        }
        let prefix = route.prefix();
        let mut inner = self.inner.lock();
        for index in indices {
            let source = inner.peers.get(index).map(|p| p.addr);
            // Never reflect a path back to the peer it was learned from
            if source.is_none() || source == Some(best.peer()) {
                continue;
            }
            if inner.advertised.entry(prefix).or_default().insert(*index) {
                inner.enqueue(*index, RouteUpdate::Advertise(prefix));
            }
        }
    }

    /// Withdraw `route` from the peers at `indices`
    pub fn leave(&self, route: &Route, indices: &BTreeSet<usize>) {
        if indices.is_empty() {
            return;
        }
        let prefix = route.prefix();
        let mut inner = self.inner.lock();
        let mut withdrawn = Vec::with_capacity(indices.len());
        if let Some(advertised) = inner.advertised.get_mut(&prefix) {
            for index in indices {
                if advertised.remove(index) {
                    withdrawn.push(*index);
                }
            }
            if advertised.is_empty() {
                inner.advertised.remove(&prefix);
            }
        }
        for index in withdrawn {
            inner.enqueue(index, RouteUpdate::Withdraw(prefix));
        }
    }

    /// Updates queued for `peer` and not yet drained
    pub fn queue_depth(&self, peer: IpAddr) -> usize {
        let inner = self.inner.lock();
        inner
            .indices
            .get(&peer)
            .and_then(|index| inner.peers.get(index))
            .map(|p| p.queue.len())
            .unwrap_or(0)
    }

    pub fn drain(&self, peer: IpAddr) -> Vec<RouteUpdate> {
        let mut inner = self.inner.lock();
        let index = match inner.indices.get(&peer) {
            Some(index) => *index,
            None => return vec![],
        };
        inner
            .peers
            .get_mut(&index)
            .map(|p| p.queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Prefixes currently advertised to `peer`
    pub fn advertised_to(&self, peer: IpAddr) -> Vec<IpNetwork> {
        let inner = self.inner.lock();
        let index = match inner.indices.get(&peer) {
            Some(index) => *index,
            None => return vec![],
        };
        inner
            .advertised
            .iter()
            .filter(|(_, indices)| indices.contains(&index))
            .map(|(prefix, _)| *prefix)
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::{PathAttributes, PathFlags, PathKey, RouteOperation};
    use std::sync::Arc;

    fn route_from(peer: IpAddr, flags: PathFlags) -> Route {
        let mut route = Route::new("172.16.0.0/16".parse().unwrap());
        route.input_common(
            PathKey::new(peer, 0),
            RouteOperation::AddChange {
                attributes: Arc::new(PathAttributes::new(None)),
                flags,
            },
        );
        route
    }

    #[test]
    fn test_index_reuse() {
        let ribout = RibOut::new("blue.inet.0", RibExportPolicy::default());
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let c: IpAddr = "10.0.0.3".parse().unwrap();
        assert_eq!(ribout.register(a), 0);
        assert_eq!(ribout.register(b), 1);
        assert_eq!(ribout.register(a), 0);
        ribout.unregister(a);
        assert_eq!(ribout.register(c), 0);
        assert_eq!(ribout.peer_index(b), Some(1));
        assert_eq!(ribout.peer_count(), 2);
    }

    #[test]
    fn test_join_leave() {
        let ribout = RibOut::new("blue.inet.0", RibExportPolicy::default());
        let source: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        let indices: BTreeSet<usize> = vec![ribout.register(source), ribout.register(other)]
            .into_iter()
            .collect();
        let route = route_from(source, PathFlags::default());

        ribout.join(&route, &indices);
        assert!(ribout.advertised_to(source).is_empty());
        assert_eq!(ribout.advertised_to(other), vec![route.prefix()]);
        assert_eq!(ribout.queue_depth(other), 1);

        ribout.leave(&route, &indices);
        assert!(ribout.advertised_to(other).is_empty());
        assert_eq!(
            ribout.drain(other),
            vec![
                RouteUpdate::Advertise(route.prefix()),
                RouteUpdate::Withdraw(route.prefix())
            ]
        );
        assert_eq!(ribout.queue_depth(other), 0);
    }

    #[test]
    fn test_llgr_stale_needs_llgr_policy() {
        let source: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        let route = route_from(source, PathFlags::llgr_stale());

        let plain = RibOut::new("blue.inet.0", RibExportPolicy::default());
        let indices: BTreeSet<usize> = vec![plain.register(other)].into_iter().collect();
        plain.join(&route, &indices);
        assert!(plain.advertised_to(other).is_empty());

        let mut policy = RibExportPolicy::default();
        policy.llgr = true;
        let llgr = RibOut::new("blue.inet.0", policy);
        let indices: BTreeSet<usize> = vec![llgr.register(other)].into_iter().collect();
        llgr.join(&route, &indices);
        assert_eq!(llgr.advertised_to(other).len(), 1);
    }

    #[test]
    fn test_deactivated_peer_gets_no_updates() {
        let ribout = RibOut::new("blue.inet.0", RibExportPolicy::default());
        let source: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        let indices: BTreeSet<usize> = vec![ribout.register(other)].into_iter().collect();
        let route = route_from(source, PathFlags::default());
        ribout.join(&route, &indices);
        ribout.deactivate(other);
        assert_eq!(ribout.queue_depth(other), 0);
        ribout.leave(&route, &indices);
        assert_eq!(ribout.queue_depth(other), 0);
        assert!(ribout.advertised_to(other).is_empty());
    }
}
