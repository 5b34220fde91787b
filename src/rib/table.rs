use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ipnetwork::IpNetwork;
use itertools::Itertools;
use log::{debug, trace};
use parking_lot::Mutex;

use super::{
    Family, Path, PathAttributes, PathFlags, PathKey, RibExportPolicy, RibOut, Route,
    RouteOperation,
};

/// Routing table as seen by the membership manager
///
/// Route storage and best path selection belong to the implementor. The
/// manager only needs a way to visit every route and a place to locate
/// RibOuts for an export policy.
pub trait Table: Send + Sync {
    fn name(&self) -> &str;
    fn family(&self) -> Family;
    /// Number of routes
    fn size(&self) -> usize;
    fn is_deleted(&self) -> bool {
        false
    }
    fn ribout_locate(&self, policy: &RibExportPolicy) -> Arc<RibOut>;
    /// Visit every route once. The visitor returns true when the route changed
    /// and downstream listeners should be notified. Routes left without
    /// paths after their visit are removed.
    fn walk(&self, visitor: &mut dyn FnMut(&mut Route) -> bool);
}

/// In-memory table keyed by prefix
#[derive(Debug)]
pub struct BgpTable {
    name: String,
    family: Family,
    routes: Mutex<HashMap<IpNetwork, Route>>,
    ribouts: Mutex<HashMap<RibExportPolicy, Arc<RibOut>>>,
    deleted: AtomicBool,
    walk_request_count: AtomicU64,
    walk_complete_count: AtomicU64,
    notify_count: AtomicU64,
}

impl BgpTable {
    pub fn new(name: &str, family: Family) -> Self {
        Self {
            name: name.to_owned(),
            family,
            routes: Mutex::new(HashMap::with_capacity(64)),
            ribouts: Mutex::new(HashMap::new()),
            deleted: AtomicBool::new(false),
            walk_request_count: AtomicU64::new(0),
            walk_complete_count: AtomicU64::new(0),
            notify_count: AtomicU64::new(0),
        }
    }

    /// Add or replace the path `path_id` from `peer`, returning the flags of
    /// the path it replaced
    pub fn add_path(
        &self,
        prefix: IpNetwork,
        peer: IpAddr,
        path_id: u32,
        attributes: Arc<PathAttributes>,
        flags: PathFlags,
    ) -> Option<PathFlags> {
        let mut routes = self.routes.lock();
        let route = routes.entry(prefix).or_insert_with(|| Route::new(prefix));
        let (old, _) = route.input_common(
            PathKey::new(peer, path_id),
            RouteOperation::AddChange { attributes, flags },
        );
        trace!("{} added path {}#{} for {}", self.name, peer, path_id, prefix);
        old.map(|p| p.flags())
    }

    pub fn delete_path(&self, prefix: IpNetwork, peer: IpAddr, path_id: u32) -> bool {
        let mut routes = self.routes.lock();
        let deleted = match routes.get_mut(&prefix) {
            Some(route) => {
                route
                    .input_common(PathKey::new(peer, path_id), RouteOperation::Delete)
                    .1
            }
            None => false,
        };
        if routes.get(&prefix).map(Route::is_empty).unwrap_or(false) {
            routes.remove(&prefix);
        }
        deleted
    }

    pub fn find_path(&self, prefix: IpNetwork, peer: IpAddr, path_id: u32) -> Option<Path> {
        self.routes
            .lock()
            .get(&prefix)
            .and_then(|r| r.path(PathKey::new(peer, path_id)).cloned())
    }

    /// Snapshot of all routes, ordered by prefix
    pub fn routes(&self) -> Vec<Route> {
        self.routes
            .lock()
            .values()
            .cloned()
            .sorted_by_key(|r| (r.prefix().ip(), r.prefix().prefix()))
            .collect()
    }

    /// Number of paths learned from `peer`
    pub fn peer_path_count(&self, peer: IpAddr) -> usize {
        self.routes
            .lock()
            .values()
            .map(|r| r.peer_paths(peer).len())
            .sum()
    }

    pub fn ribouts(&self) -> Vec<Arc<RibOut>> {
        self.ribouts.lock().values().cloned().collect()
    }

    pub fn set_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn walk_request_count(&self) -> u64 {
        self.walk_request_count.load(Ordering::SeqCst)
    }

    pub fn walk_complete_count(&self) -> u64 {
        self.walk_complete_count.load(Ordering::SeqCst)
    }

    pub fn notify_count(&self) -> u64 {
        self.notify_count.load(Ordering::SeqCst)
    }
}

impl Table for BgpTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> Family {
        self.family
    }

    fn size(&self) -> usize {
        self.routes.lock().len()
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn ribout_locate(&self, policy: &RibExportPolicy) -> Arc<RibOut> {
        self.ribouts
            .lock()
            .entry(policy.clone())
            .or_insert_with(|| {
                debug!("{} created RibOut for [{}]", self.name, policy);
                Arc::new(RibOut::new(&self.name, policy.clone()))
            })
            .clone()
    }

    fn walk(&self, visitor: &mut dyn FnMut(&mut Route) -> bool) {
        self.walk_request_count.fetch_add(1, Ordering::SeqCst);
        let mut notified = 0;
        {
            let mut routes = self.routes.lock();
            for route in routes.values_mut() {
                if visitor(route) {
                    notified += 1;
                }
            }
            routes.retain(|_, route| !route.is_empty());
        }
        self.notify_count.fetch_add(notified, Ordering::SeqCst);
        self.walk_complete_count.fetch_add(1, Ordering::SeqCst);
        trace!("{} walk complete, {} routes notified", self.name, notified);
    }
}
