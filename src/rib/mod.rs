pub mod attributes;
pub mod community;
pub mod families;
pub mod ribout;
pub mod table;

pub use attributes::PathAttributes;
pub use community::{Community, CommunityList};
pub use families::{Families, Family};
pub use ribout::{Encoding, RibExportPolicy, RibOut, RouteUpdate};
pub use table::{BgpTable, Table};

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;

/// Identifies one path of a route: the peer it was learned from and its path id
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey {
    pub peer: IpAddr,
    pub path_id: u32,
}

impl PathKey {
    pub fn new(peer: IpAddr, path_id: u32) -> Self {
        Self { peer, path_id }
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.path_id)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PathFlags {
    pub stale: bool,
    pub llgr_stale: bool,
}

impl PathFlags {
    pub fn stale() -> Self {
        Self {
            stale: true,
            llgr_stale: false,
        }
    }

    pub fn llgr_stale() -> Self {
        Self {
            stale: false,
            llgr_stale: true,
        }
    }

    /// Flags carried over on modify with the extra flags set
    pub fn merge(self, other: PathFlags) -> Self {
        Self {
            stale: self.stale || other.stale,
            llgr_stale: self.llgr_stale || other.llgr_stale,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Path {
    // Time received
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) key: PathKey,
    pub(crate) attributes: Arc<PathAttributes>,
    pub(crate) flags: PathFlags,
}

impl Path {
    pub fn new(key: PathKey, attributes: Arc<PathAttributes>, flags: PathFlags) -> Self {
        Self {
            timestamp: Utc::now(),
            key,
            attributes,
            flags,
        }
    }

    pub fn key(&self) -> PathKey {
        self.key
    }

    pub fn peer(&self) -> IpAddr {
        self.key.peer
    }

    pub fn attributes(&self) -> &Arc<PathAttributes> {
        &self.attributes
    }

    pub fn flags(&self) -> PathFlags {
        self.flags
    }

    pub fn is_stale(&self) -> bool {
        self.flags.stale
    }

    pub fn is_llgr_stale(&self) -> bool {
        self.flags.llgr_stale
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Mutation applied to a single path of a route
#[derive(Debug, Clone)]
pub enum RouteOperation {
    AddChange {
        attributes: Arc<PathAttributes>,
        flags: PathFlags,
    },
    Delete,
}

#[derive(Debug, Clone)]
pub struct Route {
    prefix: IpNetwork,
    paths: Vec<Path>,
}

impl Route {
    pub fn new(prefix: IpNetwork) -> Self {
        Self {
            prefix,
            paths: Vec::with_capacity(2),
        }
    }

    pub fn prefix(&self) -> IpNetwork {
        self.prefix
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    pub fn path(&self, key: PathKey) -> Option<&Path> {
        self.paths.iter().find(|p| p.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Keys of paths learned from `peer`
    pub fn peer_paths(&self, peer: IpAddr) -> Vec<PathKey> {
        self.paths
            .iter()
            .filter(|p| p.peer() == peer)
            .map(|p| p.key)
            .collect()
    }

    /// Preferred path: fresh paths win over stale ones, then highest local pref
    pub fn best_path(&self) -> Option<&Path> {
        self.paths.iter().min_by_key(|p| {
            (
                p.flags.llgr_stale,
                p.flags.stale,
                std::cmp::Reverse(p.attributes.local_pref.unwrap_or(100)),
            )
        })
    }

    /// Apply an add/change or delete for one path
    ///
    /// Returns the replaced path (if any) and whether the route changed
    pub fn input_common(&mut self, key: PathKey, oper: RouteOperation) -> (Option<Path>, bool) {
        let position = self.paths.iter().position(|p| p.key == key);
        match (oper, position) {
            (RouteOperation::Delete, Some(index)) => {
                let old = self.paths.remove(index);
                (Some(old), true)
            }
            (RouteOperation::Delete, None) => (None, false),
            (RouteOperation::AddChange { attributes, flags }, Some(index)) => {
                let path = Path::new(key, attributes, flags);
                let old = std::mem::replace(&mut self.paths[index], path);
                (Some(old), true)
            }
            (RouteOperation::AddChange { attributes, flags }, None) => {
                self.paths.push(Path::new(key, attributes, flags));
                (None, true)
            }
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Route {} paths={}>", self.prefix, self.paths.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(local_pref: Option<u32>) -> Arc<PathAttributes> {
        let mut attrs = PathAttributes::new(None);
        attrs.local_pref = local_pref;
        Arc::new(attrs)
    }

    #[test]
    fn test_input_common() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let key = PathKey::new(peer, 0);
        let mut route = Route::new("192.168.1.0/24".parse().unwrap());

        let (old, changed) = route.input_common(
            key,
            RouteOperation::AddChange {
                attributes: attrs(None),
                flags: PathFlags::default(),
            },
        );
        assert!(old.is_none() && changed);
        assert_eq!(route.peer_paths(peer), vec![key]);

        let (old, _) = route.input_common(
            key,
            RouteOperation::AddChange {
                attributes: attrs(None),
                flags: PathFlags::stale(),
            },
        );
        assert!(!old.unwrap().is_stale());
        assert!(route.path(key).unwrap().is_stale());

        let (old, changed) = route.input_common(key, RouteOperation::Delete);
        assert!(old.is_some() && changed);
        assert!(route.is_empty());
        assert!(!route.input_common(key, RouteOperation::Delete).1);
    }

    #[test]
    fn test_best_path_prefers_fresh() {
        let mut route = Route::new("10.1.0.0/16".parse().unwrap());
        let stale = PathKey::new("10.0.0.1".parse().unwrap(), 0);
        let fresh = PathKey::new("10.0.0.2".parse().unwrap(), 0);
        route.input_common(
            stale,
            RouteOperation::AddChange {
                attributes: attrs(Some(500)),
                flags: PathFlags::stale(),
            },
        );
        route.input_common(
            fresh,
            RouteOperation::AddChange {
                attributes: attrs(Some(50)),
                flags: PathFlags::default(),
            },
        );
        assert_eq!(route.best_path().unwrap().key(), fresh);
    }
}
