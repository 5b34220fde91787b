//! Serializable snapshots for reporting
//!
//! These are built from live state on request and never fed back into it.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::Utc;
use serde::Serialize;

use crate::close::RouteStats;
use crate::membership::Action;
use crate::peer::PeerCallCounts;
use crate::rib::{Path, Route};
use crate::utils::format_elapsed_time;

#[derive(Debug, Serialize)]
pub struct MembershipPeerInfo {
    pub peer: String,
    pub ribin_registered: bool,
    pub ribout_registered: bool,
    pub instance_id: i32,
    pub generation_id: u64,
    pub action: Action,
}

#[derive(Debug, Serialize)]
pub struct TableMembershipInfo {
    pub table: String,
    pub requests: u64,
    pub walks: u64,
    pub peers: Vec<MembershipPeerInfo>,
}

#[derive(Debug, Serialize)]
pub struct PeerTableInfo {
    pub table: String,
    pub current_state: String,
    pub ribin_registered: bool,
    pub ribout_registered: bool,
    pub policy: Option<String>,
    pub queue_depth: usize,
}

#[derive(Debug, Serialize)]
pub struct PeerCloseInfo {
    pub peer: String,
    pub state: String,
    pub membership_state: String,
    pub close_again: bool,
    pub graceful: bool,
    pub init: u64,
    pub close: u64,
    pub nested: u64,
    pub deletes: u64,
    pub stale: u64,
    pub llgr_stale: u64,
    pub sweep: u64,
    pub gr_timer: u64,
    pub llgr_timer: u64,
    pub route_stats: BTreeMap<String, RouteStats>,
}

#[derive(Debug, Serialize)]
pub struct LearnedPath {
    pub source: IpAddr,
    pub path_id: u32,
    pub received_at: i64,
    pub age: String,
    pub next_hop: Option<IpAddr>,
    pub origin: String,
    pub as_path: String,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub communities: Vec<String>,
    pub stale: bool,
    pub llgr_stale: bool,
}

impl From<&Path> for LearnedPath {
    fn from(path: &Path) -> Self {
        let attributes = path.attributes();
        let age = (Utc::now() - path.timestamp())
            .to_std()
            .unwrap_or_default();
        LearnedPath {
            source: path.peer(),
            path_id: path.key().path_id,
            received_at: path.timestamp().timestamp(),
            age: format_elapsed_time(age),
            next_hop: attributes.next_hop,
            origin: attributes.origin.to_string(),
            as_path: attributes.as_path_string(),
            local_pref: attributes.local_pref,
            multi_exit_disc: attributes.multi_exit_disc,
            communities: attributes
                .communities
                .iter()
                .map(std::string::ToString::to_string)
                .collect(),
            stale: path.is_stale(),
            llgr_stale: path.is_llgr_stale(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LearnedRoute {
    pub prefix: String,
    pub paths: Vec<LearnedPath>,
}

impl From<&Route> for LearnedRoute {
    fn from(route: &Route) -> Self {
        LearnedRoute {
            prefix: route.prefix().to_string(),
            paths: route.paths().iter().map(LearnedPath::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TableReport {
    pub name: String,
    pub family: String,
    pub walks_requested: u64,
    pub walks_completed: u64,
    pub membership: Option<TableMembershipInfo>,
    pub routes: Vec<LearnedRoute>,
}

#[derive(Debug, Serialize)]
pub struct PeerReport {
    pub peer: String,
    pub xmpp: bool,
    pub ready: bool,
    pub calls: PeerCallCounts,
    pub close: PeerCloseInfo,
    pub tables: Vec<PeerTableInfo>,
}

/// Final state of a scenario run
#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub memberships: usize,
    pub total_jobs: u64,
    pub tables: Vec<TableReport>,
    pub peers: Vec<PeerReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::rib::{Community, PathAttributes, PathFlags, PathKey, RouteOperation};

    #[test]
    fn test_learned_route() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let mut route = Route::new("192.168.10.0/24".parse().unwrap());
        let attributes = PathAttributes::new(Some(peer))
            .with_as_path(vec![65000, 100])
            .with_communities(vec![Community::STANDARD(crate::rib::community::NO_LLGR)]);
        route.input_common(
            PathKey::new(peer, 1),
            RouteOperation::AddChange {
                attributes: Arc::new(attributes),
                flags: PathFlags::stale(),
            },
        );
        let learned = LearnedRoute::from(&route);
        assert_eq!(learned.prefix, "192.168.10.0/24");
        assert_eq!(learned.paths.len(), 1);
        let path = &learned.paths[0];
        assert_eq!(path.as_path, "65000 100");
        assert_eq!(path.communities, vec!["no-llgr".to_string()]);
        assert!(path.stale && !path.llgr_stale);
        assert_eq!(path.age, "00:00:00");
    }
}
