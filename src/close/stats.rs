use std::collections::HashMap;

use serde::Serialize;

use crate::rib::Family;

/// Per-family path counters for the current close cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct RouteStats {
    pub staled: u64,
    pub llgr_staled: u64,
    pub refreshed: u64,
    pub fresh: u64,
    pub deleted: u64,
}

impl RouteStats {
    pub fn is_set(&self) -> bool {
        *self != RouteStats::default()
    }
}

#[derive(Clone, Debug, Default)]
pub struct CloseStats {
    pub init: u64,
    pub close: u64,
    pub nested: u64,
    pub deletes: u64,
    pub stale: u64,
    pub llgr_stale: u64,
    pub sweep: u64,
    pub gr_timer: u64,
    pub llgr_timer: u64,
    pub route_stats: HashMap<Family, RouteStats>,
}

impl CloseStats {
    pub fn reset_route_stats(&mut self) {
        self.route_stats.clear();
    }

    pub(crate) fn route(&mut self, family: Family) -> &mut RouteStats {
        self.route_stats.entry(family).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgp_rs::{AFI, SAFI};

    #[test]
    fn test_route_stats() {
        let mut stats = CloseStats::default();
        let family = Family::new(AFI::IPV4, SAFI::Unicast);
        assert!(!stats.route(family).is_set());
        stats.route(family).staled += 2;
        assert!(stats.route_stats[&family].is_set());
        stats.reset_route_stats();
        assert!(stats.route_stats.is_empty());
    }
}
