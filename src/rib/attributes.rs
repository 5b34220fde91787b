use std::net::IpAddr;

use bgp_rs::{ASPath, Origin, Segment};

use crate::rib::{Community, CommunityList};
use crate::utils::u32_to_dotted;

#[derive(Debug, Clone)]
pub struct PathAttributes {
    pub next_hop: Option<IpAddr>,
    pub origin: Origin,
    pub as_path: ASPath,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub communities: CommunityList,
}

impl PathAttributes {
    pub fn new(next_hop: Option<IpAddr>) -> Self {
        Self {
            next_hop,
            origin: Origin::INCOMPLETE,
            as_path: ASPath { segments: vec![] },
            local_pref: None,
            multi_exit_disc: None,
            communities: CommunityList::default(),
        }
    }

    pub fn with_communities(mut self, communities: Vec<Community>) -> Self {
        self.communities = CommunityList(communities);
        self
    }

    pub fn with_as_path(mut self, asns: Vec<u32>) -> Self {
        self.as_path = ASPath {
            segments: vec![Segment::AS_SEQUENCE(asns)],
        };
        self
    }

    pub fn as_path_string(&self) -> String {
        self.as_path
            .segments
            .iter()
            .map(|segment| {
                let asns = match segment {
                    Segment::AS_SEQUENCE(asns) => asns,
                    Segment::AS_SET(asns) => asns,
                };
                asns.iter()
                    .map(|asn| u32_to_dotted(*asn, '.'))
                    .collect::<Vec<String>>()
                    .join(" ")
            })
            .collect::<Vec<String>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::community::NO_LLGR;

    #[test]
    fn test_builder() {
        let attrs = PathAttributes::new(Some("10.0.0.1".parse().unwrap()))
            .with_as_path(vec![100, 4259840100])
            .with_communities(vec![Community::STANDARD(NO_LLGR)]);
        assert_eq!(attrs.as_path_string(), "100 65000.100");
        assert!(attrs.communities.contains_value(NO_LLGR));
    }
}
