use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::slice::Iter;

use serde::{Deserialize, Serialize};

use crate::utils::u32_to_dotted;

/// Well-known LLGR_STALE community (RFC 9494)
pub const LLGR_STALE: u32 = 0xFFFF_0006;
/// Well-known NO_LLGR community (RFC 9494)
pub const NO_LLGR: u32 = 0xFFFF_0007;

#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Community {
    STANDARD(u32),
    EXTENDED(u64),
}

impl fmt::Display for Community {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Community::STANDARD(NO_LLGR) => write!(f, "no-llgr"),
            Community::STANDARD(LLGR_STALE) => write!(f, "llgr-stale"),
            Community::STANDARD(value) => write!(f, "{}", u32_to_dotted(*value, ':')),
            Community::EXTENDED(value) => write!(f, "0x{:016x}", value),
        }
    }
}

impl TryFrom<&str> for Community {
    type Error = io::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let invalid = || io::Error::new(io::ErrorKind::InvalidInput, "Invalid community");
        match value {
            "no-llgr" => return Ok(Community::STANDARD(NO_LLGR)),
            "llgr-stale" => return Ok(Community::STANDARD(LLGR_STALE)),
            _ => (),
        }
        // Parse to list of u32, since we should support 4 byte ASN as a single int
        // (E.g. "42598400100")
        let chunks: Vec<_> = value.split(':').collect();
        match chunks.len() {
            1 => chunks[0]
                .parse()
                .map(Community::STANDARD)
                .map_err(|_| invalid()),
            2 => {
                let (a, b) = (
                    chunks[0].parse::<u16>().map_err(|_| invalid())?,
                    chunks[1].parse::<u16>().map_err(|_| invalid())?,
                );
                Ok(Community::STANDARD((u32::from(a) << 16) + u32::from(b)))
            }
            _ => Err(invalid()),
        }
    }
}

impl<'de> Deserialize<'de> for Community {
    fn deserialize<D>(deserializer: D) -> Result<Community, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Community::try_from(s.as_str()).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CommunityList(pub Vec<Community>);

impl CommunityList {
    pub fn iter(&self) -> Iter<Community> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Is a standard community with this value attached?
    pub fn contains_value(&self, value: u32) -> bool {
        self.0
            .iter()
            .any(|c| matches!(c, Community::STANDARD(comm) if *comm == value))
    }
}

impl fmt::Display for CommunityList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let communities = self
            .0
            .iter()
            .map(std::string::ToString::to_string)
            .collect::<Vec<String>>()
            .join(" ");
        write!(f, "{}", communities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_community_list_display() {
        assert_eq!(
            CommunityList(vec![Community::STANDARD(100), Community::STANDARD(200)]).to_string(),
            "100 200"
        );
        assert_eq!(
            CommunityList(vec![
                Community::STANDARD(4259840100),
                Community::STANDARD(NO_LLGR)
            ])
            .to_string(),
            "65000:100 no-llgr"
        );
    }

    #[test]
    fn test_community_parse() {
        assert_eq!(
            Community::try_from("65000:100").unwrap(),
            Community::STANDARD(4259840100)
        );
        assert_eq!(
            Community::try_from("no-llgr").unwrap(),
            Community::STANDARD(NO_LLGR)
        );
        assert!(Community::try_from("65000:100:1").is_err());
        assert!(Community::try_from("70000:1").is_err());
    }

    #[test]
    fn test_contains_value() {
        let list = CommunityList(vec![Community::STANDARD(100), Community::EXTENDED(100)]);
        assert!(list.contains_value(100));
        assert!(!list.contains_value(NO_LLGR));
    }
}
