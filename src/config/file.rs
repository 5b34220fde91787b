use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::net::IpAddr;

use bgp_rs::{AFI, SAFI};
use ipnetwork::IpNetwork;
use serde::{self, Deserialize, Deserializer, Serialize, Serializer};
use toml;

use crate::rib::{Community, Encoding, Family};

struct Defaults {}

impl Defaults {
    fn family() -> Family {
        Family::new(AFI::IPV4, SAFI::Unicast)
    }

    fn encoding() -> Encoding {
        Encoding::Bgp
    }

    fn instance_id() -> i32 {
        -1
    }

    fn graceful_restart_time() -> u32 {
        120
    }

    fn families() -> Vec<Family> {
        vec![Family::new(AFI::IPV4, SAFI::Unicast)]
    }

    fn duration() -> u64 {
        10
    }
}

/// Config (toml) representation of a routing table
#[derive(Clone, Debug, Deserialize)]
pub(super) struct TableConfigSpec {
    pub(super) name: String,
    #[serde(default = "Defaults::family")]
    pub(super) family: Family,
}

/// Config (toml) representation of graceful restart capabilities
#[derive(Clone, Debug, Deserialize)]
pub(super) struct GracefulRestartSpec {
    // Seconds to hold stale paths, 0 disables graceful restart
    #[serde(default = "Defaults::graceful_restart_time")]
    pub(super) time: u32,
    // Seconds to hold LLGR_STALE paths after `time`, 0 disables LLGR
    #[serde(default)]
    pub(super) long_lived_time: u32,
    #[serde(default = "Defaults::families")]
    pub(super) families: Vec<Family>,
}

/// Config (toml) representation of a Peer Config
#[derive(Clone, Debug, Deserialize)]
pub(super) struct PeerConfigSpec {
    pub(super) address: IpAddr,
    #[serde(default = "Defaults::encoding")]
    pub(super) encoding: Encoding,
    // Export policy of the peer's RibOut
    #[serde(default)]
    pub(super) as_number: u32,
    #[serde(default)]
    pub(super) llgr: bool,
    #[serde(default = "Defaults::instance_id")]
    pub(super) instance_id: i32,

    // Tables to join, by name
    #[serde(default = "Vec::new")]
    pub(super) tables: Vec<String>,
    // Only receive from this peer, nothing is advertised to it
    #[serde(default)]
    pub(super) rib_in_only: bool,

    // Paths learned from this peer, added to every joined table of the
    // same family
    #[serde(default = "Vec::new")]
    pub(super) routes: Vec<IpNetwork>,
    #[serde(default = "Vec::new")]
    pub(super) communities: Vec<Community>,

    pub(super) graceful_restart: Option<GracefulRestartSpec>,
}

/// Config (toml) representation of a scripted peer event
#[derive(Clone, Debug, Deserialize)]
pub(super) struct EventSpec {
    // Seconds since scenario start
    pub(super) at: u64,
    pub(super) peer: IpAddr,
    pub(super) action: ScriptAction,
    // Only used by `end-of-rib`, all families when missing
    pub(super) family: Option<Family>,
}

#[derive(Debug, Deserialize)]
pub(super) struct MembershipConfigSpec {
    #[serde(default = "Vec::new")]
    pub(super) tables: Vec<TableConfigSpec>,
    #[serde(default = "Vec::new")]
    pub(super) peers: Vec<PeerConfigSpec>,
    #[serde(default = "Vec::new")]
    pub(super) events: Vec<EventSpec>,
    // Seconds to keep running after the last event
    #[serde(default = "Defaults::duration")]
    pub(super) duration: u64,
}

impl MembershipConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_str(&contents)
    }

    pub(super) fn from_str(contents: &str) -> io::Result<Self> {
        toml::from_str(contents).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

/// Something that happens to a peer while a scenario runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptAction {
    /// Session dropped, paths held if graceful restart was negotiated
    Close,
    /// Session dropped, paths deleted right away
    HardClose,
    /// Session re-established
    Up,
    /// Session down without closing
    Down,
    EndOfRib,
    /// Another user holds the membership manager for this peer
    Block,
    Unblock,
    Unregister,
    Walk,
}

impl fmt::Display for ScriptAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ScriptAction::*;
        let display = match self {
            Close => "close",
            HardClose => "hard-close",
            Up => "up",
            Down => "down",
            EndOfRib => "end-of-rib",
            Block => "block",
            Unblock => "unblock",
            Unregister => "unregister",
            Walk => "walk",
        };
        write!(f, "{}", display)
    }
}

impl Serialize for ScriptAction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScriptAction {
    fn deserialize<D>(deserializer: D) -> Result<ScriptAction, D::Error>
    where
        D: Deserializer<'de>,
    {
        use ScriptAction::*;
        let s = String::deserialize(deserializer)?;
        match s.to_lowercase().replace('_', "-").as_str() {
            "close" => Ok(Close),
            "hard-close" => Ok(HardClose),
            "up" => Ok(Up),
            "down" => Ok(Down),
            "end-of-rib" | "eor" => Ok(EndOfRib),
            "block" => Ok(Block),
            "unblock" => Ok(Unblock),
            "unregister" => Ok(Unregister),
            "walk" => Ok(Walk),
            _ => Err(serde::de::Error::custom(format!(
                "Unsupported action: '{}'",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_config() {
        let config = MembershipConfigSpec::from_file("./demos/scenario.toml").unwrap();
        assert_eq!(config.tables.len(), 2);
        assert_eq!(config.tables[0].name, "inet.0");
        assert_eq!(config.tables[1].family, Family::new(AFI::IPV6, SAFI::Unicast));

        let restarting = config
            .peers
            .iter()
            .find(|p| p.address == IpAddr::from(Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();
        assert_eq!(restarting.encoding, Encoding::Bgp);
        assert_eq!(restarting.as_number, 65001);
        assert_eq!(restarting.instance_id, -1);
        let gr = restarting.graceful_restart.as_ref().unwrap();
        assert_eq!(gr.time, 5);
        assert_eq!(gr.long_lived_time, 30);
        assert_eq!(gr.families.len(), 1);

        let agent = config
            .peers
            .iter()
            .find(|p| p.encoding == Encoding::Xmpp)
            .unwrap();
        assert!(agent.graceful_restart.is_none());
        assert_eq!(config.events[0].action, ScriptAction::Close);
        assert_eq!(config.duration, 5);
    }

    #[test]
    fn test_defaults() {
        let config = MembershipConfigSpec::from_str(
            r#"
            [[tables]]
            name = "blue.inet.0"

            [[peers]]
            address = "192.168.1.1"
            tables = ["blue.inet.0"]
            [peers.graceful_restart]
            "#,
        )
        .unwrap();
        assert_eq!(config.tables[0].family, Defaults::family());
        let peer = &config.peers[0];
        assert_eq!(peer.encoding, Encoding::Bgp);
        assert!(!peer.rib_in_only);
        let gr = peer.graceful_restart.as_ref().unwrap();
        assert_eq!(gr.time, 120);
        assert_eq!(gr.long_lived_time, 0);
        assert!(config.events.is_empty());
        assert_eq!(config.duration, 10);
    }

    #[test]
    fn test_bad_action() {
        let err = MembershipConfigSpec::from_str(
            r#"
            [[events]]
            at = 1
            peer = "10.0.0.1"
            action = "explode"
            "#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("Unsupported action"));
    }
}
