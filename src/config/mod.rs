mod file;

pub use file::ScriptAction;

use std::collections::HashSet;
use std::io::{Error, ErrorKind, Result};
use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;

use crate::peer::GracefulRestart;
use crate::rib::{Community, Encoding, Families, Family, RibExportPolicy};

/// Parse a TOML scenario file and return a MembershipConfig
pub fn from_file(path: &str) -> Result<MembershipConfig> {
    let spec = file::MembershipConfigSpec::from_file(path)?;
    MembershipConfig::from_spec(spec)
}

/// Parse TOML scenario text and return a MembershipConfig
pub fn from_str(contents: &str) -> Result<MembershipConfig> {
    let spec = file::MembershipConfigSpec::from_str(contents)?;
    MembershipConfig::from_spec(spec)
}

#[derive(Debug)]
pub struct MembershipConfig {
    pub tables: Vec<TableConfig>,
    pub peers: Vec<PeerConfig>,
    /// Sorted by time
    pub events: Vec<EventConfig>,
    /// Time to keep running after the last event
    pub duration: Duration,
}

#[derive(Debug)]
pub struct TableConfig {
    pub name: String,
    pub family: Family,
}

/// In-Memory representation of a Peer config
///   Restart capabilities are disabled when not configured
#[derive(Debug)]
pub struct PeerConfig {
    pub address: IpAddr,
    pub policy: RibExportPolicy,
    pub instance_id: i32,
    pub tables: Vec<String>,
    pub rib_in_only: bool,
    pub routes: Vec<IpNetwork>,
    pub communities: Vec<Community>,
    pub graceful_restart: GracefulRestart,
}

impl PeerConfig {
    pub fn is_xmpp(&self) -> bool {
        self.policy.encoding == Encoding::Xmpp
    }
}

#[derive(Debug)]
pub struct EventConfig {
    pub at: Duration,
    pub peer: IpAddr,
    pub action: ScriptAction,
    pub family: Option<Family>,
}

impl MembershipConfig {
    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    fn from_spec(spec: file::MembershipConfigSpec) -> Result<Self> {
        let mut names = HashSet::new();
        for table in &spec.tables {
            if !names.insert(table.name.as_str()) {
                return Err(invalid(format!("Duplicate table '{}'", table.name)));
            }
        }
        let mut addresses = HashSet::new();
        for peer in &spec.peers {
            if !addresses.insert(peer.address) {
                return Err(invalid(format!("Duplicate peer '{}'", peer.address)));
            }
            if let Some(name) = peer.tables.iter().find(|t| !names.contains(t.as_str())) {
                return Err(invalid(format!(
                    "Peer {} joins unknown table '{}'",
                    peer.address, name
                )));
            }
        }
        if let Some(event) = spec.events.iter().find(|e| !addresses.contains(&e.peer)) {
            return Err(invalid(format!("Event for unknown peer {}", event.peer)));
        }

        let tables = spec
            .tables
            .iter()
            .map(|t| TableConfig {
                name: t.name.clone(),
                family: t.family,
            })
            .collect();

        let peers = spec
            .peers
            .iter()
            .map(|p| PeerConfig {
                address: p.address,
                policy: RibExportPolicy {
                    encoding: p.encoding,
                    as_number: p.as_number,
                    llgr: p.llgr,
                },
                instance_id: p.instance_id,
                tables: p.tables.clone(),
                rib_in_only: p.rib_in_only,
                routes: p.routes.clone(),
                communities: p.communities.clone(),
                graceful_restart: p
                    .graceful_restart
                    .as_ref()
                    .map(|gr| GracefulRestart {
                        enabled: gr.time > 0,
                        long_lived: gr.long_lived_time > 0,
                        time: gr.time,
                        long_lived_time: gr.long_lived_time,
                        families: Families::new(gr.families.clone()),
                    })
                    .unwrap_or_default(),
            })
            .collect();

        let mut events: Vec<_> = spec
            .events
            .iter()
            .map(|e| EventConfig {
                at: Duration::from_secs(e.at),
                peer: e.peer,
                action: e.action,
                family: e.family,
            })
            .collect();
        // Stable, events at the same second keep file order
        events.sort_by_key(|e| e.at);

        Ok(Self {
            tables,
            peers,
            events,
            duration: Duration::from_secs(spec.duration),
        })
    }
}

fn invalid(message: String) -> Error {
    Error::new(ErrorKind::InvalidInput, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_config() {
        let config = from_file("./demos/scenario.toml").unwrap();
        assert_eq!(config.tables.len(), 2);
        assert!(config.table("inet6.0").is_some());
        assert_eq!(config.peers.len(), 3);

        let restarting = &config.peers[0];
        assert!(restarting.graceful_restart.enabled);
        assert!(restarting.graceful_restart.long_lived);
        assert_eq!(restarting.policy, RibExportPolicy::bgp(65001));

        let agent = config.peers.iter().find(|p| p.is_xmpp()).unwrap();
        assert!(!agent.graceful_restart.enabled);
        assert_eq!(agent.policy, RibExportPolicy::xmpp());

        let times: Vec<_> = config.events.iter().map(|e| e.at.as_secs()).collect();
        let mut sorted = times.clone();
        sorted.sort_unstable();
        assert_eq!(times, sorted);
    }

    #[test]
    fn test_events_sorted() {
        let config = from_str(
            r#"
            [[peers]]
            address = "10.0.0.1"

            [[events]]
            at = 9
            peer = "10.0.0.1"
            action = "up"

            [[events]]
            at = 2
            peer = "10.0.0.1"
            action = "close"

            [[events]]
            at = 9
            peer = "10.0.0.1"
            action = "eor"
            "#,
        )
        .unwrap();
        let actions: Vec<_> = config.events.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![ScriptAction::Close, ScriptAction::Up, ScriptAction::EndOfRib]
        );
        assert!(!config.peers[0].graceful_restart.enabled);
    }

    #[test]
    fn test_unknown_references() {
        let err = from_str(
            r#"
            [[peers]]
            address = "10.0.0.1"
            tables = ["missing"]
            "#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = from_str(
            r#"
            [[peers]]
            address = "10.0.0.1"

            [[events]]
            at = 1
            peer = "10.0.0.2"
            action = "close"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown peer"));

        let err = from_str(
            r#"
            [[tables]]
            name = "inet.0"
            [[tables]]
            name = "inet.0"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate table"));
    }
}
