//! Drive simulated peers through a configured sequence of session events
//!
//! Every configured peer joins its tables and learns its routes at start.
//! Events then fire at their configured offsets; the membership task is
//! allowed to drain after each one so the next event sees settled state.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bgp_rs::AFI;
use log::{info, warn};
use tokio::time::{sleep_until, Instant};

use crate::api::{PeerReport, ScenarioReport, TableReport};
use crate::close::PeerCloseManager;
use crate::config::{EventConfig, MembershipConfig, PeerConfig, ScriptAction};
use crate::membership::MembershipManager;
use crate::peer::{Peer, SimPeer};
use crate::rib::{BgpTable, PathAttributes, PathFlags, Table};

struct ScenarioPeer {
    config: PeerConfig,
    peer: Arc<SimPeer>,
    close: Arc<PeerCloseManager>,
}

pub struct Scenario {
    membership: MembershipManager,
    tables: Vec<Arc<BgpTable>>,
    peers: Vec<ScenarioPeer>,
    events: Vec<EventConfig>,
    config_duration: Duration,
}

impl Scenario {
    /// Must be called from within a tokio runtime
    pub fn new(config: MembershipConfig) -> Self {
        let membership = MembershipManager::spawn();
        let tables = config
            .tables
            .iter()
            .map(|t| Arc::new(BgpTable::new(&t.name, t.family)))
            .collect();
        let peers = config
            .peers
            .into_iter()
            .map(|config| {
                let peer = SimPeer::new(
                    config.address,
                    config.is_xmpp(),
                    config.graceful_restart.clone(),
                );
                let close = peer.attach_close_manager(&membership);
                ScenarioPeer {
                    config,
                    peer,
                    close,
                }
            })
            .collect();
        Self {
            membership,
            tables,
            peers,
            events: config.events,
            config_duration: config.duration,
        }
    }

    pub fn membership(&self) -> &MembershipManager {
        &self.membership
    }

    pub fn table(&self, name: &str) -> Option<&Arc<BgpTable>> {
        self.tables.iter().find(|t| t.name() == name)
    }

    pub fn peer(&self, addr: IpAddr) -> Option<&Arc<SimPeer>> {
        self.find(addr).map(|p| &p.peer)
    }

    fn find(&self, addr: IpAddr) -> Option<&ScenarioPeer> {
        self.peers.iter().find(|p| p.config.address == addr)
    }

    /// Join every peer to its tables and run all events to completion
    pub async fn run(&self) -> ScenarioReport {
        let start = Instant::now();
        for peer in &self.peers {
            self.join(peer);
        }
        self.membership.wait_for_idle().await;
        info!(
            "{} peers joined {} tables, {} events to run",
            self.peers.len(),
            self.tables.len(),
            self.events.len()
        );

        for event in &self.events {
            sleep_until(start + event.at).await;
            self.apply(event);
            self.membership.wait_for_idle().await;
        }
        let last = self.events.last().map(|e| e.at).unwrap_or_default();
        sleep_until(start + last + self.config_duration).await;
        self.membership.wait_for_idle().await;
        self.report()
    }

    /// Register to tables and learn configured routes
    fn join(&self, peer: &ScenarioPeer) {
        let attributes = Arc::new(
            PathAttributes::new(Some(peer.config.address))
                .with_communities(peer.config.communities.clone()),
        );
        for table in self.peer_tables(&peer.config) {
            let result = if peer.config.rib_in_only {
                self.membership
                    .register_rib_in(peer.peer.clone(), table.clone())
            } else {
                peer.peer.register(
                    &self.membership,
                    table.clone(),
                    peer.config.policy.clone(),
                    peer.config.instance_id,
                )
            };
            if let Err(err) = result {
                warn!("{} join {}: {}", peer.config.address, table.name(), err);
                continue;
            }
            let family = table.family();
            for prefix in peer
                .config
                .routes
                .iter()
                .filter(|p| p.is_ipv4() == (family.afi == AFI::IPV4))
            {
                let old = table.add_path(
                    *prefix,
                    peer.config.address,
                    0,
                    attributes.clone(),
                    PathFlags::default(),
                );
                peer.close
                    .update_route_stats(family, old, PathFlags::default());
            }
        }
    }

    fn peer_tables(&self, config: &PeerConfig) -> Vec<Arc<BgpTable>> {
        config
            .tables
            .iter()
            .filter_map(|name| self.table(name).cloned())
            .collect()
    }

    fn apply(&self, event: &EventConfig) {
        let peer = match self.find(event.peer) {
            Some(peer) => peer,
            None => {
                warn!("Event {} for unknown peer {}", event.action, event.peer);
                return;
            }
        };
        info!("[{:?}] {} {}", event.at, event.peer, event.action);
        match event.action {
            ScriptAction::Close => {
                peer.peer.set_ready(false);
                peer.peer.close(true);
            }
            ScriptAction::HardClose => {
                peer.peer.set_ready(false);
                peer.peer.close(false);
            }
            ScriptAction::Up => {
                peer.peer.set_ready(true);
                self.join(peer);
            }
            ScriptAction::Down => peer.peer.set_ready(false),
            ScriptAction::EndOfRib => match event.family {
                Some(family) => peer.close.process_eor_marker_received(family),
                None => peer.close.process_eor_all(),
            },
            ScriptAction::Block => peer.peer.set_blocked(true),
            ScriptAction::Unblock => peer.peer.set_blocked(false),
            ScriptAction::Unregister => {
                for table in self.membership.get_registered_ribs(&*peer.peer) {
                    let result = if self.membership.is_rib_out_registered(&*peer.peer, &*table) {
                        peer.peer.unregister(&self.membership, table.clone())
                    } else {
                        peer.peer.unregister_rib_in(&self.membership, table.clone())
                    };
                    if let Err(err) = result {
                        warn!("{} leave {}: {}", event.peer, table.name(), err);
                    }
                }
            }
            ScriptAction::Walk => {
                for table in self.membership.get_registered_ribs(&*peer.peer) {
                    let name = table.name().to_owned();
                    if let Err(err) = peer.peer.walk_rib_in(&self.membership, table) {
                        warn!("{} walk {}: {}", event.peer, name, err);
                    }
                }
            }
        }
    }

    pub fn report(&self) -> ScenarioReport {
        let tables = self
            .tables
            .iter()
            .map(|table| TableReport {
                name: table.name().to_owned(),
                family: table.family().to_string(),
                walks_requested: table.walk_request_count(),
                walks_completed: table.walk_complete_count(),
                membership: self.membership.table_membership_info(table.name()),
                routes: table.routes().iter().map(Into::into).collect(),
            })
            .collect();
        let peers = self
            .peers
            .iter()
            .map(|p| PeerReport {
                peer: p.peer.name(),
                xmpp: p.peer.is_xmpp(),
                ready: Peer::is_ready(&*p.peer),
                calls: p.peer.counts(),
                close: p.close.close_info(),
                tables: self.membership.peer_membership_info(&*p.peer),
            })
            .collect();
        ScenarioReport {
            memberships: self.membership.get_membership_count(),
            total_jobs: self.membership.total_jobs_count(),
            tables,
            peers,
        }
    }
}
