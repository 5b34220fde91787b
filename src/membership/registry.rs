use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;

use crate::peer::Peer;
use crate::rib::{RibExportPolicy, RibOut, Table};

/// Pending request for a (peer, table) pair
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Action {
    None,
    RibOutAdd,
    RibInDelete,
    RibInWalk,
    RibInWalkRibOutDelete,
    RibInDeleteRibOutDelete,
}

impl Action {
    /// Does the walk for this action visit the peer's RibIn paths?
    pub fn visits_rib_in(self) -> bool {
        !matches!(self, Action::None | Action::RibOutAdd)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Action::*;
        let word = match self {
            None => "None",
            RibOutAdd => "RibOutAdd",
            RibInDelete => "RibInDelete",
            RibInWalk => "RibInWalk",
            RibInWalkRibOutDelete => "RibInWalkRibOutDelete",
            RibInDeleteRibOutDelete => "RibInDeleteRibOutDelete",
        };
        write!(f, "{}", word)
    }
}

// Handles are never reused, so an event carrying a handle for an entry that
// was destroyed and recreated finds nothing instead of the new entry.
macro_rules! handle {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub(crate) struct $name(u64);

        #[cfg(test)]
        impl $name {
            pub(crate) fn for_test(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle!(PeerId);
handle!(TableId);
handle!(EntryId);

pub(crate) struct PeerEntry {
    pub(crate) peer: Arc<dyn Peer>,
    pub(crate) tables: BTreeMap<TableId, EntryId>,
}

pub(crate) struct TableEntry {
    pub(crate) table: Arc<dyn Table>,
    // Every entry for this table
    pub(crate) live: BTreeSet<EntryId>,
    // Entries with an action waiting for the next walk
    pub(crate) pending: BTreeSet<EntryId>,
    pub(crate) request_count: u64,
    pub(crate) walk_count: u64,
}

/// The (peer, table) relationship
pub(crate) struct PeerTableEntry {
    pub(crate) peer_id: PeerId,
    pub(crate) table_id: TableId,
    pub(crate) action: Action,
    pub(crate) ribin_registered: bool,
    pub(crate) ribout_registered: bool,
    pub(crate) ribout: Option<Arc<RibOut>>,
    pub(crate) ribout_index: Option<usize>,
    pub(crate) policy: Option<RibExportPolicy>,
    pub(crate) instance_id: i32,
    pub(crate) subscription_gen_id: u64,
}

impl PeerTableEntry {
    fn new(peer_id: PeerId, table_id: TableId) -> Self {
        Self {
            peer_id,
            table_id,
            action: Action::None,
            ribin_registered: false,
            ribout_registered: false,
            ribout: None,
            ribout_index: None,
            policy: None,
            instance_id: -1,
            subscription_gen_id: 0,
        }
    }

    pub(crate) fn clear_registration_info(&mut self) {
        self.instance_id = -1;
        self.subscription_gen_id = 0;
    }

    /// Subscription state shown in introspection
    pub(crate) fn current_state(&self) -> &'static str {
        match self.action {
            Action::RibOutAdd => "subscribing",
            Action::RibInWalk => "walking",
            Action::RibInDelete | Action::RibInWalkRibOutDelete | Action::RibInDeleteRibOutDelete => {
                "unsubscribing"
            }
            Action::None if self.ribout_registered => "subscribed",
            Action::None if self.ribin_registered => "rib-in",
            Action::None => "unsubscribed",
        }
    }

    pub(crate) fn is_unused(&self) -> bool {
        !self.ribin_registered && !self.ribout_registered && self.action == Action::None
    }
}

/// Arena holding the peer/table/entry graph
#[derive(Default)]
pub(crate) struct Registry {
    next_handle: u64,
    peers: HashMap<PeerId, PeerEntry>,
    peer_ids: HashMap<IpAddr, PeerId>,
    tables: HashMap<TableId, TableEntry>,
    table_ids: HashMap<String, TableId>,
    entries: HashMap<EntryId, PeerTableEntry>,
}

impl Registry {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn locate_peer(&mut self, peer: &Arc<dyn Peer>) -> PeerId {
        if let Some(id) = self.peer_ids.get(&peer.addr()) {
            return *id;
        }
        let id = PeerId(self.next_handle());
        self.peers.insert(
            id,
            PeerEntry {
                peer: Arc::clone(peer),
                tables: BTreeMap::new(),
            },
        );
        self.peer_ids.insert(peer.addr(), id);
        id
    }

    fn locate_table(&mut self, table: &Arc<dyn Table>) -> TableId {
        if let Some(id) = self.table_ids.get(table.name()) {
            return *id;
        }
        let id = TableId(self.next_handle());
        self.tables.insert(
            id,
            TableEntry {
                table: Arc::clone(table),
                live: BTreeSet::new(),
                pending: BTreeSet::new(),
                request_count: 0,
                walk_count: 0,
            },
        );
        self.table_ids.insert(table.name().to_owned(), id);
        id
    }

    /// Find or create the entry for (peer, table)
    pub(crate) fn locate_entry(
        &mut self,
        peer: &Arc<dyn Peer>,
        table: &Arc<dyn Table>,
    ) -> (EntryId, &mut PeerTableEntry) {
        let peer_id = self.locate_peer(peer);
        let table_id = self.locate_table(table);
        let existing = self
            .peers
            .get(&peer_id)
            .and_then(|p| p.tables.get(&table_id))
            .copied();
        let entry_id = match existing {
            Some(id) => id,
            None => {
                let id = EntryId(self.next_handle());
                self.entries
                    .insert(id, PeerTableEntry::new(peer_id, table_id));
                if let Some(peer_entry) = self.peers.get_mut(&peer_id) {
                    peer_entry.tables.insert(table_id, id);
                }
                if let Some(table_entry) = self.tables.get_mut(&table_id) {
                    table_entry.live.insert(id);
                }
                id
            }
        };
        // Both maps were populated above
        let entry = self
            .entries
            .entry(entry_id)
            .or_insert_with(|| PeerTableEntry::new(peer_id, table_id));
        (entry_id, entry)
    }

    pub(crate) fn find_entry_id(&self, peer: IpAddr, table: &str) -> Option<EntryId> {
        let peer_id = self.peer_ids.get(&peer)?;
        let table_id = self.table_ids.get(table)?;
        self.peers.get(peer_id)?.tables.get(table_id).copied()
    }

    pub(crate) fn find_entry(&self, peer: IpAddr, table: &str) -> Option<&PeerTableEntry> {
        self.find_entry_id(peer, table)
            .and_then(|id| self.entries.get(&id))
    }

    pub(crate) fn find_entry_mut(
        &mut self,
        peer: IpAddr,
        table: &str,
    ) -> Option<(EntryId, &mut PeerTableEntry)> {
        let id = self.find_entry_id(peer, table)?;
        self.entries.get_mut(&id).map(|entry| (id, entry))
    }

    pub(crate) fn entry(&self, id: EntryId) -> Option<&PeerTableEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> Option<&mut PeerTableEntry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn peer(&self, id: PeerId) -> Option<&Arc<dyn Peer>> {
        self.peers.get(&id).map(|p| &p.peer)
    }

    pub(crate) fn table(&self, id: TableId) -> Option<&TableEntry> {
        self.tables.get(&id)
    }

    pub(crate) fn table_mut(&mut self, id: TableId) -> Option<&mut TableEntry> {
        self.tables.get_mut(&id)
    }

    pub(crate) fn find_table(&self, name: &str) -> Option<&TableEntry> {
        self.table_ids.get(name).and_then(|id| self.tables.get(id))
    }

    /// Peer and table objects an entry refers to
    pub(crate) fn endpoints(&self, id: EntryId) -> Option<(Arc<dyn Peer>, Arc<dyn Table>)> {
        let entry = self.entries.get(&id)?;
        let peer = self.peers.get(&entry.peer_id)?.peer.clone();
        let table = self.tables.get(&entry.table_id)?.table.clone();
        Some((peer, table))
    }

    /// Queue the entry for the next walk of its table
    pub(crate) fn enqueue_pending(&mut self, id: EntryId) -> Option<TableId> {
        let table_id = self.entries.get(&id)?.table_id;
        let table_entry = self.tables.get_mut(&table_id)?;
        table_entry.request_count += 1;
        table_entry.pending.insert(id);
        Some(table_id)
    }

    /// Remove an entry along with any peer/table entry it leaves empty
    pub(crate) fn destroy_entry(&mut self, id: EntryId) {
        let entry = match self.entries.remove(&id) {
            Some(entry) => entry,
            None => return,
        };
        let mut remove_peer = false;
        if let Some(peer_entry) = self.peers.get_mut(&entry.peer_id) {
            peer_entry.tables.remove(&entry.table_id);
            remove_peer = peer_entry.tables.is_empty();
        }
        if remove_peer {
            if let Some(peer_entry) = self.peers.remove(&entry.peer_id) {
                self.peer_ids.remove(&peer_entry.peer.addr());
            }
        }
        let mut remove_table = false;
        if let Some(table_entry) = self.tables.get_mut(&entry.table_id) {
            table_entry.live.remove(&id);
            table_entry.pending.remove(&id);
            remove_table = table_entry.live.is_empty() && table_entry.pending.is_empty();
        }
        if remove_table {
            if let Some(table_entry) = self.tables.remove(&entry.table_id) {
                self.table_ids.remove(table_entry.table.name());
            }
        }
    }

    /// Tables `peer` has an entry for
    pub(crate) fn registered_tables(&self, peer: IpAddr) -> Vec<Arc<dyn Table>> {
        self.peer_ids
            .get(&peer)
            .and_then(|id| self.peers.get(id))
            .map(|peer_entry| {
                peer_entry
                    .tables
                    .keys()
                    .filter_map(|id| self.tables.get(id))
                    .map(|t| t.table.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entries of `peer`, with the name of their table
    pub(crate) fn peer_entries(&self, peer: IpAddr) -> Vec<(&str, &PeerTableEntry)> {
        let peer_entry = match self.peer_ids.get(&peer).and_then(|id| self.peers.get(id)) {
            Some(peer_entry) => peer_entry,
            None => return vec![],
        };
        peer_entry
            .tables
            .iter()
            .filter_map(|(table_id, entry_id)| {
                let table = self.tables.get(table_id)?;
                let entry = self.entries.get(entry_id)?;
                Some((table.table.name(), entry))
            })
            .collect()
    }

    pub(crate) fn membership_count(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub(crate) fn table_count(&self) -> usize {
        self.tables.len()
    }
}
