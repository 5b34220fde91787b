use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;

use super::registry::{Action, EntryId, TableId};
use crate::peer::Peer;
use crate::rib::{RibOut, Route, Table};

/// Join/leave index sets for one RibOut touched by the current walk
pub(crate) struct RibOutState {
    pub(crate) ribout: Arc<RibOut>,
    pub(crate) join: BTreeSet<usize>,
    pub(crate) leave: BTreeSet<usize>,
}

/// Read-only view of a walk shared with the traversal task
#[derive(Default)]
pub(crate) struct WalkContext {
    // Peers whose RibIn paths are visited
    pub(crate) peers: HashMap<IpAddr, Arc<dyn Peer>>,
    pub(crate) ribout_states: Vec<RibOutState>,
}

impl WalkContext {
    pub(crate) fn locate_ribout_state(&mut self, ribout: &Arc<RibOut>) -> &mut RibOutState {
        let position = self
            .ribout_states
            .iter()
            .position(|state| Arc::ptr_eq(&state.ribout, ribout));
        let index = match position {
            Some(index) => index,
            None => {
                self.ribout_states.push(RibOutState {
                    ribout: Arc::clone(ribout),
                    join: BTreeSet::new(),
                    leave: BTreeSet::new(),
                });
                self.ribout_states.len() - 1
            }
        };
        &mut self.ribout_states[index]
    }

    /// Per-route visitor: apply RibOut joins/leaves, then hand each path
    /// owned by a visited peer to that peer
    pub(crate) fn visit(&self, table: &dyn Table, route: &mut Route) -> bool {
        for state in &self.ribout_states {
            state.ribout.join(route, &state.join);
            state.ribout.leave(route, &state.leave);
        }
        if self.peers.is_empty() {
            return false;
        }
        let mut notify = false;
        let keys: Vec<_> = route
            .paths()
            .iter()
            .map(|p| p.key())
            .filter(|key| self.peers.contains_key(&key.peer))
            .collect();
        for key in keys {
            if let Some(peer) = self.peers.get(&key.peer) {
                notify |= peer.membership_path_callback(table, route, key);
            }
        }
        notify
    }
}

/// The table walk currently started (or postponed)
pub(crate) struct ActiveWalk {
    pub(crate) table_id: TableId,
    pub(crate) table: Arc<dyn Table>,
    pub(crate) entries: Vec<(EntryId, Action)>,
    pub(crate) context: Arc<WalkContext>,
    pub(crate) started: bool,
}

/// Schedules at most one table walk at a time, FIFO by table
#[derive(Default)]
pub(crate) struct Walker {
    queue: VecDeque<TableId>,
    queued: HashSet<TableId>,
    pub(crate) current: Option<ActiveWalk>,
    pub(crate) postpone: bool,
    pub(crate) disabled: bool,
}

impl Walker {
    /// Queue a table unless it is already waiting. Returns true when queued.
    pub(crate) fn enqueue(&mut self, table: TableId) -> bool {
        if !self.queued.insert(table) {
            return false;
        }
        self.queue.push_back(table);
        true
    }

    pub(crate) fn pop(&mut self) -> Option<TableId> {
        let table = self.queue.pop_front()?;
        self.queued.remove(&table);
        Some(table)
    }

    pub(crate) fn is_queue_empty(&self) -> bool {
        self.queue.is_empty() && self.current.is_none()
    }

    /// Nothing left that can make progress on its own
    pub(crate) fn is_idle(&self) -> bool {
        let walk_idle = match &self.current {
            Some(walk) => !walk.started && self.postpone,
            None => true,
        };
        walk_idle && (self.queue.is_empty() || self.disabled)
    }

    pub(crate) fn status(&self) -> WalkerStatus {
        let (peer_rib_list_size, peer_list_size, ribout_state_list_size) = match &self.current {
            Some(walk) => (
                walk.entries.len(),
                walk.context.peers.len(),
                walk.context.ribout_states.len(),
            ),
            None => (0, 0, 0),
        };
        WalkerStatus {
            queue_size: self.queue.len(),
            walk_in_progress: self.current.is_some(),
            walk_table: self.current.as_ref().map(|w| w.table.name().to_owned()),
            postponed: self.postpone,
            disabled: self.disabled,
            peer_rib_list_size,
            peer_list_size,
            ribout_state_list_size,
        }
    }
}

/// Snapshot of the walker for introspection and tests
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WalkerStatus {
    pub queue_size: usize,
    pub walk_in_progress: bool,
    pub walk_table: Option<String>,
    pub postponed: bool,
    pub disabled: bool,
    pub peer_rib_list_size: usize,
    pub peer_list_size: usize,
    pub ribout_state_list_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::RibExportPolicy;

    #[test]
    fn test_enqueue_dedup_fifo() {
        let mut walker = Walker::default();
        let (a, b) = (TableId::for_test(1), TableId::for_test(2));
        assert!(walker.enqueue(a));
        assert!(walker.enqueue(b));
        assert!(!walker.enqueue(a));
        assert_eq!(walker.status().queue_size, 2);
        assert_eq!(walker.pop(), Some(a));
        // Popped tables may be queued again for the next pass
        assert!(walker.enqueue(a));
        assert_eq!(walker.pop(), Some(b));
        assert_eq!(walker.pop(), Some(a));
        assert!(walker.is_queue_empty());
    }

    #[test]
    fn test_locate_ribout_state() {
        let mut context = WalkContext::default();
        let one = Arc::new(RibOut::new("blue", RibExportPolicy::bgp(1)));
        let two = Arc::new(RibOut::new("blue", RibExportPolicy::bgp(2)));
        context.locate_ribout_state(&one).join.insert(0);
        context.locate_ribout_state(&one).join.insert(1);
        context.locate_ribout_state(&two).leave.insert(0);
        assert_eq!(context.ribout_states.len(), 2);
        assert_eq!(context.ribout_states[0].join.len(), 2);
        assert_eq!(context.ribout_states[1].leave.len(), 1);
    }

    #[test]
    fn test_disabled_walker_is_idle() {
        let mut walker = Walker::default();
        walker.enqueue(TableId::for_test(7));
        assert!(!walker.is_idle());
        walker.disabled = true;
        assert!(walker.is_idle());
    }
}
