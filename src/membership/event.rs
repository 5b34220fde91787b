use std::fmt;
use std::sync::Arc;

use super::registry::{EntryId, TableId};
use crate::close::{CloseEvent, PeerCloseManager};
use crate::rib::RibExportPolicy;

/// Work processed by the membership task, in enqueue order
pub(crate) enum Event {
    RegisterRib {
        entry: EntryId,
        policy: RibExportPolicy,
        instance_id: i32,
    },
    UnregisterRib {
        entry: EntryId,
    },
    // RibIn delete or RibIn walk, queued straight to the walker
    WalkRib {
        entry: EntryId,
    },
    RegisterRibComplete {
        entry: EntryId,
    },
    UnregisterRibComplete {
        entry: EntryId,
    },
    WalkRibComplete {
        entry: EntryId,
    },
    // Table traversal finished
    WalkDone {
        table: TableId,
    },
    // Re-run the walker scheduling check
    WalkTrigger,
    Close {
        manager: Arc<PeerCloseManager>,
        event: CloseEvent,
    },
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Event::*;
        match self {
            RegisterRib {
                entry,
                policy,
                instance_id,
            } => write!(
                f,
                "RegisterRib(entry={}, policy={}, instance={})",
                entry, policy, instance_id
            ),
            UnregisterRib { entry } => write!(f, "UnregisterRib(entry={})", entry),
            WalkRib { entry } => write!(f, "WalkRib(entry={})", entry),
            RegisterRibComplete { entry } => write!(f, "RegisterRibComplete(entry={})", entry),
            UnregisterRibComplete { entry } => {
                write!(f, "UnregisterRibComplete(entry={})", entry)
            }
            WalkRibComplete { entry } => write!(f, "WalkRibComplete(entry={})", entry),
            WalkDone { table } => write!(f, "WalkDone(table={})", table),
            WalkTrigger => write!(f, "WalkTrigger"),
            Close { manager, event } => write!(f, "Close({}, {:?})", manager.peer_name(), event),
        }
    }
}
