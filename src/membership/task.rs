use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use log::{debug, trace, warn};
use tokio::sync::mpsc;

use super::event::Event;
use super::registry::{Action, EntryId, TableId};
use super::walker::{ActiveWalk, WalkContext};
use super::{Inner, MembershipManager};
use crate::peer::Peer;
use crate::rib::{RibExportPolicy, Table};

/// Drives a [`MembershipManager`]: handles its events one at a time and
/// schedules table walks
pub struct MembershipTask {
    receiver: mpsc::UnboundedReceiver<Event>,
    manager: Weak<Inner>,
}

impl MembershipTask {
    pub(super) fn new(receiver: mpsc::UnboundedReceiver<Event>, manager: Weak<Inner>) -> Self {
        Self { receiver, manager }
    }

    /// Runs until every [`MembershipManager`] handle is dropped
    pub async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            let inner = match self.manager.upgrade() {
                Some(inner) => inner,
                None => break,
            };
            while inner.queue_disabled.load(Ordering::SeqCst) {
                inner.queue_enabled.notified().await;
            }
            let manager = MembershipManager { inner };
            manager.handle_event(event);
            manager.inner.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("Membership task exiting");
    }
}

impl MembershipManager {
    // This must NOT be async, every event is handled to completion before
    // the next one is looked at.
    fn handle_event(&self, event: Event) {
        trace!("Membership handle {:?}", event);
        match event {
            Event::RegisterRib {
                entry,
                policy,
                instance_id,
            } => self.process_register_rib(entry, policy, instance_id),
            Event::UnregisterRib { entry } => self.process_unregister_rib(entry),
            Event::WalkRib { entry } => self.process_walk_rib(entry),
            Event::RegisterRibComplete { entry } => self.process_register_rib_complete(entry),
            Event::UnregisterRibComplete { entry } => self.process_unregister_rib_complete(entry),
            Event::WalkRibComplete { entry } => self.process_walk_rib_complete(entry),
            Event::WalkDone { table } => self.walk_finish(table),
            Event::WalkTrigger => self.walk_trigger(),
            Event::Close { manager, event } => manager.handle_event(event),
        }
    }

    fn process_register_rib(&self, id: EntryId, policy: RibExportPolicy, instance_id: i32) {
        let table_id = {
            let mut registry = self.inner.registry.write();
            let (peer, table) = match registry.endpoints(id) {
                Some(endpoints) => endpoints,
                None => {
                    debug!("Register for stale entry {}", id);
                    return;
                }
            };
            let entry = match registry.entry_mut(id) {
                Some(entry) if entry.action == Action::RibOutAdd => entry,
                _ => {
                    debug!("Register for entry {} without a RibOut add", id);
                    return;
                }
            };
            entry.instance_id = instance_id;
            if table.is_deleted() {
                // Nothing to advertise, complete without a walk
                entry.ribout_registered = true;
                entry.policy = Some(policy);
                drop(registry);
                debug!("{} registered to deleted table {}", peer.name(), table.name());
                self.enqueue_event(Event::RegisterRibComplete { entry: id });
                return;
            }
            let ribout = table.ribout_locate(&policy);
            let index = ribout.register(peer.addr());
            entry.ribout = Some(ribout);
            entry.ribout_index = Some(index);
            entry.policy = Some(policy);
            entry.ribout_registered = true;
            registry.enqueue_pending(id)
        };
        if let Some(table_id) = table_id {
            self.walker_enqueue(table_id);
        }
    }

    fn process_unregister_rib(&self, id: EntryId) {
        let mut registry = self.inner.registry.write();
        let (peer, _) = match registry.endpoints(id) {
            Some(endpoints) => endpoints,
            None => {
                debug!("Unregister for stale entry {}", id);
                return;
            }
        };
        let entry = match registry.entry_mut(id) {
            Some(entry)
                if matches!(
                    entry.action,
                    Action::RibInDeleteRibOutDelete | Action::RibInWalkRibOutDelete
                ) =>
            {
                entry
            }
            _ => {
                debug!("Unregister for entry {} without a RibOut delete", id);
                return;
            }
        };
        match entry.ribout.clone() {
            Some(ribout) => {
                ribout.deactivate(peer.addr());
                let table_id = registry.enqueue_pending(id);
                drop(registry);
                if let Some(table_id) = table_id {
                    self.walker_enqueue(table_id);
                }
            }
            None => {
                // Registered to a deleted table, there is no RibOut to leave
                entry.ribout_registered = false;
                drop(registry);
                self.enqueue_event(Event::UnregisterRibComplete { entry: id });
            }
        }
    }

    fn process_walk_rib(&self, id: EntryId) {
        let table_id = {
            let mut registry = self.inner.registry.write();
            match registry.entry(id) {
                Some(entry) if entry.action.visits_rib_in() => registry.enqueue_pending(id),
                _ => {
                    debug!("Walk for stale entry {}", id);
                    None
                }
            }
        };
        if let Some(table_id) = table_id {
            self.walker_enqueue(table_id);
        }
    }

    fn process_register_rib_complete(&self, id: EntryId) {
        let (peer, table) = {
            let mut registry = self.inner.registry.write();
            let endpoints = registry.endpoints(id);
            match (registry.entry_mut(id), endpoints) {
                (Some(entry), Some(endpoints)) if entry.action == Action::RibOutAdd => {
                    entry.action = Action::None;
                    endpoints
                }
                _ => {
                    debug!("Register complete for stale entry {}", id);
                    return;
                }
            }
        };
        debug!("{} registered to {}", peer.name(), table.name());
        self.job_finished();
        peer.membership_request_callback(&table);
        self.notify_peer_registration(&peer, &table, false);
    }

    fn process_unregister_rib_complete(&self, id: EntryId) {
        let (peer, table) = {
            let mut registry = self.inner.registry.write();
            let endpoints = registry.endpoints(id);
            let (entry, (peer, table)) = match (registry.entry_mut(id), endpoints) {
                (Some(entry), Some(endpoints))
                    if matches!(
                        entry.action,
                        Action::RibInDeleteRibOutDelete | Action::RibInWalkRibOutDelete
                    ) =>
                {
                    (entry, endpoints)
                }
                _ => {
                    debug!("Unregister complete for stale entry {}", id);
                    return;
                }
            };
            if let Some(ribout) = entry.ribout.take() {
                ribout.unregister(peer.addr());
            }
            entry.ribout_index = None;
            entry.policy = None;
            entry.ribout_registered = false;
            entry.action = Action::None;
            if entry.is_unused() {
                registry.destroy_entry(id);
            }
            (peer, table)
        };
        debug!("{} unregistered from {}", peer.name(), table.name());
        self.job_finished();
        peer.membership_request_callback(&table);
        self.notify_peer_registration(&peer, &table, true);
    }

    fn process_walk_rib_complete(&self, id: EntryId) {
        let (peer, table) = {
            let mut registry = self.inner.registry.write();
            let endpoints = registry.endpoints(id);
            let (entry, endpoints) = match (registry.entry_mut(id), endpoints) {
                (Some(entry), Some(endpoints))
                    if matches!(entry.action, Action::RibInDelete | Action::RibInWalk) =>
                {
                    (entry, endpoints)
                }
                _ => {
                    debug!("Walk complete for stale entry {}", id);
                    return;
                }
            };
            entry.action = Action::None;
            if entry.is_unused() {
                registry.destroy_entry(id);
            }
            endpoints
        };
        debug!("{} walked RibIn of {}", peer.name(), table.name());
        self.job_finished();
        peer.membership_request_callback(&table);
    }

    fn walker_enqueue(&self, table_id: TableId) {
        if self.inner.walker.lock().enqueue(table_id) {
            trace!("Walker queued table {}", table_id);
        }
        self.walk_trigger();
    }

    /// Start the next table walk unless one is already running
    fn walk_trigger(&self) {
        let mut walker = self.inner.walker.lock();
        if walker.current.is_some() || walker.disabled {
            return;
        }
        while let Some(table_id) = walker.pop() {
            let mut registry = self.inner.registry.write();
            let pending = match registry.table_mut(table_id) {
                Some(table_entry) => {
                    table_entry.walk_count += 1;
                    std::mem::take(&mut table_entry.pending)
                }
                None => continue,
            };
            let table = match registry.table(table_id) {
                Some(table_entry) => table_entry.table.clone(),
                None => continue,
            };

            let mut context = WalkContext::default();
            let mut entries = Vec::with_capacity(pending.len());
            for id in pending {
                let entry = match registry.entry(id) {
                    Some(entry) => entry,
                    None => continue,
                };
                let peer = match registry.peer(entry.peer_id) {
                    Some(peer) => peer.clone(),
                    None => continue,
                };
                match entry.action {
                    Action::RibOutAdd => {
                        if let (Some(ribout), Some(index)) = (&entry.ribout, entry.ribout_index) {
                            context.locate_ribout_state(ribout).join.insert(index);
                        }
                    }
                    Action::RibInDelete | Action::RibInWalk => {
                        context.peers.insert(peer.addr(), peer);
                    }
                    Action::RibInDeleteRibOutDelete | Action::RibInWalkRibOutDelete => {
                        if let (Some(ribout), Some(index)) = (&entry.ribout, entry.ribout_index) {
                            context.locate_ribout_state(ribout).leave.insert(index);
                        }
                        context.peers.insert(peer.addr(), peer);
                    }
                    Action::None => {
                        warn!("Entry {} queued for walk without an action", id);
                        continue;
                    }
                }
                entries.push((id, entry.action));
            }
            drop(registry);
            if entries.is_empty() {
                continue;
            }

            let started = !walker.postpone;
            debug!(
                "Walk {} for {} entries ({})",
                table.name(),
                entries.len(),
                if started { "started" } else { "postponed" }
            );
            let context = Arc::new(context);
            walker.current = Some(ActiveWalk {
                table_id,
                table: table.clone(),
                entries,
                context: context.clone(),
                started,
            });
            if started {
                self.spawn_walk(table_id, table, context);
            }
            return;
        }
    }

    pub(super) fn spawn_walk(&self, table_id: TableId, table: Arc<dyn Table>, context: Arc<WalkContext>) {
        let manager = self.clone();
        tokio::spawn(async move {
            table.walk(&mut |route| context.visit(table.as_ref(), route));
            manager.enqueue_event(Event::WalkDone { table: table_id });
        });
    }

    fn walk_finish(&self, table_id: TableId) {
        let walk = {
            let mut walker = self.inner.walker.lock();
            match walker.current.take() {
                Some(walk) if walk.table_id == table_id => walk,
                other => {
                    walker.current = other;
                    debug!("Walk done for table {} which is not current", table_id);
                    return;
                }
            }
        };
        trace!("Walk {} finished", walk.table.name());
        for (entry, action) in walk.entries {
            let event = match action {
                Action::RibOutAdd => Event::RegisterRibComplete { entry },
                Action::RibInDeleteRibOutDelete | Action::RibInWalkRibOutDelete => {
                    Event::UnregisterRibComplete { entry }
                }
                Action::RibInDelete | Action::RibInWalk => Event::WalkRibComplete { entry },
                Action::None => continue,
            };
            self.enqueue_event(event);
        }
        self.walk_trigger();
    }
}
