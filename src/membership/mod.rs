//! Peer to table membership
//!
//! Callers register/unregister peers to tables through [`MembershipManager`].
//! Each call validates and records the request under the registry write lock,
//! then hands the (peer, table) entry to the membership task by enqueueing an
//! event. From that point the task owns the entry's pending action: it alone
//! queues the entry for a walk, applies the action once the walk finishes and
//! clears it. Callers are told about completion through
//! [`Peer::membership_request_callback`].

mod event;
mod registry;
mod task;
mod walker;

pub use registry::Action;
pub use task::MembershipTask;
pub use walker::WalkerStatus;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};

use crate::api::{MembershipPeerInfo, PeerTableInfo, TableMembershipInfo};
use crate::close::{CloseEvent, PeerCloseManager};
use crate::error::MembershipError;
use crate::peer::Peer;
use crate::rib::{RibExportPolicy, Table};
use event::Event;
use registry::{EntryId, PeerTableEntry, Registry};
use walker::Walker;

/// Listener told about RibOut register (`false`) / unregister (`true`)
/// completions of XMPP peers
pub type PeerRegistrationCallback = Arc<dyn Fn(&Arc<dyn Peer>, &Arc<dyn Table>, bool) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    callbacks: Vec<Option<PeerRegistrationCallback>>,
    // Slots below the last callback freed by unregister
    free: std::collections::BTreeSet<usize>,
}

pub(crate) struct Inner {
    registry: RwLock<Registry>,
    walker: Mutex<Walker>,
    listeners: RwLock<Listeners>,
    sender: mpsc::UnboundedSender<Event>,
    // Events sent and not yet fully handled
    pending_events: AtomicUsize,
    queue_disabled: AtomicBool,
    queue_enabled: Notify,
    current_jobs: AtomicUsize,
    total_jobs: AtomicU64,
}

/// Handle to the membership manager, cheap to clone
#[derive(Clone)]
pub struct MembershipManager {
    inner: Arc<Inner>,
}

impl MembershipManager {
    /// Create a manager and the task that must be spawned to drive it
    pub fn new() -> (Self, MembershipTask) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            registry: RwLock::new(Registry::default()),
            walker: Mutex::new(Walker::default()),
            listeners: RwLock::new(Listeners::default()),
            sender,
            pending_events: AtomicUsize::new(0),
            queue_disabled: AtomicBool::new(false),
            queue_enabled: Notify::new(),
            current_jobs: AtomicUsize::new(0),
            total_jobs: AtomicU64::new(0),
        });
        let task = MembershipTask::new(receiver, Arc::downgrade(&inner));
        (Self { inner }, task)
    }

    /// Create a manager and spawn its task on the current runtime
    pub fn spawn() -> Self {
        let (manager, task) = Self::new();
        tokio::spawn(task.run_event_loop());
        manager
    }

    fn enqueue_event(&self, event: Event) {
        trace!("Membership enqueue {:?}", event);
        self.inner.pending_events.fetch_add(1, Ordering::SeqCst);
        if self.inner.sender.send(event).is_err() {
            self.inner.pending_events.fetch_sub(1, Ordering::SeqCst);
            debug!("Membership task is gone, event dropped");
        }
    }

    pub(crate) fn enqueue_close_event(&self, manager: Arc<PeerCloseManager>, event: CloseEvent) {
        self.enqueue_event(Event::Close { manager, event });
    }

    fn job_started(&self) {
        self.inner.current_jobs.fetch_add(1, Ordering::SeqCst);
        self.inner.total_jobs.fetch_add(1, Ordering::SeqCst);
    }

    fn job_finished(&self) {
        self.inner.current_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Register `peer` to both RibIn and RibOut of `table`
    pub fn register(
        &self,
        peer: Arc<dyn Peer>,
        table: Arc<dyn Table>,
        policy: RibExportPolicy,
        instance_id: i32,
    ) -> Result<(), MembershipError> {
        let mut registry = self.inner.registry.write();
        let (id, entry) = registry.locate_entry(&peer, &table);
        check_no_pending(entry, &*peer, &*table)?;
        if entry.ribout_registered {
            return Err(MembershipError::DuplicateRegistration {
                peer: peer.addr(),
                table: table.name().to_owned(),
            });
        }
        entry.ribin_registered = true;
        entry.action = Action::RibOutAdd;
        self.job_started();
        debug!("{} register {} requested", peer.name(), table.name());
        self.enqueue_event(Event::RegisterRib {
            entry: id,
            policy,
            instance_id,
        });
        Ok(())
    }

    /// Register `peer` to the RibIn of `table` only. Completes synchronously.
    pub fn register_rib_in(
        &self,
        peer: Arc<dyn Peer>,
        table: Arc<dyn Table>,
    ) -> Result<(), MembershipError> {
        let mut registry = self.inner.registry.write();
        let (_, entry) = registry.locate_entry(&peer, &table);
        check_no_pending(entry, &*peer, &*table)?;
        if entry.ribout_registered
            || (entry.ribin_registered && !peer.is_in_gr_timer_wait_state())
        {
            return Err(MembershipError::DuplicateRegistration {
                peer: peer.addr(),
                table: table.name().to_owned(),
            });
        }
        entry.ribin_registered = true;
        debug!("{} register RibIn {}", peer.name(), table.name());
        Ok(())
    }

    /// Unregister `peer` from both RibIn and RibOut of `table`
    pub fn unregister(&self, peer: Arc<dyn Peer>, table: Arc<dyn Table>) -> Result<(), MembershipError> {
        let mut registry = self.inner.registry.write();
        let (id, entry) = find_idle_entry(&mut registry, &*peer, &*table)?;
        if !entry.ribin_registered {
            return Err(unregistered(&*peer, &*table));
        }
        if !entry.ribout_registered {
            self.unregister_rib_in_unlocked(id, entry, &*peer, &*table);
            return Ok(());
        }
        entry.action = Action::RibInDeleteRibOutDelete;
        entry.ribin_registered = false;
        entry.clear_registration_info();
        self.job_started();
        debug!("{} unregister {} requested", peer.name(), table.name());
        self.enqueue_event(Event::UnregisterRib { entry: id });
        Ok(())
    }

    /// Unregister `peer` from the RibIn of `table`, deleting its paths
    pub fn unregister_rib_in(
        &self,
        peer: Arc<dyn Peer>,
        table: Arc<dyn Table>,
    ) -> Result<(), MembershipError> {
        let mut registry = self.inner.registry.write();
        let (id, entry) = find_idle_entry(&mut registry, &*peer, &*table)?;
        if !entry.ribin_registered {
            return Err(unregistered(&*peer, &*table));
        }
        if entry.ribout_registered {
            return Err(MembershipError::RibOutRegistered {
                peer: peer.addr(),
                table: table.name().to_owned(),
            });
        }
        self.unregister_rib_in_unlocked(id, entry, &*peer, &*table);
        Ok(())
    }

    fn unregister_rib_in_unlocked(
        &self,
        id: EntryId,
        entry: &mut PeerTableEntry,
        peer: &dyn Peer,
        table: &dyn Table,
    ) {
        entry.ribin_registered = false;
        entry.clear_registration_info();
        entry.action = Action::RibInDelete;
        self.job_started();
        debug!("{} unregister RibIn {} requested", peer.name(), table.name());
        self.enqueue_event(Event::WalkRib { entry: id });
    }

    /// Stop advertising `table` to `peer` and walk its RibIn
    pub fn unregister_rib_out(
        &self,
        peer: Arc<dyn Peer>,
        table: Arc<dyn Table>,
    ) -> Result<(), MembershipError> {
        let mut registry = self.inner.registry.write();
        let (id, entry) = find_idle_entry(&mut registry, &*peer, &*table)?;
        if !entry.ribin_registered || !entry.ribout_registered {
            return Err(unregistered(&*peer, &*table));
        }
        entry.clear_registration_info();
        entry.action = Action::RibInWalkRibOutDelete;
        self.job_started();
        debug!("{} unregister RibOut {} requested", peer.name(), table.name());
        self.enqueue_event(Event::UnregisterRib { entry: id });
        Ok(())
    }

    /// Visit every path of `peer` in `table` through its path callback
    pub fn walk_rib_in(&self, peer: Arc<dyn Peer>, table: Arc<dyn Table>) -> Result<(), MembershipError> {
        let mut registry = self.inner.registry.write();
        let (id, entry) = find_idle_entry(&mut registry, &*peer, &*table)?;
        if !entry.ribin_registered {
            return Err(unregistered(&*peer, &*table));
        }
        entry.action = Action::RibInWalk;
        self.job_started();
        debug!("{} walk RibIn {} requested", peer.name(), table.name());
        self.enqueue_event(Event::WalkRib { entry: id });
        Ok(())
    }

    /// (instance id, subscription generation) if `peer` has an entry for `table`
    pub fn get_registration_info(&self, peer: &dyn Peer, table: &dyn Table) -> Option<(i32, u64)> {
        self.inner
            .registry
            .read()
            .find_entry(peer.addr(), table.name())
            .map(|entry| (entry.instance_id, entry.subscription_gen_id))
    }

    pub fn set_registration_info(
        &self,
        peer: &dyn Peer,
        table: &dyn Table,
        instance_id: i32,
        subscription_gen_id: u64,
    ) {
        let mut registry = self.inner.registry.write();
        if let Some((_, entry)) = registry.find_entry_mut(peer.addr(), table.name()) {
            entry.instance_id = instance_id;
            entry.subscription_gen_id = subscription_gen_id;
        }
    }

    pub fn is_registered(&self, peer: &dyn Peer, table: &dyn Table) -> bool {
        self.inner
            .registry
            .read()
            .find_entry(peer.addr(), table.name())
            .map(|entry| entry.ribin_registered && entry.ribout_registered)
            .unwrap_or(false)
    }

    pub fn is_rib_in_registered(&self, peer: &dyn Peer, table: &dyn Table) -> bool {
        self.inner
            .registry
            .read()
            .find_entry(peer.addr(), table.name())
            .map(|entry| entry.ribin_registered)
            .unwrap_or(false)
    }

    pub fn is_rib_out_registered(&self, peer: &dyn Peer, table: &dyn Table) -> bool {
        self.inner
            .registry
            .read()
            .find_entry(peer.addr(), table.name())
            .map(|entry| entry.ribout_registered)
            .unwrap_or(false)
    }

    /// Pending action for (peer, table), `None` if there is no entry
    pub fn get_action(&self, peer: &dyn Peer, table: &dyn Table) -> Option<Action> {
        self.inner
            .registry
            .read()
            .find_entry(peer.addr(), table.name())
            .map(|entry| entry.action)
    }

    /// Updates queued on the peer's RibOut for `table`
    pub fn get_ribout_queue_depth(&self, peer: &dyn Peer, table: &dyn Table) -> usize {
        let registry = self.inner.registry.read();
        match registry.find_entry(peer.addr(), table.name()) {
            Some(entry) if entry.ribout_registered => entry
                .ribout
                .as_ref()
                .map(|ribout| ribout.queue_depth(peer.addr()))
                .unwrap_or(0),
            _ => 0,
        }
    }

    pub fn get_registered_ribs(&self, peer: &dyn Peer) -> Vec<Arc<dyn Table>> {
        self.inner.registry.read().registered_tables(peer.addr())
    }

    /// Number of (peer, table) entries
    pub fn get_membership_count(&self) -> usize {
        self.inner.registry.read().membership_count()
    }

    pub fn current_jobs_count(&self) -> usize {
        self.inner.current_jobs.load(Ordering::SeqCst)
    }

    pub fn total_jobs_count(&self) -> u64 {
        self.inner.total_jobs.load(Ordering::SeqCst)
    }

    /// No undelivered events and no queued or running walk
    pub fn is_queue_empty(&self) -> bool {
        self.inner.pending_events.load(Ordering::SeqCst) == 0
            && self.inner.walker.lock().is_queue_empty()
    }

    /// Nothing can make progress without outside help: either everything is
    /// done or the remaining work is held back by a disabled queue, a
    /// disabled walker or a postponed walk
    pub fn is_idle(&self) -> bool {
        let events_idle = self.inner.pending_events.load(Ordering::SeqCst) == 0
            || self.inner.queue_disabled.load(Ordering::SeqCst);
        events_idle && self.inner.walker.lock().is_idle()
    }

    /// Yield to the runtime until [`is_idle`](Self::is_idle)
    pub async fn wait_for_idle(&self) {
        while !self.is_idle() {
            tokio::task::yield_now().await;
        }
    }

    pub fn table_membership_info(&self, table: &str) -> Option<TableMembershipInfo> {
        let registry = self.inner.registry.read();
        let table_entry = registry.find_table(table)?;
        let peers = table_entry
            .live
            .iter()
            .filter_map(|id| {
                let entry = registry.entry(*id)?;
                let peer = registry.peer(entry.peer_id)?;
                Some(MembershipPeerInfo {
                    peer: peer.name(),
                    ribin_registered: entry.ribin_registered,
                    ribout_registered: entry.ribout_registered,
                    instance_id: entry.instance_id,
                    generation_id: entry.subscription_gen_id,
                    action: entry.action,
                })
            })
            .collect();
        Some(TableMembershipInfo {
            table: table.to_owned(),
            requests: table_entry.request_count,
            walks: table_entry.walk_count,
            peers,
        })
    }

    pub fn peer_membership_info(&self, peer: &dyn Peer) -> Vec<PeerTableInfo> {
        self.inner
            .registry
            .read()
            .peer_entries(peer.addr())
            .into_iter()
            .map(|(table, entry)| PeerTableInfo {
                table: table.to_owned(),
                current_state: entry.current_state().to_owned(),
                ribin_registered: entry.ribin_registered,
                ribout_registered: entry.ribout_registered,
                policy: entry.policy.as_ref().map(|p| p.to_string()),
                queue_depth: entry
                    .ribout
                    .as_ref()
                    .map(|ribout| ribout.queue_depth(peer.addr()))
                    .unwrap_or(0),
            })
            .collect()
    }

    /// Add a registration listener, returns its id for removal
    pub fn register_peer_registration_callback(&self, callback: PeerRegistrationCallback) -> usize {
        let mut listeners = self.inner.listeners.write();
        match listeners.free.iter().next().copied() {
            Some(id) => {
                listeners.free.remove(&id);
                listeners.callbacks[id] = Some(callback);
                id
            }
            None => {
                listeners.callbacks.push(Some(callback));
                listeners.callbacks.len() - 1
            }
        }
    }

    pub fn unregister_peer_registration_callback(&self, id: usize) {
        let mut listeners = self.inner.listeners.write();
        if id >= listeners.callbacks.len() {
            return;
        }
        listeners.callbacks[id] = None;
        if id == listeners.callbacks.len() - 1 {
            while let Some(None) = listeners.callbacks.last() {
                listeners.callbacks.pop();
            }
            let len = listeners.callbacks.len();
            listeners.free.retain(|slot| *slot < len);
        } else {
            listeners.free.insert(id);
        }
    }

    fn notify_peer_registration(&self, peer: &Arc<dyn Peer>, table: &Arc<dyn Table>, unregister: bool) {
        if !peer.is_xmpp() {
            return;
        }
        let callbacks: Vec<_> = self
            .inner
            .listeners
            .read()
            .callbacks
            .iter()
            .flatten()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(peer, table, unregister);
        }
    }

    /// Hold back event processing
    pub fn set_queue_disable(&self, disabled: bool) {
        self.inner.queue_disabled.store(disabled, Ordering::SeqCst);
        if !disabled {
            self.inner.queue_enabled.notify_one();
        }
    }

    /// Hold back walk scheduling, queued tables accumulate until re-enabled
    pub fn set_walker_disable(&self, disabled: bool) {
        self.inner.walker.lock().disabled = disabled;
        if !disabled {
            self.enqueue_event(Event::WalkTrigger);
        }
    }

    /// Prepare the next walk without starting the table traversal
    pub fn postpone_walk(&self) {
        self.inner.walker.lock().postpone = true;
    }

    /// Start the traversal of a postponed walk
    pub fn resume_walk(&self) {
        let mut walker = self.inner.walker.lock();
        walker.postpone = false;
        if let Some(walk) = walker.current.as_mut() {
            if !walk.started {
                walk.started = true;
                self.spawn_walk(walk.table_id, walk.table.clone(), walk.context.clone());
            }
        }
    }

    pub fn walker_status(&self) -> WalkerStatus {
        self.inner.walker.lock().status()
    }
}

fn unregistered(peer: &dyn Peer, table: &dyn Table) -> MembershipError {
    MembershipError::UnregisteredEntity {
        peer: peer.addr(),
        table: table.name().to_owned(),
    }
}

fn check_no_pending(entry: &PeerTableEntry, peer: &dyn Peer, table: &dyn Table) -> Result<(), MembershipError> {
    if entry.action != Action::None {
        return Err(MembershipError::PendingRequestConflict {
            peer: peer.addr(),
            table: table.name().to_owned(),
            action: entry.action,
        });
    }
    Ok(())
}

/// Existing entry with no request in flight
fn find_idle_entry<'r>(
    registry: &'r mut Registry,
    peer: &dyn Peer,
    table: &dyn Table,
) -> Result<(EntryId, &'r mut PeerTableEntry), MembershipError> {
    let (id, entry) = registry
        .find_entry_mut(peer.addr(), table.name())
        .ok_or_else(|| unregistered(peer, table))?;
    check_no_pending(entry, peer, table)?;
    Ok((id, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::rib::Table;
    use crate::test_util::{add_paths, prefix, test_peer, test_table, xmpp_peer};

    #[tokio::test]
    async fn test_register_unregister() {
        let manager = MembershipManager::spawn();
        let peer = test_peer("10.0.0.1");
        let table = test_table("blue");

        manager
            .register(peer.clone(), table.clone(), RibExportPolicy::bgp(65000), 7)
            .unwrap();
        assert!(manager.is_rib_in_registered(&*peer, &*table));
        assert_eq!(manager.get_action(&*peer, &*table), Some(Action::RibOutAdd));
        assert_eq!(manager.current_jobs_count(), 1);
        assert_eq!(manager.peer_membership_info(&*peer)[0].current_state, "subscribing");
        manager.wait_for_idle().await;
        assert_eq!(manager.peer_membership_info(&*peer)[0].current_state, "subscribed");

        assert!(manager.is_registered(&*peer, &*table));
        assert_eq!(manager.get_action(&*peer, &*table), Some(Action::None));
        assert_eq!(manager.get_registration_info(&*peer, &*table), Some((7, 0)));
        assert_eq!(manager.get_membership_count(), 1);
        assert_eq!(peer.counts().request_callbacks, 1);
        assert_eq!(table.walk_request_count(), 1);
        assert_eq!(manager.current_jobs_count(), 0);

        manager.unregister(peer.clone(), table.clone()).unwrap();
        assert_eq!(manager.get_registration_info(&*peer, &*table), Some((-1, 0)));
        manager.wait_for_idle().await;

        assert!(!manager.is_rib_in_registered(&*peer, &*table));
        assert!(!manager.is_rib_out_registered(&*peer, &*table));
        assert_eq!(manager.get_registration_info(&*peer, &*table), None);
        assert!(manager.peer_membership_info(&*peer).is_empty());
        assert_eq!(manager.get_membership_count(), 0);
        assert_eq!(peer.counts().request_callbacks, 2);
        assert_eq!(table.walk_request_count(), 2);
        assert_eq!(manager.total_jobs_count(), 2);
        assert!(manager.is_queue_empty());
    }

    #[tokio::test]
    async fn test_multiple_tables() {
        let manager = MembershipManager::spawn();
        let peer = test_peer("10.0.0.1");
        let tables: Vec<_> = ["blue", "red", "green"].iter().map(|n| test_table(n)).collect();
        for table in &tables {
            manager
                .register(peer.clone(), table.clone(), RibExportPolicy::bgp(65000), -1)
                .unwrap();
        }
        manager.wait_for_idle().await;
        assert_eq!(manager.get_registered_ribs(&*peer).len(), 3);
        assert_eq!(manager.peer_membership_info(&*peer).len(), 3);
        for table in &tables {
            assert!(manager.is_registered(&*peer, &**table));
            assert_eq!(table.walk_request_count(), 1);
        }

        for table in &tables {
            manager.unregister(peer.clone(), table.clone()).unwrap();
        }
        manager.wait_for_idle().await;
        assert!(manager.get_registered_ribs(&*peer).is_empty());
        assert_eq!(peer.counts().request_callbacks, 6);
    }

    #[tokio::test]
    async fn test_rib_in_walks_peer_paths() {
        let manager = MembershipManager::spawn();
        let peer = test_peer("10.0.0.1");
        let other = test_peer("10.0.0.2");
        let table = test_table("blue");

        manager.register_rib_in(peer.clone(), table.clone()).unwrap();
        assert!(manager.is_rib_in_registered(&*peer, &*table));
        assert!(!manager.is_rib_out_registered(&*peer, &*table));
        add_paths(&table, peer.addr(), 8);
        add_paths(&table, other.addr(), 3);

        assert_eq!(table.size(), 8);

        manager.walk_rib_in(peer.clone(), table.clone()).unwrap();
        manager.wait_for_idle().await;
        assert_eq!(peer.counts().path_callbacks, 8);
        assert_eq!(peer.counts().request_callbacks, 1);
        assert_eq!(table.walk_complete_count(), 1);
        assert!(manager.is_rib_in_registered(&*peer, &*table));

        manager.unregister_rib_in(peer.clone(), table.clone()).unwrap();
        manager.wait_for_idle().await;
        assert_eq!(table.walk_request_count(), 2);
        assert_eq!(table.walk_complete_count(), 2);
        assert_eq!(peer.counts().path_callbacks, 16);
        assert_eq!(other.counts().path_callbacks, 0);
        assert_eq!(manager.get_membership_count(), 0);

        // A BGP peer's paths are left to its own session to withdraw
        assert_eq!(table.peer_path_count(peer.addr()), 8);
        for index in 0..8 {
            assert!(table.delete_path(prefix(index), peer.addr(), 0));
        }
        assert_eq!(table.peer_path_count(peer.addr()), 0);
        assert_eq!(table.size(), 3);
    }

    #[tokio::test]
    async fn test_xmpp_rib_in_unregister_deletes_paths() {
        let manager = MembershipManager::spawn();
        let agent = xmpp_peer("10.0.0.1");
        let other = test_peer("10.0.0.2");
        let table = test_table("blue");

        manager.register_rib_in(agent.clone(), table.clone()).unwrap();
        add_paths(&table, agent.addr(), 8);
        add_paths(&table, other.addr(), 3);

        manager.unregister_rib_in(agent.clone(), table.clone()).unwrap();
        manager.wait_for_idle().await;
        assert_eq!(manager.get_membership_count(), 0);
        assert_eq!(agent.counts().path_callbacks, 8);
        assert_eq!(table.peer_path_count(agent.addr()), 0);
        assert_eq!(table.peer_path_count(other.addr()), 3);
        assert_eq!(table.size(), 3);
        assert_eq!(table.walk_complete_count(), 1);
    }

    #[tokio::test]
    async fn test_ribout_advertise_and_unregister() {
        let manager = MembershipManager::spawn();
        let source = test_peer("10.0.0.1");
        let peer = test_peer("10.0.0.2");
        let table = test_table("blue");

        manager.register_rib_in(source.clone(), table.clone()).unwrap();
        add_paths(&table, source.addr(), 4);
        manager
            .register(peer.clone(), table.clone(), RibExportPolicy::bgp(65000), -1)
            .unwrap();
        manager.wait_for_idle().await;
        assert_eq!(manager.get_ribout_queue_depth(&*peer, &*table), 4);
        // Nothing reflected back to the source
        assert_eq!(manager.get_ribout_queue_depth(&*source, &*table), 0);

        manager.unregister_rib_out(peer.clone(), table.clone()).unwrap();
        manager.wait_for_idle().await;
        assert!(manager.is_rib_in_registered(&*peer, &*table));
        assert!(!manager.is_rib_out_registered(&*peer, &*table));
        assert_eq!(manager.get_ribout_queue_depth(&*peer, &*table), 0);
        let ribout = table.ribout_locate(&RibExportPolicy::bgp(65000));
        assert_eq!(ribout.peer_count(), 0);
        assert!(ribout.advertised_to(peer.addr()).is_empty());
    }

    #[tokio::test]
    async fn test_walker_coalesces_requests() {
        let manager = MembershipManager::spawn();
        let table = test_table("blue");
        let peers: Vec<_> = (1..=3).map(|i| test_peer(&format!("10.0.0.{}", i))).collect();

        manager.set_walker_disable(true);
        for peer in &peers {
            manager
                .register(peer.clone(), table.clone(), RibExportPolicy::bgp(65000), -1)
                .unwrap();
        }
        manager.wait_for_idle().await;
        assert_eq!(manager.walker_status().queue_size, 1);
        assert_eq!(manager.current_jobs_count(), 3);
        assert!(!manager.is_queue_empty());

        assert_eq!(table.walk_complete_count(), 0);
        assert_eq!(manager.get_membership_count(), 3);

        manager.set_walker_disable(false);
        manager.wait_for_idle().await;
        assert_eq!(table.walk_request_count(), 1);
        assert_eq!(table.walk_complete_count(), 1);
        assert_eq!(manager.get_membership_count(), 3);
        assert_eq!(manager.current_jobs_count(), 0);
        assert_eq!(manager.table_membership_info("blue").unwrap().walks, 1);
        for peer in &peers {
            assert!(manager.is_registered(&**peer, &*table));
            assert_eq!(peer.counts().request_callbacks, 1);
        }
    }

    #[tokio::test]
    async fn test_postponed_walk_with_different_ribouts() {
        let manager = MembershipManager::spawn();
        let table = test_table("blue");
        let peers: Vec<_> = (1..=3).map(|i| test_peer(&format!("10.0.0.{}", i))).collect();

        manager.postpone_walk();
        manager.set_walker_disable(true);
        for (asn, peer) in peers.iter().enumerate() {
            manager
                .register(peer.clone(), table.clone(), RibExportPolicy::bgp(asn as u32 + 1), -1)
                .unwrap();
        }
        manager.wait_for_idle().await;
        manager.set_walker_disable(false);
        manager.wait_for_idle().await;

        let status = manager.walker_status();
        assert!(status.walk_in_progress && status.postponed);
        assert_eq!(status.walk_table.as_deref(), Some("blue"));
        assert_eq!(status.peer_rib_list_size, 3);
        assert_eq!(status.ribout_state_list_size, 3);
        assert_eq!(status.peer_list_size, 0);
        assert_eq!(table.walk_request_count(), 0);

        manager.resume_walk();
        manager.wait_for_idle().await;
        assert_eq!(table.walk_request_count(), 1);
        assert_eq!(table.ribouts().len(), 3);
        assert_eq!(manager.walker_status(), WalkerStatus::default());
    }

    #[tokio::test]
    async fn test_postponed_rib_in_walk() {
        let manager = MembershipManager::spawn();
        let table = test_table("blue");
        let (a, b) = (test_peer("10.0.0.1"), test_peer("10.0.0.2"));
        manager.register_rib_in(a.clone(), table.clone()).unwrap();
        manager.register_rib_in(b.clone(), table.clone()).unwrap();

        manager.postpone_walk();
        manager.set_walker_disable(true);
        manager.walk_rib_in(a.clone(), table.clone()).unwrap();
        manager.walk_rib_in(b.clone(), table.clone()).unwrap();
        manager.wait_for_idle().await;
        manager.set_walker_disable(false);
        manager.wait_for_idle().await;

        let status = manager.walker_status();
        assert_eq!(status.peer_list_size, 2);
        assert_eq!(status.peer_rib_list_size, 2);
        assert_eq!(status.ribout_state_list_size, 0);

        manager.resume_walk();
        manager.wait_for_idle().await;
        assert_eq!(a.counts().request_callbacks, 1);
        assert_eq!(b.counts().request_callbacks, 1);
        assert_eq!(table.walk_request_count(), 1);
    }

    #[tokio::test]
    async fn test_register_deleted_table() {
        let manager = MembershipManager::spawn();
        let peer = test_peer("10.0.0.1");
        let table = test_table("blue");
        table.set_deleted();

        manager
            .register(peer.clone(), table.clone(), RibExportPolicy::bgp(65000), 3)
            .unwrap();
        manager.wait_for_idle().await;
        assert!(manager.is_registered(&*peer, &*table));
        assert_eq!(peer.counts().request_callbacks, 1);
        assert_eq!(table.walk_request_count(), 0);

        manager.unregister(peer.clone(), table.clone()).unwrap();
        manager.wait_for_idle().await;
        assert_eq!(manager.get_membership_count(), 0);
        assert_eq!(peer.counts().request_callbacks, 2);
        assert_eq!(table.walk_request_count(), 0);
    }

    #[tokio::test]
    async fn test_request_errors() {
        let manager = MembershipManager::spawn();
        let peer = test_peer("10.0.0.1");
        let table = test_table("blue");
        let key = (peer.addr(), "blue".to_owned());

        let err = manager.unregister(peer.clone(), table.clone()).unwrap_err();
        assert!(matches!(err, MembershipError::UnregisteredEntity { .. }));
        assert_eq!(err.key(), (key.0, key.1.as_str()));

        manager
            .register(peer.clone(), table.clone(), RibExportPolicy::bgp(65000), -1)
            .unwrap();
        let err = manager
            .register(peer.clone(), table.clone(), RibExportPolicy::bgp(65000), -1)
            .unwrap_err();
        assert_eq!(
            err,
            MembershipError::PendingRequestConflict {
                peer: key.0,
                table: key.1.clone(),
                action: Action::RibOutAdd,
            }
        );
        manager.wait_for_idle().await;

        let err = manager
            .register(peer.clone(), table.clone(), RibExportPolicy::bgp(65000), -1)
            .unwrap_err();
        assert!(matches!(err, MembershipError::DuplicateRegistration { .. }));
        let err = manager.register_rib_in(peer.clone(), table.clone()).unwrap_err();
        assert!(matches!(err, MembershipError::DuplicateRegistration { .. }));
        let err = manager.unregister_rib_in(peer.clone(), table.clone()).unwrap_err();
        assert!(matches!(err, MembershipError::RibOutRegistered { .. }));

        let other = test_table("red");
        manager.register_rib_in(peer.clone(), other.clone()).unwrap();
        let err = manager.register_rib_in(peer.clone(), other.clone()).unwrap_err();
        assert!(matches!(err, MembershipError::DuplicateRegistration { .. }));
        let err = manager.unregister_rib_out(peer.clone(), other.clone()).unwrap_err();
        assert!(matches!(err, MembershipError::UnregisteredEntity { .. }));
    }

    #[tokio::test]
    async fn test_queue_disable() {
        let manager = MembershipManager::spawn();
        let peer = test_peer("10.0.0.1");
        let table = test_table("blue");

        manager.set_queue_disable(true);
        manager
            .register(peer.clone(), table.clone(), RibExportPolicy::bgp(65000), -1)
            .unwrap();
        manager.wait_for_idle().await;
        assert!(!manager.is_rib_out_registered(&*peer, &*table));
        assert!(!manager.is_queue_empty());

        manager.set_queue_disable(false);
        manager.wait_for_idle().await;
        assert!(manager.is_registered(&*peer, &*table));
        assert!(manager.is_queue_empty());
    }

    #[tokio::test]
    async fn test_registration_info_and_table_info() {
        let manager = MembershipManager::spawn();
        let peer = test_peer("10.0.0.1");
        let table = test_table("blue");
        manager
            .register(peer.clone(), table.clone(), RibExportPolicy::xmpp(), 2)
            .unwrap();
        manager.wait_for_idle().await;

        manager.set_registration_info(&*peer, &*table, 5, 42);
        assert_eq!(manager.get_registration_info(&*peer, &*table), Some((5, 42)));

        let info = manager.table_membership_info("blue").unwrap();
        assert_eq!(info.requests, 1);
        assert_eq!(info.walks, 1);
        assert_eq!(info.peers.len(), 1);
        assert!(info.peers[0].ribout_registered);
        assert_eq!(info.peers[0].generation_id, 42);
        assert!(manager.table_membership_info("red").is_none());

        let peer_info = manager.peer_membership_info(&*peer);
        assert_eq!(peer_info[0].policy.as_deref(), Some("XMPP AS0"));
    }

    #[tokio::test]
    async fn test_registration_listeners() {
        let manager = MembershipManager::spawn();
        let registered = Arc::new(AtomicUsize::new(0));
        let unregistered = Arc::new(AtomicUsize::new(0));
        let (r, u) = (registered.clone(), unregistered.clone());
        let callback = move |_: &Arc<dyn Peer>, _: &Arc<dyn Table>, unregister: bool| {
            if unregister {
                u.fetch_add(1, Ordering::SeqCst);
            } else {
                r.fetch_add(1, Ordering::SeqCst);
            }
        };
        let id = manager.register_peer_registration_callback(Arc::new(callback));
        assert_eq!(id, 0);

        let table = test_table("blue");
        let xmpp = xmpp_peer("10.0.0.1");
        let bgp = test_peer("10.0.0.2");
        for peer in [xmpp.clone(), bgp.clone()] {
            manager
                .register(peer, table.clone(), RibExportPolicy::xmpp(), -1)
                .unwrap();
        }
        manager.wait_for_idle().await;
        assert_eq!(registered.load(Ordering::SeqCst), 1);

        manager.unregister(xmpp.clone(), table.clone()).unwrap();
        manager.wait_for_idle().await;
        assert_eq!(unregistered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_ids_reused() {
        let (manager, _task) = MembershipManager::new();
        let callback: PeerRegistrationCallback =
            Arc::new(|_: &Arc<dyn Peer>, _: &Arc<dyn Table>, _: bool| ());
        let ids: Vec<_> = (0..3)
            .map(|_| manager.register_peer_registration_callback(callback.clone()))
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);

        manager.unregister_peer_registration_callback(0);
        assert_eq!(manager.register_peer_registration_callback(callback.clone()), 0);

        manager.unregister_peer_registration_callback(1);
        manager.unregister_peer_registration_callback(2);
        assert_eq!(manager.inner.listeners.read().callbacks.len(), 1);
        assert!(manager.inner.listeners.read().free.is_empty());
        assert_eq!(manager.register_peer_registration_callback(callback), 1);
    }
}
