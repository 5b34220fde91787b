use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, trace};
use parking_lot::Mutex;
use serde::Serialize;

use crate::close::PeerCloseManager;
use crate::error::MembershipError;
use crate::membership::MembershipManager;
use crate::rib::{Families, Family, PathKey, RibExportPolicy, Route, RouteOperation, Table};

/// A BGP or XMPP neighbor as seen by the membership manager
pub trait Peer: Send + Sync {
    /// Identity of the peer, unique across the manager
    fn addr(&self) -> IpAddr;

    fn name(&self) -> String {
        self.addr().to_string()
    }

    fn is_ready(&self) -> bool;

    fn is_xmpp(&self) -> bool {
        false
    }

    /// False while the peer still has its own membership requests in flight
    fn can_use_membership_manager(&self) -> bool {
        true
    }

    fn is_in_gr_timer_wait_state(&self) -> bool {
        false
    }

    /// A register/unregister/walk request for `table` completed
    fn membership_request_callback(&self, table: &Arc<dyn Table>);

    /// Called for every path owned by this peer while its RibIn is walked.
    /// Returns true when the route was changed.
    fn membership_path_callback(&self, table: &dyn Table, route: &mut Route, path: PathKey) -> bool;
}

/// Close lifecycle hooks a peer exposes to its `PeerCloseManager`
///
/// Hooks run on the membership task while the close manager holds its
/// state lock and must not call back into the manager synchronously.
pub trait PeerClose: Send + Sync {
    fn peer(&self) -> Option<Arc<dyn Peer>>;

    fn is_ready(&self) -> bool;
    fn is_close_graceful(&self) -> bool;
    fn is_close_long_lived_graceful(&self) -> bool;
    /// Seconds
    fn graceful_restart_time(&self) -> u32;
    /// Seconds
    fn long_lived_graceful_restart_time(&self) -> u32;
    fn graceful_restart_families(&self) -> Families;

    fn graceful_restart_stale(&self);
    fn long_lived_graceful_restart_stale(&self);
    fn graceful_restart_sweep(&self);
    /// Paths are held stale, session resources may be released
    fn close_complete(&self);
    /// Close finished non-gracefully, the peer may be destroyed
    fn delete(&self);
    /// Reset negotiated state before RibIn deletion starts
    fn custom_close(&self);
    /// Deliver an End-of-RIB marker for `family` (simulated on timer expiry)
    fn receive_end_of_rib(&self, family: Family);
    fn membership_request_callback_complete(&self);
}

/// Graceful restart capabilities negotiated with a peer
#[derive(Clone, Debug, Default)]
pub struct GracefulRestart {
    pub enabled: bool,
    pub long_lived: bool,
    /// Seconds
    pub time: u32,
    /// Seconds
    pub long_lived_time: u32,
    pub families: Families,
}

/// Counts of the callbacks a [`SimPeer`] received
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PeerCallCounts {
    pub path_callbacks: u64,
    pub request_callbacks: u64,
    pub stale: u64,
    pub llgr_stale: u64,
    pub sweep: u64,
    pub close_complete: u64,
    pub delete: u64,
    pub custom_close: u64,
    pub end_of_rib: u64,
    pub callback_complete: u64,
}

#[derive(Debug, Default)]
struct PeerRequests {
    // Register/unregister/walk requests issued for this peer, not yet called back
    pending: usize,
    // Graceful flag of a close received while requests were pending
    deferred_close: Option<bool>,
}

/// In-process peer with no session behind it
///
/// Session state is set directly (`set_ready`), restart capabilities come
/// from configuration. Once a close manager is attached, request and path
/// callbacks are handed to it while it uses the membership manager.
///
/// Requests issued through the peer (`register`, `unregister`, ...) are
/// counted until they call back. The close manager cannot use the
/// membership manager while any are pending, and a close received in that
/// window is deferred until the last one completes.
pub struct SimPeer {
    me: Weak<SimPeer>,
    addr: IpAddr,
    xmpp: bool,
    ready: AtomicBool,
    // Membership manager held by someone else, close requests wait
    blocked: AtomicBool,
    graceful_restart: Mutex<GracefulRestart>,
    close_manager: Mutex<Option<Arc<PeerCloseManager>>>,
    requests: Mutex<PeerRequests>,
    counts: Mutex<PeerCallCounts>,
}

impl SimPeer {
    pub fn new(addr: IpAddr, xmpp: bool, graceful_restart: GracefulRestart) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            addr,
            xmpp,
            ready: AtomicBool::new(true),
            blocked: AtomicBool::new(false),
            graceful_restart: Mutex::new(graceful_restart),
            close_manager: Mutex::new(None),
            requests: Mutex::new(PeerRequests::default()),
            counts: Mutex::new(PeerCallCounts::default()),
        })
    }

    /// Create the close manager for this peer
    pub fn attach_close_manager(&self, membership: &MembershipManager) -> Arc<PeerCloseManager> {
        let peer_close: Weak<dyn PeerClose> = self.me.clone();
        let manager = PeerCloseManager::new(peer_close, membership.clone());
        *self.close_manager.lock() = Some(manager.clone());
        manager
    }

    pub fn close_manager(&self) -> Option<Arc<PeerCloseManager>> {
        self.close_manager.lock().clone()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Hold back close membership requests. Releasing resumes a waiting close.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
        if blocked {
            return;
        }
        if let Some(manager) = self.close_manager() {
            if manager.is_membership_in_wait() {
                manager.resume_membership_request();
            }
        }
    }

    /// Start closing the session, or defer the close until the peer's own
    /// membership requests have called back
    pub fn close(&self, graceful: bool) {
        let manager = match self.close_manager() {
            Some(manager) => manager,
            None => return,
        };
        let in_use = manager.is_membership_in_use();
        {
            let mut requests = self.requests.lock();
            if requests.pending > 0 && !in_use {
                info!(
                    "{} close deferred, {} membership requests pending",
                    self.addr, requests.pending
                );
                // Once non-graceful, the deferred close stays non-graceful
                let deferred = requests.deferred_close.get_or_insert(true);
                *deferred &= graceful;
                return;
            }
        }
        manager.close(graceful);
    }

    pub fn register(
        self: &Arc<Self>,
        membership: &MembershipManager,
        table: Arc<dyn Table>,
        policy: RibExportPolicy,
        instance_id: i32,
    ) -> Result<(), MembershipError> {
        self.request(|peer| membership.register(peer, table, policy, instance_id))
    }

    pub fn unregister(
        self: &Arc<Self>,
        membership: &MembershipManager,
        table: Arc<dyn Table>,
    ) -> Result<(), MembershipError> {
        self.request(|peer| membership.unregister(peer, table))
    }

    pub fn unregister_rib_in(
        self: &Arc<Self>,
        membership: &MembershipManager,
        table: Arc<dyn Table>,
    ) -> Result<(), MembershipError> {
        self.request(|peer| membership.unregister_rib_in(peer, table))
    }

    pub fn walk_rib_in(
        self: &Arc<Self>,
        membership: &MembershipManager,
        table: Arc<dyn Table>,
    ) -> Result<(), MembershipError> {
        self.request(|peer| membership.walk_rib_in(peer, table))
    }

    /// Membership requests issued through the peer and not yet called back
    pub fn pending_requests(&self) -> usize {
        self.requests.lock().pending
    }

    fn request<F>(self: &Arc<Self>, issue: F) -> Result<(), MembershipError>
    where
        F: FnOnce(Arc<dyn Peer>) -> Result<(), MembershipError>,
    {
        // Counted first, the callback may run before `issue` returns
        self.requests.lock().pending += 1;
        let peer: Arc<dyn Peer> = self.clone();
        let result = issue(peer);
        if result.is_err() {
            self.requests.lock().pending -= 1;
        }
        result
    }

    /// One of the peer's own requests called back
    fn request_complete(&self, manager: Option<Arc<PeerCloseManager>>) {
        let deferred_close = {
            let mut requests = self.requests.lock();
            match requests.pending.checked_sub(1) {
                Some(pending) => requests.pending = pending,
                None => debug!("{} membership callback for a request made elsewhere", self.addr),
            }
            if requests.pending > 0 {
                return;
            }
            requests.deferred_close.take()
        };
        let manager = match manager {
            Some(manager) => manager,
            None => return,
        };
        if manager.is_membership_in_wait() {
            manager.resume_membership_request();
        }
        if let Some(graceful) = deferred_close {
            info!("{} resume deferred close", self.addr);
            manager.close(graceful);
        }
    }

    pub fn counts(&self) -> PeerCallCounts {
        *self.counts.lock()
    }

    fn count(&self, update: impl FnOnce(&mut PeerCallCounts)) {
        update(&mut self.counts.lock());
    }
}

impl Peer for SimPeer {
    fn addr(&self) -> IpAddr {
        self.addr
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn is_xmpp(&self) -> bool {
        self.xmpp
    }

    fn can_use_membership_manager(&self) -> bool {
        !self.blocked.load(Ordering::SeqCst) && self.requests.lock().pending == 0
    }

    fn is_in_gr_timer_wait_state(&self) -> bool {
        self.close_manager()
            .map(|manager| manager.is_in_gr_timer_wait_state())
            .unwrap_or(false)
    }

    fn membership_request_callback(&self, table: &Arc<dyn Table>) {
        self.count(|c| c.request_callbacks += 1);
        trace!("{} membership request for {} complete", self.addr, table.name());
        let manager = self.close_manager();
        if let Some(manager) = &manager {
            if manager.is_membership_in_use() {
                manager.membership_request_callback();
                return;
            }
        }
        self.request_complete(manager);
    }

    fn membership_path_callback(&self, table: &dyn Table, route: &mut Route, path: PathKey) -> bool {
        self.count(|c| c.path_callbacks += 1);
        let manager = self.close_manager();
        if let Some(manager) = &manager {
            if manager.is_membership_in_use() {
                return manager.membership_path_callback(table, route, path);
            }
        }
        // Agents have no session to hold paths across, leaving the table
        // drops them
        if self.xmpp {
            return route.input_common(path, RouteOperation::Delete).1;
        }
        match manager {
            Some(manager) => manager.membership_path_callback(table, route, path),
            None => false,
        }
    }
}

impl PeerClose for SimPeer {
    fn peer(&self) -> Option<Arc<dyn Peer>> {
        self.me.upgrade().map(|peer| peer as Arc<dyn Peer>)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn is_close_graceful(&self) -> bool {
        self.graceful_restart.lock().enabled
    }

    fn is_close_long_lived_graceful(&self) -> bool {
        self.graceful_restart.lock().long_lived
    }

    fn graceful_restart_time(&self) -> u32 {
        self.graceful_restart.lock().time
    }

    fn long_lived_graceful_restart_time(&self) -> u32 {
        self.graceful_restart.lock().long_lived_time
    }

    fn graceful_restart_families(&self) -> Families {
        self.graceful_restart.lock().families.clone()
    }

    fn graceful_restart_stale(&self) {
        self.count(|c| c.stale += 1);
    }

    fn long_lived_graceful_restart_stale(&self) {
        self.count(|c| c.llgr_stale += 1);
    }

    fn graceful_restart_sweep(&self) {
        self.count(|c| c.sweep += 1);
    }

    fn close_complete(&self) {
        self.count(|c| c.close_complete += 1);
    }

    fn delete(&self) {
        self.count(|c| c.delete += 1);
    }

    fn custom_close(&self) {
        self.count(|c| c.custom_close += 1);
    }

    fn receive_end_of_rib(&self, family: Family) {
        self.count(|c| c.end_of_rib += 1);
        if let Some(manager) = self.close_manager() {
            manager.process_eor_marker_received(family);
        }
    }

    fn membership_request_callback_complete(&self) {
        self.count(|c| c.callback_complete += 1);
    }
}
