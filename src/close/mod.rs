//! Peer close state machine
//!
//! A [`PeerCloseManager`] walks a peer through graceful restart when its
//! session goes down:
//!
//! ```text
//! NONE -> STALE -> GR_TIMER -> SWEEP -> NONE
//!                           -> LLGR_STALE -> LLGR_TIMER -> SWEEP -> NONE
//!                                                       -> DELETE -> NONE
//!                           -> DELETE -> NONE
//! NONE -> DELETE -> NONE (non-graceful)
//! ```
//!
//! Each phase touches the peer's tables through one membership request per
//! table and only moves on once every request has called back. All events
//! are handled on the membership task, so the state is only ever advanced
//! from one place.

mod stats;
mod timer;

pub use stats::{CloseStats, RouteStats};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::api::PeerCloseInfo;
use crate::error::MembershipError;
use crate::membership::{Action, MembershipManager};
use crate::peer::{Peer, PeerClose};
use crate::rib::community::NO_LLGR;
use crate::rib::{Families, Family, PathFlags, PathKey, Route, RouteOperation, Table};
use timer::StaleTimer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseState {
    None,
    Stale,
    GrTimer,
    LlgrStale,
    LlgrTimer,
    Sweep,
    Delete,
}

impl fmt::Display for CloseState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CloseState::*;
        let word = match self {
            None => "NONE",
            Stale => "STALE",
            GrTimer => "GR_TIMER",
            LlgrStale => "LLGR_STALE",
            LlgrTimer => "LLGR_TIMER",
            Sweep => "SWEEP",
            Delete => "DELETE",
        };
        write!(f, "{}", word)
    }
}

/// Whether the close sequence currently holds membership requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipUseState {
    None,
    InUse,
    InWait,
}

impl fmt::Display for MembershipUseState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            MembershipUseState::None => "NONE",
            MembershipUseState::InUse => "IN_USE",
            MembershipUseState::InWait => "IN_WAIT",
        };
        write!(f, "{}", word)
    }
}

#[derive(Clone, Debug)]
pub enum CloseEvent {
    Close { graceful: bool },
    /// End-of-RIB for one family, `None` for all of them
    EorReceived(Option<Family>),
    MembershipRequest,
    MembershipRequestComplete,
    TimerCallback,
}

struct CloseContext {
    state: CloseState,
    membership_state: MembershipUseState,
    membership_req_pending: u32,
    close_again: bool,
    // Cleared by any non-graceful close until the cycle completes
    graceful: bool,
    gr_elapsed: Duration,
    llgr_elapsed: Duration,
    // A table was busy with another request, run the request again once
    // everything in flight has called back
    retry_request: bool,
    // Families still waiting for End-of-RIB
    families: Families,
    stats: CloseStats,
}

pub struct PeerCloseManager {
    this: Weak<PeerCloseManager>,
    peer_close: Weak<dyn PeerClose>,
    membership: MembershipManager,
    context: Mutex<CloseContext>,
    timer: StaleTimer,
}

impl fmt::Debug for PeerCloseManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ctx = self.context.lock();
        f.debug_struct("PeerCloseManager")
            .field("peer", &self.peer_name())
            .field("state", &ctx.state)
            .field("membership_state", &ctx.membership_state)
            .field("membership_req_pending", &ctx.membership_req_pending)
            .field("close_again", &ctx.close_again)
            .finish()
    }
}

impl PeerCloseManager {
    pub fn new(peer_close: Weak<dyn PeerClose>, membership: MembershipManager) -> Arc<Self> {
        let stats = CloseStats {
            init: 1,
            ..CloseStats::default()
        };
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            peer_close,
            membership,
            context: Mutex::new(CloseContext {
                state: CloseState::None,
                membership_state: MembershipUseState::None,
                membership_req_pending: 0,
                close_again: false,
                graceful: true,
                gr_elapsed: Duration::ZERO,
                llgr_elapsed: Duration::ZERO,
                retry_request: false,
                families: Families::default(),
                stats,
            }),
            timer: StaleTimer::default(),
        })
    }

    pub fn peer_name(&self) -> String {
        self.peer_close
            .upgrade()
            .and_then(|peer_close| peer_close.peer())
            .map(|peer| peer.name())
            .unwrap_or_else(|| "<unknown>".to_owned())
    }

    fn enqueue(&self, event: CloseEvent) {
        match self.this.upgrade() {
            Some(manager) => self.membership.enqueue_close_event(manager, event),
            None => debug!("Close manager dropped, {:?} discarded", event),
        }
    }

    /// Start (or restart) closing the peer
    pub fn close(&self, graceful: bool) {
        self.enqueue(CloseEvent::Close { graceful });
    }

    pub fn process_eor_marker_received(&self, family: Family) {
        self.enqueue(CloseEvent::EorReceived(Some(family)));
    }

    /// End-of-RIB received for every family
    pub fn process_eor_all(&self) {
        self.enqueue(CloseEvent::EorReceived(None));
    }

    /// Forwarded by the peer for every membership request completion while
    /// the close sequence uses the membership manager
    pub fn membership_request_callback(&self) {
        self.enqueue(CloseEvent::MembershipRequestComplete);
    }

    /// Retry a membership request held back while the peer could not use
    /// the membership manager
    pub fn resume_membership_request(&self) {
        let peer_close = match self.peer_close.upgrade() {
            Some(peer_close) => peer_close,
            None => return,
        };
        let mut ctx = self.context.lock();
        if ctx.membership_state == MembershipUseState::InWait {
            self.membership_request(&mut ctx, &*peer_close);
        }
    }

    /// RibIn visitor while the close sequence walks the peer's tables
    ///
    /// Deletes, stale marks or LLGR stale marks the path depending on the
    /// current state. Returns true when the route changed.
    pub fn membership_path_callback(&self, table: &dyn Table, route: &mut Route, key: PathKey) -> bool {
        let (attributes, flags) = match route.path(key) {
            Some(path) => (path.attributes().clone(), path.flags()),
            None => return false,
        };
        let family = table.family();
        let mut ctx = self.context.lock();
        let oper = match ctx.state {
            CloseState::None | CloseState::GrTimer | CloseState::LlgrTimer => return false,
            CloseState::Sweep => {
                if !flags.stale && !flags.llgr_stale {
                    return false;
                }
                ctx.stats.route(family).deleted += 1;
                RouteOperation::Delete
            }
            CloseState::Delete => {
                ctx.stats.route(family).deleted += 1;
                RouteOperation::Delete
            }
            CloseState::Stale => {
                // Multicast routes are not held across a restart
                if family.is_multicast() {
                    ctx.stats.route(family).deleted += 1;
                    RouteOperation::Delete
                } else if flags.stale {
                    // Already marked by a previous cycle
                    return false;
                } else {
                    ctx.stats.route(family).staled += 1;
                    RouteOperation::AddChange {
                        attributes,
                        flags: flags.merge(PathFlags::stale()),
                    }
                }
            }
            CloseState::LlgrStale => {
                if attributes.communities.contains_value(NO_LLGR) {
                    ctx.stats.route(family).deleted += 1;
                    RouteOperation::Delete
                } else if flags.llgr_stale {
                    return false;
                } else {
                    ctx.stats.route(family).llgr_staled += 1;
                    RouteOperation::AddChange {
                        attributes,
                        flags: flags.merge(PathFlags::llgr_stale()),
                    }
                }
            }
        };
        drop(ctx);
        route.input_common(key, oper).1
    }

    /// Count paths (re)learned while a close is in progress
    pub fn update_route_stats(&self, family: Family, old: Option<PathFlags>, flags: PathFlags) {
        let mut ctx = self.context.lock();
        if ctx.state == CloseState::None {
            return;
        }
        match old {
            None => ctx.stats.route(family).fresh += 1,
            Some(old) if old.stale && !flags.stale => ctx.stats.route(family).refreshed += 1,
            Some(_) => (),
        }
    }

    pub fn state(&self) -> CloseState {
        self.context.lock().state
    }

    pub fn membership_state(&self) -> MembershipUseState {
        self.context.lock().membership_state
    }

    pub fn is_close_in_progress(&self) -> bool {
        self.context.lock().state != CloseState::None
    }

    pub fn is_in_gr_timer_wait_state(&self) -> bool {
        matches!(
            self.context.lock().state,
            CloseState::GrTimer | CloseState::LlgrTimer
        )
    }

    pub fn is_membership_in_use(&self) -> bool {
        self.context.lock().membership_state == MembershipUseState::InUse
    }

    pub fn is_membership_in_wait(&self) -> bool {
        self.context.lock().membership_state == MembershipUseState::InWait
    }

    pub fn stats(&self) -> CloseStats {
        self.context.lock().stats.clone()
    }

    pub fn close_info(&self) -> PeerCloseInfo {
        let ctx = self.context.lock();
        let stats = &ctx.stats;
        let route_stats: BTreeMap<String, RouteStats> = stats
            .route_stats
            .iter()
            .filter(|(_, route_stats)| route_stats.is_set())
            .map(|(family, route_stats)| (family.to_string(), *route_stats))
            .collect();
        PeerCloseInfo {
            peer: self.peer_name(),
            state: ctx.state.to_string(),
            membership_state: ctx.membership_state.to_string(),
            close_again: ctx.close_again,
            graceful: ctx.graceful,
            init: stats.init,
            close: stats.close,
            nested: stats.nested,
            deletes: stats.deletes,
            stale: stats.stale,
            llgr_stale: stats.llgr_stale,
            sweep: stats.sweep,
            gr_timer: stats.gr_timer,
            llgr_timer: stats.llgr_timer,
            route_stats,
        }
    }

    // Runs on the membership task
    pub(crate) fn handle_event(&self, event: CloseEvent) {
        let peer_close = match self.peer_close.upgrade() {
            Some(peer_close) => peer_close,
            None => {
                debug!("Peer gone, close event {:?} dropped", event);
                return;
            }
        };
        let mut ctx = self.context.lock();
        self.log(&ctx, format_args!("Handle {:?}", event));
        match event {
            CloseEvent::Close { graceful } => {
                ctx.graceful &= graceful;
                self.close_internal(&mut ctx, &*peer_close);
            }
            CloseEvent::EorReceived(family) => self.process_eor(&mut ctx, family),
            CloseEvent::MembershipRequest => self.membership_request_internal(&mut ctx, &*peer_close),
            CloseEvent::MembershipRequestComplete => {
                let done = self.membership_request_complete(&mut ctx, &*peer_close);
                drop(ctx);
                if done {
                    peer_close.membership_request_callback_complete();
                }
            }
            CloseEvent::TimerCallback => {
                let families = self.restart_timer_callback(&mut ctx, &*peer_close);
                drop(ctx);
                for family in families {
                    debug!("{} simulate End-of-RIB for {}", self.peer_name(), family);
                    peer_close.receive_end_of_rib(family);
                }
            }
        }
    }

    fn log(&self, ctx: &CloseContext, msg: fmt::Arguments) {
        debug!(
            "{} close state {}, membership {}, pending {}, close again {}: {}",
            self.peer_name(),
            ctx.state,
            ctx.membership_state,
            ctx.membership_req_pending,
            ctx.close_again,
            msg
        );
    }

    fn move_to_state(&self, ctx: &mut CloseContext, state: CloseState) {
        if ctx.state == state {
            warn!("{} already in close state {}", self.peer_name(), state);
        }
        debug_assert_ne!(ctx.state, state, "close state moved to itself");
        info!("{} close state {} -> {}", self.peer_name(), ctx.state, state);
        ctx.state = state;
    }

    fn close_internal(&self, ctx: &mut CloseContext, peer_close: &dyn PeerClose) {
        ctx.stats.close += 1;
        if ctx.close_again {
            self.log(ctx, format_args!("Nested close ignored"));
            return;
        }
        match ctx.state {
            CloseState::None => {
                ctx.stats.reset_route_stats();
                self.process_closure(ctx, peer_close);
            }
            CloseState::GrTimer => {
                self.log(ctx, format_args!("Nested close, restart GR"));
                ctx.close_again = true;
                ctx.stats.nested += 1;
                ctx.gr_elapsed += self.timer.elapsed();
                self.close_complete(ctx, peer_close);
            }
            CloseState::LlgrTimer => {
                self.log(ctx, format_args!("Nested close, restart LLGR"));
                ctx.close_again = true;
                ctx.stats.nested += 1;
                ctx.llgr_elapsed += self.timer.elapsed();
                self.close_complete(ctx, peer_close);
            }
            CloseState::Stale | CloseState::LlgrStale | CloseState::Sweep | CloseState::Delete => {
                self.log(ctx, format_args!("Nested close"));
                ctx.close_again = true;
                ctx.stats.nested += 1;
            }
        }
    }

    fn process_closure(&self, ctx: &mut CloseContext, peer_close: &dyn PeerClose) {
        match ctx.state {
            CloseState::None => {
                if !ctx.graceful || !peer_close.is_close_graceful() {
                    self.move_to_state(ctx, CloseState::Delete);
                    ctx.stats.deletes += 1;
                } else {
                    self.move_to_state(ctx, CloseState::Stale);
                    ctx.stats.stale += 1;
                    self.stale_notify(ctx, peer_close);
                    return;
                }
            }
            CloseState::GrTimer => {
                if peer_close.is_ready() {
                    self.move_to_sweep(ctx);
                } else if peer_close.is_close_long_lived_graceful() {
                    self.move_to_state(ctx, CloseState::LlgrStale);
                    ctx.stats.llgr_stale += 1;
                    peer_close.long_lived_graceful_restart_stale();
                } else {
                    self.move_to_state(ctx, CloseState::Delete);
                    ctx.stats.deletes += 1;
                }
            }
            CloseState::LlgrTimer => {
                if peer_close.is_ready() {
                    self.move_to_sweep(ctx);
                } else {
                    self.move_to_state(ctx, CloseState::Delete);
                    ctx.stats.deletes += 1;
                }
            }
            state => {
                error!("{} closure processed in state {}", self.peer_name(), state);
                return;
            }
        }
        if ctx.state == CloseState::Delete {
            peer_close.custom_close();
        }
        self.membership_request(ctx, peer_close);
    }

    fn move_to_sweep(&self, ctx: &mut CloseContext) {
        self.move_to_state(ctx, CloseState::Sweep);
        ctx.gr_elapsed = Duration::ZERO;
        ctx.llgr_elapsed = Duration::ZERO;
        ctx.stats.sweep += 1;
    }

    fn close_complete(&self, ctx: &mut CloseContext, peer_close: &dyn PeerClose) {
        self.move_to_state(ctx, CloseState::None);
        self.timer.cancel();
        ctx.families.clear();
        ctx.stats.init += 1;
        // A close received mid-cycle starts a fresh one
        if ctx.close_again {
            ctx.close_again = false;
            self.close_internal(ctx, peer_close);
        }
    }

    fn stale_notify(&self, ctx: &mut CloseContext, peer_close: &dyn PeerClose) {
        peer_close.graceful_restart_stale();
        if ctx.membership_state == MembershipUseState::InUse {
            return;
        }
        self.membership_request_internal(ctx, peer_close);
    }

    fn trigger_sweep_state_actions(&self, ctx: &mut CloseContext, peer_close: &dyn PeerClose) {
        if ctx.state != CloseState::Sweep {
            error!("{} sweep actions in state {}", self.peer_name(), ctx.state);
            return;
        }
        peer_close.graceful_restart_sweep();
        ctx.membership_state = MembershipUseState::None;
        self.close_complete(ctx, peer_close);
    }

    /// Request membership work, or wait if the peer cannot take it yet
    fn membership_request(&self, ctx: &mut CloseContext, peer_close: &dyn PeerClose) {
        if ctx.membership_state == MembershipUseState::InUse {
            return;
        }
        let ready = peer_close
            .peer()
            .map(|peer| peer.can_use_membership_manager())
            .unwrap_or(false);
        if !ready {
            ctx.membership_state = MembershipUseState::InWait;
            self.log(ctx, format_args!("Wait for membership manager availability"));
            return;
        }
        ctx.membership_state = MembershipUseState::InUse;
        self.enqueue(CloseEvent::MembershipRequest);
    }

    /// Reason the peer's tables cannot take a close request right now
    fn membership_busy(&self, peer: &dyn Peer) -> Option<String> {
        if !peer.can_use_membership_manager() {
            return Some("peer requests pending".to_owned());
        }
        self.membership
            .get_registered_ribs(peer)
            .into_iter()
            .find(|table| {
                !matches!(
                    self.membership.get_action(peer, &**table),
                    None | Some(Action::None)
                )
            })
            .map(|table| format!("request pending on {}", table.name()))
    }

    /// Issue one membership request per table of the peer
    fn membership_request_internal(&self, ctx: &mut CloseContext, peer_close: &dyn PeerClose) {
        if ctx.membership_req_pending == 0 {
            let busy = peer_close
                .peer()
                .and_then(|peer| self.membership_busy(&*peer));
            if let Some(reason) = busy {
                ctx.membership_state = MembershipUseState::InWait;
                self.log(ctx, format_args!("Wait for membership manager, {}", reason));
                return;
            }
        }
        ctx.membership_state = MembershipUseState::InUse;
        if ctx.membership_req_pending != 0 {
            error!(
                "{} membership request with {} still pending",
                self.peer_name(),
                ctx.membership_req_pending
            );
            return;
        }
        ctx.membership_req_pending += 1;
        let peer = match peer_close.peer() {
            Some(peer) => peer,
            None => {
                self.membership_request_complete(ctx, peer_close);
                return;
            }
        };
        let tables = self.membership.get_registered_ribs(&*peer);
        if tables.is_empty() {
            let done = self.membership_request_complete(ctx, peer_close);
            debug_assert!(done);
            return;
        }

        ctx.membership_req_pending -= 1;
        for table in tables {
            ctx.membership_req_pending += 1;
            match self.table_request(ctx.state, &peer, table) {
                Ok(()) => (),
                // The request in flight calls back here while the close holds
                // the membership manager, this table is redone after it
                Err(err @ MembershipError::PendingRequestConflict { .. }) => {
                    warn!("{} close membership request: {}", self.peer_name(), err);
                    ctx.retry_request = true;
                }
                Err(err) => {
                    error!("{} close membership request: {}", self.peer_name(), err);
                    ctx.membership_req_pending -= 1;
                }
            }
        }
        if ctx.membership_req_pending == 0 {
            ctx.membership_req_pending = 1;
            self.membership_request_complete(ctx, peer_close);
        }
    }

    fn table_request(
        &self,
        state: CloseState,
        peer: &Arc<dyn Peer>,
        table: Arc<dyn Table>,
    ) -> Result<(), MembershipError> {
        let peer = Arc::clone(peer);
        if self.membership.is_registered(&*peer, &*table) {
            debug!("{} close {}: {} request", peer.name(), table.name(), state);
            match state {
                CloseState::Delete => self.membership.unregister(peer, table),
                CloseState::Sweep => self.membership.walk_rib_in(peer, table),
                _ => self.membership.unregister_rib_out(peer, table),
            }
        } else {
            match state {
                CloseState::Delete => self.membership.unregister_rib_in(peer, table),
                _ => self.membership.walk_rib_in(peer, table),
            }
        }
    }

    // LLGR_STALE is tested as a bare constant, so the check holds in every
    // state and only guards against callbacks when nothing is in use.
    fn is_membership_manager_in_use(ctx: &CloseContext) -> bool {
        const LLGR_STALE_TERM: bool = true;
        matches!(
            ctx.state,
            CloseState::Stale | CloseState::Sweep | CloseState::Delete
        ) || LLGR_STALE_TERM
            || ctx.membership_state == MembershipUseState::InUse
            || ctx.membership_req_pending > 0
    }

    /// Returns true once the close sequence is done with the membership manager
    fn membership_request_complete(&self, ctx: &mut CloseContext, peer_close: &dyn PeerClose) -> bool {
        self.log(ctx, format_args!("Membership request complete"));
        if !Self::is_membership_manager_in_use(ctx) {
            return false;
        }
        if ctx.membership_req_pending == 0 {
            warn!("{} unexpected membership completion", self.peer_name());
            return false;
        }
        ctx.membership_req_pending -= 1;
        if ctx.membership_req_pending != 0 {
            return false;
        }

        if ctx.retry_request {
            ctx.retry_request = false;
            self.log(ctx, format_args!("Retry membership request"));
            self.membership_request_internal(ctx, peer_close);
            return false;
        }

        if ctx.state == CloseState::Delete {
            self.move_to_state(ctx, CloseState::None);
            peer_close.delete();
            ctx.gr_elapsed = Duration::ZERO;
            ctx.llgr_elapsed = Duration::ZERO;
            ctx.stats.init += 1;
            ctx.close_again = false;
            ctx.graceful = true;
            ctx.membership_state = MembershipUseState::None;
            return true;
        }

        if ctx.close_again {
            ctx.membership_state = MembershipUseState::None;
            self.close_complete(ctx, peer_close);
            return true;
        }

        match ctx.state {
            CloseState::Stale => {
                peer_close.close_complete();
                self.move_to_state(ctx, CloseState::GrTimer);
                ctx.families = peer_close.graceful_restart_families();
                let time = restart_time(peer_close.graceful_restart_time(), ctx.gr_elapsed);
                self.start_restart_timer(ctx, time);
                ctx.stats.gr_timer += 1;
                ctx.membership_state = MembershipUseState::None;
            }
            CloseState::LlgrStale => {
                self.move_to_state(ctx, CloseState::LlgrTimer);
                let time = restart_time(
                    peer_close.long_lived_graceful_restart_time(),
                    ctx.llgr_elapsed,
                );
                self.start_restart_timer(ctx, time);
                ctx.stats.llgr_timer += 1;
                ctx.membership_state = MembershipUseState::None;
            }
            _ => self.trigger_sweep_state_actions(ctx, peer_close),
        }
        true
    }

    fn start_restart_timer(&self, ctx: &CloseContext, duration: Duration) {
        self.log(
            ctx,
            format_args!("Restart timer fires in {} ms", duration.as_millis()),
        );
        let this = self.this.clone();
        self.timer.start(duration, move || {
            if let Some(manager) = this.upgrade() {
                manager.enqueue(CloseEvent::TimerCallback);
            }
        });
    }

    /// Returns the families whose End-of-RIB should be simulated
    fn restart_timer_callback(&self, ctx: &mut CloseContext, peer_close: &dyn PeerClose) -> Vec<Family> {
        if !matches!(ctx.state, CloseState::GrTimer | CloseState::LlgrTimer) {
            return vec![];
        }
        if peer_close.is_ready() && !ctx.families.is_empty() {
            return ctx.families.iter().copied().collect();
        }
        self.process_closure(ctx, peer_close);
        vec![]
    }

    fn process_eor(&self, ctx: &mut CloseContext, family: Option<Family>) {
        if !matches!(ctx.state, CloseState::GrTimer | CloseState::LlgrTimer) || ctx.families.is_empty() {
            return;
        }
        match family {
            Some(family) => {
                ctx.families.remove(family);
            }
            None => ctx.families.clear(),
        }
        if ctx.families.is_empty() {
            self.start_restart_timer(ctx, Duration::ZERO);
        }
    }
}

/// Configured restart time less what already elapsed in earlier cycles
fn restart_time(seconds: u32, elapsed: Duration) -> Duration {
    Duration::from_secs(u64::from(seconds)).saturating_sub(elapsed)
}
