use colored::*;
use prettytable::{cell, row, Row};

use crate::api::{LearnedPath, PeerReport, PeerTableInfo, TableReport};
use crate::utils::{maybe_string, EMPTY_VALUE};

use super::table::ToRow;

/// Close states colored by how far the peer is from a clean session
pub(super) fn colored_state(state: &str) -> ColoredString {
    match state {
        "NONE" => state.green(),
        "GR_TIMER" | "LLGR_TIMER" => state.yellow(),
        "DELETE" => state.red(),
        _ => state.cyan(),
    }
}

pub(super) struct PeerSummaryRow<'a>(pub &'a PeerReport);

impl ToRow for PeerSummaryRow<'_> {
    fn columns() -> Row {
        row![
            "Neighbor",
            "Kind",
            "Ready",
            "Close State",
            "Membership",
            "Tables",
            "Closes",
            "Stale",
            "LLGR",
            "Sweep",
            "Deletes"
        ]
    }

    fn to_row(&self) -> Row {
        let peer = self.0;
        let close = &peer.close;
        row![
            if close.close_again {
                format!("*{}", peer.peer)
            } else {
                peer.peer.clone()
            },
            if peer.xmpp { "XMPP" } else { "BGP" },
            if peer.ready { "yes" } else { "no" },
            colored_state(&close.state),
            close.membership_state,
            peer.tables.len(),
            close.close,
            close.stale,
            close.llgr_stale,
            close.sweep,
            close.deletes,
        ]
    }
}

pub(super) struct MembershipRow<'a>(pub &'a PeerReport, pub &'a PeerTableInfo);

impl ToRow for MembershipRow<'_> {
    fn columns() -> Row {
        row!["Neighbor", "Table", "State", "RibIn", "RibOut", "Policy", "Queued"]
    }

    fn to_row(&self) -> Row {
        let (peer, info) = (self.0, self.1);
        row![
            peer.peer,
            info.table,
            info.current_state,
            info.ribin_registered,
            info.ribout_registered,
            maybe_string(info.policy.as_ref()),
            info.queue_depth,
        ]
    }
}

pub(super) struct TableSummaryRow<'a>(pub &'a TableReport);

impl ToRow for TableSummaryRow<'_> {
    fn columns() -> Row {
        row!["Table", "Family", "Peers", "Requests", "Walks", "Routes", "Paths"]
    }

    fn to_row(&self) -> Row {
        let table = self.0;
        let (peers, requests, walks) = match &table.membership {
            Some(info) => (info.peers.len(), info.requests, info.walks),
            None => (0, 0, 0),
        };
        row![
            table.name,
            table.family,
            peers,
            requests,
            walks,
            table.routes.len(),
            table.routes.iter().map(|r| r.paths.len()).sum::<usize>(),
        ]
    }
}

pub(super) struct LearnedPathRow<'a>(pub &'a str, pub &'a LearnedPath);

impl ToRow for LearnedPathRow<'_> {
    fn columns() -> Row {
        row![
            "Received From",
            "Prefix",
            "Next Hop",
            "Age",
            "Origin",
            "Local Pref",
            "Metric",
            "AS Path",
            "Communities",
            "Stale"
        ]
    }

    fn to_row(&self) -> Row {
        let (prefix, path) = (self.0, self.1);
        let stale = if path.llgr_stale {
            "llgr".yellow()
        } else if path.stale {
            "gr".yellow()
        } else {
            EMPTY_VALUE.normal()
        };
        row![
            path.source,
            prefix,
            maybe_string(path.next_hop.as_ref()),
            path.age,
            path.origin,
            maybe_string(path.local_pref.as_ref()),
            maybe_string(path.multi_exit_disc.as_ref()),
            path.as_path,
            path.communities.join(" "),
            stale,
        ]
    }
}
