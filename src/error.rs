use std::net::IpAddr;

use crate::membership::Action;

/// Contract violations raised by the membership front door.
///
/// Every variant means the caller sequenced its requests incorrectly for a
/// (peer, table) pair. None of them are transient and none are retried.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum MembershipError {
    #[error("{peer} already registered to {table}")]
    DuplicateRegistration { peer: IpAddr, table: String },

    #[error("{peer} is not registered to {table}")]
    UnregisteredEntity { peer: IpAddr, table: String },

    #[error("{peer} has a pending {action} request for {table}")]
    PendingRequestConflict {
        peer: IpAddr,
        table: String,
        action: Action,
    },

    #[error("{peer} still has RibOut registered to {table}")]
    RibOutRegistered { peer: IpAddr, table: String },
}

impl MembershipError {
    /// (peer, table) the violation was raised for
    pub fn key(&self) -> (IpAddr, &str) {
        use MembershipError::*;
        match self {
            DuplicateRegistration { peer, table }
            | UnregisteredEntity { peer, table }
            | PendingRequestConflict { peer, table, .. }
            | RibOutRegistered { peer, table } => (*peer, table.as_str()),
        }
    }
}
