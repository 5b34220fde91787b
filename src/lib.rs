pub mod api;
#[cfg(feature = "cli")]
pub mod cli;
pub mod close;
pub mod config;
pub mod error;
pub mod membership;
pub mod peer;
pub mod rib;
pub mod scenario;
pub mod utils;

#[cfg(test)]
mod test_util;

pub use close::PeerCloseManager;
pub use config::MembershipConfig;
pub use error::MembershipError;
pub use membership::MembershipManager;
pub use scenario::Scenario;
