//! # bgpd-membership CLI
//!
//! Runs a membership scenario from a TOML file and prints where every peer
//! and table ended up. Peers join their tables at start, scripted session
//! events (`close`, `hard-close`, `up`, `end-of-rib`, ...) then fire at
//! their configured offsets.
//!
//! ```sh
//! $ bgpd-membership demos/scenario.toml
//! Peers
//!  Neighbor    Kind  Ready  Close State  Membership  Tables  Closes  Stale  LLGR  Sweep  Deletes
//! +----------+-----+------+------------+-----------+-------+-------+------+-----+------+--------+
//!  10.0.0.1    BGP   yes    NONE         NONE        1       1       1      1     1      0
//!  10.0.0.2    BGP   no     NONE         NONE        0       1       0      0     0      1
//!  10.0.0.100  XMPP  yes    NONE         NONE        2       0       0      0     0      0
//! ```
//!
//! A `*` before a neighbor means another close arrived while one was running.
//! Use `--routes` to also list the paths left in each table and `--json`
//! for the full report.

use std::error::Error;

use clap::Parser;
use colored::*;
use log::debug;

use crate::api::ScenarioReport;
use crate::config;
use crate::scenario::Scenario;

mod display;
mod table;

use display::{LearnedPathRow, MembershipRow, PeerSummaryRow, TableSummaryRow};
use table::OutputTable;

#[derive(Parser, Debug)]
#[clap(name = "bgpd-membership", rename_all = "kebab-case")]
/// Run a BGP peer membership and graceful restart scenario
pub struct Args {
    /// Path to scenario config.toml
    pub config_path: String,
    /// Print the final report as JSON
    #[clap(long)]
    pub json: bool,
    /// Also show paths left in each table
    #[clap(short, long)]
    pub routes: bool,
    /// Show debug logs (additive for trace logs)
    #[clap(short, parse(from_occurrences), global = true)]
    pub verbose: u8,
}

async fn run_cmd(args: &Args) -> Result<(), Box<dyn Error>> {
    let config = config::from_file(&args.config_path)?;
    debug!(
        "Found {} tables, {} peers and {} events in {}",
        config.tables.len(),
        config.peers.len(),
        config.events.len(),
        args.config_path
    );
    let scenario = Scenario::new(config);
    let report = scenario.run().await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, args.routes);
    }
    Ok(())
}

fn print_report(report: &ScenarioReport, routes: bool) {
    println!("{}", "Peers".bold());
    let mut table = OutputTable::new();
    for peer in &report.peers {
        table.add_row(&PeerSummaryRow(peer));
    }
    table.print();
    println!();

    println!("{}", "Tables".bold());
    let mut table = OutputTable::new();
    for summary in &report.tables {
        table.add_row(&TableSummaryRow(summary));
    }
    table.print();
    println!();

    if report.memberships > 0 {
        println!("{}", "Memberships".bold());
        let mut table = OutputTable::new();
        for peer in &report.peers {
            for info in &peer.tables {
                table.add_row(&MembershipRow(peer, info));
            }
        }
        table.print();
        println!();
    }

    if routes {
        for summary in report.tables.iter().filter(|t| !t.routes.is_empty()) {
            println!("{} / {}", summary.name, summary.family);
            let mut table = OutputTable::new();
            for route in &summary.routes {
                for path in &route.paths {
                    table.add_row(&LearnedPathRow(&route.prefix, path));
                }
            }
            table.print();
            println!();
        }
    }
    println!(
        "{} memberships, {} membership jobs run",
        report.memberships, report.total_jobs
    );
}

/// Run the scenario named by `args`, reporting failures on stderr
pub async fn run_scenario(args: &Args) -> bool {
    match run_cmd(args).await {
        Ok(()) => true,
        Err(err) => {
            eprintln!("{}", err.to_string().red());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::api::{PeerCloseInfo, PeerReport};
    use crate::peer::PeerCallCounts;

    fn peer_report(state: &str, close_again: bool) -> PeerReport {
        PeerReport {
            peer: "10.0.0.1".to_owned(),
            xmpp: false,
            ready: false,
            calls: PeerCallCounts::default(),
            close: PeerCloseInfo {
                peer: "10.0.0.1".to_owned(),
                state: state.to_owned(),
                membership_state: "IN_USE".to_owned(),
                close_again,
                graceful: true,
                init: 1,
                close: 2,
                nested: 1,
                deletes: 0,
                stale: 1,
                llgr_stale: 0,
                sweep: 0,
                gr_timer: 0,
                llgr_timer: 0,
                route_stats: Default::default(),
            },
            tables: vec![],
        }
    }

    #[test]
    fn test_args() {
        let args = Args::parse_from(["bgpd-membership", "-vv", "--json", "scenario.toml"]);
        assert_eq!(args.config_path, "scenario.toml");
        assert_eq!(args.verbose, 2);
        assert!(args.json);
        assert!(!args.routes);
    }

    #[test]
    fn test_peer_summary() {
        colored::control::set_override(false);
        let mut table = OutputTable::new();
        let report = peer_report("STALE", true);
        table.add_row(&PeerSummaryRow(&report));
        let output = table.render();
        assert!(output.contains("Close State"));
        assert!(output.contains("*10.0.0.1"));
        assert!(output.contains("STALE"));
        assert!(output.contains("IN_USE"));
    }
}
