use clap::Parser;
use env_logger::Builder;
use log::{info, LevelFilter};

use bgpd_membership::cli::{run_scenario, Args};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let (membership_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("bgpd_membership"), membership_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", membership_level, other_level);

    if !run_scenario(&args).await {
        std::process::exit(1);
    }
}
