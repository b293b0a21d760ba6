use clap::Parser;
use tracing::{error, info};

use isograft::cli::Cli;
use isograft::config::RunConfig;
use isograft::error::exit_code_for;
use isograft::pipeline::Pipeline;

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("isograft={},warn", log_level))
        .init();

    info!("isograft v{} starting", env!("CARGO_PKG_VERSION"));

    let result = RunConfig::from_cli(cli).and_then(|config| Pipeline::new(config).run());

    match result {
        Ok(summary) => {
            info!("✓ Rebuilt ISO written to {}", summary.output_iso.display());
            info!(
                "  injected {} kernel module(s), {} RPM package(s)",
                summary.modules_injected, summary.rpms_injected
            );
        }
        Err(e) => {
            error!("✗ Operation failed: {:#}", e);
            std::process::exit(exit_code_for(&e));
        }
    }
}
