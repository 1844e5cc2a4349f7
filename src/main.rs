use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use keygate::{app, config, telemetry};
use tracing::error;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Configuration file (JSON). Defaults apply when omitted.
	#[arg(short, long, value_name = "file")]
	config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
	telemetry::log::setup_logging();
	let args = Args::parse();

	let config = match config::parse_config(args.config) {
		Ok(config) => config,
		Err(e) => {
			error!("invalid configuration: {e:#}");
			std::process::exit(1);
		},
	};

	let bound = match app::run(Arc::new(config)).await {
		Ok(bound) => bound,
		Err(e) => {
			error!("startup failed: {e:#}");
			std::process::exit(1);
		},
	};

	if let Err(e) = bound.wait_termination().await {
		error!("runtime error after drain: {e:#}");
		std::process::exit(2);
	}
}
