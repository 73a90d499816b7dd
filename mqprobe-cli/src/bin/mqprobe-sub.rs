#![forbid(unsafe_code)]

//! Subscriber: records every test message until interrupted, then merges its
//! results into the summary the publisher left behind.

use clap::Parser;
use mqprobe_cli::{broker_client, init_logging, persist, Args};
use mqprobe_core::Role;
use mqprobe_session::Subscriber;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_logging();
	let args = Args::parse();
	let cfg = args.config(Role::Subscriber);

	let (client, events) = broker_client(&cfg)?;
	let shutdown = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!(error = %e, "cannot listen for interrupt, stopping");
		}
		info!("interrupt received");
	};
	let report = Subscriber::new(cfg.clone(), client, events).run(shutdown).await?;
	match report.loss() {
		Ok(loss) => info!(received = report.received(), loss, disconnects = report.disconnects.len(), "session finished"),
		Err(e) => warn!(reason = %e, "no loss ratio"),
	}
	persist(&cfg, &report)?;
	Ok(())
}
