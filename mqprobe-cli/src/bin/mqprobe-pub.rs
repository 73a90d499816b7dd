#![forbid(unsafe_code)]

//! Publisher: sends the configured number of sequenced messages, waits for
//! acknowledgements, writes datasets and the summary, then exits.

use clap::Parser;
use mqprobe_cli::{broker_client, init_logging, persist, Args};
use mqprobe_core::Role;
use mqprobe_session::Publisher;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_logging();
	let args = Args::parse();
	let cfg = args.config(Role::Publisher);

	let (client, events) = broker_client(&cfg)?;
	let report = Publisher::new(cfg.clone(), client, events).run().await?;
	match report.delay_stats() {
		Ok(s) => info!(count = s.count, mean_ms = s.mean, median_ms = s.median, "publish delay"),
		Err(e) => info!(reason = %e, "no publish delay statistics"),
	}
	persist(&cfg, &report)?;
	Ok(())
}
