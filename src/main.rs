//! flex-collector - declarative telemetry collector
//!
//! One-shot mode runs a single harvest cycle and prints the integration
//! payload (and drained metric batches) to stdout. Serve mode harvests on
//! an interval and exposes the status server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use flex_collector::cli::{Cli, LogFormat};
use flex_collector::config::Config;
use flex_collector::context::CollectorContext;
use flex_collector::runner::{self, Runner};
use flex_collector::server::{self, AppState};
use flex_collector::transformer::PayloadFormatter;

fn load_configs(cli: &Cli) -> Result<Vec<Config>> {
    match &cli.config_file {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            Ok(vec![config])
        }
        None => {
            let dir = cli.config_dir_or_default();
            Config::load_dir(&dir)
                .with_context(|| format!("Failed to read config directory {}", dir.display()))
        }
    }
}

/// Print the payload, plus drained batches when any config uses the metric API
fn print_output(
    configs: &[Config],
    ctx: &CollectorContext,
    formatter: &PayloadFormatter,
) -> Result<()> {
    let payload = ctx.take_payload();
    println!("{}", formatter.format(&payload)?);

    if configs.iter().any(|c| c.metric_api) {
        let batches = ctx.store().drain();
        println!("{}", formatter.format(&batches)?);
    }
    Ok(())
}

async fn serve(cli: &Cli, configs: Vec<Config>, state: AppState, runner: Runner) -> Result<()> {
    let interval = Duration::from_secs(cli.interval.max(1));
    let harvest_state = state.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let summary = runner.harvest(&configs, &harvest_state.ctx).await;
            let payload = harvest_state.ctx.take_payload();
            match harvest_state.formatter.format(&payload) {
                Ok(out) => println!("{}", out),
                Err(e) => error!(error = %e, "Failed to format payload"),
            }
            harvest_state.set_last_harvest(summary);
        }
    });

    server::run(state, cli.port).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    flex_collector::init_logging(cli.log_level.directive(), cli.log_format == LogFormat::Json)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting flex-collector");

    let configs = load_configs(&cli)?;

    if cli.validate {
        let apis = runner::validate(&configs)?;
        println!(
            "Configuration valid: {} config(s), {} API(s)",
            configs.len(),
            apis
        );
        return Ok(());
    }

    let formatter = PayloadFormatter::new().with_pretty(cli.pretty);
    let ctx = Arc::new(
        CollectorContext::new()
            .with_event_limit(cli.event_limit)
            .with_interval_ms(cli.interval.saturating_mul(1000)),
    );
    let runner = Runner::new();

    if cli.serve {
        let state = AppState::new(Arc::clone(&ctx)).with_formatter(formatter);
        return serve(&cli, configs, state, runner).await;
    }

    runner.harvest(&configs, &ctx).await;
    print_output(&configs, &ctx, &formatter)
}
