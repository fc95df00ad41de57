// Test harness publisher: runs confirm strategies against an in-process broker
// and reports the publish rate of each.
use ackline_broker::{Broker, ConfirmPolicy};
use ackline_confirm::ConfirmConfig;
use ackline_test_harness::{ScenarioConfig, Strategy, run_scenario};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "publisher")]
#[command(about = "Publisher-confirm strategies against the in-process broker")]
struct Args {
    /// Strategies to run, in order
    #[arg(long, value_enum, value_delimiter = ',', default_value = "individual")]
    strategy: Vec<Strategy>,

    /// Messages published per strategy
    #[arg(long, default_value = "10000")]
    count: usize,

    /// Messages per confirm wait for the batches strategy
    #[arg(long, default_value = "100")]
    batch_size: usize,

    /// Collapse broker acks into multiple-acks of at most this many tags (0 = one confirm per message)
    #[arg(long, default_value = "0")]
    broker_batch: usize,

    /// Consumer countdown deadline in seconds
    #[arg(long, default_value = "60")]
    deadline: u64,

    /// Optional YAML file with confirm settings (ACKLINE_* environment variables apply first)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let confirm = ConfirmConfig::from_env_or_yaml(args.config.as_deref())
        .context("load confirm config")?;
    let policy = match args.broker_batch {
        0 => ConfirmPolicy::Immediate,
        max_batch => ConfirmPolicy::Batched { max_batch },
    };
    info!(
        strategies = ?args.strategy,
        count = args.count,
        max_outstanding = confirm.max_outstanding,
        confirm_timeout = ?confirm.confirm_timeout,
        ?policy,
        "Starting publisher"
    );

    let broker = Broker::new();
    let mut failures = 0;
    for strategy in &args.strategy {
        let mut scenario = ScenarioConfig::new(*strategy, args.count);
        scenario.batch_size = args.batch_size;
        scenario.policy = policy;
        scenario.confirm = confirm.clone();
        scenario.consume_deadline = Duration::from_secs(args.deadline);

        match run_scenario(&broker, &scenario).await {
            Ok(report) => info!(
                strategy = %report.strategy,
                published = report.published,
                consumed = report.consumed,
                elapsed = format!("{:.2}s", report.publish_elapsed.as_secs_f64()),
                rate = format!("{:.0} messages/second", report.messages_per_second()),
                "Strategy completed"
            ),
            Err(e) => {
                failures += 1;
                error!(strategy = %strategy, error = %e, "Strategy failed");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} strategies failed");
    }
    Ok(())
}
