// Publisher-confirm strategies against the in-process broker.
//
// Every scenario runs the same shape:
// 1) Declare a fresh queue and open a confirming channel.
// 2) Publish `message_count` messages with one of the confirm strategies.
// 3) Close the publishing session, then consume the queue with a countdown
//    that must reach zero before the deadline.
use ackline_broker::{Broker, ConfirmPolicy, QueueOptions};
use ackline_confirm::{ConfirmConfig, OutboundMessage, Publisher};
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::time::timeout_at;
use tracing::{info, warn};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Wait for the confirm of every message before publishing the next.
    Individual,
    /// Publish a batch, then wait for all of its confirms.
    Batches,
    /// Publish continuously; confirms are counted from callbacks.
    Async,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Individual => "publish messages individually",
            Strategy::Batches => "publish messages in batch",
            Strategy::Async => "handle publish confirms asynchronously",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    pub strategy: Strategy,
    pub message_count: usize,
    pub batch_size: usize,
    pub policy: ConfirmPolicy,
    pub confirm: ConfirmConfig,
    /// How long the consumer countdown may take.
    pub consume_deadline: Duration,
    /// How long the async strategy waits for its final confirms.
    pub settle_timeout: Duration,
}

impl ScenarioConfig {
    pub fn new(strategy: Strategy, message_count: usize) -> Self {
        Self {
            strategy,
            message_count,
            batch_size: 100,
            policy: ConfirmPolicy::Immediate,
            confirm: ConfirmConfig::default(),
            consume_deadline: Duration::from_secs(60),
            settle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScenarioReport {
    pub strategy: Strategy,
    pub queue: String,
    pub published: usize,
    pub consumed: usize,
    pub publish_elapsed: Duration,
}

impl ScenarioReport {
    /// Mean publish rate, confirms included.
    pub fn messages_per_second(&self) -> f64 {
        let secs = self.publish_elapsed.as_secs_f64();
        if secs == 0.0 {
            return self.published as f64;
        }
        self.published as f64 / secs
    }
}

pub async fn run_scenario(broker: &Broker, config: &ScenarioConfig) -> Result<ScenarioReport> {
    if config.batch_size == 0 {
        bail!("batch size must be at least 1");
    }
    let queue = uuid::Uuid::new_v4().to_string();
    broker
        .declare_queue(queue.clone(), QueueOptions::default())
        .context("declare queue")?;
    let channel = broker.channel(config.policy).context("open channel")?;
    let publisher =
        Publisher::new(channel, config.confirm.clone()).context("start confirm session")?;

    info!(
        strategy = %config.strategy,
        queue = %queue,
        messages = config.message_count,
        "scenario started"
    );
    let started = Instant::now();
    match config.strategy {
        Strategy::Individual => publish_individually(&publisher, &queue, config).await?,
        Strategy::Batches => publish_in_batches(&publisher, &queue, config).await?,
        Strategy::Async => publish_async(&publisher, &queue, config).await?,
    }
    let publish_elapsed = started.elapsed();
    publisher.close();

    let consumed = consume_with_deadline(broker, &queue, config).await?;
    broker.delete_queue(&queue).context("delete queue")?;
    if consumed != config.message_count {
        bail!(
            "consumed {consumed} of {} messages within {:?}",
            config.message_count,
            config.consume_deadline
        );
    }

    let report = ScenarioReport {
        strategy: config.strategy,
        queue,
        published: config.message_count,
        consumed,
        publish_elapsed,
    };
    info!(
        strategy = %report.strategy,
        rate = format!("{:.0} messages/second", report.messages_per_second()),
        "scenario completed"
    );
    Ok(report)
}

fn message(queue: &str, n: usize) -> OutboundMessage {
    OutboundMessage::new(queue, Bytes::from(n.to_string()))
}

async fn publish_individually(
    publisher: &Publisher,
    queue: &str,
    config: &ScenarioConfig,
) -> Result<()> {
    for n in 0..config.message_count {
        publisher.publish(message(queue, n)).await?;
        publisher
            .wait_for_confirms_or_die(config.confirm.confirm_timeout)
            .await
            .with_context(|| format!("confirm of message {n}"))?;
    }
    Ok(())
}

async fn publish_in_batches(
    publisher: &Publisher,
    queue: &str,
    config: &ScenarioConfig,
) -> Result<()> {
    let mut in_batch = 0;
    for n in 0..config.message_count {
        publisher.publish(message(queue, n)).await?;
        in_batch += 1;
        if in_batch == config.batch_size {
            publisher
                .wait_for_confirms_or_die(config.confirm.confirm_timeout)
                .await
                .context("batch confirm")?;
            in_batch = 0;
        }
    }
    if in_batch > 0 {
        publisher
            .wait_for_confirms_or_die(config.confirm.confirm_timeout)
            .await
            .context("final batch confirm")?;
    }
    Ok(())
}

async fn publish_async(publisher: &Publisher, queue: &str, config: &ScenarioConfig) -> Result<()> {
    let acked = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    for n in 0..config.message_count {
        let acked = Arc::clone(&acked);
        let failed = Arc::clone(&failed);
        publisher
            .publish_with_callback(message(queue, n), move |confirmation| {
                if confirmation.is_ack() {
                    acked.fetch_add(1, Ordering::Relaxed);
                } else {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            })
            .await?;
    }
    if !publisher.wait_for_confirms(config.settle_timeout).await? {
        warn!(
            failed = failed.load(Ordering::Relaxed),
            "some publishes were not acked"
        );
    }
    let failed = failed.load(Ordering::Relaxed);
    if failed > 0 {
        bail!("{failed} publishes were not acked");
    }
    let acked = acked.load(Ordering::Relaxed);
    if acked != config.message_count {
        bail!("{acked} of {} publishes acked", config.message_count);
    }
    Ok(())
}

async fn consume_with_deadline(
    broker: &Broker,
    queue: &str,
    config: &ScenarioConfig,
) -> Result<usize> {
    let mut consumer = broker.consume(queue).context("start consumer")?;
    let deadline = tokio::time::Instant::now() + config.consume_deadline;
    let mut consumed = 0;
    while consumed < config.message_count {
        match timeout_at(deadline, consumer.recv()).await {
            Ok(Some(_)) => consumed += 1,
            Ok(None) => break,
            Err(_) => {
                warn!(queue = %queue, consumed, "consumer deadline passed");
                break;
            }
        }
    }
    Ok(consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_handles_zero_elapsed() {
        let report = ScenarioReport {
            strategy: Strategy::Individual,
            queue: "q".to_string(),
            published: 10,
            consumed: 10,
            publish_elapsed: Duration::ZERO,
        };
        assert_eq!(report.messages_per_second(), 10.0);
    }

    #[test]
    fn strategy_names_match_scenarios() {
        assert_eq!(
            Strategy::Individual.to_string(),
            "publish messages individually"
        );
        assert_eq!(
            Strategy::Async.to_string(),
            "handle publish confirms asynchronously"
        );
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let broker = Broker::new();
        let mut config = ScenarioConfig::new(Strategy::Batches, 10);
        config.batch_size = 0;
        assert!(run_scenario(&broker, &config).await.is_err());
    }
}
