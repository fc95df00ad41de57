// In-process broker with AMQP-style publisher confirms.
// Queues are addressed through the default exchange: a message's routing key is
// the queue name. Each channel numbers its publishes once it enters confirm mode
// and reports the outcome of every publish from its own confirm task.
use ackline_confirm::{
    ChannelError, CloseCallback, CloseReason, ConfirmCallback, ConfirmChannel, ConfirmEvent,
    DeliveryTag, OutboundMessage,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{Notify, mpsc};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("queue {queue} already declared with different options")]
    PreconditionFailed { queue: String },
    #[error("batched confirm policy needs max_batch >= 1")]
    InvalidBatchSize,
    #[error("broker is shut down")]
    ShutDown,
    #[error("confirm task needs a tokio runtime")]
    NoRuntime,
}

/// How a channel reports publish outcomes once it is in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmPolicy {
    /// One single-tag ack or nack per publish.
    Immediate,
    /// Runs of consecutive acks collapse into one `multiple` ack, at most
    /// `max_batch` publishes per confirm pass.
    Batched { max_batch: usize },
    /// Nothing is confirmed until `BrokerChannel::emit_confirm` is called.
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Publishes beyond this many ready messages are rejected with a nack.
    pub max_length: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    queue: String,
    payload: Bytes,
    enqueued_at: Instant,
}

impl Delivery {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }
}

#[derive(Debug)]
struct Queue {
    name: String,
    options: QueueOptions,
    ready: Mutex<VecDeque<Delivery>>,
    // Wakes consumers on push and on close.
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteOutcome {
    Enqueued,
    Unroutable,
    Rejected,
}

impl Queue {
    fn new(name: String, options: QueueOptions) -> Self {
        Self {
            name,
            options,
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, payload: Bytes) -> RouteOutcome {
        {
            let mut ready = self.ready.lock();
            if let Some(max_length) = self.options.max_length
                && ready.len() >= max_length
            {
                return RouteOutcome::Rejected;
            }
            ready.push_back(Delivery {
                queue: self.name.clone(),
                payload,
                enqueued_at: Instant::now(),
            });
        }
        self.notify.notify_one();
        RouteOutcome::Enqueued
    }

    fn pop(&self) -> Option<Delivery> {
        self.ready.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.ready.lock().len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct QueueRegistry {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
}

impl QueueRegistry {
    fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().get(name).cloned()
    }

    fn route(&self, message: OutboundMessage) -> RouteOutcome {
        let Some(queue) = self.get(&message.routing_key) else {
            tracing::debug!(routing_key = %message.routing_key, "unroutable message dropped");
            return RouteOutcome::Unroutable;
        };
        let outcome = queue.push(message.payload);
        if outcome == RouteOutcome::Rejected {
            tracing::warn!(queue = %queue.name, "queue full, publish rejected");
        }
        outcome
    }
}

#[derive(Debug, Default)]
struct ChannelRegistry {
    open: Vec<Weak<BrokerChannel>>,
    shut_down: bool,
}

/// In-process broker: named queues plus the channels publishing into them.
///
/// ```
/// use ackline_broker::{Broker, ConfirmPolicy, QueueOptions};
/// use ackline_confirm::{ConfirmConfig, OutboundMessage, Publisher};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = Broker::new();
///     broker.declare_queue("orders", QueueOptions::default()).expect("declare");
///     let channel = broker.channel(ConfirmPolicy::Immediate).expect("channel");
///     let publisher = Publisher::new(channel, ConfirmConfig::default()).expect("publisher");
///     let confirmation = publisher
///         .publish_confirmed(OutboundMessage::new("orders", "hello"))
///         .await
///         .expect("confirm");
///     assert!(confirmation.is_ack());
///     let mut consumer = broker.consume("orders").expect("consume");
///     let delivery = consumer.recv().await.expect("delivery");
///     assert_eq!(delivery.payload().as_ref(), b"hello");
/// });
/// ```
#[derive(Debug, Default)]
pub struct Broker {
    queues: Arc<QueueRegistry>,
    channels: Mutex<ChannelRegistry>,
    next_channel_id: AtomicU64,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a queue. Redeclaring with the same options is a no-op.
    pub fn declare_queue(&self, name: impl Into<String>, options: QueueOptions) -> Result<()> {
        let name = name.into();
        let mut queues = self.queues.queues.write();
        if let Some(existing) = queues.get(&name) {
            if existing.options != options {
                return Err(BrokerError::PreconditionFailed { queue: name });
            }
            return Ok(());
        }
        tracing::info!(queue = %name, max_length = ?options.max_length, "queue declared");
        queues.insert(name.clone(), Arc::new(Queue::new(name, options)));
        Ok(())
    }

    /// Delete a queue. Its consumers see the remaining messages, then end.
    pub fn delete_queue(&self, name: &str) -> Result<usize> {
        let queue = self
            .queues
            .queues
            .write()
            .remove(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        queue.close();
        let remaining = queue.len();
        tracing::info!(queue = %name, remaining, "queue deleted");
        Ok(remaining)
    }

    pub fn queue_len(&self, name: &str) -> Result<usize> {
        self.queues
            .get(name)
            .map(|queue| queue.len())
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    /// Open a channel. Confirming policies spawn the channel's confirm task on the
    /// current tokio runtime.
    pub fn channel(&self, policy: ConfirmPolicy) -> Result<Arc<BrokerChannel>> {
        if let ConfirmPolicy::Batched { max_batch: 0 } = policy {
            return Err(BrokerError::InvalidBatchSize);
        }
        let mut channels = self.channels.lock();
        if channels.shut_down {
            return Err(BrokerError::ShutDown);
        }
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        let channel = match policy {
            ConfirmPolicy::Manual => Arc::new(BrokerChannel::new(
                id,
                Arc::clone(&self.queues),
                policy,
                None,
            )),
            ConfirmPolicy::Immediate | ConfirmPolicy::Batched { .. } => {
                let runtime =
                    tokio::runtime::Handle::try_current().map_err(|_| BrokerError::NoRuntime)?;
                let (tx, rx) = mpsc::unbounded_channel();
                let channel = Arc::new(BrokerChannel::new(
                    id,
                    Arc::clone(&self.queues),
                    policy,
                    Some(tx),
                ));
                runtime.spawn(run_confirms(Arc::downgrade(&channel), rx, policy));
                channel
            }
        };
        channels.open.retain(|weak| weak.strong_count() > 0);
        channels.open.push(Arc::downgrade(&channel));
        tracing::debug!(channel = id, ?policy, "channel opened");
        Ok(channel)
    }

    /// Start consuming `queue`. Deliveries are auto-acked.
    pub fn consume(&self, queue: &str) -> Result<Consumer> {
        let queue = self
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        Ok(Consumer { queue })
    }

    /// Close every open channel with `reason` and stop accepting new ones.
    /// Consumers drain what is already queued, then end.
    pub fn shutdown(&self, reason: CloseReason) -> usize {
        let open = {
            let mut channels = self.channels.lock();
            channels.shut_down = true;
            std::mem::take(&mut channels.open)
        };
        let mut closed = 0;
        for channel in open.iter().filter_map(Weak::upgrade) {
            if channel.close(reason.clone()) {
                closed += 1;
            }
        }
        for queue in self.queues.queues.read().values() {
            queue.close();
        }
        tracing::info!(reason = %reason, channels = closed, "broker shut down");
        closed
    }
}

// (tag, ack) for one publish, in publish order.
type PublishOutcome = (DeliveryTag, bool);

struct ChannelState {
    confirm_mode: bool,
    next_tag: u64,
    closed: Option<CloseReason>,
    confirm_callbacks: Vec<ConfirmCallback>,
    close_callbacks: Vec<CloseCallback>,
}

/// One channel on the in-process broker.
pub struct BrokerChannel {
    id: u64,
    queues: Arc<QueueRegistry>,
    policy: ConfirmPolicy,
    state: Mutex<ChannelState>,
    outcomes: Option<mpsc::UnboundedSender<PublishOutcome>>,
}

impl std::fmt::Debug for BrokerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerChannel")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("open", &self.is_open())
            .finish()
    }
}

impl BrokerChannel {
    fn new(
        id: u64,
        queues: Arc<QueueRegistry>,
        policy: ConfirmPolicy,
        outcomes: Option<mpsc::UnboundedSender<PublishOutcome>>,
    ) -> Self {
        Self {
            id,
            queues,
            policy,
            state: Mutex::new(ChannelState {
                confirm_mode: false,
                next_tag: 0,
                closed: None,
                confirm_callbacks: Vec::new(),
                close_callbacks: Vec::new(),
            }),
            outcomes,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn policy(&self) -> ConfirmPolicy {
        self.policy
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().closed.is_none()
    }

    /// Deliver a confirm on the calling thread. Meant for `ConfirmPolicy::Manual`.
    pub fn emit_confirm(&self, tag: impl Into<DeliveryTag>, multiple: bool, ack: bool) {
        self.deliver(ConfirmEvent {
            tag: tag.into(),
            multiple,
            ack,
        });
    }

    /// Close the channel. Returns `false` if it was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason.clone());
            state.confirm_callbacks.clear();
            std::mem::take(&mut state.close_callbacks)
        };
        tracing::info!(channel = self.id, reason = %reason, "channel closed");
        for callback in callbacks {
            callback(reason.clone());
        }
        true
    }

    fn deliver(&self, event: ConfirmEvent) {
        let callbacks = {
            let state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            state.confirm_callbacks.clone()
        };
        for callback in callbacks {
            callback(event);
        }
    }
}

impl ConfirmChannel for BrokerChannel {
    fn confirm_select(&self) -> std::result::Result<(), ChannelError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.closed {
            return Err(ChannelError::Closed(reason.clone()));
        }
        if !state.confirm_mode {
            state.confirm_mode = true;
            state.next_tag = 1;
        }
        Ok(())
    }

    fn next_publish_seq_no(&self) -> DeliveryTag {
        DeliveryTag::new(self.state.lock().next_tag)
    }

    fn send(&self, message: OutboundMessage) -> std::result::Result<DeliveryTag, ChannelError> {
        // Tag assignment, routing and outcome queueing share the lock so confirms
        // leave in publish order.
        let mut state = self.state.lock();
        if let Some(reason) = &state.closed {
            return Err(ChannelError::Closed(reason.clone()));
        }
        if !state.confirm_mode {
            return Err(ChannelError::ConfirmsNotEnabled);
        }
        let tag = DeliveryTag::new(state.next_tag);
        state.next_tag += 1;
        let ack = self.queues.route(message) != RouteOutcome::Rejected;
        if let Some(outcomes) = &self.outcomes {
            // The receiver only goes away with the channel itself.
            let _ = outcomes.send((tag, ack));
        }
        Ok(tag)
    }

    fn on_confirm(&self, callback: ConfirmCallback) {
        self.state.lock().confirm_callbacks.push(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        let reason = {
            let mut state = self.state.lock();
            match &state.closed {
                Some(reason) => reason.clone(),
                None => {
                    state.close_callbacks.push(callback);
                    return;
                }
            }
        };
        callback(reason);
    }
}

async fn run_confirms(
    channel: Weak<BrokerChannel>,
    mut outcomes: mpsc::UnboundedReceiver<PublishOutcome>,
    policy: ConfirmPolicy,
) {
    let max_batch = match policy {
        ConfirmPolicy::Batched { max_batch } => max_batch,
        ConfirmPolicy::Immediate | ConfirmPolicy::Manual => 1,
    };
    let mut batch = Vec::with_capacity(max_batch);
    while let Some(first) = outcomes.recv().await {
        batch.clear();
        batch.push(first);
        while batch.len() < max_batch {
            match outcomes.try_recv() {
                Ok(outcome) => batch.push(outcome),
                Err(_) => break,
            }
        }
        let Some(channel) = channel.upgrade() else {
            return;
        };
        if !channel.is_open() {
            return;
        }
        for event in collapse_acks(&batch) {
            channel.deliver(event);
        }
    }
}

// Consecutive acks become one ack for the last tag of the run, `multiple` when the
// run covers more than one publish. Nacks always go out individually.
fn collapse_acks(batch: &[PublishOutcome]) -> Vec<ConfirmEvent> {
    fn ack_run(tag: DeliveryTag, len: usize) -> ConfirmEvent {
        if len == 1 {
            ConfirmEvent::ack(tag)
        } else {
            ConfirmEvent::ack_multiple(tag)
        }
    }

    let mut events = Vec::new();
    let mut run: Option<(DeliveryTag, usize)> = None;
    for &(tag, ack) in batch {
        if ack {
            run = Some((tag, run.map_or(1, |(_, len)| len + 1)));
            continue;
        }
        if let Some((last, len)) = run.take() {
            events.push(ack_run(last, len));
        }
        events.push(ConfirmEvent::nack(tag));
    }
    if let Some((last, len)) = run {
        events.push(ack_run(last, len));
    }
    events
}

/// Auto-ack consumer on one queue.
#[derive(Debug)]
pub struct Consumer {
    queue: Arc<Queue>,
}

impl Consumer {
    /// Next delivery, waiting if the queue is empty. `None` once the queue is
    /// deleted (or the broker shut down) and nothing is left.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the await wakes us.
            notified.as_mut().enable();
            if let Some(delivery) = self.queue.pop() {
                return Some(delivery);
            }
            if self.queue.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.queue.pop()
    }

    pub fn queue(&self) -> &str {
        &self.queue.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn confirm_log(channel: &BrokerChannel) -> Arc<Mutex<Vec<ConfirmEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        channel.on_confirm(Arc::new(move |event: ConfirmEvent| sink.lock().push(event)));
        log
    }

    async fn wait_for_events(log: &Mutex<Vec<ConfirmEvent>>, count: usize) {
        timeout(Duration::from_secs(1), async {
            while log.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("confirms arrive");
    }

    #[tokio::test]
    async fn confirm_select_starts_numbering_at_one() {
        let broker = Broker::new();
        let channel = broker.channel(ConfirmPolicy::Manual).expect("channel");
        assert_eq!(channel.next_publish_seq_no(), DeliveryTag::new(0));
        assert_eq!(
            channel.send(OutboundMessage::new("q", "x")),
            Err(ChannelError::ConfirmsNotEnabled)
        );
        channel.confirm_select().expect("select");
        channel.confirm_select().expect("idempotent");
        assert_eq!(channel.next_publish_seq_no(), DeliveryTag::new(1));
        assert_eq!(
            channel.send(OutboundMessage::new("q", "x")),
            Ok(DeliveryTag::new(1))
        );
        assert_eq!(channel.next_publish_seq_no(), DeliveryTag::new(2));
    }

    #[tokio::test]
    async fn immediate_policy_acks_each_publish() {
        let broker = Broker::new();
        broker
            .declare_queue("orders", QueueOptions::default())
            .expect("declare");
        let channel = broker.channel(ConfirmPolicy::Immediate).expect("channel");
        channel.confirm_select().expect("select");
        let log = confirm_log(&channel);
        for n in 0..3 {
            channel
                .send(OutboundMessage::new("orders", format!("m{n}")))
                .expect("send");
        }
        wait_for_events(&log, 3).await;
        assert_eq!(
            *log.lock(),
            vec![
                ConfirmEvent::ack(1),
                ConfirmEvent::ack(2),
                ConfirmEvent::ack(3)
            ]
        );
        assert_eq!(broker.queue_len("orders"), Ok(3));
    }

    #[tokio::test]
    async fn full_queue_nacks_and_unroutable_acks() {
        let broker = Broker::new();
        broker
            .declare_queue(
                "bounded",
                QueueOptions {
                    max_length: Some(1),
                },
            )
            .expect("declare");
        let channel = broker.channel(ConfirmPolicy::Immediate).expect("channel");
        channel.confirm_select().expect("select");
        let log = confirm_log(&channel);
        channel
            .send(OutboundMessage::new("bounded", "a"))
            .expect("send");
        channel
            .send(OutboundMessage::new("bounded", "b"))
            .expect("send");
        channel
            .send(OutboundMessage::new("nowhere", "c"))
            .expect("send");
        wait_for_events(&log, 3).await;
        assert_eq!(
            *log.lock(),
            vec![
                ConfirmEvent::ack(1),
                ConfirmEvent::nack(2),
                ConfirmEvent::ack(3)
            ]
        );
        assert_eq!(broker.queue_len("bounded"), Ok(1));
    }

    #[test]
    fn collapse_acks_merges_runs_around_nacks() {
        let outcomes = [
            (DeliveryTag::new(1), true),
            (DeliveryTag::new(2), true),
            (DeliveryTag::new(3), true),
            (DeliveryTag::new(4), false),
            (DeliveryTag::new(5), true),
            (DeliveryTag::new(6), true),
        ];
        assert_eq!(
            collapse_acks(&outcomes),
            vec![
                ConfirmEvent::ack_multiple(3),
                ConfirmEvent::nack(4),
                ConfirmEvent::ack_multiple(6),
            ]
        );
        assert_eq!(
            collapse_acks(&[(DeliveryTag::new(7), true)]),
            vec![ConfirmEvent::ack(7)]
        );
    }

    #[tokio::test]
    async fn batched_policy_covers_every_tag() {
        let broker = Broker::new();
        broker
            .declare_queue("orders", QueueOptions::default())
            .expect("declare");
        let channel = broker
            .channel(ConfirmPolicy::Batched { max_batch: 8 })
            .expect("channel");
        channel.confirm_select().expect("select");
        let log = confirm_log(&channel);
        for n in 0..20 {
            channel
                .send(OutboundMessage::new("orders", format!("m{n}")))
                .expect("send");
        }
        timeout(Duration::from_secs(1), async {
            while log.lock().last().map(|event| event.tag) != Some(DeliveryTag::new(20)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("last tag confirmed");
        let events = log.lock().clone();
        assert!(events.iter().all(|event| event.ack));
        assert!(events.windows(2).all(|pair| pair[0].tag < pair[1].tag));
        assert!(events.len() < 20);
    }

    #[test]
    fn zero_batch_is_rejected() {
        let broker = Broker::new();
        assert_eq!(
            broker
                .channel(ConfirmPolicy::Batched { max_batch: 0 })
                .unwrap_err(),
            BrokerError::InvalidBatchSize
        );
    }

    #[test]
    fn confirming_channel_needs_a_runtime() {
        let broker = Broker::new();
        assert_eq!(
            broker.channel(ConfirmPolicy::Immediate).unwrap_err(),
            BrokerError::NoRuntime
        );
        assert!(broker.channel(ConfirmPolicy::Manual).is_ok());
    }

    #[tokio::test]
    async fn manual_confirms_run_on_caller() {
        let broker = Broker::new();
        let channel = broker.channel(ConfirmPolicy::Manual).expect("channel");
        channel.confirm_select().expect("select");
        let log = confirm_log(&channel);
        channel.send(OutboundMessage::new("q", "x")).expect("send");
        assert!(log.lock().is_empty());
        channel.emit_confirm(1, true, true);
        assert_eq!(*log.lock(), vec![ConfirmEvent::ack_multiple(1)]);
    }

    #[tokio::test]
    async fn close_fires_callbacks_once_and_fails_sends() {
        let broker = Broker::new();
        let channel = broker.channel(ConfirmPolicy::Manual).expect("channel");
        channel.confirm_select().expect("select");
        let closes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&closes);
        channel.on_close(Arc::new(move |reason: CloseReason| sink.lock().push(reason)));

        let reason = CloseReason::connection_forced("test");
        assert!(channel.close(reason.clone()));
        assert!(!channel.close(CloseReason::normal()));
        assert_eq!(*closes.lock(), vec![reason.clone()]);
        assert_eq!(
            channel.send(OutboundMessage::new("q", "x")),
            Err(ChannelError::Closed(reason.clone()))
        );

        // Late registration still hears about the close.
        let late = Arc::clone(&closes);
        channel.on_close(Arc::new(move |reason: CloseReason| late.lock().push(reason)));
        assert_eq!(closes.lock().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_channels_and_consumers() {
        let broker = Broker::new();
        broker
            .declare_queue("orders", QueueOptions::default())
            .expect("declare");
        let first = broker.channel(ConfirmPolicy::Manual).expect("channel");
        let second = broker.channel(ConfirmPolicy::Immediate).expect("channel");
        let mut consumer = broker.consume("orders").expect("consume");
        let waiting = tokio::spawn(async move { consumer.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(broker.shutdown(CloseReason::connection_forced("bye")), 2);
        assert!(!first.is_open() && !second.is_open());
        assert!(
            timeout(Duration::from_secs(1), waiting)
                .await
                .expect("consumer wakes")
                .expect("join")
                .is_none()
        );
        assert_eq!(
            broker.channel(ConfirmPolicy::Manual).unwrap_err(),
            BrokerError::ShutDown
        );
    }

    #[tokio::test]
    async fn consumer_waits_for_publish() {
        let broker = Broker::new();
        broker
            .declare_queue("orders", QueueOptions::default())
            .expect("declare");
        let mut consumer = broker.consume("orders").expect("consume");
        assert!(consumer.try_recv().is_none());
        let waiting = tokio::spawn(async move { consumer.recv().await });
        let channel = broker.channel(ConfirmPolicy::Manual).expect("channel");
        channel.confirm_select().expect("select");
        channel
            .send(OutboundMessage::new("orders", "hello"))
            .expect("send");
        let delivery = timeout(Duration::from_secs(1), waiting)
            .await
            .expect("delivered")
            .expect("join")
            .expect("some");
        assert_eq!(delivery.queue(), "orders");
        assert_eq!(delivery.into_payload(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn delete_queue_drains_then_ends_consumers() {
        let broker = Broker::new();
        broker
            .declare_queue("orders", QueueOptions::default())
            .expect("declare");
        let channel = broker.channel(ConfirmPolicy::Manual).expect("channel");
        channel.confirm_select().expect("select");
        channel
            .send(OutboundMessage::new("orders", "left"))
            .expect("send");
        let mut consumer = broker.consume("orders").expect("consume");
        assert_eq!(broker.delete_queue("orders"), Ok(1));
        assert!(consumer.recv().await.is_some());
        assert!(consumer.recv().await.is_none());
        assert_eq!(
            broker.queue_len("orders"),
            Err(BrokerError::QueueNotFound("orders".to_string()))
        );
    }

    #[test]
    fn redeclare_checks_options() {
        let broker = Broker::new();
        broker
            .declare_queue("orders", QueueOptions::default())
            .expect("declare");
        broker
            .declare_queue("orders", QueueOptions::default())
            .expect("same options");
        assert_eq!(
            broker.declare_queue(
                "orders",
                QueueOptions {
                    max_length: Some(5)
                }
            ),
            Err(BrokerError::PreconditionFailed {
                queue: "orders".to_string()
            })
        );
    }
}
