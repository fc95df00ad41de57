// Publisher facade: tag allocation, backpressure window, and confirm waiting.
//
// Publish path (every mode):
// 1) Admit: take a window permit (wait or reject, per BackpressurePolicy).
// 2) Under the send gate: allocate the next tag, insert the pending entry, send.
//    The gate keeps allocator order and broker order identical under concurrent
//    publishers; the entry is inserted before `send` so a fast confirm always finds it.
// 3) Hand the caller a handle (async), await it (sync), or return (callback).
//
// A send failure or a tag mismatch ends the session: the listener drains every
// pending entry and the window closes so blocked publishers return promptly.
//
// The gate only covers leaving Open. Drains run after it is released, so a
// completion may call back into `close` or `publish`.
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, oneshot};

use crate::channel::{CloseReason, ConfirmChannel, ConfirmEvent, OutboundMessage};
use crate::config::{BackpressurePolicy, ConfirmConfig, PublishMode};
use crate::error::{ConfirmError, Result};
use crate::listener::{ConfirmListener, ListenerState};
use crate::outcome::{ConfirmOutcome, Confirmation};
use crate::table::{Completion, PendingConfirm, PendingConfirmTable};
use crate::tag::{DeliveryTag, SequenceAllocator};

/// Completion of one asynchronous publish.
#[derive(Debug)]
pub struct ConfirmHandle {
    tag: DeliveryTag,
    rx: oneshot::Receiver<Confirmation>,
}

impl ConfirmHandle {
    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    /// Wait for the broker's answer (or the session drain).
    pub async fn wait(self) -> Result<Confirmation> {
        self.rx.await.map_err(|_| ConfirmError::Closed)
    }

    /// Wait at most `timeout`. A timeout leaves the entry pending: the outcome is unknown.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Confirmation> {
        let tag = self.tag;
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(confirmation)) => Ok(confirmation),
            Ok(Err(_)) => Err(ConfirmError::Closed),
            Err(_) => {
                tracing::warn!(tag = %tag, ?timeout, "confirm wait timed out");
                Err(ConfirmError::ConfirmTimeout { tag, timeout })
            }
        }
    }

    /// Non-blocking check; `None` while the tag is still pending.
    pub fn try_confirmation(&mut self) -> Option<Confirmation> {
        self.rx.try_recv().ok()
    }
}

/// Result of `Publisher::submit`, shaped by the session's `PublishMode`.
#[derive(Debug)]
pub enum Submitted {
    Confirmed(Confirmation),
    InFlight(ConfirmHandle),
}

#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    channel: Arc<dyn ConfirmChannel>,
    allocator: SequenceAllocator,
    table: Arc<PendingConfirmTable>,
    listener: Arc<ConfirmListener>,
    window: Arc<Semaphore>,
    send_gate: Mutex<()>,
    config: ConfirmConfig,
}

impl Publisher {
    /// Put `channel` in confirm mode and start a confirm session on it.
    pub fn new(channel: Arc<dyn ConfirmChannel>, config: ConfirmConfig) -> Result<Self> {
        config.validate()?;
        channel.confirm_select()?;
        let table = Arc::new(PendingConfirmTable::new());
        let listener = Arc::new(ConfirmListener::new(Arc::clone(&table)));
        let window = Arc::new(Semaphore::new(config.max_outstanding));
        let allocator = SequenceAllocator::starting_at(channel.next_publish_seq_no());

        let confirm_listener = Arc::clone(&listener);
        channel.on_confirm(Arc::new(move |event: ConfirmEvent| {
            confirm_listener.handle_confirm(event);
        }));
        let close_listener = Arc::clone(&listener);
        let close_window = Arc::clone(&window);
        channel.on_close(Arc::new(move |reason: CloseReason| {
            close_listener.handle_close(reason);
            close_window.close();
        }));

        tracing::debug!(
            first_tag = %allocator.peek(),
            max_outstanding = config.max_outstanding,
            "confirm session started"
        );
        Ok(Self {
            inner: Arc::new(PublisherInner {
                channel,
                allocator,
                table,
                listener,
                window,
                send_gate: Mutex::new(()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &ConfirmConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ListenerState {
        self.inner.listener.state()
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.listener.is_open()
    }

    /// Publishes sent but not yet confirmed.
    pub fn outstanding(&self) -> usize {
        self.inner.table.len()
    }

    /// Asynchronous publish: returns once the message is sent.
    pub async fn publish(&self, message: OutboundMessage) -> Result<ConfirmHandle> {
        let permit = self.admit().await?;
        let (completion, rx) = Completion::waiter();
        let tag = self.dispatch(message, completion, permit)?;
        Ok(ConfirmHandle { tag, rx })
    }

    /// Asynchronous publish whose resolution runs `callback` on the confirm thread.
    pub async fn publish_with_callback<F>(
        &self,
        message: OutboundMessage,
        callback: F,
    ) -> Result<DeliveryTag>
    where
        F: FnOnce(Confirmation) + Send + 'static,
    {
        let permit = self.admit().await?;
        self.dispatch(message, Completion::callback(callback), permit)
    }

    /// Synchronous publish bounded by the session's `confirm_timeout`.
    pub async fn publish_confirmed(&self, message: OutboundMessage) -> Result<Confirmation> {
        self.publish_confirmed_within(message, self.inner.config.confirm_timeout)
            .await
    }

    /// Synchronous publish: waits for the confirm of this message.
    ///
    /// A nack is returned as a `Confirmation`; use `Confirmation::into_result`
    /// to treat it as an error. `ConfirmTimeout` leaves the entry pending.
    pub async fn publish_confirmed_within(
        &self,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<Confirmation> {
        let handle = self.publish(message).await?;
        handle.wait_timeout(timeout).await
    }

    /// Publish using the session's configured mode.
    pub async fn submit(&self, message: OutboundMessage) -> Result<Submitted> {
        match self.inner.config.mode {
            PublishMode::Synchronous => self
                .publish_confirmed(message)
                .await
                .map(Submitted::Confirmed),
            PublishMode::Asynchronous => self.publish(message).await.map(Submitted::InFlight),
        }
    }

    /// Wait until every publish issued so far has resolved.
    ///
    /// Returns `true` when all of them, and everything resolved since the previous
    /// call, were acked.
    pub async fn wait_for_confirms(&self, timeout: Duration) -> Result<bool> {
        let table = &self.inner.table;
        // Under the gate every issued tag is already in the table or resolved.
        let last_issued = {
            let _gate = self.inner.send_gate.lock();
            self.inner.allocator.last_issued()
        };
        let Some(target) = last_issued else {
            return Ok(!table.take_failure_flag());
        };
        let mut progress = table.subscribe();
        let settled = async {
            // Resolutions publish progress only after their completions ran, so a
            // settled table means every covered waiter and callback has been signalled.
            while !table.settled_through(target) {
                if progress.changed().await.is_err() {
                    return;
                }
            }
        };
        match tokio::time::timeout(timeout, settled).await {
            Ok(()) => Ok(!table.take_failure_flag()),
            Err(_) => {
                let tag = table.lowest_pending().unwrap_or(target);
                tracing::warn!(tag = %tag, ?timeout, "wait for confirms timed out");
                Err(ConfirmError::ConfirmTimeout { tag, timeout })
            }
        }
    }

    /// `wait_for_confirms`, closing the session on a nack or timeout.
    pub async fn wait_for_confirms_or_die(&self, timeout: Duration) -> Result<()> {
        match self.wait_for_confirms(timeout).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.close();
                Err(ConfirmError::NotAcked)
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    /// Close the session: pending entries resolve `Cancelled`, blocked publishers
    /// return `Closed`. Returns how many entries were cancelled.
    pub fn close(&self) -> usize {
        let first = {
            let _gate = self.inner.send_gate.lock();
            self.inner.listener.begin_close()
        };
        self.inner.window.close();
        if !first {
            return 0;
        }
        self.inner.listener.finish_close(ConfirmOutcome::Cancelled)
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        if self.is_closed() {
            return Err(ConfirmError::Closed);
        }
        let window = Arc::clone(&self.inner.window);
        match self.inner.config.backpressure {
            BackpressurePolicy::Block => {
                window.acquire_owned().await.map_err(|_| ConfirmError::Closed)
            }
            BackpressurePolicy::Reject => window.try_acquire_owned().map_err(|err| match err {
                TryAcquireError::Closed => ConfirmError::Closed,
                TryAcquireError::NoPermits => {
                    t_counter!("ackline_backpressure_rejections_total").increment(1);
                    ConfirmError::Backpressure {
                        window: self.inner.config.max_outstanding,
                    }
                }
            }),
        }
    }

    fn dispatch(
        &self,
        message: OutboundMessage,
        completion: Completion,
        permit: OwnedSemaphorePermit,
    ) -> Result<DeliveryTag> {
        let inner = &self.inner;
        let gate = inner.send_gate.lock();
        if !inner.listener.is_open() {
            return Err(ConfirmError::Closed);
        }
        let tag = inner.allocator.next();
        inner
            .table
            .insert(PendingConfirm::new(tag, message.clone(), completion).with_permit(permit))?;
        let (reason, err) = match inner.channel.send(message) {
            Ok(assigned) if assigned == tag => return Ok(tag),
            Ok(assigned) => {
                tracing::error!(expected = %tag, assigned = %assigned, "broker delivery tag mismatch");
                (
                    CloseReason::internal("delivery tag mismatch"),
                    ConfirmError::TagMismatch {
                        expected: tag,
                        assigned,
                    },
                )
            }
            Err(err) => {
                tracing::warn!(tag = %tag, error = %err, "send failed, ending confirm session");
                (
                    CloseReason::internal(format!("send failed: {err}")),
                    err.into(),
                )
            }
        };
        let first = inner.listener.begin_close();
        inner.window.close();
        drop(gate);
        if first {
            inner
                .listener
                .finish_close(ConfirmOutcome::ConnectionLost(reason));
        }
        Err(err)
    }
}
