// Confirm listener: bridges broker confirm/close callbacks to the pending table.
//
// State machine per channel session:
//
//   Open --(broker close | local close | send failure)--> Closing --(drain done)--> Closed
//
// Confirms are only applied while Open. The transition out of Open happens exactly
// once; whichever path wins performs the drain, later closes are no-ops.
use parking_lot::Mutex;
use std::sync::Arc;

use crate::channel::{CloseReason, ConfirmEvent};
use crate::error::ConfirmError;
use crate::outcome::ConfirmOutcome;
use crate::table::PendingConfirmTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    Open,
    Closing,
    Closed,
}

pub struct ConfirmListener {
    table: Arc<PendingConfirmTable>,
    state: Mutex<ListenerState>,
}

impl ConfirmListener {
    pub fn new(table: Arc<PendingConfirmTable>) -> Self {
        Self {
            table,
            state: Mutex::new(ListenerState::Open),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ListenerState::Open
    }

    /// Apply one broker confirm. Returns how many pending entries it resolved.
    pub fn handle_confirm(&self, event: ConfirmEvent) -> usize {
        if !self.is_open() {
            tracing::debug!(tag = %event.tag, "confirm after channel close ignored");
            return 0;
        }
        let outcome = if event.ack {
            ConfirmOutcome::Ack
        } else {
            ConfirmOutcome::Nack
        };
        if !event.ack {
            tracing::warn!(tag = %event.tag, multiple = event.multiple, "broker nacked publish");
        }
        if event.multiple {
            let resolved = self.table.resolve_up_to(event.tag, outcome);
            if resolved == 0 {
                tracing::debug!(tag = %event.tag, "multiple confirm matched no pending tags");
            }
            return resolved;
        }
        match self.table.resolve(event.tag, outcome) {
            Ok(()) => 1,
            Err(ConfirmError::UnknownTag(tag)) => {
                // Duplicate or late notification; the entry was already resolved.
                tracing::debug!(tag = %tag, "confirm for unknown delivery tag ignored");
                0
            }
            Err(err) => {
                tracing::error!(error = %err, "confirm resolution failed");
                0
            }
        }
    }

    /// Broker-side close: everything pending is lost with the connection.
    pub fn handle_close(&self, reason: CloseReason) -> usize {
        tracing::info!(reason = %reason, "broker channel closed");
        self.shutdown(ConfirmOutcome::ConnectionLost(reason))
    }

    /// Application-side close: everything pending is cancelled.
    pub fn close_local(&self) -> usize {
        self.shutdown(ConfirmOutcome::Cancelled)
    }

    fn shutdown(&self, outcome: ConfirmOutcome) -> usize {
        if !self.begin_close() {
            return 0;
        }
        self.finish_close(outcome)
    }

    /// Leave Open. Returns `false` when another close already did; only the
    /// caller that gets `true` may call `finish_close`.
    pub fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ListenerState::Open {
            return false;
        }
        *state = ListenerState::Closing;
        true
    }

    /// Drain every pending entry with `outcome`. Completions may re-enter close.
    pub fn finish_close(&self, outcome: ConfirmOutcome) -> usize {
        let drained = self.table.drain_all(outcome);
        *self.state.lock() = ListenerState::Closed;
        if drained > 0 {
            tracing::info!(drained, "pending confirms drained on close");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OutboundMessage;
    use crate::outcome::Confirmation;
    use crate::table::{Completion, PendingConfirm};
    use crate::tag::DeliveryTag;
    use tokio::sync::oneshot;

    fn listener_with(tags: u64) -> (ConfirmListener, Vec<oneshot::Receiver<Confirmation>>) {
        let table = Arc::new(PendingConfirmTable::new());
        let receivers = (1..=tags)
            .map(|tag| {
                let (completion, rx) = Completion::waiter();
                table
                    .insert(PendingConfirm::new(
                        DeliveryTag::new(tag),
                        OutboundMessage::new("queue", "x"),
                        completion,
                    ))
                    .expect("insert");
                rx
            })
            .collect();
        (ConfirmListener::new(table), receivers)
    }

    #[test]
    fn single_ack_and_nack() {
        let (listener, mut receivers) = listener_with(2);
        assert_eq!(listener.handle_confirm(ConfirmEvent::ack(1)), 1);
        assert_eq!(listener.handle_confirm(ConfirmEvent::nack(2)), 1);
        assert_eq!(
            receivers[0].try_recv().expect("ack").outcome,
            ConfirmOutcome::Ack
        );
        assert_eq!(
            receivers[1].try_recv().expect("nack").outcome,
            ConfirmOutcome::Nack
        );
    }

    #[test]
    fn duplicate_confirm_is_ignored() {
        let (listener, _receivers) = listener_with(1);
        assert_eq!(listener.handle_confirm(ConfirmEvent::ack(1)), 1);
        assert_eq!(listener.handle_confirm(ConfirmEvent::ack(1)), 0);
        assert_eq!(listener.handle_confirm(ConfirmEvent::ack(99)), 0);
        assert!(listener.is_open());
    }

    #[test]
    fn multi_ack_then_close() {
        let (listener, mut receivers) = listener_with(5);
        assert_eq!(listener.handle_confirm(ConfirmEvent::ack_multiple(3)), 3);
        assert_eq!(listener.handle_confirm(ConfirmEvent::ack(5)), 1);
        assert!(receivers[3].try_recv().is_err());

        let reason = CloseReason::connection_forced("test");
        assert_eq!(listener.handle_close(reason.clone()), 1);
        assert_eq!(listener.state(), ListenerState::Closed);
        assert_eq!(
            receivers[3].try_recv().expect("drained").outcome,
            ConfirmOutcome::ConnectionLost(reason)
        );
    }

    #[test]
    fn multi_nack_resolves_lower_tags_only() {
        let (listener, mut receivers) = listener_with(5);
        assert_eq!(listener.handle_confirm(ConfirmEvent::nack_multiple(3)), 3);
        for rx in receivers[..3].iter_mut() {
            assert_eq!(rx.try_recv().expect("nacked").outcome, ConfirmOutcome::Nack);
        }
        assert!(receivers[3].try_recv().is_err());
        assert!(receivers[4].try_recv().is_err());
        assert_eq!(listener.table.len(), 2);
        assert!(listener.table.take_failure_flag());
    }

    #[test]
    fn closing_state_blocks_confirms_until_drained() {
        let (listener, mut receivers) = listener_with(2);
        assert!(listener.begin_close());
        assert!(!listener.begin_close());
        assert_eq!(listener.state(), ListenerState::Closing);
        assert_eq!(listener.handle_confirm(ConfirmEvent::ack(1)), 0);
        assert_eq!(listener.finish_close(ConfirmOutcome::Cancelled), 2);
        assert_eq!(listener.state(), ListenerState::Closed);
        assert_eq!(
            receivers[0].try_recv().expect("cancelled").outcome,
            ConfirmOutcome::Cancelled
        );
    }

    #[test]
    fn close_is_idempotent_and_stops_confirms() {
        let (listener, mut receivers) = listener_with(2);
        assert_eq!(listener.close_local(), 2);
        assert_eq!(listener.close_local(), 0);
        assert_eq!(listener.handle_close(CloseReason::normal()), 0);
        assert_eq!(listener.handle_confirm(ConfirmEvent::ack(1)), 0);
        for rx in receivers.iter_mut() {
            assert_eq!(
                rx.try_recv().expect("cancelled").outcome,
                ConfirmOutcome::Cancelled
            );
        }
    }
}
