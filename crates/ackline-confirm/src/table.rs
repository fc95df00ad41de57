// Pending confirm table: every in-flight publish, keyed by delivery tag.
//
// Locking rules:
// - One mutex guards the map. Publishers insert under it; the listener removes under it.
// - Entries are moved out of the map while locked and completed after the guard is
//   dropped. Completion may run user callbacks, and those callbacks are allowed to
//   publish again (which takes this lock).
// - Once `drain_all` runs the table is closed and refuses new entries, so an insert
//   racing a drain either gets drained or fails; it never waits forever.
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, oneshot, watch};

use crate::channel::OutboundMessage;
use crate::error::{ConfirmError, Result};
use crate::outcome::{Confirmation, ConfirmOutcome};
use crate::tag::DeliveryTag;

/// How the publisher wants to hear about a resolution.
pub enum Completion {
    /// A task awaiting a handle or a synchronous publish.
    Waiter(oneshot::Sender<Confirmation>),
    /// Runs on the thread that resolved the entry. Must not block.
    Callback(Box<dyn FnOnce(Confirmation) + Send>),
}

impl Completion {
    pub fn waiter() -> (Self, oneshot::Receiver<Confirmation>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Waiter(tx), rx)
    }

    pub fn callback(callback: impl FnOnce(Confirmation) + Send + 'static) -> Self {
        Completion::Callback(Box::new(callback))
    }
}

pub struct PendingConfirm {
    tag: DeliveryTag,
    message: OutboundMessage,
    enqueued_at: Instant,
    completion: Completion,
    // Held until resolution so the publish window counts this entry.
    permit: Option<OwnedSemaphorePermit>,
}

impl PendingConfirm {
    pub fn new(tag: DeliveryTag, message: OutboundMessage, completion: Completion) -> Self {
        Self {
            tag,
            message,
            enqueued_at: Instant::now(),
            completion,
            permit: None,
        }
    }

    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    fn complete(self, outcome: ConfirmOutcome) {
        let PendingConfirm {
            tag,
            message,
            enqueued_at,
            completion,
            permit,
        } = self;
        // Free the window slot first so a waiter that republishes finds room.
        drop(permit);
        let elapsed = enqueued_at.elapsed();
        t_histogram!("ackline_confirm_latency_us").record(elapsed.as_secs_f64() * 1_000_000.0);
        t_counter!("ackline_confirms_total", "outcome" => outcome.label()).increment(1);
        let confirmation = Confirmation {
            tag,
            outcome,
            message,
            elapsed,
        };
        match completion {
            Completion::Waiter(tx) => {
                // The receiver is gone when a synchronous publish already timed out.
                let _ = tx.send(confirmation);
            }
            Completion::Callback(callback) => callback(confirmation),
        }
    }
}

#[derive(Default)]
struct TableState {
    entries: BTreeMap<DeliveryTag, PendingConfirm>,
    closed: bool,
    // Set whenever an entry resolves with anything but an ack; cleared by take_failure_flag.
    failed_since_check: bool,
    // Entries taken out of the map whose completion has not finished yet.
    completing: usize,
}

pub struct PendingConfirmTable {
    state: Mutex<TableState>,
    // Outstanding count, republished after every change for wait-for-confirms.
    progress: watch::Sender<usize>,
}

impl PendingConfirmTable {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            state: Mutex::new(TableState::default()),
            progress,
        }
    }

    pub fn insert(&self, entry: PendingConfirm) -> Result<()> {
        let tag = entry.tag;
        let len = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ConfirmError::Closed);
            }
            match state.entries.entry(tag) {
                Entry::Occupied(_) => {
                    tracing::error!(tag = %tag, "delivery tag allocated twice");
                    return Err(ConfirmError::DuplicateTag(tag));
                }
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                }
            }
            state.entries.len()
        };
        self.publish_progress(len);
        Ok(())
    }

    /// Resolve a single tag. `UnknownTag` means the tag was already resolved or never issued.
    pub fn resolve(&self, tag: DeliveryTag, outcome: ConfirmOutcome) -> Result<()> {
        let entry = {
            let mut state = self.state.lock();
            let entry = state
                .entries
                .remove(&tag)
                .ok_or(ConfirmError::UnknownTag(tag))?;
            if !outcome.is_ack() {
                state.failed_since_check = true;
            }
            state.completing += 1;
            entry
        };
        entry.complete(outcome);
        self.finish_completions(1);
        Ok(())
    }

    /// Resolve every pending tag `<= tag` in one pass and return how many were resolved.
    pub fn resolve_up_to(&self, tag: DeliveryTag, outcome: ConfirmOutcome) -> usize {
        let resolved = {
            let mut state = self.state.lock();
            let resolved = if tag.value() == u64::MAX {
                std::mem::take(&mut state.entries)
            } else {
                let remaining = state.entries.split_off(&tag.successor());
                std::mem::replace(&mut state.entries, remaining)
            };
            if !resolved.is_empty() && !outcome.is_ack() {
                state.failed_since_check = true;
            }
            state.completing += resolved.len();
            resolved
        };
        let count = resolved.len();
        if count > 0 {
            Self::complete_all(resolved, &outcome);
            self.finish_completions(count);
        }
        count
    }

    /// Resolve everything still pending and refuse further inserts.
    pub fn drain_all(&self, outcome: ConfirmOutcome) -> usize {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            let drained = std::mem::take(&mut state.entries);
            if !drained.is_empty() && !outcome.is_ack() {
                state.failed_since_check = true;
            }
            state.completing += drained.len();
            drained
        };
        let count = drained.len();
        Self::complete_all(drained, &outcome);
        self.finish_completions(count);
        count
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn contains(&self, tag: DeliveryTag) -> bool {
        self.state.lock().entries.contains_key(&tag)
    }

    pub fn lowest_pending(&self) -> Option<DeliveryTag> {
        self.state.lock().entries.keys().next().copied()
    }

    /// Whether every tag `<= tag` has left the table and finished completing.
    pub fn settled_through(&self, tag: DeliveryTag) -> bool {
        let state = self.state.lock();
        state.completing == 0
            && state
                .entries
                .keys()
                .next()
                .is_none_or(|lowest| *lowest > tag)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Watch the outstanding count. Every insert and resolution publishes a new value.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.progress.subscribe()
    }

    /// Whether any entry resolved with a non-ack outcome since the previous call.
    pub fn take_failure_flag(&self) -> bool {
        std::mem::take(&mut self.state.lock().failed_since_check)
    }

    fn complete_all(entries: BTreeMap<DeliveryTag, PendingConfirm>, outcome: &ConfirmOutcome) {
        for entry in entries.into_values() {
            entry.complete(outcome.clone());
        }
    }

    fn finish_completions(&self, count: usize) {
        let len = {
            let mut state = self.state.lock();
            state.completing -= count;
            state.entries.len()
        };
        self.publish_progress(len);
    }

    fn publish_progress(&self, len: usize) {
        t_gauge!("ackline_outstanding").set(len as f64);
        self.progress.send_replace(len);
    }
}

impl Default for PendingConfirmTable {
    fn default() -> Self {
        Self::new()
    }
}
