// Publisher-confirm tracking for broker channels.
//
// A `Publisher` owns one confirm session on one broker channel:
//
// - `SequenceAllocator` numbers outbound messages exactly the way the broker
//   numbers them (1, 2, 3, ... per channel session).
// - `PendingConfirmTable` holds every message the broker has not confirmed yet,
//   keyed by delivery tag.
// - `ConfirmListener` is registered on the channel and turns broker ack/nack
//   and close notifications into table resolutions.
//
// The broker client itself is a collaborator behind `ConfirmChannel`. This
// crate never frames, transmits, or retries anything.
//
// Resolution never blocks: the listener runs on whatever thread the broker
// client uses for callbacks, so it only moves entries out of the table under a
// short lock and signals their waiters after the lock is released.
#[macro_use]
mod macros;

pub mod channel;
pub mod config;
pub mod error;
pub mod listener;
pub mod outcome;
pub mod publisher;
pub mod table;
pub mod tag;

pub use channel::{
    ChannelError, CloseCallback, CloseReason, ConfirmCallback, ConfirmChannel, ConfirmEvent,
    OutboundMessage,
};
pub use config::{BackpressurePolicy, ConfirmConfig, PublishMode};
pub use error::{ConfirmError, Result};
pub use listener::{ConfirmListener, ListenerState};
pub use outcome::{Confirmation, ConfirmOutcome};
pub use publisher::{ConfirmHandle, Publisher, Submitted};
pub use table::{Completion, PendingConfirm, PendingConfirmTable};
pub use tag::{DeliveryTag, SequenceAllocator};
