// Error taxonomy for confirm tracking.
use std::time::Duration;

use crate::channel::{ChannelError, CloseReason};
use crate::tag::DeliveryTag;

pub type Result<T> = std::result::Result<T, ConfirmError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfirmError {
    /// The allocator handed out a tag that is still pending. Always a bug.
    #[error("delivery tag {0} is already pending")]
    DuplicateTag(DeliveryTag),
    /// A confirm arrived for a tag that is not pending (already resolved or never issued).
    #[error("delivery tag {0} is not pending")]
    UnknownTag(DeliveryTag),
    /// The broker did not answer in time. The outcome is unknown, not failed.
    #[error("no confirm for delivery tag {tag} within {timeout:?}")]
    ConfirmTimeout { tag: DeliveryTag, timeout: Duration },
    #[error("publish window full ({window} outstanding confirms)")]
    Backpressure { window: usize },
    #[error("broker nacked delivery tag {0}")]
    Nacked(DeliveryTag),
    #[error("connection lost: {0}")]
    ConnectionLost(CloseReason),
    #[error("delivery tag {0} cancelled by publisher close")]
    Cancelled(DeliveryTag),
    /// `wait_for_confirms_or_die` saw at least one publish resolve without an ack.
    #[error("not every outstanding publish was acked")]
    NotAcked,
    /// The broker numbered a message differently from the allocator; confirms can no
    /// longer be correlated on this session.
    #[error("broker assigned delivery tag {assigned}, expected {expected}")]
    TagMismatch {
        expected: DeliveryTag,
        assigned: DeliveryTag,
    },
    #[error("publisher closed")]
    Closed,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("invalid confirm config: {0}")]
    InvalidConfig(String),
}

impl ConfirmError {
    /// Whether retrying the same publish later can succeed on this session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConfirmError::Backpressure { .. }
                | ConfirmError::ConfirmTimeout { .. }
                | ConfirmError::Nacked(_)
        )
    }
}
