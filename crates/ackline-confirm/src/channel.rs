// Narrow interface to the broker client channel a publisher confirms against.
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::tag::DeliveryTag;

/// A message handed to the broker. The routing key addresses a queue through
/// the broker's default exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
        }
    }
}

/// One broker confirm notification.
///
/// With `multiple` set, the confirm covers every outstanding tag up to and
/// including `tag`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfirmEvent {
    pub tag: DeliveryTag,
    pub multiple: bool,
    pub ack: bool,
}

impl ConfirmEvent {
    pub fn ack(tag: impl Into<DeliveryTag>) -> Self {
        Self {
            tag: tag.into(),
            multiple: false,
            ack: true,
        }
    }

    pub fn ack_multiple(tag: impl Into<DeliveryTag>) -> Self {
        Self {
            tag: tag.into(),
            multiple: true,
            ack: true,
        }
    }

    pub fn nack(tag: impl Into<DeliveryTag>) -> Self {
        Self {
            tag: tag.into(),
            multiple: false,
            ack: false,
        }
    }

    pub fn nack_multiple(tag: impl Into<DeliveryTag>) -> Self {
        Self {
            tag: tag.into(),
            multiple: true,
            ack: false,
        }
    }
}

/// Why a channel stopped. Codes follow the AMQP reply-code table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub text: String,
}

impl CloseReason {
    pub const NORMAL: u16 = 200;
    pub const CONNECTION_FORCED: u16 = 320;
    pub const INTERNAL_ERROR: u16 = 541;

    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "normal shutdown")
    }

    pub fn connection_forced(text: impl Into<String>) -> Self {
        Self::new(Self::CONNECTION_FORCED, text)
    }

    pub fn internal(text: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, text)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed: {0}")]
    Closed(CloseReason),
    #[error("channel is not in confirm mode")]
    ConfirmsNotEnabled,
    #[error("send failed: {0}")]
    Send(String),
}

pub type ConfirmCallback = Arc<dyn Fn(ConfirmEvent) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(CloseReason) + Send + Sync>;

/// Broker channel operations the confirm engine depends on.
///
/// Implementations must number published messages 1, 2, 3, ... from the moment
/// the channel enters confirm mode, and deliver confirms for a channel in
/// non-decreasing tag order. Callbacks may run on any thread, but never from
/// inside `send` itself: the publisher holds its send gate across that call.
pub trait ConfirmChannel: Send + Sync {
    /// Put the channel into confirm mode. Idempotent.
    fn confirm_select(&self) -> Result<(), ChannelError>;

    /// The delivery tag the broker will assign to the next published message.
    fn next_publish_seq_no(&self) -> DeliveryTag;

    /// Dispatch a message and return the tag the broker assigned to it.
    fn send(&self, message: OutboundMessage) -> Result<DeliveryTag, ChannelError>;

    fn on_confirm(&self, callback: ConfirmCallback);

    fn on_close(&self, callback: CloseCallback);
}
