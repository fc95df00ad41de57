// What a resolved pending confirm reports back to its publisher.
use std::time::Duration;

use crate::channel::{CloseReason, OutboundMessage};
use crate::error::{ConfirmError, Result};
use crate::tag::DeliveryTag;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The broker took responsibility for the message.
    Ack,
    /// The broker refused the message.
    Nack,
    /// The channel or connection went away before the broker answered.
    ConnectionLost(CloseReason),
    /// The publisher was closed locally before the broker answered.
    Cancelled,
}

impl ConfirmOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, ConfirmOutcome::Ack)
    }

    #[cfg_attr(not(feature = "telemetry"), allow(dead_code))]
    pub(crate) fn label(&self) -> &'static str {
        match self {
            ConfirmOutcome::Ack => "ack",
            ConfirmOutcome::Nack => "nack",
            ConfirmOutcome::ConnectionLost(_) => "connection_lost",
            ConfirmOutcome::Cancelled => "cancelled",
        }
    }
}

/// The resolution of one publish.
#[derive(Clone, Debug)]
pub struct Confirmation {
    pub tag: DeliveryTag,
    pub outcome: ConfirmOutcome,
    /// Handed back so a nacked or lost message can be republished.
    pub message: OutboundMessage,
    /// Time from entering the pending table to resolution.
    pub elapsed: Duration,
}

impl Confirmation {
    pub fn is_ack(&self) -> bool {
        self.outcome.is_ack()
    }

    /// Turn every non-ack outcome into the matching error.
    pub fn into_result(self) -> Result<Confirmation> {
        match &self.outcome {
            ConfirmOutcome::Ack => Ok(self),
            ConfirmOutcome::Nack => Err(ConfirmError::Nacked(self.tag)),
            ConfirmOutcome::ConnectionLost(reason) => {
                Err(ConfirmError::ConnectionLost(reason.clone()))
            }
            ConfirmOutcome::Cancelled => Err(ConfirmError::Cancelled(self.tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmation(outcome: ConfirmOutcome) -> Confirmation {
        Confirmation {
            tag: DeliveryTag::new(7),
            outcome,
            message: OutboundMessage::new("orders", "payload"),
            elapsed: Duration::from_millis(1),
        }
    }

    #[test]
    fn ack_passes_through() {
        let confirmed = confirmation(ConfirmOutcome::Ack)
            .into_result()
            .expect("ack");
        assert_eq!(confirmed.tag, DeliveryTag::new(7));
    }

    #[test]
    fn failures_map_to_errors() {
        assert_eq!(
            confirmation(ConfirmOutcome::Nack).into_result().unwrap_err(),
            ConfirmError::Nacked(DeliveryTag::new(7))
        );
        assert_eq!(
            confirmation(ConfirmOutcome::Cancelled)
                .into_result()
                .unwrap_err(),
            ConfirmError::Cancelled(DeliveryTag::new(7))
        );
        let reason = CloseReason::connection_forced("gone");
        assert_eq!(
            confirmation(ConfirmOutcome::ConnectionLost(reason.clone()))
                .into_result()
                .unwrap_err(),
            ConfirmError::ConnectionLost(reason)
        );
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(ConfirmOutcome::Ack.label(), "ack");
        assert_eq!(ConfirmOutcome::Nack.label(), "nack");
        assert_eq!(ConfirmOutcome::Cancelled.label(), "cancelled");
    }
}
