//! Per-delivery acknowledgment decision.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// What the broker should do with a delivery once the handler is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    /// Processed (or deliberately skipped); never redeliver.
    Ack,
    /// Give up on the delivery and dead-letter it.
    NackDiscard,
    /// Leave the delivery for redelivery.
    NackRequeue,
}

impl AckOutcome {
    /// Whether the delivery leaves the queue.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AckOutcome::NackRequeue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(AckOutcome::NackDiscard.as_ref(), "nack_discard");
        assert_eq!(AckOutcome::Ack.to_string(), "ack");
        assert!(AckOutcome::NackDiscard.is_terminal());
        assert!(!AckOutcome::NackRequeue.is_terminal());
    }
}
