//! Dead-letter wire contract.
//!
//! A message that keeps failing in a consumer is wrapped in a
//! [`FaultEnvelope`] and published to the fault topic, where it no longer
//! blocks healthy traffic. Replay is an operator decision; nothing in the
//! pipeline re-injects faulted messages automatically.

use crate::event::{EventEnvelope, EventError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Suffix appended to the original event type on the fault topic.
pub const FAULT_TYPE_SUFFIX: &str = ".fault";

/// A terminally-failed message plus enough metadata to triage it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultEnvelope {
    /// The original message, unmodified.
    pub envelope: EventEnvelope,
    /// Name of the consumer that gave up on it.
    pub consumer: String,
    /// Last failure message.
    pub reason: String,
    /// How many delivery attempts were made before giving up.
    pub attempts: u32,
    /// When the consumer gave up.
    pub failed_at: DateTime<Utc>,
}

impl FaultEnvelope {
    /// Wrap a failed message with its failure metadata.
    #[must_use]
    pub fn new(
        envelope: EventEnvelope,
        consumer: impl Into<String>,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            envelope,
            consumer: consumer.into(),
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// Wrap this fault as a regular envelope for the fault topic.
    ///
    /// The event type is the original type plus [`FAULT_TYPE_SUFFIX`], the
    /// aggregate id is carried through, and the whole fault (original
    /// message included) rides in the payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] on encoding failure.
    pub fn to_envelope(&self) -> Result<EventEnvelope, EventError> {
        Ok(EventEnvelope {
            message_id: Uuid::new_v4(),
            event_type: format!("{}{FAULT_TYPE_SUFFIX}", self.envelope.event_type),
            aggregate_id: self.envelope.aggregate_id,
            version: self.envelope.version,
            payload: serde_json::to_value(self)
                .map_err(|e| EventError::Serialization(e.to_string()))?,
        })
    }

    /// Decode a fault from an envelope received on the fault topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] if the payload is not a
    /// fault.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, EventError> {
        serde_json::from_value(envelope.payload.clone())
            .map_err(|e| EventError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn fault_envelope_roundtrip() {
        let fault = FaultEnvelope::new(
            EventEnvelope {
                message_id: Uuid::new_v4(),
                event_type: "AuctionCreated".to_string(),
                aggregate_id: Uuid::new_v4(),
                version: 1,
                payload: serde_json::json!({}),
            },
            "search-projection",
            "payload did not match schema",
            5,
        );

        let json = serde_json::to_string(&fault).unwrap();
        let decoded: FaultEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(fault, decoded);
        assert_eq!(decoded.attempts, 5);
    }

    #[test]
    fn fault_rides_the_bus_as_a_regular_envelope() {
        let fault = FaultEnvelope::new(
            EventEnvelope {
                message_id: Uuid::new_v4(),
                event_type: "AuctionUpdated".to_string(),
                aggregate_id: Uuid::new_v4(),
                version: 9,
                payload: serde_json::json!({}),
            },
            "search-projection",
            "storage timeout",
            5,
        );

        let wire = fault.to_envelope().unwrap();
        assert_eq!(wire.event_type, "AuctionUpdated.fault");
        assert_eq!(wire.aggregate_id, fault.envelope.aggregate_id);

        let decoded = FaultEnvelope::from_envelope(&wire).unwrap();
        assert_eq!(decoded, fault);
    }
}
