//! Request/response messenger between a worker and its execution
//! controller.
//!
//! The wire format is transport-agnostic from the caller's point of view:
//! length-prefixed JSON frames over a persistent TCP session, one session
//! per worker process, addressed by worker id. Every request/response
//! action is bounded by the configured action timeout plus a latency
//! buffer that absorbs scheduling and network jitter; the buffer only ever
//! widens the effective deadline.

mod controller;
mod worker;

pub use controller::ControllerMessenger;
pub use worker::WorkerMessenger;

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::slice::{Slice, SliceAnalytics};

/// Session-level timing parameters, shared by both ends.
#[derive(Debug, Clone, Copy)]
pub struct MessengerConfig {
    pub action_timeout: Duration,
    pub network_latency_buffer: Duration,
}

impl MessengerConfig {
    /// Effective deadline for one request/response action.
    pub fn deadline(&self) -> Duration {
        self.action_timeout + self.network_latency_buffer
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(60),
            network_latency_buffer: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Message {
    Handshake {
        worker_id: String,
    },
    HandshakeAck,
    NewSlice {
        slice: Slice,
    },
    SliceComplete {
        worker_id: String,
        slice: Slice,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        analytics: Option<SliceAnalytics>,
    },
    SliceCompleteAck {
        slice_id: Uuid,
    },
}

/// A slice-completion report as seen by the controller. Absence of
/// `error` signals success.
#[derive(Debug, Clone)]
pub struct SliceCompletion {
    pub worker_id: String,
    pub slice: Slice,
    pub error: Option<String>,
    pub analytics: Option<SliceAnalytics>,
}

pub(crate) fn encode(message: &Message) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub(crate) fn decode(frame: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deadline_is_widened_by_the_latency_buffer() {
        let config = MessengerConfig {
            action_timeout: Duration::from_millis(1000),
            network_latency_buffer: Duration::from_millis(250),
        };
        assert_eq!(config.deadline(), Duration::from_millis(1250));
    }

    #[test]
    fn successful_completion_omits_the_error_field() {
        let message = Message::SliceComplete {
            worker_id: "host__1".to_string(),
            slice: Slice::new(json!({})),
            error: None,
            analytics: None,
        };
        let encoded = encode(&message).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["worker_id"], "host__1");
    }

    #[test]
    fn messages_round_trip_through_the_codec() {
        let message = Message::SliceComplete {
            worker_id: "host__1".to_string(),
            slice: Slice::new(json!({"from": 0})),
            error: Some("Error: Slice failed processing, caused by boom".to_string()),
            analytics: None,
        };
        let decoded = decode(&encode(&message).unwrap()).unwrap();
        match decoded {
            Message::SliceComplete { worker_id, error, .. } => {
                assert_eq!(worker_id, "host__1");
                assert!(error.unwrap().starts_with("Error: Slice failed processing"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
