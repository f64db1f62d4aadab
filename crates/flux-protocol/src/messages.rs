//! Wire messages
//!
//! Every message on the worker channel is one JSON envelope:
//! `{type, id, execution_id?, payload}`. A `CHECKPOINT_ACK` carries the
//! highest accepted sequence so the worker can reclaim buffer space.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use flux_core::{Event, FluxError, WorkerCapabilities};

/// Message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Register,
    RegisterAck,
    Heartbeat,
    Execute,
    Cancel,
    PauseAck,
    Checkpoint,
    CheckpointAck,
    Drain,
    Deregister,
}

/// The JSON envelope carried by the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(message_type: MessageType, execution_id: Option<Uuid>, payload: Value) -> Self {
        Self {
            message_type,
            id: Uuid::now_v7(),
            execution_id,
            payload,
        }
    }

    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, FluxError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            FluxError::validation(format!(
                "invalid {:?} payload: {e}",
                self.message_type
            ))
        })
    }
}

/// Worker → server registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Human-readable session name, e.g. a hostname.
    pub session_name: String,
    pub capabilities: WorkerCapabilities,
}

/// Server → worker registration acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub worker_id: String,
    /// Rotated per connection; authenticates every subsequent call.
    pub session_token: String,
    pub heartbeat_interval_ms: u64,
}

/// Worker → server liveness signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Executions currently running on the worker.
    pub in_flight: u32,
}

/// Server → worker execution assignment. Prior events are included to
/// support mid-execution replay after reassignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutePayload {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub workflow_version: u32,
    /// Registered workflow source; opaque to the transport.
    #[serde(default)]
    pub source: Vec<u8>,
    pub input: Value,
    #[serde(default)]
    pub prior_events: Vec<Event>,
}

/// Worker → server checkpoint: newly produced events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub events: Vec<Event>,
}

/// Server → worker checkpoint acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointAck {
    /// Highest sequence the server has made durable, plus one.
    pub accepted_sequence: u64,
}

/// Commands delivered on the server-pushed execution stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    Execute(ExecutePayload),
    /// Cooperative cancellation; the worker must acknowledge with a
    /// `WorkflowCancelled` event within the grace period.
    Cancel { execution_id: Uuid },
    PauseAck { execution_id: Uuid },
    /// Stop accepting new executions, finish in-flight work.
    Drain,
}

impl WorkerCommand {
    pub fn to_envelope(&self) -> Result<Envelope, FluxError> {
        Ok(match self {
            Self::Execute(payload) => Envelope::new(
                MessageType::Execute,
                Some(payload.execution_id),
                serde_json::to_value(payload)?,
            ),
            Self::Cancel { execution_id } => {
                Envelope::new(MessageType::Cancel, Some(*execution_id), Value::Null)
            }
            Self::PauseAck { execution_id } => {
                Envelope::new(MessageType::PauseAck, Some(*execution_id), Value::Null)
            }
            Self::Drain => Envelope::new(MessageType::Drain, None, Value::Null),
        })
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, FluxError> {
        let execution_id = || {
            envelope.execution_id.ok_or_else(|| {
                FluxError::validation(format!(
                    "{:?} requires an execution_id",
                    envelope.message_type
                ))
            })
        };
        match envelope.message_type {
            MessageType::Execute => Ok(Self::Execute(envelope.decode_payload()?)),
            MessageType::Cancel => Ok(Self::Cancel {
                execution_id: execution_id()?,
            }),
            MessageType::PauseAck => Ok(Self::PauseAck {
                execution_id: execution_id()?,
            }),
            MessageType::Drain => Ok(Self::Drain),
            other => Err(FluxError::validation(format!(
                "{other:?} is not a worker command"
            ))),
        }
    }
}
