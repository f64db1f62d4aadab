//! # Flux Protocol
//!
//! The server↔worker interaction contract. The transport is a
//! bidirectional push channel with asymmetric roles: the server
//! authoritatively assigns work and accepts checkpoints; the worker
//! executes and streams state back.

mod gateway;
mod messages;

pub use gateway::WorkerGateway;
pub use messages::{
    CheckpointAck, CheckpointPayload, Envelope, ExecutePayload, HeartbeatPayload,
    MessageType, RegisterAck, RegisterRequest, WorkerCommand,
};
