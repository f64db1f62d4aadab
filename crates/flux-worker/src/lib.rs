//! # Flux Worker
//!
//! The execution side of the engine. A worker registers its capabilities
//! with the server, consumes the server-pushed command stream, and drives
//! workflow bodies with full event replay; every event the body produces
//! is shipped back as a checkpoint and acknowledged before the body makes
//! further progress.
//!
//! Workers execute compiled workflows from their local
//! [`WorkflowRegistry`](flux_core::WorkflowRegistry); embed this crate as
//! a library and register your workflow types before calling
//! [`Worker::run`].

pub mod config;
pub mod http;
pub mod runner;
pub mod worker;

pub use config::WorkerConfig;
pub use http::{http_gateway, HttpGateway};
pub use runner::{CheckpointSink, Runner};
pub use worker::Worker;
