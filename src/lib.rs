//! Location worker for distributed DNS lookups.
//!
//! A coordinator publishes DNS lookup tasks to a shared stream. Every worker
//! location owns its own subscription over that stream, so each task is
//! resolved once per location. The worker resolves the requested record
//! types through an external resolver program, randomly switching between
//! concurrent and sequential execution and randomly injecting failures
//! ("chaos mode"), then publishes one result per task and acknowledges it.
//!
//! # Module Organization
//!
//! - [`types`] - Task, result and envelope wire types
//! - [`stream`] - Consumer-group log client (in-memory and Redis Streams)
//! - [`resolver`] - Resolution engine, chaos randomness, resolver program
//! - [`worker`] - The consumption loop
//! - [`telemetry`] - Logging setup, trace-context propagation, spans
//! - [`config`] - Configuration from defaults, TOML and environment
//! - [`health`] - `/health` and `/status` endpoints (`http` feature)
//! - [`constants`] - Stream and field names, fixed messages
//!
//! # Delivery
//!
//! At-least-once per location: an entry is acknowledged only after its
//! result was handled, and entries left unacknowledged by a crash are
//! processed again, before any newer ones, when the worker restarts.

pub mod config;
pub mod constants;
#[cfg(feature = "http")]
pub mod health;
pub mod resolver;
pub mod stream;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use config::{ConfigError, PublishFailurePolicy, WorkerConfig};
pub use resolver::{ChaosConfig, ExecutionMode, Resolution, ResolutionEngine};
pub use stream::{publish, InMemoryStream, StreamError, StreamLog, Subscription};
pub use types::*;
pub use worker::{EnvelopeOutcome, LoopState, TaskOutcome, Worker, WorkerError};
