//! Cluster worker process that executes slices dispatched by an
//! execution controller.
//!
//! A worker holds one long-lived messenger session with its controller,
//! runs each assigned slice through a configurable multi-stage pipeline,
//! persists execution state, and supports graceful and forced shutdown
//! under timeout pressure.

pub mod config;
pub mod error;
pub mod events;
pub mod messenger;
pub mod pipeline;
pub mod slice;
pub mod stores;
pub mod worker;

pub use config::{JobConfig, OpConfig, StorageConfig, WorkerContext};
pub use error::{Result, WorkerError};
pub use events::{EventBus, WorkerEvent};
pub use slice::Slice;
pub use worker::{Worker, WorkerState};
