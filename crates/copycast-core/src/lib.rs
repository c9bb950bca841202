//! # Copycast Core
//!
//! The data-distribution core for `Copycast`: typed record trees, compiled
//! structural projections, change-tracking subscription queues, and gateway
//! fan-out.
//!
//! This crate provides:
//! - **Tree**: Typed field schemas with pre-order offset addressing and
//!   mutex-guarded shared records
//! - **Request**: The client field-selection grammar and its reserved options
//! - **Projection**: Request compilation into bidirectional master↔copy
//!   synchronization with per-field filters
//! - **Monitor**: Bounded snapshot+delta queues driven by record change
//!   notifications
//! - **Fanout**: One upstream subscription shared by many downstream queues
//!
//! ## Design Principles
//!
//! 1. **Compile once, sync many** - A request is resolved to an offset-mapped
//!    node arena up front; no name lookups on the data path
//! 2. **Deltas as bitmaps** - Change sets are bitmaps over projected offsets,
//!    compressed so a full subtree is one ancestor bit
//! 3. **Bounded queues, lossy tails** - A slow consumer overruns its own
//!    queue and learns exactly which fields lost intermediate values
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use copycast_core::request::RequestSpec;
//! use copycast_core::monitor::{Monitor, MonitorConsumer};
//! use copycast_core::projection::FilterRegistry;
//! use copycast_core::tree::{Record, Scalar, ScalarType, SchemaBuilder, Value};
//!
//! struct Waker;
//! impl MonitorConsumer for Waker {
//!     fn event(&self) {}
//! }
//!
//! let schema = SchemaBuilder::new("counter")
//!     .scalar("value", ScalarType::Float)
//!     .alarm()
//!     .build();
//! let record = Record::new("counter01", schema);
//!
//! let request = RequestSpec::parse("value[deadband=abs:0.5]").unwrap();
//! let monitor = Monitor::new(Arc::clone(&record), &request, &FilterRegistry::new()).unwrap();
//! monitor.start(Arc::new(Waker)).unwrap();
//!
//! record.write(1, Value::Scalar(Scalar::Float(2.0))).unwrap();
//! let element = monitor.poll().unwrap();
//! monitor.release(element);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bitset;
pub mod fanout;
pub mod monitor;
pub mod projection;
pub mod request;
pub mod tree;

// Re-export key types
pub use bitset::ChangeBitmap;
pub use fanout::{FanoutCache, SubscriberHandle};
pub use monitor::{Monitor, MonitorConsumer, PolledElement};
pub use projection::{FilterRegistry, Projection};
pub use request::RequestSpec;
pub use tree::{Record, Schema, SchemaBuilder, TreeInstance, Value};

/// Result type for copycast-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for copycast-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Value/type errors from tree instances
    #[error("value error: {0}")]
    Value(#[from] tree::ValueError),

    /// Request grammar errors
    #[error("request error: {0}")]
    Request(#[from] request::RequestError),

    /// Projection compile errors
    #[error("compile error: {0}")]
    Compile(#[from] projection::CompileError),

    /// Monitor lifecycle errors
    #[error("monitor error: {0}")]
    Monitor(#[from] monitor::MonitorError),
}
