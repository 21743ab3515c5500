//! Cancellable staged processing on tokio.
//!
//! Items from a [`futures::Stream`] are admitted through a token bucket,
//! pass an ordered chain of stages (each optionally fanned out over several
//! workers and merged again) and come out as one [`ItemResult`] each. A
//! single cancellation signal reaches every task of a run.

pub mod config;
pub mod context;
pub mod error;
pub mod fanin;
pub mod fanout;
pub mod item;
pub mod limiter;
pub mod pipeline;
pub mod stage;

pub use config::{LimiterConfig, PipelineConfig};
pub use context::{CancelSignal, StageContext};
pub use error::{CancelReason, ItemError, PipeError};
pub use item::{Envelope, InFlight, ItemResult};
pub use limiter::{LimiterStats, TokenBucket};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineExit, PipelineState, ResultStream};
pub use stage::{ErrorPolicy, FnStage, SharedStage, Stage};
