//! Streaming execution runtime.
//!
//! One concurrent task per plan operator, bounded channels between them,
//! watch-based cooperative cancellation, and phase-timed accounting on
//! the shared request context.

mod base;
mod build;
mod context;
mod ddl;
mod fetch;
mod filter;
mod group;
mod join;
mod join_nl;
mod mutate;
mod order;
mod project;
mod scan;
mod scan_distinct;
mod scan_index;
mod scan_intersect;
mod stream;

pub use base::{
    Operator, OperatorIo, Phase, PhaseTimer, Pipeline, PipelineStopper, ValueInput, ValueReceiver,
};
pub use build::spawn_plan;
pub use context::{CollectorSink, Context, PhaseId, ResultSink};
