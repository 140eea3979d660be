//! Blocking query bridge and rollback-capable sequences.
//!
//! This crate provides the orchestration layer over the dispatch core:
//! - `Query` - Lets a foreign thread block on a computation running on the
//!   executor, keeping the previous value when a refresh is cancelled
//! - `Sequence` / `Step` - An ordered asynchronous workflow that unwinds
//!   completed steps in reverse order on failure or cancellation

pub mod query;
pub mod sequence;

pub use query::{Query, QueryError};
pub use sequence::{FnStep, Sequence, SequenceBuilder, Step};
