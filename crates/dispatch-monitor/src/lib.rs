//! Completion tokens and fan-in join combinators.
//!
//! This crate provides the asynchronous-completion building blocks:
//! - `Status` - Outcome taxonomy (ok / cancelled / error with kind and cause)
//! - `CompletionToken` - One-shot completion handle, optionally chained to a
//!   parent so deep call chains collapse to a single final notification
//! - `CancelHandle` - Chain-wide advisory cancellation flag
//! - `CountingToken` / `TokenCollector` / `TokenTracker` - Aggregate N child
//!   completions into one

pub mod combinators;
pub mod status;
pub mod token;

pub use combinators::{CountingToken, TokenCollector, TokenTracker};
pub use status::{ErrorKind, ErrorStatus, Status};
pub use token::{CancelHandle, CompletionToken, TokenId};
