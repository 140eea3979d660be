//! Serialized single-threaded executor for debugger-session state.
//!
//! Provides:
//! - `SerializedExecutor` - One logical thread per debug session
//! - `WorkHandle` - Best-effort cancellation of queued work
//! - `SubmitError` - Synchronous rejection after shutdown

pub mod executor;

pub use executor::{ExecutorBuilder, SerializedExecutor, SubmitError, WorkHandle};
