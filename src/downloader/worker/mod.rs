//! Transfer execution: one worker per admitted task.
//!
//! Split into focused submodules:
//! - [`context`] - Per-worker state and progress checkpoints
//! - [`orchestration`] - Top-level transfer lifecycle and resume negotiation
//! - [`stream`] - Writing the response body to the temp file
//! - [`finalization`] - Verification, rename into place and the exit transition

mod context;
mod finalization;
mod orchestration;
mod stream;

pub(crate) use context::WorkerContext;
pub(crate) use orchestration::run_transfer;
