//! Frame-cooperative compute primitives.
//!
//! - [`CancellationToken`] / [`Cancelled`]: shared cancellation flag for
//!   background work
//! - [`IoHandle`]: channel-backed handle to a result produced on a worker thread
//! - [`IoRuntime`]: tokio runtime that runs blocking jobs off the frame loop
//! - [`TimeSlicer`]: main-thread scheduler that steps [`SlicedTask`]s within a
//!   per-frame time budget

mod cancellation;
mod io_handle;
mod io_runtime;
mod slice;

pub use cancellation::{CancellationToken, Cancelled};
pub use io_handle::IoHandle;
pub use io_runtime::IoRuntime;
pub use slice::{
    SliceBudget, SliceContext, SliceHandle, SliceSpawner, SliceStep, SlicedTask, TickReport,
    TimeSlicer,
};

/// Trait for handing work to a real worker runtime.
///
/// Results are delivered via [`IoHandle`], which the main thread polls once per
/// frame without a waker.
pub trait IoRunner: Clone + Send + Sync + 'static {
    /// Runs a blocking closure on a worker thread.
    ///
    /// If the closure panics the handle reports a dropped sender.
    fn run_blocking<T, F>(&self, job: F) -> IoHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static;
}
