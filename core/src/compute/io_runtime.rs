use std::sync::Arc;

use super::{IoHandle, IoRunner};

/// Worker runtime for attribute fetches and other off-main-thread jobs.
///
/// Wraps a tokio multi-thread runtime with one async worker thread. Blocking
/// jobs go to tokio's blocking pool so a slow data source never stalls the
/// frame loop.
///
/// Clone is cheap (Arc-wrapped).
///
/// # Example
///
/// ```ignore
/// let io = IoRuntime::new();
/// let handle = io.run_blocking(move || expensive_copy());
/// // poll `handle` from the frame loop
/// ```
#[derive(Clone)]
pub struct IoRuntime {
    inner: Arc<IoRuntimeInner>,
}

struct IoRuntimeInner {
    runtime: tokio::runtime::Runtime,
}

impl IoRuntime {
    /// Creates a new IO runtime with one async worker thread.
    pub fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("avatar-io")
            .enable_all()
            .build()
            .expect("Failed to create tokio IO runtime");

        log::debug!("IoRuntime started");

        Self {
            inner: Arc::new(IoRuntimeInner { runtime }),
        }
    }
}

impl IoRunner for IoRuntime {
    fn run_blocking<T, F>(&self, job: F) -> IoHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = std::sync::mpsc::channel();

        self.inner.runtime.spawn_blocking(move || {
            let result = job();
            let _ = sender.send(result);
        });

        IoHandle::new(receiver)
    }
}

impl Default for IoRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IoRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRuntime").finish_non_exhaustive()
    }
}
