use std::sync::mpsc;
use std::task::Poll;

/// Handle to a job running on a worker thread.
///
/// The main thread checks it once per frame with [`poll_now`](IoHandle::poll_now);
/// only result delivery goes through the channel.
///
/// # Example
///
/// ```ignore
/// let handle = io.run_blocking(move || source.copy_attribute(id, attr, &mut dest, stride));
///
/// // Later, from the frame loop
/// match handle.poll_now() {
///     Poll::Pending => { /* still running */ }
///     Poll::Ready(Some(result)) => { /* consume */ }
///     Poll::Ready(None) => { /* worker dropped the sender */ }
/// }
/// ```
pub struct IoHandle<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> IoHandle<T> {
    /// Creates a new IO handle wrapping the given receiver.
    pub fn new(receiver: mpsc::Receiver<T>) -> Self {
        Self { receiver }
    }

    /// Attempts to retrieve the result without blocking.
    ///
    /// Returns `Some(T)` if the job has completed, `None` otherwise.
    /// This consumes the value; subsequent calls return `None`.
    pub fn try_recv(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Checks the job without blocking and without a waker.
    ///
    /// Returns `Poll::Ready(None)` when the worker went away without sending,
    /// which distinguishes a panicked job from one that is still running.
    pub fn poll_now(&self) -> Poll<Option<T>> {
        match self.receiver.try_recv() {
            Ok(val) => Poll::Ready(Some(val)),
            Err(mpsc::TryRecvError::Empty) => Poll::Pending,
            Err(mpsc::TryRecvError::Disconnected) => Poll::Ready(None),
        }
    }

    /// Blocks until the job completes and returns the result.
    ///
    /// Returns `None` if the sender was dropped without sending.
    ///
    /// # Warning
    ///
    /// This blocks the calling thread. Prefer `poll_now()` in frame loops.
    pub fn recv(self) -> Option<T> {
        self.receiver.recv().ok()
    }
}

impl<T> std::fmt::Debug for IoHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandle").finish_non_exhaustive()
    }
}
