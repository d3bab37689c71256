//! Main-thread time slicing.
//!
//! Long multi-stage jobs (buffer builds, uploads) are written as explicit state
//! machines implementing [`SlicedTask`]. The frame loop calls
//! [`TimeSlicer::tick`] once per frame; each task gets at least one step, and
//! tasks that report [`SliceStep::Continue`] keep running until the frame
//! budget is spent.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::CancellationToken;

/// Result of a single step of a [`SlicedTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStep {
    /// More work is ready; step again this frame if budget remains.
    Continue,
    /// Yield until the next frame.
    Hold,
    /// Waiting on a worker thread; poll again next frame.
    Delay,
    /// The task aborted (cancelled or failed) and must be removed.
    Cancel,
    /// The task completed and must be removed.
    Finished,
}

impl SliceStep {
    /// Whether the task is done after this step.
    pub fn is_terminal(self) -> bool {
        matches!(self, SliceStep::Cancel | SliceStep::Finished)
    }
}

/// State passed to every step.
#[derive(Debug)]
pub struct SliceContext {
    token: CancellationToken,
    frame: u64,
}

impl SliceContext {
    /// Whether the task's handle has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The task's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Index of the current [`TimeSlicer::tick`] call.
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

/// A unit of main-thread work that is advanced one step at a time.
pub trait SlicedTask: Send {
    /// Name used in log output.
    fn label(&self) -> &str {
        "sliced task"
    }

    /// Advances the task by one step.
    fn step(&mut self, ctx: &SliceContext) -> SliceStep;
}

/// Handle to a spawned task. Cancelling it only sets the token; the task
/// observes it on its next step and winds down on its own terms.
#[derive(Debug, Clone)]
pub struct SliceHandle {
    id: u64,
    token: CancellationToken,
}

impl SliceHandle {
    /// Unique id of the task within its slicer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The token shared with the task.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Per-frame limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceBudget {
    /// Wall-clock time available for chained `Continue` steps.
    pub frame_budget: Duration,
    /// Upper bound on steps a single task may take in one tick.
    pub max_steps_per_task: u32,
}

impl Default for SliceBudget {
    fn default() -> Self {
        Self {
            frame_budget: Duration::from_millis(2),
            max_steps_per_task: 64,
        }
    }
}

/// Summary of a [`TimeSlicer::tick`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub steps: u32,
    pub finished: u32,
    pub cancelled: u32,
    pub remaining: usize,
    pub over_budget: bool,
}

struct SliceEntry {
    id: u64,
    token: CancellationToken,
    task: Box<dyn SlicedTask>,
}

/// Cloneable handle for enqueueing tasks.
///
/// Spawns land in a queue that the slicer drains at the start of its next
/// tick, so callbacks running inside a tick can spawn without re-entering the
/// slicer.
#[derive(Clone)]
pub struct SliceSpawner {
    incoming: Arc<Mutex<Vec<SliceEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl SliceSpawner {
    fn new() -> Self {
        Self {
            incoming: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Enqueues a task with a fresh cancellation token.
    pub fn spawn(&self, task: impl SlicedTask + 'static) -> SliceHandle {
        self.spawn_with_token(task, CancellationToken::new())
    }

    /// Enqueues a task observing an existing token.
    pub fn spawn_with_token(
        &self,
        task: impl SlicedTask + 'static,
        token: CancellationToken,
    ) -> SliceHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::trace!("Spawning sliced task #{id} ({})", task.label());
        self.incoming.lock().push(SliceEntry {
            id,
            token: token.clone(),
            task: Box::new(task),
        });
        SliceHandle { id, token }
    }

    fn pending(&self) -> usize {
        self.incoming.lock().len()
    }
}

impl std::fmt::Debug for SliceSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceSpawner")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Round-robin scheduler for [`SlicedTask`]s.
pub struct TimeSlicer {
    tasks: Vec<SliceEntry>,
    spawner: SliceSpawner,
    budget: SliceBudget,
    frame: u64,
}

impl TimeSlicer {
    pub fn new(budget: SliceBudget) -> Self {
        Self {
            tasks: Vec::new(),
            spawner: SliceSpawner::new(),
            budget,
            frame: 0,
        }
    }

    pub fn budget(&self) -> SliceBudget {
        self.budget
    }

    pub fn set_budget(&mut self, budget: SliceBudget) {
        self.budget = budget;
    }

    /// Returns a spawner feeding this slicer.
    pub fn spawner(&self) -> SliceSpawner {
        self.spawner.clone()
    }

    /// Enqueues a task. It takes its first step on the next tick.
    pub fn spawn(&self, task: impl SlicedTask + 'static) -> SliceHandle {
        self.spawner.spawn(task)
    }

    /// Number of live tasks, including ones queued for the next tick.
    pub fn len(&self) -> usize {
        self.tasks.len() + self.spawner.pending()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advances every task. Call once per frame from the main thread.
    pub fn tick(&mut self) -> TickReport {
        crate::profile_function!();

        self.frame += 1;
        {
            let mut incoming = self.spawner.incoming.lock();
            self.tasks.append(&mut incoming);
        }

        let deadline = Instant::now() + self.budget.frame_budget;
        let max_steps = self.budget.max_steps_per_task.max(1);
        let frame = self.frame;
        let mut report = TickReport::default();

        self.tasks.retain_mut(|entry| {
            let ctx = SliceContext {
                token: entry.token.clone(),
                frame,
            };
            let mut steps = 0;
            loop {
                let step = entry.task.step(&ctx);
                steps += 1;
                report.steps += 1;
                match step {
                    SliceStep::Continue => {
                        if steps >= max_steps {
                            return true;
                        }
                        if Instant::now() >= deadline {
                            report.over_budget = true;
                            return true;
                        }
                    }
                    SliceStep::Hold | SliceStep::Delay => return true,
                    SliceStep::Finished => {
                        log::trace!("Sliced task #{} ({}) finished", entry.id, entry.task.label());
                        report.finished += 1;
                        return false;
                    }
                    SliceStep::Cancel => {
                        log::trace!("Sliced task #{} ({}) cancelled", entry.id, entry.task.label());
                        report.cancelled += 1;
                        return false;
                    }
                }
            }
        });

        report.remaining = self.len();
        report
    }
}

impl Default for TimeSlicer {
    fn default() -> Self {
        Self::new(SliceBudget::default())
    }
}

impl std::fmt::Debug for TimeSlicer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSlicer")
            .field("tasks", &self.tasks.len())
            .field("budget", &self.budget)
            .field("frame", &self.frame)
            .finish()
    }
}
