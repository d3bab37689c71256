//! Shared vertex buffers keyed by [`CompactSkinningDataId`].
//!
//! Each id has at most one in-flight [`VertexBufferBuilder`]. Requesters that
//! arrive while it runs are queued on the same entry and are all finished, or
//! all failed, together. A built buffer stays alive while at least one
//! [`RetainedVertexBuffer`] exists for it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use avatar_core::compute::{
    CancellationToken, IoRuntime, SliceBudget, SliceSpawner, TickReport, TimeSlicer,
};
use avatar_graphics::GraphicsDevice;
use parking_lot::Mutex;

use crate::builder::VertexBufferBuilder;
use crate::error::SkinningError;
use crate::source::{CompactSkinningDataId, SkinningDataSource};
use crate::vertex_buffer::SharedVertexBuffer;

/// Something waiting for a shared vertex buffer.
///
/// Exactly one of [`finish`](Self::finish) or [`fail`](Self::fail) is called
/// per registration. Callbacks run on the thread calling
/// [`SkinningResourcePool::update`] with no pool lock held; they must not call
/// `update` themselves.
pub trait PendingLoad: Send + Sync {
    /// The buffer is on the GPU and the source data may be released.
    fn compact_skinning_data_loaded(&self, _id: CompactSkinningDataId) {}

    fn finish(&self, buffer: RetainedVertexBuffer);

    fn fail(&self, error: &SkinningError);
}

#[derive(Debug, Clone)]
struct BuildTicket {
    generation: u64,
    token: CancellationToken,
}

/// Pool bookkeeping for one id.
#[derive(Default)]
pub struct VertexBufferInfo {
    build: Option<BuildTicket>,
    buffer: Weak<SharedVertexBuffer>,
    pending: Vec<Weak<dyn PendingLoad>>,
    retain_count: u32,
}

impl VertexBufferInfo {
    pub fn is_building(&self) -> bool {
        self.build.is_some()
    }

    pub fn retain_count(&self) -> u32 {
        self.retain_count
    }

    pub fn pending_loads(&self) -> usize {
        self.pending.len()
    }

    /// The built buffer, unless it has been freed.
    pub fn try_get_created_buffer(&self) -> Option<Arc<SharedVertexBuffer>> {
        if self.retain_count == 0 {
            return None;
        }
        self.buffer.upgrade()
    }

    fn is_unused(&self) -> bool {
        self.build.is_none() && self.pending.is_empty() && self.retain_count == 0
    }
}

/// Pool counters, for leak checks and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub entries: usize,
    pub live_buffers: usize,
    pub active_builds: usize,
    pub builds_started: u64,
    pub builds_completed: u64,
    pub builds_failed: u64,
    pub builds_cancelled: u64,
    pub buffers_freed: u64,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<CompactSkinningDataId, VertexBufferInfo>,
    next_generation: u64,
    stats: PoolStats,
}

impl PoolState {
    fn prune(&mut self, id: CompactSkinningDataId) {
        if self.entries.get(&id).is_some_and(VertexBufferInfo::is_unused) {
            self.entries.remove(&id);
        }
    }
}

/// State reachable from builders and retain handles.
pub(crate) struct PoolShared {
    pub(crate) device: Arc<GraphicsDevice>,
    pub(crate) source: Arc<dyn SkinningDataSource>,
    pub(crate) io: IoRuntime,
    state: Mutex<PoolState>,
}

fn notify_failed(waiters: Vec<Weak<dyn PendingLoad>>, error: &SkinningError) {
    for waiter in waiters.iter().filter_map(Weak::upgrade) {
        waiter.fail(error);
    }
}

impl PoolShared {
    /// Publishes a finished build. Returns the builder's own retain and the
    /// waiters to finish, or `None` if the build was cancelled meanwhile.
    pub(crate) fn complete_build(
        self: &Arc<Self>,
        id: CompactSkinningDataId,
        generation: u64,
        buffer: Arc<SharedVertexBuffer>,
    ) -> Option<(RetainedVertexBuffer, Vec<Weak<dyn PendingLoad>>)> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&id)?;
        if entry.build.as_ref().map(|b| b.generation) != Some(generation) {
            return None;
        }
        entry.build = None;
        entry.buffer = Arc::downgrade(&buffer);
        entry.retain_count += 1;
        let waiters = std::mem::take(&mut entry.pending);
        state.stats.builds_completed += 1;
        drop(state);

        log::debug!("Vertex buffer {id} built for {} waiters", waiters.len());
        Some((RetainedVertexBuffer::new(buffer, Arc::downgrade(self), id), waiters))
    }

    /// Fails every waiter of the build `generation` of `id`.
    pub(crate) fn fail_build(
        &self,
        id: CompactSkinningDataId,
        generation: u64,
        error: &SkinningError,
    ) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        if entry.build.as_ref().map(|b| b.generation) != Some(generation) {
            return;
        }
        entry.build = None;
        let waiters = std::mem::take(&mut entry.pending);
        state.stats.builds_failed += 1;
        state.prune(id);
        drop(state);

        log::warn!("Vertex buffer {id} build failed: {error}");
        notify_failed(waiters, error);
    }

    /// Detaches a build that stopped on its own cancellation token.
    pub(crate) fn abandon_build(&self, id: CompactSkinningDataId, generation: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        if entry.build.as_ref().map(|b| b.generation) != Some(generation) {
            return;
        }
        entry.build = None;
        let waiters = std::mem::take(&mut entry.pending);
        state.stats.builds_cancelled += 1;
        state.prune(id);
        drop(state);

        notify_failed(waiters, &SkinningError::Cancelled);
    }

    fn retain_existing(&self, id: CompactSkinningDataId) -> Option<Arc<SharedVertexBuffer>> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&id)?;
        let buffer = entry.try_get_created_buffer()?;
        entry.retain_count += 1;
        Some(buffer)
    }

    fn release(&self, id: CompactSkinningDataId) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            debug_assert!(false, "released unknown vertex buffer {id}");
            log::error!("Released unknown vertex buffer {id}");
            return;
        };
        if entry.retain_count == 0 {
            debug_assert!(false, "vertex buffer {id} released more often than retained");
            log::error!("Vertex buffer {id} released more often than retained");
            return;
        }
        entry.retain_count -= 1;
        if entry.retain_count == 0 {
            entry.buffer = Weak::new();
            state.stats.buffers_freed += 1;
            state.prune(id);
            log::trace!("Last retain of vertex buffer {id} released");
        }
    }
}

/// Counted handle to a shared vertex buffer. Dropping it releases the retain.
pub struct RetainedVertexBuffer {
    buffer: Arc<SharedVertexBuffer>,
    pool: Weak<PoolShared>,
    id: CompactSkinningDataId,
}

impl RetainedVertexBuffer {
    fn new(buffer: Arc<SharedVertexBuffer>, pool: Weak<PoolShared>, id: CompactSkinningDataId) -> Self {
        Self { buffer, pool, id }
    }

    pub fn id(&self) -> CompactSkinningDataId {
        self.id
    }

    pub fn buffer(&self) -> &Arc<SharedVertexBuffer> {
        &self.buffer
    }
}

impl std::ops::Deref for RetainedVertexBuffer {
    type Target = SharedVertexBuffer;

    fn deref(&self) -> &SharedVertexBuffer {
        &self.buffer
    }
}

impl Clone for RetainedVertexBuffer {
    fn clone(&self) -> Self {
        if let Some(pool) = self.pool.upgrade() {
            let mut state = pool.state.lock();
            if let Some(entry) = state.entries.get_mut(&self.id) {
                entry.retain_count += 1;
            }
        }
        Self::new(self.buffer.clone(), self.pool.clone(), self.id)
    }
}

impl Drop for RetainedVertexBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.id);
        }
    }
}

impl std::fmt::Debug for RetainedVertexBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetainedVertexBuffer")
            .field("id", &self.id)
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// Owner of every shared vertex buffer and the builders producing them.
///
/// Created once by the runtime and passed by reference; nothing here is
/// global, so tests can run independent pools side by side.
pub struct SkinningResourcePool {
    shared: Arc<PoolShared>,
    slicer: Mutex<TimeSlicer>,
    spawner: SliceSpawner,
}

impl SkinningResourcePool {
    pub fn new(
        device: Arc<GraphicsDevice>,
        source: Arc<dyn SkinningDataSource>,
        io: IoRuntime,
        budget: SliceBudget,
    ) -> Self {
        let slicer = TimeSlicer::new(budget);
        let spawner = slicer.spawner();
        log::info!(
            "SkinningResourcePool created on {} ({:?} per frame)",
            device.backend_name(),
            budget.frame_budget
        );
        Self {
            shared: Arc::new(PoolShared {
                device,
                source,
                io,
                state: Mutex::new(PoolState::default()),
            }),
            slicer: Mutex::new(slicer),
            spawner,
        }
    }

    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.shared.device
    }

    pub fn source(&self) -> &Arc<dyn SkinningDataSource> {
        &self.shared.source
    }

    /// Queues `waiter` on `id`, starting a build if none is running.
    ///
    /// If the buffer already exists the waiter is finished immediately with a
    /// fresh retain. The lookup and the build decision share one lock, so a
    /// build completing on another thread is never duplicated. Returns whether
    /// a new build was started.
    pub fn create_builder_if_needed_and_add_pending_load(
        &self,
        id: CompactSkinningDataId,
        waiter: Weak<dyn PendingLoad>,
    ) -> bool {
        let mut state = self.shared.state.lock();
        let generation = state.next_generation;
        let entry = state.entries.entry(id).or_default();
        if let Some(buffer) = entry.try_get_created_buffer() {
            entry.retain_count += 1;
            drop(state);
            let retained = RetainedVertexBuffer::new(buffer, Arc::downgrade(&self.shared), id);
            if let Some(waiter) = waiter.upgrade() {
                waiter.compact_skinning_data_loaded(id);
                waiter.finish(retained);
            }
            return false;
        }
        entry.pending.push(waiter);
        if entry.build.is_some() {
            return false;
        }
        let token = CancellationToken::new();
        entry.build = Some(BuildTicket {
            generation,
            token: token.clone(),
        });
        state.next_generation += 1;
        state.stats.builds_started += 1;
        drop(state);

        log::debug!("Starting vertex buffer build {id} (generation {generation})");
        self.spawner.spawn_with_token(
            VertexBufferBuilder::new(self.shared.clone(), id, generation),
            token,
        );
        true
    }

    /// Retains the built buffer for `id`, if there is one.
    pub fn retain_buffer(&self, id: CompactSkinningDataId) -> Option<RetainedVertexBuffer> {
        let buffer = self.shared.retain_existing(id)?;
        Some(RetainedVertexBuffer::new(buffer, Arc::downgrade(&self.shared), id))
    }

    /// The built buffer for `id` without retaining it.
    pub fn try_get_created_buffer(
        &self,
        id: CompactSkinningDataId,
    ) -> Option<Arc<SharedVertexBuffer>> {
        self.shared
            .state
            .lock()
            .entries
            .get(&id)
            .and_then(VertexBufferInfo::try_get_created_buffer)
    }

    /// Withdraws a waiter. Cancels the build when no live waiter remains.
    ///
    /// `waiter` identifies the registration by address.
    pub fn remove_pending_load(&self, id: CompactSkinningDataId, waiter: *const ()) {
        let mut state = self.shared.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        entry
            .pending
            .retain(|w| w.strong_count() > 0 && Weak::as_ptr(w) as *const () != waiter);
        if entry.pending.is_empty()
            && let Some(build) = entry.build.take()
        {
            build.token.cancel();
            state.stats.builds_cancelled += 1;
            log::debug!("Cancelled vertex buffer build {id}: no waiters left");
        }
        state.prune(id);
    }

    /// Cancels the running build for `id` and fails its waiters with
    /// [`SkinningError::Cancelled`].
    pub fn cancel_build(&self, id: CompactSkinningDataId) -> bool {
        let mut state = self.shared.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return false;
        };
        let Some(build) = entry.build.take() else {
            return false;
        };
        build.token.cancel();
        let waiters = std::mem::take(&mut entry.pending);
        state.stats.builds_cancelled += 1;
        state.prune(id);
        drop(state);

        log::debug!("Cancelled vertex buffer build {id}");
        notify_failed(waiters, &SkinningError::Cancelled);
        true
    }

    pub fn is_building(&self, id: CompactSkinningDataId) -> bool {
        self.shared
            .state
            .lock()
            .entries
            .get(&id)
            .is_some_and(VertexBufferInfo::is_building)
    }

    pub fn retain_count(&self, id: CompactSkinningDataId) -> u32 {
        self.shared
            .state
            .lock()
            .entries
            .get(&id)
            .map_or(0, VertexBufferInfo::retain_count)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            entries: state.entries.len(),
            live_buffers: state
                .entries
                .values()
                .filter(|e| e.try_get_created_buffer().is_some())
                .count(),
            active_builds: state.entries.values().filter(|e| e.is_building()).count(),
            ..state.stats
        }
    }

    /// Number of builder tasks still alive, including cancelled ones waiting
    /// for their worker.
    pub fn pending_tasks(&self) -> usize {
        self.slicer.lock().len()
    }

    pub fn set_budget(&self, budget: SliceBudget) {
        self.slicer.lock().set_budget(budget);
    }

    /// Advances every builder. Call once per frame.
    pub fn update(&self) -> TickReport {
        avatar_core::profile_function!();
        self.slicer.lock().tick()
    }
}

impl Drop for SkinningResourcePool {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let mut waiters = Vec::new();
        for entry in state.entries.values_mut() {
            if let Some(build) = entry.build.take() {
                build.token.cancel();
                waiters.append(&mut entry.pending);
            }
        }
        drop(state);
        notify_failed(waiters, &SkinningError::Cancelled);
    }
}

impl std::fmt::Debug for SkinningResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkinningResourcePool")
            .field("stats", &self.stats())
            .finish()
    }
}
