//! Time-sliced construction of a [`SharedVertexBuffer`].
//!
//! Fetching → Uploading → Finishing, or Cancelling from any fetch step.
//! Attribute copies run on the IO runtime, one at a time; everything touching
//! the GPU or the waiters runs inside [`SlicedTask::step`] on the frame
//! thread.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::task::Poll;

use avatar_core::compute::{
    CancellationToken, Cancelled, IoHandle, IoRunner, SliceContext, SliceStep, SlicedTask,
};

use crate::error::{SkinningError, SourceError};
use crate::packed::AlignedBytes;
use crate::pool::{PendingLoad, PoolShared, RetainedVertexBuffer};
use crate::source::{CompactSkinningDataId, SkinningAttribute, SkinningDataSource};
use crate::vertex_buffer::{FetchedAttribute, SharedVertexBuffer, pack_vertex_buffer};

#[derive(Debug)]
enum FetchError {
    Source(SourceError),
    Cancelled,
}

impl From<SourceError> for FetchError {
    fn from(error: SourceError) -> Self {
        FetchError::Source(error)
    }
}

impl From<Cancelled> for FetchError {
    fn from(_: Cancelled) -> Self {
        FetchError::Cancelled
    }
}

type FetchResult = Result<FetchedAttribute, FetchError>;

/// Worker-thread half of a fetch: query, allocate, copy.
fn fetch_attribute(
    source: &dyn SkinningDataSource,
    id: CompactSkinningDataId,
    attribute: SkinningAttribute,
    token: &CancellationToken,
) -> FetchResult {
    token.check()?;
    let info = source.attribute_info(id, attribute)?;
    let mut bytes = AlignedBytes::zeroed(info.byte_size());
    let normalization = source.copy_attribute(id, attribute, bytes.as_bytes_mut(), info.stride)?;
    token.check()?;
    Ok(FetchedAttribute {
        attribute,
        info,
        bytes,
        normalization,
    })
}

enum Stage {
    Fetching {
        next: usize,
        in_flight: Option<IoHandle<FetchResult>>,
    },
    Uploading,
    Finishing {
        retained: RetainedVertexBuffer,
        waiters: VecDeque<Weak<dyn PendingLoad>>,
    },
    Cancelling {
        in_flight: Option<IoHandle<FetchResult>>,
    },
    Done,
}

/// Builds one shared vertex buffer for the pool.
pub struct VertexBufferBuilder {
    pool: Arc<PoolShared>,
    id: CompactSkinningDataId,
    generation: u64,
    label: String,
    fetched: HashMap<SkinningAttribute, FetchedAttribute>,
    stage: Stage,
}

impl VertexBufferBuilder {
    pub(crate) fn new(pool: Arc<PoolShared>, id: CompactSkinningDataId, generation: u64) -> Self {
        Self {
            pool,
            id,
            generation,
            label: format!("vertex buffer builder {id}"),
            fetched: HashMap::new(),
            stage: Stage::Fetching {
                next: 0,
                in_flight: None,
            },
        }
    }

    fn fail(&mut self, error: SkinningError) -> SliceStep {
        self.fetched.clear();
        self.stage = Stage::Done;
        self.pool.fail_build(self.id, self.generation, &error);
        SliceStep::Cancel
    }

    fn begin_cancel(&mut self) {
        let in_flight = match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Fetching { in_flight, .. } | Stage::Cancelling { in_flight } => in_flight,
            _ => None,
        };
        log::debug!("{}: cancelling", self.label);
        self.stage = Stage::Cancelling { in_flight };
    }

    fn step_fetching(
        &mut self,
        ctx: &SliceContext,
        next: usize,
        in_flight: Option<IoHandle<FetchResult>>,
    ) -> SliceStep {
        let Some(&attribute) = SkinningAttribute::ALL.get(next) else {
            self.stage = Stage::Uploading;
            return SliceStep::Continue;
        };

        let Some(handle) = in_flight else {
            let source = self.pool.source.clone();
            let token = ctx.token().clone();
            let id = self.id;
            let handle = self
                .pool
                .io
                .run_blocking(move || fetch_attribute(source.as_ref(), id, attribute, &token));
            self.stage = Stage::Fetching {
                next,
                in_flight: Some(handle),
            };
            return SliceStep::Delay;
        };

        let result = match handle.poll_now() {
            Poll::Pending => {
                self.stage = Stage::Fetching {
                    next,
                    in_flight: Some(handle),
                };
                return SliceStep::Delay;
            }
            Poll::Ready(Some(result)) => result,
            Poll::Ready(None) => Err(FetchError::Source(SourceError::Failed {
                attribute,
                message: "worker exited without a result".to_string(),
            })),
        };

        match result {
            Ok(fetched) => {
                log::trace!(
                    "{}: fetched {attribute} ({} x {:?})",
                    self.label,
                    fetched.info.count,
                    fetched.info.format
                );
                self.fetched.insert(attribute, fetched);
            }
            Err(FetchError::Cancelled) => {
                self.stage = Stage::Cancelling { in_flight: None };
                return SliceStep::Continue;
            }
            Err(FetchError::Source(error)) if attribute.is_required() => {
                return self.fail(match &error {
                    SourceError::DataNotAvailable(attribute) => {
                        SkinningError::DataNotAvailable(*attribute)
                    }
                    SourceError::Failed { .. } => SkinningError::BuildFailure(error.to_string()),
                });
            }
            Err(FetchError::Source(SourceError::DataNotAvailable(_))) => {
                log::debug!("{}: {attribute} not available", self.label);
            }
            Err(FetchError::Source(error)) => {
                log::warn!("{}: optional {attribute} skipped: {error}", self.label);
            }
        }
        self.stage = Stage::Fetching {
            next: next + 1,
            in_flight: None,
        };
        SliceStep::Hold
    }

    fn step_uploading(&mut self) -> SliceStep {
        avatar_core::profile_scope!("vertex_buffer_upload");

        let packed = match pack_vertex_buffer(std::mem::take(&mut self.fetched)) {
            Ok(packed) => packed,
            Err(error) => return self.fail(error),
        };
        let buffer = match SharedVertexBuffer::upload(&self.pool.device, self.id, packed) {
            Ok(buffer) => Arc::new(buffer),
            Err(error) => {
                return self.fail(SkinningError::BuildFailure(format!("upload failed: {error}")));
            }
        };

        let Some((retained, waiters)) =
            self.pool.complete_build(self.id, self.generation, buffer)
        else {
            log::debug!("{}: build was superseded, dropping result", self.label);
            self.stage = Stage::Done;
            return SliceStep::Cancel;
        };

        self.pool.source.compact_skinning_data_loaded(self.id);
        for waiter in waiters.iter().filter_map(Weak::upgrade) {
            waiter.compact_skinning_data_loaded(self.id);
        }
        self.stage = Stage::Finishing {
            retained,
            waiters: waiters.into(),
        };
        SliceStep::Continue
    }

    fn step_finishing(
        &mut self,
        retained: RetainedVertexBuffer,
        mut waiters: VecDeque<Weak<dyn PendingLoad>>,
    ) -> SliceStep {
        if let Some(waiter) = waiters.pop_front().and_then(|w| w.upgrade()) {
            waiter.finish(retained.clone());
        }
        if waiters.is_empty() {
            log::debug!("{}: finished", self.label);
            return SliceStep::Finished;
        }
        self.stage = Stage::Finishing { retained, waiters };
        SliceStep::Continue
    }

    fn step_cancelling(&mut self, in_flight: Option<IoHandle<FetchResult>>) -> SliceStep {
        if let Some(handle) = in_flight
            && handle.poll_now().is_pending()
        {
            self.stage = Stage::Cancelling {
                in_flight: Some(handle),
            };
            return SliceStep::Delay;
        }
        self.fetched.clear();
        self.pool.abandon_build(self.id, self.generation);
        SliceStep::Cancel
    }
}

impl SlicedTask for VertexBufferBuilder {
    fn label(&self) -> &str {
        &self.label
    }

    fn step(&mut self, ctx: &SliceContext) -> SliceStep {
        if ctx.is_cancelled() && matches!(self.stage, Stage::Fetching { .. } | Stage::Uploading) {
            self.begin_cancel();
        }

        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Fetching { next, in_flight } => self.step_fetching(ctx, next, in_flight),
            Stage::Uploading => self.step_uploading(),
            Stage::Finishing { retained, waiters } => self.step_finishing(retained, waiters),
            Stage::Cancelling { in_flight } => self.step_cancelling(in_flight),
            Stage::Done => SliceStep::Finished,
        }
    }
}
