//! Once-per-frame batching of skinning work.
//!
//! Objects register themselves as active during the frame; [`SkinningController::update`]
//! then runs every morph combiner, every texture skinner and every animator,
//! in that order, and forgets them until they register again.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::animator::MeshAnimator;
use crate::error::SkinningError;

/// Blends morph targets into the weights an animator consumes.
pub trait MorphTargetCombiner: Send {
    fn combine_morph_targets(&mut self) -> Result<(), SkinningError>;
}

/// Updates a skinning texture (the non-compute path).
pub trait TextureSkinner: Send {
    fn update_skinning_texture(&mut self) -> Result<(), SkinningError>;
}

/// Issues compute skinning dispatches.
pub trait SkinningDispatcher: Send {
    fn update_outputs(&mut self) -> Result<(), SkinningError>;
}

impl SkinningDispatcher for MeshAnimator {
    fn update_outputs(&mut self) -> Result<(), SkinningError> {
        MeshAnimator::update_outputs(self)
    }
}

pub type SharedCombiner = Arc<Mutex<dyn MorphTargetCombiner>>;
pub type SharedSkinner = Arc<Mutex<dyn TextureSkinner>>;
pub type SharedDispatcher = Arc<Mutex<dyn SkinningDispatcher>>;

/// What one [`SkinningController::update`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub combiners: usize,
    pub skinners: usize,
    pub animators: usize,
    pub failures: usize,
    pub duplicates_ignored: usize,
}

/// One frame's registrations of a kind, in registration order.
struct ActiveList<T: ?Sized> {
    items: Vec<Arc<Mutex<T>>>,
    /// Addresses of `items`, for constant-time duplicate checks.
    seen: HashSet<usize>,
    kind: &'static str,
}

impl<T: ?Sized> ActiveList<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
            kind,
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn add_once(&mut self, item: Arc<Mutex<T>>) -> bool {
        let addr = Arc::as_ptr(&item) as *const () as usize;
        if !self.seen.insert(addr) {
            debug_assert!(false, "{} registered twice in one frame", self.kind);
            log::error!("Ignoring duplicate {} registration", self.kind);
            return false;
        }
        self.items.push(item);
        true
    }

    /// Empties the list for the next frame.
    fn take(&mut self) -> Vec<Arc<Mutex<T>>> {
        self.seen.clear();
        std::mem::take(&mut self.items)
    }
}

pub struct SkinningController {
    combiners: ActiveList<dyn MorphTargetCombiner>,
    skinners: ActiveList<dyn TextureSkinner>,
    animators: ActiveList<dyn SkinningDispatcher>,
    duplicates: usize,
    frames: u64,
}

impl Default for SkinningController {
    fn default() -> Self {
        Self {
            combiners: ActiveList::new("morph target combiner"),
            skinners: ActiveList::new("texture skinner"),
            animators: ActiveList::new("animator"),
            duplicates: 0,
            frames: 0,
        }
    }
}

impl SkinningController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `combiner` for this frame. Returns `false` for a duplicate.
    pub fn add_active_combiner(&mut self, combiner: SharedCombiner) -> bool {
        let added = self.combiners.add_once(combiner);
        self.duplicates += usize::from(!added);
        added
    }

    pub fn add_active_skinner(&mut self, skinner: SharedSkinner) -> bool {
        let added = self.skinners.add_once(skinner);
        self.duplicates += usize::from(!added);
        added
    }

    pub fn add_active_animator(&mut self, animator: SharedDispatcher) -> bool {
        let added = self.animators.add_once(animator);
        self.duplicates += usize::from(!added);
        added
    }

    /// Registrations waiting for the next update.
    pub fn pending(&self) -> (usize, usize, usize) {
        (self.combiners.len(), self.skinners.len(), self.animators.len())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Runs and clears everything registered this frame.
    pub fn update(&mut self) -> ControllerStats {
        avatar_core::profile_function!();

        let mut stats = ControllerStats {
            combiners: self.combiners.len(),
            skinners: self.skinners.len(),
            animators: self.animators.len(),
            duplicates_ignored: std::mem::take(&mut self.duplicates),
            ..Default::default()
        };

        for combiner in self.combiners.take() {
            if let Err(e) = combiner.lock().combine_morph_targets() {
                log::error!("Morph target combine failed: {e}");
                stats.failures += 1;
            }
        }
        for skinner in self.skinners.take() {
            if let Err(e) = skinner.lock().update_skinning_texture() {
                log::error!("Skinning texture update failed: {e}");
                stats.failures += 1;
            }
        }
        for animator in self.animators.take() {
            if let Err(e) = animator.lock().update_outputs() {
                log::error!("Skinning dispatch failed: {e}");
                stats.failures += 1;
            }
        }

        self.frames += 1;
        stats
    }
}

impl std::fmt::Debug for SkinningController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkinningController")
            .field("pending", &self.pending())
            .field("frames", &self.frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        fail: bool,
    }

    impl Recorder {
        fn shared(name: &'static str, log: &Log) -> Arc<Mutex<Self>> {
            Arc::new(Mutex::new(Self {
                name,
                log: log.clone(),
                fail: false,
            }))
        }

        fn record(&self) -> Result<(), SkinningError> {
            self.log.lock().push(self.name.to_string());
            if self.fail {
                Err(SkinningError::NotReady)
            } else {
                Ok(())
            }
        }
    }

    impl MorphTargetCombiner for Recorder {
        fn combine_morph_targets(&mut self) -> Result<(), SkinningError> {
            self.record()
        }
    }

    impl TextureSkinner for Recorder {
        fn update_skinning_texture(&mut self) -> Result<(), SkinningError> {
            self.record()
        }
    }

    impl SkinningDispatcher for Recorder {
        fn update_outputs(&mut self) -> Result<(), SkinningError> {
            self.record()
        }
    }

    #[test]
    fn runs_combiners_then_skinners_then_animators() {
        let log = Log::default();
        let mut controller = SkinningController::new();
        controller.add_active_animator(Recorder::shared("animator", &log));
        controller.add_active_skinner(Recorder::shared("skinner", &log));
        controller.add_active_combiner(Recorder::shared("combiner", &log));

        let stats = controller.update();
        assert_eq!(*log.lock(), vec!["combiner", "skinner", "animator"]);
        assert_eq!((stats.combiners, stats.skinners, stats.animators), (1, 1, 1));
        assert_eq!(controller.pending(), (0, 0, 0));

        controller.update();
        assert_eq!(log.lock().len(), 3);
        assert_eq!(controller.frames(), 2);
    }

    #[test]
    fn failures_do_not_stop_the_frame() {
        let log = Log::default();
        let mut controller = SkinningController::new();
        let failing = Recorder::shared("first", &log);
        failing.lock().fail = true;
        controller.add_active_animator(failing);
        controller.add_active_animator(Recorder::shared("second", &log));

        let stats = controller.update();
        assert_eq!(stats.failures, 1);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn registrations_reset_every_frame() {
        let log = Log::default();
        let mut controller = SkinningController::new();
        let animators: Vec<_> = (0..1000).map(|_| Recorder::shared("animator", &log)).collect();

        for frame in 1..=2 {
            for animator in &animators {
                assert!(controller.add_active_animator(animator.clone()));
            }
            let stats = controller.update();
            assert_eq!(stats.animators, 1000);
            assert_eq!(stats.duplicates_ignored, 0);
            assert_eq!(log.lock().len(), 1000 * frame);
        }
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn duplicate_registration_is_ignored() {
        let log = Log::default();
        let mut controller = SkinningController::new();
        let animator = Recorder::shared("animator", &log);
        assert!(controller.add_active_animator(animator.clone()));
        assert!(!controller.add_active_animator(animator));
        let stats = controller.update();
        assert_eq!(stats.duplicates_ignored, 1);
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_asserts() {
        let log = Log::default();
        let mut controller = SkinningController::new();
        let animator = Recorder::shared("animator", &log);
        controller.add_active_animator(animator.clone());
        controller.add_active_animator(animator);
    }
}
