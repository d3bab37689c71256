//! Shared fixtures for the skinning integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use glam::{Vec3, Vec4};
use parking_lot::{Condvar, Mutex};

use avatar_core::compute::{IoRuntime, SliceBudget};
use avatar_graphics::GraphicsDevice;
use avatar_skinning::{
    AttributeInfo, CompactSkinningDataId, InMemorySkinningSource, MeshSkinningData, MorphTarget,
    NormalizationParams, SkinningAttribute, SkinningDataSource, SkinningResourcePool, SourceError,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic value in `[-1, 1)`.
fn noise(seed: u32) -> f32 {
    let mut x = seed.wrapping_mul(0x9E37_79B9) ^ 0x85EB_CA6B;
    x ^= x >> 15;
    x = x.wrapping_mul(0x2C1B_3C6D);
    x ^= x >> 12;
    (x % 20_000) as f32 / 10_000.0 - 1.0
}

pub fn noise_vec3(seed: u32) -> Vec3 {
    Vec3::new(noise(seed * 3), noise(seed * 3 + 1), noise(seed * 3 + 2))
}

/// What [`test_mesh`] puts into a mesh.
#[derive(Debug, Clone, Copy)]
pub struct MeshShape {
    pub verts: u32,
    pub morphs: u32,
    pub joints: u32,
    pub tangents: bool,
}

impl MeshShape {
    pub const fn new(verts: u32, morphs: u32, joints: u32, tangents: bool) -> Self {
        Self {
            verts,
            morphs,
            joints,
            tangents,
        }
    }
}

/// A mesh with deterministic positions, unit normals and, when asked for,
/// tangents, two joint influences per vertex and sparse morph targets.
pub fn test_mesh(shape: MeshShape) -> MeshSkinningData {
    let n = shape.verts;
    let positions: Vec<Vec3> = (0..n).map(|v| noise_vec3(v + 1)).collect();
    let normals: Vec<Vec3> = (0..n)
        .map(|v| {
            let normal = noise_vec3(v + 10_000);
            if normal.length_squared() > 1e-6 {
                normal.normalize()
            } else {
                Vec3::Y
            }
        })
        .collect();
    let mut mesh = MeshSkinningData::new(positions, normals.clone());

    if shape.tangents {
        let tangents = normals
            .iter()
            .enumerate()
            .map(|(v, normal)| {
                let sign = if v % 3 == 0 { -1.0 } else { 1.0 };
                normal.any_orthonormal_vector().extend(sign)
            })
            .collect::<Vec<Vec4>>();
        mesh = mesh.with_tangents(tangents);
    }

    if shape.joints > 0 {
        let indices = (0..n)
            .map(|v| {
                let first = (v % shape.joints) as u16;
                let second = ((v + 1) % shape.joints) as u16;
                [first, second, 0, 0]
            })
            .collect();
        let weights = (0..n).map(|_| [0.75, 0.25, 0.0, 0.0]).collect();
        mesh = mesh.with_joints(indices, weights);
    }

    for m in 0..shape.morphs {
        // Every morph touches a third of the vertices.
        let deltas = (0..n)
            .map(|v| {
                if (v + m) % 3 == 0 {
                    noise_vec3(v + 50_000 * (m + 1)) * 0.1
                } else {
                    Vec3::ZERO
                }
            })
            .collect();
        mesh = mesh.with_morph_target(MorphTarget::new(deltas));
    }
    mesh
}

/// A pool on a fresh dummy device, backed by an in-memory source.
pub struct Fixture {
    pub device: Arc<GraphicsDevice>,
    pub source: Arc<InMemorySkinningSource>,
    pub pool: Arc<SkinningResourcePool>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_source(Arc::new(InMemorySkinningSource::new()))
    }

    pub fn with_source(source: Arc<InMemorySkinningSource>) -> Self {
        init_logging();
        let device = GraphicsDevice::dummy();
        let pool = Arc::new(SkinningResourcePool::new(
            device.clone(),
            source.clone(),
            IoRuntime::new(),
            SliceBudget::default(),
        ));
        Self {
            device,
            source,
            pool,
        }
    }

    pub fn insert(&self, id: u64, shape: MeshShape) -> CompactSkinningDataId {
        let id = CompactSkinningDataId(id);
        self.source.insert(id, &test_mesh(shape));
        id
    }

    pub fn run_until_idle(&self) {
        run_until_idle(&self.pool);
    }
}

/// Ticks `pool` until no builder is left. Panics after a few seconds.
pub fn run_until_idle(pool: &SkinningResourcePool) {
    run_until(pool, || pool.pending_tasks() == 0);
}

/// Ticks `pool` until `done` holds. Panics after a few seconds.
pub fn run_until(pool: &SkinningResourcePool, mut done: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        pool.update();
        if done() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("pool did not settle: {:?}", pool.stats());
}

/// Blocks attribute copies until opened, for catching a build mid-fetch.
pub struct GatedSource {
    inner: InMemorySkinningSource,
    open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicUsize,
}

impl GatedSource {
    pub fn new(inner: InMemorySkinningSource) -> Arc<Self> {
        Arc::new(Self {
            inner,
            open: Mutex::new(false),
            opened: Condvar::new(),
            entered: AtomicUsize::new(0),
        })
    }

    pub fn inner(&self) -> &InMemorySkinningSource {
        &self.inner
    }

    /// Lets every blocked and future copy through. Must be called before the
    /// pool's runtime is dropped, which waits for blocked workers.
    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::Acquire)
    }

    /// Ticks `pool` until a worker is blocked on the gate.
    pub fn wait_for_worker(&self, pool: &SkinningResourcePool) {
        run_until(pool, || self.entered() > 0);
    }
}

impl SkinningDataSource for GatedSource {
    fn attribute_info(
        &self,
        id: CompactSkinningDataId,
        attribute: SkinningAttribute,
    ) -> Result<AttributeInfo, SourceError> {
        self.inner.attribute_info(id, attribute)
    }

    fn copy_attribute(
        &self,
        id: CompactSkinningDataId,
        attribute: SkinningAttribute,
        dest: &mut [u8],
        stride: u32,
    ) -> Result<Option<NormalizationParams>, SourceError> {
        self.entered.fetch_add(1, Ordering::AcqRel);
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
        drop(open);
        self.inner.copy_attribute(id, attribute, dest, stride)
    }

    fn compact_skinning_data_loaded(&self, id: CompactSkinningDataId) {
        self.inner.compact_skinning_data_loaded(id);
    }
}

/// A pool over a [`GatedSource`] on a fresh dummy device.
pub struct GatedFixture {
    pub device: Arc<GraphicsDevice>,
    pub source: Arc<GatedSource>,
    pub pool: Arc<SkinningResourcePool>,
}

impl GatedFixture {
    pub fn new() -> Self {
        init_logging();
        let device = GraphicsDevice::dummy();
        let source = GatedSource::new(InMemorySkinningSource::new());
        let pool = Arc::new(SkinningResourcePool::new(
            device.clone(),
            source.clone(),
            IoRuntime::new(),
            SliceBudget::default(),
        ));
        Self {
            device,
            source,
            pool,
        }
    }

    pub fn insert(&self, id: u64, shape: MeshShape) -> CompactSkinningDataId {
        let id = CompactSkinningDataId(id);
        self.source.inner().insert(id, &test_mesh(shape));
        id
    }
}

impl Drop for GatedFixture {
    fn drop(&mut self) {
        self.source.open();
    }
}
