//! Shared vertex buffer lifetime: coalescing, release, failure and
//! cancellation.

mod common;

use std::sync::Arc;

use avatar_skinning::format::decode_index_table;
use avatar_skinning::{
    ComputeSkinnedPrimitive, PrimitiveState, SkinningAttribute, SkinningError,
};
use common::{Fixture, GatedFixture, MeshShape, run_until, run_until_idle};

const SMALL: MeshShape = MeshShape::new(32, 2, 4, true);

#[test]
fn coalesced_requests_share_one_buffer() {
    let fixture = Fixture::new();
    let id = fixture.insert(1, SMALL);

    let primitives: Vec<ComputeSkinnedPrimitive> = (0..4)
        .map(|_| ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table))
        .collect();
    assert!(primitives.iter().all(ComputeSkinnedPrimitive::is_loading));
    assert!(fixture.pool.is_building(id));
    assert_eq!(fixture.pool.stats().builds_started, 1);

    fixture.run_until_idle();

    assert!(primitives.iter().all(ComputeSkinnedPrimitive::is_ready));
    let first = primitives[0].vertex_buffer().unwrap();
    for primitive in &primitives[1..] {
        assert!(Arc::ptr_eq(&first, &primitive.vertex_buffer().unwrap()));
    }
    assert_eq!(fixture.pool.retain_count(id), 4);
    assert_eq!(fixture.device.stats().buffers_created, 1);
    assert_eq!(fixture.source.loaded_count(id), 1);
    assert!(primitives.iter().all(ComputeSkinnedPrimitive::source_data_loaded));
    drop(first);

    let stats = fixture.pool.stats();
    assert_eq!((stats.builds_started, stats.builds_completed), (1, 1));
    assert_eq!(stats.live_buffers, 1);
}

#[test]
fn releasing_every_retain_frees_the_buffer_once() {
    let fixture = Fixture::new();
    let id = fixture.insert(2, SMALL);

    let mut primitives: Vec<ComputeSkinnedPrimitive> = (0..3)
        .map(|_| ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table))
        .collect();
    fixture.run_until_idle();
    assert_eq!(fixture.pool.retain_count(id), 3);

    primitives.pop();
    assert_eq!(fixture.pool.retain_count(id), 2);
    assert_eq!(fixture.device.stats().live_buffers(), 1);

    primitives.clear();
    let stats = fixture.device.stats();
    assert_eq!(stats.buffers_created, 1);
    assert_eq!(stats.buffers_created, stats.buffers_destroyed);
    assert_eq!(fixture.pool.retain_count(id), 0);
    assert!(fixture.pool.try_get_created_buffer(id).is_none());
    let pool_stats = fixture.pool.stats();
    assert_eq!(pool_stats.entries, 0);
    assert_eq!(pool_stats.buffers_freed, 1);
}

#[test]
fn late_requester_reuses_the_built_buffer() {
    let fixture = Fixture::new();
    let id = fixture.insert(3, SMALL);

    let first = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    fixture.run_until_idle();

    let second = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    assert!(second.is_ready());
    assert!(second.source_data_loaded());
    assert_eq!(fixture.pool.stats().builds_started, 1);
    assert_eq!(fixture.pool.retain_count(id), 2);

    let extra = first.retain_vertex_buffer().unwrap();
    assert_eq!(fixture.pool.retain_count(id), 3);
    drop(first);
    drop(second);
    assert_eq!(fixture.device.stats().live_buffers(), 1);
    drop(extra);
    assert_eq!(fixture.device.stats().live_buffers(), 0);
}

#[test]
fn rebuilds_after_full_release() {
    let fixture = Fixture::new();
    let id = fixture.insert(4, SMALL);

    let first = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    fixture.run_until_idle();
    drop(first);

    let again = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    assert!(again.is_loading());
    fixture.run_until_idle();
    assert!(again.is_ready());
    assert_eq!(fixture.pool.stats().builds_started, 2);
    assert_eq!(fixture.device.stats().buffers_created, 2);
}

#[test]
fn vertex_indices_cover_every_mesh_vertex() {
    let fixture = Fixture::new();
    let id = avatar_skinning::CompactSkinningDataId(5);
    // Six mesh vertices welded onto four compact vertices.
    let mesh = common::test_mesh(MeshShape::new(4, 0, 0, false))
        .with_inverse_reorder(vec![3, 0, 2, 0, 1, 3]);
    fixture.source.insert(id, &mesh);

    let primitive = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    fixture.run_until_idle();

    let indices = primitive.mesh_and_compact_skinning_indices().unwrap();
    assert_eq!(primitive.num_mesh_vertices(), Some(6));
    let pairs: Vec<(u32, u32)> = indices
        .iter()
        .map(|v| (v.compact_skinning_index, v.output_buffer_index))
        .collect();
    assert_eq!(pairs, vec![(0, 1), (0, 3), (1, 4), (2, 2), (3, 0), (3, 5)]);
}

#[test]
fn out_of_range_reorder_entry_fails_the_primitive() {
    let fixture = Fixture::new();
    let id = fixture.insert(6, MeshShape::new(8, 0, 0, false));

    let primitive = ComputeSkinnedPrimitive::new(&fixture.pool, id, |_: &[u8], _, count| {
        (0..count).map(|i| i + 100).collect()
    });
    fixture.run_until_idle();
    assert!(matches!(
        primitive.state(),
        PrimitiveState::Failed(SkinningError::BuildFailure(_))
    ));
    assert!(matches!(
        primitive.retain_vertex_buffer(),
        Err(SkinningError::BuildFailure(_))
    ));
}

#[test]
fn required_attribute_failure_fails_every_waiter() {
    let fixture = Fixture::new();
    let id = fixture.insert(7, SMALL);
    fixture
        .source
        .fail_attribute(id, SkinningAttribute::Normals, "corrupt stream");

    let a = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    let b = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    fixture.run_until_idle();

    for primitive in [&a, &b] {
        let error = primitive.error().unwrap();
        assert!(matches!(error, SkinningError::BuildFailure(_)));
        assert!(error.to_string().contains("corrupt stream"));
        assert!(!primitive.source_data_loaded());
    }
    assert_eq!(fixture.device.stats().buffers_created, 0);
    assert_eq!(fixture.pool.stats().builds_failed, 1);
    assert_eq!(fixture.source.loaded_count(id), 0);
}

#[test]
fn unknown_mesh_fails_the_build() {
    let fixture = Fixture::new();
    let primitive = ComputeSkinnedPrimitive::new(
        &fixture.pool,
        avatar_skinning::CompactSkinningDataId(404),
        decode_index_table,
    );
    fixture.run_until_idle();
    assert!(primitive.error().is_some());
    assert!(primitive.vertex_buffer().is_none());
}

#[test]
fn optional_attribute_failure_degrades() {
    let fixture = Fixture::new();
    let id = fixture.insert(8, SMALL);
    fixture
        .source
        .fail_attribute(id, SkinningAttribute::Tangents, "bad tangents");

    let primitive = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    fixture.run_until_idle();
    assert!(primitive.is_ready());
    assert!(!primitive.vertex_buffer().unwrap().has_tangents());
}

#[test]
fn cancel_mid_fetch_creates_nothing() {
    let fixture = GatedFixture::new();
    let id = fixture.insert(9, SMALL);

    let a = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    let b = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    fixture.source.wait_for_worker(&fixture.pool);

    assert!(fixture.pool.cancel_build(id));
    assert_eq!(a.error(), Some(SkinningError::Cancelled));
    assert_eq!(b.error(), Some(SkinningError::Cancelled));
    assert!(!fixture.pool.is_building(id));

    // The worker is still blocked; the builder has to wait for it.
    fixture.pool.update();
    assert_eq!(fixture.pool.pending_tasks(), 1);

    fixture.source.open();
    run_until_idle(&fixture.pool);

    assert_eq!(fixture.device.stats().buffers_created, 0);
    assert_eq!(fixture.source.inner().loaded_count(id), 0);
    assert!(!a.source_data_loaded());
    assert_eq!(fixture.pool.stats().builds_cancelled, 1);
    assert_eq!(fixture.pool.stats().entries, 0);
}

#[test]
fn dropping_the_last_waiter_cancels_the_build() {
    let fixture = GatedFixture::new();
    let id = fixture.insert(10, SMALL);

    let primitive = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    fixture.source.wait_for_worker(&fixture.pool);
    drop(primitive);
    assert!(!fixture.pool.is_building(id));
    assert_eq!(fixture.pool.stats().builds_cancelled, 1);

    fixture.source.open();
    run_until_idle(&fixture.pool);
    assert_eq!(fixture.device.stats().buffers_created, 0);
}

#[test]
fn dropping_one_of_two_waiters_keeps_building() {
    let fixture = GatedFixture::new();
    let id = fixture.insert(11, SMALL);

    let kept = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    let dropped = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    fixture.source.wait_for_worker(&fixture.pool);
    drop(dropped);
    assert!(fixture.pool.is_building(id));

    fixture.source.open();
    run_until(&fixture.pool, || !kept.is_loading());
    assert!(kept.is_ready());
    assert_eq!(fixture.pool.retain_count(id), 1);
}

#[test]
fn new_request_after_cancel_starts_a_fresh_build() {
    let fixture = GatedFixture::new();
    let id = fixture.insert(12, SMALL);

    let cancelled = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    fixture.source.wait_for_worker(&fixture.pool);
    fixture.pool.cancel_build(id);

    let fresh = ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table);
    assert!(fixture.pool.is_building(id));
    fixture.source.open();
    run_until_idle(&fixture.pool);

    assert_eq!(cancelled.error(), Some(SkinningError::Cancelled));
    assert!(fresh.is_ready());
    assert_eq!(fixture.pool.stats().builds_started, 2);
    assert_eq!(fixture.device.stats().buffers_created, 1);
}

#[test]
fn requests_racing_completion_share_one_build() {
    let fixture = Fixture::new();
    let ids: Vec<_> = (100..164).map(|i| fixture.insert(i, SMALL)).collect();

    let first: Vec<ComputeSkinnedPrimitive> = ids
        .iter()
        .map(|&id| ComputeSkinnedPrimitive::new(&fixture.pool, id, decode_index_table))
        .collect();
    assert_eq!(fixture.pool.stats().builds_started, ids.len() as u64);

    let late = std::thread::scope(|scope| {
        let requester = scope.spawn(|| {
            let mut late = Vec::new();
            for _ in 0..20 {
                for &id in &ids {
                    late.push(ComputeSkinnedPrimitive::new(
                        &fixture.pool,
                        id,
                        decode_index_table,
                    ));
                }
                std::thread::yield_now();
            }
            late
        });
        // Builds complete on this thread while the requester keeps asking.
        run_until(&fixture.pool, || requester.is_finished());
        requester.join().unwrap()
    });
    fixture.run_until_idle();

    let stats = fixture.pool.stats();
    assert_eq!(stats.builds_started, ids.len() as u64);
    assert_eq!(stats.builds_completed, ids.len() as u64);
    assert_eq!(fixture.device.stats().buffers_created, ids.len() as u64);
    for (i, primitive) in first.iter().enumerate() {
        let buffer = primitive.vertex_buffer().unwrap();
        for other in late.iter().skip(i).step_by(ids.len()) {
            assert!(Arc::ptr_eq(&buffer, &other.vertex_buffer().unwrap()));
        }
        assert_eq!(fixture.pool.retain_count(ids[i]), 21);
    }
}
