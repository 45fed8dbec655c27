//! `manager_contract` 集成测试：从 crate 公开 API 验证缓冲池契约。
//!
//! # 测试目标（Why）
//! - `acquire`/`acquire_pref`/`acquire_sum`/`truncate`/`release` 五个入口的尺寸承诺是序列与写出流的前提；
//! - 检查型包装与不可释放包装的拒绝行为要在误用发生的那一刻体现；
//!
//! # 结构安排（How）
//! - 前半部分覆盖分段池的尺寸与复用；后半部分覆盖包装器、单例池与并发归还。

use std::{sync::Arc, thread};

use spark_buffer::{
    BufferKind, BufferManager, PoolRef, SegmentedBufferManager,
    error::{ErrorKind, codes},
    manager::{CheckedBufferManager, ImmortalBufferManager, heap, memory_ceiling, network},
};

fn segmented(base: usize, segments: usize) -> SegmentedBufferManager {
    SegmentedBufferManager::builder(BufferKind::Heap)
        .base_buffer_size(base)
        .segment_count(segments)
        .capacity(1 << 20)
        .build()
        .expect("构造分段池")
}

#[test]
fn acquire_grants_exact_remaining_from_best_segment() {
    let pool = segmented(64, 4);
    let buf = pool.acquire(100).expect("申请 100 字节");
    assert_eq!(buf.remaining(), 100);
    assert_eq!(buf.capacity(), 128);
    pool.release(buf).expect("归还");
}

#[test]
fn acquire_pref_never_exceeds_preference() {
    let pool = segmented(64, 4);
    for pref in [1, 63, 64, 65, 511, 512, 4096] {
        let buf = pool.acquire_pref(pref).expect("按偏好申请");
        assert!(buf.remaining() <= pref, "pref={pref} remaining={}", buf.remaining());
        assert!(buf.remaining() > 0);
        pool.release(buf).expect("归还");
    }
}

#[test]
fn acquire_beyond_largest_segment_fails_with_allocation_error() {
    let pool = segmented(64, 2);
    let err = pool.acquire(129).expect_err("超过最大分段");
    assert_eq!(err.kind(), ErrorKind::Allocation);
    assert!(err.is_allocation_failure());
    assert_eq!(pool.statistics().failed_acquisitions, 1);
}

#[test]
fn released_buffers_are_reused() {
    let pool = segmented(64, 1);
    let first = pool.acquire(64).expect("首次申请");
    pool.release(first).expect("归还");
    let second = pool.acquire(32).expect("再次申请");
    assert_eq!(second.remaining(), 32);
    let stats = pool.statistics();
    assert_eq!(stats.acquisitions, 2);
    assert_eq!(stats.pool_hits, 1);
    assert_eq!(stats.outstanding, 1);
    pool.release(second).expect("归还");
    assert_eq!(pool.statistics().outstanding, 0);
}

#[test]
fn truncate_moves_small_payload_into_smaller_segment() {
    let pool = segmented(64, 4);
    let mut buf = pool.acquire(512).expect("申请");
    buf.put_slice(b"truncate me").expect("写入");
    buf.flip();

    let truncated = pool.truncate(buf).expect("收缩");
    assert_eq!(truncated.capacity(), 64);
    assert_eq!(truncated.to_vec(), b"truncate me");
    assert_eq!(pool.statistics().outstanding, 1);
    pool.release(truncated).expect("归还");
}

#[test]
fn truncate_keeps_buffer_when_payload_needs_its_segment() {
    let pool = segmented(64, 4);
    let mut buf = pool.acquire(512).expect("申请");
    buf.put_slice(&[9; 300]).expect("写入");
    buf.flip();
    let kept = pool.truncate(buf).expect("收缩");
    assert_eq!((kept.capacity(), kept.remaining()), (512, 300));
    pool.release(kept).expect("归还");
}

#[test]
fn foreign_buffer_release_is_rejected() {
    let a = segmented(64, 1);
    let b = segmented(64, 1);
    let buf = a.acquire(8).expect("申请");
    let err = b.release(buf).expect_err("外来缓冲");
    assert_eq!(err.code(), codes::FOREIGN);
}

#[test]
fn zero_on_release_scrubs_recycled_buffers() {
    let pool = SegmentedBufferManager::builder(BufferKind::Heap)
        .base_buffer_size(32)
        .segment_count(1)
        .capacity(1024)
        .zero_on_release(true)
        .build()
        .expect("构造池");
    let mut buf = pool.acquire(32).expect("申请");
    buf.put_slice(&[0xAB; 32]).expect("写满");
    pool.release(buf).expect("归还");

    let reused = pool.acquire(32).expect("复用");
    assert_eq!(reused.to_vec(), vec![0u8; 32]);
}

#[test]
fn invalid_builder_parameters_are_rejected() {
    for (base, segments) in [(0, 4), (64, 0), (64, 33), (usize::MAX / 2, 8)] {
        let err = SegmentedBufferManager::builder(BufferKind::Direct)
            .base_buffer_size(base)
            .segment_count(segments)
            .build()
            .expect_err("非法参数");
        assert_eq!(err.kind(), ErrorKind::Argument);
    }
}

#[test]
fn checked_manager_rejects_double_release_and_slices() {
    let inner: PoolRef = Arc::new(segmented(64, 2));
    let checked = CheckedBufferManager::new(inner);

    let buf = checked.acquire(16).expect("申请");
    let alias = buf.duplicate();
    checked.release(buf).expect("首次归还");
    let err = checked.release(alias).expect_err("重复归还");
    assert_eq!(err.code(), codes::FOREIGN);

    let whole = checked.acquire(16).expect("申请");
    let slice = whole.slice_range(0, 4).expect("切片");
    assert_eq!(checked.release(slice).expect_err("切片归还").code(), codes::FOREIGN);
    assert_eq!(checked.outstanding(), 1);
    checked.release(whole).expect("归还完整缓冲");
    assert_eq!(checked.outstanding(), 0);
}

#[test]
fn checked_manager_tracks_truncate_replacements() {
    let inner: PoolRef = Arc::new(segmented(64, 4));
    let checked = CheckedBufferManager::new(inner);
    let mut buf = checked.acquire(512).expect("申请");
    buf.put_slice(&[1, 2, 3]).expect("写入");
    buf.flip();
    let truncated = checked.truncate(buf).expect("收缩");
    assert_eq!(checked.outstanding(), 1);
    checked.release(truncated).expect("归还替换缓冲");
    assert_eq!(checked.outstanding(), 0);
}

#[test]
fn immortal_manager_refuses_dispose() {
    let immortal = ImmortalBufferManager::new(Arc::new(segmented(64, 1)));
    let buf = immortal.acquire(8).expect("转发申请");
    immortal.release(buf).expect("转发归还");
    assert_eq!(immortal.dispose().expect_err("不可释放").kind(), ErrorKind::State);
}

#[test]
fn process_wide_managers_are_singletons() {
    let a = heap();
    let b = heap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(heap().dispose().is_err());

    let net = network();
    let buf = net.acquire(1500).expect("网络池申请");
    assert!(buf.is_direct());
    net.release(buf).expect("归还");
    assert!(memory_ceiling() > 0);
}

#[test]
fn concurrent_acquire_release_balances_outstanding() {
    let pool: PoolRef = Arc::new(segmented(64, 3));
    thread::scope(|scope| {
        for worker in 0..4usize {
            let pool = Arc::clone(&pool);
            scope.spawn(move || {
                for round in 0..200usize {
                    let size = 1 + (worker * 37 + round * 11) % 256;
                    let buf = pool.acquire(size).expect("并发申请");
                    assert_eq!(buf.remaining(), size);
                    pool.release(buf).expect("并发归还");
                }
            });
        }
    });
    let stats = pool.statistics();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.acquisitions, 800);
}
