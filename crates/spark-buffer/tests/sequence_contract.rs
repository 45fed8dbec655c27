//! `sequence_contract` 集成测试：缓冲序列的访问、释放与并发交出语义。
//!
//! # 测试目标（Why）
//! - 同一下标只有第一个调用方借到原缓冲，其余调用方（包括其它线程）拿到按原始窗口复制的视图；
//! - 带池构造的序列恰好一次地归还缓冲，无论显式 `dispose` 还是直接丢弃；
//!
//! # 结构安排（How）
//! - 每个变体至少一个场景；检查型池用来观测归还次数与重复归还。

use std::{
    borrow::Cow,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use spark_buffer::{
    BufferKind, BufferManager, BufferSequence, ByteBuf, PoolRef, SegmentedBufferManager,
    buffers::{create_sequence, to_vec},
    error::codes,
    manager::CheckedBufferManager,
    sequence::{
        CompositeBufferSequence, DoubleBufferSequence, EmptyBufferSequence, MultiBufferSequence,
        SingleBufferSequence, TripleBufferSequence,
    },
};

fn checked_pool() -> Arc<CheckedBufferManager> {
    let inner = SegmentedBufferManager::builder(BufferKind::Heap)
        .base_buffer_size(16)
        .segment_count(2)
        .capacity(64 * 1024)
        .build()
        .expect("构造池");
    Arc::new(CheckedBufferManager::new(Arc::new(inner)))
}

/// 从池申请 `len` 字节的缓冲并以 `fill` 填满。
fn filled(pool: &dyn BufferManager, len: usize, fill: u8) -> ByteBuf {
    let mut buf = pool.acquire(len).expect("申请");
    buf.put_slice(&vec![fill; len]).expect("填充");
    buf.flip();
    buf
}

#[test]
fn double_captures_original_windows() {
    let checked = checked_pool();
    let pool: PoolRef = checked.clone();
    let a = filled(pool.as_ref(), 10, 0xA);
    let b = filled(pool.as_ref(), 5, 0xB);
    let (a_window, b_window) = ((a.position(), a.limit()), (b.position(), b.limit()));

    let mut seq = DoubleBufferSequence::new(Some(Arc::clone(&pool)), a, b);
    assert_eq!(seq.length(), 15);
    assert_eq!(seq.buffer_count(), 2);

    let first = seq.buffer(0).expect("首次访问");
    assert!(matches!(first, Cow::Borrowed(_)));
    assert_eq!((first.position(), first.limit()), a_window);

    let mut again = seq.buffer(0).expect("再次访问").into_owned();
    again.set_position(again.limit()).expect("消费复制视图");
    let third = seq.buffer(0).expect("第三次访问");
    assert!(matches!(third, Cow::Owned(_)));
    assert_eq!((third.position(), third.limit()), a_window);

    assert_eq!(seq.buffer_length(1).expect("长度"), b_window.1 - b_window.0);
    assert_eq!(to_vec(&seq).expect("读出"), [vec![0xA; 10], vec![0xB; 5]].concat());

    seq.dispose().expect("释放");
    assert_eq!(checked.outstanding(), 0);
}

#[test]
fn only_one_thread_receives_the_original() {
    let seq = SingleBufferSequence::new(None, ByteBuf::wrap(vec![1; 64]));
    let borrowed = AtomicUsize::new(0);
    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let view = seq.buffer(0).expect("访问");
                assert_eq!(view.remaining(), 64);
                if matches!(view, Cow::Borrowed(_)) {
                    borrowed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });
    assert_eq!(borrowed.load(Ordering::Relaxed), 1);
}

#[test]
fn triple_hands_out_each_index_independently() {
    let seq = TripleBufferSequence::new(
        None,
        ByteBuf::wrap(vec![1]),
        ByteBuf::wrap(vec![2, 2]),
        ByteBuf::wrap(vec![3, 3, 3]),
    );
    assert!(matches!(seq.buffer(2).expect("下标 2"), Cow::Borrowed(_)));
    assert!(matches!(seq.buffer(0).expect("下标 0"), Cow::Borrowed(_)));
    assert!(matches!(seq.buffer(2).expect("下标 2"), Cow::Owned(_)));
    assert_eq!(seq.length(), 6);
    assert_eq!(seq.buffer(3).expect_err("越界").code(), codes::BOUNDS);
}

#[test]
fn dispose_twice_reports_already_disposed() {
    let checked = checked_pool();
    let pool: PoolRef = checked.clone();
    let buffers = vec![
        filled(pool.as_ref(), 8, 1),
        filled(pool.as_ref(), 8, 2),
        filled(pool.as_ref(), 8, 3),
        filled(pool.as_ref(), 8, 4),
    ];
    let mut seq = MultiBufferSequence::new(Some(pool), buffers);
    seq.dispose().expect("首次释放");
    assert_eq!(checked.outstanding(), 0);

    let err = seq.dispose().expect_err("重复释放");
    assert_eq!(err.code(), codes::DISPOSED);
    assert!(seq.is_disposed());
    assert_eq!(seq.length(), 32);
    assert_eq!(seq.buffer(0).expect_err("已释放").code(), codes::DISPOSED);
}

#[test]
fn dropped_sequences_release_their_buffers() {
    let checked = checked_pool();
    let pool: PoolRef = checked.clone();
    {
        let _single = create_sequence(Some(Arc::clone(&pool)), vec![filled(pool.as_ref(), 4, 1)]);
        let _double = create_sequence(
            Some(Arc::clone(&pool)),
            vec![filled(pool.as_ref(), 4, 1), filled(pool.as_ref(), 4, 2)],
        );
        let _multi = create_sequence(
            Some(Arc::clone(&pool)),
            (0..5).map(|i| filled(pool.as_ref(), 4, i)).collect(),
        );
        assert_eq!(checked.outstanding(), 8);
    }
    assert_eq!(checked.outstanding(), 0);
}

#[test]
fn unowned_sequences_leave_buffers_alone() {
    let pool = checked_pool();
    let buf = filled(pool.as_ref(), 8, 7);
    let mut seq = SingleBufferSequence::new(None, buf.duplicate());
    seq.dispose().expect("释放视图序列");
    assert_eq!(pool.outstanding(), 1);
    pool.release(buf).expect("调用方自行归还");
}

#[test]
fn multi_window_exposes_only_its_range() {
    let mut buffers: Vec<ByteBuf> =
        (1..=6u8).map(|i| ByteBuf::wrap(vec![i; i as usize])).collect();
    let seq = MultiBufferSequence::with_window(None, &mut buffers, 2, 3).expect("窗口");
    let rest: Vec<usize> = buffers.iter().map(ByteBuf::remaining).collect();
    assert_eq!(rest, vec![1, 2, 6]);
    assert_eq!(seq.buffer_count(), 3);
    assert_eq!(seq.length(), 3 + 4 + 5);
    assert_eq!(seq.buffer(0).expect("窗口首个").to_vec(), vec![3; 3]);
    assert_eq!(seq.buffer(3).expect_err("窗口外").code(), codes::BOUNDS);
}

#[test]
fn bulk_access_fills_destination_slots() {
    let seq = MultiBufferSequence::new(
        None,
        (0..4u8).map(|i| ByteBuf::wrap(vec![i; 2])).collect(),
    );
    let mut dest: Vec<Option<Cow<'_, ByteBuf>>> = vec![None; 5];
    seq.buffers_into(1, 3, &mut dest, 2).expect("批量访问");
    assert!(dest[..2].iter().all(Option::is_none));
    let firsts: Vec<u8> = dest[2..]
        .iter()
        .map(|slot| slot.as_ref().expect("已填充").to_vec()[0])
        .collect();
    assert_eq!(firsts, vec![1, 2, 3]);

    let err = seq.buffers_into(2, 3, &mut dest, 0).expect_err("源越界");
    assert_eq!(err.code(), codes::BOUNDS);
}

#[test]
fn composite_chains_two_pooled_halves() {
    let checked = checked_pool();
    let pool: PoolRef = checked.clone();
    let left = create_sequence(Some(Arc::clone(&pool)), vec![filled(pool.as_ref(), 3, 1)]);
    let right = create_sequence(
        Some(Arc::clone(&pool)),
        vec![filled(pool.as_ref(), 2, 2), filled(pool.as_ref(), 1, 3)],
    );
    let mut seq = CompositeBufferSequence::new(left, right);
    assert_eq!(seq.length(), 6);
    assert_eq!(seq.buffer_count(), 3);
    assert_eq!(seq.buffer_length(2).expect("右半第二个"), 1);
    assert_eq!(to_vec(&seq).expect("读出"), vec![1, 1, 1, 2, 2, 3]);
    seq.dispose().expect("释放");
    assert_eq!(checked.outstanding(), 0);
}

#[test]
fn empty_sequence_is_stateless() {
    let mut seq = EmptyBufferSequence;
    assert_eq!((seq.length(), seq.buffer_count()), (0, 0));
    assert!(seq.buffers().expect("空列表").is_empty());
    seq.dispose().expect("释放");
    seq.dispose().expect("空序列可以反复释放");
    assert!(!seq.is_disposed());
    assert_eq!(seq.unsafe_buffer(0).expect_err("无缓冲").code(), codes::BOUNDS);
}
