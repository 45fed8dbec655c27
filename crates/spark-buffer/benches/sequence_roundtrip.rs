use std::{env, hint::black_box, sync::Arc, time::Duration};

use criterion::{BenchmarkId, Criterion, Throughput};
use spark_buffer::{
    BoxedSequence, BufferKind, BufferManager, BufferSequenceInputStream,
    BufferSequenceOutputStream, PoolRef, SegmentedBufferManager,
    buffers::{allocate, equals},
};

/// 写出流到读取流的往返成本：写入 `len` 字节、冻结为序列、顺序读回并释放。
///
/// # 设计背景（Why）
/// - 写出流的换缓冲与读取流的跨缓冲读取是序列热路径上最常见的两个动作，
///   以此检测池复用、翻转与 `truncate` 的回归；
/// - 池在基准开始前预热，循环内的申请全部命中空闲栈。
fn bench_stream_roundtrip(c: &mut Criterion) {
    let pool = pool();
    let mut group = c.benchmark_group("stream_roundtrip");
    for len in [256usize, 4 * 1024, 64 * 1024] {
        let payload = vec![0x5Au8; len];
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &payload, |b, payload| {
            let mut sink = vec![0u8; payload.len()];
            b.iter(|| {
                let mut out = BufferSequenceOutputStream::with_size_hint(Arc::clone(&pool), len as u64);
                out.write(payload).unwrap();
                let seq = out.to_buffer_sequence().unwrap();
                let mut input = BufferSequenceInputStream::new(seq, true);
                input.read_fully(&mut sink).unwrap();
                black_box(&sink);
            });
        });
    }
    group.finish();
}

/// 批量分配小序列：slab 分摊后每个序列的构造与释放成本。
fn bench_batch_allocate(c: &mut Criterion) {
    let pool = pool();
    c.bench_function("allocate_64x100", |b| {
        let mut out: Vec<BoxedSequence> = Vec::with_capacity(128);
        b.iter(|| {
            allocate(&pool, &mut out, 64, 100, 2).unwrap();
            out.clear();
        });
    });
}

/// 长度相同、切分不同的两个序列的逐字节比较。
fn bench_equals(c: &mut Criterion) {
    let pool = pool();
    let mut left = BufferSequenceOutputStream::new(Arc::clone(&pool));
    let mut right = BufferSequenceOutputStream::with_size_hint(Arc::clone(&pool), 16 * 1024);
    let payload = vec![7u8; 16 * 1024];
    left.write(&payload).unwrap();
    right.write(&payload).unwrap();
    let left = left.to_buffer_sequence().unwrap();
    let right = right.to_buffer_sequence().unwrap();
    c.bench_function("equals_16k", |b| {
        b.iter(|| black_box(equals(left.as_ref(), right.as_ref()).unwrap()));
    });
}

fn pool() -> PoolRef {
    let pool: PoolRef = Arc::new(
        SegmentedBufferManager::builder(BufferKind::Heap)
            .name("bench")
            .base_buffer_size(256)
            .segment_count(9)
            .capacity(64 << 20)
            .build()
            .unwrap(),
    );
    let warm: Vec<_> = (0..64).map(|_| pool.acquire_sum(64 * 1024).unwrap()).collect();
    for buf in warm {
        pool.release(buf).unwrap();
    }
    pool
}

fn main() {
    let quick_mode = env::args().skip(1).any(|arg| arg == "--quick");

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_stream_roundtrip(&mut criterion);
    bench_batch_allocate(&mut criterion);
    bench_equals(&mut criterion);
    criterion.final_summary();
}
