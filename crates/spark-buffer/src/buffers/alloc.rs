//! 从池构造序列的两种分配策略。
//!
//! # 策略概览（How）
//! - [`allocate_direct`]：为单个大序列分块申请原生缓冲，分配失败时折半块尺寸退避；
//! - [`allocate`]：批量构造等长的小序列，池授予的缓冲明显大于请求时，把剩余空间
//!   以共享 slab 的形式切给后续序列，slab 在最后一个切片序列释放后才归还给池。

use std::sync::Arc;

use tracing::debug;

use crate::{
    buf::{ByteBuf, DIRECT_ALIGN},
    error::{BufferError, Result},
    manager::PoolRef,
    sequence::{
        BoxedSequence, BufferOwner, BufferSequence, CompositeBufferSequence, MultiBufferSequence,
        SingleBufferSequence, SlabLease,
    },
};

use super::empty_direct_buffer;

/// 单块尺寸上限：对齐到 8 字节的最大 `i32`。
const MAX_ALIGNED_CHUNK: u64 = i32::MAX as u64 - 7;

/// 首块之后的块至少申请这么多字节。
const MIN_FOLLOW_UP_CHUNK: u64 = 1 << 20;

/// 块尺寸退避到该值以下仍失败时放弃。
const GIVE_UP_CHUNK: u64 = 1024;

/// 构造恰好 `cb` 字节的原生缓冲序列。
///
/// # 契约说明（What）
/// - `pool` 为 `None` 时直接分配原生缓冲，序列不归属任何池；
/// - 除最后一块外，每块长度都是 8 的倍数；块分配失败时把尺寸折半（向上对齐到 8）后重试，
///   尺寸不大于 1024 仍失败则归还已取得的缓冲并返回该错误；
/// - 池授予非原生缓冲时归还全部缓冲并返回参数错误；
/// - 最后一块经 `pool.truncate` 收缩；`cb == 0` 得到包裹空原生缓冲的 Single 序列。
pub fn allocate_direct(pool: Option<&PoolRef>, cb: u64) -> Result<BoxedSequence> {
    if cb == 0 {
        return Ok(Box::new(SingleBufferSequence::new(None, empty_direct_buffer())));
    }

    let mut chunks = Chunks {
        pool,
        buffers: Vec::new(),
    };
    let mut attempt = cb.min(MAX_ALIGNED_CHUNK);
    let mut filled = 0u64;
    while filled < cb {
        match chunks.acquire(attempt as usize) {
            Ok(mut buffer) => {
                if pool.is_some() {
                    if !buffer.is_direct() {
                        chunks.buffers.push(buffer);
                        chunks.release_all();
                        return Err(BufferError::argument(
                            "buffer manager must supply direct buffers",
                        ));
                    }
                    if filled + (buffer.remaining() as u64) < cb {
                        if let Err(err) = fit_intermediate(&mut buffer, cb - filled) {
                            chunks.buffers.push(buffer);
                            chunks.release_all();
                            return Err(err);
                        }
                    }
                }
                let granted = buffer.remaining() as u64;
                filled += granted;
                attempt = granted.max(MIN_FOLLOW_UP_CHUNK).min(cb - filled);
                chunks.buffers.push(buffer);
            }
            Err(err) if err.is_allocation_failure() && attempt > GIVE_UP_CHUNK => {
                let halved = (attempt / 2).next_multiple_of(DIRECT_ALIGN as u64);
                debug!(
                    requested = attempt,
                    retry = halved,
                    filled,
                    total = cb,
                    "direct chunk allocation failed; halving chunk size"
                );
                attempt = halved;
            }
            Err(err) => {
                chunks.release_all();
                return Err(err);
            }
        }
    }

    let mut buffers = std::mem::take(&mut chunks.buffers);
    if let (Some(pool), Some(last)) = (pool, buffers.pop()) {
        match pool.truncate(last) {
            Ok(truncated) => buffers.push(truncated),
            Err(err) => {
                chunks.buffers = buffers;
                chunks.release_all();
                return Err(err);
            }
        }
    }
    let owner = BufferOwner::from_pool(pool.cloned());
    Ok(if buffers.len() == 1 {
        super::sequence_with_owner(owner, buffers)
    } else {
        Box::new(MultiBufferSequence::with_owner(owner, buffers))
    })
}

/// 非末块：取用授予缓冲的全部空间（不超过仍需的字节数），再向下对齐到 8。
fn fit_intermediate(buffer: &mut ByteBuf, needed: u64) -> Result<()> {
    let available = (buffer.capacity() - buffer.position()) as u64;
    let extended = available.min(needed);
    let len = if extended == needed {
        extended
    } else {
        extended - extended % DIRECT_ALIGN as u64
    };
    if len == 0 {
        return Err(BufferError::argument(
            "buffer manager granted a chunk smaller than the direct alignment",
        ));
    }
    buffer.set_limit(buffer.position() + len as usize)
}

/// `allocate_direct` 已取得的块；失败路径统一归还。
struct Chunks<'a> {
    pool: Option<&'a PoolRef>,
    buffers: Vec<ByteBuf>,
}

impl Chunks<'_> {
    fn acquire(&self, len: usize) -> Result<ByteBuf> {
        match self.pool {
            Some(pool) => pool.acquire_pref(len),
            None => ByteBuf::allocate_direct(len),
        }
    }

    fn release_all(&mut self) {
        let Some(pool) = self.pool else {
            self.buffers.clear();
            return;
        };
        for buffer in self.buffers.drain(..) {
            if let Err(err) = pool.release(buffer) {
                debug!(error = %err, "releasing chunk after failed direct allocation");
            }
        }
    }
}

/// 批量构造 `seq_count` 个各含 `cb` 字节的序列，逐个交给 `collector`，返回交出的序列个数。
///
/// # 契约说明（What）
/// - 每个序列至多由 `max_buffers_per_seq` 个缓冲组成，多个缓冲之间以 Composite 串接；
///   序列的最后一个缓冲用 `acquire` 申请（必须满足），之前的用 `acquire_pref`；
/// - 授予缓冲的容量比请求多出 `cb / 64` 以上时，该缓冲成为共享 slab，
///   后续序列从中切取不归属池的切片，slab 在引用计数归零时归还给池；
/// - 请求的序列都构造完后，只要当前 slab 还能装下一个完整的 `cb`，就继续多构造序列；
/// - `seq_count == 0` 返回 0；`cb == 0` 或 `max_buffers_per_seq == 0` 返回参数错误；
/// - 失败时已交给 `collector` 的序列保持有效，半成品序列被释放。
pub fn allocate<C>(
    pool: &PoolRef,
    collector: &mut C,
    seq_count: usize,
    cb: usize,
    max_buffers_per_seq: usize,
) -> Result<usize>
where
    C: Extend<BoxedSequence>,
{
    if seq_count == 0 {
        return Ok(0);
    }
    if max_buffers_per_seq == 0 {
        return Err(BufferError::argument("max_buffers_per_seq must be > 0"));
    }
    if cb == 0 {
        return Err(BufferError::argument("cb must be > 0"));
    }

    let mut batch = Batch {
        pool,
        cb,
        max_buffers: max_buffers_per_seq,
        waste: cb / 64,
        slab: None,
        partial: None,
    };
    let outcome = batch.run(collector, seq_count);
    let cleanup = batch.finish();
    let produced = outcome?;
    cleanup?;
    Ok(produced)
}

struct Batch<'a> {
    pool: &'a PoolRef,
    cb: usize,
    max_buffers: usize,
    waste: usize,
    slab: Option<Slab>,
    partial: Option<BoxedSequence>,
}

/// 正在切分的共享缓冲：`cursor` 的 `[position, limit)` 是下一个切片。
///
/// 游标只向前推进，切出的区间两两不相交，每个切片都能独立写入。
struct Slab {
    lease: Arc<SlabLease>,
    cursor: ByteBuf,
}

impl Slab {
    fn available(&self) -> usize {
        self.cursor.capacity() - self.cursor.position()
    }

    fn carve(&mut self) -> Result<BoxedSequence> {
        self.lease.acquire_ref()?;
        let piece = self
            .cursor
            .claim_range(self.cursor.position(), self.cursor.remaining())?;
        let end = self.cursor.limit();
        self.cursor.set_limit(self.cursor.capacity())?;
        self.cursor.set_position(end)?;
        Ok(Box::new(SingleBufferSequence::with_owner(
            BufferOwner::Slab(Arc::clone(&self.lease)),
            piece,
        )))
    }
}

impl Batch<'_> {
    fn run<C: Extend<BoxedSequence>>(&mut self, collector: &mut C, seq_count: usize) -> Result<usize> {
        let mut produced = 0;
        while produced < seq_count || self.slab.as_ref().is_some_and(|s| s.available() >= self.cb) {
            let mut requested = self.cb;
            let mut buffer_index = 0;
            while requested > 0 && buffer_index < self.max_buffers {
                let last = buffer_index + 1 == self.max_buffers;
                if last && self.slab.as_ref().is_some_and(|s| s.available() < requested) {
                    self.drop_slab()?;
                }
                let piece = self.next_piece(requested, last)?;
                requested = requested.saturating_sub(piece.length() as usize);
                self.partial = Some(match self.partial.take() {
                    None => piece,
                    Some(prefix) => Box::new(CompositeBufferSequence::new(prefix, piece)),
                });
                buffer_index += 1;
            }
            if let Some(sequence) = self.partial.take() {
                collector.extend(std::iter::once(sequence));
                produced += 1;
            }
        }
        Ok(produced)
    }

    fn next_piece(&mut self, requested: usize, last: bool) -> Result<BoxedSequence> {
        if let Some(slab) = self.slab.as_mut() {
            let limit = slab.cursor.capacity().min(slab.cursor.position() + requested);
            slab.cursor.set_limit(limit)?;
        } else {
            let buffer = if last {
                self.pool.acquire(requested)?
            } else {
                self.pool.acquire_pref(requested)?
            };
            if buffer.capacity().saturating_sub(requested) <= self.waste {
                return Ok(Box::new(SingleBufferSequence::new(
                    Some(Arc::clone(self.pool)),
                    buffer,
                )));
            }
            let cursor = buffer.duplicate();
            self.slab = Some(Slab {
                lease: Arc::new(SlabLease::new(Arc::clone(self.pool), buffer)),
                cursor,
            });
        }

        let Some(slab) = self.slab.as_mut() else {
            return Err(BufferError::state("shared slab vanished during allocation"));
        };
        let piece = slab.carve()?;
        if slab.available() == 0 || (self.max_buffers == 1 && slab.available() < self.cb) {
            self.drop_slab()?;
        }
        Ok(piece)
    }

    /// 放弃当前 slab，释放分配过程持有的引用。
    fn drop_slab(&mut self) -> Result<()> {
        match self.slab.take() {
            Some(Slab { lease, cursor }) => {
                drop(cursor);
                lease.release_ref()
            }
            None => Ok(()),
        }
    }

    fn finish(&mut self) -> Result<()> {
        let slab = self.drop_slab();
        if let Some(mut partial) = self.partial.take() {
            partial.dispose()?;
        }
        slab
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buf::BufferKind,
        manager::{BufferManager, SegmentedBufferManager},
    };

    fn pool(kind: BufferKind, base: usize, segments: usize) -> PoolRef {
        Arc::new(
            SegmentedBufferManager::builder(kind)
                .base_buffer_size(base)
                .segment_count(segments)
                .capacity(1 << 20)
                .build()
                .expect("构造池"),
        )
    }

    #[test]
    fn zero_bytes_yield_empty_direct_single() {
        let sequence = allocate_direct(None, 0).expect("零字节");
        assert_eq!(sequence.length(), 0);
        assert_eq!(sequence.buffer_count(), 1);
        assert!(sequence.unsafe_buffer(0).expect("缓冲").is_direct());
    }

    #[test]
    fn pooled_chunks_are_aligned() {
        let pool = pool(BufferKind::Direct, 100, 1);
        let sequence = allocate_direct(Some(&pool), 250).expect("分块分配");
        assert_eq!(sequence.length(), 250);
        let count = sequence.buffer_count();
        for index in 0..count - 1 {
            assert_eq!(sequence.buffer_length(index).expect("块长度") % 8, 0);
        }
    }

    #[test]
    fn heap_pool_is_rejected() {
        let pool = pool(BufferKind::Heap, 64, 2);
        let err = allocate_direct(Some(&pool), 32).expect_err("堆池");
        assert_eq!(err.code(), crate::error::codes::ARGUMENT);
        assert_eq!(pool.statistics().outstanding, 0);
    }

    #[test]
    fn batch_shares_oversized_buffers() {
        let pool = pool(BufferKind::Heap, 1024, 1);
        let mut sequences: Vec<BoxedSequence> = Vec::new();
        let produced = allocate(&pool, &mut sequences, 3, 100, 1).expect("批量分配");
        assert_eq!(produced, 10);
        assert_eq!(sequences.len(), 10);
        assert!(sequences.iter().all(|s| s.length() == 100));
        assert_eq!(pool.statistics().acquisitions, 1);

        for mut sequence in sequences {
            assert_eq!(pool.statistics().releases, 0);
            sequence.dispose().expect("释放切片");
        }
        assert_eq!(pool.statistics().releases, 1);
    }

    #[test]
    fn slab_pieces_are_filled_in_place() {
        let pool = pool(BufferKind::Heap, 1024, 1);
        let mut sequences: Vec<BoxedSequence> = Vec::new();
        allocate(&pool, &mut sequences, 2, 100, 1).expect("批量分配");
        for (fill, sequence) in sequences.iter_mut().enumerate() {
            let piece = sequence.unsafe_buffer_mut(0).expect("切片");
            piece.put_slice(&[fill as u8; 100]).expect("切片独占自己的区间");
            piece.rewind();
        }
        assert_eq!(sequences[1].buffer(0).expect("读取").to_vec(), vec![1; 100]);

        let twin = sequences[0].buffer(0).expect("首次访问").into_owned();
        let err = sequences[0]
            .unsafe_buffer_mut(0)
            .expect("切片")
            .put_u8_at(0, 7)
            .expect_err("复制视图存活时不可写");
        assert_eq!(err.code(), crate::error::codes::SHARED);
        drop(twin);

        drop(sequences);
        let stats = pool.statistics();
        assert_eq!((stats.releases, stats.cached_bytes), (1, 1024));
    }

    #[test]
    fn batch_rejects_bad_arguments() {
        let pool = pool(BufferKind::Heap, 64, 1);
        let mut sink: Vec<BoxedSequence> = Vec::new();
        assert_eq!(allocate(&pool, &mut sink, 0, 0, 0).expect("零个序列"), 0);
        assert!(allocate(&pool, &mut sink, 1, 0, 1).is_err());
        assert!(allocate(&pool, &mut sink, 1, 8, 0).is_err());
    }
}
