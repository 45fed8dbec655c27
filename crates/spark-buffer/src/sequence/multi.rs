use std::{borrow::Cow, fmt};

use super::{
    BufferOwner, BufferSequence, Disposal, index_out_of_bounds, release_dropped, total_length,
    track_dispose_location,
};
use crate::{
    buf::ByteBuf,
    error::{BufferError, Result},
    manager::PoolRef,
    sync::{AtomicUsize, Ordering},
};

/// 任意个缓冲的序列。
///
/// # 设计要点（How）
/// - [`with_window`](Self::with_window) 从调用方向量中取走 `[offset, offset + count)` 一段，
///   只移动缓冲视图、不复制字节；窗口之外的缓冲留在调用方向量中，仍由调用方负责；
/// - 原缓冲交出标记是一个单调递增的计数器：调用方按不减的下标顺序访问缓冲，
///   只有下标恰好等于计数器且 CAS 成功推进计数器的调用方拿到原缓冲。
///
/// # 取舍（Trade-offs）
/// - 乱序访问不会出错，只会让本可借出原件的访问退化为复制视图。
pub struct MultiBufferSequence {
    owner: BufferOwner,
    buffers: Vec<ByteBuf>,
    length: u64,
    next_original: AtomicUsize,
    disposal: Disposal,
}

impl MultiBufferSequence {
    /// 以整个向量构造序列。
    pub fn new(pool: Option<PoolRef>, buffers: Vec<ByteBuf>) -> Self {
        Self::with_owner(BufferOwner::from_pool(pool), buffers)
    }

    /// 取走 `buffers[offset .. offset + count]` 构造序列，其余缓冲按原顺序留在 `buffers` 中。
    ///
    /// 窗口越界时返回参数错误，`buffers` 保持不变。
    pub fn with_window(
        pool: Option<PoolRef>,
        buffers: &mut Vec<ByteBuf>,
        offset: usize,
        count: usize,
    ) -> Result<Self> {
        match offset.checked_add(count) {
            Some(end) if end <= buffers.len() => Ok(Self::with_owner(
                BufferOwner::from_pool(pool),
                buffers.drain(offset..end).collect(),
            )),
            _ => Err(BufferError::argument(format!(
                "window [{offset}, +{count}) outside vector of {} buffers",
                buffers.len()
            ))),
        }
    }

    pub(crate) fn with_owner(owner: BufferOwner, buffers: Vec<ByteBuf>) -> Self {
        Self {
            owner,
            length: total_length(&buffers),
            buffers,
            next_original: AtomicUsize::new(0),
            disposal: Disposal::default(),
        }
    }

    fn stored(&self, index: usize) -> Result<&ByteBuf> {
        self.disposal.ensure_live()?;
        self.buffers
            .get(index)
            .ok_or_else(|| index_out_of_bounds(index, self.buffers.len()))
    }
}

impl BufferSequence for MultiBufferSequence {
    fn length(&self) -> u64 {
        self.length
    }

    fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn buffer(&self, index: usize) -> Result<Cow<'_, ByteBuf>> {
        let buffer = self.stored(index)?;
        let first = self.next_original.load(Ordering::Acquire) == index
            && self
                .next_original
                .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        Ok(if first {
            Cow::Borrowed(buffer)
        } else {
            Cow::Owned(buffer.duplicate())
        })
    }

    fn unsafe_buffer(&self, index: usize) -> Result<&ByteBuf> {
        self.stored(index)
    }

    fn unsafe_buffer_mut(&mut self, index: usize) -> Result<&mut ByteBuf> {
        self.disposal.ensure_live()?;
        let count = self.buffers.len();
        self.buffers
            .get_mut(index)
            .ok_or_else(|| index_out_of_bounds(index, count))
    }

    fn dispose(&mut self) -> Result<()> {
        self.disposal.mark(track_dispose_location())?;
        self.owner.release_all(std::mem::take(&mut self.buffers))
    }

    fn is_disposed(&self) -> bool {
        self.disposal.is_disposed()
    }
}

impl Drop for MultiBufferSequence {
    fn drop(&mut self) {
        if self.disposal.mark(false).is_ok() {
            release_dropped(&self.owner, std::mem::take(&mut self.buffers), "multi");
        }
    }
}

impl fmt::Debug for MultiBufferSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiBufferSequence")
            .field("count", &self.buffers.len())
            .field("length", &self.length)
            .field("owner", &self.owner)
            .field("disposed", &self.disposal.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        buf::BufferKind,
        manager::{BufferManager, SegmentedBufferManager},
    };

    fn pool() -> PoolRef {
        Arc::new(
            SegmentedBufferManager::builder(BufferKind::Heap)
                .base_buffer_size(16)
                .segment_count(1)
                .capacity(64)
                .build()
                .expect("构造池"),
        )
    }

    #[test]
    fn in_order_access_borrows_each_original_once() {
        let buffers = (1..=4).map(|n| ByteBuf::wrap(vec![n; n as usize])).collect();
        let seq = MultiBufferSequence::new(None, buffers);
        assert_eq!(seq.length(), 10);
        for i in 0..4 {
            assert!(matches!(seq.buffer(i).expect("顺序访问"), Cow::Borrowed(_)));
        }
        assert!(matches!(seq.buffer(3).expect("重复访问"), Cow::Owned(_)));
        assert!(seq.buffer(4).is_err());
    }

    #[test]
    fn out_of_order_access_duplicates() {
        let buffers = (0..3).map(|_| ByteBuf::wrap(vec![0; 2])).collect();
        let seq = MultiBufferSequence::new(None, buffers);
        assert!(matches!(seq.buffer(2).expect("跳号"), Cow::Owned(_)));
        assert!(matches!(seq.buffer(0).expect("首个"), Cow::Borrowed(_)));
    }

    #[test]
    fn window_leaves_outside_buffers_with_caller() {
        // 单段 64 / 16 = 4 个池化名额。
        let pool = pool();
        let mut buffers: Vec<ByteBuf> = (0..4).map(|_| pool.acquire(16).expect("申请")).collect();
        let mut seq = MultiBufferSequence::with_window(Some(Arc::clone(&pool)), &mut buffers, 1, 2)
            .expect("窗口");
        assert_eq!(seq.buffer_count(), 2);
        assert_eq!(seq.length(), 32);
        assert_eq!(buffers.len(), 2);
        seq.dispose().expect("释放");
        assert_eq!(pool.statistics().releases, 2);

        for buf in buffers.drain(..) {
            pool.release(buf).expect("调用方归还窗口外缓冲");
        }
        let stats = pool.statistics();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.cached_bytes, 4 * 16);

        let _held: Vec<_> = (0..4).map(|_| pool.acquire(16).expect("再次申请")).collect();
        assert_eq!(pool.statistics().unpooled_allocations, 0);
    }

    #[test]
    fn window_outside_vector_is_rejected() {
        let mut buffers = vec![ByteBuf::wrap(vec![0; 1])];
        let err = MultiBufferSequence::with_window(None, &mut buffers, 1, 1).expect_err("越界窗口");
        assert_eq!(err.code(), crate::error::codes::ARGUMENT);
        assert_eq!(buffers.len(), 1);
    }
}
