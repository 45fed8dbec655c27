use std::{borrow::Cow, fmt};

use super::{
    BufferOwner, BufferSequence, Disposal, index_out_of_bounds, release_dropped, total_length,
    track_dispose_location,
};
use crate::{
    buf::ByteBuf,
    error::Result,
    manager::PoolRef,
    sync::{AtomicU32, Ordering},
};

/// 固定 `N` 个缓冲的序列，`N` 不超过 32。
///
/// # 设计要点（How）
/// - 缓冲以数组内联保存，不额外分配；
/// - 一个 `AtomicU32` 按位记录每个下标的原缓冲是否已交出，位测试并置位只用 CAS 完成。
pub struct ArrayBufferSequence<const N: usize> {
    owner: BufferOwner,
    buffers: Option<[ByteBuf; N]>,
    length: u64,
    handed_out: AtomicU32,
    disposal: Disposal,
}

/// 两个缓冲的序列。
pub type DoubleBufferSequence = ArrayBufferSequence<2>;

/// 三个缓冲的序列。
pub type TripleBufferSequence = ArrayBufferSequence<3>;

impl<const N: usize> ArrayBufferSequence<N> {
    /// `pool` 为 `Some` 时，`dispose` 把全部缓冲还给该池。
    pub fn from_array(pool: Option<PoolRef>, buffers: [ByteBuf; N]) -> Self {
        Self::with_owner(BufferOwner::from_pool(pool), buffers)
    }

    pub(crate) fn with_owner(owner: BufferOwner, buffers: [ByteBuf; N]) -> Self {
        const { assert!(N > 0 && N <= 32, "bitmask holds at most 32 buffers") };
        Self {
            owner,
            length: total_length(&buffers),
            buffers: Some(buffers),
            handed_out: AtomicU32::new(0),
            disposal: Disposal::default(),
        }
    }

    fn stored(&self, index: usize) -> Result<&ByteBuf> {
        self.disposal.ensure_live()?;
        self.buffers
            .as_ref()
            .and_then(|buffers| buffers.get(index))
            .ok_or_else(|| index_out_of_bounds(index, N))
    }

    fn stored_mut(&mut self, index: usize) -> Result<&mut ByteBuf> {
        self.disposal.ensure_live()?;
        self.buffers
            .as_mut()
            .and_then(|buffers| buffers.get_mut(index))
            .ok_or_else(|| index_out_of_bounds(index, N))
    }

    /// 置位 `bit`，返回置位前该位是否为 0。
    fn test_and_set(&self, bit: usize) -> bool {
        let mask = 1u32 << bit;
        let mut current = self.handed_out.load(Ordering::Acquire);
        loop {
            if current & mask != 0 {
                return false;
            }
            match self.handed_out.compare_exchange_weak(
                current,
                current | mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl DoubleBufferSequence {
    pub fn new(pool: Option<PoolRef>, first: ByteBuf, second: ByteBuf) -> Self {
        Self::from_array(pool, [first, second])
    }
}

impl TripleBufferSequence {
    pub fn new(pool: Option<PoolRef>, first: ByteBuf, second: ByteBuf, third: ByteBuf) -> Self {
        Self::from_array(pool, [first, second, third])
    }
}

impl<const N: usize> BufferSequence for ArrayBufferSequence<N> {
    fn length(&self) -> u64 {
        self.length
    }

    fn buffer_count(&self) -> usize {
        N
    }

    fn buffer(&self, index: usize) -> Result<Cow<'_, ByteBuf>> {
        let buffer = self.stored(index)?;
        Ok(if self.test_and_set(index) {
            Cow::Borrowed(buffer)
        } else {
            Cow::Owned(buffer.duplicate())
        })
    }

    fn unsafe_buffer(&self, index: usize) -> Result<&ByteBuf> {
        self.stored(index)
    }

    fn unsafe_buffer_mut(&mut self, index: usize) -> Result<&mut ByteBuf> {
        self.stored_mut(index)
    }

    fn dispose(&mut self) -> Result<()> {
        self.disposal.mark(track_dispose_location())?;
        self.owner.release_all(self.buffers.take().into_iter().flatten())
    }

    fn is_disposed(&self) -> bool {
        self.disposal.is_disposed()
    }
}

impl<const N: usize> Drop for ArrayBufferSequence<N> {
    fn drop(&mut self) {
        if self.disposal.mark(false).is_ok() {
            let variant = match N {
                2 => "double",
                3 => "triple",
                _ => "array",
            };
            release_dropped(&self.owner, self.buffers.take().into_iter().flatten(), variant);
        }
    }
}

impl<const N: usize> fmt::Debug for ArrayBufferSequence<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayBufferSequence")
            .field("buffers", &N)
            .field("length", &self.length)
            .field("owner", &self.owner)
            .field("disposed", &self.disposal.is_disposed())
            .finish()
    }
}
