use std::{borrow::Cow, fmt};

use super::{
    BufferOwner, BufferSequence, Disposal, index_out_of_bounds, release_dropped,
    track_dispose_location,
};
use crate::{
    buf::ByteBuf,
    error::Result,
    manager::PoolRef,
    sync::{AtomicBool, Ordering},
};

/// 只含一个缓冲的序列，最常见的形态。
///
/// 单个 `AtomicBool` 记录原缓冲是否已被安全访问交出。
pub struct SingleBufferSequence {
    owner: BufferOwner,
    buffer: Option<ByteBuf>,
    length: u64,
    handed_out: AtomicBool,
    disposal: Disposal,
}

impl SingleBufferSequence {
    /// `pool` 为 `Some` 时，`dispose` 把缓冲还给该池。
    pub fn new(pool: Option<PoolRef>, buffer: ByteBuf) -> Self {
        Self::with_owner(BufferOwner::from_pool(pool), buffer)
    }

    pub(crate) fn with_owner(owner: BufferOwner, buffer: ByteBuf) -> Self {
        Self {
            owner,
            length: buffer.remaining() as u64,
            buffer: Some(buffer),
            handed_out: AtomicBool::new(false),
            disposal: Disposal::default(),
        }
    }

    fn stored(&self, index: usize) -> Result<&ByteBuf> {
        self.disposal.ensure_live()?;
        match (&self.buffer, index) {
            (Some(buffer), 0) => Ok(buffer),
            _ => Err(index_out_of_bounds(index, 1)),
        }
    }

    fn stored_mut(&mut self, index: usize) -> Result<&mut ByteBuf> {
        self.disposal.ensure_live()?;
        match (&mut self.buffer, index) {
            (Some(buffer), 0) => Ok(buffer),
            _ => Err(index_out_of_bounds(index, 1)),
        }
    }
}

impl BufferSequence for SingleBufferSequence {
    fn length(&self) -> u64 {
        self.length
    }

    fn buffer_count(&self) -> usize {
        1
    }

    fn buffer(&self, index: usize) -> Result<Cow<'_, ByteBuf>> {
        let buffer = self.stored(index)?;
        let first = self
            .handed_out
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
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
        self.stored_mut(index)
    }

    fn dispose(&mut self) -> Result<()> {
        self.disposal.mark(track_dispose_location())?;
        self.owner.release_all(self.buffer.take())
    }

    fn is_disposed(&self) -> bool {
        self.disposal.is_disposed()
    }
}

impl Drop for SingleBufferSequence {
    fn drop(&mut self) {
        if self.disposal.mark(false).is_ok() {
            release_dropped(&self.owner, self.buffer.take(), "single");
        }
    }
}

impl fmt::Debug for SingleBufferSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleBufferSequence")
            .field("length", &self.length)
            .field("owner", &self.owner)
            .field("disposed", &self.disposal.is_disposed())
            .finish()
    }
}
