use std::{borrow::Cow, fmt};

use super::{BoxedSequence, BufferSequence, Disposal, check_bulk_range, track_dispose_location};
use crate::{buf::ByteBuf, error::Result};

/// 两个子序列首尾相接的序列。
///
/// 下标小于左侧缓冲个数的操作转发给左子序列，其余减去该个数后转发给右子序列。
/// 组合在构造后固定；未显式释放就被丢弃时，两个子序列各自在 `Drop` 中归还缓冲。
pub struct CompositeBufferSequence {
    left: BoxedSequence,
    right: BoxedSequence,
    left_count: usize,
    length: u64,
    disposal: Disposal,
}

impl CompositeBufferSequence {
    pub fn new(left: BoxedSequence, right: BoxedSequence) -> Self {
        Self {
            left_count: left.buffer_count(),
            length: left.length() + right.length(),
            left,
            right,
            disposal: Disposal::default(),
        }
    }

    fn route(&self, index: usize) -> Result<(&BoxedSequence, usize)> {
        self.disposal.ensure_live()?;
        Ok(if index < self.left_count {
            (&self.left, index)
        } else {
            (&self.right, index - self.left_count)
        })
    }
}

impl BufferSequence for CompositeBufferSequence {
    fn length(&self) -> u64 {
        self.length
    }

    fn buffer_count(&self) -> usize {
        self.left_count + self.right.buffer_count()
    }

    fn buffer(&self, index: usize) -> Result<Cow<'_, ByteBuf>> {
        let (half, index) = self.route(index)?;
        half.buffer(index)
    }

    fn unsafe_buffer(&self, index: usize) -> Result<&ByteBuf> {
        let (half, index) = self.route(index)?;
        half.unsafe_buffer(index)
    }

    fn unsafe_buffer_mut(&mut self, index: usize) -> Result<&mut ByteBuf> {
        self.disposal.ensure_live()?;
        if index < self.left_count {
            self.left.unsafe_buffer_mut(index)
        } else {
            self.right.unsafe_buffer_mut(index - self.left_count)
        }
    }

    fn buffer_position(&self, index: usize) -> Result<usize> {
        let (half, index) = self.route(index)?;
        half.buffer_position(index)
    }

    fn buffer_limit(&self, index: usize) -> Result<usize> {
        let (half, index) = self.route(index)?;
        half.buffer_limit(index)
    }

    fn buffers_into<'a>(
        &'a self,
        start: usize,
        count: usize,
        dest: &mut [Option<Cow<'a, ByteBuf>>],
        dest_offset: usize,
    ) -> Result<()> {
        self.disposal.ensure_live()?;
        check_bulk_range(start, count, self.buffer_count(), dest.len(), dest_offset)?;
        let end = start + count;
        if start < self.left_count {
            let left_end = end.min(self.left_count);
            self.left
                .buffers_into(start, left_end - start, dest, dest_offset)?;
        }
        if end > self.left_count {
            let right_start = start.max(self.left_count);
            self.right.buffers_into(
                right_start - self.left_count,
                end - right_start,
                dest,
                dest_offset + (right_start - start),
            )?;
        }
        Ok(())
    }

    fn dispose(&mut self) -> Result<()> {
        self.disposal.mark(track_dispose_location())?;
        let left = self.left.dispose();
        let right = self.right.dispose();
        left.and(right)
    }

    fn is_disposed(&self) -> bool {
        self.disposal.is_disposed()
    }
}

impl fmt::Debug for CompositeBufferSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeBufferSequence")
            .field("left", &self.left)
            .field("right", &self.right)
            .field("disposed", &self.disposal.is_disposed())
            .finish()
    }
}
