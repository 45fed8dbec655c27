use std::borrow::Cow;

use super::{BufferSequence, index_out_of_bounds};
use crate::{
    buf::ByteBuf,
    error::{BufferError, Result},
};

/// 规范的空序列：不含缓冲，长度为 0，释放总是成功且不留下状态。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EmptyBufferSequence;

impl BufferSequence for EmptyBufferSequence {
    fn length(&self) -> u64 {
        0
    }

    fn buffer_count(&self) -> usize {
        0
    }

    fn buffer(&self, index: usize) -> Result<Cow<'_, ByteBuf>> {
        Err(index_out_of_bounds(index, 0))
    }

    fn unsafe_buffer(&self, index: usize) -> Result<&ByteBuf> {
        Err(index_out_of_bounds(index, 0))
    }

    fn unsafe_buffer_mut(&mut self, index: usize) -> Result<&mut ByteBuf> {
        Err(index_out_of_bounds(index, 0))
    }

    fn buffers(&self) -> Result<Vec<Cow<'_, ByteBuf>>> {
        Ok(Vec::new())
    }

    /// 只拒绝非零的 `count` 与落在 `dest` 之外的 `dest_offset`，任何起始下标都被接受。
    fn buffers_into<'a>(
        &'a self,
        start: usize,
        count: usize,
        dest: &mut [Option<Cow<'a, ByteBuf>>],
        dest_offset: usize,
    ) -> Result<()> {
        if count != 0 || dest_offset >= dest.len() {
            return Err(BufferError::bounds(format!(
                "bulk range [{start}, +{count}) into dest[{dest_offset}..] of {} \
                 invalid for the empty sequence",
                dest.len()
            )));
        }
        Ok(())
    }

    fn dispose(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_disposed(&self) -> bool {
        false
    }
}
