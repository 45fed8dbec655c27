//! CRC-32 辅助函数：以缓冲剩余内容更新调用方持有的 `crc32fast::Hasher`。
//!
//! 返回值都是更新之后的累计 CRC，hasher 不会被重置，缓冲窗口不会被修改。

use bytes::Buf;
use crc32fast::Hasher;

use super::captured;
use crate::{
    buf::ByteBuf,
    error::{BufferError, Result},
    sequence::BufferSequence,
};

/// 以 `buffer` 的全部剩余字节更新 CRC。
pub fn update_crc(hasher: &mut Hasher, buffer: &ByteBuf) -> u32 {
    hasher.update(buffer.chunk());
    hasher.clone().finalize()
}

/// 以 `buffer` 从当前位置起的 `len` 个字节更新 CRC。
pub fn update_crc_len(hasher: &mut Hasher, buffer: &ByteBuf, len: usize) -> Result<u32> {
    let bytes = buffer.chunk().get(..len).ok_or_else(|| {
        BufferError::bounds(format!(
            "crc over {len} bytes exceeds remaining {}",
            buffer.remaining()
        ))
    })?;
    hasher.update(bytes);
    Ok(hasher.clone().finalize())
}

/// 从 `buffers[offset]` 开始，以连续 `len` 个剩余字节更新 CRC。
pub fn update_crc_buffers(
    hasher: &mut Hasher,
    buffers: &[ByteBuf],
    offset: usize,
    len: u64,
) -> Result<u32> {
    let mut left = len;
    for buffer in buffers.iter().skip(offset) {
        if left == 0 {
            break;
        }
        let take = left.min(buffer.remaining() as u64);
        update_crc_len(hasher, buffer, take as usize)?;
        left -= take;
    }
    if left > 0 {
        return Err(BufferError::bounds(format!(
            "crc over {len} bytes runs {left} bytes past the last buffer"
        )));
    }
    Ok(hasher.clone().finalize())
}

/// 以整个序列的内容更新 CRC。
pub fn update_crc_sequence(hasher: &mut Hasher, sequence: &dyn BufferSequence) -> Result<u32> {
    for index in 0..sequence.buffer_count() {
        hasher.update(captured(sequence, index)?.chunk());
    }
    Ok(hasher.clone().finalize())
}
