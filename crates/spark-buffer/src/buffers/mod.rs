//! 缓冲与缓冲序列的工具函数集合。
//!
//! # 模块角色（Why）
//! - 把“从池构造序列”的分配策略、跨缓冲的切片/拷贝/比较，以及清零、CRC、调试格式化
//!   这些与具体序列变体无关的操作集中在一处，序列类型本身只保留访问契约；
//!
//! # 使用约定（What）
//! - 接受序列的函数只经由 `unsafe_buffer` + `buffer_position`/`buffer_limit` 读取，
//!   不消耗序列的“原缓冲已交出”标记，也不修改任何缓冲窗口；
//! - 需要推进位置的函数（`copy` 的目标、`get_i32_spanning`）在文档中注明。

mod alloc;
mod crc;
mod format;

use std::sync::OnceLock;

use bytes::Buf;

use crate::{
    buf::{ByteBuf, ByteOrder},
    error::{BufferError, Result},
    manager::PoolRef,
    sequence::{
        ArrayBufferSequence, BoxedSequence, BufferOwner, BufferSequence, EmptyBufferSequence,
        MultiBufferSequence, SingleBufferSequence,
    },
    stream::BufferSequenceInputStream,
};

pub use alloc::{allocate, allocate_direct};
pub use crc::{update_crc, update_crc_buffers, update_crc_len, update_crc_sequence};
pub use format::{buffer_to_string, buffer_to_string_limited, sequence_to_string};

/// 长于该值的非数组拷贝走批量路径。
const BULK_COPY_THRESHOLD: usize = 128;

/// 比较两个序列时每轮读取的字节数。
const COMPARE_CHUNK: usize = 256;

static EMPTY_HEAP: OnceLock<ByteBuf> = OnceLock::new();
static EMPTY_DIRECT: OnceLock<ByteBuf> = OnceLock::new();

/// 零容量的堆缓冲。
pub fn empty_buffer() -> ByteBuf {
    EMPTY_HEAP.get_or_init(|| ByteBuf::wrap(Vec::new())).duplicate()
}

/// 零容量的原生缓冲。
pub fn empty_direct_buffer() -> ByteBuf {
    EMPTY_DIRECT.get_or_init(ByteBuf::empty_direct).duplicate()
}

/// 规范的空序列。
pub fn empty_sequence() -> BoxedSequence {
    Box::new(EmptyBufferSequence)
}

/// 按缓冲个数选择最贴合的序列变体。
///
/// 0 个缓冲得到空序列，1/2/3 个分别得到 Single/Double/Triple，更多得到 Multi。
pub fn create_sequence(pool: Option<PoolRef>, buffers: Vec<ByteBuf>) -> BoxedSequence {
    sequence_with_owner(BufferOwner::from_pool(pool), buffers)
}

pub(crate) fn sequence_with_owner(owner: BufferOwner, buffers: Vec<ByteBuf>) -> BoxedSequence {
    if buffers.is_empty() {
        return empty_sequence();
    }
    let buffers = match <[ByteBuf; 1]>::try_from(buffers) {
        Ok([buffer]) => return Box::new(SingleBufferSequence::with_owner(owner, buffer)),
        Err(buffers) => buffers,
    };
    let buffers = match <[ByteBuf; 2]>::try_from(buffers) {
        Ok(pair) => return Box::new(ArrayBufferSequence::with_owner(owner, pair)),
        Err(buffers) => buffers,
    };
    match <[ByteBuf; 3]>::try_from(buffers) {
        Ok(triple) => Box::new(ArrayBufferSequence::with_owner(owner, triple)),
        Err(buffers) => Box::new(MultiBufferSequence::with_owner(owner, buffers)),
    }
}

/// 序列 `[offset, offset + len)` 上的单缓冲视图。
///
/// 区间必须完整落在某一个缓冲之内：越出序列或跨越缓冲边界都返回参数错误。
/// 返回的视图与序列共享存储，但不归序列所有。
pub fn slice(sequence: &dyn BufferSequence, offset: u64, len: usize) -> Result<ByteBuf> {
    let mut offset = offset;
    for index in 0..sequence.buffer_count() {
        let buffer_len = sequence.buffer_length(index)? as u64;
        if offset < buffer_len || (offset == buffer_len && len == 0) {
            if offset + len as u64 > buffer_len {
                return Err(BufferError::argument(format!(
                    "slice of {len} bytes at {offset} crosses the end of buffer {index}"
                )));
            }
            let start = sequence.buffer_position(index)? + offset as usize;
            return sequence.unsafe_buffer(index)?.slice_range(start, len);
        }
        offset -= buffer_len;
    }
    Err(BufferError::argument(format!(
        "slice of {len} bytes outside sequence of {} bytes",
        sequence.length()
    )))
}

/// 把 `src[src_offset .. src_offset + len)` 复制到 `dst` 的当前位置，`dst` 的位置随之推进。
///
/// `src_offset` 相对 `src` 视图起点，`src` 的窗口不变。
///
/// # 复制策略（How）
/// - `src` 为堆缓冲时，直接从数组视图批量写入；
/// - 超过 128 字节时以复制视图整段转移；
/// - 字节序相同的小段拷贝按 8/4/2/1 字节分块；
/// - 字节序不同时逐字节复制。
pub fn copy(src: &ByteBuf, src_offset: usize, len: usize, dst: &mut ByteBuf) -> Result<()> {
    let src_end = src_offset
        .checked_add(len)
        .filter(|end| *end <= src.limit())
        .ok_or_else(|| {
            BufferError::argument(format!(
                "source range [{src_offset}, +{len}) exceeds limit {}",
                src.limit()
            ))
        })?;
    if dst.remaining() < len {
        return Err(BufferError::bounds(format!(
            "destination has {} bytes of room, {len} required",
            dst.remaining()
        )));
    }

    if let Some(array) = src.array() {
        return dst.put_slice(&array[src_offset..src_end]);
    }
    if len > BULK_COPY_THRESHOLD {
        let mut window = src.duplicate();
        window.set_window(src_offset, src_end)?;
        return dst.put_buf(&mut window);
    }
    if src.order() == dst.order() {
        let mut from = src_offset;
        let mut to = dst.position();
        let mut left = len;
        while left >= 8 {
            dst.put_u64_at(to, src.get_u64_at(from)?)?;
            (from, to, left) = (from + 8, to + 8, left - 8);
        }
        if left >= 4 {
            dst.put_i32_at(to, src.get_i32_at(from)?)?;
            (from, to, left) = (from + 4, to + 4, left - 4);
        }
        if left >= 2 {
            dst.put_i16_at(to, src.get_i16_at(from)?)?;
            (from, to, left) = (from + 2, to + 2, left - 2);
        }
        if left == 1 {
            dst.put_u8_at(to, src.get_u8_at(from)?)?;
            to += 1;
        }
        return dst.set_position(to);
    }
    for index in src_offset..src_end {
        dst.put_u8(src.get_u8_at(index)?)?;
    }
    Ok(())
}

/// 在空间允许的范围内把 `src` 的内容复制进 `dst` 的各个缓冲，返回复制的字节数。
///
/// 写入经由 [`BufferSequence::unsafe_buffer_mut`] 就地完成，`dst` 中各缓冲记录的窗口不变。
/// 目标缓冲仍有其它视图存活时返回 `SharedStorage`，已写入的前缀保留。
pub fn copy_sequence(src: &dyn BufferSequence, dst: &mut dyn BufferSequence) -> Result<u64> {
    let mut copied = 0u64;
    let mut target_index = 0;
    let (mut cursor, mut end) = (0, 0);
    for index in 0..src.buffer_count() {
        let mut source = captured(src, index)?;
        while source.has_remaining() {
            while cursor == end {
                if target_index == dst.buffer_count() {
                    return Ok(copied);
                }
                cursor = dst.buffer_position(target_index)?;
                end = dst.buffer_limit(target_index)?;
                target_index += 1;
            }
            let n = source.remaining().min(end - cursor);
            let target = dst.unsafe_buffer_mut(target_index - 1)?;
            copy_into_window(&source, n, target, cursor)?;
            source.set_position(source.position() + n)?;
            cursor += n;
            copied += n as u64;
        }
    }
    Ok(copied)
}

/// 把 `source` 剩余部分的前 `len` 字节写到 `target[at..at + len)`，随后恢复 `target` 的窗口。
fn copy_into_window(source: &ByteBuf, len: usize, target: &mut ByteBuf, at: usize) -> Result<()> {
    let (position, limit) = (target.position(), target.limit());
    target.set_window(at, at + len)?;
    let outcome = copy(source, source.position(), len, target);
    target.set_window(position, limit)?;
    outcome
}

/// 两个序列是否表示相同的字节串。
///
/// 各含一个缓冲时直接比较两个缓冲，否则用两个读取器成对顺序读取比较。
pub fn equals(a: &dyn BufferSequence, b: &dyn BufferSequence) -> Result<bool> {
    if a.length() != b.length() {
        return Ok(false);
    }
    if a.buffer_count() == 1 && b.buffer_count() == 1 {
        return Ok(a.unsafe_buffer(0)? == b.unsafe_buffer(0)?);
    }

    let mut left = BufferSequenceInputStream::borrowed(a);
    let mut right = BufferSequenceInputStream::borrowed(b);
    let (mut chunk_a, mut chunk_b) = ([0u8; COMPARE_CHUNK], [0u8; COMPARE_CHUNK]);
    let mut remaining = a.length();
    while remaining > 0 {
        let n = remaining.min(COMPARE_CHUNK as u64) as usize;
        left.read_fully(&mut chunk_a[..n])?;
        right.read_fully(&mut chunk_b[..n])?;
        if chunk_a[..n] != chunk_b[..n] {
            return Ok(false);
        }
        remaining -= n as u64;
    }
    Ok(true)
}

/// `a[of_a .. of_a + len)` 与 `b[of_b .. of_b + len)` 是否相等；下标相对视图起点。
///
/// 任一区间越出缓冲容量时返回越界错误。
pub fn equals_range(a: &ByteBuf, of_a: usize, b: &ByteBuf, of_b: usize, len: usize) -> Result<bool> {
    for i in 0..len {
        if a.get_u8_at(of_a + i)? != b.get_u8_at(of_b + i)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// 将 `[position, limit)` 清零，位置与上限不变。
///
/// 清零整个缓冲时临时切换到本机字节序，完成后恢复。缓冲与其它视图共享存储时返回
/// `SharedStorage`，此时内容可能只清零了一部分，字节序仍会恢复。
pub fn zero(buffer: &mut ByteBuf) -> Result<()> {
    let (index, end) = (buffer.position(), buffer.limit());
    let whole = index == 0 && end == buffer.capacity();
    let order = buffer.order();
    if whole {
        buffer.set_order(ByteOrder::native());
    }

    let outcome = zero_range(buffer, index, end);
    if whole {
        buffer.set_order(order);
    }
    outcome
}

fn zero_range(buffer: &mut ByteBuf, mut index: usize, end: usize) -> Result<()> {
    while end - index >= 8 {
        buffer.put_u64_at(index, 0)?;
        index += 8;
    }
    if end - index >= 4 {
        buffer.put_i32_at(index, 0)?;
        index += 4;
    }
    if end - index >= 2 {
        buffer.put_i16_at(index, 0)?;
        index += 2;
    }
    if end - index == 1 {
        buffer.put_u8_at(index, 0)?;
    }
    Ok(())
}

/// 解码一个可能跨越多个缓冲的大端 `i32`，从 `buffers[index]` 开始读取，所经缓冲的位置都会推进。
///
/// 起始缓冲剩余不少于 4 字节时按该缓冲的字节序直接读取。
pub fn get_i32_spanning(buffers: &mut [ByteBuf], index: usize) -> Result<i32> {
    if let Some(buffer) = buffers.get_mut(index).filter(|b| b.remaining() >= 4) {
        return buffer.get_i32();
    }
    let mut bytes = [0u8; 4];
    read_spanning(buffers, index, &mut bytes)?;
    Ok(i32::from_be_bytes(bytes))
}

/// 解码一个可能跨越多个缓冲的大端 `i64`，规则同 [`get_i32_spanning`]。
pub fn get_i64_spanning(buffers: &mut [ByteBuf], index: usize) -> Result<i64> {
    if let Some(buffer) = buffers.get_mut(index).filter(|b| b.remaining() >= 8) {
        return buffer.get_i64();
    }
    let mut bytes = [0u8; 8];
    read_spanning(buffers, index, &mut bytes)?;
    Ok(i64::from_be_bytes(bytes))
}

fn read_spanning(buffers: &mut [ByteBuf], index: usize, out: &mut [u8]) -> Result<()> {
    let mut candidates = buffers.iter_mut().skip(index);
    let mut current = candidates.next();
    for slot in out.iter_mut() {
        loop {
            match current.as_deref_mut() {
                Some(buffer) if buffer.has_remaining() => break,
                Some(_) => current = candidates.next(),
                None => {
                    return Err(BufferError::eof(format!(
                        "{}-byte value runs past the last buffer",
                        out.len()
                    )));
                }
            }
        }
        if let Some(buffer) = current.as_deref_mut() {
            *slot = buffer.get_u8()?;
        }
    }
    Ok(())
}

/// 把序列内容复制为连续的 `Vec`。
pub fn to_vec(sequence: &dyn BufferSequence) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(sequence.length() as usize);
    for index in 0..sequence.buffer_count() {
        out.extend_from_slice(captured(sequence, index)?.chunk());
    }
    Ok(out)
}

/// 第 `index` 个缓冲按构造时窗口复制出的独立视图，不消耗安全访问标记。
pub(crate) fn captured(sequence: &dyn BufferSequence, index: usize) -> Result<ByteBuf> {
    let buffer = sequence.unsafe_buffer(index)?;
    let (position, limit) = (
        sequence.buffer_position(index)?,
        sequence.buffer_limit(index)?,
    );
    let mut view = buffer.duplicate();
    view.set_window(position, limit)?;
    Ok(view)
}
