//! 缓冲序列：以不可变、有序、定长的缓冲视图列表表示一段逻辑字节。
//!
//! # 模块角色（Why）
//! - 消息在协议栈中以缓冲序列传递而不复制；序列构造后缓冲个数与每个缓冲的
//!   `(position, limit)` 都不再变化，`length()` 恒等于各缓冲剩余字节之和；
//! - 序列相对释放“拥有”它的缓冲：带池构造时 `dispose()` 恰好一次地把每个缓冲还给池，
//!   不带池构造时只是视图，释放不触碰缓冲。
//!
//! # 安全访问与原始访问（How）
//! - [`BufferSequence::buffer`] 是安全访问：某个下标的**第一个**调用方直接借到存储中的原缓冲
//!   （`Cow::Borrowed`，零拷贝），之后对同一下标的任何调用都拿到按原始窗口复制的独立视图
//!   （`Cow::Owned`）。“是否已交出原缓冲”由每个缓冲一个原子标记记录，只用 CAS 维护；
//! - [`BufferSequence::unsafe_buffer`] 直接返回存储的缓冲，调用方应以
//!   `buffer_position`/`buffer_limit` 为准，读取器正是按这个三元组工作；
//! - [`BufferSequence::unsafe_buffer_mut`] 是填充内容的唯一入口：只有独占存储区的原缓冲可写，
//!   安全访问交出的复制视图仍存活时写入返回 `SharedStorage`；
//! - 借出的视图借用序列本身，因此不可能在序列释放之后继续使用。
//!
//! # 生命周期（What）
//! - `dispose()` 成功一次后，再次调用返回 `AlreadyDisposed`，读取返回状态错误；
//! - 未释放就被丢弃的序列在 `Drop` 中按释放处理，归还失败只能记录 `warn` 日志。

mod composite;
mod empty;
mod fixed;
mod multi;
mod owner;
mod single;

use std::{borrow::Cow, fmt};

use tracing::warn;

use crate::{
    buf::ByteBuf,
    error::{BufferError, Result},
};

pub use composite::CompositeBufferSequence;
pub use empty::EmptyBufferSequence;
pub use fixed::{ArrayBufferSequence, DoubleBufferSequence, TripleBufferSequence};
pub use multi::MultiBufferSequence;
pub use single::SingleBufferSequence;

pub(crate) use owner::{BufferOwner, SlabLease};

/// 装箱后的动态序列，流与工具函数以它交换所有权。
pub type BoxedSequence = Box<dyn BufferSequence>;

/// 缓冲序列契约，所有变体共享。
///
/// 下标越界返回 `OutOfBounds`；已释放的序列除 `length`/`buffer_count`/`is_disposed`
/// 外的读取都返回 `AlreadyDisposed`。
pub trait BufferSequence: Send + Sync + fmt::Debug {
    /// 逻辑字节长度。
    fn length(&self) -> u64;

    /// 缓冲个数。
    fn buffer_count(&self) -> usize;

    /// 安全访问第 `index` 个缓冲。
    fn buffer(&self, index: usize) -> Result<Cow<'_, ByteBuf>>;

    /// 原始访问第 `index` 个缓冲。
    fn unsafe_buffer(&self, index: usize) -> Result<&ByteBuf>;

    /// 可写地原始访问第 `index` 个缓冲，用于就地填充内容。
    ///
    /// 调用方返回前必须恢复缓冲的 `position`/`limit`，否则 `buffer_position`/`buffer_limit`
    /// 与 `length()` 不再一致。
    fn unsafe_buffer_mut(&mut self, index: usize) -> Result<&mut ByteBuf>;

    /// 第 `index` 个缓冲在构造时记录的位置。
    fn buffer_position(&self, index: usize) -> Result<usize> {
        Ok(self.unsafe_buffer(index)?.position())
    }

    /// 第 `index` 个缓冲在构造时记录的上限。
    fn buffer_limit(&self, index: usize) -> Result<usize> {
        Ok(self.unsafe_buffer(index)?.limit())
    }

    /// 第 `index` 个缓冲的字节数。
    fn buffer_length(&self, index: usize) -> Result<usize> {
        Ok(self.buffer_limit(index)? - self.buffer_position(index)?)
    }

    /// 安全访问全部缓冲。
    fn buffers(&self) -> Result<Vec<Cow<'_, ByteBuf>>> {
        (0..self.buffer_count()).map(|i| self.buffer(i)).collect()
    }

    /// 把 `[start, start + count)` 的缓冲安全地写入 `dest[dest_offset..]`。
    fn buffers_into<'a>(
        &'a self,
        start: usize,
        count: usize,
        dest: &mut [Option<Cow<'a, ByteBuf>>],
        dest_offset: usize,
    ) -> Result<()> {
        check_bulk_range(start, count, self.buffer_count(), dest.len(), dest_offset)?;
        for i in 0..count {
            dest[dest_offset + i] = Some(self.buffer(start + i)?);
        }
        Ok(())
    }

    /// 释放序列；只能成功一次。
    fn dispose(&mut self) -> Result<()>;

    /// 是否已释放。
    fn is_disposed(&self) -> bool;
}

impl BufferSequence for Box<dyn BufferSequence> {
    fn length(&self) -> u64 {
        (**self).length()
    }

    fn buffer_count(&self) -> usize {
        (**self).buffer_count()
    }

    fn buffer(&self, index: usize) -> Result<Cow<'_, ByteBuf>> {
        (**self).buffer(index)
    }

    fn unsafe_buffer(&self, index: usize) -> Result<&ByteBuf> {
        (**self).unsafe_buffer(index)
    }

    fn unsafe_buffer_mut(&mut self, index: usize) -> Result<&mut ByteBuf> {
        (**self).unsafe_buffer_mut(index)
    }

    fn buffer_position(&self, index: usize) -> Result<usize> {
        (**self).buffer_position(index)
    }

    fn buffer_limit(&self, index: usize) -> Result<usize> {
        (**self).buffer_limit(index)
    }

    fn buffer_length(&self, index: usize) -> Result<usize> {
        (**self).buffer_length(index)
    }

    fn buffers(&self) -> Result<Vec<Cow<'_, ByteBuf>>> {
        (**self).buffers()
    }

    fn buffers_into<'a>(
        &'a self,
        start: usize,
        count: usize,
        dest: &mut [Option<Cow<'a, ByteBuf>>],
        dest_offset: usize,
    ) -> Result<()> {
        (**self).buffers_into(start, count, dest, dest_offset)
    }

    fn dispose(&mut self) -> Result<()> {
        (**self).dispose()
    }

    fn is_disposed(&self) -> bool {
        (**self).is_disposed()
    }
}

/// 所有序列的总长度：各缓冲剩余字节之和。
pub(crate) fn total_length<'a>(buffers: impl IntoIterator<Item = &'a ByteBuf>) -> u64 {
    buffers.into_iter().map(|b| b.remaining() as u64).sum()
}

pub(crate) fn index_out_of_bounds(index: usize, count: usize) -> BufferError {
    BufferError::bounds(format!("buffer index {index} outside sequence of {count} buffers"))
}

pub(crate) fn check_bulk_range(
    start: usize,
    count: usize,
    available: usize,
    dest_len: usize,
    dest_offset: usize,
) -> Result<()> {
    let source_ok = start.checked_add(count).is_some_and(|end| end <= available);
    let dest_ok = dest_offset
        .checked_add(count)
        .is_some_and(|end| end <= dest_len);
    if source_ok && dest_ok {
        Ok(())
    } else {
        Err(BufferError::bounds(format!(
            "bulk range [{start}, +{count}) into dest[{dest_offset}..] of {dest_len} \
             invalid for sequence of {available} buffers"
        )))
    }
}

/// 释放记录：首次释放的调用栈（开启追踪时）以及是否已释放。
#[derive(Debug, Default)]
pub(crate) struct Disposal {
    disposed: bool,
    site: Option<String>,
}

impl Disposal {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// 读取前的检查。
    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            Err(self.already_disposed())
        } else {
            Ok(())
        }
    }

    /// 标记为已释放；重复调用返回 `AlreadyDisposed`。
    pub(crate) fn mark(&mut self, track_site: bool) -> Result<()> {
        self.ensure_live()?;
        self.disposed = true;
        if track_site {
            self.site = Some(std::backtrace::Backtrace::force_capture().to_string());
        }
        Ok(())
    }

    fn already_disposed(&self) -> BufferError {
        BufferError::AlreadyDisposed {
            first_dispose_site: self.site.clone(),
        }
    }
}

/// 未释放即被丢弃的序列归还缓冲；`Drop` 无法返回错误，失败只记录日志。
pub(crate) fn release_dropped(
    owner: &BufferOwner,
    buffers: impl IntoIterator<Item = ByteBuf>,
    variant: &'static str,
) {
    if let Err(err) = owner.release_all(buffers) {
        warn!(
            sequence = variant,
            error = %err,
            code = err.code(),
            "releasing buffers of a dropped sequence failed"
        );
    }
}

/// 显式释放路径是否记录调用栈。
pub(crate) fn track_dispose_location() -> bool {
    crate::config::global().track_dispose_location
}
