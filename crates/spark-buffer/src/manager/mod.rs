//! 缓冲池契约与实现。
//!
//! # 模块角色（Why）
//! - [`BufferManager`] 定义“申请/归还定长缓冲”的统一入口，工具函数、写入流与缓冲序列
//!   只依赖该 trait，不关心底层的缓存策略；
//! - 提供分段池 [`SegmentedBufferManager`]、检查型包装 [`CheckedBufferManager`]、
//!   不可释放包装 [`ImmortalBufferManager`]，以及三个进程级单例（[`heap`]、[`direct`]、[`network`]）。
//!
//! # 契约说明（What）
//! - 所有实现必须 `Send + Sync`，可被任意线程并发调用；
//! - 申请失败立即返回 `AllocationFailed`，不阻塞、不重试；
//! - `release` 只接受本池发出的缓冲，否则返回状态错误。

mod checked;
mod global;
mod immortal;
mod segmented;

use std::{fmt, sync::Arc};

use crate::{buf::ByteBuf, error::Result};

pub use checked::CheckedBufferManager;
pub use global::{direct, heap, memory_ceiling, network, try_direct, try_heap, try_network};
pub use immortal::ImmortalBufferManager;
pub use segmented::{SegmentedBufferManager, SegmentedBufferManagerBuilder};

/// 共享的池句柄。缓冲序列与写入流以该类型持有所属池。
pub type PoolRef = Arc<dyn BufferManager>;

/// 缓冲池契约。
///
/// # 教案式说明
/// - **意图 (Why)**：零拷贝热路径上的所有缓冲都来自池，池决定尺寸策略、缓存上限与清零策略；
/// - **契约 (What)**：
///   - `acquire(min)`：返回 `remaining() == min` 的缓冲（容量可以更大，limit 预设为 `min`）；
///   - `acquire_pref(pref)`：返回 `remaining() <= pref` 的缓冲，供可以接受较小授予、并继续链式申请的调用方；
///   - `acquire_sum(total)`：返回任意尺寸的缓冲，`total` 是迄今累计写入量，池可据此选择尺寸；
///   - `truncate(buf)`：返回持有相同剩余字节的缓冲；若返回了新缓冲，原缓冲已被自动归还；
///   - `release(buf)`：归还缓冲，来源不是本池时返回状态错误；
///   - `capacity()`：池的软上限，`None` 表示无上限；
///   - `dispose()`：丢弃池内缓存的空闲缓冲；
/// - **前置条件**：每个缓冲至多归还一次，且归还后调用方不再访问其内容；
/// - **后置条件**：`release` 成功后缓冲可能立即被其它调用方再次申请。
pub trait BufferManager: Send + Sync + fmt::Debug {
    /// 申请恰好 `min` 个剩余字节的缓冲。
    fn acquire(&self, min: usize) -> Result<ByteBuf>;

    /// 申请至多 `pref` 个剩余字节的缓冲。
    fn acquire_pref(&self, pref: usize) -> Result<ByteBuf>;

    /// 申请用于增量写入的缓冲，`total` 为迄今累计写入的字节数。
    fn acquire_sum(&self, total: u64) -> Result<ByteBuf>;

    /// 可能以更小的缓冲替换 `buf`。
    fn truncate(&self, buf: ByteBuf) -> Result<ByteBuf>;

    /// 归还缓冲。
    fn release(&self, buf: ByteBuf) -> Result<()>;

    /// 池的软上限（字节）。
    fn capacity(&self) -> Option<u64>;

    /// 丢弃缓存的空闲缓冲。
    fn dispose(&self) -> Result<()> {
        Ok(())
    }

    /// 统计快照。
    fn statistics(&self) -> PoolStats;
}

/// 池统计快照。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 累计成功申请次数。
    pub acquisitions: u64,
    /// 累计归还次数。
    pub releases: u64,
    /// 由空闲栈直接满足的申请次数。
    pub pool_hits: u64,
    /// 因分段已满而分配的非池化缓冲次数。
    pub unpooled_allocations: u64,
    /// 失败的申请次数。
    pub failed_acquisitions: u64,
    /// 当前在途（已申请未归还）的缓冲数。
    pub outstanding: u64,
    /// 当前由池化分段持有的全部字节（包含在途与空闲）。
    pub allocated_bytes: u64,
    /// 当前缓存在空闲栈中的字节。
    pub cached_bytes: u64,
    /// 池的软上限。
    pub capacity: Option<u64>,
}

impl PoolStats {
    /// 命中率：未退化为非池化分配的申请占比，范围 `[0, 1]`。
    pub fn hit_rate(&self) -> f64 {
        if self.acquisitions == 0 {
            return 1.0;
        }
        let pooled = self.acquisitions.saturating_sub(self.unpooled_allocations);
        pooled as f64 / self.acquisitions as f64
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capacity={}, allocated={}B, cached={}B, outstanding={}, hit rate={:.0}%",
            self.capacity
                .map_or_else(|| "unbounded".to_owned(), |c| format!("{c}B")),
            self.allocated_bytes,
            self.cached_bytes,
            self.outstanding,
            self.hit_rate() * 100.0
        )
    }
}
