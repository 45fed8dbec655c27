use std::fmt;

use dashmap::DashMap;

use super::{BufferManager, PoolRef, PoolStats};
use crate::{
    buf::ByteBuf,
    error::{BufferError, Result},
};

/// 检查型池包装：追踪每个在途缓冲，拒绝误用。
///
/// # 教案式说明
/// - **意图 (Why)**：重复释放或释放切片在常规池中会让同一块存储同时出现在空闲栈与调用方手里，
///   症状往往在很久之后才以数据损坏的形式出现；调试时套上本包装可以在误用发生的那一刻报错；
/// - **执行逻辑 (How)**：以存储区地址为键，把内层池发出的每个缓冲登记到 `DashMap`；
///   归还时必须命中登记且视图覆盖整个存储区，成功后才转交内层池；
/// - **契约 (What)**：
///   - 归还未登记的缓冲（外来或已归还）返回 `ForeignBuffer`；
///   - 归还切片（非完整视图）返回 `ForeignBuffer`，登记保持不变；
///   - `truncate` 返回新缓冲时同步更新登记；
/// - **设计权衡 (Trade-offs)**：每次申请/归还多一次并发哈希表操作，仅建议在调试与测试中启用。
pub struct CheckedBufferManager {
    inner: PoolRef,
    outstanding: DashMap<usize, usize>,
}

impl CheckedBufferManager {
    pub fn new(inner: PoolRef) -> Self {
        Self {
            inner,
            outstanding: DashMap::new(),
        }
    }

    /// 当前在途缓冲数。
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn track(&self, buf: ByteBuf) -> Result<ByteBuf> {
        if self
            .outstanding
            .insert(buf.region_address(), buf.capacity())
            .is_some()
        {
            return Err(BufferError::state(
                "pool handed out a buffer that is already outstanding",
            ));
        }
        Ok(buf)
    }

    fn verify(&self, buf: &ByteBuf) -> Result<()> {
        if !buf.is_whole_region() {
            return Err(BufferError::ForeignBuffer(
                "released view is a slice of the acquired buffer".into(),
            ));
        }
        if !self.outstanding.contains_key(&buf.region_address()) {
            return Err(BufferError::ForeignBuffer(
                "buffer is not outstanding; released twice or from another pool".into(),
            ));
        }
        Ok(())
    }
}

impl BufferManager for CheckedBufferManager {
    fn acquire(&self, min: usize) -> Result<ByteBuf> {
        self.track(self.inner.acquire(min)?)
    }

    fn acquire_pref(&self, pref: usize) -> Result<ByteBuf> {
        self.track(self.inner.acquire_pref(pref)?)
    }

    fn acquire_sum(&self, total: u64) -> Result<ByteBuf> {
        self.track(self.inner.acquire_sum(total)?)
    }

    fn truncate(&self, buf: ByteBuf) -> Result<ByteBuf> {
        self.verify(&buf)?;
        let before = buf.region_address();
        let truncated = self.inner.truncate(buf)?;
        let after = truncated.region_address();
        if before != after {
            self.outstanding.remove(&before);
            return self.track(truncated);
        }
        Ok(truncated)
    }

    fn release(&self, buf: ByteBuf) -> Result<()> {
        self.verify(&buf)?;
        self.outstanding.remove(&buf.region_address());
        self.inner.release(buf)
    }

    fn capacity(&self) -> Option<u64> {
        self.inner.capacity()
    }

    fn dispose(&self) -> Result<()> {
        self.inner.dispose()
    }

    fn statistics(&self) -> PoolStats {
        self.inner.statistics()
    }
}

impl fmt::Debug for CheckedBufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckedBufferManager")
            .field("outstanding", &self.outstanding.len())
            .field("inner", &self.inner)
            .finish()
    }
}
