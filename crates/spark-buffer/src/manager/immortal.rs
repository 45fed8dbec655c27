use super::{BufferManager, PoolRef, PoolStats};
use crate::{
    buf::ByteBuf,
    error::{BufferError, Result},
};

/// 不可释放的池包装，进程级单例通过它对外暴露。
///
/// 除 `dispose` 外的所有操作原样转发；`dispose` 总是返回状态错误，
/// 防止某个调用方清空其它组件仍在共享的缓存。
#[derive(Debug)]
pub struct ImmortalBufferManager {
    inner: PoolRef,
}

impl ImmortalBufferManager {
    pub fn new(inner: PoolRef) -> Self {
        Self { inner }
    }
}

impl BufferManager for ImmortalBufferManager {
    fn acquire(&self, min: usize) -> Result<ByteBuf> {
        self.inner.acquire(min)
    }

    fn acquire_pref(&self, pref: usize) -> Result<ByteBuf> {
        self.inner.acquire_pref(pref)
    }

    fn acquire_sum(&self, total: u64) -> Result<ByteBuf> {
        self.inner.acquire_sum(total)
    }

    fn truncate(&self, buf: ByteBuf) -> Result<ByteBuf> {
        self.inner.truncate(buf)
    }

    fn release(&self, buf: ByteBuf) -> Result<()> {
        self.inner.release(buf)
    }

    fn capacity(&self) -> Option<u64> {
        self.inner.capacity()
    }

    fn dispose(&self) -> Result<()> {
        Err(BufferError::state("process-wide buffer manager cannot be disposed"))
    }

    fn statistics(&self) -> PoolStats {
        self.inner.statistics()
    }
}
