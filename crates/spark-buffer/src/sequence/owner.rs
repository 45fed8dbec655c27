use std::{fmt, sync::Arc};

use spin::Mutex;

use crate::{
    buf::ByteBuf,
    error::{BufferError, Result},
    manager::PoolRef,
    sync::{AtomicU64, Ordering},
};

/// 序列释放时缓冲的去向。
#[derive(Clone)]
pub(crate) enum BufferOwner {
    /// 无归属：释放只是丢弃视图。
    Unowned,
    /// 逐个归还给池。
    Pool(PoolRef),
    /// 缓冲是共享 slab 的切片：释放时丢弃切片并减少 slab 引用。
    Slab(Arc<SlabLease>),
}

impl BufferOwner {
    pub(crate) fn from_pool(pool: Option<PoolRef>) -> Self {
        pool.map_or(Self::Unowned, Self::Pool)
    }

    /// 释放全部缓冲；池归还失败时继续归还其余缓冲，返回第一个错误。
    pub(crate) fn release_all(&self, buffers: impl IntoIterator<Item = ByteBuf>) -> Result<()> {
        match self {
            Self::Unowned => Ok(()),
            Self::Pool(pool) => {
                let mut first_err = None;
                for buf in buffers {
                    if let Err(err) = pool.release(buf) {
                        first_err.get_or_insert(err);
                    }
                }
                first_err.map_or(Ok(()), Err)
            }
            Self::Slab(lease) => {
                buffers.into_iter().for_each(drop);
                lease.release_ref()
            }
        }
    }
}

impl fmt::Debug for BufferOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unowned => f.write_str("Unowned"),
            Self::Pool(_) => f.write_str("Pool"),
            Self::Slab(lease) => write!(f, "Slab(refs={})", lease.refs()),
        }
    }
}

/// `SlabLease` 追踪一个被多个序列共享的池缓冲，并在最后一个引用释放时归还。
///
/// # 角色定位（Why）
/// - 池授予的缓冲比请求大得多时，分配工具把剩余空间切给后续序列，
///   只有所有切片所在的序列都释放后，整块缓冲才能还给池；
///
/// # 结构设计（How）
/// - `refs`：显式的原子引用计数。分配过程本身持有一个引用，每个切片序列再各持一个；
/// - `buffer`：完整缓冲，计数归零时被取出并归还，保证至多归还一次；
/// - 计数被减到负数（多余的释放）时返回状态错误，而不是静默忽略。
pub(crate) struct SlabLease {
    pool: PoolRef,
    refs: AtomicU64,
    buffer: Mutex<Option<ByteBuf>>,
}

impl SlabLease {
    /// 以分配过程持有的一个引用创建租约。
    pub(crate) fn new(pool: PoolRef, buffer: ByteBuf) -> Self {
        Self {
            pool,
            refs: AtomicU64::new(1),
            buffer: Mutex::new(Some(buffer)),
        }
    }

    /// 增加一个引用。
    pub(crate) fn acquire_ref(&self) -> Result<()> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|_| BufferError::state("shared slab already released"))
    }

    /// 释放一个引用；归零时把缓冲还给池。
    pub(crate) fn release_ref(&self) -> Result<()> {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .map_err(|_| BufferError::state("shared slab reference count underflow"))?;
        if previous == 1 {
            if let Some(buffer) = self.buffer.lock().take() {
                return self.pool.release(buffer);
            }
        }
        Ok(())
    }

    pub(crate) fn refs(&self) -> u64 {
        self.refs.load(Ordering::Acquire)
    }
}
