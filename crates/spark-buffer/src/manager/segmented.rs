use std::{
    fmt,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use spin::Mutex;
use tracing::{debug, trace};

use super::{BufferManager, PoolStats};
use crate::{
    buf::{BufferKind, ByteBuf, UNPOOLED_CLASS},
    error::{BufferError, Result},
};

/// 默认最小分段的缓冲尺寸。
pub const DEFAULT_BASE_BUFFER_SIZE: usize = 1024;

/// 默认分段数：1 KiB 到 64 KiB，覆盖常见 MTU。
pub const DEFAULT_SEGMENT_COUNT: usize = 7;

/// 默认分段数下基础尺寸的上限，保证最大分段不溢出。
const DEFAULT_MAX_BASE: usize = 1 << 24;

/// 默认软上限。
pub const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

/// 默认每隔多少次归还评估一次各分段的容量。
pub const DEFAULT_TRIM_INTERVAL: u64 = 256;

/// 两次容量评估之间的最短间隔。
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// 每个分段每归还这么多个非池化缓冲，就有一个不被收编。
pub const UNPOOLED_RECLAIM_INTERVAL: u64 = 1024;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// `SegmentedBufferManager` 按尺寸等级（分段）缓存定长缓冲，
/// 专注在**高并发、低延迟**场景下复用缓冲，减少向分配器的申请次数。
///
/// # 模块角色（Why）
/// - 作为进程级单例背后的具体池，为写入流、分配工具与协议栈提供统一的缓冲来源；
/// - 通过尺寸等级将“小消息”和“大块传输”的缓冲隔离，避免大缓冲被当作小缓冲浪费。
///
/// # 核心机制（How）
/// - 分段尺寸自 `base_buffer_size` 起逐段翻倍；每段维护 `spin::Mutex<Vec<ByteBuf>>` 空闲栈，
///   最多池化 `capacity / segment_count / buffer_size` 个缓冲；
/// - 分段已满时退化为分配非池化缓冲；归还时若分段空闲栈不足三分之二且仍有名额，
///   改写其尺寸等级收编进分段，否则丢弃；
/// - 每 `trim_interval` 次归还做一次容量评估：每段保留 `max(在途数, 近期高水位)` 个缓冲，
///   多出的空闲缓冲直接释放，随后高水位减半，空闲的池因此逐步收缩；
/// - 每个缓冲的存储区在分配时写入本池标识与分段下标，`release` 据此找回分段并拒绝外来缓冲；
/// - `PoolMetrics` 通过原子计数跟踪申请、归还、命中与缓存字节，支撑 [`PoolStats`] 快照。
///
/// # 契约说明（What）
/// - **线程安全**：空闲栈由自旋锁保护，计数器为原子类型，满足 `Send + Sync`；
/// - `acquire(min)` 在 `min` 超过最大分段时返回 `AllocationFailed`；
/// - 归还时恢复窗口与大端字节序，启用 `zero_on_release` 时先清零内容；
/// - 归还的缓冲仍有其它视图共享存储时不入栈，让出池化名额，存储随最后一个视图释放。
///
/// # 设计权衡（Trade-offs）
/// - 使用自旋锁而非阻塞锁：临界区只有一次 `push`/`pop`，持锁时间极短；
/// - 非池化缓冲每 [`UNPOOLED_RECLAIM_INTERVAL`] 个放走一个，泄漏的池能慢慢补回，健康的池不会因此膨胀。
pub struct SegmentedBufferManager {
    id: u64,
    name: String,
    kind: BufferKind,
    segments: Box<[Segment]>,
    capacity: u64,
    zero_on_release: bool,
    trim_interval: u64,
    cleanup_interval: Duration,
    next_evaluation: Mutex<Instant>,
    metrics: PoolMetrics,
}

/// [`SegmentedBufferManager`] 的构造器。
#[derive(Clone, Debug)]
pub struct SegmentedBufferManagerBuilder {
    name: String,
    kind: BufferKind,
    base_buffer_size: usize,
    segment_count: usize,
    capacity: u64,
    zero_on_release: bool,
    trim_interval: u64,
    cleanup_interval: Duration,
}

impl SegmentedBufferManagerBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 最小分段的缓冲尺寸，必须大于零。
    pub fn base_buffer_size(mut self, size: usize) -> Self {
        self.base_buffer_size = size;
        self
    }

    /// 分段数，取值 `1..=32`。
    pub fn segment_count(mut self, count: usize) -> Self {
        self.segment_count = count;
        self
    }

    /// 软上限（字节），在各分段间平均分配。
    pub fn capacity(mut self, bytes: u64) -> Self {
        self.capacity = bytes;
        self
    }

    pub fn zero_on_release(mut self, enabled: bool) -> Self {
        self.zero_on_release = enabled;
        self
    }

    /// 每隔多少次归还评估一次容量；`0` 关闭收缩。
    pub fn trim_interval(mut self, releases: u64) -> Self {
        self.trim_interval = releases;
        self
    }

    /// 两次容量评估之间的最短间隔。
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn build(self) -> Result<SegmentedBufferManager> {
        if self.base_buffer_size == 0 {
            return Err(BufferError::argument("base_buffer_size must be > 0"));
        }
        if self.segment_count == 0 || self.segment_count > 32 {
            return Err(BufferError::argument(format!(
                "segment_count {} outside 1..=32",
                self.segment_count
            )));
        }
        let shift = u32::try_from(self.segment_count - 1).unwrap_or(u32::MAX);
        if self.base_buffer_size.leading_zeros() < shift {
            return Err(BufferError::argument("segment buffer size overflows usize"));
        }
        Ok(self.assemble())
    }

    /// 忽略基础尺寸与分段数的设置，以默认值构造；默认值总是合法。
    pub(crate) fn build_with_default_segments(mut self, base_buffer_size: usize) -> SegmentedBufferManager {
        self.base_buffer_size = base_buffer_size.max(1).min(DEFAULT_MAX_BASE);
        self.segment_count = DEFAULT_SEGMENT_COUNT;
        self.assemble()
    }

    fn assemble(self) -> SegmentedBufferManager {
        let per_segment = self.capacity / self.segment_count as u64;
        let segments: Vec<Segment> = (0..self.segment_count)
            .map(|index| {
                let size = self.base_buffer_size << index;
                let max_pooled = usize::try_from(per_segment / size as u64).unwrap_or(usize::MAX);
                Segment::new(size, max_pooled)
            })
            .collect();

        let manager = SegmentedBufferManager {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            name: self.name,
            kind: self.kind,
            segments: segments.into_boxed_slice(),
            capacity: self.capacity,
            zero_on_release: self.zero_on_release,
            trim_interval: self.trim_interval,
            cleanup_interval: self.cleanup_interval,
            next_evaluation: Mutex::new(Instant::now()),
            metrics: PoolMetrics::default(),
        };
        debug!(
            pool = %manager.name,
            kind = ?manager.kind,
            capacity = manager.capacity,
            min_buffer = manager.min_buffer_size(),
            max_buffer = manager.max_buffer_size(),
            "segmented buffer manager created"
        );
        manager
    }
}

impl SegmentedBufferManager {
    /// 以默认参数开始构造指定存储种类的池。
    pub fn builder(kind: BufferKind) -> SegmentedBufferManagerBuilder {
        SegmentedBufferManagerBuilder {
            name: match kind {
                BufferKind::Heap => "SegmentedHeapBufferManager".to_owned(),
                BufferKind::Direct => "SegmentedDirectBufferManager".to_owned(),
            },
            kind,
            base_buffer_size: DEFAULT_BASE_BUFFER_SIZE,
            segment_count: DEFAULT_SEGMENT_COUNT,
            capacity: DEFAULT_CAPACITY,
            zero_on_release: false,
            trim_interval: DEFAULT_TRIM_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    /// 以默认参数创建池。
    pub fn new(kind: BufferKind, capacity: u64) -> Result<Self> {
        Self::builder(kind).capacity(capacity).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn min_buffer_size(&self) -> usize {
        self.segments[0].buffer_size
    }

    pub fn max_buffer_size(&self) -> usize {
        self.segments[self.segments.len() - 1].buffer_size
    }

    /// 各分段的缓冲尺寸，由小到大。
    pub fn segment_sizes(&self) -> impl Iterator<Item = usize> + '_ {
        self.segments.iter().map(|seg| seg.buffer_size)
    }

    /// 尺寸最接近 `size` 的分段：第一个 `buffer_size >= size` 的分段，超过最大分段时取最后一段。
    fn best_fit(&self, size: usize) -> usize {
        self.segments
            .iter()
            .position(|seg| seg.buffer_size >= size)
            .unwrap_or(self.segments.len() - 1)
    }

    /// 申请至少 `min` 字节的缓冲，只在缓冲尺寸不超过 `max` 的分段中寻找缓存。
    fn ensure_min_buffer(&self, min: usize, max: usize) -> Result<ByteBuf> {
        if min > self.max_buffer_size() {
            self.metrics.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
            return Err(BufferError::allocation(
                min as u64,
                "requested buffer size exceeds pool maximum",
            ));
        }
        let best = self.best_fit(min);
        for index in best..self.segments.len() {
            if self.segments[index].buffer_size > max {
                break;
            }
            if let Some(buf) = self.try_segment(index)? {
                return Ok(buf);
            }
        }
        self.allocate_unpooled(best)
    }

    /// 从与 `size` 最匹配的分段出发向两侧寻找可用缓冲。
    fn ensure_buffer(&self, size: usize) -> Result<ByteBuf> {
        let count = self.segments.len();
        let best = self.best_fit(size);
        for step in 0..count {
            if best + step < count {
                if let Some(buf) = self.try_segment(best + step)? {
                    return Ok(buf);
                }
            }
            if step > 0 && best >= step {
                if let Some(buf) = self.try_segment(best - step)? {
                    return Ok(buf);
                }
            }
        }
        self.allocate_unpooled(best)
    }

    fn try_segment(&self, index: usize) -> Result<Option<ByteBuf>> {
        let segment = &self.segments[index];
        if let Some(buf) = segment.pop() {
            self.metrics.on_hit(segment.buffer_size);
            segment.record_usage();
            return Ok(Some(buf));
        }
        if !segment.reserve_slot() {
            return Ok(None);
        }
        match ByteBuf::allocate_tagged(self.kind, segment.buffer_size, self.id, index as u32) {
            Ok(buf) => {
                self.metrics.on_new_pooled(segment.buffer_size);
                segment.record_usage();
                trace!(pool = %self.name, segment = index, size = segment.buffer_size, "segment grew");
                Ok(Some(buf))
            }
            Err(err) => {
                segment.return_slot();
                self.metrics.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    fn allocate_unpooled(&self, index: usize) -> Result<ByteBuf> {
        let size = self.segments[index].buffer_size;
        match ByteBuf::allocate_tagged(self.kind, size, self.id, UNPOOLED_CLASS) {
            Ok(buf) => {
                self.metrics.on_unpooled();
                self.segments[index].note_unpooled();
                debug!(pool = %self.name, segment = index, size, "segment exhausted; non-pooled buffer allocated");
                Ok(buf)
            }
            Err(err) => {
                self.metrics.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// 把已通过校验的缓冲放回分段，或在不能缓存时丢弃。
    fn recycle(&self, class: u32, mut buf: ByteBuf) -> Result<()> {
        buf.reset_for_reuse();
        if !buf.is_exclusive() {
            self.discard(class);
            debug!(pool = %self.name, "released buffer still has live views; storage left to them");
            return Ok(());
        }
        if self.zero_on_release {
            if let Err(err) = crate::buffers::zero(&mut buf) {
                self.discard(class);
                return Err(err);
            }
        }
        let index = match class {
            UNPOOLED_CLASS => match self.adopt(&mut buf) {
                Some(index) => index,
                None => {
                    trace!(pool = %self.name, "non-pooled buffer dropped on release");
                    return Ok(());
                }
            },
            class => class as usize,
        };
        let segment = &self.segments[index];
        self.metrics.increase_cached(segment.buffer_size);
        segment.push(buf);
        Ok(())
    }

    /// 让出池化缓冲占用的名额。
    fn discard(&self, class: u32) {
        if let Some(segment) = self.segments.get(class as usize) {
            segment.return_slot();
            self.metrics.decrease_allocated(segment.buffer_size);
        }
    }

    /// 尝试把非池化缓冲收编进尺寸相同的分段，成功时返回分段下标。
    fn adopt(&self, buf: &mut ByteBuf) -> Option<usize> {
        let index = self
            .segments
            .iter()
            .position(|seg| seg.buffer_size == buf.capacity())?;
        let segment = &self.segments[index];
        let released = segment.unpooled_released.fetch_add(1, Ordering::Relaxed) + 1;
        if released % UNPOOLED_RECLAIM_INTERVAL == 0
            || segment.free_len() >= segment.max_pooled * 2 / 3
            || !segment.reserve_slot()
        {
            return None;
        }
        if !buf.retag(index as u32) {
            segment.return_slot();
            return None;
        }
        self.metrics.allocated_bytes.fetch_add(segment.buffer_size, Ordering::Relaxed);
        trace!(pool = %self.name, segment = index, "non-pooled buffer adopted on release");
        Some(index)
    }

    /// 按近期高水位收缩各分段；同一时刻只有一个线程评估，且两次评估至少相隔 `cleanup_interval`。
    fn evaluate_capacity(&self) {
        let Some(mut next) = self.next_evaluation.try_lock() else {
            return;
        };
        let now = Instant::now();
        if now < *next {
            return;
        }
        *next = now + self.cleanup_interval;
        for (index, segment) in self.segments.iter().enumerate() {
            let desired = segment.in_use().max(segment.high_water.load(Ordering::Relaxed));
            let trimmed = segment.trim(desired);
            if trimmed > 0 {
                let bytes = trimmed * segment.buffer_size;
                self.metrics.decrease_cached(bytes);
                self.metrics.decrease_allocated(bytes);
                debug!(
                    pool = %self.name,
                    segment = index,
                    size = segment.buffer_size,
                    trimmed,
                    retained = desired,
                    "shrinking segment to recent high water mark"
                );
            }
            segment.halve_high_water();
        }
    }
}

impl BufferManager for SegmentedBufferManager {
    fn acquire(&self, min: usize) -> Result<ByteBuf> {
        let mut buf = self.ensure_min_buffer(min, usize::MAX)?;
        buf.set_limit(min)?;
        Ok(buf)
    }

    fn acquire_pref(&self, pref: usize) -> Result<ByteBuf> {
        let mut buf = self.ensure_buffer(pref)?;
        if buf.capacity() > pref {
            buf.set_limit(pref)?;
        }
        Ok(buf)
    }

    fn acquire_sum(&self, total: u64) -> Result<ByteBuf> {
        self.ensure_buffer(usize::try_from(total).unwrap_or(usize::MAX))
    }

    fn truncate(&self, mut buf: ByteBuf) -> Result<ByteBuf> {
        let class = buf.size_class();
        if buf.owner() != self.id || class == UNPOOLED_CLASS || class == 0 {
            return Ok(buf);
        }
        let used = buf.remaining();
        let seg_size = self.segments[class as usize].buffer_size;
        let previous = self.segments[class as usize - 1].buffer_size;
        if used > previous {
            return Ok(buf);
        }
        let mut replacement = match self.ensure_min_buffer(used, seg_size - 1) {
            Ok(replacement) => replacement,
            Err(err) if err.is_allocation_failure() => return Ok(buf),
            Err(err) => return Err(err),
        };
        replacement.put_buf(&mut buf)?;
        replacement.flip();
        self.release(buf)?;
        Ok(replacement)
    }

    fn release(&self, buf: ByteBuf) -> Result<()> {
        if buf.owner() != self.id {
            return Err(BufferError::ForeignBuffer(
                format!("buffer was not acquired from {}", self.name).into(),
            ));
        }
        let class = buf.size_class();
        if class != UNPOOLED_CLASS && class as usize >= self.segments.len() {
            return Err(BufferError::ForeignBuffer("unknown size class".into()));
        }
        let released = self.metrics.releases.fetch_add(1, Ordering::Relaxed) + 1;
        let outcome = self.recycle(class, buf);
        if self.trim_interval > 0 && released % self.trim_interval == 0 {
            self.evaluate_capacity();
        }
        outcome
    }

    fn capacity(&self) -> Option<u64> {
        Some(self.capacity)
    }

    fn dispose(&self) -> Result<()> {
        let mut dropped = 0usize;
        for segment in self.segments.iter() {
            let drained = segment.drain();
            let bytes = drained * segment.buffer_size;
            self.metrics.decrease_cached(bytes);
            self.metrics.decrease_allocated(bytes);
            dropped += drained;
        }
        debug!(pool = %self.name, dropped, "cached buffers discarded");
        Ok(())
    }

    fn statistics(&self) -> PoolStats {
        let acquisitions = self.metrics.acquisitions.load(Ordering::Relaxed);
        let releases = self.metrics.releases.load(Ordering::Relaxed);
        PoolStats {
            acquisitions,
            releases,
            pool_hits: self.metrics.hits.load(Ordering::Relaxed),
            unpooled_allocations: self.metrics.unpooled.load(Ordering::Relaxed),
            failed_acquisitions: self.metrics.failed_acquisitions.load(Ordering::Relaxed),
            outstanding: acquisitions.saturating_sub(releases),
            allocated_bytes: self.metrics.allocated_bytes.load(Ordering::Relaxed) as u64,
            cached_bytes: self.metrics.cached_bytes.load(Ordering::Relaxed) as u64,
            capacity: Some(self.capacity),
        }
    }
}

impl fmt::Debug for SegmentedBufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, segments=[", self.name, self.statistics())?;
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "{}B:{}/{}",
                segment.buffer_size,
                segment.free.lock().len(),
                segment.pooled.load(Ordering::Relaxed)
            )?;
        }
        f.write_str("])")
    }
}

/// 单个尺寸等级。
struct Segment {
    buffer_size: usize,
    max_pooled: usize,
    /// 已创建的池化缓冲数（在途与空闲之和）。
    pooled: AtomicUsize,
    /// 上次评估以来观察到的最大在途数。
    high_water: AtomicUsize,
    unpooled_released: AtomicU64,
    free: Mutex<Vec<ByteBuf>>,
}

impl Segment {
    fn new(buffer_size: usize, max_pooled: usize) -> Self {
        Self {
            buffer_size,
            max_pooled,
            pooled: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            unpooled_released: AtomicU64::new(0),
            free: Mutex::new(Vec::new()),
        }
    }

    fn pop(&self) -> Option<ByteBuf> {
        self.free.lock().pop()
    }

    fn push(&self, buf: ByteBuf) {
        self.free.lock().push(buf);
    }

    fn free_len(&self) -> usize {
        self.free.lock().len()
    }

    fn in_use(&self) -> usize {
        let free = self.free_len();
        self.pooled.load(Ordering::Acquire).saturating_sub(free)
    }

    fn record_usage(&self) {
        self.high_water.fetch_max(self.in_use(), Ordering::Relaxed);
    }

    /// 分段已满才会分配非池化缓冲，此时在途数至少是池化上限。
    fn note_unpooled(&self) {
        self.high_water.fetch_max(self.max_pooled, Ordering::Relaxed);
    }

    fn halve_high_water(&self) {
        let _ = self
            .high_water
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| Some(current / 2));
    }

    /// 释放最久未用的空闲缓冲，直到池化数不超过 `desired` 或空闲栈为空；返回释放个数。
    fn trim(&self, desired: usize) -> usize {
        let mut free = self.free.lock();
        let excess = self.pooled.load(Ordering::Acquire).saturating_sub(desired);
        let count = excess.min(free.len());
        let _released: Vec<ByteBuf> = free.drain(..count).collect();
        drop(free);
        saturating_sub(&self.pooled, count);
        count
    }

    /// 预留一个池化名额，达到上限时返回 `false`。
    fn reserve_slot(&self) -> bool {
        self.pooled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_pooled).then_some(current + 1)
            })
            .is_ok()
    }

    fn return_slot(&self) {
        saturating_sub(&self.pooled, 1);
    }

    /// 清空空闲栈，返回丢弃的缓冲数。
    fn drain(&self) -> usize {
        let drained = std::mem::take(&mut *self.free.lock()).len();
        saturating_sub(&self.pooled, drained);
        drained
    }
}

#[derive(Default)]
struct PoolMetrics {
    acquisitions: AtomicU64,
    releases: AtomicU64,
    hits: AtomicU64,
    unpooled: AtomicU64,
    failed_acquisitions: AtomicU64,
    allocated_bytes: AtomicUsize,
    cached_bytes: AtomicUsize,
}

impl PoolMetrics {
    fn on_hit(&self, size: usize) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.decrease_cached(size);
    }

    fn on_new_pooled(&self, size: usize) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn on_unpooled(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.unpooled.fetch_add(1, Ordering::Relaxed);
    }

    fn increase_cached(&self, size: usize) {
        self.cached_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn decrease_cached(&self, size: usize) {
        saturating_sub(&self.cached_bytes, size);
    }

    fn decrease_allocated(&self, size: usize) {
        saturating_sub(&self.allocated_bytes, size);
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}
