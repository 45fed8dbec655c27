use std::{fs, sync::Arc, sync::OnceLock};

use tracing::{info, warn};

use super::{
    CheckedBufferManager, ImmortalBufferManager, PoolRef, SegmentedBufferManager,
    SegmentedBufferManagerBuilder, segmented::DEFAULT_SEGMENT_COUNT,
};
use crate::{
    config::{self, BufferConfig, PoolRole},
    error::Result,
};

/// 无法探测内存时使用的天花板估计值。
const FALLBACK_CEILING: u64 = 1 << 30;

static CEILING: OnceLock<u64> = OnceLock::new();
static HEAP: OnceLock<PoolRef> = OnceLock::new();
static DIRECT: OnceLock<PoolRef> = OnceLock::new();
static NETWORK: OnceLock<PoolRef> = OnceLock::new();

/// 进程级堆缓冲池。
///
/// 配置无法加载或池参数非法时告警并以默认参数建立；需要看到这类错误时使用 [`try_heap`]。
pub fn heap() -> PoolRef {
    singleton(&HEAP, PoolRole::Heap)
}

/// 进程级原生缓冲池；退化规则同 [`heap`]。
pub fn direct() -> PoolRef {
    singleton(&DIRECT, PoolRole::Direct)
}

/// 面向网络收发的进程级原生缓冲池，基础缓冲更大、上限比例更小；退化规则同 [`heap`]。
pub fn network() -> PoolRef {
    singleton(&NETWORK, PoolRole::Network)
}

/// 进程级堆缓冲池；配置或池参数非法时返回错误且不建立单例。
pub fn try_heap() -> Result<PoolRef> {
    try_singleton(&HEAP, PoolRole::Heap)
}

pub fn try_direct() -> Result<PoolRef> {
    try_singleton(&DIRECT, PoolRole::Direct)
}

pub fn try_network() -> Result<PoolRef> {
    try_singleton(&NETWORK, PoolRole::Network)
}

fn try_singleton(cell: &'static OnceLock<PoolRef>, role: PoolRole) -> Result<PoolRef> {
    if let Some(pool) = cell.get() {
        return Ok(Arc::clone(pool));
    }
    let pool = build(config::try_global()?, role)?;
    Ok(Arc::clone(cell.get_or_init(|| pool)))
}

fn singleton(cell: &'static OnceLock<PoolRef>, role: PoolRole) -> PoolRef {
    match try_singleton(cell, role) {
        Ok(pool) => pool,
        Err(err) => {
            warn!(pool = role.name(), error = %err, code = err.code(), "pool configuration rejected; using defaults");
            Arc::clone(cell.get_or_init(|| build_lenient(config::global(), role)))
        }
    }
}

/// 按配置构造一个进程级池，参数非法时返回 `InvalidArgument`。
fn build(config: &BufferConfig, role: PoolRole) -> Result<PoolRef> {
    let plan = PoolPlan::new(config, role);
    let manager = segmented(role, plan.capacity, plan.base, plan.segments, config.zero_on_release)?;
    Ok(finish(manager, config, role, &plan))
}

/// 同 [`build`]，但参数非法时退回默认分段，保证单例总能建立。
fn build_lenient(config: &BufferConfig, role: PoolRole) -> PoolRef {
    let plan = PoolPlan::new(config, role);
    let manager = match segmented(role, plan.capacity, plan.base, plan.segments, config.zero_on_release) {
        Ok(manager) => manager,
        Err(err) => {
            warn!(pool = role.name(), error = %err, "invalid pool parameters; using default segments");
            builder(role, plan.capacity, config.zero_on_release)
                .build_with_default_segments(role.default_base_buffer_size())
        }
    };
    finish(manager, config, role, &plan)
}

/// 由配置推出的池参数。
struct PoolPlan {
    capacity: u64,
    base: usize,
    segments: usize,
}

impl PoolPlan {
    fn new(config: &BufferConfig, role: PoolRole) -> Self {
        let pool_config = config.pool(role);
        let capacity = pool_config
            .max_pool_size
            .map(|size| size.bytes())
            .unwrap_or_else(|| memory_ceiling() / role.ceiling_divisor());
        let base = pool_config
            .base_buffer_size
            .and_then(|size| usize::try_from(size.bytes()).ok())
            .unwrap_or_else(|| role.default_base_buffer_size());
        let segments = pool_config.segment_count.unwrap_or(DEFAULT_SEGMENT_COUNT);
        Self { capacity, base, segments }
    }
}

/// 记录初始化日志，按需套上检查型包装，最后包成不可释放的单例。
fn finish(manager: SegmentedBufferManager, config: &BufferConfig, role: PoolRole, plan: &PoolPlan) -> PoolRef {
    let pool_config = config.pool(role);
    info!(
        pool = role.name(),
        capacity = plan.capacity,
        base_buffer = plan.base,
        checked = pool_config.checked,
        zero_on_release = config.zero_on_release,
        "process-wide buffer manager initialized"
    );

    let mut pool: PoolRef = Arc::new(manager);
    if pool_config.checked {
        pool = Arc::new(CheckedBufferManager::new(pool));
    }
    Arc::new(ImmortalBufferManager::new(pool))
}

fn builder(role: PoolRole, capacity: u64, zero_on_release: bool) -> SegmentedBufferManagerBuilder {
    SegmentedBufferManager::builder(role.kind())
        .name(format!("{}BufferManager", role.name()))
        .capacity(capacity)
        .zero_on_release(zero_on_release)
}

fn segmented(
    role: PoolRole,
    capacity: u64,
    base: usize,
    segments: usize,
    zero_on_release: bool,
) -> Result<SegmentedBufferManager> {
    builder(role, capacity, zero_on_release)
        .base_buffer_size(base)
        .segment_count(segments)
        .build()
}

/// 进程的内存天花板：cgroup 内存上限优先，其次物理内存总量，最后是 1 GiB 的固定估计。
///
/// 首次调用时计算并缓存。
pub fn memory_ceiling() -> u64 {
    *CEILING.get_or_init(|| {
        let ceiling = cgroup_limit()
            .or_else(physical_memory)
            .unwrap_or(FALLBACK_CEILING);
        info!(ceiling, "memory ceiling resolved");
        ceiling
    })
}

fn cgroup_limit() -> Option<u64> {
    let v2 = fs::read_to_string("/sys/fs/cgroup/memory.max").ok();
    let v1 = || fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes").ok();
    v2.and_then(|raw| parse_cgroup_limit(&raw))
        .or_else(|| v1().and_then(|raw| parse_cgroup_limit(&raw)))
}

/// 解析 cgroup 限额文本；`max` 或接近 `i64::MAX` 的值表示未设限。
fn parse_cgroup_limit(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw == "max" {
        return None;
    }
    let limit: u64 = raw.parse().ok()?;
    (limit > 0 && limit < (1u64 << 62)).then_some(limit)
}

fn physical_memory() -> Option<u64> {
    let raw = fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total(&raw)
}

fn parse_meminfo_total(raw: &str) -> Option<u64> {
    let line = raw.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kib: u64 = line
        .trim_start_matches("MemTotal:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    kib.checked_mul(1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::codes, manager::BufferManager};

    #[test]
    fn singletons_reject_dispose() {
        let pool = heap();
        let err = pool.dispose().expect_err("进程级池不可释放");
        assert_eq!(err.code(), codes::STATE);
        assert!(Arc::ptr_eq(&pool, &heap()));
    }

    #[test]
    fn network_pool_is_direct() {
        let buf = network().acquire(100).expect("申请网络缓冲");
        assert!(buf.is_direct());
        assert_eq!(buf.remaining(), 100);
        network().release(buf).expect("归还");
    }

    #[test]
    fn strict_build_reports_invalid_segments() {
        let config = BufferConfig::from_toml_str(
            "[heap]\nmax_pool_size = \"1m\"\nsegment_count = 0",
        )
        .expect("解析配置");
        let err = build(&config, PoolRole::Heap).expect_err("分段数非法");
        assert_eq!(err.code(), codes::ARGUMENT);

        let pool = build_lenient(&config, PoolRole::Heap);
        let buf = pool.acquire(64 * 1024).expect("默认分段覆盖 64 KiB");
        assert_eq!(buf.capacity(), 64 * 1024);
        pool.release(buf).expect("归还");
    }

    #[test]
    fn fallible_entry_point_returns_the_shared_singleton() {
        let pool = try_direct().expect("默认环境下可以建立");
        assert!(Arc::ptr_eq(&pool, &direct()));
    }

    #[test]
    fn cgroup_text_forms() {
        assert_eq!(parse_cgroup_limit("max\n"), None);
        assert_eq!(parse_cgroup_limit("536870912\n"), Some(536_870_912));
        assert_eq!(parse_cgroup_limit("9223372036854771712"), None);
    }

    #[test]
    fn meminfo_total_parses() {
        let raw = "MemTotal:       16318412 kB\nMemFree:         1000 kB\n";
        assert_eq!(parse_meminfo_total(raw), Some(16_318_412 * 1024));
        assert!(memory_ceiling() > 0);
    }
}
