//! 进程级缓冲配置。
//!
//! # 模块角色（Why）
//! - 三个进程级池在首次使用时构造，构造参数（上限、基础尺寸、是否检查、是否清零）
//!   统一由 [`BufferConfig`] 提供，进程内只读取一次，不支持热更新；
//! - 释放位置追踪等调试开关也集中在这里。
//!
//! # 加载顺序（How）
//! 1. 若调用方在首次使用前调用了 [`install`]，直接采用安装的配置；
//! 2. 否则读取 `SPARK_BUFFER_CONFIG` 指向的 TOML 文件（未设置时取默认值）；
//! 3. 再以 `SPARK_BUFFER_*` 环境变量逐项覆盖。
//!
//! 加载失败由 [`try_global`] 原样上报；[`global`] 只在无法上报错误的路径上使用，失败时告警并退回默认值。
//!
//! # 文件格式（What）
//! ```toml
//! zero_on_release = false
//! track_dispose_location = true
//!
//! [direct]
//! max_pool_size = "256m"
//! base_buffer_size = "1k"
//! segment_count = 7
//! checked = false
//! ```

use std::{fmt, fs, str::FromStr, sync::OnceLock};

use serde::Deserialize;
use tracing::warn;

use crate::{
    buf::BufferKind,
    error::{BufferError, Result},
};

/// 指向 TOML 配置文件的环境变量。
pub const CONFIG_PATH_ENV: &str = "SPARK_BUFFER_CONFIG";

const ENV_PREFIX: &str = "SPARK_BUFFER_";

static GLOBAL: OnceLock<BufferConfig> = OnceLock::new();

/// 三个进程级池的用途。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PoolRole {
    Heap,
    Direct,
    Network,
}

impl PoolRole {
    pub fn kind(self) -> BufferKind {
        match self {
            Self::Heap => BufferKind::Heap,
            Self::Direct | Self::Network => BufferKind::Direct,
        }
    }

    /// 未配置上限时占内存天花板的比例分母。
    pub fn ceiling_divisor(self) -> u64 {
        match self {
            Self::Heap | Self::Direct => 16,
            Self::Network => 32,
        }
    }

    pub fn default_base_buffer_size(self) -> usize {
        match self {
            Self::Heap | Self::Direct => 1024,
            Self::Network => 16 * 1024,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Heap => "heap",
            Self::Direct => "direct",
            Self::Network => "network",
        }
    }
}

/// 顶层配置。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    /// 归还到池时清零缓冲内容。
    pub zero_on_release: bool,
    /// 记录序列首次释放的调用栈，重复释放时附在错误中。
    pub track_dispose_location: bool,
    pub heap: PoolConfig,
    pub direct: PoolConfig,
    pub network: PoolConfig,
}

/// 单个进程级池的配置。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// 池的软上限；未设置时按内存天花板的固定比例计算。
    pub max_pool_size: Option<MemorySize>,
    /// 最小分段的缓冲尺寸；未设置时使用各池的默认值。
    pub base_buffer_size: Option<MemorySize>,
    /// 分段数；未设置时为 7。
    pub segment_count: Option<usize>,
    /// 是否套上检查型包装。
    pub checked: bool,
}

impl BufferConfig {
    /// 从 TOML 文本解析。
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| BufferError::InvalidConfig(err.to_string().into()))
    }

    /// 依照文件与环境变量加载配置。
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                let raw = fs::read_to_string(&path).map_err(|err| {
                    BufferError::InvalidConfig(format!("reading {path}: {err}").into())
                })?;
                Self::from_toml_str(&raw)?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// 以 `lookup` 提供的 `SPARK_BUFFER_*` 变量覆盖对应字段。
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));
        if let Some(raw) = var("ZERO_ON_RELEASE") {
            self.zero_on_release = parse_bool("ZERO_ON_RELEASE", &raw)?;
        }
        if let Some(raw) = var("TRACK_DISPOSE") {
            self.track_dispose_location = parse_bool("TRACK_DISPOSE", &raw)?;
        }
        for role in [PoolRole::Heap, PoolRole::Direct, PoolRole::Network] {
            let section = role.name().to_ascii_uppercase();
            let pool = self.pool_mut(role);
            if let Some(raw) = var(&format!("{section}_MAX_POOL_SIZE")) {
                pool.max_pool_size = Some(raw.parse()?);
            }
            if let Some(raw) = var(&format!("{section}_BASE_BUFFER_SIZE")) {
                pool.base_buffer_size = Some(raw.parse()?);
            }
            if let Some(raw) = var(&format!("{section}_SEGMENT_COUNT")) {
                pool.segment_count = Some(raw.trim().parse().map_err(|_| {
                    BufferError::InvalidConfig(
                        format!("{section}_SEGMENT_COUNT: `{raw}` is not an integer").into(),
                    )
                })?);
            }
            if let Some(raw) = var(&format!("{section}_CHECKED")) {
                pool.checked = parse_bool("CHECKED", &raw)?;
            }
        }
        Ok(())
    }

    pub fn pool(&self, role: PoolRole) -> &PoolConfig {
        match role {
            PoolRole::Heap => &self.heap,
            PoolRole::Direct => &self.direct,
            PoolRole::Network => &self.network,
        }
    }

    fn pool_mut(&mut self, role: PoolRole) -> &mut PoolConfig {
        match role {
            PoolRole::Heap => &mut self.heap,
            PoolRole::Direct => &mut self.direct,
            PoolRole::Network => &mut self.network,
        }
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BufferError::InvalidConfig(
            format!("{ENV_PREFIX}{name}: `{raw}` is not a boolean").into(),
        )),
    }
}

/// 在首次读取之前安装进程级配置；已读取或已安装时返回状态错误。
pub fn install(config: BufferConfig) -> Result<()> {
    GLOBAL
        .set(config)
        .map_err(|_| BufferError::state("buffer configuration is already initialized"))
}

/// 进程级配置，首次调用时加载。
///
/// 加载失败时返回 `InvalidConfig` 且不缓存任何值，调用方修正环境后可以重试，
/// 也可以改用 [`install`] 显式安装。
pub fn try_global() -> Result<&'static BufferConfig> {
    resolve(&GLOBAL, BufferConfig::load)
}

/// 同 [`try_global`]，但加载失败时记录告警并安装默认值。
///
/// 供释放路径这类无法上报错误的地方读取调试开关；需要看到配置错误的调用方应使用 [`try_global`]。
pub fn global() -> &'static BufferConfig {
    try_global().unwrap_or_else(|err| {
        warn!(error = %err, code = err.code(), "buffer configuration rejected; using defaults");
        GLOBAL.get_or_init(BufferConfig::default)
    })
}

fn resolve(
    cell: &OnceLock<BufferConfig>,
    load: impl FnOnce() -> Result<BufferConfig>,
) -> Result<&BufferConfig> {
    if let Some(config) = cell.get() {
        return Ok(config);
    }
    let loaded = load()?;
    Ok(cell.get_or_init(|| loaded))
}

/// 字节数，配置中可写作整数或带 `k`/`m`/`g`/`t` 后缀的字符串（以 1024 为进制）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "RawMemorySize")]
pub struct MemorySize(pub u64);

impl MemorySize {
    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for MemorySize {
    type Err = BufferError;

    fn from_str(raw: &str) -> Result<Self> {
        let text = raw.trim().to_ascii_lowercase();
        let text = text.strip_suffix('b').unwrap_or(&text);
        let (digits, shift) = match text.chars().last() {
            Some('k') => (&text[..text.len() - 1], 10),
            Some('m') => (&text[..text.len() - 1], 20),
            Some('g') => (&text[..text.len() - 1], 30),
            Some('t') => (&text[..text.len() - 1], 40),
            _ => (text, 0),
        };
        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|_| BufferError::InvalidConfig(format!("`{raw}` is not a memory size").into()))?;
        value
            .checked_mul(1u64 << shift)
            .map(MemorySize)
            .ok_or_else(|| BufferError::InvalidConfig(format!("`{raw}` overflows u64").into()))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(&str, u32); 4] = [("TB", 40), ("GB", 30), ("MB", 20), ("KB", 10)];
        for (unit, shift) in UNITS {
            let scale = 1u64 << shift;
            if self.0 >= scale && self.0 % scale == 0 {
                return write!(f, "{}{unit}", self.0 / scale);
            }
        }
        write!(f, "{}B", self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMemorySize {
    Bytes(u64),
    Text(String),
}

impl TryFrom<RawMemorySize> for MemorySize {
    type Error = BufferError;

    fn try_from(raw: RawMemorySize) -> Result<Self> {
        match raw {
            RawMemorySize::Bytes(bytes) => Ok(MemorySize(bytes)),
            RawMemorySize::Text(text) => text.parse(),
        }
    }
}
