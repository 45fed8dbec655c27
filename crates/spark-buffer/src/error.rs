//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为缓冲池、缓冲序列与序列流提供集中的错误定义，调用方据此区分“参数不合法”“越界”
//!   “池无法立即分配”“生命周期状态错误”四类问题；
//! - 所有错误均同步返回给直接调用方，核心路径不记录、不吞掉、不降级可返回的错误。
//!
//! ## 设计要求（What）
//! - 错误类型派生 [`thiserror::Error`]，兼容 `std::error::Error` 与 `?` 传播；
//! - 每个变体提供稳定的 `<domain>.<reason>` 错误码，便于日志检索与告警聚合；
//! - [`BufferError::kind`] 将细粒度变体归并为 [`ErrorKind`]，供上层编写重试或熔断策略。

use std::{borrow::Cow, io};

use thiserror::Error;

/// 本 crate 统一使用的结果别名。
pub type Result<T, E = BufferError> = core::result::Result<T, E>;

/// 错误码常量，保持与日志、监控中的字符串一致。
pub mod codes {
    pub const ARGUMENT: &str = "buffer.argument";
    pub const BOUNDS: &str = "buffer.bounds";
    pub const EOF: &str = "buffer.eof";
    pub const ALLOCATION: &str = "buffer.allocation";
    pub const STATE: &str = "buffer.state";
    pub const DISPOSED: &str = "buffer.disposed";
    pub const CLOSED: &str = "buffer.closed";
    pub const MARK: &str = "buffer.mark";
    pub const FOREIGN: &str = "buffer.foreign";
    pub const SHARED: &str = "buffer.shared";
    pub const CONFIG: &str = "buffer.config";
    pub const UTF: &str = "buffer.utf";
}

/// 错误大类。
///
/// - **Argument**：构造参数、切片区间、拷贝区间等调用方输入非法，或配置、UTF 数据格式错误；
/// - **Bounds**：下标或字节区间越出序列/缓冲的有效范围，包括读到流尾；
/// - **Allocation**：池无法立即满足 `acquire*` 请求，核心不会重试；
/// - **State**：对象生命周期被违反，例如重复释放、读取已关闭的流。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Argument,
    Bounds,
    Allocation,
    State,
}

/// 缓冲引擎的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：让池、序列、流三个层次共享一套错误语义，调用方只需匹配一种类型；
/// - **契约 (What)**：
///   - 所有变体满足 `Send + Sync + 'static`，可跨线程传播；
///   - `code()` 返回稳定字符串，`kind()` 返回大类；
///   - 可通过 `From` 转换为 [`std::io::Error`]，供 `io::Read`/`io::Write` 适配层直接返回；
/// - **设计权衡 (Trade-offs)**：上下文以 `Cow<'static, str>` 保存，静态描述零分配，
///   需要拼接下标等运行时信息时才分配字符串。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BufferError {
    /// 参数非法。
    #[error("invalid argument: {0}")]
    InvalidArgument(Cow<'static, str>),

    /// 下标或区间越界。
    #[error("out of bounds: {0}")]
    OutOfBounds(Cow<'static, str>),

    /// 读取时遇到流尾。
    #[error("unexpected end of stream: {0}")]
    UnexpectedEof(Cow<'static, str>),

    /// 池无法立即满足分配请求。
    ///
    /// - `requested`：请求的字节数，便于排查是单次请求过大还是池容量耗尽。
    #[error("buffer allocation of {requested} bytes failed: {reason}")]
    AllocationFailed {
        requested: u64,
        reason: Cow<'static, str>,
    },

    /// 通用的生命周期状态错误。
    #[error("illegal state: {0}")]
    IllegalState(Cow<'static, str>),

    /// 序列已被释放。
    ///
    /// - `first_dispose_site`：开启释放位置追踪时记录首次释放的调用栈。
    #[error("buffer sequence already disposed{}", disposed_suffix(.first_dispose_site))]
    AlreadyDisposed { first_dispose_site: Option<String> },

    /// 流已关闭。
    #[error("stream is closed")]
    StreamClosed,

    /// `reset` 时没有可用的标记，或自标记以来已消费超过读预算。
    #[error("invalid mark: {0}")]
    MarkInvalid(Cow<'static, str>),

    /// 归还的缓冲不属于目标池，或已被归还过。
    #[error("buffer does not belong to this pool: {0}")]
    ForeignBuffer(Cow<'static, str>),

    /// 写入要求独占存储区，但仍有其它视图（复制视图、切片、序列中的原件）共享它。
    #[error("buffer storage is shared by {views} views; writes need exclusive access")]
    SharedStorage { views: usize },

    /// 配置加载或安装失败。
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// 修改版 UTF-8 数据格式错误或超长。
    #[error("malformed utf data: {0}")]
    MalformedUtf(Cow<'static, str>),
}

fn disposed_suffix(site: &Option<String>) -> String {
    match site {
        Some(site) => format!("; first disposed at:\n{site}"),
        None => String::new(),
    }
}

impl BufferError {
    /// 构造参数错误。
    pub fn argument(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// 构造越界错误。
    pub fn bounds(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::OutOfBounds(msg.into())
    }

    /// 构造流尾错误。
    pub fn eof(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::UnexpectedEof(msg.into())
    }

    /// 构造分配失败错误。
    pub fn allocation(requested: u64, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::AllocationFailed {
            requested,
            reason: reason.into(),
        }
    }

    /// 构造状态错误。
    pub fn state(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// 错误所属大类。
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::InvalidConfig(_) | Self::MalformedUtf(_) => {
                ErrorKind::Argument
            }
            Self::OutOfBounds(_) | Self::UnexpectedEof(_) => ErrorKind::Bounds,
            Self::AllocationFailed { .. } => ErrorKind::Allocation,
            Self::IllegalState(_)
            | Self::AlreadyDisposed { .. }
            | Self::StreamClosed
            | Self::MarkInvalid(_)
            | Self::ForeignBuffer(_)
            | Self::SharedStorage { .. } => ErrorKind::State,
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => codes::ARGUMENT,
            Self::OutOfBounds(_) => codes::BOUNDS,
            Self::UnexpectedEof(_) => codes::EOF,
            Self::AllocationFailed { .. } => codes::ALLOCATION,
            Self::IllegalState(_) => codes::STATE,
            Self::AlreadyDisposed { .. } => codes::DISPOSED,
            Self::StreamClosed => codes::CLOSED,
            Self::MarkInvalid(_) => codes::MARK,
            Self::ForeignBuffer(_) => codes::FOREIGN,
            Self::SharedStorage { .. } => codes::SHARED,
            Self::InvalidConfig(_) => codes::CONFIG,
            Self::MalformedUtf(_) => codes::UTF,
        }
    }

    /// 是否为池分配失败，`allocate_direct` 的退避逻辑据此判断是否缩小块尺寸。
    pub fn is_allocation_failure(&self) -> bool {
        self.kind() == ErrorKind::Allocation
    }
}

impl From<BufferError> for io::Error {
    fn from(err: BufferError) -> Self {
        let kind = match &err {
            BufferError::UnexpectedEof(_) => io::ErrorKind::UnexpectedEof,
            BufferError::MalformedUtf(_) => io::ErrorKind::InvalidData,
            BufferError::AllocationFailed { .. } => io::ErrorKind::OutOfMemory,
            other => match other.kind() {
                ErrorKind::Argument | ErrorKind::Bounds => io::ErrorKind::InvalidInput,
                _ => io::ErrorKind::Other,
            },
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_kind() {
        let cases = [
            (BufferError::argument("x"), ErrorKind::Argument, codes::ARGUMENT),
            (BufferError::eof("x"), ErrorKind::Bounds, codes::EOF),
            (BufferError::allocation(8, "x"), ErrorKind::Allocation, codes::ALLOCATION),
            (BufferError::StreamClosed, ErrorKind::State, codes::CLOSED),
            (BufferError::SharedStorage { views: 2 }, ErrorKind::State, codes::SHARED),
            (
                BufferError::MalformedUtf("bad".into()),
                ErrorKind::Argument,
                codes::UTF,
            ),
        ];
        for (err, kind, code) in cases {
            assert_eq!(err.kind(), kind);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn disposed_message_carries_site() {
        let err = BufferError::AlreadyDisposed {
            first_dispose_site: Some("frame#0".to_owned()),
        };
        assert!(err.to_string().contains("frame#0"));
        let plain = BufferError::AlreadyDisposed {
            first_dispose_site: None,
        };
        assert_eq!(plain.to_string(), "buffer sequence already disposed");
    }

    #[test]
    fn io_conversion_maps_eof() {
        let io_err: io::Error = BufferError::eof("read_i32").into();
        assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
