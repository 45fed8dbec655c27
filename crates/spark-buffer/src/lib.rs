//! `spark-buffer`：池化缓冲、缓冲序列与序列流读写的零拷贝缓冲引擎。
//!
//! # 模块定位（Why）
//! - 协议栈中的消息以“缓冲序列”表示并在各层之间传递，从不为了拼接或转交而复制字节；
//! - 缓冲来自按尺寸分段的池，序列在释放时恰好一次地把缓冲还给池，
//!   热路径上的内存申请因此摊还为一次出栈。
//!
//! # 设计概要（How）
//! - [`buf`]：`ByteBuf` 视图，以 `Arc` 共享存储，复制视图与切片都不拷贝字节；
//! - [`manager`]：[`BufferManager`] 契约、分段池与检查型/不可释放包装，以及进程级单例池；
//! - [`sequence`]：[`BufferSequence`] 契约及按缓冲个数特化的变体；
//! - [`buffers`]：分配策略、切片、拷贝、比较、清零、CRC 与调试格式化；
//! - [`stream`]：在序列上读写大端标量与修改版 UTF-8 的读写流；
//! - [`config`]：TOML 配置与环境变量覆盖，决定单例池的尺寸与清零策略。
//!
//! # 并发约定（What）
//! - 池与序列满足 `Send + Sync`，可被任意线程共享；
//! - 读写流是单一所有者的短生命周期对象。

pub mod buf;
pub mod buffers;
pub mod config;
pub mod error;
pub mod manager;
pub mod sequence;
pub mod stream;

mod sync;

pub use buf::{BufferKind, ByteBuf, ByteOrder};
pub use config::BufferConfig;
pub use error::{BufferError, ErrorKind, Result};
pub use manager::{BufferManager, PoolRef, PoolStats, SegmentedBufferManager};
pub use sequence::{BoxedSequence, BufferSequence};
pub use stream::{BufferSequenceInputStream, BufferSequenceOutputStream};
