//! 缓冲序列上的读写流。
//!
//! # 模块角色（Why）
//! - [`BufferSequenceInputStream`] 在一个序列上顺序读取字节与大端标量，支持标记/回退，
//!   读到末尾时可以顺带释放序列；
//! - [`BufferSequenceOutputStream`] 把写入累积到从池申请的缓冲中，最终冻结为不可变序列；
//! - 两者都是单一所有者的短生命周期对象，不在线程间共享。
//!
//! # 编码约定（What）
//! - 多字节标量一律大端；`char` 指一个 UTF-16 代码单元；
//! - `utf` 为修改版 UTF-8，前缀是 `u16` 大端字节长度。

mod input;
mod output;
mod utf;

pub use input::BufferSequenceInputStream;
pub use output::BufferSequenceOutputStream;
