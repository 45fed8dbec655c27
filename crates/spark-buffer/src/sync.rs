//! 原子类型入口：常规构建使用 `core::sync::atomic`，模型检查时切换到 `loom`。
//!
//! 序列访问标记与共享 slab 引用计数都从这里取原子类型，
//! 以便 `RUSTFLAGS="--cfg loom" cargo test --features loom-model` 穷举它们的交错。

#[cfg(not(any(loom, spark_loom)))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
#[cfg(any(loom, spark_loom))]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
