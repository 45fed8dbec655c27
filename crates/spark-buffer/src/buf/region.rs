use std::{
    alloc::{self, Layout},
    ptr::{self, NonNull},
};

use crate::error::{BufferError, Result};

/// 原生（直接）缓冲的对齐要求。
pub const DIRECT_ALIGN: usize = 8;

/// 未归属任何池的存储区标识。
pub(crate) const NO_OWNER: u64 = 0;

/// 池分配但不参与缓存的存储区使用的尺寸等级。
pub(crate) const UNPOOLED_CLASS: u32 = u32::MAX;

/// 缓冲的存储种类。
///
/// - `Heap`：堆上字节数组，可通过 [`ByteBuf::array`](super::ByteBuf::array) 取得数组视图；
/// - `Direct`：按 8 字节对齐直接向全局分配器申请的原生内存，不提供数组视图。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BufferKind {
    Heap,
    Direct,
}

/// 一段固定长度的共享存储区。
///
/// # 契约说明（What）
/// - 存储在构造时清零，长度不可变，`Drop` 时按种类归还给对应分配路径；
/// - `owner` 在构造时写定，是创建它的池的标识（`NO_OWNER` 表示无归属）；`class` 是池内的尺寸等级，
///   池据此识别自己发出的缓冲，只有独占存储区时才能改写（池收编非池化缓冲时使用）；
/// - 多个 `ByteBuf` 视图通过 `Arc<Region>` 共享同一存储区。
///
/// # 并发安全性说明
/// - 存储区本身只持有裸指针；`ByteBuf` 只在 `Arc<Region>` 引用计数为 1 且持有 `&mut` 时写入，
///   共享中的存储区只会被读取。
pub(crate) struct Region {
    ptr: NonNull<u8>,
    len: usize,
    kind: BufferKind,
    owner: u64,
    class: u32,
}

impl Region {
    /// 申请一段清零的存储区；分配器拒绝时返回 `AllocationFailed`。
    pub(crate) fn allocate(kind: BufferKind, len: usize, owner: u64, class: u32) -> Result<Self> {
        let ptr = match kind {
            BufferKind::Heap => {
                let mut storage: Vec<u8> = Vec::new();
                storage
                    .try_reserve_exact(len)
                    .map_err(|_| BufferError::allocation(len as u64, "heap reservation refused"))?;
                storage.resize(len, 0);
                into_raw(storage.into_boxed_slice())
            }
            BufferKind::Direct => {
                if len == 0 {
                    NonNull::<u64>::dangling().cast::<u8>()
                } else {
                    let layout = Layout::from_size_align(len, DIRECT_ALIGN).map_err(|_| {
                        BufferError::allocation(len as u64, "direct layout overflow")
                    })?;
                    // SAFETY: layout 大小非零。
                    let raw = unsafe { alloc::alloc_zeroed(layout) };
                    NonNull::new(raw).ok_or_else(|| {
                        BufferError::allocation(len as u64, "direct allocation refused")
                    })?
                }
            }
        };
        Ok(Self {
            ptr,
            len,
            kind,
            owner,
            class,
        })
    }

    /// 接管一个已有的堆数组，不复制内容。
    pub(crate) fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            ptr: into_raw(bytes.into_boxed_slice()),
            len,
            kind: BufferKind::Heap,
            owner: NO_OWNER,
            class: UNPOOLED_CLASS,
        }
    }

    /// 零长度的原生存储区，不经过分配器。
    pub(crate) fn empty_direct() -> Self {
        Self {
            ptr: NonNull::<u64>::dangling().cast::<u8>(),
            len: 0,
            kind: BufferKind::Direct,
            owner: NO_OWNER,
            class: UNPOOLED_CLASS,
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn kind(&self) -> BufferKind {
        self.kind
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub(crate) fn class(&self) -> u32 {
        self.class
    }

    pub(crate) fn set_class(&mut self, class: u32) {
        self.class = class;
    }

    /// 存储区起始地址，作为检查型池追踪在途缓冲的键。
    pub(crate) fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

fn into_raw(boxed: Box<[u8]>) -> NonNull<u8> {
    let raw = Box::into_raw(boxed) as *mut u8;
    // SAFETY: Box::into_raw 永不返回空指针。
    unsafe { NonNull::new_unchecked(raw) }
}

impl Drop for Region {
    fn drop(&mut self) {
        match self.kind {
            BufferKind::Heap => {
                let slice = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
                // SAFETY: 指针来自对应长度的 Box<[u8]>，且仅在此处归还一次。
                drop(unsafe { Box::from_raw(slice) });
            }
            BufferKind::Direct => {
                if self.len != 0 {
                    if let Ok(layout) = Layout::from_size_align(self.len, DIRECT_ALIGN) {
                        // SAFETY: 与 allocate 中的 layout 完全一致。
                        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
                    }
                }
            }
        }
    }
}

// SAFETY: 跨线程共享的存储区只被读取：写入要求 `Arc::get_mut` 成功，即不存在其它视图。
// 存储区的分配与释放本身没有线程亲和性。
unsafe impl Send for Region {}
unsafe impl Sync for Region {}
