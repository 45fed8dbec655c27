//! `ByteBuf`：带位置/上限窗口与字节序的定长缓冲视图。
//!
//! # 模块角色（Why）
//! - 池管理的最小单位，也是缓冲序列中保存的元素；
//! - 以 `Arc<Region>` 共享底层存储，使复制视图（duplicate）与切片（slice）都不拷贝字节，
//!   支撑“消息以缓冲序列表示、不做复制”的热路径。
//!
//! # 核心机制（How）
//! - 每个视图记录 `offset`/`capacity`（在存储区中的可见范围）以及 `position`/`limit` 窗口，
//!   始终满足 `0 <= position <= limit <= capacity`；
//! - 标量读写依据视图的 [`ByteOrder`] 编解码，绝对读写不移动位置，相对读写推进位置；
//! - `Clone` 即 duplicate：共享存储、独立窗口。
//!
//! # 并发安全性说明
//! - 写入内容要求视图独占存储区：`put_*`、`put_buf` 与 `BufMut` 在仍有其它视图共享
//!   `Region` 时返回 [`BufferError::SharedStorage`]（`BufMut` 报告零可写空间）；
//! - 因此复制视图、切片以及序列交出的缓冲都是只读的，`chunk`/`array` 借出的切片在借用期间不会被改写；
//! - 视图本身的窗口状态只能经 `&mut self` 修改，因此共享 `&ByteBuf` 的读者不会互相干扰窗口。

mod region;

use std::{fmt, ptr, sync::Arc};

use bytes::{Buf, BufMut, Bytes, buf::UninitSlice};

use crate::error::{BufferError, Result};

pub use region::{BufferKind, DIRECT_ALIGN};
pub(crate) use region::{NO_OWNER, Region, UNPOOLED_CLASS};

/// 多字节标量的字节序。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    /// 当前平台的本机字节序。
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::BigEndian
        } else {
            Self::LittleEndian
        }
    }
}

/// 定长缓冲视图。
#[derive(Clone)]
pub struct ByteBuf {
    region: Arc<Region>,
    offset: usize,
    capacity: usize,
    position: usize,
    limit: usize,
    order: ByteOrder,
    /// 切自共享 slab 的独占区间：存在时以它代替存储区的引用计数判断能否写入。
    claim: Option<Arc<WriteClaim>>,
}

/// slab 切片的写入凭证，复制视图与子切片共享同一凭证。
struct WriteClaim;

macro_rules! scalar_accessors {
    ($($ty:ty => $get:ident, $get_at:ident, $put:ident, $put_at:ident;)*) => {
        $(
            /// 相对读取，按视图字节序解码并推进位置。
            pub fn $get(&mut self) -> Result<$ty> {
                let bytes = self.take_array::<{ size_of::<$ty>() }>()?;
                Ok(match self.order {
                    ByteOrder::BigEndian => <$ty>::from_be_bytes(bytes),
                    ByteOrder::LittleEndian => <$ty>::from_le_bytes(bytes),
                })
            }

            /// 绝对读取，`index` 相对视图起点，不移动位置。
            pub fn $get_at(&self, index: usize) -> Result<$ty> {
                let bytes = self.read_array::<{ size_of::<$ty>() }>(index)?;
                Ok(match self.order {
                    ByteOrder::BigEndian => <$ty>::from_be_bytes(bytes),
                    ByteOrder::LittleEndian => <$ty>::from_le_bytes(bytes),
                })
            }

            /// 相对写入，按视图字节序编码并推进位置。
            pub fn $put(&mut self, value: $ty) -> Result<()> {
                let bytes = match self.order {
                    ByteOrder::BigEndian => value.to_be_bytes(),
                    ByteOrder::LittleEndian => value.to_le_bytes(),
                };
                self.put_slice(&bytes)
            }

            /// 绝对写入，不移动位置。
            pub fn $put_at(&mut self, index: usize, value: $ty) -> Result<()> {
                let bytes = match self.order {
                    ByteOrder::BigEndian => value.to_be_bytes(),
                    ByteOrder::LittleEndian => value.to_le_bytes(),
                };
                self.write_at(index, &bytes)
            }
        )*
    };
}

impl ByteBuf {
    /// 分配一个清零的缓冲，`position = 0`、`limit = capacity`，字节序为大端。
    pub fn allocate(kind: BufferKind, capacity: usize) -> Result<Self> {
        Self::allocate_tagged(kind, capacity, NO_OWNER, UNPOOLED_CLASS)
    }

    /// 分配一个堆缓冲。
    pub fn allocate_heap(capacity: usize) -> Result<Self> {
        Self::allocate(BufferKind::Heap, capacity)
    }

    /// 分配一个原生缓冲。
    pub fn allocate_direct(capacity: usize) -> Result<Self> {
        Self::allocate(BufferKind::Direct, capacity)
    }

    /// 池内部使用：分配时写入归属标签。
    pub(crate) fn allocate_tagged(
        kind: BufferKind,
        capacity: usize,
        owner: u64,
        class: u32,
    ) -> Result<Self> {
        let region = Region::allocate(kind, capacity, owner, class)?;
        Ok(Self::over(Arc::new(region)))
    }

    /// 接管一个字节数组作为堆缓冲，窗口覆盖全部内容。
    pub fn wrap(bytes: Vec<u8>) -> Self {
        Self::over(Arc::new(Region::from_vec(bytes)))
    }

    /// 零容量的原生缓冲。
    pub(crate) fn empty_direct() -> Self {
        Self::over(Arc::new(Region::empty_direct()))
    }

    fn over(region: Arc<Region>) -> Self {
        let capacity = region.len();
        Self {
            region,
            offset: 0,
            capacity,
            position: 0,
            limit: capacity,
            order: ByteOrder::BigEndian,
            claim: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    pub fn kind(&self) -> BufferKind {
        self.region.kind()
    }

    pub fn is_direct(&self) -> bool {
        self.kind() == BufferKind::Direct
    }

    pub fn has_array(&self) -> bool {
        self.kind() == BufferKind::Heap
    }

    /// 设置位置；超过上限时返回 `InvalidArgument`。
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.limit {
            return Err(BufferError::argument(format!(
                "position {position} exceeds limit {}",
                self.limit
            )));
        }
        self.position = position;
        Ok(())
    }

    /// 设置上限；超过容量时返回 `InvalidArgument`，位置随之收缩到新上限以内。
    pub fn set_limit(&mut self, limit: usize) -> Result<()> {
        if limit > self.capacity {
            return Err(BufferError::argument(format!(
                "limit {limit} exceeds capacity {}",
                self.capacity
            )));
        }
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
        Ok(())
    }

    /// 同时设置窗口，要求 `position <= limit <= capacity`。
    pub fn set_window(&mut self, position: usize, limit: usize) -> Result<()> {
        if position > limit || limit > self.capacity {
            return Err(BufferError::argument(format!(
                "window [{position}, {limit}) invalid for capacity {}",
                self.capacity
            )));
        }
        self.position = position;
        self.limit = limit;
        Ok(())
    }

    /// `position = 0`，`limit = capacity`。
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity;
    }

    /// 写模式切换到读模式：`limit = position`，`position = 0`。
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// 共享存储、复制窗口与字节序的新视图；两个视图存活期间都不能写入内容。
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// 以 `[position, limit)` 为全部可见范围的新视图，字节序重置为大端。
    pub fn slice(&self) -> Self {
        let len = self.remaining();
        Self {
            region: Arc::clone(&self.region),
            offset: self.offset + self.position,
            capacity: len,
            position: 0,
            limit: len,
            order: ByteOrder::BigEndian,
            claim: self.claim.clone(),
        }
    }

    /// 以 `[index, index + len)`（相对视图起点）为全部可见范围的新视图。
    pub fn slice_range(&self, index: usize, len: usize) -> Result<Self> {
        self.check_range(index, len)?;
        Ok(Self {
            region: Arc::clone(&self.region),
            offset: self.offset + index,
            capacity: len,
            position: 0,
            limit: len,
            order: ByteOrder::BigEndian,
            claim: self.claim.clone(),
        })
    }

    /// 切出 `[index, index + len)` 作为可独立写入的切片。
    ///
    /// 调用方保证：同一存储区上切出的区间两两不相交，且切片存活期间没有其它视图读写这些区间。
    /// 分配工具切分共享 slab 时满足这两点：游标只前进，完整缓冲在全部切片释放前不被访问。
    pub(crate) fn claim_range(&self, index: usize, len: usize) -> Result<Self> {
        let mut piece = self.slice_range(index, len)?;
        piece.claim = Some(Arc::new(WriteClaim));
        Ok(piece)
    }

    /// 视图可见范围内的数组内容（仅堆缓冲）。
    pub fn array(&self) -> Option<&[u8]> {
        if self.has_array() {
            // SAFETY: 范围位于存储区内；写入需要独占存储区的 `&mut ByteBuf`，借用期间无法发生。
            Some(unsafe { std::slice::from_raw_parts(self.base(), self.capacity) })
        } else {
            None
        }
    }

    /// 相对读取一个字节。
    pub fn get_u8(&mut self) -> Result<u8> {
        let [b] = self.take_array::<1>()?;
        Ok(b)
    }

    /// 绝对读取一个字节。
    pub fn get_u8_at(&self, index: usize) -> Result<u8> {
        let [b] = self.read_array::<1>(index)?;
        Ok(b)
    }

    /// 相对写入一个字节。
    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_slice(&[value])
    }

    /// 绝对写入一个字节。
    pub fn put_u8_at(&mut self, index: usize, value: u8) -> Result<()> {
        self.write_at(index, &[value])
    }

    scalar_accessors! {
        i16 => get_i16, get_i16_at, put_i16, put_i16_at;
        u16 => get_u16, get_u16_at, put_u16, put_u16_at;
        i32 => get_i32, get_i32_at, put_i32, put_i32_at;
        i64 => get_i64, get_i64_at, put_i64, put_i64_at;
        u64 => get_u64, get_u64_at, put_u64, put_u64_at;
    }

    /// 相对批量读取，`dst` 必须被完整填满。
    pub fn get_slice(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.remaining() {
            return Err(BufferError::bounds(format!(
                "read of {} bytes exceeds remaining {}",
                dst.len(),
                self.remaining()
            )));
        }
        self.copy_out(self.position, dst);
        self.position += dst.len();
        Ok(())
    }

    /// 绝对批量读取，不移动位置。
    pub fn get_slice_at(&self, index: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(index, dst.len())?;
        self.copy_out(index, dst);
        Ok(())
    }

    /// 相对批量写入。
    pub fn put_slice(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.remaining() {
            return Err(BufferError::bounds(format!(
                "write of {} bytes exceeds remaining {}",
                src.len(),
                self.remaining()
            )));
        }
        self.ensure_exclusive()?;
        self.copy_in(self.position, src);
        self.position += src.len();
        Ok(())
    }

    /// 将 `src` 的剩余字节全部写入本视图，两者位置都推进。
    pub fn put_buf(&mut self, src: &mut ByteBuf) -> Result<()> {
        let len = src.remaining();
        if len > self.remaining() {
            return Err(BufferError::bounds(format!(
                "transfer of {len} bytes exceeds remaining {}",
                self.remaining()
            )));
        }
        self.ensure_exclusive()?;
        // SAFETY: 两个范围都已校验；本视图独占存储区，src 必然指向另一块存储，不会重叠。
        unsafe {
            ptr::copy_nonoverlapping(
                src.base().add(src.position),
                self.base().add(self.position),
                len,
            );
        }
        src.position += len;
        self.position += len;
        Ok(())
    }

    /// 复制剩余字节为 `Vec`，不移动位置。
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.remaining()];
        self.copy_out(self.position, &mut out);
        out
    }

    /// 复制剩余字节为 `bytes::Bytes`，不移动位置。
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_vec())
    }

    /// 两个视图是否共享同一存储区。
    pub fn shares_storage(&self, other: &ByteBuf) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    /// 本视图能否写入内容：它是存储区（slab 切片则是所在区间）唯一的持有者。
    pub fn is_exclusive(&mut self) -> bool {
        match self.claim.as_mut() {
            Some(claim) => Arc::get_mut(claim).is_some(),
            None => Arc::get_mut(&mut self.region).is_some(),
        }
    }

    fn ensure_exclusive(&mut self) -> Result<()> {
        if self.is_exclusive() {
            Ok(())
        } else {
            Err(BufferError::SharedStorage {
                views: self.sharing_views(),
            })
        }
    }

    fn sharing_views(&self) -> usize {
        match &self.claim {
            Some(claim) => Arc::strong_count(claim),
            None => Arc::strong_count(&self.region),
        }
    }

    pub(crate) fn owner(&self) -> u64 {
        self.region.owner()
    }

    pub(crate) fn size_class(&self) -> u32 {
        self.region.class()
    }

    /// 改写存储区的尺寸等级；存储区被其它视图共享时不做改动并返回 `false`。
    pub(crate) fn retag(&mut self, class: u32) -> bool {
        match Arc::get_mut(&mut self.region) {
            Some(region) => {
                region.set_class(class);
                true
            }
            None => false,
        }
    }

    pub(crate) fn region_address(&self) -> usize {
        self.region.address()
    }

    /// 视图是否覆盖整个存储区（池发出的缓冲总是如此，切片则不是）。
    pub(crate) fn is_whole_region(&self) -> bool {
        self.offset == 0 && self.capacity == self.region.len()
    }

    /// 池回收时恢复初始状态：窗口清空，字节序恢复为大端，容量恢复为整个存储区。
    pub(crate) fn reset_for_reuse(&mut self) {
        self.claim = None;
        self.offset = 0;
        self.capacity = self.region.len();
        self.position = 0;
        self.limit = self.capacity;
        self.order = ByteOrder::BigEndian;
    }

    fn base(&self) -> *mut u8 {
        // SAFETY: offset + capacity 不超过存储区长度。
        unsafe { self.region.as_ptr().add(self.offset) }
    }

    fn check_range(&self, index: usize, len: usize) -> Result<()> {
        match index.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(BufferError::bounds(format!(
                "range [{index}, +{len}) exceeds capacity {}",
                self.capacity
            ))),
        }
    }

    fn read_array<const N: usize>(&self, index: usize) -> Result<[u8; N]> {
        self.check_range(index, N)?;
        let mut out = [0u8; N];
        self.copy_out(index, &mut out);
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.remaining() < N {
            return Err(BufferError::bounds(format!(
                "read of {N} bytes exceeds remaining {}",
                self.remaining()
            )));
        }
        let mut out = [0u8; N];
        self.copy_out(self.position, &mut out);
        self.position += N;
        Ok(out)
    }

    fn write_at(&mut self, index: usize, src: &[u8]) -> Result<()> {
        self.check_range(index, src.len())?;
        self.ensure_exclusive()?;
        self.copy_in(index, src);
        Ok(())
    }

    fn copy_out(&self, index: usize, dst: &mut [u8]) {
        debug_assert!(index + dst.len() <= self.capacity);
        // SAFETY: 调用方已校验范围；dst 是独立的调用方内存。写入只经独占视图的 `&mut self`
        // 发生，与经 `&self` 的读取不会同时存在。
        unsafe { ptr::copy_nonoverlapping(self.base().add(index), dst.as_mut_ptr(), dst.len()) };
    }

    /// 调用方必须已确认 [`ensure_exclusive`](Self::ensure_exclusive)。
    fn copy_in(&mut self, index: usize, src: &[u8]) {
        debug_assert!(index + src.len() <= self.capacity);
        // SAFETY: 调用方已校验范围与独占性；src 是 `&[u8]`，不可能借自本存储区。
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(index), src.len()) };
    }
}

impl PartialEq for ByteBuf {
    /// 比较剩余内容，与窗口位置、容量、字节序无关。
    fn eq(&self, other: &Self) -> bool {
        if self.remaining() != other.remaining() {
            return false;
        }
        self.chunk() == other.chunk()
    }
}

impl Eq for ByteBuf {}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("kind", &self.kind())
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.capacity)
            .field("order", &self.order)
            .finish()
    }
}

impl Buf for ByteBuf {
    fn remaining(&self) -> usize {
        ByteBuf::remaining(self)
    }

    fn chunk(&self) -> &[u8] {
        // SAFETY: [position, limit) 位于视图范围内；内容别名契约见模块说明。
        unsafe { std::slice::from_raw_parts(self.base().add(self.position), self.remaining()) }
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= ByteBuf::remaining(self),
            "advance 超出剩余字节：cnt={cnt}, remaining={}",
            ByteBuf::remaining(self)
        );
        self.position += cnt;
    }
}

// SAFETY: chunk_mut 只在独占存储区时返回 [position, limit) 的可写区间，否则返回空区间；
// advance_mut 不越过 limit。
unsafe impl BufMut for ByteBuf {
    /// 共享存储区的视图没有可写空间。
    fn remaining_mut(&self) -> usize {
        if self.sharing_views() == 1 {
            ByteBuf::remaining(self)
        } else {
            0
        }
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(
            cnt <= BufMut::remaining_mut(self),
            "advance_mut 超出可写空间：cnt={cnt}, remaining={}",
            BufMut::remaining_mut(self)
        );
        self.position += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        let len = if self.is_exclusive() {
            ByteBuf::remaining(self)
        } else {
            0
        };
        // SAFETY: 区间位于视图范围内且已初始化（存储区分配时清零）；非空区间只在独占时交出。
        unsafe { UninitSlice::from_raw_parts_mut(self.base().add(self.position), len) }
    }
}
