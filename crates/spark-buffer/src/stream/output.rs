use std::{fmt, io, sync::Arc};

use tracing::warn;

use super::utf;
use crate::{
    buf::{ByteBuf, ByteOrder},
    buffers::{create_sequence, empty_sequence},
    error::{BufferError, Result},
    manager::PoolRef,
    sequence::{BoxedSequence, BufferSequence, MultiBufferSequence},
};

/// 把写入累积到池缓冲中、最终冻结为缓冲序列的写出流。
///
/// # 增长策略（How）
/// - 写入填充当前缓冲；当前缓冲写满后翻转并追加到已完成列表，
///   再以 `acquire_sum(max(已写字节, size_hint))` 申请新缓冲；
/// - 落在当前缓冲内的标量直接写入，跨越边界的标量经 8 字节暂存区走普通写入路径；
///
/// # 冻结（What）
/// - [`to_buffer_sequence`](Self::to_buffer_sequence) 翻转当前缓冲并交给池 `truncate`，
///   与已完成列表一起构造 Single 或 Multi 序列；从未写入的流得到空序列且不分配；
/// - 冻结后写出流回到空状态，可以继续复用；
/// - `close` 冻结并立即释放结果，之后的写入返回 `StreamClosed`；
/// - 未冻结即被丢弃的写出流把持有的缓冲全部还给池。
pub struct BufferSequenceOutputStream {
    pool: PoolRef,
    current: Option<ByteBuf>,
    completed: Vec<ByteBuf>,
    written: u64,
    size_hint: u64,
    closed: bool,
}

impl BufferSequenceOutputStream {
    pub fn new(pool: PoolRef) -> Self {
        Self::with_size_hint(pool, 0)
    }

    /// `size_hint` 为预计写入的总字节数，池据此选择首个缓冲的尺寸。
    pub fn with_size_hint(pool: PoolRef, size_hint: u64) -> Self {
        Self {
            pool,
            current: None,
            completed: Vec::new(),
            written: 0,
            size_hint,
            closed: false,
        }
    }

    /// 自上次冻结以来写入的字节数。
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn write_byte(&mut self, value: u8) -> Result<()> {
        self.write_array([value])
    }

    /// 写入全部 `src`。
    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut rest = src;
        while !rest.is_empty() {
            let current = self.writable()?;
            let n = current.remaining().min(rest.len());
            current.put_slice(&rest[..n])?;
            rest = &rest[n..];
            self.written += n as u64;
        }
        Ok(())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_byte(u8::from(value))
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_byte(value)
    }

    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_array(value.to_be_bytes())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_array(value.to_be_bytes())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_array(value.to_be_bytes())
    }

    /// 写入一个 UTF-16 代码单元。
    pub fn write_char(&mut self, unit: u16) -> Result<()> {
        self.write_u16(unit)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_array(value.to_be_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_array(value.to_be_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_array(value.to_bits().to_be_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_array(value.to_bits().to_be_bytes())
    }

    /// 每个 UTF-16 代码单元只写低 8 位。
    pub fn write_bytes(&mut self, text: &str) -> Result<()> {
        self.ensure_open()?;
        let mut packed = [0u8; 8];
        let mut units = text.encode_utf16().peekable();
        while units.peek().is_some() {
            let mut n = 0;
            for unit in units.by_ref().take(packed.len()) {
                packed[n] = unit as u8;
                n += 1;
            }
            self.write(&packed[..n])?;
        }
        Ok(())
    }

    /// 每个 UTF-16 代码单元按大端写两个字节。
    pub fn write_chars(&mut self, text: &str) -> Result<()> {
        self.ensure_open()?;
        let mut packed = [0u8; 8];
        let mut units = text.encode_utf16().peekable();
        while units.peek().is_some() {
            let mut n = 0;
            for unit in units.by_ref().take(packed.len() / 2) {
                packed[n..n + 2].copy_from_slice(&unit.to_be_bytes());
                n += 2;
            }
            self.write(&packed[..n])?;
        }
        Ok(())
    }

    /// 写入带 `u16` 长度前缀的修改版 UTF-8；编码超过 65535 字节时返回参数错误且不写入任何内容。
    pub fn write_utf(&mut self, text: &str) -> Result<()> {
        self.ensure_open()?;
        let len = utf::encoded_len(text);
        if len > utf::MAX_ENCODED_LEN {
            return Err(BufferError::MalformedUtf(
                format!("encoded length {len} exceeds {}", utf::MAX_ENCODED_LEN).into(),
            ));
        }
        let mut encoded = Vec::with_capacity(len + 2);
        encoded.extend_from_slice(&(len as u16).to_be_bytes());
        utf::encode_into(text, &mut encoded);
        for chunk in encoded.chunks(8) {
            self.write(chunk)?;
        }
        Ok(())
    }

    /// 冻结已写入的内容为序列，写出流回到空状态。
    pub fn to_buffer_sequence(&mut self) -> Result<BoxedSequence> {
        self.ensure_open()?;
        self.written = 0;
        let Some(mut last) = self.current.take() else {
            return Ok(empty_sequence());
        };
        last.flip();
        let last = match self.pool.truncate(last) {
            Ok(last) => last,
            Err(err) => {
                self.release_held();
                return Err(err);
            }
        };
        let mut buffers = std::mem::take(&mut self.completed);
        buffers.push(last);
        let pool = Some(Arc::clone(&self.pool));
        Ok(if buffers.len() == 1 {
            create_sequence(pool, buffers)
        } else {
            Box::new(MultiBufferSequence::new(pool, buffers))
        })
    }

    /// 冻结并立即释放结果；重复关闭无效果。
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let frozen = self.to_buffer_sequence();
        self.closed = true;
        let mut sequence = frozen?;
        sequence.dispose()
    }

    fn write_array<const N: usize>(&mut self, bytes: [u8; N]) -> Result<()> {
        self.ensure_open()?;
        if let Some(current) = self.current.as_mut().filter(|c| c.remaining() >= N) {
            current.put_slice(&bytes)?;
            self.written += N as u64;
            return Ok(());
        }
        let mut scratch = [0u8; 8];
        scratch[..N].copy_from_slice(&bytes);
        self.write(&scratch[..N])
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(BufferError::StreamClosed)
        } else {
            Ok(())
        }
    }

    /// 还有剩余空间的当前缓冲；必要时翻转写满的缓冲并申请新缓冲。
    fn writable(&mut self) -> Result<&mut ByteBuf> {
        if self.current.as_ref().is_some_and(ByteBuf::has_remaining) {
            return self
                .current
                .as_mut()
                .ok_or_else(|| BufferError::state("writer lost its current buffer"));
        }
        let mut fresh = self.pool.acquire_sum(self.written.max(self.size_hint))?;
        if !fresh.has_remaining() {
            let capacity = fresh.capacity();
            self.pool.release(fresh)?;
            return Err(BufferError::allocation(
                self.written,
                format!("pool granted a buffer with no room (capacity {capacity})"),
            ));
        }
        fresh.set_order(ByteOrder::BigEndian);
        if let Some(mut full) = self.current.take() {
            full.flip();
            self.completed.push(full);
        }
        Ok(self.current.insert(fresh))
    }

    fn release_held(&mut self) {
        let held = self.current.take().into_iter().chain(self.completed.drain(..));
        for buffer in held {
            if let Err(err) = self.pool.release(buffer) {
                warn!(error = %err, code = err.code(), "releasing writer buffer failed");
            }
        }
    }
}

impl Drop for BufferSequenceOutputStream {
    fn drop(&mut self) {
        self.release_held();
    }
}

impl io::Write for BufferSequenceOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        BufferSequenceOutputStream::write(self, buf)
            .map(|()| buf.len())
            .map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for BufferSequenceOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSequenceOutputStream")
            .field("written", &self.written)
            .field("completed", &self.completed.len())
            .field("size_hint", &self.size_hint)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buf::BufferKind,
        buffers::to_vec,
        manager::{BufferManager, SegmentedBufferManager},
        stream::BufferSequenceInputStream,
    };

    fn pool(base: usize) -> PoolRef {
        Arc::new(
            SegmentedBufferManager::builder(BufferKind::Heap)
                .base_buffer_size(base)
                .segment_count(1)
                .capacity(64 * 1024)
                .build()
                .expect("构造池"),
        )
    }

    #[test]
    fn forty_bytes_over_sixteen_byte_buffers() {
        let pool = pool(16);
        let payload: Vec<u8> = (0..40).collect();
        let mut out = BufferSequenceOutputStream::new(Arc::clone(&pool));
        out.write(&payload).expect("写入");
        assert_eq!(out.written(), 40);

        let seq = out.to_buffer_sequence().expect("冻结");
        assert_eq!(seq.length(), 40);
        let lengths: Vec<usize> = (0..seq.buffer_count())
            .map(|i| seq.buffer_length(i).expect("长度"))
            .collect();
        assert_eq!(lengths, vec![16, 16, 8]);
        assert_eq!(to_vec(seq.as_ref()).expect("读回"), payload);
        assert_eq!(out.written(), 0);
    }

    #[test]
    fn scalars_spanning_buffers_round_trip() {
        let pool = pool(16);
        let mut out = BufferSequenceOutputStream::new(pool);
        out.write(&[0u8; 13]).expect("填充");
        out.write_i64(-2).expect("跨边界 i64");
        out.write_f64(1.5).expect("f64");
        out.write_utf("héllo").expect("utf");
        out.write_chars("ok").expect("chars");
        out.write_bytes("AZ").expect("bytes");
        out.write_bool(true).expect("bool");
        let seq = out.to_buffer_sequence().expect("冻结");

        let mut input = BufferSequenceInputStream::new(seq, true);
        input.skip(13).expect("跳过填充");
        assert_eq!(input.read_i64().expect("i64"), -2);
        assert_eq!(input.read_f64().expect("f64"), 1.5);
        assert_eq!(input.read_utf().expect("utf"), "héllo");
        assert_eq!(input.read_char().expect("char"), u16::from(b'o'));
        assert_eq!(input.read_char().expect("char"), u16::from(b'k'));
        assert_eq!(input.read_u8().expect("byte"), b'A');
        assert_eq!(input.read_u8().expect("byte"), b'Z');
        assert!(input.read_bool().expect("bool"));
        assert_eq!(input.available(), 0);
    }

    #[test]
    fn never_written_stream_yields_empty_sequence() {
        let pool = pool(16);
        let mut out = BufferSequenceOutputStream::new(Arc::clone(&pool));
        let seq = out.to_buffer_sequence().expect("冻结");
        assert_eq!((seq.length(), seq.buffer_count()), (0, 0));
        assert_eq!(pool.statistics().acquisitions, 0);
    }

    #[test]
    fn close_disposes_and_blocks_writes() {
        let pool = pool(16);
        let mut out = BufferSequenceOutputStream::new(Arc::clone(&pool));
        out.write(&[1; 20]).expect("写入");
        out.close().expect("关闭");
        assert_eq!(pool.statistics().outstanding, 0);
        assert_eq!(
            out.write_byte(1).expect_err("已关闭").code(),
            crate::error::codes::CLOSED
        );
        out.close().expect("重复关闭");
    }

    #[test]
    fn oversized_utf_is_rejected() {
        let mut out = BufferSequenceOutputStream::new(pool(16));
        let text = "é".repeat(40_000);
        assert_eq!(
            out.write_utf(&text).expect_err("超长").kind(),
            crate::error::ErrorKind::Argument
        );
        assert_eq!(out.written(), 0);
    }

    #[test]
    fn dropping_open_writer_returns_buffers() {
        let pool = pool(16);
        {
            let mut out = BufferSequenceOutputStream::new(Arc::clone(&pool));
            out.write(&[7; 40]).expect("写入");
        }
        assert_eq!(pool.statistics().outstanding, 0);
    }
}
