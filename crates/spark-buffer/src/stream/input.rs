use std::{fmt, io};

use super::utf;
use crate::{
    buf::{ByteBuf, ByteOrder},
    buffers::{captured, empty_buffer},
    error::{BufferError, Result},
    sequence::{BoxedSequence, BufferSequence},
};

/// 缓冲序列上的读取游标。
///
/// # 状态机（How）
/// - `remaining`：尚未读取的字节数；
/// - `current`：正在消费的缓冲按构造时窗口复制出的视图，其位置即窗口内的读取位置；
/// - `next_index`：下一个要装载的缓冲下标；
/// - `mark`：标记时的 `(remaining, next_index, position)` 与读预算。
///
/// # 契约说明（What）
/// - 标量读取在当前窗口足够时直接解码，跨越缓冲边界时经 8 字节暂存区拼接；
/// - `reset` 在没有标记、自标记以来消费超过预算或流已关闭时返回错误；
/// - 以 `auto_dispose` 构造时，`remaining` 归零且没有有效标记的那次读取会释放序列；
/// - `close` 之后读取返回 `StreamClosed`，`available` 为 0；
/// - [`borrowed`](Self::borrowed) 构造的读取器只借用序列，从不释放它。
pub struct BufferSequenceInputStream<'a> {
    source: Option<Source<'a>>,
    auto_dispose: bool,
    remaining: u64,
    current: ByteBuf,
    next_index: usize,
    mark: Option<Mark>,
    closed: bool,
}

enum Source<'a> {
    Owned(BoxedSequence),
    Borrowed(&'a dyn BufferSequence),
}

impl Source<'_> {
    fn get(&self) -> &dyn BufferSequence {
        match self {
            Self::Owned(sequence) => sequence.as_ref(),
            Self::Borrowed(sequence) => *sequence,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Mark {
    remaining: u64,
    next_index: usize,
    position: usize,
    read_limit: u64,
}

impl<'a> BufferSequenceInputStream<'a> {
    /// 接管 `sequence`。`auto_dispose` 为假时，可用 [`into_sequence`](Self::into_sequence) 取回序列。
    pub fn new(sequence: BoxedSequence, auto_dispose: bool) -> Self {
        Self::over(Source::Owned(sequence), auto_dispose)
    }

    /// 借用 `sequence`，读取器从不释放它。
    pub fn borrowed(sequence: &'a dyn BufferSequence) -> Self {
        Self::over(Source::Borrowed(sequence), false)
    }

    fn over(source: Source<'a>, auto_dispose: bool) -> Self {
        Self {
            remaining: source.get().length(),
            source: Some(source),
            auto_dispose,
            current: empty_buffer(),
            next_index: 0,
            mark: None,
            closed: false,
        }
    }

    /// 可以不阻塞读取的字节数。
    pub fn available(&self) -> usize {
        if self.closed {
            0
        } else {
            usize::try_from(self.remaining).unwrap_or(usize::MAX)
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 读取一个字节；流尾返回 `None`。
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        self.ensure_open()?;
        if !self.fill()? {
            return Ok(None);
        }
        let byte = self.current.get_u8()?;
        self.consumed(1)?;
        Ok(Some(byte))
    }

    /// 读取至多 `dst.len()` 个字节，返回实际读取数；流尾返回 0。
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let mut filled = 0;
        while filled < dst.len() && self.fill()? {
            let n = self.current.remaining().min(dst.len() - filled);
            self.current.get_slice(&mut dst[filled..filled + n])?;
            filled += n;
            self.consumed(n as u64)?;
        }
        Ok(filled)
    }

    /// 填满 `dst`，数据不足时返回 `UnexpectedEof`。
    pub fn read_fully(&mut self, dst: &mut [u8]) -> Result<()> {
        let n = self.read(dst)?;
        if n < dst.len() {
            return Err(BufferError::eof(format!(
                "needed {} bytes, stream ended after {n}",
                dst.len()
            )));
        }
        Ok(())
    }

    /// 跳过至多 `n` 个字节，返回实际跳过数。
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        self.ensure_open()?;
        let mut skipped = 0u64;
        while skipped < n && self.fill()? {
            let step = (self.current.remaining() as u64).min(n - skipped);
            self.current
                .set_position(self.current.position() + step as usize)?;
            skipped += step;
            self.consumed(step)?;
        }
        Ok(skipped)
    }

    /// 同 [`skip`](Self::skip)，以 `usize` 计数。
    pub fn skip_bytes(&mut self, n: usize) -> Result<usize> {
        Ok(self.skip(n as u64)? as usize)
    }

    pub fn mark_supported(&self) -> bool {
        true
    }

    /// 记录当前位置；之后至多再读取 `read_limit` 个字节仍可 `reset`。
    pub fn mark(&mut self, read_limit: u64) {
        if self.closed {
            return;
        }
        self.mark = Some(Mark {
            remaining: self.remaining,
            next_index: self.next_index,
            position: self.current.position(),
            read_limit,
        });
    }

    /// 回到最近一次标记的位置。
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mark = self
            .mark
            .ok_or_else(|| BufferError::MarkInvalid("no active mark".into()))?;
        if expired(&mark, self.remaining) {
            return Err(BufferError::MarkInvalid(
                format!(
                    "read {} bytes since mark, limit was {}",
                    mark.remaining - self.remaining,
                    mark.read_limit
                )
                .into(),
            ));
        }
        if mark.remaining == self.remaining {
            return Ok(());
        }
        self.current = match mark.next_index.checked_sub(1) {
            None => empty_buffer(),
            Some(index) => {
                let mut view = self.view(index)?;
                view.set_position(mark.position)?;
                view
            }
        };
        self.next_index = mark.next_index;
        self.remaining = mark.remaining;
        Ok(())
    }

    /// 关闭流；以 `auto_dispose` 构造时释放序列。重复关闭无效果。
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.remaining = 0;
        self.mark = None;
        self.current = empty_buffer();
        match self.source.take() {
            Some(Source::Owned(mut sequence)) if self.auto_dispose => sequence.dispose(),
            _ => Ok(()),
        }
    }

    /// 取回接管的序列；已释放、已关闭或借用时返回 `None`。
    pub fn into_sequence(mut self) -> Option<BoxedSequence> {
        match self.source.take() {
            Some(Source::Owned(sequence)) if !self.closed => Some(sequence),
            _ => None,
        }
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let [byte] = self.read_array::<1>()?;
        Ok(byte)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.read_array().map(i16::from_be_bytes)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_array().map(u16::from_be_bytes)
    }

    /// 读取一个 UTF-16 代码单元。
    pub fn read_char(&mut self) -> Result<u16> {
        self.read_u16()
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_array().map(i32::from_be_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_array().map(i64::from_be_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.read_array().map(|bytes| f32::from_bits(u32::from_be_bytes(bytes)))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.read_array().map(|bytes| f64::from_bits(u64::from_be_bytes(bytes)))
    }

    /// 读取带 `u16` 长度前缀的修改版 UTF-8 字符串。
    pub fn read_utf(&mut self) -> Result<String> {
        let len = usize::from(self.read_u16()?);
        let mut bytes = vec![0u8; len];
        self.read_fully(&mut bytes)?;
        utf::decode(&bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure_open()?;
        let mut out = [0u8; N];
        if self.fill()? && self.current.remaining() >= N {
            self.current.get_slice(&mut out)?;
            self.consumed(N as u64)?;
        } else {
            let mut scratch = [0u8; 8];
            self.read_fully(&mut scratch[..N])?;
            out.copy_from_slice(&scratch[..N]);
        }
        Ok(out)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(BufferError::StreamClosed)
        } else {
            Ok(())
        }
    }

    /// 保证 `current` 还有剩余字节；流尾返回 `false`。
    fn fill(&mut self) -> Result<bool> {
        while !self.current.has_remaining() {
            if self.remaining == 0 {
                return Ok(false);
            }
            let index = self.next_index;
            self.current = self.view(index)?;
            self.next_index = index + 1;
        }
        Ok(true)
    }

    fn view(&self, index: usize) -> Result<ByteBuf> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| BufferError::state("sequence already released by the stream"))?;
        let mut view = captured(source.get(), index)?;
        view.set_order(ByteOrder::BigEndian);
        Ok(view)
    }

    fn consumed(&mut self, n: u64) -> Result<()> {
        self.remaining -= n;
        if self.remaining > 0 || !self.auto_dispose {
            return Ok(());
        }
        if self.mark.is_some_and(|mark| !expired(&mark, 0)) {
            return Ok(());
        }
        self.mark = None;
        match self.source.take() {
            Some(Source::Owned(mut sequence)) => sequence.dispose(),
            other => {
                self.source = other;
                Ok(())
            }
        }
    }
}

fn expired(mark: &Mark, remaining: u64) -> bool {
    mark.remaining - remaining > mark.read_limit
}

impl io::Read for BufferSequenceInputStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BufferSequenceInputStream::read(self, buf).map_err(io::Error::from)
    }
}

impl fmt::Debug for BufferSequenceInputStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSequenceInputStream")
            .field("remaining", &self.remaining)
            .field("next_index", &self.next_index)
            .field("mark", &self.mark)
            .field("auto_dispose", &self.auto_dispose)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::create_sequence;

    fn sequence(parts: &[&[u8]]) -> BoxedSequence {
        create_sequence(None, parts.iter().map(|p| ByteBuf::wrap(p.to_vec())).collect())
    }

    #[test]
    fn scalars_span_buffer_boundaries() {
        let seq = sequence(&[&[0x00, 0x00, 0x01], &[0x02, 0x7F], &[], &[0xFF, 0xFF, 0xFF]]);
        let mut stream = BufferSequenceInputStream::borrowed(seq.as_ref());
        assert_eq!(stream.read_i32().expect("跨缓冲 i32"), 0x0000_0102);
        assert_eq!(stream.read_u8().expect("字节"), 0x7F);
        assert_eq!(stream.read_i16().expect("i16"), -1);
        assert_eq!(stream.available(), 1);
        assert_eq!(
            stream.read_i16().expect_err("数据不足").code(),
            crate::error::codes::EOF
        );
    }

    #[test]
    fn mark_reset_honours_budget() {
        let seq = sequence(&[b"abc", b"defg"]);
        let mut stream = BufferSequenceInputStream::borrowed(seq.as_ref());
        stream.skip(2).expect("跳过");
        stream.mark(3);
        let mut buf = [0u8; 3];
        stream.read_fully(&mut buf).expect("读取");
        assert_eq!(&buf, b"cde");
        stream.reset().expect("预算内回退");
        assert_eq!(stream.read_byte().expect("回退后读取"), Some(b'c'));

        stream.reset().expect("再次回退");
        stream.skip(4).expect("超出预算");
        assert_eq!(
            stream.reset().expect_err("预算用尽").code(),
            crate::error::codes::MARK
        );
    }

    #[test]
    fn reset_without_mark_fails() {
        let seq = sequence(&[b"x"]);
        let mut stream = BufferSequenceInputStream::borrowed(seq.as_ref());
        assert_eq!(stream.reset().expect_err("无标记").code(), crate::error::codes::MARK);
    }

    #[test]
    fn auto_dispose_on_final_read() {
        let seq = sequence(&[b"ab", b"c"]);
        let mut stream = BufferSequenceInputStream::new(seq, true);
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).expect("读完"), 3);
        assert!(stream.source.is_none());
        assert_eq!(stream.read_byte().expect("流尾"), None);
        assert!(stream.into_sequence().is_none());
    }

    #[test]
    fn active_mark_defers_auto_dispose() {
        let seq = sequence(&[b"ab"]);
        let mut stream = BufferSequenceInputStream::new(seq, true);
        stream.mark(10);
        stream.skip(2).expect("读到末尾");
        assert!(stream.source.is_some());
        stream.reset().expect("回退");
        assert_eq!(stream.read_u16().expect("再次读取"), u16::from_be_bytes(*b"ab"));
        stream.close().expect("关闭时释放");
    }

    #[test]
    fn closed_stream_rejects_reads() {
        let seq = sequence(&[b"abc"]);
        let mut stream = BufferSequenceInputStream::new(seq, false);
        stream.close().expect("关闭");
        stream.close().expect("重复关闭");
        assert_eq!(stream.available(), 0);
        assert_eq!(
            stream.read_byte().expect_err("已关闭").code(),
            crate::error::codes::CLOSED
        );
        assert!(stream.reset().is_err());
    }

    #[test]
    fn disposed_sequence_cannot_be_read() {
        let mut seq = sequence(&[b"abc"]);
        seq.dispose().expect("释放");
        let mut stream = BufferSequenceInputStream::borrowed(seq.as_ref());
        assert_eq!(
            stream.read_byte().expect_err("序列已释放").code(),
            crate::error::codes::DISPOSED
        );
    }

    #[test]
    fn io_read_adapter() {
        use std::io::Read;

        let seq = sequence(&[b"hello ", b"world"]);
        let mut stream = BufferSequenceInputStream::borrowed(seq.as_ref());
        let mut text = String::new();
        stream.read_to_string(&mut text).expect("读取全部");
        assert_eq!(text, "hello world");
    }
}
