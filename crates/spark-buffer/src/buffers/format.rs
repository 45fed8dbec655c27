use bytes::Buf;

use super::captured;
use crate::{buf::ByteBuf, error::Result, sequence::BufferSequence};

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// `buffer` 剩余内容的十六进制表示，例如 `[ 0A 0B ]`。
pub fn buffer_to_string(buffer: &ByteBuf) -> String {
    render(std::slice::from_ref(buffer), false, u64::MAX)
}

/// 同 [`buffer_to_string`]，但至多输出 `limit` 个字节。
pub fn buffer_to_string_limited(buffer: &ByteBuf, limit: u64) -> String {
    render(std::slice::from_ref(buffer), false, limit)
}

/// 序列内容的十六进制表示。
///
/// `delimit_buffers` 为真时在每个缓冲之后追加 `;`，空缓冲因此也可见；
/// 输出超过 `limit` 个字节时以 `... N bytes truncated]` 结尾。
pub fn sequence_to_string(
    sequence: &dyn BufferSequence,
    delimit_buffers: bool,
    limit: u64,
) -> Result<String> {
    let buffers = (0..sequence.buffer_count())
        .map(|index| captured(sequence, index))
        .collect::<Result<Vec<_>>>()?;
    Ok(render(&buffers, delimit_buffers, limit))
}

fn render(buffers: &[ByteBuf], delimit: bool, limit: u64) -> String {
    let mut left: u64 = buffers.iter().map(|b| b.remaining() as u64).sum();
    let mut budget = limit;
    let mut out = String::from("[");
    for buffer in buffers {
        for byte in buffer.chunk() {
            if budget == 0 {
                out.push_str(&format!(" ... {left} bytes truncated]"));
                return out;
            }
            out.push(' ');
            out.push(char::from(HEX_DIGITS[usize::from(byte >> 4)]));
            out.push(char::from(HEX_DIGITS[usize::from(byte & 0x0F)]));
            budget -= 1;
            left -= 1;
        }
        if delimit {
            out.push(';');
        }
    }
    out.push_str(" ]");
    out
}
