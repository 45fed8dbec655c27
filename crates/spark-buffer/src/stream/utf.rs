//! 修改版 UTF-8：`U+0000` 编码为两字节 `C0 80`，补充平面字符按 UTF-16 代理对
//! 各自编码为三字节序列，前缀为 `u16` 大端字节长度。

use crate::error::{BufferError, Result};

/// 前缀所能表示的最大编码长度。
pub(crate) const MAX_ENCODED_LEN: usize = u16::MAX as usize;

/// 编码后的字节数。
pub(crate) fn encoded_len(text: &str) -> usize {
    text.encode_utf16().map(unit_len).sum()
}

fn unit_len(unit: u16) -> usize {
    match unit {
        0x0001..=0x007F => 1,
        0x0000 | 0x0080..=0x07FF => 2,
        _ => 3,
    }
}

/// 把 `text` 编码后追加到 `out`，不含长度前缀。
pub(crate) fn encode_into(text: &str, out: &mut Vec<u8>) {
    for unit in text.encode_utf16() {
        match unit_len(unit) {
            1 => out.push(unit as u8),
            2 => out.extend_from_slice(&[0xC0 | (unit >> 6) as u8, 0x80 | (unit & 0x3F) as u8]),
            _ => out.extend_from_slice(&[
                0xE0 | (unit >> 12) as u8,
                0x80 | ((unit >> 6) & 0x3F) as u8,
                0x80 | (unit & 0x3F) as u8,
            ]),
        }
    }
}

/// 解码不含长度前缀的修改版 UTF-8 字节。
pub(crate) fn decode(bytes: &[u8]) -> Result<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let lead = bytes[index];
        let (unit, width) = match lead >> 4 {
            0x0..=0x7 => (u16::from(lead), 1),
            0xC | 0xD => {
                let second = continuation(bytes, index, 1)?;
                ((u16::from(lead & 0x1F) << 6) | second, 2)
            }
            0xE => {
                let second = continuation(bytes, index, 1)?;
                let third = continuation(bytes, index, 2)?;
                ((u16::from(lead & 0x0F) << 12) | (second << 6) | third, 3)
            }
            _ => {
                return Err(BufferError::MalformedUtf(
                    format!("invalid lead byte {lead:#04x} at offset {index}").into(),
                ));
            }
        };
        units.push(unit);
        index += width;
    }
    String::from_utf16(&units)
        .map_err(|_| BufferError::MalformedUtf("unpaired surrogate in utf data".into()))
}

fn continuation(bytes: &[u8], lead: usize, offset: usize) -> Result<u16> {
    match bytes.get(lead + offset) {
        Some(byte) if byte & 0xC0 == 0x80 => Ok(u16::from(byte & 0x3F)),
        Some(byte) => Err(BufferError::MalformedUtf(
            format!("invalid continuation byte {byte:#04x} at offset {}", lead + offset).into(),
        )),
        None => Err(BufferError::MalformedUtf(
            format!("truncated sequence at offset {lead}").into(),
        )),
    }
}
