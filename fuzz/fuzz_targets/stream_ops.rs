#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use spark_buffer::{
    BufferKind, BufferSequence, BufferSequenceInputStream, BufferSequenceOutputStream, PoolRef,
    SegmentedBufferManager, buffers::to_vec, manager::CheckedBufferManager,
};
use std::sync::Arc;

/// Fuzz 指令：一段写出操作，冻结后先按类型回放，再以任意读取操作遍历。
///
/// - **Why**：写出流换缓冲、读取流跨缓冲与标记回退的组合边界多，逐一手写用例难以穷尽；
/// - **How**：第一个读取流按写入顺序读回每个值并逐一比对；第二个读取流借用同一序列，
///   任意交错 `read`/`skip`/`mark`/`reset`，读出内容必须与序列的字节镜像对应区间一致；
/// - **What**：池套上检查型包装，序列释放后在途缓冲数必须归零。
#[derive(Debug, Arbitrary)]
struct StreamCase {
    base: u8,
    writes: Vec<WriteOp>,
    reads: Vec<ReadOp>,
}

#[derive(Debug, Arbitrary)]
enum WriteOp {
    Bytes(Vec<u8>),
    Int(i32),
    Long(i64),
    Utf(String),
}

#[derive(Debug, Arbitrary)]
enum ReadOp {
    Read(u8),
    Skip(u8),
    Mark(u8),
    Reset,
}

fuzz_target!(|case: StreamCase| {
    let inner = SegmentedBufferManager::builder(BufferKind::Heap)
        .base_buffer_size(usize::from(case.base % 64) + 1)
        .segment_count(3)
        .capacity(1 << 20)
        .build()
        .expect("pool parameters are valid");
    let checked = Arc::new(CheckedBufferManager::new(Arc::new(inner)));
    let pool: PoolRef = checked.clone();

    let mut out = BufferSequenceOutputStream::new(Arc::clone(&pool));
    let mut accepted = Vec::with_capacity(case.writes.len());
    for op in &case.writes {
        let outcome = match op {
            WriteOp::Bytes(bytes) => out.write(bytes),
            WriteOp::Int(v) => out.write_i32(*v),
            WriteOp::Long(v) => out.write_i64(*v),
            WriteOp::Utf(text) => out.write_utf(text),
        };
        if outcome.is_ok() {
            accepted.push(op);
        }
    }
    let written = out.written();
    let mut seq = out.to_buffer_sequence().expect("freeze");
    assert_eq!(seq.length(), written);
    let image = to_vec(seq.as_ref()).expect("byte image");

    let mut typed = BufferSequenceInputStream::borrowed(seq.as_ref());
    for op in accepted {
        match op {
            WriteOp::Bytes(bytes) => {
                let mut back = vec![0u8; bytes.len()];
                typed.read_fully(&mut back).expect("read bytes");
                assert_eq!(&back, bytes);
            }
            WriteOp::Int(v) => assert_eq!(typed.read_i32().expect("read_i32"), *v),
            WriteOp::Long(v) => assert_eq!(typed.read_i64().expect("read_i64"), *v),
            WriteOp::Utf(text) => assert_eq!(&typed.read_utf().expect("read_utf"), text),
        }
    }
    assert_eq!(typed.available(), 0);

    let mut input = BufferSequenceInputStream::borrowed(seq.as_ref());
    let mut offset = 0usize;
    let mut mark: Option<(usize, usize)> = None;
    let mut chunk = [0u8; 255];
    for op in &case.reads {
        match *op {
            ReadOp::Read(n) => {
                let n = input.read(&mut chunk[..usize::from(n)]).expect("read");
                assert_eq!(&chunk[..n], &image[offset..offset + n]);
                offset += n;
            }
            ReadOp::Skip(n) => {
                offset += input.skip(u64::from(n)).expect("skip") as usize;
            }
            ReadOp::Mark(limit) => {
                input.mark(u64::from(limit));
                mark = Some((offset, usize::from(limit)));
            }
            ReadOp::Reset => match mark {
                Some((at, limit)) if offset - at <= limit => {
                    input.reset().expect("reset within budget");
                    offset = at;
                }
                _ => assert!(input.reset().is_err()),
            },
        }
        assert_eq!(input.available(), image.len() - offset);
    }
    drop(input);
    drop(typed);

    seq.dispose().expect("dispose");
    assert_eq!(checked.outstanding(), 0);
});
