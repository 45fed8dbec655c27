//! 基于 `proptest` 的性质测试：序列内容与缓冲切分方式无关。
//!
//! - 任意切分得到的序列与单缓冲序列相等，读取流按任意步长读回原始字节；
//! - 写出流写入的标量序列经读取流按相同顺序读回。

use std::sync::Arc;

use proptest::prelude::*;
use spark_buffer::{
    BufferKind, BufferSequenceInputStream, BufferSequenceOutputStream, ByteBuf, PoolRef,
    SegmentedBufferManager,
    buffers::{create_sequence, equals, to_vec},
};

/// 按 `cuts` 把 `data` 切成若干缓冲（允许空缓冲）。
fn split(data: &[u8], cuts: &[usize]) -> Vec<ByteBuf> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
    points.sort_unstable();
    let mut start = 0;
    let mut buffers = Vec::with_capacity(points.len() + 1);
    for point in points {
        buffers.push(ByteBuf::wrap(data[start..point].to_vec()));
        start = point;
    }
    buffers.push(ByteBuf::wrap(data[start..].to_vec()));
    buffers
}

fn pool() -> PoolRef {
    Arc::new(
        SegmentedBufferManager::builder(BufferKind::Heap)
            .base_buffer_size(8)
            .segment_count(3)
            .capacity(1 << 20)
            .build()
            .expect("构造池"),
    )
}

#[derive(Clone, Debug)]
enum Value {
    Byte(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
}

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<u8>().prop_map(Value::Byte),
        any::<i16>().prop_map(Value::Short),
        any::<i32>().prop_map(Value::Int),
        any::<i64>().prop_map(Value::Long),
        (-1.0e12f64..1.0e12).prop_map(Value::Double),
        "\\PC{0,24}".prop_map(Value::Text),
    ]
}

proptest! {
    #[test]
    fn equality_holds_at_every_split(
        data in proptest::collection::vec(any::<u8>(), 0..256),
        cuts in proptest::collection::vec(any::<usize>(), 0..6),
    ) {
        let whole = create_sequence(None, vec![ByteBuf::wrap(data.clone())]);
        let pieces = create_sequence(None, split(&data, &cuts));
        prop_assert_eq!(pieces.length(), data.len() as u64);
        prop_assert!(equals(whole.as_ref(), pieces.as_ref()).expect("比较"));
        prop_assert_eq!(to_vec(pieces.as_ref()).expect("读出"), data);
    }

    #[test]
    fn reader_returns_bytes_for_any_read_sizes(
        data in proptest::collection::vec(any::<u8>(), 1..512),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
        steps in proptest::collection::vec(1usize..40, 1..16),
    ) {
        let seq = create_sequence(None, split(&data, &cuts));
        let mut input = BufferSequenceInputStream::new(seq, true);
        let mut back = Vec::with_capacity(data.len());
        let mut chunk = [0u8; 40];
        for step in steps.iter().cycle() {
            let n = input.read(&mut chunk[..*step]).expect("读取");
            if n == 0 {
                break;
            }
            back.extend_from_slice(&chunk[..n]);
        }
        prop_assert_eq!(back, data);
    }

    #[test]
    fn written_values_read_back_in_order(values in proptest::collection::vec(value(), 0..32)) {
        let mut out = BufferSequenceOutputStream::new(pool());
        for value in &values {
            match value {
                Value::Byte(v) => out.write_u8(*v),
                Value::Short(v) => out.write_i16(*v),
                Value::Int(v) => out.write_i32(*v),
                Value::Long(v) => out.write_i64(*v),
                Value::Double(v) => out.write_f64(*v),
                Value::Text(v) => out.write_utf(v),
            }
            .expect("写入");
        }
        let seq = out.to_buffer_sequence().expect("冻结");
        let mut input = BufferSequenceInputStream::new(seq, true);
        for value in &values {
            match value {
                Value::Byte(v) => prop_assert_eq!(input.read_u8().expect("u8"), *v),
                Value::Short(v) => prop_assert_eq!(input.read_i16().expect("i16"), *v),
                Value::Int(v) => prop_assert_eq!(input.read_i32().expect("i32"), *v),
                Value::Long(v) => prop_assert_eq!(input.read_i64().expect("i64"), *v),
                Value::Double(v) => prop_assert_eq!(input.read_f64().expect("f64"), *v),
                Value::Text(v) => prop_assert_eq!(&input.read_utf().expect("utf"), v),
            }
        }
        prop_assert_eq!(input.available(), 0);
    }
}
