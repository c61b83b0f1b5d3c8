//! Benchmarks for protocol encoding and decoding.

#![allow(clippy::unwrap_used, missing_docs)]

use bytes::{Bytes, BytesMut};
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use pgwire_protocol::{BackendMessage, DataRow, FrontendMessage, Target};
use smallvec::SmallVec;

/// Benchmark encoding one extended-query cycle.
fn bench_extended_query_encode(c: &mut Criterion) {
    let params = [Some("42"), Some("alice@example.com"), None];

    c.bench_function("extended_query_encode", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(256);
            FrontendMessage::Bind {
                portal: "",
                statement: "s_users_by_id",
                params: &params,
            }
            .encode(&mut buf);
            FrontendMessage::Describe {
                target: Target::Portal,
                name: "",
            }
            .encode(&mut buf);
            FrontendMessage::Execute {
                portal: "",
                max_rows: 0,
            }
            .encode(&mut buf);
            FrontendMessage::Sync.encode(&mut buf);
            black_box(buf)
        })
    });
}

/// Benchmark decoding data rows.
fn bench_data_row_decode(c: &mut Criterion) {
    let row = BackendMessage::DataRow(DataRow {
        columns: SmallVec::from_vec(vec![
            Some(Bytes::from_static(b"12345")),
            Some(Bytes::from_static(b"alice@example.com")),
            None,
            Some(Bytes::from_static(b"2024-01-01 00:00:00+00")),
        ]),
    });
    let mut buf = BytesMut::new();
    row.encode(&mut buf);
    let body = buf.freeze().slice(5..);

    let mut group = c.benchmark_group("data_row");
    group.throughput(Throughput::Bytes(body.len() as u64));
    group.bench_function("decode", |b| {
        b.iter(|| black_box(BackendMessage::decode(b'D', body.clone()).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, bench_extended_query_encode, bench_data_row_decode);
criterion_main!(benches);
