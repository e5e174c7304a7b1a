//! Benchmarks for the replication hot path.
//!
//! Run with: `cargo bench --bench protocol_bench`

use bytes::{BufMut, Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use pgwire_streamer::lsn::Lsn;
use pgwire_streamer::protocol::messages::parse_error_response;
use pgwire_streamer::protocol::pgoutput::PgOutputDecoder;
use pgwire_streamer::protocol::replication::{StatusUpdate, StreamMessage, from_server_time};
use pgwire_streamer::value::decode_text;

const INT8: u32 = 20;
const TEXT: u32 = 25;
const TIMESTAMPTZ: u32 = 1184;

/// XLogData wrapping `data`.
fn xlogdata(data: &[u8]) -> Bytes {
    let mut v = BytesMut::with_capacity(25 + data.len());
    v.put_u8(b'w');
    v.put_u64(0x0123_4567_89AB_CDEF);
    v.put_u64(0xFEDC_BA98_7654_3210);
    v.put_i64(1_234_567_890);
    v.extend_from_slice(data);
    v.freeze()
}

fn put_cstr(b: &mut BytesMut, s: &str) {
    b.extend_from_slice(s.as_bytes());
    b.put_u8(0);
}

fn relation() -> Bytes {
    let mut b = BytesMut::new();
    b.put_u8(b'R');
    b.put_u32(16384);
    put_cstr(&mut b, "public");
    put_cstr(&mut b, "orders");
    b.put_u8(b'd');
    let cols: [(&str, u32, u8); 4] = [("id", INT8, 1), ("customer", TEXT, 0), ("note", TEXT, 0), ("created_at", TIMESTAMPTZ, 0)];
    b.put_u16(cols.len() as u16);
    for (name, oid, key) in cols {
        b.put_u8(key);
        put_cstr(&mut b, name);
        b.put_u32(oid);
        b.put_i32(-1);
    }
    b.freeze()
}

fn insert(note_len: usize) -> Bytes {
    let note = "x".repeat(note_len);
    let values = ["42", "acme corp", note.as_str(), "2024-03-01 12:00:00.123456+00"];
    let mut b = BytesMut::new();
    b.put_u8(b'I');
    b.put_u32(16384);
    b.put_u8(b'N');
    b.put_u16(values.len() as u16);
    for v in values {
        b.put_u8(b't');
        b.put_u32(v.len() as u32);
        b.extend_from_slice(v.as_bytes());
    }
    b.freeze()
}

fn error_payload() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"SERROR\0");
    payload.extend_from_slice(b"VERROR\0");
    payload.extend_from_slice(b"C55006\0");
    payload.extend_from_slice(b"Mreplication slot \"cdc_shop_eu\" is active for PID 4242\0");
    payload.extend_from_slice(b"Fslot.c\0");
    payload.extend_from_slice(b"L512\0");
    payload.extend_from_slice(b"RReplicationSlotAcquire\0");
    payload.push(0);
    payload
}

fn bench_parse_xlogdata(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_xlogdata");
    for size in [64, 1024, 16384] {
        let payload = xlogdata(&vec![0x42u8; size]);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| StreamMessage::decode(black_box(payload.clone())));
        });
    }
    group.finish();
}

fn bench_decode_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("pgoutput_insert");
    for note_len in [16, 512, 8192] {
        let msg = insert(note_len);
        let mut decoder = PgOutputDecoder::new();
        decoder.decode(relation()).expect("relation decodes");
        group.throughput(Throughput::Bytes(msg.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(note_len), &msg, |b, msg| {
            b.iter(|| decoder.decode(black_box(msg.clone())));
        });
    }
    group.finish();
}

fn bench_decode_values(c: &mut Criterion) {
    c.bench_function("decode_text/int8", |b| {
        b.iter(|| decode_text(black_box(INT8), black_box(b"9223372036854775807")));
    });
    c.bench_function("decode_text/timestamptz", |b| {
        b.iter(|| decode_text(black_box(TIMESTAMPTZ), black_box(b"2024-03-01 12:00:00.123456+00")));
    });
}

fn bench_encode_status_update(c: &mut Criterion) {
    let update = StatusUpdate {
        acked: Lsn(0x1234_5678_9ABC_DEF0),
        at: from_server_time(1_234_567_890).unwrap_or_default(),
        reply: false,
    };
    c.bench_function("encode_status_update", |b| {
        b.iter(|| black_box(&update).encode());
    });
}

fn bench_parse_error_response(c: &mut Criterion) {
    let payload = error_payload();
    c.bench_function("parse_error_response", |b| {
        b.iter(|| parse_error_response(black_box(&payload)));
    });
}

criterion_group!(
    benches,
    bench_parse_xlogdata,
    bench_decode_insert,
    bench_decode_values,
    bench_encode_status_update,
    bench_parse_error_response,
);
criterion_main!(benches);
