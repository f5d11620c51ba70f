use criterion::{black_box, criterion_group, criterion_main, Criterion};

use infrc::msgbuf::Buffer;
use infrc::wire::{Header, QueuePairTuple, HEADER_LEN};

fn bench_tuple_codec(c: &mut Criterion) {
    let tuple = QueuePairTuple::new(0x12ab, 0x00c0ffee, 0x123456, 0x0102_0304_0506_0708);
    c.bench_function("tuple_encode", |b| {
        b.iter(|| black_box(tuple).to_bytes());
    });
    let bytes = tuple.to_bytes();
    c.bench_function("tuple_decode", |b| {
        b.iter(|| QueuePairTuple::from_bytes(black_box(&bytes)));
    });
}

fn bench_header_codec(c: &mut Criterion) {
    let header = Header {
        nonce: 0xdead_beef_cafe_f00d,
    };
    let mut buf = [0u8; HEADER_LEN];
    c.bench_function("header_roundtrip", |b| {
        b.iter(|| {
            black_box(header).write_to(&mut buf);
            Header::read_from(black_box(&buf))
        });
    });
}

fn bench_buffer_copy_out(c: &mut Criterion) {
    let mut buffer = Buffer::new();
    for _ in 0..8 {
        buffer.append_bytes(&[0x5au8; 1024]);
    }
    let mut out = vec![0u8; 4096];
    c.bench_function("buffer_copy_out_4k", |b| {
        b.iter(|| buffer.copy_out(black_box(2048), &mut out));
    });
}

criterion_group!(
    benches,
    bench_tuple_codec,
    bench_header_codec,
    bench_buffer_copy_out
);
criterion_main!(benches);
