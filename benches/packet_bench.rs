use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use peerwire::core::codec::PacketCodec;
use peerwire::core::packet::Packet;
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_frame_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode_decode");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || Packet::new(vec![0u8; size]),
                |packet| {
                    let mut buf = BytesMut::with_capacity(size + 16);
                    PacketCodec::default().encode(packet, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });

        let mut framed = BytesMut::new();
        PacketCodec::default()
            .encode(Packet::new(vec![0u8; size]), &mut framed)
            .unwrap();
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter_batched(
                || framed.clone(),
                |mut buf| {
                    let decoded = PacketCodec::default().decode(&mut buf).unwrap();
                    assert!(decoded.is_some());
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frame_encode_decode);
criterion_main!(benches);
