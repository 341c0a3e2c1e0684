use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use transcoder::media::CodedFrame;
use transcoder::packetizer::{Packetizer, DEFAULT_MTU};
use transcoder::payload::{payloader_for, Payloader};
use transcoder::CodecId;

fn h264_access_unit(len: usize) -> Bytes {
    let mut data = vec![0, 0, 0, 1, 0x65];
    data.extend((0..len as u32).map(|i| (i % 251) as u8));
    Bytes::from(data)
}

fn bench_h264_payloading(c: &mut Criterion) {
    let frame = h264_access_unit(100_000);
    c.bench_function("h264_payload_100k", |b| {
        let mut payloader = payloader_for(CodecId::H264);
        b.iter(|| {
            let payloads = payloader.payload(DEFAULT_MTU - 12, black_box(&frame));
            black_box(payloads.len())
        })
    });
}

fn bench_packetize(c: &mut Criterion) {
    c.bench_function("packetize_vp8_frame", |b| {
        let mut packetizer = Packetizer::new(DEFAULT_MTU, 100, payloader_for(CodecId::Vp8));
        let frame = CodedFrame::new(Bytes::from(vec![0xABu8; 30_000]), 0);
        b.iter(|| {
            let packets = packetizer.packetize(black_box(&frame)).unwrap();
            black_box(packets.len())
        })
    });
}

criterion_group!(benches, bench_h264_payloading, bench_packetize);
criterion_main!(benches);
