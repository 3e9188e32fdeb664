// Copyright (C) 2021 rtspflow contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use rtspflow::client::RtpFrameAssembler;
use rtspflow::codec::{Concatenate, MediaType};
use rtspflow::rtp::{RtpPacket, RtpPacketBuilder};
use rtspflow::PacketContext;

const FRAMES: u16 = 300;
const PACKETS_PER_FRAME: u16 = 8;
const PAYLOAD_LEN: usize = 1_200;

/// A synthetic 90 kHz video stream starting just below the sequence number
/// wraparound.
fn packets(reorder: bool) -> Vec<RtpPacket> {
    let mut out = Vec::with_capacity(usize::from(FRAMES * PACKETS_PER_FRAME));
    let start = u16::MAX - 100;
    for f in 0..FRAMES {
        for p in 0..PACKETS_PER_FRAME {
            let i = f * PACKETS_PER_FRAME + p;
            let raw = RtpPacketBuilder {
                sequence_number: start.wrapping_add(i),
                timestamp: u32::from(f) * 3_000,
                payload_type: 96,
                ssrc: 0x4242,
                mark: p + 1 == PACKETS_PER_FRAME,
            }
            .build(std::iter::repeat(i as u8).take(PAYLOAD_LEN))
            .unwrap();
            out.push(RtpPacket::parse(raw).unwrap());
        }
    }
    if reorder {
        for pair in out.chunks_mut(2).skip(1).step_by(3) {
            pair.reverse();
        }
    }
    out
}

fn assemble(pkts: &[RtpPacket]) {
    let mut a = RtpFrameAssembler::new(0, MediaType::Video, 96, 90_000, Box::new(Concatenate))
        .unwrap();
    let ctx = PacketContext::dummy();
    let mut frames = 0;
    for pkt in pkts {
        a.ingest(ctx, pkt.clone());
        frames += a.drain().count();
    }
    assert_eq!(frames, usize::from(FRAMES));
}

fn criterion_benchmark(c: &mut Criterion) {
    let in_order = packets(false);
    let reordered = packets(true);
    let mut g = c.benchmark_group("assembler");
    g.throughput(criterion::Throughput::Bytes(
        (in_order.len() * PAYLOAD_LEN) as u64,
    ))
    .bench_function("in_order", |b| b.iter(|| assemble(&in_order)))
    .bench_function("reordered", |b| b.iter(|| assemble(&reordered)));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
