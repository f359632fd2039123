//! Benchmarks for the per-frame hot paths
//!
//! Covers what runs once per streamed packet or per drained result buffer:
//! - Payload frame construction from the packed database
//! - Read encoding into lookup blocks and upload frames
//! - Result buffer parsing and best-match aggregation
//!
//! Platform: Cross-platform (synthetic data, CI-safe)

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use fpga_align::engine::{PACKET_STRIDE, SegmentCursor, packets_for_credit};
use fpga_align::protocol::{FrameTemplate, Opcode, upload_frames};
use fpga_align::reads::LookupBlock;
use fpga_align::results::{BestMatchTable, ResultRecord, parse_records};
use fpga_align::test_utils::{DEVICE_MAC, HOST_MAC, reads};
use fpga_align::transport::MAX_PAYLOAD;
use std::hint::black_box;

fn synthetic_database(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(2654435761) >> 7) as u8).collect()
}

fn bench_payload_frames(c: &mut Criterion) {
    let database = synthetic_database(64 * PACKET_STRIDE);
    let template = FrameTemplate::new(HOST_MAC, DEVICE_MAC);

    let mut group = c.benchmark_group("payload_frames");
    group.throughput(Throughput::Bytes(MAX_PAYLOAD as u64));

    group.bench_function("cursor_fill_and_frame", |b| {
        let mut payload = Vec::with_capacity(MAX_PAYLOAD);
        let mut frame = Vec::with_capacity(MAX_PAYLOAD + 16);
        b.iter(|| {
            let mut cursor = SegmentCursor::new(black_box(&database), 0, database.len());
            let mut seq = 1u8;
            while !cursor.is_exhausted() {
                cursor.fill(&mut payload);
                template.data_into(&mut frame, cursor.opcode(), seq, &payload);
                seq = seq.wrapping_add(1);
                cursor.advance();
            }
            black_box(frame.len())
        })
    });

    group.bench_function("control_frame", |b| {
        b.iter(|| black_box(template.control(black_box(Opcode::SendNext), black_box(42))))
    });

    group.finish();

    c.bench_function("packets_for_credit", |b| {
        b.iter(|| {
            let mut total = 0u32;
            for credit in (0..=u16::MAX).step_by(97) {
                total += packets_for_credit(black_box(credit));
            }
            black_box(total)
        })
    });
}

fn bench_read_encoding(c: &mut Criterion) {
    let sequence = b"ACGTTGCAACGTNACGTTGCAACGTACGTTGCAACGTACGTTGCAACGTACGTTGCAACGTAC\n";

    c.bench_function("lookup_block_encode_64", |b| {
        b.iter(|| black_box(LookupBlock::encode(black_box(sequence))))
    });

    let batch = reads(&["ACGTACGTACGTACGTACGTACGTACGTACGTAC"; 256]);
    c.bench_function("upload_frames_256_reads", |b| {
        b.iter(|| black_box(upload_frames(black_box(&batch), 2, true)))
    });
}

fn bench_result_aggregation(c: &mut Criterion) {
    let records: Vec<ResultRecord> = (0..512u32)
        .map(|i| ResultRecord {
            location_count: (i % 4) as u16,
            min_mismatches: (i % 3) as u8,
            positions: (0..i % 4).map(|p| 1 + i * 100 + p).collect(),
        })
        .collect();
    let buffer: Vec<u8> = records.iter().flat_map(|r| r.to_bytes(true)).collect();

    let mut group = c.benchmark_group("result_aggregation");
    group.throughput(Throughput::Bytes(buffer.len() as u64));

    group.bench_function("parse_records_512", |b| {
        b.iter(|| black_box(parse_records(black_box(&buffer), records.len(), true)))
    });

    group.bench_function("parse_and_apply_512", |b| {
        let mut table = BestMatchTable::new(records.len());
        b.iter(|| {
            table.reset();
            let parsed = parse_records(&buffer, records.len(), true).unwrap_or_default();
            black_box(table.apply(&parsed))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_payload_frames, bench_read_encoding, bench_result_aggregation);
criterion_main!(benches);
