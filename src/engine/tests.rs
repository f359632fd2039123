use super::*;
use crate::results::{BestMatchTable, MemorySink, ResultRecord};
use crate::test_utils::{LinkEvent, MockLink, SimDevice, SentFrame, fasta_database, reads, sim_session};
use proptest::prelude::*;

const DATA_OPCODES: [u8; 2] = [0x10, 0x11];

fn database_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

/// Upload `batch`, stream `database` as one segment and return the report.
fn run_segment(
    session: &mut ProtocolSession<MockLink>,
    database: &[u8],
    batch: &[ReadRecord],
    table: &mut BestMatchTable,
    sink: &mut MemorySink,
) -> Result<SegmentReport> {
    session.upload_reads(batch, 0, true)?;
    let units = session.device().unit_count;
    let mut collector = ResultCollector::new(table, batch, sink, "chr1", true, units);
    session.stream_segment(database, 0, database.len(), &mut collector)
}

/// Frames sent after the upload terminator.
fn streamed(sent: &[SentFrame]) -> &[SentFrame] {
    let end = sent
        .iter()
        .position(|f| f.opcode == 0x11 && f.payload.len() == 35 && f.payload.iter().all(|&b| b == 0))
        .expect("upload terminator sent");
    &sent[end + 1..]
}

#[test]
fn single_read_end_to_end() {
    let hit = ResultRecord { location_count: 1, min_mismatches: 0, positions: vec![5] };
    let mut session = sim_session(SimDevice::new().result(&[hit], true)).unwrap();
    assert_eq!(session.device().unit_count, 2);
    assert_eq!(session.link().sent_opcodes()[..2], [0x19, 0x20], "reset then get_id");

    let database = fasta_database(">chr1 test\nACGTACGTACGTTTGG\n");
    let entry = &database.sequences()[0];
    let batch = reads(&["ACGTACGT"]);
    let mut table = BestMatchTable::new(1);
    let mut sink = MemorySink::default();

    session.upload_reads(&batch, 0, true).unwrap();
    let mut collector = ResultCollector::new(&mut table, &batch, &mut sink, entry.name(), true, 2);
    let report = session
        .stream_segment(database.bytes(), entry.byte_offset, entry.packed_len, &mut collector)
        .unwrap();

    assert_eq!(report.initial_credit, 10 * 1496);
    assert_eq!(report.producer.packets, 1);
    assert_eq!(report.producer.overflows, 0);
    assert_eq!(sink.positions(), vec![("r0".to_string(), "chr1".to_string(), 4, 0)]);
    let best = table.get(0).unwrap();
    assert!(best.is_mapped());
    assert_eq!(best.best_mismatches, 0);
    assert_eq!(best.position_count, 1);

    let tail: Vec<u8> = streamed(&session.link().sent()).iter().map(|f| f.opcode).collect();
    assert_eq!(tail, vec![0x10, 0x12, 0x15], "first_data, last_data, get_data");
}

#[test]
fn overflow_mid_burst_drains_before_streaming_resumes() {
    let device = SimDevice::new().credit(6 * 1496, 2, 6 * 1496).overflow_at(2);
    let mut session = sim_session(device).unwrap();
    let database = database_bytes(10 * 1496 + 100);
    let batch = reads(&["ACGTACGT"]);
    let mut table = BestMatchTable::new(1);
    let mut sink = MemorySink::default();

    let report = run_segment(&mut session, &database, &batch, &mut table, &mut sink).unwrap();
    assert_eq!(report.producer.overflows, 1);
    assert_eq!(session.overflows(), 1);
    assert_eq!(report.producer.packets, 11);

    let opcodes: Vec<u8> = streamed(&session.link().sent()).iter().map(|f| f.opcode).collect();
    let ready = opcodes.iter().position(|&op| op == 0x31).expect("overflow_ready sent");
    assert_eq!(&opcodes[ready..ready + 3], &[0x31, 0x15, 0x31]);
    assert!(
        opcodes[ready + 3..].contains(&0x11),
        "streaming resumed after the drain: {opcodes:02x?}"
    );
    assert_eq!(opcodes.iter().filter(|&&op| op == 0x31).count(), 2);
}

#[test]
fn overflow_after_last_data_drains_before_completion() {
    let hit = ResultRecord { location_count: 1, min_mismatches: 1, positions: vec![40] };
    let device = SimDevice::new().overflow_after_last_data().result(&[hit], true);
    let mut session = sim_session(device).unwrap();
    let database = database_bytes(2 * 1496 + 10);
    let batch = reads(&["ACGTACGT"]);
    let mut table = BestMatchTable::new(1);
    let mut sink = MemorySink::default();

    let report = run_segment(&mut session, &database, &batch, &mut table, &mut sink).unwrap();
    assert_eq!(report.producer.packets, 3);
    assert_eq!(report.producer.overflows, 1);

    let opcodes: Vec<u8> = streamed(&session.link().sent()).iter().map(|f| f.opcode).collect();
    assert_eq!(opcodes, vec![0x10, 0x11, 0x11, 0x12, 0x31, 0x15, 0x31, 0x15]);
    assert_eq!(sink.positions(), vec![("r0".to_string(), "chr1".to_string(), 39, 1)]);
    assert_eq!(table.get(0).unwrap().best_mismatches, 1);
}

#[test]
fn oversized_result_dump_keeps_the_records_that_fit() {
    let hit = ResultRecord { location_count: 1, min_mismatches: 0, positions: vec![5] };
    let flood = ResultRecord {
        location_count: 9000,
        min_mismatches: 0,
        positions: (1..=9000).collect(),
    };
    let mut session = sim_session(SimDevice::new().result(&[hit, flood], true)).unwrap();
    let database = database_bytes(100);
    let batch = reads(&["ACGTACGT", "TTTTCCCC"]);
    let mut table = BestMatchTable::new(2);
    let mut sink = MemorySink::default();

    run_segment(&mut session, &database, &batch, &mut table, &mut sink).unwrap();
    assert_eq!(sink.positions(), vec![("r0".to_string(), "chr1".to_string(), 4, 0)]);
    assert!(table.get(0).unwrap().is_mapped());
    assert_eq!(*table.get(1).unwrap(), crate::results::BestMatch::RESET);
}

#[test]
fn lost_frame_during_result_drain_abandons_the_run() {
    let link = MockLink::silent();
    link.queue(vec![0x21, 0x01, 0x00]);
    let mut session =
        ProtocolSession::establish(link, MacAddress::default(), MacAddress::default(), Duration::ZERO)
            .unwrap();
    session.link().queue(vec![0x14, 0x60, 0x3A]);
    session.link().queue(vec![0x16]);
    session.link().queue(vec![0x24, 0x05]);

    let batch = reads(&["ACGT"]);
    let mut table = BestMatchTable::new(1);
    let mut sink = MemorySink::default();
    let mut collector = ResultCollector::new(&mut table, &batch, &mut sink, "chr1", true, 2);
    let err = session.stream_segment(&[0u8; 16], 0, 16, &mut collector).unwrap_err();
    assert!(matches!(err, LinkError::FrameDropped { seq: 5 }), "{err}");
    assert!(err.is_run_fatal());
    assert!(sink.positions().is_empty());
}

#[test]
fn dropped_frame_abandons_the_run() {
    let mut session = sim_session(SimDevice::new().drop_at(2)).unwrap();
    let database = database_bytes(5 * 1496);
    let batch = reads(&["ACGT"]);
    let mut table = BestMatchTable::new(1);
    let mut sink = MemorySink::default();

    let err = run_segment(&mut session, &database, &batch, &mut table, &mut sink).unwrap_err();
    let dropped_seq = streamed(&session.link().sent())[1].seq;
    assert!(matches!(err, LinkError::FrameDropped { seq } if seq == dropped_seq), "{err}");
    assert!(err.is_run_fatal());
    assert!(sink.positions().is_empty());
}

#[test]
fn unexpected_opcode_while_streaming_is_a_violation() {
    let device = SimDevice::new().unexpected_at(1, Opcode::InfoV5);
    let mut session = sim_session(device).unwrap();
    let database = database_bytes(3 * 1496);
    let batch = reads(&["ACGT"]);
    let mut table = BestMatchTable::new(1);
    let mut sink = MemorySink::default();

    let err = run_segment(&mut session, &database, &batch, &mut table, &mut sink).unwrap_err();
    assert!(matches!(err, LinkError::ProtocolViolation { opcode: 0x21, .. }), "{err}");
    assert!(err.is_run_fatal());
}

#[test]
fn error_instead_of_send_db_is_a_dropped_frame() {
    let link = MockLink::silent();
    link.queue(vec![0x21, 0x01, 0x00]);
    let mut session =
        ProtocolSession::establish(link, MacAddress::default(), MacAddress::default(), Duration::ZERO)
            .unwrap();
    session.link().queue(vec![0x13, 0x00, 0x10]);
    session.link().queue(vec![0x24, 0x07]);

    let batch = reads(&["ACGT"]);
    let mut table = BestMatchTable::new(1);
    let mut sink = MemorySink::default();
    let mut collector = ResultCollector::new(&mut table, &batch, &mut sink, "chr1", true, 2);
    let err = session.stream_segment(&[0u8; 16], 0, 16, &mut collector).unwrap_err();
    assert!(matches!(err, LinkError::FrameDropped { seq: 7 }));
}

#[test]
fn finish_iteration_restarts_sequence_ids() {
    let mut session = sim_session(SimDevice::new()).unwrap();
    assert_eq!(session.next_seq(), 3);
    session.next_segment().unwrap();
    session.finish_iteration().unwrap();
    assert_eq!(session.next_seq(), 1);
    let sent = session.link().sent();
    assert_eq!(sent.last().map(|f| f.opcode), Some(0x19));
}

#[test]
fn bursts_never_outrun_granted_credit() {
    let budget = 3;
    let credit = ((budget + 4) * 1496) as u16;
    let device = SimDevice::new().credit(credit, 3, credit);
    let mut session = sim_session(device).unwrap();
    let database = database_bytes(20 * 1496);
    let batch = reads(&["ACGTACGT", "TTTT"]);
    let mut table = BestMatchTable::new(2);
    let mut sink = MemorySink::default();

    run_segment(&mut session, &database, &batch, &mut table, &mut sink).unwrap();

    let mut credits = 0u32;
    let mut data = 0u32;
    let mut streaming = false;
    for event in session.link().events() {
        match event {
            LinkEvent::Reply { opcode: 0x14, .. } => {
                streaming = true;
                credits += 1;
            }
            LinkEvent::Reply { opcode: 0x13, .. } if streaming => credits += 1,
            LinkEvent::Sent { opcode, .. } if streaming && DATA_OPCODES.contains(&opcode) => {
                data += 1;
                assert!(data <= credits * budget as u32, "{data} packets on {credits} credits");
            }
            _ => {}
        }
    }
    assert_eq!(data, 21);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_interleaving_streams_the_whole_segment(
        budget in 1usize..=6,
        every in 1usize..=6,
        len in 0usize..8 * 1496,
        overflow in proptest::option::of(1usize..10),
    ) {
        let every = every.min(budget);
        let credit = ((budget + 4) * 1496) as u16;
        let total = len / 1496 + 1;
        let mut device = SimDevice::new().credit(credit, every, credit);
        if let Some(at) = overflow.filter(|&at| at <= total) {
            device = device.overflow_at(at);
        }

        let mut session = sim_session(device).unwrap();
        let database = database_bytes(len);
        let batch = reads(&["ACGTACGTAC"]);
        let mut table = BestMatchTable::new(1);
        let mut sink = MemorySink::default();

        let report = run_segment(&mut session, &database, &batch, &mut table, &mut sink).unwrap();
        prop_assert_eq!(report.producer.packets, total);

        let sent = session.link().sent();
        let tail = streamed(&sent);
        let data = tail.iter().filter(|f| f.is_data()).count();
        prop_assert_eq!(data, total);
        prop_assert_eq!(tail.iter().filter(|f| f.opcode == 0x12).count(), 1);

        let readies: Vec<usize> =
            tail.iter().enumerate().filter(|(_, f)| f.opcode == 0x31).map(|(i, _)| i).collect();
        prop_assert_eq!(readies.len() as u32, 2 * report.producer.overflows);
        for pair in readies.chunks(2) {
            prop_assert!(!tail[pair[0]..pair[1]].iter().any(|f| f.is_data()));
        }
    }
}
