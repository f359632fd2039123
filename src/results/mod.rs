//! Result collection and per-read aggregation.
//!
//! After every segment (and during every overflow drain) the device dumps
//! its result memory: one variable-length record per active read, in read
//! order.
//!
//! ```text
//! [location_count: u16 LE] [min_mismatches: u8] [pad: u8] [position: u32 LE] * location_count
//! ```
//!
//! Positions are only present when the batch was uploaded with position
//! reporting on. They are 1-based on the wire and emitted 0-based.
//!
//! Aggregation is a pure function of the buffer: [`BestMatchTable::apply`]
//! touches nothing but the table, and everything that writes output goes
//! through a [`ResultSink`].

mod drain;
pub mod sink;

pub use drain::{DrainReport, RESULT_BYTES_PER_UNIT, drain_results};
pub use sink::{FileSink, MemorySink, OutputPaths, ResultSink, SinkEvent, TextSink};

use crate::protocol::ControlChannel;
use crate::reads::ReadRecord;
use crate::transport::Link;
use crate::{LinkError, Result};
use tracing::{debug, warn};

/// Mismatch value meaning "no match found".
pub const UNMAPPED: i8 = 8;
const RECORD_HEADER_LEN: usize = 4;

/// One read's result as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub location_count: u16,
    pub min_mismatches: u8,
    /// 1-based positions, empty when positions were not requested.
    pub positions: Vec<u32>,
}

impl ResultRecord {
    /// Wire form, positions included only when `with_positions`.
    pub fn to_bytes(&self, with_positions: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + self.positions.len() * 4);
        out.extend_from_slice(&self.location_count.to_le_bytes());
        out.push(self.min_mismatches);
        out.push(0);
        if with_positions {
            for position in &self.positions {
                out.extend_from_slice(&position.to_le_bytes());
            }
        }
        out
    }
}

/// Parse `reads` consecutive records from a drained buffer.
///
/// A record that runs past the end of the buffer means the device sent a
/// malformed dump.
pub fn parse_records(buffer: &[u8], reads: usize, with_positions: bool) -> Result<Vec<ResultRecord>> {
    let records = parse_complete_records(buffer, reads, with_positions);
    if records.len() < reads {
        return Err(LinkError::malformed_results(format!(
            "record {} of {} runs past the end of the {}-byte buffer",
            records.len(),
            reads,
            buffer.len()
        )));
    }
    Ok(records)
}

/// Parse up to `reads` records, stopping at the first one that does not fit.
pub fn parse_complete_records(buffer: &[u8], reads: usize, with_positions: bool) -> Vec<ResultRecord> {
    let mut records = Vec::with_capacity(reads);
    let mut offset = 0;

    for _ in 0..reads {
        let Some(header) = buffer.get(offset..offset + RECORD_HEADER_LEN) else {
            break;
        };
        let location_count = u16::from_le_bytes([header[0], header[1]]);
        let min_mismatches = header[2];

        let len = if with_positions { usize::from(location_count) * 4 } else { 0 };
        let Some(body) = buffer.get(offset + RECORD_HEADER_LEN..offset + RECORD_HEADER_LEN + len) else {
            break;
        };
        offset += RECORD_HEADER_LEN + len;

        let positions =
            body.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        records.push(ResultRecord { location_count, min_mismatches, positions });
    }

    records
}

/// Best match seen so far for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestMatch {
    /// Fewest mismatches of any match, [`UNMAPPED`] if none.
    pub best_mismatches: i8,
    /// Fewest mismatches the device reported while the read stayed unmapped.
    pub best_unmapped: i8,
    /// Saturating sum of all reported locations.
    pub position_count: u16,
}

impl BestMatch {
    pub const RESET: Self =
        Self { best_mismatches: UNMAPPED, best_unmapped: UNMAPPED, position_count: 0 };

    pub fn is_mapped(&self) -> bool {
        self.best_mismatches < UNMAPPED
    }
}

impl Default for BestMatch {
    fn default() -> Self {
        Self::RESET
    }
}

/// Per-read best match for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestMatchTable {
    entries: Vec<BestMatch>,
}

impl BestMatchTable {
    pub fn new(reads: usize) -> Self {
        Self { entries: vec![BestMatch::RESET; reads] }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BestMatch] {
        &self.entries
    }

    pub fn get(&self, read: usize) -> Option<&BestMatch> {
        self.entries.get(read)
    }

    pub fn reset(&mut self) {
        self.entries.fill(BestMatch::RESET);
    }

    pub fn mapped(&self) -> usize {
        self.entries.iter().filter(|e| e.is_mapped()).count()
    }

    /// Fold records into the table, returning the number of locations added.
    ///
    /// `best_mismatches` and `best_unmapped` only ever go down.
    pub fn apply(&mut self, records: &[ResultRecord]) -> u64 {
        let mut locations = 0u64;
        for (entry, record) in self.entries.iter_mut().zip(records) {
            let mismatches = record.min_mismatches.min(i8::MAX as u8) as i8;
            if record.location_count > 0 {
                entry.position_count = entry.position_count.saturating_add(record.location_count);
                locations += u64::from(record.location_count);
                if mismatches < entry.best_mismatches {
                    entry.best_mismatches = mismatches;
                }
            } else if mismatches < entry.best_unmapped {
                entry.best_unmapped = mismatches;
            }
        }
        locations
    }
}

/// Running totals of a collector.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CollectStats {
    pub drains: u32,
    pub bytes: u64,
    pub locations: u64,
    /// Sum of per-drain receive bandwidth, Mbit/s.
    pub rx_bandwidth_sum: f64,
}

/// Drains results from the device and folds them into a batch's table.
///
/// Used by the producer thread for overflow drains and by the session for
/// the final drain of each segment.
pub struct ResultCollector<'a> {
    table: &'a mut BestMatchTable,
    reads: &'a [ReadRecord],
    sink: &'a mut (dyn ResultSink + Send),
    sequence: &'a str,
    report_positions: bool,
    capacity: usize,
    stats: CollectStats,
}

impl<'a> ResultCollector<'a> {
    pub fn new(
        table: &'a mut BestMatchTable,
        reads: &'a [ReadRecord],
        sink: &'a mut (dyn ResultSink + Send),
        sequence: &'a str,
        report_positions: bool,
        unit_count: u32,
    ) -> Self {
        Self {
            table,
            reads,
            sink,
            sequence,
            report_positions,
            capacity: unit_count as usize * RESULT_BYTES_PER_UNIT,
            stats: CollectStats::default(),
        }
    }

    /// Request, receive and absorb one result dump.
    pub fn collect<L: Link + ?Sized>(
        &mut self,
        channel: &mut ControlChannel<'_, L>,
    ) -> Result<DrainReport> {
        let (buffer, report) = drain_results(channel, self.capacity)?;
        self.stats.drains += 1;
        self.stats.bytes += buffer.len() as u64;
        self.stats.rx_bandwidth_sum += report.bandwidth_mbit();

        if buffer.is_empty() {
            warn!(sequence = self.sequence, "Device sent no result data");
            return Ok(report);
        }
        if report.discarded > 0 {
            let records = parse_complete_records(&buffer, self.reads.len(), self.report_positions);
            warn!(
                sequence = self.sequence,
                kept = records.len(),
                lost = self.reads.len() - records.len(),
                "Result buffer truncated, reads past the cut keep their earlier results"
            );
            self.fold(&records)?;
        } else {
            self.absorb(&buffer)?;
        }
        Ok(report)
    }

    /// Parse a result buffer, update the table and emit positions.
    pub fn absorb(&mut self, buffer: &[u8]) -> Result<u64> {
        let records = parse_records(buffer, self.reads.len(), self.report_positions)?;
        self.fold(&records)
    }

    fn fold(&mut self, records: &[ResultRecord]) -> Result<u64> {
        let locations = self.table.apply(records);
        self.stats.locations += locations;

        if self.report_positions {
            for (read, record) in self.reads.iter().zip(records) {
                for &position in &record.positions {
                    self.sink.position(
                        &read.label,
                        self.sequence,
                        position.saturating_sub(1),
                        record.min_mismatches,
                    )?;
                }
            }
        }

        debug!(sequence = self.sequence, locations, "Results absorbed");
        Ok(locations)
    }

    pub fn stats(&self) -> CollectStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(count: u16, mm: u8, positions: &[u32]) -> ResultRecord {
        ResultRecord { location_count: count, min_mismatches: mm, positions: positions.to_vec() }
    }

    #[test]
    fn parses_records_in_order() {
        let mut buffer = record(2, 1, &[10, 20]).to_bytes(true);
        buffer.extend(record(0, 3, &[]).to_bytes(true));
        buffer.extend([0u8; 16]); // trailing padding from the last frame

        let records = parse_records(&buffer, 2, true).unwrap();
        assert_eq!(records[0], record(2, 1, &[10, 20]));
        assert_eq!(records[1], record(0, 3, &[]));
    }

    #[test]
    fn without_positions_records_are_header_only() {
        let mut buffer = record(7, 2, &[]).to_bytes(false);
        buffer.extend(record(1, 0, &[]).to_bytes(false));
        let records = parse_records(&buffer, 2, false).unwrap();
        assert_eq!(records[0].location_count, 7);
        assert!(records[0].positions.is_empty());
        assert_eq!(records[1].location_count, 1);
    }

    #[test]
    fn truncated_buffer_is_malformed_and_run_fatal() {
        let buffer = record(3, 0, &[1, 2, 3]).to_bytes(true);
        let err = parse_records(&buffer[..10], 1, true).unwrap_err();
        assert!(matches!(err, LinkError::MalformedResults { .. }), "{err}");
        assert!(err.is_run_fatal());
        assert!(parse_records(&buffer, 2, true).is_err());
    }

    #[test]
    fn complete_records_stop_at_the_cut() {
        let mut buffer = record(1, 0, &[7]).to_bytes(true);
        buffer.extend(record(2, 1, &[8, 9]).to_bytes(true));
        buffer.truncate(8 + 6);

        let records = parse_complete_records(&buffer, 2, true);
        assert_eq!(records, vec![record(1, 0, &[7])]);
    }

    #[test]
    fn best_values_only_decrease() {
        let mut table = BestMatchTable::new(2);
        table.apply(&[record(1, 2, &[]), record(0, 4, &[])]);
        table.apply(&[record(1, 3, &[]), record(0, 5, &[])]);
        table.apply(&[record(2, 1, &[]), record(0, 3, &[])]);

        let mapped = table.get(0).unwrap();
        assert_eq!(mapped.best_mismatches, 1);
        assert_eq!(mapped.position_count, 4);
        let unmapped = table.get(1).unwrap();
        assert!(!unmapped.is_mapped());
        assert_eq!(unmapped.best_unmapped, 3);
        assert_eq!(table.mapped(), 1);

        table.reset();
        assert!(table.entries().iter().all(|e| *e == BestMatch::RESET));
    }

    #[test]
    fn position_count_saturates() {
        let mut table = BestMatchTable::new(1);
        table.apply(&[record(u16::MAX, 0, &[])]);
        table.apply(&[record(10, 0, &[])]);
        assert_eq!(table.get(0).unwrap().position_count, u16::MAX);
    }

    #[test]
    fn collector_emits_zero_based_positions() {
        let reads = vec![ReadRecord::from_sequence("r0", b"ACGTACGT")];
        let mut table = BestMatchTable::new(1);
        let mut sink = MemorySink::default();
        let mut collector = ResultCollector::new(&mut table, &reads, &mut sink, "chr1", true, 2);

        let added = collector.absorb(&record(1, 0, &[5]).to_bytes(true)).unwrap();
        assert_eq!(added, 1);
        assert_eq!(
            sink.positions(),
            vec![("r0".to_string(), "chr1".to_string(), 4, 0)]
        );
        assert_eq!(table.get(0).unwrap().best_mismatches, 0);
    }

    fn arb_record(with_positions: bool) -> impl Strategy<Value = ResultRecord> {
        (0u16..6, 0u8..9).prop_flat_map(move |(count, mm)| {
            let n = if with_positions { count as usize } else { 0 };
            proptest::collection::vec(1u32..1_000_000, n)
                .prop_map(move |positions| record(count, mm, &positions))
        })
    }

    proptest! {
        #[test]
        fn aggregation_is_a_pure_function_of_the_buffer(
            with_positions in any::<bool>(),
            records in proptest::collection::vec(arb_record(true), 1..12)
        ) {
            let records: Vec<ResultRecord> = records
                .into_iter()
                .map(|mut r| { if !with_positions { r.positions.clear(); } r })
                .collect();
            let buffer: Vec<u8> = records.iter().flat_map(|r| r.to_bytes(with_positions)).collect();

            let mut first = BestMatchTable::new(records.len());
            first.apply(&parse_records(&buffer, records.len(), with_positions).unwrap());
            let mut second = BestMatchTable::new(records.len());
            second.apply(&parse_records(&buffer, records.len(), with_positions).unwrap());

            prop_assert_eq!(&first, &second);
            for (entry, record) in first.entries().iter().zip(&records) {
                let mapped = record.location_count > 0 && record.min_mismatches < UNMAPPED as u8;
                prop_assert_eq!(entry.is_mapped(), mapped);
            }
        }

        #[test]
        fn header_only_records_parse_for_any_count(records in proptest::collection::vec(arb_record(false), 0..20)) {
            let buffer: Vec<u8> = records.iter().flat_map(|r| r.to_bytes(false)).collect();
            prop_assert_eq!(parse_records(&buffer, records.len(), false).unwrap(), records);
        }
    }
}
