//! Producer thread: streams one database segment under the device's window.

use super::state::{FailOnPanic, Interrupt, SharedStream, WindowEvent};
use crate::protocol::{ControlChannel, Opcode, tolerate_hiccup};
use crate::results::ResultCollector;
use crate::transport::{Link, MAX_PAYLOAD};
use crate::{LinkError, Result};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Database bytes consumed per packet. One byte less than the payload
/// carries: consecutive packets overlap by one byte.
pub const PACKET_STRIDE: usize = 1496;
/// Packets kept in reserve below the advertised credit.
const CREDIT_RESERVE: u32 = 4;

/// Packets one credit unlocks.
///
/// The credit is converted to whole packets and four are kept in reserve.
/// A credit that does not cover the reserve unlocks nothing; the largest
/// 16-bit credit unlocks 39.
pub fn packets_for_credit(credit: u16) -> u32 {
    (u32::from(credit) / PACKET_STRIDE as u32).saturating_sub(CREDIT_RESERVE)
}

/// Transmit position within one sequence of the mapped database.
#[derive(Debug, Clone)]
pub struct SegmentCursor<'a> {
    database: &'a [u8],
    base: usize,
    len: usize,
    total_packets: usize,
    packets_sent: usize,
}

impl<'a> SegmentCursor<'a> {
    /// Cursor over `len` packed bytes starting at `base`.
    pub fn new(database: &'a [u8], base: usize, len: usize) -> Self {
        Self { database, base, len, total_packets: len / PACKET_STRIDE + 1, packets_sent: 0 }
    }

    pub fn total_packets(&self) -> usize {
        self.total_packets
    }

    pub fn packets_sent(&self) -> usize {
        self.packets_sent
    }

    pub fn is_exhausted(&self) -> bool {
        self.packets_sent >= self.total_packets
    }

    /// Tag for the next packet.
    pub fn opcode(&self) -> Opcode {
        if self.packets_sent == 0 { Opcode::FirstData } else { Opcode::Data }
    }

    /// Payload length of packet `index`: full, except the remainder at the end.
    pub fn payload_len(&self, index: usize) -> usize {
        if index + 1 == self.total_packets {
            self.len - PACKET_STRIDE * index
        } else {
            MAX_PAYLOAD
        }
    }

    /// Build the next payload: a reserved zero byte then database bytes.
    ///
    /// Reads past the end of the mapping are zero-filled.
    pub fn fill(&self, payload: &mut Vec<u8>) {
        let len = self.payload_len(self.packets_sent);
        payload.clear();
        payload.resize(len, 0);
        if len == 0 {
            return;
        }
        let start = (self.base + PACKET_STRIDE * self.packets_sent).min(self.database.len());
        let end = (start + len - 1).min(self.database.len());
        payload[1..1 + end - start].copy_from_slice(&self.database[start..end]);
    }

    pub fn advance(&mut self) {
        self.packets_sent += 1;
    }
}

/// Totals of one producer run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProducerReport {
    pub packets: usize,
    pub bursts: u32,
    pub overflows: u32,
    pub elapsed: Duration,
}

impl ProducerReport {
    /// Transmit bandwidth in Mbit/s. Informational only.
    pub fn bandwidth_mbit(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.packets as f64 * PACKET_STRIDE as f64 * 8.0) / secs / (1024.0 * 1024.0)
    }
}

/// Streams a segment and runs the overflow protocol on demand.
pub(crate) struct Producer<'a, 'c, L: ?Sized> {
    channel: ControlChannel<'a, L>,
    shared: &'a SharedStream,
    cursor: SegmentCursor<'a>,
    collector: &'a mut ResultCollector<'c>,
    overflow_settle: Duration,
    report: ProducerReport,
}

impl<'a, 'c, L: Link + ?Sized> Producer<'a, 'c, L> {
    pub(crate) fn new(
        channel: ControlChannel<'a, L>,
        shared: &'a SharedStream,
        cursor: SegmentCursor<'a>,
        collector: &'a mut ResultCollector<'c>,
        overflow_settle: Duration,
    ) -> Self {
        Self { channel, shared, cursor, collector, overflow_settle, report: ProducerReport::default() }
    }

    /// Stream until the device reports `finished_search`.
    ///
    /// Returns `Ok` with partial totals when the consumer failed the run; the
    /// consumer's error is the one that gets reported.
    pub(crate) fn run(mut self) -> Result<ProducerReport> {
        let _guard = FailOnPanic(self.shared);
        let started = Instant::now();
        let mut payload = Vec::with_capacity(MAX_PAYLOAD);

        'stream: while !self.cursor.is_exhausted() {
            match self.shared.wait_for_window() {
                WindowEvent::Credit(credit) => {
                    let budget = packets_for_credit(credit);
                    if budget == 0 {
                        debug!(credit, "Credit below reserve, waiting for more");
                        continue;
                    }
                    debug!(credit, packets = budget, "Window open");
                    self.report.bursts += 1;

                    let mut sent = 0;
                    while sent < budget && !self.cursor.is_exhausted() {
                        let opcode = self.cursor.opcode();
                        self.cursor.fill(&mut payload);
                        let channel = &mut self.channel;
                        match self.shared.send_if_clear(|| channel.send_data(opcode, &payload)) {
                            Ok(result) => {
                                tolerate_hiccup(result).inspect_err(|_| self.shared.fail())?;
                                self.cursor.advance();
                                sent += 1;
                            }
                            Err(Interrupt::Overflow) => self.handle_overflow()?,
                            Err(Interrupt::Failed) => break 'stream,
                        }
                    }
                }
                WindowEvent::Overflow => self.handle_overflow()?,
                WindowEvent::Complete => {
                    warn!(
                        sent = self.cursor.packets_sent(),
                        total = self.cursor.total_packets(),
                        "Device finished before the segment was fully streamed"
                    );
                    break;
                }
                WindowEvent::Failed => break,
            }
        }

        self.report.packets = self.cursor.packets_sent();
        self.report.elapsed = started.elapsed();

        if self.shared.phase().is_terminal() {
            return Ok(self.report);
        }

        loop {
            let channel = &mut self.channel;
            match self.shared.send_if_clear(|| channel.send_control(Opcode::LastData)) {
                Ok(result) => {
                    tolerate_hiccup(result).inspect_err(|_| self.shared.fail())?;
                    break;
                }
                Err(Interrupt::Overflow) => self.handle_overflow()?,
                Err(Interrupt::Failed) => return Ok(self.report),
            }
        }

        loop {
            match self.shared.wait_for_completion() {
                WindowEvent::Overflow => self.handle_overflow()?,
                WindowEvent::Complete => break,
                WindowEvent::Failed => return Ok(self.report),
                WindowEvent::Credit(_) => {}
            }
        }

        info!(
            packets = self.report.packets,
            overflows = self.report.overflows,
            mbit_s = self.report.bandwidth_mbit(),
            "Segment streamed"
        );
        Ok(self.report)
    }

    /// Overflow protocol.
    ///
    /// `overflow_ready`, inline result drain, `overflow_ready` again, a short
    /// settle pause, then streaming resumes. No payload frame leaves while
    /// this runs.
    fn handle_overflow(&mut self) -> Result<()> {
        if !self.shared.begin_drain() {
            return Ok(());
        }
        self.report.overflows += 1;
        debug!(count = self.report.overflows, "Device overflow, draining results");

        match self.drain() {
            Ok(late_credit) => {
                self.shared.finish_drain();
                if let Some(credit) = late_credit {
                    self.shared.grant_credit(credit);
                }
                Ok(())
            }
            Err(error) => {
                self.shared.fail();
                Err(error)
            }
        }
    }

    fn drain(&mut self) -> Result<Option<u16>> {
        tolerate_hiccup(self.channel.send_control(Opcode::OverflowReady))?;
        let report = self.collector.collect(&mut self.channel)?;
        tolerate_hiccup(self.channel.send_control(Opcode::OverflowReady))?;
        if !self.overflow_settle.is_zero() {
            thread::sleep(self.overflow_settle);
        }
        Ok(report.late_credit)
    }
}

/// Error returned when a run was abandoned without a more specific cause.
pub(crate) fn abandoned() -> LinkError {
    LinkError::protocol_violation("stream (run abandoned)", 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn credit_boundaries() {
        assert_eq!(packets_for_credit(0), 0, "zero credit sends nothing");
        assert_eq!(packets_for_credit(3 * 1496), 0, "too small for the reserve");
        assert_eq!(packets_for_credit(5 * 1496 - 1), 0, "reserve exactly used up");
        assert_eq!(packets_for_credit(5 * 1496), 1);
        assert_eq!(packets_for_credit(43 * 1496), 39);
        assert_eq!(packets_for_credit(u16::MAX), 39);
    }

    #[test]
    fn cursor_splits_segment_with_overlap() {
        let database: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let mut cursor = SegmentCursor::new(&database, 0, 3000);
        assert_eq!(cursor.total_packets(), 3);
        assert_eq!(cursor.opcode(), Opcode::FirstData);

        let mut payload = Vec::new();
        cursor.fill(&mut payload);
        assert_eq!(payload.len(), MAX_PAYLOAD);
        assert_eq!(payload[0], 0);
        assert_eq!(&payload[1..], &database[..1497]);

        cursor.advance();
        assert_eq!(cursor.opcode(), Opcode::Data);
        cursor.fill(&mut payload);
        assert_eq!(&payload[1..], &database[1496..2993]);

        cursor.advance();
        cursor.fill(&mut payload);
        assert_eq!(payload.len(), 3000 - 2 * 1496);
        assert_eq!(payload[0], 0);
        assert_eq!(&payload[1..], &database[2992..2999], "reserved byte plus remainder less one");

        cursor.advance();
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn reads_past_mapping_are_zero_filled() {
        let database = vec![0xFFu8; 1498];
        let mut cursor = SegmentCursor::new(&database, 0, 1500);
        cursor.advance();
        let mut payload = Vec::new();
        cursor.fill(&mut payload);
        assert_eq!(payload, vec![0, 0xFF, 0xFF, 0]);
    }

    #[test]
    fn exact_multiple_ends_with_empty_packet() {
        let database = vec![1u8; 2 * 1496];
        let cursor = SegmentCursor::new(&database, 0, 2 * 1496);
        assert_eq!(cursor.total_packets(), 3);
        assert_eq!(cursor.payload_len(2), 0);
    }

    proptest! {
        #[test]
        fn burst_never_exceeds_credit(credit in any::<u16>()) {
            let burst = packets_for_credit(credit);
            prop_assert!(burst * PACKET_STRIDE as u32 <= u32::from(credit));
            let whole = u32::from(credit) / PACKET_STRIDE as u32;
            if whole >= CREDIT_RESERVE {
                prop_assert_eq!(burst + CREDIT_RESERVE, whole);
            } else {
                prop_assert_eq!(burst, 0);
            }
        }

        #[test]
        fn cursor_covers_every_byte_once(len in 0usize..10_000, base in 0usize..64) {
            let database: Vec<u8> = (0..base + len + 8).map(|i| (i % 253) as u8 + 1).collect();
            let mut cursor = SegmentCursor::new(&database, base, len);
            let mut payload = Vec::new();
            let mut streamed = Vec::new();
            while !cursor.is_exhausted() {
                cursor.fill(&mut payload);
                prop_assert!(payload.len() <= MAX_PAYLOAD);
                if !payload.is_empty() {
                    // Stride bytes of new data, the last byte overlaps the next packet
                    let take = (payload.len() - 1).min(PACKET_STRIDE);
                    streamed.extend_from_slice(&payload[1..1 + take]);
                }
                cursor.advance();
            }
            let expected = &database[base..base + len.saturating_sub(1)];
            prop_assert!(streamed.starts_with(expected));
        }
    }
}
