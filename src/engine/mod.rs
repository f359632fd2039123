//! Streaming engine.
//!
//! A [`ProtocolSession`] owns the link, the frame header, the sequence
//! counter and the discovered [`DeviceSession`]. Streaming one database
//! segment runs two scoped threads that share a [`StreamPhase`] machine:
//!
//! - **stream** (producer) sends payload frames, never more per window than
//!   the last credit allows and never while an overflow is pending, and runs
//!   the overflow drain itself.
//! - **rcv-control** (consumer) receives every control frame and turns it
//!   into a state transition.
//!
//! Both are joined before results are collected. No state survives a
//! segment: every call builds a fresh shared state from the `send_db` credit.

mod consumer;
mod producer;
mod state;

#[cfg(test)]
mod tests;

pub use producer::{PACKET_STRIDE, ProducerReport, SegmentCursor, packets_for_credit};
pub use state::StreamPhase;

use crate::protocol::{
    ControlChannel, DeviceSession, FrameTemplate, Opcode, SequenceCounter, discover,
    tolerate_hiccup, upload_reads,
};
use crate::reads::ReadRecord;
use crate::results::{DrainReport, ResultCollector};
use crate::transport::{CONTROL_FRAME_LEN, Link, MacAddress};
use crate::{LinkError, Result};
use producer::Producer;
use state::SharedStream;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const PRODUCER_THREAD: &str = "stream";
const CONSUMER_THREAD: &str = "rcv-control";

/// Totals of one streamed segment.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SegmentReport {
    /// Credit carried by `send_db`.
    pub initial_credit: u16,
    pub producer: ProducerReport,
    /// The drain after streaming, overflow drains not included.
    pub drain: DrainReport,
}

/// An established session with the accelerator.
pub struct ProtocolSession<L> {
    link: L,
    template: FrameTemplate,
    seq: SequenceCounter,
    device: DeviceSession,
    overflow_settle: Duration,
    overflows: u64,
}

impl<L: Link> ProtocolSession<L> {
    /// Reset the device and discover it.
    ///
    /// `overflow_settle` is the pause after an overflow drain before
    /// streaming resumes.
    pub fn establish(
        link: L,
        local: MacAddress,
        peer: MacAddress,
        overflow_settle: Duration,
    ) -> Result<Self> {
        let template = FrameTemplate::new(local, peer);
        let mut seq = SequenceCounter::new();

        let device = {
            let mut channel = ControlChannel::new(&link, &template, &mut seq);
            tolerate_hiccup(channel.send_control(Opcode::Reset))?;
            discover(&mut channel, peer)?
        };

        Ok(Self { link, template, seq, device, overflow_settle, overflows: 0 })
    }

    pub fn device(&self) -> &DeviceSession {
        &self.device
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Overflow drains over the whole session.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Sequence id the next frame will carry.
    pub fn next_seq(&self) -> u8 {
        self.seq.peek()
    }

    fn channel(&mut self) -> ControlChannel<'_, L> {
        ControlChannel::new(&self.link, &self.template, &mut self.seq)
    }

    /// Upload one batch of reads.
    pub fn upload_reads(
        &mut self,
        reads: &[ReadRecord],
        mismatches: u8,
        report_positions: bool,
    ) -> Result<()> {
        upload_reads(&mut self.channel(), reads, mismatches, report_positions)
    }

    /// Stream `len` packed bytes at `base` and collect the results.
    ///
    /// Waits for `send_db` first. Any error is run-fatal for the batch.
    pub fn stream_segment(
        &mut self,
        database: &[u8],
        base: usize,
        len: usize,
        collector: &mut ResultCollector<'_>,
    ) -> Result<SegmentReport> {
        let initial_credit = self.await_send_db()?;
        info!(base, len, credit = initial_credit, "Streaming segment");

        let shared = SharedStream::new(initial_credit);
        let cursor = SegmentCursor::new(database, base, len);
        let settle = self.overflow_settle;

        let link = &self.link;
        let channel = ControlChannel::new(link, &self.template, &mut self.seq);
        let producer_collector = &mut *collector;
        let shared_ref = &shared;

        let outcome = thread::scope(|s| -> Result<ProducerReport> {
            let consumer = thread::Builder::new()
                .name(CONSUMER_THREAD.into())
                .spawn_scoped(s, move || consumer::run(link, shared_ref))
                .map_err(|source| LinkError::Spawn { thread: CONSUMER_THREAD.into(), source })?;

            let producer = thread::Builder::new().name(PRODUCER_THREAD.into()).spawn_scoped(
                s,
                move || Producer::new(channel, shared_ref, cursor, producer_collector, settle).run(),
            );
            let producer = match producer {
                Ok(handle) => handle,
                Err(source) => {
                    // The consumer leaves on the next frame it receives
                    shared_ref.fail();
                    return Err(LinkError::Spawn { thread: PRODUCER_THREAD.into(), source });
                }
            };

            let produced = producer
                .join()
                .unwrap_or_else(|_| Err(LinkError::WorkerPanicked { thread: PRODUCER_THREAD.into() }));
            let consumed = consumer
                .join()
                .unwrap_or_else(|_| Err(LinkError::WorkerPanicked { thread: CONSUMER_THREAD.into() }));
            merge_outcomes(produced, consumed)
        });

        let producer = outcome?;
        self.overflows += u64::from(producer.overflows);
        if shared.phase() != StreamPhase::Complete {
            return Err(producer::abandoned());
        }

        let drain = collector.collect(&mut self.channel())?;
        Ok(SegmentReport { initial_credit, producer, drain })
    }

    /// Tell the device the next database sequence follows.
    pub fn next_segment(&mut self) -> Result<()> {
        debug!("Next segment");
        tolerate_hiccup(self.channel().send_control(Opcode::NextSegment))
    }

    /// End the run and restart sequence ids at 1.
    pub fn finish_iteration(&mut self) -> Result<()> {
        let result = tolerate_hiccup(self.channel().send_control(Opcode::FinishedIteration));
        self.seq.reset();
        result
    }

    fn await_send_db(&self) -> Result<u16> {
        loop {
            let frame = self.link.receive(CONTROL_FRAME_LEN)?;
            match Opcode::from_byte(frame.opcode_byte()) {
                Some(Opcode::SendDb) => return Ok(frame.body_u16(0)),
                Some(Opcode::Error) => {
                    return Err(LinkError::FrameDropped {
                        seq: frame.body().first().copied().unwrap_or(0),
                    });
                }
                _ => warn!(opcode = frame.opcode_byte(), "Ignoring frame while waiting for send_db"),
            }
        }
    }
}

/// The consumer's error wins: it saw the device's verdict first.
fn merge_outcomes(produced: Result<ProducerReport>, consumed: Result<()>) -> Result<ProducerReport> {
    match (produced, consumed) {
        (_, Err(error)) => Err(error),
        (Err(error), Ok(())) => Err(error),
        (Ok(report), Ok(())) => Ok(report),
    }
}
