//! Test utilities: an in-memory link and a scripted accelerator.
//!
//! [`MockLink`] records every frame handed to it and serves queued replies
//! to `receive`. Replies are either queued by hand or produced by a
//! responder that sees each sent frame, typically a [`SimDevice`].

#![cfg(any(test, feature = "benchmark"))]

use crate::database::{Database, pack_fasta};
use crate::engine::ProtocolSession;
use crate::protocol::Opcode;
use crate::reads::ReadRecord;
use crate::results::{ResultRecord, UNMAPPED};
use crate::transport::{
    InboundFrame, Link, MAX_PAYLOAD, MacAddress, OPCODE_OFFSET, PAYLOAD_OFFSET, SEQ_OFFSET,
};
use crate::{LinkError, Result};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Host address used by fixtures.
pub const HOST_MAC: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
/// Device address used by fixtures.
pub const DEVICE_MAC: MacAddress = MacAddress::new([0x00, 0x0a, 0x35, 0x02, 0x2a, 0x42]);

/// How long `receive` waits before failing. Keeps a broken test from hanging.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// A frame handed to the link, header stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub opcode: u8,
    pub seq: u8,
    pub payload: Vec<u8>,
}

impl SentFrame {
    fn parse(frame: &[u8]) -> Self {
        Self {
            opcode: frame.get(OPCODE_OFFSET).copied().unwrap_or(0),
            seq: frame.get(SEQ_OFFSET).copied().unwrap_or(0),
            payload: frame.get(PAYLOAD_OFFSET..).unwrap_or(&[]).to_vec(),
        }
    }

    pub fn is_data(&self) -> bool {
        self.opcode == Opcode::FirstData.as_byte() || self.opcode == Opcode::Data.as_byte()
    }
}

/// Everything that crossed the link, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Sent { opcode: u8, seq: u8, len: usize },
    /// A queued reply was handed to a receiver.
    Reply { opcode: u8, credit: u16 },
}

type Responder = Box<dyn FnMut(&SentFrame) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct Inbox {
    frames: VecDeque<Vec<u8>>,
}

/// In-memory [`Link`].
pub struct MockLink {
    inbox: Mutex<Inbox>,
    arrived: Condvar,
    responder: Mutex<Option<Responder>>,
    sent: Mutex<Vec<SentFrame>>,
    events: Mutex<Vec<LinkEvent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockLink {
    /// A link that never answers on its own.
    pub fn silent() -> Self {
        Self {
            inbox: Mutex::new(Inbox::default()),
            arrived: Condvar::new(),
            responder: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// A link that asks `responder` for replies to every sent frame.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&SentFrame) -> Vec<Vec<u8>> + Send + 'static,
    {
        let link = Self::silent();
        *lock(&link.responder) = Some(Box::new(responder));
        link
    }

    /// A link with a scripted device on the other end.
    pub fn with_device(mut device: SimDevice) -> Self {
        Self::with_responder(move |frame| device.respond(frame))
    }

    /// Queue a reply; `frame` starts with the opcode.
    pub fn queue(&self, frame: Vec<u8>) {
        lock(&self.inbox).frames.push_back(frame);
        self.arrived.notify_all();
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        lock(&self.sent).clone()
    }

    pub fn sent_opcodes(&self) -> Vec<u8> {
        lock(&self.sent).iter().map(|f| f.opcode).collect()
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        lock(&self.events).clone()
    }
}

impl Link for MockLink {
    fn send(&self, frame: &[u8]) -> Result<()> {
        let sent = SentFrame::parse(frame);
        lock(&self.events).push(LinkEvent::Sent {
            opcode: sent.opcode,
            seq: sent.seq,
            len: sent.payload.len(),
        });

        let replies = match lock(&self.responder).as_mut() {
            Some(responder) => responder(&sent),
            None => Vec::new(),
        };
        lock(&self.sent).push(sent);
        for reply in replies {
            self.queue(reply);
        }
        Ok(())
    }

    fn receive(&self, max_len: usize) -> Result<InboundFrame> {
        let inbox = lock(&self.inbox);
        let (mut inbox, timeout) = self
            .arrived
            .wait_timeout_while(inbox, RECEIVE_TIMEOUT, |inbox| inbox.frames.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        if timeout.timed_out() {
            return Err(LinkError::Receive {
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "mock link idle"),
            });
        }

        let Some(mut frame) = inbox.frames.pop_front() else {
            return Err(LinkError::Receive {
                source: std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            });
        };
        frame.truncate(max_len);
        let frame = InboundFrame::new(frame);
        // Recorded under the inbox lock so replies appear in delivery order
        lock(&self.events).push(LinkEvent::Reply {
            opcode: frame.opcode_byte(),
            credit: frame.body_u16(0),
        });
        Ok(frame)
    }
}

/// Inbound frame bytes: opcode then body.
pub fn device_frame(opcode: Opcode, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(opcode.as_byte());
    frame.extend_from_slice(body);
    frame
}

fn credit_frame(opcode: Opcode, credit: u16) -> Vec<u8> {
    device_frame(opcode, &credit.to_le_bytes())
}

/// Result frames for one dump: status byte first, then up to 1498 bytes each.
pub fn result_frames(buffer: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut first = vec![Opcode::Data.as_byte(), 0x00];
    let head = buffer.len().min(MAX_PAYLOAD - 1);
    first.extend_from_slice(&buffer[..head]);
    frames.push(first);
    for chunk in buffer[head..].chunks(MAX_PAYLOAD) {
        frames.push(device_frame(Opcode::Data, chunk));
    }
    frames.push(device_frame(Opcode::FinishedSending, &[]));
    frames
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimPhase {
    Uploading,
    Streaming,
}

/// Scripted accelerator.
///
/// Answers discovery, accepts an upload, grants credit while a segment is
/// streamed and serves result dumps on `get_data`. Overflow and frame loss
/// can be injected at a given packet of a segment.
pub struct SimDevice {
    identity: Opcode,
    half_units: u16,
    initial_credit: u16,
    credit: u16,
    credit_every: usize,
    overflow_at: Option<usize>,
    overflow_on_last: bool,
    drop_at: Option<usize>,
    unexpected_at: Option<(usize, Opcode)>,
    results: VecDeque<Vec<u8>>,

    phase: SimPhase,
    reads: usize,
    packets: usize,
    overflowed: bool,
    ready_seen: bool,
    deferred: Vec<Vec<u8>>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    /// A Virtex-5 with two units, granting credit for 6 packets every 3.
    pub fn new() -> Self {
        Self {
            identity: Opcode::InfoV5,
            half_units: 1,
            initial_credit: 10 * 1496,
            credit: 10 * 1496,
            credit_every: 3,
            overflow_at: None,
            overflow_on_last: false,
            drop_at: None,
            unexpected_at: None,
            results: VecDeque::new(),
            phase: SimPhase::Uploading,
            reads: 0,
            packets: 0,
            overflowed: false,
            ready_seen: false,
            deferred: Vec::new(),
        }
    }

    pub fn identity(mut self, opcode: Opcode, half_units: u16) -> Self {
        self.identity = opcode;
        self.half_units = half_units;
        self
    }

    pub fn credit(mut self, initial: u16, every_packets: usize, credit: u16) -> Self {
        self.initial_credit = initial;
        self.credit_every = every_packets.max(1);
        self.credit = credit;
        self
    }

    /// Signal overflow after the `packet`-th packet of a segment, once.
    pub fn overflow_at(mut self, packet: usize) -> Self {
        self.overflow_at = Some(packet);
        self
    }

    /// Signal overflow in answer to the next `last_data`, holding
    /// `finished_search` back until the drain is acknowledged.
    pub fn overflow_after_last_data(mut self) -> Self {
        self.overflow_on_last = true;
        self
    }

    /// Report the `packet`-th packet of a segment as lost, once.
    pub fn drop_at(mut self, packet: usize) -> Self {
        self.drop_at = Some(packet);
        self
    }

    /// Answer the `packet`-th packet of a segment with `opcode`, once.
    pub fn unexpected_at(mut self, packet: usize, opcode: Opcode) -> Self {
        self.unexpected_at = Some((packet, opcode));
        self
    }

    /// Serve `records` on the next `get_data` without a more specific result.
    pub fn result(mut self, records: &[ResultRecord], with_positions: bool) -> Self {
        self.results.push_back(records.iter().flat_map(|r| r.to_bytes(with_positions)).collect());
        self
    }

    /// Reply to one frame from the host.
    pub fn respond(&mut self, frame: &SentFrame) -> Vec<Vec<u8>> {
        let Some(opcode) = Opcode::from_byte(frame.opcode) else {
            return Vec::new();
        };

        match opcode {
            Opcode::GetId => vec![credit_frame(self.identity, self.half_units)],
            Opcode::Reset => {
                self.phase = SimPhase::Uploading;
                self.overflowed = false;
                self.deferred.clear();
                Vec::new()
            }
            Opcode::FirstData | Opcode::Data => self.on_data(opcode, frame),
            Opcode::LastData if self.overflow_on_last => {
                self.overflow_on_last = false;
                self.overflowed = true;
                self.deferred.push(device_frame(Opcode::FinishedSearch, &[]));
                vec![device_frame(Opcode::Overflow, &[])]
            }
            Opcode::LastData => self.emit(device_frame(Opcode::FinishedSearch, &[])),
            Opcode::NextSegment => {
                self.packets = 0;
                vec![credit_frame(Opcode::SendDb, self.initial_credit)]
            }
            Opcode::GetData => result_frames(&self.next_result()),
            Opcode::OverflowReady => {
                if self.ready_seen {
                    self.ready_seen = false;
                    self.overflowed = false;
                    std::mem::take(&mut self.deferred)
                } else {
                    self.ready_seen = true;
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_data(&mut self, opcode: Opcode, frame: &SentFrame) -> Vec<Vec<u8>> {
        if self.phase == SimPhase::Uploading {
            if opcode == Opcode::FirstData {
                let units = u16::from_le_bytes([
                    frame.payload.first().copied().unwrap_or(0),
                    frame.payload.get(1).copied().unwrap_or(0),
                ]);
                self.reads = usize::from(units) + 1;
            }
            if frame.payload.len() == 35 && frame.payload.iter().all(|&b| b == 0) {
                self.phase = SimPhase::Streaming;
                self.packets = 0;
                return vec![credit_frame(Opcode::SendDb, self.initial_credit)];
            }
            return Vec::new();
        }

        self.packets += 1;
        if self.drop_at == Some(self.packets) {
            self.drop_at = None;
            return vec![device_frame(Opcode::Error, &[frame.seq])];
        }
        if let Some((at, opcode)) = self.unexpected_at {
            if at == self.packets {
                self.unexpected_at = None;
                return vec![device_frame(opcode, &[])];
            }
        }

        let mut replies = Vec::new();
        if self.packets % self.credit_every == 0 {
            replies.extend(self.emit(credit_frame(Opcode::SendNext, self.credit)));
        }
        if self.overflow_at == Some(self.packets) {
            self.overflow_at = None;
            self.overflowed = true;
            replies.push(device_frame(Opcode::Overflow, &[]));
        }
        replies
    }

    /// Hold replies back while an overflow is being drained.
    fn emit(&mut self, frame: Vec<u8>) -> Vec<Vec<u8>> {
        if self.overflowed {
            self.deferred.push(frame);
            Vec::new()
        } else {
            vec![frame]
        }
    }

    fn next_result(&mut self) -> Vec<u8> {
        self.results.pop_front().unwrap_or_else(|| {
            let empty = ResultRecord { location_count: 0, min_mismatches: UNMAPPED as u8, positions: Vec::new() };
            (0..self.reads).flat_map(|_| empty.to_bytes(false)).collect()
        })
    }
}

/// Session over a scripted device, overflow settle disabled.
pub fn sim_session(device: SimDevice) -> Result<ProtocolSession<MockLink>> {
    ProtocolSession::establish(MockLink::with_device(device), HOST_MAC, DEVICE_MAC, Duration::ZERO)
}

/// In-memory database packed from FASTA text.
pub fn fasta_database(fasta: &str) -> Database {
    let mut packed = Vec::new();
    let index = pack_fasta(Cursor::new(fasta.as_bytes().to_vec()), &mut packed)
        .expect("fixture FASTA packs");
    Database::from_parts(packed, index).expect("fixture database is consistent")
}

/// Reads named `r0`, `r1`, ... with the given sequences.
pub fn reads(sequences: &[&str]) -> Vec<ReadRecord> {
    sequences
        .iter()
        .enumerate()
        .map(|(i, seq)| ReadRecord::from_sequence(format!("r{i}"), seq.as_bytes()))
        .collect()
}
