//! Outbound frame construction and sequence numbering.

use super::Opcode;
use crate::transport::{
    CONTROL_FRAME_LEN, LINK_HEADER_LEN, Link, MAX_PAYLOAD, MacAddress, OPCODE_OFFSET,
    PAYLOAD_OFFSET, PROTOCOL_TAG, SEQ_OFFSET,
};
use crate::{ErrorClass, LinkError, Result};
use tracing::{trace, warn};

/// 8-bit frame counter.
///
/// Starts at 1, advances on every transmitted frame and wraps silently. It
/// only correlates frames in logs and in device `error` reports; nothing is
/// ever retransmitted based on it.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    next: u8,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Id the next frame will carry.
    pub fn peek(&self) -> u8 {
        self.next
    }

    /// Take the id for a frame about to be sent.
    pub fn advance(&mut self) -> u8 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }

    /// Restart at 1, done after every `finished_iteration`.
    pub fn reset(&mut self) {
        self.next = 1;
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Link header shared by every outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTemplate {
    header: [u8; LINK_HEADER_LEN],
}

impl FrameTemplate {
    pub fn new(local: MacAddress, peer: MacAddress) -> Self {
        let mut header = [0u8; LINK_HEADER_LEN];
        header[0..6].copy_from_slice(&peer.octets());
        header[6..12].copy_from_slice(&local.octets());
        header[12..14].copy_from_slice(&PROTOCOL_TAG.to_be_bytes());
        Self { header }
    }

    pub fn header(&self) -> &[u8; LINK_HEADER_LEN] {
        &self.header
    }

    /// Zero-padded control frame.
    pub fn control(&self, opcode: Opcode, seq: u8) -> [u8; CONTROL_FRAME_LEN] {
        let mut frame = [0u8; CONTROL_FRAME_LEN];
        frame[..LINK_HEADER_LEN].copy_from_slice(&self.header);
        frame[OPCODE_OFFSET] = opcode.as_byte();
        frame[SEQ_OFFSET] = seq;
        frame
    }

    /// Write a payload frame into `buf`, replacing its contents.
    ///
    /// Payloads longer than [`MAX_PAYLOAD`] are truncated.
    pub fn data_into(&self, buf: &mut Vec<u8>, opcode: Opcode, seq: u8, payload: &[u8]) {
        let payload = &payload[..payload.len().min(MAX_PAYLOAD)];
        buf.clear();
        buf.extend_from_slice(&self.header);
        buf.push(opcode.as_byte());
        buf.push(seq);
        buf.extend_from_slice(payload);
    }

    pub fn data(&self, opcode: Opcode, seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAYLOAD_OFFSET + payload.len());
        self.data_into(&mut buf, opcode, seq, payload);
        buf
    }
}

/// Send side of a session: link, header and sequence counter together.
///
/// Exactly one `ControlChannel` exists at a time because it borrows the
/// session's counter mutably; during a run it lives on the producer thread.
pub struct ControlChannel<'a, L: ?Sized> {
    link: &'a L,
    template: &'a FrameTemplate,
    seq: &'a mut SequenceCounter,
    scratch: Vec<u8>,
}

impl<'a, L: Link + ?Sized> ControlChannel<'a, L> {
    pub fn new(link: &'a L, template: &'a FrameTemplate, seq: &'a mut SequenceCounter) -> Self {
        Self { link, template, seq, scratch: Vec::with_capacity(PAYLOAD_OFFSET + MAX_PAYLOAD) }
    }

    /// Send a padded control frame, returning the sequence id it carried.
    pub fn send_control(&mut self, opcode: Opcode) -> Result<u8> {
        let seq = self.seq.advance();
        let frame = self.template.control(opcode, seq);
        trace!(%opcode, seq, "Sending control frame");
        self.link.send(&frame)?;
        Ok(seq)
    }

    /// Send a payload frame, returning the sequence id it carried.
    pub fn send_data(&mut self, opcode: Opcode, payload: &[u8]) -> Result<u8> {
        let seq = self.seq.advance();
        self.template.data_into(&mut self.scratch, opcode, seq, payload);
        trace!(%opcode, seq, len = payload.len(), "Sending data frame");
        self.link.send(&self.scratch)?;
        Ok(seq)
    }

    /// The underlying link, for receiving on the sending thread.
    pub fn link(&self) -> &'a L {
        self.link
    }

    pub fn next_seq(&self) -> u8 {
        self.seq.peek()
    }
}

/// Downgrade a transport hiccup to a warning.
///
/// A failed send is never retried; the device reports the gap itself with an
/// `error` frame if it matters. Every other error is passed through.
pub fn tolerate_hiccup(result: Result<u8>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(error) if error.class() == ErrorClass::TransportHiccup => {
            match &error {
                LinkError::Send { seq, source } => {
                    warn!(seq, error = %source, "Frame not sent, continuing")
                }
                other => warn!(error = %other, "Transport hiccup, continuing"),
            }
            Ok(())
        }
        Err(error) => Err(error),
    }
}
