//! Read upload framing.
//!
//! A batch is uploaded as a short stream of payload frames. The first frame
//! opens with a 4-byte batch header, then every read takes a 136-byte slot:
//!
//! ```text
//! header: [units-1: u16 LE] [positions 0x10|0x00] [double length 0x00]
//! slot:   [max mismatches] [0x00 report | 0x08 suppress] [0x08 active] [0x00]
//!         [132-byte lookup block]
//! ```
//!
//! Ten slots fit in a frame. A 35-byte all-zero `data` frame closes the
//! upload.

use super::{ControlChannel, Opcode, tolerate_hiccup};
use crate::Result;
use crate::reads::{LOOKUP_BLOCK_LEN, ReadRecord};
use crate::transport::Link;
use tracing::debug;

/// Slots per upload frame.
pub const READS_PER_FRAME: usize = 10;
/// Bytes per read slot.
pub const READ_SLOT_LEN: usize = 4 + LOOKUP_BLOCK_LEN;
/// Bytes of the batch header.
pub const BATCH_HEADER_LEN: usize = 4;
/// Length of the closing frame.
pub const UPLOAD_TERMINATOR_LEN: usize = 35;

const POSITIONS_REPORTED: u8 = 0x10;
const SLOT_SUPPRESS_POSITIONS: u8 = 0x08;
const SLOT_ACTIVE: u8 = 0x08;

/// One frame's worth of upload payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFrame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Build the frames that upload `reads`.
///
/// `mismatches` applies to reads without their own limit.
pub fn upload_frames(reads: &[ReadRecord], mismatches: u8, report_positions: bool) -> Vec<UploadFrame> {
    let mut frames = Vec::with_capacity(reads.len() / READS_PER_FRAME + 2);

    let units = reads.len().saturating_sub(1).min(u16::MAX as usize) as u16;
    let positions_flag = if report_positions { POSITIONS_REPORTED } else { 0x00 };
    let slot_flag = if report_positions { 0x00 } else { SLOT_SUPPRESS_POSITIONS };

    for (index, chunk) in reads.chunks(READS_PER_FRAME).enumerate() {
        let mut payload = Vec::with_capacity(BATCH_HEADER_LEN + chunk.len() * READ_SLOT_LEN);
        let opcode = if index == 0 {
            payload.extend_from_slice(&units.to_le_bytes());
            payload.push(positions_flag);
            payload.push(0x00);
            Opcode::FirstData
        } else {
            Opcode::Data
        };

        for read in chunk {
            payload.extend_from_slice(&[read.mismatches(mismatches), slot_flag, SLOT_ACTIVE, 0x00]);
            payload.extend_from_slice(&read.block.to_bytes());
        }
        frames.push(UploadFrame { opcode, payload });
    }

    frames.push(UploadFrame { opcode: Opcode::Data, payload: vec![0u8; UPLOAD_TERMINATOR_LEN] });
    frames
}

/// Upload a batch of reads.
pub fn upload_reads<L: Link + ?Sized>(
    channel: &mut ControlChannel<'_, L>,
    reads: &[ReadRecord],
    mismatches: u8,
    report_positions: bool,
) -> Result<()> {
    let frames = upload_frames(reads, mismatches, report_positions);
    debug!(reads = reads.len(), frames = frames.len(), "Uploading reads");
    for frame in &frames {
        tolerate_hiccup(channel.send_data(frame.opcode, &frame.payload))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MAX_PAYLOAD;

    fn reads(n: usize) -> Vec<ReadRecord> {
        (0..n).map(|i| ReadRecord::from_sequence(format!("r{i}"), b"ACGTACGT\n")).collect()
    }

    #[test]
    fn eleven_reads_need_two_frames_and_terminator() {
        let frames = upload_frames(&reads(11), 2, true);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, Opcode::FirstData);
        assert_eq!(frames[0].payload.len(), BATCH_HEADER_LEN + 10 * READ_SLOT_LEN);
        assert_eq!(frames[1].opcode, Opcode::Data);
        assert_eq!(frames[1].payload.len(), READ_SLOT_LEN);
        assert_eq!(frames[2].payload, vec![0u8; 35]);
        assert!(frames.iter().all(|f| f.payload.len() <= MAX_PAYLOAD));
    }

    #[test]
    fn header_and_slot_flags() {
        let mut batch = reads(3);
        batch[1].mismatch_override = Some(5);

        let frames = upload_frames(&batch, 1, true);
        let payload = &frames[0].payload;
        assert_eq!(&payload[..4], &[2, 0, 0x10, 0x00]);
        assert_eq!(&payload[4..8], &[1, 0x00, 0x08, 0x00]);
        let second = 4 + READ_SLOT_LEN;
        assert_eq!(&payload[second..second + 4], &[5, 0x00, 0x08, 0x00]);
        assert_eq!(&payload[8..8 + LOOKUP_BLOCK_LEN], &batch[0].block.to_bytes());

        let quiet = upload_frames(&batch, 1, false);
        assert_eq!(quiet[0].payload[2], 0x00);
        assert_eq!(quiet[0].payload[5], 0x08);
    }

    #[test]
    fn overrides_land_in_their_own_slot_past_the_first_frame() {
        let mut batch = reads(12);
        batch[11].mismatch_override = Some(4);
        let frames = upload_frames(&batch, 0, true);
        let slot = READ_SLOT_LEN;
        assert_eq!(frames[1].payload[0], 0);
        assert_eq!(frames[1].payload[slot], 4);
    }
}
