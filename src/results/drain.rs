//! Result drain: `get_data`, then data frames until `finished_sending`.

use crate::protocol::{ControlChannel, Opcode, tolerate_hiccup};
use crate::transport::{Link, MAX_FRAME_LEN};
use crate::{LinkError, Result};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Result memory per search unit.
pub const RESULT_BYTES_PER_UNIT: usize = 16_000;

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DrainReport {
    pub frames: u32,
    pub bytes: usize,
    /// Bytes beyond the result buffer capacity that were dropped.
    pub discarded: usize,
    pub elapsed: Duration,
    /// Credit advertised by a `send_next` that arrived while waiting for
    /// results. The streaming engine hands it back to the window.
    pub late_credit: Option<u16>,
}

impl DrainReport {
    /// Receive bandwidth in Mbit/s. Informational only.
    pub fn bandwidth_mbit(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / secs / (1024.0 * 1024.0)
    }
}

/// Ask the device for its results and collect them into one buffer.
///
/// A `send_next` that arrives before the first `data` frame is kept for the
/// window, an `error` frame means the device lost a frame. The first data
/// frame's body starts with a status byte that is not part of the results.
/// After that, every frame must be `data` or `finished_sending`.
pub fn drain_results<L: Link + ?Sized>(
    channel: &mut ControlChannel<'_, L>,
    capacity: usize,
) -> Result<(Vec<u8>, DrainReport)> {
    let started = Instant::now();
    let mut report = DrainReport::default();
    let mut buffer = Vec::with_capacity(capacity.min(1 << 20));

    tolerate_hiccup(channel.send_control(Opcode::GetData))?;
    let link = channel.link();

    let first = loop {
        let frame = link.receive(MAX_FRAME_LEN)?;
        match Opcode::from_byte(frame.opcode_byte()) {
            Some(Opcode::Data) => break frame,
            Some(Opcode::FinishedSending) => {
                report.elapsed = started.elapsed();
                return Ok((buffer, report));
            }
            Some(Opcode::SendNext) => {
                let credit = frame.body_u16(0);
                debug!(credit, "Credit arrived during drain, keeping it");
                report.late_credit = Some(credit);
            }
            Some(Opcode::Error) => {
                let seq = frame.body().first().copied().unwrap_or(0);
                return Err(LinkError::FrameDropped { seq });
            }
            _ => return Err(LinkError::protocol_violation("result request", frame.opcode_byte())),
        }
    };

    report.frames = 1;
    append(&mut buffer, first.body().get(1..).unwrap_or(&[]), capacity, &mut report);

    loop {
        let frame = link.receive(MAX_FRAME_LEN)?;
        match Opcode::from_byte(frame.opcode_byte()) {
            Some(Opcode::Data) => {
                report.frames += 1;
                trace!(frame = report.frames, len = frame.len(), "Result frame");
                append(&mut buffer, frame.body(), capacity, &mut report);
            }
            Some(Opcode::FinishedSending) => break,
            _ => return Err(LinkError::protocol_violation("result drain", frame.opcode_byte())),
        }
    }

    report.bytes = buffer.len();
    report.elapsed = started.elapsed();
    if report.discarded > 0 {
        warn!(
            capacity,
            discarded = report.discarded,
            "Result buffer full, excess results dropped"
        );
    }
    debug!(
        frames = report.frames,
        bytes = report.bytes,
        mbit_s = report.bandwidth_mbit(),
        "Results drained"
    );
    Ok((buffer, report))
}

fn append(buffer: &mut Vec<u8>, body: &[u8], capacity: usize, report: &mut DrainReport) {
    let room = capacity.saturating_sub(buffer.len());
    let kept = body.len().min(room);
    buffer.extend_from_slice(&body[..kept]);
    report.discarded += body.len() - kept;
}
