//! Consumer thread: dispatches every control frame the device sends while a
//! segment is streamed.

use super::state::{FailOnPanic, SharedStream, StreamPhase};
use crate::protocol::Opcode;
use crate::transport::{CONTROL_FRAME_LEN, Link};
use crate::{LinkError, Result};
use tracing::{debug, error, trace};

/// Receive and dispatch control frames until `finished_search` or failure.
///
/// Returns `Ok` when the run completed or when the producer abandoned it;
/// in the latter case the producer carries the error.
pub(crate) fn run<L: Link + ?Sized>(link: &L, shared: &SharedStream) -> Result<()> {
    let _guard = FailOnPanic(shared);

    loop {
        let frame = match link.receive(CONTROL_FRAME_LEN) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Control receive failed, abandoning run");
                shared.fail();
                return Err(e);
            }
        };

        let opcode = frame.opcode_byte();
        match Opcode::from_byte(opcode) {
            Some(Opcode::SendNext) => {
                let credit = frame.body_u16(0);
                trace!(credit, "Credit");
                shared.grant_credit(credit);
            }
            Some(Opcode::Overflow) => {
                debug!("Device overflow signalled");
                if shared.raise_overflow_and_wait() == StreamPhase::Failed {
                    return Ok(());
                }
            }
            Some(Opcode::FinishedSearch) => {
                debug!("Device finished search");
                shared.complete();
                return Ok(());
            }
            Some(Opcode::Error) => {
                let seq = frame.body().first().copied().unwrap_or(0);
                error!(seq, "Device lost a frame, run cannot continue");
                shared.fail();
                return Err(LinkError::FrameDropped { seq });
            }
            _ => {
                error!(opcode, "Unexpected frame while streaming");
                shared.fail();
                return Err(LinkError::protocol_violation("stream control", opcode));
            }
        }

        if shared.phase() == StreamPhase::Failed {
            return Ok(());
        }
    }
}
