//! Control protocol spoken with the accelerator.
//!
//! Every message is one frame tagged with an [`Opcode`] and an 8-bit
//! sequence id. The host never retransmits; the only loss detection is the
//! device's own `error` frame naming the id it missed.
//!
//! ## Session start
//!
//! 1. `reset` clears whatever state a previous host left behind.
//! 2. `get_id` is answered by `info_v5` or `info_v6` carrying half the
//!    unit count ([`discover`]).
//!
//! ## One run
//!
//! Reads are uploaded ([`upload_reads`]), the device answers `send_db`, the
//! database is streamed one sequence at a time (see [`crate::engine`]), and
//! the run ends with `finished_iteration`, after which sequence ids start
//! again at 1.

mod discovery;
mod frame;
mod opcode;
pub mod upload;

pub use discovery::{DeviceGeneration, DeviceIdentity, DeviceSession, discover};
pub use frame::{ControlChannel, FrameTemplate, SequenceCounter, tolerate_hiccup};
pub use opcode::{Direction, Opcode};
pub use upload::{UploadFrame, upload_frames, upload_reads};
