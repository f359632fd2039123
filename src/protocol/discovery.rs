//! Device discovery.

use super::{ControlChannel, Opcode, tolerate_hiccup};
use crate::transport::{CONTROL_FRAME_LEN, InboundFrame, Link, MacAddress};
use crate::{LinkError, Result};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// FPGA family reported in the identity reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceGeneration {
    Virtex5,
    Virtex6,
}

impl fmt::Display for DeviceGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceGeneration::Virtex5 => f.write_str("Virtex-5"),
            DeviceGeneration::Virtex6 => f.write_str("Virtex-6"),
        }
    }
}

/// What the device said about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub generation: DeviceGeneration,
    /// Parallel search units, already doubled from the reported half count.
    pub unit_count: u32,
}

impl DeviceIdentity {
    /// Decode an identity reply.
    ///
    /// The reply carries a little-endian half count right after the opcode.
    /// Anything but `info_v5`/`info_v6`, or a device with no units, is a
    /// discovery failure.
    pub fn from_reply(frame: &InboundFrame) -> Result<Self> {
        let opcode = frame.opcode_byte();
        let generation = match Opcode::from_byte(opcode) {
            Some(Opcode::InfoV5) => DeviceGeneration::Virtex5,
            Some(Opcode::InfoV6) => DeviceGeneration::Virtex6,
            _ => return Err(LinkError::DeviceNotFound { opcode }),
        };

        let unit_count = u32::from(frame.body_u16(0)) * 2;
        if unit_count == 0 {
            return Err(LinkError::DeviceNotFound { opcode });
        }

        Ok(Self { generation, unit_count })
    }
}

/// Immutable facts about the attached device, fixed at discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSession {
    pub peer: MacAddress,
    pub generation: DeviceGeneration,
    pub unit_count: u32,
    /// Half the discovery round trip. Informational only.
    pub half_latency: Duration,
}

impl DeviceSession {
    /// Reads uploaded per run.
    pub fn batch_capacity(&self) -> usize {
        self.unit_count as usize
    }
}

/// Ask the device who it is and wait for exactly one reply.
///
/// No retry and no timeout: a silent device blocks here forever.
pub fn discover<L: Link + ?Sized>(
    channel: &mut ControlChannel<'_, L>,
    peer: MacAddress,
) -> Result<DeviceSession> {
    let started = Instant::now();
    tolerate_hiccup(channel.send_control(Opcode::GetId))?;
    let reply = channel.link().receive(CONTROL_FRAME_LEN)?;
    let half_latency = started.elapsed() / 2;

    debug!(opcode = reply.opcode_byte(), len = reply.len(), "Identity reply");
    let identity = DeviceIdentity::from_reply(&reply)?;

    info!(
        generation = %identity.generation,
        units = identity.unit_count,
        half_latency_us = half_latency.as_micros() as u64,
        "Accelerator found"
    );

    Ok(DeviceSession {
        peer,
        generation: identity.generation,
        unit_count: identity.unit_count,
        half_latency,
    })
}
