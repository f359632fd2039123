//! Opcode vocabulary of the accelerator protocol.

use std::fmt;

/// Which side sends an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
    /// `data` frames flow both ways: database upload and result drain.
    Both,
}

/// One-byte message tag at offset 14 of every frame.
///
/// `finished_iteration` and `reset` share the byte `0x19`; the device
/// treats both the same way. Decoding `0x19` yields [`Opcode::Reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    FirstData,
    Data,
    LastData,
    SendNext,
    SendDb,
    GetData,
    FinishedSearch,
    FinishedSending,
    NextSegment,
    FinishedIteration,
    Reset,
    GetId,
    InfoV5,
    InfoV6,
    Error,
    Overflow,
    OverflowReady,
}

impl Opcode {
    /// Wire value.
    pub const fn as_byte(self) -> u8 {
        match self {
            Opcode::FirstData => 0x10,
            Opcode::Data => 0x11,
            Opcode::LastData => 0x12,
            Opcode::SendNext => 0x13,
            Opcode::SendDb => 0x14,
            Opcode::GetData => 0x15,
            Opcode::FinishedSearch => 0x16,
            Opcode::FinishedSending => 0x17,
            Opcode::NextSegment => 0x18,
            Opcode::FinishedIteration => 0x19,
            Opcode::Reset => 0x19,
            Opcode::GetId => 0x20,
            Opcode::InfoV5 => 0x21,
            Opcode::InfoV6 => 0x22,
            Opcode::Error => 0x24,
            Opcode::Overflow => 0x30,
            Opcode::OverflowReady => 0x31,
        }
    }

    /// Decode a wire value, `None` for bytes outside the vocabulary.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x10 => Opcode::FirstData,
            0x11 => Opcode::Data,
            0x12 => Opcode::LastData,
            0x13 => Opcode::SendNext,
            0x14 => Opcode::SendDb,
            0x15 => Opcode::GetData,
            0x16 => Opcode::FinishedSearch,
            0x17 => Opcode::FinishedSending,
            0x18 => Opcode::NextSegment,
            0x19 => Opcode::Reset,
            0x20 => Opcode::GetId,
            0x21 => Opcode::InfoV5,
            0x22 => Opcode::InfoV6,
            0x24 => Opcode::Error,
            0x30 => Opcode::Overflow,
            0x31 => Opcode::OverflowReady,
            _ => return None,
        })
    }

    pub const fn direction(self) -> Direction {
        match self {
            Opcode::Data => Direction::Both,
            Opcode::SendNext
            | Opcode::SendDb
            | Opcode::FinishedSearch
            | Opcode::FinishedSending
            | Opcode::InfoV5
            | Opcode::InfoV6
            | Opcode::Error
            | Opcode::Overflow => Direction::DeviceToHost,
            _ => Direction::HostToDevice,
        }
    }

    /// Lowercase protocol name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::FirstData => "first_data",
            Opcode::Data => "data",
            Opcode::LastData => "last_data",
            Opcode::SendNext => "send_next",
            Opcode::SendDb => "send_db",
            Opcode::GetData => "get_data",
            Opcode::FinishedSearch => "finished_search",
            Opcode::FinishedSending => "finished_sending",
            Opcode::NextSegment => "next_segment",
            Opcode::FinishedIteration => "finished_iteration",
            Opcode::Reset => "reset",
            Opcode::GetId => "get_id",
            Opcode::InfoV5 => "info_v5",
            Opcode::InfoV6 => "info_v6",
            Opcode::Error => "error",
            Opcode::Overflow => "overflow",
            Opcode::OverflowReady => "overflow_ready",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_byte())
    }
}
