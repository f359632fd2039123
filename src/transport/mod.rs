//! Raw link-layer transport to the accelerator.
//!
//! The accelerator sits on a point-to-point Ethernet cable and speaks raw
//! frames, no IP. Outbound frames carry the full 14-byte link header
//! followed by opcode, sequence id and payload:
//!
//! ```text
//!  0..6   destination (device) address
//!  6..12  source (host) address
//! 12..14  protocol tag 0x0801
//! 14      opcode
//! 15      sequence id
//! 16..    payload (0..=1498 bytes)
//! ```
//!
//! The receive path is bound to the device address and protocol tag and
//! delivers frames with the link header already stripped, so an
//! [`InboundFrame`] starts with the opcode byte.
//!
//! Sending is best effort: failures are reported to the caller and never
//! retried here. Receiving blocks until a frame arrives; there is no
//! timeout anywhere on this link.

#[cfg(target_os = "linux")]
mod raw;

#[cfg(target_os = "linux")]
pub use raw::RawLink;

use crate::{LinkError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of the link header (two addresses plus protocol tag).
pub const LINK_HEADER_LEN: usize = 14;
/// Offset of the opcode byte in an outbound frame.
pub const OPCODE_OFFSET: usize = 14;
/// Offset of the sequence id byte in an outbound frame.
pub const SEQ_OFFSET: usize = 15;
/// Offset of the first payload byte in an outbound frame.
pub const PAYLOAD_OFFSET: usize = 16;
/// Largest payload a single frame carries.
pub const MAX_PAYLOAD: usize = 1498;
/// Largest frame on the wire (without FCS).
pub const MAX_FRAME_LEN: usize = PAYLOAD_OFFSET + MAX_PAYLOAD;
/// Control frames are padded to this size.
pub const CONTROL_FRAME_LEN: usize = 60;
/// Protocol tag used by the accelerator.
pub const PROTOCOL_TAG: u16 = 0x0801;

/// A link to the accelerator.
///
/// Implementations must allow `send` and `receive` to be called
/// concurrently from two different threads: during a run the producer
/// thread only sends and the consumer thread only receives.
pub trait Link: Send + Sync {
    /// Hand one complete frame to the link.
    ///
    /// Non-blocking and best effort. A transient "would block" is reported
    /// as an error like any other failure.
    fn send(&self, frame: &[u8]) -> Result<()>;

    /// Block until a frame of at most `max_len` bytes arrives.
    fn receive(&self, max_len: usize) -> Result<InboundFrame>;
}

impl<L: Link + ?Sized> Link for &L {
    fn send(&self, frame: &[u8]) -> Result<()> {
        (**self).send(frame)
    }

    fn receive(&self, max_len: usize) -> Result<InboundFrame> {
        (**self).receive(max_len)
    }
}

// Non-Linux stub implementation
#[cfg(not(target_os = "linux"))]
pub struct RawLink {
    _private: (),
}

#[cfg(not(target_os = "linux"))]
impl RawLink {
    /// Raw AF_PACKET sockets only exist on Linux; this always fails.
    pub fn open(_interface: &str, _local: Option<MacAddress>, _peer: MacAddress) -> Result<Self> {
        Err(LinkError::unsupported_platform("Raw Ethernet link", "Linux"))
    }

    pub fn local(&self) -> MacAddress {
        MacAddress::default()
    }
}

#[cfg(not(target_os = "linux"))]
impl Link for RawLink {
    fn send(&self, _frame: &[u8]) -> Result<()> {
        Err(LinkError::unsupported_platform("Raw Ethernet link", "Linux"))
    }

    fn receive(&self, _max_len: usize) -> Result<InboundFrame> {
        Err(LinkError::unsupported_platform("Raw Ethernet link", "Linux"))
    }
}

/// A frame received from the device, link header stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    bytes: Vec<u8>,
}

impl InboundFrame {
    /// Wrap received bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Raw opcode byte, `0` for an empty frame.
    pub fn opcode_byte(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0)
    }

    /// Bytes following the opcode.
    pub fn body(&self) -> &[u8] {
        self.bytes.get(1..).unwrap_or(&[])
    }

    /// Little-endian u16 at `offset` within the body, zero if the frame is short.
    pub fn body_u16(&self, offset: usize) -> u16 {
        match self.body().get(offset..offset + 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    /// Full frame bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Hardware (MAC) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3], o[4], o[5])
    }
}

impl FromStr for MacAddress {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);

        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| LinkError::config(format!("MAC address '{}' is too short", s)))?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| {
                LinkError::config(format!("MAC address '{}' has invalid octet '{}'", s, part))
            })?;
        }

        if parts.next().is_some() {
            return Err(LinkError::config(format!("MAC address '{}' is too long", s)));
        }

        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn frame_layout_constants() {
        assert_eq!(LINK_HEADER_LEN, 14);
        assert_eq!(OPCODE_OFFSET, LINK_HEADER_LEN);
        assert_eq!(SEQ_OFFSET, OPCODE_OFFSET + 1);
        assert_eq!(MAX_FRAME_LEN, 1514);
    }

    #[test]
    fn inbound_frame_accessors() {
        let frame = InboundFrame::new(vec![0x13, 0xFF, 0xFF, 0x00]);
        assert_eq!(frame.opcode_byte(), 0x13);
        assert_eq!(frame.body(), &[0xFF, 0xFF, 0x00]);
        assert_eq!(frame.body_u16(0), 0xFFFF);
        assert_eq!(frame.body_u16(2), 0, "short read yields zero");

        let empty = InboundFrame::new(Vec::new());
        assert_eq!(empty.opcode_byte(), 0);
        assert!(empty.body().is_empty());
    }

    #[test]
    fn mac_parse_rejects_garbage() {
        assert!("00:0a:35:02:2a".parse::<MacAddress>().is_err());
        assert!("00:0a:35:02:2a:42:11".parse::<MacAddress>().is_err());
        assert!("00:0a:35:02:2a:zz".parse::<MacAddress>().is_err());
        assert_eq!(
            "00-0A-35-02-2A-42".parse::<MacAddress>().unwrap(),
            MacAddress([0x00, 0x0a, 0x35, 0x02, 0x2a, 0x42])
        );
    }

    proptest! {
        #[test]
        fn mac_display_parses_back(octets in any::<[u8; 6]>()) {
            let mac = MacAddress(octets);
            let parsed: MacAddress = mac.to_string().parse().unwrap();
            prop_assert_eq!(parsed, mac);
        }
    }
}
