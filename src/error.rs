//! Error types for the accelerator link.
//!
//! This module provides the error handling for the whole host driver. All
//! errors implement the `std::error::Error` trait and carry enough context
//! to tell an operator what went wrong on the wire.
//!
//! ## Error Classes
//!
//! Every error belongs to exactly one [`ErrorClass`]:
//!
//! - **Fatal startup**: missing privileges, unknown interface, no device
//!   answered discovery. The process must stop.
//! - **Transport hiccup**: a single frame could not be handed to the kernel.
//!   Logged and never retried, the link has no retransmission layer.
//! - **Run fatal**: the device reported a dropped frame or sent an opcode
//!   that makes no sense in the current context. The in-flight run is
//!   abandoned and the search moves on to the next batch of reads.
//! - **Input**: local files or configuration are unreadable or malformed.
//!
//! Device overflow is not an error at all; it is handled by the streaming
//! engine and only shows up as a counter.
//!
//! ```rust
//! use fpga_align::{ErrorClass, LinkError};
//!
//! let error = LinkError::FrameDropped { seq: 17 };
//! assert_eq!(error.class(), ErrorClass::RunFatal);
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for link operations.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

/// Classification of an error according to its effect on the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Abort the process, nothing is retried.
    FatalStartup,
    /// Log and carry on.
    TransportHiccup,
    /// Abandon the current run, continue with the next one.
    RunFatal,
    /// Bad local input (files, configuration).
    Input,
}

/// Main error type for accelerator operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    #[error("{operation} requires elevated privileges (raw sockets)")]
    Privilege { operation: String },

    #[error("Network interface '{name}' is not available")]
    Interface {
        name: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Socket setup failed: {operation}")]
    Socket {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sending frame {seq} failed")]
    Send {
        seq: u8,
        #[source]
        source: std::io::Error,
    },

    #[error("Receiving frame failed")]
    Receive {
        #[source]
        source: std::io::Error,
    },

    #[error("No device answered discovery (reply opcode {opcode:#04x})")]
    DeviceNotFound { opcode: u8 },

    #[error("Device reported frame {seq} as lost")]
    FrameDropped { seq: u8 },

    #[error("Protocol violation in {context}: unexpected opcode {opcode:#04x}")]
    ProtocolViolation { context: String, opcode: u8 },

    #[error("Device sent malformed results: {details}")]
    MalformedResults { details: String },

    #[error("File error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("{thread} thread panicked")]
    WorkerPanicked { thread: String },

    #[error("Could not start {thread} thread")]
    Spawn {
        thread: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{feature} is only available on {required_platform}")]
    UnsupportedPlatform { feature: String, required_platform: String },
}

impl LinkError {
    /// Returns the class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            LinkError::Privilege { .. } => ErrorClass::FatalStartup,
            LinkError::Interface { .. } => ErrorClass::FatalStartup,
            LinkError::Socket { .. } => ErrorClass::FatalStartup,
            LinkError::DeviceNotFound { .. } => ErrorClass::FatalStartup,
            LinkError::UnsupportedPlatform { .. } => ErrorClass::FatalStartup,
            LinkError::Send { .. } => ErrorClass::TransportHiccup,
            LinkError::Receive { .. } => ErrorClass::RunFatal,
            LinkError::FrameDropped { .. } => ErrorClass::RunFatal,
            LinkError::ProtocolViolation { .. } => ErrorClass::RunFatal,
            LinkError::MalformedResults { .. } => ErrorClass::RunFatal,
            LinkError::WorkerPanicked { .. } => ErrorClass::RunFatal,
            LinkError::Spawn { .. } => ErrorClass::RunFatal,
            LinkError::File { .. } => ErrorClass::Input,
            LinkError::Parse { .. } => ErrorClass::Input,
            LinkError::Config { .. } => ErrorClass::Input,
        }
    }

    /// Returns whether the current run has to be abandoned.
    pub fn is_run_fatal(&self) -> bool {
        self.class() == ErrorClass::RunFatal
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            LinkError::Privilege { .. } => vec![
                "Run as root",
                "Or grant CAP_NET_RAW to the binary (setcap cap_net_raw+ep)",
            ],
            LinkError::Interface { .. } => vec![
                "Check the interface name in the configuration file",
                "Verify the interface is up (ip link show)",
            ],
            LinkError::Socket { .. } => vec![
                "Check that AF_PACKET sockets are supported by the kernel",
                "Verify no other process holds the interface exclusively",
            ],
            LinkError::DeviceNotFound { .. } => vec![
                "Check the cable between host and accelerator",
                "Verify the device MAC address in the configuration file",
                "Power-cycle the accelerator board",
            ],
            LinkError::UnsupportedPlatform { .. } => vec![
                "Run the host driver on Linux",
                "Use the mock link for tests on other platforms",
            ],
            LinkError::Send { .. } => vec![
                "Check interface transmit queue length",
                "Reduce competing traffic on the link",
            ],
            LinkError::Receive { .. } => vec![
                "Check the interface is still up",
                "Restart the search",
            ],
            LinkError::FrameDropped { .. } => vec![
                "Restart the search, the device cannot recover a lost frame",
                "Use a direct cable without switches",
                "Check for link errors (ethtool -S)",
            ],
            LinkError::ProtocolViolation { .. } => vec![
                "Reset the accelerator",
                "Verify host and bitstream versions match",
            ],
            LinkError::MalformedResults { .. } => vec![
                "Verify the unit count reported at discovery",
                "Reset the accelerator before the next search",
            ],
            LinkError::WorkerPanicked { .. } => vec!["Restart the search", "Report the panic message"],
            LinkError::Spawn { .. } => {
                vec!["Check process and memory limits (ulimit -u)", "Restart the search"]
            }
            LinkError::File { .. } => vec![
                "Check file exists and is readable",
                "Check file permissions",
                "Ensure sufficient disk space",
            ],
            LinkError::Parse { .. } => vec![
                "Recreate the binary database from the FASTA file",
                "Verify the query file is in FASTA format",
            ],
            LinkError::Config { .. } => vec![
                "Check the configuration file syntax",
                "MAC addresses use the form aa:bb:cc:dd:ee:ff",
            ],
        }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LinkError::File { path: path.into(), source }
    }

    /// Helper constructor for protocol violations.
    pub fn protocol_violation(context: impl Into<String>, opcode: u8) -> Self {
        LinkError::ProtocolViolation { context: context.into(), opcode }
    }

    /// Helper constructor for malformed result dumps.
    pub fn malformed_results(details: impl Into<String>) -> Self {
        LinkError::MalformedResults { details: details.into() }
    }

    /// Helper constructor for parse errors.
    pub fn parse(context: impl Into<String>, details: impl Into<String>) -> Self {
        LinkError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for socket setup errors.
    pub fn socket(operation: impl Into<String>, source: std::io::Error) -> Self {
        LinkError::Socket { operation: operation.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        LinkError::Config { reason: reason.into() }
    }

    /// Helper constructor for unsupported platform errors.
    pub fn unsupported_platform(
        feature: impl Into<String>,
        required_platform: impl Into<String>,
    ) -> Self {
        LinkError::UnsupportedPlatform {
            feature: feature.into(),
            required_platform: required_platform.into(),
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::File { path: PathBuf::from("<unknown>"), source: err }
    }
}
