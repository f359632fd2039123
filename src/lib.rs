//! Host driver for a raw-Ethernet DNA sequence search accelerator.
//!
//! The accelerator holds a batch of short query reads in parallel search
//! units and compares them against a reference database that the host
//! streams to it over a point-to-point Ethernet cable. This crate covers
//! the host side of that exchange:
//!
//! - **Transport**: raw link-layer frames with a fixed 16-byte header
//!   ([`transport`]).
//! - **Protocol**: opcodes, framing, discovery and read upload ([`protocol`]).
//! - **Engine**: credit-windowed streaming with the overflow drain protocol,
//!   run by a producer and a consumer thread ([`engine`]).
//! - **Results**: result drains, per-read aggregation and output files
//!   ([`results`]).
//! - **Inputs**: read encoding ([`reads`]) and the packed database
//!   ([`database`]).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use fpga_align::config::{LinkConfig, SearchOptions};
//! use fpga_align::database::Database;
//! use fpga_align::engine::ProtocolSession;
//! use fpga_align::reads::ReadSource;
//! use fpga_align::results::{FileSink, OutputPaths};
//! use fpga_align::search::run_search;
//! use fpga_align::transport::RawLink;
//!
//! fn main() -> fpga_align::Result<()> {
//!     let config = LinkConfig::default();
//!     let link = RawLink::open(&config.interface, config.host, config.device)?;
//!     let local = link.local();
//!     let mut session =
//!         ProtocolSession::establish(link, local, config.device, config.overflow_settle())?;
//!
//!     let database = Database::open("hg19.bindb", "hg19.dbinfo")?;
//!     let mut reads = ReadSource::open("reads.fa")?;
//!     let options = SearchOptions::default();
//!     let mut sink = FileSink::create(&OutputPaths::from_base("out", false), false, false)?;
//!
//!     let summary = run_search(&mut session, &database, &mut reads, &mut sink, &options)?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

// Wire level
pub mod protocol;
pub mod transport;

// Streaming and results
pub mod engine;
pub mod results;

// Inputs and orchestration
pub mod database;
pub mod reads;
pub mod search;

// Core exports
pub use error::*;

pub use config::{LinkConfig, SearchOptions};
pub use engine::{ProtocolSession, SegmentReport, StreamPhase};
pub use protocol::{DeviceGeneration, DeviceSession, Opcode};
pub use search::{SearchSummary, run_search};
pub use transport::{Link, MacAddress};
