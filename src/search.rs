//! Search orchestration across read batches and database sequences.
//!
//! One run per batch: upload the reads, stream every database sequence and
//! drain its results, summarise each read, then `finished_iteration`. A
//! run-fatal error abandons the batch but not the search.

use crate::config::SearchOptions;
use crate::database::Database;
use crate::engine::ProtocolSession;
use crate::reads::{ReadBatch, ReadSource};
use crate::results::{BestMatchTable, ResultCollector, ResultSink, UNMAPPED};
use crate::transport::Link;
use crate::Result;
use std::fmt;
use std::io::BufRead;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// A batch that had to be abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRun {
    pub batch: usize,
    pub first_read: usize,
    pub reads: usize,
    pub error: String,
}

/// Wall time per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseTimings {
    pub upload: Duration,
    pub stream: Duration,
    pub summarise: Duration,
}

/// Totals over a whole search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchSummary {
    pub batches: usize,
    pub reads: usize,
    pub mapped: usize,
    pub positions: u64,
    pub segments: usize,
    pub overflows: u64,
    pub failed_runs: Vec<FailedRun>,
    pub timings: PhaseTimings,
    tx_bandwidth_sum: f64,
    rx_bandwidth_sum: f64,
    rx_samples: u32,
}

impl SearchSummary {
    /// Average transmit bandwidth over all segments, Mbit/s.
    pub fn tx_bandwidth(&self) -> f64 {
        if self.segments == 0 { 0.0 } else { self.tx_bandwidth_sum / self.segments as f64 }
    }

    /// Average receive bandwidth over all drains, Mbit/s.
    pub fn rx_bandwidth(&self) -> f64 {
        if self.rx_samples == 0 { 0.0 } else { self.rx_bandwidth_sum / f64::from(self.rx_samples) }
    }
}

impl fmt::Display for SearchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "reads:        {}", self.reads)?;
        writeln!(f, "mapped:       {}", self.mapped)?;
        writeln!(f, "positions:    {}", self.positions)?;
        writeln!(f, "overflows:    {}", self.overflows)?;
        writeln!(f, "failed runs:  {}", self.failed_runs.len())?;
        writeln!(f, "upload:       {:.3} s", self.timings.upload.as_secs_f64())?;
        writeln!(f, "stream:       {:.3} s", self.timings.stream.as_secs_f64())?;
        writeln!(f, "TX bandwidth: {:.1} Mbit/s", self.tx_bandwidth())?;
        write!(f, "RX bandwidth: {:.1} Mbit/s", self.rx_bandwidth())
    }
}

/// Search every read in `reads` against `database`.
///
/// Returns an error only for failures outside a run (bad input files, a
/// sink that cannot be written); run-fatal errors are recorded in the
/// summary.
pub fn run_search<L: Link, R: BufRead>(
    session: &mut ProtocolSession<L>,
    database: &Database,
    reads: &mut ReadSource<R>,
    sink: &mut (dyn ResultSink + Send),
    options: &SearchOptions,
) -> Result<SearchSummary> {
    let mut summary = SearchSummary::default();
    let capacity = session.device().batch_capacity();
    let overflows_before = session.overflows();

    while let Some(batch) = reads.next_batch(capacity)? {
        let index = summary.batches;
        summary.batches += 1;
        summary.reads += batch.len();
        info!(batch = index, reads = batch.len(), first = batch.first_index, "Starting run");

        match run_batch(session, database, &batch, sink, options, &mut summary) {
            Ok(table) => {
                let started = Instant::now();
                summarise(&batch, &table, sink, &mut summary)?;
                summary.timings.summarise += started.elapsed();
            }
            Err(e) if e.is_run_fatal() => {
                error!(batch = index, error = %e, "Run abandoned");
                summary.failed_runs.push(FailedRun {
                    batch: index,
                    first_read: batch.first_index,
                    reads: batch.len(),
                    error: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }

        session.finish_iteration()?;
        if !options.iteration_pause.is_zero() {
            thread::sleep(options.iteration_pause);
        }

        if batch.len() < capacity {
            break;
        }
    }

    sink.flush()?;
    summary.overflows = session.overflows() - overflows_before;
    info!(
        reads = summary.reads,
        mapped = summary.mapped,
        positions = summary.positions,
        overflows = summary.overflows,
        failed = summary.failed_runs.len(),
        "Search finished"
    );
    Ok(summary)
}

fn run_batch<L: Link>(
    session: &mut ProtocolSession<L>,
    database: &Database,
    batch: &ReadBatch,
    sink: &mut (dyn ResultSink + Send),
    options: &SearchOptions,
    summary: &mut SearchSummary,
) -> Result<BestMatchTable> {
    let started = Instant::now();
    session.upload_reads(&batch.reads, options.mismatches, options.report_positions)?;
    summary.timings.upload += started.elapsed();

    let started = Instant::now();
    let units = session.device().unit_count;
    let mut table = BestMatchTable::new(batch.len());
    let sequences = database.sequences();

    for (i, entry) in sequences.iter().enumerate() {
        sink.begin_sequence(entry.name(), entry.bases())?;

        let mut collector = ResultCollector::new(
            &mut table,
            &batch.reads,
            sink,
            entry.name(),
            options.report_positions,
            units,
        );
        let report = session.stream_segment(
            database.bytes(),
            entry.byte_offset,
            entry.packed_len,
            &mut collector,
        )?;
        let stats = collector.stats();

        summary.segments += 1;
        summary.positions += stats.locations;
        summary.tx_bandwidth_sum += report.producer.bandwidth_mbit();
        summary.rx_bandwidth_sum += stats.rx_bandwidth_sum;
        summary.rx_samples += stats.drains;
        if options.status {
            info!(
                sequence = entry.name(),
                packets = report.producer.packets,
                locations = stats.locations,
                tx_mbit = report.producer.bandwidth_mbit(),
                "Sequence searched"
            );
        }

        if i + 1 != sequences.len() {
            session.next_segment()?;
        }
    }

    if sequences.is_empty() {
        warn!("Database has no sequences, nothing streamed");
    }
    summary.timings.stream += started.elapsed();
    Ok(table)
}

fn summarise(
    batch: &ReadBatch,
    table: &BestMatchTable,
    sink: &mut (dyn ResultSink + Send),
    summary: &mut SearchSummary,
) -> Result<()> {
    for (read, entry) in batch.reads.iter().zip(table.entries()) {
        if entry.is_mapped() {
            summary.mapped += 1;
            sink.mapped(&read.label, entry.position_count, entry.best_mismatches as u8)?;
        } else {
            let needed = entry.best_unmapped.clamp(0, UNMAPPED) as u8;
            sink.unmapped(&read.label, needed)?;
        }
    }
    Ok(())
}
