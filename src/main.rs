//! fpga-align: search short reads on the raw-Ethernet accelerator.

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use fpga_align::config::{LinkConfig, SearchOptions};
use fpga_align::database::{Database, database_paths, transform_fasta};
use fpga_align::engine::ProtocolSession;
use fpga_align::reads::ReadSource;
use fpga_align::results::{FileSink, OutputPaths};
use fpga_align::search::run_search;
use fpga_align::transport::RawLink;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fpga-align")]
#[command(about = "Search short reads against a packed DNA database on the FPGA accelerator")]
#[command(after_help = "\
EXAMPLES:
  fpga-align -d hg19.fa -t                      # Pack the database only
  fpga-align -d hg19.fa -q reads.fa -o out      # Pack, then search
  fpga-align -b hg19.bindb -q reads.fa -o out -m 2 -s -u")]
struct Cli {
    /// Query reads in FASTA format
    #[arg(short, long, value_name = "FILE")]
    query: Option<PathBuf>,

    /// Database in FASTA format, packed before searching
    #[arg(short, long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Database already packed into .bindb/.dbinfo
    #[arg(short, long, value_name = "FILE", conflicts_with = "database")]
    bindb: Option<PathBuf>,

    /// Only pack the database, do not search
    #[arg(short, long, requires = "database")]
    transform: bool,

    /// Mismatches allowed per read
    #[arg(short, long, default_value_t = 0)]
    mismatch: u8,

    /// Base name for output files
    #[arg(short, long, value_name = "BASE")]
    output: Option<PathBuf>,

    /// Write SAM instead of the plain position list
    #[arg(short, long)]
    sam: bool,

    /// Also write .map and .unmap summaries
    #[arg(short = 'u', long = "map")]
    map: bool,

    /// Print status and performance information
    #[arg(short = 'i', long)]
    status: bool,

    /// Report individual match positions
    #[arg(short, long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    positions: bool,

    /// Link configuration (YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn init_logging(status: bool) {
    let default = if status { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.status);

    let (bindb, dbinfo) = match (&cli.database, &cli.bindb) {
        (Some(fasta), _) => {
            let (bindb, dbinfo) = database_paths(fasta);
            transform_fasta(fasta, &bindb, &dbinfo)
                .with_context(|| format!("Failed to pack {}", fasta.display()))?;
            (bindb, dbinfo)
        }
        (None, Some(bindb)) => (bindb.clone(), bindb.with_extension("dbinfo")),
        (None, None) => bail!("No database given, use --database or --bindb"),
    };
    if cli.transform {
        return Ok(());
    }

    let query = cli.query.as_ref().context("No query file given, use --query")?;
    let output = cli.output.as_ref().context("No output base name given, use --output")?;

    let config = match &cli.config {
        Some(path) => LinkConfig::load(path)?,
        None => LinkConfig::default(),
    };
    let options = SearchOptions {
        mismatches: cli.mismatch,
        report_positions: cli.positions,
        sam: cli.sam,
        map_files: cli.map,
        status: cli.status,
        iteration_pause: config.iteration_pause(),
    };

    let database = Database::open(&bindb, &dbinfo)
        .with_context(|| format!("Failed to open packed database {}", bindb.display()))?;
    let mut reads = ReadSource::open(query)?;
    let paths = OutputPaths::from_base(output, options.sam);
    let mut sink = FileSink::create(&paths, options.sam, options.map_files)
        .with_context(|| format!("Failed to create {}", paths.main.display()))?;

    let link = RawLink::open(&config.interface, config.host, config.device)
        .with_context(|| format!("Failed to open link on {}", config.interface))?;
    warn!("Receives have no timeout: a silent accelerator blocks the search indefinitely");
    let local = link.local();
    let mut session = ProtocolSession::establish(link, local, config.device, config.overflow_settle())
        .context("Accelerator discovery failed")?;
    info!(
        generation = %session.device().generation,
        units = session.device().unit_count,
        half_latency_us = session.device().half_latency.as_micros() as u64,
        "Session established"
    );

    let summary = run_search(&mut session, &database, &mut reads, &mut sink, &options)?;
    for run in &summary.failed_runs {
        warn!(batch = run.batch, first_read = run.first_read, reads = run.reads, error = %run.error, "Failed run");
    }

    if cli.status {
        println!("{summary}");
    } else {
        println!("{} of {} reads mapped, {} positions", summary.mapped, summary.reads, summary.positions);
    }
    Ok(())
}
