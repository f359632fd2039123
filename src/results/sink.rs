//! Result writers.
//!
//! The main output is either a plain list (`label<TAB>position`) or SAM.
//! Optional side files summarise every read of a batch: `.map` for mapped
//! reads (locations found, best mismatch count) and `.unmap` for the rest
//! (mismatches the read would need).

use crate::{LinkError, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Receives aggregated search results.
pub trait ResultSink {
    /// A database sequence is about to be searched.
    fn begin_sequence(&mut self, name: &str, bases: u64) -> Result<()>;

    /// One match location, 0-based.
    fn position(&mut self, read: &str, sequence: &str, position: u32, mismatches: u8)
    -> Result<()>;

    /// Batch summary for a read that matched somewhere.
    fn mapped(&mut self, read: &str, positions: u16, best: u8) -> Result<()>;

    /// Batch summary for a read that matched nowhere.
    fn unmapped(&mut self, read: &str, needed: u8) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Output file names derived from one base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub main: PathBuf,
    pub map: PathBuf,
    pub unmap: PathBuf,
}

impl OutputPaths {
    /// `<base>.sam` or `<base>.pam`, plus `<base>.map` and `<base>.unmap`.
    ///
    /// Suffixes are appended, so a base name containing dots keeps them.
    pub fn from_base(base: impl AsRef<Path>, sam: bool) -> Self {
        let base = base.as_ref();
        let with = |suffix: &str| {
            let mut name = base.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self { main: with(if sam { ".sam" } else { ".pam" }), map: with(".map"), unmap: with(".unmap") }
    }
}

/// Text writer over any `Write`.
pub struct TextSink<W: Write> {
    main: W,
    summaries: Option<(W, W)>,
    sam: bool,
    declared: HashSet<String>,
}

/// [`TextSink`] writing to files.
pub type FileSink = TextSink<BufWriter<File>>;

impl FileSink {
    /// Create the output files. Side files only when `map_files`.
    pub fn create(paths: &OutputPaths, sam: bool, map_files: bool) -> Result<Self> {
        let open = |path: &Path| -> Result<BufWriter<File>> {
            File::create(path).map(BufWriter::new).map_err(|e| LinkError::file_error(path, e))
        };
        let main = open(&paths.main)?;
        let summaries = if map_files { Some((open(&paths.map)?, open(&paths.unmap)?)) } else { None };
        TextSink::new(main, summaries, sam)
    }
}

impl<W: Write> TextSink<W> {
    /// Wrap writers and emit the file headers.
    pub fn new(mut main: W, mut summaries: Option<(W, W)>, sam: bool) -> Result<Self> {
        writeln!(main, "@HD VN:1.3 SO:unsorted")?;
        if let Some((map, unmap)) = summaries.as_mut() {
            writeln!(map, "# readname \t number of mapping positions \t minimal number of mismatches")?;
            writeln!(unmap, "# readname \t necessary mismatches")?;
        }
        Ok(Self { main, summaries, sam, declared: HashSet::new() })
    }

    /// Give back the writers.
    pub fn into_inner(self) -> (W, Option<(W, W)>) {
        (self.main, self.summaries)
    }
}

impl<W: Write> ResultSink for TextSink<W> {
    fn begin_sequence(&mut self, name: &str, bases: u64) -> Result<()> {
        // Every batch walks the whole database again
        if self.declared.insert(name.to_string()) {
            writeln!(self.main, "@SQ SN:{} LN:{}", name, bases)?;
        }
        Ok(())
    }

    fn position(
        &mut self,
        read: &str,
        sequence: &str,
        position: u32,
        mismatches: u8,
    ) -> Result<()> {
        if self.sam {
            writeln!(
                self.main,
                "{}\t0\t{}\t{}\t255\t*\t*\t0\t0\t*\t*\tNM:i:{}",
                read,
                sequence,
                u64::from(position) + 1,
                mismatches
            )?;
        } else {
            writeln!(self.main, "{}\t{}", read, position)?;
        }
        Ok(())
    }

    fn mapped(&mut self, read: &str, positions: u16, best: u8) -> Result<()> {
        if let Some((map, _)) = self.summaries.as_mut() {
            writeln!(map, "{} {} {}", read, positions, best)?;
        }
        Ok(())
    }

    fn unmapped(&mut self, read: &str, needed: u8) -> Result<()> {
        if let Some((_, unmap)) = self.summaries.as_mut() {
            writeln!(unmap, "{} {}", read, needed)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.main.flush()?;
        if let Some((map, unmap)) = self.summaries.as_mut() {
            map.flush()?;
            unmap.flush()?;
        }
        Ok(())
    }
}

/// Everything a [`MemorySink`] saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Sequence { name: String, bases: u64 },
    Position { read: String, sequence: String, position: u32, mismatches: u8 },
    Mapped { read: String, positions: u16, best: u8 },
    Unmapped { read: String, needed: u8 },
}

/// Collects results in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub events: Vec<SinkEvent>,
}

impl MemorySink {
    /// `(read, sequence, position, mismatches)` of every location.
    pub fn positions(&self) -> Vec<(String, String, u32, u8)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Position { read, sequence, position, mismatches } => {
                    Some((read.clone(), sequence.clone(), *position, *mismatches))
                }
                _ => None,
            })
            .collect()
    }

    /// `(read, positions, best)` of every mapped summary.
    pub fn mapped(&self) -> Vec<(String, u16, u8)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Mapped { read, positions, best } => Some((read.clone(), *positions, *best)),
                _ => None,
            })
            .collect()
    }

    /// `(read, needed)` of every unmapped summary.
    pub fn unmapped(&self) -> Vec<(String, u8)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Unmapped { read, needed } => Some((read.clone(), *needed)),
                _ => None,
            })
            .collect()
    }
}

impl ResultSink for MemorySink {
    fn begin_sequence(&mut self, name: &str, bases: u64) -> Result<()> {
        self.events.push(SinkEvent::Sequence { name: name.to_string(), bases });
        Ok(())
    }

    fn position(
        &mut self,
        read: &str,
        sequence: &str,
        position: u32,
        mismatches: u8,
    ) -> Result<()> {
        self.events.push(SinkEvent::Position {
            read: read.to_string(),
            sequence: sequence.to_string(),
            position,
            mismatches,
        });
        Ok(())
    }

    fn mapped(&mut self, read: &str, positions: u16, best: u8) -> Result<()> {
        self.events.push(SinkEvent::Mapped { read: read.to_string(), positions, best });
        Ok(())
    }

    fn unmapped(&mut self, read: &str, needed: u8) -> Result<()> {
        self.events.push(SinkEvent::Unmapped { read: read.to_string(), needed });
        Ok(())
    }
}
