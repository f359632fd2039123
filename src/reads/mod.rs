//! Query reads: FASTA parsing, encoding and batching.
//!
//! Every read is a header line (`>label`) followed by one sequence line.
//! The sequence ends at the first byte below `'A'`; if that byte is `/`,
//! the decimal number after it overrides the global mismatch limit for this
//! read only:
//!
//! ```text
//! >read_17
//! ACGTTGCAACGT/2
//! ```

mod lut;

pub use lut::{
    AMBIGUOUS, LOOKUP_BLOCK_LEN, LUT5_CFG, LookupBlock, MAX_PAIRS, MAX_READ_BASES, base_code,
    lut_mismatches,
};

use crate::{LinkError, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

/// One encoded query read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub label: String,
    pub block: LookupBlock,
    /// Bases that went into the block (at most 64).
    pub bases: usize,
    /// Read-specific mismatch limit from a `/N` suffix.
    pub mismatch_override: Option<u8>,
}

impl ReadRecord {
    /// Parse the sequence line of a read.
    pub fn from_sequence(label: impl Into<String>, line: &[u8]) -> Self {
        let (block, bases) = LookupBlock::encode(line);
        let sequence_len = line.iter().take_while(|&&b| b >= b'A').count();
        let mismatch_override = match line.get(sequence_len) {
            Some(b'/') => parse_override(&line[sequence_len + 1..]),
            _ => None,
        };
        Self { label: label.into(), block, bases, mismatch_override }
    }

    /// Mismatch limit uploaded for this read.
    pub fn mismatches(&self, global: u8) -> u8 {
        self.mismatch_override.unwrap_or(global)
    }
}

fn parse_override(rest: &[u8]) -> Option<u8> {
    let digits: &[u8] = &rest[..rest.iter().take_while(|b| b.is_ascii_digit()).count()];
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Reads uploaded together for one run.
#[derive(Debug, Clone, Default)]
pub struct ReadBatch {
    /// Index of the first read in the input file.
    pub first_index: usize,
    pub reads: Vec<ReadRecord>,
}

impl ReadBatch {
    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.reads.iter().map(|r| r.label.as_str()).collect()
    }
}

/// Streaming FASTA reader handing out [`ReadBatch`]es.
pub struct ReadSource<R> {
    reader: R,
    line: Vec<u8>,
    pending_label: Option<String>,
    consumed: usize,
    context: String,
}

impl ReadSource<BufReader<File>> {
    /// Open a read file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| LinkError::file_error(path, e))?;
        let mut source = Self::new(BufReader::new(file));
        source.context = path.display().to_string();
        Ok(source)
    }
}

impl<R: BufRead> ReadSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            pending_label: None,
            consumed: 0,
            context: "reads".to_string(),
        }
    }

    /// Reads handed out so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Next read, `None` at end of input.
    pub fn next_read(&mut self) -> Result<Option<ReadRecord>> {
        let label = match self.pending_label.take() {
            Some(label) => label,
            None => match self.next_header()? {
                Some(label) => label,
                None => return Ok(None),
            },
        };

        if !self.fill_line()? {
            warn!(label = %label, "Read without sequence line at end of input");
            self.consumed += 1;
            return Ok(Some(ReadRecord::from_sequence(label, &[])));
        }

        if let Some(next) = self.line.strip_prefix(b">") {
            // Header directly after header: empty read
            self.pending_label = Some(header_label(next));
            self.consumed += 1;
            return Ok(Some(ReadRecord::from_sequence(label, &[])));
        }

        let record = ReadRecord::from_sequence(label, &self.line);
        if record.bases == MAX_READ_BASES && sequence_len(&self.line) > MAX_READ_BASES {
            debug!(label = %record.label, "Read longer than 64 bases, cut");
        }
        self.consumed += 1;
        Ok(Some(record))
    }

    /// Up to `max` reads, `None` once input is exhausted.
    pub fn next_batch(&mut self, max: usize) -> Result<Option<ReadBatch>> {
        let first_index = self.consumed;
        let mut reads = Vec::with_capacity(max);
        while reads.len() < max {
            match self.next_read()? {
                Some(read) => reads.push(read),
                None => break,
            }
        }

        if reads.is_empty() { Ok(None) } else { Ok(Some(ReadBatch { first_index, reads })) }
    }

    fn next_header(&mut self) -> Result<Option<String>> {
        loop {
            if !self.fill_line()? {
                return Ok(None);
            }
            if let Some(rest) = self.line.strip_prefix(b">") {
                return Ok(Some(header_label(rest)));
            }
        }
    }

    fn fill_line(&mut self) -> Result<bool> {
        self.line.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.line)
            .map_err(|e| LinkError::parse(self.context.clone(), e.to_string()))?;
        Ok(n > 0)
    }
}

fn header_label(rest: &[u8]) -> String {
    String::from_utf8_lossy(rest).trim_end().to_string()
}

fn sequence_len(line: &[u8]) -> usize {
    line.iter().take_while(|&&b| b >= b'A').count()
}
