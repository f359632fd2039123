//! Packed database format.
//!
//! ## `.bindb`
//!
//! Four bases per byte, first base in the two high bits, using the same
//! 2-bit codes as the reads (A=0, C=1, T=2, G=3). Ambiguous letters have no
//! code of their own and fold onto one of the four. Every sequence starts on
//! a byte boundary; a partial last byte is padded with A.
//!
//! ## `.dbinfo`
//!
//! ```text
//! #          2        <- sequences
//! #       1200        <- total bases
//!
//! #          0        <- base offset of sequence 0
//! chr1 some label
//! #        250        <- packed bytes of sequence 0
//!
//! #       1000
//! chr2
//! #         50
//!
//! ```

use crate::{LinkError, Result};
use std::io::{BufRead, Write};
use tracing::{debug, warn};

/// One indexed database sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceEntry {
    pub label: String,
    /// Bases in all preceding sequences.
    pub base_offset: u64,
    /// Bytes in the packed file.
    pub packed_len: usize,
    /// Start in the packed file.
    pub byte_offset: usize,
}

impl SequenceEntry {
    /// Length advertised to result files (packed bytes times four).
    pub fn bases(&self) -> u64 {
        self.packed_len as u64 * 4
    }

    /// Reference name: the label up to the first whitespace.
    pub fn name(&self) -> &str {
        self.label.split_whitespace().next().unwrap_or("")
    }
}

/// Parsed `.dbinfo` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseIndex {
    pub total_bases: u64,
    pub sequences: Vec<SequenceEntry>,
}

impl DatabaseIndex {
    /// Packed bytes over all sequences.
    pub fn packed_len(&self) -> usize {
        self.sequences.iter().map(|s| s.packed_len).sum()
    }

    /// Write the `.dbinfo` text.
    pub fn write<W: Write>(&self, mut out: W) -> Result<()> {
        writeln!(out, "# {:>10}", self.sequences.len())?;
        writeln!(out, "# {:>10}", self.total_bases)?;
        writeln!(out)?;
        for entry in &self.sequences {
            writeln!(out, "# {:>10}", entry.base_offset)?;
            writeln!(out, "{}", entry.label)?;
            writeln!(out, "# {:>10}", entry.packed_len)?;
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Parse `.dbinfo` text.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = IndexLines { lines: reader.lines(), number: 0 };

        let count = parse_count(&lines.next("sequence count")?, "sequence count")?;
        let total_bases = parse_count(&lines.next("base count")?, "base count")?;
        expect_blank(&lines.next("separator")?, lines.number)?;

        let mut sequences = Vec::with_capacity(count.min(1 << 16) as usize);
        let mut byte_offset = 0usize;
        for index in 0..count {
            let what = format!("sequence {}", index);
            let base_offset = parse_count(&lines.next(&what)?, &what)?;
            let label = lines.next(&what)?.trim_end().to_string();
            let packed_len = parse_count(&lines.next(&what)?, &what)? as usize;
            // The last separator may be missing
            if let Some(line) = lines.next_optional()? {
                expect_blank(&line, lines.number)?;
            }

            sequences.push(SequenceEntry { label, base_offset, packed_len, byte_offset });
            byte_offset += packed_len;
        }

        Ok(Self { total_bases, sequences })
    }
}

struct IndexLines<R> {
    lines: std::io::Lines<R>,
    number: usize,
}

impl<R: BufRead> IndexLines<R> {
    fn next_optional(&mut self) -> Result<Option<String>> {
        match self.lines.next() {
            Some(line) => {
                self.number += 1;
                Ok(Some(line?))
            }
            None => Ok(None),
        }
    }

    fn next(&mut self, what: &str) -> Result<String> {
        self.next_optional()?.ok_or_else(|| {
            LinkError::parse("database index", format!("missing {} after line {}", what, self.number))
        })
    }
}

fn parse_count(line: &str, what: &str) -> Result<u64> {
    let digits = line
        .trim()
        .strip_prefix('#')
        .ok_or_else(|| LinkError::parse("database index", format!("{}: expected '# <n>', got '{}'", what, line)))?
        .trim();
    digits
        .parse()
        .map_err(|_| LinkError::parse("database index", format!("{}: '{}' is not a count", what, digits)))
}

fn expect_blank(line: &str, number: usize) -> Result<()> {
    if line.trim().is_empty() {
        Ok(())
    } else {
        Err(LinkError::parse(
            "database index",
            format!("line {}: expected blank line, got '{}'", number, line),
        ))
    }
}

/// Pack a FASTA database.
///
/// Writes the packed bases to `packed` and returns the index; the caller
/// writes it with [`DatabaseIndex::write`].
pub fn pack_fasta<R: BufRead, W: Write>(mut fasta: R, mut packed: W) -> Result<DatabaseIndex> {
    let mut index = DatabaseIndex::default();
    let mut packer = BasePacker::default();
    let mut current: Option<SequenceEntry> = None;
    let mut byte_offset = 0usize;
    let mut skipped = 0u64;
    let mut line = Vec::new();

    loop {
        line.clear();
        if fasta.read_until(b'\n', &mut line)? == 0 {
            break;
        }

        if let Some(header) = line.strip_prefix(b">") {
            if let Some(mut entry) = current.take() {
                entry.packed_len = packer.finish(&mut packed)?;
                byte_offset += entry.packed_len;
                index.sequences.push(entry);
            }
            current = Some(SequenceEntry {
                label: String::from_utf8_lossy(header).trim_end().to_string(),
                base_offset: index.total_bases,
                packed_len: 0,
                byte_offset,
            });
            continue;
        }

        for &byte in line.iter().filter(|&&b| b >= b'A') {
            if current.is_none() {
                skipped += 1;
                continue;
            }
            packer.push(byte, &mut packed)?;
            index.total_bases += 1;
        }
    }

    if let Some(mut entry) = current.take() {
        entry.packed_len = packer.finish(&mut packed)?;
        index.sequences.push(entry);
    }
    packed.flush()?;

    if skipped > 0 {
        warn!(bases = skipped, "Bases before the first header were ignored");
    }
    debug!(
        sequences = index.sequences.len(),
        bases = index.total_bases,
        "Database packed"
    );
    Ok(index)
}

/// Accumulates bases four to a byte.
#[derive(Debug, Default)]
struct BasePacker {
    byte: u8,
    filled: u8,
    written: usize,
}

impl BasePacker {
    fn push<W: Write>(&mut self, base: u8, out: &mut W) -> Result<()> {
        let code = (base >> 1) & 3;
        self.byte |= code << (2 * (3 - self.filled));
        self.filled += 1;
        if self.filled == 4 {
            self.emit(out)?;
        }
        Ok(())
    }

    fn emit<W: Write>(&mut self, out: &mut W) -> Result<()> {
        out.write_all(&[self.byte])?;
        self.byte = 0;
        self.filled = 0;
        self.written += 1;
        Ok(())
    }

    /// Flush a partial byte and return bytes written for this sequence.
    fn finish<W: Write>(&mut self, out: &mut W) -> Result<usize> {
        if self.filled > 0 {
            self.emit(out)?;
        }
        Ok(std::mem::take(&mut self.written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn packs_first_base_high() {
        let mut packed = Vec::new();
        let index = pack_fasta(Cursor::new(b">s\nACTG\n".to_vec()), &mut packed).unwrap();
        assert_eq!(packed, vec![0b00_01_10_11]);
        assert_eq!(index.total_bases, 4);
        assert_eq!(index.sequences[0].packed_len, 1);
    }

    #[test]
    fn sequences_start_on_byte_boundaries() {
        let fasta = b">one first\nACGTA\nC\n>two\nGG\n".to_vec();
        let mut packed = Vec::new();
        let index = pack_fasta(Cursor::new(fasta), &mut packed).unwrap();

        assert_eq!(index.sequences.len(), 2);
        let one = &index.sequences[0];
        assert_eq!(one.label, "one first");
        assert_eq!(one.name(), "one");
        assert_eq!((one.base_offset, one.packed_len, one.byte_offset), (0, 2, 0));
        let two = &index.sequences[1];
        assert_eq!((two.base_offset, two.packed_len, two.byte_offset), (6, 1, 2));
        assert_eq!(packed.len(), 3);
        assert_eq!(packed[1], 0b00_01_00_00, "partial byte padded with A");
        assert_eq!(packed[2], 0b11_11_00_00);
    }

    #[test]
    fn index_text_parses_back() {
        let mut packed = Vec::new();
        let index = pack_fasta(Cursor::new(b">a\nACGTACGT\n>b x\nTT\n".to_vec()), &mut packed).unwrap();
        let mut text = Vec::new();
        index.write(&mut text).unwrap();

        let text = String::from_utf8(text).unwrap();
        let head = format!("# {:>10}\n# {:>10}\n\n# {:>10}\na\n", 2, 10, 0);
        assert!(text.starts_with(&head));
        assert_eq!(DatabaseIndex::parse(Cursor::new(text.into_bytes())).unwrap(), index);
    }

    #[test]
    fn malformed_index_is_rejected() {
        let err = DatabaseIndex::parse(Cursor::new(b"# 1\n# x\n\n".to_vec())).unwrap_err();
        assert!(matches!(err, LinkError::Parse { .. }));
        assert!(DatabaseIndex::parse(Cursor::new(b"# 2\n# 8\n\n# 0\nchr\n# 2\n\n".to_vec())).is_err());
    }
}
