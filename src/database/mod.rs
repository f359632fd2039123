//! Reference database: packing and memory-mapped access.
//!
//! A FASTA database is packed once into a `.bindb` file plus a `.dbinfo`
//! index ([`transform_fasta`]). Searches open both with [`Database::open`]
//! and stream one sequence at a time straight out of the mapping.
//!
//! ```rust,no_run
//! use fpga_align::database::{Database, database_paths, transform_fasta};
//!
//! fn prepare() -> fpga_align::Result<()> {
//!     let (bindb, dbinfo) = database_paths("hg19.fa");
//!     transform_fasta("hg19.fa", &bindb, &dbinfo)?;
//!
//!     let database = Database::open(&bindb, &dbinfo)?;
//!     for entry in database.sequences() {
//!         println!("{}: {} bytes", entry.name(), entry.packed_len);
//!     }
//!     Ok(())
//! }
//! ```

mod format;

pub use format::{DatabaseIndex, SequenceEntry, pack_fasta};

use crate::{LinkError, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// `.bindb` and `.dbinfo` paths belonging to a FASTA file.
pub fn database_paths(fasta: impl AsRef<Path>) -> (PathBuf, PathBuf) {
    let fasta = fasta.as_ref();
    (fasta.with_extension("bindb"), fasta.with_extension("dbinfo"))
}

/// Pack `fasta` into `bindb` and write its index to `dbinfo`.
pub fn transform_fasta(
    fasta: impl AsRef<Path>,
    bindb: impl AsRef<Path>,
    dbinfo: impl AsRef<Path>,
) -> Result<DatabaseIndex> {
    let (fasta, bindb, dbinfo) = (fasta.as_ref(), bindb.as_ref(), dbinfo.as_ref());
    let started = Instant::now();
    info!(fasta = %fasta.display(), "Packing database");

    let input = File::open(fasta).map_err(|e| LinkError::file_error(fasta, e))?;
    let packed = File::create(bindb).map_err(|e| LinkError::file_error(bindb, e))?;
    let index = pack_fasta(BufReader::new(input), BufWriter::new(packed))?;

    let info_file = File::create(dbinfo).map_err(|e| LinkError::file_error(dbinfo, e))?;
    index.write(BufWriter::new(info_file))?;

    info!(
        sequences = index.sequences.len(),
        bases = index.total_bases,
        elapsed_ms = started.elapsed().as_millis() as u64,
        bindb = %bindb.display(),
        dbinfo = %dbinfo.display(),
        "Database packed"
    );
    Ok(index)
}

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => &map[..],
            Backing::Owned(bytes) => &bytes[..],
        }
    }
}

/// Packed database ready for streaming.
pub struct Database {
    backing: Backing,
    index: DatabaseIndex,
    path: PathBuf,
}

impl Database {
    /// Map `bindb` read-only and parse `dbinfo`.
    pub fn open(bindb: impl AsRef<Path>, dbinfo: impl AsRef<Path>) -> Result<Self> {
        let (bindb, dbinfo) = (bindb.as_ref(), dbinfo.as_ref());

        let info_file = File::open(dbinfo).map_err(|e| LinkError::file_error(dbinfo, e))?;
        let index = DatabaseIndex::parse(BufReader::new(info_file))?;

        let file = File::open(bindb).map_err(|e| LinkError::file_error(bindb, e))?;
        let len = file.metadata().map_err(|e| LinkError::file_error(bindb, e))?.len();
        let backing = if len == 0 {
            Backing::Owned(Vec::new())
        } else {
            // SAFETY: the file is opened read-only and not modified while mapped
            let map = unsafe { Mmap::map(&file) }.map_err(|e| LinkError::file_error(bindb, e))?;
            Backing::Mapped(map)
        };

        let database = Self { backing, index, path: bindb.to_path_buf() };
        database.check_extent()?;
        info!(
            path = %database.path.display(),
            sequences = database.index.sequences.len(),
            bytes = database.bytes().len(),
            "Database mapped"
        );
        Ok(database)
    }

    /// In-memory database, mainly for tests.
    pub fn from_parts(bytes: Vec<u8>, index: DatabaseIndex) -> Result<Self> {
        let database = Self { backing: Backing::Owned(bytes), index, path: PathBuf::from("<memory>") };
        database.check_extent()?;
        Ok(database)
    }

    fn check_extent(&self) -> Result<()> {
        let indexed = self.index.packed_len();
        let actual = self.bytes().len();
        if indexed > actual {
            return Err(LinkError::parse(
                self.path.display().to_string(),
                format!("index covers {} bytes but file has {}", indexed, actual),
            ));
        }
        if indexed < actual {
            warn!(indexed, actual, "Packed database longer than its index");
        }
        Ok(())
    }

    /// The whole packed file.
    pub fn bytes(&self) -> &[u8] {
        self.backing.bytes()
    }

    pub fn index(&self) -> &DatabaseIndex {
        &self.index
    }

    pub fn sequences(&self) -> &[SequenceEntry] {
        &self.index.sequences
    }

    /// Packed bytes of sequence `i`.
    pub fn segment(&self, i: usize) -> Option<&[u8]> {
        let entry = self.index.sequences.get(i)?;
        self.bytes().get(entry.byte_offset..entry.byte_offset + entry.packed_len)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("bytes", &self.bytes().len())
            .field("sequences", &self.index.sequences.len())
            .finish()
    }
}
