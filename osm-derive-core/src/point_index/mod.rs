//! Disk-resident map from point id to coordinate.
//!
//! Point ids are sparse over the 64-bit space but arrive in dense runs. The
//! id space is cut into fixed-size blocks of directly addressed records; a
//! block is written to disk once a run reaches it, and a small directory
//! maps block numbers to their place in the file. Isolated ids that never
//! earn a block live in an in-memory overflow map, so both the file and the
//! resident memory grow with the number of stored ids rather than with the
//! id space.
//!
//! The index is a rebuildable cache. Anything unexpected at open time
//! (foreign file, newer format, truncated file, a previous writer that never
//! closed) is reported as an error instead of being repaired.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem,
    path::{Path, PathBuf},
};

use geo::Coord;
use log::{debug, info};
use tempfile::TempPath;
use thiserror::Error;

use crate::OsmId;

mod format;

use format::{
    BLOCK_LEN, BLOCK_RECORDS, BLOCK_SHIFT, DIRECTORY_ENTRY_LEN, FLAG_OPEN, HEADER_LEN, Header,
    MAGIC, OverflowSection, VERSION, decode_record, encode_record, read_u64, record_offset,
};

/// Explicit configuration for a [`PointIndex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointIndexOptions {
    /// Overflow ids sharing one block that make the index allocate it.
    pub min_block_points: usize,
    /// Directory for scratch indices; the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
    /// Log the memory used by the index when it is closed.
    pub report_memory: bool,
}

impl Default for PointIndexOptions {
    fn default() -> Self {
        Self {
            min_block_points: 8,
            temp_dir: None,
            report_memory: false,
        }
    }
}

impl PointIndexOptions {
    /// Override how many ids a block must attract before it is allocated.
    #[must_use]
    pub const fn with_min_block_points(mut self, points: usize) -> Self {
        self.min_block_points = points;
        self
    }

    /// Place scratch indices in `dir`.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Enable memory reporting at close.
    #[must_use]
    pub const fn with_memory_report(mut self, enabled: bool) -> Self {
        self.report_memory = enabled;
        self
    }
}

/// Errors raised by [`PointIndex`].
#[derive(Debug, Error)]
pub enum PointIndexError {
    /// Reading or writing the backing file failed.
    #[error("point index I/O failed for {path}: {source}")]
    Io {
        /// Backing file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not a point index.
    #[error("{path} is not a point index (magic {found:?})")]
    InvalidMagic {
        /// Backing file.
        path: PathBuf,
        /// Bytes found where the magic was expected.
        found: [u8; 4],
    },
    /// The file uses an unknown format version.
    #[error("point index {path} has version {found}; supported version is {supported}")]
    UnsupportedVersion {
        /// Backing file.
        path: PathBuf,
        /// Version in the header.
        found: u16,
        /// Version this build writes.
        supported: u16,
    },
    /// The file was written with a different block size.
    #[error("point index {path} uses blocks of {found} records; expected {supported}")]
    UnsupportedBlockSize {
        /// Backing file.
        path: PathBuf,
        /// Records per block in the header.
        found: u64,
        /// Records per block this build writes.
        supported: u64,
    },
    /// A previous writer did not close the index.
    #[error("point index {path} was not closed cleanly; rebuild it from source data")]
    Unclean {
        /// Backing file.
        path: PathBuf,
    },
    /// The file length disagrees with its header.
    #[error("point index {path} is truncated: expected {expected} bytes, found {found}")]
    Truncated {
        /// Backing file.
        path: PathBuf,
        /// Length implied by the header.
        expected: u64,
        /// Actual file length.
        found: u64,
    },
    /// The block directory lists a block twice.
    #[error("point index {path} lists block {block} more than once")]
    DuplicateBlock {
        /// Backing file.
        path: PathBuf,
        /// Repeated block number.
        block: u64,
    },
    /// The overflow section could not be decoded.
    #[error("failed to decode overflow section of {path}: {source}")]
    Decode {
        /// Backing file.
        path: PathBuf,
        /// Decoder error from `bincode`.
        #[source]
        source: bincode::Error,
    },
    /// The overflow section could not be encoded.
    #[error("failed to encode overflow section of {path}: {source}")]
    Encode {
        /// Backing file.
        path: PathBuf,
        /// Encoder error from `bincode`.
        #[source]
        source: bincode::Error,
    },
    /// Coordinates must be finite.
    #[error("point {id} has a non-finite coordinate ({x}, {y})")]
    InvalidCoordinate {
        /// Point id.
        id: OsmId,
        /// Longitude supplied.
        x: f64,
        /// Latitude supplied.
        y: f64,
    },
}

/// Persistent point id → coordinate map backed by a single file.
///
/// # Examples
///
/// ```
/// use geo::Coord;
/// use osm_derive_core::{PointIndex, PointIndexOptions};
///
/// # fn main() -> Result<(), osm_derive_core::PointIndexError> {
/// let dir = tempfile::tempdir().expect("temp dir");
/// let path = dir.path().join("nodes.idx");
///
/// let mut index = PointIndex::open(&path, PointIndexOptions::default())?;
/// index.set(25_500, Coord { x: 1.0, y: 25.5 })?;
/// index.close()?;
///
/// let mut index = PointIndex::open(&path, PointIndexOptions::default())?;
/// assert_eq!(index.get(25_500)?, Some(Coord { x: 1.0, y: 25.5 }));
/// assert_eq!(index.get(1_000)?, None);
/// index.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PointIndex {
    path: PathBuf,
    file: File,
    header: Header,
    /// Block number to the slot holding it in the file.
    directory: BTreeMap<u64, u64>,
    overflow: BTreeMap<OsmId, Coord<f64>>,
    options: PointIndexOptions,
    scratch: Option<TempPath>,
}

/// Where a non-negative id lives inside the block grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockAddress {
    block: u64,
    record: u64,
}

impl BlockAddress {
    fn of(id: OsmId) -> Option<Self> {
        let id = u64::try_from(id).ok()?;
        Some(Self {
            block: id >> BLOCK_SHIFT,
            record: id & (BLOCK_RECORDS - 1),
        })
    }
}

fn block_ids(block: u64) -> (OsmId, OsmId) {
    let first = block << BLOCK_SHIFT;
    let start = i64::try_from(first).unwrap_or(i64::MAX);
    let end = i64::try_from(first + BLOCK_RECORDS).unwrap_or(i64::MAX);
    (start, end)
}

impl PointIndex {
    /// Open the index at `path`, creating an empty one if the file is missing
    /// or empty.
    pub fn open(
        path: impl AsRef<Path>,
        options: PointIndexOptions,
    ) -> Result<Self, PointIndexError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| io_error(&path, source))?;
        let length = file
            .metadata()
            .map_err(|source| io_error(&path, source))?
            .len();

        let existing = if length == 0 {
            Existing::default()
        } else {
            read_existing(&mut file, &path, length)?
        };

        let mut index = Self {
            path,
            file,
            header: existing.header,
            directory: existing.directory,
            overflow: existing.overflow,
            options,
            scratch: None,
        };
        index.header.flags |= FLAG_OPEN;
        index.write_header()?;
        debug!(
            "opened point index {} ({} blocks, overflow {})",
            index.path.display(),
            index.directory.len(),
            index.overflow.len()
        );
        Ok(index)
    }

    /// Create a temporary index that is removed once closed or dropped.
    pub fn scratch(options: PointIndexOptions) -> Result<Self, PointIndexError> {
        let dir = options.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
        let temp_path = tempfile::Builder::new()
            .prefix("osm-derive-points")
            .suffix(".idx")
            .tempfile_in(&dir)
            .map_err(|source| io_error(&dir, source))?
            .into_temp_path();
        let mut index = Self::open(&temp_path, options)?;
        index.scratch = Some(temp_path);
        Ok(index)
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a coordinate; `None` when the id was never set or was deleted.
    pub fn get(&mut self, id: OsmId) -> Result<Option<Coord<f64>>, PointIndexError> {
        match self.record_offset(id) {
            Some(offset) => self.read_record(offset),
            None => Ok(self.overflow.get(&id).copied()),
        }
    }

    /// Store the coordinate for `id`, replacing any earlier value.
    pub fn set(&mut self, id: OsmId, coord: Coord<f64>) -> Result<(), PointIndexError> {
        if !(coord.x.is_finite() && coord.y.is_finite()) {
            return Err(PointIndexError::InvalidCoordinate {
                id,
                x: coord.x,
                y: coord.y,
            });
        }
        if let Some(offset) = self.record_offset(id) {
            return self.write_record(offset, Some(coord));
        }
        self.overflow.insert(id, coord);
        if let Some(address) = BlockAddress::of(id) {
            if self.earns_block(id, address.block) {
                self.allocate_block(address.block)?;
            }
        }
        Ok(())
    }

    /// Forget the coordinate for `id`. Deleting an unset id is a no-op.
    pub fn delete(&mut self, id: OsmId) -> Result<(), PointIndexError> {
        match self.record_offset(id) {
            Some(offset) => self.write_record(offset, None),
            None => {
                self.overflow.remove(&id);
                Ok(())
            }
        }
    }

    /// Visit every stored entry in ascending id order.
    pub fn for_each<F>(&mut self, mut visit: F) -> Result<(), PointIndexError>
    where
        F: FnMut(OsmId, Coord<f64>),
    {
        let mut overflow = self.overflow.iter().peekable();
        let mut file = &self.file;
        let mut block_bytes = vec![0_u8; usize::try_from(BLOCK_LEN).unwrap_or(usize::MAX)];
        for (block, slot) in &self.directory {
            let (start, _) = block_ids(*block);
            while let Some((id, coord)) = overflow.next_if(|(id, _)| **id < start) {
                visit(*id, *coord);
            }
            file.seek(SeekFrom::Start(record_offset(*slot, 0)))
                .and_then(|_| file.read_exact(&mut block_bytes))
                .map_err(|source| io_error(&self.path, source))?;
            for (id, record) in (start..).zip(block_bytes.chunks_exact(16)) {
                if let Some(coord) = decode_record(record) {
                    visit(id, coord);
                }
            }
        }
        for (id, coord) in overflow {
            visit(*id, *coord);
        }
        Ok(())
    }

    /// Collect every stored entry in ascending id order.
    pub fn entries(&mut self) -> Result<Vec<(OsmId, Coord<f64>)>, PointIndexError> {
        let mut entries = Vec::new();
        self.for_each(|id, coord| entries.push((id, coord)))?;
        Ok(entries)
    }

    /// Approximate bytes held in memory by the index.
    #[must_use]
    pub fn used_memory(&self) -> usize {
        mem::size_of::<Self>()
            + self.overflow.len() * mem::size_of::<(OsmId, Coord<f64>)>()
            + self.directory.len() * mem::size_of::<(u64, u64)>()
    }

    /// Persist the directory and overflow section without releasing the file.
    pub fn flush(&mut self) -> Result<(), PointIndexError> {
        self.write_tail(self.header.flags | FLAG_OPEN)
    }

    /// Flush everything, mark the file as cleanly closed and release it.
    pub fn close(mut self) -> Result<(), PointIndexError> {
        self.write_tail(self.header.flags & !FLAG_OPEN)?;
        self.file
            .sync_all()
            .map_err(|source| io_error(&self.path, source))?;
        if self.options.report_memory {
            info!(
                "point index {} used {} bytes of memory",
                self.path.display(),
                self.used_memory()
            );
        }
        debug!(
            "closed point index {} ({} blocks, overflow {})",
            self.path.display(),
            self.directory.len(),
            self.overflow.len()
        );
        Ok(())
    }

    fn record_offset(&self, id: OsmId) -> Option<u64> {
        let address = BlockAddress::of(id)?;
        let slot = self.directory.get(&address.block)?;
        Some(record_offset(*slot, address.record))
    }

    /// A block is allocated when a run continues from the previous block or
    /// enough overflow ids gather inside it.
    fn earns_block(&self, id: OsmId, block: u64) -> bool {
        let continues_run = block > 0
            && self.directory.contains_key(&(block - 1))
            && BlockAddress::of(id - 1).is_some_and(|previous| previous.block == block - 1);
        if continues_run {
            return true;
        }
        let (start, end) = block_ids(block);
        self.overflow.range(start..end).count() >= self.options.min_block_points.max(1)
    }

    /// Append an unset block for `block` and move its overflow ids into it.
    fn allocate_block(&mut self, block: u64) -> Result<(), PointIndexError> {
        let slot = self.header.block_count;
        let unset: Vec<u8> = (0..BLOCK_RECORDS).flat_map(|_| encode_record(None)).collect();
        self.file
            .seek(SeekFrom::Start(record_offset(slot, 0)))
            .and_then(|_| self.file.write_all(&unset))
            .map_err(|source| io_error(&self.path, source))?;
        self.header.block_count += 1;
        self.directory.insert(block, slot);

        let (start, end) = block_ids(block);
        let migrated: Vec<(OsmId, Coord<f64>)> = self
            .overflow
            .range(start..end)
            .map(|(id, coord)| (*id, *coord))
            .collect();
        for (id, coord) in migrated {
            self.overflow.remove(&id);
            if let Some(offset) = self.record_offset(id) {
                self.write_record(offset, Some(coord))?;
            }
        }
        Ok(())
    }

    fn read_record(&mut self, offset: u64) -> Result<Option<Coord<f64>>, PointIndexError> {
        let mut record = [0_u8; 16];
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(&mut record))
            .map_err(|source| io_error(&self.path, source))?;
        Ok(decode_record(&record))
    }

    fn write_record(
        &mut self,
        offset: u64,
        coord: Option<Coord<f64>>,
    ) -> Result<(), PointIndexError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&encode_record(coord)))
            .map_err(|source| io_error(&self.path, source))
    }

    fn write_header(&mut self) -> Result<(), PointIndexError> {
        let encoded = self.header.encode();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&encoded))
            .and_then(|()| self.file.sync_data())
            .map_err(|source| io_error(&self.path, source))
    }

    /// Rewrite the directory and overflow section after the last block.
    fn write_tail(&mut self, flags: u16) -> Result<(), PointIndexError> {
        let mut slots: Vec<(u64, u64)> = self
            .directory
            .iter()
            .map(|(block, slot)| (*slot, *block))
            .collect();
        slots.sort_unstable();
        let mut tail: Vec<u8> = slots
            .into_iter()
            .flat_map(|(_, block)| block.to_le_bytes())
            .collect();
        let overflow = if self.overflow.is_empty() {
            Vec::new()
        } else {
            let section = OverflowSection {
                entries: self
                    .overflow
                    .iter()
                    .map(|(id, coord)| (*id, [coord.x, coord.y]))
                    .collect(),
            };
            bincode::serialize(&section).map_err(|source| PointIndexError::Encode {
                path: self.path.clone(),
                source,
            })?
        };
        tail.extend_from_slice(&overflow);

        let offset = HEADER_LEN + self.header.block_count * BLOCK_LEN;
        let tail_len = u64::try_from(tail.len()).unwrap_or(u64::MAX);
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&tail))
            .and_then(|()| self.file.set_len(offset + tail_len))
            .map_err(|source| io_error(&self.path, source))?;
        self.header.overflow_len = u64::try_from(overflow.len()).unwrap_or(u64::MAX);
        self.header.flags = flags;
        self.write_header()
    }
}

#[derive(Debug)]
struct Existing {
    header: Header,
    directory: BTreeMap<u64, u64>,
    overflow: BTreeMap<OsmId, Coord<f64>>,
}

impl Default for Existing {
    fn default() -> Self {
        Self {
            header: Header::empty(),
            directory: BTreeMap::new(),
            overflow: BTreeMap::new(),
        }
    }
}

fn read_existing(file: &mut File, path: &Path, length: u64) -> Result<Existing, PointIndexError> {
    if length < HEADER_LEN {
        return Err(PointIndexError::Truncated {
            path: path.to_path_buf(),
            expected: HEADER_LEN,
            found: length,
        });
    }
    let mut raw = [0_u8; 32];
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_exact(&mut raw))
        .map_err(|source| io_error(path, source))?;
    let (magic, header) = Header::decode(&raw);
    if magic != MAGIC {
        return Err(PointIndexError::InvalidMagic {
            path: path.to_path_buf(),
            found: magic,
        });
    }
    if header.version != VERSION {
        return Err(PointIndexError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: header.version,
            supported: VERSION,
        });
    }
    if header.block_records != BLOCK_RECORDS {
        return Err(PointIndexError::UnsupportedBlockSize {
            path: path.to_path_buf(),
            found: header.block_records,
            supported: BLOCK_RECORDS,
        });
    }
    if header.flags & FLAG_OPEN != 0 {
        return Err(PointIndexError::Unclean {
            path: path.to_path_buf(),
        });
    }
    let expected = header.expected_len().unwrap_or(u64::MAX);
    if expected != length {
        return Err(PointIndexError::Truncated {
            path: path.to_path_buf(),
            expected,
            found: length,
        });
    }

    let directory_offset = header.directory_offset().unwrap_or(u64::MAX);
    let mut raw_directory = Vec::new();
    file.seek(SeekFrom::Start(directory_offset))
        .and_then(|_| {
            (&mut *file)
                .take(header.block_count * DIRECTORY_ENTRY_LEN)
                .read_to_end(&mut raw_directory)
        })
        .map_err(|source| io_error(path, source))?;
    let mut directory = BTreeMap::new();
    for (slot, entry) in (0_u64..).zip(raw_directory.chunks_exact(8)) {
        let block = read_u64(entry, 0);
        if directory.insert(block, slot).is_some() {
            return Err(PointIndexError::DuplicateBlock {
                path: path.to_path_buf(),
                block,
            });
        }
    }

    let mut overflow = BTreeMap::new();
    if header.overflow_len > 0 {
        let mut blob = Vec::new();
        file.take(header.overflow_len)
            .read_to_end(&mut blob)
            .map_err(|source| io_error(path, source))?;
        let section: OverflowSection =
            bincode::deserialize(&blob).map_err(|source| PointIndexError::Decode {
                path: path.to_path_buf(),
                source,
            })?;
        for (id, [x, y]) in section.entries {
            overflow.insert(id, Coord { x, y });
        }
    }
    Ok(Existing {
        header,
        directory,
        overflow,
    })
}

fn io_error(path: &Path, source: std::io::Error) -> PointIndexError {
    PointIndexError::Io {
        path: path.to_path_buf(),
        source,
    }
}
