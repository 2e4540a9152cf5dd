//! The crate `storage` defines the `LogStore` trait used by log units to
//! persist entries, an in-memory implementation and a segmented on-disk
//! implementation.
//!
//! The on-disk store keeps one file per `width` addresses, named
//! `<segment id>.log`. Each file is laid out as:
//!
//! ```text
//! +--------------------------------------------------------------+
//! | magic u32 | version u16 | epoch watermark u64 | width u64 | start i64 |
//! +--------------------------------------------------------------+
//! | index: width x u64 file positions, 0 means absent            |
//! +--------------------------------------------------------------+
//! | record: address i64 | length u32 | crc32 u32 | entry bytes    |
//! | ...                                                          |
//! +--------------------------------------------------------------+
//! ```
//!
//! All integers are big endian. The trim mark and the epoch are kept in the
//! separate files `TRIM_MARK` and `EPOCH`, updated by write-then-rename.

// Copyright 2021 The corfu Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::crc32;
use crc::Hasher32;
use log::{debug, info, trace, warn};

use crate::buffer::{BufferPool, SerializedForm};
use crate::constant::*;
use crate::datastore::write_file_atomically;
use crate::error::Error;
use crate::types::{Address, Epoch, LogData};

const HEADER_SIZE: u64 = 4 + 2 + 8 + 8 + 8;
const EPOCH_WATERMARK_OFFSET: u64 = 4 + 2;
const RECORD_HEADER_SIZE: u64 = 8 + 4 + 4;
const SEGMENT_SUFFIX: &'static str = ".log";
const TRIM_MARK_FILE: &'static str = "TRIM_MARK";
const EPOCH_FILE: &'static str = "EPOCH";

/// The result of placing an entry into a store.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Written,
    /// The address is occupied, the current entry is attached.
    Exists(LogData),
}

/// A sparse, write-once mapping from addresses to entries.
///
/// Implementations serialize the transitions of one address, and persist a
/// transition before returning.
pub trait LogStore: Send + Sync {
    /// Place `entry` at its global address unless the address is occupied.
    fn append(&self, entry: &LogData) -> Result<AppendOutcome, Error>;

    /// Read the entry at `address`, an `EMPTY` entry is returned if nothing
    /// was written there.
    fn read(&self, address: Address) -> Result<LogData, Error>;

    /// Trim a single address.
    fn trim(&self, address: Address) -> Result<(), Error>;

    /// Trim every address up to and including `address`.
    fn prefix_trim(&self, address: Address) -> Result<(), Error>;

    /// The first address which isn't covered by prefix trimming.
    fn trim_mark(&self) -> Address;

    /// The highest address holding an entry, `NON_ADDRESS` if none.
    fn global_tail(&self) -> Address;

    fn epoch(&self) -> Epoch;

    /// Persist the epoch of the log unit, the epoch never decreases.
    fn set_epoch(&self, epoch: Epoch) -> Result<(), Error>;
}

fn trimmed_error(address: Address, trim_mark: Address) -> Error {
    Error::Trimmed {
        address,
        earliest_readable: trim_mark,
    }
}

fn check_address(address: Address) -> Result<(), Error> {
    if is_address(address) {
        Ok(())
    } else {
        Err(Error::IllegalState(format!("invalid address {}", address)))
    }
}

#[derive(Debug, Default)]
struct MemState {
    entries: BTreeMap<Address, LogData>,
    trimmed: BTreeSet<Address>,
    trim_mark: Address,
    global_tail: Address,
    epoch: Epoch,
}

/// A `LogStore` which keeps everything in memory.
#[derive(Debug)]
pub struct MemLogStore {
    state: RwLock<MemState>,
}

impl MemLogStore {
    pub fn new() -> MemLogStore {
        MemLogStore {
            state: RwLock::new(MemState {
                global_tail: NON_ADDRESS,
                ..Default::default()
            }),
        }
    }
}

impl Default for MemLogStore {
    fn default() -> Self {
        MemLogStore::new()
    }
}

impl LogStore for MemLogStore {
    fn append(&self, entry: &LogData) -> Result<AppendOutcome, Error> {
        let address = entry.global_address;
        check_address(address)?;
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if address < state.trim_mark || state.trimmed.contains(&address) {
            return Err(trimmed_error(address, state.trim_mark));
        }
        if let Some(existing) = state.entries.get(&address) {
            return Ok(AppendOutcome::Exists(existing.clone()));
        }
        state.entries.insert(address, entry.clone());
        state.global_tail = std::cmp::max(state.global_tail, address);
        Ok(AppendOutcome::Written)
    }

    fn read(&self, address: Address) -> Result<LogData, Error> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if address < state.trim_mark || state.trimmed.contains(&address) {
            return Ok(LogData::trimmed(address));
        }
        Ok(state
            .entries
            .get(&address)
            .cloned()
            .unwrap_or_else(|| LogData::empty(address)))
    }

    fn trim(&self, address: Address) -> Result<(), Error> {
        check_address(address)?;
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if address >= state.trim_mark {
            state.entries.remove(&address);
            state.trimmed.insert(address);
        }
        Ok(())
    }

    fn prefix_trim(&self, address: Address) -> Result<(), Error> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mark = address + 1;
        if mark <= state.trim_mark {
            return Ok(());
        }
        state.trim_mark = mark;
        state.entries = state.entries.split_off(&mark);
        state.trimmed = state.trimmed.split_off(&mark);
        state.global_tail = std::cmp::max(state.global_tail, address);
        Ok(())
    }

    fn trim_mark(&self) -> Address {
        self.state.read().unwrap_or_else(|e| e.into_inner()).trim_mark
    }

    fn global_tail(&self) -> Address {
        self.state.read().unwrap_or_else(|e| e.into_inner()).global_tail
    }

    fn epoch(&self) -> Epoch {
        self.state.read().unwrap_or_else(|e| e.into_inner()).epoch
    }

    fn set_epoch(&self, epoch: Epoch) -> Result<(), Error> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.epoch = std::cmp::max(state.epoch, epoch);
        Ok(())
    }
}

/// Options of the segmented on-disk store.
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    /// The number of addresses covered by each segment file.
    pub width: u64,

    /// Whether each transition is synced to disk before acknowledgement.
    /// Disabling it is only meaningful in tests.
    pub sync: bool,

    /// The capacity of serialization buffers kept for reuse.
    pub max_pool_bytes: usize,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        SegmentOptions {
            width: DEFAULT_SEGMENT_WIDTH,
            sync: true,
            max_pool_bytes: 16 * 1024 * 1024,
        }
    }
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut digest = crc32::Digest::new(crc32::IEEE);
    digest.write(bytes);
    digest.sum32()
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}{}", id, SEGMENT_SUFFIX))
}

struct Segment {
    id: u64,
    start: Address,
    width: u64,
    path: PathBuf,
    file: File,
    /// The file position of the latest record of each address.
    index: Vec<u64>,
    write_pos: u64,
    epoch_watermark: Epoch,
    /// Set once the file is removed below the trim mark.
    reclaimed: bool,
}

impl Segment {
    fn data_offset(width: u64) -> u64 {
        HEADER_SIZE + width * 8
    }

    fn create(dir: &Path, id: u64, width: u64, epoch: Epoch, sync: bool) -> Result<Segment, Error> {
        let path = segment_path(dir, id);
        let start = (id * width) as Address;
        let mut header = Vec::with_capacity(Segment::data_offset(width) as usize);
        header.write_u32::<BigEndian>(SEGMENT_MAGIC)?;
        header.write_u16::<BigEndian>(SEGMENT_FORMAT_VERSION)?;
        header.write_u64::<BigEndian>(epoch)?;
        header.write_u64::<BigEndian>(width)?;
        header.write_i64::<BigEndian>(start)?;
        header.resize(Segment::data_offset(width) as usize, 0);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&header)?;
        if sync {
            file.sync_all()?;
        }
        debug!("create segment {} at {:?}", id, path);
        Ok(Segment {
            id,
            start,
            width,
            path,
            file,
            index: vec![0; width as usize],
            write_pos: Segment::data_offset(width),
            epoch_watermark: epoch,
            reclaimed: false,
        })
    }

    /// Open an existing segment, records after the last complete and
    /// well-formed one are discarded.
    fn open(path: PathBuf, id: u64, width: u64) -> Result<Segment, Error> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();
        let data_offset = Segment::data_offset(width);
        if file_size < data_offset {
            return Err(Error::Corrupted(format!(
                "segment {:?} is shorter than its header",
                path
            )));
        }

        let mut header = vec![0u8; data_offset as usize];
        file.read_exact(&mut header)?;
        let mut cursor = Cursor::new(header);
        let magic = cursor.read_u32::<BigEndian>()?;
        let version = cursor.read_u16::<BigEndian>()?;
        let epoch_watermark = cursor.read_u64::<BigEndian>()?;
        let file_width = cursor.read_u64::<BigEndian>()?;
        let start = cursor.read_i64::<BigEndian>()?;
        if magic != SEGMENT_MAGIC {
            return Err(Error::Corrupted(format!("segment {:?} has bad magic", path)));
        }
        if version != SEGMENT_FORMAT_VERSION {
            return Err(Error::Corrupted(format!(
                "segment {:?} has unsupported version {}",
                path, version
            )));
        }
        if file_width != width || start != (id * width) as Address {
            return Err(Error::Corrupted(format!(
                "segment {:?} covers [{}, +{}), expect [{}, +{})",
                path,
                start,
                file_width,
                id * width,
                width
            )));
        }
        let mut disk_index = Vec::with_capacity(width as usize);
        for _ in 0..width {
            disk_index.push(cursor.read_u64::<BigEndian>()?);
        }

        let mut segment = Segment {
            id,
            start,
            width,
            path,
            file,
            index: vec![0; width as usize],
            write_pos: data_offset,
            epoch_watermark,
            reclaimed: false,
        };
        segment.replay(file_size)?;

        for (offset, pos) in segment.index.clone().into_iter().enumerate() {
            if disk_index[offset] != pos {
                segment.write_index_slot(offset as u64, pos)?;
            }
        }
        segment.file.sync_all()?;
        Ok(segment)
    }

    fn replay(&mut self, file_size: u64) -> Result<(), Error> {
        let mut pos = Segment::data_offset(self.width);
        self.file.seek(SeekFrom::Start(pos))?;
        let mut reader = BufReader::new(&self.file);
        let mut num_records = 0;
        let mut torn = false;
        while pos < file_size {
            match Segment::read_record_from(&mut reader, self.start, self.width, file_size - pos) {
                Ok((address, len)) => {
                    self.index[(address - self.start) as usize] = pos;
                    pos += RECORD_HEADER_SIZE + len as u64;
                    num_records += 1;
                }
                Err(e) => {
                    warn!(
                        "segment {} discard records from position {}: {}",
                        self.id, pos, e
                    );
                    torn = true;
                    break;
                }
            }
        }
        drop(reader);
        if torn {
            self.file.set_len(pos)?;
        }
        self.write_pos = pos;
        info!(
            "segment {} replay {} records, write position {}",
            self.id, num_records, pos
        );
        Ok(())
    }

    /// Read and verify one record, returns its address and length.
    fn read_record_from<R: Read>(
        reader: &mut R,
        start: Address,
        width: u64,
        remaining: u64,
    ) -> Result<(Address, u32), Error> {
        let address = reader.read_i64::<BigEndian>()?;
        let len = reader.read_u32::<BigEndian>()?;
        let crc = reader.read_u32::<BigEndian>()?;
        if address < start || address >= start + width as Address {
            return Err(Error::Corrupted(format!(
                "record address {} out of segment",
                address
            )));
        }
        if RECORD_HEADER_SIZE + len as u64 > remaining {
            return Err(Error::Corrupted(format!(
                "record of address {} is incomplete",
                address
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        reader.read_exact(&mut bytes)?;
        if checksum(&bytes) != crc {
            return Err(Error::Corrupted(format!(
                "record of address {} checksum mismatch",
                address
            )));
        }
        Ok((address, len))
    }

    fn write_index_slot(&mut self, offset: u64, pos: u64) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(HEADER_SIZE + offset * 8))?;
        self.file.write_u64::<BigEndian>(pos)?;
        Ok(())
    }

    fn offset_of(&self, address: Address) -> usize {
        (address - self.start) as usize
    }

    fn read(&mut self, address: Address) -> Result<Option<LogData>, Error> {
        let pos = self.index[self.offset_of(address)];
        if pos == 0 {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(pos))?;
        let record_address = self.file.read_i64::<BigEndian>()?;
        let len = self.file.read_u32::<BigEndian>()?;
        let crc = self.file.read_u32::<BigEndian>()?;
        let mut bytes = vec![0u8; len as usize];
        self.file.read_exact(&mut bytes)?;
        if record_address != address || checksum(&bytes) != crc {
            return Err(Error::Corrupted(format!(
                "segment {} record of address {} is damaged",
                self.id, address
            )));
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn append(&mut self, address: Address, epoch: Epoch, bytes: &[u8], sync: bool) -> Result<(), Error> {
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE as usize + bytes.len());
        record.write_i64::<BigEndian>(address)?;
        record.write_u32::<BigEndian>(bytes.len() as u32)?;
        record.write_u32::<BigEndian>(checksum(bytes))?;
        record.extend_from_slice(bytes);

        let pos = self.write_pos;
        self.file.seek(SeekFrom::Start(pos))?;
        if let Err(e) = self.file.write_all(&record) {
            // Leave no partial record behind the write position.
            let _ = self.file.set_len(pos);
            return Err(e.into());
        }
        if sync {
            self.file.sync_data()?;
        }
        self.write_pos = pos + record.len() as u64;

        let offset = self.offset_of(address);
        self.write_index_slot(offset as u64, pos)?;
        if epoch > self.epoch_watermark {
            self.file.seek(SeekFrom::Start(EPOCH_WATERMARK_OFFSET))?;
            self.file.write_u64::<BigEndian>(epoch)?;
            self.epoch_watermark = epoch;
        }
        if sync {
            self.file.sync_data()?;
        }
        self.index[offset] = pos;
        Ok(())
    }

    /// The highest address holding a record other than a trim marker.
    fn tail(&mut self) -> Result<Address, Error> {
        for offset in (0..self.width as usize).rev() {
            if self.index[offset] == 0 {
                continue;
            }
            let address = self.start + offset as Address;
            if let Some(entry) = self.read(address)? {
                if !entry.is_trimmed() {
                    return Ok(address);
                }
            }
        }
        Ok(NON_ADDRESS)
    }
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    epoch: Epoch,
    trim_mark: Address,
}

/// A `LogStore` keeping entries in fixed width segment files.
pub struct SegmentedLogStore {
    dir: PathBuf,
    opts: SegmentOptions,
    pool: BufferPool,
    segments: RwLock<HashMap<u64, Arc<Mutex<Segment>>>>,
    meta: Mutex<Meta>,
    global_tail: AtomicI64,
}

impl SegmentedLogStore {
    /// Open the store under `dir`, creating it if it doesn't exist.
    pub fn open<P: AsRef<Path>>(dir: P, opts: SegmentOptions) -> Result<SegmentedLogStore, Error> {
        let dir = dir.as_ref().to_path_buf();
        if opts.width == 0 {
            return Err(Error::IllegalState(String::from("segment width is zero")));
        }
        std::fs::create_dir_all(&dir)?;

        let epoch = read_u64_file(&dir.join(EPOCH_FILE))?.unwrap_or(INITIAL_EPOCH);
        let trim_mark = read_u64_file(&dir.join(TRIM_MARK_FILE))?
            .map(|v| v as Address)
            .unwrap_or(FIRST_ADDRESS);

        let mut segments = HashMap::new();
        let mut global_tail = NON_ADDRESS;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let id = match name
                .to_str()
                .and_then(|n| n.strip_suffix(SEGMENT_SUFFIX))
                .and_then(|n| n.parse::<u64>().ok())
            {
                Some(id) => id,
                None => continue,
            };
            if ((id + 1) * opts.width) as Address <= trim_mark {
                info!("remove segment {} which is below trim mark {}", id, trim_mark);
                std::fs::remove_file(entry.path())?;
                continue;
            }
            let mut segment = Segment::open(entry.path(), id, opts.width)?;
            global_tail = std::cmp::max(global_tail, segment.tail()?);
            segments.insert(id, Arc::new(Mutex::new(segment)));
        }
        global_tail = std::cmp::max(global_tail, trim_mark - 1);

        info!(
            "open log store {:?} with {} segments, epoch {}, trim mark {}, global tail {}",
            dir,
            segments.len(),
            epoch,
            trim_mark,
            global_tail
        );
        Ok(SegmentedLogStore {
            dir,
            pool: BufferPool::new(opts.max_pool_bytes),
            opts,
            segments: RwLock::new(segments),
            meta: Mutex::new(Meta { epoch, trim_mark }),
            global_tail: AtomicI64::new(global_tail),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn num_segments(&self) -> usize {
        self.segments.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn meta(&self) -> Meta {
        *self.meta.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn segment_of(&self, address: Address) -> Option<Arc<Mutex<Segment>>> {
        let id = address as u64 / self.opts.width;
        let segments = self.segments.read().unwrap_or_else(|e| e.into_inner());
        segments.get(&id).cloned()
    }

    /// Returns the segment `address` is written to, creating it if needed.
    /// The trim mark is checked under the lock of `segments`, which is also
    /// held while the trim mark advances, so no segment is created below it.
    fn writable_segment(&self, address: Address) -> Result<Arc<Mutex<Segment>>, Error> {
        let id = address as u64 / self.opts.width;
        {
            let segments = self.segments.read().unwrap_or_else(|e| e.into_inner());
            let trim_mark = self.meta().trim_mark;
            if address < trim_mark {
                return Err(trimmed_error(address, trim_mark));
            }
            if let Some(segment) = segments.get(&id) {
                return Ok(segment.clone());
            }
        }
        let mut segments = self.segments.write().unwrap_or_else(|e| e.into_inner());
        let meta = self.meta();
        if address < meta.trim_mark {
            return Err(trimmed_error(address, meta.trim_mark));
        }
        if let Some(segment) = segments.get(&id) {
            return Ok(segment.clone());
        }
        let segment = Segment::create(&self.dir, id, self.opts.width, meta.epoch, self.opts.sync)?;
        let segment = Arc::new(Mutex::new(segment));
        segments.insert(id, segment.clone());
        Ok(segment)
    }

    fn write_record(&self, segment: &mut Segment, entry: &LogData) -> Result<(), Error> {
        let form = SerializedForm::serialize(&self.pool, entry)?;
        let handle = form.acquire()?;
        let bytes = handle.bytes();
        segment.append(entry.global_address, entry.epoch, &bytes, self.opts.sync)
    }

    /// Remove segment files which lie wholly below the trim mark.
    fn reclaim(
        &self,
        segments: &mut HashMap<u64, Arc<Mutex<Segment>>>,
        trim_mark: Address,
    ) -> Result<(), Error> {
        let width = self.opts.width;
        let reclaimable: Vec<u64> = segments
            .keys()
            .filter(|id| ((*id + 1) * width) as Address <= trim_mark)
            .cloned()
            .collect();
        for id in reclaimable {
            if let Some(segment) = segments.remove(&id) {
                let mut segment = segment.lock().unwrap_or_else(|e| e.into_inner());
                segment.reclaimed = true;
                info!("reclaim segment {} at {:?}", id, segment.path);
                match std::fs::remove_file(&segment.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

impl LogStore for SegmentedLogStore {
    fn append(&self, entry: &LogData) -> Result<AppendOutcome, Error> {
        let address = entry.global_address;
        check_address(address)?;
        let segment = self.writable_segment(address)?;
        let mut segment = segment.lock().unwrap_or_else(|e| e.into_inner());
        if segment.reclaimed {
            return Err(trimmed_error(address, self.meta().trim_mark));
        }
        if let Some(existing) = segment.read(address)? {
            if existing.is_trimmed() {
                return Err(trimmed_error(address, self.meta().trim_mark));
            }
            return Ok(AppendOutcome::Exists(existing));
        }
        self.write_record(&mut segment, entry)?;
        self.global_tail.fetch_max(address, Ordering::AcqRel);
        trace!("store write {:?}", entry);
        Ok(AppendOutcome::Written)
    }

    fn read(&self, address: Address) -> Result<LogData, Error> {
        check_address(address)?;
        if address < self.meta().trim_mark {
            return Ok(LogData::trimmed(address));
        }
        let segment = match self.segment_of(address) {
            Some(segment) => segment,
            None => return Ok(LogData::empty(address)),
        };
        let mut segment = segment.lock().unwrap_or_else(|e| e.into_inner());
        if segment.reclaimed {
            return Ok(LogData::trimmed(address));
        }
        Ok(segment
            .read(address)?
            .unwrap_or_else(|| LogData::empty(address)))
    }

    fn trim(&self, address: Address) -> Result<(), Error> {
        check_address(address)?;
        let segment = match self.writable_segment(address) {
            Ok(segment) => segment,
            Err(Error::Trimmed { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut segment = segment.lock().unwrap_or_else(|e| e.into_inner());
        if segment.reclaimed {
            return Ok(());
        }
        if let Some(existing) = segment.read(address)? {
            if existing.is_trimmed() {
                return Ok(());
            }
        }
        debug!("store trim address {}", address);
        self.write_record(&mut segment, &LogData::trimmed(address))
    }

    fn prefix_trim(&self, address: Address) -> Result<(), Error> {
        let mark = address + 1;
        let mut segments = self.segments.write().unwrap_or_else(|e| e.into_inner());
        {
            let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
            if mark <= meta.trim_mark {
                return Ok(());
            }
            write_u64_file(&self.dir, TRIM_MARK_FILE, mark as u64, self.opts.sync)?;
            meta.trim_mark = mark;
        }
        info!("store {:?} advance trim mark to {}", self.dir, mark);
        self.global_tail.fetch_max(address, Ordering::AcqRel);
        self.reclaim(&mut segments, mark)
    }

    fn trim_mark(&self) -> Address {
        self.meta().trim_mark
    }

    fn global_tail(&self) -> Address {
        self.global_tail.load(Ordering::Acquire)
    }

    fn epoch(&self) -> Epoch {
        self.meta().epoch
    }

    fn set_epoch(&self, epoch: Epoch) -> Result<(), Error> {
        let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        if epoch <= meta.epoch {
            return Ok(());
        }
        write_u64_file(&self.dir, EPOCH_FILE, epoch, self.opts.sync)?;
        meta.epoch = epoch;
        Ok(())
    }
}

fn read_u64_file(path: &Path) -> Result<Option<u64>, Error> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = file.read_u64::<BigEndian>()?;
    let crc = file.read_u32::<BigEndian>()?;
    if checksum(&value.to_be_bytes()) != crc {
        return Err(Error::Corrupted(format!("{:?} checksum mismatch", path)));
    }
    Ok(Some(value))
}

fn write_u64_file(dir: &Path, name: &str, value: u64, sync: bool) -> Result<(), Error> {
    let mut content = Vec::with_capacity(12);
    content.write_u64::<BigEndian>(value)?;
    content.write_u32::<BigEndian>(checksum(&value.to_be_bytes()))?;
    write_file_atomically(dir, name, &content, sync)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::types::{Payload, Token};

    fn test_options() -> SegmentOptions {
        SegmentOptions {
            width: 8,
            sync: false,
            max_pool_bytes: 1 << 20,
        }
    }

    fn data_at(address: Address, value: &str) -> LogData {
        let mut streams = BTreeSet::new();
        streams.insert(Uuid::from_u128(1));
        let mut entry = LogData::data(Payload::new("raw", value.as_bytes().to_vec()), streams);
        entry.use_token(&Token {
            address,
            epoch: 0,
            backpointers: Default::default(),
        });
        entry
    }

    fn check_write_once<S: LogStore>(store: &S) {
        assert_eq!(store.read(0).unwrap().is_empty(), true);
        assert_eq!(store.global_tail(), NON_ADDRESS);

        let entry = data_at(0, "x");
        assert_eq!(matches!(store.append(&entry).unwrap(), AppendOutcome::Written), true);
        assert_eq!(store.read(0).unwrap(), entry);
        match store.append(&data_at(0, "y")).unwrap() {
            AppendOutcome::Exists(existing) => assert_eq!(existing, entry),
            _ => panic!("address 0 is written"),
        }

        store.append(&LogData::hole(3, 0)).unwrap();
        assert_eq!(store.read(3).unwrap().is_hole(), true);
        assert_eq!(store.global_tail(), 3);
        assert_eq!(store.append(&LogData::hole(-1, 0)).is_err(), true);
    }

    fn check_trim<S: LogStore>(store: &S) {
        for address in 0..20 {
            store.append(&data_at(address, "v")).unwrap();
        }
        store.trim(15).unwrap();
        assert_eq!(store.read(15).unwrap().is_trimmed(), true);
        assert_eq!(
            matches!(store.append(&data_at(15, "v")), Err(Error::Trimmed { .. })),
            true
        );

        store.prefix_trim(10).unwrap();
        assert_eq!(store.trim_mark(), 11);
        assert_eq!(store.read(5).unwrap().is_trimmed(), true);
        assert_eq!(store.read(11).unwrap().is_data(), true);
        match store.append(&data_at(3, "v")) {
            Err(Error::Trimmed {
                earliest_readable, ..
            }) => assert_eq!(earliest_readable, 11),
            _ => panic!("address 3 is trimmed"),
        }

        // out of order prefix trims are idempotent by max.
        store.prefix_trim(4).unwrap();
        assert_eq!(store.trim_mark(), 11);
        assert_eq!(store.global_tail(), 19);
    }

    #[test]
    fn mem_store_write_once() {
        check_write_once(&MemLogStore::new());
    }

    #[test]
    fn mem_store_trim() {
        check_trim(&MemLogStore::new());
    }

    #[test]
    fn segmented_store_write_once() {
        let dir = TempDir::new().unwrap();
        let store = SegmentedLogStore::open(dir.path(), test_options()).unwrap();
        check_write_once(&store);
    }

    #[test]
    fn segmented_store_trim_and_reclaim() {
        let dir = TempDir::new().unwrap();
        let store = SegmentedLogStore::open(dir.path(), test_options()).unwrap();
        check_trim(&store);
        // segment [0, 8) is wholly below the trim mark 11.
        assert_eq!(store.num_segments(), 2);
        assert_eq!(segment_path(dir.path(), 0).exists(), false);
        assert_eq!(segment_path(dir.path(), 1).exists(), true);
    }

    #[test]
    fn segmented_store_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let store = SegmentedLogStore::open(dir.path(), test_options()).unwrap();
            for address in 0..12 {
                store.append(&data_at(address, "v")).unwrap();
            }
            store.append(&LogData::hole(12, 0)).unwrap();
            store.trim(11).unwrap();
            store.prefix_trim(2).unwrap();
            store.set_epoch(5).unwrap();
        }

        let store = SegmentedLogStore::open(dir.path(), test_options()).unwrap();
        assert_eq!(store.epoch(), 5);
        assert_eq!(store.trim_mark(), 3);
        assert_eq!(store.global_tail(), 12);
        assert_eq!(store.read(2).unwrap().is_trimmed(), true);
        assert_eq!(store.read(7).unwrap(), data_at(7, "v"));
        assert_eq!(store.read(11).unwrap().is_trimmed(), true);
        assert_eq!(store.read(12).unwrap().is_hole(), true);
        assert_eq!(store.read(13).unwrap().is_empty(), true);
        assert_eq!(
            matches!(store.append(&data_at(7, "w")).unwrap(), AppendOutcome::Exists(_)),
            true
        );
    }

    #[test]
    fn segmented_store_discards_torn_record() {
        let dir = TempDir::new().unwrap();
        {
            let store = SegmentedLogStore::open(dir.path(), test_options()).unwrap();
            store.append(&data_at(0, "a")).unwrap();
            store.append(&data_at(1, "b")).unwrap();
        }

        // Simulate a crash in the middle of a record.
        let path = segment_path(dir.path(), 0);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_i64::<BigEndian>(2).unwrap();
        file.write_u32::<BigEndian>(100).unwrap();
        file.write_u32::<BigEndian>(0).unwrap();
        file.write_all(b"partial").unwrap();
        drop(file);
        let torn_len = std::fs::metadata(&path).unwrap().len();

        let store = SegmentedLogStore::open(dir.path(), test_options()).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len() < torn_len, true);
        assert_eq!(store.read(1).unwrap(), data_at(1, "b"));
        assert_eq!(store.read(2).unwrap().is_empty(), true);
        assert_eq!(store.global_tail(), 1);
        store.append(&data_at(2, "c")).unwrap();
        assert_eq!(store.read(2).unwrap(), data_at(2, "c"));
    }

    #[test]
    fn segmented_store_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        {
            let store = SegmentedLogStore::open(dir.path(), test_options()).unwrap();
            store.append(&data_at(0, "a")).unwrap();
        }
        let path = segment_path(dir.path(), 0);
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_u32::<BigEndian>(0xdead_beef).unwrap();
        drop(file);
        assert_eq!(
            matches!(
                SegmentedLogStore::open(dir.path(), test_options()),
                Err(Error::Corrupted(_))
            ),
            true
        );
    }

    #[test]
    fn append_races_prefix_trim() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SegmentedLogStore::open(dir.path(), test_options()).unwrap());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                (0..64)
                    .map(|address| match store.append(&data_at(address, "v")) {
                        Ok(AppendOutcome::Written) => true,
                        Err(Error::Trimmed { .. }) => false,
                        Ok(AppendOutcome::Exists(_)) => panic!("address {} exists", address),
                        Err(e) => panic!("append {}: {}", address, e),
                    })
                    .collect::<Vec<bool>>()
            })
        };
        for address in (0..40).step_by(8) {
            store.prefix_trim(address).unwrap();
        }
        let written = writer.join().unwrap();

        let trim_mark = store.trim_mark();
        assert_eq!(trim_mark, 33);
        for (address, ok) in written.into_iter().enumerate() {
            let address = address as Address;
            if address >= trim_mark {
                assert_eq!(ok, true);
                assert_eq!(store.read(address).unwrap().is_data(), true);
            } else {
                assert_eq!(store.read(address).unwrap().is_trimmed(), true);
            }
        }
        // no segment below the trim mark is left behind.
        for id in 0..4 {
            assert_eq!(segment_path(dir.path(), id).exists(), false);
        }
        assert_eq!(store.num_segments(), 4);
    }

    #[test]
    fn racing_writers_only_one_wins() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SegmentedLogStore::open(dir.path(), test_options()).unwrap());
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let entry = data_at(4, &format!("writer {}", i));
                    match store.append(&entry).unwrap() {
                        AppendOutcome::Written => Some(entry),
                        AppendOutcome::Exists(_) => None,
                    }
                })
            })
            .collect();
        let winners: Vec<LogData> = workers
            .into_iter()
            .filter_map(|w| w.join().unwrap())
            .collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(store.read(4).unwrap(), winners[0]);
    }
}
