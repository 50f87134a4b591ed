//! File-backed trace source
//!
//! A trace file is a sequence of framed records, appended in timestamp
//! order and never rewritten.
//!
//! Format per record:
//! - length: u32 (4 bytes)
//! - data: [u8; length] (bincode-serialized TraceRecord)
//! - crc: u32 (4 bytes, CRC32 of length + data)
//!
//! The location of a record is its byte offset in the file. A record cut
//! short at the end of the file (the trace is still being written) reads
//! as end of data; a complete record with a bad CRC is a source error.

use crate::error::{IndexError, IndexResult};
use crate::trace::{Rank, Timestamp, TraceEvent, TraceReader, TraceSignature, TraceSource};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Maximum serialized size of a single record
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Framing overhead per record: length (4) + crc (4)
const FRAME_OVERHEAD: u64 = 8;

/// A single event stored in a trace file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Event timestamp
    pub timestamp: Timestamp,
    /// Opaque event body
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl TraceRecord {
    pub fn new(timestamp: Timestamp, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }
}

impl TraceEvent for TraceRecord {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Outcome of reading one frame
enum Frame {
    Record(TraceRecord, u64),
    /// Clean end of file or a torn trailing record
    End,
}

/// Read one frame; `rank` is only used for error reporting
fn read_frame<R: Read>(reader: &mut R, rank: Rank) -> IndexResult<Frame> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(Frame::End),
        Err(e) => return Err(IndexError::source_read(rank, e.to_string())),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_RECORD_LEN {
        return Err(IndexError::source_read(
            rank,
            format!("record length too large: {}", len),
        ));
    }

    let mut data = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    for buf in [&mut data[..], &mut crc_buf[..]] {
        match reader.read_exact(buf) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(Frame::End),
            Err(e) => return Err(IndexError::source_read(rank, e.to_string())),
        }
    }
    let stored_crc = u32::from_le_bytes(crc_buf);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len_buf);
    hasher.update(&data);
    let computed_crc = hasher.finalize();

    if stored_crc != computed_crc {
        return Err(IndexError::source_read(
            rank,
            format!(
                "CRC mismatch: stored={}, computed={}",
                stored_crc, computed_crc
            ),
        ));
    }

    let record: TraceRecord = bincode::deserialize(&data)
        .map_err(|e| IndexError::source_read(rank, format!("undecodable record: {}", e)))?;

    Ok(Frame::Record(record, FRAME_OVERHEAD + len as u64))
}

/// A trace stored in a single file
#[derive(Debug, Clone)]
pub struct FileTrace {
    path: PathBuf,
}

impl FileTrace {
    /// Open an existing trace file
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(IndexError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("trace file not found: {}", path.display()),
            )));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSource for FileTrace {
    type Event = TraceRecord;
    type Location = u64;
    type Reader = FileTraceReader;

    fn open(&self) -> IndexResult<FileTraceReader> {
        self.open_at(&0, 0)
    }

    fn open_at(&self, location: &u64, rank: Rank) -> IndexResult<FileTraceReader> {
        let file = File::open(&self.path).map_err(|e| IndexError::source_read(rank, e.to_string()))?;
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(*location))
            .map_err(|e| IndexError::source_read(rank, e.to_string()))?;

        Ok(FileTraceReader {
            reader,
            offset: *location,
            rank,
        })
    }

    fn signature(&self) -> IndexResult<Option<TraceSignature>> {
        Ok(Some(TraceSignature::of_file(&self.path)?))
    }
}

/// Sequential reader over a [`FileTrace`]
pub struct FileTraceReader {
    reader: BufReader<File>,
    offset: u64,
    rank: Rank,
}

impl TraceReader for FileTraceReader {
    type Event = TraceRecord;
    type Location = u64;

    fn location(&self) -> u64 {
        self.offset
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn next_event(&mut self) -> IndexResult<Option<TraceRecord>> {
        match read_frame(&mut self.reader, self.rank)? {
            Frame::Record(record, frame_len) => {
                self.offset += frame_len;
                self.rank += 1;
                Ok(Some(record))
            }
            Frame::End => {
                // Rewind past any torn bytes so a growing file can be re-read
                self.reader
                    .seek(SeekFrom::Start(self.offset))
                    .map_err(|e| IndexError::source_read(self.rank, e.to_string()))?;
                Ok(None)
            }
        }
    }
}

/// Appends records to a trace file
pub struct TraceWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    record_count: u64,
    last_timestamp: Option<Timestamp>,
}

impl TraceWriter {
    /// Open or create a trace file for appending
    ///
    /// Existing records are scanned to recover the count and the last
    /// timestamp; a torn trailing record is cut off.
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let (valid_len, record_count, last_timestamp) = Self::scan(&mut file)?;
        if valid_len < file.metadata()?.len() {
            tracing::warn!(
                "Trimming torn record at offset {} in {:?}",
                valid_len,
                path
            );
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            record_count,
            last_timestamp,
        })
    }

    fn scan(file: &mut File) -> IndexResult<(u64, u64, Option<Timestamp>)> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut *file);
        let mut offset = 0u64;
        let mut count = 0u64;
        let mut last = None;

        while let Frame::Record(record, frame_len) = read_frame(&mut reader, count)? {
            offset += frame_len;
            count += 1;
            last = Some(record.timestamp);
        }

        Ok((offset, count, last))
    }

    /// Append a record; timestamps must never go backwards
    pub fn append(&mut self, record: &TraceRecord) -> IndexResult<()> {
        if let Some(last) = self.last_timestamp {
            if record.timestamp < last {
                return Err(IndexError::NonMonotonic(format!(
                    "timestamp {} precedes previous timestamp {}",
                    record.timestamp, last
                )));
            }
        }

        let data = bincode::serialize(record)?;
        if data.len() > MAX_RECORD_LEN {
            return Err(IndexError::Serialization(format!(
                "record too large: {} bytes",
                data.len()
            )));
        }

        let len_bytes = (data.len() as u32).to_le_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_bytes);
        hasher.update(&data);
        let crc = hasher.finalize();

        self.writer.write_all(&len_bytes)?;
        self.writer.write_all(&data)?;
        self.writer.write_all(&crc.to_le_bytes())?;

        self.record_count += 1;
        self.last_timestamp = Some(record.timestamp);
        Ok(())
    }

    /// Flush buffered records and fsync
    pub fn sync(&mut self) -> IndexResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.last_timestamp
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("Failed to flush trace writer for {:?}: {}", self.path, e);
        }
    }
}

/// Import `timestamp[,payload]` CSV rows into a trace file
///
/// Returns the number of records appended.
pub fn import_csv(csv_path: &Path, trace_path: &Path, has_headers: bool) -> IndexResult<u64> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .from_path(csv_path)
        .map_err(|e| IndexError::Serialization(format!("Failed to open CSV: {}", e)))?;

    let mut writer = TraceWriter::open(trace_path)?;
    let mut imported = 0u64;

    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|e| IndexError::Serialization(format!("CSV row {}: {}", line, e)))?;

        let timestamp: Timestamp = row
            .get(0)
            .map(str::trim)
            .ok_or_else(|| IndexError::Serialization(format!("CSV row {}: empty row", line)))?
            .parse()
            .map_err(|e| IndexError::Serialization(format!("CSV row {}: bad timestamp: {}", line, e)))?;
        let payload = row.get(1).unwrap_or("").as_bytes().to_vec();

        writer.append(&TraceRecord::new(timestamp, payload))?;
        imported += 1;
    }

    writer.sync()?;
    tracing::info!("Imported {} records into {:?}", imported, trace_path);
    Ok(imported)
}
