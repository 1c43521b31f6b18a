//! On-disk segment format: header, framed records, sealing trailer.
//!
//! ```text
//!   ┌────────────────────────────────────────────────┐
//!   │ header (32 bytes)                              │
//!   │   magic u32 BE │ version u32 BE                │
//!   │   token_hash u64 BE │ created_unix_ms u64 BE   │
//!   │   reserved u64 BE                              │
//!   ├────────────────────────────────────────────────┤
//!   │ frame: len u32 BE │ crc32c u32 BE │ payload    │
//!   │ frame: ...                                     │
//!   ├────────────────────────────────────────────────┤
//!   │ trailer (on seal): len=0, crc=0xFFFFFFFF       │
//!   └────────────────────────────────────────────────┘
//! ```
//!
//! A reader stops cleanly at the trailer, at end of file, at a torn tail
//! (fewer bytes than the frame length promises), and at the first CRC
//! mismatch. No partial record is ever surfaced.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;

pub const SEGMENT_MAGIC: u32 = 0x4C47_5354;
pub const SEGMENT_VERSION: u32 = 1;
pub const HEADER_LEN: u64 = 32;
pub const FRAME_OVERHEAD: u64 = 8;
pub const TRAILER_CRC: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("segment shorter than its header")]
    TruncatedHeader,
    #[error("bad segment magic")]
    BadMagic,
    #[error("unsupported segment version {0}")]
    BadVersion(u32),
    #[error("segment belongs to a different token")]
    TokenMismatch,
}

pub fn segment_file_name(seq: u64) -> String {
    format!("segment_{seq:010}.wal")
}

/// Parse `segment_0000000042.wal` -> 42.
pub fn parse_segment_seq(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("segment_")?
        .strip_suffix(".wal")?
        .parse()
        .ok()
}

/// Total bytes one payload occupies on disk.
pub fn frame_len(payload_len: usize) -> u64 {
    FRAME_OVERHEAD + payload_len as u64
}

fn encode_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32c::crc32c(payload).to_be_bytes());
    buf.extend_from_slice(payload);
}

/// Parsed 32-byte segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub token_hash: u64,
    pub created_unix_ms: u64,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&SEGMENT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.token_hash.to_be_bytes());
        buf[16..24].copy_from_slice(&self.created_unix_ms.to_be_bytes());
        // bytes 24..32 reserved
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN as usize]) -> Result<Self, SegmentError> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().expect("slice is 4 bytes"));
        if magic != SEGMENT_MAGIC {
            return Err(SegmentError::BadMagic);
        }
        let version = u32::from_be_bytes(buf[4..8].try_into().expect("slice is 4 bytes"));
        if version != SEGMENT_VERSION {
            return Err(SegmentError::BadVersion(version));
        }
        Ok(Self {
            token_hash: u64::from_be_bytes(buf[8..16].try_into().expect("slice is 8 bytes")),
            created_unix_ms: u64::from_be_bytes(buf[16..24].try_into().expect("slice is 8 bytes")),
        })
    }
}

/// A sealed segment as the writer leaves it behind.
#[derive(Debug, Clone)]
pub struct SealedFile {
    pub seq: u64,
    pub path: PathBuf,
    pub bytes: u64,
    pub created_unix_ms: u64,
}

/// Append-only writer for the active segment of one tenant.
///
/// The caller serializes access; the writer just guarantees that a
/// successful [`append`](Self::append) means the frames and the new tail
/// reached stable storage.
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    pub seq: u64,
    pub bytes: u64,
    pub records: u64,
    pub created_unix_ms: u64,
    created: Instant,
    last_write: Instant,
}

impl SegmentWriter {
    pub fn create(
        dir: &Path,
        seq: u64,
        token_hash: u64,
        created_unix_ms: u64,
    ) -> io::Result<Self> {
        let path = dir.join(segment_file_name(seq));
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let header = SegmentHeader {
            token_hash,
            created_unix_ms,
        };
        file.write_all(&header.encode())?;
        file.sync_all()?;
        let now = Instant::now();
        Ok(Self {
            file,
            path,
            seq,
            bytes: HEADER_LEN,
            records: 0,
            created_unix_ms,
            created: now,
            last_write: now,
        })
    }

    /// Append payloads as frames and fsync. Returns the byte offset of the
    /// first appended frame. The in-memory tail advances only after the
    /// fsync succeeds, so a crash mid-call leaves at most a torn tail.
    pub fn append(&mut self, payloads: &[Vec<u8>]) -> io::Result<u64> {
        let first_offset = self.bytes;
        let total: usize = payloads
            .iter()
            .map(|p| FRAME_OVERHEAD as usize + p.len())
            .sum();
        let mut buf = Vec::with_capacity(total);
        for payload in payloads {
            encode_frame(&mut buf, payload);
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        self.bytes += buf.len() as u64;
        self.records += payloads.len() as u64;
        self.last_write = Instant::now();
        Ok(first_offset)
    }

    /// Write the trailer frame, fsync, and close the segment.
    pub fn seal(mut self) -> io::Result<SealedFile> {
        let mut trailer = [0u8; FRAME_OVERHEAD as usize];
        trailer[4..8].copy_from_slice(&TRAILER_CRC.to_be_bytes());
        self.file.write_all(&trailer)?;
        self.file.sync_data()?;
        Ok(SealedFile {
            seq: self.seq,
            path: self.path,
            bytes: self.bytes + FRAME_OVERHEAD,
            created_unix_ms: self.created_unix_ms,
        })
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_write.elapsed()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Frame-by-frame reader over a (usually sealed) segment.
pub struct SegmentReader {
    reader: BufReader<File>,
    pub header: SegmentHeader,
    offset: u64,
    len: u64,
}

impl SegmentReader {
    /// Open and validate the header. `expected_token_hash` of zero skips the
    /// ownership check (used during recovery, where the header is the only
    /// source of truth).
    pub fn open(path: &Path, expected_token_hash: u64) -> Result<Self, SegmentError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(SegmentError::TruncatedHeader);
        }
        let mut reader = BufReader::new(file);
        let mut buf = [0u8; HEADER_LEN as usize];
        reader.read_exact(&mut buf)?;
        let header = SegmentHeader::decode(&buf)?;
        if expected_token_hash != 0 && header.token_hash != expected_token_hash {
            return Err(SegmentError::TokenMismatch);
        }
        Ok(Self {
            reader,
            header,
            offset: HEADER_LEN,
            len,
        })
    }

    /// Next `(payload, frame_offset)`. Returns `None` at the trailer, at end
    /// of file, on a torn tail, and on the first CRC mismatch.
    pub fn next_frame(&mut self) -> Option<(Vec<u8>, u64)> {
        if self.offset + FRAME_OVERHEAD > self.len {
            return None;
        }
        let frame_offset = self.offset;
        let mut head = [0u8; FRAME_OVERHEAD as usize];
        if self.reader.read_exact(&mut head).is_err() {
            self.offset = self.len;
            return None;
        }
        let payload_len =
            u32::from_be_bytes(head[0..4].try_into().expect("slice is 4 bytes")) as u64;
        let stored_crc = u32::from_be_bytes(head[4..8].try_into().expect("slice is 4 bytes"));

        if payload_len == 0 {
            // Sealing trailer (or an empty frame); either way the stream ends.
            self.offset = self.len;
            return None;
        }
        if frame_offset + FRAME_OVERHEAD + payload_len > self.len {
            // Torn tail from a crash mid-append; not an error.
            self.offset = self.len;
            return None;
        }

        let mut payload = vec![0u8; payload_len as usize];
        if self.reader.read_exact(&mut payload).is_err() {
            self.offset = self.len;
            return None;
        }
        if crc32c::crc32c(&payload) != stored_crc {
            // Replay of this segment stops at the first bad frame.
            self.offset = self.len;
            return None;
        }
        self.offset = frame_offset + FRAME_OVERHEAD + payload_len;
        Some((payload, frame_offset))
    }

    /// Count of payload bytes scanned so far (including header).
    pub fn position(&self) -> u64 {
        self.offset
    }
}

/// Truncate helper for tests and quota math: file length on disk.
pub fn file_len(path: &Path) -> io::Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

/// Rewind support used by recovery checks: validate only the header.
pub fn read_header(path: &Path) -> Result<SegmentHeader, SegmentError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < HEADER_LEN {
        return Err(SegmentError::TruncatedHeader);
    }
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut buf)?;
    SegmentHeader::decode(&buf)
}
