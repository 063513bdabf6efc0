//! Append-only, CRC-framed log file
//!
//! ```text
//! [magic:4][version:4][base_sequence:8]      file header
//! [len:4][crc32:4][payload:len]              one frame per record
//! ```
//!
//! Replay stops at the first torn or corrupt frame and truncates the file
//! there, so a crash in the middle of an append only loses that append.

use crate::{Error, Result};
use crc32fast::Hasher;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub const LOG_MAGIC: u32 = 0x4c41_5743; // CWAL
const FORMAT_VERSION: u32 = 1;
const FILE_HEADER_LEN: u64 = 16;
const FRAME_HEADER_LEN: usize = 8;

/// A typed append-only log on disk
pub struct LogFile<T> {
    path: PathBuf,
    file: File,
    base: u64,
    sync_on_append: bool,
    max_record_bytes: usize,
    #[cfg(test)]
    fail_next: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> LogFile<T> {
    /// Open (or create) a log and return every intact record in it
    pub fn open(
        path: impl AsRef<Path>,
        sync_on_append: bool,
        max_record_bytes: usize,
    ) -> Result<(Self, Vec<T>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let (base, records) = if len < FILE_HEADER_LEN {
            // New file, or a crash before the header reached disk
            file.set_len(0)?;
            file.write_all(&header_bytes(0))?;
            file.sync_data()?;
            (0, Vec::new())
        } else {
            let (base, records, valid_end) = read_frames(&mut file, max_record_bytes)?;
            if valid_end < len {
                tracing::warn!(
                    "Truncating torn tail of {}: {} bytes after offset {}",
                    path.display(),
                    len - valid_end,
                    valid_end
                );
                file.set_len(valid_end)?;
                file.sync_data()?;
            }
            (base, records)
        };

        file.seek(SeekFrom::End(0))?;

        Ok((
            Self {
                path,
                file,
                base,
                sync_on_append,
                max_record_bytes,
                #[cfg(test)]
                fail_next: false,
                _marker: PhantomData,
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base sequence recorded at the last rewrite
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Append one record; durable on return when `sync_on_append` is set
    pub fn append(&mut self, record: &T) -> Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next) {
            return Err(Error::Io(std::io::Error::other("injected write failure")));
        }

        let frame = encode_frame(record, self.max_record_bytes)?;
        self.file.write_all(&frame)?;
        if self.sync_on_append {
            self.sync()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Atomically replace the log contents with `records`
    pub fn rewrite(&mut self, base: u64, records: &[T]) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&header_bytes(base))?;
            for record in records {
                tmp.write_all(&encode_frame(record, self.max_record_bytes)?)?;
            }
            tmp.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        self.file = OpenOptions::new().append(true).read(true).open(&self.path)?;
        self.file.seek(SeekFrom::End(0))?;
        self.base = base;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_append(&mut self) {
        self.fail_next = true;
    }
}

impl<T> Drop for LogFile<T> {
    fn drop(&mut self) {
        let _ = self.file.sync_data();
    }
}

fn header_bytes(base: u64) -> [u8; FILE_HEADER_LEN as usize] {
    let mut buf = [0u8; FILE_HEADER_LEN as usize];
    buf[0..4].copy_from_slice(&LOG_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&base.to_le_bytes());
    buf
}

fn encode_frame<T: Serialize>(record: &T, max_record_bytes: usize) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record)?;
    if payload.len() > max_record_bytes {
        return Err(Error::wal(format!(
            "record of {} bytes exceeds limit of {}",
            payload.len(),
            max_record_bytes
        )));
    }

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn read_frames<T: DeserializeOwned>(
    file: &mut File,
    max_record_bytes: usize,
) -> Result<(u64, Vec<T>, u64)> {
    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; FILE_HEADER_LEN as usize];
    file.read_exact(&mut header)?;
    let magic = le_u32(&header[0..4]);
    if magic != LOG_MAGIC {
        return Err(Error::wal(format!("bad log magic {:08x}", magic)));
    }
    let version = le_u32(&header[4..8]);
    if version != FORMAT_VERSION {
        return Err(Error::wal(format!("unsupported log version {}", version)));
    }
    let base = le_u64(&header[8..16]);

    let mut records = Vec::new();
    let mut valid_end = FILE_HEADER_LEN;

    loop {
        let mut hdr = [0u8; FRAME_HEADER_LEN];
        match file.read_exact(&mut hdr) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::Io(e)),
        }

        let len = le_u32(&hdr[0..4]) as usize;
        if len > max_record_bytes {
            break;
        }
        let crc = le_u32(&hdr[4..8]);

        let mut payload = vec![0u8; len];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            // Torn tail
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::Io(e)),
        }

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            break;
        }

        match bincode::deserialize(&payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("Undecodable log frame at offset {}: {}", valid_end, e);
                break;
            }
        }
        valid_end += (FRAME_HEADER_LEN + len) as u64;
    }

    Ok((base, records, valid_end))
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
