//! Directory-backed page store
//!
//! Each page lives in its own file, `page-<addr>.pg`, holding a sequence of
//! length-prefixed segments: the base image first, then appended deltas.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::device::{PageAddr, PageStore};

const PAGE_FILE_PREFIX: &str = "page-";
const PAGE_FILE_SUFFIX: &str = ".pg";
const SEGMENT_LEN_BYTES: usize = 4;

/// Page store keeping one file per page under a directory
pub struct FilePageStore {
    dir: PathBuf,
    next_addr: AtomicU64,
    /// Serializes writers; readers only see fully renamed files.
    write_lock: Mutex<()>,
}

impl FilePageStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut max_addr = 0u64;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(addr) = name.to_str().and_then(parse_page_file_name) {
                max_addr = max_addr.max(addr);
            }
        }

        Ok(Self {
            dir,
            next_addr: AtomicU64::new(max_addr + 1),
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the page files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn page_path(&self, addr: PageAddr) -> PathBuf {
        self.dir
            .join(format!("{PAGE_FILE_PREFIX}{:016x}{PAGE_FILE_SUFFIX}", addr.get()))
    }
}

fn parse_page_file_name(name: &str) -> Option<u64> {
    let hex = name
        .strip_prefix(PAGE_FILE_PREFIX)?
        .strip_suffix(PAGE_FILE_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

fn encode_segment(out: &mut Vec<u8>, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment too large"))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn decode_segments(mut bytes: &[u8]) -> io::Result<Vec<Vec<u8>>> {
    let mut parts = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < SEGMENT_LEN_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated segment header",
            ));
        }
        let (len_bytes, rest) = bytes.split_at(SEGMENT_LEN_BYTES);
        let mut len_buf = [0u8; SEGMENT_LEN_BYTES];
        len_buf.copy_from_slice(len_bytes);
        let len = u32::from_le_bytes(len_buf) as usize;
        if rest.len() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("truncated segment: expected {len} bytes, found {}", rest.len()),
            ));
        }
        let (segment, rest) = rest.split_at(len);
        parts.push(segment.to_vec());
        bytes = rest;
    }
    Ok(parts)
}

impl PageStore for FilePageStore {
    fn read_multi(&self, addr: PageAddr) -> io::Result<Vec<Vec<u8>>> {
        let mut file = File::open(self.page_path(addr))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let parts = decode_segments(&bytes)?;
        if parts.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("page {addr} has no base image"),
            ));
        }
        Ok(parts)
    }

    fn write(&self, addr: PageAddr, image: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        let mut bytes = Vec::with_capacity(SEGMENT_LEN_BYTES + image.len());
        encode_segment(&mut bytes, image)?;

        let path = self.page_path(addr);
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        self.next_addr.fetch_max(addr.get() + 1, Ordering::AcqRel);
        Ok(())
    }

    fn append_delta(&self, addr: PageAddr, delta: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        let mut bytes = Vec::with_capacity(SEGMENT_LEN_BYTES + delta.len());
        encode_segment(&mut bytes, delta)?;
        let mut file = OpenOptions::new().append(true).open(self.page_path(addr))?;
        file.write_all(&bytes)?;
        Ok(())
    }

    fn allocate(&self) -> PageAddr {
        PageAddr(self.next_addr.fetch_add(1, Ordering::AcqRel))
    }

    fn remove(&self, addr: PageAddr) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.page_path(addr)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn sync(&self) -> io::Result<()> {
        File::open(&self.dir)?.sync_all()
    }
}
