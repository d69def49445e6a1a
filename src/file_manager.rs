//! Raw page I/O over the single data file.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    error::DbResult,
    page::{Page, PageId},
};

/// Owns the data file handle. Reads and writes are whole pages at
/// `page_id * page_size`; the page size is supplied by the store once the
/// header has been read.
#[derive(Debug)]
pub struct FileManager {
    file: Mutex<File>,
}

impl FileManager {
    /// Open (creating if needed) the data file and take an exclusive advisory
    /// lock on it.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock_exclusive(&file)?;
        debug!(path = %path.display(), "opened data file");
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Length of the file in bytes
    pub fn len(&self) -> DbResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Read up to `buf.len()` bytes from the start of the file. Used to peek
    /// at the header before the page size is known.
    pub fn read_prefix(&self, buf: &mut [u8]) -> DbResult<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }

    /// Read the page with the given id. A page past the end of the file, or a
    /// short read, is an `Io` error rather than a zero-filled page.
    pub fn read(&self, page_id: PageId, page_size: usize) -> DbResult<Page> {
        let offset = page_id as u64 * page_size as u64;
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if offset + page_size as u64 > len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("page {page_id} is beyond the end of the data file ({len} bytes)"),
            )
            .into());
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut contents = vec![0; page_size];
        file.read_exact(&mut contents)?;
        Ok(Page::from_bytes(contents))
    }

    /// Write the page to the slot for `page_id`, extending the file if needed
    pub fn write(&self, page_id: PageId, page: &Page) -> DbResult<()> {
        let offset = page_id as u64 * page.len() as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(page.bytes())?;
        Ok(())
    }

    /// fsync the data file
    pub fn sync(&self) -> DbResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}
