//! Write-ahead journal kept next to the data file as `<path>.journal`.
//!
//! The journal is append-only between commits and empty while no commit is
//! in flight. Each record is stored as one frame:
//!
//! ```text
//! [u32 payload length][u32 crc32 of payload][payload]
//! ```
//!
//! A commit writes every page record, syncs, then appends the commit marker
//! and syncs again. Durability of the marker is the commit point. Scanning
//! stops at the first frame that is short, fails its checksum or does not
//! decode; everything after a torn frame is ignored.

use std::{
    collections::{BTreeMap, HashSet},
    ffi::OsString,
    fmt::Display,
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    error::{DbError, DbResult},
    page::{ByteReader, PageId},
};

const FRAME_HEADER_SIZE: usize = 8;

/// One journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Full image of a page as it must look once the transaction commits.
    /// `before` is absent for pages that did not exist before the transaction.
    PageWrite {
        lsn: u64,
        txn_id: u64,
        page_id: PageId,
        before: Option<Vec<u8>>,
        after: Vec<u8>,
    },
    Commit {
        lsn: u64,
        txn_id: u64,
    },
}

impl Display for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogRecord::PageWrite {
                lsn,
                txn_id,
                page_id,
                before,
                ..
            } => write!(
                f,
                "PageWrite(lsn: {}, txn: {}, page: {}, new page: {})",
                lsn,
                txn_id,
                page_id,
                before.is_none()
            ),
            LogRecord::Commit { lsn, txn_id } => {
                write!(f, "Commit(lsn: {}, txn: {})", lsn, txn_id)
            }
        }
    }
}

impl LogRecord {
    fn discriminant(&self) -> u8 {
        match self {
            LogRecord::PageWrite { .. } => 1,
            LogRecord::Commit { .. } => 2,
        }
    }

    pub fn lsn(&self) -> u64 {
        match self {
            LogRecord::PageWrite { lsn, .. } | LogRecord::Commit { lsn, .. } => *lsn,
        }
    }

    pub fn txn_id(&self) -> u64 {
        match self {
            LogRecord::PageWrite { txn_id, .. } | LogRecord::Commit { txn_id, .. } => *txn_id,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.discriminant());
        out.extend_from_slice(&self.lsn().to_be_bytes());
        out.extend_from_slice(&self.txn_id().to_be_bytes());
        if let LogRecord::PageWrite {
            page_id,
            before,
            after,
            ..
        } = self
        {
            out.extend_from_slice(&page_id.to_be_bytes());
            match before {
                Some(before) => {
                    out.push(1);
                    out.extend_from_slice(&(before.len() as u32).to_be_bytes());
                    out.extend_from_slice(before);
                }
                None => out.push(0),
            }
            out.extend_from_slice(&(after.len() as u32).to_be_bytes());
            out.extend_from_slice(after);
        }
        out
    }
}

impl TryFrom<&[u8]> for LogRecord {
    type Error = DbError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let mut reader = ByteReader::new(value);
        let discriminant = reader.u8()?;
        let lsn = reader.u64()?;
        let txn_id = reader.u64()?;
        let record = match discriminant {
            1 => {
                let page_id = reader.u32()?;
                let before = match reader.u8()? {
                    0 => None,
                    1 => {
                        let len = reader.u32()? as usize;
                        Some(reader.take(len)?.to_vec())
                    }
                    other => {
                        return Err(DbError::corrupt(format!(
                            "invalid before-image flag {other} in journal record"
                        )))
                    }
                };
                let len = reader.u32()? as usize;
                let after = reader.take(len)?.to_vec();
                LogRecord::PageWrite {
                    lsn,
                    txn_id,
                    page_id,
                    before,
                    after,
                }
            }
            2 => LogRecord::Commit { lsn, txn_id },
            other => {
                return Err(DbError::corrupt(format!(
                    "unknown journal record type {other}"
                )))
            }
        };
        if reader.remaining() != 0 {
            return Err(DbError::corrupt("trailing bytes in journal record"));
        }
        Ok(record)
    }
}

/// Result of reading the journal back at open.
#[derive(Debug, Default)]
pub struct JournalScan {
    pub records: Vec<LogRecord>,
    /// A torn or corrupt frame ended the scan early.
    pub torn: bool,
}

impl JournalScan {
    /// The final page images of every transaction whose commit marker was
    /// read, with the LSN of the last marker. A journal that was not reset
    /// after a commit holds several transactions; later records win when a
    /// page appears twice.
    pub fn committed_pages(&self) -> Option<(u64, Vec<(PageId, &[u8])>)> {
        let mut last_lsn = None;
        let mut committed = HashSet::new();
        for record in &self.records {
            if let LogRecord::Commit { lsn, txn_id } = record {
                committed.insert(*txn_id);
                last_lsn = Some(*lsn);
            }
        }
        let last_lsn = last_lsn?;

        let mut pages: BTreeMap<PageId, &[u8]> = BTreeMap::new();
        for record in &self.records {
            if let LogRecord::PageWrite {
                txn_id,
                page_id,
                after,
                ..
            } = record
            {
                if committed.contains(txn_id) {
                    pages.insert(*page_id, after);
                }
            }
        }
        Some((last_lsn, pages.into_iter().collect()))
    }
}

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Journal {
    /// The journal path that belongs to a data file
    pub fn path_for(data_path: &Path) -> PathBuf {
        let mut name: OsString = data_path.as_os_str().to_owned();
        name.push(".journal");
        PathBuf::from(name)
    }

    pub fn open(data_path: &Path) -> DbResult<Self> {
        let path = Self::path_for(data_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> DbResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Append records as frames at the end of the journal. Does not sync.
    pub fn append(&self, records: &[LogRecord]) -> DbResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        let mut writer = BufWriter::new(&mut *file);
        for record in records {
            let payload = record.to_bytes();
            writer.write_all(&(payload.len() as u32).to_be_bytes())?;
            writer.write_all(&crc32fast::hash(&payload).to_be_bytes())?;
            writer.write_all(&payload)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn sync(&self) -> DbResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Empty the journal once its contents are no longer needed.
    pub fn reset(&self, sync: bool) -> DbResult<()> {
        let file = self.file.lock();
        file.set_len(0)?;
        if sync {
            file.sync_all()?;
        }
        debug!(path = %self.path.display(), "journal reset");
        Ok(())
    }

    /// Read every intact frame from the start of the journal.
    pub fn scan(&self) -> DbResult<JournalScan> {
        let mut file = self.file.lock();
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut *file);
        let mut scan = JournalScan::default();
        let mut offset = 0u64;
        loop {
            let mut frame_header = [0u8; FRAME_HEADER_SIZE];
            match read_full(&mut reader, &mut frame_header)? {
                0 => break,
                n if n < FRAME_HEADER_SIZE => {
                    warn!(offset, "torn journal frame header");
                    scan.torn = true;
                    break;
                }
                _ => {}
            }
            let mut header = ByteReader::new(&frame_header);
            let len = header.u32()? as usize;
            let crc = header.u32()?;
            let available = file_len.saturating_sub(offset + FRAME_HEADER_SIZE as u64);
            if len as u64 > available {
                warn!(offset, len, available, "journal frame length runs past the end");
                scan.torn = true;
                break;
            }
            let mut payload = vec![0u8; len];
            if read_full(&mut reader, &mut payload)? < len {
                warn!(offset, len, "torn journal frame payload");
                scan.torn = true;
                break;
            }
            if crc32fast::hash(&payload) != crc {
                warn!(offset, "journal frame checksum mismatch");
                scan.torn = true;
                break;
            }
            match LogRecord::try_from(payload.as_slice()) {
                Ok(record) => scan.records.push(record),
                Err(err) => {
                    warn!(offset, error = %err, "undecodable journal frame");
                    scan.torn = true;
                    break;
                }
            }
            offset += (FRAME_HEADER_SIZE + len) as u64;
        }
        Ok(scan)
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> DbResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestDir;

    fn page_write(lsn: u64, page_id: PageId, fill: u8) -> LogRecord {
        LogRecord::PageWrite {
            lsn,
            txn_id: 1,
            page_id,
            before: if page_id % 2 == 0 { Some(vec![0; 16]) } else { None },
            after: vec![fill; 16],
        }
    }

    #[test]
    fn test_record_serialization() {
        let record = page_write(7, 4, 0xAB);
        let bytes = record.to_bytes();
        assert_eq!(LogRecord::try_from(bytes.as_slice()).unwrap(), record);

        let commit = LogRecord::Commit { lsn: 9, txn_id: 1 };
        assert_eq!(
            LogRecord::try_from(commit.to_bytes().as_slice()).unwrap(),
            commit
        );
        assert!(LogRecord::try_from(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_append_scan_and_reset() {
        let dir = TestDir::new();
        let journal = Journal::open(&dir.join("db")).unwrap();
        assert_eq!(journal.path(), dir.join("db.journal"));

        let records = vec![
            page_write(1, 2, 1),
            page_write(2, 3, 2),
            LogRecord::Commit { lsn: 3, txn_id: 1 },
        ];
        journal.append(&records).unwrap();
        journal.sync().unwrap();

        let scan = journal.scan().unwrap();
        assert!(!scan.torn);
        assert_eq!(scan.records, records);
        let (lsn, pages) = scan.committed_pages().unwrap();
        assert_eq!(lsn, 3);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1], (3, [2u8; 16].as_slice()));

        journal.reset(false).unwrap();
        assert!(journal.is_empty().unwrap());
        assert!(journal.scan().unwrap().records.is_empty());
    }

    #[test]
    fn test_scan_stops_at_torn_frame() {
        let dir = TestDir::new();
        let journal = Journal::open(&dir.join("db")).unwrap();
        journal
            .append(&[page_write(1, 2, 1), LogRecord::Commit { lsn: 2, txn_id: 1 }])
            .unwrap();
        let full = journal.len().unwrap();
        {
            let file = journal.file.lock();
            file.set_len(full - 3).unwrap();
        }
        let scan = journal.scan().unwrap();
        assert!(scan.torn);
        assert_eq!(scan.records.len(), 1);
        assert!(scan.committed_pages().is_none());
    }

    #[test]
    fn test_every_committed_transaction_is_replayed() {
        let dir = TestDir::new();
        let journal = Journal::open(&dir.join("db")).unwrap();
        let write = |txn_id, lsn, page_id, fill| LogRecord::PageWrite {
            lsn,
            txn_id,
            page_id,
            before: None,
            after: vec![fill; 16],
        };
        journal
            .append(&[
                write(1, 1, 2, 1),
                write(1, 2, 3, 1),
                LogRecord::Commit { lsn: 3, txn_id: 1 },
                write(2, 4, 3, 2),
                LogRecord::Commit { lsn: 5, txn_id: 2 },
                write(3, 6, 2, 3),
            ])
            .unwrap();

        let scan = journal.scan().unwrap();
        let (lsn, pages) = scan.committed_pages().unwrap();
        assert_eq!(lsn, 5);
        assert_eq!(
            pages,
            vec![(2, [1u8; 16].as_slice()), (3, [2u8; 16].as_slice())]
        );
    }

    #[test]
    fn test_oversized_frame_length_is_torn() {
        let dir = TestDir::new();
        let journal = Journal::open(&dir.join("db")).unwrap();
        journal
            .append(&[page_write(1, 2, 1), LogRecord::Commit { lsn: 2, txn_id: 1 }])
            .unwrap();
        let second_frame = {
            let bytes = page_write(1, 2, 1).to_bytes();
            (FRAME_HEADER_SIZE + bytes.len()) as u64
        };
        {
            let mut file = journal.file.lock();
            file.seek(SeekFrom::Start(second_frame)).unwrap();
            file.write_all(&u32::MAX.to_be_bytes()).unwrap();
        }
        let scan = journal.scan().unwrap();
        assert!(scan.torn);
        assert_eq!(scan.records, vec![page_write(1, 2, 1)]);
        assert!(scan.committed_pages().is_none());
    }

    #[test]
    fn test_scan_stops_at_checksum_mismatch() {
        let dir = TestDir::new();
        let journal = Journal::open(&dir.join("db")).unwrap();
        journal
            .append(&[page_write(1, 2, 1), LogRecord::Commit { lsn: 2, txn_id: 1 }])
            .unwrap();
        {
            let mut file = journal.file.lock();
            file.seek(SeekFrom::Start(FRAME_HEADER_SIZE as u64 + 3)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }
        let scan = journal.scan().unwrap();
        assert!(scan.torn);
        assert!(scan.records.is_empty());
    }
}
