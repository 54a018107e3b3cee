//! Writeback file store (C9): length-prefixed `{name,data}` files for
//! oversized cross-process artifacts, content
//! `[namelen:8 BE][name][datalen:8 BE][data]`. Grounded directly on
//! `wbfile_writeback`/`wbfile_readout`/`wbfile_teardown`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result, MAXFILESIZE, MAXNAMESIZE};
use crate::filestore::FileStore;

pub struct WritebackStore {
    files: Arc<FileStore>,
}

impl WritebackStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            files: Arc::new(FileStore::new(dir)),
        }
    }

    pub fn writeback(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        if name.len() > MAXNAMESIZE {
            return Err(Error::NameTooLong(name.len()));
        }
        if data.len() > MAXFILESIZE {
            return Err(Error::DataTooLong(data.len()));
        }

        let mut buf = Vec::with_capacity(8 + name.len() + 8 + data.len());
        buf.extend_from_slice(&(name.len() as u64).to_be_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(&(data.len() as u64).to_be_bytes());
        buf.extend_from_slice(data);

        let (_, path) = self.files.reserve();
        fs::write(&path, &buf)?;
        Ok(path)
    }

    pub fn readout(&self, path: &Path) -> Result<(String, Vec<u8>)> {
        let buf = fs::read(path)?;
        if buf.len() < 8 {
            return Err(Error::Truncated);
        }
        let namelen = u64::from_be_bytes(buf[0..8].try_into().unwrap()) as usize;
        if namelen > MAXNAMESIZE || buf.len() < 8 + namelen + 8 {
            return Err(Error::Truncated);
        }
        let name = String::from_utf8(buf[8..8 + namelen].to_vec())?;

        let datalen_at = 8 + namelen;
        let datalen =
            u64::from_be_bytes(buf[datalen_at..datalen_at + 8].try_into().unwrap()) as usize;
        if datalen > MAXFILESIZE || buf.len() < datalen_at + 8 + datalen {
            return Err(Error::Truncated);
        }
        let data = buf[datalen_at + 8..datalen_at + 8 + datalen].to_vec();

        Ok((name, data))
    }

    pub fn teardown(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        self.files.release(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_and_recycles_ids() {
        let dir = tempdir().unwrap();
        let store = WritebackStore::new(dir.path());

        let p1 = store.writeback("testfile.txt", b"hello world").unwrap();
        let (name, data) = store.readout(&p1).unwrap();
        assert_eq!(name, "testfile.txt");
        assert_eq!(data, b"hello world");

        store.teardown(&p1).unwrap();
        let p2 = store.writeback("other.txt", b"x").unwrap();
        assert_eq!(p1, p2, "freed id must be reused by the next writeback");
    }

    #[test]
    fn oversized_name_is_rejected() {
        let dir = tempdir().unwrap();
        let store = WritebackStore::new(dir.path());
        let longname = "a".repeat(MAXNAMESIZE + 1);
        assert!(matches!(
            store.writeback(&longname, b"x"),
            Err(Error::NameTooLong(_))
        ));
    }
}
