//! A directory of id-named files with a recycled id space, shared by the
//! netmsg disk backing (C2) and the writeback store (C9). Mirrors the
//! `<dir>/<u64 id>` naming convention of `wbfile_reservepath`/
//! `wbfile_releasepath` in the source.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::idalloc::IdAllocator;

pub struct FileStore {
    dir: PathBuf,
    ids: Mutex<IdAllocator>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ids: Mutex::new(IdAllocator::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn reserve(&self) -> (u64, PathBuf) {
        let id = self.ids.lock().unwrap().take64();
        (id, self.path_for(id))
    }

    pub fn release(&self, path: &Path) -> Result<()> {
        let id = self.id_from_path(path)?;
        self.ids.lock().unwrap().release64(id);
        Ok(())
    }

    pub fn path_for(&self, id: u64) -> PathBuf {
        self.dir.join(id.to_string())
    }

    fn id_from_path(&self, path: &Path) -> Result<u64> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or(Error::UnknownHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_release_recycles_id() {
        let store = FileStore::new("/tmp/does-not-need-to-exist-for-this-test");
        let (id, path) = store.reserve();
        store.release(&path).unwrap();
        let (id2, _) = store.reserve();
        assert_eq!(id, id2);
    }
}
