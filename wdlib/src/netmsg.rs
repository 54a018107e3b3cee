//! The wire message store (C2): a polymorphic container that backs short
//! control messages in memory and large file-bearing messages on disk,
//! sharing one read/write/seek/truncate contract so the rest of the stack
//! doesn't care which backing a given message uses.
//!
//! On-wire layout: `[opcode:1][labelsize:8 BE][label][datasize:8 BE][data]`,
//! with label/data present only for the opcodes that carry them. The
//! backing literally stores these marshalled bytes; getlabel/setlabel and
//! getdata/setdata are read/write/seek/truncate calls at fixed offsets, the
//! same way the C original layers all of its message manipulation on top of
//! `buffer_read`/`buffer_write`/`buffer_seek`.

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::{ByteBuffer, Whence};
use crate::error::{Error, Result, MAXFILESIZE, MAXNAMESIZE};
use crate::filestore::FileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    SendLine = 1,
    RequestLine = 2,
    SendFile = 3,
    Terminate = 4,
    Error = 5,
    Ack = 6,
    Heartbeat = 7,
}

impl Opcode {
    pub fn needs_label(self) -> bool {
        matches!(self, Opcode::SendLine | Opcode::SendFile | Opcode::Error)
    }

    pub fn needs_data(self) -> bool {
        matches!(self, Opcode::SendFile)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Opcode::SendLine,
            2 => Opcode::RequestLine,
            3 => Opcode::SendFile,
            4 => Opcode::Terminate,
            5 => Opcode::Error,
            6 => Opcode::Ack,
            7 => Opcode::Heartbeat,
            // an unrecognized opcode byte is treated the same as a mismatched
            // one: the wire contract has already been violated.
            _ => return Err(Error::OpcodeMismatch),
        })
    }
}

enum Storage {
    Memory(ByteBuffer),
    Disk {
        file: File,
        path: PathBuf,
        store: Arc<FileStore>,
        weak: bool,
    },
}

/// A message in flight: constructed fresh (memory, or disk for SENDFILE),
/// or loaded weakly from an existing SENDFILE path handed off by another
/// process.
pub struct NetMsg {
    opcode: Opcode,
    storage: Storage,
    pub error: Option<String>,
}

impl NetMsg {
    /// Construct a fresh message. SENDFILE is disk-backed under `dir`
    /// (the role-specific messages directory); everything else is
    /// in-memory. Writes the opcode byte immediately (the "type commit").
    pub fn new(opcode: Opcode, disk_store: Option<&Arc<FileStore>>) -> Result<Self> {
        let storage = match (opcode, disk_store) {
            (Opcode::SendFile, Some(store)) => {
                let (_, path) = store.reserve();
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)?;
                Storage::Disk {
                    file,
                    path,
                    store: Arc::clone(store),
                    weak: false,
                }
            }
            (Opcode::SendFile, None) => {
                panic!("SENDFILE netmsg requires a disk-backed file store")
            }
            _ => Storage::Memory(ByteBuffer::new()),
        };

        let mut msg = NetMsg {
            opcode,
            storage,
            error: None,
        };
        msg.raw_write(&[opcode as u8])?;
        Ok(msg)
    }

    /// Open an existing SENDFILE on disk without creating it, for
    /// cross-process hand-off by path. Does not take ownership: dropping a
    /// weakly-loaded message closes the file but never unlinks it or
    /// returns its id to the free list.
    pub fn load_weakly(path: impl AsRef<Path>, store: &Arc<FileStore>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut opcode_byte = [0u8; 1];
        file.read_exact(&mut opcode_byte)?;
        let opcode = Opcode::try_from(opcode_byte[0])?;
        file.seek(SeekFrom::End(0))?;

        Ok(NetMsg {
            opcode,
            storage: Storage::Disk {
                file,
                path,
                store: Arc::clone(store),
                weak: true,
            },
            error: None,
        })
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::Disk { path, .. } => Some(path),
            Storage::Memory(_) => None,
        }
    }

    fn record_error(&mut self, e: Error) -> Error {
        self.error = Some(e.to_string());
        e
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    // -- passthrough contract: read/write/seek/truncate --

    pub fn raw_read(&mut self, out: &mut [u8]) -> Result<usize> {
        match &mut self.storage {
            Storage::Memory(b) => Ok(b.read(out)),
            Storage::Disk { file, .. } => Ok(file.read(out)?),
        }
    }

    pub fn raw_write(&mut self, data: &[u8]) -> Result<usize> {
        let result = match &mut self.storage {
            Storage::Memory(b) => b.write(data),
            Storage::Disk { file, .. } => Ok(file.write(data)?),
        };
        result.map_err(|e| self.record_error(e))
    }

    pub fn raw_seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let result = match &mut self.storage {
            Storage::Memory(b) => b.seek(offset, whence),
            Storage::Disk { file, .. } => {
                let pos = match whence {
                    Whence::Start => SeekFrom::Start(offset.max(0) as u64),
                    Whence::Current => SeekFrom::Current(offset),
                    Whence::End => SeekFrom::End(offset),
                };
                if matches!(whence, Whence::Start) && offset < 0 {
                    Err(Error::InvalidPosition)
                } else {
                    file.seek(pos).map_err(Error::from)
                }
            }
        };
        result.map_err(|e| self.record_error(e))
    }

    pub fn raw_truncate(&mut self, len: u64) -> Result<()> {
        let result = match &mut self.storage {
            Storage::Memory(b) => b.truncate(len),
            Storage::Disk { file, .. } => {
                file.set_len(len)?;
                file.seek(SeekFrom::End(0))?;
                Ok(())
            }
        };
        result.map_err(|e| self.record_error(e))
    }

    /// Total marshalled length of the message as currently stored.
    pub fn raw_len(&mut self) -> Result<u64> {
        let cur = self.raw_seek(0, Whence::Current)?;
        let end = self.raw_seek(0, Whence::End)?;
        self.raw_seek(cur as i64, Whence::Start)?;
        Ok(end)
    }

    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.raw_seek(pos as i64, Whence::Start)?;
        let mut got = 0;
        while got < buf.len() {
            let n = self.raw_read(&mut buf[got..])?;
            if n == 0 {
                return Err(Error::Truncated);
            }
            got += n;
        }
        Ok(())
    }

    // -- label / data choreography --

    fn captured_tail_past_label(&mut self) -> Result<Option<Vec<u8>>> {
        let total = self.raw_len()?;
        if total <= 1 {
            return Ok(None);
        }
        let mut sizebuf = [0u8; 8];
        if self.read_exact_at(1, &mut sizebuf).is_err() {
            return Ok(None);
        }
        let labelsize = u64::from_be_bytes(sizebuf) as usize;
        let label_end = 1 + 8 + labelsize;
        if (total as usize) <= label_end {
            return Ok(None);
        }
        let mut rest = vec![0u8; total as usize - label_end];
        self.read_exact_at(label_end as u64, &mut rest)?;
        Ok(Some(rest))
    }

    /// Truncate any trailing data, preserve it, write the new label, then
    /// restore the preserved data payload (if any) unchanged.
    pub fn setlabel(&mut self, label: &str) -> Result<()> {
        if !self.opcode.needs_label() {
            return Err(Error::NoLabel);
        }
        if label.len() > MAXNAMESIZE {
            return Err(Error::LabelTooLong(label.len()));
        }

        let preserved_tail = self.captured_tail_past_label()?;

        self.raw_truncate(1)?;
        self.raw_seek(1, Whence::Start)?;

        let mut hdr = Vec::with_capacity(8 + label.len());
        hdr.extend_from_slice(&(label.len() as u64).to_be_bytes());
        hdr.extend_from_slice(label.as_bytes());
        self.raw_write(&hdr)?;

        if let Some(tail) = preserved_tail {
            self.raw_write(&tail)?;
        }
        Ok(())
    }

    pub fn getlabel(&mut self) -> Result<String> {
        if !self.opcode.needs_label() {
            return Err(Error::NoLabel);
        }
        let mut sizebuf = [0u8; 8];
        self.read_exact_at(1, &mut sizebuf)?;
        let labelsize = u64::from_be_bytes(sizebuf) as usize;
        if labelsize > MAXNAMESIZE {
            return Err(Error::LabelTooLong(labelsize));
        }
        let mut label = vec![0u8; labelsize];
        self.read_exact_at(9, &mut label)?;
        self.raw_seek(0, Whence::End)?;
        Ok(String::from_utf8(label)?)
    }

    fn label_end_offset(&mut self) -> Result<u64> {
        let mut sizebuf = [0u8; 8];
        self.read_exact_at(1, &mut sizebuf)?;
        let labelsize = u64::from_be_bytes(sizebuf);
        Ok(1 + 8 + labelsize)
    }

    /// Truncate to just past the label, then append `[size:8 BE][bytes]`.
    pub fn setdata(&mut self, data: &[u8]) -> Result<()> {
        if !self.opcode.needs_data() {
            return Err(Error::NoData);
        }
        if data.len() > MAXFILESIZE {
            return Err(Error::DataTooLong(data.len()));
        }

        let label_end = self.label_end_offset()?;
        self.raw_truncate(label_end)?;
        self.raw_seek(label_end as i64, Whence::Start)?;

        let mut hdr = Vec::with_capacity(8 + data.len());
        hdr.extend_from_slice(&(data.len() as u64).to_be_bytes());
        hdr.extend_from_slice(data);
        self.raw_write(&hdr)?;
        Ok(())
    }

    pub fn getdata(&mut self) -> Result<Vec<u8>> {
        if !self.opcode.needs_data() {
            return Err(Error::NoData);
        }
        let label_end = self.label_end_offset()?;
        let mut sizebuf = [0u8; 8];
        self.read_exact_at(label_end, &mut sizebuf)?;
        let datasize = u64::from_be_bytes(sizebuf) as usize;
        if datasize > MAXFILESIZE {
            return Err(Error::DataTooLong(datasize));
        }
        let mut data = vec![0u8; datasize];
        self.read_exact_at(label_end + 8, &mut data)?;
        self.raw_seek(0, Whence::End)?;
        Ok(data)
    }

    /// `(ok, fatal)`: opcode mismatch or out-of-range sizes are fatal;
    /// short reads (more bytes still expected) are recoverable.
    pub fn isvalid(&mut self) -> Result<(bool, bool)> {
        let total = match self.raw_len() {
            Ok(t) => t,
            Err(e) => return Err(e),
        };

        if total < 1 {
            return Ok((false, false));
        }

        let mut opcode_byte = [0u8; 1];
        self.read_exact_at(0, &mut opcode_byte)?;
        if opcode_byte[0] != self.opcode as u8 {
            return Ok((false, true));
        }

        let mut expected = 1u64;

        if self.opcode.needs_label() {
            let mut sizebuf = [0u8; 8];
            if self.read_exact_at(1, &mut sizebuf).is_err() {
                return Ok((false, false));
            }
            let labelsize = u64::from_be_bytes(sizebuf);
            if labelsize as usize > MAXNAMESIZE {
                return Ok((false, true));
            }
            expected += 8 + labelsize;
            if total < expected {
                return Ok((false, false));
            }

            if self.opcode.needs_data() {
                let mut dsizebuf = [0u8; 8];
                if self.read_exact_at(expected, &mut dsizebuf).is_err() {
                    return Ok((false, false));
                }
                let datasize = u64::from_be_bytes(dsizebuf);
                if datasize as usize > MAXFILESIZE {
                    return Ok((false, true));
                }
                expected += 8 + datasize;
            }
        }

        self.raw_seek(0, Whence::End)?;

        if total < expected {
            Ok((false, false))
        } else if total > expected {
            Ok((false, true))
        } else {
            Ok((true, false))
        }
    }
}

impl Drop for NetMsg {
    fn drop(&mut self) {
        if let Storage::Disk {
            path, store, weak, ..
        } = &self.storage
        {
            if !*weak {
                let _ = std::fs::remove_file(path);
                let _ = store.release(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_backed_label_round_trips() {
        let mut m = NetMsg::new(Opcode::SendLine, None).unwrap();
        m.setlabel("hello").unwrap();
        assert_eq!(m.getlabel().unwrap(), "hello");
        let (ok, fatal) = m.isvalid().unwrap();
        assert!(ok && !fatal);
    }

    #[test]
    fn disk_backed_sendfile_label_and_data_round_trip() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));

        let mut m = NetMsg::new(Opcode::SendFile, Some(&store)).unwrap();
        m.setlabel("b.bundle").unwrap();
        m.setdata(b"0123456789").unwrap();

        assert_eq!(m.getlabel().unwrap(), "b.bundle");
        assert_eq!(m.getdata().unwrap(), b"0123456789");

        let (ok, fatal) = m.isvalid().unwrap();
        assert!(ok && !fatal);
    }

    #[test]
    fn setlabel_after_setdata_preserves_data() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));

        let mut m = NetMsg::new(Opcode::SendFile, Some(&store)).unwrap();
        m.setlabel("first").unwrap();
        m.setdata(b"payload").unwrap();
        m.setlabel("second").unwrap();

        assert_eq!(m.getlabel().unwrap(), "second");
        assert_eq!(m.getdata().unwrap(), b"payload");
    }

    #[test]
    fn weakly_loaded_message_does_not_unlink_on_drop() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));

        let mut owner = NetMsg::new(Opcode::SendFile, Some(&store)).unwrap();
        owner.setlabel("f").unwrap();
        owner.setdata(b"x").unwrap();
        let path = owner.path().unwrap().to_path_buf();

        {
            let weak = NetMsg::load_weakly(&path, &store).unwrap();
            assert_eq!(weak.opcode(), Opcode::SendFile);
        }
        assert!(path.exists(), "weak drop must not unlink the shared file");

        drop(owner);
        assert!(!path.exists(), "owner drop must unlink the file");
    }

    #[test]
    fn opcode_mismatch_on_wire_is_fatal() {
        let mut m = NetMsg::new(Opcode::Ack, None).unwrap();
        m.raw_seek(0, Whence::Start).unwrap();
        m.raw_write(&[Opcode::Terminate as u8]).unwrap();
        let (ok, fatal) = m.isvalid().unwrap();
        assert!(!ok && fatal);
    }
}
