//! Builds the netmsg instances the pool hands back to the caller for
//! injection into a VM's connection: SENDLINE and CLIENTACK are small and
//! memory-backed; SENDFILE is disk-backed in the engine's own messages
//! directory so a large payload never sits fully in memory.

use std::sync::Arc;

use wdlib::filestore::FileStore;
use wdlib::netmsg::{NetMsg, Opcode};

use crate::error::Result;

pub fn line(text: &str) -> Result<NetMsg> {
    let mut m = NetMsg::new(Opcode::SendLine, None)?;
    m.setlabel(text)?;
    Ok(m)
}

pub fn ack() -> Result<NetMsg> {
    Ok(NetMsg::new(Opcode::Ack, None)?)
}

pub fn request_line() -> Result<NetMsg> {
    Ok(NetMsg::new(Opcode::RequestLine, None)?)
}

pub fn heartbeat() -> Result<NetMsg> {
    Ok(NetMsg::new(Opcode::Heartbeat, None)?)
}

pub fn file(store: &Arc<FileStore>, label: &str, data: &[u8]) -> Result<NetMsg> {
    let mut m = NetMsg::new(Opcode::SendFile, Some(store))?;
    m.setlabel(label)?;
    m.setdata(data)?;
    Ok(m)
}
