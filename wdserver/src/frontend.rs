//! Frontend router (C7): one active-conn per client TLS connection, a
//! monotonic key allocator, and the client<->engine IPC translation.
//! Grounded on §4.7: recycled active-conn slots keep their key, a
//! connection is "initialized" only after the engine replies
//! INITIALIZED, and exactly one SENDFILE is accepted before that point
//! (the job archive).

use std::collections::HashMap;
use std::time::Duration;

use log::{error, info, warn};
use wdlib::key::KeyAllocator;
use wdlib::netmsg::{NetMsg, Opcode};
use wdlib::writeback::WritebackStore;
use wdlib::BackendKey;

use crate::connection::{Connection, RecvOutcome};
use crate::error::{Error, Result};
use crate::fabric::{IpcChannel, IpcFrame, MessageType};
use crate::queue::SendOutcome;

/// 1 second, matching the source's short client-facing timeout.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ActiveConn {
    pub conn: Connection,
    pub key: BackendKey,
    pub initialized: bool,
    pub should_heartbeat: bool,
    /// The inbound SENDFILE accepted before INITIALIZED: retained so its
    /// disk backing survives until the engine has weakly loaded it by
    /// path, then dropped (which unlinks it) once INITIALIZED arrives.
    pub pending_archive: Option<NetMsg>,
}

/// Table of live client connections, keyed by backend key. Mirrors
/// "free slots recycled onto a list; keys from a monotonic counter never
/// reused" — we don't need slot recycling explicitly since `HashMap`
/// already reuses freed capacity; what's preserved is the *key space*:
/// `KeyAllocator` never rewinds.
#[derive(Default)]
pub struct ActiveConnTable {
    keys: KeyAllocator,
    conns: HashMap<BackendKey, ActiveConn>,
}

impl ActiveConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Connection) -> BackendKey {
        let key = self.keys.next();
        self.conns.insert(
            key,
            ActiveConn {
                conn,
                key,
                initialized: false,
                should_heartbeat: false,
                pending_archive: None,
            },
        );
        key
    }

    pub fn get_mut(&mut self, key: BackendKey) -> Option<&mut ActiveConn> {
        self.conns.get_mut(&key)
    }

    pub fn remove(&mut self, key: BackendKey) -> Option<ActiveConn> {
        self.conns.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

/// Translate one client-delivered netmsg into an outbound IPC frame, or
/// `None` if it should just produce a client-visible ERROR (handled by
/// the caller) without reaching the engine.
pub fn client_to_engine(key: BackendKey, msg: &mut NetMsg) -> Result<Option<IpcFrame>> {
    let frame = match msg.opcode() {
        Opcode::SendLine => IpcFrame::new(MessageType::SendLine, key, msg.getlabel()?),
        Opcode::Ack => IpcFrame::new(MessageType::ClientAck, key, ""),
        Opcode::SendFile => {
            // The archive itself travels by path (the netmsg stays
            // retained on the active-conn until INITIALIZED); the
            // payload here is the messages-dir path the engine will
            // weakly load.
            let path = msg
                .path()
                .ok_or(Error::Wire(wdlib::Error::NoData))?
                .to_string_lossy()
                .into_owned();
            IpcFrame::new(MessageType::PutArchive, key, path)
        }
        Opcode::Terminate => IpcFrame::new(MessageType::Terminate, key, ""),
        Opcode::Heartbeat => return Ok(None),
        Opcode::RequestLine | Opcode::Error => {
            warn!("client {key} sent unexpected opcode {:?}", msg.opcode());
            return Ok(None);
        }
    };
    Ok(Some(frame))
}

/// Translate an inbound engine frame into a netmsg for the client, using
/// the writeback store to read out SENDFILE payloads by path.
pub fn engine_to_client(frame: &IpcFrame, writeback: &WritebackStore) -> Result<NetMsg> {
    Ok(match frame.msg_type {
        MessageType::SendLine | MessageType::RequestLine => {
            let opcode = if frame.msg_type == MessageType::SendLine {
                Opcode::SendLine
            } else {
                Opcode::RequestLine
            };
            let mut m = NetMsg::new(opcode, None)?;
            if opcode.needs_label() {
                m.setlabel(&frame.payload)?;
            }
            m
        }
        MessageType::SendFile => {
            let path = std::path::Path::new(&frame.payload);
            let (name, data) = writeback.readout(path)?;
            writeback.teardown(path)?;
            let mut m = NetMsg::new(Opcode::SendFile, None)?;
            m.setlabel(&name)?;
            m.setdata(&data)?;
            m
        }
        MessageType::Error => {
            let mut m = NetMsg::new(Opcode::Error, None)?;
            m.setlabel(&frame.payload)?;
            m
        }
        MessageType::Initialized
        | MessageType::ClientAck
        | MessageType::PutArchive
        | MessageType::Terminate
        | MessageType::RequestTerm => {
            // RequestTerm tears the connection down directly (see
            // run_connection) rather than becoming a client-visible
            // netmsg; the rest never originate from the engine at all.
            return Err(Error::Wire(wdlib::Error::OpcodeMismatch));
        }
    })
}

/// Drive one client connection end to end: accept, then alternate
/// between waiting on the client and forwarding to/from the engine over
/// `sibling`, until teardown.
pub async fn run_connection(
    mut active: ActiveConn,
    sibling: &IpcChannel,
    inbox: tokio::sync::mpsc::UnboundedReceiver<IpcFrame>,
    writeback: &WritebackStore,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let key = active.key;
    let mut inbox = inbox;
    let mut engine_requested_term = false;
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                // Matches conn_teardownall(): tear the connection down
                // directly, no IPC notification to the engine.
                info!("client {key} tearing down for server shutdown");
                engine_requested_term = true;
                break;
            }
            recv = active.conn.recv_message(CLIENT_TIMEOUT) => {
                match recv {
                    Ok(RecvOutcome::Message(mut msg)) => {
                        active.should_heartbeat = false;
                        if msg.error.is_some() {
                            warn!("client {key} sent invalid message: {:?}", msg.error);
                            continue;
                        }
                        if !active.initialized
                            && msg.opcode() == Opcode::SendFile
                            && active.pending_archive.is_some()
                        {
                            warn!("client {key} sent a second archive before INITIALIZED");
                            if let Ok(mut err) = NetMsg::new(Opcode::Error, None) {
                                if err.setlabel(&Error::DuplicatePendingArchive.to_string()).is_ok() {
                                    active.conn.send(err);
                                }
                            }
                            continue;
                        }
                        match client_to_engine(key, &mut msg) {
                            Ok(Some(frame)) => {
                                if frame.msg_type == MessageType::PutArchive {
                                    active.pending_archive = Some(msg);
                                }
                                if let Err(e) = sibling.send_frame(&frame).await {
                                    error!("ipc send to engine failed for {key}: {e}");
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("translating client message for {key}: {e}"),
                        }
                    }
                    Ok(RecvOutcome::Pending) => {}
                    Ok(RecvOutcome::UnknownOpcode(b)) => {
                        warn!("client {key} sent unknown opcode {b}");
                        break;
                    }
                    Ok(RecvOutcome::Eof) => {
                        info!("client {key} disconnected");
                        break;
                    }
                    Ok(RecvOutcome::Timeout) => {
                        if active.should_heartbeat {
                            warn!("client {key} missed heartbeat, tearing down");
                            break;
                        }
                        active.should_heartbeat = true;
                        if let Ok(hb) = wdvm::message::heartbeat() {
                            active.conn.send(hb);
                        }
                    }
                    Err(e) => {
                        error!("fatal connection error for client {key}: {e}");
                        break;
                    }
                }
            }
            frame = inbox.recv() => {
                match frame {
                    Some(frame) if frame.msg_type == MessageType::RequestTerm => {
                        info!("engine requested teardown for client {key}");
                        engine_requested_term = true;
                        break;
                    }
                    Some(frame) => {
                        if frame.msg_type == MessageType::Initialized {
                            active.initialized = true;
                            active.pending_archive = None;
                        }
                        match engine_to_client(&frame, writeback) {
                            Ok(msg) => active.conn.send(msg),
                            Err(e) => error!("translating engine frame for {key}: {e}"),
                        }
                    }
                    None => {
                        warn!("engine channel closed while client {key} still connected");
                        break;
                    }
                }
            }
        }

        if !active.conn.queue.is_empty() {
            match active.conn.flush().await {
                Ok(SendOutcome::Flushed | SendOutcome::WouldBlock) => {}
                Err(e) => {
                    error!("send failed for client {key}: {e}");
                    break;
                }
            }
        }
    }

    if active.initialized && !engine_requested_term {
        let _ = sibling
            .send_frame(&IpcFrame::new(MessageType::Terminate, key, ""))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wdlib::key::KeyAllocator;

    #[test]
    fn key_allocator_never_reuses_a_key() {
        let mut keys = KeyAllocator::new();
        let a = keys.next();
        let b = keys.next();
        assert_ne!(a, b);
    }

    #[test]
    fn sendline_translates_to_sendline_frame() {
        let mut keys = KeyAllocator::new();
        let key = keys.next();
        let mut msg = NetMsg::new(Opcode::SendLine, None).unwrap();
        msg.setlabel("echo hi").unwrap();

        let frame = client_to_engine(key, &mut msg).unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::SendLine);
        assert_eq!(frame.payload, "echo hi");
        assert_eq!(frame.key, key);
    }

    #[test]
    fn ack_translates_to_clientack_frame_with_empty_payload() {
        let mut keys = KeyAllocator::new();
        let key = keys.next();
        let mut msg = NetMsg::new(Opcode::Ack, None).unwrap();
        let frame = client_to_engine(key, &mut msg).unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::ClientAck);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn heartbeat_produces_no_frame() {
        let mut keys = KeyAllocator::new();
        let key = keys.next();
        let mut msg = NetMsg::new(Opcode::Heartbeat, None).unwrap();
        assert!(client_to_engine(key, &mut msg).unwrap().is_none());
    }

    #[test]
    fn requestterm_is_not_translated_into_a_client_netmsg() {
        // REQUESTTERM tears the connection down directly in run_connection;
        // it never becomes a message sent to the client.
        let dir = tempdir().unwrap();
        let writeback = WritebackStore::new(dir.path());
        let mut keys = KeyAllocator::new();
        let frame = IpcFrame::new(MessageType::RequestTerm, keys.next(), "");
        assert!(engine_to_client(&frame, &writeback).is_err());
    }

    #[test]
    fn error_from_engine_carries_its_label_to_the_client() {
        let dir = tempdir().unwrap();
        let writeback = WritebackStore::new(dir.path());
        let mut keys = KeyAllocator::new();
        let frame = IpcFrame::new(MessageType::Error, keys.next(), "vm connection lost");
        let mut msg = engine_to_client(&frame, &writeback).unwrap();
        assert_eq!(msg.opcode(), Opcode::Error);
        assert_eq!(msg.getlabel().unwrap(), "vm connection lost");
    }
}
