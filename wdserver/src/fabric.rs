//! Process fabric (C5): the parent/frontend/engine process topology and
//! the framed message bus connecting them. Grounded on `proc.c`:
//! `proc_childforkwithnewsock` (fork + socketpair per child),
//! `proc_startall` (one extra socketpair whose ends are FD-passed to each
//! child in an INITFD message), and `proc_poststartsetup` (privilege
//! drop order: resolve user, chroot, setresgid before setresuid, then
//! install signal handlers).
//!
//! The wire format extends `ipcmsg.c`'s `{key,payload}` envelope with a
//! single leading message-type byte, since the source's outer `imsg`
//! framing (not present in the retrieved sources beyond its use) carries
//! that tag at a layer above the ipcmsg struct itself. Each frame is sent
//! as one `SOCK_SEQPACKET` datagram, so no additional length-delimiting
//! is needed on top of `ipcmsg`'s own embedded length field.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::unistd::{self, ForkResult, Uid};
use tokio_seqpacket::UnixSeqpacket;
use wdlib::ipc::IpcMessage;
use wdlib::BackendKey;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    PutArchive = 1,
    SendLine = 2,
    RequestLine = 3,
    SendFile = 4,
    ClientAck = 5,
    Initialized = 6,
    RequestTerm = 7,
    Terminate = 8,
    Error = 9,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MessageType::PutArchive,
            2 => MessageType::SendLine,
            3 => MessageType::RequestLine,
            4 => MessageType::SendFile,
            5 => MessageType::ClientAck,
            6 => MessageType::Initialized,
            7 => MessageType::RequestTerm,
            8 => MessageType::Terminate,
            9 => MessageType::Error,
            _ => return Err(Error::Wire(wdlib::Error::OpcodeMismatch)),
        })
    }
}

/// One frontend<->engine message: a type tag plus the `{key,payload}`
/// envelope from `ipcmsg.c`. `payload` carries whatever string that
/// message type needs (a line of text, a writeback/messages-dir path, or
/// empty for bare signals like CLIENTACK/TERMINATE/INITIALIZED).
#[derive(Debug, Clone)]
pub struct IpcFrame {
    pub msg_type: MessageType,
    pub key: BackendKey,
    pub payload: String,
}

impl IpcFrame {
    pub fn new(msg_type: MessageType, key: BackendKey, payload: impl Into<String>) -> Self {
        IpcFrame {
            msg_type,
            key,
            payload: payload.into(),
        }
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        let inner = IpcMessage::new(self.key.0, self.payload.clone()).marshal()?;
        let mut out = Vec::with_capacity(1 + inner.len());
        out.push(self.msg_type as u8);
        out.extend_from_slice(&inner);
        Ok(out)
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let (&tag, rest) = buf.split_first().ok_or(Error::Wire(wdlib::Error::Truncated))?;
        let msg_type = MessageType::try_from(tag)?;
        let inner = IpcMessage::unmarshal(rest)?;
        Ok(IpcFrame {
            msg_type,
            key: BackendKey(inner.key),
            payload: inner.payload,
        })
    }
}

/// A framed, FD-capable channel between two processes. Backed by
/// `SOCK_SEQPACKET` so message boundaries survive without extra framing.
pub struct IpcChannel {
    socket: UnixSeqpacket,
}

impl IpcChannel {
    /// `fd` must already be `SOCK_SEQPACKET` and non-blocking (the
    /// `socketpair` call in `spawn` sets both).
    pub fn from_owned_fd(fd: OwnedFd) -> std::io::Result<Self> {
        use std::os::fd::IntoRawFd;
        let socket = unsafe { UnixSeqpacket::from_raw_fd(fd.into_raw_fd()) };
        Ok(IpcChannel { socket })
    }

    pub async fn send_frame(&self, frame: &IpcFrame) -> Result<()> {
        self.socket.send(&frame.marshal()?).await?;
        Ok(())
    }

    pub async fn recv_frame(&self) -> Result<IpcFrame> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.socket.recv(&mut buf).await?;
        IpcFrame::unmarshal(&buf[..n])
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Which role a process plays after the fork/FD-handoff dance.
pub enum Role {
    Parent { frontend_pid: unistd::Pid, engine_pid: unistd::Pid },
    Frontend { sibling: IpcChannel },
    Engine { sibling: IpcChannel },
}

fn seqpacket_pair() -> nix::Result<(OwnedFd, OwnedFd)> {
    socket::socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    )
}

/// Forks the frontend and engine children, hands each one end of a
/// freshly created sibling socketpair via `SCM_RIGHTS`, and returns the
/// caller's role. The parent branch returns immediately with both pids;
/// each child branch returns its own sibling channel.
pub fn spawn() -> Result<Role> {
    let (frontend_sib, engine_sib) = seqpacket_pair()?;

    match unsafe { unistd::fork() }? {
        ForkResult::Parent { child: frontend_pid } => {
            // second fork for the engine
            match unsafe { unistd::fork() }? {
                ForkResult::Parent { child: engine_pid } => {
                    drop(frontend_sib);
                    drop(engine_sib);
                    Ok(Role::Parent {
                        frontend_pid,
                        engine_pid,
                    })
                }
                ForkResult::Child => {
                    drop(frontend_sib);
                    let channel = IpcChannel::from_owned_fd(engine_sib)
                        .map_err(Error::Io)?;
                    Ok(Role::Engine { sibling: channel })
                }
            }
        }
        ForkResult::Child => {
            drop(engine_sib);
            let channel = IpcChannel::from_owned_fd(frontend_sib).map_err(Error::Io)?;
            Ok(Role::Frontend { sibling: channel })
        }
    }
}

/// Privilege drop sequence, applied by every process after it has bound
/// the sockets it needs: resolve the target user *before* chrooting (so
/// `/etc/passwd` lookups still see the real filesystem), chroot, then
/// `setresgid` before `setresuid` — group before user, matching
/// `proc_poststartsetup`.
pub fn drop_privileges(user: &str, chroot_dir: &std::path::Path) -> Result<()> {
    let pwent = nix::unistd::User::from_name(user)?.ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such user: {user}"),
        ))
    })?;

    unistd::chroot(chroot_dir)?;
    unistd::chdir("/")?;

    // group before user: once setuid drops root, setgid would no longer
    // be permitted.
    unistd::setresgid(pwent.gid, pwent.gid, pwent.gid)?;
    unistd::setresuid(
        Uid::from_raw(pwent.uid.as_raw()),
        Uid::from_raw(pwent.uid.as_raw()),
        Uid::from_raw(pwent.uid.as_raw()),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips_through_marshal_unmarshal() {
        let frame = IpcFrame::new(MessageType::SendLine, BackendKey(42), "echo hi");
        let bytes = frame.marshal().unwrap();
        let back = IpcFrame::unmarshal(&bytes).unwrap();
        assert_eq!(back.msg_type, MessageType::SendLine);
        assert_eq!(back.key, BackendKey(42));
        assert_eq!(back.payload, "echo hi");
    }

    #[test]
    fn empty_payload_roundtrips() {
        let frame = IpcFrame::new(MessageType::ClientAck, BackendKey(7), "");
        let bytes = frame.marshal().unwrap();
        let back = IpcFrame::unmarshal(&bytes).unwrap();
        assert_eq!(back.msg_type, MessageType::ClientAck);
        assert!(back.payload.is_empty());
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let frame = IpcFrame::new(MessageType::Error, BackendKey(1), "boom");
        let mut bytes = frame.marshal().unwrap();
        bytes[0] = 0xff;
        assert!(IpcFrame::unmarshal(&bytes).is_err());
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        assert!(IpcFrame::unmarshal(&[]).is_err());
    }
}
