//! Connection (C4): one TLS or plain-TCP peer. Each connection is driven
//! by its owning router as a small async state machine — receive a chunk,
//! accumulate it into the in-flight netmsg, dispatch once valid, suspend
//! until the next readiness event or the idle timeout. That replaces the
//! hand-rolled event-loop callbacks (receive/timeout/teardown function
//! pointers) the source wires per connection.

use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use wdlib::filestore::FileStore;
use wdlib::netmsg::{NetMsg, Opcode};

use crate::queue::{SendOutcome, SendQueue};

/// MTU-ish chunk size for draining the socket, matching the source's
/// fixed-size receive buffer.
const RECV_CHUNK: usize = 4096;

pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Outcome of one `recv_message` call.
pub enum RecvOutcome {
    /// A fully-formed message was accumulated, or an unrecoverably invalid
    /// one (fatal `isvalid`) was — either way the caller gets it and
    /// decides what to do; the in-flight slot is always cleared after.
    Message(NetMsg),
    /// The peer sent a byte we don't recognize as an opcode before any
    /// message was in flight.
    UnknownOpcode(u8),
    /// Peer closed the socket (zero-length read).
    Eof,
    /// No read progress within the configured duration.
    Timeout,
    /// Bytes were accumulated but the in-flight message isn't complete
    /// yet; more are expected.
    Pending,
}

pub struct Connection {
    pub peer_addr: SocketAddr,
    pub queue: SendQueue,
    stream: Transport,
    inflight: Option<NetMsg>,
    messages_dir: Arc<FileStore>,
}

impl Connection {
    pub fn new(stream: Transport, peer_addr: SocketAddr, messages_dir: Arc<FileStore>) -> Self {
        Connection {
            peer_addr,
            queue: SendQueue::new(),
            stream,
            inflight: None,
            messages_dir,
        }
    }

    pub fn send(&mut self, msg: NetMsg) {
        self.queue.append(msg);
    }

    pub async fn flush(&mut self) -> wdlib::Result<SendOutcome> {
        self.queue.send_ready(&mut self.stream).await
    }

    /// Wait for the next readable chunk (up to `idle_timeout`), feed it
    /// through the in-flight netmsg, and report what happened. Re-arms on
    /// every call, so a caller that suspends receiving to await an engine
    /// round-trip and later calls this again gets a fresh timeout window.
    pub async fn recv_message(&mut self, idle_timeout: Duration) -> wdlib::Result<RecvOutcome> {
        let mut buf = [0u8; RECV_CHUNK];
        let n = match timeout(idle_timeout, self.stream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(wdlib::Error::Io(e)),
            Err(_elapsed) => return Ok(RecvOutcome::Timeout),
        };

        if n == 0 {
            return Ok(RecvOutcome::Eof);
        }

        self.feed(&buf[..n])
    }

    fn feed(&mut self, chunk: &[u8]) -> wdlib::Result<RecvOutcome> {
        if self.inflight.is_none() {
            let opcode_byte = chunk[0];
            let opcode = match Opcode::try_from(opcode_byte) {
                Ok(op) => op,
                Err(_) => return Ok(RecvOutcome::UnknownOpcode(opcode_byte)),
            };
            let disk_store = (opcode == Opcode::SendFile).then_some(&self.messages_dir);
            let mut msg = NetMsg::new(opcode, disk_store)?;
            if chunk.len() > 1 {
                msg.raw_write(&chunk[1..])?;
            }
            self.inflight = Some(msg);
        } else {
            self.inflight.as_mut().unwrap().raw_write(chunk)?;
        }

        let msg = self.inflight.as_mut().unwrap();
        let (ok, fatal) = msg.isvalid()?;
        if ok {
            msg.clear_error();
            debug!("delivering valid {:?} from {}", msg.opcode(), self.peer_addr);
            Ok(RecvOutcome::Message(self.inflight.take().unwrap()))
        } else if fatal {
            warn!(
                "fatally invalid {:?} from {}: {:?}",
                msg.opcode(),
                self.peer_addr,
                msg.error
            );
            Ok(RecvOutcome::Message(self.inflight.take().unwrap()))
        } else {
            // non-fatal short read: keep accumulating, nothing to deliver yet.
            Ok(RecvOutcome::Pending)
        }
    }

    pub fn messages_dir(&self) -> &Path {
        self.messages_dir.dir()
    }
}
