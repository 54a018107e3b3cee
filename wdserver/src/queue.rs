//! Outbound message queue (C3): an ordered, partial-write-aware sender
//! bound to one connection. Grounded directly on `msgqueue.c` — the
//! `cachedoffset` field there is what lets a partial write resume without
//! re-buffering the whole message.

use std::collections::VecDeque;
use std::io::ErrorKind;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use wdlib::buffer::Whence;
use wdlib::netmsg::NetMsg;

#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queue is empty; nothing left to send.
    Flushed,
    /// Some bytes are still queued but the socket isn't ready for more.
    WouldBlock,
}

pub struct SendQueue {
    queue: VecDeque<NetMsg>,
    cached_offset: u64,
}

impl SendQueue {
    pub fn new() -> Self {
        SendQueue {
            queue: VecDeque::new(),
            cached_offset: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn append(&mut self, msg: NetMsg) {
        self.queue.push_back(msg);
    }

    /// Drive as much of the queue out through `writer` as it will accept
    /// without blocking. Mirrors `conn_dosend`: seek the head to its
    /// cached offset, read what's left, write it; a full write pops the
    /// head and resets the offset, a partial write just advances it, and
    /// `WouldBlock` leaves everything untouched for the next readiness
    /// event.
    pub async fn send_ready<W>(&mut self, writer: &mut W) -> wdlib::Result<SendOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let Some(msg) = self.queue.front_mut() else {
                return Ok(SendOutcome::Flushed);
            };

            let total = msg.raw_len()?;
            if self.cached_offset >= total {
                self.queue.pop_front();
                self.cached_offset = 0;
                continue;
            }

            let remaining = (total - self.cached_offset) as usize;
            let mut buf = vec![0u8; remaining];
            msg.raw_seek(self.cached_offset as i64, Whence::Start)?;
            let n = msg.raw_read(&mut buf)?;
            buf.truncate(n);

            match writer.write(&buf).await {
                Ok(written) => {
                    self.cached_offset += written as u64;
                    if self.cached_offset >= total {
                        self.queue.pop_front();
                        self.cached_offset = 0;
                    }
                    if written < buf.len() {
                        return Ok(SendOutcome::WouldBlock);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(SendOutcome::WouldBlock);
                }
                Err(e) => return Err(wdlib::Error::Io(e)),
            }
        }
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use wdlib::netmsg::Opcode;

    /// A trivial in-memory sink implementing `AsyncWrite` so tests don't
    /// depend on whether `Vec<u8>` itself implements the trait.
    struct VecSink(Vec<u8>);

    impl AsyncWrite for VecSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn drains_multiple_messages_in_order() {
        let mut q = SendQueue::new();
        let mut a = NetMsg::new(Opcode::SendLine, None).unwrap();
        a.setlabel("first").unwrap();
        let mut b = NetMsg::new(Opcode::SendLine, None).unwrap();
        b.setlabel("second").unwrap();
        q.append(a);
        q.append(b);

        let mut out = VecSink(Vec::new());
        let outcome = q.send_ready(&mut out).await.unwrap();
        assert_eq!(outcome, SendOutcome::Flushed);
        assert!(q.is_empty());

        assert!(!out.0.is_empty());
        assert_eq!(out.0[0], Opcode::SendLine as u8);
    }

    #[tokio::test]
    async fn empty_queue_flushes_immediately() {
        let mut q = SendQueue::new();
        let mut out = VecSink(Vec::new());
        assert_eq!(
            q.send_ready(&mut out).await.unwrap(),
            SendOutcome::Flushed
        );
    }
}
