//! Backend key: a 32-bit identifier for a job/connection, unique while the
//! owning client connection is alive. Recycled via a free list that
//! preserves the key value across reuse (it is never reset to zero).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendKey(pub u32);

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for BackendKey {
    fn from(v: u32) -> Self {
        BackendKey(v)
    }
}

impl From<BackendKey> for u32 {
    fn from(k: BackendKey) -> Self {
        k.0
    }
}

/// Allocates fresh keys from a monotonic counter; never reuses a key that
/// is still live. There is no free list here because a backend key's
/// lifetime tracks its owning active-conn slot, which has its own recycling
/// (see the frontend router's active-conn table) — the key space itself is
/// just the counter.
#[derive(Debug, Default)]
pub struct KeyAllocator {
    next: u32,
}

impl KeyAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> BackendKey {
        let key = self.next;
        self.next = self.next.wrapping_add(1);
        BackendKey(key)
    }
}
