//! Per-activity scratch memory for the synchronous I/O staging paths.
//!
//! Each logical activity on an endpoint (receive, send, accept, connect) owns
//! one arena. At most one operation per activity is in flight at a time, so
//! the single inline block is almost always free when asked for; oversized or
//! overlapping requests fall back to the heap.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Size of the inline fast-path block.
pub(crate) const ARENA_BLOCK: usize = 1024;

/// Reusable scratch allocator: one inline block plus a heap fallback.
pub(crate) struct HandlerArena {
    slot: Mutex<Option<Box<[u8; ARENA_BLOCK]>>>,
}

impl HandlerArena {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(HandlerArena {
            slot: Mutex::new(Some(Box::new([0u8; ARENA_BLOCK]))),
        })
    }

    /// Lease a zeroed buffer of at least `len` bytes. Takes the inline block
    /// when it is free and large enough, else allocates.
    pub(crate) fn alloc(self: &Arc<Self>, len: usize) -> ArenaBuf {
        if len <= ARENA_BLOCK {
            if let Some(mut block) = self.slot.lock().unwrap().take() {
                block.fill(0);
                return ArenaBuf {
                    storage: Storage::Inline {
                        owner: Arc::clone(self),
                        block: Some(block),
                    },
                    len,
                };
            }
        }
        ArenaBuf {
            storage: Storage::Heap(vec![0u8; len]),
            len,
        }
    }

    fn release(&self, block: Box<[u8; ARENA_BLOCK]>) {
        *self.slot.lock().unwrap() = Some(block);
    }
}

enum Storage {
    Inline {
        owner: Arc<HandlerArena>,
        block: Option<Box<[u8; ARENA_BLOCK]>>,
    },
    Heap(Vec<u8>),
}

/// A leased scratch buffer. Returns the inline block to its arena on drop.
pub(crate) struct ArenaBuf {
    storage: Storage,
    len: usize,
}

impl ArenaBuf {
    #[cfg(test)]
    fn is_inline(&self) -> bool {
        matches!(self.storage, Storage::Inline { .. })
    }
}

impl Deref for ArenaBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.storage {
            Storage::Inline { block, .. } => &block.as_ref().unwrap()[..self.len],
            Storage::Heap(v) => &v[..self.len],
        }
    }
}

impl DerefMut for ArenaBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match &mut self.storage {
            Storage::Inline { block, .. } => &mut block.as_mut().unwrap()[..len],
            Storage::Heap(v) => &mut v[..len],
        }
    }
}

impl Drop for ArenaBuf {
    fn drop(&mut self) {
        if let Storage::Inline { owner, block } = &mut self.storage {
            if let Some(block) = block.take() {
                owner.release(block);
            }
        }
    }
}
