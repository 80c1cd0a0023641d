//! Generation-checked socket handle table.
//!
//! Slots live in fixed 256-entry blocks that are allocated on demand up to a
//! configured maximum. Each slot packs its generation and its
//! [`SocketState`] into one atomic word, so validating a handle and changing
//! the state is a single compare-and-swap. Released slots go to the *tail*
//! of the free list, which stretches the time before any one slot's
//! generation wraps.
//!
//! ```text
//! tag (u64): [ generation:32 | unused:24 | state:8 ]
//! handle (u64): [ generation:32 | index:32 ]
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::state::SocketState;

/// Slots per block.
pub const BLOCK_SIZE: usize = 256;

/// Generation every slot starts with; a zero handle is never valid.
const FIRST_GENERATION: u32 = 1;

/// Opaque reference to a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index(), self.generation())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("handle table is full")]
    Exhausted,

    #[error("handle {0} was never issued")]
    Invalid(Handle),

    #[error("handle {0} is stale")]
    Stale(Handle),

    #[error("socket is {actual}, expected {expected}")]
    WrongState {
        expected: SocketState,
        actual: SocketState,
    },

    #[error("transition out of {0} refused")]
    Refused(SocketState),
}

#[inline]
fn pack(generation: u32, state: SocketState) -> u64 {
    ((generation as u64) << 32) | state as u64
}

#[inline]
fn unpack(tag: u64) -> (u32, SocketState) {
    let state = SocketState::from_u8(tag as u8).unwrap_or(SocketState::Uninit);
    ((tag >> 32) as u32, state)
}

struct Slot<T> {
    tag: AtomicU64,
    value: RwLock<Option<Arc<T>>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            tag: AtomicU64::new(pack(FIRST_GENERATION, SocketState::Uninit)),
            value: RwLock::new(None),
        }
    }
}

/// Table of live sockets keyed by [`Handle`].
pub struct HandleTable<T> {
    blocks: Box<[OnceLock<Box<[Slot<T>]>>]>,
    /// Free slot indices plus the number of blocks handed out so far.
    free: Mutex<(VecDeque<u32>, usize)>,
}

impl<T> HandleTable<T> {
    /// A table that can hold up to `capacity` sockets, rounded up to whole blocks.
    pub fn new(capacity: usize) -> Self {
        let blocks = capacity.div_ceil(BLOCK_SIZE).max(1);
        Self {
            blocks: (0..blocks).map(|_| OnceLock::new()).collect(),
            free: Mutex::new((VecDeque::new(), 0)),
        }
    }

    /// Total slots the table may grow to.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * BLOCK_SIZE
    }

    fn slot(&self, index: u32) -> Option<&Slot<T>> {
        let index = index as usize;
        self.blocks
            .get(index / BLOCK_SIZE)?
            .get()
            .map(|block| &block[index % BLOCK_SIZE])
    }

    fn slot_for(&self, handle: Handle) -> Result<&Slot<T>, TableError> {
        self.slot(handle.index()).ok_or(TableError::Invalid(handle))
    }

    /// Take a free slot, store `value` in it and mark it `alloced`.
    pub fn acquire(&self, value: T) -> Result<Handle, TableError> {
        let index = {
            let mut free = self.free.lock();
            if free.0.is_empty() {
                let next = free.1;
                let block = self.blocks.get(next).ok_or(TableError::Exhausted)?;
                block.get_or_init(|| (0..BLOCK_SIZE).map(|_| Slot::new()).collect());
                let base = (next * BLOCK_SIZE) as u32;
                free.0.extend(base..base + BLOCK_SIZE as u32);
                free.1 += 1;
            }
            free.0.pop_front().ok_or(TableError::Exhausted)?
        };

        let slot = self.slot(index).ok_or(TableError::Exhausted)?;
        *slot.value.write() = Some(Arc::new(value));
        // Only the free list hands out `index`, so nobody else touches the tag.
        let (generation, _) = unpack(slot.tag.load(Ordering::Acquire));
        slot.tag
            .store(pack(generation, SocketState::Alloced), Ordering::Release);
        Ok(Handle::new(index, generation))
    }

    /// Invalidate `handle` and return its slot to the free list.
    ///
    /// Legal from every state. The generation is bumped in the same
    /// compare-and-swap that resets the state, so a racing [`get`](Self::get)
    /// or transition with the old handle fails.
    pub fn release(&self, handle: Handle) -> Result<Arc<T>, TableError> {
        let slot = self.slot_for(handle)?;
        let mut cur = slot.tag.load(Ordering::Acquire);
        loop {
            let (generation, state) = unpack(cur);
            if generation != handle.generation() || state == SocketState::Uninit {
                return Err(TableError::Stale(handle));
            }
            let next_gen = match generation.wrapping_add(1) {
                0 => FIRST_GENERATION,
                g => g,
            };
            match slot.tag.compare_exchange_weak(
                cur,
                pack(next_gen, SocketState::Uninit),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        let value = slot.value.write().take();
        self.free.lock().0.push_back(handle.index());
        value.ok_or(TableError::Stale(handle))
    }

    /// The value behind a live handle.
    pub fn get(&self, handle: Handle) -> Result<Arc<T>, TableError> {
        let slot = self.slot_for(handle)?;
        self.check(slot, handle)?;
        let value = slot.value.read().clone();
        // A release + reacquire between the check and the read changes the tag.
        self.check(slot, handle)?;
        value.ok_or(TableError::Stale(handle))
    }

    fn check(&self, slot: &Slot<T>, handle: Handle) -> Result<SocketState, TableError> {
        let (generation, state) = unpack(slot.tag.load(Ordering::Acquire));
        if generation != handle.generation() || state == SocketState::Uninit {
            return Err(TableError::Stale(handle));
        }
        Ok(state)
    }

    /// Current state of a live handle.
    pub fn state(&self, handle: Handle) -> Result<SocketState, TableError> {
        let slot = self.slot_for(handle)?;
        self.check(slot, handle)
    }

    /// Move `from → to` if and only if the socket is in `from`.
    pub fn transition(
        &self,
        handle: Handle,
        from: SocketState,
        to: SocketState,
    ) -> Result<(), TableError> {
        let slot = self.slot_for(handle)?;
        let expected = pack(handle.generation(), from);
        match slot.tag.compare_exchange(
            expected,
            pack(handle.generation(), to),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(actual) => {
                let (generation, actual) = unpack(actual);
                if generation != handle.generation() || actual == SocketState::Uninit {
                    Err(TableError::Stale(handle))
                } else {
                    Err(TableError::WrongState {
                        expected: from,
                        actual,
                    })
                }
            }
        }
    }

    /// Apply `f` to the current state atomically. `f` returning `None`
    /// refuses the move. Returns the state that was replaced.
    pub fn update(
        &self,
        handle: Handle,
        f: impl Fn(SocketState) -> Option<SocketState>,
    ) -> Result<SocketState, TableError> {
        let slot = self.slot_for(handle)?;
        let mut cur = slot.tag.load(Ordering::Acquire);
        loop {
            let (generation, state) = unpack(cur);
            if generation != handle.generation() || state == SocketState::Uninit {
                return Err(TableError::Stale(handle));
            }
            let next = f(state).ok_or(TableError::Refused(state))?;
            match slot.tag.compare_exchange_weak(
                cur,
                pack(generation, next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(state),
                Err(actual) => cur = actual,
            }
        }
    }

    /// First live handle whose value matches.
    pub fn find(&self, mut matches: impl FnMut(&T) -> bool) -> Option<Handle> {
        let grown = self.free.lock().1;
        for (b, block) in self.blocks.iter().take(grown).enumerate() {
            let Some(block) = block.get() else { continue };
            for (i, slot) in block.iter().enumerate() {
                let (generation, state) = unpack(slot.tag.load(Ordering::Acquire));
                if state == SocketState::Uninit {
                    continue;
                }
                let handle = Handle::new((b * BLOCK_SIZE + i) as u32, generation);
                let Some(value) = slot.value.read().clone() else { continue };
                if matches(&value) && self.check(slot, handle).is_ok() {
                    return Some(handle);
                }
            }
        }
        None
    }

    /// Every live handle.
    pub fn handles(&self) -> Vec<Handle> {
        let grown = self.free.lock().1;
        let mut out = Vec::new();
        for (b, block) in self.blocks.iter().take(grown).enumerate() {
            let Some(block) = block.get() else { continue };
            for (i, slot) in block.iter().enumerate() {
                let (generation, state) = unpack(slot.tag.load(Ordering::Acquire));
                if state != SocketState::Uninit {
                    out.push(Handle::new((b * BLOCK_SIZE + i) as u32, generation));
                }
            }
        }
        out
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
