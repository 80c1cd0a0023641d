//! Two ends of a byte ring driven through the real pointer arithmetic.
//!
//! The writer only sees the read pointer the reader last pushed, and the
//! reader only sees the write pointer the writer last pushed, just as each
//! side only sees the mirrored quad in its own window. Bytes are checked
//! against a plain FIFO.

use std::collections::VecDeque;

use rskt_transport_shm::handshake::{INITIAL_READ_PTR, INITIAL_WRITE_PTR};
use rskt_transport_shm::{free_bytes, segments, used_bytes, Segment, MIN_BUFFER_SIZE};

/// Largest ring the harnesses build; small rings wrap more often.
pub const MAX_RING: u32 = 256;

#[derive(Debug, Clone, bolero::TypeGenerator)]
pub enum RingOp {
    /// Writer copies up to this many bytes into the rx region.
    Write(u16),
    /// Reader drains up to this many bytes.
    Read(u16),
    /// Writer pushes its header quad. Data always lands before the pointer
    /// that publishes it.
    PushWriter,
    /// Reader pushes its header quad.
    PushReader,
}

pub struct RingModel {
    size: u32,
    /// Peer-visible rx region.
    rx: Vec<u8>,
    local_write: u32,
    /// Writer's view of the reader's pointer.
    seen_read: u32,
    local_read: u32,
    /// Reader's view of the writer's pointer.
    seen_write: u32,
    /// Bytes written and not yet read, in order.
    expected: VecDeque<u8>,
    next_byte: u8,
}

/// Power-of-two ring size in `[MIN_BUFFER_SIZE, MAX_RING]` from a fuzz byte.
pub fn ring_size(raw: u8) -> u32 {
    let shifts = (MAX_RING / MIN_BUFFER_SIZE).trailing_zeros() + 1;
    MIN_BUFFER_SIZE << (raw as u32 % shifts)
}

fn check_segments(size: u32, start: u32, len: u32, (first, second): (Segment, Option<Segment>)) -> Result<(), String> {
    if first.offset != start {
        return Err(format!("first segment at {}, expected {start}", first.offset));
    }
    if first.offset + first.len > size {
        return Err(format!("first segment {first:?} runs past {size}"));
    }
    let total = first.len + second.map_or(0, |s| s.len);
    if total != len {
        return Err(format!("segments cover {total} bytes, expected {len}"));
    }
    match second {
        Some(s) if s.offset != 0 || first.offset + first.len != size => {
            Err(format!("wrapped segment {s:?} after {first:?}"))
        }
        Some(s) if s.len == 0 => Err("empty wrapped segment".to_string()),
        _ => Ok(()),
    }
}

impl RingModel {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            rx: vec![0; size as usize],
            local_write: INITIAL_WRITE_PTR,
            seen_read: INITIAL_READ_PTR,
            local_read: INITIAL_READ_PTR,
            seen_write: INITIAL_WRITE_PTR,
            expected: VecDeque::new(),
            next_byte: 0,
        }
    }

    fn mask(&self) -> u32 {
        self.size - 1
    }

    pub fn apply(&mut self, op: &RingOp) -> Result<(), String> {
        match *op {
            RingOp::Write(want) => {
                let free = free_bytes(self.size, self.local_write, self.seen_read);
                let n = free.min(u32::from(want));
                if n == 0 {
                    return Ok(());
                }
                let start = self.local_write;
                let split = segments(self.size, start, n);
                check_segments(self.size, start, n, split)?;
                for seg in std::iter::once(split.0).chain(split.1) {
                    for i in 0..seg.len {
                        self.rx[(seg.offset + i) as usize] = self.next_byte;
                        self.expected.push_back(self.next_byte);
                        self.next_byte = self.next_byte.wrapping_add(1);
                    }
                }
                self.local_write = start.wrapping_add(n) & self.mask();
            }
            RingOp::Read(want) => {
                let used = used_bytes(self.size, self.seen_write, self.local_read);
                let n = used.min(u32::from(want));
                if n == 0 {
                    return Ok(());
                }
                let start = self.local_read.wrapping_add(1) & self.mask();
                let split = segments(self.size, start, n);
                check_segments(self.size, start, n, split)?;
                for seg in std::iter::once(split.0).chain(split.1) {
                    for i in 0..seg.len {
                        let got = self.rx[(seg.offset + i) as usize];
                        match self.expected.pop_front() {
                            Some(want) if want == got => {}
                            other => return Err(format!("read {got}, expected {other:?}")),
                        }
                    }
                }
                self.local_read = self.local_read.wrapping_add(n) & self.mask();
            }
            RingOp::PushWriter => self.seen_write = self.local_write,
            RingOp::PushReader => self.seen_read = self.local_read,
        }
        self.verify()
    }

    fn verify(&self) -> Result<(), String> {
        let size = self.size;
        let used = used_bytes(size, self.local_write, self.local_read);
        if used as usize != self.expected.len() {
            return Err(format!("{used} bytes in flight, model holds {}", self.expected.len()));
        }
        // One slot always stays empty so full and empty differ.
        let free = free_bytes(size, self.local_write, self.local_read);
        if free + used != size - 1 {
            return Err(format!("free {free} + used {used} != {}", size - 1));
        }
        // Stale views only ever understate what the other side allows.
        if free_bytes(size, self.local_write, self.seen_read) > free {
            return Err("writer overestimates free space".to_string());
        }
        if used_bytes(size, self.seen_write, self.local_read) > used {
            return Err("reader overestimates unread bytes".to_string());
        }
        Ok(())
    }
}

/// Run `ops` on a fresh ring of `size` bytes.
pub fn execute_and_verify(size: u32, ops: &[RingOp]) -> Result<(), String> {
    let mut ring = RingModel::new(size);
    for (step, op) in ops.iter().enumerate() {
        ring.apply(op).map_err(|e| format!("step {step} ({op:?}): {e}"))?;
    }
    Ok(())
}
