//! Window layout and typed views of the header.
//!
//! The header holds two quads of 32-bit big-endian words. The local quad is
//! this side's pointers and flags; the remote quad is a mirror of the
//! peer's local quad, written only by the peer's header push. Code never
//! computes header offsets by hand: [`RingWindow`] checks the bounds once at
//! construction and hands out [`LocalQuad`] (writable) and [`RemoteQuad`]
//! (read-only) views.

use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::backend::MappedWindow;

/// Size of the window header.
pub const HEADER_SIZE: usize = 64;

/// Size of one header quad: write ptr, write flags, read ptr, read flags.
pub const QUAD_SIZE: usize = 16;

/// Offset of this side's quad.
pub const LOCAL_QUAD_OFFSET: usize = 0;

/// Offset of the peer's mirrored quad.
pub const REMOTE_QUAD_OFFSET: usize = 16;

pub const MIN_BUFFER_SIZE: u32 = 16;
pub const MAX_BUFFER_SIZE: u32 = 16 << 20;
pub const DEFAULT_BUFFER_SIZE: u32 = 64 << 10;

const WR_PTR: usize = 0;
const WR_FLAGS: usize = 1;
const RD_PTR: usize = 2;
const RD_FLAGS: usize = 3;

bitflags! {
    /// Physical flag bits as they appear in a header word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct WireFlags: u32 {
        const INIT = 0x01;
        const INIT_DONE = 0x02;
        const ZEROED = 0x04;
        const CLOSING = 0x10;
        const CLOSED = 0x20;
        const ERROR = 0x40;
    }
}

bitflags! {
    /// Handshake progress.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HandshakeFlags: u8 {
        /// Pointers are set up; data may flow.
        const INIT = 1 << 0;
        /// This side has mapped its window and is announcing itself.
        const INIT_DONE = 1 << 1;
        /// This side's view of the header has been zeroed.
        const ZEROED = 1 << 2;
    }
}

bitflags! {
    /// Link liveness.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LinkFlags: u8 {
        /// No more bytes will be written.
        const CLOSING = 1 << 0;
        /// This side is gone.
        const CLOSED = 1 << 1;
        /// This side hit an error and abandoned the link.
        const ERROR = 1 << 2;
    }
}

const HANDSHAKE_BITS: [(HandshakeFlags, WireFlags); 3] = [
    (HandshakeFlags::INIT, WireFlags::INIT),
    (HandshakeFlags::INIT_DONE, WireFlags::INIT_DONE),
    (HandshakeFlags::ZEROED, WireFlags::ZEROED),
];

const LINK_BITS: [(LinkFlags, WireFlags); 3] = [
    (LinkFlags::CLOSING, WireFlags::CLOSING),
    (LinkFlags::CLOSED, WireFlags::CLOSED),
    (LinkFlags::ERROR, WireFlags::ERROR),
];

/// The flags word of one side of a quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SideFlags {
    pub handshake: HandshakeFlags,
    pub link: LinkFlags,
}

impl SideFlags {
    pub const fn new(handshake: HandshakeFlags, link: LinkFlags) -> Self {
        Self { handshake, link }
    }

    pub fn to_wire(self) -> u32 {
        let mut bits = WireFlags::empty();
        for (flag, wire) in HANDSHAKE_BITS {
            if self.handshake.contains(flag) {
                bits |= wire;
            }
        }
        for (flag, wire) in LINK_BITS {
            if self.link.contains(flag) {
                bits |= wire;
            }
        }
        bits.bits()
    }

    /// Decode a flags word. Unknown bits are ignored.
    pub fn from_wire(raw: u32) -> Self {
        let bits = WireFlags::from_bits_truncate(raw);
        let mut out = Self::default();
        for (flag, wire) in HANDSHAKE_BITS {
            if bits.contains(wire) {
                out.handshake |= flag;
            }
        }
        for (flag, wire) in LINK_BITS {
            if bits.contains(wire) {
                out.link |= flag;
            }
        }
        out
    }
}

/// A consistent-enough copy of one quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuadSnapshot {
    pub write_ptr: u32,
    pub write_flags: SideFlags,
    pub read_ptr: u32,
    pub read_flags: SideFlags,
}

impl QuadSnapshot {
    /// Link flags raised on either side of the quad.
    #[inline]
    pub fn link(&self) -> LinkFlags {
        self.write_flags.link | self.read_flags.link
    }
}

/// Errors from laying out a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("buffer size {0} must be a power of two between 16 bytes and 16 MiB")]
    BadBufferSize(u32),

    #[error("window of {actual} bytes is smaller than the {required} bytes the layout needs")]
    WindowTooSmall { required: usize, actual: usize },

    #[error("window base is not 4-byte aligned")]
    Misaligned,
}

/// Geometry of one side's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    buffer_size: u32,
}

impl RingLayout {
    pub fn new(buffer_size: u32) -> Result<Self, LayoutError> {
        if !buffer_size.is_power_of_two()
            || !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&buffer_size)
        {
            return Err(LayoutError::BadBufferSize(buffer_size));
        }
        Ok(Self { buffer_size })
    }

    #[inline]
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    #[inline]
    pub fn mask(&self) -> u32 {
        self.buffer_size - 1
    }

    /// Total bytes to map: header plus tx and rx regions.
    #[inline]
    pub fn window_size(&self) -> usize {
        HEADER_SIZE + 2 * self.buffer_size as usize
    }

    #[inline]
    pub fn tx_offset(&self) -> usize {
        HEADER_SIZE
    }

    #[inline]
    pub fn rx_offset(&self) -> usize {
        HEADER_SIZE + self.buffer_size as usize
    }
}

/// A mapped window with its layout validated.
#[derive(Debug)]
pub struct RingWindow {
    window: MappedWindow,
    layout: RingLayout,
}

impl RingWindow {
    pub fn new(window: MappedWindow, layout: RingLayout) -> Result<Self, (LayoutError, MappedWindow)> {
        let required = layout.window_size();
        if window.len() < required {
            let actual = window.len();
            return Err((LayoutError::WindowTooSmall { required, actual }, window));
        }
        if window.as_ptr() as usize % 4 != 0 {
            return Err((LayoutError::Misaligned, window));
        }
        Ok(Self { window, layout })
    }

    #[inline]
    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    #[inline]
    pub fn mapped(&self) -> &MappedWindow {
        &self.window
    }

    fn quad(&self, offset: usize) -> &[AtomicU32; 4] {
        // SAFETY: the header lies within the window (checked in `new`), the
        // base is 4-aligned, and AtomicU32 has the layout of u32.
        unsafe { &*(self.window.as_ptr().add(offset) as *const [AtomicU32; 4]) }
    }

    #[inline]
    pub fn local(&self) -> LocalQuad<'_> {
        LocalQuad {
            words: self.quad(LOCAL_QUAD_OFFSET),
        }
    }

    #[inline]
    pub fn remote(&self) -> RemoteQuad<'_> {
        RemoteQuad {
            words: self.quad(REMOTE_QUAD_OFFSET),
        }
    }

    /// Stage bytes in the tx region at `offset`.
    pub fn write_tx(&self, offset: u32, data: &[u8]) {
        let offset = offset as usize;
        assert!(offset + data.len() <= self.layout.buffer_size as usize);
        // SAFETY: bounds asserted above; only this side writes its tx region.
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.window.as_ptr().add(self.layout.tx_offset() + offset),
                data.len(),
            );
        }
    }

    /// Copy bytes out of the rx region at `offset`.
    pub fn read_rx(&self, offset: u32, out: &mut [u8]) {
        let offset = offset as usize;
        assert!(offset + out.len() <= self.layout.buffer_size as usize);
        // SAFETY: bounds asserted above; the peer does not write bytes the
        // read pointer has not released.
        unsafe {
            ptr::copy_nonoverlapping(
                self.window.as_ptr().add(self.layout.rx_offset() + offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }
}

#[inline]
fn load(word: &AtomicU32) -> u32 {
    u32::from_be(word.load(Ordering::Acquire))
}

#[inline]
fn store(word: &AtomicU32, value: u32) {
    word.store(value.to_be(), Ordering::Release);
}

fn snapshot(words: &[AtomicU32; 4]) -> QuadSnapshot {
    QuadSnapshot {
        write_ptr: load(&words[WR_PTR]),
        write_flags: SideFlags::from_wire(load(&words[WR_FLAGS])),
        read_ptr: load(&words[RD_PTR]),
        read_flags: SideFlags::from_wire(load(&words[RD_FLAGS])),
    }
}

/// This side's quad.
#[derive(Clone, Copy)]
pub struct LocalQuad<'a> {
    words: &'a [AtomicU32; 4],
}

impl LocalQuad<'_> {
    #[inline]
    pub fn write_ptr(&self) -> u32 {
        load(&self.words[WR_PTR])
    }

    #[inline]
    pub fn set_write_ptr(&self, value: u32) {
        store(&self.words[WR_PTR], value);
    }

    #[inline]
    pub fn read_ptr(&self) -> u32 {
        load(&self.words[RD_PTR])
    }

    #[inline]
    pub fn set_read_ptr(&self, value: u32) {
        store(&self.words[RD_PTR], value);
    }

    /// Flags of the write side. Both sides carry the same flags.
    #[inline]
    pub fn flags(&self) -> SideFlags {
        SideFlags::from_wire(load(&self.words[WR_FLAGS]))
    }

    /// Replace the handshake flags on both sides, keeping link flags.
    pub fn set_handshake(&self, handshake: HandshakeFlags) {
        self.update(|f| SideFlags::new(handshake, f.link));
    }

    /// Raise link flags on both sides.
    pub fn raise(&self, link: LinkFlags) {
        self.update(|f| SideFlags::new(f.handshake, f.link | link));
    }

    fn update(&self, f: impl Fn(SideFlags) -> SideFlags) {
        for idx in [WR_FLAGS, RD_FLAGS] {
            let word = &self.words[idx];
            let mut cur = word.load(Ordering::Acquire);
            loop {
                let next = f(SideFlags::from_wire(u32::from_be(cur))).to_wire().to_be();
                match word.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(actual) => cur = actual,
                }
            }
        }
    }

    /// Zero pointers and flags.
    pub fn zero(&self) {
        for word in self.words {
            word.store(0, Ordering::Release);
        }
    }

    pub fn snapshot(&self) -> QuadSnapshot {
        snapshot(self.words)
    }
}

/// The peer's mirrored quad. Read-only from this side.
#[derive(Clone, Copy)]
pub struct RemoteQuad<'a> {
    words: &'a [AtomicU32; 4],
}

impl RemoteQuad<'_> {
    pub fn snapshot(&self) -> QuadSnapshot {
        snapshot(self.words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Backend, LoopbackBackend};

    #[test]
    fn test_flag_bits_on_the_wire() {
        let f = SideFlags::new(
            HandshakeFlags::ZEROED | HandshakeFlags::INIT_DONE,
            LinkFlags::empty(),
        );
        assert_eq!(f.to_wire(), 0x06);
        let f = SideFlags::new(HandshakeFlags::INIT, LinkFlags::CLOSING | LinkFlags::ERROR);
        assert_eq!(f.to_wire(), 0x51);
        assert_eq!(SideFlags::from_wire(0x51), f);
        assert_eq!(SideFlags::from_wire(0x20).link, LinkFlags::CLOSED);
        // Unknown bits are dropped.
        assert_eq!(SideFlags::from_wire(0x8008), SideFlags::default());
    }

    #[test]
    fn test_layout_bounds() {
        assert!(RingLayout::new(16).is_ok());
        assert!(RingLayout::new(MAX_BUFFER_SIZE).is_ok());
        assert_eq!(RingLayout::new(8), Err(LayoutError::BadBufferSize(8)));
        assert_eq!(RingLayout::new(24), Err(LayoutError::BadBufferSize(24)));
        assert!(RingLayout::new(MAX_BUFFER_SIZE * 2).is_err());

        let layout = RingLayout::new(16).unwrap();
        assert_eq!(layout.window_size(), 96);
        assert_eq!(layout.tx_offset(), 64);
        assert_eq!(layout.rx_offset(), 80);
        assert_eq!(layout.mask(), 15);
    }

    #[test]
    fn test_quads_are_big_endian() {
        let backend = LoopbackBackend::new();
        let port = backend.open_port().unwrap();
        let layout = RingLayout::new(16).unwrap();
        let window = backend.map_window(port, "w", layout.window_size()).unwrap();
        let ring = RingWindow::new(window, layout).unwrap();

        ring.local().set_write_ptr(1);
        ring.local().raise(LinkFlags::CLOSING);
        let raw = unsafe { std::slice::from_raw_parts(ring.mapped().as_ptr(), 16) };
        assert_eq!(&raw[0..4], &[0, 0, 0, 1]);
        assert_eq!(&raw[4..8], &[0, 0, 0, 0x10]);
        assert_eq!(&raw[12..16], &[0, 0, 0, 0x10]);

        let snap = ring.local().snapshot();
        assert_eq!(snap.write_ptr, 1);
        assert_eq!(snap.read_flags.link, LinkFlags::CLOSING);
        assert_eq!(ring.remote().snapshot(), QuadSnapshot::default());

        ring.local().zero();
        assert_eq!(ring.local().snapshot(), QuadSnapshot::default());
    }

    #[test]
    fn test_window_too_small() {
        let backend = LoopbackBackend::new();
        let port = backend.open_port().unwrap();
        let window = backend.map_window(port, "w", 80).unwrap();
        let (err, _window) = RingWindow::new(window, RingLayout::new(16).unwrap()).unwrap_err();
        assert_eq!(
            err,
            LayoutError::WindowTooSmall {
                required: 96,
                actual: 80
            }
        );
    }
}
