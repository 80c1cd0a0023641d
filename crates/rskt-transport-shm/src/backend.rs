//! The memory fabric underneath a ring.
//!
//! A [`Backend`] exposes named, remotely-writable memory windows and the two
//! primitives that move bytes from a local window into a remote one. The ring
//! never touches remote memory directly; every byte that crosses goes through
//! [`Backend::push_bytes`] or [`Backend::dma_write`].

use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// A fabric port opened by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle(pub u32);

/// Identifies one memory object on the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Which primitive carries bytes to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transfer {
    /// Object-addressed copy: (local object, offset) → (remote object, offset).
    #[default]
    Push,
    /// Address-based DMA: (local object, offset) → (destination id, bus address).
    Dma,
}

/// What a lookup of a remote object yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteObject {
    pub object: ObjectId,
    /// Fabric node that owns the object.
    pub dest_id: u32,
    /// Bus address of the object's first byte.
    pub bus_addr: u64,
    pub size: usize,
}

impl RemoteObject {
    /// Bus address of `offset` within the object.
    #[inline]
    pub fn addr_of(&self, offset: usize) -> u64 {
        self.bus_addr + offset as u64
    }
}

/// Errors surfaced by a backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("port {0:?} is not open")]
    NoSuchPort(PortHandle),

    #[error("memory object {0} does not exist")]
    NoSuchObject(ObjectId),

    #[error("window {name:?} exists with size {existing}, requested {requested}")]
    SizeMismatch {
        name: String,
        existing: usize,
        requested: usize,
    },

    #[error("window name must not be empty")]
    EmptyName,

    #[error("transfer of {len} bytes at offset {offset} exceeds object size {size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("no memory object at bus address {addr:#x} on destination {dest_id}")]
    AddressUnmapped { dest_id: u32, addr: u64 },

    #[error("backend failure: {0}")]
    Other(String),
}

/// A window mapped into this process.
///
/// The mapping stays valid for as long as the `MappedWindow` lives: it holds
/// a reference to whatever owns the memory.
pub struct MappedWindow {
    object: ObjectId,
    name: String,
    base: NonNull<u8>,
    len: usize,
    _backing: Arc<dyn Any + Send + Sync>,
}

// SAFETY: the window is plain memory; all concurrent access to it goes
// through atomics or through regions each side owns exclusively.
unsafe impl Send for MappedWindow {}
unsafe impl Sync for MappedWindow {}

impl MappedWindow {
    /// Wrap a mapping produced by a backend.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes, 8-byte
    /// aligned, and stay valid while `backing` is alive. Writes through the
    /// pointer must be permitted by `backing` (interior mutability).
    pub unsafe fn new(
        object: ObjectId,
        name: impl Into<String>,
        base: NonNull<u8>,
        len: usize,
        backing: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            object,
            name: name.into(),
            base,
            len,
            _backing: backing,
        }
    }

    #[inline]
    pub fn object(&self) -> ObjectId {
        self.object
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl fmt::Debug for MappedWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedWindow")
            .field("object", &self.object)
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}

/// A memory fabric.
pub trait Backend: Send + Sync + 'static {
    /// Open a port for this process.
    fn open_port(&self) -> Result<PortHandle, BackendError>;

    /// Create (or attach to) the named window and map it locally.
    fn map_window(
        &self,
        port: PortHandle,
        name: &str,
        size: usize,
    ) -> Result<MappedWindow, BackendError>;

    /// Drop a mapping created by [`map_window`](Backend::map_window).
    fn unmap_window(&self, port: PortHandle, window: &MappedWindow) -> Result<(), BackendError>;

    /// Resolve the peer's window by name.
    ///
    /// The result holds a reference on the object until it is handed back
    /// to [`release`](Backend::release).
    fn lookup(&self, port: PortHandle, name: &str, size: usize)
        -> Result<RemoteObject, BackendError>;

    /// Drop a reference taken by [`lookup`](Backend::lookup).
    fn release(&self, port: PortHandle, remote: &RemoteObject) -> Result<(), BackendError>;

    /// Copy `len` bytes from a local object into a remote object.
    fn push_bytes(
        &self,
        port: PortHandle,
        local: ObjectId,
        local_offset: usize,
        remote: ObjectId,
        remote_offset: usize,
        len: usize,
    ) -> Result<(), BackendError>;

    /// Copy `len` bytes from a local object to a bus address on `dest_id`.
    fn dma_write(
        &self,
        port: PortHandle,
        local: ObjectId,
        local_offset: usize,
        dest_id: u32,
        target_addr: u64,
        len: usize,
    ) -> Result<(), BackendError>;
}
