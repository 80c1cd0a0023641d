//! In-process memory fabric.
//!
//! Every window is a heap allocation shared by all ports of one
//! [`LoopbackBackend`]. Objects come into existence on first reference,
//! whether that is a local map or a peer's lookup, zero-filled, and go away
//! when the last mapping and the last lookup are both released. Each object
//! also gets a synthetic bus address range so that [`Transfer::Dma`] can be
//! exercised the same way as object-addressed pushes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Backend, BackendError, MappedWindow, ObjectId, PortHandle, RemoteObject, Transfer};

const BUS_BASE: u64 = 0x1_0000_0000;
const BUS_ALIGN: u64 = 0x1000;

/// One recorded transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRecord {
    pub mode: Transfer,
    pub src: ObjectId,
    pub src_offset: usize,
    pub dst: ObjectId,
    pub dst_offset: usize,
    pub len: usize,
}

struct Region {
    id: ObjectId,
    name: String,
    bus_addr: u64,
    len: usize,
    // u64 cells keep the base 8-byte aligned.
    cells: Box<[AtomicU64]>,
}

impl Region {
    fn new(id: ObjectId, name: &str, bus_addr: u64, len: usize) -> Self {
        let cells = (0..len.div_ceil(8)).map(|_| AtomicU64::new(0)).collect();
        Self {
            id,
            name: name.to_owned(),
            bus_addr,
            len,
            cells,
        }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.cells.as_ptr() as *mut u8
    }

    /// 32-bit cell at a 4-aligned byte offset.
    #[inline]
    fn word(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.cells.len() * 8);
        // SAFETY: in bounds, 4-aligned, and AtomicU32 has the layout of u32.
        unsafe { &*(self.base().add(offset) as *const AtomicU32) }
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), BackendError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BackendError::OutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }
}

struct Entry {
    region: Arc<Region>,
    /// Live mappings plus unreleased lookups.
    refs: usize,
}

struct Registry {
    next_port: u32,
    ports: HashSet<u32>,
    next_object: u64,
    next_addr: u64,
    by_name: HashMap<String, ObjectId>,
    by_addr: BTreeMap<u64, ObjectId>,
    objects: HashMap<ObjectId, Entry>,
}

impl Registry {
    fn check_port(&self, port: PortHandle) -> Result<(), BackendError> {
        if self.ports.contains(&port.0) {
            Ok(())
        } else {
            Err(BackendError::NoSuchPort(port))
        }
    }

    fn get_or_create(&mut self, name: &str, size: usize) -> Result<&mut Entry, BackendError> {
        if name.is_empty() {
            return Err(BackendError::EmptyName);
        }
        let id = match self.by_name.get(name) {
            Some(id) => *id,
            None => {
                let id = ObjectId(self.next_object);
                self.next_object += 1;
                let bus_addr = self.next_addr;
                let span = (size as u64).div_ceil(BUS_ALIGN).max(1) * BUS_ALIGN;
                self.next_addr += span + BUS_ALIGN;
                let region = Arc::new(Region::new(id, name, bus_addr, size));
                tracing::trace!(object = %id, name, size, bus_addr, "loopback: created object");
                self.by_name.insert(name.to_owned(), id);
                self.by_addr.insert(bus_addr, id);
                self.objects.insert(id, Entry { region, refs: 0 });
                id
            }
        };
        let entry = self
            .objects
            .get_mut(&id)
            .ok_or(BackendError::NoSuchObject(id))?;
        if entry.region.len != size {
            return Err(BackendError::SizeMismatch {
                name: name.to_owned(),
                existing: entry.region.len,
                requested: size,
            });
        }
        Ok(entry)
    }

    fn region(&self, id: ObjectId) -> Result<Arc<Region>, BackendError> {
        self.objects
            .get(&id)
            .map(|e| e.region.clone())
            .ok_or(BackendError::NoSuchObject(id))
    }

    fn region_at(&self, addr: u64) -> Option<Arc<Region>> {
        let (_, id) = self.by_addr.range(..=addr).next_back()?;
        let region = &self.objects.get(id)?.region;
        (addr < region.bus_addr + region.len as u64).then(|| region.clone())
    }

    /// Drop one reference; the object goes away with the last one.
    fn unref(&mut self, id: ObjectId) -> Result<(), BackendError> {
        let entry = self.objects.get_mut(&id).ok_or(BackendError::NoSuchObject(id))?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            if let Some(entry) = self.objects.remove(&id) {
                tracing::trace!(object = %id, name = %entry.region.name, "loopback: released object");
                self.by_name.remove(&entry.region.name);
                self.by_addr.remove(&entry.region.bus_addr);
            }
        }
        Ok(())
    }
}

/// A [`Backend`] that keeps every window in this process.
pub struct LoopbackBackend {
    dest_id: u32,
    registry: Mutex<Registry>,
    log: Mutex<Option<Vec<TransferRecord>>>,
}

impl LoopbackBackend {
    pub const DEFAULT_DEST_ID: u32 = 1;

    pub fn new() -> Self {
        Self::with_dest_id(Self::DEFAULT_DEST_ID)
    }

    pub fn with_dest_id(dest_id: u32) -> Self {
        Self {
            dest_id,
            registry: Mutex::new(Registry {
                next_port: 1,
                ports: HashSet::new(),
                next_object: 1,
                next_addr: BUS_BASE,
                by_name: HashMap::new(),
                by_addr: BTreeMap::new(),
                objects: HashMap::new(),
            }),
            log: Mutex::new(None),
        }
    }

    /// Keep a record of every transfer from now on.
    pub fn recording(self) -> Self {
        *self.log.lock() = Some(Vec::new());
        self
    }

    /// Transfers recorded so far. Empty unless [`recording`](Self::recording) was enabled.
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.log.lock().clone().unwrap_or_default()
    }

    /// Drain the transfer log.
    pub fn take_transfers(&self) -> Vec<TransferRecord> {
        self.log.lock().as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Number of live memory objects.
    pub fn object_count(&self) -> usize {
        self.registry.lock().objects.len()
    }

    /// Whether a window with this name currently exists.
    pub fn contains(&self, name: &str) -> bool {
        self.registry.lock().by_name.contains_key(name)
    }

    fn record(&self, record: TransferRecord) {
        if let Some(log) = self.log.lock().as_mut() {
            log.push(record);
        }
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBackend")
            .field("dest_id", &self.dest_id)
            .field("objects", &self.object_count())
            .finish()
    }
}

/// Copy between two regions; whole aligned words go through atomics.
fn copy_between(src: &Region, src_offset: usize, dst: &Region, dst_offset: usize, len: usize) {
    if (src_offset | dst_offset | len) % 4 == 0 {
        for i in (0..len).step_by(4) {
            let v = src.word(src_offset + i).load(Ordering::Acquire);
            dst.word(dst_offset + i).store(v, Ordering::Release);
        }
    } else {
        // SAFETY: both ranges were bounds-checked; `ptr::copy` tolerates overlap
        // when src and dst are the same region.
        unsafe {
            ptr::copy(src.base().add(src_offset), dst.base().add(dst_offset), len);
        }
        fence(Ordering::Release);
    }
}

impl Backend for LoopbackBackend {
    fn open_port(&self) -> Result<PortHandle, BackendError> {
        let mut reg = self.registry.lock();
        let port = reg.next_port;
        reg.next_port = reg.next_port.wrapping_add(1).max(1);
        reg.ports.insert(port);
        Ok(PortHandle(port))
    }

    fn map_window(
        &self,
        port: PortHandle,
        name: &str,
        size: usize,
    ) -> Result<MappedWindow, BackendError> {
        let mut reg = self.registry.lock();
        reg.check_port(port)?;
        let entry = reg.get_or_create(name, size)?;
        entry.refs += 1;
        let region = entry.region.clone();
        let base = NonNull::new(region.base()).ok_or(BackendError::Other("null mapping".into()))?;
        let (id, len) = (region.id, region.len);
        // SAFETY: `base` points at `len` bytes owned by `region`, which the
        // window keeps alive; the cells are atomics, so shared writes are allowed.
        Ok(unsafe { MappedWindow::new(id, name, base, len, region) })
    }

    fn unmap_window(&self, port: PortHandle, window: &MappedWindow) -> Result<(), BackendError> {
        let mut reg = self.registry.lock();
        reg.check_port(port)?;
        reg.unref(window.object())
    }

    fn lookup(
        &self,
        port: PortHandle,
        name: &str,
        size: usize,
    ) -> Result<RemoteObject, BackendError> {
        let mut reg = self.registry.lock();
        reg.check_port(port)?;
        let entry = reg.get_or_create(name, size)?;
        entry.refs += 1;
        Ok(RemoteObject {
            object: entry.region.id,
            dest_id: self.dest_id,
            bus_addr: entry.region.bus_addr,
            size: entry.region.len,
        })
    }

    fn release(&self, port: PortHandle, remote: &RemoteObject) -> Result<(), BackendError> {
        let mut reg = self.registry.lock();
        reg.check_port(port)?;
        reg.unref(remote.object)
    }

    fn push_bytes(
        &self,
        port: PortHandle,
        local: ObjectId,
        local_offset: usize,
        remote: ObjectId,
        remote_offset: usize,
        len: usize,
    ) -> Result<(), BackendError> {
        let (src, dst) = {
            let reg = self.registry.lock();
            reg.check_port(port)?;
            (reg.region(local)?, reg.region(remote)?)
        };
        src.check(local_offset, len)?;
        dst.check(remote_offset, len)?;
        copy_between(&src, local_offset, &dst, remote_offset, len);
        self.record(TransferRecord {
            mode: Transfer::Push,
            src: local,
            src_offset: local_offset,
            dst: remote,
            dst_offset: remote_offset,
            len,
        });
        Ok(())
    }

    fn dma_write(
        &self,
        port: PortHandle,
        local: ObjectId,
        local_offset: usize,
        dest_id: u32,
        target_addr: u64,
        len: usize,
    ) -> Result<(), BackendError> {
        let unmapped = BackendError::AddressUnmapped {
            dest_id,
            addr: target_addr,
        };
        let (src, dst) = {
            let reg = self.registry.lock();
            reg.check_port(port)?;
            if dest_id != self.dest_id {
                return Err(unmapped);
            }
            let dst = reg.region_at(target_addr).ok_or(unmapped)?;
            (reg.region(local)?, dst)
        };
        let dst_offset = (target_addr - dst.bus_addr) as usize;
        src.check(local_offset, len)?;
        dst.check(dst_offset, len)?;
        copy_between(&src, local_offset, &dst, dst_offset, len);
        self.record(TransferRecord {
            mode: Transfer::Dma,
            src: local,
            src_offset: local_offset,
            dst: dst.id,
            dst_offset,
            len,
        });
        Ok(())
    }
}
