//! Surface memory allocation.
//!
//! Pools never touch memory directly. They go through a [`FrameAllocator`],
//! which hands out opaque [`MemId`]s and maps them for CPU access on request.
//! Two backends exist, selected by the [`MemType`] tag of each request:
//!
//! - [`system::SystemMemoryAllocator`]: plain heap buffers, mapping is free.
//! - [`device::DeviceMemoryAllocator`]: opaque device buffers, mapping goes
//!   through a staging copy that is written back on unmap.
//!
//! [`AllocatorTable`] routes every call to the backend registered for the tag.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::structs::frame::FrameInfo;
use crate::utils::errors::AllocError;

pub mod device;
pub mod system;

/// Memory class of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemType {
    /// CPU-visible heap memory.
    #[default]
    System,
    /// Memory owned by the accelerator, CPU access requires mapping.
    Device,
}

impl MemType {
    const fn tag(self) -> u64 {
        match self {
            MemType::System => 0,
            MemType::Device => 1,
        }
    }
}

impl Display for MemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemType::System => write!(f, "system"),
            MemType::Device => write!(f, "device"),
        }
    }
}

/// Opaque identifier of one allocated frame buffer.
///
/// The top byte carries the [`MemType`] so a table can dispatch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemId(u64);

impl MemId {
    const TAG_SHIFT: u32 = 56;

    pub const fn new(mem_type: MemType, serial: u64) -> Self {
        Self((mem_type.tag() << Self::TAG_SHIFT) | (serial & ((1 << Self::TAG_SHIFT) - 1)))
    }

    pub const fn mem_type(self) -> MemType {
        match self.0 >> Self::TAG_SHIFT {
            0 => MemType::System,
            _ => MemType::Device,
        }
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Platform handle of a frame buffer (a device surface id, or a host address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRequest {
    pub alloc_id: u32,
    pub mem_type: MemType,
    pub info: FrameInfo,
    pub num_frame_min: usize,
    pub num_frame_suggested: usize,
}

impl AllocRequest {
    /// Number of buffers an allocator should actually hand out.
    pub fn frame_count(&self) -> usize {
        self.num_frame_suggested.max(self.num_frame_min)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocResponse {
    pub alloc_id: u32,
    pub mem_type: MemType,
    pub mids: Vec<MemId>,
}

pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// CPU view of a mapped frame buffer.
///
/// Cloning is cheap, clones refer to the same bytes. The view stays valid
/// until the buffer is unmapped.
#[derive(Debug, Clone)]
pub struct FrameData {
    pub mid: MemId,
    pub pitch: usize,
    buffer: SharedBuffer,
}

impl FrameData {
    pub fn new(mid: MemId, pitch: usize, buffer: SharedBuffer) -> Self {
        Self { mid, pitch, buffer }
    }

    /// Locks the mapped bytes for reading or writing.
    pub fn bytes(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Allocation entry points consumed by surface pools.
///
/// Implementations must be callable from any thread: mapping usually happens
/// on the consumer side while allocation happens on the pipeline thread.
pub trait FrameAllocator: Send + Sync {
    fn alloc(&self, request: &AllocRequest) -> Result<AllocResponse, AllocError>;

    fn free(&self, response: &AllocResponse) -> Result<(), AllocError>;

    /// Maps `mid` for CPU access. Mapping is counted: every successful `lock`
    /// must be paired with one `unlock`.
    fn lock(&self, mid: MemId) -> Result<FrameData, AllocError>;

    fn unlock(&self, mid: MemId) -> Result<(), AllocError>;

    fn get_handle(&self, mid: MemId) -> Result<NativeHandle, AllocError>;
}

/// Dispatches allocator calls to the backend registered for each [`MemType`].
pub struct AllocatorTable {
    backends: [Option<Arc<dyn FrameAllocator>>; 2],
    closed: AtomicBool,
}

impl Default for AllocatorTable {
    /// A table with both built-in backends registered.
    fn default() -> Self {
        Self::empty()
            .with(MemType::System, Arc::new(system::SystemMemoryAllocator::default()))
            .with(MemType::Device, Arc::new(device::DeviceMemoryAllocator::default()))
    }
}

impl AllocatorTable {
    pub fn empty() -> Self {
        Self {
            backends: [None, None],
            closed: AtomicBool::new(false),
        }
    }

    /// Registers `backend` for `mem_type`, replacing any previous one.
    pub fn with(mut self, mem_type: MemType, backend: Arc<dyn FrameAllocator>) -> Self {
        self.backends[mem_type.tag() as usize] = Some(backend);
        self
    }

    pub fn supports(&self, mem_type: MemType) -> bool {
        self.backends[mem_type.tag() as usize].is_some()
    }

    /// Rejects every further call. Buffers still alive can be freed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn backend(&self, mem_type: MemType) -> Result<&Arc<dyn FrameAllocator>, AllocError> {
        self.backends[mem_type.tag() as usize]
            .as_ref()
            .ok_or(AllocError::Unsupported(mem_type))
    }

    fn open_backend(&self, mem_type: MemType) -> Result<&Arc<dyn FrameAllocator>, AllocError> {
        if self.is_closed() {
            return Err(AllocError::DeviceClosed);
        }
        self.backend(mem_type)
    }
}

impl FrameAllocator for AllocatorTable {
    fn alloc(&self, request: &AllocRequest) -> Result<AllocResponse, AllocError> {
        let response = self.open_backend(request.mem_type)?.alloc(request)?;
        log::debug!(
            "alloc id {} {} {}x{} ({}~{}) -> {} buffers",
            request.alloc_id,
            request.mem_type,
            request.info.width,
            request.info.height,
            request.num_frame_min,
            request.num_frame_suggested,
            response.mids.len()
        );
        Ok(response)
    }

    fn free(&self, response: &AllocResponse) -> Result<(), AllocError> {
        self.backend(response.mem_type)?.free(response)
    }

    fn lock(&self, mid: MemId) -> Result<FrameData, AllocError> {
        self.open_backend(mid.mem_type())?.lock(mid)
    }

    fn unlock(&self, mid: MemId) -> Result<(), AllocError> {
        self.backend(mid.mem_type())?.unlock(mid)
    }

    fn get_handle(&self, mid: MemId) -> Result<NativeHandle, AllocError> {
        self.open_backend(mid.mem_type())?.get_handle(mid)
    }
}

/// Validates the parts of a request every backend agrees on.
pub(crate) fn check_request(request: &AllocRequest, mem_type: MemType) -> Result<(), AllocError> {
    if request.mem_type != mem_type {
        return Err(AllocError::Unsupported(request.mem_type));
    }
    if request.frame_count() == 0 {
        return Err(AllocError::ZeroFrames);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::frame::{FourCc, PicStruct};

    pub(crate) fn request(mem_type: MemType, count: usize) -> AllocRequest {
        AllocRequest {
            alloc_id: 1,
            mem_type,
            info: FrameInfo::with_crop(FourCc::Nv12, 64, 32, PicStruct::Progressive),
            num_frame_min: count,
            num_frame_suggested: count,
        }
    }

    #[test]
    fn mem_id_carries_type() {
        let sys = MemId::new(MemType::System, 42);
        let dev = MemId::new(MemType::Device, 42);
        assert_eq!(sys.mem_type(), MemType::System);
        assert_eq!(dev.mem_type(), MemType::Device);
        assert_ne!(sys, dev);
    }

    #[test]
    fn table_dispatches_by_tag() {
        let table = AllocatorTable::default();
        let sys = table.alloc(&request(MemType::System, 2)).unwrap();
        let dev = table.alloc(&request(MemType::Device, 3)).unwrap();
        assert_eq!(sys.mids.len(), 2);
        assert_eq!(dev.mids.len(), 3);
        assert!(dev.mids.iter().all(|m| m.mem_type() == MemType::Device));

        let view = table.lock(dev.mids[0]).unwrap();
        assert_eq!(view.len(), 64 * 32 * 3 / 2);
        table.unlock(dev.mids[0]).unwrap();

        table.free(&sys).unwrap();
        table.free(&dev).unwrap();
    }

    #[test]
    fn missing_backend_is_unsupported() {
        let table = AllocatorTable::empty()
            .with(MemType::System, Arc::new(system::SystemMemoryAllocator::default()));
        assert!(table.supports(MemType::System));
        assert_eq!(
            table.alloc(&request(MemType::Device, 1)),
            Err(AllocError::Unsupported(MemType::Device))
        );
    }

    #[test]
    fn closed_table_rejects_alloc_but_frees() {
        let table = AllocatorTable::default();
        let response = table.alloc(&request(MemType::System, 1)).unwrap();
        table.close();
        assert_eq!(
            table.alloc(&request(MemType::System, 1)),
            Err(AllocError::DeviceClosed)
        );
        assert!(table.free(&response).is_ok());
    }

    #[test]
    fn zero_frame_request_fails() {
        let table = AllocatorTable::default();
        assert_eq!(
            table.alloc(&request(MemType::System, 0)),
            Err(AllocError::ZeroFrames)
        );
    }
}
