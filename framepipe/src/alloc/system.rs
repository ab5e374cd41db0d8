use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    AllocRequest, AllocResponse, FrameAllocator, FrameData, MemId, MemType, NativeHandle,
    SharedBuffer, check_request,
};
use crate::utils::errors::AllocError;

struct Entry {
    buffer: SharedBuffer,
    pitch: usize,
    locks: usize,
}

#[derive(Default)]
struct Buffers {
    entries: HashMap<MemId, Entry>,
    next_serial: u64,
    used_bytes: usize,
}

/// Heap-backed frame buffers. Mapping hands out the buffer itself.
#[derive(Default)]
pub struct SystemMemoryAllocator {
    buffers: Mutex<Buffers>,
    budget: Option<usize>,
}

impl SystemMemoryAllocator {
    /// An allocator that refuses to hold more than `bytes` at once.
    pub fn with_budget(bytes: usize) -> Self {
        Self {
            buffers: Mutex::default(),
            budget: Some(bytes),
        }
    }

    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn used_bytes(&self) -> usize {
        self.buffers().used_bytes
    }
}

impl FrameAllocator for SystemMemoryAllocator {
    fn alloc(&self, request: &AllocRequest) -> Result<AllocResponse, AllocError> {
        check_request(request, MemType::System)?;

        let frame_size = request.info.frame_size();
        let count = request.frame_count();
        let requested = frame_size * count;

        let mut buffers = self.buffers();
        if let Some(budget) = self.budget {
            if buffers.used_bytes + requested > budget {
                return Err(AllocError::OutOfMemory { requested });
            }
        }

        let mut mids = Vec::with_capacity(count);
        for _ in 0..count {
            let mid = MemId::new(MemType::System, buffers.next_serial);
            buffers.next_serial += 1;
            buffers.entries.insert(
                mid,
                Entry {
                    buffer: Arc::new(Mutex::new(vec![0; frame_size])),
                    pitch: request.info.pitch(),
                    locks: 0,
                },
            );
            mids.push(mid);
        }
        buffers.used_bytes += requested;

        Ok(AllocResponse {
            alloc_id: request.alloc_id,
            mem_type: MemType::System,
            mids,
        })
    }

    fn free(&self, response: &AllocResponse) -> Result<(), AllocError> {
        let mut buffers = self.buffers();
        for mid in &response.mids {
            let entry = buffers
                .entries
                .remove(mid)
                .ok_or(AllocError::NotFound(mid.raw()))?;
            let size = entry.buffer.lock().unwrap_or_else(PoisonError::into_inner).len();
            buffers.used_bytes = buffers.used_bytes.saturating_sub(size);
        }
        Ok(())
    }

    fn lock(&self, mid: MemId) -> Result<FrameData, AllocError> {
        let mut buffers = self.buffers();
        let entry = buffers
            .entries
            .get_mut(&mid)
            .ok_or(AllocError::NotFound(mid.raw()))?;
        entry.locks += 1;
        Ok(FrameData::new(mid, entry.pitch, entry.buffer.clone()))
    }

    fn unlock(&self, mid: MemId) -> Result<(), AllocError> {
        let mut buffers = self.buffers();
        let entry = buffers
            .entries
            .get_mut(&mid)
            .ok_or(AllocError::NotFound(mid.raw()))?;
        if entry.locks == 0 {
            return Err(AllocError::NotLocked(mid.raw()));
        }
        entry.locks -= 1;
        Ok(())
    }

    fn get_handle(&self, mid: MemId) -> Result<NativeHandle, AllocError> {
        let buffers = self.buffers();
        let entry = buffers
            .entries
            .get(&mid)
            .ok_or(AllocError::NotFound(mid.raw()))?;
        let address = entry.buffer.lock().unwrap_or_else(PoisonError::into_inner).as_ptr() as u64;
        Ok(NativeHandle(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::frame::{FourCc, FrameInfo, PicStruct};

    fn request(count: usize) -> AllocRequest {
        AllocRequest {
            alloc_id: 7,
            mem_type: MemType::System,
            info: FrameInfo::with_crop(FourCc::Rgb4, 16, 16, PicStruct::Progressive),
            num_frame_min: count,
            num_frame_suggested: count,
        }
    }

    #[test]
    fn budget_limits_allocation() {
        let allocator = SystemMemoryAllocator::with_budget(16 * 16 * 4 * 3);
        let first = allocator.alloc(&request(2)).unwrap();
        assert_eq!(
            allocator.alloc(&request(2)),
            Err(AllocError::OutOfMemory { requested: 16 * 16 * 4 * 2 })
        );
        allocator.free(&first).unwrap();
        assert_eq!(allocator.used_bytes(), 0);
        assert!(allocator.alloc(&request(3)).is_ok());
    }

    #[test]
    fn lock_is_counted() {
        let allocator = SystemMemoryAllocator::default();
        let response = allocator.alloc(&request(1)).unwrap();
        let mid = response.mids[0];

        let view = allocator.lock(mid).unwrap();
        view.bytes()[0] = 0xAB;
        let again = allocator.lock(mid).unwrap();
        assert_eq!(again.bytes()[0], 0xAB);
        assert_eq!(again.pitch, 64);

        allocator.unlock(mid).unwrap();
        allocator.unlock(mid).unwrap();
        assert_eq!(allocator.unlock(mid), Err(AllocError::NotLocked(mid.raw())));
    }

    #[test]
    fn rejects_device_requests() {
        let allocator = SystemMemoryAllocator::default();
        let mut req = request(1);
        req.mem_type = MemType::Device;
        assert_eq!(
            allocator.alloc(&req),
            Err(AllocError::Unsupported(MemType::Device))
        );
    }
}
