use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    AllocRequest, AllocResponse, FrameAllocator, FrameData, MemId, MemType, NativeHandle,
    SharedBuffer, check_request,
};
use crate::utils::errors::AllocError;

struct Staging {
    buffer: SharedBuffer,
    locks: usize,
}

struct DeviceSurface {
    memory: Vec<u8>,
    pitch: usize,
    staging: Option<Staging>,
}

#[derive(Default)]
struct Surfaces {
    entries: HashMap<MemId, DeviceSurface>,
    next_serial: u64,
}

/// Frame buffers that live outside CPU reach.
///
/// A CPU mapping is a staging copy of the surface. The copy is made on the
/// first `lock` and written back when the last `unlock` releases it, so
/// writes through a mapping become visible to the device only after unmap.
#[derive(Default)]
pub struct DeviceMemoryAllocator {
    surfaces: Mutex<Surfaces>,
}

impl DeviceMemoryAllocator {
    fn surfaces(&self) -> MutexGuard<'_, Surfaces> {
        self.surfaces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of surfaces currently mapped through a staging copy.
    pub fn mapped_count(&self) -> usize {
        self.surfaces()
            .entries
            .values()
            .filter(|s| s.staging.is_some())
            .count()
    }
}

impl FrameAllocator for DeviceMemoryAllocator {
    fn alloc(&self, request: &AllocRequest) -> Result<AllocResponse, AllocError> {
        check_request(request, MemType::Device)?;

        let frame_size = request.info.frame_size();
        let mut surfaces = self.surfaces();
        let mids = (0..request.frame_count())
            .map(|_| {
                let mid = MemId::new(MemType::Device, surfaces.next_serial);
                surfaces.next_serial += 1;
                surfaces.entries.insert(
                    mid,
                    DeviceSurface {
                        memory: vec![0; frame_size],
                        pitch: request.info.pitch(),
                        staging: None,
                    },
                );
                mid
            })
            .collect();

        Ok(AllocResponse {
            alloc_id: request.alloc_id,
            mem_type: MemType::Device,
            mids,
        })
    }

    fn free(&self, response: &AllocResponse) -> Result<(), AllocError> {
        let mut surfaces = self.surfaces();
        for mid in &response.mids {
            if let Some(surface) = surfaces.entries.remove(mid) {
                if surface.staging.is_some() {
                    log::warn!("Freeing device surface {} while still mapped", mid.raw());
                }
            } else {
                return Err(AllocError::NotFound(mid.raw()));
            }
        }
        Ok(())
    }

    fn lock(&self, mid: MemId) -> Result<FrameData, AllocError> {
        let mut surfaces = self.surfaces();
        let surface = surfaces
            .entries
            .get_mut(&mid)
            .ok_or(AllocError::NotFound(mid.raw()))?;

        let pitch = surface.pitch;
        let memory = &surface.memory;
        let staging = surface.staging.get_or_insert_with(|| Staging {
            buffer: Arc::new(Mutex::new(memory.clone())),
            locks: 0,
        });
        staging.locks += 1;
        Ok(FrameData::new(mid, pitch, staging.buffer.clone()))
    }

    fn unlock(&self, mid: MemId) -> Result<(), AllocError> {
        let mut surfaces = self.surfaces();
        let surface = surfaces
            .entries
            .get_mut(&mid)
            .ok_or(AllocError::NotFound(mid.raw()))?;
        let staging = surface
            .staging
            .as_mut()
            .ok_or(AllocError::NotLocked(mid.raw()))?;

        staging.locks -= 1;
        if staging.locks == 0 {
            if let Some(staging) = surface.staging.take() {
                let bytes = staging.buffer.lock().unwrap_or_else(PoisonError::into_inner);
                surface.memory.copy_from_slice(&bytes);
            }
        }
        Ok(())
    }

    fn get_handle(&self, mid: MemId) -> Result<NativeHandle, AllocError> {
        if !self.surfaces().entries.contains_key(&mid) {
            return Err(AllocError::NotFound(mid.raw()));
        }
        Ok(NativeHandle(mid.raw() & 0xFFFF_FFFF))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::frame::{FourCc, FrameInfo, PicStruct};

    fn allocate(allocator: &DeviceMemoryAllocator) -> MemId {
        let response = allocator
            .alloc(&AllocRequest {
                alloc_id: 2,
                mem_type: MemType::Device,
                info: FrameInfo::with_crop(FourCc::Nv12, 32, 32, PicStruct::Progressive),
                num_frame_min: 1,
                num_frame_suggested: 1,
            })
            .unwrap();
        response.mids[0]
    }

    #[test]
    fn writes_land_on_unmap() {
        let allocator = DeviceMemoryAllocator::default();
        let mid = allocate(&allocator);

        let view = allocator.lock(mid).unwrap();
        view.bytes()[5] = 9;
        assert_eq!(allocator.mapped_count(), 1);
        allocator.unlock(mid).unwrap();
        assert_eq!(allocator.mapped_count(), 0);

        let view = allocator.lock(mid).unwrap();
        assert_eq!(view.bytes()[5], 9);
        allocator.unlock(mid).unwrap();
    }

    #[test]
    fn nested_locks_share_staging() {
        let allocator = DeviceMemoryAllocator::default();
        let mid = allocate(&allocator);

        let outer = allocator.lock(mid).unwrap();
        let inner = allocator.lock(mid).unwrap();
        inner.bytes()[0] = 1;
        assert_eq!(outer.bytes()[0], 1);

        allocator.unlock(mid).unwrap();
        assert_eq!(allocator.mapped_count(), 1);
        allocator.unlock(mid).unwrap();
        assert_eq!(allocator.unlock(mid), Err(AllocError::NotLocked(mid.raw())));
    }

    #[test]
    fn unknown_mid() {
        let allocator = DeviceMemoryAllocator::default();
        let mid = MemId::new(MemType::Device, 99);
        assert_eq!(allocator.lock(mid).unwrap_err(), AllocError::NotFound(mid.raw()));
        assert!(allocator.get_handle(mid).is_err());
    }
}
