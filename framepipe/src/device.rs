use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::alloc::{AllocatorTable, FrameAllocator, MemType};

/// Which engine a session should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Implementation {
    /// Let the session factory pick.
    #[default]
    Auto,
    Software,
    Hardware,
}

impl Display for Implementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Implementation::Auto => write!(f, "auto"),
            Implementation::Software => write!(f, "software"),
            Implementation::Hardware => write!(f, "hardware"),
        }
    }
}

/// Process-wide accelerator context.
///
/// Opened once by the application and shared by `Arc` with every pipeline
/// running on it. Owns the allocator table the pools draw surfaces from.
pub struct Device {
    implementation: Implementation,
    allocators: Arc<AllocatorTable>,
    closed: AtomicBool,
}

impl Device {
    /// Opens a device with the built-in system and device memory allocators.
    pub fn open(implementation: Implementation) -> Arc<Self> {
        Self::with_allocators(implementation, AllocatorTable::default())
    }

    pub fn with_allocators(implementation: Implementation, allocators: AllocatorTable) -> Arc<Self> {
        log::debug!(
            "Opening {implementation} device (system: {}, device: {})",
            allocators.supports(MemType::System),
            allocators.supports(MemType::Device)
        );
        Arc::new(Self {
            implementation,
            allocators: Arc::new(allocators),
            closed: AtomicBool::new(false),
        })
    }

    pub fn implementation(&self) -> Implementation {
        self.implementation
    }

    pub fn allocator(&self) -> Arc<dyn FrameAllocator> {
        self.allocators.clone()
    }

    pub fn supports(&self, mem_type: MemType) -> bool {
        self.allocators.supports(mem_type)
    }

    /// Tears the device down. Later allocations fail; closing twice is a
    /// no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.allocators.close();
        log::debug!("Closed {} device", self.implementation);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocRequest;
    use crate::structs::frame::{FourCc, FrameInfo, PicStruct};
    use crate::utils::errors::AllocError;

    #[test]
    fn close_is_idempotent_and_blocks_alloc() {
        let device = Device::open(Implementation::Software);
        let allocator = device.allocator();
        let request = AllocRequest {
            alloc_id: 0,
            mem_type: MemType::Device,
            info: FrameInfo::with_crop(FourCc::Rgb4, 8, 8, PicStruct::Progressive),
            num_frame_min: 1,
            num_frame_suggested: 1,
        };
        assert!(allocator.alloc(&request).is_ok());

        device.close();
        device.close();
        assert!(device.is_closed());
        assert_eq!(allocator.alloc(&request), Err(AllocError::DeviceClosed));
    }
}
