use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::alloc::{FrameAllocator, FrameData, MemId, NativeHandle};
use crate::structs::frame::FrameInfo;
use crate::utils::errors::AllocError;

/// Frame order of a surface no stage has written yet.
pub const NO_FRAME_ORDER: u32 = u32::MAX;

/// One pool-owned frame buffer plus its bookkeeping.
///
/// Surfaces are created and destroyed in bulk by their pool. Three independent
/// states decide whether a surface can be handed to a stage again:
///
/// - in use: a stage call holds it (decode work buffer, pending VPP output)
/// - mapped: its memory is locked for CPU access
/// - reserved: a consumer holds it through a [`SurfaceHandle`]
pub struct Surface {
    pool_id: u64,
    index: usize,
    mid: MemId,
    info: FrameInfo,
    allocator: Arc<dyn FrameAllocator>,

    frame_order: AtomicU32,
    frame_number: AtomicU64,
    corrupted: AtomicBool,
    in_use: AtomicU32,
    pub(crate) reserved: AtomicBool,
    mapping: Mutex<Option<Mapping>>,
}

/// A live CPU mapping. `pinned` is set by an explicit [`Surface::map`],
/// `scoped` counts [`Surface::with_data`] calls running on it.
struct Mapping {
    view: FrameData,
    pinned: bool,
    scoped: usize,
}

impl Surface {
    pub(crate) fn new(
        pool_id: u64,
        index: usize,
        mid: MemId,
        info: FrameInfo,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Self {
        Self {
            pool_id,
            index,
            mid,
            info,
            allocator,
            frame_order: AtomicU32::new(NO_FRAME_ORDER),
            frame_number: AtomicU64::new(0),
            corrupted: AtomicBool::new(false),
            in_use: AtomicU32::new(0),
            reserved: AtomicBool::new(false),
            mapping: Mutex::new(None),
        }
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mem_id(&self) -> MemId {
        self.mid
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn native_handle(&self) -> Result<NativeHandle, AllocError> {
        self.allocator.get_handle(self.mid)
    }

    pub fn frame_order(&self) -> u32 {
        self.frame_order.load(Ordering::Acquire)
    }

    pub fn set_frame_order(&self, order: u32) {
        self.frame_order.store(order, Ordering::Release);
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number.load(Ordering::Acquire)
    }

    pub fn set_frame_number(&self, number: u64) {
        self.frame_number.store(number, Ordering::Release);
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    pub fn set_corrupted(&self, corrupted: bool) {
        self.corrupted.store(corrupted, Ordering::Release);
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::Acquire)
    }

    /// Marks the surface as held by a stage call. Calls nest.
    pub fn begin_use(&self) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_use(&self) {
        let previous = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous.is_err() {
            log::warn!("Surface {} released more often than used", self.index);
        }
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire) > 0
    }

    /// `true` while a stage holds the surface or its memory is mapped.
    pub fn is_locked(&self) -> bool {
        self.in_use() || self.is_mapped()
    }

    fn mapping(&self) -> MutexGuard<'_, Option<Mapping>> {
        self.mapping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping().is_some()
    }

    /// Maps the surface memory for CPU access until [`unmap`](Self::unmap).
    ///
    /// Mapping an already mapped surface returns the existing view.
    pub fn map(&self) -> Result<FrameData, AllocError> {
        let mut mapping = self.mapping();
        if let Some(current) = mapping.as_mut() {
            current.pinned = true;
            return Ok(current.view.clone());
        }
        let view = self.allocator.lock(self.mid)?;
        *mapping = Some(Mapping {
            view: view.clone(),
            pinned: true,
            scoped: 0,
        });
        Ok(view)
    }

    /// Releases the mapping taken by [`map`](Self::map). Does nothing if the
    /// surface is not mapped. A `with_data` call still running keeps the
    /// memory mapped until it returns.
    pub fn unmap(&self) -> Result<(), AllocError> {
        let mut mapping = self.mapping();
        let Some(current) = mapping.as_mut() else {
            return Ok(());
        };
        current.pinned = false;
        if current.scoped > 0 {
            return Ok(());
        }
        self.allocator.unlock(self.mid)?;
        *mapping = None;
        Ok(())
    }

    /// Runs `f` on the surface memory, mapping it for the duration of the call
    /// unless it is mapped already. Overlapping calls share one mapping.
    pub fn with_data<R>(&self, f: impl FnOnce(&FrameData) -> R) -> Result<R, AllocError> {
        let view = {
            let mut mapping = self.mapping();
            match mapping.as_mut() {
                Some(current) => {
                    current.scoped += 1;
                    current.view.clone()
                }
                None => {
                    let view = self.allocator.lock(self.mid)?;
                    *mapping = Some(Mapping {
                        view: view.clone(),
                        pinned: false,
                        scoped: 1,
                    });
                    view
                }
            }
        };

        let result = f(&view);

        let mut mapping = self.mapping();
        if let Some(current) = mapping.as_mut() {
            current.scoped = current.scoped.saturating_sub(1);
            if current.scoped == 0 && !current.pinned {
                self.allocator.unlock(self.mid)?;
                *mapping = None;
            }
        }
        Ok(result)
    }
}

impl Debug for Surface {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("pool_id", &self.pool_id)
            .field("index", &self.index)
            .field("mid", &self.mid)
            .field("frame_order", &self.frame_order())
            .field("frame_number", &self.frame_number())
            .field("in_use", &self.in_use())
            .field("mapped", &self.is_mapped())
            .field("reserved", &self.is_reserved())
            .finish()
    }
}

type ReleaseAction = Box<dyn Fn(&Surface) + Send + Sync>;

struct Holder {
    surface: Arc<Surface>,
    release: ReleaseAction,
}

impl Drop for Holder {
    fn drop(&mut self) {
        (self.release)(&self.surface);
    }
}

/// Shared ownership of a surface with a release action.
///
/// Clones share one holder; the release action runs exactly once, when the
/// last clone is dropped. Pools use it to return reserved surfaces.
#[derive(Clone)]
pub struct SurfaceHandle {
    holder: Arc<Holder>,
}

impl SurfaceHandle {
    pub fn new<F>(surface: Arc<Surface>, release: F) -> Self
    where
        F: Fn(&Surface) + Send + Sync + 'static,
    {
        Self {
            holder: Arc::new(Holder {
                surface,
                release: Box::new(release),
            }),
        }
    }

    pub fn surface(&self) -> &Arc<Surface> {
        &self.holder.surface
    }

    /// Number of live clones of this handle.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.holder)
    }
}

impl Deref for SurfaceHandle {
    type Target = Surface;

    fn deref(&self) -> &Surface {
        &self.holder.surface
    }
}

impl Debug for SurfaceHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SurfaceHandle").field(self.surface()).finish()
    }
}

/// A decoded surface and the VPP surface produced from it.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub decoded: SurfaceHandle,
    pub processed: SurfaceHandle,
}

impl FramePair {
    pub fn new(decoded: SurfaceHandle, processed: SurfaceHandle) -> Self {
        Self { decoded, processed }
    }

    /// `true` when both halves carry the same sequence number.
    pub fn is_matched(&self) -> bool {
        self.decoded.frame_number() == self.processed.frame_number()
    }

    pub fn into_parts(self) -> (SurfaceHandle, SurfaceHandle) {
        (self.decoded, self.processed)
    }
}
