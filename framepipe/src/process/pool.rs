use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::alloc::{AllocRequest, AllocResponse, FrameAllocator};
use crate::process::stage::Stage;
use crate::structs::frame::FrameInfo;
use crate::structs::surface::{Surface, SurfaceHandle};
use crate::utils::errors::PoolError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct PoolState {
    /// Identifies the current surface set; changes on every realloc.
    pool_id: u64,
    surfaces: Vec<Arc<Surface>>,
    response: Option<AllocResponse>,
    info: FrameInfo,
    reserved_count: usize,
    reserved_max: usize,
    cancelled: bool,
}

/// A fixed set of surfaces plus a reservation budget.
///
/// Reservations are the pipeline's backpressure: at most `reserved_max`
/// surfaces can be held by consumers at once, and a blocking [`reserve`]
/// waits for an [`unreserve`] when the budget is spent.
///
/// [`reserve`]: SurfacePool::reserve
/// [`unreserve`]: SurfacePool::unreserve
pub struct SurfacePool {
    stage: Stage,
    allocator: Arc<dyn FrameAllocator>,
    state: Mutex<PoolState>,
    budget_available: Condvar,
}

impl SurfacePool {
    pub fn new(stage: Stage, allocator: Arc<dyn FrameAllocator>) -> Self {
        Self {
            stage,
            allocator,
            state: Mutex::new(PoolState {
                pool_id: 0,
                surfaces: Vec::new(),
                response: None,
                info: FrameInfo::default(),
                reserved_count: 0,
                reserved_max: 0,
                cancelled: false,
            }),
            budget_available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the surface set with `request` plus `reserved_max` extra
    /// surfaces and resets the reservation budget.
    ///
    /// If allocation fails the current surfaces are kept as they are.
    pub fn realloc(&self, request: &AllocRequest, reserved_max: usize) -> Result<(), PoolError> {
        let mut request = request.clone();
        request.num_frame_min += reserved_max;
        request.num_frame_suggested += reserved_max;

        let mut state = self.lock();
        let response = self.allocator.alloc(&request)?;
        if response.mids.len() < request.num_frame_min {
            let actual = response.mids.len();
            if let Err(e) = self.allocator.free(&response) {
                log::warn!("{} pool: failed to free short allocation: {e}", self.stage);
            }
            return Err(PoolError::ShortAllocation {
                expected: request.num_frame_min,
                actual,
            });
        }

        self.clear(&mut state);

        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        state.surfaces = response
            .mids
            .iter()
            .enumerate()
            .map(|(index, &mid)| {
                Arc::new(Surface::new(
                    pool_id,
                    index,
                    mid,
                    request.info,
                    self.allocator.clone(),
                ))
            })
            .collect();
        state.pool_id = pool_id;
        state.response = Some(response);
        state.info = request.info;
        state.reserved_count = 0;
        state.reserved_max = reserved_max;
        state.cancelled = false;
        let surfaces = state.surfaces.len();
        drop(state);
        // reservations blocked on the old surface set now fail
        self.budget_available.notify_all();

        log::debug!(
            "{} pool: {surfaces} surfaces of {}, reservation budget {reserved_max}",
            self.stage,
            request.info,
        );
        Ok(())
    }

    fn clear(&self, state: &mut PoolState) {
        for surface in &state.surfaces {
            if let Err(e) = surface.unmap() {
                log::warn!("{} pool: unmap of surface {} failed: {e}", self.stage, surface.index());
            }
        }
        state.surfaces.clear();
        if let Some(response) = state.response.take() {
            if let Err(e) = self.allocator.free(&response) {
                log::warn!("{} pool: free failed: {e}", self.stage);
            }
        }
        state.reserved_count = 0;
    }

    /// First surface, in index order, that is neither locked nor reserved.
    pub fn get_free(&self) -> Option<Arc<Surface>> {
        let state = self.lock();
        state
            .surfaces
            .iter()
            .find(|s| !s.is_locked() && !s.is_reserved())
            .cloned()
    }

    /// Surface whose frame order is `frame_order`.
    pub fn find(&self, frame_order: u32) -> Option<Arc<Surface>> {
        let state = self.lock();
        state
            .surfaces
            .iter()
            .find(|s| s.frame_order() == frame_order)
            .cloned()
    }

    /// Index of `surface` in this pool, if it belongs to the current set.
    pub fn surface_id(&self, surface: &Surface) -> Option<usize> {
        let state = self.lock();
        Self::owns(&state, surface).then(|| surface.index())
    }

    fn owns(state: &PoolState, surface: &Surface) -> bool {
        surface.pool_id() == state.pool_id
            && state
                .surfaces
                .get(surface.index())
                .is_some_and(|s| std::ptr::eq(s.as_ref(), surface))
    }

    /// Reserves `surface` for a consumer.
    ///
    /// Reserving a reserved surface succeeds without spending budget. When
    /// the budget is spent, `drop_on_overflow` makes the call fail at once;
    /// otherwise it blocks until a reservation is returned. Blocking calls
    /// fail after [`cancel`](Self::cancel).
    pub fn reserve(&self, surface: &Surface, drop_on_overflow: bool) -> bool {
        let mut state = self.lock();
        if !Self::owns(&state, surface) {
            debug_assert!(
                false,
                "surface {} does not belong to the {} pool",
                surface.index(),
                self.stage
            );
            log::error!(
                "{} pool: reserve of foreign surface (pool {}, surface pool {})",
                self.stage,
                state.pool_id,
                surface.pool_id()
            );
            return false;
        }

        if surface.is_reserved() {
            return true;
        }
        if state.reserved_max == 0 {
            return false;
        }

        if drop_on_overflow {
            if state.reserved_count >= state.reserved_max {
                return false;
            }
        } else {
            state = self
                .budget_available
                .wait_while(state, |s| {
                    !s.cancelled && s.reserved_count >= s.reserved_max && !surface.is_reserved()
                })
                .unwrap_or_else(PoisonError::into_inner);
            if surface.is_reserved() {
                return true;
            }
            if state.cancelled || !Self::owns(&state, surface) {
                return false;
            }
        }

        surface.reserved.store(true, Ordering::Release);
        state.reserved_count += 1;
        true
    }

    /// Returns the reservation held on `surface`.
    ///
    /// Unreserving a surface that is not reserved is a no-op. Surfaces left
    /// over from a previous surface set are ignored and report `false`.
    pub fn unreserve(&self, surface: &Surface) -> bool {
        let mut state = self.lock();
        if !Self::owns(&state, surface) {
            log::debug!(
                "{} pool: ignoring unreserve of stale surface {}",
                self.stage,
                surface.index()
            );
            return false;
        }
        if !surface.is_reserved() {
            return true;
        }

        surface.reserved.store(false, Ordering::Release);
        state.reserved_count -= 1;
        drop(state);
        // waiters may be blocked on different surfaces, let each recheck
        self.budget_available.notify_all();
        true
    }

    /// Wraps `surface` in a handle that unreserves it when the last clone is
    /// dropped.
    pub fn handle(self: &Arc<Self>, surface: Arc<Surface>) -> SurfaceHandle {
        let pool = Arc::clone(self);
        SurfaceHandle::new(surface, move |s| {
            pool.unreserve(s);
        })
    }

    /// Fails every blocked and future blocking `reserve` until the next
    /// `realloc`.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.budget_available.notify_all();
    }

    pub fn reserved_count(&self) -> usize {
        self.lock().reserved_count
    }

    pub fn reserved_max(&self) -> usize {
        self.lock().reserved_max
    }

    pub fn len(&self) -> usize {
        self.lock().surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn info(&self) -> FrameInfo {
        self.lock().info
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Logs the locked, free and reserved surface indices.
    pub fn debug_dump(&self) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let state = self.lock();
        let mut locked = Vec::new();
        let mut free = Vec::new();
        let mut reserved_free = Vec::new();
        for s in &state.surfaces {
            if s.is_locked() {
                locked.push(s.index());
            } else if s.is_reserved() {
                reserved_free.push(s.index());
            } else {
                free.push(s.index());
            }
        }
        log::debug!(
            "{} pool: locked {:?} free {:?} reserved-free {:?} ({}/{} reserved)",
            self.stage,
            locked,
            free,
            reserved_free,
            state.reserved_count,
            state.reserved_max
        );
    }
}

impl Drop for SurfacePool {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.clear(&mut state);
    }
}
