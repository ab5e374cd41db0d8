use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::alloc::MemType;
use crate::device::{Device, Implementation};
use crate::process::bitstream::{BITSTREAM_CAPACITY, StreamSource};
use crate::process::driver::{self, DriverContext};
use crate::process::pool::SurfacePool;
use crate::process::stage::{OutputFormat, SessionFactory, Stage};
use crate::process::sync::SyncPolicy;
use crate::structs::surface::FramePair;
use crate::utils::errors::PipelineError;
use crate::utils::queue::BlockingQueue;

static NEXT_PIPELINE_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the output queue.
    pub queue_size: usize,
    pub output: OutputFormat,
    pub mem_type: MemType,
    /// Reservations beyond `queue_size` for decode surfaces, letting decode
    /// run ahead of a blocked put.
    pub decode_reserve_extra: usize,
    pub vpp_reserve_extra: usize,
    pub sync: SyncPolicy,
    pub busy_sleep: Duration,
    /// Escalate stage warnings to fatal errors.
    pub strict: bool,
    pub stats_interval: Option<Duration>,
    pub bitstream_capacity: usize,
    /// Restart file input from the beginning at end of stream.
    pub repeat: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_size: 8,
            output: OutputFormat::default(),
            mem_type: MemType::System,
            decode_reserve_extra: 2,
            vpp_reserve_extra: 1,
            sync: SyncPolicy::default(),
            busy_sleep: Duration::from_millis(1),
            strict: false,
            stats_interval: None,
            bitstream_capacity: BITSTREAM_CAPACITY,
            repeat: false,
        }
    }
}

/// Counters updated by the pipeline thread.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub(crate) decoded: AtomicU64,
    pub(crate) processed: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) corrupted: AtomicU64,
    pub(crate) busy_retries: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            decoded: self.decoded.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            busy_retries: self.busy_retries.load(Ordering::Relaxed),
            queue_high_water: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub decoded: u64,
    pub processed: u64,
    /// Pairs that never reached the output queue.
    pub dropped: u64,
    /// Corrupted frames that caused a decoder reset.
    pub corrupted: u64,
    pub busy_retries: u64,
    pub queue_high_water: usize,
}

/// A decode/VPP pipeline running on its own thread.
///
/// `start` spawns the producer; the consumer pulls matched pairs with
/// [`get`](Self::get) until it returns `None`, which happens once the stream
/// has ended (or the producer failed) and every queued pair was taken.
/// [`stop`](Self::stop) reports how the producer ended.
///
/// Several pipelines can share one [`Device`]; each owns its pools and queue.
pub struct Pipeline {
    id: usize,
    device: Arc<Device>,
    factory: Arc<dyn SessionFactory>,
    config: PipelineConfig,

    decode_pool: Arc<SurfacePool>,
    vpp_pool: Arc<SurfacePool>,
    output: Arc<BlockingQueue<FramePair>>,
    stop: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    thread: Option<JoinHandle<Result<(), PipelineError>>>,
}

impl Pipeline {
    pub fn new(
        device: Arc<Device>,
        factory: Arc<dyn SessionFactory>,
        config: PipelineConfig,
    ) -> Self {
        let output = Arc::new(BlockingQueue::new(config.queue_size.max(1)));
        // nothing to deliver before the first start
        output.close();

        Self {
            id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
            decode_pool: Arc::new(SurfacePool::new(Stage::Decode, device.allocator())),
            vpp_pool: Arc::new(SurfacePool::new(Stage::Vpp, device.allocator())),
            device,
            factory,
            config,
            output,
            stop: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PipelineStats::default()),
            thread: None,
        }
    }

    /// Spawns the pipeline thread reading from `source`.
    ///
    /// Setup happens on the new thread; its failures end the run like any
    /// other fatal error and are returned by [`stop`](Self::stop).
    pub fn start(
        &mut self,
        source: impl Into<StreamSource>,
        implementation: Implementation,
        drop_on_overflow: bool,
    ) -> Result<(), PipelineError> {
        if self.is_running() {
            log::error!("Pipeline {} is already running", self.id);
            return Err(PipelineError::AlreadyRunning);
        }
        if let Some(previous) = self.thread.take() {
            if let Err(e) = Self::join(previous) {
                log::debug!("Pipeline {}: previous run ended with {e}", self.id);
            }
        }

        let source = source.into();
        log::info!(
            "Starting pipeline {} on {source:?} ({implementation}, queue {})",
            self.id,
            self.config.queue_size
        );

        // pairs held from a previous run keep their pools alive through the
        // handles; reallocating those would free surfaces still in use
        self.decode_pool = Arc::new(SurfacePool::new(Stage::Decode, self.device.allocator()));
        self.vpp_pool = Arc::new(SurfacePool::new(Stage::Vpp, self.device.allocator()));
        self.output = Arc::new(BlockingQueue::new(self.config.queue_size.max(1)));
        self.stop = Arc::new(AtomicBool::new(false));
        self.stats = Arc::new(PipelineStats::default());

        let ctx = DriverContext {
            device: self.device.clone(),
            factory: self.factory.clone(),
            implementation,
            source,
            config: self.config.clone(),
            drop_on_overflow,
            decode_pool: self.decode_pool.clone(),
            vpp_pool: self.vpp_pool.clone(),
            output: self.output.clone(),
            stop: self.stop.clone(),
            stats: self.stats.clone(),
        };

        let thread = thread::Builder::new()
            .name(format!("framepipe-{}", self.id))
            .spawn(move || driver::execute(ctx))
            .inspect_err(|_| self.output.close())?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Stops the pipeline thread and returns how it ended.
    ///
    /// Pairs still queued are dropped. Pairs the consumer holds stay valid
    /// and release their surfaces when dropped.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        self.stop.store(true, Ordering::Release);
        self.decode_pool.cancel();
        self.vpp_pool.cancel();
        // wakes a producer blocked on a full queue
        self.output.close();
        while self.output.try_get().is_some() {}

        let result = Self::join(thread);
        log::info!("Pipeline {} stopped", self.id);
        result
    }

    fn join(thread: JoinHandle<Result<(), PipelineError>>) -> Result<(), PipelineError> {
        thread.join().unwrap_or_else(|_| {
            log::error!("Pipeline thread panicked");
            Err(PipelineError::Panicked)
        })
    }

    /// Next matched pair, blocking until one is ready. `None` once the
    /// pipeline has ended and the queue is drained.
    pub fn get(&self) -> Option<FramePair> {
        self.output.get()
    }

    /// Next queued pair accepted by `filter`.
    pub fn get_where<F>(&self, filter: F) -> Option<FramePair>
    where
        F: FnMut(&FramePair) -> bool,
    {
        self.output.get_where(filter)
    }

    /// Output queue of the current run, for consumers on other threads.
    pub fn output(&self) -> Arc<BlockingQueue<FramePair>> {
        self.output.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            queue_high_water: self.output.max_size(),
            ..self.stats.snapshot()
        }
    }

    /// The pipeline thread has been started and has not finished yet.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Decode surfaces of the current (or last) run.
    pub fn decode_pool(&self) -> &Arc<SurfacePool> {
        &self.decode_pool
    }

    pub fn vpp_pool(&self) -> &Arc<SurfacePool> {
        &self.vpp_pool
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Pipeline {} ended with {e}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::soft::SoftSessionFactory;
    use crate::structs::frame::FourCc;
    use crate::structs::rawv::RawvHeader;
    use crate::utils::errors::StageError;
    use std::time::Instant;

    fn stream(frames: usize) -> Vec<u8> {
        let header = RawvHeader {
            width: 32,
            height: 16,
            fourcc: FourCc::Nv12,
            corrupted: false,
        };
        let mut out = Vec::new();
        for i in 0..frames {
            let payload = vec![(i * 16 % 256) as u8; header.payload_len()];
            header.write_frame(&payload, &mut out).unwrap();
        }
        out
    }

    fn pipeline(queue_size: usize) -> Pipeline {
        let config = PipelineConfig {
            queue_size,
            output: OutputFormat {
                width: 16,
                height: 16,
                fourcc: FourCc::Rgb4,
            },
            bitstream_capacity: 256,
            ..PipelineConfig::default()
        };
        Pipeline::new(
            Device::open(Implementation::Software),
            Arc::new(SoftSessionFactory::default()),
            config,
        )
    }

    fn wait_finished(pipeline: &Pipeline) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while pipeline.is_running() {
            assert!(Instant::now() < deadline, "pipeline did not finish");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn get_before_start_returns_none() {
        let p = pipeline(2);
        assert!(p.get().is_none());
        assert!(!p.is_running());
    }

    #[test]
    fn delivers_every_frame_in_order() {
        let mut p = pipeline(4);
        p.start(stream(12), Implementation::Software, false).unwrap();

        let mut numbers = Vec::new();
        while let Some(pair) = p.get() {
            assert!(pair.is_matched());
            let alpha = pair.processed.with_data(|d| d.bytes()[3]).unwrap();
            assert_eq!(alpha, 0xFF);
            numbers.push(pair.processed.frame_number());
        }
        assert_eq!(numbers, (0..12).collect::<Vec<_>>());
        assert!(p.stop().is_ok());

        let stats = p.stats();
        assert_eq!(stats.decoded, 12);
        assert_eq!(stats.dropped, 0);
        assert!(stats.queue_high_water <= 4);
    }

    #[test]
    fn overflow_keeps_the_first_pairs() {
        let mut p = pipeline(3);
        p.start(stream(10), Implementation::Software, true).unwrap();
        wait_finished(&p);

        let stats = p.stats();
        assert_eq!(stats.processed, 10);
        assert_eq!(stats.dropped, 7);

        let numbers: Vec<_> = std::iter::from_fn(|| p.get())
            .map(|pair| pair.decoded.frame_number())
            .collect();
        assert_eq!(numbers, vec![0, 1, 2]);
        assert!(p.stop().is_ok());
    }

    #[test]
    fn slow_consumer_applies_backpressure() {
        let mut p = pipeline(2);
        p.start(stream(8), Implementation::Software, false).unwrap();

        let mut count = 0;
        while let Some(pair) = p.get() {
            thread::sleep(Duration::from_millis(2));
            assert!(pair.is_matched());
            count += 1;
        }
        assert_eq!(count, 8);
        assert_eq!(p.stats().dropped, 0);
        assert!(p.stop().is_ok());
        assert_eq!(p.decode_pool().reserved_count(), 0);
    }

    #[test]
    fn start_while_running_is_rejected() {
        let mut p = pipeline(1);
        p.start(stream(6), Implementation::Software, false).unwrap();
        // the producer blocks on the full queue
        thread::sleep(Duration::from_millis(20));
        assert!(p.is_running());
        assert!(matches!(
            p.start(stream(1), Implementation::Software, false),
            Err(PipelineError::AlreadyRunning)
        ));
        assert!(p.stop().is_ok());
        assert!(!p.is_running());
    }

    #[test]
    fn restarts_with_a_fresh_queue() {
        let mut p = pipeline(2);
        p.start(stream(3), Implementation::Software, false).unwrap();
        assert_eq!(std::iter::from_fn(|| p.get()).count(), 3);
        p.stop().unwrap();

        p.start(stream(5), Implementation::Software, false).unwrap();
        assert_eq!(std::iter::from_fn(|| p.get()).count(), 5);
        p.stop().unwrap();
        assert_eq!(p.stats().decoded, 5);
    }

    #[test]
    fn restart_keeps_pairs_held_from_the_previous_run() {
        let mut p = pipeline(2);
        p.start(stream(4), Implementation::Software, false).unwrap();
        let held = p.get().unwrap();
        let (old_decode, old_vpp) = (p.decode_pool().clone(), p.vpp_pool().clone());
        p.stop().unwrap();

        p.start(stream(3), Implementation::Software, false).unwrap();
        assert_eq!(std::iter::from_fn(|| p.get()).count(), 3);
        p.stop().unwrap();

        assert!(!Arc::ptr_eq(&old_decode, p.decode_pool()));
        assert!(held.processed.with_data(|d| d.len()).unwrap() > 0);
        assert!(held.decoded.with_data(|d| d.len()).unwrap() > 0);
        assert_eq!(old_decode.reserved_count(), 1);
        assert_eq!(old_vpp.reserved_count(), 1);

        drop(held);
        assert_eq!(old_decode.reserved_count(), 0);
        assert_eq!(old_vpp.reserved_count(), 0);
        assert_eq!(p.decode_pool().reserved_count(), 0);
    }

    #[test]
    fn stop_does_not_wait_for_held_pairs() {
        let mut p = pipeline(1);
        p.start(stream(20), Implementation::Software, false).unwrap();

        let held = p.get().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(p.stop().is_ok());

        // still mapped and releasable after the thread is gone
        assert!(held.processed.with_data(|d| d.len()).unwrap() > 0);
        drop(held);
        assert_eq!(p.decode_pool().reserved_count(), 0);
        assert_eq!(p.vpp_pool().reserved_count(), 0);
    }

    #[test]
    fn setup_failure_is_reported_by_stop() {
        let mut p = pipeline(2);
        p.start(vec![0u8; 100], Implementation::Software, false).unwrap();
        assert!(p.get().is_none());
        assert!(matches!(
            p.stop(),
            Err(PipelineError::Stage(StageError::HeaderNotFound(_)))
        ));
    }

    #[test]
    fn consumer_thread_reads_the_output_queue() {
        let mut p = pipeline(2);
        p.start(stream(6), Implementation::Software, false).unwrap();

        let output = p.output();
        let consumer = thread::spawn(move || {
            let mut odd = 0;
            while let Some(pair) = output.get_where(|p| p.decoded.frame_number() % 2 == 1) {
                assert_eq!(pair.decoded.frame_number() % 2, 1);
                odd += 1;
            }
            odd
        });

        // the even pairs are left for this thread
        let mut even = 0;
        while let Some(pair) = p.get_where(|p| p.decoded.frame_number() % 2 == 0) {
            assert_eq!(pair.decoded.frame_number() % 2, 0);
            even += 1;
        }
        assert_eq!(even + consumer.join().unwrap(), 6);
        p.stop().unwrap();
    }
}
