use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use log::Level;

use crate::device::{Device, Implementation};
use crate::log_or_err;
use crate::process::bitstream::{Bitstream, StreamSource};
use crate::process::pipeline::{PipelineConfig, PipelineStats};
use crate::process::pool::SurfacePool;
use crate::process::stage::{Session, SessionFactory, Stage, Status, VideoParams, VppParams};
use crate::process::sync::{SyncPolicy, synchronize};
use crate::structs::surface::{FramePair, Surface};
use crate::utils::errors::{PipelineError, StageError};
use crate::utils::queue::BlockingQueue;

/// Everything a pipeline thread needs to set up and run.
pub(crate) struct DriverContext {
    pub device: Arc<Device>,
    pub factory: Arc<dyn SessionFactory>,
    pub implementation: Implementation,
    pub source: StreamSource,
    pub config: PipelineConfig,
    pub drop_on_overflow: bool,
    pub decode_pool: Arc<SurfacePool>,
    pub vpp_pool: Arc<SurfacePool>,
    pub output: Arc<BlockingQueue<FramePair>>,
    pub stop: Arc<AtomicBool>,
    pub stats: Arc<PipelineStats>,
}

/// Sets up a session from `ctx`, runs it to completion and closes the output
/// queue on every path.
pub(crate) fn execute(ctx: DriverContext) -> Result<(), PipelineError> {
    let output = ctx.output.clone();
    let result = Driver::new(ctx).and_then(|mut driver| driver.run());
    match &result {
        Ok(()) => log::info!("Pipeline finished"),
        Err(e) => log::error!("Pipeline aborted: {e}"),
    }
    output.close();
    result
}

/// The decode/VPP producer loop.
///
/// Each cycle decodes one frame, runs it through VPP and queues the matched
/// pair. Surfaces handed to the consumer stay reserved in their pools until
/// the pair is dropped.
pub(crate) struct Driver {
    _device: Arc<Device>,
    session: Session,
    bitstream: Bitstream,
    video_params: VideoParams,
    config: PipelineConfig,
    drop_on_overflow: bool,

    decode_pool: Arc<SurfacePool>,
    vpp_pool: Arc<SurfacePool>,
    output: Arc<BlockingQueue<FramePair>>,
    stop: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,

    pub(crate) fail_level: Level,
    sync_policy: SyncPolicy,
    dec_id: u64,
    vpp_id: u64,
    decoding: bool,
    processing: bool,
    started: Instant,
    last_report: Instant,
}

impl Driver {
    pub(crate) fn new(ctx: DriverContext) -> Result<Self, PipelineError> {
        let mut bitstream = Bitstream::open(ctx.source, ctx.config.bitstream_capacity)?;
        bitstream.set_repeat(ctx.config.repeat);
        bitstream.feed()?;

        let session = ctx
            .factory
            .create_session(&ctx.device, ctx.implementation)?;

        let now = Instant::now();
        let mut driver = Self {
            _device: ctx.device,
            session,
            bitstream,
            video_params: VideoParams::default(),
            fail_level: if ctx.config.strict {
                Level::Warn
            } else {
                Level::Error
            },
            sync_policy: ctx.config.sync,
            config: ctx.config,
            drop_on_overflow: ctx.drop_on_overflow,
            decode_pool: ctx.decode_pool,
            vpp_pool: ctx.vpp_pool,
            output: ctx.output,
            stop: ctx.stop,
            stats: ctx.stats,
            dec_id: 0,
            vpp_id: 0,
            decoding: true,
            processing: true,
            started: now,
            last_report: now,
        };
        driver.setup()?;
        Ok(driver)
    }

    fn setup(&mut self) -> Result<(), PipelineError> {
        let mut video = self.session.decoder.decode_header(&mut self.bitstream)?;
        video.mem_type = self.config.mem_type;
        let vpp = VppParams::for_decode(&video, &self.config.output);

        let mut decode_request = self.session.decoder.query_io_surf(&video)?;
        let [vpp_in, vpp_out] = self.session.vpp.query_io_surf(&vpp)?;
        // VPP reads straight from decode surfaces
        decode_request.num_frame_min += vpp_in.num_frame_min;
        decode_request.num_frame_suggested += vpp_in.num_frame_suggested;

        let queue_size = self.output.size_limit();
        self.decode_pool
            .realloc(&decode_request, queue_size + self.config.decode_reserve_extra)?;
        self.vpp_pool
            .realloc(&vpp_out, queue_size + self.config.vpp_reserve_extra)?;

        self.session.decoder.init(&video)?;
        self.session.vpp.init(&vpp)?;
        self.video_params = video;

        log::info!(
            "Pipeline setup: decode {} x{} ({} memory), vpp {} x{}, queue {}{}",
            video.frame_info,
            self.decode_pool.len(),
            video.mem_type,
            vpp.output,
            self.vpp_pool.len(),
            queue_size,
            if self.drop_on_overflow {
                ", dropping on overflow"
            } else {
                ""
            }
        );
        Ok(())
    }

    pub(crate) fn run(&mut self) -> Result<(), PipelineError> {
        self.started = Instant::now();
        self.last_report = self.started;

        while (self.decoding || self.processing) && !self.stop.load(Ordering::Acquire) {
            self.report_stats();

            let decoded = if self.decoding {
                self.decode_next()?
            } else {
                None
            };

            if let Some(surface) = &decoded {
                surface.set_frame_number(self.dec_id);
                if !self.decode_pool.reserve(surface, self.drop_on_overflow) {
                    log::debug!("Decode frame {} not reserved", self.dec_id);
                }
                self.dec_id += 1;
                self.stats.decoded.fetch_add(1, Ordering::Relaxed);
            }

            if decoded.is_some() || !self.decoding {
                self.process(decoded.as_ref())?;
            }
        }

        if self.stop.load(Ordering::Acquire) {
            log::info!("Pipeline stopped after {} frames", self.vpp_id);
        }
        Ok(())
    }

    /// Stage A: decodes until a frame is ready or the stream has ended.
    fn decode_next(&mut self) -> Result<Option<Arc<Surface>>, PipelineError> {
        let mut work: Option<Arc<Surface>> = None;

        loop {
            let surface = match work.take() {
                Some(surface) => surface,
                None => self.free_surface(Stage::Decode)?,
            };

            let input = (!self.bitstream.is_end()).then_some(&mut self.bitstream);
            let call = self.session.decoder.decode_frame_async(input, &surface);

            match call.status {
                Status::DeviceBusy => {
                    self.busy_wait(Stage::Decode);
                    work = Some(surface);
                    continue;
                }
                Status::MoreData => {
                    if self.bitstream.is_end() {
                        log::debug!("Decode finished after {} frames", self.dec_id);
                        self.decoding = false;
                        return Ok(None);
                    }
                    if self.bitstream.source_exhausted() {
                        log::warn!(
                            "Discarding {} undecodable bytes at end of stream",
                            self.bitstream.len()
                        );
                        self.bitstream.discard();
                    } else if self.bitstream.feed()? == 0
                        && self.bitstream.len() == self.bitstream.capacity()
                    {
                        return Err(StageError::InputStalled(self.bitstream.len()).into());
                    }
                    work = Some(surface);
                    continue;
                }
                Status::MoreSurface => continue,
                Status::VideoParamChanged => {
                    log_or_err!(self, Level::Warn, PipelineError::ParamChanged)
                }
                status if status.is_error() => {
                    return Err(PipelineError::StageFailed {
                        stage: Stage::Decode,
                        status,
                    });
                }
                _ => {}
            }

            let (Some(point), Some(output)) = (call.sync, call.output) else {
                work = Some(surface);
                continue;
            };

            let status = synchronize(self.session.sync.as_mut(), point, &self.sync_policy);
            if status != Status::Ok {
                log::warn!("Decode sync failed with {status:?}");
                continue;
            }

            if output.is_corrupted() {
                log::warn!(
                    "Corrupted frame (order {}), resetting decoder",
                    output.frame_order()
                );
                self.stats.corrupted.fetch_add(1, Ordering::Relaxed);
                self.session.decoder.reset(&self.video_params)?;
                continue;
            }

            return Ok(Some(output));
        }
    }

    /// Stage B: runs VPP on `input` and queues the resulting pair. `None`
    /// drains VPP after decoding has finished.
    fn process(&mut self, input: Option<&Arc<Surface>>) -> Result<(), PipelineError> {
        let output = self.free_surface(Stage::Vpp)?;

        let call = loop {
            let call = self.session.vpp.run_frame_async(input, &output);
            if call.status.is_warning() && call.sync.is_none() {
                self.busy_wait(Stage::Vpp);
                continue;
            }
            break call;
        };

        match call.status {
            Status::MoreData => {
                if input.is_none() {
                    log::debug!("VPP drained after {} frames", self.vpp_id);
                    self.processing = false;
                }
                return Ok(());
            }
            Status::MoreSurface => return Err(PipelineError::MoreSurfaceUnsupported),
            status if status.is_error() => {
                return Err(PipelineError::StageFailed {
                    stage: Stage::Vpp,
                    status,
                });
            }
            _ => {}
        }

        let Some(point) = call.sync else {
            return Ok(());
        };
        let status = synchronize(self.session.sync.as_mut(), point, &self.sync_policy);
        if status != Status::Ok {
            log::warn!("VPP sync failed with {status:?}");
            if let Some(input) = input {
                self.decode_pool.unreserve(input);
            }
            return Ok(());
        }

        let mut reserved = self.vpp_pool.reserve(&output, self.drop_on_overflow);
        output.set_frame_number(self.vpp_id);

        let order = output.frame_order();
        let decoded = self
            .decode_pool
            .find(order)
            .ok_or(PipelineError::FrameOrderNotFound(order))?;
        reserved &= self.decode_pool.reserve(&decoded, self.drop_on_overflow);

        log::debug!(
            "Frame pair: decode #{} vpp #{} (order {order})",
            decoded.frame_number(),
            output.frame_number()
        );
        let pair = FramePair::new(
            self.decode_pool.handle(decoded),
            self.vpp_pool.handle(output),
        );

        // an unqueued pair unreserves both surfaces when it goes out of scope
        let queued = reserved && self.output.put(pair, self.drop_on_overflow);
        if !queued {
            log::debug!("Dropped frame #{}", self.vpp_id);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }

        self.vpp_id += 1;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn free_surface(&self, stage: Stage) -> Result<Arc<Surface>, PipelineError> {
        let pool = match stage {
            Stage::Decode => &self.decode_pool,
            Stage::Vpp => &self.vpp_pool,
        };
        pool.get_free().ok_or_else(|| {
            pool.debug_dump();
            PipelineError::PoolExhausted(stage)
        })
    }

    fn busy_wait(&self, stage: Stage) {
        log::trace!("{stage} busy, retrying");
        self.stats.busy_retries.fetch_add(1, Ordering::Relaxed);
        thread::sleep(self.config.busy_sleep);
    }

    fn report_stats(&mut self) {
        let Some(interval) = self.config.stats_interval else {
            return;
        };
        if self.last_report.elapsed() < interval {
            return;
        }
        self.last_report = Instant::now();

        let stats = self.stats.snapshot();
        let elapsed = self.started.elapsed().as_secs_f64().max(f64::EPSILON);
        let effective = stats.processed.saturating_sub(stats.dropped);
        log::info!(
            "decoded {} processed {} dropped {} | {:.1} fps, {:.1} effective",
            stats.decoded,
            stats.processed,
            stats.dropped,
            stats.processed as f64 / elapsed,
            effective as f64 / elapsed
        );
    }

    #[cfg(test)]
    fn frames(&self) -> (u64, u64) {
        (self.dec_id, self.vpp_id)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocRequest;
    use crate::process::bitstream::Bitstream;
    use crate::process::stage::{
        DecodeCall, DecodeStage, SyncPoint, Synchronize, VppCall, VppStage,
    };
    use crate::structs::frame::{FourCc, FrameInfo, PicStruct};
    use crate::utils::errors::StageError;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Step {
        Busy,
        MoreData,
        /// Holds the work surface, as a decoder keeping a reference frame.
        MoreSurface,
        ParamChanged,
        Frame,
        Corrupted,
        Fail,
        /// Holds the work surface forever and asks for another one.
        Leak,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum VppStep {
        Busy,
        Frame,
        MoreSurface,
        WrongOrder,
        SyncTimeout,
    }

    #[derive(Default)]
    struct Trace {
        decode_surfaces: Vec<usize>,
        vpp_inputs: Vec<Option<u32>>,
        resets: usize,
        closed: usize,
    }

    #[derive(Default)]
    struct Pending {
        ops: HashMap<SyncPoint, (Arc<Surface>, Status)>,
        next: u64,
    }

    impl Pending {
        fn submit(&mut self, surface: &Arc<Surface>, status: Status) -> SyncPoint {
            self.next += 1;
            surface.begin_use();
            self.ops.insert(SyncPoint(self.next), (surface.clone(), status));
            SyncPoint(self.next)
        }
    }

    struct MockDecoder {
        steps: VecDeque<Step>,
        order: u32,
        pending: Arc<Mutex<Pending>>,
        trace: Arc<Mutex<Trace>>,
    }

    impl DecodeStage for MockDecoder {
        fn decode_header(&mut self, _: &mut Bitstream) -> Result<VideoParams, StageError> {
            Ok(VideoParams {
                frame_info: FrameInfo::with_crop(FourCc::Nv12, 64, 48, PicStruct::Progressive),
                ..VideoParams::default()
            })
        }

        fn query_io_surf(&mut self, params: &VideoParams) -> Result<AllocRequest, StageError> {
            Ok(AllocRequest {
                alloc_id: 1,
                mem_type: params.mem_type,
                info: params.frame_info,
                num_frame_min: 1,
                num_frame_suggested: 1,
            })
        }

        fn init(&mut self, _: &VideoParams) -> Result<(), StageError> {
            Ok(())
        }

        fn decode_frame_async(
            &mut self,
            _: Option<&mut Bitstream>,
            work: &Arc<Surface>,
        ) -> DecodeCall {
            self.trace.lock().unwrap().decode_surfaces.push(work.index());
            let Some(step) = self.steps.pop_front() else {
                return DecodeCall::status(Status::MoreData);
            };
            match step {
                Step::Busy => DecodeCall::status(Status::DeviceBusy),
                Step::MoreData => DecodeCall::status(Status::MoreData),
                Step::MoreSurface | Step::Leak => {
                    work.begin_use();
                    DecodeCall::status(Status::MoreSurface)
                }
                Step::ParamChanged => DecodeCall::status(Status::VideoParamChanged),
                Step::Fail => DecodeCall::status(Status::DeviceFailed),
                Step::Frame | Step::Corrupted => {
                    work.set_frame_order(self.order);
                    work.set_corrupted(step == Step::Corrupted);
                    self.order += 1;
                    let sync = self.pending.lock().unwrap().submit(work, Status::Ok);
                    DecodeCall {
                        status: Status::Ok,
                        output: Some(work.clone()),
                        sync: Some(sync),
                    }
                }
            }
        }

        fn reset(&mut self, _: &VideoParams) -> Result<(), StageError> {
            self.trace.lock().unwrap().resets += 1;
            Ok(())
        }

        fn close(&mut self) {
            self.trace.lock().unwrap().closed += 1;
        }
    }

    struct MockVpp {
        steps: VecDeque<VppStep>,
        pending: Arc<Mutex<Pending>>,
        trace: Arc<Mutex<Trace>>,
    }

    impl VppStage for MockVpp {
        fn query_io_surf(&mut self, params: &VppParams) -> Result<[AllocRequest; 2], StageError> {
            let request = |info| AllocRequest {
                alloc_id: 2,
                mem_type: params.mem_type,
                info,
                num_frame_min: 1,
                num_frame_suggested: 1,
            };
            Ok([request(params.input), request(params.output)])
        }

        fn init(&mut self, _: &VppParams) -> Result<(), StageError> {
            Ok(())
        }

        fn run_frame_async(
            &mut self,
            input: Option<&Arc<Surface>>,
            output: &Arc<Surface>,
        ) -> VppCall {
            self.trace
                .lock()
                .unwrap()
                .vpp_inputs
                .push(input.map(|s| s.frame_order()));
            let Some(input) = input else {
                return VppCall::status(Status::MoreData);
            };
            let step = self.steps.pop_front().unwrap_or(VppStep::Frame);
            let (order, sync_status) = match step {
                VppStep::Busy => return VppCall::status(Status::DeviceBusy),
                VppStep::MoreSurface => return VppCall::status(Status::MoreSurface),
                VppStep::Frame => (input.frame_order(), Status::Ok),
                VppStep::WrongOrder => (input.frame_order() + 1000, Status::Ok),
                VppStep::SyncTimeout => (input.frame_order(), Status::Timeout),
            };
            output.set_frame_order(order);
            VppCall {
                status: Status::Ok,
                sync: Some(self.pending.lock().unwrap().submit(output, sync_status)),
            }
        }

        fn close(&mut self) {}
    }

    struct MockSync {
        pending: Arc<Mutex<Pending>>,
    }

    impl Synchronize for MockSync {
        fn sync_operation(&mut self, sync: SyncPoint, _: Duration) -> Status {
            match self.pending.lock().unwrap().ops.remove(&sync) {
                Some((surface, status)) => {
                    surface.end_use();
                    status
                }
                None => Status::InvalidHandle,
            }
        }
    }

    struct MockFactory(Mutex<Option<Session>>);

    impl SessionFactory for MockFactory {
        fn create_session(
            &self,
            _: &Arc<Device>,
            _: Implementation,
        ) -> Result<Session, StageError> {
            self.0.lock().unwrap().take().ok_or(StageError::Status {
                stage: Stage::Decode,
                status: Status::Unsupported,
            })
        }
    }

    struct Run {
        result: Result<(), PipelineError>,
        queue: Arc<BlockingQueue<FramePair>>,
        stats: Arc<PipelineStats>,
        trace: Arc<Mutex<Trace>>,
        decode_pool: Arc<SurfacePool>,
        vpp_pool: Arc<SurfacePool>,
    }

    fn run(decode: &[Step], vpp: &[VppStep], config: PipelineConfig, drop: bool) -> Run {
        run_on(Vec::new(), decode, vpp, config, drop)
    }

    fn run_on(
        source: Vec<u8>,
        decode: &[Step],
        vpp: &[VppStep],
        config: PipelineConfig,
        drop: bool,
    ) -> Run {
        let device = Device::open(Implementation::Software);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let trace = Arc::new(Mutex::new(Trace::default()));
        let session = Session {
            decoder: Box::new(MockDecoder {
                steps: decode.iter().copied().collect(),
                order: 0,
                pending: pending.clone(),
                trace: trace.clone(),
            }),
            vpp: Box::new(MockVpp {
                steps: vpp.iter().copied().collect(),
                pending: pending.clone(),
                trace: trace.clone(),
            }),
            sync: Box::new(MockSync { pending }),
        };

        let queue = Arc::new(BlockingQueue::new(config.queue_size));
        let stats = Arc::new(PipelineStats::default());
        let decode_pool = Arc::new(SurfacePool::new(Stage::Decode, device.allocator()));
        let vpp_pool = Arc::new(SurfacePool::new(Stage::Vpp, device.allocator()));
        let result = execute(DriverContext {
            device,
            factory: Arc::new(MockFactory(Mutex::new(Some(session)))),
            implementation: Implementation::Auto,
            source: source.into(),
            config,
            drop_on_overflow: drop,
            decode_pool: decode_pool.clone(),
            vpp_pool: vpp_pool.clone(),
            output: queue.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            stats: stats.clone(),
        });

        Run {
            result,
            queue,
            stats,
            trace,
            decode_pool,
            vpp_pool,
        }
    }

    fn drain(queue: &BlockingQueue<FramePair>) -> Vec<(u64, u64)> {
        let mut frames = Vec::new();
        while let Some(pair) = queue.get() {
            frames.push((pair.decoded.frame_number(), pair.processed.frame_number()));
        }
        frames
    }

    #[test]
    fn exhausted_input_drains_vpp_and_closes_queue() {
        let r = run(
            &[Step::Frame, Step::Frame, Step::Frame],
            &[],
            PipelineConfig::default(),
            false,
        );
        assert!(r.result.is_ok());
        assert!(r.queue.is_closed());

        // the last VPP call is the drain with no decode input
        assert_eq!(r.trace.lock().unwrap().vpp_inputs.last(), Some(&None));
        assert_eq!(r.trace.lock().unwrap().closed, 1);
        assert_eq!(drain(&r.queue), vec![(0, 0), (1, 1), (2, 2)]);
        assert_eq!(r.stats.snapshot().decoded, 3);
        assert_eq!(r.stats.snapshot().dropped, 0);
    }

    #[test]
    fn pairs_hold_reservations_until_dropped() {
        let r = run(&[Step::Frame, Step::Frame], &[], PipelineConfig::default(), false);
        assert!(r.result.is_ok());
        assert_eq!(r.decode_pool.reserved_count(), 2);
        assert_eq!(r.vpp_pool.reserved_count(), 2);

        let first = r.queue.get().unwrap();
        assert_eq!(r.decode_pool.reserved_count(), 2);
        drop(first);
        assert_eq!(r.decode_pool.reserved_count(), 1);
        assert_eq!(r.vpp_pool.reserved_count(), 1);

        drain(&r.queue);
        assert_eq!(r.decode_pool.reserved_count(), 0);
        assert_eq!(r.vpp_pool.reserved_count(), 0);
    }

    #[test]
    fn busy_retries_keep_the_work_surface() {
        let config = PipelineConfig {
            busy_sleep: Duration::ZERO,
            ..PipelineConfig::default()
        };
        let r = run(
            &[Step::Busy, Step::Busy, Step::Frame],
            &[VppStep::Busy, VppStep::Frame],
            config,
            false,
        );
        assert!(r.result.is_ok());
        let trace = r.trace.lock().unwrap();
        assert_eq!(&trace.decode_surfaces[..3], &[0, 0, 0]);
        assert_eq!(r.stats.snapshot().busy_retries, 3);
        assert_eq!(drain(&r.queue).len(), 1);
    }

    #[test]
    fn more_surface_fetches_a_new_work_surface() {
        let r = run(
            &[Step::MoreSurface, Step::Frame],
            &[],
            PipelineConfig::default(),
            false,
        );
        assert!(r.result.is_ok());
        let trace = r.trace.lock().unwrap();
        assert_eq!(&trace.decode_surfaces[..2], &[0, 1]);
        assert_eq!(drain(&r.queue).len(), 1);
    }

    #[test]
    fn corrupted_frames_reset_the_decoder() {
        let r = run(
            &[Step::Frame, Step::Corrupted, Step::Frame],
            &[],
            PipelineConfig::default(),
            false,
        );
        assert!(r.result.is_ok());
        assert_eq!(r.trace.lock().unwrap().resets, 1);
        assert_eq!(r.stats.snapshot().corrupted, 1);
        assert_eq!(drain(&r.queue), vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn param_change_is_fatal_only_in_strict_mode() {
        let steps = [Step::ParamChanged, Step::Frame];
        let r = run(&steps, &[], PipelineConfig::default(), false);
        assert!(r.result.is_ok());
        assert_eq!(drain(&r.queue).len(), 1);

        let strict = PipelineConfig {
            strict: true,
            ..PipelineConfig::default()
        };
        let r = run(&steps, &[], strict, false);
        assert!(matches!(r.result, Err(PipelineError::ParamChanged)));
        assert!(r.queue.is_closed());
        assert_eq!(r.trace.lock().unwrap().closed, 1);
    }

    #[test]
    fn decode_failure_aborts() {
        let r = run(&[Step::Frame, Step::Fail], &[], PipelineConfig::default(), false);
        assert!(matches!(
            r.result,
            Err(PipelineError::StageFailed {
                stage: Stage::Decode,
                status: Status::DeviceFailed
            })
        ));
        // pairs queued before the failure are still delivered
        assert_eq!(drain(&r.queue).len(), 1);
    }

    #[test]
    fn full_input_window_without_progress_is_fatal() {
        let config = PipelineConfig {
            bitstream_capacity: 16,
            ..PipelineConfig::default()
        };
        // the mock decoder never consumes and keeps asking for data
        let r = run_on(vec![0x11; 64], &[], &[], config, false);
        assert!(matches!(
            r.result,
            Err(PipelineError::Stage(StageError::InputStalled(16)))
        ));
        assert!(r.queue.is_closed());
        assert_eq!(r.stats.snapshot().decoded, 0);
    }

    #[test]
    fn exhausted_decode_pool_is_fatal() {
        let r = run(&[Step::Leak; 64], &[], PipelineConfig::default(), false);
        assert!(matches!(
            r.result,
            Err(PipelineError::PoolExhausted(Stage::Decode))
        ));
        assert!(r.queue.is_closed());
    }

    #[test]
    fn vpp_more_surface_is_unsupported() {
        let r = run(
            &[Step::Frame],
            &[VppStep::MoreSurface],
            PipelineConfig::default(),
            false,
        );
        assert!(matches!(
            r.result,
            Err(PipelineError::MoreSurfaceUnsupported)
        ));
    }

    #[test]
    fn unmatched_frame_order_is_fatal() {
        let r = run(
            &[Step::Frame],
            &[VppStep::WrongOrder],
            PipelineConfig::default(),
            false,
        );
        assert!(matches!(
            r.result,
            Err(PipelineError::FrameOrderNotFound(1000))
        ));
    }

    #[test]
    fn vpp_sync_failure_skips_the_frame() {
        let r = run(
            &[Step::Frame, Step::Frame],
            &[VppStep::SyncTimeout, VppStep::Frame],
            PipelineConfig::default(),
            false,
        );
        assert!(r.result.is_ok());
        assert_eq!(r.decode_pool.reserved_count(), 1);
        assert_eq!(drain(&r.queue), vec![(1, 0)]);
    }

    #[test]
    fn overflow_drops_pairs_and_releases_surfaces() {
        let config = PipelineConfig {
            queue_size: 1,
            ..PipelineConfig::default()
        };
        let r = run(&[Step::Frame; 5], &[], config, true);
        assert!(r.result.is_ok());

        let stats = r.stats.snapshot();
        assert_eq!(stats.decoded, 5);
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.dropped, 4);
        assert_eq!(r.queue.size(), 1);
        assert_eq!(r.decode_pool.reserved_count(), 1);
        assert_eq!(r.vpp_pool.reserved_count(), 1);
        assert_eq!(drain(&r.queue), vec![(0, 0)]);
    }

    #[test]
    fn stop_flag_ends_the_loop() {
        let device = Device::open(Implementation::Software);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let trace = Arc::new(Mutex::new(Trace::default()));
        let session = Session {
            decoder: Box::new(MockDecoder {
                steps: [Step::Frame; 8].into_iter().collect(),
                order: 0,
                pending: pending.clone(),
                trace: trace.clone(),
            }),
            vpp: Box::new(MockVpp {
                steps: VecDeque::new(),
                pending: pending.clone(),
                trace,
            }),
            sync: Box::new(MockSync { pending }),
        };
        let stop = Arc::new(AtomicBool::new(true));
        let mut driver = Driver::new(DriverContext {
            device: device.clone(),
            factory: Arc::new(MockFactory(Mutex::new(Some(session)))),
            implementation: Implementation::Auto,
            source: Vec::new().into(),
            config: PipelineConfig::default(),
            drop_on_overflow: false,
            decode_pool: Arc::new(SurfacePool::new(Stage::Decode, device.allocator())),
            vpp_pool: Arc::new(SurfacePool::new(Stage::Vpp, device.allocator())),
            output: Arc::new(BlockingQueue::new(8)),
            stop,
            stats: Arc::new(PipelineStats::default()),
        })
        .unwrap();

        assert!(driver.run().is_ok());
        assert_eq!(driver.frames(), (0, 0));
    }
}
