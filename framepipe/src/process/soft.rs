//! Software reference session.
//!
//! Decodes RAWV streams (see [`crate::structs::rawv`]) and runs a
//! nearest-neighbour resize with NV12/RGB4 conversion as the VPP stage. Work
//! completes inside the async calls; sync points resolve after a configurable
//! number of polls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::alloc::{AllocRequest, FrameData};
use crate::device::{Device, Implementation};
use crate::process::bitstream::Bitstream;
use crate::process::stage::{
    DecodeCall, DecodeStage, Session, SessionFactory, Stage, Status, SyncPoint, Synchronize,
    VideoParams, VppCall, VppParams, VppStage,
};
use crate::structs::frame::{FourCc, FrameInfo, PicStruct};
use crate::structs::rawv::{FrameLocation, RAWV_HEADER_LEN, RawvHeader, locate_frame};
use crate::structs::surface::Surface;
use crate::utils::errors::{AllocError, StageError};

const DECODE_SURFACES: usize = 2;

/// Creates software sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftSessionFactory {
    sync_latency: u32,
}

impl SoftSessionFactory {
    /// Sync points report `InExecution` for `polls` polls before completing.
    pub fn with_sync_latency(polls: u32) -> Self {
        Self {
            sync_latency: polls,
        }
    }
}

impl SessionFactory for SoftSessionFactory {
    fn create_session(
        &self,
        device: &Arc<Device>,
        implementation: Implementation,
    ) -> Result<Session, StageError> {
        if implementation == Implementation::Hardware {
            return Err(StageError::Status {
                stage: Stage::Decode,
                status: Status::Unsupported,
            });
        }
        if device.is_closed() {
            return Err(StageError::Alloc(AllocError::DeviceClosed));
        }

        let completions = Arc::new(Completions::new(self.sync_latency));
        log::debug!("Created software session ({implementation} requested)");
        Ok(Session {
            decoder: Box::new(SoftDecoder {
                params: None,
                frame_order: 0,
                completions: completions.clone(),
            }),
            vpp: Box::new(SoftVpp {
                params: None,
                completions: completions.clone(),
            }),
            sync: Box::new(SoftSync { completions }),
        })
    }
}

struct PendingOp {
    surface: Arc<Surface>,
    polls_left: u32,
}

/// Operations submitted by both stages and not yet synchronized.
struct Completions {
    pending: Mutex<HashMap<SyncPoint, PendingOp>>,
    next: AtomicU64,
    latency: u32,
}

impl Completions {
    fn new(latency: u32) -> Self {
        Self {
            pending: Mutex::default(),
            next: AtomicU64::new(1),
            latency,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<SyncPoint, PendingOp>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Holds `surface` until its sync point is synchronized.
    fn submit(&self, surface: &Arc<Surface>) -> SyncPoint {
        let point = SyncPoint(self.next.fetch_add(1, Ordering::Relaxed));
        surface.begin_use();
        self.pending().insert(
            point,
            PendingOp {
                surface: surface.clone(),
                polls_left: self.latency,
            },
        );
        point
    }

    fn poll(&self, point: SyncPoint) -> Status {
        let mut pending = self.pending();
        let Some(op) = pending.get_mut(&point) else {
            return Status::InvalidHandle;
        };
        if op.polls_left > 0 {
            op.polls_left -= 1;
            return Status::InExecution;
        }
        if let Some(op) = pending.remove(&point) {
            op.surface.end_use();
        }
        Status::Ok
    }

    /// Releases every surface still held by an unsynchronized operation.
    fn abandon(&self) {
        for (_, op) in self.pending().drain() {
            op.surface.end_use();
        }
    }
}

struct SoftDecoder {
    params: Option<VideoParams>,
    frame_order: u32,
    completions: Arc<Completions>,
}

impl SoftDecoder {
    fn write_frame(
        &self,
        payload: &[u8],
        header: &RawvHeader,
        work: &Surface,
    ) -> Result<(), AllocError> {
        let info = *work.info();
        work.with_data(|view| {
            let mut dst = view.bytes();
            let width = u32::from(header.width);
            let height = u32::from(header.height);
            let row = header.fourcc.pitch(width);
            let pitch = view.pitch;

            for (y, src) in payload.chunks_exact(row).take(height as usize).enumerate() {
                dst[y * pitch..y * pitch + row].copy_from_slice(src);
            }
            if header.fourcc == FourCc::Nv12 {
                let uv_src = &payload[row * height as usize..];
                let uv_dst = pitch * info.height as usize;
                for (y, src) in uv_src.chunks_exact(row).enumerate() {
                    let at = uv_dst + y * pitch;
                    dst[at..at + row].copy_from_slice(src);
                }
            }
        })
    }

    fn matches(params: &VideoParams, header: &RawvHeader) -> bool {
        let info = &params.frame_info;
        info.fourcc == header.fourcc
            && info.crop_w == u32::from(header.width)
            && info.crop_h == u32::from(header.height)
    }
}

impl DecodeStage for SoftDecoder {
    fn decode_header(&mut self, bitstream: &mut Bitstream) -> Result<VideoParams, StageError> {
        let header = match locate_frame(bitstream.data()) {
            FrameLocation::Complete { offset, header, .. }
            | FrameLocation::Partial {
                offset,
                header: Some(header),
                ..
            } => {
                bitstream.consume(offset);
                header
            }
            FrameLocation::Partial { offset, .. } => {
                bitstream.consume(offset);
                return Err(StageError::HeaderNotFound(bitstream.len()));
            }
            FrameLocation::NotFound { discard } => {
                let scanned = bitstream.len();
                bitstream.consume(discard);
                return Err(StageError::HeaderNotFound(scanned));
            }
        };

        if header.fourcc == FourCc::Nv12 && (header.width % 2 != 0 || header.height % 2 != 0) {
            return Err(StageError::UnsupportedFormat(format!(
                "odd NV12 geometry {}x{}",
                header.width, header.height
            )));
        }

        Ok(VideoParams {
            frame_info: FrameInfo::with_crop(
                header.fourcc,
                u32::from(header.width),
                u32::from(header.height),
                PicStruct::Progressive,
            ),
            ..VideoParams::default()
        })
    }

    fn query_io_surf(&mut self, params: &VideoParams) -> Result<AllocRequest, StageError> {
        Ok(AllocRequest {
            alloc_id: 1,
            mem_type: params.mem_type,
            info: params.frame_info,
            num_frame_min: 1,
            num_frame_suggested: DECODE_SURFACES,
        })
    }

    fn init(&mut self, params: &VideoParams) -> Result<(), StageError> {
        log::debug!("Software decoder init: {}", params.frame_info);
        self.params = Some(*params);
        Ok(())
    }

    fn decode_frame_async(
        &mut self,
        bitstream: Option<&mut Bitstream>,
        work: &Arc<Surface>,
    ) -> DecodeCall {
        let Some(params) = self.params else {
            return DecodeCall::status(Status::NotInitialized);
        };
        if work.in_use() {
            return DecodeCall::status(Status::MoreSurface);
        }
        // nothing is buffered inside the decoder, draining yields no frames
        let Some(bitstream) = bitstream else {
            return DecodeCall::status(Status::MoreData);
        };

        let (header, len) = match locate_frame(bitstream.data()) {
            FrameLocation::Complete {
                offset,
                header,
                len,
            } => {
                bitstream.consume(offset);
                (header, len)
            }
            FrameLocation::Partial { offset, needed, .. } => {
                bitstream.consume(offset);
                bitstream.require(needed);
                return DecodeCall::status(Status::MoreData);
            }
            FrameLocation::NotFound { discard } => {
                bitstream.consume(discard);
                return DecodeCall::status(Status::MoreData);
            }
        };

        if !Self::matches(&params, &header) {
            log::debug!(
                "Frame {}x{} {} does not match the stream parameters {}",
                header.width,
                header.height,
                header.fourcc,
                params.frame_info
            );
            bitstream.consume(len);
            return DecodeCall::status(Status::VideoParamChanged);
        }

        let payload = &bitstream.data()[RAWV_HEADER_LEN..len];
        if let Err(e) = self.write_frame(payload, &header, work) {
            log::error!("Software decoder could not write surface {}: {e}", work.index());
            return DecodeCall::status(Status::MemoryAlloc);
        }
        bitstream.consume(len);

        work.set_frame_order(self.frame_order);
        work.set_corrupted(header.corrupted);
        self.frame_order = self.frame_order.wrapping_add(1);

        DecodeCall {
            status: Status::Ok,
            output: Some(work.clone()),
            sync: Some(self.completions.submit(work)),
        }
    }

    fn reset(&mut self, params: &VideoParams) -> Result<(), StageError> {
        log::debug!("Software decoder reset");
        self.params = Some(*params);
        Ok(())
    }

    fn close(&mut self) {
        if self.params.take().is_some() {
            self.completions.abandon();
        }
    }
}

struct SoftVpp {
    params: Option<VppParams>,
    completions: Arc<Completions>,
}

impl VppStage for SoftVpp {
    fn query_io_surf(&mut self, params: &VppParams) -> Result<[AllocRequest; 2], StageError> {
        let request = |alloc_id, info| AllocRequest {
            alloc_id,
            mem_type: params.mem_type,
            info,
            num_frame_min: 1,
            num_frame_suggested: 1,
        };
        Ok([request(2, params.input), request(3, params.output)])
    }

    fn init(&mut self, params: &VppParams) -> Result<(), StageError> {
        if params.output.crop_w == 0 || params.output.crop_h == 0 {
            return Err(StageError::UnsupportedFormat(format!(
                "empty VPP output {}",
                params.output
            )));
        }
        log::debug!(
            "Software VPP init: {} -> {}",
            params.input,
            params.output
        );
        self.params = Some(*params);
        Ok(())
    }

    fn run_frame_async(&mut self, input: Option<&Arc<Surface>>, output: &Arc<Surface>) -> VppCall {
        if self.params.is_none() {
            return VppCall::status(Status::NotInitialized);
        }
        let Some(input) = input else {
            return VppCall::status(Status::MoreData);
        };

        let converted = input.with_data(|src| {
            output.with_data(|dst| convert(src, input.info(), dst, output.info()))
        });
        if let Err(e) = converted.and_then(|inner| inner) {
            log::error!("Software VPP could not access surfaces: {e}");
            return VppCall::status(Status::MemoryAlloc);
        }

        output.set_frame_order(input.frame_order());
        output.set_corrupted(false);
        VppCall {
            status: Status::Ok,
            sync: Some(self.completions.submit(output)),
        }
    }

    fn close(&mut self) {
        self.params = None;
    }
}

struct SoftSync {
    completions: Arc<Completions>,
}

impl Synchronize for SoftSync {
    fn sync_operation(&mut self, sync: SyncPoint, _wait: Duration) -> Status {
        self.completions.poll(sync)
    }
}

/// Nearest-neighbour scale of the `src` crop into the `dst` crop.
fn convert(src: &FrameData, src_info: &FrameInfo, dst: &FrameData, dst_info: &FrameInfo) {
    let source = src.bytes();
    let mut target = dst.bytes();
    let (sw, sh) = (src_info.crop_w.max(1) as usize, src_info.crop_h.max(1) as usize);
    let (dw, dh) = (dst_info.crop_w as usize, dst_info.crop_h as usize);

    for y in 0..dh {
        let sy = src_info.crop_y as usize + y * sh / dh;
        for x in 0..dw {
            let sx = src_info.crop_x as usize + x * sw / dw;
            let yuv = sample(&source, src.pitch, src_info, sx, sy);
            store(
                &mut target,
                dst.pitch,
                dst_info,
                dst_info.crop_x as usize + x,
                dst_info.crop_y as usize + y,
                yuv,
            );
        }
    }
}

fn sample(data: &[u8], pitch: usize, info: &FrameInfo, x: usize, y: usize) -> [u8; 3] {
    match info.fourcc {
        FourCc::Nv12 => {
            let uv = pitch * info.height as usize + (y / 2) * pitch + (x / 2) * 2;
            [data[y * pitch + x], data[uv], data[uv + 1]]
        }
        FourCc::Rgb4 => {
            let at = y * pitch + x * 4;
            rgb_to_yuv(data[at + 2], data[at + 1], data[at])
        }
    }
}

fn store(data: &mut [u8], pitch: usize, info: &FrameInfo, x: usize, y: usize, yuv: [u8; 3]) {
    match info.fourcc {
        FourCc::Nv12 => {
            data[y * pitch + x] = yuv[0];
            if x % 2 == 0 && y % 2 == 0 {
                let uv = pitch * info.height as usize + (y / 2) * pitch + x;
                data[uv] = yuv[1];
                data[uv + 1] = yuv[2];
            }
        }
        FourCc::Rgb4 => {
            let [r, g, b] = yuv_to_rgb(yuv);
            let at = y * pitch + x * 4;
            data[at..at + 4].copy_from_slice(&[b, g, r, 0xFF]);
        }
    }
}

// BT.601 limited range
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    [clamp(y), clamp(u), clamp(v)]
}

fn yuv_to_rgb([y, u, v]: [u8; 3]) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
