//! RAWV framed raw-video elementary stream.
//!
//! Every frame starts with a 16-byte big-endian header:
//!
//! | bits | field                                |
//! |------|--------------------------------------|
//! | 32   | sync word `0x52415756` ("RAWV")      |
//! | 16   | width                                |
//! | 16   | height                               |
//! | 32   | fourcc (`NV12` or `RGB4`)            |
//! | 8    | flags, bit 0 set on corrupted frames |
//! | 24   | reserved                             |
//!
//! The payload size follows from the geometry: `w * h * 3 / 2` bytes for NV12,
//! `w * h * 4` for RGB4, rows tightly packed.

use std::io::{self, Read, Write};

use anyhow::{Context, Result};

use crate::structs::frame::FourCc;
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::RawvError;

pub const RAWV_SYNC: u32 = 0x52_41_57_56;
pub const RAWV_HEADER_LEN: usize = 16;

const FLAG_CORRUPTED: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawvHeader {
    pub width: u16,
    pub height: u16,
    pub fourcc: FourCc,
    pub corrupted: bool,
}

impl RawvHeader {
    /// Parses a header from the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, RawvError> {
        if bytes.len() < RAWV_HEADER_LEN {
            return Err(RawvError::InsufficientData);
        }
        let mut reader = BsIoSliceReader::from_slice(&bytes[..RAWV_HEADER_LEN]);
        let read = |e: io::Error| {
            log::trace!("RAWV header read failed: {e}");
            RawvError::InsufficientData
        };

        let sync: u32 = reader.get_n(32).map_err(read)?;
        if sync != RAWV_SYNC {
            return Err(RawvError::BadSync(sync));
        }
        let width: u16 = reader.get_n(16).map_err(read)?;
        let height: u16 = reader.get_n(16).map_err(read)?;
        let code: u32 = reader.get_n(32).map_err(read)?;
        let flags: u8 = reader.get_n(8).map_err(read)?;
        reader.skip_n(24).map_err(read)?;

        let fourcc = FourCc::from_code(code).ok_or(RawvError::UnknownFourcc(code))?;
        if width == 0 || height == 0 {
            return Err(RawvError::EmptyGeometry { width, height });
        }

        Ok(Self {
            width,
            height,
            fourcc,
            corrupted: flags & FLAG_CORRUPTED != 0,
        })
    }

    pub fn to_bytes(&self) -> [u8; RAWV_HEADER_LEN] {
        let mut bytes = [0u8; RAWV_HEADER_LEN];
        bytes[0..4].copy_from_slice(&RAWV_SYNC.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.width.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.height.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.fourcc.code().to_be_bytes());
        bytes[12] = if self.corrupted { FLAG_CORRUPTED } else { 0 };
        bytes
    }

    pub fn payload_len(&self) -> usize {
        self.fourcc
            .frame_size(u32::from(self.width), u32::from(self.height))
    }

    pub fn frame_len(&self) -> usize {
        RAWV_HEADER_LEN + self.payload_len()
    }

    /// Writes the header followed by `payload`.
    pub fn write_frame<W: Write>(&self, payload: &[u8], out: &mut W) -> io::Result<()> {
        if payload.len() != self.payload_len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "payload is {} bytes, {}x{} {} needs {}",
                    payload.len(),
                    self.width,
                    self.height,
                    self.fourcc,
                    self.payload_len()
                ),
            ));
        }
        out.write_all(&self.to_bytes())?;
        out.write_all(payload)
    }
}

/// Where the next frame sits in a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLocation {
    /// A whole frame of `len` bytes starts at `offset`.
    Complete {
        offset: usize,
        header: RawvHeader,
        len: usize,
    },
    /// A frame starts at `offset` but only part of its `needed` bytes are
    /// there. `header` is known once the first 16 bytes arrived.
    Partial {
        offset: usize,
        header: Option<RawvHeader>,
        needed: usize,
    },
    /// No sync word. The first `discard` bytes can be dropped.
    NotFound { discard: usize },
}

/// Finds the first valid frame in `data`, skipping junk before it.
pub fn locate_frame(data: &[u8]) -> FrameLocation {
    let sync = RAWV_SYNC.to_be_bytes();
    let mut start = 0;

    while let Some(pos) = data[start..].windows(4).position(|w| w == sync) {
        let offset = start + pos;
        let rest = &data[offset..];
        if rest.len() < RAWV_HEADER_LEN {
            return FrameLocation::Partial {
                offset,
                header: None,
                needed: RAWV_HEADER_LEN,
            };
        }

        match RawvHeader::parse(rest) {
            Ok(header) => {
                let len = header.frame_len();
                return if rest.len() >= len {
                    FrameLocation::Complete {
                        offset,
                        header,
                        len,
                    }
                } else {
                    FrameLocation::Partial {
                        offset,
                        header: Some(header),
                        needed: len,
                    }
                };
            }
            Err(e) => {
                log::debug!("Skipping false sync at {offset}: {e}");
                start = offset + 1;
            }
        }
    }

    // keep a possible sync prefix at the tail
    FrameLocation::NotFound {
        discard: data.len().saturating_sub(sync.len() - 1).max(start),
    }
}

/// Collects frame headers from a stream pushed in arbitrary chunks.
///
/// Payloads are skipped; iteration yields each complete frame's header and
/// ends when the buffered data holds no further complete frame.
#[derive(Debug, Default)]
pub struct RawvScanner {
    buffer: Vec<u8>,
    skipped_bytes: usize,
}

impl RawvScanner {
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Junk bytes dropped while looking for sync words.
    pub fn skipped_bytes(&self) -> usize {
        self.skipped_bytes
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn skip(&mut self, count: usize) {
        self.skipped_bytes += count;
        self.buffer.drain(..count);
    }
}

impl Iterator for RawvScanner {
    type Item = RawvHeader;

    fn next(&mut self) -> Option<Self::Item> {
        match locate_frame(&self.buffer) {
            FrameLocation::Complete {
                offset,
                header,
                len,
            } => {
                self.skip(offset);
                self.buffer.drain(..len);
                Some(header)
            }
            FrameLocation::Partial { offset, .. } => {
                self.skip(offset);
                None
            }
            FrameLocation::NotFound { discard } => {
                self.skip(discard);
                None
            }
        }
    }
}

/// Totals gathered by [`summarize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub bytes: u64,
    pub frames: u64,
    pub corrupted: u64,
    /// Header of the first frame.
    pub first: Option<RawvHeader>,
    /// Frames whose geometry or fourcc differs from the previous frame.
    pub geometry_changes: u64,
    pub skipped_bytes: u64,
    /// Bytes of an incomplete frame at the end of the stream.
    pub trailing_bytes: u64,
}

/// Scans a whole RAWV stream from `reader`.
pub fn summarize<R: Read>(mut reader: R) -> Result<StreamSummary> {
    let mut scanner = RawvScanner::default();
    let mut summary = StreamSummary::default();
    let mut previous: Option<RawvHeader> = None;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("Failed to read RAWV stream"),
        };
        summary.bytes += n as u64;
        scanner.push_bytes(&buf[..n]);

        for header in scanner.by_ref() {
            summary.frames += 1;
            summary.corrupted += u64::from(header.corrupted);
            if let Some(prev) = previous {
                if (prev.width, prev.height, prev.fourcc)
                    != (header.width, header.height, header.fourcc)
                {
                    summary.geometry_changes += 1;
                }
            }
            summary.first.get_or_insert(header);
            previous = Some(header);
        }
    }

    summary.skipped_bytes = scanner.skipped_bytes() as u64;
    summary.trailing_bytes = scanner.pending_bytes() as u64;
    Ok(summary)
}
