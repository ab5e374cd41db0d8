use std::fmt::Display;

/// Pixel layouts understood by the pools and the software session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FourCc {
    /// 8-bit Y plane followed by an interleaved half-resolution UV plane.
    #[default]
    Nv12,
    /// Packed 8-bit B, G, R, A.
    Rgb4,
}

impl FourCc {
    pub const fn code(self) -> u32 {
        match self {
            FourCc::Nv12 => u32::from_be_bytes(*b"NV12"),
            FourCc::Rgb4 => u32::from_be_bytes(*b"RGB4"),
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match &code.to_be_bytes() {
            b"NV12" => Some(FourCc::Nv12),
            b"RGB4" => Some(FourCc::Rgb4),
            _ => None,
        }
    }

    /// Bytes per row of the first plane for a frame `width` pixels wide.
    pub const fn pitch(self, width: u32) -> usize {
        match self {
            FourCc::Nv12 => width as usize,
            FourCc::Rgb4 => width as usize * 4,
        }
    }

    /// Total bytes needed for a `width` x `height` frame.
    pub const fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            FourCc::Nv12 => pixels + pixels / 2,
            FourCc::Rgb4 => pixels * 4,
        }
    }
}

impl Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FourCc::Nv12 => write!(f, "NV12"),
            FourCc::Rgb4 => write!(f, "RGB4"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PicStruct {
    #[default]
    Progressive,
    FieldTff,
    FieldBff,
}

/// Geometry and format of every surface in a pool.
///
/// `width`/`height` are the allocated (aligned) dimensions, the crop
/// rectangle marks the visible picture inside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    pub fourcc: FourCc,
    pub width: u32,
    pub height: u32,
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_w: u32,
    pub crop_h: u32,
    pub pic_struct: PicStruct,
    pub frame_rate_n: u32,
    pub frame_rate_d: u32,
}

impl FrameInfo {
    /// Builds a frame description for a visible `crop_w` x `crop_h` picture,
    /// aligning the allocated size the way the hardware expects it.
    pub fn with_crop(fourcc: FourCc, crop_w: u32, crop_h: u32, pic_struct: PicStruct) -> Self {
        Self {
            fourcc,
            width: align16(crop_w),
            height: aligned_height(crop_h, pic_struct),
            crop_x: 0,
            crop_y: 0,
            crop_w,
            crop_h,
            pic_struct,
            frame_rate_n: 30,
            frame_rate_d: 1,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.fourcc.frame_size(self.width, self.height)
    }

    pub fn pitch(&self) -> usize {
        self.fourcc.pitch(self.width)
    }

    /// Copies the visible picture out of `data`, a buffer of this geometry
    /// with rows `pitch` bytes apart. Rows of the result are tightly packed.
    pub fn pack_visible(&self, data: &[u8], pitch: usize) -> Vec<u8> {
        let (x, y) = (self.crop_x as usize, self.crop_y as usize);
        let (w, h) = (self.crop_w as usize, self.crop_h as usize);
        let mut out = Vec::with_capacity(self.fourcc.frame_size(self.crop_w, self.crop_h));

        match self.fourcc {
            FourCc::Nv12 => {
                for row in y..y + h {
                    let at = row * pitch + x;
                    out.extend_from_slice(&data[at..at + w]);
                }
                let chroma = pitch * self.height as usize;
                for row in y / 2..(y + h) / 2 {
                    let at = chroma + row * pitch + (x & !1);
                    out.extend_from_slice(&data[at..at + w]);
                }
            }
            FourCc::Rgb4 => {
                for row in y..y + h {
                    let at = row * pitch + x * 4;
                    out.extend_from_slice(&data[at..at + w * 4]);
                }
            }
        }
        out
    }

    pub fn frame_rate(&self) -> f64 {
        if self.frame_rate_d == 0 {
            return 0.0;
        }
        self.frame_rate_n as f64 / self.frame_rate_d as f64
    }
}

impl Display for FrameInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} {} (crop {}x{}+{}+{})",
            self.width, self.height, self.fourcc, self.crop_w, self.crop_h, self.crop_x, self.crop_y
        )
    }
}

pub const fn align16(value: u32) -> u32 {
    (value + 15) & !15
}

pub const fn align32(value: u32) -> u32 {
    (value + 31) & !31
}

/// Height must be a multiple of 16 for frame pictures and of 32 for fields.
pub const fn aligned_height(height: u32, pic_struct: PicStruct) -> u32 {
    match pic_struct {
        PicStruct::Progressive => align16(height),
        PicStruct::FieldTff | PicStruct::FieldBff => align32(height),
    }
}

#[test]
fn fourcc_codes() {
    assert_eq!(FourCc::from_code(FourCc::Nv12.code()), Some(FourCc::Nv12));
    assert_eq!(FourCc::from_code(FourCc::Rgb4.code()), Some(FourCc::Rgb4));
    assert_eq!(FourCc::from_code(0x1234_5678), None);
    assert_eq!(FourCc::Rgb4.code(), 0x5247_4234);
}

#[test]
fn aligned_geometry() {
    let info = FrameInfo::with_crop(FourCc::Nv12, 1918, 1080, PicStruct::Progressive);
    assert_eq!((info.width, info.height), (1920, 1088));
    assert_eq!(info.frame_size(), 1920 * 1088 * 3 / 2);

    let field = FrameInfo::with_crop(FourCc::Rgb4, 448, 440, PicStruct::FieldTff);
    assert_eq!((field.width, field.height), (448, 448));
    assert_eq!(field.pitch(), 448 * 4);
}

#[test]
fn pack_visible_strips_padding() {
    let info = FrameInfo::with_crop(FourCc::Nv12, 4, 2, PicStruct::Progressive);
    let pitch = info.pitch();
    let mut data = vec![0u8; info.frame_size()];
    data[..4].copy_from_slice(&[1, 2, 3, 4]);
    data[pitch..pitch + 4].copy_from_slice(&[5, 6, 7, 8]);
    let chroma = pitch * info.height as usize;
    data[chroma..chroma + 4].copy_from_slice(&[9, 10, 11, 12]);

    assert_eq!(
        info.pack_visible(&data, pitch),
        vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
    );

    let rgb = FrameInfo::with_crop(FourCc::Rgb4, 1, 1, PicStruct::Progressive);
    let data = vec![7u8; rgb.frame_size()];
    assert_eq!(rgb.pack_visible(&data, rgb.pitch()), vec![7; 4]);
}
