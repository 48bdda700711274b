use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::source::{BufferHandle, FrameStream, SourceError};
use crate::pipeline::shm::SharedRegion;

/// Pixel formats a consumer can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Luma only
    Y800,
    /// Biplanar luma + interleaved UV
    Nv12,
    /// Biplanar luma + interleaved VU
    Nv21,
    /// Packed 8-bit RGB, converted locally from NV12
    Rgb3,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 4] = [Self::Y800, Self::Nv12, Self::Nv21, Self::Rgb3];

    pub const fn fourcc(self) -> u32 {
        let code = match self {
            Self::Y800 => *b"Y800",
            Self::Nv12 => *b"NV12",
            Self::Nv21 => *b"NV21",
            Self::Rgb3 => *b"RGB3",
        };
        u32::from_le_bytes(code)
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|fmt| fmt.fourcc() == code)
    }

    /// Subformat requested from the producer. The producer has no RGB output,
    /// so RGB3 asks for NV12 and converts.
    pub const fn native_subformat(self) -> &'static str {
        match self {
            Self::Y800 => "Y800",
            Self::Nv12 | Self::Rgb3 => "NV12",
            Self::Nv21 => "NV21",
        }
    }

    pub const fn channels(self) -> u8 {
        match self {
            Self::Rgb3 => 3,
            _ => 1,
        }
    }

    pub const fn needs_conversion(self) -> bool {
        matches!(self, Self::Rgb3)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc().to_le_bytes();
        f.write_str(std::str::from_utf8(&code).unwrap_or("????"))
    }
}

/// Encoding tag the producer attaches to each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Yuv,
    Rgb,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub sequence: u64,
    /// Producer monotonic clock, microseconds
    pub timestamp_us: u64,
    pub frame_type: FrameType,
}

/// Width, height and row stride in bytes.
///
/// For biplanar native streams `height` counts every row in the buffer: the
/// first two thirds are luma, the rest interleaved chroma.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

impl FrameSize {
    pub const fn luma_height(&self) -> u32 {
        2 * self.height / 3
    }

    /// Geometry handed to the consumer for `target`
    pub const fn delivered(&self, target: PixelFormat) -> FrameSize {
        if target.needs_conversion() {
            FrameSize {
                width: self.width,
                height: self.luma_height(),
                stride: 3 * self.width,
            }
        } else {
            *self
        }
    }

    pub const fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// Who gets a buffer back once the consumer is done with it
#[derive(Debug)]
pub enum BufferOwner {
    Producer(BufferHandle),
    Local(Arc<SharedRegion>),
}

/// One captured unit on loan from the producer or allocated by the converter
#[derive(Debug)]
pub struct FrameDescriptor {
    meta: FrameMeta,
    data: Bytes,
    owner: BufferOwner,
    fd: Option<RawFd>,
    offset: usize,
}

impl FrameDescriptor {
    pub(crate) fn producer(
        handle: BufferHandle,
        meta: FrameMeta,
        data: Bytes,
        fd: Option<RawFd>,
        offset: usize,
    ) -> Self {
        Self {
            meta,
            data,
            owner: BufferOwner::Producer(handle),
            fd,
            offset,
        }
    }

    pub(crate) fn local(meta: FrameMeta, region: SharedRegion) -> Self {
        let region = Arc::new(region);
        let fd = Some(region.raw_fd());
        Self {
            meta,
            data: SharedRegion::bytes(&region),
            owner: BufferOwner::Local(region),
            fd,
            offset: 0,
        }
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn owner(&self) -> &BufferOwner {
        &self.owner
    }

    /// Address of the first byte, used to key the loan table
    pub fn address(&self) -> usize {
        self.data.as_ptr() as usize
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        match &self.owner {
            BufferOwner::Local(region) => region.capacity(),
            BufferOwner::Producer(_) => self.data.len(),
        }
    }

    /// Hand the buffer back to whoever owns it
    pub fn release<S: FrameStream + ?Sized>(self, stream: &mut S) -> Result<(), SourceError> {
        match self.owner {
            BufferOwner::Producer(handle) => stream.release_buffer(handle),
            // Dropping the last reference unmaps and closes the memfd
            BufferOwner::Local(_) => Ok(()),
        }
    }

    pub(crate) fn image(&self, size: FrameSize, channels: u8) -> Image {
        Image {
            data: self.data.clone(),
            width: size.width,
            height: size.height,
            stride: size.stride as usize,
            channels,
            sequence: self.meta.sequence,
            timestamp_us: self.meta.timestamp_us,
        }
    }
}

/// Read-only image handed to the consumer.
///
/// Passing it back into the next retrieve lets the session recycle its buffer.
#[derive(Clone)]
pub struct Image {
    data: Bytes,
    width: u32,
    height: u32,
    stride: usize,
    channels: u8,
    sequence: u64,
    timestamp_us: u64,
}

impl Image {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn address(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// Pixels of row `y` without stride padding.
    ///
    /// `None` past the last row or when the producer mapped fewer bytes
    /// than the geometry needs.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride;
        let len = self.width as usize * self.channels as usize;
        self.data.get(start..start + len)
    }

    /// Copy into a tightly packed buffer, stopping at the first row the
    /// data does not cover
    pub fn to_packed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize * self.channels as usize);
        for row in (0..self.height).map_while(|y| self.row(y)) {
            out.extend_from_slice(row);
        }
        out
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("channels", &self.channels)
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_codes_round_trip_through_lookup() {
        for fmt in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_fourcc(fmt.fourcc()), Some(fmt));
        }
        assert_eq!(PixelFormat::from_fourcc(u32::from_le_bytes(*b"YUYV")), None);
        assert_eq!(PixelFormat::Nv12.to_string(), "NV12");
    }

    #[test]
    fn rgb_requests_nv12_from_producer() {
        assert_eq!(PixelFormat::Rgb3.native_subformat(), "NV12");
        assert_eq!(PixelFormat::Rgb3.channels(), 3);
        assert_eq!(PixelFormat::Y800.channels(), 1);
    }

    #[test]
    fn rgb_delivery_drops_chroma_rows() {
        let negotiated = FrameSize {
            width: 1920,
            height: 1080,
            stride: 2048,
        };
        let rgb = negotiated.delivered(PixelFormat::Rgb3);
        assert_eq!((rgb.width, rgb.height, rgb.stride), (1920, 720, 5760));
        assert_eq!(negotiated.delivered(PixelFormat::Y800), negotiated);
        assert_eq!(negotiated.delivered(PixelFormat::Nv12), negotiated);
    }

    #[test]
    fn packed_copy_strips_padding() {
        let data = Bytes::from_static(&[1, 2, 0, 0, 3, 4, 0, 0]);
        let image = Image {
            data,
            width: 2,
            height: 2,
            stride: 4,
            channels: 1,
            sequence: 0,
            timestamp_us: 0,
        };
        assert_eq!(image.row(1), Some(&[3, 4][..]));
        assert_eq!(image.to_packed(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn rows_outside_the_data_are_none() {
        let image = Image {
            data: Bytes::from_static(&[1, 2, 0, 0, 3]),
            width: 2,
            height: 2,
            stride: 4,
            channels: 1,
            sequence: 0,
            timestamp_us: 0,
        };
        assert_eq!(image.row(0), Some(&[1, 2][..]));
        assert_eq!(image.row(1), None);
        assert_eq!(image.row(2), None);
        assert_eq!(image.to_packed(), vec![1, 2]);
    }
}
