//! NV12 -> packed RGB conversion into locally owned shared memory

use std::time::Instant;

use tracing::{instrument, warn};

use crate::capture::frame::{FrameDescriptor, FrameMeta, FrameSize, FrameType, PixelFormat};
use crate::capture::source::FrameStream;
use crate::error::{CaptureError, Result};
use crate::pipeline::shm::SharedRegion;

// BT.601 limited range, 20-bit fixed point
const SHIFT: i32 = 20;
const HALF: i32 = 1 << (SHIFT - 1);
const CY: i32 = 1_220_542;
const CVR: i32 = 1_673_527;
const CVG: i32 = -852_492;
const CUG: i32 = -409_993;
const CUB: i32 = 2_116_026;

/// Converts frames of one negotiated NV12 geometry
#[derive(Debug, Clone, Copy)]
pub struct FormatConverter {
    source: FrameSize,
}

impl FormatConverter {
    pub fn new(source: FrameSize) -> Self {
        Self { source }
    }

    pub fn output_size(&self) -> FrameSize {
        self.source.delivered(PixelFormat::Rgb3)
    }

    /// Convert `frame` and hand the NV12 buffer back to the producer.
    ///
    /// Frames not tagged YUV are returned untouched. On success the returned
    /// descriptor owns a fresh sealed region carrying the source's sequence
    /// number and timestamp.
    #[instrument(skip_all, fields(sequence = frame.meta().sequence))]
    pub fn convert<S>(&self, frame: FrameDescriptor, stream: &mut S) -> Result<FrameDescriptor>
    where
        S: FrameStream + ?Sized,
    {
        if frame.meta().frame_type != FrameType::Yuv {
            return Ok(frame);
        }

        let started = Instant::now();
        let out = self.output_size();

        let region = match SharedRegion::allocate(out.byte_len(), |dst| {
            nv12_to_rgb(frame.data(), self.source, dst)
        }) {
            Ok(region) => region,
            Err(e) => {
                if let Err(release_err) = frame.release(stream) {
                    warn!("Failed to release NV12 source after error: {}", release_err);
                }
                return Err(e);
            }
        };

        let meta = FrameMeta {
            sequence: frame.meta().sequence,
            timestamp_us: frame.meta().timestamp_us,
            frame_type: FrameType::Rgb,
        };
        let converted = FrameDescriptor::local(meta, region);

        // The converted region is dropped on failure
        frame.release(stream).map_err(CaptureError::ConversionRelease)?;

        metrics::counter!("vdocap_frames_converted").increment(1);
        metrics::histogram!("vdocap_convert_time_us").record(started.elapsed().as_micros() as f64);

        Ok(converted)
    }
}

/// Convert one NV12 image with padded rows into tightly packed RGB.
///
/// `size.height` counts luma and chroma rows together.
pub fn nv12_to_rgb(src: &[u8], size: FrameSize, dst: &mut [u8]) -> Result<()> {
    let width = size.width as usize;
    let stride = size.stride as usize;
    let luma_rows = size.luma_height() as usize;
    let chroma_rows = size.height as usize - luma_rows;

    if width == 0 || luma_rows == 0 || width % 2 != 0 || luma_rows % 2 != 0 {
        return Err(CaptureError::Conversion(format!(
            "NV12 needs even, non-zero dimensions, got {}x{}",
            width, luma_rows
        )));
    }
    if stride < width || chroma_rows < luma_rows / 2 {
        return Err(CaptureError::Conversion(format!(
            "bad NV12 layout: stride {} width {} rows {}",
            stride, width, size.height
        )));
    }
    if src.len() < size.byte_len() {
        return Err(CaptureError::Conversion(format!(
            "NV12 buffer holds {} bytes, need {}",
            src.len(),
            size.byte_len()
        )));
    }
    if dst.len() < 3 * width * luma_rows {
        return Err(CaptureError::Conversion(format!(
            "RGB buffer holds {} bytes, need {}",
            dst.len(),
            3 * width * luma_rows
        )));
    }

    let (luma, chroma) = src.split_at(luma_rows * stride);

    for (y, out_row) in dst.chunks_exact_mut(3 * width).take(luma_rows).enumerate() {
        let y_row = &luma[y * stride..y * stride + width];
        let uv_row = &chroma[(y / 2) * stride..(y / 2) * stride + width];

        for (x, rgb) in out_row.chunks_exact_mut(3).enumerate() {
            let u = uv_row[x & !1] as i32 - 128;
            let v = uv_row[x | 1] as i32 - 128;
            let luma = (y_row[x] as i32 - 16).max(0) * CY;

            rgb[0] = clamp_u8((luma + HALF + CVR * v) >> SHIFT);
            rgb[1] = clamp_u8((luma + HALF + CVG * v + CUG * u) >> SHIFT);
            rgb[2] = clamp_u8((luma + HALF + CUB * u) >> SHIFT);
        }
    }

    Ok(())
}

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
