//! Pull-based capture session: negotiate, filter, convert, publish

use std::os::fd::RawFd;

use tracing::{debug, info, instrument, warn};

use crate::capture::clock::{Clock, MonotonicClock};
use crate::capture::controls::{CaptureOption, DeviceControls, NoDeviceControls};
use crate::capture::frame::{FrameDescriptor, FrameSize, FrameType, Image, PixelFormat};
use crate::capture::settings::{self, SettingsMap};
use crate::capture::source::{FrameSource, FrameStream};
use crate::error::{CaptureError, Result};
use crate::pipeline::convert::FormatConverter;
use crate::pipeline::registry::{BufferRegistry, Recycled};
use crate::pipeline::staleness::StalenessFilter;
use crate::{CaptureConfig, Metrics};

/// Identifies this backend among capture implementations
pub const CAPTURE_DOMAIN: u32 = 9100;

/// Frame rate RGB conversion is throttled to on large streams
pub const RGB_FPS_CAP: u32 = 15;
/// Pixel count above which the RGB throttle applies
pub const RGB_FPS_CAP_PIXELS: u64 = 1920 * 1080;

const DEFAULT_FRAMERATE: u32 = 30;
const DEFAULT_MAX_BUFFERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing negotiated yet; the first acquire opens the stream
    Uninitialized,
    Streaming,
    Closed,
}

/// Buffer details of the last retrieved frame
#[derive(Debug, Clone, Copy)]
struct CurrentFrame {
    sequence: u64,
    timestamp_us: u64,
    fd: Option<RawFd>,
    offset: usize,
    capacity: usize,
}

/// Capture session over a [`FrameSource`].
///
/// Each frame costs one [`acquire`](Self::acquire), which stamps the request
/// time, and one [`retrieve`](Self::retrieve), which delivers the first frame
/// no older than the staleness threshold. Images passed back into `retrieve`
/// free their buffer for reuse; otherwise the oldest loan is given back once
/// the buffer budget is used up.
pub struct CaptureSession<S: FrameSource> {
    source: S,
    stream: Option<S::Stream>,
    state: SessionState,
    settings: SettingsMap,
    fourcc: u32,
    max_buffers: usize,
    target: PixelFormat,
    capture_size: FrameSize,
    converter: Option<FormatConverter>,
    filter: StalenessFilter,
    registry: BufferRegistry,
    grabbed_us: Option<u64>,
    current: Option<CurrentFrame>,
    clock: Box<dyn Clock>,
    controls: Box<dyn DeviceControls>,
    metrics: Metrics,
}

impl<S: FrameSource> CaptureSession<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            stream: None,
            state: SessionState::Uninitialized,
            settings: SettingsMap::new(),
            fourcc: PixelFormat::Nv12.fourcc(),
            max_buffers: DEFAULT_MAX_BUFFERS,
            target: PixelFormat::Nv12,
            capture_size: FrameSize::default(),
            converter: None,
            filter: StalenessFilter::default(),
            registry: BufferRegistry::new(),
            grabbed_us: None,
            current: None,
            clock: Box::new(MonotonicClock),
            controls: Box::new(NoDeviceControls),
            metrics: Metrics::default(),
        }
    }

    /// Session with every option of `config` applied
    pub fn from_config(source: S, config: &CaptureConfig) -> Self {
        let mut session = Self::new(source).with_stale_limit(config.max_stale_drops);

        session.configure(CaptureOption::Channel, f64::from(config.channel));
        session.configure(CaptureOption::FrameWidth, f64::from(config.width));
        session.configure(CaptureOption::FrameHeight, f64::from(config.height));
        session.configure(CaptureOption::Fps, f64::from(config.fps));
        session.configure(CaptureOption::BufferCount, f64::from(config.buffer_count));
        session.set_format(config.format);

        if let Some(crop) = config.crop {
            session.configure(CaptureOption::CropX, f64::from(crop.x));
            session.configure(CaptureOption::CropY, f64::from(crop.y));
            session.configure(CaptureOption::CropWidth, f64::from(crop.width));
            session.configure(CaptureOption::CropHeight, f64::from(crop.height));
        }
        if let Some(align) = config.simd_align {
            session.configure(CaptureOption::SimdAlign, f64::from(align));
        }

        session
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_controls(mut self, controls: impl DeviceControls + 'static) -> Self {
        self.controls = Box::new(controls);
        self
    }

    /// Give up after discarding more than `limit` stale frames in one retrieve
    pub fn with_stale_limit(mut self, limit: Option<u32>) -> Self {
        self.filter = StalenessFilter::new(limit);
        self
    }

    /// Set an option.
    ///
    /// Geometry and format changes after the stream is up only affect the
    /// settings map; the negotiated stream keeps its size. Unknown options are
    /// accepted and ignored.
    pub fn configure(&mut self, option: CaptureOption, value: f64) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }

        // Saturating float -> int, negative values become 0
        let val = value.round() as u32;

        match option {
            CaptureOption::CropX => self.settings.set_u32(settings::CROP_X, val),
            CaptureOption::CropY => self.settings.set_u32(settings::CROP_Y, val),
            CaptureOption::CropWidth => self.settings.set_u32(settings::CROP_WIDTH, val),
            CaptureOption::CropHeight => self.settings.set_u32(settings::CROP_HEIGHT, val),
            CaptureOption::SimdAlign => self.settings.set_u32(settings::SIMD_ALIGN, val),
            CaptureOption::FrameWidth => self.settings.set_u32(settings::WIDTH, val),
            CaptureOption::FrameHeight => self.settings.set_u32(settings::HEIGHT, val),
            CaptureOption::Channel => self.settings.set_u32(settings::CHANNEL, val),
            CaptureOption::Fps => self.settings.set_u32(settings::FRAMERATE, val),
            CaptureOption::BufferCount => {
                self.max_buffers = val as usize;
                self.settings.set_u32(settings::BUFFER_COUNT, val);
            }
            CaptureOption::Fourcc => self.fourcc = val,
            device if device.is_device_settable() => return self.controls.set(device, value),
            _ => {}
        }

        true
    }

    pub fn set_format(&mut self, format: PixelFormat) -> bool {
        self.configure(CaptureOption::Fourcc, f64::from(format.fourcc()))
    }

    /// Read an option, `None` when it has no value right now
    pub fn query(&self, option: CaptureOption) -> Option<f64> {
        if self.state == SessionState::Closed {
            return None;
        }

        let setting = |key: &str, default: u32| Some(f64::from(self.settings.get_u32(key, default)));

        match option {
            CaptureOption::FrameWidth => setting(settings::WIDTH, 0),
            CaptureOption::FrameHeight => setting(settings::HEIGHT, 0),
            CaptureOption::Fps => setting(settings::FRAMERATE, 0),
            CaptureOption::CropX => setting(settings::CROP_X, 0),
            CaptureOption::CropY => setting(settings::CROP_Y, 0),
            CaptureOption::CropWidth => setting(settings::CROP_WIDTH, 0),
            CaptureOption::CropHeight => setting(settings::CROP_HEIGHT, 0),
            CaptureOption::SimdAlign => setting(settings::SIMD_ALIGN, 1),
            CaptureOption::Channel => setting(settings::CHANNEL, 0),
            CaptureOption::BufferCount => setting(settings::BUFFER_COUNT, self.max_buffers as u32),
            CaptureOption::Fourcc => Some(f64::from(self.fourcc)),
            CaptureOption::Format => {
                let channels = match self.state {
                    SessionState::Streaming => self.target.channels(),
                    _ if self.fourcc == PixelFormat::Rgb3.fourcc() => 3,
                    _ => 1,
                };
                Some(f64::from(channels))
            }
            device if device.is_device_readable() => {
                self.controls.get(device, self.grabbed_us.unwrap_or_default())
            }
            CaptureOption::PosMsec => self.current.map(|c| c.timestamp_us as f64 / 1000.0),
            CaptureOption::PosFrames => self.current.map(|c| c.sequence as f64),
            CaptureOption::BufferFd => self.current.and_then(|c| c.fd).map(f64::from),
            CaptureOption::BufferFdOffset => self.current.map(|c| c.offset as f64),
            CaptureOption::BufferCapacity => self.current.map(|c| c.capacity as f64),
            _ => None,
        }
    }

    /// Stamp the request time for the next [`retrieve`](Self::retrieve),
    /// opening the stream first if needed.
    #[instrument(skip(self))]
    pub fn acquire(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => return Err(CaptureError::Closed),
            SessionState::Uninitialized => self.negotiate()?,
            SessionState::Streaming => {}
        }

        self.current = None;
        self.grabbed_us = None;
        let now = self.clock.now_us()?;
        self.grabbed_us = Some(now);
        Ok(())
    }

    /// Deliver a fresh frame into `dst`.
    ///
    /// An image already in `dst` is treated as returned by the consumer and
    /// its buffer recycled.
    #[instrument(skip(self, dst))]
    pub fn retrieve(&mut self, dst: &mut Option<Image>) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(CaptureError::Closed);
        }
        let requested_us = self.grabbed_us.take().ok_or(CaptureError::NotAcquired)?;
        let stream = self.stream.as_mut().ok_or(CaptureError::NotAcquired)?;

        let returned = dst.take().map(|image| image.address());
        let budget = self.max_buffers.max(1);

        let mut recycled = Vec::new();
        recycled.extend(self.registry.recycle(returned, budget));
        while self.registry.len() >= budget {
            match self.registry.evict_oldest() {
                Some(descriptor) => recycled.push(Recycled::Evicted(descriptor)),
                None => break,
            }
        }
        give_back(stream, recycled, &mut self.metrics)?;

        let fresh = self.filter.pull_fresh(stream, requested_us)?;
        self.metrics.dropped_frames += u64::from(fresh.dropped);
        if fresh.dropped > 0 {
            debug!(dropped = fresh.dropped, "skipped stale backlog");
        }

        let mut descriptor = fresh.descriptor;
        if let Some(converter) = &self.converter {
            let was_yuv = descriptor.meta().frame_type == FrameType::Yuv;
            descriptor = converter.convert(descriptor, stream)?;
            if was_yuv {
                self.metrics.converted_frames += 1;
            }
        }

        let size = self.capture_size.delivered(self.target);
        let image = descriptor.image(size, self.target.channels());
        self.current = Some(CurrentFrame {
            sequence: descriptor.meta().sequence,
            timestamp_us: descriptor.meta().timestamp_us,
            fd: descriptor.fd(),
            offset: descriptor.offset(),
            capacity: descriptor.capacity(),
        });

        let address = descriptor.address();
        if let Some(displaced) = self.registry.publish(address, descriptor) {
            warn!("Address {:#x} was still on loan", address);
            displaced.release(stream)?;
        }
        self.metrics.delivered_frames += 1;
        debug!(
            sequence = image.sequence(),
            loans = self.registry.len(),
            "published {}x{}x{}",
            image.width(),
            image.height(),
            image.channels()
        );

        *dst = Some(image);
        Ok(())
    }

    /// [`acquire`](Self::acquire) followed by [`retrieve`](Self::retrieve)
    pub fn read(&mut self, dst: &mut Option<Image>) -> Result<()> {
        self.acquire()?;
        self.retrieve(dst)
    }

    pub fn is_ready(&self) -> bool {
        self.state != SessionState::Closed
    }

    pub fn capture_domain(&self) -> u32 {
        CAPTURE_DOMAIN
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Buffers currently on loan to the consumer
    pub fn loans(&self) -> usize {
        self.registry.len()
    }

    /// Geometry reported by the producer, once streaming
    pub fn negotiated_size(&self) -> Option<FrameSize> {
        (self.state == SessionState::Streaming).then_some(self.capture_size)
    }

    /// Geometry of delivered images, once streaming
    pub fn delivered_size(&self) -> Option<FrameSize> {
        self.negotiated_size().map(|size| size.delivered(self.target))
    }

    /// Return every loan to its owner and stop.
    ///
    /// Images the consumer still holds stay readable.
    pub fn close(&mut self) -> Result<()> {
        let mut first_err = None;

        if let Some(mut stream) = self.stream.take() {
            for descriptor in self.registry.drain() {
                if let Err(e) = descriptor.release(&mut stream) {
                    first_err.get_or_insert(e);
                }
            }
        }
        self.registry.drain().for_each(drop);

        if self.state != SessionState::Closed {
            info!("Capture session closed after {} frames", self.metrics.delivered_frames);
        }
        self.state = SessionState::Closed;
        self.current = None;
        self.grabbed_us = None;

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    #[instrument(skip(self))]
    fn negotiate(&mut self) -> Result<()> {
        let target = PixelFormat::from_fourcc(self.fourcc)
            .ok_or_else(|| CaptureError::UnsupportedFormat(fourcc_name(self.fourcc)))?;

        self.settings
            .set_str(settings::SUBFORMAT, target.native_subformat());

        if target.needs_conversion() {
            let pixels = u64::from(self.settings.get_u32(settings::WIDTH, 0))
                * u64::from(self.settings.get_u32(settings::HEIGHT, 0));
            let fps = self.settings.get_u32(settings::FRAMERATE, DEFAULT_FRAMERATE);
            if pixels > RGB_FPS_CAP_PIXELS && fps > RGB_FPS_CAP {
                info!("Capping {} fps to {} for RGB conversion", fps, RGB_FPS_CAP);
                self.settings.set_u32(settings::FRAMERATE, RGB_FPS_CAP);
            }
        }

        self.settings.set_u32(settings::FORMAT, settings::FORMAT_YUV);
        self.settings
            .set_u32(settings::BUFFER_STRATEGY, settings::BUFFER_STRATEGY_INFINITE);
        self.settings
            .set_u32(settings::TIMESTAMP_TYPE, settings::TIMESTAMP_MONO_SERVER);

        let mut stream = self.source.open(&self.settings)?;

        // Request plus producer defaults, then the results such as pitch
        if let Some(merged) = stream.settings() {
            self.settings.merge(&merged);
        }
        if let Some(info) = stream.info() {
            self.settings.merge(&info);
        }

        self.max_buffers = self
            .settings
            .get_u32(settings::BUFFER_COUNT, self.max_buffers as u32) as usize;

        let negotiated = self.settings.get_str(settings::SUBFORMAT, "None");
        if negotiated != target.native_subformat() {
            let negotiated = negotiated.to_owned();
            self.state = SessionState::Closed;
            return Err(CaptureError::FormatMismatch {
                requested: target.native_subformat(),
                negotiated,
            });
        }

        let width = self.settings.get_u32(settings::WIDTH, 0);
        let size = FrameSize {
            width,
            height: self.settings.get_u32(settings::HEIGHT, 0),
            stride: self.settings.get_u32(settings::PITCH, width),
        };
        if size.stride == 0 || size.stride < size.width {
            return Err(CaptureError::InvalidStride {
                width: size.width,
                stride: size.stride,
            });
        }

        stream.start()?;

        info!(
            "Streaming {} as {}: {}x{} stride {}, {} buffers",
            target, negotiated, size.width, size.height, size.stride, self.max_buffers
        );

        self.target = target;
        self.capture_size = size;
        self.converter = target
            .needs_conversion()
            .then(|| FormatConverter::new(size));
        self.stream = Some(stream);
        self.state = SessionState::Streaming;
        Ok(())
    }
}

impl<S: FrameSource> Drop for CaptureSession<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to return buffers on drop: {}", e);
        }
    }
}

/// Release recycled loans, reporting the first failure after trying them all
fn give_back<T>(stream: &mut T, recycled: Vec<Recycled>, metrics: &mut Metrics) -> Result<()>
where
    T: FrameStream + ?Sized,
{
    let mut first_err = None;

    for entry in recycled {
        let descriptor: FrameDescriptor = match entry {
            Recycled::Returned(descriptor) => {
                metrics.reclaimed_buffers += 1;
                metrics::counter!("vdocap_buffers_reclaimed").increment(1);
                descriptor
            }
            Recycled::Evicted(descriptor) => {
                metrics.evicted_buffers += 1;
                metrics::counter!("vdocap_buffers_evicted").increment(1);
                debug!(sequence = descriptor.meta().sequence, "evicting oldest loan");
                descriptor
            }
        };
        if let Err(e) = descriptor.release(stream) {
            first_err.get_or_insert(e);
        }
    }

    match first_err {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn fourcc_name(code: u32) -> String {
    String::from_utf8_lossy(&code.to_le_bytes()).into_owned()
}
