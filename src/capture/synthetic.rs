//! In-process producer emitting test-pattern frames into memfd buffers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::capture::clock::Clock;
use crate::capture::frame::{FrameMeta, FrameType};
use crate::capture::settings::{self, SettingsMap};
use crate::capture::source::{BufferHandle, FrameSource, FrameStream, ProducerBuffer, SourceError};
use crate::pipeline::shm::SharedRegion;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FRAMERATE: u32 = 30;
const DEFAULT_BUFFER_COUNT: u32 = 3;

/// Counters shared between a [`SyntheticSource`] and whoever inspects it
#[derive(Debug, Clone, Default)]
pub struct ProducerProbe {
    inner: Arc<ProbeInner>,
}

#[derive(Debug, Default)]
struct ProbeInner {
    pulled: AtomicU64,
    released: AtomicU64,
    outstanding: AtomicUsize,
    requested: Mutex<Option<SettingsMap>>,
}

impl ProducerProbe {
    pub fn pulled(&self) -> u64 {
        self.inner.pulled.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Buffers currently held outside the producer
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Settings the last stream was opened with
    pub fn requested(&self) -> Option<SettingsMap> {
        self.inner.requested.lock().ok().and_then(|guard| guard.clone())
    }
}

/// Producer used by the demo binary and the tests.
///
/// Frames are stamped with the injected clock. Biplanar streams fill the top
/// two thirds of each buffer with a luma ramp and the rest with neutral chroma.
#[derive(Debug, Clone)]
pub struct SyntheticSource<C> {
    clock: C,
    subformats: Vec<String>,
    pitch_align: u32,
    stale_backlog: u32,
    stale_age_us: u64,
    fail_release: bool,
    probe: ProducerProbe,
}

impl<C: Clock + Clone> SyntheticSource<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            subformats: vec!["Y800".into(), "NV12".into(), "NV21".into()],
            pitch_align: 1,
            stale_backlog: 0,
            stale_age_us: 0,
            fail_release: false,
            probe: ProducerProbe::default(),
        }
    }

    /// Subformats honoured; anything else is negotiated down to NV12
    pub fn with_subformats(mut self, subformats: &[&str]) -> Self {
        self.subformats = subformats.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Pad rows to a multiple of `align` bytes
    pub fn with_pitch_align(mut self, align: u32) -> Self {
        self.pitch_align = align.max(1);
        self
    }

    /// Stamp the first `frames` frames `age_us` in the past
    pub fn with_stale_backlog(mut self, frames: u32, age_us: u64) -> Self {
        self.stale_backlog = frames;
        self.stale_age_us = age_us;
        self
    }

    pub fn with_release_failure(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn probe(&self) -> ProducerProbe {
        self.probe.clone()
    }
}

impl<C: Clock + Clone> FrameSource for SyntheticSource<C> {
    type Stream = SyntheticStream<C>;

    fn open(&mut self, request: &SettingsMap) -> Result<Self::Stream, SourceError> {
        if let Ok(mut guard) = self.probe.inner.requested.lock() {
            *guard = Some(request.clone());
        }

        let width = request.get_u32(settings::WIDTH, DEFAULT_WIDTH);
        let height = request.get_u32(settings::HEIGHT, DEFAULT_HEIGHT);
        if width == 0 || height == 0 {
            return Err(SourceError::new(format!(
                "invalid resolution {}x{}",
                width, height
            )));
        }

        let requested = request.get_str(settings::SUBFORMAT, "NV12");
        let subformat = if self.subformats.iter().any(|s| s == requested) {
            requested.to_owned()
        } else {
            "NV12".to_owned()
        };

        let align = self
            .pitch_align
            .max(request.get_u32(settings::SIMD_ALIGN, 1))
            .max(1);
        let pitch = width.next_multiple_of(align);

        let mut negotiated = request.clone();
        negotiated.set_str(settings::SUBFORMAT, subformat.clone());
        negotiated.set_u32(
            settings::FRAMERATE,
            request.get_u32(settings::FRAMERATE, DEFAULT_FRAMERATE),
        );
        let buffer_count = request
            .get_u32(settings::BUFFER_COUNT, DEFAULT_BUFFER_COUNT)
            .max(1);
        negotiated.set_u32(settings::BUFFER_COUNT, buffer_count);

        let mut info = SettingsMap::new();
        info.set_u32(settings::WIDTH, width);
        info.set_u32(settings::HEIGHT, height);
        info.set_u32(settings::PITCH, pitch);

        info!(
            "Synthetic stream opened: {}x{} pitch {} {}",
            width, height, pitch, subformat
        );

        Ok(SyntheticStream {
            clock: self.clock.clone(),
            settings: negotiated,
            info,
            width,
            height,
            pitch,
            luma_only: subformat == "Y800",
            buffer_count: buffer_count as usize,
            started: false,
            sequence: 0,
            next_handle: 0,
            on_loan: HashMap::new(),
            stale_backlog: self.stale_backlog,
            stale_age_us: self.stale_age_us,
            fail_release: self.fail_release,
            probe: self.probe.clone(),
        })
    }
}

/// A stream opened on [`SyntheticSource`]
#[derive(Debug)]
pub struct SyntheticStream<C> {
    clock: C,
    settings: SettingsMap,
    info: SettingsMap,
    width: u32,
    height: u32,
    pitch: u32,
    luma_only: bool,
    buffer_count: usize,
    started: bool,
    sequence: u64,
    next_handle: u64,
    on_loan: HashMap<u64, Arc<SharedRegion>>,
    stale_backlog: u32,
    stale_age_us: u64,
    fail_release: bool,
    probe: ProducerProbe,
}

impl<C: Clock> SyntheticStream<C> {
    fn render(&self, buf: &mut [u8]) {
        let width = self.width as usize;
        let pitch = self.pitch as usize;
        let luma_rows = if self.luma_only {
            self.height as usize
        } else {
            2 * self.height as usize / 3
        };
        let phase = self.sequence as usize;

        for (y, row) in buf.chunks_exact_mut(pitch).enumerate() {
            let (pixels, padding) = row.split_at_mut(width);
            padding.fill(0);
            if y < luma_rows {
                for (x, px) in pixels.iter_mut().enumerate() {
                    *px = ((x + y + phase) & 0xff) as u8;
                }
            } else {
                pixels.fill(128);
            }
        }
    }
}

impl<C: Clock> FrameStream for SyntheticStream<C> {
    fn start(&mut self) -> Result<(), SourceError> {
        self.started = true;
        Ok(())
    }

    fn pull_buffer(&mut self) -> Result<ProducerBuffer, SourceError> {
        if !self.started {
            return Err(SourceError::new("stream not started"));
        }
        if self.on_loan.len() >= self.buffer_count {
            return Err(SourceError::new(format!(
                "no free buffers: {} of {} on loan",
                self.on_loan.len(),
                self.buffer_count
            )));
        }

        let mut timestamp_us = self
            .clock
            .now_us()
            .map_err(|e| SourceError::new(e.to_string()))?;
        if self.stale_backlog > 0 {
            self.stale_backlog -= 1;
            timestamp_us = timestamp_us.saturating_sub(self.stale_age_us);
        }

        self.sequence += 1;
        let len = self.pitch as usize * self.height as usize;
        let region = SharedRegion::allocate(len, |buf| {
            self.render(buf);
            Ok(())
        })
        .map_err(|e| SourceError::new(e.to_string()))?;
        let region = Arc::new(region);

        let handle = BufferHandle(self.next_handle);
        self.next_handle += 1;

        let buffer = ProducerBuffer {
            handle,
            frame: Some(FrameMeta {
                sequence: self.sequence,
                timestamp_us,
                frame_type: FrameType::Yuv,
            }),
            data: Some(SharedRegion::bytes(&region)),
            fd: Some(region.raw_fd()),
            offset: 0,
        };
        self.on_loan.insert(handle.0, region);

        self.probe.inner.pulled.fetch_add(1, Ordering::SeqCst);
        self.probe
            .inner
            .outstanding
            .store(self.on_loan.len(), Ordering::SeqCst);
        debug!(sequence = self.sequence, %handle, "synthetic frame");

        Ok(buffer)
    }

    fn release_buffer(&mut self, handle: BufferHandle) -> Result<(), SourceError> {
        if self.fail_release {
            return Err(SourceError::new(format!("refusing to take back {}", handle)));
        }
        self.on_loan
            .remove(&handle.0)
            .ok_or_else(|| SourceError::new(format!("unknown {}", handle)))?;

        self.probe.inner.released.fetch_add(1, Ordering::SeqCst);
        self.probe
            .inner
            .outstanding
            .store(self.on_loan.len(), Ordering::SeqCst);
        Ok(())
    }

    fn settings(&self) -> Option<SettingsMap> {
        Some(self.settings.clone())
    }

    fn info(&self) -> Option<SettingsMap> {
        Some(self.info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::clock::ManualClock;

    fn request(subformat: &str) -> SettingsMap {
        let mut map = SettingsMap::new();
        map.set_u32(settings::WIDTH, 6);
        map.set_u32(settings::HEIGHT, 6);
        map.set_u32(settings::BUFFER_COUNT, 2);
        map.set_str(settings::SUBFORMAT, subformat);
        map
    }

    #[test]
    fn pitch_is_aligned_and_reported() {
        let mut source = SyntheticSource::new(ManualClock::new(0)).with_pitch_align(16);
        let stream = source.open(&request("NV12")).unwrap();
        let info = stream.info().unwrap();
        assert_eq!(info.get_u32(settings::PITCH, 0), 16);
        assert_eq!(info.get_u32(settings::HEIGHT, 0), 6);
    }

    #[test]
    fn unsupported_subformat_falls_back_to_nv12() {
        let mut source = SyntheticSource::new(ManualClock::new(0)).with_subformats(&["NV12"]);
        let stream = source.open(&request("Y800")).unwrap();
        assert_eq!(
            stream.settings().unwrap().get_str(settings::SUBFORMAT, "None"),
            "NV12"
        );
    }

    #[test]
    fn buffer_count_limits_outstanding_buffers() {
        let clock = ManualClock::new(1_000);
        let mut source = SyntheticSource::new(clock);
        let probe = source.probe();
        let mut stream = source.open(&request("Y800")).unwrap();
        stream.start().unwrap();

        let a = stream.pull_buffer().unwrap();
        let _b = stream.pull_buffer().unwrap();
        assert!(stream.pull_buffer().is_err());
        assert_eq!(probe.outstanding(), 2);

        stream.release_buffer(a.handle).unwrap();
        assert!(stream.pull_buffer().is_ok());
        assert!(stream.release_buffer(BufferHandle(99)).is_err());
    }

    #[test]
    fn backlog_frames_are_back_dated() {
        let clock = ManualClock::new(1_000_000);
        let mut source = SyntheticSource::new(clock).with_stale_backlog(1, 200_000);
        let mut stream = source.open(&request("NV12")).unwrap();
        stream.start().unwrap();

        let first = stream.pull_buffer().unwrap().frame.unwrap();
        let second = stream.pull_buffer().unwrap().frame.unwrap();
        assert_eq!(first.timestamp_us, 800_000);
        assert_eq!(second.timestamp_us, 1_000_000);
        assert_eq!(second.sequence, first.sequence + 1);
    }

    #[test]
    fn pull_before_start_fails() {
        let mut source = SyntheticSource::new(ManualClock::new(0));
        let mut stream = source.open(&request("NV12")).unwrap();
        assert!(stream.pull_buffer().is_err());
    }
}
