//! Consumer-facing options and the device control collaborator

/// Every option `configure`/`query` understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureOption {
    FrameWidth,
    FrameHeight,
    Fps,
    Channel,
    Fourcc,
    /// Element type of delivered images; read-only
    Format,
    BufferCount,
    CropX,
    CropY,
    CropWidth,
    CropHeight,
    SimdAlign,
    PosMsec,
    PosFrames,
    BufferFd,
    BufferFdOffset,
    BufferCapacity,
    Tonemapping,
    TemporalFilter,
    ExposureMode,
    MaxGainDb,
    MaxExposureUs,
    Rotation,
    Gain,
    Exposure,
    OpticsType,
    FNumber,
    Focus,
    Zoom,
    /// Anything else; setting it is accepted and ignored
    Other(u32),
}

impl CaptureOption {
    /// Options forwarded to [`DeviceControls::set`]
    pub fn is_device_settable(self) -> bool {
        matches!(
            self,
            Self::Tonemapping
                | Self::TemporalFilter
                | Self::ExposureMode
                | Self::MaxGainDb
                | Self::MaxExposureUs
                | Self::Rotation
        )
    }

    /// Options answered by [`DeviceControls::get`]
    pub fn is_device_readable(self) -> bool {
        matches!(
            self,
            Self::Gain
                | Self::Exposure
                | Self::OpticsType
                | Self::FNumber
                | Self::Tonemapping
                | Self::TemporalFilter
                | Self::Focus
                | Self::Zoom
        )
    }
}

/// Optics and exposure controls living outside the stream
pub trait DeviceControls {
    fn set(&mut self, option: CaptureOption, value: f64) -> bool;

    /// `grabbed_at_us` is the request time of the current acquisition
    fn get(&self, option: CaptureOption, grabbed_at_us: u64) -> Option<f64>;
}

/// For hardware without extra controls
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDeviceControls;

impl DeviceControls for NoDeviceControls {
    fn set(&mut self, _option: CaptureOption, _value: f64) -> bool {
        false
    }

    fn get(&self, _option: CaptureOption, _grabbed_at_us: u64) -> Option<f64> {
        None
    }
}
