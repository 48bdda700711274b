pub mod clock;
pub mod controls;
pub mod frame;
pub mod settings;
pub mod source;
pub mod synthetic;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use controls::{CaptureOption, DeviceControls, NoDeviceControls};
pub use frame::{FrameDescriptor, FrameMeta, FrameType, Image, PixelFormat};
pub use settings::SettingsMap;
pub use synthetic::SyntheticSource;
