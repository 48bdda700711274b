pub mod convert;
pub mod registry;
pub mod shm;
pub mod staleness;

pub use convert::FormatConverter;
pub use registry::BufferRegistry;
pub use shm::SharedRegion;
pub use staleness::{StalenessFilter, STALE_THRESHOLD_US};
