//! Error types for the capture pipeline

use std::io;

use thiserror::Error;

use crate::capture::source::SourceError;

/// Result type alias using [`CaptureError`]
pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

/// Pipeline stage an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    Clock,
    Allocation,
    Negotiation,
    Producer,
    MissingData,
    Conversion,
    Staleness,
    Session,
}

/// Every fatal condition an acquisition or retrieval can hit.
///
/// Messages are prefixed with the failing stage so they stay readable once
/// flattened into a log line.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("clock: reading CLOCK_MONOTONIC failed")]
    Clock(#[source] nix::errno::Errno),

    #[error("allocation: {what}")]
    Allocation {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("negotiation: unsupported pixel format {0}")]
    UnsupportedFormat(String),

    #[error("negotiation: requested subformat {requested} but producer negotiated {negotiated}")]
    FormatMismatch {
        requested: &'static str,
        negotiated: String,
    },

    #[error("negotiation: invalid row stride {stride} for width {width}")]
    InvalidStride { width: u32, stride: u32 },

    #[error("producer: {0}")]
    Producer(#[from] SourceError),

    #[error("missing data: pulled buffer carries no frame")]
    NoFrame,

    #[error("missing data: pulled buffer has no readable data")]
    NoData,

    #[error("conversion: {0}")]
    Conversion(String),

    #[error("conversion: releasing the NV12 source failed: {0}")]
    ConversionRelease(#[source] SourceError),

    #[error("staleness: gave up after discarding {0} stale frames")]
    StaleLimit(u32),

    #[error("session: retrieve called without a preceding acquire")]
    NotAcquired,

    #[error("session: closed")]
    Closed,
}

impl CaptureError {
    pub(crate) fn allocation(what: &'static str) -> Self {
        Self::Allocation {
            what,
            source: io::Error::last_os_error(),
        }
    }

    /// Stage that produced this error
    pub fn stage(&self) -> ErrorStage {
        match self {
            Self::Clock(_) => ErrorStage::Clock,
            Self::Allocation { .. } => ErrorStage::Allocation,
            Self::UnsupportedFormat(_) | Self::FormatMismatch { .. } | Self::InvalidStride { .. } => {
                ErrorStage::Negotiation
            }
            Self::Producer(_) => ErrorStage::Producer,
            Self::NoFrame | Self::NoData => ErrorStage::MissingData,
            Self::Conversion(_) | Self::ConversionRelease(_) => ErrorStage::Conversion,
            Self::StaleLimit(_) => ErrorStage::Staleness,
            Self::NotAcquired | Self::Closed => ErrorStage::Session,
        }
    }
}

/// Failure loading [`crate::Config`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration")]
    Load(#[from] config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_message_is_propagated_verbatim() {
        let err = CaptureError::from(SourceError::new("stream went away"));
        assert_eq!(err.to_string(), "producer: stream went away");
        assert_eq!(err.stage(), ErrorStage::Producer);
    }

    #[test]
    fn negotiation_errors_share_a_stage() {
        let mismatch = CaptureError::FormatMismatch {
            requested: "NV12",
            negotiated: "Y800".into(),
        };
        let stride = CaptureError::InvalidStride {
            width: 640,
            stride: 0,
        };
        assert_eq!(mismatch.stage(), ErrorStage::Negotiation);
        assert_eq!(stride.stage(), ErrorStage::Negotiation);
        assert!(mismatch.to_string().contains("Y800"));
    }
}
