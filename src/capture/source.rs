//! Interface to the streaming backend that owns the buffers

use std::fmt;
use std::os::fd::RawFd;

use bytes::Bytes;
use thiserror::Error;

use crate::capture::frame::FrameMeta;
use crate::capture::settings::SettingsMap;

/// Opaque producer-side buffer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Failure reported by the producer; the message is kept verbatim
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SourceError {
    message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A buffer as pulled from the producer.
///
/// Frame metadata or a readable mapping may be missing if the producer
/// misbehaves; the staleness filter rejects such buffers.
#[derive(Debug)]
pub struct ProducerBuffer {
    pub handle: BufferHandle,
    pub frame: Option<FrameMeta>,
    pub data: Option<Bytes>,
    pub fd: Option<RawFd>,
    pub offset: usize,
}

/// Opens streams on the producer
pub trait FrameSource {
    type Stream: FrameStream;

    fn open(&mut self, settings: &SettingsMap) -> Result<Self::Stream, SourceError>;
}

/// A negotiated stream
pub trait FrameStream {
    fn start(&mut self) -> Result<(), SourceError>;

    /// Block until the producer has a buffer
    fn pull_buffer(&mut self) -> Result<ProducerBuffer, SourceError>;

    /// Give a buffer back so the producer can reuse it
    fn release_buffer(&mut self, handle: BufferHandle) -> Result<(), SourceError>;

    /// The request merged with the producer's defaults
    fn settings(&self) -> Option<SettingsMap>;

    /// Results of the request, such as `pitch`
    fn info(&self) -> Option<SettingsMap>;
}
