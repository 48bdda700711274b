//! Drops backlog so delivered frames are never older than the latency budget

use tracing::warn;

use crate::capture::frame::FrameDescriptor;
use crate::capture::source::{BufferHandle, FrameStream};
use crate::error::{CaptureError, Result};

/// Oldest acceptable frame, relative to the acquisition request
pub const STALE_THRESHOLD_US: u64 = 66_666;

/// Inclusive: a frame exactly `STALE_THRESHOLD_US` old is still fresh
pub fn is_fresh(frame_us: u64, requested_us: u64) -> bool {
    frame_us.saturating_add(STALE_THRESHOLD_US) >= requested_us
}

/// First fresh frame plus how many stale ones were thrown away to get it
#[derive(Debug)]
pub struct FreshFrame {
    pub descriptor: FrameDescriptor,
    pub dropped: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StalenessFilter {
    max_drops: Option<u32>,
}

impl StalenessFilter {
    /// `None` keeps pulling for as long as the producer hands out stale frames
    pub fn new(max_drops: Option<u32>) -> Self {
        Self { max_drops }
    }

    /// Pull until a frame no older than the threshold arrives.
    ///
    /// Stale frames go straight back to the producer.
    pub fn pull_fresh<S>(&self, stream: &mut S, requested_us: u64) -> Result<FreshFrame>
    where
        S: FrameStream + ?Sized,
    {
        let mut dropped = 0u32;

        loop {
            let buffer = stream.pull_buffer()?;

            let Some(meta) = buffer.frame else {
                release_rejected(stream, buffer.handle);
                return Err(CaptureError::NoFrame);
            };

            if !is_fresh(meta.timestamp_us, requested_us) {
                stream.release_buffer(buffer.handle)?;
                dropped += 1;
                metrics::counter!("vdocap_frames_dropped_stale").increment(1);
                warn!(
                    sequence = meta.sequence,
                    age_us = requested_us - meta.timestamp_us,
                    "dropping stale frame"
                );

                if self.max_drops.is_some_and(|limit| dropped > limit) {
                    return Err(CaptureError::StaleLimit(dropped));
                }
                continue;
            }

            let Some(data) = buffer.data else {
                release_rejected(stream, buffer.handle);
                return Err(CaptureError::NoData);
            };

            let descriptor =
                FrameDescriptor::producer(buffer.handle, meta, data, buffer.fd, buffer.offset);
            return Ok(FreshFrame {
                descriptor,
                dropped,
            });
        }
    }
}

fn release_rejected<S: FrameStream + ?Sized>(stream: &mut S, handle: BufferHandle) {
    if let Err(e) = stream.release_buffer(handle) {
        warn!("Failed to release rejected {}: {}", handle, e);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::Bytes;

    use super::*;
    use crate::capture::frame::{FrameMeta, FrameType};
    use crate::capture::settings::SettingsMap;
    use crate::capture::source::{ProducerBuffer, SourceError};

    /// Replays canned buffers and records releases
    #[derive(Default)]
    struct Replay {
        queue: VecDeque<ProducerBuffer>,
        released: Vec<BufferHandle>,
    }

    impl Replay {
        fn frame(mut self, id: u64, timestamp_us: u64) -> Self {
            self.queue.push_back(ProducerBuffer {
                handle: BufferHandle(id),
                frame: Some(FrameMeta {
                    sequence: id,
                    timestamp_us,
                    frame_type: FrameType::Yuv,
                }),
                data: Some(Bytes::from(vec![0u8; 16])),
                fd: None,
                offset: 0,
            });
            self
        }

        fn raw(mut self, buffer: ProducerBuffer) -> Self {
            self.queue.push_back(buffer);
            self
        }
    }

    impl FrameStream for Replay {
        fn start(&mut self) -> Result<(), SourceError> {
            Ok(())
        }

        fn pull_buffer(&mut self) -> Result<ProducerBuffer, SourceError> {
            self.queue
                .pop_front()
                .ok_or_else(|| SourceError::new("end of replay"))
        }

        fn release_buffer(&mut self, handle: BufferHandle) -> Result<(), SourceError> {
            self.released.push(handle);
            Ok(())
        }

        fn settings(&self) -> Option<SettingsMap> {
            None
        }

        fn info(&self) -> Option<SettingsMap> {
            None
        }
    }

    const T0: u64 = 10_000_000;

    #[test]
    fn threshold_boundary_is_inclusive() {
        assert!(!is_fresh(T0 - STALE_THRESHOLD_US - 1, T0));
        assert!(is_fresh(T0 - STALE_THRESHOLD_US, T0));
        assert!(is_fresh(T0 - STALE_THRESHOLD_US + 1, T0));
        // Frames stamped after the request are fresh
        assert!(is_fresh(T0 + 5, T0));
    }

    #[test]
    fn stale_frames_are_released_until_a_fresh_one_arrives() {
        let mut stream = Replay::default()
            .frame(1, T0 - STALE_THRESHOLD_US - 1)
            .frame(2, T0 - 500_000)
            .frame(3, T0 - STALE_THRESHOLD_US + 1)
            .frame(4, T0);

        let fresh = StalenessFilter::default().pull_fresh(&mut stream, T0).unwrap();
        assert_eq!(fresh.descriptor.meta().sequence, 3);
        assert_eq!(fresh.dropped, 2);
        assert_eq!(stream.released, vec![BufferHandle(1), BufferHandle(2)]);
        assert_eq!(stream.queue.len(), 1);
    }

    /// Records the level of every event
    #[derive(Clone, Default)]
    struct Levels(std::sync::Arc<std::sync::Mutex<Vec<tracing::Level>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Levels {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.0.lock().unwrap().push(*event.metadata().level());
        }
    }

    #[test]
    fn stale_drops_are_warnings() {
        use tracing_subscriber::layer::SubscriberExt;

        let levels = Levels::default();
        let subscriber = tracing_subscriber::registry().with(levels.clone());
        let mut stream = Replay::default().frame(1, 0).frame(2, T0);

        tracing::subscriber::with_default(subscriber, || {
            StalenessFilter::default().pull_fresh(&mut stream, T0).unwrap();
        });

        assert_eq!(*levels.0.lock().unwrap(), vec![tracing::Level::WARN]);
    }

    #[test]
    fn missing_frame_is_fatal_and_returns_the_buffer() {
        let mut stream = Replay::default().raw(ProducerBuffer {
            handle: BufferHandle(9),
            frame: None,
            data: Some(Bytes::from_static(b"x")),
            fd: None,
            offset: 0,
        });

        let err = StalenessFilter::default().pull_fresh(&mut stream, T0).unwrap_err();
        assert!(matches!(err, CaptureError::NoFrame));
        assert_eq!(stream.released, vec![BufferHandle(9)]);
    }

    #[test]
    fn missing_data_is_fatal() {
        let mut stream = Replay::default().raw(ProducerBuffer {
            handle: BufferHandle(4),
            frame: Some(FrameMeta {
                sequence: 4,
                timestamp_us: T0,
                frame_type: FrameType::Yuv,
            }),
            data: None,
            fd: None,
            offset: 0,
        });

        let err = StalenessFilter::default().pull_fresh(&mut stream, T0).unwrap_err();
        assert!(matches!(err, CaptureError::NoData));
    }

    #[test]
    fn drop_limit_bounds_the_wait() {
        let mut stream = Replay::default()
            .frame(1, 0)
            .frame(2, 0)
            .frame(3, 0)
            .frame(4, T0);

        let err = StalenessFilter::new(Some(2))
            .pull_fresh(&mut stream, T0)
            .unwrap_err();
        assert!(matches!(err, CaptureError::StaleLimit(3)));
        assert_eq!(stream.released.len(), 3);
    }

    #[test]
    fn producer_failure_propagates() {
        let mut stream = Replay::default();
        let err = StalenessFilter::default().pull_fresh(&mut stream, T0).unwrap_err();
        assert_eq!(err.to_string(), "producer: end of replay");
    }
}
