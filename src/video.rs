// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The raw video feed: the boundary between the external graphics renderer
//! and the encoder pipeline.
//!
//! The renderer submits finished frames here; the feed latches encoder-group
//! start timestamps and fans frames out to consumers (video encoders, raw
//! outputs). Consumers are snapshotted before dispatch so a consumer may
//! disconnect — or fail and tear itself down — from inside its own callback.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use cindercast_plugin_api::VideoFrameData;

use crate::encoder::group::{EncoderGroup, WeakEncoderGroup};

/// Handle identifying a connected frame consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConsumerId(u64);

type FrameCallback = Arc<Mutex<dyn FnMut(&VideoFrameData) + Send>>;

/// The engine's raw-frame dispatcher.
pub struct VideoFeed {
    frame_interval_ns: u64,
    consumers: Mutex<Vec<(u64, FrameCallback)>>,
    ready_groups: Mutex<Vec<WeakEncoderGroup>>,
    next_id: AtomicU64,
    total_frames: AtomicU64,
    last_timestamp: AtomicU64,
}

impl VideoFeed {
    pub(crate) fn new(frame_interval_ns: u64) -> Self {
        Self {
            frame_interval_ns,
            consumers: Mutex::new(Vec::new()),
            ready_groups: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            total_frames: AtomicU64::new(0),
            last_timestamp: AtomicU64::new(0),
        }
    }

    /// Interval between frames in nanoseconds.
    pub fn frame_interval_ns(&self) -> u64 {
        self.frame_interval_ns
    }

    /// Timestamp of the last submitted frame.
    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp.load(Ordering::Acquire)
    }

    /// Total frames submitted since creation.
    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    /// Subscribe to raw frames.
    pub fn connect(&self, callback: impl FnMut(&VideoFrameData) + Send + 'static) -> VideoConsumerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.consumers
            .lock()
            .push((id, Arc::new(Mutex::new(callback))));
        VideoConsumerId(id)
    }

    /// Remove a consumer. Unknown ids are ignored. An in-flight dispatch to
    /// the removed consumer may still complete.
    pub fn disconnect(&self, id: VideoConsumerId) {
        self.consumers.lock().retain(|(cid, _)| *cid != id.0);
    }

    /// Register a group whose members have all started; the next submitted
    /// frame latches its start timestamp.
    pub(crate) fn add_ready_group(&self, group: &EncoderGroup) {
        self.ready_groups.lock().push(group.downgrade());
        debug!("encoder group registered for start-timestamp latch");
    }

    /// Submit one rendered frame. Called by the graphics renderer (or a
    /// test driver) at the configured frame cadence.
    pub fn submit_frame(&self, frame: &VideoFrameData) {
        self.last_timestamp.store(frame.timestamp, Ordering::Release);
        self.total_frames.fetch_add(1, Ordering::Relaxed);

        // Latch start timestamps for ready groups so every grouped encoder
        // sees the same first frame.
        {
            let mut groups = self.ready_groups.lock();
            groups.retain(|weak| match weak.upgrade() {
                Some(group) => !group.try_latch_start_timestamp(frame.timestamp),
                None => false,
            });
        }

        let snapshot: Vec<FrameCallback> = self
            .consumers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            (callback.lock())(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    fn frame(ts: u64) -> VideoFrameData {
        VideoFrameData {
            planes: vec![Bytes::from_static(&[0u8; 16])],
            linesize: vec![16],
            timestamp: ts,
        }
    }

    #[test]
    fn dispatch_and_disconnect() {
        let feed = VideoFeed::new(33_333_333);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let id = feed.connect(move |_| {
            count2.fetch_add(1, Ordering::Relaxed);
        });

        feed.submit_frame(&frame(0));
        feed.submit_frame(&frame(33_333_333));
        assert_eq!(count.load(Ordering::Relaxed), 2);
        assert_eq!(feed.total_frames(), 2);

        feed.disconnect(id);
        feed.submit_frame(&frame(66_666_666));
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn consumer_can_disconnect_itself() {
        let feed = Arc::new(VideoFeed::new(33_333_333));
        let feed2 = Arc::clone(&feed);
        let slot: Arc<Mutex<Option<VideoConsumerId>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);

        let id = feed.connect(move |_| {
            if let Some(id) = slot2.lock().take() {
                feed2.disconnect(id);
            }
        });
        *slot.lock() = Some(id);

        feed.submit_frame(&frame(0));
        feed.submit_frame(&frame(1));
        // No deadlock, and the consumer is gone after its first frame.
        assert!(feed.consumers.lock().is_empty());
    }
}
