// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mock codecs, writers and sinks for unit tests.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cindercast_plugin_api::{
    frame_payload, AudioBlockData, CodecContext, CodecError, CodecFactory, CodecImpl,
    CodecPacket, EncoderFrame, EncoderKind, OutputImpl, OutputImplError, Settings,
    VideoFrameData, WirePacket,
};

use crate::packet::{Packet, PacketTime};

/// A raw video frame with a tiny payload.
pub(crate) fn test_video_frame(ts: u64) -> VideoFrameData {
    VideoFrameData {
        planes: vec![Bytes::from_static(&[0x10, 0x20, 0x30, 0x40])],
        linesize: vec![4],
        timestamp: ts,
    }
}

/// A block of constant stereo PCM.
pub(crate) fn pcm_block(ts: u64, frames: u32, value: f32) -> AudioBlockData {
    AudioBlockData {
        planes: vec![vec![value; frames as usize]; 2],
        frames,
        timestamp: ts,
    }
}

/// Configurable mock codec factory.
pub(crate) struct MockCodecFactory {
    id: String,
    kind: EncoderKind,
    frame_size: u32,
    keyframe_interval: u64,
    sei: Option<Bytes>,
    fail_after: Option<u64>,
    priming_packets: u64,
    update_count: Arc<AtomicU64>,
}

impl MockCodecFactory {
    pub(crate) fn video(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: EncoderKind::Video,
            frame_size: 0,
            keyframe_interval: 1,
            sei: None,
            fail_after: None,
            priming_packets: 0,
            update_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn video_with_keyframe_interval(id: &str, interval: u64) -> Self {
        Self {
            keyframe_interval: interval.max(1),
            ..Self::video(id)
        }
    }

    pub(crate) fn video_with_sei(id: &str, sei: &'static [u8]) -> Self {
        Self {
            sei: Some(Bytes::from_static(sei)),
            ..Self::video(id)
        }
    }

    pub(crate) fn video_failing_after(id: &str, frames: u64) -> Self {
        Self {
            fail_after: Some(frames),
            ..Self::video(id)
        }
    }

    pub(crate) fn audio(id: &str, frame_size: u32) -> Self {
        Self {
            id: id.to_string(),
            kind: EncoderKind::Audio,
            frame_size,
            keyframe_interval: 1,
            sei: None,
            fail_after: None,
            priming_packets: 0,
            update_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn audio_with_priming(id: &str, frame_size: u32, priming: u64) -> Self {
        Self {
            priming_packets: priming,
            ..Self::audio(id, frame_size)
        }
    }

    pub(crate) fn update_count(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.update_count)
    }
}

impl CodecFactory for MockCodecFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> EncoderKind {
        self.kind
    }

    fn create(
        &self,
        _settings: &Settings,
        _context: &CodecContext,
    ) -> Result<Box<dyn CodecImpl>, CodecError> {
        Ok(Box::new(MockCodec {
            kind: self.kind,
            frame_size: self.frame_size,
            keyframe_interval: self.keyframe_interval,
            sei: self.sei.clone(),
            fail_after: self.fail_after,
            priming_packets: self.priming_packets,
            update_count: Arc::clone(&self.update_count),
            frames_seen: 0,
        }))
    }
}

struct MockCodec {
    kind: EncoderKind,
    frame_size: u32,
    keyframe_interval: u64,
    sei: Option<Bytes>,
    fail_after: Option<u64>,
    priming_packets: u64,
    update_count: Arc<AtomicU64>,
    frames_seen: u64,
}

impl CodecImpl for MockCodec {
    fn codec(&self) -> &str {
        match self.kind {
            EncoderKind::Video => "h264",
            EncoderKind::Audio => "aac",
        }
    }

    fn encode(&mut self, frame: &EncoderFrame) -> Result<Option<CodecPacket>, CodecError> {
        if let Some(limit) = self.fail_after {
            if self.frames_seen >= limit {
                return Err(CodecError::EncodeFailed("mock failure".into()));
            }
        }
        let index = self.frames_seen;
        self.frames_seen += 1;

        let pts = match self.kind {
            EncoderKind::Video => frame.pts,
            EncoderKind::Audio => {
                frame.pts - (self.priming_packets as i64 * self.frame_size as i64)
            }
        };

        Ok(Some(CodecPacket {
            data: frame_payload(frame),
            pts,
            dts: pts,
            keyframe: self.kind == EncoderKind::Audio || index % self.keyframe_interval == 0,
            priority: 0,
        }))
    }

    fn update(&mut self, _settings: &Settings) -> Result<(), CodecError> {
        self.update_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sei_data(&self) -> Option<Bytes> {
        self.sei.clone()
    }

    fn frame_size(&self) -> u32 {
        self.frame_size
    }
}

/// What a [`RecordingWriter`] has seen so far.
#[derive(Default)]
pub(crate) struct WriterLog {
    pub(crate) packets: Mutex<Vec<WirePacket>>,
    pub(crate) start_calls: AtomicU64,
    pub(crate) stop_calls: AtomicU64,
    pub(crate) eos_count: AtomicU64,
    /// Remaining `start` calls that should refuse the connection.
    pub(crate) fail_starts: AtomicU64,
}

/// Records every wire packet handed to an output writer; `start` can be
/// made to fail for reconnect tests.
pub(crate) struct RecordingWriter {
    log: Arc<WriterLog>,
}

impl RecordingWriter {
    pub(crate) fn new() -> (Self, Arc<WriterLog>) {
        let log = Arc::new(WriterLog::default());
        (Self { log: Arc::clone(&log) }, log)
    }
}

impl OutputImpl for RecordingWriter {
    fn start(&mut self) -> Result<(), OutputImplError> {
        self.log.start_calls.fetch_add(1, Ordering::Relaxed);
        let remaining = self.log.fail_starts.load(Ordering::Relaxed);
        if remaining > 0 {
            self.log.fail_starts.store(remaining - 1, Ordering::Relaxed);
            return Err(OutputImplError::ConnectFailed("mock refusal".into()));
        }
        Ok(())
    }

    fn stop(&mut self, _ts: u64) {
        self.log.stop_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn encoded_packet(&mut self, packet: Option<&WirePacket>) {
        match packet {
            Some(packet) => self.log.packets.lock().push(packet.clone()),
            None => {
                self.log.eos_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Records every packet delivered to an encoder subscription.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    entries: Arc<Mutex<Vec<(Packet, Option<PacketTime>)>>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn callback(&self) -> impl FnMut(&Packet, Option<&PacketTime>) + Send + 'static {
        let entries = Arc::clone(&self.entries);
        move |packet, time| {
            entries.lock().push((packet.clone(), time.copied()));
        }
    }

    pub(crate) fn packets(&self) -> Vec<Packet> {
        self.entries.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    pub(crate) fn entries(&self) -> Vec<(Packet, Option<PacketTime>)> {
        self.entries.lock().clone()
    }
}
