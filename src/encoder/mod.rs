// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The encoder pipeline: lifecycle, capture connections and subscriber
//! management around pluggable codec implementations.
//!
//! An encoder is idle until initialized, initialized until its first
//! subscriber starts it, and active while any subscriber remains. The codec
//! `encode` callback runs on the media thread only and is never concurrent
//! with `update`; updates while active set a flag applied at the top of the
//! next encode.

pub mod group;
pub mod media;
pub mod pause;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, warn};
use uuid::Uuid;

use cindercast_plugin_api::{
    CodecContext, CodecImpl, EncoderKind, Settings, CAP_ROI, CAP_SCALING,
};

use crate::engine::Engine;
use crate::error::EncoderError;
use crate::packet::{Packet, PacketTime};
use crate::util::SampleDeque;

use group::EncoderGroup;
use pause::PauseData;

/// Subscriber handle returned by [`Encoder::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

/// A region-of-interest hint forwarded to capable codecs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionOfInterest {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
    /// Quality bias in `[-1.0, 1.0]`; positive means more bits.
    pub enhance: f32,
}

pub(crate) struct EncoderCallback {
    pub(crate) id: u64,
    pub(crate) sent_first_packet: bool,
    pub(crate) callback: Box<dyn FnMut(&Packet, Option<&PacketTime>) + Send>,
}

/// Per-start-cycle timing state, reset on every first-subscriber start.
pub(crate) struct RunState {
    /// Timestamp of the first accepted raw frame (video) or the paired
    /// video start (audio); `0` until latched.
    pub(crate) start_ts: u64,
    /// Timestamp of the first raw input seen (audio encoders).
    pub(crate) first_raw_ts: u64,
    /// Video: first packet received from the codec. Audio: first raw block
    /// received.
    pub(crate) first_received: bool,
    /// Codec dts of the first packet, subtracted from all later packets.
    pub(crate) offset_usec: i64,
    /// Next pts handed to the codec.
    pub(crate) cur_pts: i64,
    /// Pending per-frame timing entries, matched by pts on packet receipt.
    pub(crate) packet_times: VecDeque<PacketTime>,
    /// Per-channel input FIFO (audio encoders).
    pub(crate) audio_input: Vec<SampleDeque>,
}

impl RunState {
    fn new(channels: usize) -> Self {
        Self {
            start_ts: 0,
            first_raw_ts: 0,
            first_received: false,
            offset_usec: 0,
            cur_pts: 0,
            packet_times: VecDeque::new(),
            audio_input: (0..channels).map(|_| SampleDeque::new()).collect(),
        }
    }

    fn reset(&mut self) {
        let channels = self.audio_input.len();
        *self = Self::new(channels);
    }
}

pub(crate) enum MediaConnection {
    Video(crate::video::VideoConsumerId),
    Audio(crate::audio::AudioConsumerId),
}

pub(crate) struct EncoderShared {
    pub(crate) id: Uuid,
    pub(crate) name: Mutex<String>,
    pub(crate) kind: EncoderKind,
    pub(crate) codec_factory_id: String,
    pub(crate) engine: Weak<Engine>,
    /// Also serves as the init mutex: locked across initialize/shutdown and
    /// every encode.
    pub(crate) codec: Mutex<Option<Box<dyn CodecImpl>>>,
    pub(crate) codec_name: Mutex<String>,
    pub(crate) caps: AtomicU32,
    pub(crate) settings: Mutex<Settings>,
    pub(crate) initialized: AtomicBool,
    pub(crate) active: AtomicBool,
    pub(crate) paused: AtomicBool,
    pub(crate) reconfigure_requested: AtomicBool,
    pub(crate) callbacks: Mutex<Vec<EncoderCallback>>,
    pub(crate) next_callback_id: AtomicU64,
    pub(crate) outputs: Mutex<Vec<crate::output::WeakOutput>>,
    pub(crate) paired: Mutex<Vec<WeakEncoder>>,
    pub(crate) group: Mutex<Option<EncoderGroup>>,
    pub(crate) pause: PauseData,
    pub(crate) run: Mutex<RunState>,
    pub(crate) connection: Mutex<Option<MediaConnection>>,
    /// Mix bus index for audio encoders.
    pub(crate) mixer_idx: usize,
    pub(crate) scaled_size: Mutex<Option<(u32, u32)>>,
    pub(crate) frame_rate_divisor: AtomicU32,
    pub(crate) roi: Mutex<Vec<RegionOfInterest>>,
    pub(crate) last_error: Mutex<String>,
    /// `(num, den)`: video `fps_den/fps_num`, audio `1/sample_rate`.
    pub(crate) timebase: Mutex<(u32, u32)>,
    pub(crate) sample_rate: u32,
    pub(crate) channels: usize,
    /// Audio codec frame size in samples.
    pub(crate) framesize: AtomicU32,
    pub(crate) encoded_frames: AtomicU64,
}

/// A strong handle to an encoder.
#[derive(Clone)]
pub struct Encoder {
    pub(crate) inner: Arc<EncoderShared>,
}

/// A weak handle observing an encoder's liveness.
#[derive(Debug, Clone)]
pub struct WeakEncoder {
    inner: Weak<EncoderShared>,
}

impl WeakEncoder {
    /// Upgrade if the encoder is still alive.
    pub fn upgrade(&self) -> Option<Encoder> {
        self.inner.upgrade().map(|inner| Encoder { inner })
    }

    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        Self { inner: Weak::new() }
    }
}

impl PartialEq for Encoder {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Encoder {}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("name", &self.name())
            .field("kind", &self.inner.kind)
            .field("codec", &self.inner.codec_factory_id)
            .finish()
    }
}

impl Encoder {
    pub(crate) fn new(
        engine: &Arc<Engine>,
        kind: EncoderKind,
        codec_factory_id: &str,
        name: &str,
        settings: Settings,
        mixer_idx: usize,
    ) -> Self {
        let audio = engine.audio();
        Self {
            inner: Arc::new(EncoderShared {
                id: Uuid::new_v4(),
                name: Mutex::new(name.to_string()),
                kind,
                codec_factory_id: codec_factory_id.to_string(),
                engine: Arc::downgrade(engine),
                codec: Mutex::new(None),
                codec_name: Mutex::new(String::new()),
                caps: AtomicU32::new(0),
                settings: Mutex::new(settings),
                initialized: AtomicBool::new(false),
                active: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                reconfigure_requested: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
                next_callback_id: AtomicU64::new(1),
                outputs: Mutex::new(Vec::new()),
                paired: Mutex::new(Vec::new()),
                group: Mutex::new(None),
                pause: PauseData::default(),
                run: Mutex::new(RunState::new(audio.channels())),
                connection: Mutex::new(None),
                mixer_idx,
                scaled_size: Mutex::new(None),
                frame_rate_divisor: AtomicU32::new(1),
                roi: Mutex::new(Vec::new()),
                last_error: Mutex::new(String::new()),
                timebase: Mutex::new((1, 1)),
                sample_rate: audio.sample_rate(),
                channels: audio.channels(),
                framesize: AtomicU32::new(0),
                encoded_frames: AtomicU64::new(0),
            }),
        }
    }

    /// Stable identity.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    /// Whether this is a video or audio encoder.
    pub fn kind(&self) -> EncoderKind {
        self.inner.kind
    }

    /// Codec id reported by the codec instance (e.g. `"h264"`); empty until
    /// initialized.
    pub fn codec(&self) -> String {
        self.inner.codec_name.lock().clone()
    }

    /// Mix bus index fed to this encoder (audio encoders).
    pub fn mixer_index(&self) -> usize {
        self.inner.mixer_idx
    }

    /// Downgrade to a weak handle.
    pub fn downgrade(&self) -> WeakEncoder {
        WeakEncoder {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether any subscriber is attached.
    pub fn active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Whether codec state exists.
    pub fn initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    /// Video frames successfully encoded this cycle.
    pub fn encoded_frames(&self) -> u64 {
        self.inner.encoded_frames.load(Ordering::Relaxed)
    }

    /// Timestamp of the first accepted raw frame this cycle; `0` until the
    /// start point is latched.
    pub fn start_timestamp(&self) -> u64 {
        self.inner.run.lock().start_ts
    }

    /// The last error message, if any.
    pub fn last_error(&self) -> String {
        self.inner.last_error.lock().clone()
    }

    pub(crate) fn set_last_error(&self, message: impl Into<String>) {
        *self.inner.last_error.lock() = message.into();
    }

    /// Audio codec frame size in samples; `0` for video encoders.
    pub fn frame_size(&self) -> u32 {
        self.inner.framesize.load(Ordering::Relaxed)
    }

    /// Packet timebase `(num, den)`.
    pub fn timebase(&self) -> (u32, u32) {
        *self.inner.timebase.lock()
    }

    /// Duration of one output packet in microseconds: a frame interval for
    /// video, a codec frame for audio.
    pub fn packet_interval_usec(&self) -> i64 {
        let (num, den) = self.timebase();
        let per_unit = num as i64 * 1_000_000 / den as i64;
        match self.inner.kind {
            EncoderKind::Video => {
                per_unit * self.inner.frame_rate_divisor.load(Ordering::Relaxed) as i64
            }
            EncoderKind::Audio => per_unit * self.frame_size().max(1) as i64,
        }
    }

    /// Replace settings. While active, the codec sees the change at the top
    /// of its next encode; otherwise it is applied immediately.
    pub fn update(&self, settings: &Settings) -> Result<(), EncoderError> {
        self.inner.settings.lock().apply(settings);

        if self.active() {
            self.inner
                .reconfigure_requested
                .store(true, Ordering::Release);
            return Ok(());
        }

        let mut codec = self.inner.codec.lock();
        if let Some(codec) = codec.as_mut() {
            codec.update(&self.inner.settings.lock())?;
        }
        Ok(())
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Settings {
        self.inner.settings.lock().clone()
    }

    /// Request scaled encoding. Rejected while active.
    pub fn set_scaled_size(&self, size: Option<(u32, u32)>) -> Result<(), EncoderError> {
        if self.inner.kind != EncoderKind::Video {
            warn!("set_scaled_size on audio encoder '{}'", self.name());
            return Ok(());
        }
        if self.active() {
            return Err(EncoderError::Active(self.name()));
        }
        *self.inner.scaled_size.lock() = size;
        Ok(())
    }

    /// Whether scaling is requested.
    pub fn scaling_enabled(&self) -> bool {
        self.inner.scaled_size.lock().is_some()
    }

    /// Encode every Nth frame only. Rejected while active.
    pub fn set_frame_rate_divisor(&self, divisor: u32) -> Result<(), EncoderError> {
        if divisor == 0 || self.active() {
            return Err(EncoderError::Active(self.name()));
        }
        self.inner
            .frame_rate_divisor
            .store(divisor, Ordering::Relaxed);
        Ok(())
    }

    /// Current frame rate divisor.
    pub fn frame_rate_divisor(&self) -> u32 {
        self.inner.frame_rate_divisor.load(Ordering::Relaxed)
    }

    /// Add a region-of-interest hint. Ignored with a warning when the codec
    /// does not advertise ROI support.
    pub fn add_roi(&self, roi: RegionOfInterest) {
        if self.initialized() && self.inner.caps.load(Ordering::Relaxed) & CAP_ROI == 0 {
            warn!("codec '{}' does not support ROI", self.codec());
            return;
        }
        self.inner.roi.lock().push(roi);
    }

    /// Clear all region-of-interest hints.
    pub fn clear_roi(&self) {
        self.inner.roi.lock().clear();
    }

    /// Current ROI list.
    pub fn roi(&self) -> Vec<RegionOfInterest> {
        self.inner.roi.lock().clone()
    }

    /// Join a start-alignment group. Rejected while active.
    pub fn set_group(&self, group: &EncoderGroup) -> Result<(), EncoderError> {
        group.add(self)
    }

    pub(crate) fn set_group_internal(
        &self,
        group: Option<EncoderGroup>,
    ) -> Result<(), EncoderError> {
        if self.active() {
            return Err(EncoderError::Active(self.name()));
        }
        *self.inner.group.lock() = group;
        Ok(())
    }

    /// Current group, if any.
    pub fn encoder_group(&self) -> Option<EncoderGroup> {
        self.inner.group.lock().clone()
    }

    /// Pair this encoder with another for start alignment (video with its
    /// audio tracks and vice versa).
    pub(crate) fn add_paired(&self, other: &Encoder) {
        let mut paired = self.inner.paired.lock();
        if !paired.iter().any(|weak| {
            weak.upgrade().is_some_and(|encoder| encoder == *other)
        }) {
            paired.push(other.downgrade());
        }
    }

    pub(crate) fn clear_paired(&self) {
        self.inner.paired.lock().clear();
    }

    /// The encoder's pause window.
    pub(crate) fn pause_data(&self) -> &PauseData {
        &self.inner.pause
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.inner.paused.store(paused, Ordering::Release);
    }

    /// Idle → Initialised: allocate codec state.
    pub fn initialize(&self) -> Result<(), EncoderError> {
        let mut codec_slot = self.inner.codec.lock();
        if codec_slot.is_some() {
            return Ok(());
        }

        let engine = self
            .inner
            .engine
            .upgrade()
            .ok_or_else(|| EncoderError::NoMedia(self.name()))?;

        let factory = engine
            .codec_factory(&self.inner.codec_factory_id)
            .ok_or_else(|| EncoderError::UnknownCodec(self.inner.codec_factory_id.clone()))?;
        if factory.kind() != self.inner.kind {
            return Err(EncoderError::WrongKind(
                self.inner.codec_factory_id.clone(),
                match self.inner.kind {
                    EncoderKind::Video => "video",
                    EncoderKind::Audio => "audio",
                },
            ));
        }

        let mut settings = self.inner.settings.lock().clone();
        let mut defaults = Settings::new();
        factory.defaults(&mut defaults);
        settings.apply_defaults(&defaults);

        let video = engine.config().video;
        let (width, height) =
            (*self.inner.scaled_size.lock()).unwrap_or((video.width, video.height));
        let context = match self.inner.kind {
            EncoderKind::Video => CodecContext {
                width,
                height,
                timebase_num: video.fps_den,
                timebase_den: video.fps_num,
                ..CodecContext::default()
            },
            EncoderKind::Audio => CodecContext {
                sample_rate: self.inner.sample_rate,
                channels: self.inner.channels as u32,
                timebase_num: 1,
                timebase_den: self.inner.sample_rate,
                ..CodecContext::default()
            },
        };

        let codec = factory.create(&settings, &context).map_err(|err| {
            self.set_last_error(err.to_string());
            EncoderError::InitFailed(err)
        })?;

        if self.inner.kind == EncoderKind::Audio {
            let framesize = match codec.frame_size() {
                0 => crate::AUDIO_BLOCK_FRAMES as u32,
                n => n,
            };
            self.inner.framesize.store(framesize, Ordering::Relaxed);
        }
        if self.scaling_enabled() && codec.caps() & CAP_SCALING != 0 {
            info!("encoder '{}' scaling handled by codec", self.name());
        }

        *self.inner.codec_name.lock() = codec.codec().to_string();
        self.inner.caps.store(codec.caps(), Ordering::Relaxed);
        *self.inner.timebase.lock() = (context.timebase_num, context.timebase_den);
        *self.inner.settings.lock() = settings;
        *codec_slot = Some(codec);
        self.inner.initialized.store(true, Ordering::Release);
        info!(
            "encoder '{}' initialized ({})",
            self.name(),
            self.inner.codec_factory_id
        );
        Ok(())
    }

    /// Destroy codec state and return to Idle. No-op while subscribed.
    pub fn shutdown(&self) {
        if self.active() {
            warn!("shutdown of active encoder '{}' ignored", self.name());
            return;
        }
        let mut codec_slot = self.inner.codec.lock();
        *codec_slot = None;
        self.inner.initialized.store(false, Ordering::Release);
        self.inner.codec_name.lock().clear();
    }

    /// Subscribe a packet callback. The first subscriber attaches the
    /// capture connection and moves the encoder to Active.
    pub fn start(
        &self,
        callback: impl FnMut(&Packet, Option<&PacketTime>) + Send + 'static,
    ) -> Result<CallbackId, EncoderError> {
        self.initialize()?;

        let mut callbacks = self.inner.callbacks.lock();
        let first = callbacks.is_empty();
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        callbacks.push(EncoderCallback {
            id,
            sent_first_packet: false,
            callback: Box::new(callback),
        });
        drop(callbacks);

        if first {
            self.add_connection();
        }
        Ok(CallbackId(id))
    }

    /// Remove a subscriber. Dropping the last one detaches the capture.
    pub fn stop(&self, id: CallbackId) {
        let mut callbacks = self.inner.callbacks.lock();
        callbacks.retain(|cb| cb.id != id.0);
        let last = callbacks.is_empty();
        drop(callbacks);

        if last {
            self.remove_connection(true);
        }
    }

    pub(crate) fn add_connection(&self) {
        self.inner.run.lock().reset();
        self.inner.pause.reset();
        self.inner.paused.store(false, Ordering::Release);
        self.inner.encoded_frames.store(0, Ordering::Relaxed);

        let Some(engine) = self.inner.engine.upgrade() else {
            warn!("encoder '{}' has no engine, cannot connect", self.name());
            return;
        };

        if let Some(group) = self.encoder_group() {
            if group.on_encoder_started() {
                engine.video().add_ready_group(&group);
            }
        }

        let weak = self.downgrade();
        let connection = match self.inner.kind {
            EncoderKind::Video => {
                let id = engine.video().connect(move |frame| {
                    if let Some(encoder) = weak.upgrade() {
                        media::receive_video(&encoder, frame);
                    }
                });
                MediaConnection::Video(id)
            }
            EncoderKind::Audio => {
                let id = engine.audio().connect(self.inner.mixer_idx, move |_, block| {
                    if let Some(encoder) = weak.upgrade() {
                        media::receive_audio(&encoder, block);
                    }
                });
                MediaConnection::Audio(id)
            }
        };

        *self.inner.connection.lock() = Some(connection);
        self.inner.active.store(true, Ordering::Release);
        info!("encoder '{}' activated", self.name());
    }

    pub(crate) fn remove_connection(&self, _shutdown: bool) {
        // A full stop and the last subscriber leaving can race to tear the
        // connection down; only the first call does the work.
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(connection) = self.inner.connection.lock().take() {
            if let Some(engine) = self.inner.engine.upgrade() {
                match connection {
                    MediaConnection::Video(id) => engine.video().disconnect(id),
                    MediaConnection::Audio(id) => engine.audio().disconnect(id),
                }
            }
        }

        if let Some(group) = self.encoder_group() {
            group.on_encoder_stopped();
        }

        info!("encoder '{}' deactivated", self.name());
    }

    pub(crate) fn add_output(&self, output: crate::output::WeakOutput) {
        self.inner.outputs.lock().push(output);
    }

    pub(crate) fn remove_output(&self, output: &crate::output::Output) {
        self.inner
            .outputs
            .lock()
            .retain(|weak| weak.upgrade().map(|o| o != *output).unwrap_or(false));
    }

    /// Codec global headers for the current codec state.
    pub fn extra_data(&self) -> Option<bytes::Bytes> {
        self.inner.codec.lock().as_ref().and_then(|c| c.extra_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::test_engine;
    use crate::testutil::{MockCodecFactory, RecordingSink};

    #[test]
    fn initialize_unknown_codec_fails() {
        let engine = test_engine();
        let encoder = Encoder::new(
            &engine,
            EncoderKind::Video,
            "does-not-exist",
            "enc",
            Settings::new(),
            0,
        );
        assert!(matches!(
            encoder.initialize(),
            Err(EncoderError::UnknownCodec(_))
        ));
    }

    #[test]
    fn initialize_sets_audio_frame_size() {
        let engine = test_engine();
        engine.register_codec(MockCodecFactory::audio("mock-aac", 1024));
        let encoder = engine
            .create_audio_encoder("mock-aac", "aac0", Settings::new(), 0)
            .unwrap();

        encoder.initialize().unwrap();
        assert_eq!(encoder.frame_size(), 1024);
        assert_eq!(encoder.timebase(), (1, 48_000));
        assert_eq!(encoder.codec(), "aac");
    }

    #[test]
    fn start_stop_toggles_active() {
        let engine = test_engine();
        engine.register_codec(MockCodecFactory::video("mock-h264"));
        let encoder = engine
            .create_video_encoder("mock-h264", "v0", Settings::new())
            .unwrap();

        let sink = RecordingSink::new();
        let id = encoder.start(sink.callback()).unwrap();
        assert!(encoder.active());

        encoder.stop(id);
        assert!(!encoder.active());
        // Still initialized; shutdown returns it to idle.
        assert!(encoder.initialized());
        encoder.shutdown();
        assert!(!encoder.initialized());
    }

    #[test]
    fn update_while_active_defers_to_next_encode() {
        let engine = test_engine();
        engine.register_codec(MockCodecFactory::video("mock-h264"));
        let encoder = engine
            .create_video_encoder("mock-h264", "v0", Settings::new())
            .unwrap();

        let sink = RecordingSink::new();
        let _id = encoder.start(sink.callback()).unwrap();

        let mut settings = Settings::new();
        settings.set("bitrate", 8000);
        encoder.update(&settings).unwrap();
        assert!(encoder.inner.reconfigure_requested.load(Ordering::Relaxed));
    }

    #[test]
    fn frame_rate_divisor_rejected_while_active() {
        let engine = test_engine();
        engine.register_codec(MockCodecFactory::video("mock-h264"));
        let encoder = engine
            .create_video_encoder("mock-h264", "v0", Settings::new())
            .unwrap();

        let sink = RecordingSink::new();
        let _id = encoder.start(sink.callback()).unwrap();
        assert!(encoder.set_frame_rate_divisor(2).is_err());
    }
}
