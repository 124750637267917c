// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Outputs: the sinks of the pipeline (streams, files, services).
//!
//! An encoded output subscribes to its encoder slots and interleaves their
//! packets before handing them to the writer backend; a raw output receives
//! uncompressed frames and bus audio directly. Outputs own reconnect with
//! exponential backoff, pause orchestration across their encoders, and an
//! optional delay buffer.

pub mod caption;
pub mod delay;
pub mod interleave;
pub mod keyframes;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar as StdCondvar, Mutex as StdMutex, Weak};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use cindercast_plugin_api::{
    AudioBlockData, EncoderKind, OutputImpl, Settings, VideoFrameData,
};

use crate::encoder::pause::PauseData;
use crate::encoder::{CallbackId, Encoder};
use crate::engine::Engine;
use crate::error::{OutputError, StopCode};
use crate::packet::{Packet, PacketTime};
use crate::signal::{OutputEvent, SignalHub};
use crate::util::time::now_ns;
use crate::{MAX_MIX_BUSES, MAX_OUTPUT_AUDIO_TRACKS, MAX_OUTPUT_VIDEO_TRACKS};

use caption::CaptionTrack;
use delay::DelayState;
use interleave::InterleaveState;

/// Output consumes video.
pub const OUTPUT_VIDEO: u32 = 1 << 0;
/// Output consumes audio.
pub const OUTPUT_AUDIO: u32 = 1 << 1;
/// Output consumes encoded packets (otherwise raw frames/blocks).
pub const OUTPUT_ENCODED: u32 = 1 << 2;
/// Output streams to a service.
pub const OUTPUT_SERVICE: u32 = 1 << 3;
/// Output supports multiple tracks per kind.
pub const OUTPUT_MULTI_TRACK: u32 = 1 << 4;
/// Output supports pausing.
pub const OUTPUT_CAN_PAUSE: u32 = 1 << 5;

/// Longest allowed reconnect delay.
pub const RECONNECT_RETRY_MAX_MSEC: u32 = 15 * 60 * 1000;

type PacketCallback = Box<dyn FnMut(&Packet, Option<&PacketTime>) + Send>;
type ReconnectCallback = Box<dyn Fn(&Output, i32) -> bool + Send + Sync>;

/// Handle for removing a packet callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCallbackId(u64);

struct ReconnectState {
    retry_sec: u32,
    retry_max: u32,
    retry_exp: f32,
    retries: u32,
    cur_msec: u32,
    callback: Option<ReconnectCallback>,
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self {
            retry_sec: 2,
            retry_max: 20,
            retry_exp: 1.5,
            retries: 0,
            cur_msec: 0,
            callback: None,
        }
    }
}

enum CaptureHook {
    EncoderSub {
        kind: EncoderKind,
        slot: usize,
        id: CallbackId,
    },
    RawVideo(crate::video::VideoConsumerId),
    RawAudio(crate::audio::AudioConsumerId),
}

pub(crate) struct OutputShared {
    id: Uuid,
    name: Mutex<String>,
    flags: u32,
    engine: Weak<Engine>,
    driver: Mutex<Box<dyn OutputImpl>>,
    settings: Mutex<Settings>,
    video_encoders: Mutex<Vec<Option<Encoder>>>,
    audio_encoders: Mutex<Vec<Option<Encoder>>>,
    hooks: Mutex<Vec<CaptureHook>>,
    pub(crate) interleave: Mutex<InterleaveState>,
    pkt_callbacks: Mutex<Vec<(u64, PacketCallback)>>,
    next_pkt_cb_id: AtomicU64,
    captions: Vec<Mutex<CaptionTrack>>,
    pause: PauseData,
    delay: Mutex<DelayState>,
    reconnect: Mutex<ReconnectState>,
    reconnecting: AtomicBool,
    reconnect_stop: Arc<(StdMutex<bool>, StdCondvar)>,
    signals: SignalHub<OutputEvent>,
    active: AtomicBool,
    data_active: AtomicBool,
    paused: AtomicBool,
    stop_code: AtomicI32,
    total_frames: AtomicU64,
    mixer_mask: AtomicU32,
    last_error: Mutex<String>,
}

/// A strong handle to an output.
#[derive(Clone)]
pub struct Output {
    pub(crate) inner: Arc<OutputShared>,
}

/// A weak handle observing an output's liveness.
#[derive(Clone)]
pub struct WeakOutput {
    inner: Weak<OutputShared>,
}

impl WeakOutput {
    /// Upgrade if the output is still alive.
    pub fn upgrade(&self) -> Option<Output> {
        self.inner.upgrade().map(|inner| Output { inner })
    }
}

impl PartialEq for Output {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Output {}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.name())
            .field("flags", &self.inner.flags)
            .field("active", &self.active())
            .finish()
    }
}

impl Output {
    pub(crate) fn new(
        engine: &Arc<Engine>,
        name: &str,
        flags: u32,
        driver: Box<dyn OutputImpl>,
        settings: Settings,
    ) -> Self {
        Self {
            inner: Arc::new(OutputShared {
                id: Uuid::new_v4(),
                name: Mutex::new(name.to_string()),
                flags,
                engine: Arc::downgrade(engine),
                driver: Mutex::new(driver),
                settings: Mutex::new(settings),
                video_encoders: Mutex::new(vec![None; MAX_OUTPUT_VIDEO_TRACKS]),
                audio_encoders: Mutex::new(vec![None; MAX_OUTPUT_AUDIO_TRACKS]),
                hooks: Mutex::new(Vec::new()),
                interleave: Mutex::new(InterleaveState::new()),
                pkt_callbacks: Mutex::new(Vec::new()),
                next_pkt_cb_id: AtomicU64::new(1),
                captions: (0..MAX_OUTPUT_VIDEO_TRACKS)
                    .map(|_| Mutex::new(CaptionTrack::default()))
                    .collect(),
                pause: PauseData::default(),
                delay: Mutex::new(DelayState::default()),
                reconnect: Mutex::new(ReconnectState::default()),
                reconnecting: AtomicBool::new(false),
                reconnect_stop: Arc::new((StdMutex::new(false), StdCondvar::new())),
                signals: SignalHub::new(),
                active: AtomicBool::new(false),
                data_active: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                stop_code: AtomicI32::new(StopCode::Success.code()),
                total_frames: AtomicU64::new(0),
                mixer_mask: AtomicU32::new(1),
                last_error: Mutex::new(String::new()),
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

    /// Kind mask (`OUTPUT_*`).
    pub fn flags(&self) -> u32 {
        self.inner.flags
    }

    fn encoded(&self) -> bool {
        self.inner.flags & OUTPUT_ENCODED != 0
    }

    fn has_video(&self) -> bool {
        self.inner.flags & OUTPUT_VIDEO != 0
    }

    fn has_audio(&self) -> bool {
        self.inner.flags & OUTPUT_AUDIO != 0
    }

    /// Downgrade to a weak handle.
    pub fn downgrade(&self) -> WeakOutput {
        WeakOutput {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<OutputShared> {
        &self.inner
    }

    /// Whether data capture is running.
    pub fn active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Whether a reconnect cycle is in progress.
    pub fn reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    /// Observe output signals.
    pub fn signals(&self) -> &SignalHub<OutputEvent> {
        &self.inner.signals
    }

    /// Total video frames delivered to the writer.
    pub fn total_frames(&self) -> u64 {
        self.inner.total_frames.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_total_frames(&self) {
        self.inner.total_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// The output's (or, if empty, its encoders') last error message.
    pub fn last_error(&self) -> String {
        let own = self.inner.last_error.lock().clone();
        if !own.is_empty() {
            return own;
        }
        for encoder in self.attached_encoders() {
            let err = encoder.last_error();
            if !err.is_empty() {
                return err;
            }
        }
        String::new()
    }

    pub(crate) fn set_last_error(&self, message: impl Into<String>) {
        *self.inner.last_error.lock() = message.into();
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Apply changed settings to the writer backend.
    pub fn update(&self, settings: &Settings) {
        self.inner.settings.lock().apply(settings);
        self.inner.driver.lock().update(&self.inner.settings.lock());
    }

    /// Assign the video encoder for track 0.
    pub fn set_video_encoder(&self, encoder: Option<Encoder>) {
        self.set_video_encoder2(encoder, 0);
    }

    /// Assign a video encoder slot.
    pub fn set_video_encoder2(&self, encoder: Option<Encoder>, idx: usize) {
        if !self.encoded() || !self.has_video() {
            warn!("output '{}': not an encoded video output", self.name());
            return;
        }
        if idx >= MAX_OUTPUT_VIDEO_TRACKS
            || (idx > 0 && self.inner.flags & OUTPUT_MULTI_TRACK == 0)
        {
            warn!("output '{}': video track {} out of range", self.name(), idx);
            return;
        }
        if self.active() {
            warn!("output '{}': cannot change encoders while active", self.name());
            return;
        }
        if let Some(encoder) = &encoder {
            if encoder.kind() != EncoderKind::Video {
                warn!("output '{}': encoder '{}' is not video", self.name(), encoder.name());
                return;
            }
        }
        self.inner.video_encoders.lock()[idx] = encoder;
    }

    /// Assign an audio encoder slot.
    pub fn set_audio_encoder(&self, encoder: Option<Encoder>, idx: usize) {
        if !self.encoded() || !self.has_audio() {
            warn!("output '{}': not an encoded audio output", self.name());
            return;
        }
        if idx >= MAX_OUTPUT_AUDIO_TRACKS
            || (idx > 0 && self.inner.flags & OUTPUT_MULTI_TRACK == 0)
        {
            warn!("output '{}': audio track {} out of range", self.name(), idx);
            return;
        }
        if self.active() {
            warn!("output '{}': cannot change encoders while active", self.name());
            return;
        }
        if let Some(encoder) = &encoder {
            if encoder.kind() != EncoderKind::Audio {
                warn!("output '{}': encoder '{}' is not audio", self.name(), encoder.name());
                return;
            }
        }
        self.inner.audio_encoders.lock()[idx] = encoder;
    }

    /// Video encoder assigned to a slot.
    pub fn video_encoder(&self, idx: usize) -> Option<Encoder> {
        self.inner.video_encoders.lock().get(idx).and_then(Clone::clone)
    }

    /// Audio encoder assigned to a slot.
    pub fn audio_encoder(&self, idx: usize) -> Option<Encoder> {
        self.inner.audio_encoders.lock().get(idx).and_then(Clone::clone)
    }

    /// Select the mix buses a raw output receives (bitmask).
    pub fn set_mixers(&self, mask: u32) {
        self.inner.mixer_mask.store(mask.max(1), Ordering::Relaxed);
    }

    /// Configure reconnect behaviour. `retry_max == 0` disables reconnect.
    pub fn set_reconnect_settings(&self, retry_max: u32, retry_sec: u32, retry_exp: f32) {
        let mut rc = self.inner.reconnect.lock();
        rc.retry_max = retry_max;
        rc.retry_sec = retry_sec;
        rc.retry_exp = if retry_exp > 1.0 { retry_exp } else { 1.0 };
    }

    /// User hook consulted before entering reconnect; returning `false`
    /// turns the disconnect into a terminal stop.
    pub fn set_reconnect_callback(
        &self,
        callback: impl Fn(&Output, i32) -> bool + Send + Sync + 'static,
    ) {
        self.inner.reconnect.lock().callback = Some(Box::new(callback));
    }

    /// Configure the delay buffer.
    pub fn set_delay(&self, delay_sec: u32, flags: u32) {
        let mut delay = self.inner.delay.lock();
        delay.delay_sec = delay_sec;
        delay.flags = flags;
    }

    /// Register a packet observer invoked for every emitted packet.
    pub fn add_packet_callback(
        &self,
        callback: impl FnMut(&Packet, Option<&PacketTime>) + Send + 'static,
    ) -> PacketCallbackId {
        let id = self.inner.next_pkt_cb_id.fetch_add(1, Ordering::Relaxed);
        self.inner.pkt_callbacks.lock().push((id, Box::new(callback)));
        PacketCallbackId(id)
    }

    /// Remove a packet observer.
    pub fn remove_packet_callback(&self, id: PacketCallbackId) {
        self.inner.pkt_callbacks.lock().retain(|(cid, _)| *cid != id.0);
    }

    /// Queue a caption for a video track.
    pub fn output_caption_text(&self, track: usize, text: &str, display_duration: f64) {
        if let Some(ctrack) = self.caption_track(track) {
            ctrack.lock().queue.push_back(caption::CaptionText {
                text: text.to_string(),
                display_duration,
            });
        }
    }

    /// Queue raw CEA caption bytes for a video track.
    pub fn push_caption_data(&self, track: usize, triplet: [u8; 3]) {
        if let Some(ctrack) = self.caption_track(track) {
            ctrack.lock().cea_data.push_back(triplet);
        }
    }

    pub(crate) fn caption_track(&self, track: usize) -> Option<&Mutex<CaptionTrack>> {
        self.inner.captions.get(track)
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    /// Bytes written by the backend, if tracked.
    pub fn total_bytes(&self) -> u64 {
        self.inner.driver.lock().total_bytes().unwrap_or(0)
    }

    /// Frames dropped by the transport, if tracked.
    pub fn frames_dropped(&self) -> u64 {
        self.inner.driver.lock().dropped_frames().unwrap_or(0)
    }

    /// Congestion estimate in `[0.0, 1.0]`.
    pub fn congestion(&self) -> f32 {
        self.inner.driver.lock().congestion().unwrap_or(0.0)
    }

    /// Connect time of the last start in milliseconds.
    pub fn connect_time_ms(&self) -> u32 {
        self.inner.driver.lock().connect_time_ms().unwrap_or(0)
    }

    /// Accumulated pause offset in nanoseconds.
    pub fn pause_offset_ns(&self) -> u64 {
        if self.encoded() {
            self.first_video_track()
                .and_then(|slot| self.video_encoder(slot))
                .map(|enc| enc.pause_data().offset_ns())
                .unwrap_or(0)
        } else {
            self.inner.pause.offset_ns()
        }
    }

    /// Whether the output is paused.
    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn can_begin_data_capture(&self) -> Result<(), OutputError> {
        if self.encoded() {
            if self.has_video() && self.first_video_track().is_none() {
                return Err(OutputError::MissingEncoder(self.name()));
            }
            if self.has_audio() && self.first_audio_track().is_none() {
                return Err(OutputError::MissingEncoder(self.name()));
            }
        }
        Ok(())
    }

    fn attached_encoders(&self) -> Vec<Encoder> {
        let mut encoders: Vec<Encoder> =
            self.inner.video_encoders.lock().iter().flatten().cloned().collect();
        encoders.extend(self.inner.audio_encoders.lock().iter().flatten().cloned());
        encoders
    }

    pub(crate) fn first_video_track(&self) -> Option<usize> {
        self.inner
            .video_encoders
            .lock()
            .iter()
            .position(Option::is_some)
    }

    pub(crate) fn first_audio_track(&self) -> Option<usize> {
        self.inner
            .audio_encoders
            .lock()
            .iter()
            .position(Option::is_some)
    }

    pub(crate) fn video_track_presence(&self) -> Vec<bool> {
        self.inner
            .video_encoders
            .lock()
            .iter()
            .map(Option::is_some)
            .collect()
    }

    pub(crate) fn audio_track_presence(&self) -> Vec<bool> {
        self.inner
            .audio_encoders
            .lock()
            .iter()
            .map(Option::is_some)
            .collect()
    }

    pub(crate) fn all_tracks_received(&self, st: &InterleaveState) -> bool {
        let video_ok = self
            .video_track_presence()
            .iter()
            .enumerate()
            .all(|(i, present)| !present || st.received_video[i]);
        let audio_ok = self
            .audio_track_presence()
            .iter()
            .enumerate()
            .all(|(i, present)| !present || st.received_audio[i]);
        video_ok && audio_ok
    }

    pub(crate) fn encoder_track_index(&self, packet: &Packet) -> Option<usize> {
        let encoder = packet.encoder.as_ref()?.upgrade()?;
        let slots = match packet.kind {
            EncoderKind::Video => self.inner.video_encoders.lock(),
            EncoderKind::Audio => self.inner.audio_encoders.lock(),
        };
        slots
            .iter()
            .position(|slot| slot.as_ref() == Some(&encoder))
    }

    /// Largest "normal" number of queued streamable packets, derived from
    /// the encoders' packet cadences.
    fn calculate_batch_size(&self) {
        let mut intervals: Vec<i64> = Vec::new();
        for encoder in self.attached_encoders() {
            intervals.push(encoder.packet_interval_usec().max(1));
        }
        let largest = intervals.iter().copied().max().unwrap_or(0);

        // Double the largest interval for wiggle room: it may not divide
        // evenly by the smaller ones (33.3ms video vs 21.3ms AAC).
        let batch: usize = intervals
            .iter()
            .map(|interval| ((largest * 2) / interval) as usize)
            .sum();

        self.inner.interleave.lock().max_batch_size = batch;
    }

    /// Start the output: initialize and pair encoders, start the writer and
    /// hook data capture.
    pub fn start(&self) -> Result<(), OutputError> {
        if self.active() {
            return Ok(());
        }
        self.inner.signals.emit(&OutputEvent::Starting);
        self.actual_start()
    }

    fn actual_start(&self) -> Result<(), OutputError> {
        self.can_begin_data_capture()?;

        if self.encoded() {
            for encoder in self.attached_encoders() {
                encoder.initialize().map_err(|err| {
                    self.set_last_error(err.to_string());
                    OutputError::EncoderInit(err.to_string())
                })?;
            }
            if self.has_video() && self.has_audio() {
                self.pair_encoders();
            }
        }

        {
            let mut driver = self.inner.driver.lock();
            if let Err(err) = driver.start() {
                self.set_last_error(err.to_string());
                return Err(OutputError::StartFailed(err));
            }
        }

        self.begin_data_capture();
        Ok(())
    }

    /// Pair the first video encoder with every audio encoder and vice
    /// versa, so audio aligns its start point to video.
    fn pair_encoders(&self) {
        let Some(video) = self.first_video_track().and_then(|i| self.video_encoder(i)) else {
            return;
        };
        for slot in self.inner.audio_encoders.lock().iter().flatten() {
            if slot.active() || video.active() {
                continue;
            }
            slot.clear_paired();
            slot.add_paired(&video);
            video.add_paired(slot);
        }
    }

    fn begin_data_capture(&self) {
        self.inner.total_frames.store(0, Ordering::Relaxed);
        self.inner.interleave.lock().reset();
        self.inner.pause.reset();
        self.inner.paused.store(false, Ordering::Release);
        self.inner
            .stop_code
            .store(StopCode::Success.code(), Ordering::Relaxed);

        self.inner.data_active.store(true, Ordering::Release);

        if self.encoded() {
            self.hook_encoders();
        } else {
            self.hook_raw_capture();
        }

        self.calculate_batch_size();

        self.inner.signals.emit(&OutputEvent::Activate);
        self.inner.active.store(true, Ordering::Release);

        if self.reconnecting() {
            self.inner.signals.emit(&OutputEvent::ReconnectSuccess);
            self.inner.reconnecting.store(false, Ordering::Release);
        } else {
            self.inner.signals.emit(&OutputEvent::Start);
        }
        info!("output '{}' started", self.name());
    }

    fn hook_encoders(&self) {
        let interleaved = self.has_video() && self.has_audio();
        let mut hooks = self.inner.hooks.lock();

        let mut hook = |kind: EncoderKind, slot: usize, encoder: &Encoder| {
            encoder.add_output(self.downgrade());
            let weak = self.downgrade();
            let id = if interleaved {
                encoder.start(move |packet, time| {
                    if let Some(output) = weak.upgrade() {
                        interleave::interleave_packet(&output, packet.clone(), time.copied());
                    }
                })
            } else {
                encoder.start(move |packet, _time| {
                    if let Some(output) = weak.upgrade() {
                        output.direct_packet(packet);
                    }
                })
            };
            match id {
                Ok(id) => hooks.push(CaptureHook::EncoderSub { kind, slot, id }),
                Err(err) => warn!("output: encoder subscribe failed: {}", err),
            }
        };

        let video: Vec<(usize, Encoder)> = self
            .inner
            .video_encoders
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.clone().map(|e| (i, e)))
            .collect();
        for (slot, encoder) in video {
            hook(EncoderKind::Video, slot, &encoder);
        }
        let audio: Vec<(usize, Encoder)> = self
            .inner
            .audio_encoders
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.clone().map(|e| (i, e)))
            .collect();
        for (slot, encoder) in audio {
            hook(EncoderKind::Audio, slot, &encoder);
        }
    }

    fn hook_raw_capture(&self) {
        let Some(engine) = self.inner.engine.upgrade() else {
            return;
        };
        let mut hooks = self.inner.hooks.lock();

        if self.has_video() {
            let weak = self.downgrade();
            let id = engine.video().connect(move |frame| {
                if let Some(output) = weak.upgrade() {
                    output.raw_video_frame(frame);
                }
            });
            hooks.push(CaptureHook::RawVideo(id));
        }

        if self.has_audio() {
            let mask = self.inner.mixer_mask.load(Ordering::Relaxed);
            let multi = mask.count_ones() > 1;
            for mix in 0..MAX_MIX_BUSES {
                if mask & (1 << mix) == 0 {
                    continue;
                }
                let weak = self.downgrade();
                let id = engine.audio().connect(mix, move |mix_idx, block| {
                    if let Some(output) = weak.upgrade() {
                        output.raw_audio_block(mix_idx, block, multi);
                    }
                });
                hooks.push(CaptureHook::RawAudio(id));
            }
        }
    }

    fn raw_video_frame(&self, frame: &VideoFrameData) {
        if self.inner.pause.video_pause_check(frame.timestamp) {
            return;
        }
        if self.inner.data_active.load(Ordering::Acquire) {
            self.inner.driver.lock().raw_video(frame);
        }
        self.bump_total_frames();
    }

    fn raw_audio_block(&self, mix_idx: usize, block: &AudioBlockData, multi: bool) {
        let Some(engine) = self.inner.engine.upgrade() else {
            return;
        };
        let mut audio = block.clone();
        if self
            .inner
            .pause
            .audio_pause_check(&mut audio, engine.audio().sample_rate())
        {
            return;
        }
        if self.inner.data_active.load(Ordering::Acquire) {
            let mut driver = self.inner.driver.lock();
            if multi {
                driver.raw_audio_mix(mix_idx, &audio);
            } else {
                driver.raw_audio(&audio);
            }
        }
    }

    /// Non-interleaved delivery for single-kind encoded outputs.
    fn direct_packet(&self, packet: &Packet) {
        if !self.inner.data_active.load(Ordering::Acquire) {
            return;
        }
        let Some(track_idx) = self.encoder_track_index(packet) else {
            return;
        };
        let mut out = packet.clone();
        out.track_idx = track_idx;
        if out.kind == EncoderKind::Video {
            self.bump_total_frames();
        }
        self.write_packet(&out);
    }

    pub(crate) fn run_packet_callbacks(&self, packet: &Packet, time: Option<PacketTime>) {
        let mut callbacks = self.inner.pkt_callbacks.lock();
        for (_, callback) in callbacks.iter_mut() {
            callback(packet, time.as_ref());
        }
    }

    /// Hand a packet to the writer, through the delay buffer when one is
    /// configured.
    pub(crate) fn write_packet(&self, packet: &Packet) {
        let due = {
            let mut delay = self.inner.delay.lock();
            if delay.active() {
                Some(delay.push_and_drain(now_ns(), packet.clone()))
            } else {
                None
            }
        };

        let mut driver = self.inner.driver.lock();
        match due {
            Some(due) => {
                for packet in due {
                    driver.encoded_packet(Some(&packet.to_wire()));
                }
            }
            None => driver.encoded_packet(Some(&packet.to_wire())),
        }
    }

    /// End-of-stream sentinel, sent when an upstream encoder fails.
    pub(crate) fn deliver_end_of_stream(&self) {
        let _st = self.inner.interleave.lock();
        self.inner.driver.lock().encoded_packet(None);
    }

    /// Request a clean stop. Idempotent.
    pub fn stop(&self) {
        if !self.active() {
            return;
        }
        self.abort_reconnect();
        self.inner.signals.emit(&OutputEvent::Stopping);
        self.end_data_capture(true);
    }

    /// Synchronously clear the interleaver and tear down capture.
    pub fn force_stop(&self) {
        self.abort_reconnect();
        {
            let mut st = self.inner.interleave.lock();
            st.packets.clear();
        }
        if self.active() {
            self.end_data_capture(true);
        }
    }

    fn end_data_capture(&self, signal: bool) {
        if !self.inner.data_active.swap(false, Ordering::AcqRel) {
            return;
        }

        let hooks: Vec<CaptureHook> = std::mem::take(&mut *self.inner.hooks.lock());
        let engine = self.inner.engine.upgrade();
        for hook in hooks {
            match hook {
                CaptureHook::EncoderSub { kind, slot, id } => {
                    let encoder = match kind {
                        EncoderKind::Video => self.video_encoder(slot),
                        EncoderKind::Audio => self.audio_encoder(slot),
                    };
                    if let Some(encoder) = encoder {
                        encoder.stop(id);
                        encoder.remove_output(self);
                    }
                }
                CaptureHook::RawVideo(id) => {
                    if let Some(engine) = &engine {
                        engine.video().disconnect(id);
                    }
                }
                CaptureHook::RawAudio(id) => {
                    if let Some(engine) = &engine {
                        engine.audio().disconnect(id);
                    }
                }
            }
        }

        self.inner.delay.lock().on_capture_end();
        self.inner.driver.lock().stop(now_ns());
        self.inner.active.store(false, Ordering::Release);
        self.inner.signals.emit(&OutputEvent::Deactivate);

        if signal {
            let code = StopCode::from_code(self.inner.stop_code.load(Ordering::Relaxed));
            self.inner.signals.emit(&OutputEvent::Stop {
                code,
                error: self.last_error(),
            });
            info!("output '{}' stopped (code {:?})", self.name(), code);
        }
    }

    // ------------------------------------------------------------------
    // Reconnect
    // ------------------------------------------------------------------

    /// Report a writer failure. Chooses between reconnect and terminal
    /// stop; called by the embedding transport when its connection drops.
    pub fn signal_stop(&self, code: StopCode) {
        self.inner.stop_code.store(code.code(), Ordering::Relaxed);

        if self.can_reconnect(code) {
            self.end_data_capture(false);
            self.output_reconnect();
        } else {
            if self.reconnecting() {
                self.inner.reconnecting.store(false, Ordering::Release);
            }
            self.end_data_capture(true);
        }
    }

    fn can_reconnect(&self, code: StopCode) -> bool {
        let rc = self.inner.reconnect.lock();
        let reconnect_active = rc.retry_max != 0;
        if reconnect_active {
            if let Some(callback) = &rc.callback {
                if !callback(self, code.code()) {
                    return false;
                }
            }
        }
        (self.reconnecting() && code != StopCode::Success)
            || (reconnect_active && code == StopCode::Disconnected)
    }

    fn output_reconnect(&self) {
        let delay_msec = {
            let mut rc = self.inner.reconnect.lock();
            if !self.reconnecting() {
                rc.cur_msec = rc.retry_sec * 1000;
                rc.retries = 0;
            }

            if rc.retries >= rc.retry_max {
                drop(rc);
                self.inner
                    .stop_code
                    .store(StopCode::Disconnected.code(), Ordering::Relaxed);
                self.inner.reconnecting.store(false, Ordering::Release);
                if self.inner.data_active.load(Ordering::Acquire) {
                    self.end_data_capture(true);
                } else {
                    // Capture already ended when the reconnect cycle began;
                    // emit the terminal stop directly.
                    self.inner.signals.emit(&OutputEvent::Stop {
                        code: StopCode::Disconnected,
                        error: self.last_error(),
                    });
                }
                return;
            }

            if !self.reconnecting() {
                self.inner.reconnecting.store(true, Ordering::Release);
                *self.inner.reconnect_stop.0.lock().unwrap_or_else(|e| e.into_inner()) = false;
            }

            if rc.retries > 0 {
                rc.cur_msec = advance_backoff(rc.cur_msec, rc.retry_exp);
            }
            rc.retries += 1;
            rc.cur_msec
        };

        self.inner
            .stop_code
            .store(StopCode::Disconnected.code(), Ordering::Relaxed);

        let output = self.clone();
        let stop_event = Arc::clone(&self.inner.reconnect_stop);
        std::thread::spawn(move || {
            let (lock, condvar) = &*stop_event;
            let mut stopped = lock.lock().unwrap_or_else(|e| e.into_inner());
            let deadline = Duration::from_millis(delay_msec as u64);
            let (guard, timeout) = condvar
                .wait_timeout_while(stopped, deadline, |stop| !*stop)
                .unwrap_or_else(|e| e.into_inner());
            stopped = guard;
            let aborted = *stopped;
            drop(stopped);

            if aborted || !timeout.timed_out() {
                output.inner.reconnecting.store(false, Ordering::Release);
                return;
            }

            match output.actual_start() {
                Ok(()) => {}
                Err(err) => {
                    warn!("output '{}': reconnect attempt failed: {}", output.name(), err);
                    output.output_reconnect();
                }
            }
        });

        info!(
            "Output '{}': Reconnecting in {:.02} seconds..",
            self.name(),
            delay_msec as f64 / 1000.0
        );
        self.inner.signals.emit(&OutputEvent::Reconnect {
            timeout_sec: delay_msec / 1000,
        });
    }

    /// Current scheduled reconnect delay in milliseconds.
    pub fn reconnect_delay_msec(&self) -> u32 {
        self.inner.reconnect.lock().cur_msec
    }

    fn abort_reconnect(&self) {
        if self.reconnecting() {
            let (lock, condvar) = &*self.inner.reconnect_stop;
            *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
            condvar.notify_all();
            self.inner.reconnecting.store(false, Ordering::Release);
        }
    }

    // ------------------------------------------------------------------
    // Pause
    // ------------------------------------------------------------------

    /// Pause or unpause the output. Succeeds only when every attached
    /// encoder can flip at the chosen video-frame boundary.
    pub fn pause(&self, pause: bool) -> bool {
        if self.inner.flags & OUTPUT_CAN_PAUSE == 0 {
            warn!("output '{}' cannot pause", self.name());
            return false;
        }
        if !self.active() {
            return false;
        }
        if self.paused() == pause {
            return true;
        }

        let success = if self.encoded() {
            self.encoded_pause(pause)
        } else {
            self.raw_pause(pause)
        };

        if success {
            self.inner.paused.store(pause, Ordering::Release);
            let event = if pause {
                OutputEvent::Pause
            } else {
                OutputEvent::Unpause
            };
            self.inner.signals.emit(&event);
            info!("output '{}' {}paused", self.name(), if pause { "" } else { "un" });
        }
        success
    }

    /// Next video-frame-aligned timestamp after "now".
    fn closest_video_ts(&self, last_video_ts: u64) -> u64 {
        let interval = self
            .inner
            .engine
            .upgrade()
            .map(|engine| engine.video().frame_interval_ns())
            .unwrap_or(33_333_333)
            .max(1);
        let now = now_ns();
        let i2 = interval * 2;
        last_video_ts + ((now.saturating_sub(last_video_ts) + i2) / interval) * interval
    }

    fn encoded_pause(&self, pause: bool) -> bool {
        let encoders = self.attached_encoders();
        if encoders.is_empty() {
            return false;
        }

        // All pause mutexes are held across the flip so the window is
        // atomic across encoders.
        let guards: Vec<_> = encoders
            .iter()
            .map(|encoder| encoder.pause_data().lock())
            .collect();

        let closest_v_ts = self.closest_video_ts(guards[0].last_video_ts);

        if pause {
            if !guards.iter().all(|g| g.can_start()) {
                return false;
            }
        } else if !guards.iter().all(|g| g.can_stop()) {
            return false;
        }

        let mut guards = guards;
        for (guard, encoder) in guards.iter_mut().zip(&encoders) {
            if pause {
                encoder.set_paused(true);
                guard.ts_start = closest_v_ts;
            } else {
                encoder.set_paused(false);
                guard.end(closest_v_ts);
            }
        }
        true
    }

    fn raw_pause(&self, pause: bool) -> bool {
        let mut guard = self.inner.pause.lock();
        let closest_v_ts = self.closest_video_ts(guard.last_video_ts);
        if pause {
            if !guard.can_start() {
                return false;
            }
            guard.ts_start = closest_v_ts;
            true
        } else {
            if !guard.can_stop() {
                return false;
            }
            guard.end(closest_v_ts);
            true
        }
    }
}

/// One step of the reconnect backoff: multiply by the exponential factor
/// and clamp to the ceiling.
fn advance_backoff(cur_msec: u32, exp: f32) -> u32 {
    let next = (cur_msec as f64 * exp as f64) as u32;
    next.min(RECONNECT_RETRY_MAX_MSEC)
}

impl StopCode {
    pub(crate) fn from_code(code: i32) -> Self {
        match code {
            0 => StopCode::Success,
            -1 => StopCode::Disconnected,
            -2 => StopCode::InvalidStream,
            _ => StopCode::Error,
        }
    }
}
