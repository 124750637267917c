// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Cindercast Plugin API
//!
//! This crate defines the interfaces implemented by codec and output
//! backends plugged into the cindercast media pipeline. The engine never
//! inspects backend state; it only calls through these traits.
//!
//! # Example Codec
//!
//! ```ignore
//! use cindercast_plugin_api::*;
//!
//! struct PassthroughVideo {
//!     pts_step: i64,
//! }
//!
//! impl CodecImpl for PassthroughVideo {
//!     fn codec(&self) -> &str {
//!         "h264"
//!     }
//!
//!     fn encode(&mut self, frame: &EncoderFrame) -> Result<Option<CodecPacket>, CodecError> {
//!         Ok(Some(CodecPacket {
//!             data: frame_payload(frame),
//!             pts: frame.pts,
//!             dts: frame.pts,
//!             keyframe: frame.pts == 0,
//!             priority: 0,
//!         }))
//!     }
//! }
//! ```

#![warn(missing_docs)]

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// API version for compatibility checking.
/// Increment MAJOR for breaking changes, MINOR for additions.
pub const API_VERSION_MAJOR: u32 = 0;
/// Minor API version.
pub const API_VERSION_MINOR: u32 = 3;

/// Maximum number of planes in a raw video frame.
pub const MAX_AV_PLANES: usize = 8;

// ============================================================================
// Settings
// ============================================================================

/// JSON-backed key/value settings for codecs, outputs and sources.
///
/// Backends receive a `Settings` on create and update. Unknown keys are
/// carried along untouched so round-tripping through a backend never loses
/// caller data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings(serde_json::Map<String, Value>);

impl Settings {
    /// Create an empty settings object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no keys are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get a string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Get an integer value.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// Get a float value.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    /// Get a boolean value.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Get a raw JSON value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Set a value, replacing any existing one.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Remove a key, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Apply defaults: keys already present win, missing keys are filled in.
    pub fn apply_defaults(&mut self, defaults: &Settings) {
        for (key, value) in &defaults.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    /// Merge `other` over `self`: keys from `other` win.
    pub fn apply(&mut self, other: &Settings) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Iterate over all key/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

// ============================================================================
// Raw media
// ============================================================================

/// One raw video frame delivered from the renderer to encoders and raw
/// outputs. Plane payloads are ref-counted; cloning a frame is cheap.
#[derive(Debug, Clone, Default)]
pub struct VideoFrameData {
    /// Plane payloads, at most [`MAX_AV_PLANES`].
    pub planes: Vec<Bytes>,
    /// Bytes per row for each plane.
    pub linesize: Vec<u32>,
    /// Capture timestamp in nanoseconds (monotonic epoch).
    pub timestamp: u64,
}

/// One block of raw planar `f32` PCM delivered from a mix bus.
#[derive(Debug, Clone, Default)]
pub struct AudioBlockData {
    /// One plane per channel.
    pub planes: Vec<Vec<f32>>,
    /// Number of frames (samples per channel).
    pub frames: u32,
    /// Timestamp of the first sample in nanoseconds.
    pub timestamp: u64,
}

impl AudioBlockData {
    /// End timestamp of this block given a sample rate.
    pub fn end_timestamp(&self, sample_rate: u32) -> u64 {
        self.timestamp + frames_to_ns(self.frames as u64, sample_rate)
    }
}

/// Convert a frame count to nanoseconds without 64-bit overflow.
pub fn frames_to_ns(frames: u64, sample_rate: u32) -> u64 {
    mul_div64(frames, 1_000_000_000, sample_rate as u64)
}

/// Convert nanoseconds to a frame count without 64-bit overflow.
pub fn ns_to_frames(ns: u64, sample_rate: u32) -> u64 {
    mul_div64(ns, sample_rate as u64, 1_000_000_000)
}

/// `num * mul / div` with the remainder folded in separately so the
/// intermediate product cannot overflow for realistic media timestamps.
pub fn mul_div64(num: u64, mul: u64, div: u64) -> u64 {
    let rem = num % div;
    (num / div) * mul + (rem * mul) / div
}

// ============================================================================
// Encoder-facing frames and packets
// ============================================================================

/// Payload of a frame handed to a codec.
#[derive(Debug, Clone)]
pub enum FrameData {
    /// Planar video data.
    Video {
        /// Plane payloads.
        planes: Vec<Bytes>,
        /// Bytes per row per plane.
        linesize: Vec<u32>,
    },
    /// Planar float PCM, one plane per channel.
    Audio {
        /// Channel planes, all of equal length.
        planes: Vec<Vec<f32>>,
    },
}

/// A frame submitted to [`CodecImpl::encode`].
#[derive(Debug, Clone)]
pub struct EncoderFrame {
    /// Raw payload.
    pub data: FrameData,
    /// Frame count: 1 for video, the codec frame size for audio.
    pub frames: u32,
    /// Presentation timestamp in the codec timebase.
    pub pts: i64,
}

/// A compressed packet produced by a codec.
#[derive(Debug, Clone)]
pub struct CodecPacket {
    /// Compressed payload.
    pub data: Bytes,
    /// Presentation timestamp in the codec timebase.
    pub pts: i64,
    /// Decode timestamp in the codec timebase.
    pub dts: i64,
    /// True if this packet can start a decode (video).
    pub keyframe: bool,
    /// Drop priority; `0` is highest.
    pub priority: i32,
}

/// Static stream parameters handed to a codec factory at create time.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecContext {
    /// Audio sample rate in Hz (audio codecs).
    pub sample_rate: u32,
    /// Audio channel count (audio codecs).
    pub channels: u32,
    /// Frame width in pixels (video codecs).
    pub width: u32,
    /// Frame height in pixels (video codecs).
    pub height: u32,
    /// Timebase numerator (video: fps denominator).
    pub timebase_num: u32,
    /// Timebase denominator (video: fps numerator; audio: sample rate).
    pub timebase_den: u32,
}

// ============================================================================
// Codec capabilities
// ============================================================================

/// Codec accepts GPU textures directly instead of CPU frames.
pub const CAP_PASS_TEXTURE: u32 = 1 << 0;
/// Codec can scale its input internally.
pub const CAP_SCALING: u32 = 1 << 1;
/// Codec honours region-of-interest hints.
pub const CAP_ROI: u32 = 1 << 2;
/// Codec is deprecated and hidden from default listings.
pub const CAP_DEPRECATED: u32 = 1 << 3;

/// Whether an encoder implementation handles video or audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncoderKind {
    /// Video encoder fed raw frames.
    Video,
    /// Audio encoder fed one mix bus.
    Audio,
}

// ============================================================================
// Codec interface
// ============================================================================

/// Errors surfaced by codec backends.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The settings given to create/update are unusable.
    #[error("invalid codec settings: {0}")]
    InvalidSettings(String),
    /// Codec state could not be allocated.
    #[error("codec initialization failed: {0}")]
    InitFailed(String),
    /// A frame could not be encoded; the encoder will be fully stopped.
    #[error("encode failed: {0}")]
    EncodeFailed(String),
}

/// A live codec instance. Created by a [`CodecFactory`], destroyed by drop.
///
/// `encode` is called from the encoder's media thread only and is never
/// invoked concurrently with `update`.
pub trait CodecImpl: Send {
    /// Codec identifier, e.g. `"h264"`, `"hevc"`, `"av1"`, `"aac"`.
    fn codec(&self) -> &str;

    /// Encode one frame. `Ok(None)` means the codec needs more input
    /// before it can produce a packet (priming/lookahead).
    fn encode(&mut self, frame: &EncoderFrame) -> Result<Option<CodecPacket>, CodecError>;

    /// Apply changed settings mid-stream. Called between encodes.
    fn update(&mut self, _settings: &Settings) -> Result<(), CodecError> {
        Ok(())
    }

    /// Codec global headers (SPS/PPS etc.), prepended to the first packet.
    fn extra_data(&self) -> Option<Bytes> {
        None
    }

    /// SEI payload included with the first video packet of a session.
    fn sei_data(&self) -> Option<Bytes> {
        None
    }

    /// Audio frame size in samples; `0` for video codecs.
    fn frame_size(&self) -> u32 {
        0
    }

    /// Capability bitmask (`CAP_*`).
    fn caps(&self) -> u32 {
        0
    }
}

/// Registered constructor for a codec id.
pub trait CodecFactory: Send + Sync {
    /// Unique backend id, e.g. `"x264"`, `"ffmpeg-aac"`.
    fn id(&self) -> &str;

    /// Whether this factory builds video or audio codecs.
    fn kind(&self) -> EncoderKind;

    /// Fill default settings. Existing keys win.
    fn defaults(&self, _settings: &mut Settings) {}

    /// Build a codec instance for the given stream parameters.
    fn create(
        &self,
        settings: &Settings,
        context: &CodecContext,
    ) -> Result<Box<dyn CodecImpl>, CodecError>;
}

// ============================================================================
// Output interface
// ============================================================================

/// Errors surfaced by output backends.
#[derive(Debug, Error)]
pub enum OutputImplError {
    /// The output could not connect to its destination.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// The destination rejected the stream.
    #[error("invalid stream: {0}")]
    InvalidStream(String),
    /// Generic backend failure.
    #[error("{0}")]
    Other(String),
}

/// A fully normalised compressed packet as seen by an output writer.
#[derive(Debug, Clone)]
pub struct WirePacket {
    /// Video or audio.
    pub kind: EncoderKind,
    /// Track index within the output.
    pub track_idx: usize,
    /// Compressed payload (possibly with injected SEI/OBU data).
    pub data: Bytes,
    /// Presentation timestamp in the packet timebase.
    pub pts: i64,
    /// Decode timestamp in the packet timebase.
    pub dts: i64,
    /// Timebase numerator.
    pub timebase_num: u32,
    /// Timebase denominator.
    pub timebase_den: u32,
    /// Decode timestamp in microseconds, zero-based per session.
    pub dts_usec: i64,
    /// `dts_usec` plus accumulated pause offsets; what the wire sees.
    pub sys_dts_usec: i64,
    /// True for video keyframes.
    pub keyframe: bool,
    /// Drop priority; `0` is highest.
    pub priority: i32,
}

/// A live output writer (stream, file, service).
///
/// Encoded outputs receive [`WirePacket`]s in `dts_usec` order; raw outputs
/// receive uncompressed frames/blocks. `encoded_packet(None)` is the
/// end-of-stream sentinel sent when an upstream encoder fails.
pub trait OutputImpl: Send {
    /// Begin writing. Returning an error keeps the output idle.
    fn start(&mut self) -> Result<(), OutputImplError>;

    /// Stop writing. `ts` is the stop timestamp (0 for immediate).
    fn stop(&mut self, ts: u64);

    /// Apply changed settings.
    fn update(&mut self, _settings: &Settings) {}

    /// Deliver one interleaved packet, or `None` on upstream failure.
    fn encoded_packet(&mut self, _packet: Option<&WirePacket>) {}

    /// Deliver one raw video frame (raw outputs).
    fn raw_video(&mut self, _frame: &VideoFrameData) {}

    /// Deliver one raw audio block from the default bus (raw outputs).
    fn raw_audio(&mut self, _audio: &AudioBlockData) {}

    /// Deliver one raw audio block tagged with its mix bus index.
    fn raw_audio_mix(&mut self, _mix_idx: usize, _audio: &AudioBlockData) {}

    /// Total bytes written, if tracked.
    fn total_bytes(&self) -> Option<u64> {
        None
    }

    /// Frames dropped by the transport, if tracked.
    fn dropped_frames(&self) -> Option<u64> {
        None
    }

    /// Congestion estimate in `[0.0, 1.0]`, if tracked.
    fn congestion(&self) -> Option<f32> {
        None
    }

    /// Time the last connect took in milliseconds, if tracked.
    fn connect_time_ms(&self) -> Option<u32> {
        None
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Concatenate the planes of a frame into one payload blob. Intended for
/// trivial pass-through codecs and tests.
pub fn frame_payload(frame: &EncoderFrame) -> Bytes {
    match &frame.data {
        FrameData::Video { planes, .. } => {
            let total: usize = planes.iter().map(Bytes::len).sum();
            let mut out = Vec::with_capacity(total);
            for plane in planes {
                out.extend_from_slice(plane);
            }
            Bytes::from(out)
        }
        FrameData::Audio { planes } => {
            let mut out = Vec::new();
            for plane in planes {
                for sample in plane {
                    out.extend_from_slice(&sample.to_le_bytes());
                }
            }
            Bytes::from(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_do_not_override() {
        let mut settings = Settings::new();
        settings.set("bitrate", 6000);

        let mut defaults = Settings::new();
        defaults.set("bitrate", 2500);
        defaults.set("preset", "veryfast");

        settings.apply_defaults(&defaults);
        assert_eq!(settings.get_int("bitrate"), Some(6000));
        assert_eq!(settings.get_str("preset"), Some("veryfast"));
    }

    #[test]
    fn settings_apply_overrides() {
        let mut settings = Settings::new();
        settings.set("bitrate", 2500);

        let mut update = Settings::new();
        update.set("bitrate", 8000);

        settings.apply(&update);
        assert_eq!(settings.get_int("bitrate"), Some(8000));
    }

    #[test]
    fn mul_div_is_exact_for_block_conversions() {
        // 1024 frames at 48 kHz is 21.333…ms; converting back must not drift
        // by more than one frame.
        let ns = frames_to_ns(1024, 48_000);
        assert_eq!(ns, 21_333_333);
        let frames = ns_to_frames(ns, 48_000);
        assert_eq!(frames, 1023); // truncation, callers round up where needed
        assert_eq!(ns_to_frames(ns + 1, 48_000), 1024);
    }

    #[test]
    fn mul_div_survives_large_timestamps() {
        // A day's worth of nanoseconds times a sample rate would overflow a
        // naive multiply.
        let day_ns: u64 = 86_400 * 1_000_000_000;
        let frames = ns_to_frames(day_ns, 48_000);
        assert_eq!(frames, 86_400 * 48_000);
    }

    #[test]
    fn audio_block_end_timestamp() {
        let block = AudioBlockData {
            planes: vec![vec![0.0; 1024]; 2],
            frames: 1024,
            timestamp: 1_000_000,
        };
        assert_eq!(block.end_timestamp(48_000), 1_000_000 + 21_333_333);
    }
}
