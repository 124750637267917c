// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Cindercast: the core media pipeline of a live audio/video production
//! engine.
//!
//! The pipeline mixes audio from many live sources in fixed-size ticks,
//! encodes video and audio through pluggable codec backends, and
//! interleaves the compressed packets into one or more outputs with strict
//! timing guarantees.
//!
//! ```ignore
//! use cindercast::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! let scene = engine.create_scene("main");
//! let mic = engine.create_source("mic", cindercast::source::SOURCE_AUDIO);
//! scene.add(&mic)?;
//! engine.set_root_source(0, Some(scene.source().clone()));
//! engine.start_audio_thread();
//! ```

pub mod audio;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod graph;
pub mod output;
pub mod packet;
pub mod scene;
pub mod signal;
pub mod source;
pub mod util;
pub mod video;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{AudioConfig, EngineConfig, VideoConfig};
pub use engine::Engine;
pub use error::{CoreError, StopCode};

/// Samples per mixer tick.
pub const AUDIO_BLOCK_FRAMES: usize = 1024;
/// Independent mix buses produced by the mixer.
pub const MAX_MIX_BUSES: usize = 6;
/// Channels per mix bus.
pub const MAX_AUDIO_CHANNELS: usize = 8;
/// Root slots in the source graph.
pub const MAX_ROOT_CHANNELS: usize = 64;
/// Video tracks per output.
pub const MAX_OUTPUT_VIDEO_TRACKS: usize = 6;
/// Audio tracks per output.
pub const MAX_OUTPUT_AUDIO_TRACKS: usize = 6;
