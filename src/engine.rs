// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The engine context: configuration, the audio subsystem, the video feed,
//! the source graph and the codec registry.
//!
//! One `Arc<Engine>` is shared by everything; encoders and outputs hold
//! weak references back to it.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

use cindercast_plugin_api::{CodecFactory, EncoderKind, OutputImpl, Settings};

use crate::audio::AudioSubsystem;
use crate::config::{ConfigError, EngineConfig};
use crate::encoder::Encoder;
use crate::error::EncoderError;
use crate::graph::SourceGraph;
use crate::output::Output;
use crate::scene::Scene;
use crate::source::{Source, SOURCE_AUDIO};
use crate::util::time::now_ns;
use crate::video::VideoFeed;
use crate::AUDIO_BLOCK_FRAMES;

/// The engine core. Create with [`Engine::new`], share as `Arc<Engine>`.
pub struct Engine {
    config: EngineConfig,
    audio: AudioSubsystem,
    video: VideoFeed,
    graph: SourceGraph,
    codecs: RwLock<HashMap<String, Arc<dyn CodecFactory>>>,
    audio_thread: Mutex<Option<JoinHandle<()>>>,
    audio_thread_stop: Arc<AtomicBool>,
}

impl Engine {
    /// Build an engine from a validated configuration.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let engine = Arc::new(Self {
            audio: AudioSubsystem::new(config.audio.sample_rate, config.audio.channels),
            video: VideoFeed::new(config.video.frame_interval_ns()),
            graph: SourceGraph::new(),
            codecs: RwLock::new(HashMap::new()),
            audio_thread: Mutex::new(None),
            audio_thread_stop: Arc::new(AtomicBool::new(false)),
            config,
        });
        info!(
            "engine created: {} Hz / {} ch audio, {}x{} @ {}/{} video",
            engine.config.audio.sample_rate,
            engine.config.audio.channels,
            engine.config.video.width,
            engine.config.video.height,
            engine.config.video.fps_num,
            engine.config.video.fps_den,
        );
        Ok(engine)
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The audio subsystem (mixer + bus fan-out).
    pub fn audio(&self) -> &AudioSubsystem {
        &self.audio
    }

    /// The raw video feed.
    pub fn video(&self) -> &VideoFeed {
        &self.video
    }

    /// The source graph.
    pub fn graph(&self) -> &SourceGraph {
        &self.graph
    }

    // ------------------------------------------------------------------
    // Registries and factories
    // ------------------------------------------------------------------

    /// Register a codec backend. Later registrations replace earlier ones
    /// with the same id.
    pub fn register_codec(&self, factory: impl CodecFactory + 'static) {
        let id = factory.id().to_string();
        if self.codecs.write().insert(id.clone(), Arc::new(factory)).is_some() {
            warn!("codec '{}' re-registered", id);
        }
    }

    /// Look up a codec backend by id.
    pub fn codec_factory(&self, id: &str) -> Option<Arc<dyn CodecFactory>> {
        self.codecs.read().get(id).cloned()
    }

    /// Create a leaf source and register it with the graph.
    pub fn create_source(&self, name: &str, flags: u32) -> Source {
        let source = Source::new(
            name,
            flags,
            self.config.audio.channels,
            self.config.audio.sample_rate,
            None,
        );
        self.graph.register_audio_source(&source);
        source
    }

    /// Create a scene.
    pub fn create_scene(&self, name: &str) -> Scene {
        let scene = Scene::new(
            name,
            false,
            self.config.audio.channels,
            self.config.audio.sample_rate,
        );
        self.graph.register_audio_source(scene.source());
        scene
    }

    /// Create a group (a nested item container).
    pub fn create_group(&self, name: &str) -> Scene {
        let scene = Scene::new(
            name,
            true,
            self.config.audio.channels,
            self.config.audio.sample_rate,
        );
        self.graph.register_audio_source(scene.source());
        scene
    }

    /// Create a video encoder bound to the video feed.
    pub fn create_video_encoder(
        self: &Arc<Self>,
        codec_id: &str,
        name: &str,
        settings: Settings,
    ) -> Result<Encoder, EncoderError> {
        self.validate_codec(codec_id, EncoderKind::Video)?;
        Ok(Encoder::new(self, EncoderKind::Video, codec_id, name, settings, 0))
    }

    /// Create an audio encoder bound to one mix bus.
    pub fn create_audio_encoder(
        self: &Arc<Self>,
        codec_id: &str,
        name: &str,
        settings: Settings,
        mixer_idx: usize,
    ) -> Result<Encoder, EncoderError> {
        self.validate_codec(codec_id, EncoderKind::Audio)?;
        Ok(Encoder::new(self, EncoderKind::Audio, codec_id, name, settings, mixer_idx))
    }

    fn validate_codec(&self, codec_id: &str, kind: EncoderKind) -> Result<(), EncoderError> {
        let factory = self
            .codec_factory(codec_id)
            .ok_or_else(|| EncoderError::UnknownCodec(codec_id.to_string()))?;
        if factory.kind() != kind {
            return Err(EncoderError::WrongKind(
                codec_id.to_string(),
                match kind {
                    EncoderKind::Video => "video",
                    EncoderKind::Audio => "audio",
                },
            ));
        }
        Ok(())
    }

    /// Create an output around a writer backend.
    pub fn create_output(
        self: &Arc<Self>,
        name: &str,
        flags: u32,
        driver: Box<dyn OutputImpl>,
        settings: Settings,
    ) -> Output {
        Output::new(self, name, flags, driver, settings)
    }

    // ------------------------------------------------------------------
    // Graph plumbing
    // ------------------------------------------------------------------

    /// Assign or clear a root channel.
    pub fn set_root_source(&self, channel: usize, source: Option<Source>) {
        self.graph.set_root_source(channel, source);
    }

    /// Walk sources (see [`SourceGraph::enum_sources`]).
    pub fn enum_sources(&self, active_only: bool, cb: &mut dyn FnMut(&Source)) {
        self.graph.enum_sources(active_only, cb);
    }

    // ------------------------------------------------------------------
    // Audio thread
    // ------------------------------------------------------------------

    /// Drive one mixer tick manually. Test and embedding hook; the audio
    /// thread calls this internally.
    pub fn tick_audio(&self, start_ts: u64, end_ts: u64) -> (u64, bool) {
        self.audio.tick(&self.graph, start_ts, end_ts)
    }

    /// Start the mixer thread, producing ticks from the monotonic clock.
    pub fn start_audio_thread(self: &Arc<Self>) {
        let mut slot = self.audio_thread.lock();
        if slot.is_some() {
            return;
        }
        self.audio_thread_stop.store(false, Ordering::Release);

        let weak: Weak<Engine> = Arc::downgrade(self);
        let stop = Arc::clone(&self.audio_thread_stop);
        let block_ns = self.audio.block_ns();

        let spawned = std::thread::Builder::new()
            .name("cindercast-audio".into())
            .spawn(move || {
                let mut next_ts = now_ns();
                while !stop.load(Ordering::Acquire) {
                    let Some(engine) = weak.upgrade() else {
                        break;
                    };

                    let now = now_ns();
                    while next_ts + block_ns <= now {
                        engine.tick_audio(next_ts, next_ts + block_ns);
                        next_ts += block_ns;
                    }
                    drop(engine);

                    let wait_ns = (next_ts + block_ns).saturating_sub(now_ns());
                    std::thread::sleep(Duration::from_nanos(wait_ns.min(block_ns)));
                }
            });
        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                info!(
                    "audio thread started ({} samples per tick)",
                    AUDIO_BLOCK_FRAMES
                );
            }
            Err(err) => warn!("failed to spawn audio thread: {}", err),
        }
    }

    /// Stop the mixer thread and join it.
    pub fn stop_audio_thread(&self) {
        self.audio_thread_stop.store(true, Ordering::Release);
        if let Some(handle) = self.audio_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.audio_thread_stop.store(true, Ordering::Release);
        if let Some(handle) = self.audio_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Leaf-source convenience: create an audio source.
pub fn default_audio_source(engine: &Engine, name: &str) -> Source {
    engine.create_source(name, SOURCE_AUDIO)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_engine() -> Arc<Engine> {
        Engine::new(EngineConfig::default()).expect("default config is valid")
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.video.fps_num = 0;
        assert!(Engine::new(config).is_err());
    }

    #[test]
    fn codec_registry() {
        let engine = test_engine();
        assert!(engine.codec_factory("x").is_none());
        engine.register_codec(crate::testutil::MockCodecFactory::video("x"));
        assert!(engine.codec_factory("x").is_some());
    }

    #[test]
    fn create_encoder_validates_kind() {
        let engine = test_engine();
        engine.register_codec(crate::testutil::MockCodecFactory::video("v"));
        assert!(matches!(
            engine.create_audio_encoder("v", "a0", Settings::new(), 0),
            Err(EncoderError::WrongKind(_, _))
        ));
        assert!(engine.create_video_encoder("v", "v0", Settings::new()).is_ok());
    }

    #[test]
    fn sources_register_in_graph() {
        let engine = test_engine();
        let source = default_audio_source(&engine, "mic");
        assert_eq!(engine.graph().find_source(source.id()), Some(source));
    }

    /// A source falling 40ms behind adds exactly two buffering ticks; the
    /// mixer holds blocks while buffering accrues and no samples are
    /// dropped.
    #[test]
    fn source_lag_adds_buffering() {
        const BLOCK_NS: u64 = 21_333_333;

        let engine = test_engine();
        let source = default_audio_source(&engine, "lagger");
        engine.set_root_source(0, Some(source.clone()));

        let push_audio = |ts: u64, frames: u32| {
            source.output_audio(&cindercast_plugin_api::AudioBlockData {
                planes: vec![vec![0.5; frames as usize]; 2],
                frames,
                timestamp: ts,
            });
        };

        let mut ts = 1u64;
        for _ in 0..100 {
            push_audio(ts, 1024);
            let (_, emitted) = engine.tick_audio(ts, ts + BLOCK_NS);
            assert!(emitted);
            ts += BLOCK_NS;
        }
        assert_eq!(engine.audio().total_buffering_ticks(), 0);

        // The source's clock abruptly falls 40ms behind the mixer's.
        let lag = 40_000_000u64;
        push_audio(ts - lag, 2048);
        let (_, emitted) = engine.tick_audio(ts, ts + BLOCK_NS);
        assert!(!emitted, "mixer must hold blocks while buffering builds");
        assert_eq!(engine.audio().total_buffering_ticks(), 2);

        // Buffering releases after the added ticks drain.
        let (_, emitted) = engine.tick_audio(ts + BLOCK_NS, ts + 2 * BLOCK_NS);
        assert!(!emitted);
        let (_, emitted) = engine.tick_audio(ts + 2 * BLOCK_NS, ts + 3 * BLOCK_NS);
        assert!(emitted);
        assert_eq!(engine.audio().total_buffering_ticks(), 2);
    }
}
