// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sources: the leaves and composites of the media graph.
//!
//! A source either produces PCM itself (its producer thread pushes blocks
//! through [`Source::output_audio`]) or composes the audio of child sources
//! (scenes, groups, transitions) through an internal render hook. The mixer
//! consumes both kinds uniformly: render into per-mix output buffers, then
//! discard the consumed window from the input FIFO.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

use cindercast_plugin_api::AudioBlockData;

use crate::audio::MixBuffers;
use crate::util::SampleDeque;
use crate::AUDIO_BLOCK_FRAMES;

/// Source produces audio.
pub const SOURCE_AUDIO: u32 = 1 << 0;
/// Source produces video.
pub const SOURCE_VIDEO: u32 = 1 << 1;
/// Source composes other sources (scene, group, transition); its audio comes
/// from a render hook instead of an input FIFO.
pub const SOURCE_COMPOSITE: u32 = 1 << 2;

/// Internal render hook for composite sources.
///
/// `audio_render` fills the per-mix output buffers for one tick and returns
/// the timestamp the rendered block starts at, or `None` when the composite
/// has nothing ready (all children pending).
pub(crate) trait CompositeAudio: Send + Sync {
    fn audio_render(
        &self,
        out: &mut MixBuffers,
        mixers: u32,
        channels: usize,
        sample_rate: u32,
    ) -> Option<u64>;

    /// Enumerate children currently active in the output (visible items,
    /// running transitions).
    fn enum_active_children(&self, cb: &mut dyn FnMut(&Source));

    /// Enumerate every child regardless of visibility. Used for cycle
    /// detection.
    fn enum_all_children(&self, cb: &mut dyn FnMut(&Source));

    /// Downcast hook: scenes/groups return their shared state so the scene
    /// audio render can recurse without a transition in between.
    fn as_scene(&self) -> Option<std::sync::Arc<crate::scene::SceneShared>> {
        None
    }
}

/// Mutable audio state of one source, guarded by the source's audio mutex.
pub(crate) struct SourceAudioState {
    /// Per-channel input FIFO fed by the producer.
    pub input: Vec<SampleDeque>,
    /// Timestamp of the first unconsumed input sample; `0` = unset.
    pub audio_ts: u64,
    /// Whether the producer timestamp baseline has been latched.
    pub timing_set: bool,
    /// Input size at the last stall check.
    pub last_input_size: usize,
    /// First leg of the two-tick stall detection.
    pub pending_stop: bool,
    /// Per-mix output buffers filled by `audio_render` each tick.
    pub output: MixBuffers,
}

struct SourceShared {
    id: Uuid,
    name: Mutex<String>,
    flags: u32,
    channels: usize,
    sample_rate: u32,
    audio: Mutex<SourceAudioState>,
    /// Linear gain as f32 bits, so the audio thread reads the volume
    /// without taking a lock.
    volume_bits: AtomicU32,
    muted: AtomicBool,
    audio_pending: AtomicBool,
    /// Bitmask of mix buses this source feeds.
    mixers: AtomicU32,
    /// Activation count; a source is active while > 0.
    active_refs: AtomicI64,
    composite: Option<Box<dyn CompositeAudio>>,
}

/// A strong handle to a source. Cloning shares the underlying object.
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceShared>,
}

/// A weak handle observing a source's liveness.
#[derive(Clone)]
pub struct WeakSource {
    inner: Weak<SourceShared>,
}

impl WeakSource {
    /// Upgrade to a strong handle if the source is still alive.
    pub fn upgrade(&self) -> Option<Source> {
        self.inner.upgrade().map(|inner| Source { inner })
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Source {}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.inner.id)
            .field("name", &*self.inner.name.lock())
            .field("flags", &self.inner.flags)
            .finish()
    }
}

impl Source {
    pub(crate) fn new(
        name: &str,
        flags: u32,
        channels: usize,
        sample_rate: u32,
        composite: Option<Box<dyn CompositeAudio>>,
    ) -> Self {
        let input = (0..channels).map(|_| SampleDeque::new()).collect();
        Self {
            inner: Arc::new(SourceShared {
                id: Uuid::new_v4(),
                name: Mutex::new(name.to_string()),
                flags,
                channels,
                sample_rate,
                audio: Mutex::new(SourceAudioState {
                    input,
                    audio_ts: 0,
                    timing_set: false,
                    last_input_size: 0,
                    pending_stop: false,
                    output: MixBuffers::new(channels),
                }),
                volume_bits: AtomicU32::new(1.0f32.to_bits()),
                muted: AtomicBool::new(false),
                audio_pending: AtomicBool::new(false),
                mixers: AtomicU32::new(u32::MAX),
                active_refs: AtomicI64::new(0),
                composite,
            }),
        }
    }

    /// Stable identity of this source.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Current display name.
    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    /// Rename the source.
    pub fn set_name(&self, name: &str) {
        *self.inner.name.lock() = name.to_string();
    }

    /// Capability flags (`SOURCE_*`).
    pub fn flags(&self) -> u32 {
        self.inner.flags
    }

    /// Whether this source composes other sources.
    pub fn is_composite(&self) -> bool {
        self.inner.flags & SOURCE_COMPOSITE != 0
    }

    /// Whether this source produces audio.
    pub fn has_audio(&self) -> bool {
        self.inner.flags & SOURCE_AUDIO != 0
    }

    /// Channel count of this source's PCM.
    pub fn channels(&self) -> usize {
        self.inner.channels
    }

    /// Sample rate of this source's PCM.
    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    /// Scenes and groups expose their shared state for nested audio
    /// composition.
    pub(crate) fn composite_scene(&self) -> Option<std::sync::Arc<crate::scene::SceneShared>> {
        self.inner.composite.as_ref().and_then(|c| c.as_scene())
    }

    /// Downgrade to a weak handle.
    pub fn downgrade(&self) -> WeakSource {
        WeakSource {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Linear volume applied at render time.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.inner.volume_bits.load(Ordering::Relaxed))
    }

    /// Set the linear volume.
    pub fn set_volume(&self, volume: f32) {
        self.inner
            .volume_bits
            .store(volume.clamp(0.0, 20.0).to_bits(), Ordering::Relaxed);
    }

    /// Whether the source is muted.
    pub fn muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    /// Mute or unmute.
    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Relaxed);
    }

    /// Bitmask of mix buses this source feeds.
    pub fn mixer_mask(&self) -> u32 {
        self.inner.mixers.load(Ordering::Relaxed)
    }

    /// Restrict the mix buses this source feeds.
    pub fn set_mixer_mask(&self, mask: u32) {
        self.inner.mixers.store(mask, Ordering::Relaxed);
    }

    /// Whether the source has no renderable audio for the current tick.
    pub fn audio_pending(&self) -> bool {
        self.inner.audio_pending.load(Ordering::Relaxed)
    }

    pub(crate) fn set_audio_pending(&self, pending: bool) {
        self.inner.audio_pending.store(pending, Ordering::Relaxed);
    }

    /// Timestamp of the source's first unconsumed audio sample; `0` = unset.
    pub fn audio_timestamp(&self) -> u64 {
        self.inner.audio.lock().audio_ts
    }

    pub(crate) fn audio_state(&self) -> MutexGuard<'_, SourceAudioState> {
        self.inner.audio.lock()
    }

    pub(crate) fn addref_active(&self) {
        self.inner.active_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_active(&self) -> i64 {
        self.inner.active_refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Whether any parent currently has this source active.
    pub fn active(&self) -> bool {
        self.inner.active_refs.load(Ordering::Acquire) > 0
    }

    /// Push one block of PCM from the producer thread.
    ///
    /// The first push (or a push into an empty FIFO) latches the source's
    /// timestamp baseline; later pushes append and inherit the running
    /// front-of-buffer timestamp.
    pub fn output_audio(&self, data: &AudioBlockData) {
        if data.frames == 0 || self.is_composite() {
            return;
        }

        let mut st = self.inner.audio.lock();
        if !st.timing_set || st.input[0].is_empty() {
            st.timing_set = true;
            st.audio_ts = data.timestamp;
        }

        let channels = self.inner.channels;
        for ch in 0..channels {
            // Mono producers fan out to every channel.
            let plane = data.planes.get(ch).or_else(|| data.planes.first());
            if let Some(plane) = plane {
                let frames = (data.frames as usize).min(plane.len());
                st.input[ch].push_back(&plane[..frames]);
            }
        }

        drop(st);
        self.inner.audio_pending.store(false, Ordering::Relaxed);
    }

    /// Render this source's audio for one tick into its output buffers.
    ///
    /// Leaf sources copy from their input FIFO (without consuming it; the
    /// mixer discards the window afterwards) applying volume and mute.
    /// Composite sources delegate to their render hook.
    pub(crate) fn audio_render(&self, mixers: u32, channels: usize, sample_rate: u32) {
        let mut st = self.inner.audio.lock();
        st.output.zero();

        if let Some(composite) = &self.inner.composite {
            let out = &mut st.output;
            match composite.audio_render(out, mixers, channels, sample_rate) {
                Some(ts) => {
                    st.audio_ts = ts;
                    drop(st);
                    self.inner.audio_pending.store(false, Ordering::Relaxed);
                }
                None => {
                    st.audio_ts = 0;
                    drop(st);
                    self.inner.audio_pending.store(true, Ordering::Relaxed);
                }
            }
            return;
        }

        if !st.timing_set || st.audio_ts == 0 {
            return;
        }

        let gain = if self.inner.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            self.volume()
        };
        let source_mask = self.inner.mixers.load(Ordering::Relaxed);

        let mut block = vec![0.0f32; AUDIO_BLOCK_FRAMES];
        for ch in 0..channels.min(self.inner.channels) {
            let copied = st.input[ch].peek_front(&mut block);
            if copied == 0 {
                continue;
            }
            if gain != 1.0 {
                for sample in &mut block[..copied] {
                    *sample *= gain;
                }
            }
            for mix in 0..crate::MAX_MIX_BUSES {
                if mixers & source_mask & (1 << mix) == 0 {
                    continue;
                }
                st.output.plane_mut(mix, ch)[..copied].copy_from_slice(&block[..copied]);
            }
            block[..copied].iter_mut().for_each(|s| *s = 0.0);
        }
    }

    /// Post-order walk of this source's active subtree (children before
    /// parents), excluding the source itself.
    pub(crate) fn enum_active_tree(&self, cb: &mut dyn FnMut(&Source)) {
        if let Some(composite) = &self.inner.composite {
            composite.enum_active_children(&mut |child| {
                child.enum_active_tree(cb);
                cb(child);
            });
        }
    }

    /// Whether `other` appears anywhere in this source's full subtree
    /// (including itself). Used to reject graph cycles.
    pub fn references_source(&self, other: &Source) -> bool {
        if self == other {
            return true;
        }
        let mut found = false;
        if let Some(composite) = &self.inner.composite {
            composite.enum_all_children(&mut |child| {
                if !found && child.references_source(other) {
                    found = true;
                }
            });
        }
        found
    }

    /// Reset the producer timestamp baseline. Used when restarting a source
    /// whose audio lagged past the buffering limit.
    pub(crate) fn reset_timing(&self) {
        let mut st = self.inner.audio.lock();
        st.timing_set = false;
        st.audio_ts = 0;
        debug!("source '{}': audio timing reset", self.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(ts: u64, frames: u32, value: f32) -> AudioBlockData {
        AudioBlockData {
            planes: vec![vec![value; frames as usize]; 2],
            frames,
            timestamp: ts,
        }
    }

    #[test]
    fn output_audio_latches_timestamp() {
        let source = Source::new("mic", SOURCE_AUDIO, 2, 48_000, None);
        assert_eq!(source.audio_timestamp(), 0);

        source.output_audio(&block(5_000, 256, 0.5));
        assert_eq!(source.audio_timestamp(), 5_000);

        // A second push while data remains buffered does not move the front
        // timestamp.
        source.output_audio(&block(10_333_333, 256, 0.5));
        assert_eq!(source.audio_timestamp(), 5_000);
        assert_eq!(source.audio_state().input[0].len(), 512);
    }

    #[test]
    fn render_applies_volume_and_mute() {
        let source = Source::new("mic", SOURCE_AUDIO, 2, 48_000, None);
        source.output_audio(&block(1, 1024, 1.0));

        source.set_volume(0.5);
        source.audio_render(u32::MAX, 2, 48_000);
        assert_eq!(source.audio_state().output.plane(0, 0)[0], 0.5);

        source.set_muted(true);
        source.audio_render(u32::MAX, 2, 48_000);
        assert_eq!(source.audio_state().output.plane(0, 0)[0], 0.0);
    }

    #[test]
    fn render_honours_mixer_mask() {
        let source = Source::new("mic", SOURCE_AUDIO, 2, 48_000, None);
        source.output_audio(&block(1, 1024, 1.0));
        source.set_mixer_mask(0b01);

        source.audio_render(u32::MAX, 2, 48_000);
        let st = source.audio_state();
        assert_eq!(st.output.plane(0, 0)[0], 1.0);
        assert_eq!(st.output.plane(1, 0)[0], 0.0);
    }

    #[test]
    fn self_reference_detected() {
        let source = Source::new("mic", SOURCE_AUDIO, 2, 48_000, None);
        assert!(source.references_source(&source));
    }
}
