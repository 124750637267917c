// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The source graph: root channel slots and the audio-source registry.
//!
//! Root channels are the top of the dataflow; whatever sits in a root slot
//! (usually a scene) is what the mixer and the video renderer pull from.
//! The audio-source registry tracks every audio-capable source so the mixer
//! can run its discard pass over all of them, rendered or not.

use parking_lot::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::source::{Source, WeakSource};
use crate::MAX_ROOT_CHANNELS;

/// Root slots plus registries of live sources.
pub struct SourceGraph {
    roots: RwLock<Vec<Option<Source>>>,
    audio_sources: Mutex<Vec<WeakSource>>,
    all_sources: Mutex<Vec<WeakSource>>,
}

impl Default for SourceGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            roots: RwLock::new(vec![None; MAX_ROOT_CHANNELS]),
            audio_sources: Mutex::new(Vec::new()),
            all_sources: Mutex::new(Vec::new()),
        }
    }

    /// Assign or clear a root channel slot.
    pub fn set_root_source(&self, channel: usize, source: Option<Source>) {
        if channel >= MAX_ROOT_CHANNELS {
            warn!("set_root_source: channel {} out of range", channel);
            return;
        }
        let mut roots = self.roots.write();
        if let Some(prev) = roots[channel].take() {
            prev.release_active();
        }
        if let Some(source) = source {
            source.addref_active();
            roots[channel] = Some(source);
        }
    }

    /// The source assigned to a root channel.
    pub fn root_source(&self, channel: usize) -> Option<Source> {
        self.roots.read().get(channel).and_then(Clone::clone)
    }

    /// Every assigned root source, in channel order.
    pub fn root_sources(&self) -> Vec<Source> {
        self.roots.read().iter().flatten().cloned().collect()
    }

    /// Track an audio-capable source for the mixer's discard pass.
    /// Composite sources are included: the discard pass is what clears
    /// their per-tick timestamps.
    pub(crate) fn register_audio_source(&self, source: &Source) {
        if source.has_audio() {
            self.audio_sources.lock().push(source.downgrade());
        }
        self.all_sources.lock().push(source.downgrade());
    }

    /// Live audio sources; dead weak entries are pruned as a side effect.
    pub(crate) fn audio_sources(&self) -> Vec<Source> {
        let mut list = self.audio_sources.lock();
        let mut out = Vec::with_capacity(list.len());
        list.retain(|weak| match weak.upgrade() {
            Some(source) => {
                out.push(source);
                true
            }
            None => false,
        });
        out
    }

    /// Walk sources. With `active_only`, walks the active trees hanging off
    /// the root channels (children before parents); otherwise walks every
    /// registered live source.
    pub fn enum_sources(&self, active_only: bool, cb: &mut dyn FnMut(&Source)) {
        if active_only {
            for root in self.root_sources() {
                root.enum_active_tree(cb);
                cb(&root);
            }
        } else {
            let mut list = self.all_sources.lock();
            list.retain(|weak| match weak.upgrade() {
                Some(source) => {
                    cb(&source);
                    true
                }
                None => false,
            });
        }
    }

    /// Find a live source by id.
    pub fn find_source(&self, id: Uuid) -> Option<Source> {
        let mut found = None;
        self.enum_sources(false, &mut |source| {
            if found.is_none() && source.id() == id {
                found = Some(source.clone());
            }
        });
        found
    }

    /// Find a live source by name (first match).
    pub fn find_source_by_name(&self, name: &str) -> Option<Source> {
        let mut found = None;
        self.enum_sources(false, &mut |source| {
            if found.is_none() && source.name() == name {
                found = Some(source.clone());
            }
        });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SOURCE_AUDIO;

    #[test]
    fn root_slots() {
        let graph = SourceGraph::new();
        let source = Source::new("mic", SOURCE_AUDIO, 2, 48_000, None);

        graph.set_root_source(0, Some(source.clone()));
        assert!(source.active());
        assert_eq!(graph.root_sources().len(), 1);

        graph.set_root_source(0, None);
        assert!(!source.active());
        assert!(graph.root_sources().is_empty());
    }

    #[test]
    fn out_of_range_channel_is_ignored() {
        let graph = SourceGraph::new();
        let source = Source::new("mic", SOURCE_AUDIO, 2, 48_000, None);
        graph.set_root_source(MAX_ROOT_CHANNELS, Some(source));
        assert!(graph.root_sources().is_empty());
    }

    #[test]
    fn dead_sources_are_pruned() {
        let graph = SourceGraph::new();
        {
            let source = Source::new("gone", SOURCE_AUDIO, 2, 48_000, None);
            graph.register_audio_source(&source);
            assert_eq!(graph.audio_sources().len(), 1);
        }
        assert!(graph.audio_sources().is_empty());
    }

    #[test]
    fn find_by_id_and_name() {
        let graph = SourceGraph::new();
        let source = Source::new("desk-mic", SOURCE_AUDIO, 2, 48_000, None);
        graph.register_audio_source(&source);

        assert_eq!(graph.find_source(source.id()), Some(source.clone()));
        assert_eq!(graph.find_source_by_name("desk-mic"), Some(source));
        assert!(graph.find_source_by_name("nope").is_none());
    }
}
