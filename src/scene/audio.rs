// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scene audio composition.
//!
//! Per tick the scene computes the minimum child timestamp, applies queued
//! visibility actions as sample-accurate gain steps, recurses into nested
//! scenes/groups with the parent gain as an upper-bound mask, and
//! accumulates each distinct child source into the output mix exactly once.

use std::sync::{Arc, Weak};

use crate::audio::MixBuffers;
use crate::scene::{SceneItem, SceneShared};
use crate::source::{CompositeAudio, Source};
use crate::util::time::{frames_to_ns, mul_div64};
use crate::{AUDIO_BLOCK_FRAMES, MAX_MIX_BUSES};

/// One distinct child source scheduled for mixing, deduplicated across the
/// whole recursion so a source appearing in several items mixes once.
struct SourceMixEntry {
    source: Source,
    /// Routed through this transition instead of the source directly, unless
    /// another item uses the source without a transition.
    transition: Option<Source>,
    apply_buf: bool,
    pos: usize,
    count: usize,
    buf: Vec<f32>,
}

pub(crate) struct SceneAudioAdapter {
    scene: Weak<SceneShared>,
}

impl SceneAudioAdapter {
    pub(crate) fn new(scene: Weak<SceneShared>) -> Self {
        Self { scene }
    }
}

/// The source an item routes through for audio: an active show/hide
/// transition when present, otherwise the child itself.
fn routed_source(item: &SceneItem) -> Source {
    if item.audio_visible() {
        if let Some(show) = item.active_show_transition() {
            return show.source().clone();
        }
    } else if let Some(hide) = item.active_hide_transition() {
        return hide.source().clone();
    }
    item.source().clone()
}

fn item_is_audible(item: &SceneItem) -> bool {
    item.audio_visible() || item.active_hide_transition().is_some()
}

/// Apply every queued action that lands inside the current block, stepping
/// the gain buffer at the action's sample offset.
fn apply_item_audio_actions(
    item: &SceneItem,
    buf: Option<&mut [f32]>,
    ts: u64,
    sample_rate: u32,
) {
    let mut cur_visible = item.audio_visible();
    let mut frame_num = 0usize;
    let mut deref_count = 0usize;
    let mut buf = buf;

    {
        let mut actions = item.take_actions();
        let mut i = 0;
        while i < actions.len() {
            let action = actions[i];
            let timestamp = action.timestamp.max(ts);
            let new_frame_num =
                mul_div64(timestamp - ts, sample_rate as u64, 1_000_000_000) as usize;

            if ts != 0 && new_frame_num >= AUDIO_BLOCK_FRAMES {
                break;
            }

            actions.remove(i);

            item.set_audio_visible(action.visible);
            if !action.visible {
                deref_count += 1;
            }

            if new_frame_num > frame_num {
                if let Some(buf) = buf.as_deref_mut() {
                    let gain = if cur_visible { 1.0 } else { 0.0 };
                    for sample in &mut buf[frame_num..new_frame_num] {
                        *sample = gain;
                    }
                }
                frame_num = new_frame_num;
            }
            cur_visible = action.visible;
        }
    }

    if let Some(buf) = buf.as_deref_mut() {
        let gain = if cur_visible { 1.0 } else { 0.0 };
        for sample in &mut buf[frame_num..] {
            *sample = gain;
        }
    }

    // Each visible→hidden crossing releases the child from the active tree.
    for _ in 0..deref_count {
        item.detach_child();
    }
}

/// Fill the item's gain buffer if any queued action lands within the block
/// starting at `ts`. Returns whether the buffer must be applied.
fn apply_item_volume(item: &SceneItem, buf: &mut [f32], ts: u64, sample_rate: u32) -> bool {
    let pending = item.take_actions().first().copied();

    if let Some(action) = pending {
        let duration = frames_to_ns(AUDIO_BLOCK_FRAMES as u64, sample_rate);
        if ts == 0 || action.timestamp < ts + duration {
            apply_item_audio_actions(item, Some(buf), ts, sample_rate);
            return true;
        }
    }
    false
}

/// Drain every queued action when no audio is flowing, so visibility state
/// cannot stall behind a silent scene.
fn process_all_audio_actions(item: &SceneItem, sample_rate: u32) {
    loop {
        let pending = !item.take_actions().is_empty();
        if !pending {
            break;
        }
        apply_item_audio_actions(item, None, 0, sample_rate);
    }
}

fn min_child_timestamp(items: &[SceneItem]) -> u64 {
    let mut timestamp = 0u64;
    for item in items {
        let source = routed_source(item);
        if source.audio_pending() || !item_is_audible(item) {
            continue;
        }
        let source_ts = source.audio_timestamp();
        if source_ts != 0 && (timestamp == 0 || source_ts < timestamp) {
            timestamp = source_ts;
        }
    }
    timestamp
}

fn render_internal(
    scene: &Arc<SceneShared>,
    parent_buf: Option<&[f32]>,
    entries: &mut Vec<SourceMixEntry>,
    sample_rate: u32,
) -> Option<u64> {
    let items = scene.items_snapshot();

    let timestamp = min_child_timestamp(&items);
    if timestamp == 0 {
        // Just process all pending audio actions if no audio is playing,
        // otherwise audio actions would never be processed.
        for item in &items {
            process_all_audio_actions(item, sample_rate);
        }
        return None;
    }

    let mut buf = vec![0.0f32; AUDIO_BLOCK_FRAMES];
    for item in &items {
        let source = routed_source(item);

        let mut apply_buf = apply_item_volume(item, &mut buf, timestamp, sample_rate);

        if source.audio_pending() {
            continue;
        }
        let source_ts = source.audio_timestamp();
        if source_ts == 0 {
            continue;
        }

        let pos =
            mul_div64(source_ts - timestamp, sample_rate as u64, 1_000_000_000) as usize;
        if pos >= AUDIO_BLOCK_FRAMES {
            continue;
        }

        if !apply_buf && !item.audio_visible() && item.active_hide_transition().is_none() {
            continue;
        }

        let count = AUDIO_BLOCK_FRAMES - pos;

        // Fold the parent mask in so a hidden parent silences nested items.
        if let Some(parent) = parent_buf {
            if !apply_buf {
                buf[..count].copy_from_slice(&parent[..count]);
            } else {
                for (sample, parent_sample) in buf[..count].iter_mut().zip(parent) {
                    *sample = sample.min(*parent_sample);
                }
            }
            apply_buf = true;
        }

        // A nested scene/group without a transition contributes its own
        // items to the shared entry list.
        if source == *item.source() {
            if let Some(nested) = item.source().composite_scene() {
                render_internal(
                    &nested,
                    apply_buf.then_some(&buf[..]),
                    entries,
                    sample_rate,
                );
                continue;
            }
        }

        let transition = (source != *item.source()).then(|| source.clone());
        match entries.iter_mut().find(|e| e.source == *item.source()) {
            Some(existing) => {
                // Only transition audio if there are no non-transitioning
                // scene items for this source.
                if existing.transition.is_some() && transition.is_none() {
                    existing.transition = None;
                }
                // Only apply the mask if every item for this source needs it.
                existing.apply_buf = existing.apply_buf && apply_buf;
                // Keep the highest gain across items.
                if existing.apply_buf {
                    for (have, new) in existing.buf[..existing.count].iter_mut().zip(&buf) {
                        if *new > *have {
                            *have = *new;
                        }
                    }
                }
            }
            None => {
                entries.push(SourceMixEntry {
                    source: item.source().clone(),
                    transition,
                    apply_buf,
                    pos,
                    count,
                    buf: buf.clone(),
                });
            }
        }
    }

    Some(timestamp)
}

impl CompositeAudio for SceneAudioAdapter {
    fn audio_render(
        &self,
        out: &mut MixBuffers,
        mixers: u32,
        channels: usize,
        sample_rate: u32,
    ) -> Option<u64> {
        let scene = self.scene.upgrade()?;
        let mut entries: Vec<SourceMixEntry> = Vec::new();

        let timestamp = render_internal(&scene, None, &mut entries, sample_rate)?;

        for entry in &entries {
            let from = entry.transition.as_ref().unwrap_or(&entry.source);
            let child_st = from.audio_state();

            for mix_idx in 0..MAX_MIX_BUSES {
                if mixers & (1 << mix_idx) == 0 {
                    continue;
                }
                for ch in 0..channels {
                    let input = child_st.output.plane(mix_idx, ch);
                    let output = out.plane_mut(mix_idx, ch);
                    if entry.apply_buf {
                        for i in 0..entry.count {
                            output[entry.pos + i] += input[i] * entry.buf[i];
                        }
                    } else {
                        for i in 0..entry.count {
                            output[entry.pos + i] += input[i];
                        }
                    }
                }
            }
        }

        Some(timestamp)
    }

    fn enum_active_children(&self, cb: &mut dyn FnMut(&Source)) {
        let Some(scene) = self.scene.upgrade() else {
            return;
        };
        for item in scene.items_snapshot() {
            if !item_is_audible(&item) && item.take_actions().is_empty() {
                continue;
            }
            cb(&routed_source(&item));
        }
    }

    fn enum_all_children(&self, cb: &mut dyn FnMut(&Source)) {
        let Some(scene) = self.scene.upgrade() else {
            return;
        };
        for item in scene.items_snapshot() {
            cb(item.source());
        }
    }

    fn as_scene(&self) -> Option<Arc<SceneShared>> {
        self.scene.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Scene;
    use crate::source::SOURCE_AUDIO;
    use cindercast_plugin_api::AudioBlockData;

    const RATE: u32 = 48_000;

    fn feed(source: &Source, ts: u64, frames: u32, value: f32) {
        source.output_audio(&AudioBlockData {
            planes: vec![vec![value; frames as usize]; 2],
            frames,
            timestamp: ts,
        });
    }

    fn render_tree(scene: &Scene) {
        // Children before parents, as the mixer's render order guarantees.
        scene.source().enum_active_tree(&mut |child| {
            child.audio_render(u32::MAX, 2, RATE);
        });
        scene.source().audio_render(u32::MAX, 2, RATE);
    }

    #[test]
    fn visible_item_mixes_through() {
        let scene = Scene::new("main", false, 2, RATE);
        let mic = Source::new("mic", SOURCE_AUDIO, 2, RATE, None);
        scene.add(&mic).unwrap();

        feed(&mic, 1_000, 2048, 0.5);
        render_tree(&scene);

        assert_eq!(scene.source().audio_timestamp(), 1_000);
        let st = scene.source().audio_state();
        assert_eq!(st.output.plane(0, 0)[0], 0.5);
    }

    #[test]
    fn hidden_item_is_silent() {
        let scene = Scene::new("main", false, 2, RATE);
        let mic = Source::new("mic", SOURCE_AUDIO, 2, RATE, None);
        let item = scene.add(&mic).unwrap();

        feed(&mic, 1_000, 2048, 0.5);
        // Hide with an action timestamped before the block: the entire
        // block is gated.
        item.set_visible(false);
        item.take_actions()[0].timestamp = 500;

        render_tree(&scene);
        let st = scene.source().audio_state();
        assert_eq!(st.output.plane(0, 0)[0], 0.0);
        assert_eq!(st.output.plane(0, 0)[AUDIO_BLOCK_FRAMES - 1], 0.0);
        assert!(!item.audio_visible());
    }

    #[test]
    fn visibility_step_is_sample_accurate() {
        let scene = Scene::new("main", false, 2, RATE);
        let mic = Source::new("mic", SOURCE_AUDIO, 2, RATE, None);
        let item = scene.add(&mic).unwrap();

        feed(&mic, 1_000_000, 2048, 1.0);
        item.set_visible(false);
        // Action lands 512 samples into the block.
        let offset_ns = frames_to_ns(512, RATE);
        item.take_actions()[0].timestamp = 1_000_000 + offset_ns + 1;

        render_tree(&scene);
        let st = scene.source().audio_state();
        let plane = st.output.plane(0, 0);
        assert_eq!(plane[0], 1.0);
        assert_eq!(plane[511], 1.0);
        assert_eq!(plane[513], 0.0);
        assert_eq!(plane[1023], 0.0);
    }

    #[test]
    fn duplicate_source_mixes_once() {
        let scene = Scene::new("main", false, 2, RATE);
        let mic = Source::new("mic", SOURCE_AUDIO, 2, RATE, None);
        scene.add(&mic).unwrap();
        scene.add(&mic).unwrap();

        feed(&mic, 1_000, 2048, 0.5);
        render_tree(&scene);

        let st = scene.source().audio_state();
        assert_eq!(st.output.plane(0, 0)[0], 0.5);
    }

    #[test]
    fn nested_scene_inherits_parent_gate() {
        let outer = Scene::new("outer", false, 2, RATE);
        let nested = Scene::new("nested", false, 2, RATE);
        let mic = Source::new("mic", SOURCE_AUDIO, 2, RATE, None);
        nested.add(&mic).unwrap();
        let nested_item = outer.add(nested.source()).unwrap();

        feed(&mic, 1_000, 2048, 1.0);
        // Hide the nested scene item in the outer scene from the start.
        nested_item.set_visible(false);
        nested_item.take_actions()[0].timestamp = 0;

        render_tree(&outer);
        let st = outer.source().audio_state();
        assert_eq!(st.output.plane(0, 0)[0], 0.0);
    }

    #[test]
    fn silent_scene_still_processes_actions() {
        let scene = Scene::new("main", false, 2, RATE);
        let mic = Source::new("mic", SOURCE_AUDIO, 2, RATE, None);
        let item = scene.add(&mic).unwrap();

        item.set_visible(false);
        render_tree(&scene);

        assert!(item.take_actions().is_empty());
        assert!(!item.audio_visible());
        assert!(scene.source().audio_pending());
    }
}
