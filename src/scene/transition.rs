// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Show/hide transitions: full source objects that stand in for a scene
//! item's source while it fades in or out.
//!
//! While a transition is active the scene's audio routing goes through the
//! transition source, which reads the child's rendered output and applies a
//! sample-accurate linear gain ramp over the configured duration.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::audio::MixBuffers;
use crate::source::{CompositeAudio, Source, SOURCE_AUDIO, SOURCE_COMPOSITE};
use crate::util::time::block_ns;
use crate::{AUDIO_BLOCK_FRAMES, MAX_MIX_BUSES};

/// Fade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Fade the child in (show).
    In,
    /// Fade the child out (hide).
    Out,
}

struct TransitionState {
    started: bool,
    /// Latched from the first rendered block so the ramp is aligned to the
    /// audio timeline rather than the control thread's clock.
    start_ts: u64,
    done: bool,
}

struct TransitionShared {
    child: Source,
    direction: Direction,
    duration_ns: u64,
    state: Mutex<TransitionState>,
}

/// A crossfading stand-in source for one scene item.
#[derive(Clone)]
pub struct TransitionSource {
    source: Source,
    shared: Arc<TransitionShared>,
}

impl TransitionSource {
    /// Build a transition wrapping `child`.
    pub fn new(child: &Source, direction: Direction, duration_ms: u32) -> Self {
        let shared = Arc::new(TransitionShared {
            child: child.clone(),
            direction,
            duration_ns: duration_ms as u64 * 1_000_000,
            state: Mutex::new(TransitionState {
                started: false,
                start_ts: 0,
                done: false,
            }),
        });
        let adapter = TransitionAudioAdapter {
            shared: Arc::downgrade(&shared),
        };
        let source = Source::new(
            &format!("{} (transition)", child.name()),
            SOURCE_AUDIO | SOURCE_COMPOSITE,
            child.channels(),
            child.sample_rate(),
            Some(Box::new(adapter)),
        );
        Self { source, shared }
    }

    /// The transition's own source, routed in place of the child.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// The child being faded.
    pub fn child(&self) -> &Source {
        &self.shared.child
    }

    /// Arm the transition. The ramp origin is latched from the first block
    /// rendered after this call.
    pub fn start(&self, _now: u64) {
        let mut st = self.shared.state.lock();
        st.started = true;
        st.start_ts = 0;
        st.done = false;
    }

    /// Whether the fade is still running.
    pub fn is_active(&self) -> bool {
        let st = self.shared.state.lock();
        st.started && !st.done
    }
}

struct TransitionAudioAdapter {
    shared: Weak<TransitionShared>,
}

impl CompositeAudio for TransitionAudioAdapter {
    fn audio_render(
        &self,
        out: &mut MixBuffers,
        mixers: u32,
        channels: usize,
        sample_rate: u32,
    ) -> Option<u64> {
        let shared = self.shared.upgrade()?;
        let mut st = shared.state.lock();
        if !st.started || st.done {
            return None;
        }

        let child = &shared.child;
        if child.audio_pending() {
            return None;
        }
        let child_st = child.audio_state();
        let ts = child_st.audio_ts;
        if ts == 0 {
            return None;
        }

        if st.start_ts == 0 {
            st.start_ts = ts;
        }

        let duration = shared.duration_ns.max(1);
        let elapsed = ts.saturating_sub(st.start_ts);
        let p0 = (elapsed as f64 / duration as f64).min(1.0) as f32;
        let p1 = ((elapsed + block_ns(AUDIO_BLOCK_FRAMES as u32, sample_rate)) as f64
            / duration as f64)
            .min(1.0) as f32;

        let step = (p1 - p0) / AUDIO_BLOCK_FRAMES as f32;
        for mix_idx in 0..MAX_MIX_BUSES {
            if mixers & (1 << mix_idx) == 0 {
                continue;
            }
            for ch in 0..channels {
                let src = child_st.output.plane(mix_idx, ch);
                let dst = out.plane_mut(mix_idx, ch);
                let mut p = p0;
                for (d, s) in dst.iter_mut().zip(src.iter()) {
                    let gain = match shared.direction {
                        Direction::In => p,
                        Direction::Out => 1.0 - p,
                    };
                    *d = *s * gain;
                    p += step;
                }
            }
        }

        if p0 >= 1.0 {
            st.done = true;
        }
        Some(ts)
    }

    fn enum_active_children(&self, cb: &mut dyn FnMut(&Source)) {
        if let Some(shared) = self.shared.upgrade() {
            cb(&shared.child);
        }
    }

    fn enum_all_children(&self, cb: &mut dyn FnMut(&Source)) {
        self.enum_active_children(cb);
    }
}
