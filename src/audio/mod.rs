// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The audio subsystem: mix buses, tick scheduling and PCM fan-out.
//!
//! Every tick the mixer produces one [`crate::AUDIO_BLOCK_FRAMES`]-sample
//! block per channel on each mix bus. Emitted blocks are fanned out to
//! registered consumers (audio encoders, raw outputs, monitors).

pub mod mixer;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use cindercast_plugin_api::AudioBlockData;

use crate::graph::SourceGraph;
use crate::{AUDIO_BLOCK_FRAMES, MAX_MIX_BUSES};

/// Per-mix, per-channel float blocks for one tick.
///
/// Used both for a source's rendered output and for the mixer's bus
/// accumulators.
pub struct MixBuffers {
    channels: usize,
    data: Vec<Vec<f32>>,
}

impl MixBuffers {
    /// Allocate zeroed buffers for `channels` channels on every bus.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            data: (0..MAX_MIX_BUSES * channels)
                .map(|_| vec![0.0; AUDIO_BLOCK_FRAMES])
                .collect(),
        }
    }

    /// Channel count per bus.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// One bus/channel plane.
    pub fn plane(&self, mix: usize, channel: usize) -> &[f32] {
        &self.data[mix * self.channels + channel]
    }

    /// One bus/channel plane, mutably.
    pub fn plane_mut(&mut self, mix: usize, channel: usize) -> &mut [f32] {
        &mut self.data[mix * self.channels + channel]
    }

    /// Zero every plane.
    pub fn zero(&mut self) {
        for plane in &mut self.data {
            plane.iter_mut().for_each(|s| *s = 0.0);
        }
    }
}

/// Handle identifying a connected bus consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConsumerId(u64);

type AudioCallback = Arc<Mutex<dyn FnMut(usize, &AudioBlockData) + Send>>;

struct AudioConsumer {
    id: u64,
    mix_idx: usize,
    callback: AudioCallback,
}

/// The engine's audio output: owns the mixer state and the consumer list.
pub struct AudioSubsystem {
    sample_rate: u32,
    channels: usize,
    mixer: Mutex<mixer::MixerState>,
    consumers: Mutex<Vec<AudioConsumer>>,
    next_id: AtomicU64,
    /// Bus accumulators, reused across ticks.
    scratch: Mutex<MixBuffers>,
}

impl AudioSubsystem {
    pub(crate) fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
            mixer: Mutex::new(mixer::MixerState::new()),
            consumers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            scratch: Mutex::new(MixBuffers::new(channels)),
        }
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count per bus.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Nanoseconds per mixer tick.
    pub fn block_ns(&self) -> u64 {
        crate::util::time::block_ns(AUDIO_BLOCK_FRAMES as u32, self.sample_rate)
    }

    /// Subscribe to one mix bus. The callback receives `(mix_idx, block)`
    /// for every emitted tick.
    pub fn connect(
        &self,
        mix_idx: usize,
        callback: impl FnMut(usize, &AudioBlockData) + Send + 'static,
    ) -> AudioConsumerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.consumers.lock().push(AudioConsumer {
            id,
            mix_idx: mix_idx.min(MAX_MIX_BUSES - 1),
            callback: Arc::new(Mutex::new(callback)),
        });
        debug!("audio consumer {} connected to mix {}", id, mix_idx);
        AudioConsumerId(id)
    }

    /// Remove a consumer. Unknown ids are ignored.
    pub fn disconnect(&self, id: AudioConsumerId) {
        self.consumers.lock().retain(|c| c.id != id.0);
    }

    /// Run one mixer tick over `[start_ts, end_ts)` and fan out the block if
    /// it was emitted. Returns the effective output timestamp and whether
    /// the block was emitted (`false` while buffering accrues).
    pub fn tick(&self, graph: &SourceGraph, start_ts: u64, end_ts: u64) -> (u64, bool) {
        let mut state = self.mixer.lock();
        let mut mixes = self.scratch.lock();
        mixes.zero();

        let (out_ts, emit) = mixer::audio_tick(
            graph,
            &mut state,
            &mut mixes,
            start_ts,
            end_ts,
            self.sample_rate,
            self.channels,
        );
        drop(state);

        if emit {
            self.deliver(&mixes, out_ts);
        }
        (out_ts, emit)
    }

    fn deliver(&self, mixes: &MixBuffers, timestamp: u64) {
        // Snapshot first so a consumer may disconnect (or tear itself down
        // on failure) from inside its own callback.
        let snapshot: Vec<(usize, AudioCallback)> = self
            .consumers
            .lock()
            .iter()
            .map(|c| (c.mix_idx, Arc::clone(&c.callback)))
            .collect();

        for (mix, callback) in snapshot {
            let block = AudioBlockData {
                planes: (0..self.channels)
                    .map(|ch| mixes.plane(mix, ch).to_vec())
                    .collect(),
                frames: AUDIO_BLOCK_FRAMES as u32,
                timestamp,
            };
            (callback.lock())(mix, &block);
        }
    }

    /// Total accumulated buffering in ticks. Bounded by
    /// [`mixer::MAX_BUFFERING_TICKS`].
    pub fn total_buffering_ticks(&self) -> u32 {
        self.mixer.lock().total_buffering_ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_buffers_index_by_bus_and_channel() {
        let mut buffers = MixBuffers::new(2);
        buffers.plane_mut(1, 1)[0] = 42.0;
        assert_eq!(buffers.plane(1, 1)[0], 42.0);
        assert_eq!(buffers.plane(0, 0)[0], 0.0);
        assert_eq!(buffers.plane(1, 0)[0], 0.0);
        buffers.zero();
        assert_eq!(buffers.plane(1, 1)[0], 0.0);
    }
}
