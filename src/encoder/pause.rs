// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pause windows.
//!
//! A pause is an explicit timestamp window `{ts_start, ts_end}` plus the
//! accumulated offset of all closed windows. Every entry into the encode
//! path consults it; unpausing folds the window into `ts_offset` so
//! `sys_dts_usec` stays continuous on the wire.

use parking_lot::{Mutex, MutexGuard};

use cindercast_plugin_api::AudioBlockData;

use crate::util::time::{frames_to_ns, ns_to_frames};

/// The pause window state, guarded by the pause mutex.
#[derive(Debug, Default, Clone, Copy)]
pub struct PauseState {
    /// Window start; `0` when no pause is pending or active.
    pub ts_start: u64,
    /// Window end; set when the unpause timestamp is chosen.
    pub ts_end: u64,
    /// Sum of all closed windows, subtracted from wire timestamps.
    pub ts_offset: u64,
    /// Timestamp of the last raw video frame seen, used to align pause
    /// boundaries to frame boundaries.
    pub last_video_ts: u64,
}

impl PauseState {
    /// A new pause may begin only when no window is open.
    pub fn can_start(&self) -> bool {
        self.ts_start == 0 && self.ts_end == 0
    }

    /// A pause may end only while a window is open.
    pub fn can_stop(&self) -> bool {
        self.ts_start != 0 && self.ts_end == 0
    }

    /// Close the window at `ts` and fold it into the offset.
    pub fn end(&mut self, ts: u64) {
        if self.ts_end == 0 {
            self.ts_end = ts;
            self.ts_offset += self.ts_end - self.ts_start;
        }
    }
}

/// A mutex-guarded pause window shared between an encoder and its output.
#[derive(Debug, Default)]
pub struct PauseData {
    state: Mutex<PauseState>,
}

impl PauseData {
    /// Lock the window state.
    pub(crate) fn lock(&self) -> MutexGuard<'_, PauseState> {
        self.state.lock()
    }

    /// Accumulated pause offset in nanoseconds.
    pub fn offset_ns(&self) -> u64 {
        self.state.lock().ts_offset
    }

    /// Clear all pause state (new start cycle).
    pub fn reset(&self) {
        *self.state.lock() = PauseState::default();
    }

    /// Consult the window for a raw video frame. Returns `true` when the
    /// frame falls inside the pause and must be dropped. The frame exactly
    /// at `ts_end` closes the window and is encoded.
    pub fn video_pause_check(&self, timestamp: u64) -> bool {
        let mut pause = self.state.lock();
        pause.last_video_ts = timestamp;
        if pause.ts_start == 0 {
            return false;
        }

        if timestamp == pause.ts_end {
            pause.ts_start = 0;
            pause.ts_end = 0;
        } else if timestamp >= pause.ts_start {
            return true;
        }

        false
    }

    /// Consult the window for a raw audio block, trimming it at the pause
    /// boundaries. Returns `true` when the whole block must be dropped.
    /// Always rebases `data.timestamp` by the accumulated offset.
    pub fn audio_pause_check(&self, data: &mut AudioBlockData, sample_rate: u32) -> bool {
        let mut pause = self.state.lock();
        let ignore = audio_pause_check_internal(&mut pause, data, sample_rate);
        data.timestamp = data.timestamp.saturating_sub(pause.ts_offset);
        ignore
    }
}

fn trim_tail_at_pause(pause: &PauseState, data: &mut AudioBlockData, sample_rate: u32) {
    let cutoff_frames = ns_to_frames(pause.ts_start - data.timestamp, sample_rate) as u32;
    data.frames = cutoff_frames.min(data.frames);
    for plane in &mut data.planes {
        plane.truncate(data.frames as usize);
    }
}

fn trim_head_at_unpause(pause: &mut PauseState, data: &mut AudioBlockData, sample_rate: u32) {
    let cutoff_frames = (ns_to_frames(pause.ts_end - data.timestamp, sample_rate) as u32)
        .min(data.frames);
    for plane in &mut data.planes {
        plane.drain(..cutoff_frames as usize);
    }
    data.timestamp = pause.ts_start;
    data.frames -= cutoff_frames;
    pause.ts_start = 0;
    pause.ts_end = 0;
}

fn audio_pause_check_internal(
    pause: &mut PauseState,
    data: &mut AudioBlockData,
    sample_rate: u32,
) -> bool {
    if pause.ts_start == 0 {
        return false;
    }

    let end_ts = data.timestamp + frames_to_ns(data.frames as u64, sample_rate);

    if pause.ts_start >= data.timestamp {
        if pause.ts_start <= end_ts {
            trim_tail_at_pause(pause, data, sample_rate);
            return data.frames == 0;
        }
    } else {
        if pause.ts_end >= data.timestamp && pause.ts_end <= end_ts {
            trim_head_at_unpause(pause, data, sample_rate);
            return data.frames == 0;
        }
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48_000;

    fn block(ts: u64, frames: u32) -> AudioBlockData {
        AudioBlockData {
            planes: vec![vec![1.0; frames as usize]; 2],
            frames,
            timestamp: ts,
        }
    }

    #[test]
    fn video_frames_inside_window_drop() {
        let pause = PauseData::default();
        {
            let mut st = pause.lock();
            st.ts_start = 1_000_000;
            st.ts_end = 3_000_000;
        }

        assert!(!pause.video_pause_check(500_000));
        assert!(pause.video_pause_check(1_000_000));
        assert!(pause.video_pause_check(2_000_000));
        // The frame at ts_end closes the window and is kept.
        assert!(!pause.video_pause_check(3_000_000));
        assert!(!pause.video_pause_check(4_000_000));
    }

    #[test]
    fn unpause_accumulates_offset() {
        let pause = PauseData::default();
        {
            let mut st = pause.lock();
            assert!(st.can_start());
            st.ts_start = 1_000_000;
            assert!(st.can_stop());
            st.end(4_000_000);
        }
        assert_eq!(pause.offset_ns(), 3_000_000);

        // A second window stacks on top.
        {
            let mut st = pause.lock();
            st.ts_start = 10_000_000;
            st.ts_end = 0;
            st.end(12_000_000);
        }
        assert_eq!(pause.offset_ns(), 5_000_000);
    }

    #[test]
    fn audio_block_straddling_pause_start_is_trimmed() {
        let pause = PauseData::default();
        pause.lock().ts_start = 1_000_000 + frames_to_ns(512, RATE);

        let mut data = block(1_000_000, 1024);
        let drop_all = pause.audio_pause_check(&mut data, RATE);
        assert!(!drop_all);
        assert_eq!(data.frames, 512);
        assert_eq!(data.planes[0].len(), 512);
    }

    #[test]
    fn audio_inside_window_drops_entirely() {
        let pause = PauseData::default();
        pause.lock().ts_start = 1_000;

        let mut data = block(2_000_000, 1024);
        assert!(pause.audio_pause_check(&mut data, RATE));
    }

    #[test]
    fn audio_block_straddling_unpause_is_resumed() {
        let pause = PauseData::default();
        {
            let mut st = pause.lock();
            st.ts_start = 1_000;
            st.ts_end = 2_000_000 + frames_to_ns(256, RATE);
        }

        let mut data = block(2_000_000, 1024);
        let drop_all = pause.audio_pause_check(&mut data, RATE);
        assert!(!drop_all);
        assert_eq!(data.frames, 768);
        // Resumed audio is restamped at the pause start so the encoder's
        // timeline has no gap.
        let st = pause.lock();
        assert_eq!(st.ts_start, 0);
        assert_eq!(st.ts_end, 0);
    }
}
