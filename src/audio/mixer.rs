// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-tick audio mixer.
//!
//! Each tick consumes exactly one block window `[start, end)` from every
//! up-to-date source and accumulates root sources into the mix buses. When a
//! source falls behind, the tick window FIFO is extended backwards so the
//! whole pipeline buffers instead of dropping samples, up to
//! [`MAX_BUFFERING_TICKS`]; past that, the lagging source's audio is dropped
//! and its timing restarted.

use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::audio::MixBuffers;
use crate::graph::SourceGraph;
use crate::source::Source;
use crate::util::time::{frames_to_ns, mul_div64, ns_to_frames};
use crate::{AUDIO_BLOCK_FRAMES, MAX_MIX_BUSES};

/// Hard cap on accumulated buffering, in ticks. Derived empirically;
/// intentionally not exposed as configuration.
pub const MAX_BUFFERING_TICKS: u32 = 45;

/// One buffered tick window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsWindow {
    pub start: u64,
    pub end: u64,
}

/// Mixer bookkeeping, guarded by the subsystem's mixer mutex.
pub struct MixerState {
    /// FIFO of tick windows still to be consumed. The front is the window
    /// the current tick operates on.
    buffered_timestamps: VecDeque<TsWindow>,
    /// Ticks still to be held back before emission resumes.
    buffering_wait_ticks: u32,
    /// Total buffering accumulated since start.
    pub(crate) total_buffering_ticks: u32,
    /// Start timestamp of the window that triggered the current buffering
    /// extension.
    buffered_ts: u64,
}

impl MixerState {
    pub(crate) fn new() -> Self {
        Self {
            buffered_timestamps: VecDeque::new(),
            buffering_wait_ticks: 0,
            total_buffering_ticks: 0,
            buffered_ts: 0,
        }
    }
}

fn convert_time_to_frames(sample_rate: u32, t: u64) -> usize {
    mul_div64(t, sample_rate as u64, 1_000_000_000) as usize
}

fn push_unique(order: &mut Vec<Source>, source: &Source) {
    if !order.iter().any(|s| s == source) {
        order.push(source.clone());
    }
}

/// Accumulate one root source's rendered output into the bus mixes at the
/// offset its timestamp dictates within the tick window.
fn mix_source_output(
    mixes: &mut MixBuffers,
    source: &Source,
    channels: usize,
    sample_rate: u32,
    ts: &TsWindow,
) {
    let st = source.audio_state();
    let audio_ts = st.audio_ts;

    if audio_ts < ts.start || ts.end <= audio_ts {
        return;
    }

    let mut start_point = 0;
    let mut total = AUDIO_BLOCK_FRAMES;
    if audio_ts != ts.start {
        start_point = convert_time_to_frames(sample_rate, audio_ts - ts.start);
        if start_point >= AUDIO_BLOCK_FRAMES {
            return;
        }
        total -= start_point;
    }

    for mix_idx in 0..MAX_MIX_BUSES {
        for ch in 0..channels {
            let src = st.output.plane(mix_idx, ch);
            let dst = mixes.plane_mut(mix_idx, ch);
            for (d, s) in dst[start_point..].iter_mut().zip(&src[..total]) {
                *d += *s;
            }
        }
    }
}

/// Drop the samples a lagging source can no longer deliver in time.
///
/// Returns `true` when the source caught back up and should be re-rendered
/// this tick. Otherwise the source is marked pending and its timing reset.
fn ignore_audio(source: &Source, channels: usize, sample_rate: u32, start_ts: u64) -> bool {
    let mut st = source.audio_state();
    let num_frames = st.input[0].len();
    let name = source.name();

    if st.audio_ts == 0 && num_frames > 0 {
        for ch in 0..channels {
            st.input[ch].clear();
        }
        st.last_input_size = 0;
        drop(st);
        mark_restarted(source, true, num_frames, start_ts, &name);
        return false;
    }

    if num_frames > 0 {
        // Round up the number of samples to drop, plus one for residual
        // rounding drift.
        let lag = start_ts - st.audio_ts - 1;
        let mut drop_frames = mul_div64(lag, sample_rate as u64, 1_000_000_000) as usize + 1;
        if drop_frames > num_frames {
            drop_frames = num_frames;
        }

        for ch in 0..channels {
            st.input[ch].pop_front(drop_frames);
        }
        st.last_input_size = 0;
        st.audio_ts += frames_to_ns(drop_frames as u64, sample_rate);
        debug!(
            "source '{}': ignored {} samples, ts lag now {}",
            name,
            drop_frames,
            start_ts.saturating_sub(st.audio_ts)
        );

        // Rounding error, adjust.
        if st.audio_ts == start_ts - 1 {
            st.audio_ts = start_ts;
        }

        // Source is back in sync.
        if st.audio_ts >= start_ts {
            return true;
        }
        let audio_ts = st.audio_ts;
        drop(st);
        mark_restarted(source, false, num_frames, start_ts - audio_ts, &name);
        return false;
    }

    drop(st);
    mark_restarted(source, false, 0, start_ts, &name);
    false
}

fn mark_restarted(source: &Source, cleared: bool, num_frames: usize, lag_ns: u64, name: &str) {
    if cleared {
        debug!("source '{}': no timestamp but audio available, cleared", name);
    } else if !source.audio_pending() || num_frames > 0 {
        warn!(
            "Source {} audio is lagging (over by {:.02} ms) at max audio buffering. \
             Restarting source audio.",
            name,
            lag_ns as f64 / 1_000_000.0
        );
    }
    source.set_audio_pending(true);
    source.reset_timing();
}

/// Two-tick stall detection: a source with perpetually pending data whose
/// input has not grown since the last tick is considered stopped and gets
/// cleared.
fn discard_if_stopped(source: &Source, channels: usize) -> bool {
    let mut st = source.audio_state();
    let last_size = st.last_input_size;
    let size = st.input[0].len();

    if size == 0 {
        return false;
    }

    if last_size == size {
        if !st.pending_stop {
            st.pending_stop = true;
            return false;
        }

        for ch in 0..channels {
            st.input[ch].clear();
        }
        st.pending_stop = false;
        st.audio_ts = 0;
        st.last_input_size = 0;
        debug!("source '{}': audio stopped, clearing", source.name());
        true
    } else {
        st.last_input_size = size;
        false
    }
}

/// Remove the samples corresponding to the consumed tick window from a
/// source's input FIFO and advance its timestamp to the window end.
fn discard_audio(source: &Source, channels: usize, sample_rate: u32, ts: &TsWindow) {
    if source.is_composite() {
        source.audio_state().audio_ts = 0;
        return;
    }

    let mut st = source.audio_state();

    if ts.end <= st.audio_ts {
        return;
    }

    if st.audio_ts < ts.start.saturating_sub(1) {
        let pending = source.audio_pending();
        let under_block = st.input[0].len() < AUDIO_BLOCK_FRAMES;
        drop(st);
        if pending && under_block {
            discard_if_stopped(source, channels);
        }
        return;
    }

    let mut total = AUDIO_BLOCK_FRAMES;
    if st.audio_ts != ts.start && st.audio_ts != ts.start.saturating_sub(1) {
        let start_point = convert_time_to_frames(sample_rate, st.audio_ts - ts.start);
        if start_point >= AUDIO_BLOCK_FRAMES {
            return;
        }
        total -= start_point;
    }

    if st.input[0].len() < total {
        drop(st);
        if discard_if_stopped(source, channels) {
            return;
        }
        // Data still pending; skip the window but keep the samples.
        source.audio_state().audio_ts = ts.end;
        return;
    }

    for ch in 0..channels {
        st.input[ch].pop_front(total);
    }
    st.last_input_size = 0;
    st.pending_stop = false;
    st.audio_ts = ts.end;
}

/// Mark sources that cannot fill the block starting at `min_ts` as pending.
/// Returns whether the minimum must be recomputed.
fn audio_buffer_insufficient(source: &Source, sample_rate: u32, min_ts: u64) -> bool {
    if source.is_composite() || source.audio_pending() {
        return false;
    }

    let st = source.audio_state();
    if st.audio_ts == 0 {
        return false;
    }

    let mut total = AUDIO_BLOCK_FRAMES;
    if st.audio_ts != min_ts && st.audio_ts != min_ts.saturating_sub(1) {
        let start_point = convert_time_to_frames(sample_rate, st.audio_ts.saturating_sub(min_ts));
        if start_point >= AUDIO_BLOCK_FRAMES {
            return false;
        }
        total -= start_point;
    }

    if st.input[0].len() < total {
        drop(st);
        source.set_audio_pending(true);
        return true;
    }

    false
}

fn find_min_ts(sources: &[Source], min_ts: &mut u64) -> Option<String> {
    let mut buffering_source = None;
    for source in sources {
        if source.audio_pending() {
            continue;
        }
        let ts = source.audio_timestamp();
        if ts != 0 && ts < *min_ts {
            *min_ts = ts;
            buffering_source = Some(source.name());
        }
    }
    buffering_source
}

fn calc_min_ts(sources: &[Source], sample_rate: u32, min_ts: &mut u64) -> Option<String> {
    let mut buffering_name = find_min_ts(sources, min_ts);
    let recalculate = sources
        .iter()
        .fold(false, |acc, s| acc | audio_buffer_insufficient(s, sample_rate, *min_ts));
    if recalculate {
        buffering_name = find_min_ts(sources, min_ts);
    }
    buffering_name
}

/// Extend the tick window FIFO backwards so the mixer waits for the lagging
/// source instead of dropping its samples.
fn add_audio_buffering(
    state: &mut MixerState,
    sample_rate: u32,
    ts: &mut TsWindow,
    min_ts: u64,
    buffering_name: Option<&str>,
) {
    if state.total_buffering_ticks == MAX_BUFFERING_TICKS {
        return;
    }

    if state.buffering_wait_ticks == 0 {
        state.buffered_ts = ts.start;
    }

    let offset = ts.start - min_ts;
    let frames = ns_to_frames(offset, sample_rate);
    let mut ticks =
        ((frames + AUDIO_BLOCK_FRAMES as u64 - 1) / AUDIO_BLOCK_FRAMES as u64) as u32;

    state.total_buffering_ticks += ticks;

    if state.total_buffering_ticks >= MAX_BUFFERING_TICKS {
        ticks -= state.total_buffering_ticks - MAX_BUFFERING_TICKS;
        state.total_buffering_ticks = MAX_BUFFERING_TICKS;
        warn!("Max audio buffering reached!");
    }

    let ms = ticks as u64 * AUDIO_BLOCK_FRAMES as u64 * 1000 / sample_rate as u64;
    let total_ms =
        state.total_buffering_ticks as u64 * AUDIO_BLOCK_FRAMES as u64 * 1000 / sample_rate as u64;
    info!(
        "adding {} milliseconds of audio buffering, total audio buffering is now {} milliseconds \
         (source: {})",
        ms,
        total_ms,
        buffering_name.unwrap_or("unknown")
    );

    let mut new_ts = TsWindow {
        start: state.buffered_ts.saturating_sub(frames_to_ns(
            state.buffering_wait_ticks as u64 * AUDIO_BLOCK_FRAMES as u64,
            sample_rate,
        )),
        end: 0,
    };

    while ticks > 0 {
        ticks -= 1;
        state.buffering_wait_ticks += 1;
        let cur_ticks = state.buffering_wait_ticks;

        new_ts.end = new_ts.start;
        new_ts.start = state.buffered_ts.saturating_sub(frames_to_ns(
            cur_ticks as u64 * AUDIO_BLOCK_FRAMES as u64,
            sample_rate,
        ));

        state.buffered_timestamps.push_front(new_ts);
    }

    *ts = new_ts;
}

/// Run one mixer tick. Returns `(out_ts, emit)`: the effective start
/// timestamp after buffering adjustment and whether the block should be
/// emitted (held back while buffering accrues).
pub(crate) fn audio_tick(
    graph: &SourceGraph,
    state: &mut MixerState,
    mixes: &mut MixBuffers,
    start_ts_in: u64,
    end_ts_in: u64,
    sample_rate: u32,
    channels: usize,
) -> (u64, bool) {
    state.buffered_timestamps.push_back(TsWindow {
        start: start_ts_in,
        end: end_ts_in,
    });
    let mut ts = state
        .buffered_timestamps
        .front()
        .copied()
        .unwrap_or(TsWindow {
            start: start_ts_in,
            end: end_ts_in,
        });
    let mut min_ts = ts.start;

    // Build the render order: every distinct descendant of each active root,
    // children before parents, then every registered audio source.
    let mut render_order: Vec<Source> = Vec::new();
    let mut root_nodes: Vec<Source> = Vec::new();
    for root in graph.root_sources() {
        root.enum_active_tree(&mut |child| push_unique(&mut render_order, child));
        push_unique(&mut render_order, &root);
        root_nodes.push(root);
    }

    let audio_sources = graph.audio_sources();
    for source in &audio_sources {
        push_unique(&mut render_order, source);
    }

    // Render audio data.
    for source in &render_order {
        source.audio_render(u32::MAX, channels, sample_rate);

        // If a source has gone backward in time and we can no longer
        // buffer, drop some or all of its audio.
        if state.total_buffering_ticks == MAX_BUFFERING_TICKS
            && source.audio_timestamp() < ts.start
        {
            if source.is_composite() {
                debug!(
                    "composite source '{}' timestamp has gone backwards",
                    source.name()
                );
                // Just avoid further damage.
                source.set_audio_pending(true);
            } else if ignore_audio(source, channels, sample_rate, ts.start) {
                // Potentially recovered; re-render.
                source.audio_render(u32::MAX, channels, sample_rate);
            }
        }
    }

    // Get the minimum audio timestamp.
    let buffering_name = calc_min_ts(&audio_sources, sample_rate, &mut min_ts);

    // If a source has gone backward in time, buffer.
    if min_ts < ts.start {
        add_audio_buffering(state, sample_rate, &mut ts, min_ts, buffering_name.as_deref());
    }

    // Mix audio.
    if state.buffering_wait_ticks == 0 {
        for root in &root_nodes {
            if root.audio_pending() {
                continue;
            }
            mix_source_output(mixes, root, channels, sample_rate, &ts);
        }
    }

    // Discard the consumed window from every audio source.
    for source in &audio_sources {
        discard_audio(source, channels, sample_rate, &ts);
    }

    state.buffered_timestamps.pop_front();

    let out_ts = ts.start;
    if state.buffering_wait_ticks > 0 {
        state.buffering_wait_ticks -= 1;
        (out_ts, false)
    } else {
        (out_ts, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SOURCE_AUDIO;
    use cindercast_plugin_api::AudioBlockData;

    const RATE: u32 = 48_000;
    const BLOCK_NS: u64 = 21_333_333;

    fn setup() -> (SourceGraph, MixerState, MixBuffers) {
        (SourceGraph::new(), MixerState::new(), MixBuffers::new(2))
    }

    fn push_audio(source: &Source, ts: u64, frames: u32, value: f32) {
        source.output_audio(&AudioBlockData {
            planes: vec![vec![value; frames as usize]; 2],
            frames,
            timestamp: ts,
        });
    }

    fn tick(
        graph: &SourceGraph,
        state: &mut MixerState,
        mixes: &mut MixBuffers,
        start: u64,
    ) -> (u64, bool) {
        mixes.zero();
        audio_tick(graph, state, mixes, start, start + BLOCK_NS, RATE, 2)
    }

    #[test]
    fn up_to_date_source_is_mixed_and_consumed() {
        let (graph, mut state, mut mixes) = setup();
        let source = Source::new("tone", SOURCE_AUDIO, 2, RATE, None);
        graph.register_audio_source(&source);
        graph.set_root_source(0, Some(source.clone()));

        push_audio(&source, 1_000, 2048, 0.25);
        // Window aligned to the source timestamp.
        let (out_ts, emit) = tick(&graph, &mut state, &mut mixes, 1_000);

        assert!(emit);
        assert_eq!(out_ts, 1_000);
        assert_eq!(mixes.plane(0, 0)[0], 0.25);
        // Exactly one block consumed (P3).
        assert_eq!(source.audio_state().input[0].len(), 1024);
        assert_eq!(source.audio_timestamp(), 1_000 + BLOCK_NS);
    }

    #[test]
    fn lagging_source_adds_bounded_buffering() {
        let (graph, mut state, mut mixes) = setup();
        let source = Source::new("late", SOURCE_AUDIO, 2, RATE, None);
        graph.register_audio_source(&source);
        graph.set_root_source(0, Some(source.clone()));

        // Source is 40ms behind the tick window: ceil(40ms / 21.33ms) = 2
        // buffering ticks.
        let lag_ns = 40_000_000;
        push_audio(&source, 100_000_000 - lag_ns, 4096, 0.5);
        let (_, emit) = tick(&graph, &mut state, &mut mixes, 100_000_000);

        assert!(!emit);
        assert_eq!(state.total_buffering_ticks, 2);
        // One held tick consumed, one remaining.
        assert_eq!(state.buffering_wait_ticks, 1);

        // The next tick drains the remaining wait; emission resumes on the
        // one after.
        let (_, emit) = tick(&graph, &mut state, &mut mixes, 100_000_000 + BLOCK_NS);
        assert!(!emit);
        let (_, emit) = tick(&graph, &mut state, &mut mixes, 100_000_000 + 2 * BLOCK_NS);
        assert!(emit);
        // Buffering total never exceeded the cap (P4).
        assert!(state.total_buffering_ticks <= MAX_BUFFERING_TICKS);
    }

    #[test]
    fn buffering_total_is_capped() {
        let (graph, mut state, mut mixes) = setup();
        let source = Source::new("very-late", SOURCE_AUDIO, 2, RATE, None);
        graph.register_audio_source(&source);
        graph.set_root_source(0, Some(source.clone()));

        // Two full seconds of lag would want ~94 ticks of buffering.
        push_audio(&source, 1_000_000, 1024, 0.5);
        let (_, emit) = tick(&graph, &mut state, &mut mixes, 2_000_000_000);

        assert!(!emit);
        assert_eq!(state.total_buffering_ticks, MAX_BUFFERING_TICKS);
    }

    #[test]
    fn stalled_source_is_cleared() {
        let (graph, mut state, mut mixes) = setup();
        let source = Source::new("stalled", SOURCE_AUDIO, 2, RATE, None);
        graph.register_audio_source(&source);
        graph.set_root_source(0, Some(source.clone()));

        // Not enough for a full block and never growing: one tick latches
        // the size, one arms the pending stop, one clears.
        push_audio(&source, 1_000, 100, 0.5);
        source.set_audio_pending(true);

        let start = 1_000 + 10 * BLOCK_NS;
        tick(&graph, &mut state, &mut mixes, start);
        tick(&graph, &mut state, &mut mixes, start + BLOCK_NS);
        assert!(!source.audio_state().input[0].is_empty());
        tick(&graph, &mut state, &mut mixes, start + 2 * BLOCK_NS);
        assert!(source.audio_state().input[0].is_empty());
        assert_eq!(source.audio_timestamp(), 0);
    }

    #[test]
    fn lagging_past_cap_restarts_source() {
        let (graph, mut state, mut mixes) = setup();
        let source = Source::new("dead", SOURCE_AUDIO, 2, RATE, None);
        graph.register_audio_source(&source);
        graph.set_root_source(0, Some(source.clone()));
        state.total_buffering_ticks = MAX_BUFFERING_TICKS;

        // Hopelessly behind with only a sliver of data.
        push_audio(&source, 1_000, 128, 0.5);
        tick(&graph, &mut state, &mut mixes, 10_000_000_000);

        assert!(source.audio_pending());
        assert_eq!(source.audio_timestamp(), 0);
        let st = source.audio_state();
        assert!(!st.timing_set);
    }
}
