// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Packet interleaving.
//!
//! Packets from every encoder slot are normalised to a common origin,
//! pruned of early out-of-phase data, and emitted in `dts_usec` order. A
//! packet is only emitted once every other channel has a queued packet with
//! a strictly higher timestamp, which keeps delivery monotonic across
//! channels.
//!
//! Offsets and running highest timestamps are kept per audio track (not
//! globally) so multiple audio encoders with different first-packet times
//! cannot underflow the bookkeeping.

use std::collections::VecDeque;
use tracing::{debug, warn};

use cindercast_plugin_api::EncoderKind;

use crate::output::keyframes::{self, KeyframeGroupData};
use crate::output::Output;
use crate::packet::{Packet, PacketTime};
use crate::util::time::now_ns;
use crate::{MAX_OUTPUT_AUDIO_TRACKS, MAX_OUTPUT_VIDEO_TRACKS};

/// Per-output interleaver state, guarded by the output's interleave mutex.
pub(crate) struct InterleaveState {
    pub(crate) packets: Vec<Packet>,
    pub(crate) packet_times: Vec<VecDeque<PacketTime>>,
    pub(crate) received_video: Vec<bool>,
    pub(crate) received_audio: Vec<bool>,
    pub(crate) video_offsets: Vec<i64>,
    pub(crate) audio_offsets: Vec<i64>,
    pub(crate) highest_video_ts: Vec<i64>,
    pub(crate) highest_audio_ts: Vec<i64>,
    pub(crate) keyframe_groups: Vec<KeyframeGroupData>,
    pub(crate) max_batch_size: usize,
}

impl InterleaveState {
    pub(crate) fn new() -> Self {
        Self {
            packets: Vec::new(),
            packet_times: (0..MAX_OUTPUT_VIDEO_TRACKS).map(|_| VecDeque::new()).collect(),
            received_video: vec![false; MAX_OUTPUT_VIDEO_TRACKS],
            received_audio: vec![false; MAX_OUTPUT_AUDIO_TRACKS],
            video_offsets: vec![0; MAX_OUTPUT_VIDEO_TRACKS],
            audio_offsets: vec![0; MAX_OUTPUT_AUDIO_TRACKS],
            highest_video_ts: vec![0; MAX_OUTPUT_VIDEO_TRACKS],
            highest_audio_ts: vec![0; MAX_OUTPUT_AUDIO_TRACKS],
            keyframe_groups: Vec::new(),
            max_batch_size: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        let batch = self.max_batch_size;
        *self = Self::new();
        self.max_batch_size = batch;
    }
}

fn find_first_packet_idx(st: &InterleaveState, kind: EncoderKind, track: usize) -> Option<usize> {
    st.packets
        .iter()
        .position(|p| p.kind == kind && p.track_idx == track)
}

fn find_last_packet_idx(st: &InterleaveState, kind: EncoderKind, track: usize) -> Option<usize> {
    st.packets
        .iter()
        .rposition(|p| p.kind == kind && p.track_idx == track)
}

fn set_higher_ts(st: &mut InterleaveState, kind: EncoderKind, track: usize, dts_usec: i64) {
    match kind {
        EncoderKind::Video => {
            if st.highest_video_ts[track] < dts_usec {
                st.highest_video_ts[track] = dts_usec;
            }
        }
        EncoderKind::Audio => {
            if st.highest_audio_ts[track] < dts_usec {
                st.highest_audio_ts[track] = dts_usec;
            }
        }
    }
}

/// A packet is safe to emit only when every other channel holds a packet
/// with a strictly higher timestamp.
fn has_higher_opposing_ts(output: &Output, st: &InterleaveState, packet: &Packet) -> bool {
    for (i, present) in output.video_track_presence().iter().enumerate() {
        if !present || (packet.kind == EncoderKind::Video && i == packet.track_idx) {
            continue;
        }
        if st.highest_video_ts[i] <= packet.dts_usec {
            return false;
        }
    }
    for (i, present) in output.audio_track_presence().iter().enumerate() {
        if !present || (packet.kind == EncoderKind::Audio && i == packet.track_idx) {
            continue;
        }
        if st.highest_audio_ts[i] <= packet.dts_usec {
            return false;
        }
    }
    true
}

fn count_streamable_packets(output: &Output, st: &InterleaveState) -> usize {
    let mut eligible = 0;
    for packet in &st.packets {
        if !has_higher_opposing_ts(output, st, packet) {
            break;
        }
        eligible += 1;
    }
    eligible
}

/// Subtract the captured session offset and recompute the microsecond dts.
fn apply_packet_offset(st: &InterleaveState, packet: &mut Packet, time: Option<&mut PacketTime>) {
    // Audio and video need to start at timestamp 0; the encoders may not be
    // at 0 when data first arrives, so the first dts of the session is
    // stored and subtracted from every packet.
    let offset = match packet.kind {
        EncoderKind::Video => st.video_offsets[packet.track_idx],
        EncoderKind::Audio => st.audio_offsets[packet.track_idx],
    };

    packet.dts -= offset;
    packet.pts -= offset;
    if let Some(time) = time {
        time.pts -= offset;
    }
    packet.dts_usec = packet.dts_usec_from_timebase();
}

fn check_received(st: &mut InterleaveState, packet: &Packet) {
    match packet.kind {
        EncoderKind::Video => st.received_video[packet.track_idx] = true,
        EncoderKind::Audio => st.received_audio[packet.track_idx] = true,
    }
}

/// dts order; same-dts video packets order by track index so pruning never
/// removes additional video tracks; same-dts video-vs-audio puts video
/// first.
fn insert_packet(st: &mut InterleaveState, packet: Packet) {
    let mut idx = 0;
    while idx < st.packets.len() {
        let cur = &st.packets[idx];

        if packet.dts_usec == cur.dts_usec
            && packet.kind == EncoderKind::Video
            && cur.kind == EncoderKind::Video
            && packet.track_idx > cur.track_idx
        {
            idx += 1;
            continue;
        }

        if packet.dts_usec == cur.dts_usec && packet.kind == EncoderKind::Video {
            break;
        } else if packet.dts_usec < cur.dts_usec {
            break;
        }
        idx += 1;
    }
    st.packets.insert(idx, packet);
}

fn discard_to_idx(st: &mut InterleaveState, idx: usize) {
    for packet in st.packets.drain(..idx) {
        if packet.kind == EncoderKind::Video {
            st.packet_times[packet.track_idx].pop_front();
        }
    }
}

/// Drop queued audio that predates a video packet we are discarding while
/// waiting for a keyframe.
fn discard_unused_audio_packets(st: &mut InterleaveState, dts_usec: i64) {
    let idx = st
        .packets
        .iter()
        .position(|p| p.dts_usec >= dts_usec)
        .unwrap_or(st.packets.len());
    if idx > 0 {
        discard_to_idx(st, idx);
    }
}

/// Locate the point where audio and video are closest together, preserving
/// leading priming packets (`pts <= 0`) that carry codec warm-up silence.
fn get_interleaved_start_idx(output: &Output, st: &InterleaveState) -> usize {
    let Some(first_video_slot) = output.first_video_track() else {
        return 0;
    };
    let Some(video_idx) = find_first_packet_idx(st, EncoderKind::Video, first_video_slot) else {
        return 0;
    };
    let video_dts = st.packets[video_idx].dts_usec;

    let mut closest_diff = i64::MAX;
    let mut idx = 0;
    for (i, packet) in st.packets.iter().enumerate() {
        if packet.kind != EncoderKind::Audio {
            continue;
        }
        let diff = (packet.dts_usec - video_dts).abs();
        if diff < closest_diff {
            closest_diff = diff;
            idx = i;
        }
    }

    idx = idx.min(video_idx);

    // Early AAC/Opus packets are for "priming" the encoder and contain
    // silence, but they should not be discarded. Back up to the first audio
    // packet when the closest one still has pts <= 0.
    let first_audio_after = st.packets[idx..]
        .iter()
        .position(|p| p.kind == EncoderKind::Audio)
        .map(|off| idx + off);
    if let Some(first_audio_idx) = first_audio_after {
        if st.packets[first_audio_idx].pts <= 0 {
            for track in 0..MAX_OUTPUT_AUDIO_TRACKS {
                if let Some(audio_idx) = find_first_packet_idx(st, EncoderKind::Audio, track) {
                    idx = idx.min(audio_idx);
                }
            }
        }
    }

    idx
}

/// Find the prune point for audio that leads video by more than one frame.
/// Returns `None` when no sync point can be found yet.
fn prune_premature_packets(output: &Output, st: &mut InterleaveState) -> Option<usize> {
    let first_video_slot = output.first_video_track()?;
    let video_idx = find_first_packet_idx(st, EncoderKind::Video, first_video_slot)?;
    let mut duration_usec = st.packets[video_idx].interval_usec();

    let mut max_idx = video_idx;
    let mut max_diff = 0i64;
    let mut max_audio_duration_usec = 0i64;
    let mut audio_encoders = 0;

    for (track, present) in output.audio_track_presence().iter().enumerate() {
        if !present {
            continue;
        }
        audio_encoders += 1;

        let Some(audio_idx) = find_first_packet_idx(st, EncoderKind::Audio, track) else {
            st.received_audio[track] = false;
            return None;
        };

        let audio = &st.packets[audio_idx];
        max_idx = max_idx.max(audio_idx);
        max_diff = max_diff.max(audio.dts_usec - st.packets[video_idx].dts_usec);

        let audio_duration = output
            .audio_encoder(track)
            .map(|encoder| encoder.packet_interval_usec())
            .unwrap_or(0);
        max_audio_duration_usec = max_audio_duration_usec.max(audio_duration);
    }

    // With several audio encoders running out of phase, a high video frame
    // rate can make the video duration smaller than the phase difference,
    // preventing a sync point from ever being found. Give up on a tight
    // video sync in that case.
    if audio_encoders > 1 && duration_usec < max_audio_duration_usec {
        duration_usec = max_audio_duration_usec;
    }

    Some(if max_diff > duration_usec { max_idx + 1 } else { 0 })
}

fn prune_interleaved_packets(output: &Output, st: &mut InterleaveState) -> bool {
    let Some(prune_start) = prune_premature_packets(output, st) else {
        return false;
    };

    let start_idx = if prune_start != 0 {
        prune_start
    } else {
        get_interleaved_start_idx(output, st)
    };

    if start_idx > 0 {
        discard_to_idx(st, start_idx);
    }
    true
}

fn get_audio_and_video_heads(
    output: &Output,
    st: &mut InterleaveState,
) -> Option<(Vec<Option<usize>>, Vec<Option<usize>>)> {
    let mut video = vec![None; MAX_OUTPUT_VIDEO_TRACKS];
    let mut audio = vec![None; MAX_OUTPUT_AUDIO_TRACKS];
    let mut found_video = false;

    for (track, present) in output.video_track_presence().iter().enumerate() {
        if !present {
            continue;
        }
        match find_first_packet_idx(st, EncoderKind::Video, track) {
            Some(idx) => {
                video[track] = Some(idx);
                found_video = true;
            }
            None => {
                st.received_video[track] = false;
                return None;
            }
        }
    }

    for (track, present) in output.audio_track_presence().iter().enumerate() {
        if !present {
            continue;
        }
        match find_first_packet_idx(st, EncoderKind::Audio, track) {
            Some(idx) => audio[track] = Some(idx),
            None => {
                st.received_audio[track] = false;
                return None;
            }
        }
    }

    found_video.then_some((video, audio))
}

/// Session start: prune, pick the start point, capture offsets and
/// renormalise everything queued.
fn initialize_interleaved_packets(output: &Output, st: &mut InterleaveState) -> bool {
    let Some(first_video_slot) = output.first_video_track() else {
        return false;
    };

    let Some((video, _audio)) = get_audio_and_video_heads(output, st) else {
        return false;
    };

    // Ensure there is audio past the first video packet on every track.
    let Some(video_head) = video[first_video_slot] else {
        return false;
    };
    let video_head_dts = st.packets[video_head].dts_usec;
    for (track, present) in output.audio_track_presence().iter().enumerate() {
        if !present {
            continue;
        }
        let Some(last) = find_last_packet_idx(st, EncoderKind::Audio, track) else {
            st.received_audio[track] = false;
            return false;
        };
        if st.packets[last].dts_usec < video_head_dts {
            st.received_audio[track] = false;
            return false;
        }
    }

    // Clear out excess starting audio if it hasn't been already.
    let start_idx = get_interleaved_start_idx(output, st);
    if start_idx > 0 {
        discard_to_idx(st, start_idx);
    }
    let Some((video, audio)) = get_audio_and_video_heads(output, st) else {
        return false;
    };

    // Capture new offsets.
    for (track, head) in video.iter().enumerate() {
        if let Some(idx) = head {
            st.video_offsets[track] = st.packets[*idx].pts;
        }
    }
    for (track, head) in audio.iter().enumerate() {
        if let Some(idx) = head {
            if st.packets[*idx].dts > 0 {
                st.audio_offsets[track] = st.packets[*idx].dts;
            }
        }
    }

    // Rebase the running highest timestamps so later monotonicity checks
    // stay valid. Kept per track: a global subtraction would underflow with
    // several audio encoders at different first-packet times.
    for (track, head) in audio.iter().enumerate() {
        if let Some(idx) = head {
            st.highest_audio_ts[track] -= st.packets[*idx].dts_usec;
        }
    }

    // Apply the new offsets to every queued packet.
    let mut packets = std::mem::take(&mut st.packets);
    for packet in &mut packets {
        apply_packet_offset(st, packet, None);
    }
    st.packets = packets;

    true
}

fn resort_interleaved_packets(st: &mut InterleaveState) {
    let old = std::mem::take(&mut st.packets);
    for packet in old {
        set_higher_ts(st, packet.kind, packet.track_idx, packet.dts_usec);
        insert_packet(st, packet);
    }
}

fn apply_packet_time_offsets(st: &mut InterleaveState) {
    for track in 0..MAX_OUTPUT_VIDEO_TRACKS {
        let offset = st.video_offsets[track];
        for time in st.packet_times[track].iter_mut() {
            time.pts -= offset;
        }
    }
}

/// Pop and deliver the head packet: captions, timing attach, packet
/// callbacks, then the output writer.
fn send_interleaved(output: &Output, st: &mut InterleaveState) {
    if st.packets.is_empty() {
        return;
    }
    let mut out = st.packets.remove(0);
    let mut found_time: Option<PacketTime> = None;

    if out.kind == EncoderKind::Video {
        output.bump_total_frames();
        crate::output::caption::try_insert_caption(output, &mut out);

        let times = &mut st.packet_times[out.track_idx];
        if times.is_empty() {
            debug!(
                "track {} encoder packet timing array empty",
                out.track_idx
            );
        } else if let Some(pos) = times.iter().position(|t| t.pts == out.pts) {
            found_time = times.remove(pos);
        } else {
            debug!(
                "track {} encoder packet timing for pts {} not found",
                out.track_idx, out.pts
            );
        }
    }

    output.run_packet_callbacks(&out, found_time.map(|mut time| {
        time.pir = now_ns();
        time
    }));

    output.write_packet(&out);
}

/// Packet admission: the entry point for packets delivered by encoders.
pub(crate) fn interleave_packet(
    output: &Output,
    mut packet: Packet,
    packet_time: Option<PacketTime>,
) {
    if !output.active() {
        return;
    }

    let Some(track_idx) = output.encoder_track_index(&packet) else {
        warn!("packet from unknown encoder dropped");
        return;
    };
    packet.track_idx = track_idx;

    let shared = output.shared();
    let mut st = shared.interleave.lock();

    // If the first video frame is not a keyframe, discard until one is
    // received.
    if packet.kind == EncoderKind::Video
        && !st.received_video[packet.track_idx]
        && !packet.keyframe
    {
        discard_unused_audio_packets(&mut st, packet.dts_usec);
        return;
    }

    keyframes::check_group_keyframe_alignment(output, &mut st.keyframe_groups, &packet);

    let was_started = output.all_tracks_received(&st);

    let mut stored_time = packet_time;
    if was_started {
        apply_packet_offset(&st, &mut packet, stored_time.as_mut());
    } else {
        check_received(&mut st, &packet);
    }

    if packet.kind == EncoderKind::Video {
        if let Some(time) = stored_time {
            st.packet_times[packet.track_idx].push_back(time);
        }
    }

    let summary = (packet.kind, packet.track_idx, packet.dts_usec);
    insert_packet(&mut st, packet);

    // When both video and audio have been received we're ready to start
    // sending out packets, one at a time.
    if output.all_tracks_received(&st) {
        if !was_started {
            if prune_interleaved_packets(output, &mut st)
                && initialize_interleaved_packets(output, &mut st)
            {
                resort_interleaved_packets(&mut st);
                apply_packet_time_offsets(&mut st);
                send_interleaved(output, &mut st);
            }
        } else {
            set_higher_ts(&mut st, summary.0, summary.1, summary.2);

            let mut streamable = count_streamable_packets(output, &st);
            if streamable > 0 {
                send_interleaved(output, &mut st);

                // If more eligible packets are queued than there normally
                // should be, send one additional packet to drain.
                streamable -= 1;
                if streamable > st.max_batch_size {
                    send_interleaved(output, &mut st);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::test_engine;
    use crate::output::{OUTPUT_AUDIO, OUTPUT_ENCODED, OUTPUT_VIDEO};
    use crate::testutil::{pcm_block, test_video_frame, MockCodecFactory, RecordingWriter};
    use cindercast_plugin_api::Settings;

    const FRAME_NS: u64 = 33_333_333;

    /// Early audio packets with `pts <= 0` carry codec warm-up silence and
    /// survive the session-start pruning even though they predate the sync
    /// point.
    #[test]
    fn priming_audio_packets_are_preserved() {
        let engine = test_engine();
        engine.register_codec(MockCodecFactory::video("mock-h264"));
        engine.register_codec(MockCodecFactory::audio_with_priming("mock-aac", 1024, 2));

        let venc = engine
            .create_video_encoder("mock-h264", "v0", Settings::new())
            .unwrap();
        let aenc = engine
            .create_audio_encoder("mock-aac", "a0", Settings::new(), 0)
            .unwrap();

        let (writer, log) = RecordingWriter::new();
        let output = crate::output::Output::new(
            &engine,
            "rec",
            OUTPUT_VIDEO | OUTPUT_AUDIO | OUTPUT_ENCODED,
            Box::new(writer),
            Settings::new(),
        );
        output.set_video_encoder(Some(venc));
        output.set_audio_encoder(Some(aenc), 0);
        output.start().unwrap();

        // Audio first so the pair gate opens, then interleaved feeding.
        let source = engine.create_source("tone", crate::source::SOURCE_AUDIO);
        engine.set_root_source(0, Some(source.clone()));

        let block_ns = engine.audio().block_ns();
        let mut audio_ts = 1u64;
        let mut push_tick = |ts: u64| {
            source.output_audio(&pcm_block(ts, 1024, 0.5));
            engine.tick_audio(ts, ts + block_ns);
        };
        push_tick(audio_ts);
        audio_ts += block_ns;

        for i in 0..20u64 {
            engine.video().submit_frame(&test_video_frame(i * FRAME_NS));
            while audio_ts < (i + 2) * FRAME_NS {
                push_tick(audio_ts);
                audio_ts += block_ns;
            }
        }

        let packets = log.packets.lock();
        assert!(!packets.is_empty());

        // The priming packets (pts <= 0 before renormalisation) were kept:
        // the audio track starts at its negative-offset packet rather than
        // the one closest to video.
        let first_audio = packets
            .iter()
            .find(|p| p.kind == cindercast_plugin_api::EncoderKind::Audio)
            .expect("audio packets delivered");
        assert!(
            first_audio.pts < 0,
            "first audio pts {} should be a preserved priming packet",
            first_audio.pts
        );

        // Delivery stayed monotonic regardless (P1).
        assert!(packets.windows(2).all(|w| w[0].dts_usec <= w[1].dts_usec));
    }
}
