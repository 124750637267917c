// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The raw → packet flow: frame intake gates, the encode call, and packet
//! post-processing out to subscribers.
//!
//! Video frames pass three gates in order: the group gate (the frame must
//! match the group's latched start timestamp), the pair gate (every paired
//! encoder must have received raw data at or before this frame), and the
//! pause gate. Audio blocks buffer until the paired video encoder's start
//! point is known, then trim to it.

use bytes::Bytes;
use std::sync::atomic::Ordering;
use tracing::{debug, error};

use cindercast_plugin_api::{
    AudioBlockData, CodecPacket, EncoderFrame, EncoderKind, FrameData, VideoFrameData,
};

use crate::encoder::Encoder;
use crate::packet::{Packet, PacketTime};
use crate::util::time::{frames_to_ns, now_ns, ns_to_frames};

/// Video raw-frame entry point, called on the video feed thread.
pub(crate) fn receive_video(encoder: &Encoder, frame: &VideoFrameData) {
    let shared = &encoder.inner;

    let (start_ts, first_received) = {
        let run = shared.run.lock();
        (run.start_ts, run.first_received)
    };

    // Group gate first, pair gate second: a grouped encoder ignores frames
    // until its group's latched timestamp arrives, even if its paired
    // encoders are already flowing.
    if start_ts == 0 {
        if let Some(group) = encoder.encoder_group() {
            if group.start_timestamp() != frame.timestamp {
                return;
            }
        }
    }

    if !first_received {
        let paired = shared.paired.lock().clone();
        for weak in paired {
            let Some(paired_encoder) = weak.upgrade() else {
                continue;
            };
            let paired_run = paired_encoder.inner.run.lock();
            if !paired_run.first_received || paired_run.first_raw_ts > frame.timestamp {
                return;
            }
        }
    }

    if shared.pause.video_pause_check(frame.timestamp) {
        return;
    }

    let pts = {
        let mut run = shared.run.lock();
        if run.start_ts == 0 {
            run.start_ts = frame.timestamp;
        }
        run.cur_pts
    };

    let enc_frame = EncoderFrame {
        data: FrameData::Video {
            planes: frame.planes.clone(),
            linesize: frame.linesize.clone(),
        },
        frames: 1,
        pts,
    };

    if do_encode(encoder, &enc_frame, Some(frame.timestamp)) {
        let (timebase_num, _) = *shared.timebase.lock();
        let divisor = shared.frame_rate_divisor.load(Ordering::Relaxed);
        shared.run.lock().cur_pts += (timebase_num * divisor) as i64;
    }
}

/// Audio block entry point, called on the mixer thread.
pub(crate) fn receive_audio(encoder: &Encoder, block: &AudioBlockData) {
    let shared = &encoder.inner;
    let mut audio = block.clone();

    {
        let mut run = shared.run.lock();
        if !run.first_received {
            run.first_raw_ts = audio.timestamp;
            run.first_received = true;
            for plane in run.audio_input.iter_mut() {
                plane.clear();
            }
        }
    }

    if shared.pause.audio_pause_check(&mut audio, shared.sample_rate) {
        return;
    }

    if !buffer_audio(encoder, &audio) {
        return;
    }

    let framesize = shared.framesize.load(Ordering::Relaxed) as usize;
    loop {
        let ready = shared.run.lock().audio_input[0].len() >= framesize;
        if !ready || !send_audio_data(encoder) {
            break;
        }
    }
}

fn calc_offset_samples(sample_rate: u32, v_start_ts: u64, a_start_ts: u64) -> usize {
    ns_to_frames(v_start_ts - a_start_ts, sample_rate) as usize
}

/// Re-seed the input FIFO from pre-start buffered samples, trimming
/// whatever precedes the video start point.
fn start_from_buffer(run: &mut crate::encoder::RunState, sample_rate: u32, v_start_ts: u64) {
    let offset = if run.first_raw_ts < v_start_ts {
        calc_offset_samples(sample_rate, v_start_ts, run.first_raw_ts)
    } else {
        0
    };

    for plane in run.audio_input.iter_mut() {
        let samples = plane.take_all();
        if offset < samples.len() {
            plane.push_back(&samples[offset..]);
        }
    }
}

/// Buffer incoming PCM, aligning the start point with the paired video
/// encoder. Returns `false` while audio must keep waiting for video.
fn buffer_audio(encoder: &Encoder, data: &AudioBlockData) -> bool {
    let shared = &encoder.inner;
    let mut offset_samples = 0usize;
    let mut success = true;

    // Audio encoders can only be paired to one video encoder.
    let paired = shared
        .paired
        .lock()
        .first()
        .and_then(|weak| weak.upgrade());

    let mut run = shared.run.lock();

    if run.start_ts == 0 {
        if let Some(paired_encoder) = &paired {
            let v_start_ts = paired_encoder.inner.run.lock().start_ts;

            if v_start_ts == 0 {
                // No video yet, so don't start audio.
                success = false;
            } else {
                let end_ts =
                    data.timestamp + frames_to_ns(data.frames as u64, shared.sample_rate);
                if end_ts <= v_start_ts {
                    // Entirely before the sync point.
                    success = false;
                } else {
                    if data.timestamp < v_start_ts {
                        offset_samples =
                            calc_offset_samples(shared.sample_rate, v_start_ts, data.timestamp);
                    }
                    if data.timestamp <= v_start_ts {
                        for plane in run.audio_input.iter_mut() {
                            plane.clear();
                        }
                    }

                    run.start_ts = v_start_ts;

                    // Use previously buffered audio instead.
                    if v_start_ts < data.timestamp {
                        start_from_buffer(&mut run, shared.sample_rate, v_start_ts);
                    }
                }
            }
        } else {
            run.start_ts = data.timestamp;
        }
    }

    let channels = run.audio_input.len();
    for ch in 0..channels {
        let plane = data.planes.get(ch).or_else(|| data.planes.first());
        if let Some(plane) = plane {
            let from = offset_samples.min(plane.len());
            run.audio_input[ch].push_back(&plane[from..]);
        }
    }

    success
}

/// Pop one codec frame's worth of samples and encode it.
fn send_audio_data(encoder: &Encoder) -> bool {
    let shared = &encoder.inner;
    let framesize = shared.framesize.load(Ordering::Relaxed) as usize;

    let (planes, pts) = {
        let mut run = shared.run.lock();
        let mut planes = Vec::with_capacity(run.audio_input.len());
        for plane in run.audio_input.iter_mut() {
            let mut samples = vec![0.0f32; framesize];
            plane.pop_front_into(&mut samples);
            planes.push(samples);
        }
        (planes, run.cur_pts)
    };

    let frame = EncoderFrame {
        data: FrameData::Audio { planes },
        frames: framesize as u32,
        pts,
    };

    if !do_encode(encoder, &frame, None) {
        return false;
    }

    shared.run.lock().cur_pts += framesize as i64;
    true
}

/// Run one encode: apply any pending reconfigure, time the codec call,
/// record the timing entry and send off whatever packet came back.
/// Returns `false` on codec failure (after the full stop has run).
pub(crate) fn do_encode(
    encoder: &Encoder,
    frame: &EncoderFrame,
    frame_cts: Option<u64>,
) -> bool {
    let shared = &encoder.inner;

    if shared.reconfigure_requested.swap(false, Ordering::AcqRel) {
        let settings = shared.settings.lock().clone();
        let mut codec = shared.codec.lock();
        if let Some(codec) = codec.as_mut() {
            if let Err(err) = codec.update(&settings) {
                error!("encoder '{}': update failed: {}", encoder.name(), err);
            }
        }
    }

    let fer = now_ns();
    let result = {
        let mut codec = shared.codec.lock();
        match codec.as_mut() {
            Some(codec) => codec.encode(frame),
            None => return false,
        }
    };

    if let Some(cts) = frame_cts {
        let ferc = if result.is_ok() { now_ns() } else { 0 };
        shared.run.lock().packet_times.push_back(PacketTime {
            pts: frame.pts,
            cts,
            fer,
            ferc,
            pir: 0,
        });
    }

    match result {
        Ok(packet) => {
            send_off_packet(encoder, packet);
            true
        }
        Err(err) => {
            error!("Error encoding with encoder '{}': {}", encoder.name(), err);
            encoder.set_last_error(err.to_string());
            full_stop(encoder);
            false
        }
    }
}

/// Normalise a received packet and deliver it to every subscriber.
fn send_off_packet(encoder: &Encoder, packet: Option<CodecPacket>) {
    let Some(codec_packet) = packet else {
        // The codec needs more input.
        return;
    };
    let shared = &encoder.inner;

    let (timebase_num, timebase_den) = *shared.timebase.lock();
    let divisor = match shared.kind {
        EncoderKind::Video => shared.frame_rate_divisor.load(Ordering::Relaxed),
        EncoderKind::Audio => 1,
    };

    let mut pkt = Packet {
        kind: shared.kind,
        track_idx: 0,
        data: codec_packet.data,
        pts: codec_packet.pts,
        dts: codec_packet.dts,
        timebase_num: timebase_num * divisor,
        timebase_den,
        dts_usec: 0,
        sys_dts_usec: 0,
        keyframe: codec_packet.keyframe,
        priority: codec_packet.priority,
        encoder: Some(encoder.downgrade()),
    };

    let matched_time = {
        let mut run = shared.run.lock();

        if !run.first_received {
            run.offset_usec = pkt.dts_usec_from_timebase();
            run.first_received = true;
        }

        // System time keeps separately-started encoders in sync; relative
        // timestamps would not.
        pkt.dts_usec = run.start_ts as i64 / 1000 + pkt.dts_usec_from_timebase() - run.offset_usec;
        pkt.sys_dts_usec = pkt.dts_usec + shared.pause.offset_ns() as i64 / 1000;

        if shared.kind == EncoderKind::Video {
            // Most recent frames first: tail-first keeps the match O(1) in
            // the common case.
            let mut matched = None;
            for i in (0..run.packet_times.len()).rev() {
                if run.packet_times[i].pts == pkt.pts {
                    matched = run.packet_times.remove(i);
                    break;
                }
            }
            if matched.is_none() {
                debug!(
                    "encoder '{}': packet timing for pts {} not found",
                    encoder.name(),
                    pkt.pts
                );
            }
            matched
        } else {
            None
        }
    };

    let mut callbacks = shared.callbacks.lock();
    for cb in callbacks.iter_mut().rev() {
        if shared.kind == EncoderKind::Video && !cb.sent_first_packet {
            // Always wait for the first keyframe.
            if !pkt.keyframe {
                continue;
            }
            send_first_video_packet(encoder, cb, &pkt, matched_time.as_ref());
        } else {
            (cb.callback)(&pkt, matched_time.as_ref());
        }
    }
    drop(callbacks);

    if shared.kind == EncoderKind::Video {
        shared.encoded_frames.fetch_add(1, Ordering::Relaxed);
    }
}

/// The first video packet per subscriber carries the codec's SEI payload
/// prepended to the frame data.
fn send_first_video_packet(
    encoder: &Encoder,
    cb: &mut crate::encoder::EncoderCallback,
    packet: &Packet,
    packet_time: Option<&PacketTime>,
) {
    let sei = encoder
        .inner
        .codec
        .lock()
        .as_ref()
        .and_then(|codec| codec.sei_data());

    match sei {
        Some(sei) if !sei.is_empty() => {
            let mut data = Vec::with_capacity(sei.len() + packet.data.len());
            data.extend_from_slice(&sei);
            data.extend_from_slice(&packet.data);
            let first = Packet {
                data: Bytes::from(data),
                ..packet.clone()
            };
            (cb.callback)(&first, packet_time);
        }
        _ => (cb.callback)(packet, packet_time),
    }
    cb.sent_first_packet = true;
}

/// Codec failure: force-stop every attached output, send each its
/// end-of-stream sentinel, drop all subscribers and detach the capture.
/// The encoder returns to Initialised; reconnecting is the output's job.
pub(crate) fn full_stop(encoder: &Encoder) {
    let outputs: Vec<_> = encoder
        .inner
        .outputs
        .lock()
        .iter()
        .filter_map(|weak| weak.upgrade())
        .collect();

    for output in outputs {
        output.force_stop();
        output.deliver_end_of_stream();
    }

    encoder.inner.callbacks.lock().clear();
    encoder.remove_connection(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::test_engine;
    use crate::testutil::{MockCodecFactory, RecordingSink};
    use cindercast_plugin_api::Settings;

    fn video_frame(ts: u64) -> VideoFrameData {
        VideoFrameData {
            planes: vec![Bytes::from_static(&[1, 2, 3, 4])],
            linesize: vec![4],
            timestamp: ts,
        }
    }

    fn audio_block(ts: u64, frames: u32) -> AudioBlockData {
        AudioBlockData {
            planes: vec![vec![0.5; frames as usize]; 2],
            frames,
            timestamp: ts,
        }
    }

    #[test]
    fn first_video_packet_latches_start_ts_and_offset() {
        let engine = test_engine();
        engine.register_codec(MockCodecFactory::video("mock-h264"));
        let encoder = engine
            .create_video_encoder("mock-h264", "v0", Settings::new())
            .unwrap();
        let sink = RecordingSink::new();
        let _id = encoder.start(sink.callback()).unwrap();

        receive_video(&encoder, &video_frame(5_000_000));
        receive_video(&encoder, &video_frame(38_333_333));

        let packets = sink.packets();
        assert_eq!(packets.len(), 2);
        // start_ts/1000 + 0 - 0
        assert_eq!(packets[0].dts_usec, 5_000);
        assert_eq!(packets[1].dts_usec, 5_000 + 33_333);
        assert!(packets[0].keyframe);
    }

    #[test]
    fn first_packet_waits_for_keyframe() {
        let engine = test_engine();
        engine.register_codec(MockCodecFactory::video_with_keyframe_interval(
            "mock-h264", 3,
        ));
        let encoder = engine
            .create_video_encoder("mock-h264", "v0", Settings::new())
            .unwrap();

        // Subscribe after two frames have gone by so the next keyframe is
        // frames away.
        let early = RecordingSink::new();
        let _id = encoder.start(early.callback()).unwrap();
        receive_video(&encoder, &video_frame(0));

        let late = RecordingSink::new();
        let _id2 = encoder.start(late.callback()).unwrap();
        receive_video(&encoder, &video_frame(33_333_333));
        receive_video(&encoder, &video_frame(66_666_666));
        receive_video(&encoder, &video_frame(100_000_000));

        // The late subscriber saw nothing until the keyframe at pts 3.
        let late_packets = late.packets();
        assert!(late_packets[0].keyframe);
        assert_eq!(early.packets().len(), 4);
        assert_eq!(late_packets.len(), 1);
    }

    #[test]
    fn sei_is_prepended_to_first_packet() {
        let engine = test_engine();
        engine.register_codec(MockCodecFactory::video_with_sei("mock-h264", b"SEI!"));
        let encoder = engine
            .create_video_encoder("mock-h264", "v0", Settings::new())
            .unwrap();
        let sink = RecordingSink::new();
        let _id = encoder.start(sink.callback()).unwrap();

        receive_video(&encoder, &video_frame(0));
        receive_video(&encoder, &video_frame(33_333_333));

        let packets = sink.packets();
        assert!(packets[0].data.starts_with(b"SEI!"));
        assert!(!packets[1].data.starts_with(b"SEI!"));
    }

    #[test]
    fn audio_waits_for_paired_video_start() {
        let engine = test_engine();
        engine.register_codec(MockCodecFactory::video("mock-h264"));
        engine.register_codec(MockCodecFactory::audio("mock-aac", 1024));
        let venc = engine
            .create_video_encoder("mock-h264", "v0", Settings::new())
            .unwrap();
        let aenc = engine
            .create_audio_encoder("mock-aac", "a0", Settings::new(), 0)
            .unwrap();
        venc.add_paired(&aenc);
        aenc.add_paired(&venc);

        let vsink = RecordingSink::new();
        let asink = RecordingSink::new();
        let _v = venc.start(vsink.callback()).unwrap();
        let _a = aenc.start(asink.callback()).unwrap();

        // Audio arrives first; it must buffer, not encode (P5).
        receive_audio(&aenc, &audio_block(0, 1024));
        assert!(asink.packets().is_empty());

        // Video starts at 100ms; audio blocks before it stay dropped,
        // the straddling block is trimmed to the sync point.
        receive_video(&venc, &video_frame(100_000_000));
        receive_audio(&aenc, &audio_block(21_333_333, 1024));
        assert!(asink.packets().is_empty());

        receive_audio(&aenc, &audio_block(96_000_000, 1024));
        receive_audio(&aenc, &audio_block(117_333_333, 1024));
        let packets = asink.packets();
        assert!(!packets.is_empty());
        // Audio dts_usec starts from the video start point.
        assert_eq!(packets[0].dts_usec, 100_000);
        assert_eq!(aenc.inner.run.lock().start_ts, 100_000_000);
    }

    #[test]
    fn codec_failure_full_stops() {
        let engine = test_engine();
        engine.register_codec(MockCodecFactory::video_failing_after("mock-h264", 2));
        let encoder = engine
            .create_video_encoder("mock-h264", "v0", Settings::new())
            .unwrap();
        let sink = RecordingSink::new();
        let _id = encoder.start(sink.callback()).unwrap();

        receive_video(&encoder, &video_frame(0));
        receive_video(&encoder, &video_frame(33_333_333));
        assert!(encoder.active());
        receive_video(&encoder, &video_frame(66_666_666));

        assert!(!encoder.active());
        assert!(!encoder.last_error().is_empty());
        // Codec state survives: back to Initialised, not Idle.
        assert!(encoder.initialized());
    }

    #[test]
    fn pause_window_drops_frames_and_keeps_wire_continuity() {
        let engine = test_engine();
        engine.register_codec(MockCodecFactory::video("mock-h264"));
        let encoder = engine
            .create_video_encoder("mock-h264", "v0", Settings::new())
            .unwrap();
        let sink = RecordingSink::new();
        let _id = encoder.start(sink.callback()).unwrap();

        receive_video(&encoder, &video_frame(0));

        // Pause spanning two frames; the frame at ts_end closes the window.
        encoder.inner.pause.lock().ts_start = 33_333_333;
        receive_video(&encoder, &video_frame(33_333_333));
        receive_video(&encoder, &video_frame(66_666_666));
        encoder.inner.pause.lock().end(100_000_000);
        receive_video(&encoder, &video_frame(100_000_000));

        let packets = sink.packets();
        assert_eq!(packets.len(), 2);
        // The delivered stream stays gapless...
        assert_eq!(packets[1].dts_usec - packets[0].dts_usec, 33_333);
        // ...while sys_dts_usec carries the accumulated pause offset so the
        // wire timeline matches wall time within a microsecond (R2).
        let sys_delta = packets[1].sys_dts_usec - packets[0].sys_dts_usec;
        assert!((sys_delta - 100_000).abs() <= 1, "sys delta {}", sys_delta);
    }

    #[test]
    fn reconfigure_applies_once_before_next_encode() {
        let engine = test_engine();
        let factory = MockCodecFactory::video("mock-h264");
        let updates = factory.update_count();
        engine.register_codec(factory);
        let encoder = engine
            .create_video_encoder("mock-h264", "v0", Settings::new())
            .unwrap();
        let sink = RecordingSink::new();
        let _id = encoder.start(sink.callback()).unwrap();

        receive_video(&encoder, &video_frame(0));

        let mut settings = Settings::new();
        settings.set("bitrate", 9000);
        encoder.update(&settings).unwrap();
        // Not applied yet.
        assert_eq!(updates.load(Ordering::Relaxed), 0);

        receive_video(&encoder, &video_frame(33_333_333));
        assert_eq!(updates.load(Ordering::Relaxed), 1);
        receive_video(&encoder, &video_frame(66_666_666));
        assert_eq!(updates.load(Ordering::Relaxed), 1);
    }
}
