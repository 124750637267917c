// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Closed-caption injection (CEA-608 over CEA-708).
//!
//! Captions arrive as a side-channel queue per video track, either as text
//! or as raw CEA byte triplets. The interleaver injects them into the first
//! suitable video packet (`priority <= 1`) by appending an SEI NAL unit
//! (AVC/HEVC) or a metadata OBU (AV1) carrying the ITU-T T.35 CC payload.
//! Unsupported codecs consume and discard the caption entry.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::debug;

use crate::output::Output;
use crate::packet::Packet;

const NAL_START: [u8; 4] = [0, 0, 0, 1];
/// AVC SEI payload type for user_data_registered_itu_t_t35.
const SEI_TYPE_ITUT_T35: u8 = 4;
/// AV1 metadata OBU subtype for ITU-T T.35.
const METADATA_TYPE_ITUT_T35: u8 = 4;

/// One queued caption entry.
#[derive(Debug, Clone)]
pub struct CaptionText {
    pub text: String,
    /// Seconds the caption stays on screen before the next may display.
    pub display_duration: f64,
}

/// Per-video-track caption state, guarded by the track's caption mutex.
#[derive(Debug, Default)]
pub(crate) struct CaptionTrack {
    pub(crate) queue: VecDeque<CaptionText>,
    pub(crate) caption_timestamp: f64,
    /// Raw CEA byte triplets (cc_valid/type byte + two data bytes).
    pub(crate) cea_data: VecDeque<[u8; 3]>,
    pub(crate) last_caption_timestamp: f64,
}

/// Inject any due caption into a video packet about to be emitted.
pub(crate) fn try_insert_caption(output: &Output, out: &mut Packet) {
    let Some(track) = output.caption_track(out.track_idx) else {
        debug!("caption track for index {} not initialized", out.track_idx);
        return;
    };
    let mut ctrack = track.lock();

    let frame_timestamp = out.pts as f64 * out.timebase_num as f64 / out.timebase_den as f64;

    if !ctrack.queue.is_empty() && ctrack.caption_timestamp <= frame_timestamp {
        let display_duration = ctrack.queue.front().map(|c| c.display_duration).unwrap_or(0.0);
        if add_caption(&mut ctrack, out) {
            ctrack.caption_timestamp = frame_timestamp + display_duration;
        }
    }

    if !ctrack.cea_data.is_empty() && ctrack.last_caption_timestamp < frame_timestamp {
        ctrack.last_caption_timestamp = frame_timestamp;
        add_caption(&mut ctrack, out);
    }
}

fn add_caption(ctrack: &mut CaptionTrack, out: &mut Packet) -> bool {
    if out.priority > 1 {
        return false;
    }

    let codec = out
        .encoder
        .as_ref()
        .and_then(|weak| weak.upgrade())
        .map(|encoder| encoder.codec())
        .unwrap_or_default();
    let avc = codec == "h264";
    let hevc = codec == "hevc";
    let av1 = codec == "av1";

    // The entry is consumed even for unsupported codecs.
    let cc_pairs = if !ctrack.cea_data.is_empty() {
        let mut pairs = Vec::new();
        while let Some(triplet) = ctrack.cea_data.pop_front() {
            // Only pass through field-1 CEA-608.
            if triplet[0] & 0x3 != 0 {
                continue;
            }
            let data = u16::from_be_bytes([triplet[1], triplet[2]]);
            // Padding and empty pairs.
            if data == 0x8080 || data == 0 {
                continue;
            }
            if !eia608_parity_ok(data) {
                continue;
            }
            pairs.push([triplet[1], triplet[2]]);
        }
        pairs
    } else if let Some(caption) = ctrack.queue.pop_front() {
        text_to_cea608_pairs(&caption.text)
    } else {
        return false;
    };

    if !(avc || hevc || av1) || cc_pairs.is_empty() {
        return false;
    }

    let t35 = build_itut_t35_payload(&cc_pairs);
    let mut data = Vec::with_capacity(out.data.len() + t35.len() + 16);
    data.extend_from_slice(&out.data);

    if avc {
        // TODO: the SEI should come after AUD/SPS/PPS but before any VCL.
        data.extend_from_slice(&NAL_START);
        data.extend_from_slice(&build_avc_sei(&t35));
    } else if hevc {
        // SEIs use the 3-byte start code; only the first NAL gets 4 bytes.
        data.extend_from_slice(&NAL_START[1..]);
        data.extend_from_slice(&build_hevc_sei(&t35, &out.data));
    } else {
        data.extend_from_slice(&build_av1_metadata_obu(&t35));
    }

    out.data = Bytes::from(data);
    true
}

/// Odd parity over the low 7 bits of each byte.
fn eia608_parity_ok(pair: u16) -> bool {
    fn odd(byte: u8) -> bool {
        byte.count_ones() % 2 == 1
    }
    odd((pair >> 8) as u8) && odd(pair as u8)
}

fn with_parity(byte: u8) -> u8 {
    if (byte & 0x7F).count_ones() % 2 == 1 {
        byte & 0x7F
    } else {
        byte | 0x80
    }
}

/// Encode plain text as field-1 pop-on CEA-608: RCL, the characters in
/// pairs, then EOC to display.
fn text_to_cea608_pairs(text: &str) -> Vec<[u8; 2]> {
    let mut pairs = Vec::new();
    // Resume caption loading.
    pairs.push([with_parity(0x14), with_parity(0x20)]);

    let bytes: Vec<u8> = text
        .bytes()
        .filter(|b| (0x20..0x7F).contains(b))
        .collect();
    for chunk in bytes.chunks(2) {
        let first = with_parity(chunk[0]);
        let second = with_parity(*chunk.get(1).unwrap_or(&0x20));
        pairs.push([first, second]);
    }

    // End of caption (flip to display).
    pairs.push([with_parity(0x14), with_parity(0x2F)]);
    pairs
}

/// ITU-T T.35 user data wrapping a CEA-708 cc_data block.
fn build_itut_t35_payload(cc_pairs: &[[u8; 2]]) -> Vec<u8> {
    let cc_count = cc_pairs.len().min(31) as u8;
    let mut payload = Vec::with_capacity(11 + cc_count as usize * 3);
    payload.push(0xB5); // country code: USA
    payload.extend_from_slice(&[0x00, 0x31]); // provider: ATSC
    payload.extend_from_slice(b"GA94"); // user identifier
    payload.push(0x03); // user data type: cc_data
    payload.push(0x40 | cc_count); // process_cc_data_flag | cc_count
    payload.push(0xFF); // em_data
    for pair in &cc_pairs[..cc_count as usize] {
        payload.push(0xFC); // cc_valid, cc_type 0 (NTSC field 1)
        payload.push(pair[0]);
        payload.push(pair[1]);
    }
    payload.push(0xFF); // marker_bits
    payload
}

/// Escape 0x000000/01/02/03 sequences inside a NAL payload.
fn emulation_prevent(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte <= 3 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

fn sei_body(t35: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(t35.len() + 4);
    body.push(SEI_TYPE_ITUT_T35);
    let mut size = t35.len();
    while size >= 255 {
        body.push(0xFF);
        size -= 255;
    }
    body.push(size as u8);
    body.extend_from_slice(t35);
    body.push(0x80); // rbsp trailing bits
    body
}

fn build_avc_sei(t35: &[u8]) -> Vec<u8> {
    let mut nal = vec![0x06]; // nal_unit_type 6: SEI
    nal.extend_from_slice(&emulation_prevent(&sei_body(t35)));
    nal
}

fn build_hevc_sei(t35: &[u8], packet_data: &[u8]) -> Vec<u8> {
    // Reuse the layer/temporal id bits from the packet's first NAL header,
    // swapping in the prefix-SEI type (39).
    let header_offset = if packet_data.starts_with(&NAL_START) {
        4
    } else if packet_data.starts_with(&NAL_START[1..]) {
        3
    } else {
        debug!("Annex-B start code not found; HEVC caption NAL header may be invalid");
        return Vec::new();
    };
    let orig0 = packet_data.get(header_offset).copied().unwrap_or(0);
    let orig1 = packet_data.get(header_offset + 1).copied().unwrap_or(1);

    const PREFIX_SEI_NAL_TYPE: u8 = 39;
    let first_byte = (PREFIX_SEI_NAL_TYPE << 1) | (orig0 & 0x01);

    let mut nal = vec![first_byte, orig1];
    let body = sei_body(t35);
    // The HEVC SEI body is identical past the 2-byte header.
    nal.extend_from_slice(&emulation_prevent(&body[1..]));
    nal
}

fn build_av1_metadata_obu(t35: &[u8]) -> Vec<u8> {
    let mut payload = vec![METADATA_TYPE_ITUT_T35];
    payload.extend_from_slice(t35);

    let mut obu = vec![0x2A]; // obu_type 5 (metadata), obu_has_size_field
    let mut size = payload.len();
    // LEB128 size field.
    loop {
        let mut byte = (size & 0x7F) as u8;
        size >>= 7;
        if size != 0 {
            byte |= 0x80;
        }
        obu.push(byte);
        if size == 0 {
            break;
        }
    }
    obu.extend_from_slice(&payload);
    obu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_round_trip() {
        for byte in 0x20u8..0x7F {
            let with = with_parity(byte);
            assert!(eia608_parity_ok(u16::from_be_bytes([with, with_parity(0x20)])));
            assert_eq!(with & 0x7F, byte);
        }
    }

    #[test]
    fn text_encodes_to_pairs() {
        let pairs = text_to_cea608_pairs("HI");
        // RCL + one character pair + EOC.
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[1][0] & 0x7F, b'H');
        assert_eq!(pairs[1][1] & 0x7F, b'I');
    }

    #[test]
    fn t35_payload_shape() {
        let payload = build_itut_t35_payload(&[[0x41, 0x42]]);
        assert_eq!(payload[0], 0xB5);
        assert_eq!(&payload[3..7], b"GA94");
        // One cc triplet.
        assert_eq!(payload[8] & 0x1F, 1);
    }

    #[test]
    fn emulation_prevention_escapes_start_codes() {
        let escaped = emulation_prevent(&[0, 0, 1, 7]);
        assert_eq!(escaped, vec![0, 0, 3, 1, 7]);
        // Already-safe data is untouched.
        assert_eq!(emulation_prevent(&[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn leb128_size_in_obu() {
        let obu = build_av1_metadata_obu(&vec![0u8; 200]);
        assert_eq!(obu[0], 0x2A);
        // 201-byte payload: LEB128 0xC9 0x01.
        assert_eq!(obu[1], 0xC9);
        assert_eq!(obu[2], 0x01);
    }
}
