// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Grouped-keyframe alignment tracking.
//!
//! For encoders sharing a group, keyframes are expected to land at the same
//! pts on every track. Each keyframe opens (or joins) a pending entry keyed
//! on `(group, pts)`; a later keyframe skipping past an entry with unseen
//! tracks logs a missing-keyframe warning.

use tracing::warn;

use cindercast_plugin_api::EncoderKind;

use crate::output::Output;
use crate::packet::Packet;
use crate::MAX_OUTPUT_VIDEO_TRACKS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackStatus {
    NotSeen,
    Seen,
    Skipped,
}

/// One pending `(group, pts)` alignment entry.
#[derive(Debug, Clone)]
pub(crate) struct KeyframeGroupData {
    pub(crate) group_id: usize,
    pub(crate) pts: i64,
    pub(crate) required_tracks: usize,
    pub(crate) seen_on_track: [TrackStatus; MAX_OUTPUT_VIDEO_TRACKS],
}

fn purge_if_complete(entries: &mut Vec<KeyframeGroupData>, idx: usize) -> bool {
    let entry = &entries[idx];
    let modified = entry
        .seen_on_track
        .iter()
        .filter(|s| **s != TrackStatus::NotSeen)
        .count();
    if modified == entry.required_tracks {
        entries.remove(idx);
        true
    } else {
        false
    }
}

/// Check whether keyframes are emitted from all grouped encoders, logging
/// when one track skipped an aligned keyframe.
pub(crate) fn check_group_keyframe_alignment(
    output: &Output,
    entries: &mut Vec<KeyframeGroupData>,
    packet: &Packet,
) {
    if !packet.keyframe || packet.kind != EncoderKind::Video {
        return;
    }
    let Some(encoder) = packet.encoder.as_ref().and_then(|weak| weak.upgrade()) else {
        return;
    };
    let Some(group) = encoder.encoder_group() else {
        return;
    };

    let mut idx = 0;
    while idx < entries.len() {
        if entries[idx].pts > packet.pts {
            break;
        }
        if entries[idx].group_id != group.id() {
            idx += 1;
            continue;
        }

        if entries[idx].pts < packet.pts {
            if entries[idx].seen_on_track[packet.track_idx] == TrackStatus::NotSeen {
                warn!(
                    "output '{}': Missing keyframe with pts {} for encoder '{}' (track: {})",
                    output.name(),
                    entries[idx].pts,
                    encoder.name(),
                    packet.track_idx
                );
            }
            entries[idx].seen_on_track[packet.track_idx] = TrackStatus::Skipped;

            if !purge_if_complete(entries, idx) {
                idx += 1;
            }
            continue;
        }

        entries[idx].seen_on_track[packet.track_idx] = TrackStatus::Seen;
        purge_if_complete(entries, idx);
        return;
    }

    let mut insert = KeyframeGroupData {
        group_id: group.id(),
        pts: packet.pts,
        required_tracks: group.num_encoders_started(),
        seen_on_track: [TrackStatus::NotSeen; MAX_OUTPUT_VIDEO_TRACKS],
    };
    insert.seen_on_track[packet.track_idx] = TrackStatus::Seen;
    entries.insert(idx, insert);
}
