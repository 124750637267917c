// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Compressed packets and their ancillary timing metrics.

use bytes::Bytes;
use cindercast_plugin_api::{EncoderKind, WirePacket};

use crate::encoder::WeakEncoder;
use crate::util::time::timebase_to_usec;

/// A compressed packet flowing from an encoder to its subscribers.
///
/// The payload is a ref-counted byte blob; cloning a packet shares it. The
/// header fields are copied by value, so an output can renormalise its copy
/// without disturbing other subscribers.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Video or audio.
    pub kind: EncoderKind,
    /// Track index within the receiving output; assigned on admission.
    pub track_idx: usize,
    /// Compressed payload.
    pub data: Bytes,
    /// Presentation timestamp in the packet timebase.
    pub pts: i64,
    /// Decode timestamp in the packet timebase.
    pub dts: i64,
    /// Timebase numerator.
    pub timebase_num: u32,
    /// Timebase denominator.
    pub timebase_den: u32,
    /// Decode timestamp in microseconds from the shared epoch; zero-based
    /// per session once the interleaver captures its offsets.
    pub dts_usec: i64,
    /// `dts_usec` plus accumulated pause offsets; continuous on the wire.
    pub sys_dts_usec: i64,
    /// True for video keyframes.
    pub keyframe: bool,
    /// Drop priority; `0` is highest.
    pub priority: i32,
    /// The encoder that produced this packet. Weak so a packet held in a
    /// delay buffer does not keep a stopped encoder alive.
    pub encoder: Option<WeakEncoder>,
}

impl Packet {
    /// The dts converted to microseconds through the packet timebase.
    pub fn dts_usec_from_timebase(&self) -> i64 {
        timebase_to_usec(self.dts, self.timebase_num, self.timebase_den)
    }

    /// Duration of one packet interval in microseconds.
    pub fn interval_usec(&self) -> i64 {
        timebase_to_usec(1, self.timebase_num, self.timebase_den)
    }

    /// Build the wire-facing view handed to output writers.
    pub fn to_wire(&self) -> WirePacket {
        WirePacket {
            kind: self.kind,
            track_idx: self.track_idx,
            data: self.data.clone(),
            pts: self.pts,
            dts: self.dts,
            timebase_num: self.timebase_num,
            timebase_den: self.timebase_den,
            dts_usec: self.dts_usec,
            sys_dts_usec: self.sys_dts_usec,
            keyframe: self.keyframe,
            priority: self.priority,
        }
    }
}

/// Per-video-packet timing metrics, used for instrumentation only.
///
/// Captured around the codec `encode` call and matched back to the packet by
/// `pts` when it is delivered.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketTime {
    /// Presentation timestamp the entry is keyed on.
    pub pts: i64,
    /// Composition time: the raw frame's capture timestamp (ns).
    pub cts: u64,
    /// Frame-encode-request timestamp (ns), taken just before `encode`.
    pub fer: u64,
    /// Frame-encode-request-complete timestamp (ns); `0` if encode failed.
    pub ferc: u64,
    /// Packet-interleave-request timestamp (ns), stamped at emission.
    pub pir: u64,
}
