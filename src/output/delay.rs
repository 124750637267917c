// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Output delay buffering.
//!
//! With a delay configured, interleaved packets are held for the delay
//! window before reaching the writer. `DELAY_PRESERVE` keeps held data
//! across a reconnect instead of dropping it.

use std::collections::VecDeque;

use crate::packet::Packet;

/// Keep buffered packets across disconnects/reconnects.
pub const DELAY_PRESERVE: u32 = 1 << 0;

/// Delay configuration and held packets.
#[derive(Default)]
pub(crate) struct DelayState {
    pub(crate) delay_sec: u32,
    pub(crate) flags: u32,
    queue: VecDeque<(u64, Packet)>,
}

impl DelayState {
    pub(crate) fn active(&self) -> bool {
        self.delay_sec > 0
    }

    fn delay_ns(&self) -> u64 {
        self.delay_sec as u64 * 1_000_000_000
    }

    /// Number of packets currently held.
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Hold a packet, then return every packet whose delay has elapsed.
    pub(crate) fn push_and_drain(&mut self, now_ns: u64, packet: Packet) -> Vec<Packet> {
        self.queue.push_back((now_ns, packet));
        self.drain_due(now_ns)
    }

    /// Packets whose hold window has elapsed at `now_ns`.
    pub(crate) fn drain_due(&mut self, now_ns: u64) -> Vec<Packet> {
        let delay = self.delay_ns();
        let mut due = Vec::new();
        while let Some((arrival, _)) = self.queue.front() {
            if arrival + delay > now_ns {
                break;
            }
            if let Some((_, packet)) = self.queue.pop_front() {
                due.push(packet);
            }
        }
        due
    }

    /// Drop held data unless the preserve flag is set.
    pub(crate) fn on_capture_end(&mut self) {
        if self.flags & DELAY_PRESERVE == 0 {
            self.queue.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cindercast_plugin_api::EncoderKind;

    fn packet(dts: i64) -> Packet {
        Packet {
            kind: EncoderKind::Video,
            track_idx: 0,
            data: Bytes::new(),
            pts: dts,
            dts,
            timebase_num: 1,
            timebase_den: 30,
            dts_usec: dts,
            sys_dts_usec: dts,
            keyframe: true,
            priority: 0,
            encoder: None,
        }
    }

    #[test]
    fn packets_release_after_delay() {
        let mut delay = DelayState {
            delay_sec: 1,
            ..DelayState::default()
        };

        assert!(delay.push_and_drain(0, packet(0)).is_empty());
        assert!(delay.push_and_drain(500_000_000, packet(1)).is_empty());

        let due = delay.drain_due(1_000_000_000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].dts, 0);

        let due = delay.drain_due(2_000_000_000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].dts, 1);
        assert_eq!(delay.queued(), 0);
    }

    #[test]
    fn preserve_flag_keeps_queue_on_capture_end() {
        let mut delay = DelayState {
            delay_sec: 5,
            flags: DELAY_PRESERVE,
            ..DelayState::default()
        };
        delay.push_and_drain(0, packet(0));

        delay.on_capture_end();
        assert_eq!(delay.queued(), 1);

        delay.flags = 0;
        delay.on_capture_end();
        assert_eq!(delay.queued(), 0);
    }
}
