// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Encoder groups: sets of encoders that must all begin emitting packets
//! referring to the same starting raw-frame timestamp.
//!
//! The group's `start_timestamp` is latched exactly once per start cycle by
//! the video feed, on the first frame dispatched after every member has
//! started. It is zeroed when the last member stops.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::encoder::{Encoder, WeakEncoder};
use crate::error::EncoderError;

#[derive(Default)]
struct GroupState {
    encoders: Vec<WeakEncoder>,
    num_encoders_started: usize,
    start_timestamp: u64,
}

/// A shared start-alignment group.
#[derive(Clone, Default)]
pub struct EncoderGroup {
    state: Arc<Mutex<GroupState>>,
}

/// Weak group handle held by the video feed's ready list.
#[derive(Clone)]
pub(crate) struct WeakEncoderGroup {
    state: Weak<Mutex<GroupState>>,
}

impl WeakEncoderGroup {
    pub(crate) fn upgrade(&self) -> Option<EncoderGroup> {
        self.state.upgrade().map(|state| EncoderGroup { state })
    }
}

impl PartialEq for EncoderGroup {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}
impl Eq for EncoderGroup {}

impl EncoderGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opaque id for keyframe-alignment bookkeeping.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.state) as usize
    }

    pub(crate) fn downgrade(&self) -> WeakEncoderGroup {
        WeakEncoderGroup {
            state: Arc::downgrade(&self.state),
        }
    }

    /// Add an encoder to the group. Fails while any member is started.
    pub fn add(&self, encoder: &Encoder) -> Result<(), EncoderError> {
        let mut state = self.state.lock();
        if state.num_encoders_started > 0 {
            return Err(EncoderError::Active(encoder.name()));
        }
        state.encoders.push(encoder.downgrade());
        drop(state);
        encoder.set_group_internal(Some(self.clone()))
    }

    /// Number of member encoders (live ones only).
    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        state.encoders.retain(|weak| weak.upgrade().is_some());
        state.encoders.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The latched start timestamp; `0` until latched.
    pub fn start_timestamp(&self) -> u64 {
        self.state.lock().start_timestamp
    }

    pub(crate) fn on_encoder_started(&self) -> bool {
        let mut state = self.state.lock();
        state.num_encoders_started += 1;
        state.num_encoders_started >= state.encoders.len()
    }

    pub(crate) fn on_encoder_stopped(&self) {
        let mut state = self.state.lock();
        state.num_encoders_started = state.num_encoders_started.saturating_sub(1);
        if state.num_encoders_started == 0 {
            state.start_timestamp = 0;
        }
    }

    pub(crate) fn num_encoders_started(&self) -> usize {
        self.state.lock().num_encoders_started
    }

    /// Latch the start timestamp if every member has started and no
    /// timestamp is latched yet. Returns `true` on the latching call.
    pub(crate) fn try_latch_start_timestamp(&self, timestamp: u64) -> bool {
        let mut state = self.state.lock();
        if state.start_timestamp == 0
            && state.num_encoders_started >= state.encoders.len()
            && !state.encoders.is_empty()
        {
            state.start_timestamp = timestamp;
            debug!("encoder group start timestamp latched at {}", timestamp);
            return true;
        }
        false
    }
}
