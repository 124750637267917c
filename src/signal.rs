// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Signal emission for observable lifecycle events.
//!
//! Each signal-carrying object owns a [`SignalHub`]; observers connect a
//! callback and receive every event emitted afterwards. Handlers run on the
//! emitting thread and must not block.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::StopCode;

/// Handle returned by [`SignalHub::connect`], used to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A connect/emit registry for one event type.
pub struct SignalHub<T> {
    handlers: Mutex<Vec<(HandlerId, Handler<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for SignalHub<T> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> SignalHub<T> {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; returns an id for [`disconnect`](Self::disconnect).
    pub fn connect(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Unknown ids are ignored.
    pub fn disconnect(&self, id: HandlerId) {
        self.handlers.lock().retain(|(hid, _)| *hid != id);
    }

    /// Invoke every connected handler with `event`.
    ///
    /// Handlers are snapshotted first so a handler may connect/disconnect
    /// without deadlocking.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Handler<T>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }
}

/// Output lifecycle events. Names are stable API surface.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Data capture is fully active.
    Start,
    /// The output stopped; carries the stop code and last error message.
    Stop {
        /// Why the output stopped.
        code: StopCode,
        /// Last error message at stop time (may be empty).
        error: String,
    },
    /// Start requested, capture not yet hooked.
    Starting,
    /// Stop requested, capture still draining.
    Stopping,
    /// Raw/encoded capture hooked up.
    Activate,
    /// Capture unhooked.
    Deactivate,
    /// A reconnect attempt is scheduled.
    Reconnect {
        /// Seconds until the attempt fires.
        timeout_sec: u32,
    },
    /// A reconnect attempt succeeded.
    ReconnectSuccess,
    /// The output entered its pause window.
    Pause,
    /// The output left its pause window.
    Unpause,
}

impl OutputEvent {
    /// Stable signal name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop { .. } => "stop",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Reconnect { .. } => "reconnect",
            Self::ReconnectSuccess => "reconnect_success",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
        }
    }
}

/// Scene graph events. Names are stable API surface.
#[derive(Debug, Clone)]
pub enum SceneEvent {
    /// An item was added; carries the item id.
    ItemAdd {
        /// Id of the new item.
        item_id: u64,
    },
    /// An item was removed.
    ItemRemove {
        /// Id of the removed item.
        item_id: u64,
    },
    /// An item's visibility changed.
    ItemVisible {
        /// Id of the item.
        item_id: u64,
        /// New visibility.
        visible: bool,
    },
    /// An item's lock state changed.
    ItemLocked {
        /// Id of the item.
        item_id: u64,
        /// New lock state.
        locked: bool,
    },
    /// An item's transform changed.
    ItemTransform {
        /// Id of the item.
        item_id: u64,
    },
    /// The item order changed.
    Reorder,
}

impl SceneEvent {
    /// Stable signal name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ItemAdd { .. } => "item_add",
            Self::ItemRemove { .. } => "item_remove",
            Self::ItemVisible { .. } => "item_visible",
            Self::ItemLocked { .. } => "item_locked",
            Self::ItemTransform { .. } => "item_transform",
            Self::Reorder => "reorder",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn connect_emit_disconnect() {
        let hub: SignalHub<OutputEvent> = SignalHub::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count2 = Arc::clone(&count);
        let id = hub.connect(move |_| {
            count2.fetch_add(1, Ordering::Relaxed);
        });

        hub.emit(&OutputEvent::Start);
        hub.emit(&OutputEvent::Starting);
        assert_eq!(count.load(Ordering::Relaxed), 2);

        hub.disconnect(id);
        hub.emit(&OutputEvent::Start);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn signal_names_are_stable() {
        assert_eq!(OutputEvent::Start.name(), "start");
        assert_eq!(
            OutputEvent::Reconnect { timeout_sec: 2 }.name(),
            "reconnect"
        );
        assert_eq!(SceneEvent::Reorder.name(), "reorder");
        assert_eq!(
            SceneEvent::ItemVisible {
                item_id: 1,
                visible: true
            }
            .name(),
            "item_visible"
        );
    }
}
