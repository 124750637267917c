// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scenes and scene items: the dataflow container feeding the mixer.
//!
//! A scene is a composite source holding an ordered list of items. Each item
//! wraps a child source with visibility, transform and transition state.
//! Visibility changes are queued as timestamped audio actions so gating is
//! sample-accurate; the scene's audio render applies them (see
//! [`audio`]).
//!
//! Lock order: the video mutex (topology serialization) is always taken
//! before the item list (the audio mutex). The audio render path takes only
//! the item list.

pub mod audio;
pub mod persist;
pub mod transition;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SceneError;
use crate::signal::{SceneEvent, SignalHub};
use crate::source::{Source, SOURCE_AUDIO, SOURCE_COMPOSITE, SOURCE_VIDEO};
use crate::util::time::now_ns;

use transition::TransitionSource;

/// A queued, timestamped visibility toggle applied during audio render.
#[derive(Debug, Clone, Copy)]
pub struct AudioAction {
    /// When the toggle takes effect (ns).
    pub timestamp: u64,
    /// The visibility after the toggle.
    pub visible: bool,
}

/// 2D transform of an item within its scene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub pos_x: f32,
    pub pos_y: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub rot: f32,
    pub alignment: u32,
    pub bounds_type: BoundsType,
    pub bounds_alignment: u32,
    pub bounds_x: f32,
    pub bounds_y: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            pos_x: 0.0,
            pos_y: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            rot: 0.0,
            alignment: 0,
            bounds_type: BoundsType::None,
            bounds_alignment: 0,
            bounds_x: 0.0,
            bounds_y: 0.0,
        }
    }
}

/// How an item is fitted into its bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundsType {
    None,
    Stretch,
    ScaleInner,
    ScaleOuter,
    ScaleToWidth,
    ScaleToHeight,
    MaxOnly,
}

/// Pixel crop applied before the transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crop {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Scaling filter used when an item is resized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleFilter {
    #[default]
    Disable,
    Point,
    Bicubic,
    Bilinear,
    Lanczos,
    Area,
}

/// Blend mode used when an item is composited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    #[default]
    Normal,
    Additive,
    Subtract,
    Screen,
    Multiply,
    Lighten,
    Darken,
}

pub(crate) struct SceneItemShared {
    id: u64,
    scene: Weak<SceneShared>,
    source: Source,
    /// Control-side visibility, set immediately.
    user_visible: AtomicBool,
    /// Audio-side visibility, toggled when the queued action applies.
    visible: AtomicBool,
    locked: AtomicBool,
    actions: Mutex<Vec<AudioAction>>,
    transform: Mutex<Transform>,
    crop: Mutex<Crop>,
    scale_filter: Mutex<ScaleFilter>,
    blend_mode: Mutex<BlendMode>,
    show_transition: Mutex<Option<TransitionSource>>,
    hide_transition: Mutex<Option<TransitionSource>>,
    show_transition_duration_ms: AtomicU32,
    hide_transition_duration_ms: AtomicU32,
    active_refs: AtomicI64,
    /// Unknown persisted fields, carried verbatim across save/load.
    persist_extra: Mutex<serde_json::Map<String, serde_json::Value>>,
}

/// One entry in a scene's item list.
#[derive(Clone)]
pub struct SceneItem {
    inner: Arc<SceneItemShared>,
}

impl PartialEq for SceneItem {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for SceneItem {}

impl std::fmt::Debug for SceneItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneItem")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source.name())
            .field("visible", &self.visible())
            .finish()
    }
}

impl SceneItem {
    /// Item id, unique within its scene.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The wrapped child source.
    pub fn source(&self) -> &Source {
        &self.inner.source
    }

    /// Control-side visibility.
    pub fn visible(&self) -> bool {
        self.inner.user_visible.load(Ordering::Acquire)
    }

    pub(crate) fn audio_visible(&self) -> bool {
        self.inner.visible.load(Ordering::Acquire)
    }

    pub(crate) fn set_audio_visible(&self, visible: bool) {
        self.inner.visible.store(visible, Ordering::Release);
    }

    /// Toggle visibility. The audio gate switches sample-accurately at the
    /// current timestamp; configured show/hide transitions start now.
    pub fn set_visible(&self, visible: bool) {
        if self.inner.user_visible.swap(visible, Ordering::AcqRel) == visible {
            return;
        }

        let now = now_ns();
        self.inner.actions.lock().push(AudioAction {
            timestamp: now,
            visible,
        });

        if visible {
            // Hidden again when the matching action applies.
            self.inner.active_refs.fetch_add(1, Ordering::AcqRel);
            self.inner.source.addref_active();
        }

        // Start the configured transition for this direction.
        let (slot, duration_ms) = if visible {
            (
                &self.inner.show_transition,
                self.inner.show_transition_duration_ms.load(Ordering::Relaxed),
            )
        } else {
            (
                &self.inner.hide_transition,
                self.inner.hide_transition_duration_ms.load(Ordering::Relaxed),
            )
        };
        if duration_ms > 0 {
            let transition = TransitionSource::new(
                &self.inner.source,
                if visible {
                    transition::Direction::In
                } else {
                    transition::Direction::Out
                },
                duration_ms,
            );
            transition.start(now);
            *slot.lock() = Some(transition);
        }

        if let Some(scene) = self.inner.scene.upgrade() {
            scene.signals.emit(&SceneEvent::ItemVisible {
                item_id: self.inner.id,
                visible,
            });
        }
    }

    /// Whether the item is locked against edits.
    pub fn locked(&self) -> bool {
        self.inner.locked.load(Ordering::Relaxed)
    }

    /// Lock or unlock the item.
    pub fn set_locked(&self, locked: bool) {
        self.inner.locked.store(locked, Ordering::Relaxed);
        if let Some(scene) = self.inner.scene.upgrade() {
            scene.signals.emit(&SceneEvent::ItemLocked {
                item_id: self.inner.id,
                locked,
            });
        }
    }

    /// Current transform.
    pub fn transform(&self) -> Transform {
        *self.inner.transform.lock()
    }

    /// Replace the transform.
    pub fn set_transform(&self, transform: Transform) {
        if self.locked() {
            warn!("ignoring transform on locked item {}", self.inner.id);
            return;
        }
        *self.inner.transform.lock() = transform;
        if let Some(scene) = self.inner.scene.upgrade() {
            scene
                .signals
                .emit(&SceneEvent::ItemTransform { item_id: self.inner.id });
        }
    }

    /// Current crop.
    pub fn crop(&self) -> Crop {
        *self.inner.crop.lock()
    }

    /// Replace the crop.
    pub fn set_crop(&self, crop: Crop) {
        *self.inner.crop.lock() = crop;
    }

    /// Current scale filter.
    pub fn scale_filter(&self) -> ScaleFilter {
        *self.inner.scale_filter.lock()
    }

    /// Replace the scale filter.
    pub fn set_scale_filter(&self, filter: ScaleFilter) {
        *self.inner.scale_filter.lock() = filter;
    }

    /// Current blend mode.
    pub fn blend_mode(&self) -> BlendMode {
        *self.inner.blend_mode.lock()
    }

    /// Replace the blend mode.
    pub fn set_blend_mode(&self, mode: BlendMode) {
        *self.inner.blend_mode.lock() = mode;
    }

    /// Configure the show transition duration; `0` disables it.
    pub fn set_show_transition_duration_ms(&self, ms: u32) {
        self.inner
            .show_transition_duration_ms
            .store(ms, Ordering::Relaxed);
    }

    /// Configure the hide transition duration; `0` disables it.
    pub fn set_hide_transition_duration_ms(&self, ms: u32) {
        self.inner
            .hide_transition_duration_ms
            .store(ms, Ordering::Relaxed);
    }

    /// Configured show transition duration in milliseconds.
    pub fn show_transition_duration_ms(&self) -> u32 {
        self.inner.show_transition_duration_ms.load(Ordering::Relaxed)
    }

    /// Configured hide transition duration in milliseconds.
    pub fn hide_transition_duration_ms(&self) -> u32 {
        self.inner.hide_transition_duration_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn take_actions(&self) -> parking_lot::MutexGuard<'_, Vec<AudioAction>> {
        self.inner.actions.lock()
    }

    pub(crate) fn active_show_transition(&self) -> Option<TransitionSource> {
        let mut slot = self.inner.show_transition.lock();
        prune_done(&mut slot);
        slot.clone()
    }

    pub(crate) fn active_hide_transition(&self) -> Option<TransitionSource> {
        let mut slot = self.inner.hide_transition.lock();
        prune_done(&mut slot);
        slot.clone()
    }

    pub(crate) fn detach_child(&self) {
        if self.inner.active_refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.source.release_active();
        }
    }

    pub(crate) fn persist_extra(&self) -> serde_json::Map<String, serde_json::Value> {
        self.inner.persist_extra.lock().clone()
    }

    pub(crate) fn set_persist_extra(&self, extra: serde_json::Map<String, serde_json::Value>) {
        *self.inner.persist_extra.lock() = extra;
    }
}

fn prune_done(slot: &mut Option<TransitionSource>) {
    if slot.as_ref().is_some_and(|t| !t.is_active()) {
        *slot = None;
    }
}

pub(crate) struct SceneShared {
    source: OnceLock<Source>,
    is_group: bool,
    /// Serializes topology mutations; taken before the item list.
    video: Mutex<()>,
    /// The item list doubles as the scene's audio mutex.
    items: Mutex<Vec<SceneItem>>,
    next_item_id: AtomicU64,
    pub(crate) signals: SignalHub<SceneEvent>,
    /// Custom canvas size for groups; `None` follows the engine canvas.
    custom_size: Mutex<Option<(u32, u32)>>,
    /// Unknown persisted fields, carried verbatim across save/load.
    persist_extra: Mutex<serde_json::Map<String, serde_json::Value>>,
}

/// A scene (or group): an ordered collection of items composing child
/// sources.
#[derive(Clone)]
pub struct Scene {
    inner: Arc<SceneShared>,
}

impl Scene {
    /// Create a scene. `is_group` marks nested grouping containers.
    pub fn new(name: &str, is_group: bool, channels: usize, sample_rate: u32) -> Self {
        let inner = Arc::new(SceneShared {
            source: OnceLock::new(),
            is_group,
            video: Mutex::new(()),
            items: Mutex::new(Vec::new()),
            next_item_id: AtomicU64::new(1),
            signals: SignalHub::new(),
            custom_size: Mutex::new(None),
            persist_extra: Mutex::new(serde_json::Map::new()),
        });

        let adapter = audio::SceneAudioAdapter::new(Arc::downgrade(&inner));
        let source = Source::new(
            name,
            SOURCE_AUDIO | SOURCE_VIDEO | SOURCE_COMPOSITE,
            channels,
            sample_rate,
            Some(Box::new(adapter)),
        );
        inner
            .source
            .set(source)
            .unwrap_or_else(|_| unreachable!("scene source set once"));

        Self { inner }
    }

    /// The scene's own composite source.
    pub fn source(&self) -> &Source {
        self.inner.source.get().expect("scene source initialized")
    }

    /// Stable identity (the composite source's id).
    pub fn id(&self) -> Uuid {
        self.source().id()
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.source().name()
    }

    /// Whether this scene is a group.
    pub fn is_group(&self) -> bool {
        self.inner.is_group
    }

    /// Custom canvas size for groups.
    pub fn custom_size(&self) -> Option<(u32, u32)> {
        *self.inner.custom_size.lock()
    }

    /// Set or clear the custom canvas size.
    pub fn set_custom_size(&self, size: Option<(u32, u32)>) {
        *self.inner.custom_size.lock() = size;
    }

    /// Observe scene signals.
    pub fn signals(&self) -> &SignalHub<SceneEvent> {
        &self.inner.signals
    }

    /// Append an item wrapping `source`. Fails if the addition would create
    /// a cycle or nest a group inside a group.
    pub fn add(&self, source: &Source) -> Result<SceneItem, SceneError> {
        let _topology = self.inner.video.lock();

        if source.references_source(self.source()) {
            return Err(SceneError::WouldRecurse(source.name()));
        }
        if self.inner.is_group && source.is_composite() {
            return Err(SceneError::InvalidChild(
                source.name(),
                "groups cannot nest composite sources",
            ));
        }

        let id = self.inner.next_item_id.fetch_add(1, Ordering::Relaxed);
        let item = SceneItem {
            inner: Arc::new(SceneItemShared {
                id,
                scene: Arc::downgrade(&self.inner),
                source: source.clone(),
                user_visible: AtomicBool::new(true),
                visible: AtomicBool::new(true),
                locked: AtomicBool::new(false),
                actions: Mutex::new(Vec::new()),
                transform: Mutex::new(Transform::default()),
                crop: Mutex::new(Crop::default()),
                scale_filter: Mutex::new(ScaleFilter::default()),
                blend_mode: Mutex::new(BlendMode::default()),
                show_transition: Mutex::new(None),
                hide_transition: Mutex::new(None),
                show_transition_duration_ms: AtomicU32::new(0),
                hide_transition_duration_ms: AtomicU32::new(0),
                active_refs: AtomicI64::new(1),
                persist_extra: Mutex::new(serde_json::Map::new()),
            }),
        };
        source.addref_active();

        self.inner.items.lock().push(item.clone());
        info!("scene '{}': added item {} ('{}')", self.name(), id, source.name());
        self.inner.signals.emit(&SceneEvent::ItemAdd { item_id: id });
        Ok(item)
    }

    /// Remove an item from the scene.
    pub fn remove(&self, item: &SceneItem) -> Result<(), SceneError> {
        let _topology = self.inner.video.lock();
        let mut items = self.inner.items.lock();
        let idx = items
            .iter()
            .position(|i| i == item)
            .ok_or(SceneError::ItemNotFound)?;
        items.remove(idx);
        drop(items);

        if item.inner.active_refs.swap(0, Ordering::AcqRel) > 0 {
            item.inner.source.release_active();
        }
        self.inner
            .signals
            .emit(&SceneEvent::ItemRemove { item_id: item.id() });
        Ok(())
    }

    /// Move an item to a new z-order position.
    pub fn reorder(&self, item: &SceneItem, new_idx: usize) -> Result<(), SceneError> {
        let _topology = self.inner.video.lock();
        let mut items = self.inner.items.lock();
        let idx = items
            .iter()
            .position(|i| i == item)
            .ok_or(SceneError::ItemNotFound)?;
        let item = items.remove(idx);
        let new_idx = new_idx.min(items.len());
        items.insert(new_idx, item);
        drop(items);
        self.inner.signals.emit(&SceneEvent::Reorder);
        Ok(())
    }

    /// Snapshot of the item list in z-order.
    pub fn items(&self) -> Vec<SceneItem> {
        self.inner.items.lock().clone()
    }

    pub(crate) fn shared(&self) -> &Arc<SceneShared> {
        &self.inner
    }

    pub(crate) fn persist_extra(&self) -> serde_json::Map<String, serde_json::Value> {
        self.inner.persist_extra.lock().clone()
    }

    pub(crate) fn set_persist_extra(&self, extra: serde_json::Map<String, serde_json::Value>) {
        *self.inner.persist_extra.lock() = extra;
    }
}

impl SceneShared {
    pub(crate) fn items_snapshot(&self) -> Vec<SceneItem> {
        self.items.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn audio_source(name: &str) -> Source {
        Source::new(name, SOURCE_AUDIO, 2, 48_000, None)
    }

    #[test]
    fn add_remove_signal() {
        let scene = Scene::new("main", false, 2, 48_000);
        let added = Arc::new(AtomicUsize::new(0));
        let added2 = Arc::clone(&added);
        scene.signals().connect(move |event| {
            if matches!(event, SceneEvent::ItemAdd { .. }) {
                added2.fetch_add(1, Ordering::Relaxed);
            }
        });

        let mic = audio_source("mic");
        let item = scene.add(&mic).unwrap();
        assert_eq!(added.load(Ordering::Relaxed), 1);
        assert!(mic.active());

        scene.remove(&item).unwrap();
        assert!(!mic.active());
        assert!(scene.items().is_empty());
    }

    #[test]
    fn cycle_rejected() {
        let outer = Scene::new("outer", false, 2, 48_000);
        let inner = Scene::new("inner", false, 2, 48_000);

        outer.add(inner.source()).unwrap();
        // inner -> outer would close the loop.
        let err = inner.add(outer.source()).unwrap_err();
        assert!(matches!(err, SceneError::WouldRecurse(_)));

        // Direct self-reference is also rejected.
        assert!(outer.add(outer.source()).is_err());
    }

    #[test]
    fn group_cannot_nest_composites() {
        let group = Scene::new("grp", true, 2, 48_000);
        let nested = Scene::new("nested", false, 2, 48_000);
        assert!(matches!(
            group.add(nested.source()),
            Err(SceneError::InvalidChild(_, _))
        ));
        assert!(group.add(&audio_source("mic")).is_ok());
    }

    #[test]
    fn reorder_moves_items() {
        let scene = Scene::new("main", false, 2, 48_000);
        let a = scene.add(&audio_source("a")).unwrap();
        let _b = scene.add(&audio_source("b")).unwrap();

        scene.reorder(&a, 1).unwrap();
        let items = scene.items();
        assert_eq!(items[1], a);
    }

    #[test]
    fn visibility_queues_action() {
        let scene = Scene::new("main", false, 2, 48_000);
        let item = scene.add(&audio_source("mic")).unwrap();

        item.set_visible(false);
        assert!(!item.visible());
        // Audio-side visibility flips only when the action is applied.
        assert!(item.audio_visible());
        assert_eq!(item.take_actions().len(), 1);

        // Redundant set is a no-op.
        item.set_visible(false);
        assert_eq!(item.take_actions().len(), 1);
    }

    #[test]
    fn locked_item_ignores_transform() {
        let scene = Scene::new("main", false, 2, 48_000);
        let item = scene.add(&audio_source("mic")).unwrap();
        item.set_locked(true);

        let mut t = Transform::default();
        t.pos_x = 100.0;
        item.set_transform(t);
        assert_eq!(item.transform().pos_x, 0.0);
    }
}
