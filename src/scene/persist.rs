// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scene save/load.
//!
//! Scenes serialize to a nested object tree. Items reference their source by
//! UUID with a name fallback; transforms, visibility, lock, crop, scale
//! filter, blend mode and transition configs round-trip. Unknown fields are
//! preserved verbatim on save. Runtime state (timestamps, encoder state,
//! interleaver state) is never persisted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::SceneError;
use crate::scene::{BlendMode, Crop, ScaleFilter, Scene, Transform};
use crate::source::Source;

/// Reference to an item's source: UUID preferred, name fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    pub name: String,
}

/// Persisted transition configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionDef {
    pub duration_ms: u32,
}

/// Persisted form of one scene item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDef {
    pub source: SourceRef,
    pub visible: bool,
    pub locked: bool,
    pub transform: Transform,
    pub crop: Crop,
    pub scale_filter: ScaleFilter,
    pub blend_mode: BlendMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_transition: Option<TransitionDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide_transition: Option<TransitionDef>,
    /// Fields this version does not understand, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Persisted form of one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDef {
    pub name: String,
    pub uuid: Uuid,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_size: Option<(u32, u32)>,
    pub items: Vec<ItemDef>,
    /// Fields this version does not understand, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Snapshot a scene into its persisted form.
pub fn save_scene(scene: &Scene) -> SceneDef {
    let items = scene
        .items()
        .iter()
        .map(|item| {
            let show = item.show_transition_duration_ms();
            let hide = item.hide_transition_duration_ms();
            ItemDef {
                source: SourceRef {
                    uuid: Some(item.source().id()),
                    name: item.source().name(),
                },
                visible: item.visible(),
                locked: item.locked(),
                transform: item.transform(),
                crop: item.crop(),
                scale_filter: item.scale_filter(),
                blend_mode: item.blend_mode(),
                show_transition: (show > 0).then_some(TransitionDef { duration_ms: show }),
                hide_transition: (hide > 0).then_some(TransitionDef { duration_ms: hide }),
                extra: item.persist_extra(),
            }
        })
        .collect();

    SceneDef {
        name: scene.name(),
        uuid: scene.id(),
        is_group: scene.is_group(),
        custom_size: scene.custom_size(),
        items,
        extra: scene.persist_extra(),
    }
}

/// Rebuild a scene from its persisted form.
///
/// `resolve` maps source references to live sources; items whose source
/// cannot be resolved are skipped with a warning.
pub fn load_scene(
    def: &SceneDef,
    channels: usize,
    sample_rate: u32,
    resolve: &dyn Fn(&SourceRef) -> Option<Source>,
) -> Result<Scene, SceneError> {
    let scene = Scene::new(&def.name, def.is_group, channels, sample_rate);
    scene.set_custom_size(def.custom_size);
    scene.set_persist_extra(def.extra.clone());

    for item_def in &def.items {
        let Some(source) = resolve(&item_def.source) else {
            warn!(
                "scene '{}': source '{}' not found, skipping item",
                def.name, item_def.source.name
            );
            continue;
        };

        let item = scene.add(&source)?;
        item.set_transform(item_def.transform);
        item.set_crop(item_def.crop);
        item.set_scale_filter(item_def.scale_filter);
        item.set_blend_mode(item_def.blend_mode);
        item.set_locked(item_def.locked);
        if let Some(show) = item_def.show_transition {
            item.set_show_transition_duration_ms(show.duration_ms);
        }
        if let Some(hide) = item_def.hide_transition {
            item.set_hide_transition_duration_ms(hide.duration_ms);
        }
        if !item_def.visible {
            item.set_visible(false);
        }
        item.set_persist_extra(item_def.extra.clone());
    }

    Ok(scene)
}

/// Serialize a scene definition to a JSON string.
pub fn to_json(def: &SceneDef) -> serde_json::Result<String> {
    serde_json::to_string_pretty(def)
}

/// Parse a scene definition from a JSON string.
pub fn from_json(json: &str) -> serde_json::Result<SceneDef> {
    serde_json::from_str(json)
}
