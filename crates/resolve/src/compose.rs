//! Ordered fold of tag layers into one effective entity set per type.

use serde_json::Value as Json;
use strata_core::{ComposedBundle, EntitySet, SectionStamps, TagLayer};

/// Fold layers root-first into effective event and tip sets.
///
/// Per layer: merge its entities first, then apply its tombstones. A layer
/// therefore cannot resurrect an id it tombstones itself, while a strictly
/// later layer can redeclare a previously deleted id.
pub fn compose_sets(layers: &[TagLayer]) -> (EntitySet, EntitySet) {
    let mut events = EntitySet::new();
    let mut tips = EntitySet::new();
    for layer in layers {
        for e in layer.events.iter().chain(layer.archived_events.iter()) {
            events.merge(e);
        }
        for t in &layer.tips {
            tips.merge(t);
        }
        for id in &layer.event_tombstones {
            events.remove(id);
        }
        for id in &layer.tip_tombstones {
            tips.remove(id);
        }
    }
    (events, tips)
}

/// Compose a bundle from an ancestry chain (root first). The leaf layer's
/// own config and section stamps are surfaced verbatim; ancestor configs are
/// not merged.
pub fn compose(layers: &[TagLayer]) -> ComposedBundle {
    let (events, tips) = compose_sets(layers);
    let events = events.into_entities();
    let archived_events: Vec<Json> = events
        .iter()
        .filter(|e| e.get("archived").and_then(Json::as_bool) == Some(true))
        .cloned()
        .collect();
    let tips = tips.into_entities();
    match layers.last() {
        Some(leaf) => ComposedBundle {
            tag: leaf.tag.clone(),
            tag_config: leaf.config.clone(),
            events,
            archived_events,
            tips,
            updated: leaf.updated.clone(),
            failed: false,
        },
        None => ComposedBundle {
            tag: String::new(),
            tag_config: Json::Object(serde_json::Map::new()),
            events,
            archived_events,
            tips,
            updated: SectionStamps::default(),
            failed: false,
        },
    }
}
