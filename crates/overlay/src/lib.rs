//! Strata overlay: computes the minimal override document that, written back
//! as a tag's own layer, reproduces a desired effective state on top of the
//! parent-composed chain.

#![forbid(unsafe_code)]

use chrono::{SecondsFormat, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use strata_core::{compute_delta, EntitySet, StrataError, StrataResult, TagLayer};
use strata_fetch::{layer_from_documents, DocumentFetcher};
use strata_resolve::{build_ancestry, compose_sets};
use tracing::info;

/// Minimal override for one tag: per-entity deltas, tombstones for removed
/// ids and the leaf's own config restamped with the generation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideDocument {
    pub tag: String,
    /// Generation timestamp (RFC 3339), stamped on every section.
    pub updated: String,
    pub config: Json,
    pub events: Vec<Json>,
    pub events_archive: Vec<Json>,
    pub tips: Vec<Json>,
}

impl OverrideDocument {
    pub fn config_document(&self) -> Json {
        self.config.clone()
    }

    pub fn events_document(&self) -> Json {
        json!({ "updated": self.updated, "events": self.events })
    }

    pub fn archive_document(&self) -> Json {
        json!({ "updated": self.updated, "events": self.events_archive })
    }

    pub fn tips_document(&self) -> Json {
        json!({ "updated": self.updated, "tips": self.tips })
    }

    /// Reinterpret as a tag layer through the same normalization the fetcher
    /// applies, so recomposition sees exactly what a write-back would produce.
    pub fn into_layer(self) -> TagLayer {
        let tag = self.tag.clone();
        layer_from_documents(
            &tag,
            Some(self.config_document()),
            Some(self.events_document()),
            Some(self.archive_document()),
            Some(self.tips_document()),
        )
    }
}

/// Build the override document for `tag` from the caller's desired effective
/// state. Resolves the ancestry, composes every layer except the leaf, then
/// emits per-entity deltas against that parent state and tombstones for ids
/// the desired state dropped.
pub async fn build_override(
    fetcher: &dyn DocumentFetcher,
    tag: &str,
    desired_events: &[Json],
    desired_tips: &[Json],
) -> StrataResult<OverrideDocument> {
    let t0 = std::time::Instant::now();
    let layers = build_ancestry(fetcher, tag).await;
    let leaf = layers
        .last()
        .ok_or_else(|| StrataError::Internal(format!("empty ancestry for {tag}")))?;
    let parents = &layers[..layers.len() - 1];
    let (parent_events, parent_tips) = compose_sets(parents);

    let updated = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut config = leaf.config.clone();
    if let Some(obj) = config.as_object_mut() {
        obj.insert("updated".to_string(), Json::String(updated.clone()));
    }

    let desired_events = EntitySet::from_entities(desired_events);
    let desired_tips = EntitySet::from_entities(desired_tips);
    let (events, events_archive) = section_deltas(&parent_events, &desired_events, true);
    let (tips, _) = section_deltas(&parent_tips, &desired_tips, false);

    counter!("strata_override_docs_total", 1u64);
    info!(
        tag,
        events = events.len(),
        archived = events_archive.len(),
        tips = tips.len(),
        took_ms = %t0.elapsed().as_millis(),
        "override document built"
    );
    Ok(OverrideDocument {
        tag: tag.to_string(),
        updated,
        config,
        events,
        events_archive,
        tips,
    })
}

/// Deltas for one section. Entities whose delta is empty emit nothing; ids
/// present in the parent but absent from the desired state become tombstones.
/// With `split_archived`, entries whose desired entity is archived go to the
/// second vector (the archive file); tombstones always go to the first.
fn section_deltas(
    parent: &EntitySet,
    desired: &EntitySet,
    split_archived: bool,
) -> (Vec<Json>, Vec<Json>) {
    let mut active = Vec::new();
    let mut archived = Vec::new();
    for (id, entity) in desired.iter() {
        let delta = match compute_delta(parent.get(id), entity) {
            Some(d) => d,
            None => continue,
        };
        let mut entry = match delta {
            Json::Object(m) => m,
            // Delta degraded to a non-object (malformed entity); carry the
            // full desired record instead.
            _ => match entity.as_object() {
                Some(m) => m.clone(),
                None => continue,
            },
        };
        entry.insert("id".to_string(), Json::String(id.to_string()));
        let to_archive =
            split_archived && entity.get("archived").and_then(Json::as_bool) == Some(true);
        if to_archive {
            archived.push(Json::Object(entry));
        } else {
            active.push(Json::Object(entry));
        }
    }
    for id in parent.ids() {
        if !desired.contains(id) {
            active.push(json!({ "id": id, "deleted": true }));
        }
    }
    (active, archived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_fetch::StaticFetcher;
    use strata_resolve::compose;

    fn parent_fetcher() -> StaticFetcher {
        StaticFetcher::new()
            .with_document("child/conf.json", json!({ "parent": "base", "title": "Child" }))
            .with_document("base/conf.json", json!({}))
            .with_document(
                "base/events.json",
                json!([
                    { "id": "keep", "title": "kept", "spot": "hall" },
                    { "id": "edit", "title": "old", "spot": "yard" },
                    { "id": "drop", "title": "doomed" }
                ]),
            )
            .with_document(
                "base/tips.json",
                json!({ "tips": [{ "id": "t1", "text": "hi" }] }),
            )
    }

    /// Desired state as the composed parent would surface it (archived
    /// flags stamped), with edits applied.
    fn desired_events() -> Vec<Json> {
        vec![
            json!({ "id": "keep", "title": "kept", "spot": "hall", "archived": false }),
            json!({ "id": "edit", "title": "new", "spot": "yard", "archived": false }),
            json!({ "id": "fresh", "title": "brand new", "archived": false }),
        ]
    }

    #[tokio::test]
    async fn deltas_are_minimal_and_tombstones_emitted() {
        let f = parent_fetcher();
        let doc = build_override(&f, "child", &desired_events(), &[]).await.unwrap();

        // Unchanged entity emits nothing.
        assert!(doc.events.iter().all(|e| e["id"] != json!("keep")));
        // Edited entity carries only the changed field plus its id.
        let edit = doc.events.iter().find(|e| e["id"] == json!("edit")).unwrap();
        assert_eq!(edit, &json!({ "id": "edit", "title": "new" }));
        // New entity is carried whole.
        let fresh = doc.events.iter().find(|e| e["id"] == json!("fresh")).unwrap();
        assert_eq!(fresh["title"], json!("brand new"));
        // Dropped id becomes a tombstone.
        let drop = doc.events.iter().find(|e| e["id"] == json!("drop")).unwrap();
        assert_eq!(drop["deleted"], json!(true));
        // Tips: desired empty, so the inherited tip is tombstoned.
        assert_eq!(doc.tips, vec![json!({ "id": "t1", "deleted": true })]);
    }

    #[tokio::test]
    async fn leaf_config_is_carried_with_fresh_timestamp() {
        let f = parent_fetcher();
        let doc = build_override(&f, "child", &[], &[]).await.unwrap();
        assert_eq!(doc.config["parent"], json!("base"));
        assert_eq!(doc.config["title"], json!("Child"));
        assert_eq!(doc.config["updated"], json!(doc.updated.clone()));
    }

    #[tokio::test]
    async fn archived_entities_route_to_the_archive_section() {
        let f = parent_fetcher();
        let desired = vec![
            json!({ "id": "keep", "title": "kept", "spot": "hall", "archived": true }),
        ];
        let doc = build_override(&f, "child", &desired, &[]).await.unwrap();
        let entry = doc
            .events_archive
            .iter()
            .find(|e| e["id"] == json!("keep"))
            .unwrap();
        assert_eq!(entry["archived"], json!(true));
        // Removed ids still tombstone through the events section.
        assert!(doc.events.iter().any(|e| e["id"] == json!("edit") && e["deleted"] == json!(true)));
    }

    #[tokio::test]
    async fn recomposing_with_the_override_reproduces_the_desired_state() {
        let f = parent_fetcher();
        let desired = desired_events();
        let doc = build_override(&f, "child", &desired, &[]).await.unwrap();

        let mut layers = build_ancestry(&f, "child").await;
        layers.pop(); // replace the leaf with the emitted override
        layers.push(doc.into_layer());
        let bundle = compose(&layers);

        let got = EntitySet::from_entities(bundle.events.iter());
        let want = EntitySet::from_entities(desired.iter());
        assert_eq!(got.len(), want.len());
        for (id, entity) in want.iter() {
            assert_eq!(got.get(id), Some(entity), "entity {id}");
        }
        assert!(!got.contains("drop"));
        assert!(bundle.tips.is_empty());
    }

    #[tokio::test]
    async fn no_parent_chain_emits_full_records() {
        let f = StaticFetcher::new().with_document("solo/conf.json", json!({}));
        let desired = vec![json!({ "id": "a", "v": 1, "archived": false })];
        let doc = build_override(&f, "solo", &desired, &[]).await.unwrap();
        assert_eq!(doc.events.len(), 1);
        assert_eq!(doc.events[0]["v"], json!(1));
        assert!(doc.tips.is_empty());
    }
}
