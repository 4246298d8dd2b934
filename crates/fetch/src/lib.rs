//! Strata fetch: the document transport seam and per-tag layer retrieval.
//!
//! Transports never error: any failure (I/O, status, parse) degrades to an
//! absent document and the layer shrinks to an empty contribution for that
//! section.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Mutex;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use strata_core::{entity_id, RootConfig, SectionStamps, TagLayer};
use tracing::{debug, warn};

/// Path of the root routing document, relative to the document root.
pub const ROOT_CONFIG_PATH: &str = "default.json";

/// Transport contract: one JSON document per path, None on any failure.
#[async_trait::async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch_document(&self, path: &str) -> Option<Json>;
}

/// Filesystem-backed fetcher; paths resolve under a fixed root directory.
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl DocumentFetcher for FileFetcher {
    async fn fetch_document(&self, path: &str) -> Option<Json> {
        let full = self.root.join(path);
        let bytes = match tokio::fs::read(&full).await {
            Ok(b) => b,
            Err(e) => {
                debug!(path = %full.display(), error = %e, "document read failed");
                counter!("strata_fetch_miss_total", 1u64);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(path = %full.display(), error = %e, "document parse failed");
                counter!("strata_fetch_miss_total", 1u64);
                None
            }
        }
    }
}

/// In-memory fetcher with per-path call counting. Used by tests and demos.
#[derive(Default)]
pub struct StaticFetcher {
    docs: FxHashMap<String, Json>,
    calls: Mutex<FxHashMap<String, u64>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, doc: Json) {
        self.docs.insert(path.to_string(), doc);
    }

    pub fn with_document(mut self, path: &str, doc: Json) -> Self {
        self.insert(path, doc);
        self
    }

    /// Times `fetch_document` was called for `path` (hit or miss).
    pub fn calls(&self, path: &str) -> u64 {
        self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait::async_trait]
impl DocumentFetcher for StaticFetcher {
    async fn fetch_document(&self, path: &str) -> Option<Json> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert(0) += 1;
        self.docs.get(path).cloned()
    }
}

/// Fetch and parse `default.json`; malformed or absent degrades to empty.
pub async fn fetch_root_config(fetcher: &dyn DocumentFetcher) -> RootConfig {
    match fetcher.fetch_document(ROOT_CONFIG_PATH).await {
        Some(doc) => serde_json::from_value(doc).unwrap_or_else(|e| {
            warn!(error = %e, "root config malformed; using empty");
            RootConfig::default()
        }),
        None => {
            debug!("root config absent; using empty");
            RootConfig::default()
        }
    }
}

/// Fetch the four documents of one tag concurrently and normalize them into
/// a layer. Each read fails independently.
pub async fn fetch_layer(fetcher: &dyn DocumentFetcher, tag: &str) -> TagLayer {
    let conf_path = format!("{tag}/conf.json");
    let events_path = format!("{tag}/events.json");
    let archive_path = format!("{tag}/events_archive.json");
    let tips_path = format!("{tag}/tips.json");
    let (conf, events, archive, tips) = tokio::join!(
        fetcher.fetch_document(&conf_path),
        fetcher.fetch_document(&events_path),
        fetcher.fetch_document(&archive_path),
        fetcher.fetch_document(&tips_path),
    );
    layer_from_documents(tag, conf, events, archive, tips)
}

/// Normalize raw documents into a layer: unwrap entity arrays, stamp
/// archived flags and extract tombstone ids. Tombstoned entries stay in the
/// entity arrays; the composer performs removal.
pub fn layer_from_documents(
    tag: &str,
    conf: Option<Json>,
    events: Option<Json>,
    archive: Option<Json>,
    tips: Option<Json>,
) -> TagLayer {
    let config = match conf {
        Some(Json::Object(m)) => Json::Object(m),
        _ => Json::Object(serde_json::Map::new()),
    };
    let config_updated = config.get("updated").cloned();

    let (mut events, events_updated) = unwrap_entities(events, "events");
    let (mut archived_events, archive_updated) = unwrap_entities(archive, "events");
    let (tips, tips_updated) = unwrap_entities(tips, "tips");

    for e in events.iter_mut() {
        stamp_archived(e, false, false);
    }
    for e in archived_events.iter_mut() {
        stamp_archived(e, true, true);
    }

    let event_tombstones = tombstone_ids(events.iter().chain(archived_events.iter()));
    let tip_tombstones = tombstone_ids(tips.iter());
    debug!(
        tag,
        events = events.len(),
        archived = archived_events.len(),
        tips = tips.len(),
        tombstones = event_tombstones.len() + tip_tombstones.len(),
        "layer fetched"
    );

    TagLayer {
        tag: tag.to_string(),
        config,
        events,
        archived_events,
        tips,
        event_tombstones,
        tip_tombstones,
        updated: SectionStamps {
            config: config_updated,
            events: events_updated,
            events_archive: archive_updated,
            tips: tips_updated,
        },
    }
}

/// Accept either a bare entity array or `{updated, <key>: [...]}`.
/// Non-object entries are dropped.
fn unwrap_entities(doc: Option<Json>, key: &str) -> (Vec<Json>, Option<Json>) {
    match doc {
        Some(Json::Array(items)) => (keep_objects(items), None),
        Some(Json::Object(mut m)) => {
            let updated = m.get("updated").cloned();
            let items = match m.remove(key) {
                Some(Json::Array(items)) => keep_objects(items),
                _ => Vec::new(),
            };
            (items, updated)
        }
        _ => (Vec::new(), None),
    }
}

fn keep_objects(items: Vec<Json>) -> Vec<Json> {
    items.into_iter().filter(|v| v.is_object()).collect()
}

fn stamp_archived(entity: &mut Json, value: bool, force: bool) {
    if let Some(obj) = entity.as_object_mut() {
        if force || !obj.contains_key("archived") {
            obj.insert("archived".to_string(), Json::Bool(value));
        }
    }
}

fn tombstone_ids<'a>(entities: impl Iterator<Item = &'a Json>) -> FxHashSet<String> {
    entities
        .filter(|e| e.get("deleted").and_then(Json::as_bool) == Some(true))
        .filter_map(entity_id)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn bare_array_and_wrapped_docs_normalize_the_same() {
        let bare = StaticFetcher::new()
            .with_document("t/events.json", json!([{ "id": "e1" }]));
        let wrapped = StaticFetcher::new().with_document(
            "t/events.json",
            json!({ "updated": "2024-01-01", "events": [{ "id": "e1" }] }),
        );
        let a = fetch_layer(&bare, "t").await;
        let b = fetch_layer(&wrapped, "t").await;
        assert_eq!(a.events, b.events);
        assert!(a.updated.events.is_none());
        assert_eq!(b.updated.events, Some(json!("2024-01-01")));
    }

    #[tokio::test]
    async fn archived_stamping_rules() {
        let f = StaticFetcher::new()
            .with_document(
                "t/events.json",
                json!([{ "id": "plain" }, { "id": "marked", "archived": true }]),
            )
            .with_document(
                "t/events_archive.json",
                json!([{ "id": "old", "archived": false }]),
            );
        let layer = fetch_layer(&f, "t").await;
        // Active events keep an existing mark, otherwise get archived=false.
        assert_eq!(layer.events[0]["archived"], json!(false));
        assert_eq!(layer.events[1]["archived"], json!(true));
        // Archive payload is force-stamped true.
        assert_eq!(layer.archived_events[0]["archived"], json!(true));
    }

    #[tokio::test]
    async fn tombstones_flagged_but_entries_retained() {
        let f = StaticFetcher::new()
            .with_document(
                "t/events.json",
                json!([{ "id": "gone", "deleted": true }, { "deleted": true }]),
            )
            .with_document(
                "t/tips.json",
                json!({ "tips": [{ "id": "tip1", "deleted": true }, { "id": "tip2" }] }),
            );
        let layer = fetch_layer(&f, "t").await;
        assert!(layer.event_tombstones.contains("gone"));
        // Missing-id entries never become tombstones.
        assert_eq!(layer.event_tombstones.len(), 1);
        assert_eq!(layer.events.len(), 2);
        assert!(layer.tip_tombstones.contains("tip1"));
        assert_eq!(layer.tip_tombstones.len(), 1);
    }

    #[tokio::test]
    async fn absent_documents_degrade_to_empty_layer() {
        let f = StaticFetcher::new();
        let layer = fetch_layer(&f, "nowhere").await;
        assert_eq!(layer.tag, "nowhere");
        assert!(layer.events.is_empty());
        assert!(layer.archived_events.is_empty());
        assert!(layer.tips.is_empty());
        assert_eq!(layer.config, json!({}));
        assert_eq!(f.calls("nowhere/conf.json"), 1);
        assert_eq!(f.total_calls(), 4);
    }

    #[tokio::test]
    async fn malformed_sections_are_dropped() {
        let f = StaticFetcher::new()
            .with_document("t/conf.json", json!([1, 2, 3]))
            .with_document("t/events.json", json!({ "events": "nope" }))
            .with_document("t/tips.json", json!({ "tips": [42, { "id": "ok" }] }));
        let layer = fetch_layer(&f, "t").await;
        assert_eq!(layer.config, json!({}));
        assert!(layer.events.is_empty());
        assert_eq!(layer.tips, vec![json!({ "id": "ok" })]);
    }

    #[tokio::test]
    async fn root_config_fetch_degrades_to_empty() {
        let f = StaticFetcher::new();
        let root = fetch_root_config(&f).await;
        assert!(root.domains.is_empty());
        assert!(root.default_tag.is_none());

        let f = StaticFetcher::new().with_document(
            ROOT_CONFIG_PATH,
            json!({ "domains": { "h": { "tag": "x" } }, "defaultTag": "d" }),
        );
        let root = fetch_root_config(&f).await;
        assert_eq!(root.domains["h"].tag.as_deref(), Some("x"));
        assert_eq!(root.default_tag.as_deref(), Some("d"));
    }
}
