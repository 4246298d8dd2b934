//! Strata core: untyped entity model, tag layers, composed bundles and errors.

#![forbid(unsafe_code)]

pub mod merge;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub use merge::{compute_delta, deep_merge, entity_id, EntitySet};

/// Root document (`default.json`): hostname-to-tag routing and the fallback tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RootConfig {
    pub updated: Option<Json>,
    pub domains: FxHashMap<String, DomainEntry>,
    pub default_tag: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainEntry {
    pub tag: Option<String>,
}

/// Per-section `updated` markers, carried verbatim from the source documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SectionStamps {
    pub config: Option<Json>,
    pub events: Option<Json>,
    pub events_archive: Option<Json>,
    pub tips: Option<Json>,
}

/// One tag's own, non-inherited contribution. Built once per fetch and never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct TagLayer {
    pub tag: String,
    /// The layer's raw config object; may declare a `parent` tag.
    pub config: Json,
    pub events: Vec<Json>,
    pub archived_events: Vec<Json>,
    pub tips: Vec<Json>,
    /// Ids marked `deleted: true` in this layer. The entries stay in the
    /// entity arrays; removal is the composer's job.
    pub event_tombstones: FxHashSet<String>,
    pub tip_tombstones: FxHashSet<String>,
    pub updated: SectionStamps,
}

impl TagLayer {
    pub fn empty(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            config: Json::Object(serde_json::Map::new()),
            events: Vec::new(),
            archived_events: Vec::new(),
            tips: Vec::new(),
            event_tombstones: FxHashSet::default(),
            tip_tombstones: FxHashSet::default(),
            updated: SectionStamps::default(),
        }
    }

    /// Sanitized parent tag declared in this layer's config, if any.
    pub fn parent(&self) -> Option<String> {
        self.config
            .get("parent")
            .and_then(|v| v.as_str())
            .and_then(sanitize_tag)
    }
}

/// The fully resolved, effective state for a tag after folding its ancestry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposedBundle {
    pub tag: String,
    /// The leaf layer's own raw config; ancestor configs are not merged in.
    pub tag_config: Json,
    pub events: Vec<Json>,
    /// Subset of `events` with `archived == true`.
    pub archived_events: Vec<Json>,
    pub tips: Vec<Json>,
    pub updated: SectionStamps,
    /// Set when composition failed unexpectedly; all sections are empty.
    pub failed: bool,
}

impl ComposedBundle {
    pub fn failed(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            tag_config: Json::Object(serde_json::Map::new()),
            events: Vec::new(),
            archived_events: Vec::new(),
            tips: Vec::new(),
            updated: SectionStamps::default(),
            failed: true,
        }
    }
}

/// Keep only identifier-safe characters; None when nothing survives.
pub fn sanitize_tag(raw: &str) -> Option<String> {
    let tag: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

/// Errors suitable for surfacing across the API boundary.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum StrataError {
    #[error("tag_resolution: {0}")]
    TagResolution(String),
    #[error("composition: {0}")]
    Composition(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type StrataResult<T> = Result<T, StrataError>;
