//! Entity merge primitives: deep field merge, minimal deltas and the
//! id-keyed accumulator used by the composer.

use rustc_hash::FxHashMap;
use serde_json::Value as Json;

/// Non-empty `id` of an entity object, if present.
pub fn entity_id(entity: &Json) -> Option<&str> {
    entity
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// Recursively merge `over` onto `base`. Scalars: override wins. Objects:
/// merged key by key. Arrays: replaced wholesale, never concatenated.
/// An absent base yields `over` verbatim.
pub fn deep_merge(base: Option<&Json>, over: &Json) -> Json {
    match (base, over) {
        (Some(Json::Object(b)), Json::Object(o)) => {
            let mut out = b.clone();
            for (k, ov) in o.iter() {
                let merged = deep_merge(out.get(k), ov);
                out.insert(k.clone(), merged);
            }
            Json::Object(out)
        }
        _ => over.clone(),
    }
}

/// Fields of `edited` that differ from `base` (deep structural inequality),
/// or None when nothing changed. An absent base yields the full record.
///
/// Nested key removal cannot be expressed: a key present in `base` but
/// absent from `edited` produces no delta entry, so
/// `deep_merge(base, delta)` reproduces `edited` only when the edit did not
/// delete fields.
pub fn compute_delta(base: Option<&Json>, edited: &Json) -> Option<Json> {
    let base = match base {
        Some(b) => b,
        None => return Some(edited.clone()),
    };
    if base == edited {
        return None;
    }
    match (base, edited) {
        (Json::Object(b), Json::Object(e)) => {
            let mut out = serde_json::Map::new();
            for (k, ev) in e.iter() {
                match b.get(k) {
                    Some(bv) if bv == ev => {}
                    Some(bv) => {
                        if let Some(d) = compute_delta(Some(bv), ev) {
                            out.insert(k.clone(), d);
                        }
                    }
                    None => {
                        out.insert(k.clone(), ev.clone());
                    }
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Json::Object(out))
            }
        }
        _ => Some(edited.clone()),
    }
}

/// Id-keyed entity accumulator preserving first-insertion order.
/// Entities without an id are ignored.
#[derive(Debug, Clone, Default)]
pub struct EntitySet {
    map: FxHashMap<String, Json>,
    order: Vec<String>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an entity sequence; on duplicate ids the last one wins.
    pub fn from_entities<'a, I>(entities: I) -> Self
    where
        I: IntoIterator<Item = &'a Json>,
    {
        let mut set = Self::default();
        for e in entities {
            set.replace(e);
        }
        set
    }

    /// Insert or overwrite wholesale (no merging).
    pub fn replace(&mut self, entity: &Json) {
        if let Some(id) = entity_id(entity) {
            if !self.map.contains_key(id) {
                self.order.push(id.to_string());
            }
            self.map.insert(id.to_string(), entity.clone());
        }
    }

    /// Deep-merge onto the existing entry with the same id, creating it if
    /// absent.
    pub fn merge(&mut self, entity: &Json) {
        if let Some(id) = entity_id(entity) {
            let merged = deep_merge(self.map.get(id), entity);
            if !self.map.contains_key(id) {
                self.order.push(id.to_string());
            }
            self.map.insert(id.to_string(), merged);
        }
    }

    pub fn remove(&mut self, id: &str) {
        if self.map.remove(id).is_some() {
            self.order.retain(|x| x != id);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Json> {
        self.map.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Json)> {
        self.order
            .iter()
            .filter_map(move |id| self.map.get(id).map(|v| (id.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Consume into an entity vector in insertion order.
    pub fn into_entities(self) -> Vec<Json> {
        let Self { mut map, order } = self;
        order.into_iter().filter_map(|id| map.remove(&id)).collect()
    }
}
