//! Strata resolve: active-tag selection, ancestry walking, composition and a
//! per-tag TTL cache with request coalescing.
//!
//! The cache is an explicit object owned by a [`Resolver`]; there is no
//! process-global state, so tests construct a fresh resolver each.

#![forbid(unsafe_code)]

mod ancestry;
mod compose;
mod tag;

pub use ancestry::{build_ancestry, MAX_ANCESTRY_DEPTH};
pub use compose::{compose, compose_sets};
pub use tag::resolve_tag;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use strata_core::{sanitize_tag, ComposedBundle, RootConfig, StrataError, StrataResult};
use strata_fetch::{fetch_root_config, DocumentFetcher};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Default bundle TTL (5 minutes); override with `STRATA_CACHE_TTL_SECS`.
pub fn default_cache_ttl() -> Duration {
    let secs = std::env::var("STRATA_CACHE_TTL_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(300);
    Duration::from_secs(secs)
}

pub struct ResolverOptions {
    /// Hostname used for domain-based tag routing; empty when unavailable.
    pub hostname: String,
    pub cache_ttl: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

type BundleRx = watch::Receiver<Option<Arc<ComposedBundle>>>;
type RootRx = watch::Receiver<Option<Arc<RootConfig>>>;

enum TagState {
    Pending { rx: BundleRx, gen: u64 },
    Cached { bundle: Arc<ComposedBundle>, at: Instant },
}

enum RootState {
    Absent,
    Pending { rx: RootRx, gen: u64 },
    Cached { config: Arc<RootConfig>, at: Instant },
}

struct Inner {
    tags: FxHashMap<String, TagState>,
    root: RootState,
    gen: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    current: ArcSwapOption<ComposedBundle>,
}

/// Resolves effective bundles. All cached state lives here; pending slots are
/// installed synchronously before any suspension, so at most one composition
/// runs per tag at a time and an abandoned caller's work still lands in the
/// cache.
pub struct Resolver {
    fetcher: Arc<dyn DocumentFetcher>,
    hostname: String,
    ttl: Duration,
    override_tag: Mutex<Option<String>>,
    shared: Arc<Shared>,
}

impl Resolver {
    pub fn new(fetcher: Arc<dyn DocumentFetcher>, opts: ResolverOptions) -> Self {
        Self {
            fetcher,
            hostname: opts.hostname,
            ttl: opts.cache_ttl,
            override_tag: Mutex::new(None),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    tags: FxHashMap::default(),
                    root: RootState::Absent,
                    gen: 0,
                }),
                current: ArcSwapOption::const_empty(),
            }),
        }
    }

    pub fn fetcher(&self) -> Arc<dyn DocumentFetcher> {
        self.fetcher.clone()
    }

    /// Set the explicit tag override; rejects input that sanitizes to empty.
    /// Clears all cached state so the next resolution re-routes.
    pub fn set_active_tag(&self, raw: &str) -> StrataResult<()> {
        let tag = sanitize_tag(raw).ok_or_else(|| {
            StrataError::TagResolution(format!("override {raw:?} sanitizes to empty"))
        })?;
        info!(tag = %tag, "tag override set");
        *self.override_tag.lock().unwrap() = Some(tag);
        self.reset_cache();
        Ok(())
    }

    pub fn clear_active_tag(&self) {
        *self.override_tag.lock().unwrap() = None;
        self.reset_cache();
    }

    pub fn active_tag(&self) -> Option<String> {
        self.override_tag.lock().unwrap().clone()
    }

    /// Drop every cached bundle and the root config.
    pub fn reset_cache(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.tags.clear();
        inner.root = RootState::Absent;
        debug!("cache reset");
    }

    /// Last successfully composed bundle, without awaiting.
    pub fn current(&self) -> Option<Arc<ComposedBundle>> {
        self.shared.current.load_full()
    }

    /// The tag a resolution would use right now.
    pub async fn resolved_tag(&self) -> StrataResult<String> {
        let root = self.root_config(false).await;
        let over = self.override_tag.lock().unwrap().clone();
        resolve_tag(&root, over.as_deref(), &self.hostname)
    }

    /// Resolve the effective bundle for the active tag. `force` discards any
    /// cached or pending state for the tag and the root config first.
    pub async fn resolve(&self, force: bool) -> StrataResult<Arc<ComposedBundle>> {
        let t0 = Instant::now();
        let root = self.root_config(force).await;
        let over = self.override_tag.lock().unwrap().clone();
        let tag = resolve_tag(&root, over.as_deref(), &self.hostname)?;
        let bundle = self.bundle_for(&tag, force).await;
        info!(
            tag = %tag,
            events = bundle.events.len(),
            tips = bundle.tips.len(),
            took_ms = %t0.elapsed().as_millis(),
            "resolve ok"
        );
        Ok(bundle)
    }

    /// Root config under the same TTL/coalescing policy as bundles; it has no
    /// tag key, so it gets a dedicated slot.
    pub async fn root_config(&self, force: bool) -> Arc<RootConfig> {
        let mut rx = {
            let mut inner = self.shared.inner.lock().unwrap();
            if force {
                inner.root = RootState::Absent;
            }
            if let RootState::Cached { config, at } = &inner.root {
                if at.elapsed() < self.ttl {
                    return config.clone();
                }
            }
            if let RootState::Pending { rx, .. } = &inner.root {
                rx.clone()
            } else {
                inner.gen += 1;
                let gen = inner.gen;
                let (tx, rx) = watch::channel(None);
                inner.root = RootState::Pending { rx: rx.clone(), gen };
                let fetcher = self.fetcher.clone();
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    let config = Arc::new(fetch_root_config(&*fetcher).await);
                    {
                        let mut inner = shared.inner.lock().unwrap();
                        let still_current =
                            matches!(&inner.root, RootState::Pending { gen: g, .. } if *g == gen);
                        if still_current {
                            inner.root = RootState::Cached {
                                config: config.clone(),
                                at: Instant::now(),
                            };
                        }
                    }
                    let _ = tx.send(Some(config));
                });
                rx
            }
        };
        loop {
            let published = rx.borrow().clone();
            if let Some(config) = published {
                return config;
            }
            if rx.changed().await.is_err() {
                error!("root config task ended without a result");
                return Arc::new(RootConfig::default());
            }
        }
    }

    async fn bundle_for(&self, tag: &str, force: bool) -> Arc<ComposedBundle> {
        let mut rx = {
            let mut inner = self.shared.inner.lock().unwrap();
            if force {
                inner.tags.remove(tag);
            }
            if let Some(TagState::Cached { bundle, at }) = inner.tags.get(tag) {
                if at.elapsed() < self.ttl {
                    counter!("strata_cache_hits_total", 1u64);
                    return bundle.clone();
                }
            }
            if let Some(TagState::Pending { rx, .. }) = inner.tags.get(tag) {
                counter!("strata_coalesced_joins_total", 1u64);
                rx.clone()
            } else {
                counter!("strata_cache_misses_total", 1u64);
                inner.gen += 1;
                let gen = inner.gen;
                let (tx, rx) = watch::channel(None);
                inner
                    .tags
                    .insert(tag.to_string(), TagState::Pending { rx: rx.clone(), gen });
                let fetcher = self.fetcher.clone();
                let shared = self.shared.clone();
                let tag_owned = tag.to_string();
                tokio::spawn(async move {
                    let t0 = Instant::now();
                    let layers = build_ancestry(&*fetcher, &tag_owned).await;
                    let bundle = Arc::new(compose(&layers));
                    histogram!(
                        "strata_compose_latency_ms",
                        t0.elapsed().as_secs_f64() * 1000.0
                    );
                    {
                        let mut inner = shared.inner.lock().unwrap();
                        let still_current = matches!(
                            inner.tags.get(&tag_owned),
                            Some(TagState::Pending { gen: g, .. }) if *g == gen
                        );
                        if still_current {
                            inner.tags.insert(
                                tag_owned.clone(),
                                TagState::Cached {
                                    bundle: bundle.clone(),
                                    at: Instant::now(),
                                },
                            );
                        }
                    }
                    shared.current.store(Some(bundle.clone()));
                    let _ = tx.send(Some(bundle));
                });
                rx
            }
        };
        loop {
            let published = rx.borrow().clone();
            if let Some(bundle) = published {
                return bundle;
            }
            if rx.changed().await.is_err() {
                // The composing task died without publishing; degrade to an
                // empty, clearly marked bundle instead of crashing callers.
                error!(tag, "composition ended without a bundle");
                counter!("strata_compose_failures_total", 1u64);
                return Arc::new(ComposedBundle::failed(tag));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_fetch::StaticFetcher;

    fn fetcher_with_chain() -> StaticFetcher {
        StaticFetcher::new()
            .with_document(
                "default.json",
                json!({ "domains": { "example.com": { "tag": "child" } }, "defaultTag": "child" }),
            )
            .with_document("child/conf.json", json!({ "parent": "base" }))
            .with_document(
                "child/events.json",
                json!([{ "id": "x", "title": "override" }]),
            )
            .with_document("base/conf.json", json!({}))
            .with_document(
                "base/events.json",
                json!([{ "id": "x", "title": "base", "spot": "hall" }, { "id": "y" }]),
            )
    }

    fn resolver(fetcher: StaticFetcher, ttl: Duration) -> (Arc<StaticFetcher>, Resolver) {
        let fetcher = Arc::new(fetcher);
        let r = Resolver::new(
            fetcher.clone(),
            ResolverOptions {
                hostname: "example.com".to_string(),
                cache_ttl: ttl,
            },
        );
        (fetcher, r)
    }

    #[tokio::test]
    async fn concurrent_resolutions_coalesce_into_one_fetch_sequence() {
        let (fetcher, r) = resolver(fetcher_with_chain(), Duration::from_secs(300));
        let (a, b) = tokio::join!(r.resolve(false), r.resolve(false));
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.tag, "child");
        assert_eq!(a.events.len(), b.events.len());
        // One layer-fetch sequence per tag: 4 reads each, not 8.
        for path in [
            "child/conf.json",
            "child/events.json",
            "child/events_archive.json",
            "child/tips.json",
            "base/conf.json",
            "base/events.json",
        ] {
            assert_eq!(fetcher.calls(path), 1, "path {path}");
        }
        assert_eq!(fetcher.calls("default.json"), 1);
    }

    #[tokio::test]
    async fn cached_bundle_is_returned_within_ttl() {
        let (fetcher, r) = resolver(fetcher_with_chain(), Duration::from_secs(300));
        let first = r.resolve(false).await.unwrap();
        let second = r.resolve(false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fetcher.calls("child/conf.json"), 1);
    }

    #[tokio::test]
    async fn zero_ttl_treats_entries_as_absent() {
        let (fetcher, r) = resolver(fetcher_with_chain(), Duration::ZERO);
        r.resolve(false).await.unwrap();
        r.resolve(false).await.unwrap();
        assert_eq!(fetcher.calls("child/conf.json"), 2);
    }

    #[tokio::test]
    async fn force_refresh_busts_bundle_and_root_caches() {
        let (fetcher, r) = resolver(fetcher_with_chain(), Duration::from_secs(300));
        r.resolve(false).await.unwrap();
        r.resolve(false).await.unwrap();
        assert_eq!(fetcher.calls("default.json"), 1);
        r.resolve(true).await.unwrap();
        assert_eq!(fetcher.calls("default.json"), 2);
        assert_eq!(fetcher.calls("child/conf.json"), 2);
    }

    #[tokio::test]
    async fn merged_bundle_contents_are_composed() {
        let (_f, r) = resolver(fetcher_with_chain(), Duration::from_secs(300));
        let bundle = r.resolve(false).await.unwrap();
        assert_eq!(bundle.events.len(), 2);
        let x = bundle
            .events
            .iter()
            .find(|e| e["id"] == json!("x"))
            .unwrap();
        assert_eq!(x["title"], json!("override"));
        assert_eq!(x["spot"], json!("hall"));
        assert_eq!(bundle.tag_config, json!({ "parent": "base" }));
    }

    #[tokio::test]
    async fn resolution_failure_is_terminal_and_uncached() {
        let (fetcher, r) = resolver(StaticFetcher::new(), Duration::from_secs(300));
        assert!(r.resolve(false).await.is_err());
        assert!(r.current().is_none());
        assert!(r.resolve(false).await.is_err());
        // Only the root document was ever requested.
        assert_eq!(fetcher.calls("default.json"), 1);
        assert_eq!(fetcher.total_calls(), 1);
    }

    #[tokio::test]
    async fn override_beats_domain_and_resets_cache() {
        let fetcher = fetcher_with_chain().with_document("other/conf.json", json!({}));
        let (fetcher, r) = resolver(fetcher, Duration::from_secs(300));
        let first = r.resolve(false).await.unwrap();
        assert_eq!(first.tag, "child");
        r.set_active_tag("other").unwrap();
        assert_eq!(r.active_tag().as_deref(), Some("other"));
        let second = r.resolve(false).await.unwrap();
        assert_eq!(second.tag, "other");
        // Cache reset forced a root refetch too.
        assert_eq!(fetcher.calls("default.json"), 2);
        assert!(r.set_active_tag("!!!").is_err());
    }

    #[tokio::test]
    async fn current_tracks_last_composed_bundle() {
        let (_f, r) = resolver(fetcher_with_chain(), Duration::from_secs(300));
        assert!(r.current().is_none());
        let bundle = r.resolve(false).await.unwrap();
        let cur = r.current().unwrap();
        assert!(Arc::ptr_eq(&bundle, &cur));
    }
}
