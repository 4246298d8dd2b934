//! Strata public API façade (in-process).
//!
//! This crate defines the stable trait consumers depend on. The in-process
//! implementation wraps a [`Resolver`]; a mock is provided for tests.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value as Json;
use tracing::info;

pub use strata_core::{ComposedBundle, RootConfig, StrataError, StrataResult};
pub use strata_overlay::OverrideDocument;
pub use strata_resolve::{Resolver, ResolverOptions};

use strata_core::sanitize_tag;
use strata_overlay::build_override;

/// Declarative Strata API surface.
#[async_trait::async_trait]
pub trait StrataApi: Send + Sync {
    /// Resolve the effective bundle for the active tag. `force_refresh`
    /// discards cached state for the tag and the root config first.
    async fn resolve(&self, force_refresh: bool) -> StrataResult<Arc<ComposedBundle>>;

    /// Compute the minimal override document for edits made at `tag`
    /// (the active tag when `None`).
    async fn build_override(
        &self,
        desired_events: &[Json],
        desired_tips: &[Json],
        tag: Option<&str>,
    ) -> StrataResult<OverrideDocument>;

    /// Set the explicit tag override; clears all cached state.
    fn set_active_tag(&self, tag: &str) -> StrataResult<()>;

    fn active_tag(&self) -> Option<String>;

    /// Drop every cached bundle and the root config.
    fn reset_cache(&self);

    /// Last successfully composed bundle, without awaiting.
    fn current(&self) -> Option<Arc<ComposedBundle>>;
}

// ----------------- In-process implementation -----------------

pub struct InProcApi {
    resolver: Arc<Resolver>,
}

impl InProcApi {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }
}

#[async_trait::async_trait]
impl StrataApi for InProcApi {
    async fn resolve(&self, force_refresh: bool) -> StrataResult<Arc<ComposedBundle>> {
        let t0 = Instant::now();
        info!(force = force_refresh, "api: resolve start");
        let res = self.resolver.resolve(force_refresh).await;
        match &res {
            Ok(b) => info!(
                tag = %b.tag,
                events = b.events.len(),
                tips = b.tips.len(),
                took_ms = %t0.elapsed().as_millis(),
                "api: resolve ok"
            ),
            Err(e) => info!(error = %e, took_ms = %t0.elapsed().as_millis(), "api: resolve failed"),
        }
        res
    }

    async fn build_override(
        &self,
        desired_events: &[Json],
        desired_tips: &[Json],
        tag: Option<&str>,
    ) -> StrataResult<OverrideDocument> {
        let t0 = Instant::now();
        let tag = match tag {
            Some(raw) => sanitize_tag(raw).ok_or_else(|| {
                StrataError::TagResolution(format!("tag {raw:?} sanitizes to empty"))
            })?,
            None => self.resolver.resolved_tag().await?,
        };
        info!(tag = %tag, "api: build_override start");
        let fetcher = self.resolver.fetcher();
        let doc = build_override(&*fetcher, &tag, desired_events, desired_tips).await?;
        info!(tag = %tag, took_ms = %t0.elapsed().as_millis(), "api: build_override ok");
        Ok(doc)
    }

    fn set_active_tag(&self, tag: &str) -> StrataResult<()> {
        self.resolver.set_active_tag(tag)
    }

    fn active_tag(&self) -> Option<String> {
        self.resolver.active_tag()
    }

    fn reset_cache(&self) {
        self.resolver.reset_cache()
    }

    fn current(&self) -> Option<Arc<ComposedBundle>> {
        self.resolver.current()
    }
}

// ----------------- Mock implementation -----------------

/// Canned-response mock for consumers' tests.
#[derive(Default)]
pub struct MockApi {
    pub bundle: Option<Arc<ComposedBundle>>,
    pub override_doc: Option<OverrideDocument>,
    tag: Mutex<Option<String>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StrataApi for MockApi {
    async fn resolve(&self, _force_refresh: bool) -> StrataResult<Arc<ComposedBundle>> {
        self.bundle
            .clone()
            .ok_or_else(|| StrataError::Internal("no bundle configured".into()))
    }

    async fn build_override(
        &self,
        _desired_events: &[Json],
        _desired_tips: &[Json],
        _tag: Option<&str>,
    ) -> StrataResult<OverrideDocument> {
        self.override_doc
            .clone()
            .ok_or_else(|| StrataError::Internal("no override configured".into()))
    }

    fn set_active_tag(&self, tag: &str) -> StrataResult<()> {
        let tag = sanitize_tag(tag)
            .ok_or_else(|| StrataError::TagResolution("empty override".into()))?;
        *self.tag.lock().unwrap() = Some(tag);
        Ok(())
    }

    fn active_tag(&self) -> Option<String> {
        self.tag.lock().unwrap().clone()
    }

    fn reset_cache(&self) {}

    fn current(&self) -> Option<Arc<ComposedBundle>> {
        self.bundle.clone()
    }
}
