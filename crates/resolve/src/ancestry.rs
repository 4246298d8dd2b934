//! Parent-chain discovery with cycle and depth protection.

use rustc_hash::FxHashSet;
use strata_core::TagLayer;
use strata_fetch::{fetch_layer, DocumentFetcher};
use tracing::warn;

/// Hard cap on chain length; bounds pathological parent declarations.
pub const MAX_ANCESTRY_DEPTH: usize = 16;

/// Walk declared `parent` pointers starting from the leaf tag and return the
/// fetched layers ordered root ancestor first, requested tag last.
///
/// The layers themselves are returned so composition reuses them instead of
/// re-fetching each tag a second time.
pub async fn build_ancestry(fetcher: &dyn DocumentFetcher, leaf: &str) -> Vec<TagLayer> {
    let mut chain: Vec<TagLayer> = Vec::new();
    let mut visited: FxHashSet<String> = FxHashSet::default();
    let mut next = Some(leaf.to_string());
    while let Some(tag) = next {
        if chain.len() >= MAX_ANCESTRY_DEPTH {
            warn!(leaf, depth = chain.len(), "ancestry depth cap reached");
            break;
        }
        let layer = fetch_layer(fetcher, &tag).await;
        visited.insert(tag);
        let parent = layer.parent();
        chain.push(layer);
        next = match parent {
            Some(p) if visited.contains(&p) => {
                warn!(leaf, parent = %p, "ancestry cycle broken");
                None
            }
            other => other,
        };
    }
    chain.reverse();
    chain
}
