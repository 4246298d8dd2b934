//! Active-tag selection from the root routing document.

use strata_core::{sanitize_tag, RootConfig, StrataError, StrataResult};
use tracing::debug;

/// Resolution order: explicit override, then `domains[hostname].tag`, then
/// `defaultTag`. Fails when none yields a sanitized, non-empty tag.
pub fn resolve_tag(
    root: &RootConfig,
    override_tag: Option<&str>,
    hostname: &str,
) -> StrataResult<String> {
    if let Some(tag) = override_tag.and_then(sanitize_tag) {
        debug!(tag = %tag, "tag from explicit override");
        return Ok(tag);
    }
    if !hostname.is_empty() {
        if let Some(tag) = root
            .domains
            .get(hostname)
            .and_then(|d| d.tag.as_deref())
            .and_then(sanitize_tag)
        {
            debug!(tag = %tag, hostname, "tag from domain mapping");
            return Ok(tag);
        }
    }
    if let Some(tag) = root.default_tag.as_deref().and_then(sanitize_tag) {
        debug!(tag = %tag, "tag from defaultTag");
        return Ok(tag);
    }
    Err(StrataError::TagResolution(format!(
        "no usable tag for host {hostname:?}: no override, domain mapping or defaultTag"
    )))
}
