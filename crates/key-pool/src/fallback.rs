//! Statically configured fallback key
//!
//! Used when the pool has nothing to hand out, either because it is empty or
//! because the store cannot be reached. The value is read once, at
//! construction, from an environment-style lookup and held as a `Secret`.

use common::Secret;
use tracing::{debug, info};

/// Environment variable the reference deployment reads its fallback key from.
pub const DEFAULT_FALLBACK_ENV: &str = "TAVILY_API_KEY";

/// Last-resort credential source. Never touches the store.
#[derive(Clone)]
pub struct FallbackResolver {
    source: String,
    key: Option<Secret<String>>,
}

impl FallbackResolver {
    /// Resolver with no fallback key.
    pub fn none() -> Self {
        Self {
            source: "none".into(),
            key: None,
        }
    }

    /// Resolver serving a fixed key. Blank keys count as unset.
    pub fn fixed(key: impl Into<String>) -> Self {
        Self {
            source: "fixed".into(),
            key: normalize(key.into()),
        }
    }

    /// Read the fallback key from process environment variable `var`.
    pub fn from_env(var: &str) -> Self {
        Self::from_lookup(var, |name| std::env::var(name).ok())
    }

    /// Read the fallback key through an arbitrary key-value lookup.
    pub fn from_lookup<F>(var: &str, lookup: F) -> Self
    where
        F: FnOnce(&str) -> Option<String>,
    {
        let key = lookup(var).and_then(normalize);
        if key.is_some() {
            info!(source = var, "fallback key configured");
        } else {
            debug!(source = var, "no fallback key configured");
        }
        Self {
            source: var.to_string(),
            key,
        }
    }

    /// The fallback key, or `None` if unset.
    pub fn resolve(&self) -> Option<String> {
        self.key.as_ref().map(|key| key.expose().clone())
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    /// Where the key was looked up (variable name, "fixed" or "none").
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Debug for FallbackResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackResolver")
            .field("source", &self.source)
            .field("configured", &self.key.is_some())
            .finish()
    }
}

fn normalize(key: String) -> Option<Secret<String>> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(Secret::new(trimmed.to_string()))
    }
}
