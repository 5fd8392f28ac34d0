//! Hard-caching HTTP(S) proxy for repeatable scrape and archival runs,
//! backed by SQLite and Zstd. Cached responses are served byte-identically
//! across runs; origin is only consulted on a miss.

pub mod cache;
pub mod cli;
pub mod logging;
pub mod proxy;
pub mod rules;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cache::SqliteCache;
use crate::proxy::upstream::UpstreamClient;
use crate::rules::RuleCache;
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    let stat = std::fs::metadata(&settings.cache_dir).with_context(|| {
        format!(
            "cache directory {} does not exist",
            settings.cache_dir.display()
        )
    })?;
    if !stat.is_dir() {
        bail!(
            "cache location {} must be a directory",
            settings.cache_dir.display()
        );
    }
    info!(path = %settings.cache_dir.display(), "cache location");
    if let Some(proxy) = &settings.upstream_proxy {
        info!(proxy, "chaining origin fetches through upstream proxy");
    }

    let cache: Arc<dyn cache::Cache> = Arc::new(SqliteCache::new(settings.cache_dir.clone()));
    let rules = Arc::new(RuleCache::new());
    let upstream = Arc::new(UpstreamClient::new(&settings)?);

    let app = proxy::AppContext::new(settings, cache, rules, upstream);
    proxy::run(app).await
}
