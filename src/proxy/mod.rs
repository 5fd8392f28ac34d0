pub mod codec;
pub mod headers;
pub mod listener;
pub mod pipeline;
pub mod response;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;

use crate::cache::Cache;
use crate::rules::RuleCache;
use crate::settings::Settings;

use upstream::UpstreamClient;

/// Everything one request needs, wired at startup: injected store, rule
/// cache, and fetch client rather than process-wide singletons.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Arc<dyn Cache>,
    pub rules: Arc<RuleCache>,
    pub upstream: Arc<UpstreamClient>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        cache: Arc<dyn Cache>,
        rules: Arc<RuleCache>,
        upstream: Arc<UpstreamClient>,
    ) -> Self {
        Self {
            settings,
            cache,
            rules,
            upstream,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
