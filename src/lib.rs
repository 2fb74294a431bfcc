pub mod cache;
pub mod cli;
pub mod http;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod settings;
pub mod sign;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::cache::{Cache, CacheConfig, MetaIndex};
use crate::http::App;
use crate::settings::Settings;
use crate::storage::StorageProvider;
use crate::storage::s3::S3Provider;

pub async fn run(settings: Settings) -> Result<()> {
    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen))?;
    run_on(settings, listener).await
}

/// Serves on an already-bound listener; the integration harness binds port
/// zero and calls this directly.
pub async fn run_on(settings: Settings, listener: TcpListener) -> Result<()> {
    if let Some(address) = settings.metrics_listen {
        tokio::spawn(async move {
            info!(%address, "metrics endpoint starting");
            if let Err(err) = metrics::serve(address).await {
                error!(error = %err, "metrics endpoint failed");
            }
        });
    }
    let app = build_app(settings).await?;
    http::run(listener, app).await
}

pub async fn build_app(settings: Settings) -> Result<Arc<App>> {
    let settings = Arc::new(settings);
    let index = MetaIndex::open(&settings.database_dir)?;
    let cache = Cache::open(
        CacheConfig {
            cache_dir: settings.cache_dir.clone(),
            tmp_dir: settings.tmp_dir.clone(),
            cache_size: settings.cache_size,
            free_space_batch_size: settings.free_space_batch_size_in_bytes,
            gzip_content_types: settings.gzip_content_types.clone(),
        },
        index,
    )
    .await?;
    cache.spawn_watchdog();

    let providers = settings
        .hosts
        .iter()
        .map(|(name, host)| {
            (
                name.clone(),
                Arc::new(S3Provider::from_host(host)) as Arc<dyn StorageProvider>,
            )
        })
        .collect();

    Ok(Arc::new(App {
        settings,
        cache,
        providers,
    }))
}
