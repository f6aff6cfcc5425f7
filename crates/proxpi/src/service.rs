use std::sync::Arc;

use anyhow::{Context, Result};

use proxpi_service::http::create_client;
use proxpi_service::{Aggregator, Config, FileCache, IndexSource};

/// Shared application state, constructed once at startup and cloned into
/// every request handler.
#[derive(Clone, Debug)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

#[derive(Debug)]
struct ServiceInner {
    config: Config,
    aggregator: Aggregator,
    file_cache: FileCache,
}

impl Service {
    /// Builds the index sources, aggregator and file cache from `config`.
    ///
    /// Each index source gets its own long-lived HTTP client, as does the
    /// file downloader, so connection pools are reused per upstream.
    pub fn create(config: Config) -> Result<Self> {
        let accept_invalid_certs = config.disable_index_ssl_verification;

        let root = IndexSource::new(
            config.index_url.clone(),
            config.index_ttl,
            create_client(config.timeouts, accept_invalid_certs),
        );
        let extras = config
            .extra_index_urls
            .iter()
            .zip(&config.extra_index_ttls)
            .map(|(url, ttl)| {
                IndexSource::new(
                    url.clone(),
                    *ttl,
                    create_client(config.timeouts, accept_invalid_certs),
                )
            })
            .collect();
        let aggregator = Aggregator::new(root, extras);

        let file_cache = FileCache::new(
            config.cache_size,
            config.cache_dir.clone(),
            config.download_timeout,
            create_client(config.timeouts, accept_invalid_certs),
        )
        .context("failed to prepare the file cache directory")?;

        Ok(Service {
            inner: Arc::new(ServiceInner {
                config,
                aggregator,
                file_cache,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.inner.aggregator
    }

    pub fn file_cache(&self) -> &FileCache {
        &self.inner.file_cache
    }
}
