use anyhow::{Context, Result};

use proxpi_service::Config;

use crate::endpoints;
use crate::service::Service;

/// Builds the service state and runs the HTTP server until shutdown.
pub fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("proxpi")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let bind = config.bind.clone();
        let service = Service::create(config).context("failed to create service state")?;

        // Warm the project list in the background so the first client
        // request doesn't pay for the initial upstream fetch.
        let warmup = service.clone();
        tokio::spawn(async move {
            if let Err(error) = warmup.aggregator().list_projects().await {
                tracing::warn!(%error, "Initial project list fetch failed");
            }
        });

        let app = endpoints::create_app(service);

        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("unable to bind to {bind}"))?;
        tracing::info!("Starting HTTP server on {}", listener.local_addr()?);
        axum::serve(listener, app.into_make_service())
            .await
            .context("server terminated")?;

        Ok(())
    })
}
