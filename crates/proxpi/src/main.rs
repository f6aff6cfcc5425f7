//! proxpi.
//!
//! proxpi is a caching reverse proxy for "Simple Repository" package
//! indexes: point your installer at it instead of the upstream index and
//! it serves listings from an in-memory TTL cache and package files from a
//! size-bounded on-disk cache, merging any number of extra indexes behind
//! one endpoint.

use anyhow::{Context, Result};

mod endpoints;
mod logging;
mod server;
mod service;


fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            eprintln!("error: {error:?}");
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let config =
        proxpi_service::Config::from_env().context("failed loading configuration")?;
    logging::init(&config);
    server::run(config).context("failed to start the server")
}
