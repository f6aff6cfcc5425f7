use std::error::Error;

use thiserror::Error;

use proxpi_sources::InvalidNameError;

/// An error that happens while resolving a listing or artifact.
///
/// These are error *kinds*, not wrappers: they are shared between waiters
/// of a coalesced download and mapped onto HTTP statuses at the endpoint
/// layer, so they carry owned strings rather than source errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Every consulted source reports the project or file as unknown.
    #[error("not found")]
    NotFound,
    /// A project name that cannot be normalized.
    #[error(transparent)]
    InvalidName(#[from] InvalidNameError),
    /// An upstream failed and no cached data covers the request.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// An upstream response that could not be parsed.
    #[error("malformed listing: {0}")]
    Malformed(String),
    /// A local disk write or rename failed.
    #[error("io error: {0}")]
    Io(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        // The innermost source is the interesting one; reqwest's own
        // display repeats the URL and obscures the cause.
        let mut source: &dyn Error = &error;
        while let Some(inner) = source.source() {
            source = inner;
        }
        Self::UpstreamUnavailable(source.to_string())
    }
}

impl From<std::io::Error> for FetchError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}
