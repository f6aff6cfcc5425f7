use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use url::Url;

use crate::http::ClientTimeouts;

/// Companion defaults applied when only one of the connect/read timeouts
/// is configured.
const COMPANION_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const COMPANION_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Runtime configuration, read from `PROXPI_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root upstream index base URL.
    pub index_url: Url,
    /// Root index cache TTL. Zero disables the root index cache.
    pub index_ttl: Duration,
    /// Extra upstream index base URLs, in precedence order.
    pub extra_index_urls: Vec<Url>,
    /// TTLs position-aligned with `extra_index_urls`.
    pub extra_index_ttls: Vec<Duration>,
    /// File-cache byte budget. Zero disables file caching.
    pub cache_size: u64,
    /// File-cache directory. `None` means a fresh process-owned temporary
    /// directory, removed on exit.
    pub cache_dir: Option<PathBuf>,
    /// Force `application/octet-stream` for file responses.
    pub binary_file_mime_type: bool,
    /// Skip TLS verification for upstream calls.
    pub disable_index_ssl_verification: bool,
    /// How long a request waits for a download before falling back to a
    /// redirect to the upstream URL.
    pub download_timeout: Duration,
    /// Upstream connect/read timeouts.
    pub timeouts: ClientTimeouts,
    /// Logging threshold, fed into the tracing env filter.
    pub logging_level: String,
    /// Host and port to bind the HTTP server to.
    pub bind: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            index_url: Url::parse("https://pypi.org/simple/").expect("static url"),
            index_ttl: Duration::from_secs(1800),
            extra_index_urls: Vec::new(),
            extra_index_ttls: Vec::new(),
            cache_size: 5_000_000_000,
            cache_dir: None,
            binary_file_mime_type: false,
            disable_index_ssl_verification: false,
            download_timeout: Duration::from_secs_f64(0.9),
            timeouts: ClientTimeouts::default(),
            logging_level: "info".to_owned(),
            bind: "127.0.0.1:5000".to_owned(),
        }
    }
}

impl Config {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through an arbitrary variable lookup. Extracted
    /// from [`Config::from_env`] so tests can inject variables without
    /// mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(raw) = nonempty(&lookup, "PROXPI_INDEX_URL") {
            config.index_url = parse_index_url(&raw)?;
        }
        if let Some(raw) = nonempty(&lookup, "PROXPI_INDEX_TTL") {
            config.index_ttl = parse_ttl("PROXPI_INDEX_TTL", &raw)?;
        }

        if let Some(raw) = nonempty(&lookup, "PROXPI_EXTRA_INDEX_URLS") {
            config.extra_index_urls = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_index_url)
                .collect::<Result<_>>()?;
        }
        // The singular spelling is the legacy name of the TTL list.
        let extra_ttls = nonempty(&lookup, "PROXPI_EXTRA_INDEX_TTLS")
            .or_else(|| nonempty(&lookup, "PROXPI_EXTRA_INDEX_TTL"));
        config.extra_index_ttls = match extra_ttls {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_ttl("PROXPI_EXTRA_INDEX_TTLS", s))
                .collect::<Result<_>>()?,
            None => vec![Duration::from_secs(180); config.extra_index_urls.len()],
        };
        if config.extra_index_ttls.len() != config.extra_index_urls.len() {
            bail!(
                "number of extra index URLs doesn't equal number of extra index \
                 times-to-live: {} != {}",
                config.extra_index_urls.len(),
                config.extra_index_ttls.len(),
            );
        }

        if let Some(raw) = nonempty(&lookup, "PROXPI_CACHE_SIZE") {
            config.cache_size = raw
                .parse()
                .with_context(|| format!("invalid PROXPI_CACHE_SIZE `{raw}`"))?;
        }
        if let Some(raw) = nonempty(&lookup, "PROXPI_CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(raw));
        }

        config.binary_file_mime_type = is_enabled(&lookup, "PROXPI_BINARY_FILE_MIME_TYPE");
        config.disable_index_ssl_verification =
            is_enabled(&lookup, "PROXPI_DISABLE_INDEX_SSL_VERIFICATION");

        if let Some(raw) = nonempty(&lookup, "PROXPI_DOWNLOAD_TIMEOUT") {
            let seconds: f64 = raw
                .parse()
                .with_context(|| format!("invalid PROXPI_DOWNLOAD_TIMEOUT `{raw}`"))?;
            if !seconds.is_finite() || seconds < 0.0 {
                bail!("invalid PROXPI_DOWNLOAD_TIMEOUT `{raw}`");
            }
            config.download_timeout = Duration::from_secs_f64(seconds);
        }

        let connect = parse_seconds(&lookup, "PROXPI_CONNECT_TIMEOUT")?;
        let read = parse_seconds(&lookup, "PROXPI_READ_TIMEOUT")?;
        config.timeouts = match (connect, read) {
            (Some(connect), Some(read)) => ClientTimeouts {
                connect: Some(connect),
                read: Some(read),
            },
            (Some(connect), None) => ClientTimeouts {
                connect: Some(connect),
                read: Some(COMPANION_READ_TIMEOUT),
            },
            (None, Some(read)) => ClientTimeouts {
                connect: Some(COMPANION_CONNECT_TIMEOUT),
                read: Some(read),
            },
            (None, None) => ClientTimeouts::default(),
        };

        if let Some(raw) = nonempty(&lookup, "PROXPI_LOGGING_LEVEL") {
            config.logging_level = raw;
        }
        if let Some(raw) = nonempty(&lookup, "PROXPI_BIND") {
            config.bind = raw;
        }

        Ok(config)
    }

    /// TTL for the source at `index_id` (0 is the root).
    pub fn ttl_for(&self, index_id: usize) -> Duration {
        if index_id == 0 {
            self.index_ttl
        } else {
            self.extra_index_ttls[index_id - 1]
        }
    }
}

fn nonempty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn is_enabled(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    nonempty(lookup, key).is_some_and(|value| value != "0")
}

fn parse_index_url(raw: &str) -> Result<Url> {
    let mut url =
        Url::parse(raw).with_context(|| format!("invalid index URL `{raw}`"))?;
    // Base URLs must end with a slash for relative joins to stay inside.
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    Ok(url)
}

fn parse_ttl(key: &str, raw: &str) -> Result<Duration> {
    let seconds: u64 = raw
        .parse()
        .with_context(|| format!("invalid {key} `{raw}`"))?;
    Ok(Duration::from_secs(seconds))
}

fn parse_seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>> {
    let Some(raw) = nonempty(lookup, key) else {
        return Ok(None);
    };
    let seconds: f64 = raw
        .parse()
        .with_context(|| format!("invalid {key} `{raw}`"))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("invalid {key} `{raw}`");
    }
    Ok(Some(Duration::from_secs_f64(seconds)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config.index_url.as_str(), "https://pypi.org/simple/");
        assert_eq!(config.index_ttl, Duration::from_secs(1800));
        assert!(config.extra_index_urls.is_empty());
        assert_eq!(config.cache_size, 5_000_000_000);
        assert_eq!(config.cache_dir, None);
        assert_eq!(config.download_timeout, Duration::from_secs_f64(0.9));
        assert_eq!(config.timeouts.connect, None);
        assert_eq!(config.timeouts.read, None);
        assert!(!config.binary_file_mime_type);
    }

    #[test]
    fn extras_get_default_ttls() {
        let config = from_vars(&[(
            "PROXPI_EXTRA_INDEX_URLS",
            "https://a.example.test/simple,https://b.example.test/simple/",
        )])
        .unwrap();
        assert_eq!(config.extra_index_urls.len(), 2);
        assert_eq!(config.extra_index_urls[0].path(), "/simple/");
        assert_eq!(
            config.extra_index_ttls,
            vec![Duration::from_secs(180), Duration::from_secs(180)]
        );
        assert_eq!(config.ttl_for(1), Duration::from_secs(180));
    }

    #[test]
    fn legacy_extra_ttl_name_is_accepted() {
        let config = from_vars(&[
            ("PROXPI_EXTRA_INDEX_URLS", "https://a.example.test/simple/"),
            ("PROXPI_EXTRA_INDEX_TTL", "60"),
        ])
        .unwrap();
        assert_eq!(config.extra_index_ttls, vec![Duration::from_secs(60)]);
    }

    #[test]
    fn ttl_count_mismatch_is_an_error() {
        let result = from_vars(&[
            ("PROXPI_EXTRA_INDEX_URLS", "https://a.example.test/simple/"),
            ("PROXPI_EXTRA_INDEX_TTLS", "60,120"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn companion_timeout_defaults() {
        let config = from_vars(&[("PROXPI_CONNECT_TIMEOUT", "3.1")]).unwrap();
        assert_eq!(config.timeouts.connect, Some(Duration::from_secs_f64(3.1)));
        assert_eq!(config.timeouts.read, Some(COMPANION_READ_TIMEOUT));

        let config = from_vars(&[("PROXPI_READ_TIMEOUT", "20")]).unwrap();
        assert_eq!(config.timeouts.connect, Some(COMPANION_CONNECT_TIMEOUT));
        assert_eq!(config.timeouts.read, Some(Duration::from_secs(20)));
    }

    #[test]
    fn zero_ttl_and_cache_size_disable_caching() {
        let config = from_vars(&[
            ("PROXPI_INDEX_TTL", "0"),
            ("PROXPI_CACHE_SIZE", "0"),
        ])
        .unwrap();
        assert_eq!(config.index_ttl, Duration::ZERO);
        assert_eq!(config.cache_size, 0);
    }

    #[test]
    fn flags_accept_one_and_reject_zero() {
        let config = from_vars(&[
            ("PROXPI_BINARY_FILE_MIME_TYPE", "1"),
            ("PROXPI_DISABLE_INDEX_SSL_VERIFICATION", "0"),
        ])
        .unwrap();
        assert!(config.binary_file_mime_type);
        assert!(!config.disable_index_ssl_verification);
    }
}
