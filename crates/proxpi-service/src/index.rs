//! One upstream index and its TTL-bounded listing caches.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::{header, Client, StatusCode};
use url::Url;

use proxpi_sources::{
    parse_project_page, parse_root_page, File, MediaType, ProjectDetail, ProjectName, RootIndex,
};

use crate::error::FetchError;
use crate::http::mask_password;

/// A client for a single upstream simple-repository index.
///
/// Holds two caches: the root listing of project names and a per-project
/// map of file listings, each stamped with its population time and
/// considered fresh for the source's TTL. A TTL of zero disables caching
/// for this source entirely.
///
/// The mutex guards only the cached state; upstream fetches run with the
/// mutex released, so two concurrent misses for the same entry may both
/// fetch. Results are idempotent and the last writer wins.
pub struct IndexSource {
    index_url: Url,
    masked_url: String,
    ttl: Duration,
    client: Client,
    state: Mutex<IndexState>,
}

#[derive(Default)]
struct IndexState {
    root: Option<RootListing>,
    projects: HashMap<ProjectName, ProjectListing>,
}

/// The root listing: known projects keyed by normalized name, with the
/// display name the upstream listed.
struct RootListing {
    names: BTreeMap<ProjectName, String>,
    populated_at: Instant,
}

struct ProjectListing {
    files: Vec<File>,
    /// Whether this entry records an upstream 404 (negative cache).
    not_found: bool,
    populated_at: Instant,
}

impl ProjectListing {
    fn to_result(&self) -> Option<Vec<File>> {
        if self.not_found {
            None
        } else {
            Some(self.files.clone())
        }
    }
}

/// A fetched listing page, with the media type the upstream declared and
/// the effective URL after redirects (relative hrefs resolve against it).
struct Page {
    media: Option<MediaType>,
    body: String,
    url: Url,
}

impl IndexSource {
    pub fn new(index_url: Url, ttl: Duration, client: Client) -> Self {
        let masked_url = mask_password(&index_url);
        IndexSource {
            index_url,
            masked_url,
            ttl,
            client,
            state: Mutex::new(IndexState::default()),
        }
    }

    /// The index base URL with any embedded password masked, for logging.
    pub fn masked_url(&self) -> &str {
        &self.masked_url
    }

    fn is_fresh(&self, populated_at: Instant) -> bool {
        self.ttl > Duration::ZERO && populated_at.elapsed() < self.ttl
    }

    /// Lists the projects this index knows about, as
    /// `(normalized, display)` pairs ordered by normalized name.
    ///
    /// Serves the cached listing while fresh, refreshes it otherwise. On a
    /// refresh failure a stale cached copy is served; only when no copy
    /// exists at all does this fail with
    /// [`UpstreamUnavailable`](FetchError::UpstreamUnavailable).
    pub async fn list_projects(&self) -> Result<Vec<(ProjectName, String)>, FetchError> {
        {
            let state = self.state.lock().unwrap();
            if let Some(root) = &state.root {
                if self.is_fresh(root.populated_at) {
                    return Ok(collect_names(root));
                }
            }
        }

        tracing::info!(index = self.masked_url.as_str(), "Listing projects in index");
        match retry(|| self.fetch_root()).await {
            Ok(names) => {
                let listing = RootListing {
                    names,
                    populated_at: Instant::now(),
                };
                let result = collect_names(&listing);
                if self.ttl > Duration::ZERO {
                    self.state.lock().unwrap().root = Some(listing);
                }
                Ok(result)
            }
            Err(error) => {
                let state = self.state.lock().unwrap();
                if let Some(root) = &state.root {
                    tracing::warn!(
                        index = self.masked_url.as_str(),
                        error = %error,
                        "Serving stale project list after fetch failure",
                    );
                    return Ok(collect_names(root));
                }
                // A 404 on the root URL is an upstream misconfiguration,
                // not a missing project.
                Err(match error {
                    FetchError::NotFound => {
                        FetchError::UpstreamUnavailable("root listing not found".to_owned())
                    }
                    other => other,
                })
            }
        }
    }

    /// Lists the files of `name`, in upstream order. `Ok(None)` means the
    /// upstream definitively reported the project as unknown.
    ///
    /// A 404 is cached as "not found" with the source TTL; other upstream
    /// failures bypass the cache, and a stale copy (positive or negative)
    /// is returned unchanged when one exists.
    pub async fn list_files(&self, name: &ProjectName) -> Result<Option<Vec<File>>, FetchError> {
        {
            let state = self.state.lock().unwrap();
            if let Some(project) = state.projects.get(name) {
                if self.is_fresh(project.populated_at) {
                    return Ok(project.to_result());
                }
            }
        }

        tracing::debug!(
            index = self.masked_url.as_str(),
            project = name.as_str(),
            "Listing files in project",
        );
        let url = self
            .index_url
            .join(&format!("{name}/"))
            .map_err(|e| FetchError::Malformed(e.to_string()))?;

        match retry(|| self.fetch_project(url.clone())).await {
            Ok(files) => {
                self.store_project(name, files.clone(), false);
                Ok(Some(files))
            }
            Err(FetchError::NotFound) => {
                self.store_project(name, Vec::new(), true);
                Ok(None)
            }
            Err(error) => {
                let state = self.state.lock().unwrap();
                if let Some(project) = state.projects.get(name) {
                    tracing::warn!(
                        index = self.masked_url.as_str(),
                        project = name.as_str(),
                        error = %error,
                        "Serving stale file list after fetch failure",
                    );
                    return Ok(project.to_result());
                }
                Err(error)
            }
        }
    }

    /// Drops the cached root listing.
    pub fn invalidate_list(&self) {
        self.state.lock().unwrap().root = None;
    }

    /// Drops the cached file listing of `name`.
    pub fn invalidate_project(&self, name: &ProjectName) {
        self.state.lock().unwrap().projects.remove(name);
    }

    fn store_project(&self, name: &ProjectName, files: Vec<File>, not_found: bool) {
        if self.ttl == Duration::ZERO {
            return;
        }
        self.state.lock().unwrap().projects.insert(
            name.clone(),
            ProjectListing {
                files,
                not_found,
                populated_at: Instant::now(),
            },
        );
    }

    async fn fetch_root(&self) -> Result<BTreeMap<ProjectName, String>, FetchError> {
        let page = self.fetch_page(self.index_url.clone()).await?;
        let display_names = match page.media {
            Some(MediaType::PypiV1Json) => {
                let index: RootIndex = serde_json::from_str(&page.body)
                    .map_err(|e| FetchError::Malformed(e.to_string()))?;
                index.projects.into_iter().map(|p| p.name).collect()
            }
            _ => parse_root_page(&page.body).map_err(|e| FetchError::Malformed(e.to_string()))?,
        };

        let mut names = BTreeMap::new();
        for display in display_names {
            match display.parse::<ProjectName>() {
                Ok(name) => {
                    names.entry(name).or_insert(display);
                }
                Err(error) => tracing::warn!(
                    index = self.masked_url.as_str(),
                    %error,
                    "Skipping unlistable project name",
                ),
            }
        }
        Ok(names)
    }

    async fn fetch_project(&self, url: Url) -> Result<Vec<File>, FetchError> {
        let page = self.fetch_page(url).await?;
        match page.media {
            Some(MediaType::PypiV1Json) => {
                let mut detail: ProjectDetail = serde_json::from_str(&page.body)
                    .map_err(|e| FetchError::Malformed(e.to_string()))?;
                detail.resolve_urls(&page.url);
                Ok(detail.files)
            }
            _ => parse_project_page(&page.body, &page.url)
                .map_err(|e| FetchError::Malformed(e.to_string())),
        }
    }

    async fn fetch_page(&self, url: Url) -> Result<Page, FetchError> {
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, MediaType::accept())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        if !status.is_success() {
            return Err(FetchError::UpstreamUnavailable(format!(
                "unexpected status {status}"
            )));
        }

        let media = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(MediaType::from_content_type);
        let url = response.url().clone();
        let body = response.text().await?;
        Ok(Page { media, body, url })
    }
}

impl std::fmt::Debug for IndexSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSource")
            .field("index_url", &self.masked_url)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn collect_names(root: &RootListing) -> Vec<(ProjectName, String)> {
    root.names
        .iter()
        .map(|(name, display)| (name.clone(), display.clone()))
        .collect()
}

/// Try a fetch up to 3 times with 20 millisecond pauses on transient
/// failure. Not-found responses are final and never retried.
async fn retry<G, F, T>(task_gen: G) -> Result<T, FetchError>
where
    G: Fn() -> F,
    F: Future<Output = Result<T, FetchError>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        let should_not_retry = matches!(result, Ok(_) | Err(FetchError::NotFound));
        if should_not_retry || tries >= 3 {
            break result;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
