//! The on-disk artifact cache and its download coordinator.
//!
//! Artifacts are materialized under
//! `<cache-dir>/<index-id>/<normalized-project>/<filename>`, written to a
//! uniquely named temporary file in the same directory and atomically
//! renamed into place, so a partial download never appears under its
//! final name.
//!
//! Concurrent requests for the same artifact share a single download: the
//! first caller becomes the producer, later callers attach as waiters on
//! its completion. Waiters give up after the configured download timeout
//! and are redirected to the upstream URL; the producer keeps running and
//! may still populate the cache for future callers.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tempfile::{NamedTempFile, TempDir};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use proxpi_sources::ProjectName;

use crate::error::FetchError;
use crate::http::mask_password_str;

/// Identity of one cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    /// Id of the index source that listed the file (0 is the root).
    pub index: usize,
    pub project: ProjectName,
    pub filename: String,
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.index, self.project, self.filename)
    }
}

/// A file on disk whose bytes outlive eviction: the path is unlinked only
/// once the cache entry *and* every outstanding [`CachedFile`] handle have
/// been dropped.
#[derive(Debug)]
struct DiskFile {
    path: PathBuf,
    evicted: AtomicBool,
}

impl Drop for DiskFile {
    fn drop(&mut self) {
        if self.evicted.load(Ordering::Relaxed) {
            if let Err(error) = std::fs::remove_file(&self.path) {
                if error.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %self.path.display(),
                        %error,
                        "Failed to remove evicted cache file",
                    );
                }
            }
        }
    }
}

/// A readable handle to a cached artifact.
///
/// The file at [`path`](Self::path) is guaranteed to exist while this
/// handle is alive; open it before dropping the handle. (An already-open
/// descriptor stays readable even after eviction unlinks the path.)
#[derive(Debug, Clone)]
pub struct CachedFile {
    file: Arc<DiskFile>,
}

impl CachedFile {
    pub fn path(&self) -> &Path {
        &self.file.path
    }
}

/// How a `get_or_fetch` request is to be answered.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Serve the artifact from the local cache.
    Cached(CachedFile),
    /// Redirect the client to the upstream URL: the download is still
    /// running, or file caching is disabled.
    Redirect(String),
}

type DownloadResult = Result<CachedFile, FetchError>;

struct ReadyEntry {
    file: Arc<DiskFile>,
    size: u64,
    last_access: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<FileKey, ReadyEntry>,
    in_flight: HashMap<FileKey, watch::Receiver<Option<DownloadResult>>>,
    total_size: u64,
    /// Logical clock for last-access ordering.
    access_clock: u64,
}

struct Shared {
    max_size: u64,
    cache_dir: PathBuf,
    download_timeout: Duration,
    client: Client,
    state: Mutex<CacheState>,
    /// Keeps a process-owned cache directory alive; dropped (and thereby
    /// removed) with the cache.
    _owned_dir: Option<TempDir>,
}

/// Size-bounded on-disk cache of downloaded artifacts.
///
/// One mutex covers the entry map, the in-flight map and the byte
/// accounting; it is held only for map mutations and eviction bookkeeping.
/// Network transfers and disk writes run outside the mutex, and eviction
/// unlinks files outside it too (deferred to the last handle drop).
#[derive(Clone)]
pub struct FileCache {
    shared: Arc<Shared>,
}

impl FileCache {
    /// Creates the cache, owning `cache_dir` if one is given (pre-existing
    /// files are registered as cached with their on-disk sizes) or a fresh
    /// temporary directory removed on drop otherwise.
    pub fn new(
        max_size: u64,
        cache_dir: Option<PathBuf>,
        download_timeout: Duration,
        client: Client,
    ) -> io::Result<Self> {
        let (dir, owned_dir) = match cache_dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                (std::path::absolute(&dir)?, None)
            }
            None => {
                let owned = TempDir::new()?;
                (owned.path().to_path_buf(), Some(owned))
            }
        };

        let mut state = CacheState::default();
        if max_size > 0 {
            let mut evicted = Vec::new();
            populate_from_existing(&dir, &mut state);
            evict_over_budget(&mut state, max_size, &mut evicted);
            drop(evicted);
        }

        tracing::debug!(
            cache_dir = %dir.display(),
            files = state.entries.len(),
            bytes = state.total_size,
            "File cache ready",
        );

        Ok(FileCache {
            shared: Arc::new(Shared {
                max_size,
                cache_dir: dir,
                download_timeout,
                client,
                state: Mutex::new(state),
                _owned_dir: owned_dir,
            }),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.shared.cache_dir
    }

    /// Sum of the sizes of all cached entries.
    pub fn total_cached_bytes(&self) -> u64 {
        self.shared.state.lock().unwrap().total_size
    }

    pub fn cached_entry_count(&self) -> usize {
        self.shared.state.lock().unwrap().entries.len()
    }

    /// Resolves `key` to a locally cached file, starting or joining a
    /// download as needed.
    ///
    /// Returns a redirect outcome when the byte budget is zero, or when the
    /// download outlasts the configured download timeout (it keeps running
    /// in the background either way). A failed download surfaces its error
    /// to every waiter; the entry is gone afterwards, so clients may retry.
    pub async fn get_or_fetch(
        &self,
        key: FileKey,
        upstream_url: &str,
    ) -> Result<FetchOutcome, FetchError> {
        if self.shared.max_size == 0 {
            return Ok(FetchOutcome::Redirect(upstream_url.to_owned()));
        }

        let mut rx = {
            let mut state = self.shared.state.lock().unwrap();
            state.access_clock += 1;
            let tick = state.access_clock;
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.last_access = tick;
                return Ok(FetchOutcome::Cached(CachedFile {
                    file: entry.file.clone(),
                }));
            }

            match state.in_flight.get(&key) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.in_flight.insert(key.clone(), rx.clone());
                    let shared = self.shared.clone();
                    let task_key = key.clone();
                    let url = upstream_url.to_owned();
                    tokio::spawn(async move {
                        run_download(shared, task_key, url, tx).await;
                    });
                    rx
                }
            }
        };

        let wait = rx.wait_for(|outcome| outcome.is_some());
        let result = match tokio::time::timeout(self.shared.download_timeout, wait).await {
            Ok(Ok(value)) => {
                let outcome = (*value).clone();
                drop(value);
                match outcome {
                    Some(Ok(cached)) => Ok(FetchOutcome::Cached(cached)),
                    Some(Err(error)) => Err(error),
                    None => Err(FetchError::Io(
                        "download completed without a result".to_owned(),
                    )),
                }
            }
            Ok(Err(_sender_gone)) => Err(FetchError::Io(
                "download task terminated unexpectedly".to_owned(),
            )),
            Err(_elapsed) => {
                tracing::debug!(
                    key = %key,
                    "Download timeout exceeded, redirecting to upstream",
                );
                Ok(FetchOutcome::Redirect(upstream_url.to_owned()))
            }
        };
        result
    }

    /// Evicts every cached file of `project`, across all index sources.
    /// Idempotent; in-flight downloads are not cancelled.
    pub fn invalidate_project(&self, project: &ProjectName) {
        let victims: Vec<Arc<DiskFile>> = {
            let mut state = self.shared.state.lock().unwrap();
            let keys: Vec<FileKey> = state
                .entries
                .keys()
                .filter(|key| key.project == *project)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| remove_entry(&mut state, key))
                .collect()
        };
        tracing::info!(
            project = project.as_str(),
            files = victims.len(),
            "Invalidated cached project files",
        );
    }

    /// Evicts every cached file. Idempotent; in-flight downloads are not
    /// cancelled and may re-populate the cache after the sweep.
    pub fn invalidate_all(&self) {
        let victims: Vec<Arc<DiskFile>> = {
            let mut state = self.shared.state.lock().unwrap();
            let keys: Vec<FileKey> = state.entries.keys().cloned().collect();
            keys.iter()
                .filter_map(|key| remove_entry(&mut state, key))
                .collect()
        };
        tracing::info!(files = victims.len(), "Invalidated all cached files");
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("FileCache")
            .field("cache_dir", &self.shared.cache_dir)
            .field("max_size", &self.shared.max_size)
            .field("total_size", &state.total_size)
            .field("entries", &state.entries.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

/// Removes one entry from the map and accounting and marks its file for
/// deletion; the unlink happens when the returned handle (and any
/// outstanding reader handles) drop, outside the cache mutex.
fn remove_entry(state: &mut CacheState, key: &FileKey) -> Option<Arc<DiskFile>> {
    let entry = state.entries.remove(key)?;
    state.total_size = state.total_size.saturating_sub(entry.size);
    entry.file.evicted.store(true, Ordering::Relaxed);
    Some(entry.file)
}

/// Evicts until the accounted size fits the budget: smallest entries
/// first, ties broken by oldest last access.
fn evict_over_budget(state: &mut CacheState, max_size: u64, evicted: &mut Vec<Arc<DiskFile>>) {
    while state.total_size > max_size {
        let victim = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.size, entry.last_access))
            .map(|(key, _)| key.clone());
        let Some(key) = victim else { break };
        tracing::debug!(key = %key, "Evicting cached file");
        evicted.extend(remove_entry(state, &key));
    }
}

async fn run_download(
    shared: Arc<Shared>,
    key: FileKey,
    url: String,
    tx: watch::Sender<Option<DownloadResult>>,
) {
    let outcome = match download(&shared, &key, &url).await {
        Ok((path, size)) => {
            let file = Arc::new(DiskFile {
                path,
                evicted: AtomicBool::new(false),
            });
            let mut evicted = Vec::new();
            {
                let mut state = shared.state.lock().unwrap();
                state.in_flight.remove(&key);
                state.access_clock += 1;
                let tick = state.access_clock;
                state.entries.insert(
                    key.clone(),
                    ReadyEntry {
                        file: file.clone(),
                        size,
                        last_access: tick,
                    },
                );
                state.total_size += size;
                evict_over_budget(&mut state, shared.max_size, &mut evicted);
            }
            drop(evicted);
            Ok(CachedFile { file })
        }
        Err(error) => {
            // Roll the entry back to absent before anyone hears about the
            // failure, so a retry starts from a clean slate.
            shared.state.lock().unwrap().in_flight.remove(&key);
            tracing::error!(
                url = mask_password_str(&url).as_str(),
                %error,
                "Failed to download file",
            );
            Err(error)
        }
    };

    // Every waiter may have given up already; that is fine.
    let _ = tx.send(Some(outcome));
}

async fn download(
    shared: &Shared,
    key: &FileKey,
    url: &str,
) -> Result<(PathBuf, u64), FetchError> {
    if key.filename.contains(['/', '\\']) || key.filename.starts_with('.') {
        return Err(FetchError::Io(format!(
            "unservable file name `{}`",
            key.filename
        )));
    }
    let final_dir = shared
        .cache_dir
        .join(key.index.to_string())
        .join(key.project.as_str());
    tokio::fs::create_dir_all(&final_dir).await?;
    let final_path = final_dir.join(&key.filename);

    tracing::debug!(
        url = mask_password_str(url).as_str(),
        path = %final_path.display(),
        "Downloading file",
    );

    let response = shared.client.get(url).send().await?;
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound);
    }
    if !status.is_success() {
        return Err(FetchError::UpstreamUnavailable(format!(
            "unexpected status {status}"
        )));
    }

    // The temp file sits next to its final name so the rename is atomic;
    // it is removed on every early-exit path by its drop guard.
    let temp = NamedTempFile::new_in(&final_dir)?;
    let mut destination = tokio::fs::File::from_std(temp.reopen()?);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        destination.write_all(&chunk?).await?;
    }
    destination.flush().await?;
    let size = destination.metadata().await?.len();
    drop(destination);

    temp.persist(&final_path)
        .map_err(|e| FetchError::Io(e.error.to_string()))?;
    tracing::debug!(path = %final_path.display(), size, "Finished downloading file");
    Ok((final_path, size))
}

/// Registers files already present in a caller-provided cache directory,
/// laid out as `<index-id>/<project>/<filename>`.
fn populate_from_existing(cache_dir: &Path, state: &mut CacheState) {
    let Ok(index_dirs) = std::fs::read_dir(cache_dir) else {
        return;
    };
    for index_dir in index_dirs.flatten() {
        let Ok(index) = index_dir.file_name().to_string_lossy().parse::<usize>() else {
            continue;
        };
        let Ok(project_dirs) = std::fs::read_dir(index_dir.path()) else {
            continue;
        };
        for project_dir in project_dirs.flatten() {
            let Ok(project) = project_dir
                .file_name()
                .to_string_lossy()
                .parse::<ProjectName>()
            else {
                continue;
            };
            let Ok(files) = std::fs::read_dir(project_dir.path()) else {
                continue;
            };
            for file in files.flatten() {
                let filename = file.file_name().to_string_lossy().into_owned();
                if filename.starts_with('.') {
                    continue;
                }
                let Ok(metadata) = file.metadata() else {
                    continue;
                };
                if !metadata.is_file() {
                    continue;
                }
                state.access_clock += 1;
                let key = FileKey {
                    index,
                    project: project.clone(),
                    filename,
                };
                state.total_size += metadata.len();
                state.entries.insert(
                    key,
                    ReadyEntry {
                        file: Arc::new(DiskFile {
                            path: file.path(),
                            evicted: AtomicBool::new(false),
                        }),
                        size: metadata.len(),
                        last_access: state.access_clock,
                    },
                );
            }
        }
    }
}
