//! Merged view over the root index and any extra indexes.

use std::collections::BTreeMap;

use proxpi_sources::{File, ProjectName};

use crate::error::FetchError;
use crate::index::IndexSource;

/// Composes the root [`IndexSource`] with zero or more extras, presenting
/// one merged view for project listing and file lookup and fanning out
/// invalidation.
///
/// Sources are leaves; the aggregator owns them. Precedence is strict:
/// the root index (id 0) always wins, extras follow in configuration
/// order (ids 1..N).
#[derive(Debug)]
pub struct Aggregator {
    root: IndexSource,
    extras: Vec<IndexSource>,
}

impl Aggregator {
    pub fn new(root: IndexSource, extras: Vec<IndexSource>) -> Self {
        Aggregator { root, extras }
    }

    fn sources(&self) -> impl Iterator<Item = (usize, &IndexSource)> {
        std::iter::once(&self.root)
            .chain(self.extras.iter())
            .enumerate()
    }

    /// The union of every source's project list as
    /// `(normalized, display)` pairs, ordered by normalized name.
    ///
    /// The root index's display spelling wins for names it lists; otherwise
    /// the first extra that lists the name. Fails only when no source
    /// produced a listing at all.
    pub async fn list_projects(&self) -> Result<Vec<(ProjectName, String)>, FetchError> {
        let mut merged: BTreeMap<ProjectName, String> = BTreeMap::new();
        let mut first_error = None;
        let mut any_listed = false;

        for (id, source) in self.sources() {
            match source.list_projects().await {
                Ok(names) => {
                    any_listed = true;
                    for (name, display) in names {
                        merged.entry(name).or_insert(display);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        index = source.masked_url(),
                        index_id = id,
                        %error,
                        "Skipping index in project listing",
                    );
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) if !any_listed => Err(error),
            _ => Ok(merged.into_iter().collect()),
        }
    }

    /// The file list of `project` from the first source that has one.
    ///
    /// Sources are queried in precedence order; the first non-empty file
    /// list wins. A unanimous "not found" surfaces as
    /// [`NotFound`](FetchError::NotFound); if any source failed
    /// transiently instead, the failure wins (data may exist behind it).
    pub async fn list_files(&self, project: &ProjectName) -> Result<Vec<File>, FetchError> {
        let mut first_error = None;

        for (id, source) in self.sources() {
            match source.list_files(project).await {
                Ok(Some(files)) if !files.is_empty() => return Ok(files),
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        index = source.masked_url(),
                        index_id = id,
                        project = project.as_str(),
                        %error,
                        "Skipping index in file listing",
                    );
                    first_error.get_or_insert(error);
                }
            }
        }

        Err(first_error.unwrap_or(FetchError::NotFound))
    }

    /// Locates the record of one specific file, returning the id of the
    /// source that lists it so the file cache can key on it.
    pub async fn resolve_file(
        &self,
        project: &ProjectName,
        filename: &str,
    ) -> Result<(usize, File), FetchError> {
        let mut first_error = None;

        for (id, source) in self.sources() {
            match source.list_files(project).await {
                Ok(Some(files)) => {
                    if let Some(file) = files.into_iter().find(|f| f.filename == filename) {
                        return Ok((id, file));
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        Err(first_error.unwrap_or(FetchError::NotFound))
    }

    /// Drops every source's root listing cache. Never fails.
    pub fn invalidate_list(&self) {
        tracing::info!("Invalidating project list caches");
        for (_, source) in self.sources() {
            source.invalidate_list();
        }
    }

    /// Drops `project` from every source's per-project cache. Never fails.
    pub fn invalidate_project(&self, project: &ProjectName) {
        tracing::info!(project = project.as_str(), "Invalidating project file list caches");
        for (_, source) in self.sources() {
            source.invalidate_project(project);
        }
    }
}
