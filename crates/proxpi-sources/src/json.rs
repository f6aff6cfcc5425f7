//! PEP 691 JSON envelope types, used both for parsing upstream responses
//! and for emitting proxpi's own listings.

use serde::{Deserialize, Serialize};

use crate::file::File;

/// The repository API version spoken and emitted by proxpi.
pub const SIMPLE_API_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    #[serde(rename = "api-version")]
    pub api_version: String,
}

impl Default for IndexMeta {
    fn default() -> Self {
        IndexMeta {
            api_version: SIMPLE_API_VERSION.to_owned(),
        }
    }
}

/// One entry in the root listing's `projects` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectListEntry {
    /// Project name as listed by the index (not normalized).
    pub name: String,
}

/// Root listing: the set of projects an index knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootIndex {
    #[serde(default)]
    pub meta: IndexMeta,
    pub projects: Vec<ProjectListEntry>,
}

/// Per-project listing: the files of one project, in upstream order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDetail {
    #[serde(default)]
    pub meta: IndexMeta,
    pub name: String,
    pub files: Vec<File>,
}

impl ProjectDetail {
    /// Resolve each file's URL against the effective request URL, so that
    /// relative URLs in a JSON response behave like relative hrefs in HTML.
    pub fn resolve_urls(&mut self, base: &url::Url) {
        for file in &mut self.files {
            if let Ok(resolved) = base.join(&file.url) {
                file.url = resolved.into();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root_listing() {
        let raw = r#"{
            "meta": {"api-version": "1.0"},
            "projects": [{"name": "Jinja2"}, {"name": "proxpi"}]
        }"#;
        let index: RootIndex = serde_json::from_str(raw).unwrap();
        assert_eq!(index.meta.api_version, "1.0");
        let names: Vec<_> = index.projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Jinja2", "proxpi"]);
    }

    #[test]
    fn parses_project_detail_and_resolves_relative_urls() {
        let raw = r#"{
            "meta": {"api-version": "1.0"},
            "name": "jinja2",
            "files": [{
                "filename": "jinja2-3.1.0-py3-none-any.whl",
                "url": "../../packages/jinja2-3.1.0-py3-none-any.whl",
                "hashes": {"sha256": "abc123"}
            }]
        }"#;
        let mut detail: ProjectDetail = serde_json::from_str(raw).unwrap();
        let base = url::Url::parse("https://pypi.example.test/simple/jinja2/").unwrap();
        detail.resolve_urls(&base);
        assert_eq!(
            detail.files[0].url,
            "https://pypi.example.test/packages/jinja2-3.1.0-py3-none-any.whl"
        );
    }

    #[test]
    fn missing_meta_defaults_to_current_version() {
        let raw = r#"{"name": "jinja2", "files": []}"#;
        let detail: ProjectDetail = serde_json::from_str(raw).unwrap();
        assert_eq!(detail.meta.api_version, SIMPLE_API_VERSION);
    }
}
