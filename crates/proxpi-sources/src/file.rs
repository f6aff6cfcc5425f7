use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single downloadable artifact belonging to a project, either a wheel or
/// a source distribution.
///
/// Produced by the HTML and JSON listing parsers and immutable afterwards.
/// Serializing a `File` yields its PEP 691 JSON form; optional fields that
/// were absent upstream are omitted again on output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct File {
    pub filename: String,
    /// Absolute upstream URL, resolved against the effective request URL.
    pub url: String,
    /// Hash algorithm name to hex digest. Empty when the upstream listed none.
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yanked: Option<Yanked>,
    // Non-PEP 691-compliant alias used by older indexes.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "dist-info-metadata")]
    pub core_metadata: Option<CoreMetadata>,
}

/// The yanked marker of a file: a bare boolean, or a string giving the
/// reason the file was yanked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Yanked {
    Bool(bool),
    Reason(String),
}

impl Yanked {
    /// Any string value marks the file as yanked, even the empty string
    /// (PEP 592 defines the value as an optional reason, not a flag).
    pub fn is_yanked(&self) -> bool {
        match self {
            Yanked::Bool(is_yanked) => *is_yanked,
            Yanked::Reason(_) => true,
        }
    }
}

/// Availability of a file's extracted core metadata (PEP 658): a bare
/// boolean, or a map of hashes of the metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoreMetadata {
    Bool(bool),
    Hashes(BTreeMap<String, String>),
}

impl CoreMetadata {
    pub fn is_available(&self) -> bool {
        match self {
            CoreMetadata::Bool(is_available) => *is_available,
            CoreMetadata::Hashes(_) => true,
        }
    }
}
