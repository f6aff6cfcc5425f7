use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// The normalized name of a project.
///
/// Converts the name to lowercase and collapses runs of `-`, `_` and `.`
/// down to a single `-`, per the packaging name-normalization rules. The
/// normalized form is the only form used as a cache key; the raw form as
/// listed by an upstream is kept separately for display.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ProjectName(String);

/// A project name that cannot be normalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "invalid project name `{0}`: names must start and end with a letter or \
     digit and may only contain ASCII letters, digits, `-`, `_` and `.`"
)]
pub struct InvalidNameError(String);

fn validate_and_normalize(name: &str) -> Result<String, InvalidNameError> {
    let invalid = || InvalidNameError(name.to_owned());

    let mut normalized = String::with_capacity(name.len());
    let mut pending_separator = false;
    for c in name.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' => {
                if pending_separator {
                    if normalized.is_empty() {
                        // leading separator
                        return Err(invalid());
                    }
                    normalized.push('-');
                    pending_separator = false;
                }
                normalized.push(c.to_ascii_lowercase());
            }
            '-' | '_' | '.' => pending_separator = true,
            _ => return Err(invalid()),
        }
    }
    if normalized.is_empty() || pending_separator {
        // empty, all-separator, or trailing separator
        return Err(invalid());
    }
    Ok(normalized)
}

impl ProjectName {
    /// Create a validated, normalized project name.
    pub fn from_owned(name: String) -> Result<Self, InvalidNameError> {
        validate_and_normalize(&name).map(Self)
    }

    /// Returns the normalized name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ProjectName {
    type Err = InvalidNameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        validate_and_normalize(name).map(Self)
    }
}

impl<'de> Deserialize<'de> for ProjectName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = ProjectName;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                ProjectName::from_str(v).map_err(serde::de::Error::custom)
            }

            fn visit_string<E: serde::de::Error>(self, v: String) -> Result<Self::Value, E> {
                ProjectName::from_owned(v).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for ProjectName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_separator_runs() {
        for raw in ["Foo.Bar_baz", "foo-bar-baz", "FOO--BAR__BAZ", "foo._-bar.baz"] {
            assert_eq!(
                ProjectName::from_str(raw).unwrap().as_str(),
                "foo-bar-baz",
                "{raw}"
            );
        }
    }

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(ProjectName::from_str("jinja2").unwrap().as_str(), "jinja2");
        assert_eq!(ProjectName::from_str("A").unwrap().as_str(), "a");
    }

    #[test]
    fn rejects_invalid_names() {
        for raw in ["", "-leading", "trailing.", "---", "has space", "naïve", "per%cent"] {
            assert!(ProjectName::from_str(raw).is_err(), "{raw:?}");
        }
    }

    #[test]
    fn equivalent_spellings_collapse_to_one_key() {
        let spellings = ["requests-mock", "Requests.Mock", "requests__MOCK"];
        let normalized: Vec<_> = spellings
            .iter()
            .map(|s| ProjectName::from_str(s).unwrap())
            .collect();
        assert!(normalized.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn deserializes_with_validation() {
        let name: ProjectName = serde_json::from_str("\"Flask_Login\"").unwrap();
        assert_eq!(name.as_str(), "flask-login");
        assert!(serde_json::from_str::<ProjectName>("\"no good\"").is_err());
    }
}
