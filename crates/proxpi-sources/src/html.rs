//! Tolerant parsing of HTML simple-repository listings.
//!
//! Real-world indexes serve a wide range of HTML: documents without a
//! `<body>`, bare fragments, entity-encoded attribute values. The parsers
//! here accept all of it and extract only what the protocol defines: one
//! file (or project) per anchor element.

use std::borrow::Cow;
use std::collections::BTreeMap;

use thiserror::Error;
use url::Url;

use crate::file::{CoreMetadata, File, Yanked};

#[derive(Debug, Error)]
pub enum HtmlError {
    #[error("malformed html: {0}")]
    Parse(String),
}

/// Parse a root index page into the project names it lists, in document
/// order. Names are returned as displayed, not normalized.
pub fn parse_root_page(text: &str) -> Result<Vec<String>, HtmlError> {
    let dom = tl::parse(text, tl::ParserOptions::default())
        .map_err(|e| HtmlError::Parse(e.to_string()))?;
    let parser = dom.parser();

    let mut names = Vec::new();
    let Some(anchors) = dom.query_selector("a") else {
        return Ok(names);
    };
    for handle in anchors {
        let Some(tag) = handle.get(parser).and_then(|node| node.as_tag()) else {
            continue;
        };
        let name = decode_entities(tag.inner_text(parser).as_ref());
        let name = name.trim();
        if !name.is_empty() {
            names.push(name.to_owned());
        }
    }
    Ok(names)
}

/// Parse a per-project page into its file records, in document order.
///
/// `base` is the effective request URL (after redirects); relative hrefs
/// are resolved against it. Hashes given as `#<algo>=<hex>` URL fragments
/// are lifted into the file's hash map and stripped from the stored URL.
pub fn parse_project_page(text: &str, base: &Url) -> Result<Vec<File>, HtmlError> {
    let dom = tl::parse(text, tl::ParserOptions::default())
        .map_err(|e| HtmlError::Parse(e.to_string()))?;
    let parser = dom.parser();

    let mut files = Vec::new();
    let Some(anchors) = dom.query_selector("a") else {
        return Ok(files);
    };
    for handle in anchors {
        let Some(tag) = handle.get(parser).and_then(|node| node.as_tag()) else {
            continue;
        };
        let attributes = tag.attributes();

        let Some(Some(href)) = attributes.get("href") else {
            tracing::warn!("Skipping file link without an href");
            continue;
        };
        let href = decode_entities(&href.as_utf8_str());
        let Ok(mut url) = base.join(&href) else {
            tracing::warn!(href = href.as_str(), "Skipping file link with an unresolvable href");
            continue;
        };

        let filename = decode_entities(tag.inner_text(parser).as_ref());
        let filename = filename.trim();
        if filename.is_empty() {
            tracing::warn!(url = %url, "Skipping file link without a name");
            continue;
        }

        let mut hashes = BTreeMap::new();
        if let Some((algorithm, digest)) = url.fragment().and_then(parse_hash_pair) {
            hashes.insert(algorithm, digest);
        }
        url.set_fragment(None);

        let requires_python = match attributes.get("data-requires-python") {
            Some(Some(value)) => Some(decode_entities(&value.as_utf8_str())),
            Some(None) => {
                tracing::warn!(filename, "Dropping valueless data-requires-python attribute");
                None
            }
            None => None,
        };

        let yanked = match attributes.get("data-yanked") {
            Some(Some(reason)) => Some(Yanked::Reason(decode_entities(&reason.as_utf8_str()))),
            Some(None) => Some(Yanked::Bool(true)),
            None => None,
        };

        // `data-core-metadata` wins over its legacy spelling when both appear.
        let core_metadata = attributes
            .get("data-core-metadata")
            .or_else(|| attributes.get("data-dist-info-metadata"))
            .and_then(|value| parse_core_metadata(filename, value));

        files.push(File {
            filename: filename.to_owned(),
            url: url.into(),
            hashes,
            requires_python,
            yanked,
            core_metadata,
        });
    }
    Ok(files)
}

/// Parse an `<algo>=<hex>` pair, as found in URL fragments and PEP 658
/// metadata attributes.
fn parse_hash_pair(value: &str) -> Option<(String, String)> {
    let (algorithm, digest) = value.split_once('=')?;
    if algorithm.is_empty() || digest.is_empty() {
        return None;
    }
    Some((algorithm.to_owned(), digest.to_owned()))
}

fn parse_core_metadata(filename: &str, value: Option<&tl::Bytes>) -> Option<CoreMetadata> {
    match value {
        None => Some(CoreMetadata::Bool(true)),
        Some(value) => {
            let value = decode_entities(&value.as_utf8_str());
            match parse_hash_pair(&value) {
                Some((algorithm, digest)) => {
                    Some(CoreMetadata::Hashes(BTreeMap::from([(algorithm, digest)])))
                }
                None => {
                    tracing::warn!(
                        filename,
                        value = value.as_str(),
                        "Dropping unintelligible metadata attribute"
                    );
                    None
                }
            }
        }
    }
}

/// Decode the HTML entities that occur in index listings.
///
/// Handles the named entities for the characters HTML cannot carry
/// verbatim plus numeric character references; anything unrecognized is
/// left as-is.
fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_owned();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        let Some(end) = rest.find(';').filter(|&i| i <= 32) else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..end];
        let decoded: Option<Cow<'_, str>> = match entity {
            "amp" => Some("&".into()),
            "lt" => Some("<".into()),
            "gt" => Some(">".into()),
            "quot" => Some("\"".into()),
            "apos" => Some("'".into()),
            _ => entity
                .strip_prefix('#')
                .and_then(|num| {
                    num.strip_prefix('x')
                        .or_else(|| num.strip_prefix('X'))
                        .map_or_else(|| num.parse::<u32>().ok(), |hex| u32::from_str_radix(hex, 16).ok())
                })
                .and_then(char::from_u32)
                .map(|c| Cow::Owned(c.to_string())),
        };
        match decoded {
            Some(s) => {
                out.push_str(&s);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://pypi.example.test/simple/jinja2/").unwrap()
    }

    #[test]
    fn parses_full_document() {
        let html = r#"
        <!DOCTYPE html>
        <html>
          <head><title>Links for jinja2</title></head>
          <body>
            <h1>Links for jinja2</h1>
            <a href="https://files.example.test/jinja2-3.1.0-py3-none-any.whl#sha256=abc123"
               data-requires-python="&gt;=3.7">jinja2-3.1.0-py3-none-any.whl</a><br/>
          </body>
        </html>
        "#;
        let files = parse_project_page(html, &base()).unwrap();
        assert_eq!(files.len(), 1);
        let file = &files[0];
        assert_eq!(file.filename, "jinja2-3.1.0-py3-none-any.whl");
        assert_eq!(
            file.url,
            "https://files.example.test/jinja2-3.1.0-py3-none-any.whl"
        );
        assert_eq!(file.hashes["sha256"], "abc123");
        assert_eq!(file.requires_python.as_deref(), Some(">=3.7"));
        assert_eq!(file.yanked, None);
        assert_eq!(file.core_metadata, None);
    }

    #[test]
    fn tolerates_documents_without_a_body() {
        let html = r#"<a href="pkg-1.0.tar.gz">pkg-1.0.tar.gz</a>"#;
        let files = parse_project_page(html, &base()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(
            files[0].url,
            "https://pypi.example.test/simple/jinja2/pkg-1.0.tar.gz"
        );
    }

    #[test]
    fn resolves_relative_hrefs_against_request_url() {
        let html = r#"<a href="../../packages/pkg-1.0.tar.gz">pkg-1.0.tar.gz</a>"#;
        let files = parse_project_page(html, &base()).unwrap();
        assert_eq!(
            files[0].url,
            "https://pypi.example.test/packages/pkg-1.0.tar.gz"
        );
    }

    #[test]
    fn bare_yanked_attribute_is_boolean() {
        let html = r#"<a href="pkg-1.0.tar.gz" data-yanked>pkg-1.0.tar.gz</a>"#;
        let files = parse_project_page(html, &base()).unwrap();
        assert_eq!(files[0].yanked, Some(Yanked::Bool(true)));
    }

    #[test]
    fn yanked_value_is_a_reason() {
        let html = r#"<a href="pkg-1.0.tar.gz" data-yanked="bad release">pkg-1.0.tar.gz</a>"#;
        let files = parse_project_page(html, &base()).unwrap();
        assert_eq!(files[0].yanked, Some(Yanked::Reason("bad release".into())));
        assert!(files[0].yanked.as_ref().unwrap().is_yanked());
    }

    #[test]
    fn empty_yanked_value_still_counts_as_yanked() {
        let html = r#"<a href="pkg-1.0.tar.gz" data-yanked="">pkg-1.0.tar.gz</a>"#;
        let files = parse_project_page(html, &base()).unwrap();
        assert!(files[0].yanked.as_ref().unwrap().is_yanked());
    }

    #[test]
    fn core_metadata_attribute_forms() {
        let html = r#"
        <a href="a-1.whl" data-core-metadata>a-1.whl</a>
        <a href="b-1.whl" data-core-metadata="sha256=fff">b-1.whl</a>
        <a href="c-1.whl" data-dist-info-metadata="sha256=eee">c-1.whl</a>
        <a href="d-1.whl" data-core-metadata="surprise">d-1.whl</a>
        "#;
        let files = parse_project_page(html, &base()).unwrap();
        assert_eq!(files[0].core_metadata, Some(CoreMetadata::Bool(true)));
        assert_eq!(
            files[1].core_metadata,
            Some(CoreMetadata::Hashes(BTreeMap::from([(
                "sha256".to_owned(),
                "fff".to_owned()
            )])))
        );
        assert_eq!(
            files[2].core_metadata,
            Some(CoreMetadata::Hashes(BTreeMap::from([(
                "sha256".to_owned(),
                "eee".to_owned()
            )])))
        );
        assert_eq!(files[3].core_metadata, None);
    }

    #[test]
    fn preferred_metadata_spelling_wins() {
        let html = r#"<a href="a-1.whl" data-core-metadata="sha256=new"
                         data-dist-info-metadata="sha256=old">a-1.whl</a>"#;
        let files = parse_project_page(html, &base()).unwrap();
        assert_eq!(
            files[0].core_metadata,
            Some(CoreMetadata::Hashes(BTreeMap::from([(
                "sha256".to_owned(),
                "new".to_owned()
            )])))
        );
    }

    #[test]
    fn anchors_without_href_or_name_are_skipped() {
        let html = r#"
        <a>no-href</a>
        <a href="pkg-1.0.tar.gz">   </a>
        <a href="kept-1.0.tar.gz">kept-1.0.tar.gz</a>
        "#;
        let files = parse_project_page(html, &base()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "kept-1.0.tar.gz");
    }

    #[test]
    fn root_page_lists_display_names_in_order() {
        let html = r#"
        <!DOCTYPE html>
        <html><body>
          <a href="/simple/jinja2/">Jinja2</a>
          <a href="/simple/flask-login/">Flask-Login</a>
        </body></html>
        "#;
        let names = parse_root_page(html).unwrap();
        assert_eq!(names, ["Jinja2", "Flask-Login"]);
    }

    #[test]
    fn root_page_without_anchors_is_empty() {
        assert!(parse_root_page("<html><body></body></html>").unwrap().is_empty());
        assert!(parse_root_page("").unwrap().is_empty());
    }

    #[test]
    fn entity_decoding() {
        assert_eq!(decode_entities("&gt;=3.7,&lt;4"), ">=3.7,<4");
        assert_eq!(decode_entities("a&amp;b"), "a&b");
        assert_eq!(decode_entities("&#65;&#x42;"), "AB");
        assert_eq!(decode_entities("&bogus;&"), "&bogus;&");
        assert_eq!(decode_entities("plain"), "plain");
    }

    #[test]
    fn html_listing_round_trips_to_json() {
        let html = r#"
        <a href="https://files.example.test/x-1.0.whl#sha256=abc"
           data-requires-python="&gt;=3.8" data-yanked="oops"
           data-core-metadata="sha256=def">x-1.0.whl</a>
        "#;
        let files = parse_project_page(html, &base()).unwrap();
        let json = serde_json::to_string(&files[0]).unwrap();
        let back: File = serde_json::from_str(&json).unwrap();
        assert_eq!(back, files[0]);
        assert_eq!(back.filename, "x-1.0.whl");
        assert_eq!(back.url, "https://files.example.test/x-1.0.whl");
        assert_eq!(back.hashes["sha256"], "abc");
        assert_eq!(back.requires_python.as_deref(), Some(">=3.8"));
        assert_eq!(back.yanked, Some(Yanked::Reason("oops".into())));
    }
}
