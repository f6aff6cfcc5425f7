//! The simple-repository listing routes: `/index/` and `/index/{project}/`.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;

use proxpi_service::FetchError;
use proxpi_sources::{
    CoreMetadata, File, IndexMeta, MediaType, ProjectDetail, ProjectListEntry, ProjectName,
    RootIndex, Yanked, SIMPLE_API_VERSION,
};

use crate::endpoints::ResponseError;
use crate::service::Service;

const GENERATOR: &str = concat!("proxpi/", env!("CARGO_PKG_VERSION"));

fn negotiate(headers: &HeaderMap) -> MediaType {
    MediaType::negotiate(
        headers
            .get(header::ACCEPT)
            .and_then(|value| value.to_str().ok()),
    )
}

fn into_listing_response(body: Response, media: MediaType) -> Response {
    let mut response = body;
    let headers = response.headers_mut();
    headers.insert(
        header::VARY,
        HeaderValue::from_static("Accept, Accept-Encoding"),
    );
    let content_type = if media.is_json() {
        "application/vnd.pypi.simple.v1+json"
    } else {
        "text/html; charset=utf-8"
    };
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

pub async fn list_projects(
    State(service): State<Service>,
    headers: HeaderMap,
) -> Result<Response, ResponseError> {
    let projects = service.aggregator().list_projects().await?;
    let media = negotiate(&headers);

    let body = if media.is_json() {
        let index = RootIndex {
            meta: IndexMeta::default(),
            projects: projects
                .iter()
                .map(|(_, display)| ProjectListEntry {
                    name: display.clone(),
                })
                .collect(),
        };
        Json(index).into_response()
    } else {
        Html(render_root(&projects)).into_response()
    };
    Ok(into_listing_response(body, media))
}

pub async fn list_files(
    State(service): State<Service>,
    Path(project): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ResponseError> {
    let name: ProjectName = project.parse().map_err(FetchError::from)?;
    if name.as_str() != project {
        return Ok(Redirect::permanent(&format!("/index/{name}/")).into_response());
    }

    let files = service.aggregator().list_files(&name).await?;
    let media = negotiate(&headers);

    let body = if media.is_json() {
        let detail = ProjectDetail {
            meta: IndexMeta::default(),
            name: name.to_string(),
            files: files.iter().map(proxy_file_record).collect(),
        };
        Json(detail).into_response()
    } else {
        Html(render_files(&name, &files)).into_response()
    };
    Ok(into_listing_response(body, media))
}

/// The record proxpi serves points at proxpi itself: the URL collapses to
/// the bare filename, which clients resolve against the listing URL.
fn proxy_file_record(file: &File) -> File {
    let mut file = file.clone();
    file.url = file.filename.clone();
    file
}

fn document_head(title: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n\
         <meta name=\"pypi:repository-version\" content=\"{SIMPLE_API_VERSION}\"/>\n\
         <meta name=\"generator\" content=\"{GENERATOR}\"/>\n\
         <title>{}</title>\n</head>\n<body>\n",
        escape(title)
    )
}

fn render_root(projects: &[(ProjectName, String)]) -> String {
    let mut body = document_head("Simple index");
    for (name, display) in projects {
        body.push_str(&format!(
            "<a href=\"{name}/\">{}</a><br/>\n",
            escape(display)
        ));
    }
    body.push_str("</body>\n</html>\n");
    body
}

fn render_files(name: &ProjectName, files: &[File]) -> String {
    let mut body = document_head(&format!("Links for {name}"));
    body.push_str(&format!("<h1>Links for {name}</h1>\n"));
    for file in files {
        let mut href = escape(&file.filename);
        if let Some((algorithm, digest)) = fragment_hash(file) {
            href.push_str(&format!("#{algorithm}={digest}"));
        }

        let mut attributes = String::new();
        if let Some(spec) = &file.requires_python {
            attributes.push_str(&format!(" data-requires-python=\"{}\"", escape(spec)));
        }
        match &file.yanked {
            None | Some(Yanked::Bool(false)) => {}
            Some(Yanked::Bool(true)) => attributes.push_str(" data-yanked"),
            Some(Yanked::Reason(reason)) => {
                attributes.push_str(&format!(" data-yanked=\"{}\"", escape(reason)));
            }
        }
        match &file.core_metadata {
            None | Some(CoreMetadata::Bool(false)) => {}
            Some(CoreMetadata::Bool(true)) => attributes.push_str(" data-core-metadata"),
            Some(CoreMetadata::Hashes(hashes)) => {
                if let Some((algorithm, digest)) = hashes.iter().next() {
                    attributes
                        .push_str(&format!(" data-core-metadata=\"{algorithm}={digest}\""));
                }
            }
        }

        body.push_str(&format!(
            "<a href=\"{href}\"{attributes}>{}</a><br/>\n",
            escape(&file.filename)
        ));
    }
    body.push_str("</body>\n</html>\n");
    body
}

/// The hash advertised in the listing href; sha256 preferred when the
/// upstream listed several.
fn fragment_hash(file: &File) -> Option<(&str, &str)> {
    if let Some(digest) = file.hashes.get("sha256") {
        return Some(("sha256", digest));
    }
    file.hashes
        .iter()
        .next()
        .map(|(algorithm, digest)| (algorithm.as_str(), digest.as_str()))
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
