//! The artifact route: `/index/{project}/{filename}`.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;

use proxpi_service::{FetchError, FetchOutcome, FileKey};
use proxpi_sources::ProjectName;

use crate::endpoints::ResponseError;
use crate::service::Service;

pub async fn get_file(
    State(service): State<Service>,
    Path((project, filename)): Path<(String, String)>,
) -> Result<Response, ResponseError> {
    let name: ProjectName = project.parse().map_err(FetchError::from)?;

    let (index_id, file) = service.aggregator().resolve_file(&name, &filename).await?;
    let key = FileKey {
        index: index_id,
        project: name,
        filename: filename.clone(),
    };

    match service.file_cache().get_or_fetch(key, &file.url).await? {
        FetchOutcome::Cached(cached) => {
            // Open while the handle is alive; once open, the descriptor
            // survives any eviction of the path.
            let disk_file = tokio::fs::File::open(cached.path()).await?;
            let length = disk_file.metadata().await?.len();
            drop(cached);

            let content_type = if service.config().binary_file_mime_type {
                "application/octet-stream"
            } else {
                content_type_for(&filename)
            };

            let mut response = Body::from_stream(ReaderStream::new(disk_file)).into_response();
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            Ok(response)
        }
        FetchOutcome::Redirect(url) => {
            let location = HeaderValue::from_str(&url)
                .map_err(|_| FetchError::Malformed(format!("unusable upstream url `{url}`")))?;
            Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
        }
    }
}

/// Content type derived from the artifact file name; anything unknown is
/// served as a generic binary.
fn content_type_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        "application/x-tar"
    } else if lower.ends_with(".zip") {
        "application/zip"
    } else {
        "application/octet-stream"
    }
}
