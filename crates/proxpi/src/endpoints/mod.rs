use axum::routing::{delete, get};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::service::Service;

mod error;
mod file;
mod invalidate;
mod listing;

pub use error::ResponseError;

pub async fn healthcheck() -> &'static str {
    "ok"
}

/// Minimal home page; the interesting surface is under `/index/`.
async fn home() -> axum::response::Html<&'static str> {
    axum::response::Html(concat!(
        "<!DOCTYPE html>\n<html><head><title>proxpi</title></head><body>\n",
        "<h1>proxpi</h1>\n",
        "<p>Package index: <a href=\"/index/\">/index/</a></p>\n",
        "</body></html>\n",
    ))
}

pub fn create_app(service: Service) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/index/", get(listing::list_projects))
        .route("/index/{project}/", get(listing::list_files))
        .route("/index/{project}/{filename}", get(file::get_file))
        .route("/cache/list", delete(invalidate::invalidate_list))
        .route("/cache/{project}", delete(invalidate::invalidate_project))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
        // the healthcheck is last, as it will bypass the middleware
        .route("/health", get(healthcheck))
}
