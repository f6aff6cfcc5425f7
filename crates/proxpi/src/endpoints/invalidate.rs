//! Cache invalidation routes: `DELETE /cache/list` and
//! `DELETE /cache/{project}`.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use proxpi_service::FetchError;
use proxpi_sources::ProjectName;

use crate::endpoints::ResponseError;
use crate::service::Service;

pub async fn invalidate_list(State(service): State<Service>) -> Json<Value> {
    service.aggregator().invalidate_list();
    service.file_cache().invalidate_all();
    Json(json!({"status": "success", "data": null}))
}

pub async fn invalidate_project(
    State(service): State<Service>,
    Path(project): Path<String>,
) -> Result<Json<Value>, ResponseError> {
    let name: ProjectName = project.parse().map_err(FetchError::from)?;
    service.aggregator().invalidate_project(&name);
    service.file_cache().invalidate_project(&name);
    Ok(Json(json!({"status": "success", "data": null})))
}
