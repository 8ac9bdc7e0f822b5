//! Upload endpoint.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::debug;

use crate::errors::{generate_request_id, SessionFailure};
use crate::server::RequestId;
use crate::source::form_data::FormDataSource;
use crate::upload::fields::BracketAssembler;
use crate::upload::session::UploadSession;
use crate::upload::RequestContext;
use crate::AppState;

/// `POST /uploads` -- Ingest one `multipart/form-data` request.
#[utoipa::path(
    post,
    path = "/uploads",
    tag = "Upload",
    operation_id = "CreateUpload",
    request_body(
        content = String,
        content_type = "multipart/form-data",
        description = "Form fields and files"
    ),
    responses(
        (status = 200, description = "All fields and stored files, in arrival order"),
        (status = 400, description = "Limit violated, malformed body or filter error"),
        (status = 413, description = "A file exceeded the size limit"),
        (status = 415, description = "Request is not multipart"),
        (status = 500, description = "Storage failure")
    )
)]
pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Result<Response, SessionFailure> {
    let (parts, body) = request.into_parts();
    let request_id = parts
        .extensions
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(generate_request_id);

    let limits = &state.config.limits;
    let source = FormDataSource::from_request(
        &parts.headers,
        body.into_data_stream(),
        limits.part_limits(),
        state.config.uploads.preserve_path,
    )?;
    debug!("Accepted multipart upload {}", request_id);

    let context = RequestContext {
        request_id,
        headers: parts.headers,
    };
    let outcome = UploadSession::new(state.storage.clone(), state.filter.clone(), context)
        .with_assembler(BracketAssembler::new(limits.field_keys))
        .with_field_name_size(limits.field_name_size)
        .run(Box::new(source))
        .await?;

    Ok((StatusCode::OK, Json(outcome)).into_response())
}
