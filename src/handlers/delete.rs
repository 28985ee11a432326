use std::sync::Arc;

use crate::config::{LocationConfig, ServerConfig};
use crate::error::HttpError;
use crate::handlers::resolve_final_path;
use crate::http::{HttpRequest, HttpResponse};

pub fn handle_delete(
    request: &HttpRequest,
    location: &LocationConfig,
    server: &Arc<ServerConfig>,
    response: &mut HttpResponse,
) -> Result<(), HttpError> {
    let (final_path, is_directory) = resolve_final_path(location, request, server)?;

    if is_directory {
        return Err(HttpError::Forbidden);
    }

    std::fs::remove_file(&final_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => HttpError::NotFound,
        std::io::ErrorKind::PermissionDenied => HttpError::Forbidden,
        _ => HttpError::InternalServerError,
    })?;

    response
        .set_status_code(200)
        .set_body(b"File deleted successfully".to_vec(), "text/plain");
    Ok(())
}
