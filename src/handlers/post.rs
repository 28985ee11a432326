use std::sync::Arc;

use crate::config::{LocationConfig, ServerConfig};
use crate::error::HttpError;
use crate::handlers::{CgiRequest, prepare_cgi, resolve_final_path, should_handle_as_cgi};
use crate::http::{HttpRequest, HttpResponse};

pub fn handle_post(
    request: &HttpRequest,
    location: &LocationConfig,
    server: &Arc<ServerConfig>,
    response: &mut HttpResponse,
) -> Result<Option<CgiRequest>, HttpError> {
    let (final_path, _) = resolve_final_path(location, request, server)?;

    if should_handle_as_cgi(request, &final_path, location) {
        return Ok(Some(prepare_cgi(request, location, &final_path)?));
    }

    if is_multipart_form_data(request) {
        handle_multipart_upload(request, location, response)?;
        return Ok(None);
    }

    if request.is_chunked {
        // Chunked POST without multipart echoes the framing back.
        response
            .set_status_code(200)
            .set_header("transfer-encoding", "chunked");
        return Ok(None);
    }

    Err(HttpError::MethodNotAllowed)
}

fn is_multipart_form_data(request: &HttpRequest) -> bool {
    request
        .header("content-type")
        .map(|v| v.contains("multipart/form-data"))
        .unwrap_or(false)
}

fn handle_multipart_upload(
    request: &HttpRequest,
    location: &LocationConfig,
    response: &mut HttpResponse,
) -> Result<(), HttpError> {
    let upload_path = ensure_upload_directory(location)?;
    let files = &request.multipart.files;

    if files.is_empty() {
        set_created_response(response, &upload_path, "Form data processed successfully");
        return Ok(());
    }

    for file in files {
        file.save_to(&upload_path)
            .map_err(|_| HttpError::InternalServerError)?;
    }

    let message = format!("Files uploaded successfully: {} file(s)", files.len());
    set_created_response(response, &upload_path, &message);
    Ok(())
}

fn ensure_upload_directory(location: &LocationConfig) -> Result<String, HttpError> {
    let upload_path = &location.upload_path;
    if upload_path.is_empty() {
        return Err(HttpError::InternalServerError);
    }

    let metadata =
        std::fs::metadata(upload_path).map_err(|_| HttpError::InternalServerError)?;
    if !metadata.is_dir() {
        return Err(HttpError::InternalServerError);
    }

    Ok(upload_path.clone())
}

fn set_created_response(response: &mut HttpResponse, upload_path: &str, message: &str) {
    response
        .set_status_code(201)
        .set_header("location", upload_path)
        .set_body(message.as_bytes().to_vec(), "text/plain");
}
