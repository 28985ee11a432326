use std::path::Path;
use std::sync::Arc;

use crate::config::{LocationConfig, ServerConfig};
use crate::error::HttpError;
use crate::handlers::{CgiRequest, prepare_cgi, resolve_final_path, should_handle_as_cgi};
use crate::http::{HttpRequest, HttpResponse, generate_autoindex, get_mime_type};

pub fn handle_get(
    request: &HttpRequest,
    location: &LocationConfig,
    server: &Arc<ServerConfig>,
    response: &mut HttpResponse,
) -> Result<Option<CgiRequest>, HttpError> {
    let (final_path, is_directory) = resolve_final_path(location, request, server)?;

    if should_handle_as_cgi(request, &final_path, location) {
        return Ok(Some(prepare_cgi(request, location, &final_path)?));
    }

    if is_directory {
        if let Some(index_path) = try_find_index_file(&final_path, location) {
            serve_regular_file(&index_path, response)?;
            return Ok(None);
        }

        if location.base.autoindex {
            let listing = generate_autoindex(Path::new(&final_path), &request.path);
            response
                .set_status_code(200)
                .set_body(listing.into_bytes(), "text/html");
            return Ok(None);
        }

        return Err(HttpError::Forbidden);
    }

    serve_regular_file(&final_path, response)?;
    Ok(None)
}

fn try_find_index_file(dir_path: &str, location: &LocationConfig) -> Option<String> {
    for index_file in &location.base.index_files {
        let mut candidate = dir_path.to_string();
        if !candidate.ends_with('/') {
            candidate.push('/');
        }
        candidate.push_str(index_file);

        if std::fs::metadata(&candidate)
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Some(candidate);
        }
    }
    None
}

fn serve_regular_file(file_path: &str, response: &mut HttpResponse) -> Result<(), HttpError> {
    let metadata = std::fs::metadata(file_path).map_err(|_| HttpError::Forbidden)?;
    if !metadata.is_file() {
        return Err(HttpError::Forbidden);
    }

    let body = std::fs::read(file_path).map_err(|_| HttpError::NotFound)?;

    let extension = Path::new(file_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    response
        .set_status_code(200)
        .set_body(body, get_mime_type(extension));
    Ok(())
}
