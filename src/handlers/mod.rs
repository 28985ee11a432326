pub mod delete;
pub mod get;
pub mod post;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{LocationConfig, ServerConfig};
use crate::error::HttpError;
use crate::http::{HttpRequest, HttpResponse, Method};
use crate::router;

pub use delete::handle_delete;
pub use get::handle_get;
pub use post::handle_post;

/// A request that must be handed to the CGI coordinator instead of being
/// answered directly.
#[derive(Debug)]
pub struct CgiRequest {
    pub script_path: PathBuf,
    pub executor: String,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Done,
    Cgi(CgiRequest),
}

/// Director entry point: applies the location policy and leaves either a
/// finished response or a CGI hand-off. Any `HttpError` raised along the
/// way is turned into an error response here.
pub fn construct_response(
    request: &HttpRequest,
    server: &Arc<ServerConfig>,
    response: &mut HttpResponse,
) -> DispatchOutcome {
    match execute_request(request, server, response) {
        Ok(Some(cgi)) => DispatchOutcome::Cgi(cgi),
        Ok(None) => {
            response.build_headers(response.status_code);
            DispatchOutcome::Done
        }
        Err(e) => {
            construct_error_response(e.status(), &e.reason(), server, response);
            DispatchOutcome::Done
        }
    }
}

/// Rebuilds the response as an error: status, standard headers, and the
/// configured or default error page body.
pub fn construct_error_response(
    status_code: u16,
    message: &str,
    server: &ServerConfig,
    response: &mut HttpResponse,
) {
    response.set_status(status_code, message);
    response.build_headers(status_code);
    response.build_body(status_code, server);
}

fn execute_request(
    request: &HttpRequest,
    server: &Arc<ServerConfig>,
    response: &mut HttpResponse,
) -> Result<Option<CgiRequest>, HttpError> {
    if handle_redirect(request, server, response) {
        return Ok(None);
    }

    let location = router::find_location(server, &request.path).ok_or(HttpError::NotFound)?;

    if !location.accepts(&request.method) {
        return Err(HttpError::Forbidden);
    }

    match request.method {
        Method::Get => get::handle_get(request, location, server, response),
        Method::Post => post::handle_post(request, location, server, response),
        Method::Delete => {
            delete::handle_delete(request, location, server, response)?;
            Ok(None)
        }
    }
}

fn handle_redirect(
    request: &HttpRequest,
    server: &Arc<ServerConfig>,
    response: &mut HttpResponse,
) -> bool {
    let Some(location) = router::find_location(server, &request.path) else {
        return false;
    };
    let Some(redirect) = &location.redirect else {
        return false;
    };

    let code = redirect.code;
    response.set_status(code, HttpResponse::status_text(code));

    if matches!(code, 301 | 302 | 303 | 307 | 308) {
        let host = request.header("host").unwrap_or("localhost");
        response.set_header("location", &format!("http://{}{}", host, redirect.url));
        response.build_body(code, server);
    } else {
        response.set_header("content-type", "text/plain");
        response.body = redirect.url.clone().into_bytes();
    }

    true
}

// --- path resolution ---

/// Resolves the effective document root for a location: an absolute
/// override is used as-is, a relative override nests under the server
/// root, and the inherited value is the server root itself. The resolved
/// directory must exist and be readable.
pub fn resolve_root_path(
    location: &LocationConfig,
    server: &ServerConfig,
) -> Result<String, HttpError> {
    let location_root = &location.base.root;
    if location_root.is_empty() {
        return Err(HttpError::InternalServerError);
    }

    let mut resolved = if !location.base.root_set || location_root.starts_with('/') {
        location_root.clone()
    } else {
        let server_root = &server.base.root;
        if server_root.is_empty() {
            return Err(HttpError::InternalServerError);
        }
        format!("{}/{}", server_root, location_root)
    };

    if resolved.contains("..") {
        return Err(HttpError::Forbidden);
    }
    collapse_slashes(&mut resolved);
    validate_directory_access(&resolved)?;

    Ok(resolved)
}

fn collapse_slashes(path: &mut String) {
    let mut collapsed = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !last_was_slash {
                collapsed.push(c);
            }
            last_was_slash = true;
        } else {
            collapsed.push(c);
            last_was_slash = false;
        }
    }
    *path = collapsed;
}

fn validate_directory_access(path: &str) -> Result<(), HttpError> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => HttpError::Forbidden,
        _ => HttpError::NotFound,
    })?;

    if !metadata.is_dir() {
        return Err(HttpError::InternalServerError);
    }

    std::fs::read_dir(path).map_err(|_| HttpError::Forbidden)?;
    Ok(())
}

/// Full target path for a request: resolved root plus the request path
/// remainder after the location prefix. CGI targets skip the existence
/// check; for everything else the path must stat and reports whether it is
/// a directory.
pub fn resolve_final_path(
    location: &LocationConfig,
    request: &HttpRequest,
    server: &ServerConfig,
) -> Result<(String, bool), HttpError> {
    let resolved_root = resolve_root_path(location, server)?;
    let remaining = extract_remaining_path(location, request);
    let final_path = combine_paths(&resolved_root, &remaining);

    if is_cgi_path(request, location) {
        return Ok((final_path, false));
    }

    let metadata = std::fs::metadata(&final_path).map_err(|_| HttpError::NotFound)?;
    Ok((final_path, metadata.is_dir()))
}

fn extract_remaining_path(location: &LocationConfig, request: &HttpRequest) -> String {
    let remaining = request
        .path
        .strip_prefix(location.path.as_str())
        .unwrap_or(&request.path);

    if !remaining.is_empty() && !remaining.starts_with('/') {
        format!("/{}", remaining)
    } else {
        remaining.to_string()
    }
}

fn combine_paths(root: &str, remaining: &str) -> String {
    let root = root.strip_suffix('/').unwrap_or(root);
    format!("{}{}", root, remaining)
}

fn is_cgi_path(request: &HttpRequest, location: &LocationConfig) -> bool {
    request_extension(request)
        .map(|ext| location.cgi_executor(ext).is_some())
        .unwrap_or(false)
}

fn request_extension(request: &HttpRequest) -> Option<&str> {
    request.path.rfind('.').map(|dot| &request.path[dot..])
}

/// CGI detection per location policy: a configured executor for the path's
/// extension, or a configured script filename with `.php` in the target.
pub fn should_handle_as_cgi(
    request: &HttpRequest,
    final_path: &str,
    location: &LocationConfig,
) -> bool {
    if is_cgi_path(request, location) {
        return true;
    }
    !location.script_filename.is_empty() && final_path.contains(".php")
}

/// Picks the executor and validates the script target.
pub fn prepare_cgi(
    request: &HttpRequest,
    location: &LocationConfig,
    final_path: &str,
) -> Result<CgiRequest, HttpError> {
    let extension = request_extension(request).ok_or(HttpError::BadRequest)?;
    let executor = location
        .cgi_executor(extension)
        .ok_or(HttpError::InternalServerError)?
        .to_string();

    if !Path::new(final_path).exists() {
        return Err(HttpError::NotFound);
    }

    Ok(CgiRequest {
        script_path: PathBuf::from(final_path),
        executor,
    })
}
