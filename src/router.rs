use std::sync::Arc;

use crate::config::{HttpConfig, LocationConfig, ServerConfig};
use crate::http::HttpRequest;

/// Selects the virtual server for a request. Priority, highest first:
/// name+port match, default server on the port, first server on the port,
/// name match on any port, first server overall.
pub fn find_server(config: &HttpConfig, request: &HttpRequest) -> Arc<ServerConfig> {
    let host = request.host().unwrap_or("").to_string();
    let request_port = request.host_port().unwrap_or(request.port);

    let mut name_port_match: Option<&Arc<ServerConfig>> = None;
    let mut default_on_port: Option<&Arc<ServerConfig>> = None;
    let mut first_on_port: Option<&Arc<ServerConfig>> = None;
    let mut name_match: Option<&Arc<ServerConfig>> = None;

    for server in &config.servers {
        let port_matches = server.listens_on(request_port);

        if port_matches {
            if first_on_port.is_none() {
                first_on_port = Some(server);
            }
            if server.is_default && default_on_port.is_none() {
                default_on_port = Some(server);
            }
        }

        if !host.is_empty() && server.has_name(&host) {
            if port_matches {
                name_port_match = Some(server);
            } else if name_match.is_none() {
                name_match = Some(server);
            }
        }
    }

    let selected = name_port_match
        .or(default_on_port)
        .or(first_on_port)
        .or(name_match)
        .unwrap_or(&config.servers[0]);
    Arc::clone(selected)
}

/// The server handed to a fresh connection before any request is parsed:
/// the port's default server, else the first one on the port, else the
/// first server overall.
pub fn default_server_for_port(config: &HttpConfig, port: u16) -> Arc<ServerConfig> {
    let mut first_on_port: Option<&Arc<ServerConfig>> = None;

    for server in &config.servers {
        if server.listens_on(port) {
            if server.is_default {
                return Arc::clone(server);
            }
            if first_on_port.is_none() {
                first_on_port = Some(server);
            }
        }
    }

    Arc::clone(first_on_port.unwrap_or(&config.servers[0]))
}

/// Location lookup: exact match, then longest configured prefix, then the
/// `/` location when present.
pub fn find_location<'a>(server: &'a ServerConfig, request_path: &str) -> Option<&'a LocationConfig> {
    if let Some(exact) = server.locations.get(request_path) {
        return Some(exact);
    }

    let mut prefix_match: Option<&LocationConfig> = None;
    let mut longest = 0usize;
    for (path, location) in &server.locations {
        if request_path.starts_with(path.as_str()) && path.len() > longest {
            longest = path.len();
            prefix_match = Some(location);
        }
    }
    if prefix_match.is_some() {
        return prefix_match;
    }

    server.locations.get("/")
}
