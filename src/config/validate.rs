use std::collections::HashMap;
use std::sync::Arc;

use crate::config::types::{HttpConfig, ListenDirective, ServerConfig};
use crate::error::{Result, ServerError};
use weblog::warn;

/// Post-parse pass: drops servers whose names conflict on an overlapping
/// listen address, guarantees one default server per listen group, checks
/// the remaining invariants, and freezes the tree.
pub fn finalize(mut http: HttpConfig, servers: Vec<ServerConfig>) -> Result<HttpConfig> {
    let servers = drop_conflicting_servers(servers);
    if servers.is_empty() {
        return Err(ServerError::Config("no servers configured".to_string()));
    }

    check_invariants(&http, &servers)?;

    let mut servers = servers;
    ensure_default_per_group(&mut servers);

    http.servers = servers.into_iter().map(Arc::new).collect();
    Ok(http)
}

fn listens_overlap(first: &ListenDirective, second: &ListenDirective) -> bool {
    if first.port != second.port {
        return false;
    }
    first.host == second.host || first.host == "0.0.0.0" || second.host == "0.0.0.0"
}

fn names_conflict(first: &ServerConfig, second: &ServerConfig) -> bool {
    if first.server_names.is_empty() && second.server_names.is_empty() {
        return true;
    }
    first
        .server_names
        .iter()
        .any(|name| second.server_names.contains(name))
}

fn conflicts_with(candidate: &ServerConfig, existing: &ServerConfig) -> bool {
    candidate.listen.iter().any(|new_listen| {
        existing
            .listen
            .iter()
            .any(|old_listen| listens_overlap(new_listen, old_listen))
    }) && names_conflict(candidate, existing)
}

fn drop_conflicting_servers(servers: Vec<ServerConfig>) -> Vec<ServerConfig> {
    let mut kept: Vec<ServerConfig> = Vec::new();

    for server in servers {
        if kept.iter().any(|existing| conflicts_with(&server, existing)) {
            let name = server.server_names.first().cloned().unwrap_or_default();
            for listen in &server.listen {
                warn!(
                    "conflicting server name \"{}\" on {}:{}, ignored",
                    if name == "_" { "" } else { &name },
                    listen.host,
                    listen.port
                );
            }
            continue;
        }
        kept.push(server);
    }

    kept
}

/// Exactly one server per (host, port) group carries the default flag; when
/// none was declared the first server of the group wins.
fn ensure_default_per_group(servers: &mut [ServerConfig]) {
    let mut groups: HashMap<(String, u16), Vec<usize>> = HashMap::new();
    for (idx, server) in servers.iter().enumerate() {
        for listen in &server.listen {
            groups
                .entry((listen.host.clone(), listen.port))
                .or_default()
                .push(idx);
        }
    }

    for indices in groups.values() {
        if !indices.iter().any(|&i| servers[i].is_default) {
            servers[indices[0]].is_default = true;
        }
    }
}

fn check_invariants(http: &HttpConfig, servers: &[ServerConfig]) -> Result<()> {
    if http.base.client_max_body_size == 0 {
        return Err(ServerError::Config(
            "client_max_body_size must be greater than zero".to_string(),
        ));
    }

    for server in servers {
        if server.base.client_max_body_size == 0 {
            return Err(ServerError::Config(
                "client_max_body_size must be greater than zero".to_string(),
            ));
        }
        for location in server.locations.values() {
            if location.base.client_max_body_size == 0 {
                return Err(ServerError::Config(
                    "client_max_body_size must be greater than zero".to_string(),
                ));
            }
            if location.path.is_empty() {
                return Err(ServerError::Config("empty location path".to_string()));
            }
        }
    }

    Ok(())
}
