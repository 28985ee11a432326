use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const DEFAULT_CLIENT_MAX_BODY_SIZE: usize = 1024 * 1024;
pub const DEFAULT_KEEPALIVE_TIMEOUT_MS: u64 = 75_000;
pub const DEFAULT_CGI_READ_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_INDEX_FILE: &str = "index.html";
pub const FALLBACK_LISTEN_HOST: &str = "0.0.0.0";
pub const FALLBACK_LISTEN_PORT: u16 = 8080;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenDirective {
    pub host: String,
    pub port: u16,
}

impl ListenDirective {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub url: String,
    pub code: u16,
}

/// Attributes shared by every level of the configuration tree. Children are
/// constructed from a copy of their parent's base, so overrides cascade
/// http -> server -> location.
#[derive(Debug, Clone)]
pub struct BaseConfig {
    pub root: String,
    pub root_set: bool,
    pub client_max_body_size: usize,
    pub autoindex: bool,
    pub autoindex_set: bool,
    pub error_pages: HashMap<u16, String>,
    pub index_files: Vec<String>,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            root: String::new(),
            root_set: false,
            client_max_body_size: DEFAULT_CLIENT_MAX_BODY_SIZE,
            autoindex: false,
            autoindex_set: false,
            error_pages: HashMap::new(),
            index_files: Vec::new(),
        }
    }
}

impl BaseConfig {
    /// A child block starts from the parent's effective values; the
    /// `*_set` latches restart so overrides and duplicate-directive
    /// detection are per block.
    pub fn inherit(&self) -> Self {
        let mut base = self.clone();
        base.autoindex_set = false;
        base.root_set = false;
        base
    }
}

/// The root of the immutable configuration tree: the `http { ... }` block.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base: BaseConfig,
    pub keepalive_timeout_ms: u64,
    pub keepalive_timeout_set: bool,
    pub servers: Vec<Arc<ServerConfig>>,
}

impl HttpConfig {
    pub fn new() -> Self {
        Self {
            base: BaseConfig::default(),
            keepalive_timeout_ms: DEFAULT_KEEPALIVE_TIMEOUT_MS,
            keepalive_timeout_set: false,
            servers: Vec::new(),
        }
    }

    /// Every unique host:port pair across all server blocks, in first-seen
    /// order. One listener is bound per entry.
    pub fn listen_endpoints(&self) -> Vec<ListenDirective> {
        let mut endpoints: Vec<ListenDirective> = Vec::new();
        for server in &self.servers {
            for ld in &server.listen {
                if !endpoints.contains(ld) {
                    endpoints.push(ld.clone());
                }
            }
        }
        endpoints
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub base: BaseConfig,
    pub server_names: Vec<String>,
    pub listen: Vec<ListenDirective>,
    pub is_default: bool,
    pub keepalive_timeout_ms: u64,
    pub keepalive_timeout_set: bool,
    pub redirect: Option<Redirect>,
    pub locations: BTreeMap<String, LocationConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base: BaseConfig::default(),
            server_names: Vec::new(),
            listen: Vec::new(),
            is_default: false,
            keepalive_timeout_ms: DEFAULT_KEEPALIVE_TIMEOUT_MS,
            keepalive_timeout_set: false,
            redirect: None,
            locations: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn inherit(http: &HttpConfig) -> Self {
        Self {
            base: http.base.inherit(),
            keepalive_timeout_ms: http.keepalive_timeout_ms,
            ..Default::default()
        }
    }

    pub fn listens_on(&self, port: u16) -> bool {
        self.listen.iter().any(|ld| ld.port == port)
    }

    pub fn has_name(&self, host: &str) -> bool {
        self.server_names.iter().any(|name| name == host)
    }

    pub fn add_location(&mut self, location: LocationConfig) -> Result<(), String> {
        if self.locations.contains_key(&location.path) {
            return Err(format!("duplicate location \"{}\"", location.path));
        }
        self.locations.insert(location.path.clone(), location);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub base: BaseConfig,
    pub path: String,
    pub accepted_methods: Vec<crate::http::Method>,
    pub redirect: Option<Redirect>,
    pub cgi_executors: HashMap<String, String>,
    pub cgi_read_timeout_ms: u64,
    pub script_filename: String,
    pub upload_path: String,
    pub keepalive_timeout_ms: u64,
    pub keepalive_timeout_set: bool,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            base: BaseConfig::default(),
            path: String::new(),
            accepted_methods: crate::http::Method::all(),
            redirect: None,
            cgi_executors: HashMap::new(),
            cgi_read_timeout_ms: DEFAULT_CGI_READ_TIMEOUT_MS,
            script_filename: String::new(),
            upload_path: String::new(),
            keepalive_timeout_ms: DEFAULT_KEEPALIVE_TIMEOUT_MS,
            keepalive_timeout_set: false,
        }
    }
}

impl LocationConfig {
    pub fn inherit(server: &ServerConfig) -> Self {
        Self {
            base: server.base.inherit(),
            redirect: server.redirect.clone(),
            keepalive_timeout_ms: server.keepalive_timeout_ms,
            ..Default::default()
        }
    }

    pub fn cgi_executor(&self, extension: &str) -> Option<&str> {
        self.cgi_executors.get(extension).map(|s| s.as_str())
    }

    pub fn accepts(&self, method: &crate::http::Method) -> bool {
        self.accepted_methods.contains(method)
    }
}
