use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::HttpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn all() -> Vec<Method> {
        vec![Method::Get, Method::Post, Method::Delete]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl FromStr for Method {
    type Err = HttpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            _ => Err(HttpError::NotImplemented),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One decoded `multipart/form-data` file part.
#[derive(Debug, Clone, Default)]
pub struct FileUpload {
    pub field_name: String,
    pub file_name: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

impl FileUpload {
    /// Writes the part under `upload_path` using the client-supplied name.
    pub fn save_to(&self, upload_path: &str) -> std::io::Result<PathBuf> {
        if self.file_name.is_empty() || self.content.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty upload part",
            ));
        }
        let full_path = Path::new(upload_path).join(&self.file_name);
        std::fs::write(&full_path, &self.content)?;
        Ok(full_path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MultipartData {
    pub files: Vec<FileUpload>,
    pub fields: HashMap<String, Vec<String>>,
}

/// A fully parsed request as handed to the router and builders. Header keys
/// are stored lower-cased.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query_string: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_length: Option<usize>,
    pub is_chunked: bool,
    pub content_type: String,
    pub boundary: Option<String>,
    pub multipart: MultipartData,
    /// Port of the listener that accepted the connection.
    pub port: u16,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    pub fn new() -> Self {
        HttpRequest {
            method: Method::Get,
            path: String::new(),
            query_string: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            content_length: None,
            is_chunked: false,
            content_type: String::new(),
            boundary: None,
            multipart: MultipartData::default(),
            port: 0,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type == "multipart/form-data" || self.content_type == "multipart/mixed"
    }

    /// Host header without any `:port` suffix.
    pub fn host(&self) -> Option<&str> {
        self.header("host").map(|h| h.split(':').next().unwrap_or(h))
    }

    /// Port carried in the Host header, when present it overrides the
    /// connection port for virtual-server matching.
    pub fn host_port(&self) -> Option<u16> {
        let host = self.header("host")?;
        let (_, port) = host.split_once(':')?;
        port.parse().ok()
    }

    pub fn wants_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} {}", self.method, self.path, self.version)?;
        for (key, value) in &self.headers {
            writeln!(f, "{}: {}", key, value)?;
        }
        writeln!(f, "({} body bytes)", self.body.len())
    }
}
