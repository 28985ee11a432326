use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;

use crate::config::ServerConfig;
use crate::prelude::SERVER_SOFTWARE;

/// Response under construction. Header keys are stored lower-cased and
/// title-cased on serialization; the map is ordered so output is
/// deterministic.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_message: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub is_cgi_response: bool,
    pub is_cgi_processed: bool,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new(200, "OK")
    }
}

impl HttpResponse {
    pub fn new(status_code: u16, status_message: &str) -> Self {
        Self {
            status_code,
            status_message: status_message.to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
            is_cgi_response: false,
            is_cgi_processed: false,
        }
    }

    pub fn set_status(&mut self, code: u16, message: &str) -> &mut Self {
        self.status_code = code;
        self.status_message = message.to_string();
        self
    }

    pub fn set_status_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.status_message = Self::status_text(code).to_string();
        self
    }

    pub fn set_header(&mut self, key: &str, value: &str) -> &mut Self {
        self.headers.insert(key.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) -> &mut Self {
        self.set_header("content-type", content_type);
        self.body = body;
        self
    }

    pub fn clear(&mut self) {
        self.status_code = 200;
        self.status_message = "OK".to_string();
        self.headers.clear();
        self.body.clear();
        self.is_cgi_response = false;
        self.is_cgi_processed = false;
    }

    /// Serialized status line, headers and body. `Content-Length` is
    /// computed from the body when not explicitly set.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status_code, self.status_message)
            .into_bytes();

        for (key, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", title_case(key), value).as_bytes());
        }
        if !self.headers.contains_key("content-length") {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    pub fn status_text(code: u16) -> &'static str {
        match code {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Content Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            422 => "Unprocessable Content",
            426 => "Upgrade Required",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "",
        }
    }

    /// Standard response headers. 400 and every 5xx force the connection
    /// closed.
    pub fn build_headers(&mut self, status_code: u16) {
        if status_code == 400 || status_code >= 500 || self.header("connection") == Some("close") {
            self.set_header("connection", "close");
        } else {
            self.set_header("connection", "keep-alive");
        }

        self.set_header("server", SERVER_SOFTWARE);
        self.set_header("date", &gmt_date());
    }

    /// Fills the body for an error status: the server's configured
    /// error_page file when one resolves, the default page otherwise.
    pub fn build_body(&mut self, status_code: u16, config: &ServerConfig) {
        if let Some(page) = config.base.error_pages.get(&status_code) {
            let mut file_path = config.base.root.clone();
            if !file_path.is_empty() && !file_path.ends_with('/') {
                file_path.push('/');
            }
            file_path.push_str(page);

            if let Ok(content) = std::fs::read(&file_path) {
                let extension = Path::new(page)
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("");
                let mime = get_mime_type(extension);
                self.set_body(content, mime);
                return;
            }
        }

        self.build_default_error_page(status_code);
    }

    fn build_default_error_page(&mut self, status_code: u16) {
        if status_code < 300 {
            return;
        }
        let body = format!(
            "<html>\n<head><title>{code} {msg}</title></head>\n<body>\n\
             <center><h1>{code} {msg}</h1></center>\n\
             <hr><center>{software}</center>\n</body>\n</html>\n",
            code = status_code,
            msg = self.status_message,
            software = SERVER_SOFTWARE,
        );
        self.set_body(body.into_bytes(), "text/html");
    }
}

fn title_case(key: &str) -> String {
    key.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                None => String::new(),
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            }
        })
        .collect::<Vec<String>>()
        .join("-")
}

pub fn gmt_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn get_mime_type(extension: &str) -> &'static str {
    match extension {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "txt" => "text/plain",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "xml" => "text/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// nginx-style directory listing: a `../` link first, then one padded row
/// per entry with modification time and size.
pub fn generate_autoindex(dir_path: &Path, request_path: &str) -> String {
    let mut listing = format!(
        "<html>\n<head><title>Index of {path}</title></head>\n<body>\n\
         <h1>Index of {path}</h1><hr><pre><a href=\"../\">../</a>\n",
        path = request_path,
    );

    if let Ok(entries) = dir_path.read_dir() {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };

            let mtime = metadata
                .modified()
                .ok()
                .map(|t| {
                    chrono::DateTime::<chrono::Local>::from(t)
                        .format("%d-%b-%Y %H:%M")
                        .to_string()
                })
                .unwrap_or_default();

            let padding = " ".repeat(50usize.saturating_sub(name.len()));
            listing.push_str(&format!(
                "<a href=\"{name}\">{name}</a>{padding}{mtime} {size:>10}\n",
                name = name,
                padding = padding,
                mtime = mtime,
                size = metadata.len(),
            ));
        }
    }

    listing.push_str("</pre><hr></body>\n</html>");
    listing
}
