use std::str::FromStr;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::error::HttpError;
use crate::http::request::{FileUpload, HttpRequest, Method, MultipartData};
use crate::router;

const CRLF_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsingStatus {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Start,
    Headers,
    Body,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data,
    Trailer,
    Done,
}

/// Incremental HTTP/1.1 request parser. `consume` appends bytes and drives
/// the state machine as far as the buffered data allows; a framing violation
/// resets the parser and surfaces the matching `HttpError`.
#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    buffer: Vec<u8>,
    request: HttpRequest,
    content_length: Option<usize>,
    body_expected: bool,
    is_chunked: bool,
    chunk_state: ChunkState,
    current_chunk_size: usize,
    absolute_uri_host: Option<String>,
    config: Option<Arc<ServerConfig>>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            state: ParseState::Start,
            buffer: Vec::with_capacity(4096),
            request: HttpRequest::new(),
            content_length: None,
            body_expected: false,
            is_chunked: false,
            chunk_state: ChunkState::Size,
            current_chunk_size: 0,
            absolute_uri_host: None,
            config: None,
        }
    }

    pub fn with_config(config: Arc<ServerConfig>) -> Self {
        let mut parser = Self::new();
        parser.config = Some(config);
        parser
    }

    pub fn set_config(&mut self, config: Arc<ServerConfig>) {
        self.config = Some(config);
    }

    pub fn server(&self) -> Option<&Arc<ServerConfig>> {
        self.config.as_ref()
    }

    pub fn consume(&mut self, data: &[u8]) -> Result<ParsingStatus, HttpError> {
        self.buffer.extend_from_slice(data);

        match self.process_current_state() {
            Ok(status) => Ok(status),
            Err(e) => {
                self.reset_after_error();
                Err(e)
            }
        }
    }

    /// Yields the parsed request once `consume` reported `Complete`.
    pub fn take_request(&mut self) -> HttpRequest {
        std::mem::take(&mut self.request)
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// Unconsumed bytes, i.e. a pipelined follow-up request.
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Prepares for the next request on the same connection; buffered
    /// pipelined bytes survive.
    pub fn reset(&mut self) {
        self.state = ParseState::Start;
        self.request = HttpRequest::new();
        self.content_length = None;
        self.body_expected = false;
        self.is_chunked = false;
        self.chunk_state = ChunkState::Size;
        self.current_chunk_size = 0;
        self.absolute_uri_host = None;
    }

    fn reset_after_error(&mut self) {
        self.reset();
        self.buffer.clear();
    }

    fn process_current_state(&mut self) -> Result<ParsingStatus, HttpError> {
        loop {
            match self.state {
                ParseState::Start => {
                    if !self.parse_start_line()? {
                        return Ok(ParsingStatus::Incomplete);
                    }
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    if !self.parse_headers()? {
                        return Ok(ParsingStatus::Incomplete);
                    }
                    self.state = if self.body_expected || self.is_chunked {
                        ParseState::Body
                    } else {
                        ParseState::Complete
                    };
                }
                ParseState::Body => {
                    let done = if self.is_chunked {
                        self.parse_chunked_body()?
                    } else {
                        self.parse_body()?
                    };
                    if !done {
                        return Ok(ParsingStatus::Incomplete);
                    }
                    self.state = ParseState::Complete;
                }
                ParseState::Complete => return Ok(ParsingStatus::Complete),
            }
        }
    }

    // --- start line ---

    fn parse_start_line(&mut self) -> Result<bool, HttpError> {
        let Some(pos) = find_subsequence(&self.buffer, b"\r\n", 0) else {
            return Ok(false);
        };

        let line = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
        let line = line.trim_matches([' ', '\t']);

        if line.len() > crate::prelude::MAX_LINE_SIZE {
            return Err(HttpError::UriTooLong);
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 3 {
            return Err(HttpError::BadRequest);
        }

        let method = Method::from_str(tokens[0])?;
        let mut uri = tokens[1].to_string();
        let version = tokens[2].to_string();
        validate_version(&version)?;

        if uri.starts_with("http://") {
            let rest = uri["http://".len()..].to_string();
            let Some(path_start) = rest.find('/') else {
                return Err(HttpError::BadRequest);
            };
            self.absolute_uri_host = Some(rest[..path_start].to_string());
            uri = rest[path_start..].to_string();
        }

        let uri = url_decode(&uri);
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (uri, String::new()),
        };

        self.request.method = method;
        self.request.path = path;
        self.request.query_string = query;
        self.request.version = version;

        self.buffer.drain(..pos + CRLF_LEN);
        Ok(true)
    }

    // --- headers ---

    fn parse_headers(&mut self) -> Result<bool, HttpError> {
        loop {
            let Some(pos) = find_subsequence(&self.buffer, b"\r\n", 0) else {
                return Ok(false);
            };

            if pos == 0 {
                self.buffer.drain(..CRLF_LEN);
                self.validate_request()?;
                return Ok(true);
            }

            if self.buffer[0] == b' ' || self.buffer[0] == b'\t' {
                return Err(HttpError::BadRequest);
            }

            let line: Vec<u8> = self.buffer.drain(..pos + CRLF_LEN).collect();
            let line = &line[..pos];
            if line.len() > crate::prelude::MAX_LINE_SIZE {
                return Err(HttpError::HeaderFieldTooLarge);
            }

            let line = String::from_utf8_lossy(line);
            let Some((key, value)) = line.split_once(':') else {
                return Err(HttpError::BadRequest);
            };
            let key = key.trim_matches([' ', '\t']);
            let value = value.trim_matches([' ', '\t']);

            validate_header_key(key)?;
            self.add_header(&key.to_ascii_lowercase(), value)?;
        }
    }

    fn add_header(&mut self, key: &str, value: &str) -> Result<(), HttpError> {
        if key == "host" && self.request.headers.contains_key("host") {
            return Err(HttpError::BadRequest);
        }

        self.request.headers.insert(key.to_string(), value.to_string());

        match key {
            "content-length" => self.process_content_length(value),
            "transfer-encoding" => self.process_transfer_encoding(value),
            "content-type" => self.process_content_type(value),
            _ => Ok(()),
        }
    }

    fn process_content_length(&mut self, value: &str) -> Result<(), HttpError> {
        if self.is_chunked {
            return Err(HttpError::BadRequest);
        }

        let length: i64 = value.parse().map_err(|_| HttpError::LengthRequired)?;
        if length < 0 {
            return Err(HttpError::LengthRequired);
        }

        self.content_length = Some(length as usize);
        self.request.content_length = Some(length as usize);
        self.body_expected = length > 0;
        Ok(())
    }

    fn process_transfer_encoding(&mut self, value: &str) -> Result<(), HttpError> {
        if self.body_expected {
            return Err(HttpError::BadRequest);
        }
        if value != "chunked" {
            return Err(HttpError::BadRequest);
        }
        self.is_chunked = true;
        self.request.is_chunked = true;
        Ok(())
    }

    fn process_content_type(&mut self, value: &str) -> Result<(), HttpError> {
        let (base_type, params) = match value.split_once(';') {
            Some((base, params)) => (base.trim(), Some(params)),
            None => (value.trim(), None),
        };
        self.request.content_type = base_type.to_string();

        if base_type == "multipart/form-data" || base_type == "multipart/mixed" {
            let Some(params) = params else {
                return Err(HttpError::BadRequest);
            };
            let Some(boundary_pos) = params.find("boundary=") else {
                return Err(HttpError::BadRequest);
            };
            let mut boundary = params[boundary_pos + "boundary=".len()..].trim();
            if boundary.is_empty() {
                return Err(HttpError::BadRequest);
            }
            if boundary.starts_with('"') {
                if boundary.len() < 2 || !boundary.ends_with('"') {
                    return Err(HttpError::BadRequest);
                }
                boundary = &boundary[1..boundary.len() - 1];
            }
            self.request.boundary = Some(boundary.to_string());
        }
        Ok(())
    }

    fn validate_request(&mut self) -> Result<(), HttpError> {
        if let Some(host) = self.absolute_uri_host.take() {
            self.request.headers.insert("host".to_string(), host);
        } else if !self.request.headers.contains_key("host") {
            return Err(HttpError::BadRequest);
        }

        if self.request.method == Method::Post
            && self.content_length.is_none()
            && !self.is_chunked
        {
            return Err(HttpError::BadRequest);
        }

        if let Some(length) = self.content_length {
            if length > self.max_body_size() {
                return Err(HttpError::ContentTooLarge);
            }
        }

        Ok(())
    }

    /// Body cap of the location matching the request path, falling back to
    /// the server's own limit.
    fn max_body_size(&self) -> usize {
        if let Some(server) = &self.config {
            if let Some(location) = router::find_location(server, &self.request.path) {
                return location.base.client_max_body_size;
            }
            return server.base.client_max_body_size;
        }
        crate::config::types::DEFAULT_CLIENT_MAX_BODY_SIZE
    }

    // --- body ---

    fn parse_body(&mut self) -> Result<bool, HttpError> {
        let Some(content_length) = self.content_length else {
            return Ok(true);
        };

        let remaining = content_length - self.request.body.len();
        if self.buffer.len() >= remaining {
            let tail: Vec<u8> = self.buffer.drain(..remaining).collect();
            self.request.body.extend_from_slice(&tail);
            self.finish_body()?;
            Ok(true)
        } else {
            self.request.body.append(&mut self.buffer);
            Ok(false)
        }
    }

    fn parse_chunked_body(&mut self) -> Result<bool, HttpError> {
        loop {
            match self.chunk_state {
                ChunkState::Size => {
                    let Some(pos) = find_subsequence(&self.buffer, b"\r\n", 0) else {
                        return Ok(false);
                    };

                    let size_line = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
                    // Chunk extensions after ';' are tolerated and ignored.
                    let size_str = size_line.split(';').next().unwrap_or("").trim();
                    let chunk_size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| HttpError::BadRequest)?;

                    if self.request.body.len() + chunk_size > self.max_body_size() {
                        return Err(HttpError::ContentTooLarge);
                    }

                    self.buffer.drain(..pos + CRLF_LEN);
                    self.current_chunk_size = chunk_size;
                    self.chunk_state = if chunk_size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data
                    };
                }

                ChunkState::Data => {
                    if self.buffer.len() < self.current_chunk_size + CRLF_LEN {
                        return Ok(false);
                    }

                    let data: Vec<u8> = self.buffer.drain(..self.current_chunk_size).collect();
                    self.request.body.extend_from_slice(&data);

                    if &self.buffer[..CRLF_LEN] != b"\r\n" {
                        return Err(HttpError::BadRequest);
                    }
                    self.buffer.drain(..CRLF_LEN);
                    self.chunk_state = ChunkState::Size;
                }

                ChunkState::Trailer => {
                    let Some(pos) = find_subsequence(&self.buffer, b"\r\n", 0) else {
                        return Ok(false);
                    };
                    self.buffer.drain(..pos + CRLF_LEN);
                    self.chunk_state = ChunkState::Done;
                }

                ChunkState::Done => {
                    self.content_length = Some(self.request.body.len());
                    self.request.content_length = Some(self.request.body.len());
                    self.chunk_state = ChunkState::Size;
                    self.current_chunk_size = 0;
                    self.finish_body()?;
                    return Ok(true);
                }
            }
        }
    }

    fn finish_body(&mut self) -> Result<(), HttpError> {
        if self.request.is_multipart() {
            let boundary = self
                .request
                .boundary
                .clone()
                .ok_or(HttpError::BadRequest)?;
            self.request.multipart = parse_multipart_body(&self.request.body, &boundary)?;
        }
        Ok(())
    }
}

fn validate_version(version: &str) -> Result<(), HttpError> {
    if version.is_empty() {
        return Err(HttpError::BadRequest);
    }
    if version == "HTTP/1.1" {
        return Ok(());
    }
    if version.starts_with("HTTP/1.1") {
        return Err(HttpError::BadRequest);
    }
    if version.starts_with("HTTP/") {
        return Err(HttpError::HttpVersionNotSupported);
    }
    Err(HttpError::BadRequest)
}

fn validate_header_key(key: &str) -> Result<(), HttpError> {
    if key.is_empty() {
        return Err(HttpError::BadRequest);
    }
    for c in key.chars() {
        let valid = c.is_ascii_alphanumeric()
            || matches!(
                c,
                '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`'
                    | '|' | '~'
            );
        if !valid {
            return Err(HttpError::BadRequest);
        }
    }
    Ok(())
}

/// Percent-decoding with `+` treated as space.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &input[i + 1..i + 3];
                if let Ok(value) = u8::from_str_radix(hex, 16) {
                    out.push(value);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

pub fn find_subsequence(buffer: &[u8], needle: &[u8], start_offset: usize) -> Option<usize> {
    if needle.is_empty() || start_offset > buffer.len() {
        return None;
    }
    buffer[start_offset..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| start_offset + pos)
}

// --- multipart decoder ---

#[derive(Debug, Default)]
struct PartInfo {
    name: String,
    filename: Option<String>,
    content_type: String,
}

/// Splits a complete body on `--<boundary>` lines and collects file and
/// text-field parts.
pub fn parse_multipart_body(body: &[u8], boundary: &str) -> Result<MultipartData, HttpError> {
    let marker = format!("--{}", boundary);
    let marker = marker.as_bytes();
    let mut data = MultipartData::default();

    let mut pos = 0usize;
    while let Some(next_pos) = find_subsequence(body, marker, pos) {
        if pos > 0 && next_pos >= pos + CRLF_LEN {
            process_part(&body[pos..next_pos - CRLF_LEN], &mut data)?;
        }
        pos = next_pos + marker.len() + CRLF_LEN;
        if pos > body.len() {
            break;
        }
    }

    Ok(data)
}

fn process_part(part: &[u8], data: &mut MultipartData) -> Result<(), HttpError> {
    let Some(header_end) = find_subsequence(part, b"\r\n\r\n", 0) else {
        return Err(HttpError::BadRequest);
    };

    let headers = String::from_utf8_lossy(&part[..header_end]).into_owned();
    let content = &part[header_end + 4..];

    let info = extract_part_info(&headers);
    if let Some(filename) = info.filename {
        if !filename.is_empty() {
            data.files.push(FileUpload {
                field_name: info.name,
                file_name: filename,
                content_type: info.content_type,
                content: content.to_vec(),
            });
            return Ok(());
        }
    }

    data.fields
        .entry(info.name)
        .or_default()
        .push(String::from_utf8_lossy(content).into_owned());
    Ok(())
}

fn extract_part_info(headers: &str) -> PartInfo {
    let mut info = PartInfo::default();

    for line in headers.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(disposition) = line.strip_prefix("Content-Disposition:") {
            info.name = extract_quoted_param(disposition, "name=\"").unwrap_or_default();
            info.filename = extract_quoted_param(disposition, "filename=\"");
        } else if let Some(content_type) = line.strip_prefix("Content-Type:") {
            info.content_type = content_type.trim().to_string();
        }
    }

    info
}

fn extract_quoted_param(input: &str, prefix: &str) -> Option<String> {
    let start = input.find(prefix)? + prefix.len();
    let end = input[start..].find('"')?;
    Some(input[start..start + end].to_string())
}
