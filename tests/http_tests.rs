use std::sync::Arc;

use johnx::config::{LocationConfig, ServerConfig};
use johnx::error::HttpError;
use johnx::http::{Method, ParsingStatus, RequestParser, parse_multipart_body, url_decode};

#[test]
fn test_simple_get_request() {
    let mut parser = RequestParser::new();
    let raw = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";

    let status = parser.consume(raw).unwrap();
    assert_eq!(status, ParsingStatus::Complete);

    let req = parser.take_request();
    assert_eq!(req.method, Method::Get);
    assert_eq!(req.path, "/index.html");
    assert_eq!(req.version, "HTTP/1.1");
    assert_eq!(req.header("host"), Some("localhost"));
}

#[test]
fn test_fragmented_request() {
    let mut parser = RequestParser::new();

    assert_eq!(
        parser.consume(b"GET /path ").unwrap(),
        ParsingStatus::Incomplete
    );
    assert_eq!(
        parser.consume(b"HTTP/1.1\r\n").unwrap(),
        ParsingStatus::Incomplete
    );
    assert_eq!(
        parser.consume(b"Host: localhost\r\n").unwrap(),
        ParsingStatus::Incomplete
    );
    assert_eq!(parser.consume(b"\r\n").unwrap(), ParsingStatus::Complete);

    let req = parser.take_request();
    assert_eq!(req.path, "/path");
}

#[test]
fn test_post_with_content_length() {
    let mut parser = RequestParser::new();
    let raw = b"POST /api HTTP/1.1\r\nHost: x\r\nContent-Length: 13\r\n\r\nHello, World!";

    assert_eq!(parser.consume(raw).unwrap(), ParsingStatus::Complete);

    let req = parser.take_request();
    assert_eq!(req.method, Method::Post);
    assert_eq!(req.body, b"Hello, World!");
    assert_eq!(req.content_length, Some(13));
}

#[test]
fn test_post_fragmented_body() {
    let mut parser = RequestParser::new();
    let head = b"POST /data HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n";

    assert_eq!(parser.consume(head).unwrap(), ParsingStatus::Incomplete);
    assert_eq!(parser.consume(b"12345").unwrap(), ParsingStatus::Incomplete);
    assert_eq!(parser.consume(b"67890").unwrap(), ParsingStatus::Complete);

    let req = parser.take_request();
    assert_eq!(req.body, b"1234567890");
}

#[test]
fn test_missing_host_rejected() {
    let mut parser = RequestParser::new();
    let raw = b"GET / HTTP/1.1\r\n\r\n";
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::BadRequest);
}

#[test]
fn test_absolute_uri_synthesises_host() {
    let mut parser = RequestParser::new();
    let raw = b"GET http://example.com/foo HTTP/1.1\r\n\r\n";

    assert_eq!(parser.consume(raw).unwrap(), ParsingStatus::Complete);

    let req = parser.take_request();
    assert_eq!(req.path, "/foo");
    assert_eq!(req.header("host"), Some("example.com"));
}

#[test]
fn test_unknown_method_not_implemented() {
    let mut parser = RequestParser::new();
    let raw = b"PATCH / HTTP/1.1\r\nHost: x\r\n\r\n";
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::NotImplemented);
}

#[test]
fn test_http_version_rules() {
    let mut parser = RequestParser::new();
    assert_eq!(
        parser
            .consume(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n")
            .unwrap_err(),
        HttpError::HttpVersionNotSupported
    );

    let mut parser = RequestParser::new();
    assert_eq!(
        parser.consume(b"GET / FTP/1.1\r\nHost: x\r\n\r\n").unwrap_err(),
        HttpError::BadRequest
    );

    let mut parser = RequestParser::new();
    assert_eq!(
        parser
            .consume(b"GET / HTTP/1.1trailing\r\nHost: x\r\n\r\n")
            .unwrap_err(),
        HttpError::BadRequest
    );
}

#[test]
fn test_request_line_length_boundary() {
    // 8192 bytes exactly: accepted.
    let uri = format!("/{}", "a".repeat(8178));
    let line = format!("GET {} HTTP/1.1", uri);
    assert_eq!(line.len(), 8192);

    let mut parser = RequestParser::new();
    let raw = format!("{}\r\nHost: x\r\n\r\n", line);
    assert_eq!(
        parser.consume(raw.as_bytes()).unwrap(),
        ParsingStatus::Complete
    );

    // One more byte: 414.
    let uri = format!("/{}", "a".repeat(8179));
    let raw = format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", uri);
    let mut parser = RequestParser::new();
    assert_eq!(
        parser.consume(raw.as_bytes()).unwrap_err(),
        HttpError::UriTooLong
    );
}

#[test]
fn test_oversized_header_line() {
    let raw = format!(
        "GET / HTTP/1.1\r\nHost: x\r\nX-Big: {}\r\n\r\n",
        "v".repeat(8192)
    );
    let mut parser = RequestParser::new();
    assert_eq!(
        parser.consume(raw.as_bytes()).unwrap_err(),
        HttpError::HeaderFieldTooLarge
    );
}

#[test]
fn test_header_starting_with_whitespace() {
    let raw = b"GET / HTTP/1.1\r\nHost: x\r\n folded: nope\r\n\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::BadRequest);
}

#[test]
fn test_duplicate_host_rejected() {
    let raw = b"GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::BadRequest);
}

#[test]
fn test_invalid_content_length() {
    let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: abc\r\n\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::LengthRequired);

    let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: -5\r\n\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::LengthRequired);
}

#[test]
fn test_conflicting_body_framing() {
    let raw =
        b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::BadRequest);

    let raw = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip\r\n\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::BadRequest);
}

#[test]
fn test_post_without_body_framing() {
    let raw = b"POST / HTTP/1.1\r\nHost: x\r\n\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::BadRequest);
}

#[test]
fn test_chunked_body() {
    let raw = b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap(), ParsingStatus::Complete);

    let req = parser.take_request();
    assert!(req.is_chunked);
    assert_eq!(req.body, b"hello");
    // Content length is rewritten to the decoded body size.
    assert_eq!(req.content_length, Some(5));
}

#[test]
fn test_chunked_body_fragmented() {
    let mut parser = RequestParser::new();
    let head = b"POST /e HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n";

    assert_eq!(parser.consume(head).unwrap(), ParsingStatus::Incomplete);
    assert_eq!(parser.consume(b"5\r\n").unwrap(), ParsingStatus::Incomplete);
    assert_eq!(
        parser.consume(b"hello\r\n").unwrap(),
        ParsingStatus::Incomplete
    );
    assert_eq!(
        parser.consume(b"6\r\n world\r\n").unwrap(),
        ParsingStatus::Incomplete
    );
    assert_eq!(parser.consume(b"0\r\n\r\n").unwrap(), ParsingStatus::Complete);

    let req = parser.take_request();
    assert_eq!(req.body, b"hello world");
    assert_eq!(req.content_length, Some(11));
}

#[test]
fn test_chunk_extension_tolerated() {
    let raw =
        b"POST /e HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n0\r\n\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap(), ParsingStatus::Complete);
    assert_eq!(parser.take_request().body, b"hello");
}

#[test]
fn test_invalid_chunk_size() {
    let raw = b"POST /e HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::BadRequest);
}

#[test]
fn test_chunk_missing_trailing_crlf() {
    let raw = b"POST /e HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhelloXX";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::BadRequest);
}

#[test]
fn test_url_decode_and_query_split() {
    let raw = b"GET /a%20b%2Fc?x=1&y=2 HTTP/1.1\r\nHost: x\r\n\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap(), ParsingStatus::Complete);

    let req = parser.take_request();
    assert_eq!(req.path, "/a b/c");
    assert_eq!(req.query_string, "x=1&y=2");

    assert_eq!(url_decode("a+b%21"), "a b!");
    assert_eq!(url_decode("%zz"), "%zz");
}

#[test]
fn test_body_size_limit() {
    let mut server = ServerConfig::default();
    server.base.client_max_body_size = 10;

    // Equal to the limit: accepted.
    let mut parser = RequestParser::with_config(Arc::new(server.clone()));
    let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n0123456789";
    assert_eq!(parser.consume(raw).unwrap(), ParsingStatus::Complete);

    // One over: 413.
    let mut parser = RequestParser::with_config(Arc::new(server));
    let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\n";
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::ContentTooLarge);
}

#[test]
fn test_body_size_limit_uses_matched_location() {
    let mut server = ServerConfig::default();
    server.base.client_max_body_size = 1;
    let mut location = LocationConfig::inherit(&server);
    location.path = "/big".to_string();
    location.base.client_max_body_size = 100;
    server.add_location(location).unwrap();

    let mut parser = RequestParser::with_config(Arc::new(server));
    let raw = b"POST /big HTTP/1.1\r\nHost: x\r\nContent-Length: 50\r\n\r\n";
    assert_eq!(parser.consume(raw).unwrap(), ParsingStatus::Incomplete);
}

#[test]
fn test_chunked_body_respects_limit() {
    let mut server = ServerConfig::default();
    server.base.client_max_body_size = 4;

    let mut parser = RequestParser::with_config(Arc::new(server));
    let raw = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n";
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::ContentTooLarge);
}

#[test]
fn test_multipart_request_decomposition() {
    let body = b"--X\r\nContent-Disposition: form-data; name=\"f\"; filename=\"t.txt\"\r\nContent-Type: text/plain\r\n\r\nabc\r\n--X\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhi there\r\n--X--\r\n";
    let raw = format!(
        "POST /up HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=X\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut full = raw.into_bytes();
    full.extend_from_slice(body);

    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(&full).unwrap(), ParsingStatus::Complete);

    let req = parser.take_request();
    assert_eq!(req.boundary.as_deref(), Some("X"));
    assert_eq!(req.multipart.files.len(), 1);
    assert_eq!(req.multipart.files[0].field_name, "f");
    assert_eq!(req.multipart.files[0].file_name, "t.txt");
    assert_eq!(req.multipart.files[0].content, b"abc");
    assert_eq!(req.multipart.fields["note"], vec!["hi there".to_string()]);
}

#[test]
fn test_multipart_quoted_boundary() {
    let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=\"abc\"\r\nContent-Length: 1\r\n\r\nZ";
    let mut parser = RequestParser::new();
    // Body is not valid multipart, but the boundary itself parses.
    let _ = parser.consume(raw);
}

#[test]
fn test_multipart_without_boundary_rejected() {
    let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data\r\nContent-Length: 3\r\n\r\n";
    let mut parser = RequestParser::new();
    assert_eq!(parser.consume(raw).unwrap_err(), HttpError::BadRequest);
}

#[test]
fn test_parse_multipart_body_directly() {
    let body = b"--B\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nvalue\r\n--B--\r\n";
    let data = parse_multipart_body(body, "B").unwrap();
    assert!(data.files.is_empty());
    assert_eq!(data.fields["a"], vec!["value".to_string()]);
}

#[test]
fn test_pipelined_requests_survive_reset() {
    let mut parser = RequestParser::new();
    let raw = b"GET /one HTTP/1.1\r\nHost: x\r\n\r\nGET /two HTTP/1.1\r\nHost: x\r\n\r\n";

    assert_eq!(parser.consume(raw).unwrap(), ParsingStatus::Complete);
    let first = parser.take_request();
    assert_eq!(first.path, "/one");

    parser.reset();
    assert!(parser.has_buffered_data());
    assert_eq!(parser.consume(&[]).unwrap(), ParsingStatus::Complete);
    let second = parser.take_request();
    assert_eq!(second.path, "/two");
}

#[test]
fn test_parser_resets_after_error() {
    let mut parser = RequestParser::new();
    assert!(parser.consume(b"BROKEN\r\n\r\n").is_err());

    // A fresh request right after parses cleanly.
    let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
    assert_eq!(parser.consume(raw).unwrap(), ParsingStatus::Complete);
}
