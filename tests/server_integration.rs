use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use johnx::config::{HttpConfig, ListenDirective, LocationConfig, ServerConfig};
use johnx::http::Method;
use johnx::server::Server;

fn make_server(root: &str, port: u16) -> ServerConfig {
    let mut server = ServerConfig::default();
    server.base.root = root.to_string();
    server.server_names = vec!["localhost".to_string()];
    server.listen = vec![ListenDirective::new("127.0.0.1", port)];
    server.is_default = true;
    server
}

fn make_location(server: &ServerConfig, path: &str) -> LocationConfig {
    let mut location = LocationConfig::inherit(server);
    location.path = path.to_string();
    location
}

fn start_server(server: ServerConfig) {
    let mut config = HttpConfig::new();
    config.servers.push(Arc::new(server));

    thread::spawn(move || {
        let mut server = Server::new(config).expect("failed to bind test server");
        server.run().expect("server loop failed");
    });

    thread::sleep(Duration::from_millis(300));
}

/// Reads until the read timeout fires or the peer closes; good enough for
/// one response (or two pipelined ones).
fn read_all(stream: &mut TcpStream) -> String {
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                break;
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

#[test]
fn test_get_static_file() {
    let root = "./tmp_it_static";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(root).unwrap();
    fs::write(format!("{}/index.html", root), "hello").unwrap();

    let mut server = make_server(root, 8181);
    let mut location = make_location(&server, "/");
    location.base.index_files = vec!["index.html".to_string()];
    server.add_location(location).unwrap();
    start_server(server);

    let mut stream = TcpStream::connect("127.0.0.1:8181").unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let response = read_all(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains("Content-Type: text/html\r\n"));
    assert!(response.contains("Content-Length: 5\r\n"));
    assert!(response.contains("Server: johnx/1.0.0\r\n"));
    assert!(response.ends_with("\r\n\r\nhello"));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_autoindex_listing() {
    let root = "./tmp_it_autoindex";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(format!("{}/d", root)).unwrap();
    fs::write(format!("{}/d/a.txt", root), "x").unwrap();

    let mut server = make_server(root, 8182);
    let mut location = make_location(&server, "/");
    location.base.autoindex = true;
    server.add_location(location).unwrap();
    start_server(server);

    let mut stream = TcpStream::connect("127.0.0.1:8182").unwrap();
    stream
        .write_all(b"GET /d/ HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let response = read_all(&mut stream);
    assert!(response.contains("200 OK"), "{}", response);
    assert!(response.contains("<a href=\"a.txt\">a.txt</a>"));
    assert!(response.contains("<a href=\"../\">../</a>"));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_pipelined_requests() {
    let root = "./tmp_it_pipeline";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(root).unwrap();
    fs::write(format!("{}/index.html", root), "Hi").unwrap();

    let mut server = make_server(root, 8183);
    let mut location = make_location(&server, "/");
    location.base.index_files = vec!["index.html".to_string()];
    server.add_location(location).unwrap();
    start_server(server);

    let mut stream = TcpStream::connect("127.0.0.1:8183").unwrap();
    stream
        .write_all(
            b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n\
              GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .unwrap();

    let response = read_all(&mut stream);
    assert_eq!(
        response.matches("HTTP/1.1 200 OK").count(),
        2,
        "{}",
        response
    );

    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_chunked_post_echoes_framing() {
    let root = "./tmp_it_chunked";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(root).unwrap();

    let mut server = make_server(root, 8184);
    let location = make_location(&server, "/echo");
    server.add_location(location).unwrap();
    start_server(server);

    let mut stream = TcpStream::connect("127.0.0.1:8184").unwrap();
    stream
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n0\r\n\r\n",
        )
        .unwrap();

    let response = read_all(&mut stream);
    assert!(response.contains("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.contains("Transfer-Encoding: chunked"));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_multipart_upload() {
    let root = "./tmp_it_upload";
    let uploads = "./tmp_it_upload/uploads";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(uploads).unwrap();

    let mut server = make_server(root, 8185);
    let mut location = make_location(&server, "/up");
    location.accepted_methods = vec![Method::Post];
    location.upload_path = uploads.to_string();
    server.add_location(location).unwrap();
    start_server(server);

    let body = b"--X\r\nContent-Disposition: form-data; name=\"f\"; filename=\"t.txt\"\r\n\r\nabc\r\n--X--\r\n";
    let head = format!(
        "POST /up HTTP/1.1\r\nHost: localhost\r\n\
         Content-Type: multipart/form-data; boundary=X\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    );

    let mut stream = TcpStream::connect("127.0.0.1:8185").unwrap();
    stream.write_all(head.as_bytes()).unwrap();
    stream.write_all(body).unwrap();

    let response = read_all(&mut stream);
    assert!(response.contains("HTTP/1.1 201 Created"), "{}", response);
    assert!(response.contains("Location: ./tmp_it_upload/uploads"));
    assert!(response.contains("1 file(s)"));

    let saved = fs::read_to_string(format!("{}/t.txt", uploads)).unwrap();
    assert_eq!(saved, "abc");

    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_body_too_large_closes_connection() {
    let root = "./tmp_it_toolarge";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(root).unwrap();

    let mut server = make_server(root, 8186);
    let mut location = make_location(&server, "/");
    location.base.client_max_body_size = 10;
    server.add_location(location).unwrap();
    start_server(server);

    let mut stream = TcpStream::connect("127.0.0.1:8186").unwrap();
    stream
        .write_all(
            b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 11\r\n\r\nAAAAAAAAAAA",
        )
        .unwrap();

    let response = read_all(&mut stream);
    assert!(response.contains("413"), "{}", response);
    assert!(response.contains("Connection: close"));

    // The server closes after flushing; a follow-up read sees EOF.
    let mut buf = [0u8; 16];
    let eof = matches!(stream.read(&mut buf), Ok(0));
    assert!(eof, "connection should be closed after a 413");

    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_cgi_response() {
    let root = "./tmp_it_cgi";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(root).unwrap();
    fs::write(
        format!("{}/hello.sh", root),
        "printf 'Content-Type: text/plain\\r\\n\\r\\nok'\n",
    )
    .unwrap();

    let mut server = make_server(root, 8187);
    let mut location = make_location(&server, "/cgi");
    location
        .cgi_executors
        .insert(".sh".to_string(), "/bin/sh".to_string());
    server.add_location(location).unwrap();
    start_server(server);

    let mut stream = TcpStream::connect("127.0.0.1:8187").unwrap();
    stream
        .write_all(b"GET /cgi/hello.sh?n=3 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let response = read_all(&mut stream);
    assert!(response.contains("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.contains("Content-Type: text/plain"));
    assert!(response.ends_with("ok"), "{}", response);

    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_cgi_timeout_returns_504() {
    let root = "./tmp_it_cgi_timeout";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(root).unwrap();
    fs::write(
        format!("{}/slow.sh", root),
        "/bin/sleep 2 2>/dev/null || /usr/bin/sleep 2\n",
    )
    .unwrap();

    let mut server = make_server(root, 8188);
    let mut location = make_location(&server, "/cgi");
    location
        .cgi_executors
        .insert(".sh".to_string(), "/bin/sh".to_string());
    location.cgi_read_timeout_ms = 150;
    server.add_location(location).unwrap();
    start_server(server);

    let mut stream = TcpStream::connect("127.0.0.1:8188").unwrap();
    stream
        .write_all(b"GET /cgi/slow.sh HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let response = read_all(&mut stream);
    assert!(response.contains("504"), "{}", response);
    assert!(response.contains("Connection: close"));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_delete_removes_file() {
    let root = "./tmp_it_delete";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(root).unwrap();
    fs::write(format!("{}/victim.txt", root), "bye").unwrap();

    let mut server = make_server(root, 8189);
    let location = make_location(&server, "/");
    server.add_location(location).unwrap();
    start_server(server);

    let mut stream = TcpStream::connect("127.0.0.1:8189").unwrap();
    stream
        .write_all(b"DELETE /victim.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let response = read_all(&mut stream);
    assert!(response.contains("HTTP/1.1 200 OK"), "{}", response);
    assert!(fs::metadata(format!("{}/victim.txt", root)).is_err());

    let _ = fs::remove_dir_all(root);
}
