use std::os::fd::{FromRawFd, IntoRawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;

use crate::handlers::{CgiRequest, construct_error_response};
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiState {
    Idle,
    Executing,
    Reading,
    Completed,
    Timeout,
    Error,
}

/// Coordinates one CGI child process: pipe plumbing, the request body
/// hand-off, non-blocking output capture, the read timeout, and the final
/// translation of the captured output into the client response.
#[derive(Debug)]
pub struct CgiRunner {
    pub token: Token,
    pub state: CgiState,
    child: Child,
    stdout_pipe: mio::net::UnixStream,
    stderr_pipe: StdUnixStream,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    started: Instant,
    timeout: Duration,
    exit_code: Option<i32>,
    stdout_done: bool,
}

impl CgiRunner {
    /// Wires three socketpairs onto a child's stdio, execs the configured
    /// executor with the script as its only argument, pushes the request
    /// body into stdin (capped at `CGI_STDIN_CAP` bytes, the rest is
    /// discarded) and closes it, then hands back a runner in `Reading`.
    pub fn spawn(
        cgi: &CgiRequest,
        server: &ServerConfig,
        request: &HttpRequest,
        timeout: Duration,
        token: Token,
    ) -> io::Result<CgiRunner> {
        let (stdin_parent, stdin_child) = StdUnixStream::pair()?;
        let (stdout_parent, stdout_child) = StdUnixStream::pair()?;
        let (stderr_parent, stderr_child) = StdUnixStream::pair()?;

        stdin_parent.set_nonblocking(true)?;
        stdout_parent.set_nonblocking(true)?;
        stderr_parent.set_nonblocking(true)?;

        let stdin_file = unsafe { File::from_raw_fd(stdin_child.into_raw_fd()) };
        let stdout_file = unsafe { File::from_raw_fd(stdout_child.into_raw_fd()) };
        let stderr_file = unsafe { File::from_raw_fd(stderr_child.into_raw_fd()) };

        let mut command = Command::new(&cgi.executor);
        command
            .arg(&cgi.script_path)
            .env_clear()
            .envs(build_cgi_env(server, request, &cgi.script_path))
            .stdin(Stdio::from(stdin_file))
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file));

        let child = command.spawn()?;

        let mut runner = CgiRunner {
            token,
            state: CgiState::Executing,
            child,
            stdout_pipe: mio::net::UnixStream::from_std(stdout_parent),
            stderr_pipe: stderr_parent,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            started: Instant::now(),
            timeout,
            exit_code: None,
            stdout_done: false,
        };

        runner.write_request_body(stdin_parent, &request.body);
        runner.state = CgiState::Reading;
        Ok(runner)
    }

    fn write_request_body(&mut self, mut stdin: StdUnixStream, body: &[u8]) {
        let mut total = 0usize;
        while total < body.len() {
            match stdin.write(&body[total..]) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if total > CGI_STDIN_CAP {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        // Dropping the stream closes the script's stdin.
    }

    pub fn stdout_mut(&mut self) -> &mut mio::net::UnixStream {
        &mut self.stdout_pipe
    }

    /// Readable event on the stdout pipe: drain both output pipes, reap a
    /// finished child, and settle into a terminal state when output ended
    /// or the timeout elapsed.
    pub fn on_event(&mut self) {
        if self.state != CgiState::Reading {
            return;
        }

        self.drain_output_pipes();
        self.check_child_status();

        if self.timed_out() {
            self.state = CgiState::Timeout;
        } else if self.stdout_done {
            self.state = CgiState::Completed;
        }
    }

    fn drain_output_pipes(&mut self) {
        let mut buf = [0u8; READ_BUF_SIZE];

        loop {
            match self.stdout_pipe.read(&mut buf) {
                Ok(0) => {
                    self.stdout_done = true;
                    break;
                }
                Ok(n) => self.stdout_buf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.stdout_done = true;
                    break;
                }
            }
        }

        loop {
            match self.stderr_pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.stderr_buf.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
    }

    fn check_child_status(&mut self) {
        let Ok(Some(status)) = self.child.try_wait() else {
            return;
        };

        if let Some(code) = status.code() {
            self.exit_code = Some(code);
            if code != 0 && self.stderr_buf.is_empty() {
                self.stderr_buf =
                    format!("CGI process exited with non-zero status: {}", code).into_bytes();
            }
        } else if let Some(signal) = status.signal() {
            self.stderr_buf =
                format!("CGI process terminated by signal: {}", signal).into_bytes();
        }
    }

    pub fn timed_out(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            CgiState::Completed | CgiState::Timeout | CgiState::Error
        )
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Completion routine, runs at most once per response. Decides between
    /// 504 (timeout), 500 (stderr output, runner error, empty stdout) and a
    /// parsed CGI payload.
    pub fn finish(&mut self, response: &mut HttpResponse, server: &ServerConfig) {
        if response.is_cgi_processed {
            return;
        }
        response.is_cgi_processed = true;

        if self.state == CgiState::Timeout {
            construct_error_response(504, "Gateway Timeout", server, response);
            response.set_header("connection", "close");
            return;
        }

        if !self.stderr_buf.is_empty() || self.state == CgiState::Error {
            self.state = CgiState::Error;
            construct_error_response(500, "Internal Server Error", server, response);
            response.set_header("connection", "close");
            return;
        }

        if self.stdout_buf.is_empty() {
            self.state = CgiState::Error;
            construct_error_response(500, "Internal Server Error", server, response);
            response.set_header("connection", "close");
            return;
        }

        self.state = CgiState::Completed;
        apply_cgi_output(&self.stdout_buf, response, server);
    }

    /// SIGKILL the child if it is still running; reaping happens on the
    /// reactor's deferred-destruction path.
    pub fn kill_child(&mut self) {
        if self.child.try_wait().map(|s| s.is_none()).unwrap_or(false) {
            let _ = self.child.kill();
        }
    }

    /// Tears the runner apart for deferred destruction: the registered
    /// stdout pipe (to keep its fd alive until the tick ends) and the child
    /// for zombie reaping.
    pub fn into_remains(self) -> (mio::net::UnixStream, Child) {
        (self.stdout_pipe, self.child)
    }
}

/// Applies a complete CGI stdout capture to the response: header block
/// before the first blank line (a `Status:` line overrides the code, every
/// other header is copied), body after it. Without a blank separator,
/// recognisable error markers synthesise the matching status and anything
/// else is delivered verbatim as 200 text/html.
pub fn apply_cgi_output(output: &[u8], response: &mut HttpResponse, server: &ServerConfig) {
    if let Some(header_end) = find_subsequence(output, b"\r\n\r\n", 0) {
        let header_part = String::from_utf8_lossy(&output[..header_end]).into_owned();
        let body = output[header_end + 4..].to_vec();

        parse_cgi_headers(&header_part, response);
        response.body = body;
        return;
    }

    let text = String::from_utf8_lossy(output);
    if text.contains("<h1>500 Internal Server Error</h1>") {
        construct_error_response(500, "Internal Server Error", server, response);
    } else if text.contains("<h1>504 Gateway Timeout</h1>") {
        construct_error_response(504, "Gateway Timeout", server, response);
    } else {
        response.set_status(200, "OK");
        response.set_header("content-type", "text/html");
        response.body = output.to_vec();
    }
}

fn parse_cgi_headers(header_part: &str, response: &mut HttpResponse) {
    let mut status_set = false;

    for line in header_part.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        if let Some(status_value) = line.strip_prefix("Status:") {
            status_set = parse_status_header(status_value.trim_start(), response);
        } else if let Some((key, value)) = line.split_once(':') {
            response.set_header(key, value.trim_start());
        }
    }

    if !status_set {
        response.set_status(200, "OK");
    }
}

fn parse_status_header(value: &str, response: &mut HttpResponse) -> bool {
    let (code_str, message) = match value.split_once(' ') {
        Some((code, message)) => (code, message.to_string()),
        None => (value, "OK".to_string()),
    };

    let code: i32 = code_str.parse().unwrap_or(0);
    if code <= 0 || code >= 600 {
        response.set_status(500, "Internal Server Error");
    } else {
        response.set_status(code as u16, &message);
    }
    true
}

/// RFC 3875 meta-variable subset handed to the child.
pub fn build_cgi_env(
    server: &ServerConfig,
    request: &HttpRequest,
    script_path: &Path,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    let mut push = |key: &str, value: String| env.push((key.to_string(), value));

    push("GATEWAY_INTERFACE", "CGI/1.1".to_string());
    push(
        "SERVER_PROTOCOL",
        if request.version.is_empty() {
            "HTTP/1.1".to_string()
        } else {
            request.version.clone()
        },
    );
    push("REQUEST_METHOD", request.method.to_string());
    push("SCRIPT_FILENAME", script_path.to_string_lossy().into_owned());
    push("REDIRECT_STATUS", "200".to_string());
    push("SERVER_SOFTWARE", SERVER_SOFTWARE.to_string());
    push(
        "SERVER_NAME",
        request
            .header("host")
            .unwrap_or("localhost")
            .to_string(),
    );

    if let Some(listen) = server.listen.first() {
        push("SERVER_PORT", listen.port.to_string());
        push("REMOTE_ADDR", listen.host.clone());
    }

    push("SCRIPT_NAME", request.path.clone());
    push("QUERY_STRING", request.query_string.clone());
    push("REQUEST_URI", request.path.clone());

    if let Some(content_type) = request.header("content-type") {
        push("CONTENT_TYPE", content_type.to_string());
    }
    if let Some(content_length) = request.header("content-length") {
        push("CONTENT_LENGTH", content_length.to_string());
    } else if request.method == Method::Post {
        push("CONTENT_LENGTH", request.body.len().to_string());
    }

    env
}
