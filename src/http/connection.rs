use crate::cgi::CgiRunner;
use crate::handlers::{self, DispatchOutcome};
use crate::prelude::*;
use crate::router;

/// What the reactor must do with the connection after a writable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    KeepOpen,
    Close,
    /// A CGI child is attached, produced nothing yet, and its read timeout
    /// elapsed; the reactor synthesises the 504.
    CgiTimedOut,
}

/// Per-client state: socket, parser, buffers, the response being built and
/// an optional attached CGI runner. Lifetime matches the socket's; the
/// reactor owns the map entry and drives `handle_read`/`handle_write`.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    /// Port of the listener that accepted this client.
    pub port: u16,
    pub parser: RequestParser,
    pub write_buffer: Vec<u8>,
    pub response: HttpResponse,
    pub cgi: Option<CgiRunner>,
    pub config: Arc<HttpConfig>,
    pub server_cfg: Arc<ServerConfig>,
    pub last_activity: Instant,
    pub keepalive_timeout: Duration,
    pub cgi_read_timeout: Duration,
    pub should_close: bool,
    pub closed: bool,
    pub marked_for_deletion: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, port: u16, config: Arc<HttpConfig>) -> Self {
        let server_cfg = router::default_server_for_port(&config, port);
        let keepalive_timeout = Duration::from_millis(server_cfg.keepalive_timeout_ms);

        Connection {
            stream,
            port,
            parser: RequestParser::with_config(Arc::clone(&server_cfg)),
            write_buffer: Vec::new(),
            response: HttpResponse::default(),
            cgi: None,
            config,
            server_cfg,
            last_activity: Instant::now(),
            keepalive_timeout,
            cgi_read_timeout: Duration::from_millis(
                crate::config::types::DEFAULT_CGI_READ_TIMEOUT_MS,
            ),
            should_close: false,
            closed: false,
            marked_for_deletion: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) > self.keepalive_timeout
    }

    pub fn has_pending_cgi(&self) -> bool {
        self.cgi.is_some() && !self.response.is_cgi_processed
    }

    /// Readable event. Returns true when the reactor must close the
    /// connection immediately.
    pub fn handle_read(
        conn: &mut Connection,
        poll: &Poll,
        token: Token,
        next_token: &mut usize,
        cgi_to_client: &mut HashMap<Token, Token>,
    ) -> bool {
        if conn.closed {
            return false;
        }
        conn.touch();

        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut total_read = 0usize;

        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    // EOF while a CGI response is still being produced:
                    // pause reading, the response is delivered later.
                    if conn.has_pending_cgi() {
                        break;
                    }
                    return true;
                }
                Ok(n) => {
                    total_read += n;
                    if is_control_sequence(&buf[..n]) {
                        return true;
                    }
                    if is_invalid_burst(&buf[..n], total_read) {
                        Connection::send_bad_request(conn, poll, token);
                        return false;
                    }
                    pending.extend_from_slice(&buf[..n]);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => return true,
            }
        }

        if pending.is_empty() {
            return false;
        }

        match conn.parser.consume(&pending) {
            Ok(ParsingStatus::Complete) => {
                Connection::process_complete_request(conn, poll, token, next_token, cgi_to_client)
            }
            Ok(ParsingStatus::Incomplete) => false,
            Err(e) => {
                Connection::handle_parsing_error(conn, poll, token, &e);
                false
            }
        }
    }

    fn send_bad_request(conn: &mut Connection, poll: &Poll, token: Token) {
        let err = HttpError::BadRequest;
        Connection::handle_parsing_error(conn, poll, token, &err);
        conn.parser.reset();
    }

    fn handle_parsing_error(conn: &mut Connection, poll: &Poll, token: Token, err: &HttpError) {
        handlers::construct_error_response(
            err.status(),
            &err.reason(),
            &conn.server_cfg,
            &mut conn.response,
        );
        conn.response.set_header("connection", "close");
        conn.should_close = true;
        conn.write_buffer.extend_from_slice(&conn.response.to_bytes());
        conn.response.clear();
        let _ = poll
            .registry()
            .reregister(&mut conn.stream, token, Interest::WRITABLE);
    }

    fn process_complete_request(
        conn: &mut Connection,
        poll: &Poll,
        token: Token,
        next_token: &mut usize,
        cgi_to_client: &mut HashMap<Token, Token>,
    ) -> bool {
        // A CGI response is still in flight; leave the new request parked.
        if conn.has_pending_cgi() {
            return false;
        }

        let mut request = conn.parser.take_request();
        conn.parser.reset();
        request.port = conn.port;

        // The Host header may select a different virtual server than the
        // one the listener guessed.
        let server = router::find_server(&conn.config, &request);
        conn.server_cfg = Arc::clone(&server);
        conn.parser.set_config(Arc::clone(&server));
        Connection::update_timeouts(conn, &request);

        if request.wants_close() || conn.response.header("connection") == Some("close") {
            conn.should_close = true;
        }

        match handlers::construct_response(&request, &server, &mut conn.response) {
            DispatchOutcome::Done => {
                if conn.should_close {
                    conn.response.set_header("connection", "close");
                }
                conn.write_buffer.extend_from_slice(&conn.response.to_bytes());
                let _ = poll
                    .registry()
                    .reregister(&mut conn.stream, token, Interest::WRITABLE);
                false
            }
            DispatchOutcome::Cgi(cgi_request) => {
                Connection::launch_cgi(conn, poll, token, next_token, cgi_to_client, &request, cgi_request);
                false
            }
        }
    }

    fn launch_cgi(
        conn: &mut Connection,
        poll: &Poll,
        token: Token,
        next_token: &mut usize,
        cgi_to_client: &mut HashMap<Token, Token>,
        request: &HttpRequest,
        cgi_request: handlers::CgiRequest,
    ) {
        conn.response.build_headers(HTTP_OK);
        conn.response.is_cgi_response = true;
        conn.response.is_cgi_processed = false;

        let cgi_token = Token(*next_token);
        *next_token += 1;

        let spawned = CgiRunner::spawn(
            &cgi_request,
            &conn.server_cfg,
            request,
            conn.cgi_read_timeout,
            cgi_token,
        );

        let mut runner = match spawned {
            Ok(runner) => runner,
            Err(e) => {
                warn!("CGI spawn failed for {:?}: {}", cgi_request.script_path, e);
                Connection::fail_cgi_startup(conn, poll, token);
                return;
            }
        };

        if poll
            .registry()
            .register(runner.stdout_mut(), cgi_token, Interest::READABLE)
            .is_err()
        {
            runner.kill_child();
            Connection::fail_cgi_startup(conn, poll, token);
            return;
        }

        cgi_to_client.insert(cgi_token, token);
        conn.cgi = Some(runner);
        trace!("CGI child attached (token {:?})", cgi_token);

        // The writable side keeps the timeout observable while the child
        // produces no output.
        let _ = poll.registry().reregister(
            &mut conn.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        );
    }

    /// Pipe creation, fork or registration failures surface as a 500 and
    /// close the connection.
    fn fail_cgi_startup(conn: &mut Connection, poll: &Poll, token: Token) {
        conn.response.is_cgi_response = false;
        handlers::construct_error_response(
            500,
            "Internal Server Error",
            &conn.server_cfg,
            &mut conn.response,
        );
        conn.response.set_header("connection", "close");
        conn.should_close = true;
        conn.write_buffer.extend_from_slice(&conn.response.to_bytes());
        conn.response.clear();
        let _ = poll
            .registry()
            .reregister(&mut conn.stream, token, Interest::WRITABLE);
    }

    fn update_timeouts(conn: &mut Connection, request: &HttpRequest) {
        if let Some(location) = router::find_location(&conn.server_cfg, &request.path) {
            conn.keepalive_timeout = Duration::from_millis(location.keepalive_timeout_ms);
            conn.cgi_read_timeout = Duration::from_millis(location.cgi_read_timeout_ms);
        }
    }

    /// Writable event: drain the write buffer, then either close or flip
    /// back to readable and pick up a pipelined request.
    pub fn handle_write(
        conn: &mut Connection,
        poll: &Poll,
        token: Token,
        next_token: &mut usize,
        cgi_to_client: &mut HashMap<Token, Token>,
    ) -> WriteOutcome {
        if conn.closed {
            return WriteOutcome::KeepOpen;
        }

        if conn.has_pending_cgi() {
            if conn
                .cgi
                .as_ref()
                .map(|runner| runner.timed_out())
                .unwrap_or(false)
            {
                return WriteOutcome::CgiTimedOut;
            }
            return WriteOutcome::KeepOpen;
        }

        conn.touch();

        while !conn.write_buffer.is_empty() {
            match conn.stream.write(&conn.write_buffer) {
                Ok(0) => return WriteOutcome::Close,
                Ok(n) => {
                    conn.write_buffer.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => return WriteOutcome::Close,
            }
        }

        if !conn.write_buffer.is_empty() {
            return WriteOutcome::KeepOpen;
        }

        if conn.should_close {
            return WriteOutcome::Close;
        }

        conn.response.clear();
        let _ = poll
            .registry()
            .reregister(&mut conn.stream, token, Interest::READABLE);

        // A pipelined request sitting in the parser buffer, or one that
        // completed while a CGI response was still in flight.
        if conn.parser.has_buffered_data() || conn.parser.is_complete() {
            match conn.parser.consume(&[]) {
                Ok(ParsingStatus::Complete) => {
                    Connection::process_complete_request(conn, poll, token, next_token, cgi_to_client);
                }
                Ok(ParsingStatus::Incomplete) => {}
                Err(e) => Connection::handle_parsing_error(conn, poll, token, &e),
            }
        }

        WriteOutcome::KeepOpen
    }
}

fn is_control_sequence(chunk: &[u8]) -> bool {
    chunk.len() >= SEQUENCE_LEN
        && (&chunk[..SEQUENCE_LEN] == CTRL_C_SEQUENCE
            || &chunk[..SEQUENCE_LEN] == CTRL_Z_SEQUENCE
            || &chunk[..SEQUENCE_LEN] == CTRL_BACKSLASH_SEQUENCE)
}

/// A lone EOT byte, or a short burst with no CRLF at all, is junk input.
fn is_invalid_burst(chunk: &[u8], total_read: usize) -> bool {
    if chunk.len() == 1 && chunk[0] == 0x04 {
        return true;
    }
    total_read < READ_BUF_SIZE && find_subsequence(chunk, b"\r\n", 0).is_none()
}
