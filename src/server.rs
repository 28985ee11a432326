use crate::cgi::CgiState;
use crate::http::connection::WriteOutcome;
use crate::prelude::*;

/// One accepting socket per unique host:port listen endpoint.
#[derive(Debug)]
pub struct Listener {
    pub socket: TcpListener,
    pub port: u16,
}

/// Handlers scheduled for destruction at the end of the current tick. The
/// fds stay open (and deregistered) until the batch finishes so stale
/// ready events cannot observe a recycled descriptor.
enum DeadHandler {
    Client(TcpStream),
    Cgi(mio::net::UnixStream, Option<Child>),
}

/// The reactor: owns the poll instance and every registered handler,
/// keyed by token. Dispatch goes through the token maps with a validity
/// check, destruction is deferred to the end of the tick.
pub struct Server {
    config: Arc<HttpConfig>,
    poll: Poll,
    listeners: HashMap<Token, Listener>,
    connections: HashMap<Token, Connection>,
    cgi_to_client: HashMap<Token, Token>,
    invalid: HashSet<Token>,
    deferred: Vec<DeadHandler>,
    zombie_purgatory: Vec<Child>,
    next_token: usize,
}

impl Server {
    pub fn new(config: HttpConfig) -> Result<Server> {
        let poll = Poll::new()?;
        let config = Arc::new(config);

        let mut server = Server {
            config: Arc::clone(&config),
            poll,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            cgi_to_client: HashMap::new(),
            invalid: HashSet::new(),
            deferred: Vec::new(),
            zombie_purgatory: Vec::new(),
            next_token: 0,
        };

        for endpoint in config.listen_endpoints() {
            let addr: SocketAddr = format!("{}:{}", endpoint.host, endpoint.port).parse()?;
            let mut socket = TcpListener::bind(addr)?;

            let token = Token(server.next_token);
            server.next_token += 1;
            server
                .poll
                .registry()
                .register(&mut socket, token, Interest::READABLE)?;

            info!("listening on {}:{}", endpoint.host, endpoint.port);
            server.listeners.insert(
                token,
                Listener {
                    socket,
                    port: endpoint.port,
                },
            );
        }

        Ok(server)
    }

    /// Blocks forever driving the loop: wait up to 100 ms, dispatch ready
    /// events through the validity filter, sweep timeouts and marked
    /// connections, then destroy dead handlers and reap children.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);

        loop {
            match self
                .poll
                .poll(&mut events, Some(Duration::from_millis(POLL_TIMEOUT_MS)))
            {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                let token = event.token();
                if self.invalid.contains(&token) {
                    continue;
                }

                if self.listeners.contains_key(&token) {
                    self.accept_clients(token);
                } else if let Some(&client_token) = self.cgi_to_client.get(&token) {
                    self.handle_cgi_event(token, client_token);
                } else if self.connections.contains_key(&token) {
                    self.handle_connection_event(token, event);
                }
            }

            self.sweep_connections();
            self.perform_delayed_deletion();
        }
    }

    /// Live-connection lookup used by dispatch; dead or doomed entries are
    /// treated as absent.
    pub fn find_client(&self, token: Token) -> Option<&Connection> {
        self.connections
            .get(&token)
            .filter(|conn| !conn.closed && !conn.marked_for_deletion)
    }

    fn accept_clients(&mut self, token: Token) {
        loop {
            let Some(listener) = self.listeners.get_mut(&token) else {
                return;
            };
            let port = listener.port;

            match listener.socket.accept() {
                Ok((stream, _addr)) => {
                    let client_token = Token(self.next_token);
                    self.next_token += 1;

                    let mut conn = Connection::new(stream, port, Arc::clone(&self.config));
                    if self
                        .poll
                        .registry()
                        .register(&mut conn.stream, client_token, Interest::READABLE)
                        .is_ok()
                    {
                        self.connections.insert(client_token, conn);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(_) => return,
            }
        }
    }

    fn handle_connection_event(&mut self, token: Token, event: &Event) {
        if self.find_client(token).is_none() {
            return;
        }

        if event.is_readable() {
            let close = {
                let Some(conn) = self.connections.get_mut(&token) else {
                    return;
                };
                Connection::handle_read(
                    conn,
                    &self.poll,
                    token,
                    &mut self.next_token,
                    &mut self.cgi_to_client,
                )
            };
            if close {
                self.close_connection(token);
                return;
            }
        }

        if event.is_writable() {
            let outcome = {
                let Some(conn) = self.connections.get_mut(&token) else {
                    return;
                };
                Connection::handle_write(
                    conn,
                    &self.poll,
                    token,
                    &mut self.next_token,
                    &mut self.cgi_to_client,
                )
            };
            match outcome {
                WriteOutcome::Close => {
                    self.close_connection(token);
                    return;
                }
                WriteOutcome::CgiTimedOut => self.expire_cgi(token),
                WriteOutcome::KeepOpen => {}
            }
        }

        if event.is_read_closed() || event.is_error() {
            self.close_connection(token);
        }
    }

    fn handle_cgi_event(&mut self, cgi_token: Token, client_token: Token) {
        let mut terminal = false;

        match self.connections.get_mut(&client_token) {
            Some(conn) => match conn.cgi.as_mut() {
                Some(runner) => {
                    runner.on_event();
                    terminal = runner.is_terminal();
                }
                None => {
                    self.cgi_to_client.remove(&cgi_token);
                }
            },
            None => {
                self.cgi_to_client.remove(&cgi_token);
            }
        }

        if terminal {
            self.finalize_cgi(client_token);
        }
    }

    /// Runs the completion routine of a terminal CGI runner: unregister the
    /// stdout pipe, translate the capture into the client response, queue
    /// the serialized bytes, flip the client to writable, and schedule the
    /// runner's remains for end-of-tick destruction.
    fn finalize_cgi(&mut self, client_token: Token) {
        let Some(conn) = self.connections.get_mut(&client_token) else {
            return;
        };
        let Some(mut runner) = conn.cgi.take() else {
            return;
        };

        let cgi_token = runner.token;
        self.cgi_to_client.remove(&cgi_token);
        self.invalid.insert(cgi_token);
        let _ = self.poll.registry().deregister(runner.stdout_mut());

        runner.finish(&mut conn.response, &conn.server_cfg);
        if conn.response.header("connection") == Some("close") {
            conn.should_close = true;
        }

        conn.write_buffer.extend_from_slice(&conn.response.to_bytes());
        conn.response.clear();
        conn.touch();
        let _ = self
            .poll
            .registry()
            .reregister(&mut conn.stream, client_token, Interest::WRITABLE);

        runner.kill_child();
        let (stream, mut child) = runner.into_remains();
        let leftover = match child.try_wait() {
            Ok(Some(_)) => None,
            _ => Some(child),
        };
        self.deferred.push(DeadHandler::Cgi(stream, leftover));
    }

    /// Read-timeout expiry for an attached CGI child.
    fn expire_cgi(&mut self, client_token: Token) {
        if let Some(conn) = self.connections.get_mut(&client_token) {
            if let Some(runner) = conn.cgi.as_mut() {
                runner.state = CgiState::Timeout;
            }
        }
        self.finalize_cgi(client_token);
    }

    fn sweep_connections(&mut self) {
        let now = Instant::now();

        let expired_cgi: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| {
                !conn.closed
                    && conn
                        .cgi
                        .as_ref()
                        .map(|runner| !runner.is_terminal() && runner.timed_out())
                        .unwrap_or(false)
            })
            .map(|(token, _)| *token)
            .collect();
        for token in expired_cgi {
            self.expire_cgi(token);
        }

        let timed_out: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| !conn.closed && conn.is_timed_out(now))
            .map(|(token, _)| *token)
            .collect();
        for token in timed_out {
            trace!("closing idle connection {:?}", token);
            self.close_connection(token);
        }

        let dead: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.marked_for_deletion)
            .map(|(token, _)| *token)
            .collect();
        for token in dead {
            if let Some(conn) = self.connections.remove(&token) {
                self.deferred.push(DeadHandler::Client(conn.stream));
            }
        }
    }

    /// Idempotent teardown: detach and kill the CGI child, deregister the
    /// socket, clear buffers, and mark the entry for removal in the sweep.
    fn close_connection(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if conn.closed {
            return;
        }
        conn.closed = true;

        if let Some(mut runner) = conn.cgi.take() {
            let cgi_token = runner.token;
            self.cgi_to_client.remove(&cgi_token);
            self.invalid.insert(cgi_token);
            let _ = self.poll.registry().deregister(runner.stdout_mut());
            runner.kill_child();
            let (stream, mut child) = runner.into_remains();
            let leftover = match child.try_wait() {
                Ok(Some(_)) => None,
                _ => Some(child),
            };
            self.deferred.push(DeadHandler::Cgi(stream, leftover));
        }

        let _ = self.poll.registry().deregister(&mut conn.stream);
        conn.write_buffer.clear();
        conn.response.clear();
        conn.should_close = false;
        conn.marked_for_deletion = true;
        self.invalid.insert(token);
    }

    /// End-of-tick cleanup: drop dead handlers, reap zombie children, and
    /// reset the validity filter for the next batch.
    fn perform_delayed_deletion(&mut self) {
        for handler in std::mem::take(&mut self.deferred) {
            match handler {
                DeadHandler::Client(mut stream) => {
                    let _ = self.poll.registry().deregister(&mut stream);
                }
                DeadHandler::Cgi(mut stream, leftover) => {
                    let _ = self.poll.registry().deregister(&mut stream);
                    if let Some(child) = leftover {
                        self.zombie_purgatory.push(child);
                    }
                }
            }
        }

        self.zombie_purgatory
            .retain_mut(|child| matches!(child.try_wait(), Ok(None)));

        self.invalid.clear();
    }
}
