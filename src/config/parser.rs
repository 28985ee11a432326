use std::net::ToSocketAddrs;
use std::str::FromStr;

use crate::config::types::*;
use crate::config::validate;
use crate::error::{Result, ServerError};
use crate::http::Method;

// --- Lexer ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokKind {
    Word(String),
    OpenBrace,
    CloseBrace,
    Semicolon,
}

#[derive(Debug, Clone)]
pub struct Tok {
    pub kind: TokKind,
    pub line: usize,
}

fn lex(input: &str) -> Result<Vec<Tok>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut line = 1usize;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '{' => {
                chars.next();
                tokens.push(Tok { kind: TokKind::OpenBrace, line });
            }
            '}' => {
                chars.next();
                tokens.push(Tok { kind: TokKind::CloseBrace, line });
            }
            ';' => {
                chars.next();
                tokens.push(Tok { kind: TokKind::Semicolon, line });
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut word = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    if c == '\n' {
                        line += 1;
                    }
                    word.push(c);
                }
                if !closed {
                    return Err(err_at(line, "unclosed quote"));
                }
                tokens.push(Tok { kind: TokKind::Word(word), line });
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | ';' | '#') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Tok { kind: TokKind::Word(word), line });
            }
        }
    }

    Ok(tokens)
}

fn err_at(line: usize, message: &str) -> ServerError {
    ServerError::Config(format!("{} (line {})", message, line))
}

// --- Parser ---

pub struct ConfigParser {
    tokens: Vec<Tok>,
    cursor: usize,
}

impl ConfigParser {
    pub fn parse_file(path: &str) -> Result<HttpConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("failed to open {}: {}", path, e)))?;
        Self::parse_str(&content)
    }

    pub fn parse_str(content: &str) -> Result<HttpConfig> {
        let mut parser = ConfigParser {
            tokens: lex(content)?,
            cursor: 0,
        };
        parser.parse_root()
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.cursor.min(self.tokens.len().saturating_sub(1)))
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn peek(&self) -> Option<&TokKind> {
        self.tokens.get(self.cursor).map(|t| &t.kind)
    }

    fn next(&mut self) -> Option<TokKind> {
        let tok = self.tokens.get(self.cursor).map(|t| t.kind.clone());
        if tok.is_some() {
            self.cursor += 1;
        }
        tok
    }

    fn expect_word(&mut self, expected: &str) -> Result<()> {
        match self.next() {
            Some(TokKind::Word(w)) if w == expected => Ok(()),
            _ => Err(err_at(self.line(), &format!("expected \"{}\"", expected))),
        }
    }

    fn expect_open_brace(&mut self, after: &str) -> Result<()> {
        match self.next() {
            Some(TokKind::OpenBrace) => Ok(()),
            _ => Err(err_at(self.line(), &format!("expected \"{{\" after \"{}\"", after))),
        }
    }

    /// Reads `name arg... ;` and returns (name, args).
    fn read_directive(&mut self) -> Result<(String, Vec<String>)> {
        let line = self.line();
        let name = match self.next() {
            Some(TokKind::Word(w)) => w,
            _ => return Err(err_at(line, "expected directive name")),
        };

        let mut args = Vec::new();
        loop {
            match self.next() {
                Some(TokKind::Word(w)) => args.push(w),
                Some(TokKind::Semicolon) => return Ok((name, args)),
                Some(TokKind::OpenBrace) | Some(TokKind::CloseBrace) | None => {
                    return Err(err_at(line, "directive is not terminated by \";\""));
                }
            }
        }
    }

    fn parse_root(&mut self) -> Result<HttpConfig> {
        self.expect_word("http")
            .map_err(|_| ServerError::Config("no http block in configuration".to_string()))?;
        self.expect_open_brace("http")?;

        let mut http = HttpConfig::new();
        let mut servers: Vec<ServerConfig> = Vec::new();

        loop {
            match self.peek() {
                Some(TokKind::CloseBrace) => {
                    self.next();
                    break;
                }
                Some(TokKind::Word(w)) if w == "server" => {
                    self.next();
                    self.expect_open_brace("server")?;
                    let server = self.parse_server_block(&http)?;
                    servers.push(server);
                }
                Some(_) => {
                    let line = self.line();
                    let (name, args) = self.read_directive()?;
                    self.apply_http_directive(&mut http, &name, &args, line)?;
                }
                None => {
                    return Err(ServerError::Config(
                        "unexpected end of file, expecting \"}\"".to_string(),
                    ));
                }
            }
        }

        if servers.is_empty() {
            servers.push(fallback_server(&http));
        }

        validate::finalize(http, servers)
    }

    fn parse_server_block(&mut self, http: &HttpConfig) -> Result<ServerConfig> {
        let mut server = ServerConfig::inherit(http);

        loop {
            match self.peek() {
                Some(TokKind::CloseBrace) => {
                    self.next();
                    break;
                }
                Some(TokKind::Word(w)) if w == "location" => {
                    self.next();
                    let location = self.parse_location_block(&server)?;
                    server.add_location(location).map_err(ServerError::Config)?;
                }
                Some(_) => {
                    let line = self.line();
                    let (name, args) = self.read_directive()?;
                    self.apply_server_directive(&mut server, &name, &args, line)?;
                }
                None => {
                    return Err(ServerError::Config(
                        "unexpected end of file, expecting \"}\"".to_string(),
                    ));
                }
            }
        }

        if server.listen.is_empty() {
            server
                .listen
                .push(ListenDirective::new(FALLBACK_LISTEN_HOST, FALLBACK_LISTEN_PORT));
        }

        Ok(server)
    }

    fn parse_location_block(&mut self, server: &ServerConfig) -> Result<LocationConfig> {
        let line = self.line();
        let path = match self.next() {
            Some(TokKind::Word(w)) => w,
            _ => return Err(err_at(line, "invalid location block format")),
        };
        self.expect_open_brace("location")?;

        let mut location = LocationConfig::inherit(server);
        location.path = path;

        loop {
            match self.peek() {
                Some(TokKind::CloseBrace) => {
                    self.next();
                    break;
                }
                Some(_) => {
                    let line = self.line();
                    let (name, args) = self.read_directive()?;
                    self.apply_location_directive(&mut location, &name, &args, line)?;
                }
                None => {
                    return Err(ServerError::Config(
                        "unexpected end of file in location block".to_string(),
                    ));
                }
            }
        }

        if location.base.index_files.is_empty() {
            location.base.index_files.push(DEFAULT_INDEX_FILE.to_string());
        }

        Ok(location)
    }

    fn apply_http_directive(
        &self,
        http: &mut HttpConfig,
        name: &str,
        args: &[String],
        line: usize,
    ) -> Result<()> {
        match name {
            "keepalive_timeout" => {
                if http.keepalive_timeout_set {
                    return Err(err_at(line, "\"keepalive_timeout\" directive is duplicate"));
                }
                http.keepalive_timeout_ms = parse_timeout(single_arg(name, args, line)?, line)?;
                http.keepalive_timeout_set = true;
                Ok(())
            }
            _ => apply_common_directive(&mut http.base, name, args, line),
        }
    }

    fn apply_server_directive(
        &self,
        server: &mut ServerConfig,
        name: &str,
        args: &[String],
        line: usize,
    ) -> Result<()> {
        match name {
            "listen" => parse_listen(server, args, line),
            "server_name" => {
                if args.is_empty() {
                    return Err(err_at(line, "invalid number of arguments in \"server_name\""));
                }
                for name in args {
                    if name.contains("..") {
                        return Err(err_at(
                            line,
                            &format!("invalid server name or wildcard \"{}\"", name),
                        ));
                    }
                    server.server_names.push(name.clone());
                }
                Ok(())
            }
            "return" => {
                // The first return wins, later ones are ignored.
                let redirect = parse_redirect(args, line)?;
                if server.redirect.is_none() {
                    server.redirect = Some(redirect);
                }
                Ok(())
            }
            "keepalive_timeout" => {
                if server.keepalive_timeout_set {
                    return Err(err_at(line, "\"keepalive_timeout\" directive is duplicate"));
                }
                server.keepalive_timeout_ms = parse_timeout(single_arg(name, args, line)?, line)?;
                server.keepalive_timeout_set = true;
                Ok(())
            }
            _ => apply_common_directive(&mut server.base, name, args, line),
        }
    }

    fn apply_location_directive(
        &self,
        location: &mut LocationConfig,
        name: &str,
        args: &[String],
        line: usize,
    ) -> Result<()> {
        match name {
            "accept_methods" => {
                location.accepted_methods.clear();
                if args.len() == 1 && args[0] == "ALL" {
                    location.accepted_methods = Method::all();
                    return Ok(());
                }
                if args.is_empty() {
                    return Err(err_at(line, "failed to parse accept_methods directive"));
                }
                for arg in args {
                    let method = Method::from_str(arg).map_err(|_| {
                        err_at(line, &format!("invalid method in accept_methods: {}", arg))
                    })?;
                    if !location.accepted_methods.contains(&method) {
                        location.accepted_methods.push(method);
                    }
                }
                Ok(())
            }
            "return" => {
                // An already-set redirect (first directive, or one cascaded
                // from the server block) wins over later ones.
                let redirect = parse_redirect(args, line)?;
                if location.redirect.is_none() {
                    location.redirect = Some(redirect);
                }
                Ok(())
            }
            "cgi_pass" => {
                if args.len() != 2 {
                    return Err(err_at(line, "invalid number of arguments in \"cgi_pass\" directive"));
                }
                let extension = &args[0];
                if !extension.starts_with('.') || extension.len() < 2 {
                    return Err(err_at(
                        line,
                        &format!("invalid extension \"{}\" in \"cgi_pass\" directive", extension),
                    ));
                }
                location
                    .cgi_executors
                    .insert(extension.clone(), args[1].clone());
                Ok(())
            }
            "cgi_read_timeout" => {
                location.cgi_read_timeout_ms = parse_timeout(single_arg(name, args, line)?, line)?;
                Ok(())
            }
            "upload_path" => {
                location.upload_path = single_arg(name, args, line)?.to_string();
                Ok(())
            }
            "keepalive_timeout" => {
                if location.keepalive_timeout_set {
                    return Err(err_at(line, "\"keepalive_timeout\" directive is duplicate"));
                }
                location.keepalive_timeout_ms = parse_timeout(single_arg(name, args, line)?, line)?;
                location.keepalive_timeout_set = true;
                Ok(())
            }
            _ => apply_common_directive(&mut location.base, name, args, line),
        }
    }
}

fn fallback_server(http: &HttpConfig) -> ServerConfig {
    let mut server = ServerConfig::inherit(http);
    server.listen.push(ListenDirective::new("0.0.0.0", 8000));
    server.base.root = "./var".to_string();
    server.is_default = true;
    server
}

fn single_arg<'a>(name: &str, args: &'a [String], line: usize) -> Result<&'a str> {
    if args.len() != 1 {
        return Err(err_at(
            line,
            &format!("invalid number of arguments in \"{}\" directive", name),
        ));
    }
    Ok(&args[0])
}

fn apply_common_directive(
    base: &mut BaseConfig,
    name: &str,
    args: &[String],
    line: usize,
) -> Result<()> {
    match name {
        "root" => {
            base.root = single_arg(name, args, line)?.to_string();
            base.root_set = true;
            Ok(())
        }
        "client_max_body_size" => {
            base.client_max_body_size = parse_body_size(single_arg(name, args, line)?, line)?;
            Ok(())
        }
        "error_page" => parse_error_page(base, args, line),
        "autoindex" => {
            if base.autoindex_set {
                return Err(err_at(line, "\"autoindex\" directive is duplicate"));
            }
            let value = single_arg(name, args, line)?;
            if value != "on" && value != "off" {
                return Err(err_at(
                    line,
                    &format!(
                        "invalid value \"{}\" in \"autoindex\" directive, it must be \"on\" or \"off\"",
                        value
                    ),
                ));
            }
            base.autoindex = value == "on";
            base.autoindex_set = true;
            Ok(())
        }
        "index" => {
            if args.is_empty() {
                return Err(err_at(line, "invalid number of arguments in \"index\" directive"));
            }
            for file in args {
                if !base.index_files.contains(file) {
                    base.index_files.push(file.clone());
                }
            }
            Ok(())
        }
        _ => Err(err_at(line, &format!("unknown directive: {}", name))),
    }
}

fn parse_error_page(base: &mut BaseConfig, args: &[String], line: usize) -> Result<()> {
    if args.len() < 2 {
        return Err(err_at(line, "invalid error_page directive format"));
    }
    let page = args.last().unwrap().clone();
    for code_str in &args[..args.len() - 1] {
        let code: u16 = code_str
            .parse()
            .map_err(|_| err_at(line, "invalid error code in error_page directive"))?;
        if !(300..=599).contains(&code) {
            return Err(err_at(line, "invalid error code in error_page directive"));
        }
        base.error_pages.insert(code, page.clone());
    }
    Ok(())
}

fn parse_body_size(value: &str, line: usize) -> Result<usize> {
    if value.is_empty() {
        return Err(err_at(line, "client_max_body_size value is empty"));
    }

    let (number_str, multiplier) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1024usize),
        Some('m') | Some('M') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };

    if number_str.is_empty() || !number_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err_at(line, "client_max_body_size contains non-numeric characters"));
    }

    let size: usize = number_str
        .parse()
        .map_err(|_| err_at(line, "invalid client_max_body_size value"))?;
    size.checked_mul(multiplier)
        .ok_or_else(|| err_at(line, "client_max_body_size value too large"))
}

/// Compound duration: `1d2h30m15s500ms`, units in strictly descending order.
/// A bare number means seconds.
pub fn parse_timeout(value: &str, line: usize) -> Result<u64> {
    let invalid = || err_at(line, "invalid timeout value");
    if value.is_empty() {
        return Err(invalid());
    }

    let bytes = value.as_bytes();
    let mut i = 0usize;
    let mut total_ms: u64 = 0;
    let mut last_rank = 0u8; // d=1 h=2 m=3 s=4 ms=5; must strictly increase

    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if start == i {
            return Err(invalid());
        }
        let number: u64 = value[start..i].parse().map_err(|_| invalid())?;

        let (rank, per_unit_ms): (u8, u64) = if i >= bytes.len() {
            (4, 1000)
        } else if bytes[i] == b'm' && i + 1 < bytes.len() && bytes[i + 1] == b's' {
            i += 2;
            (5, 1)
        } else {
            let unit = bytes[i];
            i += 1;
            match unit {
                b'd' => (1, 24 * 60 * 60 * 1000),
                b'h' => (2, 60 * 60 * 1000),
                b'm' => (3, 60 * 1000),
                b's' => (4, 1000),
                _ => return Err(invalid()),
            }
        };

        if rank <= last_rank {
            return Err(invalid());
        }
        last_rank = rank;

        let part = number.checked_mul(per_unit_ms).ok_or_else(invalid)?;
        total_ms = total_ms.checked_add(part).ok_or_else(invalid)?;
    }

    Ok(total_ms)
}

fn parse_listen(server: &mut ServerConfig, args: &[String], line: usize) -> Result<()> {
    if args.is_empty() {
        return Err(err_at(line, "invalid number of arguments in \"listen\" directive"));
    }

    let mut host = "0.0.0.0".to_string();
    let mut port: u16 = 80;

    let addr_part = &args[0];
    if let Some(colon) = addr_part.find(':') {
        let host_part = &addr_part[..colon];
        if host_part.is_empty() {
            return Err(err_at(
                line,
                &format!("no host in \"{}\" of the \"listen\" directive", addr_part),
            ));
        }
        host = resolve_host(host_part, line)?;
        port = parse_port(&addr_part[colon + 1..], addr_part, line)?;
    } else if addr_part.bytes().all(|b| b.is_ascii_digit()) && !addr_part.is_empty() {
        port = parse_port(addr_part, addr_part, line)?;
    } else {
        host = resolve_host(addr_part, line)?;
    }

    for option in &args[1..] {
        if option != "default_server" {
            return Err(err_at(line, &format!("invalid parameter \"{}\"", option)));
        }
        server.is_default = true;
    }

    let directive = ListenDirective::new(&host, port);
    if server.listen.contains(&directive) {
        return Err(err_at(line, &format!("duplicate listen {}:{}", host, port)));
    }
    server.listen.push(directive);
    Ok(())
}

fn parse_port(port_str: &str, whole: &str, line: usize) -> Result<u16> {
    let invalid = || {
        err_at(
            line,
            &format!("invalid port in \"{}\" of the \"listen\" directive", whole),
        )
    };
    if port_str.is_empty() || !port_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let port: u32 = port_str.parse().map_err(|_| invalid())?;
    if port == 0 || port > 65535 {
        return Err(invalid());
    }
    Ok(port as u16)
}

fn resolve_host(host_part: &str, line: usize) -> Result<String> {
    if host_part == "*" {
        return Ok("0.0.0.0".to_string());
    }

    if host_part.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return validate_ipv4(host_part, line);
    }

    // Hostname: resolve to the first IPv4 address.
    let lookup = format!("{}:0", host_part);
    match lookup.to_socket_addrs() {
        Ok(mut addrs) => addrs
            .find(|a| a.is_ipv4())
            .map(|a| a.ip().to_string())
            .ok_or_else(|| host_not_found(host_part, line)),
        Err(_) => Err(host_not_found(host_part, line)),
    }
}

fn host_not_found(host_part: &str, line: usize) -> ServerError {
    err_at(
        line,
        &format!("host not found in \"{}\" of the \"listen\" directive", host_part),
    )
}

fn validate_ipv4(host_part: &str, line: usize) -> Result<String> {
    let octets: Vec<&str> = host_part.split('.').collect();
    let valid = octets.len() == 4
        && octets.iter().all(|o| {
            !o.is_empty() && o.len() <= 3 && o.parse::<u16>().map(|v| v <= 255).unwrap_or(false)
        });
    if !valid {
        return Err(host_not_found(host_part, line));
    }
    Ok(host_part.to_string())
}

fn parse_redirect(args: &[String], line: usize) -> Result<Redirect> {
    if args.len() != 2 {
        return Err(err_at(line, "invalid number of arguments in \"return\" directive"));
    }

    let code_str = &args[0];
    if code_str.is_empty() || !code_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err_at(line, &format!("invalid return code '{}'", code_str)));
    }
    let code: u32 = code_str
        .parse()
        .map_err(|_| err_at(line, &format!("invalid return code '{}'", code_str)))?;
    if code > 999 {
        return Err(err_at(line, "return code must be between 000 and 999"));
    }

    Ok(Redirect {
        url: args[1].clone(),
        code: code as u16,
    })
}
