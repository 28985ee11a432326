pub use crate::config::{HttpConfig, ListenDirective, LocationConfig, Redirect, ServerConfig};
pub use crate::error::{HttpError, Result, ServerError};
pub use crate::http::*;

pub use mio::{
    Events, Interest, Poll, Token,
    event::Event,
    net::{TcpListener, TcpStream},
};
pub use weblog::{debug, error, info, trace, warn};

pub use std::collections::{BTreeMap, HashMap, HashSet};
pub use std::fs::{self, File};
pub use std::io::{ErrorKind, Read, Write};
pub use std::net::SocketAddr;
pub use std::path::{Path, PathBuf};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use std::{
    fmt::{self, Display},
    io,
    process::{Child, Command, Stdio},
    str::FromStr,
};

pub const READ_BUF_SIZE: usize = 4096;
pub const MAX_LINE_SIZE: usize = 8192;
pub const CGI_STDIN_CAP: usize = 8192;
pub const POLL_TIMEOUT_MS: u64 = 100;

pub const SERVER_SOFTWARE: &str = "johnx/1.0.0";

pub const HTTP_OK: u16 = 200;
pub const HTTP_CREATED: u16 = 201;

// Telnet interrupt sequences some terminal clients emit on Ctrl-C / Ctrl-Z / Ctrl-\.
pub const CTRL_C_SEQUENCE: &[u8] = b"\xff\xf4\xff\xfd\x06";
pub const CTRL_Z_SEQUENCE: &[u8] = b"\xff\xed\xff\xfd\x06";
pub const CTRL_BACKSLASH_SEQUENCE: &[u8] = b"\xff\xf3\xff\xfd\x06";
pub const SEQUENCE_LEN: usize = 5;
