use thiserror::Error;

/// Failure kind carried through request parsing and response building.
/// The `Display` string is the HTTP reason phrase sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("Bad Request")]
    BadRequest,
    #[error("Request Header Or Cookie Too Large")]
    HeaderFieldTooLarge,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("Not Found")]
    NotFound,
    #[error("Method Not Allowed")]
    MethodNotAllowed,
    #[error("Request Timeout")]
    RequestTimeout,
    #[error("Length Required")]
    LengthRequired,
    #[error("Content Too Large")]
    ContentTooLarge,
    #[error("URI Too Long")]
    UriTooLong,
    #[error("Unsupported Media Type")]
    UnsupportedMediaType,
    #[error("Unprocessable Content")]
    UnprocessableContent,
    #[error("Upgrade Required")]
    UpgradeRequired,
    #[error("Internal Server Error")]
    InternalServerError,
    #[error("Not Implemented")]
    NotImplemented,
    #[error("Bad Gateway")]
    BadGateway,
    #[error("Service Unavailable")]
    ServiceUnavailable,
    #[error("Gateway Timeout")]
    GatewayTimeout,
    #[error("HTTP Version Not Supported")]
    HttpVersionNotSupported,
}

impl HttpError {
    pub fn status(&self) -> u16 {
        match self {
            HttpError::BadRequest => 400,
            HttpError::HeaderFieldTooLarge => 400,
            HttpError::Unauthorized => 401,
            HttpError::Forbidden => 403,
            HttpError::NotFound => 404,
            HttpError::MethodNotAllowed => 405,
            HttpError::RequestTimeout => 408,
            HttpError::LengthRequired => 411,
            HttpError::ContentTooLarge => 413,
            HttpError::UriTooLong => 414,
            HttpError::UnsupportedMediaType => 415,
            HttpError::UnprocessableContent => 422,
            HttpError::UpgradeRequired => 426,
            HttpError::InternalServerError => 500,
            HttpError::NotImplemented => 501,
            HttpError::BadGateway => 502,
            HttpError::ServiceUnavailable => 503,
            HttpError::GatewayTimeout => 504,
            HttpError::HttpVersionNotSupported => 505,
        }
    }

    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// Startup and reactor-level failure. Anything reaching `main` through this
/// type exits the process with status 1.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    AddrParse(#[from] std::net::AddrParseError),
}

impl From<String> for ServerError {
    fn from(s: String) -> Self {
        ServerError::Config(s)
    }
}

impl From<&str> for ServerError {
    fn from(s: &str) -> Self {
        ServerError::Config(s.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
