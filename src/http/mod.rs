pub mod connection;
pub mod parser;
pub mod request;
pub mod response;

pub use connection::Connection;
pub use parser::{ParsingStatus, RequestParser, find_subsequence, parse_multipart_body, url_decode};
pub use request::{FileUpload, HttpRequest, Method, MultipartData};
pub use response::{HttpResponse, generate_autoindex, get_mime_type, gmt_date};
