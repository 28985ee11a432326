pub mod parser;
pub mod types;
pub mod validate;

pub use parser::ConfigParser;
pub use types::{HttpConfig, ListenDirective, LocationConfig, Redirect, ServerConfig};
