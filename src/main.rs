use johnx::config::ConfigParser;
use johnx::error::Result;
use johnx::server::Server;
use weblog::error;

const DEFAULT_CONFIG_PATH: &str = "./etc/webserv/webserv.conf";

fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    if let Err(e) = run(&config_path) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(config_path: &str) -> Result<()> {
    let config = ConfigParser::parse_file(config_path)?;
    let mut server = Server::new(config)?;
    server.run()
}
