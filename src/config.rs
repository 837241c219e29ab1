//! CLI arguments and server configuration defaults.

use clap::Parser;

pub const DEFAULT_HTTP_PORT: u16 = 4918;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "oxidav", version, about = "WebDAV server over an in-memory filesystem")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "OXIDAV_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "OXIDAV_HTTP_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        long,
        env = "OXIDAV_DEBUG",
        help = "Serialize request handling and log request details"
    )]
    pub debug: bool,
}
