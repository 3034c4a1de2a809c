//! # Mangle Proxy
//!
//! A SOCKS5/HTTP proxy that overrides name resolution and rewrites
//! destinations before connecting.
//!
//! ## Usage
//!
//! ```bash
//! # SOCKS5 on the default address, resolve example.com to a fixed IP
//! mangle-proxy --resolve example.com:10.0.0.1
//!
//! # HTTP mode with access logs and a port-range rewrite
//! mangle-proxy -m http -v --rewrite a.com:1000-1002:10.0.0.5:2000
//!
//! # Load settings from a config file
//! mangle-proxy -c /etc/mangle-proxy/config.yaml
//! ```

use clap::Parser;
use mangle_proxy::config::{AppConfig, ProxyMode};
use mangle_proxy::error::Result;
use mangle_proxy::logging;
use mangle_proxy::server::ProxyServer;
use std::path::PathBuf;
use tracing::{error, info};

/// A SOCKS5/HTTP proxy with DNS mangling and destination rewriting.
#[derive(Parser, Debug)]
#[command(name = "mangle-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "MANGLE_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Address on which the server will listen (overrides config)
    #[arg(short, long, env = "MANGLE_PROXY_LISTEN")]
    listen: Option<String>,

    /// Proxy mode (overrides config)
    #[arg(short, long, value_enum)]
    mode: Option<ProxyMode>,

    /// Custom IP for a host, `host:ip`. Can be repeated
    #[arg(short, long = "resolve", value_name = "HOST:IP")]
    resolve: Vec<String>,

    /// Custom IP:port for an IP/FQDN:port, `(IP|FQDN):PORT[-PORT]:IP[:PORT]`. Can be repeated
    #[arg(short = 'w', long = "rewrite", value_name = "RULE")]
    rewrite: Vec<String>,

    /// Display access logs; repeat to increase verbosity (-vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Converts verbosity count to a log level name.
    fn log_level(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("error");
        }
        match self.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }
}

/// Application entry point.
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = match logging::init_logging(&config.logging, args.log_level(), args.trace_deps()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "Starting mangle-proxy");

    let server = match ProxyServer::from_config(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!(error = %e, "Proxy server error");
        std::process::exit(1);
    }
}

/// Loads the configuration file (if any) and applies CLI overrides.
fn load_config(args: &Args) -> Result<AppConfig> {
    let config_path = args.config.clone().or_else(|| {
        let defaults = [
            "./config.yaml",
            "./config.yml",
            "/etc/mangle-proxy/config.yaml",
        ];
        defaults.iter().map(PathBuf::from).find(|p| p.exists())
    });

    let mut config = match config_path {
        Some(path) => AppConfig::load(&path)?,
        None => AppConfig::default(),
    };

    if let Some(ref listen) = args.listen {
        config.server.listen = listen.clone();
    }
    if let Some(mode) = args.mode {
        config.server.mode = mode;
    }
    if args.verbose > 0 {
        config.access_log = true;
    }
    config.add_rules(&args.resolve, &args.rewrite)?;
    config.validate()?;

    Ok(config)
}
