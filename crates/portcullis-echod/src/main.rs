//! portcullis-echod: a line-echo daemon exercising the portcullis front end.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use portcullis::{ServeOptions, Server, ServerConfig, TlsConfig};
use tracing_subscriber::EnvFilter;

mod echo;

use echo::EchoFactory;

#[derive(Debug, Parser)]
#[command(name = "portcullis-echod", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:2121")]
    listen: SocketAddr,

    /// Listen backlog.
    #[arg(long, default_value_t = 100)]
    backlog: u32,

    /// Maximum simultaneous connections (0 = unlimited).
    #[arg(long, default_value_t = 512)]
    max_cons: usize,

    /// Maximum simultaneous connections per client address (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_cons_per_ip: usize,

    /// Number of pre-forked workers (Unix only; 0 = one per core).
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Poll timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// PEM certificate chain; enables TLS together with --tls-key.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key; enables TLS together with --tls-cert.
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::new(args.listen)
        .with_backlog(args.backlog)
        .with_max_cons(args.max_cons)
        .with_max_cons_per_ip(args.max_cons_per_ip);
    if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        config = config.with_tls(TlsConfig::new(cert, key));
    }

    let mut server = match Server::bind(config, Arc::new(EchoFactory)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };

    let mut opts = ServeOptions::new().with_workers(args.workers);
    if let Some(ms) = args.timeout_ms {
        opts = opts.with_timeout(Duration::from_millis(ms));
    }

    match server.serve(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server exited with error");
            ExitCode::FAILURE
        }
    }
}
