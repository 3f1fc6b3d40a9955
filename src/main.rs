//! Transparent CONNECT-tunneling proxy.
//!
//! Forwards transparently-redirected TCP connections through one or more
//! authenticating upstream HTTP proxies using the `CONNECT` method.

use std::net::SocketAddr;

use clap::Parser;
use connect_proxy::acceptor;
use connect_proxy::config::{Cli, Config};
use connect_proxy::reactor::ReactorPool;
use connect_proxy::upstream::UpstreamList;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging(level: tracing::Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match Config::load(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("connect-proxy: {e:#}");
            std::process::exit(1);
        }
    };

    init_logging(config.verbosity.to_tracing_level());

    info!(
        num_threads = config.num_threads,
        listen_port = config.listen_port,
        upstreams = config.upstreams.len(),
        "connect-proxy starting"
    );

    let pool = ReactorPool::new(config.num_threads, UpstreamList::new(config.upstreams));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));

    acceptor::run(addr, pool).await?;

    Ok(())
}
