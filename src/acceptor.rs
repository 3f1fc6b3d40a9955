//! Listening acceptor: binds the local port and hands each accepted
//! socket to a reactor.
//!
//! Grounded on `PuttleServer`'s `start_accept`/`handle_accept` pair: bind
//! with `SO_REUSEADDR`, accept in a loop, construct one session per
//! accepted socket, and immediately post the next accept. Non-fatal accept
//! errors are logged and do not tear down the listener, matching
//! `handle_accept`'s behavior of continuing to `start_accept()` even when
//! `error` is set in all but catastrophic cases.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::reactor::ReactorPool;

/// Binds `addr` with `SO_REUSEADDR` and accepts connections forever,
/// dispatching each to `pool`. Returns only if the listening socket itself
/// fails irrecoverably.
pub async fn run(addr: SocketAddr, pool: ReactorPool) -> std::io::Result<()> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let listener = TcpListener::from_std(socket.into())?;
    info!(%addr, "acceptor listening");

    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                info!(%peer, "accepted connection");
                pool.dispatch(client);
            }
            Err(e) => {
                error!(error = %e, "accept failed, continuing to accept");
            }
        }
    }
}
