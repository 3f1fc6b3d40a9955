//! Per-connection session: the handshake state machine plus the relay
//! phase.
//!
//! Grounded on `puttle_proxy.cpp`: `resolve_destination`/`handle_resolve`/
//! `handle_connect` (endpoint and upstream iteration), `setup_proxy`
//! (socket options, CONNECT request construction), `check_proxy_response`/
//! `handle_proxy_auth` (200/407/other dispatch, reuse-same-upstream-on-407),
//! and `handle_server_read`/`handle_client_write` (the relay). The original
//! drives all of this through `shared_from_this()`-captured callbacks kept
//! alive by two independent read/write chains; here the same lifetime is
//! expressed as one `async fn` per session with no shared ownership needed,
//! since the two directions of the relay are driven concurrently by
//! `tokio::io::copy_bidirectional` rather than by separate callback chains.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::authenticator::{Authenticator, Method};
use crate::error::ProxyError;
use crate::original_dst;
use crate::response::{Response, ResponseAccumulator};
use crate::upstream::{Upstream, UpstreamList};

/// Intentional TTL choice on the upstream-facing socket, carried over
/// unchanged from the original's `time_to_live ttl(42)`.
const UPSTREAM_TTL: u32 = 42;

const HANDSHAKE_BUF_SIZE: usize = 8192;
const RELAY_UA: &str = "Mozilla/5.0 (X11; U; AmigaOS x86_64; eo-EO; rv:42.6.6)";

/// Process-wide per-connection id counter, mirroring the original's
/// `log4cpp` per-category `[conn_id]` prefixing (spec.md §10.1): every
/// log line emitted from within a session's span carries this tag so
/// concurrent sessions are distinguishable in the log stream.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Runs one accepted client connection to completion: recovers the
/// original destination, selects and authenticates against an upstream,
/// then relays until either side closes. Every exit path is a session-local
/// `Err`; the caller (the reactor) only logs it.
pub async fn run(client: TcpStream, upstreams: &UpstreamList) -> Result<(), ProxyError> {
    let original_dst = original_dst::get_original_dst(&client)?;
    let dest_host = original_dst.ip().to_string();
    let dest_port = original_dst.port();

    run_to_destination(client, &dest_host, dest_port, upstreams).await
}

/// The handshake-and-relay pipeline once a destination is known, factored
/// out from [`run`] so it can be driven directly by tests without a real
/// `SO_ORIGINAL_DST` redirect in place.
#[tracing::instrument(skip(client, upstreams), fields(conn_id = next_conn_id()))]
pub async fn run_to_destination(
    client: TcpStream,
    dest_host: &str,
    dest_port: u16,
    upstreams: &UpstreamList,
) -> Result<(), ProxyError> {
    let dest_host = dest_host.to_string();

    if upstreams.is_empty() {
        return Err(ProxyError::UpstreamsExhausted);
    }

    let ordered = upstreams.shuffled();
    let mut last_err = ProxyError::UpstreamsExhausted;

    'upstreams: for upstream in ordered.iter().filter(|u| u.is_valid()) {
        debug!(host = %upstream.host, port = upstream.port, "trying upstream");

        let mut sock = match connect_upstream(upstream).await {
            Ok(sock) => sock,
            Err(e) if e.is_endpoint_recoverable() => {
                last_err = e;
                continue 'upstreams;
            }
            Err(e) => return Err(e),
        };

        let mut authenticator: Option<Authenticator> = None;

        loop {
            // A write/read failure here is a handshake I/O error, which the
            // error handling table treats as session-fatal rather than a
            // reason to try another endpoint or upstream.
            write_connect_request(&mut sock, &dest_host, dest_port, authenticator.as_mut())
                .await?;

            let response = read_response(&mut sock).await?;

            match response.status {
                200 => {
                    info!(host = %upstream.host, port = upstream.port, dest = %dest_host, "tunnel established");
                    relay(client, sock).await;
                    return Ok(());
                }
                407 => {
                    let Some(challenge) = response.headers.get("Proxy-Authenticate") else {
                        return Err(ProxyError::MissingChallenge);
                    };

                    let has_error = match authenticator.as_mut() {
                        Some(auth) => {
                            auth.set_headers(&response.headers);
                            auth.has_error()
                        }
                        None => {
                            let scheme = challenge.split_whitespace().next().unwrap_or("");
                            let method = Method::from_challenge_token(scheme).ok_or_else(|| {
                                ProxyError::UnknownAuthScheme(scheme.to_string())
                            })?;
                            let mut auth = Authenticator::create(
                                method,
                                upstream,
                                &dest_host,
                                &dest_port.to_string(),
                            );
                            auth.set_headers(&response.headers);
                            let has_error = auth.has_error();
                            authenticator = Some(auth);
                            has_error
                        }
                    };

                    if has_error {
                        warn!(host = %upstream.host, "proxy authentication exhausted");
                        return Err(ProxyError::AuthExhausted);
                    }

                    // Reopen the upstream socket before retrying: never
                    // reuse a connection with a stale authenticator.
                    drop(sock);
                    sock = match connect_upstream(upstream).await {
                        Ok(sock) => sock,
                        Err(e) if e.is_endpoint_recoverable() => {
                            last_err = e;
                            continue 'upstreams;
                        }
                        Err(e) => return Err(e),
                    };
                }
                other => {
                    warn!(status = other, headers = ?response.headers, "unexpected upstream status");
                    return Err(ProxyError::UnexpectedStatus { status: other });
                }
            }
        }
    }

    Err(last_err)
}

/// Resolves `upstream.host:upstream.port` and tries each returned endpoint
/// in turn, matching `handle_resolve`/`handle_connect`'s "try endpoints
/// until one connects" behavior.
async fn connect_upstream(upstream: &Upstream) -> Result<TcpStream, ProxyError> {
    let host = upstream.host.clone();
    let port = upstream.port;

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| ProxyError::Resolve {
            host: host.clone(),
            port,
            source: e,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(ProxyError::NoEndpoints { host, port });
    }

    let mut last_err = None;
    for addr in addrs {
        match connect_with_options(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or(ProxyError::NoEndpoints { host, port }))
}

/// Opens an IPv4 socket, sets TTL=42 and keep-alive before connecting,
/// matching `handle_resolve`'s `server_socket_.open` / `set_option(ttl)` /
/// `set_option(keep_alive)` sequence, then hands the connected socket to
/// Tokio.
async fn connect_with_options(addr: SocketAddr) -> Result<TcpStream, ProxyError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ProxyError::SocketOption)?;
    socket.set_nonblocking(true).map_err(ProxyError::SocketOption)?;
    socket.set_ttl(UPSTREAM_TTL).map_err(ProxyError::SocketOption)?;
    socket
        .set_keepalive(true)
        .map_err(ProxyError::SocketOption)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(ProxyError::Connect { addr, source: e }),
    }

    let stream =
        TcpStream::from_std(socket.into()).map_err(|e| ProxyError::Connect { addr, source: e })?;

    stream
        .writable()
        .await
        .map_err(|e| ProxyError::Connect { addr, source: e })?;

    if let Some(err) = stream
        .take_error()
        .map_err(|e| ProxyError::Connect { addr, source: e })?
    {
        return Err(ProxyError::Connect { addr, source: err });
    }

    Ok(stream)
}

/// Builds and writes the CONNECT request, appending the authenticator's
/// token line (if it has one and hasn't errored), matching `setup_proxy`.
async fn write_connect_request(
    sock: &mut TcpStream,
    dest_host: &str,
    dest_port: u16,
    authenticator: Option<&mut Authenticator>,
) -> Result<(), ProxyError> {
    let mut request = format!(
        "CONNECT {dest_host}:{dest_port} HTTP/1.1\r\n\
         User-Agent: {RELAY_UA}\r\n\
         Proxy-Connection: keep-alive\r\n\
         Host: {dest_host}:{dest_port}\r\n"
    );

    if let Some(auth) = authenticator {
        if auth.has_token() {
            request.push_str(&auth.get_token());
        }
    }

    request.push_str("\r\n");

    sock.write_all(request.as_bytes())
        .await
        .map_err(ProxyError::HandshakeIo)
}

/// Reads from `sock` until the end of headers is seen, then parses the
/// response, matching `handle_proxy_connect`/`handle_proxy_response`.
async fn read_response(sock: &mut TcpStream) -> Result<Response, ProxyError> {
    let mut accumulator = ResponseAccumulator::new();
    let mut buf = [0u8; HANDSHAKE_BUF_SIZE];

    loop {
        let n = sock.read(&mut buf).await.map_err(ProxyError::HandshakeIo)?;
        if n == 0 {
            return Err(ProxyError::HandshakeIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed the connection during the handshake",
            )));
        }
        if accumulator.feed(&buf[..n]) {
            return accumulator.parse();
        }
    }
}

/// Full-duplex byte relay until either side closes, matching
/// `handle_server_read`/`handle_client_read`'s read-then-write-then-read
/// loop. `copy_bidirectional` gives the same "at most one outstanding read
/// and write per direction" behavior without hand-rolling the loop.
async fn relay(mut client: TcpStream, mut upstream: TcpStream) {
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(client_to_upstream, upstream_to_client, "relay finished");
        }
        Err(e) => {
            debug!(error = %e, "relay ended with an error");
        }
    }
    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
}
