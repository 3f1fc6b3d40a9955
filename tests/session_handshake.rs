//! End-to-end handshake tests against a fake upstream proxy listener,
//! covering the 200 and 407-then-200 scenarios.

use std::time::Duration;

use connect_proxy::session;
use connect_proxy::upstream::{Upstream, UpstreamList};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn upstream_for(addr: std::net::SocketAddr, username: &str, password: &str) -> Upstream {
    Upstream {
        host: addr.ip().to_string(),
        port: addr.port(),
        username: username.to_string(),
        password: password.to_string(),
    }
}

async fn read_request(sock: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = sock.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn end_to_end_200_relays_bytes_verbatim() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let upstream_task = tokio::spawn(async move {
        let (mut sock, _) = upstream_listener.accept().await.unwrap();
        let request = read_request(&mut sock).await;
        assert!(request.starts_with("CONNECT 93.184.216.34:443 HTTP/1.1\r\n"));

        sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();

        // After the tunnel is up, echo whatever the client relays to us.
        let mut buf = [0u8; 1024];
        let n = sock.read(&mut buf).await.unwrap();
        sock.write_all(&buf[..n]).await.unwrap();
    });

    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();

    let session_task = tokio::spawn(async move {
        let (accepted, _) = client_listener.accept().await.unwrap();
        let upstreams = UpstreamList::new(vec![upstream_for(upstream_addr, "", "")]);
        session::run_to_destination(accepted, "93.184.216.34", 443, &upstreams).await
    });

    let mut client_side = TcpStream::connect(client_addr).await.unwrap();
    client_side.write_all(b"ping").await.unwrap();

    let mut echoed = [0u8; 4];
    client_side.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    drop(client_side);

    tokio::time::timeout(Duration::from_secs(5), session_task)
        .await
        .expect("session task timed out")
        .unwrap()
        .expect("session should succeed");
    upstream_task.await.unwrap();
}

#[tokio::test]
async fn end_to_end_407_then_200_issues_exactly_two_connects() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let upstream_task = tokio::spawn(async move {
        // First CONNECT: challenge with Basic.
        let (mut sock, _) = upstream_listener.accept().await.unwrap();
        let first_request = read_request(&mut sock).await;
        assert!(!first_request.contains("Proxy-Authorization"));
        sock.write_all(
            b"HTTP/1.1 407 Proxy Authentication Required\r\n\
              Proxy-Authenticate: Basic realm=\"x\"\r\n\r\n",
        )
        .await
        .unwrap();
        drop(sock);

        // Second CONNECT: must carry the Basic credentials and succeed.
        let (mut sock, _) = upstream_listener.accept().await.unwrap();
        let second_request = read_request(&mut sock).await;
        assert!(second_request
            .contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
    });

    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();

    let session_task = tokio::spawn(async move {
        let (accepted, _) = client_listener.accept().await.unwrap();
        let upstreams = UpstreamList::new(vec![upstream_for(upstream_addr, "user", "pass")]);
        session::run_to_destination(accepted, "93.184.216.34", 443, &upstreams).await
    });

    let client_side = TcpStream::connect(client_addr).await.unwrap();
    drop(client_side);

    tokio::time::timeout(Duration::from_secs(5), session_task)
        .await
        .expect("session task timed out")
        .unwrap()
        .expect("session should succeed after retrying with credentials");
    upstream_task.await.unwrap();
}

#[tokio::test]
async fn unknown_status_terminates_the_session() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let upstream_task = tokio::spawn(async move {
        let (mut sock, _) = upstream_listener.accept().await.unwrap();
        let _ = read_request(&mut sock).await;
        sock.write_all(b"HTTP/1.1 503 Service Unavailable\r\n\r\n")
            .await
            .unwrap();
    });

    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();

    let session_task = tokio::spawn(async move {
        let (accepted, _) = client_listener.accept().await.unwrap();
        let upstreams = UpstreamList::new(vec![upstream_for(upstream_addr, "", "")]);
        session::run_to_destination(accepted, "93.184.216.34", 443, &upstreams).await
    });

    let client_side = TcpStream::connect(client_addr).await.unwrap();
    drop(client_side);

    let result = tokio::time::timeout(Duration::from_secs(5), session_task)
        .await
        .expect("session task timed out")
        .unwrap();
    assert!(result.is_err());
    upstream_task.await.unwrap();
}
