//! Helpers shared by the network tests.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use rand::Rng;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Finds a port `p` such that `p + offset` is free on loopback for every offset.
pub(crate) fn free_port_block(offsets: &[u16]) -> u16 {
    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let base: u16 = rng.gen_range(20000..40000);
        let free = offsets.iter().all(|&offset| {
            TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], base + offset))).is_ok()
        });
        if free {
            return base;
        }
    }
    panic!("no free port block found");
}

/// Sends one HTTP/1.1 request and returns the status code and body.
pub(crate) async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: &[u8],
) -> (u16, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    exchange(stream, method, path, body).await
}

/// Sends one HTTPS request trusting only `root`.
pub(crate) async fn https_request(
    addr: SocketAddr,
    root: &CertificateDer<'static>,
    server_name: &str,
    path: &str,
) -> (u16, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let tls = tls_connect(stream, root, server_name).await.unwrap();
    exchange(tls, "GET", path, b"").await
}

/// Performs a TLS handshake as a client trusting only `root`.
pub(crate) async fn tls_connect(
    stream: TcpStream,
    root: &CertificateDer<'static>,
    server_name: &str,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.add(root.clone()).unwrap();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = ServerName::try_from(server_name.to_string()).unwrap();
    TlsConnector::from(Arc::new(config)).connect(name, stream).await
}

async fn exchange<S>(mut stream: S, method: &str, path: &str, body: &[u8]) -> (u16, String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();
    stream.flush().await.unwrap();

    let mut raw = Vec::new();
    // TLS peers may reset instead of sending close_notify; keep what arrived.
    let _ = stream.read_to_end(&mut raw).await;
    let text = String::from_utf8_lossy(&raw).into_owned();

    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((text.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    (status, body.to_string())
}
