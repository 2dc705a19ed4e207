//! Content-based port multiplexing.
//!
//! A [`MultiplexListener`] peeks at the first byte of each connection with
//! `MSG_PEEK`, so nothing is consumed from the socket, and relays the
//! untouched stream to the HTTP or HTTPS backend on loopback.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::config::RelaySettings;
use crate::error::Result;
use crate::listener::Protocol;
use crate::net::{bind_listener, AcceptLoop};
use crate::relay::relay;

/// TLS record type of a handshake record (`ClientHello` is always one).
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Bytes peeked for classification and logging.
const PEEK_LEN: usize = 3;

/// Decides which backend a connection belongs to from its first bytes.
///
/// Only the first byte matters. Empty input is treated as HTTP.
pub fn classify(first_bytes: &[u8]) -> Protocol {
    match first_bytes.first() {
        Some(&TLS_HANDSHAKE_RECORD) => Protocol::Https,
        _ => Protocol::Http,
    }
}

/// Loopback destinations of one multiplexed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backends {
    /// Plaintext HTTP backend.
    pub http: SocketAddr,
    /// TLS backend.
    pub https: SocketAddr,
}

impl Backends {
    /// Returns the backend for `protocol`.
    pub fn select(&self, protocol: Protocol) -> SocketAddr {
        match protocol {
            Protocol::Http => self.http,
            Protocol::Https => self.https,
        }
    }
}

/// Serves HTTP and HTTPS on one public port by relaying to two backends.
#[derive(Debug)]
pub struct MultiplexListener {
    backends: Backends,
    accept_loop: AcceptLoop,
}

impl MultiplexListener {
    /// Binds `addr` and starts relaying to `backends`.
    ///
    /// Both backends must already be listening.
    pub fn bind(addr: SocketAddr, backends: Backends, settings: RelaySettings) -> Result<Self> {
        let listener = bind_listener(addr)?;
        let accept_loop = AcceptLoop::spawn(listener, "multiplex", move |stream, peer| {
            route_connection(stream, peer, backends, settings)
        })?;

        tracing::info!(
            "Multiplexer bound on {} (http -> {}, https -> {})",
            accept_loop.local_addr(),
            backends.http,
            backends.https
        );
        Ok(Self {
            backends,
            accept_loop,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.accept_loop.local_addr()
    }

    /// Returns the relay destinations.
    pub fn backends(&self) -> Backends {
        self.backends
    }

    /// Stops accepting and tears down every active relay.
    pub async fn stop(self) {
        let addr = self.local_addr();
        self.accept_loop.stop().await;
        tracing::info!("Multiplexer on {} stopped", addr);
    }
}

async fn route_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    backends: Backends,
    settings: RelaySettings,
) {
    let mut first = [0u8; PEEK_LEN];
    let peek = tokio::time::timeout(settings.peek_timeout, client.peek(&mut first));
    let peeked = match peek.await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            tracing::debug!("Failed to peek at connection from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            tracing::debug!("{} sent nothing within {:?}", peer, settings.peek_timeout);
            return;
        }
    };
    if peeked == 0 {
        // Client went away before sending anything.
        return;
    }

    let protocol = classify(&first[..peeked]);
    let target = backends.select(protocol);
    tracing::trace!(
        "Routing {} to {} backend {} (first bytes {:02x?})",
        peer,
        protocol,
        target,
        &first[..peeked]
    );

    let connect = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(target));
    let mut backend = match connect.await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(
                "Failed to reach {} backend {} for {}: {}",
                protocol,
                target,
                peer,
                e
            );
            return;
        }
        Err(_) => {
            tracing::warn!(
                "Timed out connecting to {} backend {} for {}",
                protocol,
                target,
                peer
            );
            return;
        }
    };
    let _ = client.set_nodelay(true);
    let _ = backend.set_nodelay(true);

    match relay(&mut client, &mut backend, settings.idle_timeout).await {
        Ok(stats) if stats.idle_timeout => {
            tracing::debug!("Relay for {} closed after {:?} idle", peer, settings.idle_timeout);
        }
        Ok(stats) => {
            tracing::trace!(
                "Relay for {} finished ({} bytes up, {} bytes down)",
                peer,
                stats.client_to_backend,
                stats.backend_to_client
            );
        }
        Err(e) if crate::net::is_disconnect(&e) => {}
        Err(e) => tracing::debug!("Relay for {} failed: {}", peer, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn fast_settings() -> RelaySettings {
        RelaySettings {
            idle_timeout: Duration::from_secs(5),
            peek_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
        }
    }

    /// Echo server that prefixes its replies with `tag` and counts connections.
    async fn tagged_echo(tag: &'static [u8]) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut received = Vec::new();
                    let _ = stream.read_to_end(&mut received).await;
                    let _ = stream.write_all(tag).await;
                    let _ = stream.write_all(&received).await;
                });
            }
        });
        (addr, accepted)
    }

    async fn send_through(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(payload).await.unwrap();
        client.shutdown().await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        reply
    }

    #[test]
    fn only_handshake_byte_selects_https() {
        for byte in 0..=u8::MAX {
            let expected = if byte == 0x16 {
                Protocol::Https
            } else {
                Protocol::Http
            };
            assert_eq!(classify(&[byte]), expected, "first byte {byte:#04x}");
            assert_eq!(classify(&[byte, 0x03, 0x01]), expected);
        }
        assert_eq!(classify(&[]), Protocol::Http);
    }

    #[tokio::test]
    async fn routes_by_first_byte_and_relays_unchanged() {
        let (http, _) = tagged_echo(b"H:").await;
        let (https, _) = tagged_echo(b"S:").await;
        let mux =
            MultiplexListener::bind(loopback(), Backends { http, https }, fast_settings()).unwrap();
        let addr = mux.local_addr();

        let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        let reply = send_through(addr, &request).await;
        assert_eq!(reply, [b"H:".as_slice(), request.as_slice()].concat());

        let hello: Vec<u8> = [0x16, 0x03, 0x01].into_iter().chain(0..=255u8).collect();
        let reply = send_through(addr, &hello).await;
        assert_eq!(reply, [b"S:".as_slice(), hello.as_slice()].concat());

        mux.stop().await;
    }

    #[tokio::test]
    async fn large_payload_round_trips() {
        let (http, _) = tagged_echo(b"").await;
        let (https, _) = tagged_echo(b"").await;
        let mux =
            MultiplexListener::bind(loopback(), Backends { http, https }, fast_settings()).unwrap();

        let payload: Vec<u8> = (0..=255u8).rev().cycle().take(256 * 1024).collect();
        assert_eq!(send_through(mux.local_addr(), &payload).await, payload);

        mux.stop().await;
    }

    #[tokio::test]
    async fn silent_client_never_reaches_backend() {
        let (http, http_count) = tagged_echo(b"H:").await;
        let (https, https_count) = tagged_echo(b"S:").await;
        let mux =
            MultiplexListener::bind(loopback(), Backends { http, https }, fast_settings()).unwrap();

        let client = TcpStream::connect(mux.local_addr()).await.unwrap();
        drop(client);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(http_count.load(Ordering::SeqCst), 0);
        assert_eq!(https_count.load(Ordering::SeqCst), 0);
        mux.stop().await;
    }

    #[tokio::test]
    async fn peek_timeout_drops_idle_client() {
        let (http, http_count) = tagged_echo(b"H:").await;
        let (https, _) = tagged_echo(b"S:").await;
        let settings = RelaySettings {
            peek_timeout: Duration::from_millis(100),
            ..fast_settings()
        };
        let mux = MultiplexListener::bind(loopback(), Backends { http, https }, settings).unwrap();

        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(http_count.load(Ordering::SeqCst), 0);

        mux.stop().await;
    }

    #[tokio::test]
    async fn unreachable_backend_closes_client() {
        // Reserve then release a port so nothing listens on it.
        let dead = TcpListener::bind(loopback()).await.unwrap().local_addr().unwrap();
        let mux = MultiplexListener::bind(
            loopback(),
            Backends {
                http: dead,
                https: dead,
            },
            fast_settings(),
        )
        .unwrap();

        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut reply = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
            .await
            .unwrap();
        assert!(read.is_err() || reply.is_empty());

        // The accept loop survives.
        assert!(TcpStream::connect(mux.local_addr()).await.is_ok());
        mux.stop().await;
    }

    #[test]
    fn backends_select() {
        let backends = Backends {
            http: SocketAddr::from(([127, 0, 0, 1], 18080)),
            https: SocketAddr::from(([127, 0, 0, 1], 19080)),
        };
        assert_eq!(backends.select(Protocol::Http).port(), 18080);
        assert_eq!(backends.select(Protocol::Https).port(), 19080);
    }
}
