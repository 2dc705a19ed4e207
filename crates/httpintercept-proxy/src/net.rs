//! Listening socket setup.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::ServerError;

/// Accept backlog for every listener.
const LISTEN_BACKLOG: i32 = 1024;

/// Binds a non-blocking TCP listener with `SO_REUSEADDR`.
///
/// Address reuse lets a stopped server rebind its ports while old
/// connections linger in `TIME_WAIT`.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let bind_err = |source: std::io::Error| ServerError::Bind { addr, source };

    let socket =
        Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true).map_err(bind_err)?;
    }
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(bind_err)
}

/// Pause after a failed `accept()` so resource exhaustion does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// A running accept loop.
///
/// Dropping the handle also stops the loop, since the shutdown channel closes.
#[derive(Debug)]
pub(crate) struct AcceptLoop {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl AcceptLoop {
    /// Spawns a loop accepting from `listener`, running `on_accept` as its own
    /// task for every connection.
    pub(crate) fn spawn<F, Fut>(
        listener: TcpListener,
        role: &'static str,
        on_accept: F,
    ) -> Result<Self, ServerError>
    where
        F: FnMut(TcpStream, SocketAddr) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(run_accept_loop(listener, role, shutdown_rx, on_accept));

        Ok(Self {
            local_addr,
            shutdown_tx,
            handle,
        })
    }

    /// Returns the bound address.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes the socket and waits for open connections to be torn down.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            tracing::error!("Accept loop on {} ended abnormally: {}", self.local_addr, e);
        }
    }
}

async fn run_accept_loop<F, Fut>(
    listener: TcpListener,
    role: &'static str,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut on_accept: F,
) where
    F: FnMut(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().ok();
    let mut connections = JoinSet::new();
    tracing::debug!("{} listener accepting on {:?}", role, addr);

    loop {
        tokio::select! {
            // A closed channel means the handle was dropped.
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(on_accept(stream, peer));
                }
                Err(e) => {
                    tracing::warn!("{} listener on {:?} failed to accept: {}", role, addr, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!("{} connection task on {:?} panicked: {}", role, addr, e);
                    }
                }
            }
        }
    }

    drop(listener);
    let open = connections.len();
    connections.shutdown().await;
    tracing::debug!("{} listener on {:?} stopped ({} open connection(s) closed)", role, addr, open);
}

/// Returns true for errors that just mean the peer went away.
pub fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let listener = bind_listener(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn rebinding_after_close_succeeds() {
        let listener = bind_listener(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let addr = listener.local_addr().unwrap();

        // Leave a connection behind so the port has lingering state.
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        drop(server_side);
        drop(client);
        drop(listener);

        assert!(bind_listener(addr).is_ok());
    }

    #[tokio::test]
    async fn occupied_port_reports_bind_error() {
        let listener = bind_listener(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let addr = listener.local_addr().unwrap();
        let err = bind_listener(addr).unwrap_err();
        assert!(matches!(err, ServerError::Bind { addr: a, .. } if a == addr));
    }

    #[tokio::test]
    async fn accept_loop_stop_closes_socket() {
        let listener = bind_listener(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let accept_loop = AcceptLoop::spawn(listener, "test", |stream, _| async move {
            drop(stream);
        })
        .unwrap();
        let addr = accept_loop.local_addr();

        assert!(TcpStream::connect(addr).await.is_ok());
        accept_loop.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn stop_aborts_open_connections() {
        use tokio::io::AsyncReadExt;

        let listener = bind_listener(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let accept_loop = AcceptLoop::spawn(listener, "test", |stream, _| async move {
            // Hold the connection open indefinitely.
            let _stream = stream;
            std::future::pending::<()>().await;
        })
        .unwrap();

        let mut client = TcpStream::connect(accept_loop.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        accept_loop.stop().await;

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn panicking_connection_does_not_stop_loop() {
        let listener = bind_listener(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let accept_loop = AcceptLoop::spawn(listener, "test", |_stream, _| async move {
            panic!("connection handler failure");
        })
        .unwrap();
        let addr = accept_loop.local_addr();

        for _ in 0..3 {
            let _ = TcpStream::connect(addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(TcpStream::connect(addr).await.is_ok());
        accept_loop.stop().await;
    }

    #[test]
    fn disconnect_kinds() {
        use std::io::{Error, ErrorKind};
        assert!(is_disconnect(&Error::from(ErrorKind::ConnectionReset)));
        assert!(!is_disconnect(&Error::from(ErrorKind::PermissionDenied)));
    }
}
