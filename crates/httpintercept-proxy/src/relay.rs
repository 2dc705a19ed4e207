//! Bidirectional byte relay with an idle timeout.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the client to the backend.
    pub client_to_backend: u64,
    /// Bytes copied from the backend to the client.
    pub backend_to_client: u64,
    /// The relay was closed because neither side sent anything in time.
    pub idle_timeout: bool,
}

/// Copies bytes between `client` and `backend` until both sides close.
///
/// Bytes are forwarded unmodified and both directions run concurrently. EOF
/// on one side shuts down the write half of the other, so half-closed
/// exchanges complete. If no byte is read or written in either direction for
/// `idle_timeout` the relay stops and reports it.
pub async fn relay<C, B>(
    client: &mut C,
    backend: &mut B,
    idle_timeout: Duration,
) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let last_activity = Mutex::new(Instant::now());
    let mut client = Metered::new(client, &last_activity);
    let mut backend = Metered::new(backend, &last_activity);

    let idle = {
        let copy = tokio::io::copy_bidirectional(&mut client, &mut backend);
        tokio::pin!(copy);
        loop {
            let deadline = *last_activity.lock() + idle_timeout;
            tokio::select! {
                result = &mut copy => {
                    result?;
                    break false;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if last_activity.lock().elapsed() >= idle_timeout {
                        break true;
                    }
                }
            }
        }
    };

    Ok(RelayStats {
        client_to_backend: backend.written,
        backend_to_client: client.written,
        idle_timeout: idle,
    })
}

/// Stream wrapper recording the last transfer and the bytes written through it.
struct Metered<'a, S> {
    inner: &'a mut S,
    last_activity: &'a Mutex<Instant>,
    written: u64,
}

impl<'a, S> Metered<'a, S> {
    fn new(inner: &'a mut S, last_activity: &'a Mutex<Instant>) -> Self {
        Self {
            inner,
            last_activity,
            written: 0,
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Metered<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut *this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.touch();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Metered<'_, S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            if n > 0 {
                this.written += n as u64;
                this.touch();
            }
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}
