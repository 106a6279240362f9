//! WebSocket message ↔ byte stream adaptor.
//!
//! A WebSocket connection is message-framed, but the proxy pump wants a
//! plain byte stream. Writes emit exactly one binary message per call, so an
//! MQTT packet written in one piece is never split across WS messages.
//! Reads drain the current message and transparently advance to the next;
//! clients in the wild split packets across messages and both shapes must
//! read back as one contiguous stream. Close frames and stream end read as
//! EOF; Ping/Pong are invisible to the byte layer.

use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Byte-stream view over a WebSocket connection.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    /// Unread remainder of the current incoming message.
    read_buf: Bytes,
    /// Length of a sent-but-unflushed outgoing message.
    pending_write: Option<usize>,
}

impl<S> WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established WebSocket connection.
    #[must_use]
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
            pending_write: None,
        }
    }
}

/// Map a tungstenite error onto the IO error taxonomy the pump understands.
fn to_io_error(error: WsError) -> io::Error {
    match error {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => io::Error::new(
            io::ErrorKind::NotConnected,
            "use of closed network connection",
        ),
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                // Close frame or stream end is EOF for the byte layer.
                None | Some(Ok(Message::Close(_))) => return Poll::Ready(Ok(())),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(message)) => {
                    // Empty messages are skipped rather than read as EOF.
                    this.read_buf = message.into_data();
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Poll::Ready(Ok(()));
                }
                Some(Err(e)) => return Poll::Ready(Err(to_io_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // A previous call already queued this buffer; finish its flush so
        // every write is one fully delivered message.
        if let Some(len) = this.pending_write {
            ready!(Pin::new(&mut this.inner).poll_flush(cx)).map_err(to_io_error)?;
            this.pending_write = None;
            return Poll::Ready(Ok(len));
        }

        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(to_io_error)?;
        Pin::new(&mut this.inner)
            .start_send(Message::binary(buf.to_vec()))
            .map_err(to_io_error)?;
        this.pending_write = Some(buf.len());

        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(Ok(())) => {
                this.pending_write = None;
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(to_io_error(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(to_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.get_mut().inner).poll_close(cx) {
            Poll::Ready(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                Poll::Ready(Ok(()))
            }
            other => other.map_err(to_io_error),
        }
    }
}
