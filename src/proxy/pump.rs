//! Bidirectional forwarding, one direction per pump.
//!
//! RAW mode copies bytes but only ever writes whole MQTT packets, so the
//! peer never sees a split frame. PACKETS mode decodes and re-encodes each
//! packet. Either way a pump runs until EOF or error; the service pairs two
//! pumps per client and tears both down when the first one returns.

use super::buffer::MemoryBuffer;
use super::error::{ProxyError, ProxyResult};
use crate::config::ProxyMode;
use crate::metrics::ProxyMetrics;
use crate::mqtt::{self, MqttError};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace};

/// RAW pump buffer size.
const RAW_BUFFER_CAPACITY: usize = 65_536;

/// Which way this pump moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    FrontendToBackend,
    /// Backend to client.
    BackendToFrontend,
}

impl Direction {
    /// Name of the side being read from.
    #[must_use]
    pub fn source_name(&self) -> &'static str {
        match self {
            Self::FrontendToBackend => "frontend",
            Self::BackendToFrontend => "backend",
        }
    }

    /// Name of the side being written to.
    #[must_use]
    pub fn destination_name(&self) -> &'static str {
        match self {
            Self::FrontendToBackend => "backend",
            Self::BackendToFrontend => "frontend",
        }
    }
}

/// Shared request timestamp pairing client packets with backend packets.
///
/// The simple latency model: every client-side packet stamps the clock,
/// every backend-side packet observes the time since the last stamp.
#[derive(Debug)]
pub struct RequestClock {
    last_request: Mutex<Instant>,
}

impl RequestClock {
    /// Create a clock stamped at now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_request: Mutex::new(Instant::now()),
        }
    }

    /// Stamp a request.
    pub fn mark(&self) {
        *self.last_request.lock().expect("clock lock poisoned") = Instant::now();
    }

    /// Time since the last stamp.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.last_request
            .lock()
            .expect("clock lock poisoned")
            .elapsed()
    }
}

impl Default for RequestClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one pump needs besides its two stream halves.
#[derive(Clone)]
pub struct PumpContext {
    /// Transfer direction.
    pub direction: Direction,
    /// Service name, for metric labels.
    pub service: String,
    /// Frontend name, for metric labels.
    pub frontend: String,
    /// Backend name, for metric labels.
    pub backend: String,
    /// Metrics sink.
    pub metrics: Arc<ProxyMetrics>,
    /// Request clock shared with the opposite pump.
    pub clock: Arc<RequestClock>,
}

impl PumpContext {
    /// Account one forwarded packet.
    fn on_packet(&self) {
        match self.direction {
            Direction::FrontendToBackend => {
                self.metrics
                    .on_request(&self.service, &self.frontend, &self.backend);
                self.clock.mark();
            }
            Direction::BackendToFrontend => {
                self.metrics.on_response(
                    &self.service,
                    &self.frontend,
                    &self.backend,
                    self.clock.elapsed(),
                );
            }
        }
    }
}

/// Whether an IO error is one of the conditions treated as a clean EOF.
///
/// Structured kinds first; the Go runtime's "use of closed network
/// connection" phrase remains as a compatibility shim for errors that
/// surface as strings.
#[must_use]
pub fn is_eof_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    ) || error.to_string().contains("use of closed network connection")
}

/// Run one pump direction until EOF or error.
///
/// EOF-equivalents close the destination and return cleanly without an
/// error log. Read errors close the destination; write errors leave the
/// source teardown to the session. Anything unexpected is logged and
/// returned.
pub async fn run_pump<R, W>(
    mode: ProxyMode,
    ctx: &PumpContext,
    src: &mut R,
    dst: &mut W,
) -> ProxyResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match mode {
        ProxyMode::Raw => raw_pump(ctx, src, dst).await,
        ProxyMode::Packets => packets_pump(ctx, src, dst).await,
    }
}

async fn raw_pump<R, W>(ctx: &PumpContext, src: &mut R, dst: &mut W) -> ProxyResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = MemoryBuffer::new(RAW_BUFFER_CAPACITY);
    loop {
        if buffer.free() == 0 {
            error!(
                source = ctx.direction.source_name(),
                "failed to read data: message is too big"
            );
            let _ = dst.shutdown().await;
            return Err(ProxyError::MessageTooBig);
        }

        let n = match src.read(buffer.write_slice()).await {
            Ok(0) => {
                let _ = dst.shutdown().await;
                debug!(source = ctx.direction.source_name(), "connection closed");
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => {
                let _ = dst.shutdown().await;
                if is_eof_error(&e) {
                    debug!(source = ctx.direction.source_name(), "connection closed");
                    return Ok(());
                }
                error!(
                    source = ctx.direction.source_name(),
                    error = %e,
                    "error reading data"
                );
                return Err(e.into());
            }
        };
        buffer.add(n);

        // Decode as many whole packets as the buffer holds, advancing the
        // commit cursor per packet, then forward them in a single write.
        let previous = buffer.used();
        loop {
            match mqtt::try_decode(buffer.unread()) {
                Ok(Some(header)) => {
                    trace!(
                        source = ctx.direction.source_name(),
                        packet = header.packet_type.name(),
                        len = header.total_len(),
                        "read a packet"
                    );
                    buffer.advance(header.total_len());
                    ctx.on_packet();
                }
                Ok(None) => break,
                Err(e) => {
                    error!(
                        source = ctx.direction.source_name(),
                        error = %e,
                        "failed to decode a packet from received data"
                    );
                    let _ = dst.shutdown().await;
                    return Err(e.into());
                }
            }
        }

        let committed = buffer.committed_since(previous);
        if !committed.is_empty() {
            if let Err(e) = dst.write_all(committed).await {
                if is_eof_error(&e) {
                    debug!(
                        destination = ctx.direction.destination_name(),
                        "connection closed"
                    );
                    return Ok(());
                }
                error!(
                    destination = ctx.direction.destination_name(),
                    error = %e,
                    "error writing data"
                );
                return Err(e.into());
            }
            trace!(
                destination = ctx.direction.destination_name(),
                bytes = committed.len(),
                "written data"
            );
        }

        let consumed = buffer.used();
        buffer.remove(consumed);
        if !buffer.is_empty() {
            trace!(bytes = buffer.len(), "data remained in the buffer");
        }
    }
}

async fn packets_pump<R, W>(ctx: &PumpContext, src: &mut R, dst: &mut W) -> ProxyResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let packet = match mqtt::read_packet(src).await {
            Ok(packet) => packet,
            Err(MqttError::Io(e)) => {
                let _ = dst.shutdown().await;
                if is_eof_error(&e) {
                    debug!(source = ctx.direction.source_name(), "connection closed");
                    return Ok(());
                }
                error!(
                    source = ctx.direction.source_name(),
                    error = %e,
                    "error reading packet"
                );
                return Err(ProxyError::Io(e));
            }
            Err(e) => {
                error!(
                    source = ctx.direction.source_name(),
                    error = %e,
                    "error reading packet"
                );
                let _ = dst.shutdown().await;
                return Err(e.into());
            }
        };
        trace!(
            source = ctx.direction.source_name(),
            packet = packet.packet_type.name(),
            "read a packet"
        );

        if let Err(e) = dst.write_all(&packet.encode()).await {
            if is_eof_error(&e) {
                debug!(
                    destination = ctx.direction.destination_name(),
                    "connection closed"
                );
                return Ok(());
            }
            error!(
                destination = ctx.direction.destination_name(),
                error = %e,
                "error writing packet"
            );
            return Err(e.into());
        }
        ctx.on_packet();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn context(direction: Direction) -> PumpContext {
        PumpContext {
            direction,
            service: "svc".to_string(),
            frontend: "fe".to_string(),
            backend: "b1".to_string(),
            metrics: Arc::new(ProxyMetrics::new()),
            clock: Arc::new(RequestClock::new()),
        }
    }

    fn connect_packet() -> Vec<u8> {
        vec![
            0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x02,
            b'c', b'1',
        ]
    }

    #[tokio::test]
    async fn test_raw_pump_forwards_whole_packets() {
        let ctx = context(Direction::FrontendToBackend);
        let (mut client, mut client_side) = duplex(4096);
        let (mut backend_side, mut backend) = duplex(4096);

        let pump = tokio::spawn(async move {
            run_pump(ProxyMode::Raw, &ctx, &mut client_side, &mut backend_side).await
        });

        use tokio::io::AsyncWriteExt;
        let data = connect_packet();
        // Split the packet across two writes; the pump must not forward the
        // first fragment alone.
        client.write_all(&data[..5]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.write_all(&data[5..]).await.unwrap();

        let mut received = vec![0u8; data.len()];
        tokio::time::timeout(
            Duration::from_secs(1),
            tokio::io::AsyncReadExt::read_exact(&mut backend, &mut received),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(received, data);

        drop(client);
        pump.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_raw_pump_counts_requests() {
        let ctx = context(Direction::FrontendToBackend);
        let metrics = Arc::clone(&ctx.metrics);
        let (mut client, mut client_side) = duplex(4096);
        let (mut backend_side, _backend) = duplex(4096);

        let pump = tokio::spawn(async move {
            run_pump(ProxyMode::Raw, &ctx, &mut client_side, &mut backend_side).await
        });

        use tokio::io::AsyncWriteExt;
        client.write_all(&connect_packet()).await.unwrap();
        client.write_all(&[0xC0, 0x00]).await.unwrap(); // PINGREQ
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(client);
        pump.await.unwrap().unwrap();

        assert_eq!(metrics.request_count("svc", "fe", "b1"), 2);
    }

    #[tokio::test]
    async fn test_raw_pump_rejects_garbage() {
        let ctx = context(Direction::FrontendToBackend);
        let (mut client, mut client_side) = duplex(4096);
        let (mut backend_side, _backend) = duplex(4096);

        let pump = tokio::spawn(async move {
            run_pump(ProxyMode::Raw, &ctx, &mut client_side, &mut backend_side).await
        });

        use tokio::io::AsyncWriteExt;
        // Type nibble 0 is not a valid MQTT packet.
        client.write_all(&[0x00, 0x00]).await.unwrap();

        let result = pump.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Mqtt(_))));
    }

    #[tokio::test]
    async fn test_raw_pump_eof_is_clean() {
        let ctx = context(Direction::BackendToFrontend);
        let (client, mut client_side) = duplex(4096);
        let (mut backend_side, _backend) = duplex(4096);
        drop(client);

        let result = run_pump(ProxyMode::Raw, &ctx, &mut client_side, &mut backend_side).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_packets_pump_canonical_round_trip() {
        let ctx = context(Direction::BackendToFrontend);
        let (mut backend, mut backend_side) = duplex(4096);
        let (mut client_side, mut client) = duplex(4096);

        let pump = tokio::spawn(async move {
            run_pump(ProxyMode::Packets, &ctx, &mut backend_side, &mut client_side).await
        });

        use tokio::io::AsyncWriteExt;
        backend.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let mut received = [0u8; 4];
        tokio::time::timeout(
            Duration::from_secs(1),
            tokio::io::AsyncReadExt::read_exact(&mut client, &mut received),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(received, [0x20, 0x02, 0x00, 0x00]);

        drop(backend);
        pump.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_response_latency_observed() {
        let ctx = context(Direction::BackendToFrontend);
        let metrics = Arc::clone(&ctx.metrics);
        ctx.clock.mark();

        let (mut backend, mut backend_side) = duplex(4096);
        let (mut client_side, _client) = duplex(4096);

        let pump = tokio::spawn(async move {
            run_pump(ProxyMode::Raw, &ctx, &mut backend_side, &mut client_side).await
        });

        use tokio::io::AsyncWriteExt;
        backend.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(backend);
        pump.await.unwrap().unwrap();

        let text = metrics.encode_text();
        assert!(text.contains("mqproxy_response_duration_seconds_count"));
    }

    #[test]
    fn test_is_eof_error() {
        assert!(is_eof_error(&io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "eof"
        )));
        assert!(is_eof_error(&io::Error::new(
            io::ErrorKind::BrokenPipe,
            "pipe"
        )));
        assert!(is_eof_error(&io::Error::other(
            "use of closed network connection"
        )));
        assert!(!is_eof_error(&io::Error::other("something else")));
    }

    #[test]
    fn test_direction_names() {
        assert_eq!(Direction::FrontendToBackend.source_name(), "frontend");
        assert_eq!(Direction::FrontendToBackend.destination_name(), "backend");
        assert_eq!(Direction::BackendToFrontend.source_name(), "backend");
        assert_eq!(Direction::BackendToFrontend.destination_name(), "frontend");
    }
}
