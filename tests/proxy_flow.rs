//! End-to-end proxy scenarios over loopback.

use futures_util::{SinkExt, StreamExt};
use mqproxy::config::load_str;
use mqproxy::metrics::ProxyMetrics;
use mqproxy::proxy::{AvailabilityStatus, Service, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

/// CONNECT for client id "c1", protocol MQTT level 4.
fn connect_packet() -> Vec<u8> {
    vec![
        0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x02, b'c',
        b'1',
    ]
}

const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

/// A fake broker: reports every first read and answers with a CONNACK, then
/// holds the connection open until the peer closes.
async fn spawn_broker(addr: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let listener = TcpListener::bind(addr).await.unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let _ = seen_tx.send(buf[..n].to_vec());
                let _ = stream.write_all(&CONNACK).await;
                let _ = stream.read(&mut buf).await;
            });
        }
    });
    seen_rx
}

#[tokio::test]
async fn single_healthy_backend_round_trip() {
    let mut broker = spawn_broker("127.0.0.1:19902").await;

    let config = load_str(
        r#"
proxy:
  services:
    broker:
      frontends:
        - address: mqtt://127.0.0.1:19901
          name: plain
      backends:
        - address: mqtt://127.0.0.1:19902
          name: b1
"#,
    )
    .unwrap();
    let metrics = Arc::new(ProxyMetrics::new());
    let supervisor = Supervisor::from_config(&config, Arc::clone(&metrics)).unwrap();
    let shutdown = supervisor.shutdown_handle();
    let run = tokio::spawn(supervisor.run());
    sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect("127.0.0.1:19901").await.unwrap();
    client.write_all(&connect_packet()).await.unwrap();

    // The broker receives the CONNECT byte-for-byte.
    let seen = timeout(Duration::from_secs(1), broker.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, connect_packet());

    // The client receives the CONNACK byte-for-byte.
    let mut connack = [0u8; 4];
    timeout(Duration::from_secs(1), client.read_exact(&mut connack))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connack, CONNACK);

    assert!(metrics.request_count("broker", "plain", "b1") >= 1);

    drop(client);
    shutdown.send(()).unwrap();
    timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn failover_to_reachable_backend() {
    // b1 has nothing listening; b2 answers.
    let mut broker = spawn_broker("127.0.0.1:19912").await;

    let config = load_str(
        r#"
proxy:
  services:
    broker:
      frontends:
        - address: mqtt://127.0.0.1:19911
      backends:
        - address: mqtt://127.0.0.1:19913
          name: b1
        - address: mqtt://127.0.0.1:19912
          name: b2
"#,
    )
    .unwrap();
    let metrics = Arc::new(ProxyMetrics::new());
    let service = Service::from_config("broker", &config.services["broker"], metrics)
        .unwrap()
        .unwrap();
    let backends: Vec<_> = service.backends().to_vec();

    let (shutdown_tx, _) = broadcast::channel(1);
    let run = tokio::spawn(Arc::clone(&service).run(shutdown_tx.clone()));
    sleep(Duration::from_millis(100)).await;

    // Every client ends up on b2: when the draw picks the dead backend the
    // dial fails, the tried set excludes it, and the retry lands on b2.
    let mut clients = Vec::new();
    for _ in 0..10 {
        let mut client = TcpStream::connect("127.0.0.1:19911").await.unwrap();
        client.write_all(&connect_packet()).await.unwrap();
        let mut connack = [0u8; 4];
        timeout(Duration::from_secs(2), client.read_exact(&mut connack))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connack, CONNACK);

        let seen = timeout(Duration::from_secs(1), broker.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, connect_packet());
        clients.push(client);
    }

    // Ten independent draws make it a statistical certainty that the dead
    // backend was tried; its health must reflect the failures.
    let b1 = backends.iter().find(|b| b.name() == "b1").unwrap();
    let availability = b1.availability();
    assert_eq!(availability.status, AvailabilityStatus::NotAvailable);
    assert!(availability.counter >= 1);

    drop(clients);
    shutdown_tx.send(()).unwrap();
    timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn all_backends_down_drops_client() {
    let config = load_str(
        r#"
proxy:
  services:
    broker:
      frontends:
        - address: mqtt://127.0.0.1:19921
      backends:
        - address: mqtt://127.0.0.1:19922
          name: b1
        - address: mqtt://127.0.0.1:19923
          name: b2
"#,
    )
    .unwrap();
    let supervisor = Supervisor::from_config(&config, Arc::new(ProxyMetrics::new())).unwrap();
    let shutdown = supervisor.shutdown_handle();
    let run = tokio::spawn(supervisor.run());
    sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect("127.0.0.1:19921").await.unwrap();
    client.write_all(&connect_packet()).await.unwrap();

    // The selector exhausts every tier and the client is closed without
    // receiving any traffic.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    shutdown.send(()).unwrap();
    timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn websocket_frontend_to_tcp_backend() {
    let mut broker = spawn_broker("127.0.0.1:19932").await;

    let config = load_str(
        r#"
proxy:
  services:
    broker:
      frontends:
        - address: ws://127.0.0.1:19931/mqtt
      backends:
        - address: mqtt://127.0.0.1:19932
"#,
    )
    .unwrap();
    let supervisor = Supervisor::from_config(&config, Arc::new(ProxyMetrics::new())).unwrap();
    let shutdown = supervisor.shutdown_handle();
    let run = tokio::spawn(supervisor.run());
    sleep(Duration::from_millis(100)).await;

    let mut request = "ws://127.0.0.1:19931/mqtt".into_client_request().unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        "mqtt".parse().unwrap(),
    );
    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok()),
        Some("mqtt")
    );

    // One binary message in; the plain-TCP broker sees exactly its bytes.
    ws.send(Message::binary(connect_packet())).await.unwrap();
    let seen = timeout(Duration::from_secs(1), broker.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, connect_packet());

    // The broker's CONNACK comes back as one binary message.
    let reply = timeout(Duration::from_secs(1), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.into_data(), CONNACK.to_vec());

    drop(ws);
    shutdown.send(()).unwrap();
    timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn route_by_client_cidr() {
    // Loopback clients match 127.0.0.0/8 and must reach b1, never b2.
    let mut b1 = spawn_broker("127.0.0.1:19942").await;
    let mut b2 = spawn_broker("127.0.0.1:19943").await;

    let config = load_str(
        r#"
proxy:
  services:
    broker:
      frontends:
        - address: mqtt://127.0.0.1:19941
      backends:
        - address: mqtt://127.0.0.1:19942
          name: b1
        - address: mqtt://127.0.0.1:19943
          name: b2
      routes:
        - { clientAddr: 127.0.0.0/8, backend: b1 }
        - { clientAddr: 0.0.0.0/0, backend: b2 }
"#,
    )
    .unwrap();
    let supervisor = Supervisor::from_config(&config, Arc::new(ProxyMetrics::new())).unwrap();
    let shutdown = supervisor.shutdown_handle();
    let run = tokio::spawn(supervisor.run());
    sleep(Duration::from_millis(100)).await;

    for _ in 0..3 {
        let mut client = TcpStream::connect("127.0.0.1:19941").await.unwrap();
        client.write_all(&connect_packet()).await.unwrap();
        let seen = timeout(Duration::from_secs(1), b1.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, connect_packet());
        let mut connack = [0u8; 4];
        client.read_exact(&mut connack).await.unwrap();
    }
    assert!(b2.try_recv().is_err());

    shutdown.send(()).unwrap();
    timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn graceful_shutdown_under_traffic() {
    let _broker = spawn_broker("127.0.0.1:19952").await;

    let config = load_str(
        r#"
proxy:
  services:
    broker:
      frontends:
        - address: mqtt://127.0.0.1:19951
      backends:
        - address: mqtt://127.0.0.1:19952
"#,
    )
    .unwrap();
    let supervisor = Supervisor::from_config(&config, Arc::new(ProxyMetrics::new())).unwrap();
    let shutdown = supervisor.shutdown_handle();
    let run = tokio::spawn(supervisor.run());
    sleep(Duration::from_millis(100)).await;

    // A fleet of clients mid-conversation.
    let mut clients = Vec::new();
    for _ in 0..100 {
        let mut client = TcpStream::connect("127.0.0.1:19951").await.unwrap();
        client.write_all(&connect_packet()).await.unwrap();
        clients.push(client);
    }
    for client in &mut clients {
        let mut connack = [0u8; 4];
        timeout(Duration::from_secs(2), client.read_exact(&mut connack))
            .await
            .unwrap()
            .unwrap();
    }

    shutdown.send(()).unwrap();
    timeout(Duration::from_secs(2), run)
        .await
        .expect("supervisor did not drain in time")
        .unwrap()
        .unwrap();

    // Every client connection is closed by the drain.
    for client in &mut clients {
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client connection not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}

#[tokio::test]
async fn packets_mode_round_trip() {
    let mut broker = spawn_broker("127.0.0.1:19962").await;

    let config = load_str(
        r#"
proxy:
  services:
    broker:
      proxyMode: packets
      frontends:
        - address: mqtt://127.0.0.1:19961
      backends:
        - address: mqtt://127.0.0.1:19962
"#,
    )
    .unwrap();
    let supervisor = Supervisor::from_config(&config, Arc::new(ProxyMetrics::new())).unwrap();
    let shutdown = supervisor.shutdown_handle();
    let run = tokio::spawn(supervisor.run());
    sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect("127.0.0.1:19961").await.unwrap();
    client.write_all(&connect_packet()).await.unwrap();

    let seen = timeout(Duration::from_secs(1), broker.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, connect_packet());

    let mut connack = [0u8; 4];
    timeout(Duration::from_secs(1), client.read_exact(&mut connack))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connack, CONNACK);

    drop(client);
    shutdown.send(()).unwrap();
    timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
