//! # mqproxy
//!
//! A multi-tenant reverse proxy for the MQTT publish/subscribe protocol.
//!
//! mqproxy terminates client connections arriving over plain MQTT (TCP),
//! secure MQTT (TLS), WebSocket or secure WebSocket, selects a live backend
//! broker per client, and shuttles MQTT control packets between the two
//! endpoints until either side closes.
//!
//! ## Features
//!
//! - Frontends and backends over `mqtt`, `mqtts`, `ws` and `wss`
//! - Weighted, health-aware backend selection with active/passive tiers
//! - Optional CIDR routing of clients to backends or backend groups
//! - Packet-aware forwarding (whole MQTT packets, never a split frame)
//! - Prometheus metrics for connection volume, request rate and latency
//!
//! ## Architecture
//!
//! Configuration ([`config`]) produces one [`proxy::Service`] per configured
//! service. Each service binds its frontends through the [`endpoint`] factory
//! registry, tracks backend health with [`proxy::AvailabilityCounter`], and
//! pumps traffic in whole MQTT packets. The [`proxy::Supervisor`] owns all
//! services and performs signal-driven graceful shutdown.

pub mod config;
pub mod endpoint;
pub mod logging;
pub mod metrics;
pub mod mqtt;
pub mod proxy;
pub mod tls;
