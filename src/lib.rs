//! Rust library for discovering and controlling HEOS networked audio devices
//!
//! This library provides an async API for the HEOS control protocol. It supports:
//!
//! - Discovery via SSDP M-SEARCH on the local network
//! - A persistent session to one device over TCP port 1255
//! - Line-delimited JSON responses routed to listeners by command identity
//! - Persistent, one-shot and catch-all listeners
//! - Sending commands, with or without waiting for the response
//!
//! # Quick Start
//!
//! ```no_run
//! use heos_control::{Discoverer, HeosClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let discoverer = Discoverer::new();
//!     let Some(ip) = discoverer.discover_one(Duration::from_secs(5)).await? else {
//!         println!("No HEOS device found");
//!         return Ok(());
//!     };
//!
//!     let client = HeosClient::new(ip);
//!     client.events().on("system/heart_beat".parse()?, |response| async move {
//!         println!("heartbeat: {}", response.header.result);
//!     });
//!
//!     client.connect().await?;
//!     client.send(&"system/heart_beat".parse()?).await?;
//!     client.wait().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Discovery**: SSDP probe and timeout-bounded response collection
//! - **Client**: Session lifecycle, sending and request/response
//! - **Connection**: Line framing and the background read loop
//! - **Dispatcher**: Listener registry keyed by command identity
//! - **Protocol**: JSON envelope and request line encoding
//! - **Command**: `group/command` identities and attributes
//! - **Transport**: Socket capability, swappable for tests

mod client;
mod command;
mod connection;
mod discovery;
mod dispatcher;
mod error;
mod protocol;
pub mod transport;

// Public exports
pub use client::{ClientConfig, HeosClient, SessionState, HEOS_PORT};
pub use command::{Attributes, HeosCommand};
pub use discovery::{Discoverer, DiscoveryConfig, DEFAULT_TIMEOUT, SEARCH_TARGET, SSDP_MULTICAST};
pub use dispatcher::{Dispatcher, Fault, FaultReceiver, ListenerId};
pub use error::{HeosError, Result};
pub use protocol::{encode_request, CommandResult, Header, Response, ResponseMessage};
pub use transport::{BoxedStream, DatagramSocket, TokioTransport, Transport};
