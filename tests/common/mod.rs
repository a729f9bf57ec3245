//! Scripted transport shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use heos_control::{BoxedStream, DatagramSocket, Transport, SEARCH_TARGET};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::Notify;

/// One scripted outcome of `recv_from`
#[derive(Debug, Clone)]
pub enum Scripted {
    Datagram(Vec<u8>, SocketAddr),
    Error(io::ErrorKind),
}

/// Datagram from `ip` whose body announces the HEOS search target
pub fn heos_reply(ip: &str) -> Scripted {
    let body = format!(
        "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=180\r\nST: {}\r\nUSN: uuid:0001::{}\r\n\r\n",
        SEARCH_TARGET, SEARCH_TARGET
    );
    Scripted::Datagram(body.into_bytes(), addr(ip))
}

/// Datagram from `ip` announcing some other device family
pub fn other_reply(ip: &str) -> Scripted {
    let body = "HTTP/1.1 200 OK\r\nST: urn:schemas-upnp-org:device:ZonePlayer:1\r\n\r\n";
    Scripted::Datagram(body.as_bytes().to_vec(), addr(ip))
}

fn addr(ip: &str) -> SocketAddr {
    SocketAddr::new(ip.parse().unwrap(), 1900)
}

/// Transport whose sockets replay a script
///
/// Every `bind` gets a fresh copy of the datagram script; once it runs out,
/// `recv_from` never completes, like a silent network. `connect` hands out the
/// configured stream once and otherwise never completes. A gated transport
/// holds every `connect` until the gate is notified.
#[derive(Default)]
pub struct StubTransport {
    script: Vec<Scripted>,
    stream: Mutex<Option<DuplexStream>>,
    sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
    connected_to: Mutex<Vec<SocketAddr>>,
    gate: Option<Arc<Notify>>,
    refuse: bool,
}

impl StubTransport {
    pub fn with_datagrams(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Self::default()
        })
    }

    pub fn with_stream(stream: DuplexStream) -> Arc<Self> {
        Arc::new(Self {
            stream: Mutex::new(Some(stream)),
            ..Self::default()
        })
    }

    /// Like [`StubTransport::with_stream`], but `connect` waits for `gate`
    pub fn gated(stream: DuplexStream, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            stream: Mutex::new(Some(stream)),
            gate: Some(gate),
            ..Self::default()
        })
    }

    /// `connect` waits for `gate`, then fails with `ConnectionRefused`
    pub fn refusing(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            refuse: true,
            ..Self::default()
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Datagrams sent through any socket of this transport
    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }

    /// Addresses passed to `connect`
    pub fn connected_to(&self) -> Vec<SocketAddr> {
        self.connected_to.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedStream> {
        self.connected_to.lock().unwrap().push(addr);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.refuse {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        let stream = self.stream.lock().unwrap().take();
        match stream {
            Some(stream) => Ok(Box::new(stream)),
            None => std::future::pending().await,
        }
    }

    async fn bind(&self, _local: SocketAddr) -> io::Result<Box<dyn DatagramSocket>> {
        Ok(Box::new(StubSocket {
            queue: Mutex::new(self.script.iter().cloned().collect()),
            sent: Arc::clone(&self.sent),
        }))
    }
}

struct StubSocket {
    queue: Mutex<VecDeque<Scripted>>,
    sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
}

#[async_trait]
impl DatagramSocket for StubSocket {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.sent.lock().unwrap().push((payload.to_vec(), target));
        Ok(payload.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let next = self.queue.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Datagram(data, from)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, from))
            }
            Some(Scripted::Error(kind)) => Err(io::Error::from(kind)),
            None => std::future::pending().await,
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
