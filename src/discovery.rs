use crate::error::Result;
use crate::transport::{DatagramSocket, TokioTransport, Transport};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// SSDP search target announced by HEOS devices
pub const SEARCH_TARGET: &str = "urn:schemas-denon-com:device:ACT-Denon:1";

/// Standard SSDP multicast group and port
pub const SSDP_MULTICAST: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900));

/// Default discovery window
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const BIND_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

/// Configuration for SSDP discovery
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Search target sent in the probe and required in every accepted response
    pub search_target: String,
    /// Where the probe is sent
    pub probe_endpoint: SocketAddr,
    /// MX value (max response delay in seconds)
    pub mx: u32,
    /// Receive buffer size; longer datagrams are truncated
    pub max_datagram: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            search_target: SEARCH_TARGET.to_string(),
            probe_endpoint: SSDP_MULTICAST,
            mx: 5,
            max_datagram: 2048,
        }
    }
}

/// Finds HEOS devices on the local network using an SSDP M-SEARCH probe
///
/// Each call binds its own ephemeral socket, so concurrent discoveries
/// never share state.
///
/// # Example
///
/// ```no_run
/// use heos_control::Discoverer;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let discoverer = Discoverer::new();
///     for ip in discoverer.discover_devices(Duration::from_secs(3), None).await? {
///         println!("Found HEOS device at {}", ip);
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Discoverer {
    transport: Arc<dyn Transport>,
    config: DiscoveryConfig,
}

impl Discoverer {
    /// Create a discoverer using real sockets and the default configuration
    pub fn new() -> Self {
        Self::with_transport(Arc::new(TokioTransport))
    }

    /// Create a discoverer on top of a custom transport
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: DiscoveryConfig::default(),
        }
    }

    /// Replace the discovery configuration
    pub fn with_config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Find one device, returning the first responder
    ///
    /// Returns `None` if nothing answered within `timeout`.
    pub async fn discover_one(&self, timeout: Duration) -> Result<Option<IpAddr>> {
        self.discover_one_at(timeout, self.config.probe_endpoint).await
    }

    /// Find one device, sending the probe to `endpoint` instead of the configured one
    pub async fn discover_one_at(
        &self,
        timeout: Duration,
        endpoint: SocketAddr,
    ) -> Result<Option<IpAddr>> {
        let found = self.discover_at(timeout, Some(1), endpoint).await?;
        Ok(found.into_iter().next())
    }

    /// Discover devices within `timeout`
    ///
    /// Stops early once `max_devices` distinct devices have answered.
    /// Addresses are returned in the order their first response arrived.
    /// A silent network yields an empty list, not an error.
    pub async fn discover_devices(
        &self,
        timeout: Duration,
        max_devices: Option<usize>,
    ) -> Result<Vec<IpAddr>> {
        self.discover_at(timeout, max_devices, self.config.probe_endpoint)
            .await
    }

    async fn discover_at(
        &self,
        timeout: Duration,
        max_devices: Option<usize>,
        endpoint: SocketAddr,
    ) -> Result<Vec<IpAddr>> {
        if max_devices == Some(0) {
            return Ok(Vec::new());
        }

        let socket = self.transport.bind(BIND_ADDR).await?;
        let probe = build_probe(&self.config);
        let timer = sleep(timeout);

        socket.send_to(probe.as_bytes(), endpoint).await?;
        tracing::debug!("Sent M-SEARCH to {}", endpoint);

        let mut found = AddressSet::default();
        {
            let receive =
                receive_responses(socket.as_ref(), &self.config, max_devices, &mut found);

            // The losing branch is dropped here, which cancels any pending receive
            tokio::select! {
                biased;
                _ = timer => {
                    tracing::debug!("Discovery window of {:?} elapsed", timeout);
                }
                _ = receive => {
                    tracing::debug!("Discovery receive loop finished early");
                }
            }
        }
        drop(socket);

        tracing::info!("Discovery complete: {} device(s) found", found.len());
        Ok(found.into_vec())
    }
}

impl Default for Discoverer {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the M-SEARCH probe
///
/// HOST always names the multicast group, even when the probe goes elsewhere.
fn build_probe(config: &DiscoveryConfig) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         ST: {}\r\n\
         MX: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         \r\n",
        config.search_target, config.mx
    )
}

/// Receive until the device cap is reached or the socket fails
async fn receive_responses(
    socket: &dyn DatagramSocket,
    config: &DiscoveryConfig,
    max_devices: Option<usize>,
    found: &mut AddressSet,
) {
    let mut buf = vec![0u8; config.max_datagram];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!("Discovery receive ended: {}", e);
                return;
            }
        };

        let text = String::from_utf8_lossy(&buf[..len]);
        if text.contains(config.search_target.as_str()) {
            if found.insert(src.ip()) {
                tracing::info!("Found HEOS device at {}", src.ip());
            }
        } else {
            tracing::trace!("Ignoring non-matching response from {}", src);
        }

        if max_devices.is_some_and(|max| found.len() >= max) {
            return;
        }
    }
}

/// Deduplicated addresses in arrival order
#[derive(Debug, Default)]
struct AddressSet {
    order: Vec<IpAddr>,
    seen: HashSet<IpAddr>,
}

impl AddressSet {
    fn insert(&mut self, ip: IpAddr) -> bool {
        if self.seen.insert(ip) {
            self.order.push(ip);
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn into_vec(self) -> Vec<IpAddr> {
        self.order
    }
}
