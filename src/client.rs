use crate::command::HeosCommand;
use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::error::{HeosError, Result};
use crate::protocol::{encode_request, Response};
use crate::transport::{TokioTransport, Transport};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// TCP port of the HEOS control protocol
pub const HEOS_PORT: u16 = 1255;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Session configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Device port
    pub port: u16,
    /// How long [`HeosClient::request`] waits for the final response
    pub request_timeout: Duration,
    /// Longest inbound line accepted; longer lines are dropped and reported
    pub max_line_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: HEOS_PORT,
            request_timeout: REQUEST_TIMEOUT,
            max_line_length: MAX_LINE_LENGTH,
        }
    }
}

/// Lifecycle of a session
///
/// `Closed` is terminal: a closed client cannot connect again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

struct ClientInner {
    address: IpAddr,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    state: Arc<watch::Sender<SessionState>>,
    connection: OnceLock<Connection>,
    closing: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get() {
            connection.abort();
        }
    }
}

/// Session with a single HEOS device
///
/// Owns one TCP connection and the background task reading from it. Every
/// inbound line is decoded and delivered to [`HeosClient::events`] in arrival
/// order; a slow listener delays reading of the next line.
///
/// The client is cheap to clone and all clones share the same session.
/// Listeners that capture a clone keep the session alive until
/// [`HeosClient::disconnect`] is called.
///
/// # Example
///
/// ```no_run
/// use heos_control::{HeosClient, HeosCommand};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = HeosClient::new("192.168.1.100".parse()?);
///     client.events().on("event/player_volume_changed".parse()?, |response| async move {
///         println!("volume changed: {}", response.header.message.raw());
///     });
///
///     client.connect().await?;
///     let players = client.request(&"player/get_players".parse::<HeosCommand>()?).await?;
///     println!("{:?}", players.payload);
///
///     client.wait().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct HeosClient {
    inner: Arc<ClientInner>,
}

impl HeosClient {
    /// Create a client for the device at `address` using real sockets
    pub fn new(address: IpAddr) -> Self {
        Self::with_options(address, ClientConfig::default(), Arc::new(TokioTransport))
    }

    /// Create a client on top of a custom transport
    pub fn with_transport(address: IpAddr, transport: Arc<dyn Transport>) -> Self {
        Self::with_options(address, ClientConfig::default(), transport)
    }

    /// Create a client with explicit configuration and transport
    pub fn with_options(
        address: IpAddr,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(ClientInner {
                address,
                config,
                transport,
                dispatcher: Dispatcher::new(),
                state: Arc::new(state),
                connection: OnceLock::new(),
                closing: CancellationToken::new(),
            }),
        }
    }

    /// Get the device's IP address
    pub fn address(&self) -> IpAddr {
        self.inner.address
    }

    /// Get the device port
    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    /// Listener registry fed by this session
    pub fn events(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Open the connection and start reading in the background
    ///
    /// Returns as soon as the socket is established. The session is marked
    /// connected before the first line is read. Use [`HeosClient::wait`] to
    /// await the end of the session, or [`HeosClient::run`] to do both.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_cancel(&CancellationToken::new()).await
    }

    /// Like [`HeosClient::connect`], giving up with [`HeosError::Cancelled`] if
    /// `cancel` fires before the socket is established
    ///
    /// A [`HeosClient::disconnect`] while connecting ends the attempt with
    /// [`HeosError::SessionClosed`] and the session stays closed.
    pub async fn connect_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        self.claim_connect()?;

        let addr = SocketAddr::new(self.inner.address, self.inner.config.port);
        tracing::info!("Connecting to {}", addr);

        let connected = tokio::select! {
            biased;
            _ = self.inner.closing.cancelled() => Err(HeosError::SessionClosed),
            _ = cancel.cancelled() => Err(HeosError::Cancelled),
            stream = self.inner.transport.connect(addr) => stream.map_err(HeosError::from),
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", addr, e);
                self.leave_connecting(SessionState::Idle);
                return Err(e);
            }
        };

        if !self.leave_connecting(SessionState::Connected) {
            tracing::info!("Session for {} closed while connecting", addr);
            return Err(HeosError::SessionClosed);
        }
        let connection = Connection::start(
            stream,
            self.inner.dispatcher.clone(),
            Arc::clone(&self.inner.state),
            self.inner.config.max_line_length,
        );
        if self.inner.connection.set(connection).is_err() {
            // claim_connect admits a single caller, so this is unreachable
            tracing::error!("Session for {} already had a connection", addr);
        }

        // disconnect may have run before the connection was stored
        if self.inner.closing.is_cancelled() {
            if let Some(connection) = self.inner.connection.get() {
                connection.abort();
            }
            self.inner.state.send_replace(SessionState::Closed);
            return Err(HeosError::SessionClosed);
        }

        tracing::info!("Connected to {}", addr);
        Ok(())
    }

    /// Wait until the read loop ends (device closed the stream, read error
    /// or [`HeosClient::disconnect`])
    ///
    /// Any number of callers may wait at once and all of them return when
    /// the loop ends. A read error is returned to the first caller only.
    pub async fn wait(&self) -> Result<()> {
        match self.inner.connection.get() {
            Some(connection) => connection.wait().await,
            None => Err(HeosError::NotConnected),
        }
    }

    /// Connect and stay inside the session until it ends
    pub async fn run(&self) -> Result<()> {
        self.connect().await?;
        self.wait().await
    }

    /// Like [`HeosClient::run`] with a cancellable connect phase
    pub async fn run_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        self.connect_with_cancel(cancel).await?;
        self.wait().await
    }

    /// Close the session
    ///
    /// A listener invocation in progress completes before the read loop stops.
    pub async fn disconnect(&self) {
        self.inner.closing.cancel();
        if let Some(connection) = self.inner.connection.get() {
            tracing::info!("Disconnecting from {}", self.inner.address);
            connection.close().await;
        }
        self.inner.state.send_replace(SessionState::Closed);
    }

    /// Send a command without waiting for its response
    pub async fn send(&self, command: &HeosCommand) -> Result<()> {
        let line = encode_request(command)?;
        let connection = self.live_connection()?;

        tracing::debug!("Sending: {}", line.trim_end());
        connection.send_line(&line).await
    }

    /// Send a command and wait for its response
    ///
    /// Interim "command under process" acknowledgements are skipped. A
    /// response with `result: fail` becomes [`HeosError::CommandFailed`].
    /// Responses are matched on command identity, so concurrent requests for
    /// the same command may observe each other's responses.
    ///
    /// Do not call this from inside a listener. The read loop awaits the
    /// listener before reading the next line, so the response cannot arrive
    /// and the call always ends with [`HeosError::Timeout`].
    pub async fn request(&self, command: &HeosCommand) -> Result<Arc<Response>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = self.inner.dispatcher.on(command.identity(), move |response| {
            let _ = tx.send(response);
            async {}
        });

        let outcome = self.await_response(command, &mut rx).await;
        self.inner.dispatcher.remove(listener);
        outcome
    }

    async fn await_response(
        &self,
        command: &HeosCommand,
        rx: &mut mpsc::UnboundedReceiver<Arc<Response>>,
    ) -> Result<Arc<Response>> {
        self.send(command).await?;

        let closed = wait_closed(self.inner.state.subscribe());
        tokio::pin!(closed);
        let deadline = tokio::time::sleep(self.inner.config.request_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                response = rx.recv() => {
                    let response = response.ok_or(HeosError::ConnectionClosed)?;
                    if response.is_under_process() {
                        tracing::debug!("{} is under process", command);
                        continue;
                    }
                    if !response.is_success() {
                        return Err(HeosError::CommandFailed {
                            command: command.to_string(),
                            message: response.header.message.raw().to_string(),
                        });
                    }
                    return Ok(response);
                }
                _ = &mut closed => return Err(HeosError::ConnectionClosed),
                _ = &mut deadline => return Err(HeosError::Timeout),
            }
        }
    }

    fn live_connection(&self) -> Result<&Connection> {
        if !self.is_connected() {
            return Err(HeosError::NotConnected);
        }
        self.inner.connection.get().ok_or(HeosError::NotConnected)
    }

    /// Move `Connecting` to `next`; returns `false` if the state moved on
    /// (the session was closed meanwhile)
    fn leave_connecting(&self, next: SessionState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Move `Idle` to `Connecting`, rejecting every other state
    fn claim_connect(&self) -> Result<()> {
        let mut current = SessionState::Idle;
        let claimed = self.inner.state.send_if_modified(|state| {
            current = *state;
            if *state == SessionState::Idle {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });

        match (claimed, current) {
            (true, _) => Ok(()),
            (false, SessionState::Closed) => Err(HeosError::SessionClosed),
            (false, _) => Err(HeosError::AlreadyConnected),
        }
    }
}

async fn wait_closed(mut rx: watch::Receiver<SessionState>) {
    loop {
        if *rx.borrow_and_update() == SessionState::Closed {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
