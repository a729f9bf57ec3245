//! Routing of inbound responses to listeners keyed by command identity.

use crate::command::HeosCommand;
use crate::error::{HeosError, Result};
use crate::protocol::Response;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

type Callback = Arc<dyn Fn(Arc<Response>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by listener registration, used with [`Dispatcher::remove`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Problems reported out of band while processing inbound traffic
#[derive(Debug, Clone)]
pub enum Fault {
    /// A line could not be decoded into a response; the session kept reading
    Decode { line: String, reason: String },

    /// A listener panicked; later listeners still ran
    Listener {
        listener: ListenerId,
        command: HeosCommand,
        reason: String,
    },
}

#[derive(Clone)]
enum Key {
    All,
    Command(HeosCommand),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Persistent,
    Once,
}

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    key: Key,
    mode: Mode,
    fired: Arc<AtomicBool>,
    callback: Callback,
}

struct DispatcherInner {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    fault_tx: broadcast::Sender<Fault>,
}

/// Invokes registered listeners for each delivered [`Response`]
///
/// Listeners are matched on command identity only, so attributes carried by
/// a response never affect routing. For every delivery, "all events"
/// listeners run first, then matching keyed listeners in registration order.
/// Each invocation is awaited before the next one starts.
///
/// Cloning a `Dispatcher` yields another handle to the same registrations.
///
/// # Example
///
/// ```
/// use heos_control::{Dispatcher, HeosCommand};
///
/// let events = Dispatcher::new();
/// let heartbeat: HeosCommand = "system/heart_beat".parse().unwrap();
/// events.on(heartbeat, |response| async move {
///     println!("heartbeat: {}", response.header.result);
/// });
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (fault_tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(DispatcherInner {
                registrations: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                fault_tx,
            }),
        }
    }

    /// Register a persistent listener for `key`
    pub fn on<F, Fut>(&self, key: HeosCommand, callback: F) -> ListenerId
    where
        F: Fn(Arc<Response>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Key::Command(key.identity()), Mode::Persistent, callback)
    }

    /// Register a listener that fires on the first matching delivery only
    pub fn once<F, Fut>(&self, key: HeosCommand, callback: F) -> ListenerId
    where
        F: Fn(Arc<Response>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Key::Command(key.identity()), Mode::Once, callback)
    }

    /// Register a persistent listener that fires for every delivery
    pub fn on_all<F, Fut>(&self, callback: F) -> ListenerId
    where
        F: Fn(Arc<Response>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Key::All, Mode::Persistent, callback)
    }

    /// Deregister a listener
    ///
    /// Returns `false` if it was already removed (or was a one-shot that fired).
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// Number of listeners currently registered
    pub fn listener_count(&self) -> usize {
        self.registrations().len()
    }

    /// Subscribe to decode and listener faults
    pub fn faults(&self) -> FaultReceiver {
        FaultReceiver::new(self.inner.fault_tx.subscribe())
    }

    /// Deliver a response to every matching listener
    pub async fn deliver(&self, response: Response) {
        self.deliver_shared(Arc::new(response)).await
    }

    /// Same as [`Dispatcher::deliver`] for an already shared response
    pub async fn deliver_shared(&self, response: Arc<Response>) {
        let (global, keyed): (Vec<Registration>, Vec<Registration>) = {
            let registrations = self.registrations();
            registrations
                .iter()
                .filter(|r| match &r.key {
                    Key::All => true,
                    Key::Command(cmd) => cmd == response.command(),
                })
                .cloned()
                .partition(|r| matches!(r.key, Key::All))
        };

        tracing::trace!(
            "Delivering {} to {} listener(s)",
            response.command(),
            global.len() + keyed.len()
        );

        for registration in global.iter().chain(keyed.iter()) {
            if registration.mode == Mode::Once {
                // Claim before invoking so a concurrent delivery cannot fire it too
                if registration.fired.swap(true, Ordering::AcqRel) {
                    continue;
                }
                self.remove(registration.id);
            }
            self.invoke(registration, Arc::clone(&response)).await;
        }
    }

    pub(crate) fn report(&self, fault: Fault) {
        let _ = self.inner.fault_tx.send(fault);
    }

    fn register<F, Fut>(&self, key: Key, mode: Mode, callback: F) -> ListenerId
    where
        F: Fn(Arc<Response>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Arc::new(move |response: Arc<Response>| callback(response).boxed());
        self.registrations().push(Registration {
            id,
            key,
            mode,
            fired: Arc::new(AtomicBool::new(false)),
            callback,
        });
        id
    }

    async fn invoke(&self, registration: &Registration, response: Arc<Response>) {
        let callback = &registration.callback;
        let shared = Arc::clone(&response);
        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| callback(shared))) {
            Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        if let Err(panic) = outcome {
            let reason = panic_message(panic.as_ref());
            tracing::warn!(
                "Listener {:?} for {} panicked: {}",
                registration.id,
                response.command(),
                reason
            );
            self.report(Fault::Listener {
                listener: registration.id,
                command: response.command().identity(),
                reason,
            });
        }
    }

    fn registrations(&self) -> MutexGuard<'_, Vec<Registration>> {
        // Listeners never run under this lock, so a poisoned guard is still consistent
        self.inner
            .registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Receiver for out-of-band faults
pub struct FaultReceiver {
    rx: broadcast::Receiver<Fault>,
}

impl FaultReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<Fault>) -> Self {
        Self { rx }
    }

    /// Receive the next fault
    pub async fn recv(&mut self) -> Result<Fault> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => HeosError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                HeosError::ChannelError(format!("Lagged by {} faults", n))
            }
        })
    }

    /// Try to receive a fault without blocking
    ///
    /// Returns `None` if no fault is pending.
    pub fn try_recv(&mut self) -> Result<Option<Fault>> {
        match self.rx.try_recv() {
            Ok(fault) => Ok(Some(fault)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(HeosError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(HeosError::ChannelError(format!("Lagged by {} faults", n)))
            }
        }
    }
}
