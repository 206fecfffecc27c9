use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::{
    net::TcpListener,
    runtime::{Builder, Runtime},
    sync::{
        Notify,
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    },
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::{
    registry::Registry,
    session::{self, SessionHandle},
    tls,
};

/// wall-clock budget for the TLS and WebSocket accept of one incoming
/// connection.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(4);

/// grace period for in-flight close handshakes when the runtime is torn
/// down.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// default high-water mark of the per-session inbound and outbound
/// queues.
pub const DEFAULT_QUEUE_LIMIT: usize = 1024;

/// A WebSocket server multiplexing up to `max_sessions` concurrent
/// sessions behind one port.
///
/// Admitted sessions get the smallest free id in `1..=max_sessions`; the
/// id is recycled when the session ends. The facade is synchronous and
/// thread-safe: the server owns a runtime that is built on [`start`] and
/// torn down on [`stop`], so a stopped server can be started again.
///
/// [`start`]: Server::start
/// [`stop`]: Server::stop
///
/// # Example
///
/// ```no_run
/// use ws_link::server::Server;
///
/// let server = Server::new(8080, 4);
/// server.start()?;
///
/// while server.is_running() {
///     for id in 1..=4 {
///         if server.check_inbox(id) {
///             let payload = server.read_message(id);
///             server.send_message(id, &payload);
///         }
///     }
/// }
/// # anyhow::Ok(())
/// ```
pub struct Server {
    port: u16,
    max_sessions: usize,
    tls: Option<Arc<ServerConfig>>,
    queue_limit: Option<usize>,
    runtime: Mutex<Option<Runtime>>,
    registry: Arc<Registry>,
    active: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

/// state shared with the accept loop, in one bundle.
struct AcceptOptions {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<Registry>,
    active: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    events: UnboundedSender<usize>,
    max_sessions: usize,
    queue_limit: Option<usize>,
}

impl Server {
    /// plain WebSocket server on `port`.
    pub fn new(port: u16, max_sessions: usize) -> Self {
        Self::build(port, max_sessions, None)
    }

    /// secure server that verifies client certificates against
    /// `authority`. Fails when any credential file is missing or
    /// malformed.
    pub fn with_tls(
        port: u16,
        max_sessions: usize,
        key: &str,
        certificate: &str,
        authority: &str,
    ) -> Result<Self> {
        Ok(Self::build(
            port,
            max_sessions,
            Some(tls::server_verified(key, certificate, authority)?),
        ))
    }

    /// secure server without peer verification; the bundled default
    /// certificate backs the handshake.
    pub fn with_tls_anonymous(port: u16, max_sessions: usize, key: &str) -> Result<Self> {
        Ok(Self::build(
            port,
            max_sessions,
            Some(tls::server_anonymous(key)?),
        ))
    }

    fn build(port: u16, max_sessions: usize, tls: Option<Arc<ServerConfig>>) -> Self {
        Self {
            port,
            max_sessions: max_sessions.max(1),
            tls,
            queue_limit: Some(DEFAULT_QUEUE_LIMIT),
            runtime: Mutex::new(None),
            registry: Arc::new(Registry::default()),
            active: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// adjust or disable (`None`) the per-session queue high-water mark.
    /// Applies to sessions admitted afterwards.
    pub fn queue_limit(mut self, limit: Option<usize>) -> Self {
        self.queue_limit = limit;
        self
    }

    /// bind the configured port and begin serving. A no-op when already
    /// running.
    ///
    /// Bind failures surface here, so two servers contending for one port
    /// resolve to a single listener and an error for the loser.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.runtime.lock();
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(self.max_sessions * 2)
            .thread_name("ws-link-server")
            .enable_all()
            .build()?;
        let listener = runtime.block_on(TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port)))?;

        self.registry.reset(self.max_sessions);
        self.active.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let (events_tx, events_rx) = unbounded_channel();
        runtime.spawn(reap_closed(
            events_rx,
            self.registry.clone(),
            self.active.clone(),
        ));
        runtime.spawn(accept_loop(AcceptOptions {
            listener,
            acceptor: self.tls.clone().map(TlsAcceptor::from),
            registry: self.registry.clone(),
            active: self.active.clone(),
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
            events: events_tx,
            max_sessions: self.max_sessions,
            queue_limit: self.queue_limit,
        }));
        *slot = Some(runtime);

        log::info!(
            "server listening: port={}, transport={}, max_sessions={}",
            self.port,
            self.transport_name(),
            self.max_sessions,
        );

        Ok(())
    }

    /// stop serving: cancel the acceptor, close every live session with a
    /// normal close, and tear the runtime down so the server can be
    /// started again. A no-op when not running; safe to call repeatedly.
    pub fn stop(&self) {
        let mut slot = self.runtime.lock();
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.shutdown.notify_one();
        for handle in self.registry.handles() {
            handle.shutdown(CloseCode::Normal);
        }

        if let Some(runtime) = slot.take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }

        self.registry.clear();
        self.active.store(0, Ordering::SeqCst);
        log::info!("server stopped: port={}", self.port);
    }

    /// queue `payload` for delivery to session `id`. Answers false when
    /// the id is not live.
    pub fn send_message(&self, id: usize, payload: &[u8]) -> bool {
        match self.registry.get(id) {
            Some(handle) if handle.is_alive() => {
                handle.push_outbound(payload.to_vec());
                true
            }
            _ => false,
        }
    }

    /// pop the oldest inbound payload of session `id`; empty when the id
    /// is unknown or its inbox is drained.
    pub fn read_message(&self, id: usize) -> Vec<u8> {
        self.registry
            .get(id)
            .map(|handle| handle.inbox.pop())
            .unwrap_or_default()
    }

    /// whether session `id` has payloads waiting to be read.
    pub fn check_inbox(&self, id: usize) -> bool {
        self.registry
            .get(id)
            .map(|handle| handle.inbox.non_empty())
            .unwrap_or(false)
    }

    /// whether session `id` is live. Ids are recycled on disconnect, so
    /// an id released by a concurrent peer close answers false here.
    pub fn check_session(&self, id: usize) -> bool {
        self.registry
            .get(id)
            .map(|handle| handle.is_alive())
            .unwrap_or(false)
    }

    /// close session `id` with a normal close. Unknown or already closed
    /// ids are a no-op.
    pub fn close_session(&self, id: usize) {
        if let Some(handle) = self.registry.get(id) {
            handle.shutdown(CloseCode::Normal);
        }
    }

    /// number of live sessions.
    pub fn sessions_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// whether the server is started.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// whether at least one session is being served.
    pub fn is_serving(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    fn transport_name(&self) -> &'static str {
        if self.tls.is_some() { "wss" } else { "ws" }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// serial accept loop: one connection is admitted and its handshake
/// driven to completion or to the deadline before the next accept is
/// armed, so a single admission is in flight at any time.
///
/// At capacity the incoming socket is dropped before any handshake, which
/// the rejected client observes as a failed WebSocket upgrade.
async fn accept_loop(
    AcceptOptions {
        listener,
        acceptor,
        registry,
        active,
        running,
        shutdown,
        events,
        max_sessions,
        queue_limit,
    }: AcceptOptions,
) {
    let port = listener.local_addr().map(|addr| addr.port()).unwrap_or(0);

    loop {
        let accepted = tokio::select! {
            _ = shutdown.notified() => {
                // a permit left over from an earlier stop is consumed
                // here without ending the current run.
                if running.load(Ordering::SeqCst) {
                    continue;
                }

                break;
            }
            accepted = listener.accept() => accepted,
        };
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let (socket, address) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                log::error!("accept failed: port={port}, err={error}");
                continue;
            }
        };

        if active.load(Ordering::SeqCst) >= max_sessions {
            log::warn!(
                "session limit reached, connection dropped: addr={address}, max_sessions={max_sessions}",
            );
            continue;
        }

        if let Err(error) = socket.set_nodelay(true) {
            log::error!("tcp socket set nodelay failed!: addr={address}, err={error}");
        }

        active.fetch_add(1, Ordering::SeqCst);
        let Some(id) = registry.allocate() else {
            // the pool can be empty only while a teardown is settling;
            // the connection is treated as one over capacity.
            active.fetch_sub(1, Ordering::SeqCst);
            continue;
        };

        match timeout(HANDSHAKE_DEADLINE, session::open(socket, acceptor.clone())).await {
            Ok(Ok(stream)) if running.load(Ordering::SeqCst) => {
                let (sink, source) = stream.split();
                let (signal_tx, signal_rx) = unbounded_channel();
                let handle = SessionHandle::new(id, queue_limit, signal_tx, events.clone());
                registry.insert(id, handle.clone());
                tokio::spawn(session::write_loop(sink, handle.clone(), signal_rx));
                tokio::spawn(session::read_loop(source, handle));
                log::info!("session connected: id={id}, addr={address}");
            }
            Ok(Ok(_)) => {
                // stopped while the handshake was in flight.
                registry.release(id);
                active.fetch_sub(1, Ordering::SeqCst);
                break;
            }
            Ok(Err(error)) => {
                registry.release(id);
                active.fetch_sub(1, Ordering::SeqCst);
                log::warn!("session handshake failed: addr={address}, err={error}");
            }
            Err(_) => {
                registry.release(id);
                active.fetch_sub(1, Ordering::SeqCst);
                log::warn!(
                    "session handshake timed out: addr={address}, deadline={HANDSHAKE_DEADLINE:?}",
                );
            }
        }
    }
}

/// removes finished sessions from the registry, recycles their ids, and
/// keeps the active counter in step.
async fn reap_closed(
    mut events: UnboundedReceiver<usize>,
    registry: Arc<Registry>,
    active: Arc<AtomicUsize>,
) {
    while let Some(id) = events.recv().await {
        if registry.discard(id) {
            active.fetch_sub(1, Ordering::SeqCst);
            log::info!("session closed: id={id}");
        }
    }
}
