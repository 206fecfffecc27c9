use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parking_lot::Mutex;
use tokio::{
    net::TcpStream,
    runtime::{Builder, Runtime},
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::timeout,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, pki_types::ServerName},
};
use tokio_tungstenite::{
    client_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::USER_AGENT},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::{
    queue::MessageQueue,
    server::DEFAULT_QUEUE_LIMIT,
    session::{Signal, close_code},
    stream::{Transport, WsStream},
    tls,
};

/// wall-clock budget for the whole connect chain: resolve, TCP, TLS and
/// the WebSocket upgrade.
const CONNECT_DEADLINE: Duration = Duration::from_secs(30);

/// grace period for the close handshake when the runtime is torn down.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// A WebSocket client driving one outbound connection at a time.
///
/// The facade is synchronous: the client owns a two-worker runtime that
/// is built on [`connect`] and torn down by [`disconnect`] or [`reset`],
/// so the same object is reusable across connections. A connection that
/// ends without a user disconnect (peer close, protocol error, failed
/// connect) raises the failure flag; the next [`connect`] resets the
/// client implicitly.
///
/// [`connect`]: Client::connect
/// [`disconnect`]: Client::disconnect
/// [`reset`]: Client::reset
pub struct Client {
    tls: Option<Arc<ClientConfig>>,
    runtime: Mutex<Option<Runtime>>,
    link: Arc<Link>,
}

/// connection state shared with the reader and writer loops.
struct Link {
    connected: AtomicBool,
    failed: AtomicBool,
    inbox: MessageQueue,
    outbox: MessageQueue,
    signal: Mutex<Option<UnboundedSender<Signal>>>,
    endpoint: Mutex<Option<(String, u16)>>,
}

impl Link {
    fn new(queue_limit: Option<usize>) -> Self {
        Self {
            connected: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            inbox: MessageQueue::new(queue_limit),
            outbox: MessageQueue::new(queue_limit),
            signal: Mutex::new(None),
            endpoint: Mutex::new(None),
        }
    }

    /// record a connection attempt or a live connection as failed: the
    /// queues and endpoint are wiped and the failure flag demands a reset
    /// before the next dial.
    fn mark_failed(&self) {
        self.inbox.clear();
        self.outbox.clear();
        *self.endpoint.lock() = None;
        self.failed.store(true, Ordering::SeqCst);
    }

    /// teardown driven from the loops: the first caller puts the close
    /// frame on the wire and marks the failure.
    fn drop_link(&self, code: CloseCode) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Some(signal) = self.signal.lock().as_ref() {
                let _ = signal.send(Signal::Close(code));
            }

            self.mark_failed();
        }
    }
}

impl Client {
    /// plain WebSocket client.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// secure client that verifies the server against `authority` and
    /// presents its own certificate. Fails when any credential file is
    /// missing or malformed.
    pub fn with_tls(key: &str, certificate: &str, authority: &str) -> Result<Self> {
        Ok(Self::build(Some(tls::client_verified(
            key,
            certificate,
            authority,
        )?)))
    }

    /// secure client without peer verification; the channel is encrypted
    /// but the server certificate goes unchecked.
    pub fn with_tls_anonymous(key: &str) -> Result<Self> {
        Ok(Self::build(Some(tls::client_anonymous(key)?)))
    }

    fn build(tls: Option<Arc<ClientConfig>>) -> Self {
        Self {
            tls,
            runtime: Mutex::new(None),
            link: Arc::new(Link::new(Some(DEFAULT_QUEUE_LIMIT))),
        }
    }

    /// adjust or disable (`None`) the queue high-water mark. Applies from
    /// the next connection.
    pub fn queue_limit(mut self, limit: Option<usize>) -> Self {
        self.link = Arc::new(Link::new(limit));
        self
    }

    /// connect to `host:port`.
    ///
    /// Naming the endpoint the client is already attached to succeeds
    /// immediately; naming a different endpoint while connected fails
    /// without touching the live connection. A pending failure is reset
    /// implicitly. The whole chain runs under a 30 second deadline, and
    /// any error leaves the client disconnected with the failure flag
    /// raised.
    pub fn connect(&self, host: &str, port: u16) -> bool {
        let mut slot = self.runtime.lock();
        if self.link.connected.load(Ordering::SeqCst) {
            let endpoint = self.link.endpoint.lock();
            return matches!(endpoint.as_ref(), Some((h, p)) if h == host && *p == port);
        }

        self.reset_inner(&mut slot);

        let runtime = match Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ws-link-client")
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => {
                log::error!("client runtime build failed: err={error}");
                self.link.mark_failed();
                return false;
            }
        };

        let _guard = runtime.enter();
        match runtime.block_on(timeout(
            CONNECT_DEADLINE,
            establish(host, port, self.tls.clone()),
        )) {
            Ok(Ok(stream)) => {
                let (sink, source) = stream.split();
                let (signal_tx, signal_rx) = unbounded_channel();
                *self.link.signal.lock() = Some(signal_tx);
                *self.link.endpoint.lock() = Some((host.to_string(), port));
                self.link.connected.store(true, Ordering::SeqCst);
                self.link.failed.store(false, Ordering::SeqCst);
                runtime.spawn(write_loop(sink, self.link.clone(), signal_rx));
                runtime.spawn(read_loop(source, self.link.clone()));
                *slot = Some(runtime);
                log::info!("client connected: host={host}, port={port}");
                true
            }
            Ok(Err(error)) => {
                log::warn!("client connect failed: host={host}, port={port}, err={error}");
                runtime.shutdown_background();
                self.link.mark_failed();
                false
            }
            Err(_) => {
                log::warn!(
                    "client connect timed out: host={host}, port={port}, deadline={CONNECT_DEADLINE:?}",
                );
                runtime.shutdown_background();
                self.link.mark_failed();
                false
            }
        }
    }

    /// gracefully close the connection and rebuild the client for reuse.
    /// A no-op when not connected.
    pub fn disconnect(&self) {
        let mut slot = self.runtime.lock();
        if !self.link.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        let signal = self.link.signal.lock().take();
        if let Some(signal) = signal {
            let _ = signal.send(Signal::Close(CloseCode::Normal));
        }

        if let Some(runtime) = slot.take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }

        self.link.inbox.clear();
        self.link.outbox.clear();
        *self.link.endpoint.lock() = None;
        self.link.failed.store(false, Ordering::SeqCst);
        log::info!("client disconnected");
    }

    /// recover from a failed connection so the client can dial again.
    /// Called implicitly by [`connect`](Client::connect); a no-op unless
    /// a failure is pending.
    pub fn reset(&self) {
        let mut slot = self.runtime.lock();
        self.reset_inner(&mut slot);
    }

    fn reset_inner(&self, slot: &mut Option<Runtime>) {
        if !self.link.failed.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(runtime) = slot.take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }

        self.link.inbox.clear();
        self.link.outbox.clear();
        *self.link.signal.lock() = None;
        *self.link.endpoint.lock() = None;
    }

    /// queue a payload for the server. A no-op when not connected.
    pub fn send_message(&self, payload: &[u8]) {
        if !self.link.connected.load(Ordering::SeqCst) {
            return;
        }

        self.link.outbox.push(payload.to_vec());
        if let Some(signal) = self.link.signal.lock().as_ref() {
            let _ = signal.send(Signal::Flush);
        }
    }

    /// pop the oldest payload received from the server; empty when the
    /// inbox is drained.
    pub fn read_message(&self) -> Vec<u8> {
        self.link.inbox.pop()
    }

    /// whether payloads are waiting to be read.
    pub fn check_inbox(&self) -> bool {
        self.link.inbox.non_empty()
    }

    /// whether the client is attached to a server.
    pub fn check_connection(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    /// whether the last connection ended without a user disconnect.
    pub fn check_failed_connection(&self) -> bool {
        self.link.failed.load(Ordering::SeqCst)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// resolve and dial the endpoint, upgrade to TLS when configured, and
/// run the WebSocket client handshake with an identifying request
/// header. The host string doubles as the SNI name for TLS.
async fn establish(host: &str, port: u16, tls: Option<Arc<ClientConfig>>) -> Result<WsStream> {
    let socket = TcpStream::connect((host, port)).await?;
    if let Err(error) = socket.set_nodelay(true) {
        log::error!("tcp socket set nodelay failed!: host={host}, err={error}");
    }

    let (scheme, transport) = match tls {
        Some(config) => {
            let name = ServerName::try_from(host.to_string())?;
            let stream = TlsConnector::from(config).connect(name, socket).await?;
            ("wss", Transport::Tls(Box::new(stream.into())))
        }
        None => ("ws", Transport::Plain(socket)),
    };

    let mut request = format!("{scheme}://{host}:{port}").into_client_request()?;
    request.headers_mut().insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("ws-link/", env!("CARGO_PKG_VERSION"))),
    );

    let (stream, _response) = client_async(request, transport).await?;
    Ok(stream)
}

/// the session read loop mirrored onto the client: non-empty payloads
/// land in the inbox in wire order, peer close and end-of-file drop the
/// link gracefully, anything else drops it as a protocol error.
async fn read_loop(mut source: SplitStream<WsStream>, link: Arc<Link>) {
    loop {
        match source.next().await {
            Some(Ok(message)) => match message {
                Message::Binary(_) | Message::Text(_) => {
                    let payload = message.into_data();
                    if payload.is_empty() {
                        continue;
                    }

                    link.inbox.push(payload.to_vec());
                }
                Message::Close(_) => {
                    link.drop_link(CloseCode::Normal);
                    break;
                }
                _ => {}
            },
            Some(Err(error)) => {
                link.drop_link(close_code(&error));
                break;
            }
            None => {
                link.drop_link(CloseCode::Normal);
                break;
            }
        }
    }
}

/// the session write loop mirrored onto the client.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    link: Arc<Link>,
    mut signals: UnboundedReceiver<Signal>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            Signal::Flush => {
                while let Some(payload) = link.outbox.pop_front() {
                    if let Err(error) = sink.send(Message::Binary(payload.into())).await {
                        link.drop_link(close_code(&error));
                        return;
                    }
                }
            }
            Signal::Close(code) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: "".into(),
                    })))
                    .await;
                let _ = sink.flush().await;
                return;
            }
        }
    }
}
