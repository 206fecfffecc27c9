use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::TcpStream,
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        Error as WsError, Message,
        handshake::server::{Request, Response},
        http::{HeaderValue, header::SERVER},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::{
    queue::MessageQueue,
    stream::{Transport, WsStream},
};

/// orders consumed by a connection's writer loop.
pub(crate) enum Signal {
    /// drain the outbound queue onto the wire.
    Flush,
    /// put a close frame with the given code on the wire and finish.
    Close(CloseCode),
}

/// shared view of one accepted session, held by the registry and by the
/// session's reader and writer loops.
///
/// The liveness flag is true from a completed open handshake until the
/// first shutdown call; everything after that first call is a no-op.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub id: usize,
    pub inbox: Arc<MessageQueue>,
    pub outbox: Arc<MessageQueue>,
    alive: Arc<AtomicBool>,
    signal: UnboundedSender<Signal>,
    events: UnboundedSender<usize>,
}

impl SessionHandle {
    pub fn new(
        id: usize,
        queue_limit: Option<usize>,
        signal: UnboundedSender<Signal>,
        events: UnboundedSender<usize>,
    ) -> Self {
        Self {
            id,
            inbox: Arc::new(MessageQueue::new(queue_limit)),
            outbox: Arc::new(MessageQueue::new(queue_limit)),
            alive: Arc::new(AtomicBool::new(true)),
            signal,
            events,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// queue an outbound payload and wake the writer loop.
    pub fn push_outbound(&self, payload: Vec<u8>) {
        self.outbox.push(payload);
        let _ = self.signal.send(Signal::Flush);
    }

    /// idempotent teardown. The first caller flips the liveness flag,
    /// requests the close frame, and reports the exit to the server.
    pub fn shutdown(&self, code: CloseCode) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let _ = self.signal.send(Signal::Close(code));
            let _ = self.events.send(self.id);
        }
    }

    #[cfg(test)]
    pub fn stub(id: usize) -> Self {
        let (signal, _) = tokio::sync::mpsc::unbounded_channel();
        let (events, _) = tokio::sync::mpsc::unbounded_channel();
        Self::new(id, None, signal, events)
    }
}

/// run the open handshake for an accepted socket: the TLS accept when an
/// acceptor is configured, then the WebSocket upgrade with an identifying
/// response header.
pub(crate) async fn open(
    socket: TcpStream,
    acceptor: Option<TlsAcceptor>,
) -> Result<WsStream, WsError> {
    let transport = match acceptor {
        Some(acceptor) => Transport::Tls(Box::new(acceptor.accept(socket).await?.into())),
        None => Transport::Plain(socket),
    };

    accept_hdr_async(transport, |_request: &Request, mut response: Response| {
        response.headers_mut().insert(
            SERVER,
            HeaderValue::from_static(concat!("ws-link/", env!("CARGO_PKG_VERSION"))),
        );
        Ok(response)
    })
    .await
}

/// self-re-arming read loop. Every non-empty payload lands in the inbox
/// in wire order; empty frames and control frames re-arm the read without
/// queueing anything. Peer close and end-of-file finish the session
/// gracefully, any other failure is a protocol error.
pub(crate) async fn read_loop(mut source: SplitStream<WsStream>, handle: SessionHandle) {
    loop {
        match source.next().await {
            Some(Ok(message)) => match message {
                Message::Binary(_) | Message::Text(_) => {
                    let payload = message.into_data();
                    if payload.is_empty() {
                        continue;
                    }

                    handle.inbox.push(payload.to_vec());
                }
                Message::Close(_) => {
                    handle.shutdown(CloseCode::Normal);
                    break;
                }
                // ping/pong bookkeeping stays inside the protocol layer.
                _ => {}
            },
            Some(Err(error)) => {
                handle.shutdown(close_code(&error));
                break;
            }
            None => {
                handle.shutdown(CloseCode::Normal);
                break;
            }
        }
    }
}

/// single-writer loop. `Flush` drains the outbound queue in submission
/// order, `Close` ends the task after the close frame is on the wire.
pub(crate) async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    handle: SessionHandle,
    mut signals: UnboundedReceiver<Signal>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            Signal::Flush => {
                while let Some(payload) = handle.outbox.pop_front() {
                    if let Err(error) = sink.send(Message::Binary(payload.into())).await {
                        handle.shutdown(close_code(&error));
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

/// map a stream error onto the close code a session reports: peer close
/// and end-of-file end normally, everything else is a protocol error.
pub(crate) fn close_code(error: &WsError) -> CloseCode {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => CloseCode::Normal,
        WsError::Io(source) if source.kind() == std::io::ErrorKind::UnexpectedEof => {
            CloseCode::Normal
        }
        _ => CloseCode::Protocol,
    }
}
