use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use rustls::{
    pki_types::{CertificateDer, ServerName},
    ClientConfig,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tlsecho_common::{
    codec::{read_frame, write_frame},
    CallContext, EchoError, Frame, Status,
};
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_rustls::{client::TlsStream, TlsConnector};

/// Requests buffered for the writer task.
const OUTBOUND_QUEUE: usize = 64;

/// How long `close` waits for queued frames and close_notify to go out.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type Stream = TlsStream<TcpStream>;
type Reply = Result<Value, Status>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Splits `host:port` (or `[v6]:port`) and returns the host as a TLS server
/// name.
pub fn server_name_for(endpoint: &str) -> Result<ServerName<'static>, EchoError> {
    let invalid = |reason: &str| EchoError::Connect {
        endpoint: endpoint.to_string(),
        source:   io::Error::new(io::ErrorKind::InvalidInput, reason.to_string()),
    };

    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| invalid("endpoint must be host:port"))?;
    if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid("endpoint port is not a number"));
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    ServerName::try_from(host.to_string()).map_err(|_| invalid("invalid server name"))
}

/// One live, encrypted connection to a server.
///
/// Calls are multiplexed by request id, so any number of them can be in
/// flight at once through `&self`. A call that times out or is cancelled
/// releases only its own slot; the connection stays usable. Dropping the
/// channel tears the connection down; [`Channel::close`] does it gracefully.
pub struct Channel {
    endpoint:         String,
    outbound:         mpsc::Sender<Frame>,
    pending:          Pending,
    closed:           Arc<AtomicBool>,
    next_id:          AtomicU64,
    peer_certificate: Option<CertificateDer<'static>>,
    close_tx:         Option<oneshot::Sender<()>>,
    reader:           JoinHandle<()>,
    writer:           Option<JoinHandle<()>>,
}

impl Channel {
    /// Opens a TCP connection to `endpoint` and completes the TLS handshake
    /// against `config`. The host part of the endpoint is the expected
    /// server name.
    pub async fn connect(endpoint: &str, config: Arc<ClientConfig>) -> Result<Self, EchoError> {
        let server_name = server_name_for(endpoint)?;
        let connect_error = |source| EchoError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };

        tracing::debug!("Connecting to {}", endpoint);
        let tcp = TcpStream::connect(endpoint).await.map_err(connect_error)?;
        tcp.set_nodelay(true).map_err(connect_error)?;

        tracing::debug!("Socket connected, establishing TLS...");
        let stream = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(connect_error)?;

        let peer_certificate = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|cert| cert.clone().into_owned());

        tracing::info!("Secure connection established with {}", endpoint);
        Ok(Self::start(endpoint.to_string(), stream, peer_certificate))
    }

    fn start(
        endpoint: String,
        stream: Stream,
        peer_certificate: Option<CertificateDer<'static>>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (outbound, frames) = mpsc::channel(OUTBOUND_QUEUE);
        let (close_tx, close_rx) = oneshot::channel();

        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));
        let writer = tokio::spawn(write_loop(write_half, frames, close_rx));

        Self {
            endpoint,
            outbound,
            pending,
            closed,
            next_id: AtomicU64::new(1),
            peer_certificate,
            close_tx: Some(close_tx),
            reader,
            writer: Some(writer),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// End-entity certificate the server presented during the handshake.
    pub fn peer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.peer_certificate.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends one request to `method` and waits for its reply, the context's
    /// deadline, or its cancellation, whichever comes first. The request is
    /// sent exactly once.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        ctx: &CallContext,
    ) -> Result<Resp, EchoError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(Status::unavailable("channel is closed").into());
        }
        let payload = serde_json::to_value(request)
            .map_err(|e| Status::internal(format!("failed to encode request: {e}")))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, reply_tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };
        // the reader may have failed between the check above and the insert
        if self.is_closed() {
            return Err(Status::unavailable("channel is closed").into());
        }

        let frame = Frame::Request {
            id,
            method: method.to_string(),
            timeout_ms: ctx
                .remaining()
                .map(|left| u64::try_from(left.as_millis()).unwrap_or(u64::MAX)),
            payload,
        };
        // a full outbound queue must not hold the caller past its deadline
        tokio::select! {
            sent = self.outbound.send(frame) => {
                if sent.is_err() {
                    return Err(Status::unavailable("connection closed").into());
                }
            }
            _ = ctx.cancelled() => {
                tracing::debug!(id, "Call gave up before its request was queued");
                return Err(abandoned(ctx));
            }
        }

        tokio::select! {
            reply = reply_rx => match reply {
                Ok(Ok(payload)) => serde_json::from_value(payload).map_err(|e| {
                    Status::internal(format!("malformed reply from server: {e}")).into()
                }),
                Ok(Err(status)) => Err(status.into()),
                Err(_) => Err(Status::unavailable("connection closed before a reply arrived").into()),
            },
            _ = ctx.cancelled() => {
                // best effort; the server also sees the propagated deadline
                let _ = self.outbound.try_send(Frame::Cancel { id });
                Err(abandoned(ctx))
            }
        }
    }

    /// Flushes queued frames, sends close_notify and stops the connection.
    pub async fn close(mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                tracing::warn!("Timed out closing connection to {}", self.endpoint);
            }
        }
        tracing::info!("Disconnected from {}", self.endpoint);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Error for a call whose context fired before a reply arrived.
fn abandoned(ctx: &CallContext) -> EchoError {
    if ctx.deadline_elapsed() {
        tracing::debug!("Call exceeded its deadline");
        EchoError::DeadlineExceeded(ctx.timeout().unwrap_or_default())
    } else {
        Status::cancelled("call cancelled by caller").into()
    }
}

/// Removes a call's reply slot however the call ends, including when the
/// caller drops the future.
struct PendingSlot<'a> {
    pending: &'a Pending,
    id:      u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

async fn read_loop(mut reader: ReadHalf<Stream>, pending: Pending, closed: Arc<AtomicBool>) {
    loop {
        let (id, reply) = match read_frame(&mut reader).await {
            Ok(Some(Frame::Response { id, payload })) => (id, Ok(payload)),
            Ok(Some(Frame::Error { id, status })) => (id, Err(status)),
            Ok(Some(other)) => {
                tracing::warn!(id = other.id(), "Ignoring unexpected frame from server");
                continue;
            }
            Ok(None) => {
                tracing::debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Connection failed: {}", e);
                break;
            }
        };

        let waiter = pending.lock().remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            // the caller already gave up
            None => tracing::debug!(id, "Dropping reply for abandoned call"),
        }
    }

    closed.store(true, Ordering::SeqCst);
    let waiters: Vec<_> = pending.lock().drain().map(|(_, waiter)| waiter).collect();
    for waiter in waiters {
        let _ = waiter.send(Err(Status::unavailable("connection closed")));
    }
}

async fn write_loop(
    mut writer: WriteHalf<Stream>,
    mut frames: mpsc::Receiver<Frame>,
    mut close_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        tracing::warn!("Failed to send frame {}: {}", frame.id(), e);
                        return;
                    }
                }
                None => break,
            },
            _ = &mut close_rx => {
                frames.close();
                while let Some(frame) = frames.recv().await {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}
