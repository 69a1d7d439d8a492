use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tlsecho_common::{
    codec::{read_frame, write_frame},
    CallContext, CancelHandle, Frame, Status,
};
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinSet,
};
use tokio_rustls::server::TlsStream;
use tracing::Instrument;

use crate::{handler::EchoService, listener::ServerChannel, router::Router};

/// Frames buffered between the reader task and the connection loop.
const INBOUND_QUEUE: usize = 64;

/// Replies buffered for the writer task.
const OUTBOUND_QUEUE: usize = 64;

type Stream = TlsStream<TcpStream>;
type InFlight = Arc<Mutex<HashMap<u64, CancelHandle>>>;

/// Serves every call arriving on one connection until the peer leaves or
/// the server drains.
///
/// Each request runs on its own task; replies go out in completion order.
/// Once `shutdown` is set, new requests are refused with `Unavailable` and
/// the connection closes as soon as its in-flight calls have replied.
pub(crate) async fn serve_connection<S: EchoService>(
    channel: ServerChannel,
    router: Arc<Router<S>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = channel.peer_addr();
    let (read_half, write_half) = tokio::io::split(channel.into_stream());

    let mut io_tasks = JoinSet::new();
    let (in_tx, mut in_rx) = mpsc::channel(INBOUND_QUEUE);
    let reader = io_tasks.spawn(read_loop(read_half, in_tx));
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    io_tasks.spawn(write_loop(write_half, out_rx));

    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
    let mut calls = JoinSet::new();
    let mut draining = *shutdown.borrow_and_update();
    let mut peer_gone = false;

    while !(draining && calls.is_empty()) {
        tokio::select! {
            frame = in_rx.recv() => match frame {
                Some(Frame::Request { id, method, timeout_ms, payload }) => {
                    if *shutdown.borrow() {
                        tracing::debug!(%peer, id, "Refusing request, server is shutting down");
                        let status = Status::unavailable("server is shutting down");
                        let _ = out_tx.send(Frame::Error { id, status }).await;
                        continue;
                    }
                    let timeout = timeout_ms.map(Duration::from_millis);
                    let (ctx, cancel) = CallContext::new(timeout);
                    let accepted = match in_flight.lock().entry(id) {
                        Entry::Occupied(_) => false,
                        Entry::Vacant(slot) => {
                            slot.insert(cancel);
                            true
                        }
                    };
                    if !accepted {
                        tracing::warn!(%peer, id, "Refusing request, id is already in flight");
                        let status = Status::invalid_argument(format!("request id {id} is already in flight"));
                        let _ = out_tx.send(Frame::Error { id, status }).await;
                        continue;
                    }
                    let span = tracing::info_span!("call", %peer, id, method = %method);
                    calls.spawn(
                        run_call(
                            Arc::clone(&router),
                            id,
                            method,
                            payload,
                            ctx,
                            out_tx.clone(),
                            Arc::clone(&in_flight),
                        )
                        .instrument(span),
                    );
                }
                Some(Frame::Cancel { id }) => {
                    // the entry stays until the call replies, so the id stays reserved
                    let fired = in_flight.lock().get(&id).map(CancelHandle::cancel).is_some();
                    if fired {
                        tracing::debug!(%peer, id, "Call cancelled by client");
                    }
                }
                Some(other) => {
                    tracing::warn!(%peer, id = other.id(), "Ignoring unexpected frame from client");
                }
                None => {
                    peer_gone = true;
                    break;
                }
            },
            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(%peer, "Call handler panicked");
                    }
                }
            }
            _ = shutdown.changed(), if !draining => {
                draining = true;
                tracing::debug!(%peer, in_flight = calls.len(), "Draining connection");
            }
        }
    }

    if peer_gone {
        // nobody is left to read the replies
        for (_, cancel) in in_flight.lock().drain() {
            cancel.cancel();
        }
    }
    while calls.join_next().await.is_some() {}

    drop(out_tx);
    reader.abort();
    while io_tasks.join_next().await.is_some() {}
    tracing::info!(%peer, "Connection closed");
}

async fn run_call<S: EchoService>(
    router: Arc<Router<S>>,
    id: u64,
    method: String,
    payload: Value,
    ctx: CallContext,
    out_tx: mpsc::Sender<Frame>,
    in_flight: InFlight,
) {
    tracing::debug!("Handling call");
    let frame = match router.dispatch(&method, payload, ctx).await {
        Ok(payload) => {
            tracing::debug!("Replied");
            Frame::Response { id, payload }
        }
        Err(status) => {
            tracing::info!(code = %status.code, "Call failed: {}", status.message);
            Frame::Error { id, status }
        }
    };
    in_flight.lock().remove(&id);
    if out_tx.send(frame).await.is_err() {
        tracing::debug!("Connection gone before reply could be sent");
    }
}

async fn read_loop(mut reader: ReadHalf<Stream>, frames: mpsc::Sender<Frame>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("Client disconnected");
                break;
            }
            Err(e) => {
                tracing::warn!("Message receive failed: {}", e);
                break;
            }
        }
    }
}

async fn write_loop(mut writer: WriteHalf<Stream>, mut frames: mpsc::Receiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::warn!("Failed to send frame {}: {}", frame.id(), e);
            return;
        }
    }
    // sends close_notify
    let _ = writer.shutdown().await;
}
