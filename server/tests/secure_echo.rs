use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::future::join_all;
use rustls::{pki_types::ServerName, ClientConfig};
use tlsecho_client::{BlockingEchoClient, Channel, EchoClient};
use tlsecho_common::{
    build_client_trust, build_server_identity,
    codec::{read_frame, write_frame},
    material::ServerMaterial,
    protocol::reply_text,
    CallContext, ClientSettings, Code, EchoError, EchoRequest, EchoResponse, Frame, Identity,
    Status, ECHO_METHOD,
};
use tlsecho_server::{
    EchoService, FixedHost, HostEcho, Listener, Server, ServerBuilder, ShutdownHandle,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::JoinHandle,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

fn self_signed() -> (String, String) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    (cert.pem(), key_pair.serialize_pem())
}

/// Answers immediately, except for texts starting with "slow", which wait
/// `delay` or until the call is cancelled.
#[derive(Clone)]
struct SlowEcho {
    delay:     Duration,
    started:   Arc<AtomicUsize>,
    cancelled: Arc<Notify>,
}

impl SlowEcho {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(Notify::new()),
        }
    }
}

impl EchoService for SlowEcho {
    async fn echo(&self, ctx: CallContext, request: EchoRequest) -> Result<EchoResponse, Status> {
        if request.text.starts_with("slow") {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancelled() => {
                    self.cancelled.notify_one();
                    return Err(Status::cancelled("caller went away"));
                }
            }
        }
        Ok(EchoResponse {
            text: reply_text(&request.text, "host-A"),
        })
    }
}

struct TestServer {
    endpoint:      String,
    shutdown:      ShutdownHandle,
    task:          JoinHandle<Result<(), EchoError>>,
    identity:      Identity,
    cert_pem:      String,
    client_config: Arc<ClientConfig>,
}

impl TestServer {
    async fn start<S: EchoService>(builder: ServerBuilder<S>) -> Self {
        let (cert_pem, key_pem) = self_signed();
        let identity = build_server_identity(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        let listener = Listener::bind("127.0.0.1:0", identity.server_config().unwrap())
            .await
            .unwrap();
        let endpoint = format!("localhost:{}", listener.local_addr().port());

        let server = builder.build();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.serve(listener));

        let client_config = build_client_trust(cert_pem.as_bytes())
            .unwrap()
            .client_config()
            .unwrap();

        Self {
            endpoint,
            shutdown,
            task,
            identity,
            cert_pem,
            client_config,
        }
    }

    async fn client(&self) -> EchoClient {
        EchoClient::connect_with_config(&self.endpoint, Arc::clone(&self.client_config), CALL_TIMEOUT)
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.shutdown.shutdown();
        tokio::time::timeout(CALL_TIMEOUT, self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn host_a() -> ServerBuilder<HostEcho<FixedHost>> {
    Server::builder(HostEcho::new(FixedHost("host-A".to_string())))
}

fn slow(delay: Duration) -> (SlowEcho, ServerBuilder<SlowEcho>) {
    let handler = SlowEcho::new(delay);
    (handler.clone(), Server::builder(handler))
}

async fn wait_for_started(handler: &SlowEcho, count: usize) {
    tokio::time::timeout(CALL_TIMEOUT, async {
        while handler.started.load(Ordering::SeqCst) < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("calls never reached the handler");
}

#[tokio::test]
async fn round_trip_with_material_from_files() {
    let server = TestServer::start(host_a()).await;

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("server.pem");
    std::fs::write(&cert_path, &server.cert_pem).unwrap();

    let settings = ClientSettings::new(cert_path.clone(), server.endpoint.clone());
    let client = EchoClient::connect(&settings).await.unwrap();

    let reply = client.echo("hello world", CALL_TIMEOUT).await.unwrap();
    assert_eq!(reply.text, "hello world from host-A");
    assert_eq!(
        client.channel().peer_certificate(),
        Some(server.identity.certificate())
    );

    let empty = client.echo("", CALL_TIMEOUT).await.unwrap();
    assert_eq!(empty.text, " from host-A");

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn server_material_loads_from_files() {
    let (cert_pem, key_pem) = self_signed();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("server.pem");
    let key_path = dir.path().join("server.key.pem");
    std::fs::write(&cert_path, &cert_pem).unwrap();
    std::fs::write(&key_path, &key_pem).unwrap();

    let material = ServerMaterial::load(&cert_path, &key_path).unwrap();
    let identity = build_server_identity(&material.cert, &material.key).unwrap();
    let listener = Listener::bind("127.0.0.1:0", identity.server_config().unwrap())
        .await
        .unwrap();
    assert_ne!(listener.local_addr().port(), 0);
}

#[tokio::test]
async fn untrusted_certificate_fails_the_handshake() {
    let server = TestServer::start(host_a()).await;

    let (other_cert, _) = self_signed();
    let config = build_client_trust(other_cert.as_bytes())
        .unwrap()
        .client_config()
        .unwrap();

    let err = Channel::connect(&server.endpoint, config).await.err().unwrap();
    assert!(matches!(err, EchoError::Connect { .. }), "{err}");
    assert!(err.is_handshake_failure(), "{err}");

    // the rejected client did not disturb the listener
    let client = server.client().await;
    assert!(client.echo("still here", CALL_TIMEOUT).await.is_ok());

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn nothing_listening_is_a_connect_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = format!("localhost:{}", listener.local_addr().unwrap().port());
    drop(listener);

    let (cert_pem, _) = self_signed();
    let config = build_client_trust(cert_pem.as_bytes())
        .unwrap()
        .client_config()
        .unwrap();
    let err = Channel::connect(&endpoint, config).await.err().unwrap();
    assert!(matches!(err, EchoError::Connect { .. }));
    assert!(!err.is_handshake_failure());
}

#[tokio::test]
async fn deadline_exceeded_leaves_channel_usable() {
    let (handler, builder) = slow(Duration::from_secs(30));
    let server = TestServer::start(builder).await;
    let client = server.client().await;

    let err = client
        .echo("slow call", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, EchoError::DeadlineExceeded(_)), "{err}");

    // the server side of the call is cancelled too
    tokio::time::timeout(CALL_TIMEOUT, handler.cancelled.notified())
        .await
        .expect("handler never saw the cancellation");

    let reply = client.echo("after", CALL_TIMEOUT).await.unwrap();
    assert_eq!(reply.text, "after from host-A");

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn caller_cancellation_reaches_the_handler() {
    let (handler, builder) = slow(Duration::from_secs(30));
    let server = TestServer::start(builder).await;
    let client = server.client().await;

    let (ctx, cancel) = CallContext::new(None);
    let call = client.echo_with_context("slow call", &ctx);
    let cancel_later = async {
        wait_for_started(&handler, 1).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(call, cancel_later);

    match result {
        Err(EchoError::Call(status)) => assert_eq!(status.code, Code::Cancelled),
        other => panic!("expected a cancelled call, got {other:?}"),
    }
    tokio::time::timeout(CALL_TIMEOUT, handler.cancelled.notified())
        .await
        .expect("handler never saw the cancellation");

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn concurrent_calls_get_their_own_replies() {
    let server = TestServer::start(host_a()).await;
    let client = server.client().await;

    let texts: Vec<String> = (0..32).map(|i| format!("message {i}")).collect();
    let replies = join_all(texts.iter().map(|text| client.echo(text, CALL_TIMEOUT))).await;

    for (text, reply) in texts.iter().zip(replies) {
        assert_eq!(reply.unwrap().text, format!("{text} from host-A"));
    }

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn calls_from_separate_connections_are_served() {
    let server = TestServer::start(host_a()).await;

    let clients = join_all((0..4).map(|_| server.client())).await;
    let replies = join_all(
        clients
            .iter()
            .enumerate()
            .map(|(i, client)| async move { client.echo(&format!("client {i}"), CALL_TIMEOUT).await }),
    )
    .await;
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap().text, format!("client {i} from host-A"));
    }

    for client in clients {
        client.close().await;
    }
    server.stop().await;
}

#[tokio::test]
async fn shutdown_lets_in_flight_calls_finish() {
    let (handler, builder) = slow(Duration::from_millis(300));
    let server = TestServer::start(builder.grace_period(Duration::from_secs(5))).await;
    let client = Arc::new(server.client().await);

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.echo(&format!("slow {i}"), CALL_TIMEOUT).await })
        })
        .collect();
    wait_for_started(&handler, 3).await;

    server.shutdown.shutdown();
    assert!(server.shutdown.is_shutting_down());

    let late = client.echo("late", CALL_TIMEOUT).await;
    assert!(matches!(late, Err(EchoError::Call(_))), "{late:?}");

    for (i, call) in calls.into_iter().enumerate() {
        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.text, format!("slow {i} from host-A"));
    }

    tokio::time::timeout(CALL_TIMEOUT, server.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn grace_period_aborts_stuck_calls() {
    let (handler, builder) = slow(Duration::from_secs(60));
    let server = TestServer::start(builder.grace_period(Duration::from_millis(200))).await;
    let client = Arc::new(server.client().await);

    let stuck = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.echo("slow forever", Duration::from_secs(60)).await })
    };
    wait_for_started(&handler, 1).await;

    server.shutdown.shutdown();
    tokio::time::timeout(CALL_TIMEOUT, server.task)
        .await
        .expect("grace period was not enforced")
        .unwrap()
        .unwrap();

    let result = tokio::time::timeout(CALL_TIMEOUT, stuck)
        .await
        .expect("client never noticed the closed connection")
        .unwrap();
    match result {
        Err(EchoError::Call(status)) => assert_eq!(status.code, Code::Unavailable),
        other => panic!("expected an unavailable call, got {other:?}"),
    }
    assert!(client.channel().is_closed());
}

#[tokio::test]
async fn serve_with_shutdown_stops_on_signal() {
    let (cert_pem, key_pem) = self_signed();
    let identity = build_server_identity(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
    let listener = Listener::bind("127.0.0.1:0", identity.server_config().unwrap())
        .await
        .unwrap();

    let signal = Arc::new(Notify::new());
    let task = {
        let signal = Arc::clone(&signal);
        tokio::spawn(
            host_a()
                .build()
                .serve_with_shutdown(listener, async move { signal.notified().await }),
        )
    };

    signal.notify_one();
    tokio::time::timeout(CALL_TIMEOUT, task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn accept_skips_failed_handshakes() {
    let (cert_pem, key_pem) = self_signed();
    let identity = build_server_identity(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
    let listener = Listener::bind("127.0.0.1:0", identity.server_config().unwrap())
        .await
        .unwrap();
    let port = listener.local_addr().port();
    let config = build_client_trust(cert_pem.as_bytes())
        .unwrap()
        .client_config()
        .unwrap();

    let peers = tokio::spawn(async move {
        let mut garbage = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        garbage.write_all(b"not a tls handshake\r\n\r\n").await.unwrap();
        let good = Channel::connect(&format!("localhost:{port}"), config)
            .await
            .unwrap();
        (garbage, good)
    });

    let accepted = tokio::time::timeout(CALL_TIMEOUT, listener.accept())
        .await
        .expect("no handshake completed");
    assert_eq!(accepted.alpn_protocol(), Some(&b"tlsecho/1"[..]));

    let (_garbage, good) = peers.await.unwrap();
    assert!(good.peer_certificate().is_some());
}

#[tokio::test]
async fn second_bind_on_same_address_fails() {
    let (cert_pem, key_pem) = self_signed();
    let config = build_server_identity(cert_pem.as_bytes(), key_pem.as_bytes())
        .unwrap()
        .server_config()
        .unwrap();

    let first = Listener::bind("127.0.0.1:0", Arc::clone(&config)).await.unwrap();
    let taken = first.local_addr().to_string();

    let err = Listener::bind(&taken, config).await.err().unwrap();
    assert!(matches!(err, EchoError::Bind { ref addr, .. } if *addr == taken), "{err}");
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let server = TestServer::start(host_a()).await;
    let client = server.client().await;

    let (ctx, _cancel) = CallContext::with_timeout(CALL_TIMEOUT);
    let err = client
        .channel()
        .unary::<_, EchoResponse>("/echo.EchoService/Shout", &EchoRequest::new("hi"), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.status().map(|s| s.code), Some(Code::Unimplemented));

    // a malformed request body is rejected, not answered
    let err = client
        .channel()
        .unary::<_, EchoResponse>(ECHO_METHOD, &serde_json::json!({ "text": 42 }), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.status().map(|s| s.code), Some(Code::InvalidArgument));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn reflection_lists_the_echo_service() {
    let server = TestServer::start(host_a()).await;
    let client = server.client().await;

    let services = client.list_services(CALL_TIMEOUT).await.unwrap();
    let echo = services.find("echo.EchoService").expect("echo service listed");
    assert!(echo.methods.iter().any(|m| m.path == ECHO_METHOD));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn reflection_can_be_disabled() {
    let server = TestServer::start(host_a().reflection(false)).await;
    let client = server.client().await;

    let err = client.list_services(CALL_TIMEOUT).await.unwrap_err();
    assert_eq!(err.status().map(|s| s.code), Some(Code::Unimplemented));

    // echo is unaffected
    assert!(client.echo("hi", CALL_TIMEOUT).await.is_ok());

    client.close().await;
    server.stop().await;
}

#[test]
fn blocking_client_against_live_server() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (_handler, builder) = slow(Duration::from_secs(30));
    let server = runtime.block_on(TestServer::start(builder));

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("server.pem");
    std::fs::write(&cert_path, &server.cert_pem).unwrap();
    let settings = ClientSettings::new(cert_path, server.endpoint.clone())
        .with_call_timeout(CALL_TIMEOUT);

    let mut client = BlockingEchoClient::connect(&settings).unwrap();
    assert!(client.is_connected());

    let reply = client.echo("hello world").unwrap();
    assert_eq!(reply.text, "hello world from host-A");

    let err = client
        .echo_with_timeout("slow call", Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, EchoError::DeadlineExceeded(_)), "{err}");

    let services = client.list_services().unwrap();
    assert!(services.find("echo.EchoService").is_some());

    client.disconnect();
    assert!(!client.is_connected());
    let err = client.echo("after disconnect").unwrap_err();
    assert_eq!(err.status().map(|s| s.code), Some(Code::Unavailable));

    runtime.block_on(server.stop());
}

#[tokio::test]
async fn full_send_queue_does_not_outlive_the_deadline() {
    // a TLS peer that completes the handshake and then never reads
    let (cert_pem, key_pem) = self_signed();
    let identity = build_server_identity(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
    let acceptor = TlsAcceptor::from(identity.server_config().unwrap());
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = tcp.local_addr().unwrap().port();
    let silent = tokio::spawn(async move {
        let (stream, _) = tcp.accept().await.unwrap();
        let _stream = acceptor.accept(stream).await.unwrap();
        std::future::pending::<()>().await;
    });

    let config = build_client_trust(cert_pem.as_bytes())
        .unwrap()
        .client_config()
        .unwrap();
    let channel = Channel::connect(&format!("localhost:{port}"), config)
        .await
        .unwrap();

    // enough large requests to fill the socket buffers and the send queue
    let text = "x".repeat(256 * 1024);
    let (channel, text) = (&channel, text.as_str());
    let calls = (0..120).map(move |_| async move {
        let (ctx, _cancel) = CallContext::with_timeout(Duration::from_millis(300));
        channel
            .unary::<_, EchoResponse>(ECHO_METHOD, &EchoRequest::new(text), &ctx)
            .await
    });
    let results = tokio::time::timeout(CALL_TIMEOUT, join_all(calls))
        .await
        .expect("calls blocked past their deadline");

    for result in results {
        assert!(matches!(result, Err(EchoError::DeadlineExceeded(_))), "{result:?}");
    }
    silent.abort();
}

#[tokio::test]
async fn reused_request_id_is_refused_while_in_flight() {
    let (_handler, builder) = slow(Duration::from_millis(300));
    let server = TestServer::start(builder).await;

    let tcp = TcpStream::connect(server.endpoint.as_str()).await.unwrap();
    let mut stream = TlsConnector::from(Arc::clone(&server.client_config))
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();

    let request = Frame::Request {
        id:         7,
        method:     ECHO_METHOD.to_string(),
        timeout_ms: None,
        payload:    serde_json::json!({ "text": "slow first" }),
    };
    write_frame(&mut stream, &request).await.unwrap();
    write_frame(&mut stream, &request).await.unwrap();

    match read_frame(&mut stream).await.unwrap() {
        Some(Frame::Error { id, status }) => {
            assert_eq!(id, 7);
            assert_eq!(status.code, Code::InvalidArgument);
        }
        other => panic!("expected the duplicate to be refused, got {other:?}"),
    }
    match read_frame(&mut stream).await.unwrap() {
        Some(Frame::Response { id, payload }) => {
            assert_eq!(id, 7);
            assert_eq!(payload["text"], "slow first from host-A");
        }
        other => panic!("expected the first call to complete, got {other:?}"),
    }

    stream.shutdown().await.unwrap();
    server.stop().await;
}
