//! Loopback JSON-RPC servers and tracing setup shared by the async tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use frames::{Failure, Parsed, Request, RpcError, Success};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};

use crate::config::TlsMaterial;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).with_test_writer().try_init();
}

// =============================================================================
// CERTIFICATES
// =============================================================================

/// Self-signed `localhost` certificate plus its key, both PEM.
pub(crate) struct TestCert {
    pub cert: String,
    pub key: String,
}

impl TestCert {
    pub fn localhost() -> Self {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).expect("self-signed cert");
        Self { cert: cert.pem(), key: key_pair.serialize_pem() }
    }
}

/// Client TLS material trusting `server` and presenting `client`.
pub(crate) fn client_tls(server: &TestCert, client: &TestCert) -> TlsMaterial {
    TlsMaterial { cert: Some(client.cert.clone()), key: Some(client.key.clone()), ca: vec![server.cert.clone()] }
}

fn acceptor(server: &TestCert, client: &TestCert) -> TlsAcceptor {
    let provider = Arc::new(ring::default_provider());

    let mut client_roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut client.cert.as_bytes()) {
        client_roots.add(cert.expect("client cert pem")).expect("client root");
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(client_roots), Arc::clone(&provider))
        .build()
        .expect("client verifier");

    let chain = rustls_pemfile::certs(&mut server.cert.as_bytes()).collect::<Result<Vec<_>, _>>().expect("server chain");
    let key = rustls_pemfile::private_key(&mut server.key.as_bytes()).expect("key pem").expect("server key");

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .expect("server config");
    TlsAcceptor::from(Arc::new(config))
}

// =============================================================================
// MOCK SERVER
// =============================================================================

/// What the mock server does with one request.
pub(crate) enum Reply {
    Result(Value),
    Error(RpcError),
    /// Write this exact text (newline included) instead of a response.
    Raw(String),
    Silent,
}

pub(crate) type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

/// Answers the two admin methods the way the proxy service does.
pub(crate) fn admin_handler() -> Handler {
    Arc::new(|req: &Request| match req.method.as_str() {
        "AdminServiceRFC.Multiply" => {
            let x = req.params["x"].as_i64().unwrap_or_default();
            let y = req.params["y"].as_i64().unwrap_or_default();
            Reply::Result(json!({ "result": x * y }))
        }
        "AdminServiceRFC.UpdateTunnelsConfig" => Reply::Result(json!({ "code": "" })),
        _ => Reply::Error(RpcError::new(frames::METHOD_NOT_FOUND, "method not found")),
    })
}

pub(crate) fn silent_handler() -> Handler {
    Arc::new(|_: &Request| Reply::Silent)
}

pub(crate) struct MockServer {
    pub port: u16,
    received: Arc<Mutex<Vec<Request>>>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn plain(handler: Handler) -> Self {
        Self::start(handler, None, 0).await
    }

    /// Plain server that hangs up on the first `drop_first` connections.
    pub async fn flaky(handler: Handler, drop_first: usize) -> Self {
        Self::start(handler, None, drop_first).await
    }

    pub async fn tls(server: &TestCert, client: &TestCert, handler: Handler) -> Self {
        Self::start(handler, Some(acceptor(server, client)), 0).await
    }

    async fn start(handler: Handler, tls: Option<TlsAcceptor>, drop_first: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let task = {
            let received = Arc::clone(&received);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    if connections.fetch_add(1, Ordering::SeqCst) < drop_first {
                        drop(socket);
                        continue;
                    }
                    let handler = Arc::clone(&handler);
                    let received = Arc::clone(&received);
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        match tls {
                            Some(acceptor) => {
                                if let Ok(stream) = acceptor.accept(socket).await {
                                    serve(stream, handler, received).await;
                                }
                            }
                            None => serve(socket, handler, received).await,
                        }
                    });
                }
            })
        };

        Self { port, received, connections, task }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<S>(stream: S, handler: Handler, received: Arc<Mutex<Vec<Request>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        for parsed in frames::parse_line(&line) {
            let Parsed::Request(req) = parsed else { continue };
            received.lock().unwrap_or_else(PoisonError::into_inner).push(req.clone());

            let out = match handler(&req) {
                Reply::Result(value) => frames::encode_line(&Success::new(req.id.clone(), value)).expect("encode"),
                Reply::Error(error) => frames::encode_line(&Failure::new(Some(req.id.clone()), error)).expect("encode"),
                Reply::Raw(text) => text,
                Reply::Silent => continue,
            };
            if writer.write_all(out.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
