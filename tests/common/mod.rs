//! Integration test common infrastructure.
//!
//! Spawns in-process servers on ephemeral ports and provides a minimal
//! XMPP test client that drives real sockets through STARTTLS.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use sbrwxmpp::api::{self, ApiContext};
use sbrwxmpp::certgen;
use sbrwxmpp::cmdhook::CmdHook;
use sbrwxmpp::config::WebhookConfig;
use sbrwxmpp::db::{Db, User};
use sbrwxmpp::network::Gateway;
use sbrwxmpp::state::Registry;
use sbrwxmpp::token;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// An in-process server instance.
pub struct TestServer {
    pub xmpp_addr: SocketAddr,
    pub api_addr: SocketAddr,
    pub api_key: String,
    pub db: Db,
    data_dir: PathBuf,
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with_webhook(WebhookConfig::default()).await
    }

    /// Spawn a server with `domain=localhost`, a generated self-signed
    /// certificate and a temp credential store.
    pub async fn spawn_with_webhook(webhook: WebhookConfig) -> Self {
        let data_dir = std::env::temp_dir().join(format!("sbrwxmpp-test-{}", token::secure(12)));
        std::fs::create_dir_all(&data_dir).unwrap();

        certgen::generate_certificate(&data_dir, "localhost").unwrap();
        let acceptor = certgen::load_acceptor(
            &data_dir.join("localhost.crt"),
            &data_dir.join("localhost.key"),
        )
        .unwrap();

        let db = Db::open(data_dir.join("users.redb")).unwrap();
        let registry = Arc::new(Registry::new("localhost"));
        let webhook = Arc::new(CmdHook::new(webhook).unwrap());

        let gateway = Gateway::bind(
            "127.0.0.1:0",
            acceptor,
            Arc::clone(&registry),
            db.clone(),
            webhook,
        )
        .await
        .unwrap();
        let xmpp_addr = gateway.local_addr().unwrap();
        tokio::spawn(gateway.run());

        let api_key = format!("test-key-{}", token::secure(16));
        let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_addr = api_listener.local_addr().unwrap();
        tokio::spawn(api::serve(
            ApiContext {
                registry,
                db: db.clone(),
                key: api_key.clone(),
            },
            api_listener,
        ));

        Self {
            xmpp_addr,
            api_addr,
            api_key,
            db,
            data_dir,
        }
    }

    /// Preload a credential.
    pub fn add_user(&self, name: &str, password: &str) {
        self.db
            .upsert_user(&User {
                name: name.to_string(),
                password: password.as_bytes().to_vec(),
            })
            .unwrap();
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("http://{}{}", self.api_addr, path)
    }

    /// Connect a client and complete stream open, STARTTLS and the
    /// post-TLS stream reopen.
    pub async fn connect_tls(&self) -> TestClient {
        let mut client = TestClient::connect(self.xmpp_addr).await;
        client.open_stream().await;
        client.starttls().await;
        client.open_stream().await;
        client
    }

    /// Full login: TLS handshake, authentication and initial presence,
    /// confirmed against the registry so later steps see the session.
    pub async fn login(&self, user: &str, password: &str, resource: &str) -> TestClient {
        let mut client = self.connect_tls().await;
        client.authenticate(user, password, resource).await;
        client.announce_presence().await;
        self.wait_for_session(user).await;
        client
    }

    /// Poll `/api/sessions` until `node` appears.
    pub async fn wait_for_session(&self, node: &str) {
        let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
        loop {
            let sessions: Vec<String> = reqwest::Client::new()
                .get(self.api_url("/api/sessions"))
                .header("Authorization", &self.api_key)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if sessions.iter().any(|s| s == node) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session {node} never appeared (have {sessions:?})"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

enum TestStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for TestStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TestStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TestStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TestStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TestStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TestStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TestStream::Plain(s) => Pin::new(s).poll_flush(cx),
            TestStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TestStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TestStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A minimal XMPP test client over a raw socket.
pub struct TestClient {
    stream: Option<TestStream>,
    buf: Vec<u8>,
    next_iq: u32,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let tcp = TcpStream::connect(addr).await.unwrap();
        Self {
            stream: Some(TestStream::Plain(tcp)),
            buf: Vec::new(),
            next_iq: 1,
        }
    }

    fn stream_mut(&mut self) -> &mut TestStream {
        self.stream.as_mut().expect("stream gone")
    }

    pub async fn send(&mut self, payload: &str) {
        let stream = self.stream_mut();
        stream.write_all(payload.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }

    /// Read until `needle` appears, consuming through its end. Returns
    /// everything consumed.
    pub async fn read_until(&mut self, needle: &str) -> String {
        let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
        loop {
            if let Some(pos) = find(&self.buf, needle.as_bytes()) {
                let end = pos + needle.len();
                let consumed: Vec<u8> = self.buf.drain(..end).collect();
                return String::from_utf8_lossy(&consumed).into_owned();
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout_at(deadline, self.stream_mut().read(&mut chunk))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"))
                .unwrap();
            assert!(n > 0, "connection closed while waiting for {needle:?}");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Assert that nothing arrives within the given window.
    pub async fn expect_silence(&mut self, window: Duration) {
        assert!(self.buf.is_empty(), "unconsumed data: {}", String::from_utf8_lossy(&self.buf));
        let mut chunk = [0u8; 4096];
        match tokio::time::timeout(window, self.stream_mut().read(&mut chunk)).await {
            Err(_) => {}
            Ok(Ok(0)) => panic!("connection closed during silence window"),
            Ok(Ok(n)) => panic!("unexpected data: {}", String::from_utf8_lossy(&chunk[..n])),
            Ok(Err(e)) => panic!("read error during silence window: {e}"),
        }
    }

    /// Wait for the peer to close the connection.
    pub async fn expect_close(&mut self) {
        let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
        let mut chunk = [0u8; 4096];
        loop {
            let n = tokio::time::timeout_at(deadline, self.stream_mut().read(&mut chunk))
                .await
                .expect("timed out waiting for close")
                .unwrap_or(0);
            if n == 0 {
                return;
            }
        }
    }

    /// Send the client stream header and consume the server's header and
    /// features. Returns everything read.
    pub async fn open_stream(&mut self) -> String {
        self.send(
            "<?xml version='1.0'?><stream:stream to='localhost' version='1.0' \
             xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
        )
        .await;
        self.read_until("</stream:features>").await
    }

    /// Negotiate STARTTLS and replace the socket with a TLS session that
    /// skips certificate verification (the server's cert is self-signed).
    pub async fn starttls(&mut self) {
        self.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await;
        self.read_until("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await;
        assert!(self.buf.is_empty(), "plaintext bytes after proceed");

        let Some(TestStream::Plain(tcp)) = self.stream.take() else {
            panic!("starttls on an already encrypted stream");
        };
        let connector = insecure_connector();
        let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let tls = connector.connect(server_name, tcp).await.unwrap();
        self.stream = Some(TestStream::Tls(Box::new(tls)));
    }

    /// Legacy iq-auth with a fresh iq id; expects success.
    pub async fn authenticate(&mut self, user: &str, password: &str, resource: &str) {
        let id = self.send_auth(user, password, resource).await;
        self.read_until(&format!("<iq type='result' id='{id}'/>")).await;
    }

    /// Send the auth iq and return its id without waiting for the reply.
    pub async fn send_auth(&mut self, user: &str, password: &str, resource: &str) -> String {
        let id = format!("a{}", self.next_iq);
        self.next_iq += 1;
        self.send(&format!(
            "<iq id='{id}' type='set'><query xmlns='jabber:iq:auth'>\
             <username>{user}</username><password>{password}</password>\
             <resource>{resource}</resource></query></iq>"
        ))
        .await;
        id
    }

    /// Initial presence: publish this session into the client registry.
    pub async fn announce_presence(&mut self) {
        self.send("<presence/>").await;
    }

    pub async fn join_room(&mut self, room: &str) {
        self.send(&format!("<presence to='{room}'/>")).await;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// TLS connector that accepts any server certificate. Test-only: the
/// server under test uses a freshly generated self-signed cert.
fn insecure_connector() -> TlsConnector {
    certgen::init_crypto_provider();
    let provider = rustls::crypto::ring::default_provider();
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
