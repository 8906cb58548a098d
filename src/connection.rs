//! A single TLS+HTTP/2 client connection, and the *monitored* variant that
//! bundles a connection with an [`RttMonitor`].
//!
//! The no-verify TLS configuration and key-log wiring are grounded in
//! `examples/plabayo-rama/rama-cli/src/cmd/http/tls.rs`'s
//! `create_tls_client_config` (the `dangerous().set_certificate_verifier`
//! plus `KeyLogFile` pattern); this module reimplements that pattern
//! directly against `rustls` since the crate doesn't pull in all of `rama`.
//! The HTTP/2 handshake and request/response shapes follow the real `h2`
//! crate's client API (see
//! `examples/other_examples/181751bf_carllerche-h2__src-client.rs.rs` for
//! the historical shape this crate's modern async/await API evolved from).

use std::fs::OpenOptions;
use std::io::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use h2::client::SendRequest;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::bandwidth::BandwidthCounter;
use crate::error::{BodyOutcome, MultigetError};
use crate::request::RangeSpec;
use crate::rtt::{PingSource, RttMonitor};

/// Accepts every certificate. The design targets CDN endpoints whose
/// certificate chains may not validate under the client's root store; see
/// spec.md §6.2.
#[derive(Debug)]
struct NoServerCertVerifier;

impl ServerCertVerifier for NoServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Appends TLS session secrets to `keylog.txt` in NSS key-log format,
/// unconditionally (spec.md §6.2 does not gate this behind an env var, unlike
/// the `rama-cli` source this is grounded on).
struct FixedKeyLogFile(StdMutex<std::fs::File>);

impl FixedKeyLogFile {
    fn open() -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open("keylog.txt")?;
        Ok(Self(StdMutex::new(file)))
    }
}

impl rustls::KeyLog for FixedKeyLogFile {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let line = format!(
            "{label} {} {}\n",
            hex::encode(client_random),
            hex::encode(secret)
        );
        if let Ok(mut file) = self.0.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

/// Advisory per-request timeout (spec.md §5). Not the scheduler's primary
/// cancellation path — that's `ChokeAt` — but a backstop against a mirror
/// that never responds.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn tls_client_config() -> Result<Arc<ClientConfig>, MultigetError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoServerCertVerifier));

    config.key_log = Arc::new(
        FixedKeyLogFile::open().map_err(|e| MultigetError::Setup(format!("keylog.txt: {e}")))?,
    );
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}

/// A response body still being streamed, paired with the [`ChokeHandle`]
/// that lets another task truncate it (spec.md §4.3.5).
pub struct ResponseBody {
    recv: h2::RecvStream,
    limit: Arc<AtomicU64>,
}

/// Lets a task other than the one consuming [`ResponseBody`] cap how many
/// more body bytes will be accepted. This is the crate's stand-in for the
/// non-standard transport capability spec.md §6.3 calls `ChokeAt`: rather
/// than patching `h2` itself, the consuming loop in
/// [`ResponseBody::read_into`] checks the limit after every chunk and stops
/// itself, dropping the `RecvStream` (which causes `h2` to emit a local
/// stream reset) instead of reading further.
#[derive(Clone)]
pub struct ChokeHandle {
    limit: Arc<AtomicU64>,
}

impl ChokeHandle {
    /// Caps the stream at `n` more body bytes. A sentinel of `u64::MAX`
    /// (the initial value) means "no limit".
    pub fn choke_at(&self, n: u64) {
        self.limit.store(n, Ordering::SeqCst);
    }

    /// Wraps a caller-owned limit cell directly, for fake bodies in tests
    /// that want their own handle to the same limit their reader polls.
    pub(crate) fn from_limit(limit: Arc<AtomicU64>) -> Self {
        Self { limit }
    }
}

impl ResponseBody {
    pub fn choke_handle(&self) -> ChokeHandle {
        ChokeHandle {
            limit: self.limit.clone(),
        }
    }

    /// Reads up to `dest.len()` bytes into `dest`, feeding every chunk
    /// through `counter`. Stops early once choked. Stream truncation (the
    /// transport reporting "more than declared Content-Length") is folded
    /// into `BodyOutcome::Truncated`, not an error — see spec.md §4.3.4.
    ///
    /// `dest` must be exactly the slice this connection's range owns
    /// (invariant I1); a mismatch between `dest.len()` and the byte count
    /// actually promised by the range request is a caller bug.
    pub async fn read_into(
        mut self,
        dest: &mut [u8],
        counter: &BandwidthCounter,
    ) -> Result<BodyOutcome, MultigetError> {
        let expected_len = dest.len() as u64;
        let mut received = 0u64;
        loop {
            if received >= expected_len {
                return Ok(BodyOutcome::Complete);
            }
            let limit = self.limit.load(Ordering::SeqCst);
            if limit != u64::MAX && received >= limit {
                return Ok(BodyOutcome::Truncated);
            }

            match self.recv.data().await {
                Some(Ok(chunk)) => {
                    let _ = self.recv.flow_control().release_capacity(chunk.len());
                    let take = (chunk.len() as u64).min(expected_len - received) as usize;
                    let start = received as usize;
                    dest[start..start + take].copy_from_slice(&chunk[..take]);
                    counter.write(&chunk[..take]);
                    received += take as u64;
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Ok(if received == expected_len {
                        BodyOutcome::Complete
                    } else {
                        BodyOutcome::Truncated
                    });
                }
            }
        }
    }
}

/// Wraps a single TLS+HTTP/2 client connection. Created at bootstrap,
/// destroyed at program end. `start_request` is the only method called
/// under concurrency (spec.md §3); `h2::client::SendRequest` is internally
/// safe to share and clone across tasks.
pub struct Connection {
    id: u32,
    authority: String,
    send_request: SendRequest<Bytes>,
    ping_pong: AsyncMutex<h2::client::PingPong>,
}

impl Connection {
    /// Dials `host:port` over TLS+HTTP/2 and spawns the connection's driver
    /// task. `id` is the stable integer identity used for the bandwidth
    /// trace file and the per-recursion log lines.
    #[instrument(skip(host), fields(host = %host, port))]
    pub async fn dial(id: u32, host: &str, port: u16) -> Result<Self, MultigetError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| MultigetError::Setup(format!("TCP connect to {host}:{port}: {e}")))?;
        tcp.set_nodelay(true).ok();

        let config = tls_client_config()?;
        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| MultigetError::Setup(format!("invalid server name {host}: {e}")))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| MultigetError::Setup(format!("TLS handshake with {host}: {e}")))?;

        let (mut send_request, mut h2_connection) = h2::client::handshake(tls)
            .await
            .map_err(|e| MultigetError::Setup(format!("HTTP/2 handshake with {host}: {e}")))?;

        let ping_pong = h2_connection
            .ping_pong()
            .expect("ping_pong unavailable before driving connection");

        tokio::spawn(async move {
            if let Err(e) = h2_connection.await {
                debug!(error = %e, "http/2 connection driver exited");
            }
        });

        let send_request = send_request
            .ready()
            .await
            .map_err(|e| MultigetError::Setup(format!("HTTP/2 connection not ready: {e}")))?;

        debug!(connection_id = id, "connection established");

        Ok(Self {
            id,
            authority: format!("{host}:{port}"),
            send_request,
            ping_pong: AsyncMutex::new(ping_pong),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Starts a GET request for `path` with the given range shape. Returns
    /// the response status/headers and a [`ResponseBody`] the caller owns
    /// until its body is fully read or truncated.
    pub async fn start_request(
        &self,
        path: &str,
        range: RangeSpec,
    ) -> Result<(http::StatusCode, http::HeaderMap, ResponseBody), MultigetError> {
        let request = crate::request::build_request(&self.authority, path, range)?;

        let mut send_request = self.send_request.clone();
        let (response_fut, _send_stream) = send_request
            .send_request(request, true)
            .map_err(|e| MultigetError::Setup(format!("send_request: {e}")))?;

        // Advisory safety net independent of the choke mechanism (spec.md §5,
        // "Timeouts"): the scheduler relies on choking and recursion to avoid
        // waiting on lagging connections, but a connection that never
        // responds at all needs something to fire.
        let response = match tokio::time::timeout(REQUEST_TIMEOUT, response_fut).await {
            Ok(result) => result.map_err(MultigetError::from)?,
            Err(_) => {
                return Err(MultigetError::Protocol(format!(
                    "connection {}: no response within {:?}",
                    self.id, REQUEST_TIMEOUT
                )))
            }
        };
        let status = response.status();
        let (parts, recv) = response.into_parts();

        Ok((
            status,
            parts.headers,
            ResponseBody {
                recv,
                limit: Arc::new(AtomicU64::new(u64::MAX)),
            },
        ))
    }
}

#[async_trait]
impl PingSource for Connection {
    async fn measure_rtt(&self) -> u64 {
        let mut ping_pong = self.ping_pong.lock().await;
        let start = Instant::now();
        match ping_pong.ping(h2::Ping::opaque()).await {
            Ok(()) => start.elapsed().as_micros() as u64,
            Err(e) => {
                debug!(connection_id = self.id, error = %e, "ping failed");
                0
            }
        }
    }
}

#[async_trait]
impl crate::mirror::TransferBody for ResponseBody {
    fn choke_handle(&self) -> ChokeHandle {
        self.choke_handle()
    }

    async fn read_into(
        self,
        dest: &mut [u8],
        counter: &BandwidthCounter,
    ) -> Result<BodyOutcome, MultigetError> {
        self.read_into(dest, counter).await
    }
}

/// Bundles a [`Connection`] with an [`RttMonitor`], started eagerly so the
/// first RTT sample is available before the scheduler needs it.
pub struct MonitoredConnection {
    pub connection: Arc<Connection>,
    pub rtt: Arc<RttMonitor>,
}

impl MonitoredConnection {
    pub async fn new(connection: Connection) -> Arc<Self> {
        let connection = Arc::new(connection);
        let rtt = Arc::new(RttMonitor::new());
        rtt.start(connection.clone() as Arc<dyn PingSource>).await;
        Arc::new(Self { connection, rtt })
    }
}

#[async_trait]
impl crate::mirror::Mirror for MonitoredConnection {
    type Body = ResponseBody;

    fn id(&self) -> u32 {
        self.connection.id()
    }

    fn rtt_micros(&self) -> u64 {
        self.rtt.get_rtt()
    }

    async fn start_request(
        &self,
        path: &str,
        range: RangeSpec,
    ) -> Result<(http::StatusCode, ResponseBody), MultigetError> {
        let (status, _headers, body) = self.connection.start_request(path, range).await?;
        Ok((status, body))
    }
}
