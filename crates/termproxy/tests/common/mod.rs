//! Reusable test harness for termproxy integration tests.
//!
//! Runs real sessions in-process: a real child on a real PTY, viewers on
//! loopback TCP (plain transport), and in-memory pipes standing in for the
//! operator's terminal. Also locates the built binaries for exit-code tests.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use termproxy::client::send_handshake;
use termproxy::framing::{decode_one, Message};
use termproxy::tls;
use termproxy::transport::{Plain, Transport};
use termproxy::{CommandSpec, Session, SessionEnd, WindowSize};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout_at, Instant};
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

pub const TIMEOUT: Duration = Duration::from_secs(5);

// ── SessionHandle ───────────────────────────────────────────────────

/// A running session plus the operator-side ends of its console.
pub struct SessionHandle {
    pub session: Arc<Session>,
    pub addr: SocketAddr,
    /// Bytes written here are what the operator types.
    pub keyboard: DuplexStream,
    /// What the operator's terminal displays.
    pub screen: DuplexStream,
}

impl SessionHandle {
    /// Type on the operator's keyboard.
    pub async fn type_keys(&mut self, keys: &[u8]) {
        self.keyboard.write_all(keys).await.expect("keyboard write failed");
    }

    /// Read the operator's screen until `needle` shows up.
    pub async fn screen_until(&mut self, needle: &str) -> Option<String> {
        let deadline = Instant::now() + TIMEOUT;
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        while !String::from_utf8_lossy(&seen).contains(needle) {
            match timeout_at(deadline, self.screen.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return None,
                Ok(Ok(n)) => seen.extend_from_slice(&buf[..n]),
            }
        }
        Some(String::from_utf8_lossy(&seen).into_owned())
    }

    /// End the session from the outside and wait for teardown.
    pub async fn finish(self) -> SessionEnd {
        self.session.shutdown(SessionEnd::ConsoleClosed);
        self.session.wait().await
    }
}

/// Start `program` on a PTY with an in-memory console and a plain-TCP
/// accept loop on an ephemeral loopback port.
pub async fn start_session(program: &str, args: &[&str]) -> SessionHandle {
    start_session_with(program, args, Plain).await
}

/// Like [`start_session`], with viewers arriving over `transport`.
pub async fn start_session_with<T: Transport>(
    program: &str,
    args: &[&str],
    transport: T,
) -> SessionHandle {
    let command = CommandSpec {
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
    };
    let session = Session::start(&command, WindowSize::DEFAULT).expect("failed to start session");

    let (console_in, keyboard) = duplex(64 * 1024);
    let (console_out, screen) = duplex(1024 * 1024);
    session.spawn_engine(console_in, console_out);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind loopback listener");
    let addr = listener.local_addr().expect("listener has no address");
    session.spawn_accept_loop(listener, transport);

    SessionHandle {
        session,
        addr,
        keyboard,
        screen,
    }
}

/// A session running `/bin/cat`, which echoes whatever viewers type.
pub async fn start_cat_session() -> SessionHandle {
    start_session("/bin/cat", &[]).await
}

// ── Viewer ──────────────────────────────────────────────────────────

/// A remote viewer speaking the handshake and tagged protocol.
pub struct Viewer {
    stream: TcpStream,
    seen: Vec<u8>,
}

impl Viewer {
    /// Connect and send the size handshake.
    pub async fn connect(addr: SocketAddr, size: WindowSize) -> io::Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        send_handshake(&mut stream, size)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(Self {
            stream,
            seen: Vec::new(),
        })
    }

    pub async fn send_data(&mut self, bytes: &[u8]) -> io::Result<()> {
        Message::data(bytes).write_to(&mut self.stream).await
    }

    pub async fn send_winch(&mut self, cols: i16, rows: i16) -> io::Result<()> {
        Message::winch(cols, rows).write_to(&mut self.stream).await
    }

    /// Write raw bytes, bypassing framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    /// Read `Data` frames until their accumulated text contains `needle`.
    /// Returns everything seen so far, or `None` on timeout or disconnect.
    pub async fn read_until_contains(&mut self, needle: &str) -> Option<String> {
        let deadline = Instant::now() + TIMEOUT;
        while !String::from_utf8_lossy(&self.seen).contains(needle) {
            match timeout_at(deadline, decode_one(&mut self.stream)).await {
                Ok(Ok(Message::Data(data))) => self.seen.extend_from_slice(data.payload()),
                Ok(Ok(Message::Winch(_))) => {}
                Ok(Err(_)) | Err(_) => return None,
            }
        }
        Some(String::from_utf8_lossy(&self.seen).into_owned())
    }

    /// Drain frames until the server closes the stream. Returns false if the
    /// stream stayed open past the timeout.
    pub async fn wait_closed(&mut self) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            match timeout_at(deadline, decode_one(&mut self.stream)).await {
                Ok(Ok(Message::Data(data))) => self.seen.extend_from_slice(data.payload()),
                Ok(Ok(Message::Winch(_))) => {}
                Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }

    pub fn seen(&self) -> String {
        String::from_utf8_lossy(&self.seen).into_owned()
    }
}

// ── Certificates ────────────────────────────────────────────────────

/// A throwaway PKI in a temp dir: a CA with server and client leaves, plus
/// a client certificate from an unrelated CA.
///
/// Files: `ca.crt`, `server.crt`/`server.key` (for `localhost`),
/// `client.crt`/`client.key`, `rogue.crt`/`rogue.key`.
pub struct TestPki {
    dir: tempfile::TempDir,
}

impl TestPki {
    pub fn generate() -> Self {
        let dir = tempfile::tempdir().expect("failed to create cert dir");
        let pki = Self { dir };

        let (ca, ca_key) = authority("termproxy test ca");
        pki.write("ca.crt", &ca.pem());

        let (server, server_key) =
            leaf("localhost", ExtendedKeyUsagePurpose::ServerAuth, &ca, &ca_key);
        pki.write("server.crt", &server.pem());
        pki.write("server.key", &server_key.serialize_pem());

        let (client, client_key) =
            leaf("termproxy-viewer", ExtendedKeyUsagePurpose::ClientAuth, &ca, &ca_key);
        pki.write("client.crt", &client.pem());
        pki.write("client.key", &client_key.serialize_pem());

        let (other_ca, other_key) = authority("somebody else's ca");
        let (rogue, rogue_key) =
            leaf("termproxy-viewer", ExtendedKeyUsagePurpose::ClientAuth, &other_ca, &other_key);
        pki.write("rogue.crt", &rogue.pem());
        pki.write("rogue.key", &rogue_key.serialize_pem());

        pki
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, pem: &str) {
        std::fs::write(self.path(name), pem).expect("failed to write pem");
    }

    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tls::server_acceptor(
            &self.path("ca.crt"),
            &self.path("server.crt"),
            &self.path("server.key"),
        )
        .expect("server tls setup failed")
    }

    /// A connector presenting `<name>.crt`/`<name>.key`.
    pub fn connector(&self, name: &str) -> TlsConnector {
        tls::client_connector(
            &self.path("ca.crt"),
            &self.path("server.crt"),
            &self.path(&format!("{name}.crt")),
            &self.path(&format!("{name}.key")),
        )
        .expect("client tls setup failed")
    }

    /// A connector that trusts the server but presents no certificate.
    pub fn anonymous_connector(&self) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        for cert in tls::load_certs(&self.path("ca.crt")).expect("failed to load ca") {
            roots.add(cert).expect("bad ca certificate");
        }
        let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .expect("no protocol versions")
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

fn authority(name: &str) -> (Certificate, KeyPair) {
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let key = KeyPair::generate().expect("ca key");
    let cert = params.self_signed(&key).expect("ca cert");
    (cert, key)
}

fn leaf(
    name: &str,
    usage: ExtendedKeyUsagePurpose,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> (Certificate, KeyPair) {
    let mut params = CertificateParams::new(vec![name.to_string()]).expect("leaf params");
    params.distinguished_name.push(DnType::CommonName, name);
    params.extended_key_usages = vec![usage];
    let key = KeyPair::generate().expect("leaf key");
    let cert = params.signed_by(&key, ca, ca_key).expect("leaf cert");
    (cert, key)
}

// ── Polling helpers ─────────────────────────────────────────────────

/// Poll `cond` until it holds or the timeout passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Wait until exactly `n` viewers are registered.
pub async fn wait_for_viewers(session: &Session, n: usize) -> bool {
    wait_until(|| session.registry().len() == n).await
}

/// Await `fut`, failing the test if it takes longer than the timeout.
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

// ── Binaries ────────────────────────────────────────────────────────

pub fn server_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_termproxy"))
}

pub fn client_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_termproxy-client"))
}

/// A `Command` for `bin` with the certificate env vars cleared, so the
/// developer's environment cannot change which files get loaded.
pub fn isolated_command(bin: PathBuf) -> std::process::Command {
    let mut cmd = std::process::Command::new(bin);
    for var in [
        "TERMPROXY_CA",
        "TERMPROXY_CERT",
        "TERMPROXY_KEY",
        "TERMPROXY_SERVERCERT",
        "RUST_LOG",
        "DEBUG",
    ] {
        cmd.env_remove(var);
    }
    cmd.stdin(std::process::Stdio::null());
    cmd
}
