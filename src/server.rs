use std::{
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::future::join_all;
use serde::Deserialize;
use tokio::{net::TcpListener, sync::broadcast};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ServerConfig,
    },
    TlsAcceptor,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ServerError, TlsError},
    smtp::session::Session,
};

/// Control-plane notification delivered to a running listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

/// Called once per received message with the peer address, the reverse-path,
/// the accepted forward-paths, and the Received-header-prefixed message
/// bytes. Runs on its own task; the return value is ignored and invocations
/// from different sessions may overlap.
pub type Handler = Arc<dyn Fn(SocketAddr, String, Vec<String>, Vec<u8>) + Send + Sync>;

/// Called once per RCPT with the peer address, the reverse-path, and the
/// candidate forward-path. Returning `false` refuses the recipient with a
/// `550 5.1.0`.
pub type RcptHandler = Arc<dyn Fn(SocketAddr, &str, &str) -> bool + Send + Sync>;

/// TLS credentials for STARTTLS and the TLS-only listener mode.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

impl TlsContext {
    /// Load the credentials and build the acceptor shared by every session.
    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        let certs = load_certs(&self.certificate)?;
        let key = load_key(&self.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certificate_load = |source| TlsError::CertificateLoad {
        path: path.display().to_string(),
        source,
    };

    let file = File::open(path).map_err(certificate_load)?;

    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(certificate_load)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let key_load = |reason: String| TlsError::KeyLoad {
        path: path.display().to_string(),
        reason,
    };

    let file = File::open(path).map_err(|err| key_load(err.to_string()))?;
    let mut reader = BufReader::new(file);

    match rustls_pemfile::read_one(&mut reader).map_err(|err| key_load(err.to_string()))? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(key_load(
            "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)".to_string(),
        )),
    }
}

/// The receiver configuration, read-only once serving starts.
#[derive(Clone, Deserialize)]
pub struct Server {
    /// TCP address to listen on.
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Application name used in the banner and the Received header.
    #[serde(default = "default_appname")]
    pub appname: String,

    /// Hostname advertised in the banner and EHLO/HELO greetings.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Idle deadline in seconds applied to every read and write; 0 disables.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum message size in bytes, advertised via SIZE (RFC 1870);
    /// 0 means no limit.
    #[serde(default)]
    pub max_size: usize,

    /// TLS credentials; STARTTLS is only offered when these are set.
    #[serde(default)]
    pub tls: Option<TlsContext>,

    /// Refuse every command except NOOP, EHLO, STARTTLS, and QUIT until the
    /// connection is TLS (RFC 3207). Ignored unless TLS is configured.
    #[serde(default)]
    pub tls_required: bool,

    /// Accept TLS connections directly on the listener instead of upgrading
    /// via STARTTLS. Ignored unless TLS is configured.
    #[serde(default)]
    pub tls_listener: bool,

    #[serde(skip)]
    pub(crate) handler: Option<Handler>,

    #[serde(skip)]
    pub(crate) rcpt_handler: Option<RcptHandler>,
}

fn default_addr() -> String {
    "0.0.0.0:25".to_string()
}

fn default_appname() -> String {
    "smtpd".to_string()
}

fn default_hostname() -> String {
    // An exported HOSTNAME overrides the OS hostname
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }

    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    if hostname.is_empty() {
        "localhost".to_string()
    } else {
        hostname
    }
}

const fn default_timeout_secs() -> u64 {
    // 5 minutes per RFC 5321 section 4.5.3.2
    300
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            appname: default_appname(),
            hostname: default_hostname(),
            timeout_secs: default_timeout_secs(),
            max_size: 0,
            tls: None,
            tls_required: false,
            tls_listener: false,
            handler: None,
            rcpt_handler: None,
        }
    }
}

impl Server {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP address to listen on
    #[must_use]
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Set the application name used in the banner and the Received header
    #[must_use]
    pub fn with_appname(mut self, appname: impl Into<String>) -> Self {
        self.appname = appname.into();
        self
    }

    /// Set the advertised hostname
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the idle deadline in seconds; 0 disables it
    #[must_use]
    pub const fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the maximum message size in bytes; 0 means no limit
    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the TLS credentials enabling STARTTLS
    #[must_use]
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Require TLS before any command other than NOOP, EHLO, STARTTLS, QUIT
    #[must_use]
    pub const fn with_tls_required(mut self, required: bool) -> Self {
        self.tls_required = required;
        self
    }

    /// Accept TLS directly on the listener instead of via STARTTLS
    #[must_use]
    pub const fn with_tls_listener(mut self, tls_listener: bool) -> Self {
        self.tls_listener = tls_listener;
        self
    }

    /// Set the message handler
    #[must_use]
    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the per-recipient handler
    #[must_use]
    pub fn with_rcpt_handler(mut self, rcpt_handler: RcptHandler) -> Self {
        self.rcpt_handler = Some(rcpt_handler);
        self
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn listen_and_serve(
        self,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ServerError> {
        let listener =
            TcpListener::bind(&self.addr)
                .await
                .map_err(|source| ServerError::BindFailed {
                    address: self.addr.clone(),
                    source,
                })?;

        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener`, spawning one session task each,
    /// until `Signal::Shutdown` arrives; live sessions are drained before
    /// returning. Transient accept errors are logged and retried.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ServerError> {
        let acceptor = match self.tls.as_ref() {
            Some(tls) => Some(tls.acceptor()?),
            None => None,
        };

        info!(target: "mailslot::server", "serving SMTP on {:?}", listener.local_addr().ok());

        let server = Arc::new(self);
        let mut sessions = Vec::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        info!(target: "mailslot::server", "received shutdown, finishing sessions ...");
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = listener.accept() => {
                    match connection {
                        Err(err) => warn!(target: "mailslot::server", "failed to accept connection: {err}"),
                        Ok((stream, peer)) => {
                            debug!(target: "mailslot::server", peer = %peer, "connection received");

                            let server = Arc::clone(&server);
                            let acceptor = acceptor.clone();

                            sessions.push(tokio::spawn(async move {
                                if server.tls_listener {
                                    if let Some(tls) = acceptor.clone() {
                                        match tls.accept(stream).await {
                                            Ok(stream) => {
                                                let session = Session::create(
                                                    server, stream, peer, acceptor, true,
                                                )
                                                .await;
                                                finish(session.serve().await);
                                            }
                                            Err(err) => warn!(
                                                target: "mailslot::server",
                                                peer = %peer,
                                                "TLS accept failed: {err}"
                                            ),
                                        }
                                        return;
                                    }
                                }

                                let session =
                                    Session::create(server, stream, peer, acceptor, false).await;
                                finish(session.serve().await);
                            }));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn finish(result: Result<(), crate::error::SessionError>) {
    match result {
        Ok(()) => {}
        Err(err) if err.is_timeout() => debug!(target: "mailslot::session", "{err}"),
        Err(err) => error!(target: "mailslot::session", "session error: {err}"),
    }
}

#[cfg(test)]
mod test {
    use super::Server;

    #[test]
    fn defaults() {
        let server = Server::new();

        assert_eq!(server.addr, "0.0.0.0:25");
        assert_eq!(server.appname, "smtpd");
        assert_eq!(server.timeout_secs, 300);
        assert_eq!(server.max_size, 0);
        assert!(server.tls.is_none());
        assert!(!server.tls_required);
        assert!(!server.tls_listener);
    }

    #[test]
    fn deserialized_config_fills_defaults() {
        let server: Server = serde_json::from_str(
            r#"{"addr": "127.0.0.1:2525", "max_size": 1024}"#,
        )
        .unwrap();

        assert_eq!(server.addr, "127.0.0.1:2525");
        assert_eq!(server.max_size, 1024);
        assert_eq!(server.appname, "smtpd");
        assert_eq!(server.timeout_secs, 300);
    }
}
