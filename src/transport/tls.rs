//! TLS transport
//!
//! Mutual TLS to libvirtd. The CA certificate and the client certificate/key
//! pair are searched for in the usual PKI directories (or a single `pkipath`
//! directory), the session is set up with rustls, and the daemon then sends
//! one byte reporting whether it accepted our certificate.
//!
//! Search order for a non-root process:
//! ```text
//! cacert.pem      ~/.pki/libvirt  /etc/pki/CA
//! clientcert.pem  ~/.pki/libvirt  /etc/pki/libvirt
//! clientkey.pem   ~/.pki/libvirt  /etc/pki/libvirt/private
//! ```
//! Root skips the per-user directory.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio::io::AsyncReadExt;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::tcp::{connect_tcp, display_addr};
use super::Dialer;
use crate::config::DialOptions;
use crate::error::{DialError, Result};
use crate::stream::BoxedStream;
use crate::uri::ConnectionUri;
use crate::util::{expand_path, non_zero};

/// libvirtd TLS port
pub const DEFAULT_TLS_PORT: u16 = 16514;

pub const CA_CERT_FILE: &str = "cacert.pem";
pub const CLIENT_CERT_FILE: &str = "clientcert.pem";
pub const CLIENT_KEY_FILE: &str = "clientkey.pem";

const SYSTEM_CA_DIR: &str = "/etc/pki/CA";
const SYSTEM_CERT_DIR: &str = "/etc/pki/libvirt";
const SYSTEM_KEY_DIR: &str = "/etc/pki/libvirt/private";

/// Per-user PKI directory, relative to home
const USER_PKI_DIR: &str = ".pki/libvirt";

/// Value the daemon sends once it has accepted our certificate
const SERVER_VERIFICATION_OK: u8 = 1;

/// Ordered directories searched for each PKI artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPaths {
    pub ca_cert: Vec<PathBuf>,
    pub client_cert: Vec<PathBuf>,
    pub client_key: Vec<PathBuf>,
}

impl SearchPaths {
    /// Directories for `uri`: `pkipath` wins for all three artifacts,
    /// otherwise the system directories with the per-user one in front
    /// unless running as root.
    pub fn resolve(uri: &ConnectionUri, is_root: bool, home: Option<&Path>) -> Self {
        if let Some(pkipath) = uri.param("pkipath") {
            let dir = vec![expand_path(&pkipath)];
            return Self {
                ca_cert: dir.clone(),
                client_cert: dir.clone(),
                client_key: dir,
            };
        }

        let mut paths = Self {
            ca_cert: vec![PathBuf::from(SYSTEM_CA_DIR)],
            client_cert: vec![PathBuf::from(SYSTEM_CERT_DIR)],
            client_key: vec![PathBuf::from(SYSTEM_KEY_DIR)],
        };

        if !is_root {
            if let Some(home) = home {
                let user_dir = home.join(USER_PKI_DIR);
                for dirs in [
                    &mut paths.ca_cert,
                    &mut paths.client_cert,
                    &mut paths.client_key,
                ] {
                    dirs.insert(0, user_dir.clone());
                }
            }
        }

        paths
    }

    /// [`SearchPaths::resolve`] for the current process.
    pub fn for_process(uri: &ConnectionUri) -> Self {
        let home = dirs::home_dir();
        Self::resolve(uri, running_as_root(), home.as_deref())
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::getuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

/// First regular file called `name` in `dirs`.
///
/// Missing entries are skipped; any other filesystem error aborts the search.
pub async fn find_resource(name: &str, dirs: &[PathBuf]) -> Result<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(name);
        match tokio::fs::metadata(&candidate).await {
            Ok(meta) if meta.is_file() => return Ok(candidate),
            Ok(_) => debug!("{:?} is not a regular file, skipping", candidate),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(DialError::Io(e)),
        }
    }

    Err(DialError::ResourceNotFound {
        name: name.to_string(),
        searched: dirs.to_vec(),
    })
}

/// Located CA certificate and client certificate/key files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl CertificateBundle {
    pub async fn locate(paths: &SearchPaths) -> Result<Self> {
        Ok(Self {
            ca_cert: find_resource(CA_CERT_FILE, &paths.ca_cert).await?,
            client_cert: find_resource(CLIENT_CERT_FILE, &paths.client_cert).await?,
            client_key: find_resource(CLIENT_KEY_FILE, &paths.client_key).await?,
        })
    }
}

async fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = tokio::fs::read(path).await?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DialError::Certificate(format!("failed to parse {:?}: {}", path, e)))
}

async fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = tokio::fs::read(path).await?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| DialError::Certificate(format!("failed to parse {:?}: {}", path, e)))?
        .ok_or_else(|| DialError::Certificate(format!("no private key found in {:?}", path)))
}

async fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let certs = read_certificates(path).await?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!("Ignored {} unparsable certificate(s) in {:?}", ignored, path);
    }
    if added == 0 {
        return Err(DialError::Certificate(format!(
            "failed to parse CA certificate {:?}",
            path
        )));
    }

    Ok(roots)
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct NoServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client configuration built from a located bundle.
#[derive(Clone)]
pub struct TlsSettings {
    pub bundle: CertificateBundle,
    /// `no_verify` was set to a non-zero value
    pub insecure_skip_verify: bool,
    pub client_config: Arc<ClientConfig>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("bundle", &self.bundle)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish_non_exhaustive()
    }
}

impl TlsSettings {
    /// Locate and load the PKI for `uri` using the process search paths.
    pub async fn from_uri(uri: &ConnectionUri) -> Result<Self> {
        let insecure = uri.param("no_verify").is_some_and(|v| non_zero(&v));
        let bundle = CertificateBundle::locate(&SearchPaths::for_process(uri)).await?;
        Self::load(bundle, insecure).await
    }

    pub async fn load(bundle: CertificateBundle, insecure_skip_verify: bool) -> Result<Self> {
        // The CA must parse even when verification is skipped
        let roots = load_root_store(&bundle.ca_cert).await?;
        let chain = read_certificates(&bundle.client_cert).await?;
        if chain.is_empty() {
            return Err(DialError::Certificate(format!(
                "no certificate found in {:?}",
                bundle.client_cert
            )));
        }
        let key = read_private_key(&bundle.client_key).await?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let builder = if insecure_skip_verify {
            warn!("TLS server certificate verification disabled by no_verify");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoServerVerification(provider)))
        } else {
            builder.with_root_certificates(roots)
        };

        let client_config = builder.with_client_auth_cert(chain, key)?;

        Ok(Self {
            bundle,
            insecure_skip_verify,
            client_config: Arc::new(client_config),
        })
    }
}

/// Mutual-TLS dialer
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsDialer;

impl TlsDialer {
    /// Connect with already loaded settings.
    pub async fn connect(
        &self,
        uri: &ConnectionUri,
        settings: &TlsSettings,
        options: &DialOptions,
    ) -> Result<BoxedStream> {
        let host = uri.hostname();
        let port = uri.port().unwrap_or(DEFAULT_TLS_PORT);
        let target = display_addr(&host, port);

        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| DialError::Tls(format!("invalid server name '{}': {}", host, e)))?;

        let tcp = connect_tcp(&host, port, options.dial_timeout(), "tls").await?;
        let connector = TlsConnector::from(settings.client_config.clone());

        let stream = tokio::time::timeout(options.handshake_timeout(), async {
            let mut stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| DialError::Tls(format!("handshake with {} failed: {}", target, e)))?;

            let status = stream.read_u8().await.map_err(|e| {
                DialError::Tls(format!(
                    "failed to read server verification from {}: {}",
                    target, e
                ))
            })?;
            if status != SERVER_VERIFICATION_OK {
                return Err(DialError::ServerVerification);
            }
            Ok(stream)
        })
        .await
        .map_err(|_| DialError::Timeout(format!("TLS handshake with {} timed out", target)))??;

        debug!("Server {} accepted our certificate", target);
        info!("Connected to {} over tls", target);

        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn dial(&self, uri: &ConnectionUri, options: &DialOptions) -> Result<BoxedStream> {
        let settings = TlsSettings::from_uri(uri).await?;
        self.connect(uri, &settings, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::server::WebPkiClientVerifier;
    use rustls::ServerConfig;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    fn pki_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/pki")
    }

    fn uri(s: &str) -> ConnectionUri {
        ConnectionUri::parse(s).unwrap()
    }

    fn tls_uri(port: u16, query: &str) -> ConnectionUri {
        uri(&format!(
            "qemu+tls://127.0.0.1:{}/system?pkipath={}{}",
            port,
            pki_dir().display(),
            query
        ))
    }

    #[test]
    fn test_search_paths_non_root() {
        let paths = SearchPaths::resolve(&uri("qemu+tls://h/system"), false, Some(Path::new("/home/u")));
        assert_eq!(
            paths.ca_cert,
            vec![PathBuf::from("/home/u/.pki/libvirt"), PathBuf::from("/etc/pki/CA")]
        );
        assert_eq!(
            paths.client_key,
            vec![
                PathBuf::from("/home/u/.pki/libvirt"),
                PathBuf::from("/etc/pki/libvirt/private")
            ]
        );
    }

    #[test]
    fn test_search_paths_root() {
        let paths = SearchPaths::resolve(&uri("qemu+tls://h/system"), true, Some(Path::new("/root")));
        assert_eq!(paths.ca_cert, vec![PathBuf::from("/etc/pki/CA")]);
        assert_eq!(paths.client_cert, vec![PathBuf::from("/etc/pki/libvirt")]);
    }

    #[test]
    fn test_pkipath_overrides_everything() {
        let paths = SearchPaths::resolve(
            &uri("qemu+tls://h/system?pkipath=/opt/pki"),
            false,
            Some(Path::new("/home/u")),
        );
        let expected = vec![PathBuf::from("/opt/pki")];
        assert_eq!(paths.ca_cert, expected);
        assert_eq!(paths.client_cert, expected);
        assert_eq!(paths.client_key, expected);
    }

    #[test]
    fn test_pkipath_is_expanded() {
        let Some(home) = dirs::home_dir() else { return };
        let paths = SearchPaths::resolve(&uri("qemu+tls://h/system?pkipath=~/pki"), false, None);
        assert_eq!(paths.ca_cert, vec![home.join("pki")]);
    }

    #[tokio::test]
    async fn test_find_resource_order_and_miss() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        // a directory with the right name does not count
        std::fs::create_dir(first.path().join(CA_CERT_FILE)).unwrap();
        std::fs::write(second.path().join(CA_CERT_FILE), "x").unwrap();

        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let found = find_resource(CA_CERT_FILE, &dirs).await.unwrap();
        assert_eq!(found, second.path().join(CA_CERT_FILE));

        let err = find_resource(CLIENT_KEY_FILE, &dirs).await.unwrap_err();
        match err {
            DialError::ResourceNotFound { name, searched } => {
                assert_eq!(name, CLIENT_KEY_FILE);
                assert_eq!(searched, dirs);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_no_verify_truth_table() {
        for (value, expected) in [("", false), ("0", false), ("1", true), ("abc", true)] {
            let u = uri(&format!(
                "qemu+tls://h/system?pkipath={}&no_verify={}",
                pki_dir().display(),
                value
            ));
            let settings = TlsSettings::from_uri(&u).await.unwrap();
            assert_eq!(settings.insecure_skip_verify, expected, "no_verify={:?}", value);
            assert_eq!(settings.bundle.ca_cert, pki_dir().join(CA_CERT_FILE));
        }
    }

    #[tokio::test]
    async fn test_missing_client_key_in_pkipath() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::copy(pki_dir().join(CA_CERT_FILE), dir.path().join(CA_CERT_FILE)).unwrap();
        std::fs::copy(pki_dir().join(CLIENT_CERT_FILE), dir.path().join(CLIENT_CERT_FILE)).unwrap();

        let u = uri(&format!("qemu+tls://h/system?pkipath={}", dir.path().display()));
        let err = TlsSettings::from_uri(&u).await.unwrap_err();
        assert!(matches!(err, DialError::ResourceNotFound { ref name, .. } if name == CLIENT_KEY_FILE));
    }

    #[tokio::test]
    async fn test_garbage_ca_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CA_CERT_FILE), "not a certificate\n").unwrap();
        std::fs::copy(pki_dir().join(CLIENT_CERT_FILE), dir.path().join(CLIENT_CERT_FILE)).unwrap();
        std::fs::copy(pki_dir().join(CLIENT_KEY_FILE), dir.path().join(CLIENT_KEY_FILE)).unwrap();

        let u = uri(&format!("qemu+tls://h/system?pkipath={}&no_verify=1", dir.path().display()));
        let err = TlsSettings::from_uri(&u).await.unwrap_err();
        assert!(matches!(err, DialError::Certificate(_)));
    }

    async fn server_config() -> Arc<ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let roots = load_root_store(&pki_dir().join(CA_CERT_FILE)).await.unwrap();
        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .unwrap();
        let chain = read_certificates(&pki_dir().join("servercert.pem")).await.unwrap();
        let key = read_private_key(&pki_dir().join("serverkey.pem")).await.unwrap();

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(chain, key)
            .unwrap();
        Arc::new(config)
    }

    /// Accept one TLS client, send `status` and then `greeting`.
    async fn spawn_daemon(status: u8, greeting: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = TlsAcceptor::from(server_config().await);

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let Ok(mut tls) = acceptor.accept(tcp).await else {
                return;
            };
            let _ = tls.write_all(&[status]).await;
            let _ = tls.write_all(greeting).await;
            let _ = tls.flush().await;
            let mut sink = [0u8; 1];
            let _ = tls.read(&mut sink).await;
        });

        port
    }

    #[tokio::test]
    async fn test_dial_accepted_by_daemon() {
        let port = spawn_daemon(1, b"hello").await;

        let mut stream = TlsDialer
            .dial(&tls_uri(port, ""), &DialOptions::default())
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_dial_rejected_by_daemon() {
        let port = spawn_daemon(0, b"").await;

        let err = TlsDialer
            .dial(&tls_uri(port, ""), &DialOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DialError::ServerVerification));
        assert_eq!(
            err.to_string(),
            "server verification (of our certificate or IP address) failed"
        );
    }

    #[tokio::test]
    async fn test_untrusted_server_needs_no_verify() {
        // Trust the server leaf itself instead of its issuer
        let dir = tempfile::tempdir().unwrap();
        std::fs::copy(pki_dir().join("servercert.pem"), dir.path().join(CA_CERT_FILE)).unwrap();
        std::fs::copy(pki_dir().join(CLIENT_CERT_FILE), dir.path().join(CLIENT_CERT_FILE)).unwrap();
        std::fs::copy(pki_dir().join(CLIENT_KEY_FILE), dir.path().join(CLIENT_KEY_FILE)).unwrap();

        let port = spawn_daemon(1, b"").await;
        let strict = uri(&format!(
            "qemu+tls://127.0.0.1:{}/system?pkipath={}",
            port,
            dir.path().display()
        ));
        let err = TlsDialer
            .dial(&strict, &DialOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DialError::Tls(_)));

        let port = spawn_daemon(1, b"").await;
        let relaxed = uri(&format!(
            "qemu+tls://127.0.0.1:{}/system?pkipath={}&no_verify=1",
            port,
            dir.path().display()
        ));
        assert!(TlsDialer.dial(&relaxed, &DialOptions::default()).await.is_ok());
    }
}
