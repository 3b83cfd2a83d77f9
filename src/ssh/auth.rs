//! SSH authentication method resolution
//!
//! Turns the `sshauth` query parameter into the ordered list of methods
//! offered to one hop:
//! - `agent`: the ssh-agent at `SSH_AUTH_SOCK`, skipped when absent or unreachable
//! - `privkey`: `keyfile`, then every `IdentityFile`, then (only if both are
//!   empty) the default identities under `~/.ssh`
//! - `ssh-password`: the password carried in the URI
//!
//! Unreadable candidates are logged and skipped. Only an empty result is fatal,
//! and that decision belongs to the caller.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::client::Handle;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PrivateKey;
use tracing::{debug, error, info, warn};

use super::agent::SshAgentClient;
use super::client::ClientHandler;
use super::SshEnvironment;
use crate::config::SshConfigView;
use crate::error::DialError;
use crate::uri::ConnectionUri;
use crate::util::expand_path;

/// `sshauth` when the URI does not set it
pub const DEFAULT_SSH_AUTH: &str = "agent,privkey";

/// Default identity files, relative to `~/.ssh`
pub const DEFAULT_IDENTITY_FILES: &[&str] = &[
    "id_ed25519",
    "id_ecdsa",
    "id_ecdsa_sk",
    "id_ed25519_sk",
    "id_rsa",
];

/// One authentication mechanism offered to the server
pub enum AuthMethod {
    Agent(SshAgentClient),
    PrivateKey { path: PathBuf, key: Arc<PrivateKey> },
    Password(String),
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Agent(_) => "agent",
            AuthMethod::PrivateKey { .. } => "publickey",
            AuthMethod::Password(_) => "password",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Agent(_) => f.write_str("Agent"),
            AuthMethod::PrivateKey { path, key } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("algorithm", &key.algorithm().as_str())
                .finish(),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Ordered candidate key paths for `privkey`.
pub fn key_candidates(
    uri: &ConnectionUri,
    target: &str,
    ssh_config: &SshConfigView,
    env: &SshEnvironment,
) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(keyfile) = uri.param("keyfile") {
        candidates.push(expand_path(&keyfile));
    }

    candidates.extend(
        ssh_config
            .identity_files(target)
            .into_iter()
            .map(expand_path),
    );

    if candidates.is_empty() {
        if let Some(home) = &env.home {
            let ssh_dir = home.join(".ssh");
            candidates.extend(DEFAULT_IDENTITY_FILES.iter().map(|name| ssh_dir.join(name)));
        }
    }

    candidates
}

/// Read and decode an unencrypted private key.
async fn load_private_key(path: &Path) -> Result<PrivateKey, DialError> {
    let key_data = tokio::fs::read_to_string(path).await?;
    Ok(russh::keys::decode_secret_key(&key_data, None)?)
}

/// Resolve the methods offered to `target`.
pub async fn resolve_auth_methods(
    uri: &ConnectionUri,
    target: &str,
    ssh_config: &SshConfigView,
    env: &SshEnvironment,
) -> Vec<AuthMethod> {
    let sshauth = uri
        .param("sshauth")
        .unwrap_or_else(|| DEFAULT_SSH_AUTH.to_string());

    let mut methods = Vec::new();

    for token in sshauth.split(',').map(str::trim) {
        match token {
            "agent" => {
                let Some(socket) = &env.agent_socket else {
                    debug!("SSH_AUTH_SOCK not set, skipping agent auth");
                    continue;
                };
                match SshAgentClient::connect_uds(socket).await {
                    Ok(agent) => methods.push(AuthMethod::Agent(agent)),
                    Err(e) => error!("{}", e),
                }
            }
            "privkey" => {
                for path in key_candidates(uri, target, ssh_config, env) {
                    match load_private_key(&path).await {
                        Ok(key) => {
                            debug!("Loaded private key {:?} ({})", path, key.algorithm());
                            methods.push(AuthMethod::PrivateKey {
                                path,
                                key: Arc::new(key),
                            });
                        }
                        Err(DialError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                            debug!("Private key {:?} not found, skipping", path);
                        }
                        Err(e) => error!("Failed to load private key {:?}: {}", path, e),
                    }
                }
            }
            "ssh-password" => match uri.password() {
                Some(password) => methods.push(AuthMethod::Password(password)),
                None => error!("ssh-password auth requested but no password in URI"),
            },
            "" => {}
            other => warn!("Unsupported SSH auth method '{}', ignoring", other),
        }
    }

    methods
}

/// Offer each method in order until the server accepts one.
pub async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    host: &str,
    user: &str,
    methods: Vec<AuthMethod>,
) -> Result<(), DialError> {
    for method in methods {
        let name = method.name();
        let accepted = match method {
            AuthMethod::Agent(mut agent) => agent.authenticate(handle, user).await?,
            AuthMethod::PrivateKey { path, key } => {
                let hash_alg = if key.algorithm().is_rsa() {
                    handle.best_supported_rsa_hash().await?.flatten()
                } else {
                    None
                };
                debug!("Offering key {:?}", path);
                handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
                    .await?
                    .success()
            }
            AuthMethod::Password(password) => {
                handle.authenticate_password(user, password).await?.success()
            }
        };

        if accepted {
            info!("Authenticated to {}@{} via {}", user, host, name);
            return Ok(());
        }
        debug!("{} authentication rejected by {}", name, host);
    }

    Err(DialError::AuthenticationFailed {
        host: host.to_string(),
        user: user.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_key() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/ssh/id_ed25519")
    }

    fn env_without_agent(home: Option<PathBuf>) -> SshEnvironment {
        SshEnvironment {
            agent_socket: None,
            home,
        }
    }

    fn uri(s: &str) -> ConnectionUri {
        ConnectionUri::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_agent_without_socket_yields_nothing() {
        let methods = resolve_auth_methods(
            &uri("qemu+ssh://h/system?sshauth=agent"),
            "h",
            &SshConfigView::default(),
            &env_without_agent(None),
        )
        .await;
        assert!(methods.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let env = SshEnvironment {
            agent_socket: Some(dir.path().join("agent.sock")),
            home: None,
        };
        let methods = resolve_auth_methods(
            &uri("qemu+ssh://h/system?sshauth=agent"),
            "h",
            &SshConfigView::default(),
            &env,
        )
        .await;
        assert!(methods.is_empty());
    }

    #[tokio::test]
    async fn test_keyfile_param_is_loaded() {
        let u = uri(&format!(
            "qemu+ssh://h/system?sshauth=privkey&keyfile={}",
            fixture_key().display()
        ));
        let methods =
            resolve_auth_methods(&u, "h", &SshConfigView::default(), &env_without_agent(None)).await;
        assert_eq!(methods.len(), 1);
        match &methods[0] {
            AuthMethod::PrivateKey { path, .. } => assert_eq!(path, &fixture_key()),
            other => panic!("unexpected method: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_candidates_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("garbage");
        std::fs::write(&garbage, "not a key").unwrap();

        let config = SshConfigView::parse(&format!(
            "Host h\n  IdentityFile {}\n  IdentityFile {}\n  IdentityFile {}\n",
            dir.path().join("missing").display(),
            garbage.display(),
            fixture_key().display(),
        ))
        .unwrap();

        let methods = resolve_auth_methods(
            &uri("qemu+ssh://h/system?sshauth=privkey"),
            "h",
            &config,
            &env_without_agent(None),
        )
        .await;
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].name(), "publickey");
    }

    #[test]
    fn test_candidate_precedence() {
        let config = SshConfigView::parse("Host h\n  IdentityFile /cfg/id_a\n").unwrap();
        let env = env_without_agent(Some(PathBuf::from("/home/u")));

        let u = uri("qemu+ssh://h/system?keyfile=/uri/key");
        assert_eq!(
            key_candidates(&u, "h", &config, &env),
            vec![PathBuf::from("/uri/key"), PathBuf::from("/cfg/id_a")]
        );

        // defaults only when nothing else is configured
        let u = uri("qemu+ssh://other/system");
        let candidates = key_candidates(&u, "other", &config, &env);
        assert_eq!(candidates.len(), DEFAULT_IDENTITY_FILES.len());
        assert_eq!(candidates[0], PathBuf::from("/home/u/.ssh/id_ed25519"));
        assert_eq!(candidates[4], PathBuf::from("/home/u/.ssh/id_rsa"));
    }

    #[tokio::test]
    async fn test_default_identities_under_home() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir(home.path().join(".ssh")).unwrap();
        std::fs::copy(fixture_key(), home.path().join(".ssh/id_ed25519")).unwrap();

        let methods = resolve_auth_methods(
            &uri("qemu+ssh://h/system"),
            "h",
            &SshConfigView::default(),
            &env_without_agent(Some(home.path().to_path_buf())),
        )
        .await;
        assert_eq!(methods.len(), 1);
    }

    #[tokio::test]
    async fn test_password_requires_uri_password() {
        let env = env_without_agent(None);
        let cfg = SshConfigView::default();

        let methods =
            resolve_auth_methods(&uri("qemu+ssh://root@h/system?sshauth=ssh-password"), "h", &cfg, &env)
                .await;
        assert!(methods.is_empty());

        let methods = resolve_auth_methods(
            &uri("qemu+ssh://root:pw@h/system?sshauth=ssh-password,bogus"),
            "h",
            &cfg,
            &env,
        )
        .await;
        assert_eq!(methods.len(), 1);
        match &methods[0] {
            AuthMethod::Password(p) => assert_eq!(p, "pw"),
            other => panic!("unexpected method: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_order_follows_sshauth() {
        let u = uri(&format!(
            "qemu+ssh://root:pw@h/system?sshauth=ssh-password,privkey&keyfile={}",
            fixture_key().display()
        ));
        let methods =
            resolve_auth_methods(&u, "h", &SshConfigView::default(), &env_without_agent(None)).await;
        let names: Vec<_> = methods.iter().map(AuthMethod::name).collect();
        assert_eq!(names, vec!["password", "publickey"]);
    }
}
