//! SSH transport
//!
//! Reaches the daemon's Unix socket on a remote host through zero or more
//! `ProxyJump` bastions. A dial runs in three steps:
//! 1. [`route::plan_route`] walks the SSH config into an ordered hop list
//! 2. every hop is prepared (known hosts, host key algorithms, auth methods)
//!    before any network I/O
//! 3. [`proxy::connect_chain`] folds the hops into nested sessions and opens
//!    the socket on the last one
//!
//! The SSH config and known hosts files are loaded once per dial and shared
//! read-only by every hop. [`command`] is an alternative backend that drives
//! the system `ssh` binary instead.

pub mod agent;
pub mod auth;
pub mod client;
pub mod command;
pub mod known_hosts;
pub mod proxy;
pub mod route;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::Algorithm;
use tracing::{debug, info, warn};

use crate::config::{default_ssh_config_path, DialOptions, SshConfigView};
use crate::error::{DialError, Result};
use crate::stream::BoxedStream;
use crate::transport::unix::DEFAULT_SOCKET;
use crate::transport::Dialer;
use crate::uri::ConnectionUri;
use crate::util::{expand_path, glob_match};

pub use auth::AuthMethod;
pub use client::ClientHandler;
pub use command::SshCommandDialer;
pub use known_hosts::{HostKeyVerification, KnownHosts};
pub use proxy::SshTunnel;
pub use route::{plan_route, RouteHop};

/// Host key algorithms offered when the config does not say otherwise
pub const DEFAULT_HOST_KEY_ALGORITHMS: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "rsa-sha2-256",
    "rsa-sha2-512",
    "sk-ecdsa-sha2-nistp256@openssh.com",
    "sk-ssh-ed25519@openssh.com",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
];

/// Process inputs consumed by the SSH dialer.
///
/// Read once per top-level dial and passed down explicitly.
#[derive(Debug, Clone, Default)]
pub struct SshEnvironment {
    /// `SSH_AUTH_SOCK`
    pub agent_socket: Option<PathBuf>,
    pub home: Option<PathBuf>,
}

impl SshEnvironment {
    pub fn from_process() -> Self {
        Self {
            agent_socket: std::env::var_os("SSH_AUTH_SOCK")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            home: dirs::home_dir(),
        }
    }
}

/// A hop with everything needed to handshake and authenticate.
#[derive(Debug)]
pub struct PreparedHop {
    pub route: RouteHop,
    /// `None` when host key verification is disabled
    pub known_hosts: Option<Arc<KnownHosts>>,
    pub host_key_algorithms: Vec<Algorithm>,
    pub auth_methods: Vec<AuthMethod>,
}

fn parse_algorithms<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<Algorithm> {
    names
        .into_iter()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .filter_map(|name| match Algorithm::new(name) {
            Ok(alg) => Some(alg),
            Err(e) => {
                warn!("Unsupported host key algorithm '{}': {}", name, e);
                None
            }
        })
        .collect()
}

pub fn default_host_key_algorithms() -> Vec<Algorithm> {
    parse_algorithms(DEFAULT_HOST_KEY_ALGORITHMS.iter().copied())
}

/// Apply a `HostKeyAlgorithms` value to the defaults.
///
/// `+list` appends, `-list` removes (patterns allowed), `^list` prepends and a
/// plain list replaces.
pub fn host_key_algorithms(config_value: Option<&str>) -> Vec<Algorithm> {
    let defaults = default_host_key_algorithms();
    let Some(value) = config_value.map(str::trim).filter(|v| !v.is_empty()) else {
        return defaults;
    };

    let mut algorithms = if let Some(list) = value.strip_prefix('+') {
        let mut algs = defaults;
        for alg in parse_algorithms(list.split(',')) {
            if !algs.contains(&alg) {
                algs.push(alg);
            }
        }
        algs
    } else if let Some(list) = value.strip_prefix('-') {
        let patterns: Vec<&str> = list.split(',').map(str::trim).collect();
        defaults
            .into_iter()
            .filter(|alg| !patterns.iter().any(|p| glob_match(p, alg.as_str())))
            .collect()
    } else if let Some(list) = value.strip_prefix('^') {
        let mut algs = parse_algorithms(list.split(','));
        for alg in defaults {
            if !algs.contains(&alg) {
                algs.push(alg);
            }
        }
        algs
    } else {
        parse_algorithms(value.split(','))
    };

    algorithms.dedup();
    algorithms
}

/// Known hosts files for `target`: `knownhosts` > `UserKnownHostsFile` > `~/.ssh/known_hosts`.
pub fn known_hosts_paths(
    uri: &ConnectionUri,
    target: &str,
    ssh_config: &SshConfigView,
    env: &SshEnvironment,
) -> Result<Vec<PathBuf>> {
    if let Some(path) = uri.param("knownhosts") {
        return Ok(vec![expand_path(&path)]);
    }

    let configured = ssh_config.user_known_hosts_files(target);
    if !configured.is_empty() {
        return Ok(configured.iter().map(|p| expand_path(p)).collect());
    }

    env.home
        .as_ref()
        .map(|home| vec![home.join(".ssh").join("known_hosts")])
        .ok_or_else(|| DialError::Config("cannot locate known_hosts: no home directory".into()))
}

/// Whether the URI turns host key verification off.
pub fn skip_host_key_verification(uri: &ConnectionUri) -> bool {
    uri.param("known_hosts_verify").as_deref() == Some("ignore") || uri.has_param("no_verify")
}

/// Per-dial state shared by every hop.
pub struct DialContext<'a> {
    pub uri: &'a ConnectionUri,
    pub ssh_config: &'a SshConfigView,
    pub env: &'a SshEnvironment,
    known_hosts: HashMap<Vec<PathBuf>, Arc<KnownHosts>>,
}

impl<'a> DialContext<'a> {
    pub fn new(
        uri: &'a ConnectionUri,
        ssh_config: &'a SshConfigView,
        env: &'a SshEnvironment,
    ) -> Self {
        Self {
            uri,
            ssh_config,
            env,
            known_hosts: HashMap::new(),
        }
    }

    async fn known_hosts_for(&mut self, target: &str) -> Result<Option<Arc<KnownHosts>>> {
        if skip_host_key_verification(self.uri) {
            debug!("Host key verification disabled for {}", target);
            return Ok(None);
        }

        // Read for parity with OpenSSH config; it never disables verification
        if let Some(strict) = self.ssh_config.strict_host_key_checking(target) {
            debug!("StrictHostKeyChecking={} for {}", strict, target);
        }

        let paths = known_hosts_paths(self.uri, target, self.ssh_config, self.env)?;
        if let Some(store) = self.known_hosts.get(&paths) {
            return Ok(Some(Arc::clone(store)));
        }
        let store = Arc::new(KnownHosts::load(&paths).await?);
        self.known_hosts.insert(paths, Arc::clone(&store));
        Ok(Some(store))
    }

    /// Resolve everything one hop needs before touching the network.
    pub async fn prepare(&mut self, route: RouteHop) -> Result<PreparedHop> {
        let known_hosts = self.known_hosts_for(&route.target).await?;
        let host_key_algorithms =
            host_key_algorithms(self.ssh_config.host_key_algorithms(&route.target));

        let auth_methods =
            auth::resolve_auth_methods(self.uri, &route.target, self.ssh_config, self.env).await;
        if auth_methods.is_empty() {
            return Err(DialError::NoAuthMethods {
                host: route.to_string(),
            });
        }

        Ok(PreparedHop {
            route,
            known_hosts,
            host_key_algorithms,
            auth_methods,
        })
    }
}

/// Load the SSH client config, degrading to an empty one on any failure.
pub async fn load_ssh_config(options: &DialOptions, env: &SshEnvironment) -> SshConfigView {
    let path = match &options.ssh_config_path {
        Some(path) => path.clone(),
        None => match env.home.as_ref() {
            Some(home) => home.join(".ssh").join("config"),
            None => match default_ssh_config_path() {
                Ok(path) => path,
                Err(e) => {
                    warn!("{}, continuing without ssh config", e);
                    return SshConfigView::default();
                }
            },
        },
    };

    match SshConfigView::load(&path).await {
        Ok(view) => view,
        Err(e) => {
            warn!("Could not load ssh config {:?}: {}, using defaults", path, e);
            SshConfigView::default()
        }
    }
}

/// Native SSH dialer
#[derive(Debug, Clone, Default)]
pub struct SshDialer {
    env: SshEnvironment,
}

impl SshDialer {
    pub fn new(env: SshEnvironment) -> Self {
        Self { env }
    }

    pub fn from_process() -> Self {
        Self::new(SshEnvironment::from_process())
    }

    /// Hop list for `uri` without touching the network.
    pub async fn plan(&self, uri: &ConnectionUri, options: &DialOptions) -> Result<Vec<RouteHop>> {
        let ssh_config = load_ssh_config(options, &self.env).await;
        plan_route(uri, &ssh_config, options.max_hops, &whoami::username())
    }

    /// Plan, prepare and connect the whole route.
    pub async fn connect(&self, uri: &ConnectionUri, options: &DialOptions) -> Result<SshTunnel> {
        let ssh_config = load_ssh_config(options, &self.env).await;
        let route = plan_route(uri, &ssh_config, options.max_hops, &whoami::username())?;

        info!(
            "SSH route: {}",
            route
                .iter()
                .map(RouteHop::to_string)
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        let mut ctx = DialContext::new(uri, &ssh_config, &self.env);
        let mut hops = Vec::with_capacity(route.len());
        for hop in route {
            hops.push(ctx.prepare(hop).await?);
        }

        let socket = uri
            .param("socket")
            .unwrap_or_else(|| DEFAULT_SOCKET.to_string());
        proxy::connect_chain(hops, &socket, options).await
    }
}

#[async_trait]
impl Dialer for SshDialer {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn dial(&self, uri: &ConnectionUri, options: &DialOptions) -> Result<BoxedStream> {
        Ok(Box::new(self.connect(uri, options).await?))
    }
}
