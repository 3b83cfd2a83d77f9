//! SSH command backend
//!
//! Spawns the system `ssh` binary, which honours the complete OpenSSH client
//! configuration, and speaks to the remote daemon over the child's stdio. The
//! remote side runs `virt-ssh-helper` or `nc -U <socket>` depending on the
//! `proxy` query parameter (see <https://libvirt.org/uri.html#proxy-parameter>).

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::DialOptions;
use crate::error::{DialError, Result};
use crate::stream::BoxedStream;
use crate::transport::unix::DEFAULT_SOCKET;
use crate::transport::Dialer;
use crate::uri::ConnectionUri;
use crate::util::expand_path;

const DEFAULT_NETCAT: &str = "nc";

/// Time the child gets to fail fast (bad options, unknown host) before the
/// stream is handed out.
const STARTUP_GRACE: Duration = Duration::from_millis(100);

/// Remote helper selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// `virt-ssh-helper` when installed, netcat otherwise
    #[default]
    Auto,
    Native,
    Netcat,
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ProxyMode::Auto),
            "native" => Ok(ProxyMode::Native),
            "netcat" => Ok(ProxyMode::Netcat),
            other => Err(format!("unknown proxy mode: {}", other)),
        }
    }
}

/// Everything needed to build the `ssh` command line.
#[derive(Debug, Clone)]
pub struct SshCommand {
    pub program: String,
    pub destination: String,
    pub port: Option<u16>,
    pub socket: String,
    /// URI handed to `virt-ssh-helper`
    pub remote_uri: String,
    pub proxy_mode: ProxyMode,
    pub netcat: String,
    pub key_files: Vec<String>,
    pub known_hosts_file: Option<String>,
    pub strict_host_check: bool,
    pub batch_mode: bool,
    pub forward_agent: bool,
    pub auth_methods: Vec<String>,
}

impl SshCommand {
    pub fn from_uri(uri: &ConnectionUri, options: &DialOptions) -> Self {
        let host = uri.hostname();
        let host = if host.is_empty() {
            "localhost".to_string()
        } else {
            host
        };
        let destination = match uri.username() {
            Some(user) => format!("{}@{}", user, host),
            None => host,
        };

        let path = uri.path();
        let remote_uri = if path.is_empty() || path == "/" {
            format!("{}:///system", uri.driver())
        } else {
            format!("{}://{}", uri.driver(), path)
        };

        let proxy_mode = match uri.param("proxy") {
            Some(mode) => mode.parse().unwrap_or_else(|e| {
                warn!("{}, using 'auto'", e);
                ProxyMode::Auto
            }),
            None => ProxyMode::Auto,
        };

        let mut cmd = Self {
            program: uri
                .param("command")
                .unwrap_or_else(|| options.ssh_command.clone()),
            destination,
            port: uri.port(),
            socket: uri
                .param("socket")
                .unwrap_or_else(|| DEFAULT_SOCKET.to_string()),
            remote_uri,
            proxy_mode,
            netcat: uri
                .param("netcat")
                .unwrap_or_else(|| DEFAULT_NETCAT.to_string()),
            key_files: Vec::new(),
            known_hosts_file: None,
            strict_host_check: !super::skip_host_key_verification(uri),
            batch_mode: true,
            forward_agent: false,
            auth_methods: Vec::new(),
        };

        if let Some(keyfile) = uri.param("keyfile") {
            cmd.key_files
                .push(expand_path(&keyfile).to_string_lossy().into_owned());
        }

        if let Some(known_hosts) = uri.param("knownhosts") {
            cmd.known_hosts_file = Some(expand_path(&known_hosts).to_string_lossy().into_owned());
        }

        if let Some(sshauth) = uri.param("sshauth") {
            for method in sshauth.split(',').map(str::trim) {
                match method {
                    "agent" => cmd.forward_agent = true,
                    "password" | "keyboard-interactive" => cmd.batch_mode = false,
                    _ => {}
                }
                cmd.auth_methods.push(method.to_string());
            }
        }

        cmd
    }

    /// Shell command run on the remote host.
    fn remote_command(&self) -> String {
        let netcat = format!(
            "if \"{nc}\" -q 2>&1 | grep \"requires an argument\" >/dev/null 2>&1; then ARG=-q0; else ARG=; fi; \"{nc}\" $ARG -U {socket}",
            nc = self.netcat,
            socket = self.socket
        );
        match self.proxy_mode {
            ProxyMode::Native => format!("sh -c 'virt-ssh-helper \"{}\"'", self.remote_uri),
            ProxyMode::Netcat => format!("sh -c '{}'", netcat),
            ProxyMode::Auto => format!(
                "sh -c 'which virt-ssh-helper 1>/dev/null 2>&1; if test $? = 0; then virt-ssh-helper \"{}\"; else {}; fi'",
                self.remote_uri, netcat
            ),
        }
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }

        // no tty, no multiplexing, no escape character
        args.extend(
            ["-T", "-o", "ControlPath=none", "-e", "none"]
                .iter()
                .map(|s| s.to_string()),
        );

        for key in &self.key_files {
            args.push("-i".to_string());
            args.push(key.clone());
        }

        let mut option = |value: String| {
            args.push("-o".to_string());
            args.push(value);
        };

        if let Some(known_hosts) = &self.known_hosts_file {
            option(format!("UserKnownHostsFile={}", known_hosts));
        }
        if !self.strict_host_check {
            option("StrictHostKeyChecking=no".to_string());
        }
        if self.batch_mode {
            option("BatchMode=yes".to_string());
        }
        if self.forward_agent {
            option("ForwardAgent=yes".to_string());
        }
        for method in &self.auth_methods {
            let preferred = match method.as_str() {
                "privkey" => "publickey",
                "password" => "password",
                "keyboard-interactive" => "keyboard-interactive",
                _ => continue,
            };
            option(format!("PreferredAuthentications={}", preferred));
        }

        args.push("--".to_string());
        args.push(self.destination.clone());
        args.push(self.remote_command());
        args
    }

    /// Spawn the child and wrap its stdio.
    pub async fn spawn(&self) -> Result<SshCommandStream> {
        let args = self.args();
        info!(
            "SSH command dialer connecting to {} via {}",
            self.destination, self.program
        );
        debug!("ssh args: {:?}", args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DialError::Connect {
                target: self.destination.clone(),
                transport: "ssh",
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(DialError::Ssh("ssh command stdio was not captured".to_string()));
        };

        tokio::time::sleep(STARTUP_GRACE).await;
        if let Some(status) = child.try_wait()? {
            return Err(DialError::Ssh(format!(
                "ssh command terminated prematurely ({})",
                status
            )));
        }

        Ok(SshCommandStream {
            stdin,
            stdout,
            _child: child,
        })
    }
}

/// Byte stream over a running `ssh` child. Dropping it kills the child.
pub struct SshCommandStream {
    stdin: ChildStdin,
    stdout: ChildStdout,
    _child: Child,
}

impl AsyncRead for SshCommandStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for SshCommandStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

/// SSH dialer backed by the system `ssh` binary
#[derive(Debug, Clone, Copy, Default)]
pub struct SshCommandDialer;

#[async_trait]
impl Dialer for SshCommandDialer {
    fn name(&self) -> &'static str {
        "ssh-command"
    }

    async fn dial(&self, uri: &ConnectionUri, options: &DialOptions) -> Result<BoxedStream> {
        let stream = SshCommand::from_uri(uri, options).spawn().await?;
        Ok(Box::new(stream))
    }
}
