//! virt-dial - libvirt connectivity check
//!
//! Dials a connection URI and reports whether a stream to the daemon could be
//! opened. `--inspect` shows what would be dialed without connecting.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use virtdial::ssh::SshDialer;
use virtdial::transport::{tcp::DEFAULT_TCP_PORT, tls::DEFAULT_TLS_PORT, unix::DEFAULT_SOCKET};
use virtdial::{ConnectionUri, DialOptions, Result, Transport};

/// Open a connection to a libvirt daemon
#[derive(Parser)]
#[command(name = "virt-dial", version, about = "Open a connection to a libvirt daemon and report the result")]
struct Cli {
    /// Connection URI, e.g. qemu+ssh://root@host/system
    uri: String,

    /// JSON file with dial options
    #[arg(long)]
    options: Option<PathBuf>,

    /// Print the resolved connection parameters without connecting
    #[arg(long)]
    inspect: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    virtdial::init_logging(if cli.verbose { "debug" } else { "info" });

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let uri = ConnectionUri::parse(&cli.uri)?;
    let options = match &cli.options {
        Some(path) => DialOptions::load(path).await?,
        None => DialOptions::default(),
    };

    if cli.inspect {
        return inspect(&uri, &options).await;
    }

    let started = Instant::now();
    let mut stream = virtdial::dial_with(&uri, &options).await?;
    println!("connected to {} in {:.2?}", uri, started.elapsed());

    if let Err(e) = stream.shutdown().await {
        debug!("shutdown: {}", e);
    }
    Ok(())
}

async fn inspect(uri: &ConnectionUri, options: &DialOptions) -> Result<()> {
    let transport = Transport::from_uri(uri)?;
    let host = uri.hostname();

    println!("driver:      {}", uri.driver());
    println!("transport:   {}", transport);
    println!("host:        {}", if host.is_empty() { "-" } else { host.as_str() });

    let port = match transport {
        Transport::Unix => None,
        Transport::Tcp => Some(uri.port().unwrap_or(DEFAULT_TCP_PORT)),
        Transport::Tls => Some(uri.port().unwrap_or(DEFAULT_TLS_PORT)),
        Transport::Ssh => Some(uri.port().unwrap_or(virtdial::ssh::route::DEFAULT_SSH_PORT)),
    };
    match port {
        Some(port) => println!("port:        {}", port),
        None => println!("port:        -"),
    }
    println!("remote name: {}", uri.remote_name());

    if matches!(transport, Transport::Unix | Transport::Ssh) {
        let socket = uri
            .param("socket")
            .unwrap_or_else(|| DEFAULT_SOCKET.to_string());
        println!("socket:      {}", socket);
    }

    if transport == Transport::Ssh {
        let route = SshDialer::from_process().plan(uri, options).await?;
        println!("route:");
        for (i, hop) in route.iter().enumerate() {
            if hop.target == hop.host {
                println!("  {}. {}", i + 1, hop);
            } else {
                println!("  {}. {} ({})", i + 1, hop, hop.target);
            }
        }
    }

    Ok(())
}
