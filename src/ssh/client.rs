//! russh client handler for one hop

use std::sync::Arc;

use russh::client;
use russh::keys::PublicKey;
use tracing::{info, warn};

use super::known_hosts::{HostKeyVerification, KnownHosts};
use crate::error::DialError;

/// Client handler for russh callbacks
///
/// Verifies the server key of one hop against the shared known hosts set.
/// With no known hosts attached, every key is accepted.
pub struct ClientHandler {
    /// Host name as dialed (after HostName resolution)
    host: String,
    port: u16,
    known_hosts: Option<Arc<KnownHosts>>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, known_hosts: Option<Arc<KnownHosts>>) -> Self {
        Self {
            host,
            port,
            known_hosts,
        }
    }

    fn check(&self, server_public_key: &PublicKey) -> Result<bool, DialError> {
        let Some(known_hosts) = &self.known_hosts else {
            warn!(
                "Skipping host key verification for {}:{} (fingerprint: {})",
                self.host,
                self.port,
                KnownHosts::fingerprint(server_public_key)
            );
            return Ok(true);
        };

        let verification = known_hosts.verify(&self.host, self.port, server_public_key);
        if verification == HostKeyVerification::Verified {
            info!("Host key verified for {}:{}", self.host, self.port);
        }
        verification
            .into_result(&format!("{}:{}", self.host, self.port))
            .map(|_| true)
    }
}

impl client::Handler for ClientHandler {
    type Error = DialError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.check(server_public_key)
    }
}
