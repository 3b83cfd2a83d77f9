//! SSH Agent authentication
//!
//! Connects to the agent socket named by `SSH_AUTH_SOCK` via russh's
//! [`AgentClient`] and delegates challenge signing to it.
//!
//! # Authentication Flow
//! 1. Connect to the agent's Unix socket
//! 2. Request identity list from agent ([`AgentClient::request_identities`])
//! 3. For each key, attempt [`Handle::authenticate_publickey_with`] with [`AgentSigner`]
//! 4. Server sends `Reply::SignRequest { key, data }`, russh calls
//!    [`Signer::auth_publickey_sign`] and the agent signs
//!
//! # The `AgentSigner` wrapper
//!
//! russh's built-in `impl Signer for AgentClient` returns `impl Future + Send`
//! via RPITIT, which borrows the `PublicKey` from `Reply::SignRequest` across an
//! `.await`. The compiler cannot prove that borrow `Send` (rust-lang/rust#100013),
//! so `AgentSigner` clones the key before entering the async block.

use std::future::Future;
use std::path::Path;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use crate::error::DialError;

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Send-safe wrapper around [`AgentClient`] implementing the [`Signer`] trait.
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// SSH Agent client wrapper
pub struct SshAgentClient {
    agent: DynAgent,
}

impl SshAgentClient {
    /// Connect to the agent listening on `socket`.
    pub async fn connect_uds(socket: &Path) -> Result<Self, DialError> {
        let agent = AgentClient::connect_uds(socket).await.map_err(|e| {
            DialError::Ssh(format!(
                "Failed to connect to SSH Agent at {}: {}",
                socket.display(),
                e
            ))
        })?;
        debug!("Connected to SSH Agent at {}", socket.display());
        Ok(Self {
            agent: agent.dynamic(),
        })
    }

    /// Authenticate with the SSH server using agent-held keys
    ///
    /// Returns `Ok(false)` when the agent holds no key the server accepts.
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, DialError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| DialError::Ssh(format!("Failed to list agent keys: {}", e)))?;

        if keys.is_empty() {
            debug!("SSH Agent has no keys loaded");
            return Ok(false);
        }

        debug!("SSH Agent reports {} key(s)", keys.len());

        // russh picks rsa-sha2-* from the server's ext-info when asked
        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();

        for key in &keys {
            debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());

            let rsa_hash = if key.algorithm().is_rsa() { hash_alg } else { None };
            match handle
                .authenticate_publickey_with(
                    username,
                    key.clone(),
                    rsa_hash,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await
            {
                Ok(result) if result.success() => {
                    info!(
                        "SSH Agent authentication succeeded with key: {}",
                        key.comment()
                    );
                    return Ok(true);
                }
                Ok(_failure) => {
                    debug!("Key rejected by server: {}", key.comment());
                }
                Err(e) => {
                    warn!("Agent signing error for key {}: {}", key.comment(), e);
                }
            }
        }

        Ok(false)
    }
}
