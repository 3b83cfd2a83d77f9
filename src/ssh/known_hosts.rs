//! Known hosts verification for SSH host keys
//!
//! Reads one or more OpenSSH `known_hosts` files and answers whether a server
//! key is trusted. Supports comma-separated and `[host]:port` names, hashed
//! names (`|1|salt|hash`), wildcard and negated patterns, and the `@revoked`
//! marker. `@cert-authority` lines are ignored.

use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use russh::keys::{PublicKey, PublicKeyBase64};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::DialError;
use crate::util::match_host_list;

type HmacSha1 = Hmac<Sha1>;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Host not in known_hosts (or known only for other key types)
    Unknown { fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
    /// Key is listed under `@revoked`
    Revoked { fingerprint: String },
}

impl HostKeyVerification {
    /// Turn a non-verified outcome into the matching dial error.
    pub fn into_result(self, host: &str) -> Result<(), DialError> {
        match self {
            HostKeyVerification::Verified => Ok(()),
            HostKeyVerification::Unknown { fingerprint } => Err(DialError::HostKeyUnknown {
                host: host.to_string(),
                fingerprint,
            }),
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(DialError::HostKeyMismatch {
                host: host.to_string(),
                expected: expected_fingerprint,
                actual: actual_fingerprint,
            }),
            HostKeyVerification::Revoked { fingerprint } => Err(DialError::HostKeyRevoked {
                host: host.to_string(),
                fingerprint,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Revoked,
    CertAuthority,
}

#[derive(Debug, Clone)]
enum HostMatcher {
    /// Comma-separated pattern list, possibly with `!negations`
    Patterns(Vec<String>),
    /// `|1|base64(salt)|base64(hmac-sha1(salt, name))`
    Hashed { salt: Vec<u8>, hash: Vec<u8> },
}

impl HostMatcher {
    fn parse(field: &str) -> Option<Self> {
        if let Some(rest) = field.strip_prefix("|1|") {
            let (salt, hash) = rest.split_once('|')?;
            return Some(HostMatcher::Hashed {
                salt: BASE64.decode(salt).ok()?,
                hash: BASE64.decode(hash).ok()?,
            });
        }
        Some(HostMatcher::Patterns(
            field.split(',').map(str::to_string).collect(),
        ))
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            HostMatcher::Patterns(patterns) => {
                match_host_list(patterns.iter().map(String::as_str), name)
            }
            HostMatcher::Hashed { salt, hash } => {
                let Ok(mut mac) = HmacSha1::new_from_slice(salt) else {
                    return false;
                };
                mac.update(name.as_bytes());
                mac.verify_slice(hash).is_ok()
            }
        }
    }
}

/// Entry in known_hosts
#[derive(Debug, Clone)]
struct HostKeyEntry {
    marker: Option<Marker>,
    hosts: HostMatcher,
    key_type: String,
    key_data: String,
}

/// A read-only set of known host keys, shared by every hop of one dial.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    entries: Vec<HostKeyEntry>,
    sources: Vec<PathBuf>,
}

impl KnownHosts {
    /// Load and merge the given files.
    ///
    /// Missing files are skipped as long as at least one file was read. Any
    /// other read error fails the load.
    pub async fn load(paths: &[PathBuf]) -> Result<Self, DialError> {
        let mut store = KnownHosts::default();
        let mut first_missing = None;

        for path in paths {
            let content = match tokio::fs::read_to_string(path).await {
                Ok(content) => content,
                Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Known hosts file {:?} does not exist, skipping", path);
                    if first_missing.is_none() {
                        first_missing = Some(DialError::KnownHosts {
                            path: path.clone(),
                            source,
                        });
                    }
                    continue;
                }
                Err(source) => {
                    return Err(DialError::KnownHosts {
                        path: path.clone(),
                        source,
                    })
                }
            };
            let before = store.entries.len();
            store.extend_from_str(&content);
            debug!(
                "Loaded {} known host entries from {:?}",
                store.entries.len() - before,
                path
            );
            store.sources.push(path.clone());
        }

        match first_missing {
            Some(err) if store.sources.is_empty() => Err(err),
            _ => Ok(store),
        }
    }

    /// Parse known_hosts content.
    pub fn parse(content: &str) -> Self {
        let mut store = KnownHosts::default();
        store.extend_from_str(content);
        store
    }

    fn extend_from_str(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace().peekable();
            let marker = match parts.peek() {
                Some(&"@revoked") => Some(Marker::Revoked),
                Some(&"@cert-authority") => Some(Marker::CertAuthority),
                Some(other) if other.starts_with('@') => {
                    warn!("Unknown known_hosts marker {}, skipping line", other);
                    continue;
                }
                _ => None,
            };
            if marker.is_some() {
                parts.next();
            }

            // hostnames keytype base64key [comment]
            let (Some(hosts), Some(key_type), Some(key_data)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };

            let Some(hosts) = HostMatcher::parse(hosts) else {
                debug!("Malformed hashed known_hosts entry, skipping");
                continue;
            };

            self.entries.push(HostKeyEntry {
                marker,
                hosts,
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
            });
        }
    }

    /// Files this store was loaded from.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name under which OpenSSH records `host:port`.
    fn lookup_name(host: &str, port: u16) -> String {
        if port == 22 {
            host.to_string()
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        fingerprint_bytes(&key.public_key_bytes())
    }

    /// Verify a host's public key
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_name = Self::lookup_name(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let matching = self
            .entries
            .iter()
            .filter(|e| e.marker != Some(Marker::CertAuthority))
            .filter(|e| e.hosts.matches(&lookup_name));

        let mut changed_from = None;
        let mut verified = false;
        for entry in matching {
            let same_key = entry.key_data == actual_key_b64;
            match entry.marker {
                Some(Marker::Revoked) if same_key => {
                    warn!("Host key for {} is revoked ({})", lookup_name, fingerprint);
                    return HostKeyVerification::Revoked { fingerprint };
                }
                Some(_) => {}
                None if same_key => verified = true,
                None if entry.key_type == actual_key_type => {
                    changed_from.get_or_insert_with(|| fingerprint_from_b64(&entry.key_data));
                }
                None => {}
            }
        }

        if verified {
            debug!(
                "Host key verified for {} (type: {})",
                lookup_name, actual_key_type
            );
            return HostKeyVerification::Verified;
        }

        if let Some(expected_fingerprint) = changed_from {
            warn!(
                "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                lookup_name, actual_key_type, expected_fingerprint, fingerprint
            );
            return HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            };
        }

        debug!("Unknown host: {}", lookup_name);
        HostKeyVerification::Unknown { fingerprint }
    }
}

fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Compute fingerprint from stored base64 key
fn fingerprint_from_b64(stored_b64: &str) -> String {
    match BASE64.decode(stored_b64) {
        Ok(bytes) => fingerprint_bytes(&bytes),
        Err(_) => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const FIXTURE_KEY: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAICZNQW7+MkJUBrxwan5K9c0GSVyCX1HGPfFvPv5KLt22";
    const OTHER_KEY: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAIIFHVX02126IYvbpDUII9x1lPT4VnLaWz7/c6Qh3C8P1";

    fn fixture_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/ssh/known_hosts")
    }

    fn key(b64: &str) -> PublicKey {
        russh::keys::parse_public_key_base64(b64).unwrap()
    }

    async fn fixture() -> KnownHosts {
        KnownHosts::load(&[fixture_path()]).await.unwrap()
    }

    #[tokio::test]
    async fn test_plain_and_alias_entries() {
        let kh = fixture().await;
        assert_eq!(kh.sources(), &[fixture_path()]);
        assert_eq!(
            kh.verify("plain.example.com", 22, &key(FIXTURE_KEY)),
            HostKeyVerification::Verified
        );
        assert_eq!(
            kh.verify("alias.example.com", 22, &key(FIXTURE_KEY)),
            HostKeyVerification::Verified
        );
    }

    #[tokio::test]
    async fn test_port_specific_entry() {
        let kh = fixture().await;
        assert_eq!(
            kh.verify("ported.example.com", 2222, &key(FIXTURE_KEY)),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            kh.verify("ported.example.com", 22, &key(FIXTURE_KEY)),
            HostKeyVerification::Unknown { .. }
        ));
        // default-port entries do not cover other ports
        assert!(matches!(
            kh.verify("plain.example.com", 2200, &key(FIXTURE_KEY)),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[tokio::test]
    async fn test_changed_key_reports_both_fingerprints() {
        let kh = fixture().await;
        match kh.verify("changed.example.com", 22, &key(FIXTURE_KEY)) {
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                assert_eq!(expected_fingerprint, KnownHosts::fingerprint(&key(OTHER_KEY)));
                assert_eq!(actual_fingerprint, KnownHosts::fingerprint(&key(FIXTURE_KEY)));
            }
            other => panic!("unexpected verification result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hashed_entry() {
        let kh = fixture().await;
        assert_eq!(
            kh.verify("hashed.example.com", 22, &key(FIXTURE_KEY)),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            kh.verify("unhashed.example.com", 22, &key(FIXTURE_KEY)),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[tokio::test]
    async fn test_wildcard_and_negation() {
        let kh = fixture().await;
        assert_eq!(
            kh.verify("node1.wild.example.com", 22, &key(FIXTURE_KEY)),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            kh.verify("bad.wild.example.com", 22, &key(FIXTURE_KEY)),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[tokio::test]
    async fn test_revoked_wins_over_plain_entry() {
        let kh = fixture().await;
        assert!(matches!(
            kh.verify("revoked.example.com", 22, &key(FIXTURE_KEY)),
            HostKeyVerification::Revoked { .. }
        ));
    }

    #[tokio::test]
    async fn test_cert_authority_lines_are_ignored() {
        let kh = fixture().await;
        assert!(matches!(
            kh.verify("node.ca.example.com", 22, &key(OTHER_KEY)),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_file_in_list_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("known_hosts2");
        let kh = KnownHosts::load(&[fixture_path(), missing]).await.unwrap();
        assert_eq!(kh.sources(), &[fixture_path()]);
        assert!(!kh.is_empty());
    }

    #[tokio::test]
    async fn test_all_files_missing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("known_hosts");
        let second = dir.path().join("known_hosts2");
        let err = KnownHosts::load(&[first.clone(), second]).await.unwrap_err();
        match err {
            DialError::KnownHosts { path, source } => {
                assert_eq!(path, first);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_an_error() {
        // a directory is found but cannot be read as a file
        let dir = tempfile::tempdir().unwrap();
        let err = KnownHosts::load(&[fixture_path(), dir.path().to_path_buf()])
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::KnownHosts { path, .. } if path == dir.path()));
    }

    #[test]
    fn test_into_result_maps_errors() {
        assert!(HostKeyVerification::Verified.into_result("h").is_ok());
        let err = HostKeyVerification::Changed {
            expected_fingerprint: "SHA256:a".into(),
            actual_fingerprint: "SHA256:b".into(),
        }
        .into_result("h")
        .unwrap_err();
        assert!(matches!(err, DialError::HostKeyMismatch { .. }));
    }

    #[test]
    fn test_parse_skips_garbage() {
        let kh = KnownHosts::parse("# comment\n\nonlyhost\n|1|!!|!! ssh-ed25519 AAAA\n@weird h k d\n");
        assert!(kh.is_empty());
    }
}
