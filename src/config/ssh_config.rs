//! SSH Client Config Loader
//!
//! Parses an OpenSSH-style `~/.ssh/config` once per dial and answers per-target
//! queries for the directives the SSH dialer honours:
//! - Basic: Host, HostName, User, Port, IdentityFile
//! - Jumping: ProxyJump (ProxyCommand is detected but never executed)
//! - Host keys: StrictHostKeyChecking, UserKnownHostsFile, HostKeyAlgorithms
//!
//! Lookups follow OpenSSH semantics: blocks are scanned in file order and the
//! first obtained value for a keyword wins. Directives before the first `Host`
//! line apply to every target. `Match` blocks are not evaluated and never match.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::util::match_host_list;

/// SSH config loader errors
#[derive(Debug, thiserror::Error)]
pub enum SshConfigError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Which targets a block applies to
#[derive(Debug, Clone)]
enum BlockScope {
    /// Directives before the first Host/Match line
    Global,
    /// `Host pattern...`
    Host(Vec<String>),
    /// `Match ...` (unsupported, never matches)
    Match,
}

#[derive(Debug, Clone)]
struct Directive {
    /// Lowercased keyword
    key: String,
    value: String,
}

#[derive(Debug, Clone)]
struct ConfigBlock {
    scope: BlockScope,
    directives: Vec<Directive>,
}

impl ConfigBlock {
    fn applies_to(&self, target: &str) -> bool {
        match &self.scope {
            BlockScope::Global => true,
            BlockScope::Host(patterns) => match_host_list(patterns.iter().map(String::as_str), target),
            BlockScope::Match => false,
        }
    }
}

/// A loaded, read-only view over an SSH client configuration file.
#[derive(Debug, Clone, Default)]
pub struct SshConfigView {
    blocks: Vec<ConfigBlock>,
}

/// Get default SSH config path
pub fn default_ssh_config_path() -> Result<PathBuf, SshConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .ok_or(SshConfigError::NoHomeDir)
}

impl SshConfigView {
    /// Load and parse a config file.
    pub async fn load(path: &Path) -> Result<Self, SshConfigError> {
        let content = fs::read_to_string(path).await?;
        let view = Self::parse(&content)?;
        debug!("Loaded ssh config {:?} ({} blocks)", path, view.blocks.len());
        Ok(view)
    }

    /// Parse SSH config content string
    pub fn parse(content: &str) -> Result<Self, SshConfigError> {
        let mut blocks = vec![ConfigBlock {
            scope: BlockScope::Global,
            directives: Vec::new(),
        }];

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = split_directive(line);
            if value.is_empty() {
                return Err(SshConfigError::Parse {
                    line: line_no,
                    message: format!("missing argument for '{}'", key),
                });
            }
            let key_lower = key.to_ascii_lowercase();

            match key_lower.as_str() {
                "host" => {
                    let patterns = value.split_whitespace().map(|p| unquote(p).to_string()).collect();
                    blocks.push(ConfigBlock {
                        scope: BlockScope::Host(patterns),
                        directives: Vec::new(),
                    });
                }
                "match" => {
                    warn!("ssh config line {}: Match blocks are not supported, ignoring", line_no);
                    blocks.push(ConfigBlock {
                        scope: BlockScope::Match,
                        directives: Vec::new(),
                    });
                }
                "include" => {
                    warn!("ssh config line {}: Include is not supported, ignoring", line_no);
                }
                _ => {
                    if let Some(block) = blocks.last_mut() {
                        block.directives.push(Directive {
                            key: key_lower,
                            value: unquote(value).to_string(),
                        });
                    }
                }
            }
        }

        Ok(Self { blocks })
    }

    /// First value of `key` that applies to `target`.
    pub fn get(&self, target: &str, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.blocks
            .iter()
            .filter(|b| b.applies_to(target))
            .flat_map(|b| b.directives.iter())
            .find(|d| d.key == key)
            .map(|d| d.value.as_str())
    }

    /// Every value of `key` that applies to `target`, in file order.
    pub fn get_all(&self, target: &str, key: &str) -> Vec<&str> {
        let key = key.to_ascii_lowercase();
        self.blocks
            .iter()
            .filter(|b| b.applies_to(target))
            .flat_map(|b| b.directives.iter())
            .filter(|d| d.key == key)
            .map(|d| d.value.as_str())
            .collect()
    }

    /// `Port` for the target. Unparsable values are logged and ignored.
    pub fn port(&self, target: &str) -> Option<u16> {
        let value = self.get(target, "Port")?;
        match value.parse() {
            Ok(port) => Some(port),
            Err(e) => {
                warn!("error reading Port attribute for '{}': {}: {}", target, value, e);
                None
            }
        }
    }

    /// `HostName` for the target, with `%h` replaced by the target itself.
    pub fn host_name(&self, target: &str) -> Option<String> {
        self.get(target, "HostName")
            .map(|h| h.replace("%h", target).replace("%%", "%"))
    }

    pub fn user(&self, target: &str) -> Option<&str> {
        self.get(target, "User")
    }

    /// All `IdentityFile` entries, unexpanded.
    pub fn identity_files(&self, target: &str) -> Vec<&str> {
        self.get_all(target, "IdentityFile")
    }

    /// `ProxyJump` value; `none` disables jumping and is reported as `None`.
    pub fn proxy_jump(&self, target: &str) -> Option<&str> {
        self.get(target, "ProxyJump")
            .filter(|v| !v.eq_ignore_ascii_case("none"))
    }

    pub fn proxy_command(&self, target: &str) -> Option<&str> {
        self.get(target, "ProxyCommand")
            .filter(|v| !v.eq_ignore_ascii_case("none"))
    }

    pub fn strict_host_key_checking(&self, target: &str) -> Option<&str> {
        self.get(target, "StrictHostKeyChecking")
    }

    /// `UserKnownHostsFile` entries (the directive accepts several paths).
    pub fn user_known_hosts_files(&self, target: &str) -> Vec<String> {
        self.get(target, "UserKnownHostsFile")
            .map(|v| v.split_whitespace().map(|p| unquote(p).to_string()).collect())
            .unwrap_or_default()
    }

    pub fn host_key_algorithms(&self, target: &str) -> Option<&str> {
        self.get(target, "HostKeyAlgorithms")
    }
}

/// Split an SSH config line into (keyword, argument).
///
/// Handles `Keyword value`, `Keyword=value` and `Keyword = value`.
fn split_directive(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let key = &line[..end];
    let rest = line[end..].trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest);
    (key, rest.trim())
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let content = r#"
# Comment
Host myserver
    HostName example.com
    User admin
    Port 2222
    IdentityFile ~/.ssh/id_rsa

Host otherserver
    HostName other.com
    User root
"#;

        let cfg = SshConfigView::parse(content).unwrap();
        assert_eq!(cfg.host_name("myserver").as_deref(), Some("example.com"));
        assert_eq!(cfg.user("myserver"), Some("admin"));
        assert_eq!(cfg.port("myserver"), Some(2222));
        assert_eq!(cfg.identity_files("myserver"), vec!["~/.ssh/id_rsa"]);

        assert_eq!(cfg.host_name("otherserver").as_deref(), Some("other.com"));
        assert_eq!(cfg.port("otherserver"), None);
        assert_eq!(cfg.get("unrelated", "User"), None);
    }

    #[test]
    fn test_first_value_wins_and_wildcards_apply() {
        let content = r#"
Host prod
    User deploy

Host *
    User nobody
    ServerAliveInterval 60
    IdentityFile ~/.ssh/id_global
"#;

        let cfg = SshConfigView::parse(content).unwrap();
        assert_eq!(cfg.user("prod"), Some("deploy"));
        assert_eq!(cfg.user("dev"), Some("nobody"));
        assert_eq!(cfg.get("prod", "serveraliveinterval"), Some("60"));
        assert_eq!(cfg.identity_files("prod"), vec!["~/.ssh/id_global"]);
    }

    #[test]
    fn test_identity_files_are_collected_in_order() {
        let content = r#"
IdentityFile ~/.ssh/id_first
Host hpc hpc-*
    IdentityFile ~/.ssh/id_hpc
Host *
    IdentityFile ~/.ssh/id_last
"#;

        let cfg = SshConfigView::parse(content).unwrap();
        assert_eq!(
            cfg.identity_files("hpc-login"),
            vec!["~/.ssh/id_first", "~/.ssh/id_hpc", "~/.ssh/id_last"]
        );
        assert_eq!(
            cfg.identity_files("other"),
            vec!["~/.ssh/id_first", "~/.ssh/id_last"]
        );
    }

    #[test]
    fn test_negated_patterns() {
        let content = r#"
Host *.corp !bastion.corp
    ProxyJump bastion.corp
"#;

        let cfg = SshConfigView::parse(content).unwrap();
        assert_eq!(cfg.proxy_jump("db.corp"), Some("bastion.corp"));
        assert_eq!(cfg.proxy_jump("bastion.corp"), None);
    }

    #[test]
    fn test_equals_syntax_and_case_insensitive_keywords() {
        let content = "Host=box\n  HOSTNAME = box.example.com\n  port=2200\n  ProxyCommand=ssh -W %h:%p gw\n";

        let cfg = SshConfigView::parse(content).unwrap();
        assert_eq!(cfg.host_name("box").as_deref(), Some("box.example.com"));
        assert_eq!(cfg.port("box"), Some(2200));
        assert_eq!(cfg.proxy_command("box"), Some("ssh -W %h:%p gw"));
    }

    #[test]
    fn test_proxy_jump_none_and_hostname_token() {
        let content = r#"
Host direct
    ProxyJump none
Host short
    HostName %h.example.com
"#;

        let cfg = SshConfigView::parse(content).unwrap();
        assert_eq!(cfg.proxy_jump("direct"), None);
        assert_eq!(cfg.host_name("short").as_deref(), Some("short.example.com"));
    }

    #[test]
    fn test_match_blocks_never_apply() {
        let content = r#"
Match host foo
    User matched
Host foo
    User hosted
"#;

        let cfg = SshConfigView::parse(content).unwrap();
        assert_eq!(cfg.user("foo"), Some("hosted"));
    }

    #[test]
    fn test_host_key_settings() {
        let content = r#"
Host secure
    StrictHostKeyChecking yes
    UserKnownHostsFile ~/.ssh/known_hosts "/etc/ssh/ssh_known_hosts"
    HostKeyAlgorithms ssh-ed25519,rsa-sha2-512
"#;

        let cfg = SshConfigView::parse(content).unwrap();
        assert_eq!(cfg.strict_host_key_checking("secure"), Some("yes"));
        assert_eq!(
            cfg.user_known_hosts_files("secure"),
            vec!["~/.ssh/known_hosts", "/etc/ssh/ssh_known_hosts"]
        );
        assert_eq!(cfg.host_key_algorithms("secure"), Some("ssh-ed25519,rsa-sha2-512"));
    }

    #[test]
    fn test_bad_port_is_ignored() {
        let cfg = SshConfigView::parse("Host x\n Port abc\n").unwrap();
        assert_eq!(cfg.port("x"), None);
    }

    #[test]
    fn test_missing_argument_is_parse_error() {
        let err = SshConfigView::parse("Host x\n  User\n").unwrap_err();
        match err {
            SshConfigError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = SshConfigView::load(&dir.path().join("nope")).await;
        assert!(matches!(result, Err(SshConfigError::Io(_))));
    }
}
