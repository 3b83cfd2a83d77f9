//! Connection URI model
//!
//! Parses libvirt-style connection strings of the form
//! `driver[+transport]://[user[:password]@]host[:port][/path][?query]`
//! (see <https://libvirt.org/uri.html>) and derives the values the dialers need:
//! transport, driver, remote name, host and port.

use std::fmt;
use std::str::FromStr;

use url::{Host, Url};

use crate::error::DialError;
use crate::util::percent_decode;

/// A parsed connection URI.
///
/// Transport, driver and remote name are always recomputed from the scheme,
/// so they can never disagree with the URI they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUri {
    url: Url,
}

impl ConnectionUri {
    /// Parse a connection string. Fails only on syntactically invalid URIs.
    pub fn parse(uri: &str) -> Result<Self, DialError> {
        let url = Url::parse(uri)?;
        Ok(Self { url })
    }

    /// The underlying URL.
    pub fn as_url(&self) -> &Url {
        &self.url
    }

    /// Raw scheme, e.g. `qemu+ssh`.
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Driver name: the scheme up to the first `+`.
    pub fn driver(&self) -> &str {
        self.scheme().split('+').next().unwrap_or_default()
    }

    /// Transport name.
    ///
    /// The token after `+` when present. Otherwise `tls` when the URI names a
    /// host and `unix` when it does not.
    pub fn transport(&self) -> &str {
        if let Some(transport) = self.scheme().split('+').nth(1) {
            return transport;
        }

        if self.hostname().is_empty() {
            "unix"
        } else {
            "tls"
        }
    }

    /// The name handed to the remote daemon's own `virConnectOpen`.
    ///
    /// The `name` query parameter wins when set. Otherwise the URI is rebuilt
    /// with transport, user info, host, port and query removed, e.g.
    /// `qemu+ssh://root@host:2222/system?keyfile=k` becomes `qemu:///system`.
    pub fn remote_name(&self) -> String {
        if let Some(name) = self.param("name") {
            return name;
        }

        let path = self.url.path();
        let mut name = format!("{}:", self.driver());
        if !path.is_empty() {
            name.push_str("//");
            name.push_str(path);
        }
        if let Some(fragment) = self.url.fragment().filter(|f| !f.is_empty()) {
            name.push('#');
            name.push_str(fragment);
        }
        name
    }

    /// Host name without brackets, or an empty string when the URI has none.
    pub fn hostname(&self) -> String {
        match self.url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => String::new(),
        }
    }

    /// Explicit port, if the URI carries one.
    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Decoded user name from the authority, if any.
    pub fn username(&self) -> Option<String> {
        let raw = self.url.username();
        if raw.is_empty() {
            return None;
        }
        Some(percent_decode(raw).unwrap_or_else(|| raw.to_string()))
    }

    /// Decoded password from the authority, if any.
    pub fn password(&self) -> Option<String> {
        self.url
            .password()
            .map(|raw| percent_decode(raw).unwrap_or_else(|| raw.to_string()))
    }

    /// Path component (`/system`, `/session`, ...).
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// First value of a query parameter, treating an empty value as unset.
    pub fn param(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    }

    /// First raw value of a query parameter, empty values included.
    pub fn raw_param(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Whether the query parameter appears at all, with or without a value.
    pub fn has_param(&self, key: &str) -> bool {
        self.url.query_pairs().any(|(k, _)| k == key)
    }
}

impl FromStr for ConnectionUri {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// A jump host identifier as written in `ProxyJump`: `[user@]host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTarget {
    pub host_name: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

impl ParsedTarget {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            user: None,
            port: None,
        }
    }

    /// Render back to `[user@]host[:port]` form.
    pub fn display(&self) -> String {
        let host = if self.host_name.contains(':') && self.port.is_some() {
            format!("[{}]", self.host_name)
        } else {
            self.host_name.clone()
        };
        match (&self.user, self.port) {
            (Some(user), Some(port)) => format!("{}@{}:{}", user, host, port),
            (Some(user), None) => format!("{}@{}", user, host),
            (None, Some(port)) => format!("{}:{}", host, port),
            (None, None) => host,
        }
    }
}

/// Parse a single `ProxyJump` entry.
pub fn parse_proxy_jump_target(value: &str) -> ParsedTarget {
    let value = value.trim();
    let (user, host_port) = match value.rsplit_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some((_, rest)) => (None, rest),
        None => (None, value),
    };

    // [v6addr]:port or [v6addr]
    if let Some(bracketed) = host_port.strip_prefix('[') {
        if let Some((host, tail)) = bracketed.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return ParsedTarget {
                host_name: host.to_string(),
                user,
                port,
            };
        }
    }

    let (host_name, port) = match host_port.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (host_port.to_string(), None),
        },
        _ => (host_port.to_string(), None),
    };

    ParsedTarget {
        host_name,
        user,
        port,
    }
}
