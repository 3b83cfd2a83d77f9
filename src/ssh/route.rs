//! Bastion route planning
//!
//! Walks `ProxyJump` links from the final target back to the first host that
//! is dialed directly, then returns the hops in connection order. Planning
//! touches no network and is bounded by the hop ceiling, so a `ProxyJump`
//! cycle ends in [`DialError::DepthExceeded`] instead of looping.

use std::fmt;

use tracing::{debug, warn};

use crate::config::SshConfigView;
use crate::error::DialError;
use crate::uri::{parse_proxy_jump_target, ConnectionUri, ParsedTarget};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// One SSH host on the way to the daemon, fully resolved against the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHop {
    /// Name as written in the URI or in `ProxyJump` (the config lookup key)
    pub target: String,
    /// Address actually dialed (`HostName` applied)
    pub host: String,
    pub port: u16,
    pub user: String,
    /// 0 for the final target, +1 per bastion
    pub depth: usize,
}

impl fmt::Display for RouteHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}@[{}]:{}", self.user, self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.user, self.host, self.port)
        }
    }
}

fn resolve_hop(
    target: &ParsedTarget,
    depth: usize,
    uri: &ConnectionUri,
    ssh_config: &SshConfigView,
    local_user: &str,
) -> RouteHop {
    let alias = target.host_name.as_str();

    if let Some(command) = ssh_config.proxy_command(alias) {
        warn!(
            "ProxyCommand '{}' for {} is not supported, ignoring",
            command, alias
        );
    }

    let host = ssh_config
        .host_name(alias)
        .unwrap_or_else(|| alias.to_string());

    let port = ssh_config
        .port(alias)
        .or(target.port)
        .or_else(|| uri.port())
        .unwrap_or(DEFAULT_SSH_PORT);

    let user = ssh_config
        .user(alias)
        .map(str::to_string)
        .or_else(|| target.user.clone())
        .or_else(|| uri.username())
        .unwrap_or_else(|| local_user.to_string());

    RouteHop {
        target: alias.to_string(),
        host,
        port,
        user,
        depth,
    }
}

/// Plan the hop list for `uri`, first hop first.
///
/// `ProxyJump a,b` reaches the target through `b` and `b` through `a`; only
/// the first entry of a list consults its own `ProxyJump`.
pub fn plan_route(
    uri: &ConnectionUri,
    ssh_config: &SshConfigView,
    max_hops: usize,
    local_user: &str,
) -> Result<Vec<RouteHop>, DialError> {
    let host = uri.hostname();
    if host.is_empty() {
        return Err(DialError::Config(
            "ssh transport requires a host in the connection URI".to_string(),
        ));
    }

    let mut current = ParsedTarget {
        host_name: host,
        user: uri.username(),
        port: uri.port(),
    };
    let mut depth = 0;
    // target first, reversed at the end
    let mut route = Vec::new();

    loop {
        if depth > max_hops {
            return Err(DialError::DepthExceeded { max: max_hops });
        }
        route.push(resolve_hop(&current, depth, uri, ssh_config, local_user));

        let Some(jumps) = ssh_config.proxy_jump(&current.host_name) else {
            break;
        };
        debug!("{} is reached through ProxyJump {}", current.host_name, jumps);

        let mut entries: Vec<ParsedTarget> = jumps
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_proxy_jump_target)
            .collect();
        if entries.is_empty() {
            break;
        }

        let first = entries.remove(0);
        for entry in entries.iter().rev() {
            depth += 1;
            if depth > max_hops {
                return Err(DialError::DepthExceeded { max: max_hops });
            }
            route.push(resolve_hop(entry, depth, uri, ssh_config, local_user));
        }

        current = first;
        depth += 1;
    }

    route.reverse();
    Ok(route)
}
