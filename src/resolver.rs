//! Host resolver configuration, read once when a network is created.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostResolver {
    pub nameserver: Option<Ipv4Addr>,
    pub domain: Option<String>,
}

impl HostResolver {
    /// Best effort: a missing or unreadable file yields an empty resolver.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(err) => {
                debug!(path = %path.display(), %err, "no host resolver configuration");
                HostResolver::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Self {
        let mut resolver = HostResolver::default();
        let mut search = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some("nameserver"), Some(addr)) if resolver.nameserver.is_none() => {
                    // IPv6 nameservers are skipped; the gateway only speaks IPv4.
                    if let Ok(addr) = addr.parse::<Ipv4Addr>() {
                        resolver.nameserver = Some(addr);
                    }
                }
                (Some("domain"), Some(name)) if resolver.domain.is_none() => {
                    resolver.domain = Some(name.to_string());
                }
                (Some("search"), Some(name)) if search.is_none() => {
                    search = Some(name.to_string());
                }
                _ => {}
            }
        }

        if resolver.domain.is_none() {
            resolver.domain = search;
        }
        resolver
    }
}
