//! Scan targets and host-list expansion.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr},
};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on the hosts one target may expand to.
pub const MAX_HOSTS: usize = 65_536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target has no hosts")]
    Empty,

    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("invalid host range: {0}")]
    InvalidRange(String),

    #[error("target expands to more than {limit} hosts")]
    TooManyHosts { limit: usize },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "type")]
    pub kind: String,
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

/// One target block of a start request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanTarget {
    /// Comma separated hosts, CIDR blocks, ranges or hostnames.
    pub hosts: String,
    pub ports: String,
    pub exclude_hosts: String,
    /// Hosts the client already considers done.
    pub finished_hosts: String,
    /// Keyed by service, e.g. `ssh`.
    pub credentials: HashMap<String, Credential>,
    /// Free-form options such as `alive_test`.
    pub options: HashMap<String, String>,
}

impl ScanTarget {
    pub fn new(hosts: impl Into<String>, ports: impl Into<String>) -> Self {
        Self {
            hosts: hosts.into(),
            ports: ports.into(),
            ..Self::default()
        }
    }

    /// Hosts to scan: the expanded host list minus excluded hosts.
    pub fn expanded_hosts(&self) -> Result<Vec<String>, TargetError> {
        let hosts = expand_hosts(&self.hosts)?;
        if hosts.is_empty() {
            return Err(TargetError::Empty);
        }
        let excluded: HashSet<String> = expand_hosts(&self.exclude_hosts)?.into_iter().collect();
        Ok(hosts.into_iter().filter(|h| !excluded.contains(h)).collect())
    }

    pub fn expanded_finished_hosts(&self) -> Result<Vec<String>, TargetError> {
        expand_hosts(&self.finished_hosts)
    }
}

/// Expands a comma separated host specification, preserving order and
/// dropping duplicates.
pub fn expand_hosts(spec: &str) -> Result<Vec<String>, TargetError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        for host in expand_item(item)? {
            if seen.insert(host.clone()) {
                out.push(host);
                if out.len() > MAX_HOSTS {
                    return Err(TargetError::TooManyHosts { limit: MAX_HOSTS });
                }
            }
        }
    }

    Ok(out)
}

fn expand_item(item: &str) -> Result<Vec<String>, TargetError> {
    if item.contains('/') {
        return expand_network(item);
    }

    if item.parse::<IpAddr>().is_ok() {
        return Ok(vec![item.to_string()]);
    }

    if let Some((start, end)) = item.split_once('-')
        && let Ok(start) = start.trim().parse::<Ipv4Addr>()
    {
        let end = end.trim();
        let end = match end.parse::<Ipv4Addr>() {
            Ok(end) => end,
            Err(_) => {
                let last: u8 = end
                    .parse()
                    .map_err(|_| TargetError::InvalidRange(item.to_string()))?;
                let [a, b, c, _] = start.octets();
                Ipv4Addr::new(a, b, c, last)
            }
        };
        return expand_range(item, start, end);
    }

    if is_hostname(item) {
        Ok(vec![item.to_string()])
    } else {
        Err(TargetError::InvalidHost(item.to_string()))
    }
}

fn expand_range(item: &str, start: Ipv4Addr, end: Ipv4Addr) -> Result<Vec<String>, TargetError> {
    let (start, end) = (u32::from(start), u32::from(end));
    if start > end {
        return Err(TargetError::InvalidRange(item.to_string()));
    }
    if (end - start) as usize >= MAX_HOSTS {
        return Err(TargetError::TooManyHosts { limit: MAX_HOSTS });
    }
    Ok((start..=end).map(|ip| Ipv4Addr::from(ip).to_string()).collect())
}

/// Host bits a network may have and still fit in `MAX_HOSTS` addresses.
const MAX_HOST_BITS: u32 = MAX_HOSTS.trailing_zeros();

fn expand_network(item: &str) -> Result<Vec<String>, TargetError> {
    let network: IpNetwork = item
        .parse()
        .map_err(|_| TargetError::InvalidRange(item.to_string()))?;

    // Checked on the prefix: `size()` overflows for /0.
    let host_bits = match network {
        IpNetwork::V4(net) => 32 - u32::from(net.prefix()),
        IpNetwork::V6(net) => 128 - u32::from(net.prefix()),
    };
    if host_bits > MAX_HOST_BITS {
        return Err(TargetError::TooManyHosts { limit: MAX_HOSTS });
    }

    match network {
        IpNetwork::V4(net) => {
            // Network and broadcast addresses are not hosts.
            let skip_edges = net.prefix() <= 30;
            Ok(net
                .iter()
                .filter(|ip| !skip_edges || (*ip != net.network() && *ip != net.broadcast()))
                .map(|ip| ip.to_string())
                .collect())
        }
        IpNetwork::V6(net) => Ok(net.iter().map(|ip| ip.to_string()).collect()),
    }
}

fn is_hostname(item: &str) -> bool {
    item.len() <= 253
        && item.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}
