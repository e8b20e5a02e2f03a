//! Address allow/deny lists.

use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::net::IpAddr;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Entry {
    Network(IpNetwork),
    // Entries that are not valid IPs or CIDRs still match by exact string.
    Literal(String),
}

/// A list of IP addresses and CIDR networks.
///
/// Deserializes from a JSON array of strings; `null` is an empty list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Option<Vec<String>>")]
pub struct AddressList {
    entries: Vec<Entry>,
}

impl From<Option<Vec<String>>> for AddressList {
    fn from(values: Option<Vec<String>>) -> Self {
        let entries = values
            .unwrap_or_default()
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(|value| match value.parse::<IpNetwork>() {
                Ok(network) => Entry::Network(network),
                Err(_) => Entry::Literal(value),
            })
            .collect();
        Self { entries }
    }
}

impl<S: Into<String>> FromIterator<S> for AddressList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::from(Some(iter.into_iter().map(Into::into).collect()))
    }
}

impl AddressList {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        let address = address.trim();
        let ip = address.parse::<IpAddr>().ok().map(canonical);
        self.entries.iter().any(|entry| match (entry, ip) {
            (Entry::Network(network), Some(ip)) => network.contains(ip),
            (Entry::Literal(literal), _) => literal == address,
            (Entry::Network(_), None) => false,
        })
    }
}

/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) match IPv4 entries.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}
