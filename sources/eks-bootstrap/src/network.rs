use snafu::{ResultExt, Snafu};
use std::net::{AddrParseError, IpAddr, Ipv4Addr};

// This is the default DNS unless the node IP begins with "10."
const DEFAULT_DNS_CLUSTER_IP: &str = "10.100.0.10";
// If the node IP begins with "10." the service CIDR can't also be there, so this is our DNS.
const DEFAULT_10_RANGE_DNS_CLUSTER_IP: &str = "172.20.0.10";

#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display("Unable to parse node IP '{}': {}", ip, source))]
    BadIp { ip: String, source: AddrParseError },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Per-instance networking facts for the kubelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeNetwork {
    pub(crate) internal_ip: String,
    pub(crate) dns_cluster_ip: String,
}

impl NodeNetwork {
    /// Builds the node's network parameters from its private IP as reported by IMDS. A
    /// `configured_dns` address takes precedence over the one derived from the IP.
    pub(crate) fn new(internal_ip: &str, configured_dns: Option<IpAddr>) -> Result<Self> {
        let internal_ip = internal_ip.trim();
        internal_ip
            .parse::<Ipv4Addr>()
            .context(BadIpSnafu { ip: internal_ip })?;

        let dns_cluster_ip = match configured_dns {
            Some(ip) => ip.to_string(),
            None => dns_cluster_ip(internal_ip).to_string(),
        };
        Ok(Self {
            internal_ip: internal_ip.to_string(),
            dns_cluster_ip,
        })
    }
}

/// Picks the cluster DNS address from the node IP. This is a plain prefix test on the address
/// text, not a subnet calculation.
pub(crate) fn dns_cluster_ip(internal_ip: &str) -> &'static str {
    if internal_ip.starts_with("10.") {
        DEFAULT_10_RANGE_DNS_CLUSTER_IP
    } else {
        DEFAULT_DNS_CLUSTER_IP
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ten_range_gets_secondary_dns() {
        assert_eq!(dns_cluster_ip("10.5.1.2"), "172.20.0.10");
        assert_eq!(dns_cluster_ip("10.0.0.1"), "172.20.0.10");
    }

    #[test]
    fn other_ranges_get_primary_dns() {
        assert_eq!(dns_cluster_ip("192.168.1.2"), "10.100.0.10");
        assert_eq!(dns_cluster_ip("172.31.4.7"), "10.100.0.10");
        // Prefix match on "10." only, not on "10"
        assert_eq!(dns_cluster_ip("100.64.0.1"), "10.100.0.10");
    }

    #[test]
    fn configured_dns_wins() {
        let network = NodeNetwork::new("10.5.1.2", Some("10.200.0.10".parse().unwrap())).unwrap();
        assert_eq!(network.dns_cluster_ip, "10.200.0.10");
        assert_eq!(network.internal_ip, "10.5.1.2");
    }

    #[test]
    fn bad_node_ip() {
        assert!(NodeNetwork::new("not-an-ip", None).is_err());
        assert!(NodeNetwork::new("", None).is_err());
    }
}
