//! Local interface discovery
//!
//! Produces the document stored in the `interfaces` session option:
//! `{"interfaces":[{"address":"192.168.1.10","name":"eth0"}]}`.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One usable local address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub address: String,
    pub name: String,
}

/// Serialized form of the `interfaces` option
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceList {
    pub interfaces: Vec<InterfaceAddress>,
}

impl InterfaceList {
    /// Keep IPv4 addresses other than the wildcard and loopback
    pub fn from_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = (S, IpAddr)>,
        S: Into<String>,
    {
        let interfaces = addresses
            .into_iter()
            .filter_map(|(name, ip)| match ip {
                IpAddr::V4(v4) if v4 != Ipv4Addr::UNSPECIFIED && v4 != Ipv4Addr::LOCALHOST => {
                    Some(InterfaceAddress {
                        address: v4.to_string(),
                        name: name.into(),
                    })
                }
                _ => None,
            })
            .collect();
        Self { interfaces }
    }

    /// Query the operating system. Failures yield an empty list.
    pub fn discover() -> Self {
        match if_addrs::get_if_addrs() {
            Ok(addrs) => Self::from_addresses(addrs.into_iter().map(|iface| {
                let ip = iface.ip();
                (iface.name, ip)
            })),
            Err(e) => {
                warn!(error = %e, "Failed to list network interfaces");
                Self::default()
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"interfaces\":[]}"))
    }
}

/// JSON document describing the local interfaces
pub fn interfaces_json() -> String {
    InterfaceList::discover().to_json()
}
