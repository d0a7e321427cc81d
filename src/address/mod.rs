//! Node addresses.
//!
//! A [`NodeAddress`] is the identity of a node's inbound packet channel, written as
//! `scheme://host:port`. The same string keys the peer link pool, names the node in
//! openraft membership, and derives the on-disk location of the node's stores.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::NodeId;

const SCHEMES: [&str; 2] = ["http", "tcp"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Address '{0}' is missing a scheme (expected scheme://host:port)")]
    MissingScheme(String),

    #[error("Unsupported scheme '{scheme}' in address '{address}'")]
    UnsupportedScheme { scheme: String, address: String },

    #[error("Address '{0}' is missing a port")]
    MissingPort(String),

    #[error("Invalid port in address '{0}'")]
    InvalidPort(String),

    #[error("Address '{0}' has an empty host")]
    EmptyHost(String),

    #[error("Port offset {offset} overflows port {port}")]
    PortOverflow { port: u16, offset: u16 },
}

/// Identity of a node's inbound endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress {
    scheme: String,
    host: String,
    port: u16,
}

impl NodeAddress {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for binding a listener.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL used by outbound HTTP requests, regardless of the configured scheme.
    pub fn http_base(&self) -> String {
        format!("http://{}", self.authority())
    }

    /// The same host with the port shifted by `offset`.
    pub fn with_port_offset(&self, offset: u16) -> Result<NodeAddress, AddressError> {
        let port = self
            .port
            .checked_add(offset)
            .ok_or(AddressError::PortOverflow {
                port: self.port,
                offset,
            })?;
        Ok(NodeAddress {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            port,
        })
    }

    /// Directory name for this node's stores. Two addresses map to the same key only
    /// if they share host and port, so a restarted node reopens its own data.
    pub fn storage_key(&self) -> String {
        let host: String = self
            .host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("{}_{}", host, self.port)
    }

    /// Numeric id used by openraft membership.
    ///
    /// FNV-1a over `host:port`; the scheme does not take part so `tcp://` and
    /// `http://` spellings of one endpoint agree.
    pub fn node_id(&self) -> NodeId {
        const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let hash = self
            .authority()
            .bytes()
            .fold(OFFSET_BASIS, |acc, b| (acc ^ b as u64).wrapping_mul(PRIME));
        // openraft reserves nothing, but 0 reads as "unset" in logs and config.
        if hash == 0 {
            1
        } else {
            hash
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| AddressError::MissingScheme(s.to_string()))?;

        let scheme = scheme.to_ascii_lowercase();
        if !SCHEMES.contains(&scheme.as_str()) {
            return Err(AddressError::UnsupportedScheme {
                scheme,
                address: s.to_string(),
            });
        }

        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressError::EmptyHost(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;

        Ok(NodeAddress {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddress> for String {
    fn from(value: NodeAddress) -> Self {
        value.to_string()
    }
}
