use serde::Deserialize;
use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
};

use crate::error::ValidationError;

/// Every listener binds here and every destination is dialed here.
pub const LOCAL_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Transport kinds a forwarding rule may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
}

impl Network {
    pub const ALL: [Self; 1] = [Self::Tcp];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|network| network.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ValidationError::UnsupportedNetwork(s.to_string()))
    }
}

/// One end of a forwarding rule as written in the config file.
///
/// Nothing is checked at parse time; call [`EndpointSpec::validate`] (or
/// [`EndpointSpec::parse`] to get the typed form) before using it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointSpec {
    #[serde(rename = "networkType")]
    pub network: String,
    #[serde(rename = "portNumber")]
    pub port: i64,
}

impl EndpointSpec {
    pub fn new(network: impl Into<String>, port: i64) -> Self {
        Self {
            network: network.into(),
            port,
        }
    }

    /// Shorthand for a TCP endpoint.
    #[must_use]
    pub fn tcp(port: u16) -> Self {
        Self::new(Network::Tcp.as_str(), i64::from(port))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.parse().map(|_| ())
    }

    /// Checks the network (case-insensitive) and the port range, returning the
    /// validated endpoint.
    pub fn parse(&self) -> Result<Endpoint, ValidationError> {
        let network = self.network.parse::<Network>()?;
        let port = u16::try_from(self.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or(ValidationError::PortOutOfRange(self.port))?;
        Ok(Endpoint { network, port })
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.port)
    }
}

/// A validated endpoint on the local host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub network: Network,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(std::net::IpAddr::V4(LOCAL_HOST), self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.port)
    }
}
