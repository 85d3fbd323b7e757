//! Member addressing.

use serde::{Deserialize, Serialize};

/// `host:port` address of a cluster member.
///
/// The host is kept as a string because discovery back-ends commonly
/// advertise DNS names rather than raw IPs. Addresses compare by value and
/// serve as the key for transport routing and the PID cache's by-member
/// index.
///
/// # Examples
///
/// ```
/// use starling_core::MemberAddress;
///
/// let addr = MemberAddress::new("10.0.0.1", 4020);
/// assert_eq!(addr.to_string(), "10.0.0.1:4020");
/// assert_eq!(MemberAddress::parse("10.0.0.1:4020").unwrap(), addr);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberAddress {
    /// Host name or IP.
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl MemberAddress {
    /// Create a new member address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse from string `host:port` format.
    ///
    /// # Errors
    ///
    /// Returns an error if the port separator is missing, the host is empty,
    /// or the port cannot be parsed.
    pub fn parse(s: &str) -> Result<Self, AddressParseError> {
        let (host, port_str) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost);
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::InvalidPort)?;
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for MemberAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error parsing a member address from string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    /// The host part was empty.
    #[error("empty host")]
    EmptyHost,
    /// The port number could not be parsed.
    #[error("invalid port number")]
    InvalidPort,
    /// No port separator (`:`) found in the input.
    #[error("missing port separator")]
    MissingPort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let addr = MemberAddress::new("node-a.internal", 4020);
        assert_eq!(addr.to_string(), "node-a.internal:4020");
    }

    #[test]
    fn test_parse_roundtrip() {
        let addr = MemberAddress::parse("node-a:4020").expect("parse");
        assert_eq!(addr.host, "node-a");
        assert_eq!(addr.port, 4020);
        assert_eq!(MemberAddress::parse(&addr.to_string()).expect("parse"), addr);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            MemberAddress::parse("no-port"),
            Err(AddressParseError::MissingPort)
        );
        assert_eq!(
            MemberAddress::parse(":4020"),
            Err(AddressParseError::EmptyHost)
        );
        assert_eq!(
            MemberAddress::parse("host:notaport"),
            Err(AddressParseError::InvalidPort)
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let addr = MemberAddress::new("10.0.0.7", 9001);
        let json = serde_json::to_string(&addr).expect("serialize");
        let decoded: MemberAddress = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(addr, decoded);
    }
}
