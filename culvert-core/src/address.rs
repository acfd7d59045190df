//! Routing context carried by a [`Line`](crate::Line) and the
//! destination-selection strategies connector nodes apply to it

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// Transport protocol of an address
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Protocol {
    /// Stream transport
    Tcp,
    /// Datagram transport
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        })
    }
}

/// A peer address that may still await resolution
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Host {
    /// Numeric address, ready to dial
    Ip(IpAddr),
    /// Domain name, resolved at connect time
    Name(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => ip.fmt(f),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// One endpoint of a line: host, port, protocol
#[derive(Debug, Clone, Default)]
pub struct AddressContext {
    /// Peer host, if known yet
    pub host: Option<Host>,
    /// Peer port; zero when unset
    pub port: u16,
    /// Transport protocol; `None` until a node pins it
    pub protocol: Option<Protocol>,
}

impl AddressContext {
    /// Whether the host is numeric and ready to dial
    pub fn is_resolved(&self) -> bool {
        matches!(self.host, Some(Host::Ip(_)))
    }

    /// Replace the host with a resolved address
    pub fn set_ip(&mut self, ip: IpAddr) {
        self.host = Some(Host::Ip(ip));
    }

    /// The dialable socket address, if the host has been resolved
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.host {
            Some(Host::Ip(ip)) => Some(SocketAddr::new(ip, self.port)),
            _ => None,
        }
    }
}

/// Source and destination context of one line
///
/// The listener that creates a line fills `src`; connector-side nodes derive
/// `dest` from it according to their configured strategy.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    /// Where the line came from
    pub src: AddressContext,
    /// Where the line is headed
    pub dest: AddressContext,
}

/// How a connector picks the destination host
#[derive(Debug, Clone)]
pub enum AddressStrategy {
    /// Mirror the line's source address (reverse/bounce setups)
    FromSource,
    /// Always dial the configured host
    Constant(Host),
    /// Trust whatever destination an upstream node already recorded
    /// (transparent proxying, original-destination capture)
    FromDest,
}

/// How a connector picks the destination port
#[derive(Debug, Copy, Clone)]
pub enum PortStrategy {
    /// Mirror the line's source port
    FromSource,
    /// Always dial the configured port
    Constant(u16),
    /// Trust the port an upstream node already recorded
    FromDest,
}

/// Config spelling of a destination strategy tag
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StrategyKind {
    /// `from-source`
    FromSource,
    /// `constant`
    Constant,
    /// `from-destination`
    FromDest,
}

impl FromStr for StrategyKind {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "from-source" => Ok(Self::FromSource),
            "constant" => Ok(Self::Constant),
            "from-destination" => Ok(Self::FromDest),
            other => Err(ParseStrategyError(other.into())),
        }
    }
}

/// The strategy tag was not one of the recognized spellings
#[derive(Debug, Error)]
#[error("unknown destination strategy `{0}`")]
pub struct ParseStrategyError(String);

/// An address prefix used in listener whitelists
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IpMask {
    addr: IpAddr,
    prefix: u8,
}

impl IpMask {
    /// Build a mask from an address and prefix length
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, ParseMaskError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(ParseMaskError::PrefixTooLong(prefix, max));
        }
        Ok(Self { addr, prefix })
    }

    /// Whether `ip` falls inside this prefix
    ///
    /// Mixed address families never match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = match u32::MAX.checked_shl(32 - u32::from(self.prefix)) {
                    Some(mask) => mask,
                    None => 0,
                };
                u32::from_be_bytes(net.octets()) & mask == u32::from_be_bytes(ip.octets()) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = match u128::MAX.checked_shl(128 - u32::from(self.prefix)) {
                    Some(mask) => mask,
                    None => 0,
                };
                u128::from_be_bytes(net.octets()) & mask == u128::from_be_bytes(ip.octets()) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpMask {
    type Err = ParseMaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| ParseMaskError::Invalid(s.into()))?;
                let prefix: u8 = prefix.parse().map_err(|_| ParseMaskError::Invalid(s.into()))?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| ParseMaskError::Invalid(s.into()))?;
                let prefix = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                (addr, prefix)
            }
        };
        Self::new(addr, prefix)
    }
}

impl fmt::Display for IpMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// A CIDR string could not be parsed
#[derive(Debug, Error)]
pub enum ParseMaskError {
    /// Not an `addr/prefix` form with a valid address
    #[error("invalid CIDR `{0}`")]
    Invalid(String),
    /// Prefix length exceeds the address family's width
    #[error("prefix length {0} exceeds maximum {1}")]
    PrefixTooLong(u8, u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_membership() {
        let mask: IpMask = "10.0.0.0/8".parse().unwrap();
        assert!(mask.contains("10.20.30.40".parse().unwrap()));
        assert!(!mask.contains("11.0.0.1".parse().unwrap()));
        assert!(!mask.contains("::1".parse().unwrap()));

        let all: IpMask = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains("203.0.113.9".parse().unwrap()));

        let host: IpMask = "127.0.0.1".parse().unwrap();
        assert!(host.contains("127.0.0.1".parse().unwrap()));
        assert!(!host.contains("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn cidr_rejects_garbage() {
        assert!("10.0.0.0/33".parse::<IpMask>().is_err());
        assert!("not-an-ip/8".parse::<IpMask>().is_err());
    }

    #[test]
    fn strategy_spellings() {
        assert_eq!(
            "from-source".parse::<StrategyKind>().unwrap(),
            StrategyKind::FromSource
        );
        assert_eq!(
            "from-destination".parse::<StrategyKind>().unwrap(),
            StrategyKind::FromDest
        );
        assert!("sideways".parse::<StrategyKind>().is_err());
    }
}
