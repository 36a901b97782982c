use ipnet::IpNet;
use std::{fmt, str::FromStr};

/// The two kinds of IP set the dataplane understands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IpSetKind {
    /// Members are CIDRs.
    Net,
    /// Members are (CIDR, protocol, port) tuples.
    NamedPort,
}

/// Protocols a named-port member may carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NamedPortProtocol {
    Tcp,
    Udp,
}

/// A member of an IP set.
///
/// The text form is `CIDR` for address members and `CIDR,proto:port` for
/// named-port members, e.g. `10.0.0.2/32,tcp:80`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IpSetMember {
    Net(IpNet),
    NamedPort {
        net: IpNet,
        protocol: NamedPortProtocol,
        port: u16,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("invalid IP set member: {0}")]
pub struct InvalidMember(String);

// === impl NamedPortProtocol ===

impl NamedPortProtocol {
    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }
}

impl fmt::Display for NamedPortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => "tcp".fmt(f),
            Self::Udp => "udp".fmt(f),
        }
    }
}

// === impl IpSetMember ===

impl IpSetMember {
    pub fn net(&self) -> IpNet {
        match *self {
            Self::Net(net) => net,
            Self::NamedPort { net, .. } => net,
        }
    }

    pub fn kind(&self) -> IpSetKind {
        match self {
            Self::Net(_) => IpSetKind::Net,
            Self::NamedPort { .. } => IpSetKind::NamedPort,
        }
    }
}

impl From<IpNet> for IpSetMember {
    fn from(net: IpNet) -> Self {
        Self::Net(net)
    }
}

impl fmt::Display for IpSetMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Net(net) => net.fmt(f),
            Self::NamedPort { net, protocol, port } => {
                write!(f, "{},{}:{}", net, protocol, port)
            }
        }
    }
}

impl FromStr for IpSetMember {
    type Err = InvalidMember;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidMember(s.to_string());
        match s.split_once(',') {
            None => {
                let net = s.parse().map_err(|_| invalid())?;
                Ok(Self::Net(net))
            }
            Some((net, proto_port)) => {
                let net = net.parse().map_err(|_| invalid())?;
                let (proto, port) = proto_port.split_once(':').ok_or_else(invalid)?;
                let protocol = match proto {
                    "tcp" => NamedPortProtocol::Tcp,
                    "udp" => NamedPortProtocol::Udp,
                    _ => return Err(invalid()),
                };
                let port = port.parse().map_err(|_| invalid())?;
                Ok(Self::NamedPort { net, protocol, port })
            }
        }
    }
}
