use std::{fmt, str::FromStr};

/// IP version a rule or endpoint applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

/// A transport (or other next-header) protocol, by name or number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Sctp,
    Other(u8),
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized protocol: {0}")]
pub struct InvalidProtocol(String);

// === impl IpVersion ===

impl IpVersion {
    pub fn number(self) -> u8 {
        match self {
            Self::V4 => 4,
            Self::V6 => 6,
        }
    }
}

// === impl Protocol ===

impl Protocol {
    /// The protocol number carried in the IP header.
    pub fn number(self) -> u8 {
        match self {
            Self::Icmp => 1,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmpv6 => 58,
            Self::Sctp => 132,
            Self::Other(n) => n,
        }
    }
}

impl From<u8> for Protocol {
    fn from(n: u8) -> Self {
        match n {
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            58 => Self::Icmpv6,
            132 => Self::Sctp,
            n => Self::Other(n),
        }
    }
}

impl FromStr for Protocol {
    type Err = InvalidProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<u8>() {
            return Ok(n.into());
        }
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            "icmpv6" | "icmp6" => Ok(Self::Icmpv6),
            "sctp" => Ok(Self::Sctp),
            _ => Err(InvalidProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => "tcp".fmt(f),
            Self::Udp => "udp".fmt(f),
            Self::Icmp => "icmp".fmt(f),
            Self::Icmpv6 => "icmpv6".fmt(f),
            Self::Sctp => "sctp".fmt(f),
            Self::Other(n) => n.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_numbers() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("6".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("132".parse::<Protocol>().unwrap(), Protocol::Sctp);
        assert_eq!("253".parse::<Protocol>().unwrap(), Protocol::Other(253));
        assert!("bogus".parse::<Protocol>().is_err());
    }

    #[test]
    fn numbers_round_trip() {
        for n in [1u8, 6, 17, 58, 132, 253] {
            assert_eq!(Protocol::from(n).number(), n);
        }
    }
}
