use crate::{IpVersion, Protocol};
use ipnet::IpNet;
use std::fmt;

/// Terminal (or, for `Log`, non-terminal) action of a matched rule.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Allow,
    Deny,
    /// Skip the rest of the current tier and continue with the next one.
    Pass,
    /// Record the packet and keep evaluating.
    Log,
}

/// An inclusive port range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

/// An ICMP type, optionally narrowed to a single code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct IcmpMatch {
    pub ty: u8,
    pub code: Option<u8>,
}

/// A single policy rule: the conjunction of its non-empty predicates.
///
/// Every `Vec` predicate is disjunctive internally (any element matching
/// satisfies the predicate) and the rule matches only if all non-empty
/// positive predicates match and no non-empty negated predicate does. An
/// empty list is neutral: it matches everything in positive position and
/// excludes nothing in negative position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rule {
    pub action: Option<Action>,
    pub ip_version: Option<IpVersion>,

    pub protocol: Option<Protocol>,
    pub not_protocol: Option<Protocol>,

    pub src_nets: Vec<IpNet>,
    pub dst_nets: Vec<IpNet>,
    pub not_src_nets: Vec<IpNet>,
    pub not_dst_nets: Vec<IpNet>,

    pub src_ports: Vec<PortRange>,
    pub dst_ports: Vec<PortRange>,
    pub not_src_ports: Vec<PortRange>,
    pub not_dst_ports: Vec<PortRange>,

    pub src_ip_set_ids: Vec<String>,
    pub dst_ip_set_ids: Vec<String>,
    pub not_src_ip_set_ids: Vec<String>,
    pub not_dst_ip_set_ids: Vec<String>,

    pub src_named_port_ip_set_ids: Vec<String>,
    pub dst_named_port_ip_set_ids: Vec<String>,
    pub not_src_named_port_ip_set_ids: Vec<String>,
    pub not_dst_named_port_ip_set_ids: Vec<String>,

    pub icmp: Option<IcmpMatch>,
    pub not_icmp: Option<IcmpMatch>,
}

// === impl PortRange ===

impl PortRange {
    pub fn new(first: u16, last: u16) -> Self {
        Self { first, last }
    }

    pub fn single(port: u16) -> Self {
        Self { first: port, last: port }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.first <= port && port <= self.last
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

impl std::str::FromStr for PortRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.split_once('-') {
            None => Ok(Self::single(s.trim().parse()?)),
            Some((first, last)) => {
                let first = first.trim().parse()?;
                let last = last.trim().parse()?;
                anyhow::ensure!(first <= last, "port range must be increasing");
                Ok(Self { first, last })
            }
        }
    }
}

// === impl Rule ===

impl Rule {
    /// A rule with the given action and no predicates, i.e. match-all.
    pub fn action(action: Action) -> Self {
        Self {
            action: Some(action),
            ..Self::default()
        }
    }

    pub fn allow() -> Self {
        Self::action(Action::Allow)
    }

    pub fn deny() -> Self {
        Self::action(Action::Deny)
    }

    pub fn pass() -> Self {
        Self::action(Action::Pass)
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn not_protocol(mut self, protocol: Protocol) -> Self {
        self.not_protocol = Some(protocol);
        self
    }

    pub fn src_net(mut self, net: IpNet) -> Self {
        self.src_nets.push(net);
        self
    }

    pub fn dst_net(mut self, net: IpNet) -> Self {
        self.dst_nets.push(net);
        self
    }

    pub fn not_src_net(mut self, net: IpNet) -> Self {
        self.not_src_nets.push(net);
        self
    }

    pub fn not_dst_net(mut self, net: IpNet) -> Self {
        self.not_dst_nets.push(net);
        self
    }

    pub fn src_ports(mut self, ports: impl IntoIterator<Item = PortRange>) -> Self {
        self.src_ports.extend(ports);
        self
    }

    pub fn dst_ports(mut self, ports: impl IntoIterator<Item = PortRange>) -> Self {
        self.dst_ports.extend(ports);
        self
    }

    pub fn not_src_ports(mut self, ports: impl IntoIterator<Item = PortRange>) -> Self {
        self.not_src_ports.extend(ports);
        self
    }

    pub fn not_dst_ports(mut self, ports: impl IntoIterator<Item = PortRange>) -> Self {
        self.not_dst_ports.extend(ports);
        self
    }

    pub fn src_ip_set(mut self, id: impl ToString) -> Self {
        self.src_ip_set_ids.push(id.to_string());
        self
    }

    pub fn dst_ip_set(mut self, id: impl ToString) -> Self {
        self.dst_ip_set_ids.push(id.to_string());
        self
    }

    pub fn src_named_port_ip_set(mut self, id: impl ToString) -> Self {
        self.src_named_port_ip_set_ids.push(id.to_string());
        self
    }

    pub fn dst_named_port_ip_set(mut self, id: impl ToString) -> Self {
        self.dst_named_port_ip_set_ids.push(id.to_string());
        self
    }

    pub fn not_dst_ip_set(mut self, id: impl ToString) -> Self {
        self.not_dst_ip_set_ids.push(id.to_string());
        self
    }

    pub fn icmp(mut self, ty: u8, code: Option<u8>) -> Self {
        self.icmp = Some(IcmpMatch { ty, code });
        self
    }

    pub fn not_icmp(mut self, ty: u8, code: Option<u8>) -> Self {
        self.not_icmp = Some(IcmpMatch { ty, code });
        self
    }

    /// All IP-set ids the rule references, used for dirty tracking.
    pub fn referenced_ip_set_ids(&self) -> impl Iterator<Item = &str> {
        self.src_ip_set_ids
            .iter()
            .chain(&self.dst_ip_set_ids)
            .chain(&self.not_src_ip_set_ids)
            .chain(&self.not_dst_ip_set_ids)
            .chain(&self.src_named_port_ip_set_ids)
            .chain(&self.dst_named_port_ip_set_ids)
            .chain(&self.not_src_named_port_ip_set_ids)
            .chain(&self.not_dst_named_port_ip_set_ids)
            .map(String::as_str)
    }
}
