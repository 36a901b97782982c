use ipnet::IpNet;
use palisade_core::{IpVersion, PortRange, Protocol};

/// A conjunction of match fragments, built up fluently and rendered as
/// one flag sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchCriteria(Vec<String>);

// === impl MatchCriteria ===

impl MatchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn render(&self) -> String {
        self.0.join(" ")
    }

    pub fn protocol(self, protocol: Protocol) -> Self {
        self.fragment(format!("-p {protocol}"))
    }

    pub fn not_protocol(self, protocol: Protocol) -> Self {
        self.fragment(format!("! -p {protocol}"))
    }

    pub fn source_net(self, net: IpNet) -> Self {
        self.fragment(format!("-s {net}"))
    }

    pub fn not_source_net(self, net: IpNet) -> Self {
        self.fragment(format!("! -s {net}"))
    }

    pub fn dest_net(self, net: IpNet) -> Self {
        self.fragment(format!("-d {net}"))
    }

    pub fn not_dest_net(self, net: IpNet) -> Self {
        self.fragment(format!("! -d {net}"))
    }

    pub fn source_ip_set(self, set: &str) -> Self {
        self.fragment(format!("-m set --match-set {set} src"))
    }

    pub fn not_source_ip_set(self, set: &str) -> Self {
        self.fragment(format!("-m set ! --match-set {set} src"))
    }

    pub fn dest_ip_set(self, set: &str) -> Self {
        self.fragment(format!("-m set --match-set {set} dst"))
    }

    pub fn not_dest_ip_set(self, set: &str) -> Self {
        self.fragment(format!("-m set ! --match-set {set} dst"))
    }

    /// Matches the destination (address, port) pair against a
    /// named-port style set.
    pub fn dest_ip_port_set(self, set: &str) -> Self {
        self.fragment(format!("-m set --match-set {set} dst,dst"))
    }

    pub fn source_ip_port_set(self, set: &str) -> Self {
        self.fragment(format!("-m set --match-set {set} src,src"))
    }

    pub fn not_dest_ip_port_set(self, set: &str) -> Self {
        self.fragment(format!("-m set ! --match-set {set} dst,dst"))
    }

    pub fn not_source_ip_port_set(self, set: &str) -> Self {
        self.fragment(format!("-m set ! --match-set {set} src,src"))
    }

    pub fn source_ports(self, ports: &[PortRange]) -> Self {
        self.fragment(format!("-m multiport --source-ports {}", port_list(ports)))
    }

    pub fn not_source_ports(self, ports: &[PortRange]) -> Self {
        self.fragment(format!("-m multiport ! --source-ports {}", port_list(ports)))
    }

    pub fn dest_ports(self, ports: &[PortRange]) -> Self {
        self.fragment(format!("-m multiport --destination-ports {}", port_list(ports)))
    }

    pub fn not_dest_ports(self, ports: &[PortRange]) -> Self {
        self.fragment(format!(
            "-m multiport ! --destination-ports {}",
            port_list(ports)
        ))
    }

    pub fn icmp(self, version: IpVersion, ty: u8, code: Option<u8>) -> Self {
        let type_code = match code {
            Some(code) => format!("{ty}/{code}"),
            None => format!("{ty}"),
        };
        match version {
            IpVersion::V4 => self.fragment(format!("-m icmp --icmp-type {type_code}")),
            IpVersion::V6 => self.fragment(format!("-m icmp6 --icmpv6-type {type_code}")),
        }
    }

    pub fn not_icmp(self, version: IpVersion, ty: u8, code: Option<u8>) -> Self {
        let type_code = match code {
            Some(code) => format!("{ty}/{code}"),
            None => format!("{ty}"),
        };
        match version {
            IpVersion::V4 => self.fragment(format!("-m icmp ! --icmp-type {type_code}")),
            IpVersion::V6 => self.fragment(format!("-m icmp6 ! --icmpv6-type {type_code}")),
        }
    }

    /// Matches when all `mask` bits are set.
    pub fn mark_set(self, mask: u32) -> Self {
        self.fragment(format!("-m mark --mark {mask:#x}/{mask:#x}"))
    }

    /// Matches when none of the `mask` bits are set.
    pub fn mark_clear(self, mask: u32) -> Self {
        self.fragment(format!("-m mark --mark 0x0/{mask:#x}"))
    }

    pub fn out_interface(self, iface: &str) -> Self {
        self.fragment(format!("-o {iface}"))
    }

    pub fn in_interface(self, iface: &str) -> Self {
        self.fragment(format!("-i {iface}"))
    }

    pub fn conntrack_state(self, states: &str) -> Self {
        self.fragment(format!("-m conntrack --ctstate {states}"))
    }

    /// Appends all of `other`'s fragments.
    pub fn merge(mut self, other: Self) -> Self {
        self.0.extend(other.0);
        self
    }

    fn fragment(mut self, fragment: String) -> Self {
        self.0.push(fragment);
        self
    }
}

fn port_list(ports: &[PortRange]) -> String {
    ports
        .iter()
        .map(|r| {
            if r.first == r.last {
                r.first.to_string()
            } else {
                format!("{}:{}", r.first, r.last)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_join_in_insertion_order() {
        let m = MatchCriteria::new()
            .protocol(Protocol::Tcp)
            .source_net("10.0.0.0/8".parse().unwrap())
            .dest_ports(&[PortRange::new(80, 81), PortRange::single(8080)]);
        assert_eq!(
            m.render(),
            "-p tcp -s 10.0.0.0/8 -m multiport --destination-ports 80:81,8080"
        );
    }

    #[test]
    fn ip_set_matches_reference_named_sets() {
        let m = MatchCriteria::new()
            .source_ip_set("pali4-masq-ipam-pools")
            .not_dest_ip_set("pali4-all-ipam-pools");
        assert_eq!(
            m.render(),
            "-m set --match-set pali4-masq-ipam-pools src \
             -m set ! --match-set pali4-all-ipam-pools dst"
        );
    }

    #[test]
    fn icmp_renders_per_version() {
        assert_eq!(
            MatchCriteria::new().icmp(IpVersion::V4, 8, Some(3)).render(),
            "-m icmp --icmp-type 8/3"
        );
        assert_eq!(
            MatchCriteria::new().icmp(IpVersion::V6, 128, None).render(),
            "-m icmp6 --icmpv6-type 128"
        );
    }
}
