use crate::{
    action::Action,
    match_criteria::MatchCriteria,
    rules::{Chain, Rule},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ipnet::IpNet;
use palisade_core::{
    self as core, Direction, EndpointKind, EndpointRules, IpVersion, PolicyRules,
    ResolvedEndpoint, TierEndAction, TierRules,
};
use sha2::{Digest, Sha224};
use std::sync::Arc;

/// Kernel set names are capped at 31 bytes.
const MAX_IPSET_NAME_LEN: usize = 31;

#[derive(Clone, Debug)]
pub struct Config {
    /// Prefix for kernel ipset names, at most 4 characters.
    pub ipset_prefix: String,
    /// Mark bit meaning "a policy accepted this packet".
    pub mark_accept: u32,
    /// Mark bit meaning "a policy passed this packet to the next tier".
    pub mark_pass: u32,
    /// Scratch bits for compiling multi-valued and negated predicates.
    pub mark_scratch0: u32,
    pub mark_scratch1: u32,
    /// `first-last` range for masqueraded source ports.
    pub nat_port_range: Option<core::PortRange>,
    pub nat_outgoing_interface_filter: Option<String>,
}

/// Renders resolved endpoints into named rule chains.
#[derive(Clone, Debug)]
pub struct Renderer {
    config: Config,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            ipset_prefix: "pali".to_string(),
            mark_accept: 0x8,
            mark_pass: 0x10,
            mark_scratch0: 0x20,
            mark_scratch1: 0x40,
            nat_port_range: None,
            nat_outgoing_interface_filter: None,
        }
    }
}

// === impl Renderer ===

impl Renderer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// All chains for one endpoint: the per-direction dispatch chains
    /// plus the policy and profile chains they reference. A policy
    /// referenced from several tiers renders once.
    pub fn endpoint_chains(&self, ep: &ResolvedEndpoint) -> Vec<Chain> {
        let mut chains: Vec<Chain> = Vec::new();
        let mut seen = ahash::AHashSet::new();
        for (direction, rules) in [(Direction::Ingress, &ep.ingress), (Direction::Egress, &ep.egress)]
        {
            for chain in self.leg_chains(ep, direction, rules) {
                if seen.insert(chain.name.clone()) {
                    chains.push(chain);
                }
            }
        }
        chains
    }

    fn leg_chains(
        &self,
        ep: &ResolvedEndpoint,
        direction: Direction,
        rules: &EndpointRules,
    ) -> Vec<Chain> {
        let mut chains = Vec::new();

        let (tiers, profiles): (&[TierRules], &[Arc<PolicyRules>]) =
            if rules.for_host_interface {
                (&rules.host_normal_tiers, &rules.host_profiles)
            } else {
                (&rules.tiers, &rules.profiles)
            };

        let main_name = self.endpoint_chain_name(ep.key.kind, direction, &ep.iface_name);
        chains.push(self.dispatch_chain(&main_name, tiers, profiles, direction, ep.ip_version));

        // Host endpoints additionally carry the pre-DNAT and forward
        // chains, installed from the raw and forward hooks.
        if rules.for_host_interface {
            // Pre-DNAT policy runs before connection tracking, on the
            // way in only.
            if direction == Direction::Ingress && !rules.host_pre_dnat_tiers.is_empty() {
                let name = format!("pali-pd-{}", ep.iface_name);
                chains.push(self.guard_chain(
                    &name,
                    &rules.host_pre_dnat_tiers,
                    direction,
                    ep.ip_version,
                ));
            }
            if !rules.host_forward_tiers.is_empty() {
                let name = match direction {
                    Direction::Ingress => format!("pali-thfw-{}", ep.iface_name),
                    Direction::Egress => format!("pali-fhfw-{}", ep.iface_name),
                };
                chains.push(self.guard_chain(
                    &name,
                    &rules.host_forward_tiers,
                    direction,
                    ep.ip_version,
                ));
            }
        }

        for tier in tiers
            .iter()
            .chain(&rules.host_pre_dnat_tiers)
            .chain(&rules.host_forward_tiers)
        {
            for policy in &tier.policies {
                chains.push(self.policy_chain(
                    &self.policy_chain_name(direction, &policy.name),
                    policy,
                    direction,
                    ep.ip_version,
                ));
            }
        }
        for profile in profiles {
            chains.push(self.policy_chain(
                &self.profile_chain_name(direction, &profile.name),
                profile,
                direction,
                ep.ip_version,
            ));
        }
        chains
    }

    /// The per-endpoint chain: conntrack prologue, then tier-by-tier
    /// policy jumps with the accept/pass mark protocol, then profiles,
    /// then the default drop.
    fn dispatch_chain(
        &self,
        name: &str,
        tiers: &[TierRules],
        profiles: &[Arc<PolicyRules>],
        direction: Direction,
        _ip_version: IpVersion,
    ) -> Chain {
        let Config {
            mark_accept,
            mark_pass,
            ..
        } = self.config;
        let mut chain = Chain::new(name);

        chain = chain
            .rule(Rule::new(
                MatchCriteria::new().conntrack_state("RELATED,ESTABLISHED"),
                Action::Accept,
            ))
            .rule(Rule::new(
                MatchCriteria::new().conntrack_state("INVALID"),
                Action::Drop,
            ))
            .rule(Rule::new(
                MatchCriteria::new(),
                Action::ClearMark {
                    mask: mark_accept | mark_pass,
                },
            ));

        for tier in tiers {
            chain = chain.rule(
                Rule::new(MatchCriteria::new(), Action::ClearMark { mask: mark_pass })
                    .comment(format!("Start of tier {}", tier.name)),
            );
            for policy in &tier.policies {
                chain = chain
                    .rule(Rule::new(
                        MatchCriteria::new().mark_clear(mark_pass),
                        Action::Jump(self.policy_chain_name(direction, &policy.name)),
                    ))
                    .rule(
                        Rule::new(MatchCriteria::new().mark_set(mark_accept), Action::Return)
                            .comment("Return if policy accepted"),
                    );
            }
            if tier.end_action == TierEndAction::Deny {
                chain = chain.rule(
                    Rule::new(MatchCriteria::new().mark_clear(mark_pass), Action::Drop)
                        .comment("Drop if no policies passed packet"),
                );
            }
        }

        for profile in profiles {
            chain = chain
                .rule(Rule::new(
                    MatchCriteria::new(),
                    Action::Jump(self.profile_chain_name(direction, &profile.name)),
                ))
                .rule(
                    Rule::new(MatchCriteria::new().mark_set(mark_accept), Action::Return)
                        .comment("Return if profile accepted"),
                );
        }

        chain.rule(Rule::new(MatchCriteria::new(), Action::Drop).comment("Drop if no profiles matched"))
    }

    /// Pre-DNAT and apply-on-forward chains: tiers only, no default
    /// drop; a pass at the end returns to the caller.
    fn guard_chain(
        &self,
        name: &str,
        tiers: &[TierRules],
        direction: Direction,
        _ip_version: IpVersion,
    ) -> Chain {
        let Config {
            mark_accept,
            mark_pass,
            ..
        } = self.config;
        let mut chain = Chain::new(name);
        chain = chain.rule(Rule::new(
            MatchCriteria::new(),
            Action::ClearMark {
                mask: mark_accept | mark_pass,
            },
        ));
        for tier in tiers {
            chain = chain.rule(
                Rule::new(MatchCriteria::new(), Action::ClearMark { mask: mark_pass })
                    .comment(format!("Start of tier {}", tier.name)),
            );
            for policy in &tier.policies {
                chain = chain
                    .rule(Rule::new(
                        MatchCriteria::new().mark_clear(mark_pass),
                        Action::Jump(self.policy_chain_name(direction, &policy.name)),
                    ))
                    .rule(
                        Rule::new(MatchCriteria::new().mark_set(mark_accept), Action::Return)
                            .comment("Return if policy accepted"),
                    );
            }
            if tier.end_action == TierEndAction::Deny {
                chain = chain.rule(
                    Rule::new(MatchCriteria::new().mark_clear(mark_pass), Action::Drop)
                        .comment("Drop if no policies passed packet"),
                );
            }
        }
        chain
    }

    /// One chain per policy (or profile): each rule expands to one or
    /// more kernel rules ending in the mark/verdict for its action.
    pub fn policy_chain(
        &self,
        name: &str,
        policy: &PolicyRules,
        direction: Direction,
        ip_version: IpVersion,
    ) -> Chain {
        let mut chain = Chain::new(name);
        for rule in &policy.rules {
            for rendered in self.render_rule(rule, direction, ip_version) {
                chain = chain.rule(rendered);
            }
        }
        chain
    }

    /// Expands one policy rule. Simple rules render as a single kernel
    /// rule; multi-valued CIDR lists and negations that the kernel
    /// cannot express in one rule compile through the scratch mark
    /// bits.
    fn render_rule(
        &self,
        rule: &core::Rule,
        _direction: Direction,
        ip_version: IpVersion,
    ) -> Vec<Rule> {
        if rule.ip_version.map(|v| v != ip_version).unwrap_or(false) {
            return Vec::new();
        }
        let action = match rule.action {
            Some(action) => action,
            None => return Vec::new(),
        };

        let Config {
            mark_scratch0,
            mark_scratch1,
            ..
        } = self.config;

        let family_nets = |nets: &[IpNet]| -> Vec<IpNet> {
            nets.iter()
                .filter(|net| match ip_version {
                    IpVersion::V4 => matches!(net, IpNet::V4(_)),
                    IpVersion::V6 => matches!(net, IpNet::V6(_)),
                })
                .copied()
                .collect()
        };
        let src_nets = family_nets(&rule.src_nets);
        let dst_nets = family_nets(&rule.dst_nets);
        // A positive CIDR list with no viable alternative in this
        // family makes the whole rule unmatchable.
        if (!rule.src_nets.is_empty() && src_nets.is_empty())
            || (!rule.dst_nets.is_empty() && dst_nets.is_empty())
        {
            return Vec::new();
        }
        let neg_src_nets = family_nets(&rule.not_src_nets);
        let neg_dst_nets = family_nets(&rule.not_dst_nets);

        // Lists the kernel can only express across several rules.
        let multi_positive: Vec<Vec<MatchCriteria>> = [
            cidr_alternatives(&src_nets, false),
            cidr_alternatives(&dst_nets, true),
            self.set_alternatives(&rule.src_ip_set_ids, ip_version, SetRole::Src),
            self.set_alternatives(&rule.dst_ip_set_ids, ip_version, SetRole::Dst),
            self.set_alternatives(&rule.src_named_port_ip_set_ids, ip_version, SetRole::SrcPort),
            self.set_alternatives(&rule.dst_named_port_ip_set_ids, ip_version, SetRole::DstPort),
        ]
        .into_iter()
        .filter(|alts| !alts.is_empty())
        .collect();

        let needs_scratch = multi_positive.iter().any(|alts| alts.len() > 1)
            || neg_src_nets.len() > 1
            || neg_dst_nets.len() > 1;

        let mut out = Vec::new();
        let mut scratch_guard = None;
        if needs_scratch {
            out.push(Rule::new(
                MatchCriteria::new(),
                Action::SetMark {
                    bits: mark_scratch0,
                    mask: mark_scratch0,
                },
            ));
            for alternatives in &multi_positive {
                if alternatives.len() == 1 {
                    continue;
                }
                out.push(Rule::new(
                    MatchCriteria::new(),
                    Action::ClearMark {
                        mask: mark_scratch1,
                    },
                ));
                for alt in alternatives {
                    out.push(Rule::new(
                        alt.clone(),
                        Action::SetMark {
                            bits: mark_scratch1,
                            mask: mark_scratch1,
                        },
                    ));
                }
                out.push(Rule::new(
                    MatchCriteria::new().mark_clear(mark_scratch1),
                    Action::ClearMark {
                        mask: mark_scratch0,
                    },
                ));
            }
            // A packet matching any negated CIDR is excluded: clear the
            // candidate bit on a (positive) match.
            for net in &neg_src_nets {
                out.push(Rule::new(
                    MatchCriteria::new().source_net(*net),
                    Action::ClearMark {
                        mask: mark_scratch0,
                    },
                ));
            }
            for net in &neg_dst_nets {
                out.push(Rule::new(
                    MatchCriteria::new().dest_net(*net),
                    Action::ClearMark {
                        mask: mark_scratch0,
                    },
                ));
            }
            scratch_guard = Some(mark_scratch0);
        }

        // Everything expressible in a single rule goes on the final
        // one(s).
        let mut m = MatchCriteria::new();
        if let Some(guard) = scratch_guard {
            m = m.mark_set(guard);
        }
        if let Some(protocol) = rule.protocol {
            m = m.protocol(protocol);
        }
        if let Some(protocol) = rule.not_protocol {
            m = m.not_protocol(protocol);
        }
        if let Some(icmp) = rule.icmp {
            m = m.icmp(ip_version, icmp.ty, icmp.code);
        }
        if let Some(icmp) = rule.not_icmp {
            m = m.not_icmp(ip_version, icmp.ty, icmp.code);
        }
        for alternatives in &multi_positive {
            if alternatives.len() == 1 {
                m = m.merge(alternatives[0].clone());
            }
        }
        if !needs_scratch {
            if let Some(net) = neg_src_nets.first() {
                m = m.not_source_net(*net);
            }
            if let Some(net) = neg_dst_nets.first() {
                m = m.not_dest_net(*net);
            }
        }
        for id in &rule.not_src_ip_set_ids {
            m = m.not_source_ip_set(&self.ipset_name(ip_version, id));
        }
        for id in &rule.not_dst_ip_set_ids {
            m = m.not_dest_ip_set(&self.ipset_name(ip_version, id));
        }
        for id in &rule.not_src_named_port_ip_set_ids {
            m = m.not_source_ip_port_set(&self.ipset_name(ip_version, id));
        }
        for id in &rule.not_dst_named_port_ip_set_ids {
            m = m.not_dest_ip_port_set(&self.ipset_name(ip_version, id));
        }
        if !rule.src_ports.is_empty() {
            m = m.source_ports(&rule.src_ports);
        }
        if !rule.not_src_ports.is_empty() {
            m = m.not_source_ports(&rule.not_src_ports);
        }
        if !rule.dst_ports.is_empty() {
            m = m.dest_ports(&rule.dst_ports);
        }
        if !rule.not_dst_ports.is_empty() {
            m = m.not_dest_ports(&rule.not_dst_ports);
        }

        out.extend(self.action_rules(m, action));
        out
    }

    fn action_rules(&self, m: MatchCriteria, action: core::Action) -> Vec<Rule> {
        let Config {
            mark_accept,
            mark_pass,
            ..
        } = self.config;
        match action {
            core::Action::Allow => vec![
                Rule::new(
                    m,
                    Action::SetMark {
                        bits: mark_accept,
                        mask: mark_accept,
                    },
                ),
                Rule::new(MatchCriteria::new().mark_set(mark_accept), Action::Return),
            ],
            core::Action::Deny => vec![Rule::new(m, Action::Drop)],
            core::Action::Pass => vec![
                Rule::new(
                    m,
                    Action::SetMark {
                        bits: mark_pass,
                        mask: mark_pass,
                    },
                ),
                Rule::new(MatchCriteria::new().mark_set(mark_pass), Action::Return),
            ],
            core::Action::Log => vec![Rule::new(
                m,
                Action::Log {
                    prefix: "pali-packet".to_string(),
                },
            )],
        }
    }

    /// The masquerade chain for outgoing NAT. With a configured port
    /// range the kernel needs per-protocol rules, since `--to-ports`
    /// only applies to TCP and UDP.
    pub fn nat_outgoing_chain(&self, active: bool, ip_version: IpVersion) -> Chain {
        let chain = Chain::new("pali-nat-outgoing");
        if !active {
            return chain;
        }

        let masq_set = self.ipset_name(ip_version, "masq-ipam-pools");
        let all_set = self.ipset_name(ip_version, "all-ipam-pools");
        let base_match = || {
            let mut m = MatchCriteria::new()
                .source_ip_set(&masq_set)
                .not_dest_ip_set(&all_set);
            if let Some(iface) = &self.config.nat_outgoing_interface_filter {
                m = m.out_interface(iface);
            }
            m
        };

        match self.config.nat_port_range {
            None => chain.rule(Rule::new(base_match(), Action::masq())),
            Some(range) => {
                let to_ports = format!("{}-{}", range.first, range.last);
                let mut chain = chain;
                for proto in [core::Protocol::Tcp, core::Protocol::Udp] {
                    chain = chain
                        .rule(Rule::new(
                            base_match().protocol(proto),
                            Action::Masq {
                                to_ports: Some(to_ports.clone()),
                            },
                        ))
                        .rule(Rule::new(base_match().protocol(proto), Action::Return));
                }
                chain.rule(Rule::new(base_match(), Action::masq()))
            }
        }
    }

    fn endpoint_chain_name(
        &self,
        kind: EndpointKind,
        direction: Direction,
        iface: &str,
    ) -> String {
        match (kind, direction) {
            (EndpointKind::Workload, Direction::Ingress) => format!("pali-tw-{iface}"),
            (EndpointKind::Workload, Direction::Egress) => format!("pali-fw-{iface}"),
            (EndpointKind::Host, Direction::Ingress) => format!("pali-th-{iface}"),
            (EndpointKind::Host, Direction::Egress) => format!("pali-fh-{iface}"),
        }
    }

    fn policy_chain_name(&self, direction: Direction, policy: &str) -> String {
        match direction {
            Direction::Ingress => format!("pali-pi-{policy}"),
            Direction::Egress => format!("pali-po-{policy}"),
        }
    }

    fn profile_chain_name(&self, direction: Direction, profile: &str) -> String {
        match direction {
            Direction::Ingress => format!("pali-pri-{profile}"),
            Direction::Egress => format!("pali-pro-{profile}"),
        }
    }

    /// Kernel set name for an IP-set id: versioned prefix plus the
    /// sanitized id, hashed down when it would exceed the kernel limit.
    pub fn ipset_name(&self, ip_version: IpVersion, id: &str) -> String {
        let version = match ip_version {
            IpVersion::V4 => '4',
            IpVersion::V6 => '6',
        };
        let sanitized: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        let name = format!("{}{}-{}", self.config.ipset_prefix, version, sanitized);
        if name.len() <= MAX_IPSET_NAME_LEN {
            return name;
        }
        let digest = Sha224::digest(id.as_bytes());
        let mut suffix = URL_SAFE_NO_PAD.encode(digest);
        suffix.truncate(8);
        format!("{}{}", &name[..MAX_IPSET_NAME_LEN - 8], suffix)
    }

    fn set_alternatives(
        &self,
        ids: &[String],
        ip_version: IpVersion,
        role: SetRole,
    ) -> Vec<MatchCriteria> {
        ids.iter()
            .map(|id| {
                let name = self.ipset_name(ip_version, id);
                let m = MatchCriteria::new();
                match role {
                    SetRole::Src => m.source_ip_set(&name),
                    SetRole::Dst => m.dest_ip_set(&name),
                    SetRole::SrcPort => m.source_ip_port_set(&name),
                    SetRole::DstPort => m.dest_ip_port_set(&name),
                }
            })
            .collect()
    }
}

#[derive(Copy, Clone, Debug)]
enum SetRole {
    Src,
    Dst,
    SrcPort,
    DstPort,
}

fn cidr_alternatives(nets: &[IpNet], dest: bool) -> Vec<MatchCriteria> {
    nets.iter()
        .map(|net| {
            let m = MatchCriteria::new();
            if dest {
                m.dest_net(*net)
            } else {
                m.source_net(*net)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::{EndpointKey, PortRange, Protocol, Rule as PolRule};

    fn renderer() -> Renderer {
        Renderer::new(Config::default())
    }

    #[test]
    fn nat_outgoing_renders_single_masquerade_when_active() {
        let chain = renderer().nat_outgoing_chain(true, IpVersion::V4);
        assert_eq!(chain.name, "pali-nat-outgoing");
        assert_eq!(chain.rules.len(), 1);
        assert_eq!(
            chain.rules[0].render_append(&chain.name, None),
            "-A pali-nat-outgoing \
             -m set --match-set pali4-masq-ipam-pools src \
             -m set ! --match-set pali4-all-ipam-pools dst \
             -j MASQUERADE"
        );
    }

    #[test]
    fn nat_outgoing_expands_port_range_per_protocol() {
        let config = Config {
            nat_port_range: Some(PortRange::new(99, 100)),
            nat_outgoing_interface_filter: Some("pali-123".to_string()),
            ..Config::default()
        };
        let chain = Renderer::new(config).nat_outgoing_chain(true, IpVersion::V4);
        let rendered: Vec<String> = chain
            .rules
            .iter()
            .map(|r| r.render_append(&chain.name, None))
            .collect();
        assert_eq!(rendered.len(), 5, "{rendered:#?}");
        assert!(rendered[0].contains("-p tcp") && rendered[0].ends_with("--to-ports 99-100"));
        assert!(rendered[1].contains("-p tcp") && rendered[1].ends_with("-j RETURN"));
        assert!(rendered[2].contains("-p udp") && rendered[2].ends_with("--to-ports 99-100"));
        assert!(rendered[3].contains("-p udp") && rendered[3].ends_with("-j RETURN"));
        assert!(rendered[4].ends_with("-j MASQUERADE"));
        assert!(rendered.iter().all(|r| r.contains("-o pali-123")));
    }

    #[test]
    fn nat_outgoing_renders_nothing_when_inactive() {
        let chain = renderer().nat_outgoing_chain(false, IpVersion::V4);
        assert!(chain.rules.is_empty());
    }

    #[test]
    fn simple_allow_rule_renders_mark_then_return() {
        let policy = PolicyRules {
            name: "p1".to_string(),
            rules: vec![PolRule::allow()
                .protocol(Protocol::Tcp)
                .src_net("10.0.0.0/8".parse().unwrap())],
        };
        let chain = renderer().policy_chain("pali-pi-p1", &policy, Direction::Ingress, IpVersion::V4);
        let rendered: Vec<String> = chain
            .rules
            .iter()
            .map(|r| r.render_append(&chain.name, None))
            .collect();
        assert_eq!(
            rendered,
            vec![
                "-A pali-pi-p1 -p tcp -s 10.0.0.0/8 -j MARK --set-xmark 0x8/0x8".to_string(),
                "-A pali-pi-p1 -m mark --mark 0x8/0x8 -j RETURN".to_string(),
            ]
        );
    }

    #[test]
    fn deny_rule_renders_a_drop() {
        let policy = PolicyRules {
            name: "p1".to_string(),
            rules: vec![PolRule::deny()],
        };
        let chain = renderer().policy_chain("pali-pi-p1", &policy, Direction::Ingress, IpVersion::V4);
        assert_eq!(chain.rules.len(), 1);
        assert_eq!(
            chain.rules[0].render_append(&chain.name, None),
            "-A pali-pi-p1 -j DROP"
        );
    }

    #[test]
    fn multi_cidr_list_expands_through_scratch_marks() {
        let policy = PolicyRules {
            name: "p1".to_string(),
            rules: vec![PolRule::allow()
                .src_net("10.0.0.0/8".parse().unwrap())
                .src_net("11.0.0.0/8".parse().unwrap())],
        };
        let chain = renderer().policy_chain("pali-pi-p1", &policy, Direction::Ingress, IpVersion::V4);
        let rendered: Vec<String> = chain
            .rules
            .iter()
            .map(|r| r.render_append(&chain.name, None))
            .collect();
        assert_eq!(
            rendered,
            vec![
                // candidate := true
                "-A pali-pi-p1 -j MARK --set-xmark 0x20/0x20".to_string(),
                // scratch1 := any alternative matched
                "-A pali-pi-p1 -j MARK --set-xmark 0x0/0x40".to_string(),
                "-A pali-pi-p1 -s 10.0.0.0/8 -j MARK --set-xmark 0x40/0x40".to_string(),
                "-A pali-pi-p1 -s 11.0.0.0/8 -j MARK --set-xmark 0x40/0x40".to_string(),
                "-A pali-pi-p1 -m mark --mark 0x0/0x40 -j MARK --set-xmark 0x0/0x20".to_string(),
                // verdict gated on the candidate bit
                "-A pali-pi-p1 -m mark --mark 0x20/0x20 -j MARK --set-xmark 0x8/0x8".to_string(),
                "-A pali-pi-p1 -m mark --mark 0x8/0x8 -j RETURN".to_string(),
            ]
        );
    }

    #[test]
    fn multiple_negated_cidrs_expand_through_scratch_marks() {
        let policy = PolicyRules {
            name: "p1".to_string(),
            rules: vec![PolRule::allow()
                .not_src_net("10.0.0.0/8".parse().unwrap())
                .not_src_net("11.0.0.0/8".parse().unwrap())],
        };
        let chain = renderer().policy_chain("pali-pi-p1", &policy, Direction::Ingress, IpVersion::V4);
        let rendered: Vec<String> = chain
            .rules
            .iter()
            .map(|r| r.render_append(&chain.name, None))
            .collect();
        assert_eq!(
            rendered,
            vec![
                "-A pali-pi-p1 -j MARK --set-xmark 0x20/0x20".to_string(),
                "-A pali-pi-p1 -s 10.0.0.0/8 -j MARK --set-xmark 0x0/0x20".to_string(),
                "-A pali-pi-p1 -s 11.0.0.0/8 -j MARK --set-xmark 0x0/0x20".to_string(),
                "-A pali-pi-p1 -m mark --mark 0x20/0x20 -j MARK --set-xmark 0x8/0x8".to_string(),
                "-A pali-pi-p1 -m mark --mark 0x8/0x8 -j RETURN".to_string(),
            ]
        );
    }

    #[test]
    fn single_negated_cidr_renders_inline() {
        let policy = PolicyRules {
            name: "p1".to_string(),
            rules: vec![PolRule::allow().not_src_net("10.0.0.0/8".parse().unwrap())],
        };
        let chain = renderer().policy_chain("pali-pi-p1", &policy, Direction::Ingress, IpVersion::V4);
        assert_eq!(
            chain.rules[0].render_append(&chain.name, None),
            "-A pali-pi-p1 ! -s 10.0.0.0/8 -j MARK --set-xmark 0x8/0x8"
        );
    }

    #[test]
    fn named_port_set_renders_addr_port_reference() {
        let policy = PolicyRules {
            name: "p1".to_string(),
            rules: vec![PolRule::allow().dst_named_port_ip_set("n:web")],
        };
        let chain = renderer().policy_chain("pali-pi-p1", &policy, Direction::Ingress, IpVersion::V4);
        assert_eq!(
            chain.rules[0].render_append(&chain.name, None),
            "-A pali-pi-p1 -m set --match-set pali4-n-web dst,dst -j MARK --set-xmark 0x8/0x8"
        );
    }

    #[test]
    fn other_family_rules_render_nothing() {
        let policy = PolicyRules {
            name: "p1".to_string(),
            rules: vec![PolRule::allow().src_net("ffe2::/16".parse().unwrap())],
        };
        let chain = renderer().policy_chain("pali-pi-p1", &policy, Direction::Ingress, IpVersion::V4);
        assert!(chain.rules.is_empty());
    }

    #[test]
    fn long_ipset_ids_hash_down_to_the_kernel_limit() {
        let name = renderer().ipset_name(
            IpVersion::V4,
            "svc:very-long-namespace/very-long-service-name",
        );
        assert!(name.len() <= 31, "{name}");
        assert!(name.starts_with("pali4-"));
        // Distinct ids keep distinct names after truncation.
        let other = renderer().ipset_name(
            IpVersion::V4,
            "svc:very-long-namespace/very-long-service-other",
        );
        assert_ne!(name, other);
    }

    fn workload_endpoint(tiers: Vec<TierRules>) -> ResolvedEndpoint {
        ResolvedEndpoint {
            key: EndpointKey::workload("ep1"),
            iface_name: "pali1234".to_string(),
            ip_version: IpVersion::V4,
            ingress: EndpointRules {
                tiers: tiers.clone(),
                ..EndpointRules::default()
            },
            egress: EndpointRules {
                tiers,
                ..EndpointRules::default()
            },
            xdp: None,
        }
    }

    #[test]
    fn endpoint_chains_cover_both_directions_and_policies() {
        let tiers = vec![
            TierRules::new("default", TierEndAction::Deny).with_policy("p1", vec![PolRule::allow()])
        ];
        let chains = renderer().endpoint_chains(&workload_endpoint(tiers));
        let names: Vec<&str> = chains.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["pali-tw-pali1234", "pali-pi-p1", "pali-fw-pali1234", "pali-po-p1"]
        );

        // The dispatch chain walks conntrack, mark bookkeeping, the
        // policy jump pair, tier end drop, and the final drop.
        let tw = &chains[0];
        let rendered: Vec<String> = tw
            .rules
            .iter()
            .map(|r| r.render_append(&tw.name, None))
            .collect();
        assert!(rendered[0].contains("--ctstate RELATED,ESTABLISHED"));
        assert!(rendered[1].contains("--ctstate INVALID"));
        assert!(rendered.iter().any(|r| r.contains("-j pali-pi-p1")));
        assert!(rendered
            .iter()
            .any(|r| r.contains("Drop if no policies passed packet")));
        assert!(rendered.last().unwrap().ends_with("-j DROP"));
    }

    #[test]
    fn host_endpoint_renders_guard_chains() {
        let guard_tier = vec![TierRules::new("default", TierEndAction::Pass)
            .with_policy("pre1", vec![PolRule::allow()])];
        let ep = ResolvedEndpoint {
            key: EndpointKey::host("eth0"),
            iface_name: "eth0".to_string(),
            ip_version: IpVersion::V4,
            ingress: EndpointRules {
                for_host_interface: true,
                host_pre_dnat_tiers: guard_tier.clone(),
                host_forward_tiers: guard_tier.clone(),
                ..EndpointRules::default()
            },
            egress: EndpointRules {
                for_host_interface: true,
                ..EndpointRules::default()
            },
            xdp: None,
        };
        let chains = renderer().endpoint_chains(&ep);
        let names: Vec<&str> = chains.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"pali-th-eth0"));
        assert!(names.contains(&"pali-fh-eth0"));
        assert!(names.contains(&"pali-pd-eth0"));
        assert!(names.contains(&"pali-thfw-eth0"));
    }
}
