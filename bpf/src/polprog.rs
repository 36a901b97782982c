//! Builds the policy classifier program for one interface leg.
//!
//! The program reads the pre-parsed packet state from the shared state
//! table, walks the applicable tier chains, and ends by writing its
//! verdict back into the state block and tail-calling the allow or drop
//! terminator through the jump table. The same inputs always assemble to
//! a byte-identical stream; attachment bookkeeping depends on that.

use crate::{
    asm::{
        Block, Insn, HELPER_MAP_LOOKUP_ELEM, HELPER_TAIL_CALL, R0, R1, R2, R3, R6, R7, R10, SZ_B,
        SZ_H, SZ_W,
    },
    ipsets, state,
};
use anyhow::Result;
use ipnet::IpNet;
use palisade_core::{
    Action, EndpointRules, IdAllocator, IpSetMember, IpVersion, PolicyRules, PortRange, Rule,
    TierEndAction, TierRules,
};
use std::sync::Arc;

// Jump-table slots for the verdict terminators, shared with the parser
// pipeline.
pub const PROG_INDEX_ALLOWED: i32 = 0;
pub const PROG_INDEX_DROP: i32 = 1;
pub const PROG_INDEX_V6_ALLOWED: i32 = 2;
pub const PROG_INDEX_V6_DROP: i32 = 3;

/// Verdict when an XDP program matches nothing: hand the packet to the
/// next layer.
pub const XDP_PASS: i32 = 2;
const XDP_DROP: i32 = 1;
const TC_ACT_SHOT: i32 = 2;

const HOST_FLAGS: i32 = (state::FLAG_SRC_IS_HOST | state::FLAG_DST_IS_HOST) as i32;

/// Assembles classifier programs against a shared ID allocator and the
/// lookup-table descriptors of one IP version.
pub struct Builder<'a> {
    alloc: &'a mut IdAllocator,
    ipsets_map_fd: u32,
    state_map_fd: u32,
    jump_map_fd: u32,
    ipv6: bool,
}

/// Which destination slot a stage matches against.
#[derive(Copy, Clone, Debug)]
struct DstSel {
    addr_off: i16,
    port_off: i16,
}

const PRE_NAT_DST: DstSel = DstSel {
    addr_off: state::OFF_PRE_NAT_DST_ADDR,
    port_off: state::OFF_PRE_NAT_DST_PORT,
};
const POST_NAT_DST: DstSel = DstSel {
    addr_off: state::OFF_POST_NAT_DST_ADDR,
    port_off: state::OFF_POST_NAT_DST_PORT,
};

// === impl Builder ===

impl<'a> Builder<'a> {
    pub fn new(
        alloc: &'a mut IdAllocator,
        ipsets_map_fd: u32,
        state_map_fd: u32,
        jump_map_fd: u32,
    ) -> Self {
        Self {
            alloc,
            ipsets_map_fd,
            state_map_fd,
            jump_map_fd,
            ipv6: false,
        }
    }

    /// Switches the builder to IPv6: four-limb address compares and the
    /// v6 table layout and terminator slots.
    pub fn enable_ipv6_mode(&mut self) {
        self.ipv6 = true;
    }

    /// Assembles the program for one leg.
    pub fn instructions(&mut self, rules: &EndpointRules) -> Result<Vec<Insn>> {
        let mut b = Block::new();
        self.prologue(&mut b, rules.for_xdp);

        if rules.for_xdp {
            self.emit_tiers(&mut b, &rules.host_normal_tiers, "xdp", POST_NAT_DST, "allow");
            // No match: record it and pass the packet to the next layer.
            b.mov32_imm(R1, state::PolicyVerdict::NoMatch as i32);
            b.store(SZ_W, R6, state::OFF_POLICY_RC, R1);
            b.mov32_imm(R0, XDP_PASS);
            b.exit();
        } else if rules.for_host_interface {
            self.emit_host_program(&mut b, rules);
        } else {
            self.emit_workload_program(&mut b, rules);
        }

        self.emit_verdicts(&mut b, rules.for_xdp);
        b.assemble()
    }

    /// Host interface: pre-DNAT tiers guard everything; forwarded
    /// traffic then runs the apply-on-forward tiers and is allowed by
    /// default, while to/from-host traffic runs the normal tiers and
    /// profiles and is denied by default.
    fn emit_host_program(&mut self, b: &mut Block, rules: &EndpointRules) {
        self.emit_tiers(b, &rules.host_pre_dnat_tiers, "pre", PRE_NAT_DST, "allow");

        b.load(SZ_W, R1, R6, state::OFF_FLAGS);
        b.jump_set_imm(R1, HOST_FLAGS, "host_traffic");
        self.emit_tiers(b, &rules.host_forward_tiers, "fwd", POST_NAT_DST, "allow");
        b.jump("allow");

        b.label("host_traffic");
        self.emit_tiers(b, &rules.host_normal_tiers, "norm", POST_NAT_DST, "allow");
        self.emit_profiles(b, &rules.host_profiles, "prof", POST_NAT_DST, "allow");
        b.jump("deny");
    }

    /// Workload interface, possibly wrapped in host policy. The host
    /// pre-DNAT and forward chains act as guards here: their allow falls
    /// through to the workload tiers rather than terminating.
    fn emit_workload_program(&mut self, b: &mut Block, rules: &EndpointRules) {
        if !rules.host_pre_dnat_tiers.is_empty() {
            self.emit_tiers(b, &rules.host_pre_dnat_tiers, "pre", PRE_NAT_DST, "pre_done");
            b.label("pre_done");
        }
        if !rules.host_forward_tiers.is_empty() {
            b.load(SZ_W, R1, R6, state::OFF_FLAGS);
            b.jump_set_imm(R1, HOST_FLAGS, "wl_start");
            self.emit_tiers(b, &rules.host_forward_tiers, "fwd", POST_NAT_DST, "fwd_done");
            b.label("fwd_done");
            b.label("wl_start");
        }

        let evaluate_host_normal = !rules.suppress_normal_host_policy
            && (!rules.host_normal_tiers.is_empty() || !rules.host_profiles.is_empty());
        let wl_allow = if evaluate_host_normal { "host_normal" } else { "allow" };

        self.emit_tiers(b, &rules.tiers, "wl", POST_NAT_DST, wl_allow);
        self.emit_profiles(b, &rules.profiles, "wlprof", POST_NAT_DST, wl_allow);
        b.jump("deny");

        if evaluate_host_normal {
            // Traffic the workload leg allowed still has to clear the
            // host's normal policy when it terminates at the host.
            b.label("host_normal");
            b.load(SZ_W, R1, R6, state::OFF_FLAGS);
            b.jump_set_imm(R1, HOST_FLAGS, "hn_tiers");
            b.jump("allow");
            b.label("hn_tiers");
            self.emit_tiers(b, &rules.host_normal_tiers, "hn", POST_NAT_DST, "allow");
            self.emit_profiles(b, &rules.host_profiles, "hnprof", POST_NAT_DST, "allow");
            b.jump("deny");
        }
    }

    fn prologue(&mut self, b: &mut Block, xdp: bool) {
        // The context pointer survives in R7 for the tail call.
        b.mov64_reg(R7, R1);

        // Locate the state block: key 0 in the state table.
        b.mov32_imm(R1, 0);
        b.store(SZ_W, R10, -4, R1);
        b.load_map_fd(R1, self.state_map_fd);
        b.mov64_reg(R2, R10);
        b.add64_imm(R2, -4);
        b.call(HELPER_MAP_LOOKUP_ELEM);
        b.jump_ne_imm(R0, 0, "state_ok");
        b.mov32_imm(R0, if xdp { XDP_DROP } else { TC_ACT_SHOT });
        b.exit();
        b.label("state_ok");
        b.mov64_reg(R6, R0);

        // Short-circuit on the connection-tracking verdict.
        b.load(SZ_B, R1, R6, state::OFF_CT_STATUS);
        b.jump_eq_imm(R1, state::CT_ESTABLISHED_REPLY as i32, "allow");
        b.jump_eq_imm(R1, state::CT_DENY as i32, "deny");
    }

    fn emit_verdicts(&mut self, b: &mut Block, xdp: bool) {
        let (allowed_idx, drop_idx) = if self.ipv6 {
            (PROG_INDEX_V6_ALLOWED, PROG_INDEX_V6_DROP)
        } else {
            (PROG_INDEX_ALLOWED, PROG_INDEX_DROP)
        };
        let drop_ret = if xdp { XDP_DROP } else { TC_ACT_SHOT };

        b.label("allow");
        b.mov32_imm(R1, state::PolicyVerdict::Allow as i32);
        b.store(SZ_W, R6, state::OFF_POLICY_RC, R1);
        b.load(SZ_W, R1, R6, state::OFF_FLAGS);
        b.or32_imm(R1, state::FLAG_APPROVED as i32);
        b.store(SZ_W, R6, state::OFF_FLAGS, R1);
        self.emit_tail_call(b, allowed_idx, drop_ret);

        b.label("deny");
        b.mov32_imm(R1, state::PolicyVerdict::Deny as i32);
        b.store(SZ_W, R6, state::OFF_POLICY_RC, R1);
        self.emit_tail_call(b, drop_idx, drop_ret);
    }

    fn emit_tail_call(&mut self, b: &mut Block, index: i32, fallback_ret: i32) {
        b.mov64_reg(R1, R7);
        b.load_map_fd(R2, self.jump_map_fd);
        b.mov32_imm(R3, index);
        b.call(HELPER_TAIL_CALL);
        // Only reached if the jump-table slot is empty.
        b.mov32_imm(R0, fallback_ret);
        b.exit();
    }

    fn emit_tiers(
        &mut self,
        b: &mut Block,
        tiers: &[TierRules],
        stage: &str,
        dst: DstSel,
        allow: &str,
    ) {
        for (ti, tier) in tiers.iter().enumerate() {
            let pass = format!("{stage}_t{ti}_pass");
            for (pi, policy) in tier.policies.iter().enumerate() {
                self.emit_policy(b, policy, &format!("{stage}_t{ti}_p{pi}"), dst, allow, &pass);
            }
            if tier.end_action == TierEndAction::Deny {
                b.jump("deny");
            }
            b.label(pass);
        }
    }

    /// Profiles evaluate as a single ordered rule list after the tiers;
    /// a pass action skips the remaining profiles.
    fn emit_profiles(
        &mut self,
        b: &mut Block,
        profiles: &[Arc<PolicyRules>],
        stage: &str,
        dst: DstSel,
        allow: &str,
    ) {
        let pass = format!("{stage}_end");
        for (pi, profile) in profiles.iter().enumerate() {
            self.emit_policy(b, profile, &format!("{stage}_p{pi}"), dst, allow, &pass);
        }
        b.label(pass);
    }

    fn emit_policy(
        &mut self,
        b: &mut Block,
        policy: &PolicyRules,
        prefix: &str,
        dst: DstSel,
        allow: &str,
        pass: &str,
    ) {
        for (ri, rule) in policy.rules.iter().enumerate() {
            self.emit_rule(b, rule, &format!("{prefix}_r{ri}"), dst, allow, pass);
        }
    }

    /// Emits one rule: a chain of predicate checks, each of which bails
    /// to the end label on the first mismatch, then the action jump.
    fn emit_rule(
        &mut self,
        b: &mut Block,
        rule: &Rule,
        prefix: &str,
        dst: DstSel,
        allow: &str,
        pass: &str,
    ) {
        let version = if self.ipv6 { IpVersion::V6 } else { IpVersion::V4 };
        if rule.ip_version.map(|v| v != version).unwrap_or(false) {
            return;
        }
        let action = match rule.action {
            Some(Action::Log) | None => return,
            Some(action) => action,
        };

        let end = format!("{prefix}_end");

        if let Some(protocol) = rule.protocol {
            b.load(SZ_B, R1, R6, state::OFF_IP_PROTO);
            b.jump_ne_imm(R1, protocol.number() as i32, &end);
        }
        if let Some(protocol) = rule.not_protocol {
            b.load(SZ_B, R1, R6, state::OFF_IP_PROTO);
            b.jump_eq_imm(R1, protocol.number() as i32, &end);
        }

        self.emit_icmp(b, rule, &end, prefix);

        self.emit_net_match(b, &rule.src_nets, state::OFF_SRC_ADDR, false, &end, &format!("{prefix}_sn"));
        self.emit_net_match(b, &rule.not_src_nets, state::OFF_SRC_ADDR, true, &end, &format!("{prefix}_nsn"));
        self.emit_net_match(b, &rule.dst_nets, dst.addr_off, false, &end, &format!("{prefix}_dn"));
        self.emit_net_match(b, &rule.not_dst_nets, dst.addr_off, true, &end, &format!("{prefix}_ndn"));

        self.emit_port_match(b, &rule.src_ports, state::OFF_SRC_PORT, false, &end, &format!("{prefix}_sp"));
        self.emit_port_match(b, &rule.not_src_ports, state::OFF_SRC_PORT, true, &end, &format!("{prefix}_nsp"));
        self.emit_port_match(b, &rule.dst_ports, dst.port_off, false, &end, &format!("{prefix}_dp"));
        self.emit_port_match(b, &rule.not_dst_ports, dst.port_off, true, &end, &format!("{prefix}_ndp"));

        let src = DstSel {
            addr_off: state::OFF_SRC_ADDR,
            port_off: state::OFF_SRC_PORT,
        };
        self.emit_set_match(b, &rule.src_ip_set_ids, src, false, false, &end, &format!("{prefix}_ss"));
        self.emit_set_match(b, &rule.not_src_ip_set_ids, src, false, true, &end, &format!("{prefix}_nss"));
        self.emit_set_match(b, &rule.dst_ip_set_ids, dst, false, false, &end, &format!("{prefix}_ds"));
        self.emit_set_match(b, &rule.not_dst_ip_set_ids, dst, false, true, &end, &format!("{prefix}_nds"));
        self.emit_set_match(b, &rule.src_named_port_ip_set_ids, src, true, false, &end, &format!("{prefix}_snp"));
        self.emit_set_match(b, &rule.not_src_named_port_ip_set_ids, src, true, true, &end, &format!("{prefix}_nsnp"));
        self.emit_set_match(b, &rule.dst_named_port_ip_set_ids, dst, true, false, &end, &format!("{prefix}_dnp"));
        self.emit_set_match(b, &rule.not_dst_named_port_ip_set_ids, dst, true, true, &end, &format!("{prefix}_ndnp"));

        match action {
            Action::Allow => b.jump(allow),
            Action::Deny => b.jump("deny"),
            Action::Pass => b.jump(pass),
            Action::Log => unreachable!("log rules are skipped above"),
        }
        b.label(end);
    }

    /// ICMP matches imply the ICMP protocol for this IP version.
    fn emit_icmp(&mut self, b: &mut Block, rule: &Rule, end: &str, prefix: &str) {
        if rule.icmp.is_none() && rule.not_icmp.is_none() {
            return;
        }
        let icmp_proto = if self.ipv6 { 58 } else { 1 };
        b.load(SZ_B, R1, R6, state::OFF_IP_PROTO);
        b.jump_ne_imm(R1, icmp_proto, end);

        if let Some(icmp) = rule.icmp {
            b.load(SZ_B, R1, R6, state::OFF_ICMP_TYPE);
            b.jump_ne_imm(R1, icmp.ty as i32, end);
            if let Some(code) = icmp.code {
                b.load(SZ_B, R1, R6, state::OFF_ICMP_CODE);
                b.jump_ne_imm(R1, code as i32, end);
            }
        }
        if let Some(icmp) = rule.not_icmp {
            match icmp.code {
                None => {
                    b.load(SZ_B, R1, R6, state::OFF_ICMP_TYPE);
                    b.jump_eq_imm(R1, icmp.ty as i32, end);
                }
                Some(code) => {
                    // Excluded only when both type and code match.
                    let ok = format!("{prefix}_ni_ok");
                    b.load(SZ_B, R1, R6, state::OFF_ICMP_TYPE);
                    b.jump_ne_imm(R1, icmp.ty as i32, &ok);
                    b.load(SZ_B, R1, R6, state::OFF_ICMP_CODE);
                    b.jump_eq_imm(R1, code as i32, end);
                    b.label(ok);
                }
            }
        }
    }

    /// CIDR lists compile to inline masked compares; the mask arithmetic
    /// happens here at build time. IPv6 addresses compare as four 32-bit
    /// limbs.
    fn emit_net_match(
        &mut self,
        b: &mut Block,
        nets: &[IpNet],
        addr_off: i16,
        negate: bool,
        end: &str,
        prefix: &str,
    ) {
        if nets.is_empty() {
            return;
        }
        // CIDRs of the other family can never match in this program.
        let nets: Vec<&IpNet> = nets
            .iter()
            .filter(|n| matches!(n, IpNet::V6(_)) == self.ipv6)
            .collect();
        if nets.is_empty() {
            if !negate {
                // A positive list with no viable alternative is
                // unsatisfiable.
                b.jump(end);
            }
            return;
        }
        let last = nets.len() - 1;
        let ok = format!("{prefix}_ok");
        let miss = format!("{prefix}_miss");

        for (j, net) in nets.into_iter().enumerate() {
            if j > 0 {
                b.label(format!("{prefix}_c{j}"));
            }
            let next: String = if j < last {
                format!("{prefix}_c{}", j + 1)
            } else if negate {
                miss.clone()
            } else {
                end.to_string()
            };

            for (i, (mask, value)) in net_limbs(net).iter().enumerate() {
                b.load(SZ_W, R1, R6, addr_off + 4 * i as i16);
                b.and32_imm(R1, *mask as i32);
                b.jump32_ne_imm(R1, *value as i32, &next);
            }
            if negate {
                b.jump(end);
            } else {
                b.jump(&ok);
            }
        }

        if negate {
            b.label(miss);
        } else {
            b.label(ok);
        }
    }

    fn emit_port_match(
        &mut self,
        b: &mut Block,
        ports: &[PortRange],
        port_off: i16,
        negate: bool,
        end: &str,
        prefix: &str,
    ) {
        if ports.is_empty() {
            return;
        }
        let ok = format!("{prefix}_ok");
        let hit = if negate { end } else { ok.as_str() };

        b.load(SZ_H, R1, R6, port_off);
        for (j, range) in ports.iter().enumerate() {
            if range.first == range.last {
                b.jump_eq_imm(R1, range.first as i32, hit);
            } else {
                let skip = format!("{prefix}_s{j}");
                b.jump_lt_imm(R1, range.first as i32, &skip);
                b.jump_le_imm(R1, range.last as i32, hit);
                b.label(skip);
            }
        }
        if !negate {
            b.jump(end);
            b.label(ok);
        }
    }

    /// IP-set membership: one full-length trie lookup per referenced set,
    /// keyed by (set id, address[, proto, port]).
    #[allow(clippy::too_many_arguments)]
    fn emit_set_match(
        &mut self,
        b: &mut Block,
        ids: &[String],
        sel: DstSel,
        named_port: bool,
        negate: bool,
        end: &str,
        prefix: &str,
    ) {
        if ids.is_empty() {
            return;
        }
        let ok = format!("{prefix}_ok");
        let (key_base, addr_limbs, lookup_prefix) = if self.ipv6 {
            (-(4 + ipsets::KEY_SIZE_V6 as i16), 4, ipsets::LOOKUP_PREFIX_V6)
        } else {
            (-(4 + ipsets::KEY_SIZE_V4 as i16), 1, ipsets::LOOKUP_PREFIX_V4)
        };

        for id in ids {
            let set_id = self.alloc.get_or_alloc(id);

            b.mov32_imm(R1, lookup_prefix as i32);
            b.store(SZ_W, R10, key_base, R1);
            b.mov32_imm(R1, set_id as u32 as i32);
            b.store(SZ_W, R10, key_base + 4, R1);
            b.mov32_imm(R1, (set_id >> 32) as u32 as i32);
            b.store(SZ_W, R10, key_base + 8, R1);
            for i in 0..addr_limbs {
                b.load(SZ_W, R1, R6, sel.addr_off + 4 * i as i16);
                b.store(SZ_W, R10, key_base + 12 + 4 * i as i16, R1);
            }
            let tail_off = key_base + 12 + 4 * addr_limbs as i16;
            if named_port {
                b.load(SZ_H, R1, R6, sel.port_off);
                b.load(SZ_B, R2, R6, state::OFF_IP_PROTO);
                b.lsh32_imm(R2, 16);
                b.or32_reg(R1, R2);
            } else {
                b.mov32_imm(R1, 0);
            }
            b.store(SZ_W, R10, tail_off, R1);

            b.load_map_fd(R1, self.ipsets_map_fd);
            b.mov64_reg(R2, R10);
            b.add64_imm(R2, key_base as i32);
            b.call(HELPER_MAP_LOOKUP_ELEM);
            if negate {
                b.jump_ne_imm(R0, 0, end);
            } else {
                b.jump_ne_imm(R0, 0, &ok);
            }
        }
        if !negate {
            b.jump(end);
            b.label(ok);
        }
    }
}

/// (mask, value) limb pairs in the 32-bit little-endian interpretation
/// the program uses when it loads address words from the state block.
fn net_limbs(net: &IpNet) -> Vec<(u32, u32)> {
    match net {
        IpNet::V4(v4) => {
            vec![(
                u32::from_le_bytes(v4.netmask().octets()),
                u32::from_le_bytes(v4.network().octets()),
            )]
        }
        IpNet::V6(v6) => {
            let mask = v6.netmask().octets();
            let net = v6.network().octets();
            (0..4)
                .map(|i| {
                    let limb = |b: &[u8; 16]| {
                        u32::from_le_bytes(b[4 * i..4 * i + 4].try_into().unwrap())
                    };
                    (limb(&mask), limb(&net))
                })
                .collect()
        }
    }
}

/// Filters out the members that belong in the lookup table for this
/// builder's IP version, in encoded form.
pub fn member_entry(
    ipv6: bool,
    set_id: u64,
    member: &IpSetMember,
) -> Option<Vec<u8>> {
    if ipv6 {
        ipsets::entry_v6(set_id, member).map(|k| k.to_vec())
    } else {
        ipsets::entry_v4(set_id, member).map(|k| k.to_vec())
    }
}
