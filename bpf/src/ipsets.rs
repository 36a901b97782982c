//! Key encoding for the shared IP-set lookup tables.
//!
//! The tables are longest-prefix-match tries. A key is
//! `prefix_len ‖ set_id ‖ addr ‖ port ‖ proto ‖ pad`; address members
//! cover the set id plus their CIDR bits, while named-port members extend
//! the prefix over the port and protocol so that both must match. The
//! policy program performs one full-length lookup per referenced set.

use ipnet::IpNet;
use palisade_core::IpSetMember;

/// v4 key: 4 (prefix) + 8 (set id) + 4 (addr) + 2 (port) + 1 (proto) + 1.
pub const KEY_SIZE_V4: usize = 20;
/// v6 key: as v4 with a 16-byte address.
pub const KEY_SIZE_V6: usize = 32;

/// Prefix length a lookup key uses: every data bit participates.
pub const LOOKUP_PREFIX_V4: u32 = 8 * (KEY_SIZE_V4 as u32 - 4);
pub const LOOKUP_PREFIX_V6: u32 = 8 * (KEY_SIZE_V6 as u32 - 4);

/// Set-membership tables only need key presence; values are a fixed
/// placeholder word.
pub const MEMBER_VALUE: [u8; 4] = [1, 0, 0, 0];

/// Encodes a member of set `id` as a v4 table entry, or `None` for an
/// IPv6 member.
pub fn entry_v4(id: u64, member: &IpSetMember) -> Option<[u8; KEY_SIZE_V4]> {
    let net = member.net();
    let addr = match net {
        IpNet::V4(v4) => v4.addr().octets(),
        IpNet::V6(_) => return None,
    };

    let mut key = [0u8; KEY_SIZE_V4];
    key[..4].copy_from_slice(&member_prefix(id, member, 32).to_le_bytes());
    key[4..12].copy_from_slice(&id.to_le_bytes());
    key[12..16].copy_from_slice(&addr);
    fill_port_proto(&mut key[16..], member);
    Some(key)
}

/// Encodes a member of set `id` as a v6 table entry, or `None` for an
/// IPv4 member.
pub fn entry_v6(id: u64, member: &IpSetMember) -> Option<[u8; KEY_SIZE_V6]> {
    let net = member.net();
    let addr = match net {
        IpNet::V4(_) => return None,
        IpNet::V6(v6) => v6.addr().octets(),
    };

    let mut key = [0u8; KEY_SIZE_V6];
    key[..4].copy_from_slice(&member_prefix(id, member, 128).to_le_bytes());
    key[4..12].copy_from_slice(&id.to_le_bytes());
    key[12..28].copy_from_slice(&addr);
    fill_port_proto(&mut key[28..], member);
    Some(key)
}

fn member_prefix(_id: u64, member: &IpSetMember, addr_bits: u32) -> u32 {
    let cidr_bits = u32::from(member.net().prefix_len());
    match member {
        IpSetMember::Net(_) => 64 + cidr_bits,
        IpSetMember::NamedPort { .. } => {
            if cidr_bits < addr_bits {
                // The trie cannot match a port behind wildcard address
                // bits; fall back to an address-level match.
                tracing::debug!(
                    member = %member,
                    "named-port member with a partial CIDR matches on address only"
                );
                64 + cidr_bits
            } else {
                64 + addr_bits + 24
            }
        }
    }
}

fn fill_port_proto(tail: &mut [u8], member: &IpSetMember) {
    if let IpSetMember::NamedPort { protocol, port, .. } = member {
        tail[..2].copy_from_slice(&port.to_le_bytes());
        tail[2] = protocol.number();
    }
}
