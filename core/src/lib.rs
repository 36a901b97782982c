//! Core data model for the palisade dataplane agent.
//!
//! This crate defines the cluster policy model as the agent sees it after
//! ingestion: rules, tiers, policies, profiles, IP sets and the resolved
//! per-endpoint policy that the program builder and the chain renderer
//! consume. It carries no I/O; the indexing and rendering crates layer on
//! top of it.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod endpoint;
mod fatal;
mod idalloc;
mod ipset;
mod labels;
mod policy;
mod protocol;
mod rule;
mod update;

pub use self::{
    endpoint::{
        Direction, EndpointKey, EndpointKind, EndpointRules, PolicyRules, ResolvedEndpoint,
        TierRules,
    },
    fatal::fatal,
    idalloc::IdAllocator,
    ipset::{IpSetKind, IpSetMember, NamedPortProtocol},
    labels::{Expression, Labels, Operator, Selector},
    policy::{Policy, PolicyScope, Profile, Tier, TierEndAction},
    protocol::{IpVersion, Protocol},
    rule::{Action, IcmpMatch, PortRange, Rule},
    update::{
        EndpointSlice, HostEndpoint, IpSetResource, Kind, Resource, ResourceKey, SliceEndpoint,
        SlicePort, Update, WorkloadEndpoint,
    },
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
