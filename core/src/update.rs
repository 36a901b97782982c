use crate::{
    ipset::{IpSetKind, IpSetMember, NamedPortProtocol},
    labels::Labels,
    policy::{Policy, Profile, Tier},
    IpVersion,
};
use std::net::IpAddr;

/// Resource kinds recognized by the core.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Endpoint,
    HostEndpoint,
    Policy,
    Tier,
    Profile,
    IpSet,
    EndpointSlice,
    NodeIps,
    ConfigOverride,
}

/// Identifies one resource in the inbound stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: Kind,
    pub namespace: Option<String>,
    pub name: String,
}

/// One observed change: the resource is either present with a payload or
/// absent.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub key: ResourceKey,
    pub value: Option<Resource>,
}

/// Resource payloads, one variant per kind. Components match on this
/// exhaustively so that adding a kind forces every consumer to decide.
#[derive(Clone, Debug, PartialEq)]
pub enum Resource {
    Endpoint(WorkloadEndpoint),
    HostEndpoint(HostEndpoint),
    Policy(Policy),
    Tier(Tier),
    Profile(Profile),
    IpSet(IpSetResource),
    EndpointSlice(EndpointSlice),
    NodeIps(Vec<IpAddr>),
    ConfigOverride(Option<String>),
}

/// A workload endpoint: a local container interface with labels.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadEndpoint {
    pub labels: Labels,
    pub profile_ids: Vec<String>,
    pub iface_name: String,
    pub ip_version: IpVersion,
}

/// A host endpoint: a physical or bond interface on the node itself.
#[derive(Clone, Debug, PartialEq)]
pub struct HostEndpoint {
    pub labels: Labels,
    pub profile_ids: Vec<String>,
    pub iface_name: String,
    pub ip_version: IpVersion,
    pub expected_addrs: Vec<IpAddr>,
}

/// Declarative IP set contents; the index diffs successive payloads.
#[derive(Clone, Debug, PartialEq)]
pub struct IpSetResource {
    pub kind: IpSetKind,
    pub members: Vec<IpSetMember>,
}

/// A slice of a virtual service's backing endpoints.
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointSlice {
    /// `namespace/name` of the owning service.
    pub service: String,
    pub endpoints: Vec<SliceEndpoint>,
    pub ports: Vec<SlicePort>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SliceEndpoint {
    pub addresses: Vec<IpAddr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SlicePort {
    /// `None` means the port is unrestricted, which contributes no set
    /// membership.
    pub port: Option<u16>,
    pub protocol: Option<NamedPortProtocol>,
}

// === impl ResourceKey ===

impl ResourceKey {
    pub fn global(kind: Kind, name: impl ToString) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn namespaced(kind: Kind, namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{:?}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{:?}/{}", self.kind, self.name),
        }
    }
}
