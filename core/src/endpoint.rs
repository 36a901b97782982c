use crate::{policy::TierEndAction, rule::Rule, IpVersion};
use std::sync::Arc;

/// Whether an endpoint fronts a workload interface or a host interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Workload,
    Host,
}

/// Traffic direction relative to the endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

/// Identifies an endpoint resource across the indexes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub kind: EndpointKind,
    pub name: String,
}

/// A named rule list, fully resolved: policy and profile bodies look the
/// same to the program builder and the chain renderer.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyRules {
    pub name: String,
    pub rules: Vec<Rule>,
}

/// A tier's worth of resolved policies, in evaluation order.
#[derive(Clone, Debug, PartialEq)]
pub struct TierRules {
    pub name: String,
    pub end_action: TierEndAction,
    pub policies: Vec<Arc<PolicyRules>>,
}

/// Everything the dataplane needs to program one leg (one direction) of
/// one interface: the applicable tier chains and fallback profiles.
///
/// Workload interfaces use `tiers` + `profiles`. Host interfaces use the
/// three host chains and `host_profiles`; a workload interface paired
/// with host policy sets `suppress_normal_host_policy` so that only the
/// pre-DNAT and forward chains of the host policy apply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EndpointRules {
    pub for_host_interface: bool,
    pub for_xdp: bool,
    pub suppress_normal_host_policy: bool,

    pub tiers: Vec<TierRules>,
    pub profiles: Vec<Arc<PolicyRules>>,

    pub host_pre_dnat_tiers: Vec<TierRules>,
    pub host_forward_tiers: Vec<TierRules>,
    pub host_normal_tiers: Vec<TierRules>,
    pub host_profiles: Vec<Arc<PolicyRules>>,
}

/// The compiled, per-interface policy for an endpoint: one rule set per
/// direction, ready for the program builder or the chain renderer.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedEndpoint {
    pub key: EndpointKey,
    pub iface_name: String,
    pub ip_version: IpVersion,
    pub ingress: EndpointRules,
    pub egress: EndpointRules,
    /// Early-drop program rules; only host endpoints with XDP-scoped
    /// policy carry one.
    pub xdp: Option<EndpointRules>,
}

// === impl EndpointKey ===

impl EndpointKey {
    pub fn workload(name: impl ToString) -> Self {
        Self {
            kind: EndpointKind::Workload,
            name: name.to_string(),
        }
    }

    pub fn host(name: impl ToString) -> Self {
        Self {
            kind: EndpointKind::Host,
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            EndpointKind::Workload => write!(f, "wep/{}", self.name),
            EndpointKind::Host => write!(f, "hep/{}", self.name),
        }
    }
}

// === impl TierRules ===

impl TierRules {
    pub fn new(name: impl ToString, end_action: TierEndAction) -> Self {
        Self {
            name: name.to_string(),
            end_action,
            policies: Vec::new(),
        }
    }

    pub fn with_policy(mut self, name: impl ToString, rules: Vec<Rule>) -> Self {
        self.policies.push(Arc::new(PolicyRules {
            name: name.to_string(),
            rules,
        }));
        self
    }
}
