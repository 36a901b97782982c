use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use palisade_core::{
    Direction, EndpointKey, EndpointRules, HostEndpoint, Labels, Policy, PolicyRules, PolicyScope,
    Profile, ResolvedEndpoint, Tier, TierRules, WorkloadEndpoint,
};
use std::sync::Arc;

/// Determines, per endpoint, the ordered tiers/policies/profiles that
/// apply to each traffic direction.
///
/// The resolver owns the endpoint → policy mapping; policies own only
/// their rule lists, and cross-references are plain names resolved here.
/// Every mutation returns the set of endpoints whose resolution may have
/// changed; the dispatcher treats that as the dirty set.
#[derive(Debug, Default)]
pub struct PolicyResolver {
    endpoints: HashMap<EndpointKey, Endpoint>,
    policies: HashMap<String, Arc<Policy>>,
    tiers: HashMap<String, Tier>,
    profiles: HashMap<String, Arc<Profile>>,
}

#[derive(Clone, Debug)]
enum Endpoint {
    Workload(WorkloadEndpoint),
    Host(HostEndpoint),
}

pub type DirtySet = HashSet<EndpointKey>;

// === impl PolicyResolver ===

impl PolicyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint_keys(&self) -> impl Iterator<Item = &EndpointKey> {
        self.endpoints.keys()
    }

    pub fn update_workload_endpoint(
        &mut self,
        name: &str,
        ep: Option<WorkloadEndpoint>,
    ) -> DirtySet {
        let key = EndpointKey::workload(name);
        match ep {
            Some(ep) => self.endpoints.insert(key.clone(), Endpoint::Workload(ep)),
            None => self.endpoints.remove(&key),
        };
        Some(key).into_iter().collect()
    }

    pub fn update_host_endpoint(&mut self, name: &str, ep: Option<HostEndpoint>) -> DirtySet {
        let key = EndpointKey::host(name);
        match ep {
            Some(ep) => self.endpoints.insert(key.clone(), Endpoint::Host(ep)),
            None => self.endpoints.remove(&key),
        };
        Some(key).into_iter().collect()
    }

    /// Applies a policy change, dirtying every endpoint the policy
    /// selected before or selects after.
    pub fn update_policy(&mut self, name: &str, policy: Option<Policy>) -> DirtySet {
        let old = match policy {
            Some(policy) => self.policies.insert(name.to_string(), Arc::new(policy)),
            None => self.policies.remove(name),
        };
        let new = self.policies.get(name).cloned();

        self.endpoints
            .iter()
            .filter(|(_, ep)| {
                let labels = self.effective_labels(ep);
                old.as_ref().map(|p| p.selector.matches(&labels)) == Some(true)
                    || new.as_ref().map(|p| p.selector.matches(&labels)) == Some(true)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Applies a tier change, dirtying endpoints selected by any policy
    /// in the tier.
    pub fn update_tier(&mut self, name: &str, tier: Option<Tier>) -> DirtySet {
        match tier {
            Some(tier) => self.tiers.insert(name.to_string(), tier),
            None => self.tiers.remove(name),
        };

        let tier_policies: Vec<&Arc<Policy>> = self
            .policies
            .values()
            .filter(|p| p.tier == name)
            .collect();
        self.endpoints
            .iter()
            .filter(|(_, ep)| {
                let labels = self.effective_labels(ep);
                tier_policies.iter().any(|p| p.selector.matches(&labels))
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Applies a profile change. Profile labels feed selector matching,
    /// so every endpoint referencing the profile is dirtied.
    pub fn update_profile(&mut self, name: &str, profile: Option<Profile>) -> DirtySet {
        match profile {
            Some(profile) => self.profiles.insert(name.to_string(), Arc::new(profile)),
            None => self.profiles.remove(name),
        };

        self.endpoints
            .iter()
            .filter(|(_, ep)| profile_ids(ep).iter().any(|id| id == name))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Computes the resolved policy for an endpoint, or `None` if the
    /// endpoint resource is gone.
    pub fn resolve(&self, key: &EndpointKey) -> Option<ResolvedEndpoint> {
        let ep = self.endpoints.get(key)?;
        let labels = self.effective_labels(ep);

        let mut matched: Vec<(&str, &Arc<Policy>)> = self
            .policies
            .iter()
            .filter(|(_, p)| p.selector.matches(&labels))
            .map(|(name, p)| (name.as_str(), p))
            .collect();
        // Declared order: tiers first, then policy order within the tier.
        // Name ties keep the output deterministic.
        matched.sort_by(|(a_name, a), (b_name, b)| {
            let a_tier = self.tier_sort_key(&a.tier);
            let b_tier = self.tier_sort_key(&b.tier);
            a_tier
                .cmp(&b_tier)
                .then_with(|| order_key(a.order).cmp(&order_key(b.order)))
                .then_with(|| a_name.cmp(b_name))
        });

        let profiles = self.named_profiles(ep);
        let (ingress, egress, xdp) = match ep {
            Endpoint::Workload(_) => {
                let ingress = EndpointRules {
                    tiers: self.tiers_for(&matched, |s| {
                        matches!(s, PolicyScope::Normal | PolicyScope::Ingress)
                    }),
                    profiles: profiles.clone(),
                    ..EndpointRules::default()
                };
                let egress = EndpointRules {
                    tiers: self.tiers_for(&matched, |s| {
                        matches!(s, PolicyScope::Normal | PolicyScope::Egress)
                    }),
                    profiles,
                    ..EndpointRules::default()
                };
                (ingress, egress, None)
            }
            Endpoint::Host(_) => {
                let host_leg = |direction: Direction| {
                    let scope = match direction {
                        Direction::Ingress => PolicyScope::Ingress,
                        Direction::Egress => PolicyScope::Egress,
                    };
                    EndpointRules {
                        for_host_interface: true,
                        host_pre_dnat_tiers: self
                            .tiers_for(&matched, |s| s == PolicyScope::PreDnat),
                        host_forward_tiers: self
                            .tiers_for(&matched, |s| s == PolicyScope::ApplyOnForward),
                        host_normal_tiers: self.tiers_for(&matched, |s| {
                            s == PolicyScope::Normal || s == scope
                        }),
                        host_profiles: profiles.clone(),
                        ..EndpointRules::default()
                    }
                };

                let xdp_tiers = self.tiers_for(&matched, |s| s == PolicyScope::Xdp);
                let xdp = (!xdp_tiers.is_empty()).then(|| EndpointRules {
                    for_host_interface: true,
                    for_xdp: true,
                    host_normal_tiers: xdp_tiers,
                    ..EndpointRules::default()
                });

                (
                    host_leg(Direction::Ingress),
                    host_leg(Direction::Egress),
                    xdp,
                )
            }
        };

        Some(ResolvedEndpoint {
            key: key.clone(),
            iface_name: iface_name(ep).to_string(),
            ip_version: ip_version(ep),
            ingress,
            egress,
            xdp,
        })
    }

    fn tiers_for(
        &self,
        matched: &[(&str, &Arc<Policy>)],
        scope: impl Fn(PolicyScope) -> bool,
    ) -> Vec<TierRules> {
        let mut tiers: Vec<TierRules> = Vec::new();
        for (name, policy) in matched {
            if !scope(policy.scope) {
                continue;
            }
            let end_action = self
                .tiers
                .get(&policy.tier)
                .cloned()
                .unwrap_or_default()
                .end_action;
            if tiers.last().map(|t| t.name != policy.tier).unwrap_or(true) {
                tiers.push(TierRules::new(&policy.tier, end_action));
            }
            tiers.last_mut().unwrap().policies.push(Arc::new(PolicyRules {
                name: name.to_string(),
                rules: policy.rules.clone(),
            }));
        }
        tiers
    }

    fn tier_sort_key(&self, tier: &str) -> (i64, String) {
        let order = self
            .tiers
            .get(tier)
            .map(|t| order_key(t.order))
            .unwrap_or(i64::MAX);
        (order, tier.to_string())
    }

    fn named_profiles(&self, ep: &Endpoint) -> Vec<Arc<PolicyRules>> {
        profile_ids(ep)
            .iter()
            .filter_map(|id| {
                let profile = match self.profiles.get(id) {
                    Some(profile) => profile,
                    None => {
                        tracing::debug!(profile = %id, "endpoint references unknown profile");
                        return None;
                    }
                };
                Some(Arc::new(PolicyRules {
                    name: id.clone(),
                    rules: profile.rules.clone(),
                }))
            })
            .collect()
    }

    /// The labels a selector sees: profile labels first (earlier profiles
    /// win), then the endpoint's own labels on top.
    fn effective_labels(&self, ep: &Endpoint) -> Labels {
        let mut base = std::collections::BTreeMap::new();
        for id in profile_ids(ep) {
            if let Some(profile) = self.profiles.get(id) {
                for (k, v) in profile.labels.as_ref() {
                    base.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        own_labels(ep).overlaid_on(&base.into())
    }
}

fn profile_ids(ep: &Endpoint) -> &[String] {
    match ep {
        Endpoint::Workload(ep) => &ep.profile_ids,
        Endpoint::Host(ep) => &ep.profile_ids,
    }
}

fn own_labels(ep: &Endpoint) -> &Labels {
    match ep {
        Endpoint::Workload(ep) => &ep.labels,
        Endpoint::Host(ep) => &ep.labels,
    }
}

fn iface_name(ep: &Endpoint) -> &str {
    match ep {
        Endpoint::Workload(ep) => &ep.iface_name,
        Endpoint::Host(ep) => &ep.iface_name,
    }
}

fn ip_version(ep: &Endpoint) -> palisade_core::IpVersion {
    match ep {
        Endpoint::Workload(ep) => ep.ip_version,
        Endpoint::Host(ep) => ep.ip_version,
    }
}

fn order_key(order: Option<i32>) -> i64 {
    order.map(i64::from).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::{IpVersion, Rule, Selector, TierEndAction};

    fn workload(labels: Vec<(&'static str, &'static str)>, profiles: &[&str]) -> WorkloadEndpoint {
        WorkloadEndpoint {
            labels: labels.into_iter().collect(),
            profile_ids: profiles.iter().map(|s| s.to_string()).collect(),
            iface_name: "cali1234".to_string(),
            ip_version: IpVersion::V4,
        }
    }

    fn policy(tier: &str, order: i32, selector: Selector, scope: PolicyScope) -> Policy {
        Policy {
            tier: tier.to_string(),
            order: Some(order),
            selector,
            scope,
            rules: vec![Rule::allow()],
        }
    }

    #[test]
    fn selector_matches_endpoint_labels() {
        let mut resolver = PolicyResolver::new();
        resolver.update_workload_endpoint("ep1", Some(workload(vec![("app", "db")], &[])));
        resolver.update_policy(
            "pol1",
            Some(policy(
                "default",
                10,
                Selector::from_iter(Some(("app", "db"))),
                PolicyScope::Normal,
            )),
        );

        let resolved = resolver.resolve(&EndpointKey::workload("ep1")).unwrap();
        assert_eq!(resolved.ingress.tiers.len(), 1);
        assert_eq!(resolved.ingress.tiers[0].policies[0].name, "pol1");
        assert_eq!(resolved.egress.tiers.len(), 1);
    }

    #[test]
    fn selector_sees_profile_labels() {
        let mut resolver = PolicyResolver::new();
        resolver.update_profile(
            "prof1",
            Some(Profile {
                labels: vec![("env", "prod")].into_iter().collect(),
                rules: vec![],
            }),
        );
        resolver.update_workload_endpoint("ep1", Some(workload(vec![], &["prof1"])));

        let dirty = resolver.update_policy(
            "pol1",
            Some(policy(
                "default",
                10,
                Selector::from_iter(Some(("env", "prod"))),
                PolicyScope::Normal,
            )),
        );
        assert!(dirty.contains(&EndpointKey::workload("ep1")));

        let resolved = resolver.resolve(&EndpointKey::workload("ep1")).unwrap();
        assert_eq!(resolved.ingress.tiers.len(), 1);
    }

    #[test]
    fn endpoint_labels_beat_profile_labels() {
        let mut resolver = PolicyResolver::new();
        resolver.update_profile(
            "prof1",
            Some(Profile {
                labels: vec![("env", "prod")].into_iter().collect(),
                rules: vec![],
            }),
        );
        resolver
            .update_workload_endpoint("ep1", Some(workload(vec![("env", "test")], &["prof1"])));
        resolver.update_policy(
            "pol1",
            Some(policy(
                "default",
                10,
                Selector::from_iter(Some(("env", "prod"))),
                PolicyScope::Normal,
            )),
        );

        let resolved = resolver.resolve(&EndpointKey::workload("ep1")).unwrap();
        assert!(resolved.ingress.tiers.is_empty());
    }

    #[test]
    fn tiers_and_policies_are_ordered() {
        let mut resolver = PolicyResolver::new();
        resolver.update_workload_endpoint("ep1", Some(workload(vec![("app", "db")], &[])));
        resolver.update_tier(
            "first",
            Some(Tier {
                order: Some(1),
                end_action: TierEndAction::Pass,
            }),
        );
        resolver.update_tier(
            "second",
            Some(Tier {
                order: Some(2),
                end_action: TierEndAction::Deny,
            }),
        );
        let sel = || Selector::from_iter(Some(("app", "db")));
        resolver.update_policy("b", Some(policy("second", 1, sel(), PolicyScope::Normal)));
        resolver.update_policy("a", Some(policy("first", 2, sel(), PolicyScope::Normal)));
        resolver.update_policy("c", Some(policy("first", 1, sel(), PolicyScope::Normal)));

        let resolved = resolver.resolve(&EndpointKey::workload("ep1")).unwrap();
        let tiers: Vec<&str> = resolved
            .ingress
            .tiers
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(tiers, vec!["first", "second"]);
        assert_eq!(resolved.ingress.tiers[0].end_action, TierEndAction::Pass);
        let first: Vec<&str> = resolved.ingress.tiers[0]
            .policies
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(first, vec!["c", "a"]);
    }

    #[test]
    fn direction_scopes_split_legs() {
        let mut resolver = PolicyResolver::new();
        resolver.update_workload_endpoint("ep1", Some(workload(vec![("app", "db")], &[])));
        let sel = || Selector::from_iter(Some(("app", "db")));
        resolver.update_policy("in", Some(policy("default", 1, sel(), PolicyScope::Ingress)));
        resolver.update_policy("out", Some(policy("default", 2, sel(), PolicyScope::Egress)));

        let resolved = resolver.resolve(&EndpointKey::workload("ep1")).unwrap();
        let names = |tiers: &[TierRules]| -> Vec<String> {
            tiers
                .iter()
                .flat_map(|t| t.policies.iter().map(|p| p.name.clone()))
                .collect()
        };
        assert_eq!(names(&resolved.ingress.tiers), vec!["in"]);
        assert_eq!(names(&resolved.egress.tiers), vec!["out"]);
    }

    #[test]
    fn host_endpoints_resolve_host_chains() {
        let mut resolver = PolicyResolver::new();
        resolver.update_host_endpoint(
            "eth0",
            Some(HostEndpoint {
                labels: vec![("role", "edge")].into_iter().collect(),
                profile_ids: vec![],
                iface_name: "eth0".to_string(),
                ip_version: IpVersion::V4,
                expected_addrs: vec![],
            }),
        );
        let sel = || Selector::from_iter(Some(("role", "edge")));
        resolver.update_policy("pre", Some(policy("default", 1, sel(), PolicyScope::PreDnat)));
        resolver.update_policy(
            "fwd",
            Some(policy("default", 2, sel(), PolicyScope::ApplyOnForward)),
        );
        resolver.update_policy("norm", Some(policy("default", 3, sel(), PolicyScope::Normal)));
        resolver.update_policy("xdp", Some(policy("default", 4, sel(), PolicyScope::Xdp)));

        let resolved = resolver.resolve(&EndpointKey::host("eth0")).unwrap();
        assert!(resolved.ingress.for_host_interface);
        assert_eq!(resolved.ingress.host_pre_dnat_tiers.len(), 1);
        assert_eq!(resolved.ingress.host_forward_tiers.len(), 1);
        assert_eq!(resolved.ingress.host_normal_tiers.len(), 1);
        let xdp = resolved.xdp.expect("xdp rules expected");
        assert!(xdp.for_xdp);
        assert_eq!(xdp.host_normal_tiers.len(), 1);
    }

    #[test]
    fn deleting_the_endpoint_resolves_to_none() {
        let mut resolver = PolicyResolver::new();
        resolver.update_workload_endpoint("ep1", Some(workload(vec![], &[])));
        assert!(resolver.resolve(&EndpointKey::workload("ep1")).is_some());
        let dirty = resolver.update_workload_endpoint("ep1", None);
        assert!(dirty.contains(&EndpointKey::workload("ep1")));
        assert!(resolver.resolve(&EndpointKey::workload("ep1")).is_none());
    }
}
