use crate::{
    ipset::{IpSetIndex, MemberChange},
    resolver::PolicyResolver,
    service::ServiceIndex,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use palisade_core::{
    EndpointKey, EndpointRules, IpSetMember, Kind, Resource, ResolvedEndpoint, ResourceKey, Update,
};
use std::net::IpAddr;

/// Set ids with this prefix name a virtual service whose membership is
/// derived from endpoint slices rather than an IpSet resource.
const SERVICE_SET_PREFIX: &str = "svc:";

/// Routes resource updates to the indexes, tracks the dirty endpoint
/// set, and produces the batched output the effectors consume.
#[derive(Debug, Default)]
pub struct Dispatcher {
    ipsets: IpSetIndex,
    services: ServiceIndex,
    resolver: PolicyResolver,

    dirty: HashSet<EndpointKey>,
    pending_events: Vec<MemberChange>,
    known: HashSet<ResourceKey>,
    node_ips: Vec<IpAddr>,

    /// IP-set ids referenced by each endpoint's rules as of its last
    /// resolution, with the reverse view for dirty tracking.
    set_refs_by_endpoint: HashMap<EndpointKey, HashSet<String>>,
    endpoints_by_set: HashMap<String, HashSet<EndpointKey>>,
    active_service_sets: HashSet<String>,
}

/// The output of one drain: membership changes first, then re-resolved
/// endpoints, then removals. Consumers must apply in that order so that
/// no rendering refers to membership that has not been announced.
#[derive(Clone, Debug, Default)]
pub struct DataplaneDelta {
    pub ip_set_events: Vec<MemberChange>,
    pub updated: Vec<ResolvedEndpoint>,
    pub removed: Vec<EndpointKey>,
}

// === impl Dispatcher ===

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ipsets(&self) -> &IpSetIndex {
        &self.ipsets
    }

    pub fn node_ips(&self) -> &[IpAddr] {
        &self.node_ips
    }

    pub fn has_dirty_endpoints(&self) -> bool {
        !self.dirty.is_empty() || !self.pending_events.is_empty()
    }

    /// Applies one update from the resource stream.
    pub fn on_update(&mut self, update: Update) {
        let Update { key, value } = update;
        match value {
            Some(_) => self.known.insert(key.clone()),
            None => self.known.remove(&key),
        };

        match (key.kind, value) {
            (Kind::Endpoint, value) => {
                let ep = match value {
                    Some(Resource::Endpoint(ep)) => Some(ep),
                    None => None,
                    Some(other) => return drop_mismatched(&key, &other),
                };
                let dirty = self.resolver.update_workload_endpoint(&key.name, ep);
                self.dirty.extend(dirty);
            }
            (Kind::HostEndpoint, value) => {
                let ep = match value {
                    Some(Resource::HostEndpoint(ep)) => Some(ep),
                    None => None,
                    Some(other) => return drop_mismatched(&key, &other),
                };
                let dirty = self.resolver.update_host_endpoint(&key.name, ep);
                self.dirty.extend(dirty);
            }
            (Kind::Policy, value) => {
                let policy = match value {
                    Some(Resource::Policy(policy)) => Some(policy),
                    None => None,
                    Some(other) => return drop_mismatched(&key, &other),
                };
                let dirty = self.resolver.update_policy(&key.name, policy);
                self.dirty.extend(dirty);
            }
            (Kind::Tier, value) => {
                let tier = match value {
                    Some(Resource::Tier(tier)) => Some(tier),
                    None => None,
                    Some(other) => return drop_mismatched(&key, &other),
                };
                let dirty = self.resolver.update_tier(&key.name, tier);
                self.dirty.extend(dirty);
            }
            (Kind::Profile, value) => {
                let profile = match value {
                    Some(Resource::Profile(profile)) => Some(profile),
                    None => None,
                    Some(other) => return drop_mismatched(&key, &other),
                };
                let dirty = self.resolver.update_profile(&key.name, profile);
                self.dirty.extend(dirty);
            }
            (Kind::IpSet, Some(Resource::IpSet(set))) => {
                let events = self.apply_ip_set(&key.name, set.kind, &set.members);
                self.note_member_events(&events);
                self.pending_events.extend(events);
            }
            (Kind::IpSet, None) => {
                let events = self.ipsets.delete_set(&key.name);
                self.note_member_events(&events);
                self.pending_events.extend(events);
            }
            (Kind::EndpointSlice, value) => {
                let slice_key = match &key.namespace {
                    Some(ns) => format!("{}/{}", ns, key.name),
                    None => key.name.clone(),
                };
                let events = match value {
                    Some(Resource::EndpointSlice(slice)) => {
                        self.services.update_endpoint_slice(&slice_key, slice)
                    }
                    None => self.services.delete_endpoint_slice(&slice_key),
                    Some(other) => return drop_mismatched(&key, &other),
                };
                self.note_member_events(&events);
                self.pending_events.extend(events);
            }
            (Kind::NodeIps, value) => {
                self.node_ips = match value {
                    Some(Resource::NodeIps(ips)) => ips,
                    None => Vec::new(),
                    Some(other) => return drop_mismatched(&key, &other),
                };
            }
            (Kind::ConfigOverride, value) => {
                tracing::info!(key = %key, ?value, "config override recorded; effective after restart");
            }
            (kind, value) => {
                tracing::warn!(?kind, present = value.is_some(), "dropping mismatched update");
            }
        }
    }

    /// Applies a full snapshot atomically: resources missing from the
    /// snapshot are deleted, the rest are applied as updates, and every
    /// endpoint is marked dirty. No rendering happens until the next
    /// drain, so no output reflects a partial snapshot.
    pub fn apply_snapshot(&mut self, updates: Vec<Update>) {
        let snapshot_keys: HashSet<ResourceKey> =
            updates.iter().map(|u| u.key.clone()).collect();
        let deleted: Vec<ResourceKey> = self
            .known
            .iter()
            .filter(|k| !snapshot_keys.contains(k))
            .cloned()
            .collect();

        for key in deleted {
            self.on_update(Update { key, value: None });
        }
        for update in updates {
            self.on_update(update);
        }

        let all: Vec<EndpointKey> = self.resolver.endpoint_keys().cloned().collect();
        self.dirty.extend(all);
    }

    /// Re-resolves the dirty endpoints, reconciles service-set
    /// activations against the rules that reference them, and hands back
    /// everything the effectors need to converge.
    pub fn drain(&mut self) -> DataplaneDelta {
        let mut delta = DataplaneDelta {
            ip_set_events: std::mem::take(&mut self.pending_events),
            ..DataplaneDelta::default()
        };

        for key in std::mem::take(&mut self.dirty) {
            match self.resolver.resolve(&key) {
                Some(resolved) => {
                    let refs = referenced_set_ids(&resolved);
                    for id in &refs {
                        if let Some(service) = id.strip_prefix(SERVICE_SET_PREFIX) {
                            if self.active_service_sets.insert(id.clone()) {
                                let service = service.to_string();
                                delta
                                    .ip_set_events
                                    .extend(self.services.activate_set(id, &service));
                            }
                        }
                    }
                    self.record_set_refs(&key, refs);
                    delta.updated.push(resolved);
                }
                None => {
                    self.record_set_refs(&key, HashSet::new());
                    delta.removed.push(key);
                }
            }
        }

        // Retire service sets nothing references any more.
        let orphaned: Vec<String> = self
            .active_service_sets
            .iter()
            .filter(|id| {
                self.endpoints_by_set
                    .get(*id)
                    .map(|eps| eps.is_empty())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        for id in orphaned {
            self.active_service_sets.remove(&id);
            delta.ip_set_events.extend(self.services.deactivate_set(&id));
        }

        // Deterministic output order for rendering and tests.
        delta.updated.sort_by(|a, b| a.key.name.cmp(&b.key.name));
        delta.removed.sort_by(|a, b| a.name.cmp(&b.name));
        delta
    }

    /// Declarative IP set apply: diff the desired member list (which may
    /// contain duplicates) against the current reference counts.
    fn apply_ip_set(
        &mut self,
        id: &str,
        kind: palisade_core::IpSetKind,
        desired: &[IpSetMember],
    ) -> Vec<MemberChange> {
        self.ipsets.add_set(id, kind);

        let mut desired_counts: HashMap<IpSetMember, u64> = HashMap::new();
        for member in desired {
            *desired_counts.entry(*member).or_insert(0) += 1;
        }
        let current_counts: HashMap<IpSetMember, u64> = self
            .ipsets
            .members(id)
            .map(|(m, c)| (*m, c))
            .collect();

        let mut events = Vec::new();
        for (member, want) in &desired_counts {
            let have = current_counts.get(member).copied().unwrap_or(0);
            for _ in have..*want {
                events.extend(self.ipsets.add_member(id, *member));
            }
        }
        for (member, have) in &current_counts {
            let want = desired_counts.get(member).copied().unwrap_or(0);
            for _ in want..*have {
                events.extend(self.ipsets.remove_member(id, member));
            }
        }
        events
    }

    /// Membership changes dirty the endpoints whose rules reference the
    /// affected set.
    fn note_member_events(&mut self, events: &[MemberChange]) {
        for event in events {
            if let Some(endpoints) = self.endpoints_by_set.get(event.set()) {
                self.dirty.extend(endpoints.iter().cloned());
            }
        }
    }

    fn record_set_refs(&mut self, key: &EndpointKey, refs: HashSet<String>) {
        if let Some(old) = self.set_refs_by_endpoint.get(key) {
            for id in old {
                if let Some(eps) = self.endpoints_by_set.get_mut(id) {
                    eps.remove(key);
                    if eps.is_empty() {
                        self.endpoints_by_set.remove(id);
                    }
                }
            }
        }
        for id in &refs {
            self.endpoints_by_set
                .entry(id.clone())
                .or_default()
                .insert(key.clone());
        }
        if refs.is_empty() {
            self.set_refs_by_endpoint.remove(key);
        } else {
            self.set_refs_by_endpoint.insert(key.clone(), refs);
        }
    }
}

fn drop_mismatched(key: &ResourceKey, resource: &Resource) {
    tracing::warn!(%key, ?resource, "dropping update whose payload does not match its kind");
}

fn referenced_set_ids(resolved: &ResolvedEndpoint) -> HashSet<String> {
    let mut ids = HashSet::new();
    let mut visit = |rules: &EndpointRules| {
        let tiers = rules
            .tiers
            .iter()
            .chain(&rules.host_pre_dnat_tiers)
            .chain(&rules.host_forward_tiers)
            .chain(&rules.host_normal_tiers);
        for tier in tiers {
            for policy in &tier.policies {
                for rule in &policy.rules {
                    ids.extend(rule.referenced_ip_set_ids().map(str::to_string));
                }
            }
        }
        for profile in rules.profiles.iter().chain(&rules.host_profiles) {
            for rule in &profile.rules {
                ids.extend(rule.referenced_ip_set_ids().map(str::to_string));
            }
        }
    };
    visit(&resolved.ingress);
    visit(&resolved.egress);
    if let Some(xdp) = &resolved.xdp {
        visit(xdp);
    }
    ids
}
