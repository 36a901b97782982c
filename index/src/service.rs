use crate::ipset::MemberChange;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ipnet::IpNet;
use palisade_core::{fatal, EndpointSlice, IpSetMember, NamedPortProtocol};

/// Converts endpoint-slice updates into IP-set contributions for active
/// virtual-service sets.
///
/// Members are reference counted so that the same `(addr, proto, port)`
/// appearing in several slices produces exactly one `Added` on first
/// sight and exactly one `Removed` when the last copy goes away.
#[derive(Debug, Default)]
pub struct ServiceIndex {
    /// All known endpoint slices, active service or not, keyed by the
    /// slice's `namespace/name`.
    endpoint_slices: HashMap<String, EndpointSlice>,
    slices_by_service: HashMap<String, HashSet<String>>,

    /// Active service sets, indexed both ways.
    active_by_id: HashMap<String, ActiveSet>,
    active_id_by_service: HashMap<String, String>,
}

#[derive(Debug)]
struct ActiveSet {
    service: String,
    member_ref_counts: HashMap<IpSetMember, u64>,
}

// === impl ServiceIndex ===

impl ServiceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active_by_id.contains_key(id)
    }

    /// Applies a new or changed endpoint slice.
    pub fn update_endpoint_slice(
        &mut self,
        key: &str,
        slice: EndpointSlice,
    ) -> Vec<MemberChange> {
        if let Some(old) = self.endpoint_slices.get(key) {
            if old.service != slice.service {
                // The slice moved between services; retire the old
                // contribution before accounting the new one.
                let mut events = self.delete_endpoint_slice(key);
                events.extend(self.update_endpoint_slice(key, slice));
                return events;
            }
        }

        let mut events = Vec::new();

        let old_contribution = self
            .endpoint_slices
            .get(key)
            .map(members_from_slice)
            .unwrap_or_default();

        if let Some(id) = self.active_id_by_service.get(&slice.service) {
            let id = id.clone();
            let set = self.active_by_id.get_mut(&id).expect("indexes in sync");

            // Incref the new members first so that members present in both
            // the old and new contributions are double-counted for a
            // moment and never cross zero.
            for member in members_from_slice(&slice) {
                let count = set.member_ref_counts.entry(member).or_insert(0);
                *count += 1;
                if *count == 1 {
                    events.push(MemberChange::Added {
                        set: id.clone(),
                        member,
                    });
                }
            }
            events.extend(set.decref(&id, old_contribution));
        }

        self.slices_by_service
            .entry(slice.service.clone())
            .or_default()
            .insert(key.to_string());
        self.endpoint_slices.insert(key.to_string(), slice);
        events
    }

    /// Removes an endpoint slice, decrefing its prior contribution.
    pub fn delete_endpoint_slice(&mut self, key: &str) -> Vec<MemberChange> {
        let slice = match self.endpoint_slices.remove(key) {
            Some(slice) => slice,
            None => return Vec::new(),
        };

        let mut events = Vec::new();
        if let Some(id) = self.active_id_by_service.get(&slice.service) {
            let id = id.clone();
            let set = self.active_by_id.get_mut(&id).expect("indexes in sync");
            events = set.decref(&id, members_from_slice(&slice));
        }

        if let Some(keys) = self.slices_by_service.get_mut(&slice.service) {
            keys.remove(key);
            if keys.is_empty() {
                self.slices_by_service.remove(&slice.service);
            }
        }
        events
    }

    /// Marks a service's IP set active, scanning the cached slices for
    /// its initial membership.
    pub fn activate_set(&mut self, id: &str, service: &str) -> Vec<MemberChange> {
        match self.active_by_id.get(id) {
            None => {}
            Some(set) if set.service == service => return Vec::new(),
            Some(set) => {
                // The id is derived from the service name, so two services
                // mapping to one id means the derivation itself is broken.
                fatal(
                    "same IP set id active for two service names",
                    (id, &set.service, service),
                );
            }
        }

        tracing::debug!(%id, %service, "activating service IP set");
        let mut set = ActiveSet {
            service: service.to_string(),
            member_ref_counts: HashMap::new(),
        };

        let mut events = Vec::new();
        for key in self.slices_by_service.get(service).into_iter().flatten() {
            let slice = &self.endpoint_slices[key];
            for member in members_from_slice(slice) {
                let count = set.member_ref_counts.entry(member).or_insert(0);
                *count += 1;
                if *count == 1 {
                    events.push(MemberChange::Added {
                        set: id.to_string(),
                        member,
                    });
                }
            }
        }

        self.active_by_id.insert(id.to_string(), set);
        self.active_id_by_service
            .insert(service.to_string(), id.to_string());
        events
    }

    /// Drops an active service set, emitting `Removed` for every member
    /// still present.
    pub fn deactivate_set(&mut self, id: &str) -> Vec<MemberChange> {
        let set = match self.active_by_id.remove(id) {
            Some(set) => set,
            None => {
                tracing::warn!(%id, "deactivation of unknown service IP set, ignoring");
                return Vec::new();
            }
        };
        self.active_id_by_service.remove(&set.service);

        set.member_ref_counts
            .into_keys()
            .map(|member| MemberChange::Removed {
                set: id.to_string(),
                member,
            })
            .collect()
    }
}

// === impl ActiveSet ===

impl ActiveSet {
    fn decref(&mut self, id: &str, members: Vec<IpSetMember>) -> Vec<MemberChange> {
        let mut events = Vec::new();
        for member in members {
            let count = match self.member_ref_counts.get_mut(&member) {
                Some(count) => count,
                None => fatal("service set decref of untracked member", (id, member)),
            };
            *count -= 1;
            if *count == 0 {
                self.member_ref_counts.remove(&member);
                events.push(MemberChange::Removed {
                    set: id.to_string(),
                    member,
                });
            }
        }
        events
    }
}

/// One member per (endpoint address, declared port). A slice port without
/// a number is unrestricted and contributes nothing. Members are pinned
/// to TCP irrespective of the slice's declared protocol.
fn members_from_slice(slice: &EndpointSlice) -> Vec<IpSetMember> {
    let mut members = Vec::new();
    for port in &slice.ports {
        let port = match port.port {
            Some(port) => port,
            None => continue,
        };
        for ep in &slice.endpoints {
            for addr in &ep.addresses {
                members.push(IpSetMember::NamedPort {
                    net: IpNet::from(*addr),
                    protocol: NamedPortProtocol::Tcp,
                    port,
                });
            }
        }
    }
    members
}
