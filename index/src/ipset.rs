use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use palisade_core::{fatal, IpSetKind, IpSetMember};

/// A membership edge observed by an IP set: `Added` fires exactly when a
/// member's reference count goes 0→1 and `Removed` exactly when it goes
/// 1→0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberChange {
    Added { set: String, member: IpSetMember },
    Removed { set: String, member: IpSetMember },
}

/// Owns the reference-counted membership of named IP sets and answers
/// reverse queries ("which sets contain this member?").
#[derive(Debug, Default)]
pub struct IpSetIndex {
    sets: HashMap<String, IpSet>,
    sets_by_member: HashMap<IpSetMember, HashSet<String>>,
}

#[derive(Debug)]
struct IpSet {
    kind: IpSetKind,
    members: HashMap<IpSetMember, u64>,
}

// === impl MemberChange ===

impl MemberChange {
    pub fn set(&self) -> &str {
        match self {
            Self::Added { set, .. } | Self::Removed { set, .. } => set,
        }
    }

    pub fn member(&self) -> &IpSetMember {
        match self {
            Self::Added { member, .. } | Self::Removed { member, .. } => member,
        }
    }
}

// === impl IpSetIndex ===

impl IpSetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_set(&self, id: &str) -> bool {
        self.sets.contains_key(id)
    }

    pub fn kind(&self, id: &str) -> Option<IpSetKind> {
        self.sets.get(id).map(|s| s.kind)
    }

    pub fn add_set(&mut self, id: &str, kind: IpSetKind) {
        if let Some(set) = self.sets.get(id) {
            if set.kind != kind {
                fatal("IP set re-added with a different kind", (id, set.kind, kind));
            }
            return;
        }
        tracing::debug!(%id, ?kind, "creating IP set");
        self.sets.insert(
            id.to_string(),
            IpSet {
                kind,
                members: HashMap::new(),
            },
        );
    }

    /// Removes a set, emitting `Removed` for every remaining member.
    pub fn delete_set(&mut self, id: &str) -> Vec<MemberChange> {
        let set = match self.sets.remove(id) {
            Some(set) => set,
            None => {
                tracing::warn!(%id, "delete of unknown IP set, ignoring");
                return Vec::new();
            }
        };

        let mut events = Vec::with_capacity(set.members.len());
        for (member, _) in set.members {
            self.unlink_member(id, &member);
            events.push(MemberChange::Removed {
                set: id.to_string(),
                member,
            });
        }
        events
    }

    pub fn add_member(&mut self, id: &str, member: IpSetMember) -> Option<MemberChange> {
        let set = match self.sets.get_mut(id) {
            Some(set) => set,
            None => fatal("member added to unknown IP set", (id, member)),
        };
        check_member_kind(set.kind, &member, id);

        let count = set.members.entry(member).or_insert(0);
        *count += 1;
        if *count != 1 {
            return None;
        }

        self.sets_by_member
            .entry(member)
            .or_default()
            .insert(id.to_string());
        Some(MemberChange::Added {
            set: id.to_string(),
            member,
        })
    }

    pub fn remove_member(&mut self, id: &str, member: &IpSetMember) -> Option<MemberChange> {
        let set = match self.sets.get_mut(id) {
            Some(set) => set,
            None => fatal("member removed from unknown IP set", (id, member)),
        };

        let count = match set.members.get_mut(member) {
            Some(count) => count,
            None => fatal("removal of member not in IP set", (id, member)),
        };
        *count -= 1;
        if *count != 0 {
            return None;
        }

        set.members.remove(member);
        self.unlink_member(id, member);
        Some(MemberChange::Removed {
            set: id.to_string(),
            member: *member,
        })
    }

    /// Iterates a set's members with their reference counts. The iterator
    /// borrows the index; it is not restartable across mutations.
    pub fn members(&self, id: &str) -> impl Iterator<Item = (&IpSetMember, u64)> {
        self.sets
            .get(id)
            .into_iter()
            .flat_map(|s| s.members.iter().map(|(m, &c)| (m, c)))
    }

    /// The sets that currently contain `member`.
    pub fn sets_containing(&self, member: &IpSetMember) -> impl Iterator<Item = &str> {
        self.sets_by_member
            .get(member)
            .into_iter()
            .flat_map(|ids| ids.iter().map(String::as_str))
    }

    fn unlink_member(&mut self, id: &str, member: &IpSetMember) {
        if let Some(ids) = self.sets_by_member.get_mut(member) {
            ids.remove(id);
            if ids.is_empty() {
                self.sets_by_member.remove(member);
            }
        }
    }
}

fn check_member_kind(kind: IpSetKind, member: &IpSetMember, id: &str) {
    if kind != member.kind() {
        fatal("IP set member kind does not match its set", (id, kind, member));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(s: &str) -> IpSetMember {
        s.parse().unwrap()
    }

    #[test]
    fn add_remove_edges_fire_once() {
        let mut idx = IpSetIndex::new();
        idx.add_set("s:a", IpSetKind::Net);

        let m = member("10.0.0.0/8");
        assert_eq!(
            idx.add_member("s:a", m),
            Some(MemberChange::Added {
                set: "s:a".to_string(),
                member: m
            })
        );
        assert_eq!(idx.add_member("s:a", m), None, "second ref is silent");
        assert_eq!(idx.remove_member("s:a", &m), None, "first decref is silent");
        assert_eq!(
            idx.remove_member("s:a", &m),
            Some(MemberChange::Removed {
                set: "s:a".to_string(),
                member: m
            })
        );
    }

    #[test]
    fn delete_set_flushes_members() {
        let mut idx = IpSetIndex::new();
        idx.add_set("s:a", IpSetKind::Net);
        idx.add_member("s:a", member("10.0.0.0/8"));
        idx.add_member("s:a", member("11.0.0.0/8"));

        let events = idx.delete_set("s:a");
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, MemberChange::Removed { .. })));
        assert!(!idx.contains_set("s:a"));
        assert_eq!(idx.sets_containing(&member("10.0.0.0/8")).count(), 0);
    }

    #[test]
    fn reverse_index_tracks_membership() {
        let mut idx = IpSetIndex::new();
        idx.add_set("s:a", IpSetKind::Net);
        idx.add_set("s:b", IpSetKind::Net);
        let m = member("10.0.0.1/32");
        idx.add_member("s:a", m);
        idx.add_member("s:b", m);

        let mut sets: Vec<_> = idx.sets_containing(&m).collect();
        sets.sort_unstable();
        assert_eq!(sets, vec!["s:a", "s:b"]);

        idx.remove_member("s:a", &m);
        assert_eq!(idx.sets_containing(&m).collect::<Vec<_>>(), vec!["s:b"]);
    }

    #[test]
    fn named_port_sets_hold_tuples() {
        let mut idx = IpSetIndex::new();
        idx.add_set("n:a", IpSetKind::NamedPort);
        let m = member("10.0.0.2/32,tcp:80");
        assert!(idx.add_member("n:a", m).is_some());
        assert_eq!(idx.members("n:a").count(), 1);
    }

    #[test]
    fn invariant_event_sum_matches_size() {
        let mut idx = IpSetIndex::new();
        idx.add_set("s:a", IpSetKind::Net);

        let members = ["10.0.0.0/8", "10.0.0.1/32", "11.0.0.0/16"];
        let mut added = 0isize;
        let mut removed = 0isize;
        for m in members {
            for _ in 0..3 {
                if idx.add_member("s:a", member(m)).is_some() {
                    added += 1;
                }
            }
        }
        for m in &members[..2] {
            for _ in 0..3 {
                if idx.remove_member("s:a", &member(m)).is_some() {
                    removed += 1;
                }
            }
        }
        assert_eq!(added - removed, idx.members("s:a").count() as isize);
    }
}
