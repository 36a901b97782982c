use crate::rules::{Chain, Rule};
use ahash::AHashMap as HashMap;

/// One step of the edit script the chain effector applies. Rule indexes
/// are 1-based, matching the kernel tool, and account for the effect of
/// the preceding steps in the same script.
#[derive(Clone, Debug, PartialEq)]
pub enum ChainOp {
    /// Install or rewrite a whole chain.
    ReplaceChain { chain: Chain },
    InsertRuleAt { chain: String, index: usize, rule: Rule },
    ReplaceRuleAt { chain: String, index: usize, rule: Rule },
    DeleteRuleAt { chain: String, index: usize },
    RemoveChain { name: String },
}

/// Diffs one desired chain against the installed rule-hash sequence and
/// returns the minimum edit script (longest-common-subsequence over the
/// fingerprints).
pub fn chain_delta(installed: &[String], desired: &Chain) -> Vec<ChainOp> {
    let desired_hashes = desired.rule_hashes();
    if installed.is_empty() {
        if desired_hashes.is_empty() {
            return Vec::new();
        }
        return vec![ChainOp::ReplaceChain {
            chain: desired.clone(),
        }];
    }

    // lcs[i][j]: LCS length of installed[i..] vs desired[j..].
    let m = installed.len();
    let n = desired_hashes.len();
    let mut lcs = vec![vec![0usize; n + 1]; m + 1];
    for i in (0..m).rev() {
        for j in (0..n).rev() {
            lcs[i][j] = if installed[i] == desired_hashes[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut ops = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    // Position in the live chain while the script replays, 1-based.
    let mut cursor = 1usize;
    while i < m || j < n {
        if i < m && j < n && installed[i] == desired_hashes[j] {
            i += 1;
            j += 1;
            cursor += 1;
        } else if i < m && j < n && lcs[i + 1][j + 1] >= lcs[i + 1][j].max(lcs[i][j + 1]) {
            // Neither side is part of the common subsequence: replace in
            // place rather than delete-then-insert.
            ops.push(ChainOp::ReplaceRuleAt {
                chain: desired.name.clone(),
                index: cursor,
                rule: desired.rules[j].clone(),
            });
            i += 1;
            j += 1;
            cursor += 1;
        } else if i < m && (j == n || lcs[i + 1][j] >= lcs[i][j + 1]) {
            ops.push(ChainOp::DeleteRuleAt {
                chain: desired.name.clone(),
                index: cursor,
            });
            i += 1;
        } else {
            ops.push(ChainOp::InsertRuleAt {
                chain: desired.name.clone(),
                index: cursor,
                rule: desired.rules[j].clone(),
            });
            j += 1;
            cursor += 1;
        }
    }
    ops
}

/// Diffs a whole table: chains missing from the target are removed,
/// new chains are installed wholesale, and shared chains get per-rule
/// edit scripts.
pub fn table_delta(installed: &HashMap<String, Vec<String>>, desired: &[Chain]) -> Vec<ChainOp> {
    let mut ops = Vec::new();

    let mut desired_sorted: Vec<&Chain> = desired.iter().collect();
    desired_sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for chain in desired_sorted {
        match installed.get(&chain.name) {
            Some(hashes) => ops.extend(chain_delta(hashes, chain)),
            None => ops.push(ChainOp::ReplaceChain {
                chain: chain.clone(),
            }),
        }
    }

    let mut removed: Vec<&String> = installed
        .keys()
        .filter(|name| !desired.iter().any(|c| &&c.name == name))
        .collect();
    removed.sort();
    for name in removed {
        ops.push(ChainOp::RemoveChain { name: name.clone() });
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, MatchCriteria};
    use palisade_core::Protocol;

    fn rule(proto: Protocol) -> Rule {
        Rule::new(MatchCriteria::new().protocol(proto), Action::Accept)
    }

    fn chain(rules: Vec<Rule>) -> Chain {
        Chain {
            name: "pali-pi-p1".to_string(),
            rules,
        }
    }

    /// Replays an edit script against a hash list to verify convergence.
    fn apply(installed: &[String], ops: &[ChainOp], desired: &Chain) -> Vec<String> {
        let desired_hashes = desired.rule_hashes();
        let hash_of = |r: &Rule| -> String {
            // Hash lookup by identity within the desired chain.
            let idx = desired.rules.iter().position(|d| d == r).unwrap();
            desired_hashes[idx].clone()
        };
        let mut live: Vec<String> = installed.to_vec();
        for op in ops {
            match op {
                ChainOp::ReplaceChain { chain } => live = chain.rule_hashes(),
                ChainOp::InsertRuleAt { index, rule, .. } => {
                    live.insert(index - 1, hash_of(rule))
                }
                ChainOp::ReplaceRuleAt { index, rule, .. } => live[index - 1] = hash_of(rule),
                ChainOp::DeleteRuleAt { index, .. } => {
                    live.remove(index - 1);
                }
                ChainOp::RemoveChain { .. } => live.clear(),
            }
        }
        live
    }

    #[test]
    fn identical_chains_need_no_edits() {
        let desired = chain(vec![rule(Protocol::Tcp), rule(Protocol::Udp)]);
        let installed = desired.rule_hashes();
        assert_eq!(chain_delta(&installed, &desired), vec![]);
    }

    #[test]
    fn appended_rule_is_a_single_insert() {
        let old = chain(vec![rule(Protocol::Tcp)]);
        let desired = chain(vec![rule(Protocol::Tcp), rule(Protocol::Udp)]);
        let ops = chain_delta(&old.rule_hashes(), &desired);
        // Appending changes only position-independent suffix state; the
        // first rule's hash is unchanged so one insert suffices.
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], ChainOp::InsertRuleAt { index: 2, .. }));
        assert_eq!(
            apply(&old.rule_hashes(), &ops, &desired),
            desired.rule_hashes()
        );
    }

    #[test]
    fn prepended_rule_rewrites_shifted_hashes() {
        let old = chain(vec![rule(Protocol::Udp)]);
        let desired = chain(vec![rule(Protocol::Tcp), rule(Protocol::Udp)]);
        let ops = chain_delta(&old.rule_hashes(), &desired);
        // The old rule's hash changes with its position, so the edit
        // script must converge regardless of shape.
        assert_eq!(
            apply(&old.rule_hashes(), &ops, &desired),
            desired.rule_hashes()
        );
    }

    #[test]
    fn removed_rule_is_a_single_delete() {
        let old = chain(vec![rule(Protocol::Tcp), rule(Protocol::Udp)]);
        let desired = chain(vec![rule(Protocol::Tcp)]);
        let ops = chain_delta(&old.rule_hashes(), &desired);
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], ChainOp::DeleteRuleAt { index: 2, .. }));
    }

    #[test]
    fn changed_rule_is_a_replace_in_place() {
        let old = chain(vec![rule(Protocol::Tcp), rule(Protocol::Udp)]);
        let desired = chain(vec![rule(Protocol::Tcp), rule(Protocol::Sctp)]);
        let ops = chain_delta(&old.rule_hashes(), &desired);
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], ChainOp::ReplaceRuleAt { index: 2, .. }));
        assert_eq!(
            apply(&old.rule_hashes(), &ops, &desired),
            desired.rule_hashes()
        );
    }

    #[test]
    fn table_delta_installs_and_removes_whole_chains() {
        let mut installed = HashMap::new();
        installed.insert("pali-pi-old".to_string(), vec!["x".to_string()]);

        let desired = vec![chain(vec![rule(Protocol::Tcp)])];
        let ops = table_delta(&installed, &desired);
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], ChainOp::ReplaceChain { chain } if chain.name == "pali-pi-p1"));
        assert!(matches!(&ops[1], ChainOp::RemoveChain { name } if name == "pali-pi-old"));
    }
}
