use crate::{action::Action, match_criteria::MatchCriteria};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha224};

/// Rule-hash fingerprints are truncated to 16 URL-safe base64 chars: 96
/// bits, short enough to live in a comment and collision-resistant
/// enough to trust for diffing.
pub const HASH_LENGTH: usize = 16;

/// Comment prefix marking a hash fingerprint in rendered output.
pub const HASH_COMMENT_PREFIX: &str = "pali:";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rule {
    pub match_criteria: MatchCriteria,
    pub action: Option<Action>,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub rules: Vec<Rule>,
}

// === impl Rule ===

impl Rule {
    pub fn new(match_criteria: MatchCriteria, action: Action) -> Self {
        Self {
            match_criteria,
            action: Some(action),
            comment: None,
        }
    }

    pub fn comment(mut self, comment: impl ToString) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn render_append(&self, chain_name: &str, prefix_fragment: Option<&str>) -> String {
        self.render_inner(vec!["-A".to_string(), chain_name.to_string()], prefix_fragment)
    }

    pub fn render_insert_at(&self, chain_name: &str, rule_num: usize) -> String {
        self.render_inner(
            vec!["-I".to_string(), chain_name.to_string(), rule_num.to_string()],
            None,
        )
    }

    pub fn render_replace_at(&self, chain_name: &str, rule_num: usize) -> String {
        self.render_inner(
            vec!["-R".to_string(), chain_name.to_string(), rule_num.to_string()],
            None,
        )
    }

    fn render_inner(&self, mut fragments: Vec<String>, prefix_fragment: Option<&str>) -> String {
        if let Some(prefix) = prefix_fragment {
            fragments.push(prefix.to_string());
        }
        if let Some(comment) = &self.comment {
            fragments.push(format!("-m comment --comment \"{comment}\""));
        }
        let match_fragment = self.match_criteria.render();
        if !match_fragment.is_empty() {
            fragments.push(match_fragment);
        }
        if let Some(action) = &self.action {
            fragments.push(action.to_fragment());
        }
        fragments.join(" ")
    }
}

// === impl Chain ===

impl Chain {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
        }
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// One fingerprint per rule. Each hash chains in the previous one,
    /// so both a rule's content and its position affect it; the chain
    /// name seeds the sequence so identical rules in different chains
    /// hash differently.
    pub fn rule_hashes(&self) -> Vec<String> {
        let mut hash = Sha224::digest(self.name.as_bytes()).to_vec();
        self.rules
            .iter()
            .map(|rule| {
                let rendered = rule.render_append(&self.name, Some("HASH"));
                let mut s = Sha224::new();
                s.update(&hash);
                s.update(rendered.as_bytes());
                hash = s.finalize().to_vec();
                let mut encoded = URL_SAFE_NO_PAD.encode(&hash);
                encoded.truncate(HASH_LENGTH);
                encoded
            })
            .collect()
    }

    /// Renders the chain for installation: each rule carries its hash
    /// fingerprint as a comment so the installed state can be diffed
    /// later.
    pub fn render(&self) -> Vec<String> {
        self.rule_hashes()
            .iter()
            .zip(&self.rules)
            .map(|(hash, rule)| {
                let mut rule = rule.clone();
                rule.comment = Some(format!("{HASH_COMMENT_PREFIX}{hash}"));
                rule.render_append(&self.name, None)
            })
            .collect()
    }
}

/// Recovers the hash fingerprints from rendered rule text, in order.
/// Rules without a fingerprint comment are reported as empty strings so
/// positions stay aligned.
pub fn hashes_from_rendered<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    lines
        .into_iter()
        .map(|line| {
            let Some(idx) = line.find(HASH_COMMENT_PREFIX) else {
                return String::new();
            };
            let rest = &line[idx + HASH_COMMENT_PREFIX.len()..];
            rest.chars().take(HASH_LENGTH).collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::Protocol;

    fn sample_chain() -> Chain {
        Chain::new("pali-pi-default")
            .rule(Rule::new(
                MatchCriteria::new().protocol(Protocol::Tcp),
                Action::Accept,
            ))
            .rule(Rule::new(MatchCriteria::new(), Action::Drop))
    }

    #[test]
    fn hashes_are_stable_and_position_sensitive() {
        let chain = sample_chain();
        let hashes = chain.rule_hashes();
        assert_eq!(hashes, chain.rule_hashes(), "hashing is deterministic");
        assert_eq!(hashes.len(), 2);
        assert!(hashes.iter().all(|h| h.len() == HASH_LENGTH));

        // Swapping rule order changes both fingerprints.
        let mut swapped = sample_chain();
        swapped.rules.reverse();
        let swapped_hashes = swapped.rule_hashes();
        assert_ne!(hashes[0], swapped_hashes[0]);
        assert_ne!(hashes[1], swapped_hashes[1]);
    }

    #[test]
    fn identical_rules_in_different_chains_hash_differently() {
        let a = Chain::new("pali-pi-a").rule(Rule::new(MatchCriteria::new(), Action::Drop));
        let b = Chain::new("pali-pi-b").rule(Rule::new(MatchCriteria::new(), Action::Drop));
        assert_ne!(a.rule_hashes(), b.rule_hashes());
    }

    #[test]
    fn rendered_hash_comments_round_trip() {
        let chain = sample_chain();
        let rendered = chain.render();
        let parsed = hashes_from_rendered(rendered.iter().map(String::as_str));
        assert_eq!(parsed, chain.rule_hashes());

        // parse -> render -> parse is a fixed point.
        let again = hashes_from_rendered(rendered.iter().map(String::as_str));
        assert_eq!(parsed, again);
    }

    #[test]
    fn renders_insert_and_replace_forms() {
        let rule = Rule::new(MatchCriteria::new().protocol(Protocol::Udp), Action::Return);
        assert_eq!(
            rule.render_append("pali-fw-eth0", None),
            "-A pali-fw-eth0 -p udp -j RETURN"
        );
        assert_eq!(
            rule.render_insert_at("pali-fw-eth0", 3),
            "-I pali-fw-eth0 3 -p udp -j RETURN"
        );
        assert_eq!(
            rule.render_replace_at("pali-fw-eth0", 2),
            "-R pali-fw-eth0 2 -p udp -j RETURN"
        );
    }
}
