use crate::{labels::Selector, rule::Rule};

/// Where in the dataplane a policy's rules are applied.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PolicyScope {
    /// Both directions on workload interfaces; to/from-host traffic on
    /// host interfaces.
    Normal,
    Ingress,
    Egress,
    /// Host interfaces, evaluated against the pre-DNAT destination.
    PreDnat,
    /// Host interfaces, forwarded traffic only.
    ApplyOnForward,
    /// Host interfaces, the early-drop program only.
    Xdp,
}

/// Action taken when no policy in a tier matched.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TierEndAction {
    /// The tier behaves as if absent.
    Pass,
    Deny,
}

/// An ordered group of policies with a default terminal action.
#[derive(Clone, Debug, PartialEq)]
pub struct Tier {
    pub order: Option<i32>,
    pub end_action: TierEndAction,
}

/// A named, ordered rule list selecting endpoints via labels.
#[derive(Clone, Debug, PartialEq)]
pub struct Policy {
    pub tier: String,
    pub order: Option<i32>,
    pub selector: Selector,
    pub scope: PolicyScope,
    pub rules: Vec<Rule>,
}

/// Fallback rule source applied when no tier produced a verdict.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Profile {
    pub labels: crate::Labels,
    pub rules: Vec<Rule>,
}

// === impl Tier ===

impl Default for Tier {
    fn default() -> Self {
        Self {
            order: None,
            end_action: TierEndAction::Deny,
        }
    }
}
