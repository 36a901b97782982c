use std::fmt;

/// What a rule does when its criteria match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Accept,
    Drop,
    Return,
    /// Jump to another chain, returning here afterwards.
    Jump(String),
    /// Hand the packet to another chain without returning.
    Goto(String),
    Masq {
        /// Restrict the source ports chosen for masquerade.
        to_ports: Option<String>,
    },
    Log {
        prefix: String,
    },
    /// Set the given bits under the given mask.
    SetMark {
        bits: u32,
        mask: u32,
    },
    ClearMark {
        mask: u32,
    },
}

// === impl Action ===

impl Action {
    pub fn to_fragment(&self) -> String {
        match self {
            Self::Accept => "-j ACCEPT".to_string(),
            Self::Drop => "-j DROP".to_string(),
            Self::Return => "-j RETURN".to_string(),
            Self::Jump(chain) => format!("-j {chain}"),
            Self::Goto(chain) => format!("-g {chain}"),
            Self::Masq { to_ports: None } => "-j MASQUERADE".to_string(),
            Self::Masq {
                to_ports: Some(ports),
            } => format!("-j MASQUERADE --to-ports {ports}"),
            Self::Log { prefix } => format!("-j LOG --log-prefix \"{prefix}: \" --log-level 5"),
            Self::SetMark { bits, mask } => format!("-j MARK --set-xmark {bits:#x}/{mask:#x}"),
            Self::ClearMark { mask } => format!("-j MARK --set-xmark 0x0/{mask:#x}"),
        }
    }

    pub fn masq() -> Self {
        Self::Masq { to_ports: None }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_fragment().fmt(f)
    }
}
