use anyhow::{bail, Result};
use clap::Parser;
use palisade_core::PortRange;
use regex::Regex;

/// Per-node dataplane agent for the cluster policy engine.
#[derive(Debug, Parser)]
#[command(name = "palisade-agent")]
pub struct Args {
    /// One of `error`, `warn`, `info`, `debug`.
    #[arg(long, default_value = "info", env = "PALISADE_LOG_LEVEL")]
    pub log_level: String,

    /// Only interfaces matching this pattern are managed.
    #[arg(long, default_value = ".*", env = "PALISADE_INTERFACE_INCLUDE_REGEX")]
    pub interface_include_regex: String,

    /// Interfaces to ignore address churn from; repeatable.
    #[arg(long, env = "PALISADE_INTERFACE_EXCLUDE_REGEX", value_delimiter = ',')]
    pub interface_exclude_regex: Vec<String>,

    /// Program the in-kernel classifier instead of rule chains.
    #[arg(long, env = "PALISADE_BPF_ENABLED")]
    pub bpf_enabled: bool,

    /// Only masquerade outgoing traffic leaving this interface.
    #[arg(long, env = "PALISADE_NAT_OUTGOING_INTERFACE_FILTER")]
    pub nat_outgoing_interface_filter: Option<String>,

    /// `first-last` source-port range for masqueraded connections.
    #[arg(long, env = "PALISADE_NAT_PORT_RANGE")]
    pub nat_port_range: Option<String>,

    /// Prefix for kernel ipset names, at most 4 characters.
    #[arg(long, default_value = "pali", env = "PALISADE_IPSET_NAME_PREFIX")]
    pub ipset_name_prefix: String,

    /// Directory for attached-program records.
    #[arg(
        long,
        default_value = "/var/run/palisade/bpf",
        env = "PALISADE_PROGRAM_STATE_DIR"
    )]
    pub program_state_dir: std::path::PathBuf,
}

/// Validated agent configuration.
#[derive(Debug)]
pub struct Config {
    pub log_level: String,
    pub interface_include: Regex,
    pub interface_excludes: Vec<Regex>,
    pub bpf_enabled: bool,
    pub nat_outgoing_interface_filter: Option<String>,
    pub nat_port_range: Option<PortRange>,
    pub ipset_name_prefix: String,
    pub program_state_dir: std::path::PathBuf,
}

// === impl Args ===

impl Args {
    /// Checks every knob eagerly so an unusable configuration fails the
    /// process before the loop starts.
    pub fn validate(self) -> Result<Config> {
        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" => {}
            level => bail!("unrecognized log level: {level}"),
        }

        let interface_include = Regex::new(&self.interface_include_regex)?;
        let interface_excludes = self
            .interface_exclude_regex
            .iter()
            .map(|s| Regex::new(s).map_err(Into::into))
            .collect::<Result<Vec<_>>>()?;

        let nat_port_range = self
            .nat_port_range
            .as_deref()
            .map(|s| s.parse::<PortRange>())
            .transpose()?;

        if self.ipset_name_prefix.is_empty() || self.ipset_name_prefix.len() > 4 {
            bail!(
                "ipset name prefix must be 1-4 characters, got {:?}",
                self.ipset_name_prefix
            );
        }

        Ok(Config {
            log_level: self.log_level,
            interface_include,
            interface_excludes,
            bpf_enabled: self.bpf_enabled,
            nat_outgoing_interface_filter: self.nat_outgoing_interface_filter,
            nat_port_range,
            ipset_name_prefix: self.ipset_name_prefix,
            program_state_dir: self.program_state_dir,
        })
    }
}
