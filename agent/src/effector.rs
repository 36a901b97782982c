//! The outbound boundary: everything the loop asks the dataplane to do
//! goes through these traits, so tests substitute recorders and the
//! loop stays free of platform calls.

use anyhow::{bail, Context, Result};
use palisade_bpf::{asm::Insn, attach::AttachStore};
use palisade_core::Direction;
use palisade_iptables::{ChainOp, Rule};
use std::process::Command;

/// Map descriptors the classifier programs reference.
#[derive(Copy, Clone, Debug)]
pub struct MapFds {
    pub ipsets: u32,
    pub state: u32,
    pub jump: u32,
}

pub trait ClassifierEffector {
    fn map_fds(&self) -> MapFds;

    fn attach_program(
        &mut self,
        iface: &str,
        direction: Direction,
        insns: &[Insn],
    ) -> Result<()>;

    fn detach_program(&mut self, iface: &str, direction: Direction) -> Result<()>;

    fn attach_xdp_program(&mut self, iface: &str, insns: &[Insn]) -> Result<()>;

    fn detach_xdp_program(&mut self, iface: &str) -> Result<()>;

    /// Key-level writes to the shared IP-set lookup table.
    fn write_ip_set_entry(&mut self, key: &[u8]) -> Result<()>;

    fn delete_ip_set_entry(&mut self, key: &[u8]) -> Result<()>;
}

pub trait ChainEffector {
    fn replace_chain(&mut self, table: &str, chain: &str, rules: &[Rule]) -> Result<()>;

    fn insert_rule_at(&mut self, table: &str, chain: &str, index: usize, rule: &Rule)
        -> Result<()>;

    fn replace_rule_at(&mut self, table: &str, chain: &str, index: usize, rule: &Rule)
        -> Result<()>;

    fn delete_rule_at(&mut self, table: &str, chain: &str, index: usize) -> Result<()>;

    fn remove_chain(&mut self, table: &str, chain: &str) -> Result<()>;
}

/// The kernel table a chain belongs to, by naming convention.
pub fn table_for_chain(chain: &str) -> &'static str {
    if chain.starts_with("pali-nat-") {
        "nat"
    } else if chain.starts_with("pali-pd-") {
        "raw"
    } else {
        "filter"
    }
}

/// Applies one edit-script step through a [`ChainEffector`].
pub fn apply_chain_op(effector: &mut dyn ChainEffector, op: &ChainOp) -> Result<()> {
    match op {
        ChainOp::ReplaceChain { chain } => effector.replace_chain(
            table_for_chain(&chain.name),
            &chain.name,
            &chain.rules,
        ),
        ChainOp::InsertRuleAt { chain, index, rule } => {
            effector.insert_rule_at(table_for_chain(chain), chain, *index, rule)
        }
        ChainOp::ReplaceRuleAt { chain, index, rule } => {
            effector.replace_rule_at(table_for_chain(chain), chain, *index, rule)
        }
        ChainOp::DeleteRuleAt { chain, index } => {
            effector.delete_rule_at(table_for_chain(chain), chain, *index)
        }
        ChainOp::RemoveChain { name } => effector.remove_chain(table_for_chain(name), name),
    }
}

/// Drives the system `iptables`/`ip6tables` binaries. One invocation
/// per rule keeps each chain edit an ordered single-chain transaction.
pub struct IptablesCmdEffector {
    binary: &'static str,
}

// === impl IptablesCmdEffector ===

impl IptablesCmdEffector {
    pub fn new_v4() -> Self {
        Self { binary: "iptables" }
    }

    pub fn new_v6() -> Self {
        Self {
            binary: "ip6tables",
        }
    }

    fn run(&self, table: &str, args: &[String]) -> Result<()> {
        let output = Command::new(self.binary)
            .arg("-t")
            .arg(table)
            .args(args)
            .output()
            .with_context(|| format!("running {}", self.binary))?;
        if !output.status.success() {
            bail!(
                "{} -t {table} {args:?} failed: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn run_flags(&self, table: &str, args: &[&str]) -> Result<()> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.run(table, &args)
    }

    fn run_rule_fragment(&self, table: &str, fragment: &str) -> Result<()> {
        self.run(table, &tokenize(fragment))
    }
}

/// Splits a rendered rule into argv, honoring the double quotes around
/// comment text.
fn tokenize(fragment: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in fragment.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

impl ChainEffector for IptablesCmdEffector {
    fn replace_chain(&mut self, table: &str, chain: &str, rules: &[Rule]) -> Result<()> {
        // Flush-or-create, then append in order. Whole-chain writes get
        // the hash-comment form so the installed state can be diffed on
        // restart.
        if self.run_flags(table, &["-F", chain]).is_err() {
            self.run_flags(table, &["-N", chain])?;
        }
        let rendered = palisade_iptables::Chain {
            name: chain.to_string(),
            rules: rules.to_vec(),
        }
        .render();
        for line in rendered {
            self.run_rule_fragment(table, &line)?;
        }
        Ok(())
    }

    fn insert_rule_at(
        &mut self,
        table: &str,
        chain: &str,
        index: usize,
        rule: &Rule,
    ) -> Result<()> {
        self.run_rule_fragment(table, &rule.render_insert_at(chain, index))
    }

    fn replace_rule_at(
        &mut self,
        table: &str,
        chain: &str,
        index: usize,
        rule: &Rule,
    ) -> Result<()> {
        self.run_rule_fragment(table, &rule.render_replace_at(chain, index))
    }

    fn delete_rule_at(&mut self, table: &str, chain: &str, index: usize) -> Result<()> {
        self.run_flags(table, &["-D", chain, &index.to_string()])
    }

    fn remove_chain(&mut self, table: &str, chain: &str) -> Result<()> {
        self.run_flags(table, &["-F", chain])?;
        self.run_flags(table, &["-X", chain])
    }
}

/// Records desired classifier state on disk: program binaries next to
/// their attachment records. The platform loader picks both up; the
/// hash gate means an unchanged program is never rewritten.
pub struct ProgramStoreClassifier {
    store: AttachStore,
    dir: std::path::PathBuf,
    map_fds: MapFds,
}

// === impl ProgramStoreClassifier ===

impl ProgramStoreClassifier {
    pub fn new(dir: std::path::PathBuf, map_fds: MapFds) -> Self {
        Self {
            store: AttachStore::new(dir.clone()),
            dir,
            map_fds,
        }
    }

    fn program_name(direction: Direction) -> &'static str {
        match direction {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    fn stage(&mut self, iface: &str, name: &str, insns: &[Insn]) -> Result<()> {
        let bytes = palisade_bpf::asm::to_bytes(insns);
        let hash = palisade_bpf::attach::program_hash(&bytes);
        if self.store.is_attached(iface, name, &hash) {
            tracing::debug!(%iface, %name, "program unchanged, skipping attach");
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let bin_path = self.dir.join(format!("{iface}_{name}.bin"));
        std::fs::write(&bin_path, &bytes)
            .with_context(|| format!("writing {}", bin_path.display()))?;
        self.store.record(iface, name, &hash)?;
        tracing::info!(%iface, %name, %hash, "classifier program staged for attach");
        Ok(())
    }

    fn unstage(&mut self, iface: &str, name: &str) -> Result<()> {
        let bin_path = self.dir.join(format!("{iface}_{name}.bin"));
        match std::fs::remove_file(&bin_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("removing {}", bin_path.display())),
        }
        self.store.forget(iface, name)
    }
}

impl ClassifierEffector for ProgramStoreClassifier {
    fn map_fds(&self) -> MapFds {
        self.map_fds
    }

    fn attach_program(
        &mut self,
        iface: &str,
        direction: Direction,
        insns: &[Insn],
    ) -> Result<()> {
        self.stage(iface, Self::program_name(direction), insns)
    }

    fn detach_program(&mut self, iface: &str, direction: Direction) -> Result<()> {
        self.unstage(iface, Self::program_name(direction))
    }

    fn attach_xdp_program(&mut self, iface: &str, insns: &[Insn]) -> Result<()> {
        self.stage(iface, "xdp", insns)
    }

    fn detach_xdp_program(&mut self, iface: &str) -> Result<()> {
        self.unstage(iface, "xdp")
    }

    fn write_ip_set_entry(&mut self, _key: &[u8]) -> Result<()> {
        Ok(())
    }

    fn delete_ip_set_entry(&mut self, _key: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_honors_quoted_comments() {
        assert_eq!(
            tokenize("-A pali-tw-eth0 -m comment --comment \"Drop if no profiles matched\" -j DROP"),
            vec![
                "-A",
                "pali-tw-eth0",
                "-m",
                "comment",
                "--comment",
                "Drop if no profiles matched",
                "-j",
                "DROP",
            ]
        );
    }

    #[test]
    fn tables_follow_chain_naming() {
        assert_eq!(table_for_chain("pali-nat-outgoing"), "nat");
        assert_eq!(table_for_chain("pali-pd-eth0"), "raw");
        assert_eq!(table_for_chain("pali-tw-eth0"), "filter");
        assert_eq!(table_for_chain("pali-pi-p1"), "filter");
    }

    #[test]
    fn program_store_skips_unchanged_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let fds = MapFds {
            ipsets: 10,
            state: 11,
            jump: 12,
        };
        let mut effector = ProgramStoreClassifier::new(dir.path().join("bpf"), fds);

        let insns = vec![Insn {
            code: 0x95,
            dst: 0,
            src: 0,
            off: 0,
            imm: 0,
        }];
        effector
            .attach_program("eth0", Direction::Ingress, &insns)
            .unwrap();
        let bin = dir.path().join("bpf").join("eth0_ingress.bin");
        let mtime = std::fs::metadata(&bin).unwrap().modified().unwrap();

        // Same program: nothing is rewritten.
        effector
            .attach_program("eth0", Direction::Ingress, &insns)
            .unwrap();
        assert_eq!(std::fs::metadata(&bin).unwrap().modified().unwrap(), mtime);

        effector.detach_program("eth0", Direction::Ingress).unwrap();
        assert!(!bin.exists());
    }
}
