//! Kernel link/address source backed by the `ip` tool.
//!
//! The monitor only needs the [`LinkNotifier`] seam; this adapter polls
//! `ip -json addr show` and synthesizes change notifications from the
//! diff. A native netlink subscription can replace it behind the same
//! trait without touching the monitor.

use anyhow::{bail, Context, Result};
use palisade_iface_monitor::{AddrUpdate, LinkNotifier, LinkUpdate};
use std::{collections::BTreeMap, collections::BTreeSet, net::IpAddr, process::Command};
use tokio::sync::mpsc;

const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

pub struct IpCmdLinkNotifier {
    subscribed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Snapshot {
    links: BTreeMap<u32, LinkUpdate>,
    addrs: BTreeMap<u32, BTreeSet<IpAddr>>,
}

// === impl IpCmdLinkNotifier ===

impl IpCmdLinkNotifier {
    pub fn new() -> Self {
        Self { subscribed: false }
    }

    fn snapshot() -> Result<Snapshot> {
        let output = Command::new("ip")
            .args(["-json", "addr", "show"])
            .output()
            .context("running ip addr show")?;
        if !output.status.success() {
            bail!(
                "ip addr show failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let parsed: serde_json::Value =
            serde_json::from_slice(&output.stdout).context("parsing ip output")?;

        let mut links = BTreeMap::new();
        let mut addrs: BTreeMap<u32, BTreeSet<IpAddr>> = BTreeMap::new();
        for iface in parsed.as_array().into_iter().flatten() {
            let Some(index) = iface["ifindex"].as_u64() else {
                continue;
            };
            let index = index as u32;
            let name = iface["ifname"].as_str().unwrap_or_default().to_string();
            let running = iface["flags"]
                .as_array()
                .map(|flags| flags.iter().any(|f| f.as_str() == Some("LOWER_UP")))
                .unwrap_or(false);
            links.insert(
                index,
                LinkUpdate {
                    exists: true,
                    index,
                    name,
                    running,
                },
            );

            let set = addrs.entry(index).or_default();
            for info in iface["addr_info"].as_array().into_iter().flatten() {
                if let Some(addr) = info["local"].as_str() {
                    if let Ok(addr) = addr.parse() {
                        set.insert(addr);
                    }
                }
            }
        }
        Ok(Snapshot { links, addrs })
    }
}

impl LinkNotifier for IpCmdLinkNotifier {
    fn subscribe(&mut self) -> Result<(mpsc::Receiver<LinkUpdate>, mpsc::Receiver<AddrUpdate>)> {
        if self.subscribed {
            bail!("already subscribed");
        }
        self.subscribed = true;

        let (link_tx, link_rx) = mpsc::channel(10);
        let (addr_tx, addr_rx) = mpsc::channel(10);

        // Poll-and-diff on a plain thread; the channels bridge into the
        // async loop.
        std::thread::spawn(move || {
            let mut prev = Snapshot {
                links: BTreeMap::new(),
                addrs: BTreeMap::new(),
            };
            loop {
                std::thread::sleep(POLL_INTERVAL);
                let next = match Self::snapshot() {
                    Ok(snapshot) => snapshot,
                    Err(error) => {
                        tracing::warn!(%error, "link poll failed");
                        continue;
                    }
                };

                for (index, link) in &next.links {
                    if prev.links.get(index) != Some(link)
                        && link_tx.blocking_send(link.clone()).is_err()
                    {
                        return;
                    }
                }
                for (index, link) in &prev.links {
                    if !next.links.contains_key(index) {
                        let gone = LinkUpdate {
                            exists: false,
                            ..link.clone()
                        };
                        if link_tx.blocking_send(gone).is_err() {
                            return;
                        }
                    }
                }

                let empty = BTreeSet::new();
                for (index, set) in &next.addrs {
                    let old = prev.addrs.get(index).unwrap_or(&empty);
                    for addr in set.difference(old) {
                        let update = AddrUpdate {
                            index: *index,
                            addr: *addr,
                            exists: true,
                        };
                        if addr_tx.blocking_send(update).is_err() {
                            return;
                        }
                    }
                    for addr in old.difference(set) {
                        let update = AddrUpdate {
                            index: *index,
                            addr: *addr,
                            exists: false,
                        };
                        if addr_tx.blocking_send(update).is_err() {
                            return;
                        }
                    }
                }

                prev = next;
            }
        });

        Ok((link_rx, addr_rx))
    }

    fn list_links(&self) -> Result<Vec<LinkUpdate>> {
        Ok(Self::snapshot()?.links.into_values().collect())
    }

    fn list_addrs(&self, index: u32) -> Result<Vec<IpAddr>> {
        Ok(Self::snapshot()?
            .addrs
            .remove(&index)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default())
    }
}
