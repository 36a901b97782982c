//! Tracks local interface link state and addresses.
//!
//! The monitor consumes a kernel subscription (abstracted as
//! [`LinkNotifier`] so tests can script it), dampens address flaps, and
//! publishes interface state and address-set updates to the dataplane
//! loop. A full resync runs every 10 seconds as a safety net, since the
//! ordering guarantees between the subscription and a list operation are
//! unclear.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod flap;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{Context, Result};
use regex::Regex;
use std::net::IpAddr;
use tokio::{sync::mpsc, time};

pub const RESYNC_INTERVAL: time::Duration = time::Duration::from_secs(10);

/// Observed link state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

/// A raw link notification from the kernel subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkUpdate {
    /// False for a deletion.
    pub exists: bool,
    pub index: u32,
    pub name: String,
    /// The oper-state flag; admin-up alone is not enough to program
    /// routes against.
    pub running: bool,
}

/// A raw address notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddrUpdate {
    pub index: u32,
    pub addr: IpAddr,
    /// False for a removal.
    pub exists: bool,
}

/// What the monitor publishes to the dataplane loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorEvent {
    LinkStateChanged {
        name: String,
        state: LinkState,
        index: u32,
    },
    /// The interface's full address set, or `None` when the interface
    /// is gone.
    AddrsChanged {
        name: String,
        addrs: Option<std::collections::BTreeSet<IpAddr>>,
    },
}

/// The kernel subscription, scriptable in tests.
pub trait LinkNotifier: Send + 'static {
    /// Opens the notification channels. May only be called once.
    fn subscribe(&mut self) -> Result<(mpsc::Receiver<LinkUpdate>, mpsc::Receiver<AddrUpdate>)>;

    fn list_links(&self) -> Result<Vec<LinkUpdate>>;

    fn list_addrs(&self, index: u32) -> Result<Vec<IpAddr>>;
}

pub struct InterfaceMonitor<N> {
    notifier: N,
    excludes: Vec<Regex>,
    events: mpsc::Sender<MonitorEvent>,

    up_ifaces: HashMap<String, u32>,
    iface_name: HashMap<u32, String>,
    iface_addrs: HashMap<u32, HashSet<IpAddr>>,
}

// === impl InterfaceMonitor ===

impl<N: LinkNotifier> InterfaceMonitor<N> {
    pub fn new(notifier: N, excludes: Vec<Regex>, events: mpsc::Sender<MonitorEvent>) -> Self {
        Self {
            notifier,
            excludes,
            events,
            up_ifaces: HashMap::new(),
            iface_name: HashMap::new(),
            iface_addrs: HashMap::new(),
        }
    }

    /// Drives the monitor until the subscription fails. The caller
    /// treats an early return as fatal; a restart resynchronizes from
    /// scratch.
    pub async fn run(mut self) -> Result<()> {
        let (links, addrs) = self
            .notifier
            .subscribe()
            .context("subscribing to link updates")?;
        let (mut links, mut addrs) = flap::damp(links, addrs);
        tracing::info!("interface monitor started");

        let mut resync = time::interval(RESYNC_INTERVAL);
        loop {
            tokio::select! {
                link = links.recv() => {
                    let link = link.context("link update channel closed")?;
                    self.handle_link_update(link).await;
                }
                addr = addrs.recv() => {
                    let addr = addr.context("address update channel closed")?;
                    self.handle_addr_update(addr).await;
                }
                _ = resync.tick() => {
                    self.resync().await?;
                }
            }
        }
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.excludes.iter().any(|re| re.is_match(name))
    }

    async fn handle_link_update(&mut self, link: LinkUpdate) {
        // A rename shows up as a new name on a known index; synthesize
        // the removal of the old name first.
        if let Some(old_name) = self.iface_name.get(&link.index) {
            if *old_name != link.name {
                let old_name = old_name.clone();
                tracing::info!(%old_name, new_name = %link.name, "interface renamed");
                self.store_and_notify_link_inner(
                    LinkUpdate {
                        exists: false,
                        ..link.clone()
                    },
                    &old_name,
                )
                .await;
            }
        }
        let name = link.name.clone();
        self.store_and_notify_link_inner(link, &name).await;
    }

    async fn store_and_notify_link_inner(&mut self, link: LinkUpdate, name: &str) {
        if link.exists {
            self.iface_name.insert(link.index, name.to_string());
        } else {
            if !self.is_excluded(name) {
                self.iface_addrs.remove(&link.index);
                self.notify_addrs_gone(name).await;
            }
            self.iface_name.remove(&link.index);
        }

        let is_up = link.exists && link.running;
        let was_up = self.up_ifaces.contains_key(name);
        if is_up && !was_up {
            tracing::debug!(iface = %name, "interface now up");
            self.up_ifaces.insert(name.to_string(), link.index);
            self.send(MonitorEvent::LinkStateChanged {
                name: name.to_string(),
                state: LinkState::Up,
                index: link.index,
            })
            .await;
        } else if was_up && !is_up {
            tracing::debug!(iface = %name, "interface now down");
            let old_index = self.up_ifaces.remove(name).unwrap_or(link.index);
            self.send(MonitorEvent::LinkStateChanged {
                name: name.to_string(),
                state: LinkState::Down,
                index: old_index,
            })
            .await;
        }

        // Fetch addresses whenever the link exists, whatever its state:
        // that closes the gap between the link and address channels and
        // lets a host interface be secured before it comes up.
        if link.exists && !self.is_excluded(name) {
            let new_addrs: HashSet<IpAddr> = match self.notifier.list_addrs(link.index) {
                Ok(addrs) => addrs.into_iter().collect(),
                Err(error) => {
                    tracing::warn!(%error, iface = %name, "address list failed");
                    return;
                }
            };
            if self.iface_addrs.get(&link.index) != Some(&new_addrs) {
                self.iface_addrs.insert(link.index, new_addrs);
                self.notify_addrs(link.index).await;
            }
        }
    }

    async fn handle_addr_update(&mut self, update: AddrUpdate) {
        let name = match self.iface_name.get(&update.index) {
            Some(name) => name.clone(),
            // Link not notified yet; the link update will carry the
            // addresses.
            None => {
                tracing::debug!(index = update.index, "address update for unknown link");
                return;
            }
        };
        if self.is_excluded(&name) {
            return;
        }

        let addrs = self.iface_addrs.entry(update.index).or_default();
        let changed = if update.exists {
            addrs.insert(update.addr)
        } else {
            addrs.remove(&update.addr)
        };
        if changed {
            self.notify_addrs(update.index).await;
        }
    }

    async fn notify_addrs(&mut self, index: u32) {
        let Some(name) = self.iface_name.get(&index) else {
            return;
        };
        let addrs = self
            .iface_addrs
            .get(&index)
            .map(|set| set.iter().copied().collect());
        let event = MonitorEvent::AddrsChanged {
            name: name.clone(),
            addrs,
        };
        self.send(event).await;
    }

    async fn notify_addrs_gone(&mut self, name: &str) {
        self.send(MonitorEvent::AddrsChanged {
            name: name.to_string(),
            addrs: None,
        })
        .await;
    }

    async fn send(&mut self, event: MonitorEvent) {
        if self.events.send(event).await.is_err() {
            tracing::warn!("monitor event receiver dropped");
        }
    }

    /// Lists the links and reconciles: notifies everything present and
    /// synthesizes removals for interfaces that vanished without a
    /// deletion notification.
    async fn resync(&mut self) -> Result<()> {
        tracing::debug!("resyncing interface state");
        let links = self.notifier.list_links().context("listing links")?;

        let mut seen = HashSet::new();
        for link in links {
            seen.insert(link.name.clone());
            self.handle_link_update(link).await;
        }

        let gone: Vec<(String, u32)> = self
            .up_ifaces
            .iter()
            .filter(|(name, _)| !seen.contains(*name))
            .map(|(name, index)| (name.clone(), *index))
            .collect();
        for (name, index) in gone {
            tracing::info!(iface = %name, "interface removal spotted on resync");
            self.up_ifaces.remove(&name);
            self.iface_addrs.remove(&index);
            self.iface_name.remove(&index);
            self.send(MonitorEvent::LinkStateChanged {
                name: name.clone(),
                state: LinkState::Down,
                index,
            })
            .await;
            self.notify_addrs_gone(&name).await;
        }
        Ok(())
    }
}
