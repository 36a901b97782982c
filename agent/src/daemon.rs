//! The single-threaded dataplane loop.
//!
//! One task owns every index and all reconciliation state. Resource
//! updates, interface-monitor events and the periodic tick land on
//! channels; each turn of the loop routes them and then drains the
//! dirty set into effector calls. Transient dataplane failures leave
//! the endpoint dirty and retry with exponential backoff.

use crate::effector::{apply_chain_op, ChainEffector, ClassifierEffector};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::Result;
use palisade_bpf::polprog::{member_entry, Builder};
use palisade_core::{Direction, EndpointKey, IpVersion, ResolvedEndpoint, Update};
use palisade_index::{DataplaneDelta, Dispatcher, MemberChange};
use palisade_iptables::{table_delta, Chain, Renderer};
use regex::Regex;
use std::future::Future;
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};

const RETRY_INITIAL: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_secs(30);
const TICK: Duration = Duration::from_secs(1);

/// The set that makes outgoing-NAT active when it exists.
const MASQ_POOLS_SET: &str = "masq-ipam-pools";

/// What the resource-watch client feeds the loop.
#[derive(Clone, Debug)]
pub enum InboundMessage {
    Update(Update),
    /// A full snapshot, applied atomically.
    Snapshot(Vec<Update>),
}

pub struct Daemon<C, T> {
    dispatcher: Dispatcher,
    alloc: palisade_core::IdAllocator,
    classifier: C,
    chains: T,
    renderer: Renderer,
    bpf_enabled: bool,
    interface_include: Regex,

    up_ifaces: HashSet<String>,
    endpoints: HashMap<EndpointKey, ResolvedEndpoint>,
    /// Attachment sites remembered past endpoint removal so teardown
    /// still knows where to detach.
    iface_by_endpoint: HashMap<EndpointKey, String>,
    installed_chains: HashMap<String, Vec<String>>,
    chains_by_endpoint: HashMap<EndpointKey, Vec<String>>,
    nat_outgoing_active: bool,
    retries: HashMap<EndpointKey, Retry>,
}

#[derive(Debug)]
struct Retry {
    delay: Duration,
    next_attempt: Instant,
}

// === impl Daemon ===

impl<C: ClassifierEffector, T: ChainEffector> Daemon<C, T> {
    pub fn new(
        classifier: C,
        chains: T,
        renderer: Renderer,
        bpf_enabled: bool,
        interface_include: Regex,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            alloc: palisade_core::IdAllocator::new(),
            classifier,
            chains,
            renderer,
            bpf_enabled,
            interface_include,
            up_ifaces: HashSet::new(),
            endpoints: HashMap::new(),
            iface_by_endpoint: HashMap::new(),
            installed_chains: HashMap::new(),
            chains_by_endpoint: HashMap::new(),
            nat_outgoing_active: false,
            retries: HashMap::new(),
        }
    }

    /// Runs until the shutdown future resolves or the inbound stream
    /// closes. In-flight effector work always completes before return.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut monitor: mpsc::Receiver<palisade_iface_monitor::MonitorEvent>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let mut tick = time::interval(TICK);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(InboundMessage::Update(update)) => self.dispatcher.on_update(update),
                    Some(InboundMessage::Snapshot(updates)) => {
                        tracing::info!(resources = updates.len(), "applying snapshot");
                        self.dispatcher.apply_snapshot(updates);
                    }
                    None => {
                        tracing::info!("resource stream closed; shutting down");
                        return Ok(());
                    }
                },
                event = monitor.recv() => match event {
                    Some(event) => self.handle_monitor_event(event),
                    // The monitor only stops when the kernel
                    // subscription is lost; restart from scratch.
                    None => anyhow::bail!("interface monitor stopped"),
                },
                _ = tick.tick() => {}
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    return Ok(());
                }
            }
            self.reconcile();
        }
    }

    fn handle_monitor_event(&mut self, event: palisade_iface_monitor::MonitorEvent) {
        use palisade_iface_monitor::{LinkState, MonitorEvent};
        match event {
            MonitorEvent::LinkStateChanged { name, state, .. } => {
                let came_up = state == LinkState::Up;
                let changed = if came_up {
                    self.up_ifaces.insert(name.clone())
                } else {
                    self.up_ifaces.remove(&name)
                };
                if !changed {
                    return;
                }
                // (Re)program every endpoint bound to this interface.
                let affected: Vec<EndpointKey> = self
                    .endpoints
                    .iter()
                    .filter(|(_, ep)| ep.iface_name == name)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in affected {
                    if came_up {
                        self.apply_endpoint(&key);
                    } else {
                        self.unprogram_endpoint(&key);
                    }
                }
            }
            MonitorEvent::AddrsChanged { name, addrs } => {
                tracing::debug!(iface = %name, ?addrs, "interface addresses changed");
            }
        }
    }

    /// Drains the dirty set and runs any due retries.
    pub fn reconcile(&mut self) {
        if self.dispatcher.has_dirty_endpoints() {
            let delta = self.dispatcher.drain();
            self.apply_delta(delta);
        }
        self.reconcile_nat_outgoing();

        let now = Instant::now();
        let due: Vec<EndpointKey> = self
            .retries
            .iter()
            .filter(|(_, retry)| retry.next_attempt <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            tracing::debug!(endpoint = %key, "retrying dataplane programming");
            if self.endpoints.contains_key(&key) {
                self.apply_endpoint(&key);
            } else {
                self.unprogram_endpoint(&key);
            }
        }
    }

    fn apply_delta(&mut self, delta: DataplaneDelta) {
        // Membership first: a program must never reference membership
        // that has not reached the lookup tables.
        for change in &delta.ip_set_events {
            self.apply_member_change(change);
        }
        for key in delta.removed {
            self.endpoints.remove(&key);
            self.unprogram_endpoint(&key);
        }
        for resolved in delta.updated {
            let key = resolved.key.clone();
            self.iface_by_endpoint
                .insert(key.clone(), resolved.iface_name.clone());
            self.endpoints.insert(key.clone(), resolved);
            self.apply_endpoint(&key);
        }
    }

    fn apply_member_change(&mut self, change: &MemberChange) {
        if !self.bpf_enabled {
            // Kernel ipsets are maintained by their own manager; the
            // chains only reference them by name.
            tracing::debug!(?change, "membership change left to the ipset manager");
            return;
        }
        let result = match change {
            MemberChange::Added { set, member } => {
                let id = self.alloc.get_or_alloc(set);
                [member_entry(false, id, member), member_entry(true, id, member)]
                    .into_iter()
                    .flatten()
                    .try_for_each(|key| self.classifier.write_ip_set_entry(&key))
            }
            MemberChange::Removed { set, member } => {
                let id = match self.alloc.get(set) {
                    Some(id) => id,
                    None => return,
                };
                let result = [member_entry(false, id, member), member_entry(true, id, member)]
                    .into_iter()
                    .flatten()
                    .try_for_each(|key| self.classifier.delete_ip_set_entry(&key));
                self.alloc.release(set);
                result
            }
        };
        if let Err(error) = result {
            // Retried wholesale on the next resync; the key-level write
            // is idempotent.
            tracing::warn!(%error, ?change, "IP set table write failed");
        }
    }

    fn apply_endpoint(&mut self, key: &EndpointKey) {
        let Some(ep) = self.endpoints.get(key).cloned() else {
            return;
        };
        if !self.interface_include.is_match(&ep.iface_name) {
            tracing::debug!(iface = %ep.iface_name, "interface not managed");
            self.retries.remove(key);
            return;
        }
        if !self.up_ifaces.contains(&ep.iface_name) {
            // Policy is resolved as soon as the resource is known, but
            // only attached once the link is observed.
            tracing::debug!(iface = %ep.iface_name, "interface not up yet; deferring");
            self.retries.remove(key);
            return;
        }

        let result = if self.bpf_enabled {
            self.program_classifier(&ep)
        } else {
            self.program_chains(key, &ep)
        };
        match result {
            Ok(()) => {
                self.retries.remove(key);
            }
            Err(error) => {
                tracing::warn!(endpoint = %key, %error, "dataplane programming failed; will retry");
                self.schedule_retry(key.clone());
            }
        }
    }

    fn program_classifier(&mut self, ep: &ResolvedEndpoint) -> Result<()> {
        let fds = self.classifier.map_fds();
        let ipv6 = ep.ip_version == IpVersion::V6;
        let mut build = |rules| -> Result<Vec<palisade_bpf::asm::Insn>> {
            let mut builder = Builder::new(&mut self.alloc, fds.ipsets, fds.state, fds.jump);
            if ipv6 {
                builder.enable_ipv6_mode();
            }
            builder.instructions(rules)
        };

        let ingress = build(&ep.ingress)?;
        let egress = build(&ep.egress)?;
        let xdp = ep.xdp.as_ref().map(&mut build).transpose()?;

        self.classifier
            .attach_program(&ep.iface_name, Direction::Ingress, &ingress)?;
        self.classifier
            .attach_program(&ep.iface_name, Direction::Egress, &egress)?;
        if let Some(xdp) = xdp {
            self.classifier.attach_xdp_program(&ep.iface_name, &xdp)?;
        } else {
            self.classifier.detach_xdp_program(&ep.iface_name)?;
        }
        Ok(())
    }

    fn program_chains(&mut self, key: &EndpointKey, ep: &ResolvedEndpoint) -> Result<()> {
        let desired: Vec<Chain> = self.renderer.endpoint_chains(ep);

        // Diff against only the chains this endpoint owns.
        let mut installed = HashMap::new();
        for name in self.chains_by_endpoint.get(key).into_iter().flatten() {
            if let Some(hashes) = self.installed_chains.get(name) {
                installed.insert(name.clone(), hashes.clone());
            }
        }

        let ops = table_delta(&installed, &desired);
        for op in &ops {
            if let Err(error) = apply_chain_op(&mut self.chains, op) {
                // The chain state is now unknown; forget the cached
                // hashes so the retry rewrites the chains wholesale.
                for chain in &desired {
                    self.installed_chains.remove(&chain.name);
                }
                if let Some(names) = self.chains_by_endpoint.remove(key) {
                    for name in names {
                        self.installed_chains.remove(&name);
                    }
                }
                return Err(error);
            }
        }

        for op in &ops {
            if let palisade_iptables::ChainOp::RemoveChain { name } = op {
                self.installed_chains.remove(name);
            }
        }
        for chain in &desired {
            self.installed_chains
                .insert(chain.name.clone(), chain.rule_hashes());
        }
        self.chains_by_endpoint
            .insert(key.clone(), desired.iter().map(|c| c.name.clone()).collect());
        Ok(())
    }

    fn unprogram_endpoint(&mut self, key: &EndpointKey) {
        let result = if self.bpf_enabled {
            self.detach_classifier(key)
        } else {
            self.remove_chains(key)
        };
        match result {
            Ok(()) => {
                self.retries.remove(key);
                if !self.endpoints.contains_key(key) {
                    self.iface_by_endpoint.remove(key);
                }
            }
            Err(error) => {
                tracing::warn!(endpoint = %key, %error, "dataplane teardown failed; will retry");
                self.schedule_retry(key.clone());
            }
        }
    }

    fn detach_classifier(&mut self, key: &EndpointKey) -> Result<()> {
        let Some(iface) = self.iface_by_endpoint.get(key).cloned() else {
            // Never programmed, nothing to detach.
            return Ok(());
        };
        self.classifier
            .detach_program(&iface, Direction::Ingress)?;
        self.classifier.detach_program(&iface, Direction::Egress)?;
        self.classifier.detach_xdp_program(&iface)
    }

    fn remove_chains(&mut self, key: &EndpointKey) -> Result<()> {
        let names = self.chains_by_endpoint.remove(key).unwrap_or_default();
        for name in names {
            apply_chain_op(
                &mut self.chains,
                &palisade_iptables::ChainOp::RemoveChain { name: name.clone() },
            )?;
            self.installed_chains.remove(&name);
        }
        Ok(())
    }

    fn reconcile_nat_outgoing(&mut self) {
        if self.bpf_enabled {
            return;
        }
        let active = self.dispatcher.ipsets().contains_set(MASQ_POOLS_SET);
        if active == self.nat_outgoing_active {
            return;
        }
        let chain = self.renderer.nat_outgoing_chain(active, IpVersion::V4);
        let installed = self
            .installed_chains
            .get(&chain.name)
            .cloned()
            .map(|hashes| {
                let mut m = HashMap::new();
                m.insert(chain.name.clone(), hashes);
                m
            })
            .unwrap_or_default();
        let ops = table_delta(&installed, std::slice::from_ref(&chain));
        for op in &ops {
            if let Err(error) = apply_chain_op(&mut self.chains, op) {
                tracing::warn!(%error, "NAT outgoing chain update failed; will retry");
                self.installed_chains.remove(&chain.name);
                return;
            }
        }
        self.installed_chains
            .insert(chain.name.clone(), chain.rule_hashes());
        self.nat_outgoing_active = active;
    }

    fn schedule_retry(&mut self, key: EndpointKey) {
        let retry = self.retries.entry(key).or_insert(Retry {
            delay: RETRY_INITIAL,
            next_attempt: Instant::now(),
        });
        retry.next_attempt = Instant::now() + retry.delay;
        retry.delay = (retry.delay * 2).min(RETRY_MAX);
    }
}
