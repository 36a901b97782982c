//! Flap damping for address and link updates.
//!
//! Some DHCP clients remove and re-add an interface address during a
//! renewal. Deletions are therefore held back briefly; if the matching
//! addition arrives inside the window, both are suppressed. Additions
//! with nothing queued short-circuit straight to the output.

use crate::{AddrUpdate, LinkUpdate};
use ahash::AHashMap as HashMap;
use std::collections::VecDeque;
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};

pub(crate) const FLAP_DAMPING_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum Queued {
    Link(LinkUpdate),
    Addr(AddrUpdate),
}

#[derive(Debug)]
struct Timestamped {
    ready_at: Instant,
    update: Queued,
}

/// Interposes the damper between the raw kernel channels and the
/// monitor. The returned channels deliver the filtered updates.
pub(crate) fn damp(
    mut link_in: mpsc::Receiver<LinkUpdate>,
    mut addr_in: mpsc::Receiver<AddrUpdate>,
) -> (mpsc::Receiver<LinkUpdate>, mpsc::Receiver<AddrUpdate>) {
    let (link_tx, link_out) = mpsc::channel(10);
    let (addr_tx, addr_out) = mpsc::channel(10);

    tokio::spawn(async move {
        let mut queues: HashMap<u32, VecDeque<Timestamped>> = HashMap::new();

        loop {
            let next_ready = queues
                .values()
                .filter_map(|q| q.front())
                .map(|t| t.ready_at)
                .min();
            let timer = async {
                match next_ready {
                    Some(at) => time::sleep_until(at).await,
                    None => futures::future::pending().await,
                }
            };

            tokio::select! {
                link = link_in.recv() => {
                    let Some(link) = link else { break };
                    let queue = queues.entry(link.index).or_default();
                    if queue.is_empty() {
                        if link_tx.send(link).await.is_err() {
                            return;
                        }
                    } else {
                        queue.push_back(Timestamped {
                            ready_at: Instant::now() + FLAP_DAMPING_DELAY,
                            update: Queued::Link(link),
                        });
                    }
                }
                addr = addr_in.recv() => {
                    let Some(addr) = addr else { break };
                    let queue = queues.entry(addr.index).or_default();

                    let mut ready_at = if addr.exists {
                        if queue.is_empty() {
                            // Nothing pending for this interface; no
                            // flap to resolve.
                            if addr_tx.send(addr).await.is_err() {
                                return;
                            }
                            continue;
                        }
                        Instant::now()
                    } else {
                        Instant::now() + FLAP_DAMPING_DELAY
                    };

                    // A new update for an address squashes the queued
                    // one; keeping the earliest ready time stops a
                    // sustained flap from stalling updates forever.
                    queue.retain(|queued| match &queued.update {
                        Queued::Addr(pending) if pending.addr == addr.addr => {
                            ready_at = queued.ready_at;
                            false
                        }
                        _ => true,
                    });
                    queue.push_back(Timestamped {
                        ready_at,
                        update: Queued::Addr(addr),
                    });
                }
                _ = timer, if next_ready.is_some() => {}
            }

            // Flush everything whose damping window has expired.
            let now = Instant::now();
            let mut closed = false;
            for queue in queues.values_mut() {
                while queue.front().map(|t| t.ready_at <= now).unwrap_or(false) {
                    match queue.pop_front().unwrap().update {
                        Queued::Link(link) => {
                            if link_tx.send(link).await.is_err() {
                                closed = true;
                            }
                        }
                        Queued::Addr(addr) => {
                            if addr_tx.send(addr).await.is_err() {
                                closed = true;
                            }
                        }
                    }
                }
            }
            if closed {
                return;
            }
            queues.retain(|_, q| !q.is_empty());
        }
    });

    (link_out, addr_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(index: u32, addr: &str, exists: bool) -> AddrUpdate {
        AddrUpdate {
            index,
            addr: addr.parse().unwrap(),
            exists,
        }
    }

    async fn advance(duration: Duration) {
        // Yield first so the damper task observes pending sends.
        tokio::task::yield_now().await;
        time::advance(duration).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn add_remove_add_collapses_to_one_add() {
        let (link_tx, link_rx) = mpsc::channel(10);
        let (addr_tx, addr_rx) = mpsc::channel(10);
        let (_links, mut addrs) = damp(link_rx, addr_rx);
        let _keep_link_tx = link_tx;

        addr_tx.send(addr(1, "10.0.0.5", true)).await.unwrap();
        advance(Duration::from_millis(1)).await;
        assert!(addrs.try_recv().is_ok(), "first add short-circuits");

        addr_tx.send(addr(1, "10.0.0.5", false)).await.unwrap();
        advance(Duration::from_millis(20)).await;
        assert!(addrs.try_recv().is_err(), "deletion is held back");

        addr_tx.send(addr(1, "10.0.0.5", true)).await.unwrap();
        advance(Duration::from_millis(500)).await;

        // The re-add resolved the flap; both queued updates squashed
        // into one add.
        let update = addrs.try_recv().expect("one update expected");
        assert!(update.exists);
        assert!(addrs.try_recv().is_err(), "no further updates");
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_deletion_is_delivered_after_the_window() {
        let (_link_tx, link_rx) = mpsc::channel::<LinkUpdate>(10);
        let (addr_tx, addr_rx) = mpsc::channel(10);
        let (_links, mut addrs) = damp(link_rx, addr_rx);

        addr_tx.send(addr(1, "10.0.0.5", false)).await.unwrap();
        advance(Duration::from_millis(20)).await;
        assert!(addrs.try_recv().is_err());

        advance(Duration::from_millis(200)).await;
        let update = addrs.try_recv().expect("deletion delivered");
        assert!(!update.exists);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_flapping_cannot_stall_updates_forever() {
        let (_link_tx, link_rx) = mpsc::channel::<LinkUpdate>(10);
        let (addr_tx, addr_rx) = mpsc::channel(10);
        let (_links, mut addrs) = damp(link_rx, addr_rx);

        // Start a flap and keep re-triggering it within the window.
        addr_tx.send(addr(1, "10.0.0.5", false)).await.unwrap();
        for _ in 0..5 {
            advance(Duration::from_millis(40)).await;
            addr_tx.send(addr(1, "10.0.0.5", true)).await.unwrap();
            advance(Duration::from_millis(40)).await;
            addr_tx.send(addr(1, "10.0.0.5", false)).await.unwrap();
        }

        // The earliest ready timestamp survives the squashing, so the
        // queue drains despite the continuing flap.
        advance(Duration::from_millis(40)).await;
        assert!(
            addrs.try_recv().is_ok(),
            "pending update delivered despite flapping"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn different_addresses_do_not_suppress_each_other() {
        let (_link_tx, link_rx) = mpsc::channel::<LinkUpdate>(10);
        let (addr_tx, addr_rx) = mpsc::channel(10);
        let (_links, mut addrs) = damp(link_rx, addr_rx);

        addr_tx.send(addr(1, "10.0.0.5", false)).await.unwrap();
        addr_tx.send(addr(1, "10.0.0.6", true)).await.unwrap();
        advance(Duration::from_millis(200)).await;

        let first = addrs.try_recv().expect("deletion delivered");
        assert_eq!(first.addr, "10.0.0.5".parse::<std::net::IpAddr>().unwrap());
        let second = addrs.try_recv().expect("addition delivered");
        assert_eq!(second.addr, "10.0.0.6".parse::<std::net::IpAddr>().unwrap());
    }
}
