#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use palisade_agent::{
    args::Args,
    daemon::{Daemon, InboundMessage},
    effector::{IptablesCmdEffector, MapFds, ProgramStoreClassifier},
    ipcmd::IpCmdLinkNotifier,
};
use palisade_iface_monitor::InterfaceMonitor;
use palisade_iptables::{Config as RendererConfig, Renderer};
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Args::parse().validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();
    info!(?config, "starting dataplane agent");

    // The resource-watch client owns this sender; it stays alive for
    // the lifetime of the loop.
    let (resource_stream, inbound_rx) = mpsc::channel(100);
    let _resource_stream: mpsc::Sender<InboundMessage> = resource_stream;

    let (monitor_tx, monitor_rx) = mpsc::channel(100);
    let monitor = InterfaceMonitor::new(
        IpCmdLinkNotifier::new(),
        config.interface_excludes.clone(),
        monitor_tx,
    );
    tokio::spawn(monitor.run());

    let renderer = Renderer::new(RendererConfig {
        ipset_prefix: config.ipset_name_prefix.clone(),
        nat_port_range: config.nat_port_range,
        nat_outgoing_interface_filter: config.nat_outgoing_interface_filter.clone(),
        ..RendererConfig::default()
    });

    // Map descriptors are placeholders here; the kernel loader patches
    // map references when it loads the staged programs.
    let classifier = ProgramStoreClassifier::new(
        config.program_state_dir.clone(),
        MapFds {
            ipsets: 1,
            state: 2,
            jump: 3,
        },
    );
    let chains = IptablesCmdEffector::new_v4();

    let daemon = Daemon::new(
        classifier,
        chains,
        renderer,
        config.bpf_enabled,
        config.interface_include.clone(),
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    daemon.run(inbound_rx, monitor_rx, shutdown).await?;
    info!("clean shutdown");
    Ok(())
}
