//! camlinkd: paired camera node and frame collector.
//!
//!   camlinkd [node]    boot, pair, hand off credentials, then stream
//!   camlinkd collect   receive chunk streams and rebuild frames

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};

use camlink_core::config::CamlinkConfig;
use camlink_services::monitor::NetworkMonitor;
use camlink_services::quality::QualityController;
use camlink_services::store::NAMESPACE;
use camlink_services::{
    BootError, BootOutcome, BootSettings, Bootstrap, BootstrapContext, ChunkSender, FileStore,
    FrameStreamer, Persistence, SendPolicy, StreamLoop, StreamPlan, StreamStatus, UdpSink,
};

mod camera;
mod collector;
mod identity;
mod link;
mod radio;
mod restart;
mod status;

use camera::CameraSource;
use radio::UdpRadio;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = CamlinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CamlinkConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CamlinkConfig::default()
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let mode = std::env::args().nth(1).unwrap_or_else(|| "node".to_string());
    match mode.as_str() {
        "node" => run_node(config, shutdown_tx).await,
        "collect" => run_collector(config, shutdown_tx).await,
        other => anyhow::bail!("unknown mode {other:?}, expected `node` or `collect`"),
    }
}

async fn run_node(config: CamlinkConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let own = identity::resolve(&config.identity)?;
    tracing::info!(identity = %own, "camlinkd starting");

    let camera = match CameraSource::open(&config.camera) {
        Ok(camera) => camera,
        Err(e) => {
            let e = BootError::from(e);
            tracing::error!(error = %e, "halting");
            return Err(e.into());
        }
    };

    let store = FileStore::open(&config.storage.dir, NAMESPACE)
        .with_context(|| format!("failed to open store in {}", config.storage.dir.display()))?;
    tracing::info!(path = %store.path().display(), "store opened");
    let persistence = Persistence::new(Arc::new(store));

    let radio = Arc::new(UdpRadio::bind(own, &config.radio)?);
    let ctx = Arc::new(BootstrapContext::new(own));
    let boot = Bootstrap::new(
        ctx.clone(),
        persistence,
        radio.clone(),
        BootSettings::from(&config),
    );
    let dispatcher = Arc::new(boot.dispatcher());
    let radio_task = tokio::spawn(radio.clone().receive_loop(dispatcher, shutdown_tx.subscribe()));

    let plan = match boot.run().await {
        Ok(BootOutcome::Stream(plan)) => plan,
        Ok(BootOutcome::Restart { reason, handoff }) => {
            tracing::info!(?reason, attempts = handoff.attempts, outcome = ?handoff.outcome, "boot finished, restarting");
            let _ = shutdown_tx.send(());
            return restart::restart_after(Duration::from_millis(config.handoff.restart_delay_ms)).await;
        }
        Err(e) => {
            tracing::error!(error = %e, "boot failed, halting");
            return Err(e.into());
        }
    };

    stream(config, plan, camera, ctx, radio_task, shutdown_tx).await
}

async fn stream(
    config: CamlinkConfig,
    plan: StreamPlan,
    camera: CameraSource,
    ctx: Arc<BootstrapContext>,
    radio_task: tokio::task::JoinHandle<Result<()>>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let collector = resolve_collector(&config.stream.collector, plan.remote_port).await?;
    tracing::info!(
        role = %plan.role,
        ssid = %plan.credentials.ssid,
        %collector,
        "streaming"
    );

    let socket = make_stream_socket(config.stream.send_buffer_bytes)
        .context("failed to create stream socket")?;
    let socket = UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")?;
    let sink = Arc::new(UdpSink::new(socket, collector));

    let sender = ChunkSender::new(config.stream.chunk_size, SendPolicy::from(&config.stream))?;
    let streamer = FrameStreamer::new(camera, sender);

    let (link_tx, link_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(StreamStatus::default());

    let link_task = tokio::spawn(
        link::LinkMonitor::new(
            collector,
            Duration::from_secs(config.network.link_check_secs),
            link_tx,
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let stream_task = tokio::spawn(
        StreamLoop::new(
            streamer,
            sink,
            QualityController::new(&config.quality),
            NetworkMonitor::new(&config.monitor),
            Duration::from_millis(config.stream.frame_interval_ms),
            link_rx,
            status_tx,
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    if config.network.api_port != 0 {
        let state = status::StatusState {
            identity: ctx.own_identity(),
            role: plan.role,
            peer: plan.peer.map(|p| p.address),
            collector,
            status_rx,
        };
        let port = config.network.api_port;
        tokio::spawn(async move {
            if let Err(e) = status::serve(state, port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = radio_task         => tracing::error!("radio task exited: {:?}", r),
        r = link_task          => tracing::error!("link monitor exited: {:?}", r),
        r = stream_task        => tracing::error!("stream task exited: {:?}", r),
    }

    Ok(())
}

async fn run_collector(config: CamlinkConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let c = &config.collector;
    anyhow::ensure!(!c.listen_ports.is_empty(), "collector.listen_ports is empty");
    let output_dir = (!c.output_dir.as_os_str().is_empty()).then(|| c.output_dir.clone());

    let mut tasks = tokio::task::JoinSet::new();
    for &port in &c.listen_ports {
        let collector = collector::Collector::bind(
            port,
            c.max_pending_frames,
            c.max_frame_bytes,
            output_dir.clone(),
            shutdown_tx.subscribe(),
        )
        .await?;
        tasks.spawn(collector.run());
    }

    while let Some(r) = tasks.join_next().await {
        match r {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "collector failed"),
            Err(e) => tracing::error!(error = %e, "collector task panicked"),
        }
    }
    Ok(())
}

async fn resolve_collector(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("cannot resolve collector {host:?}"))?;
    addrs
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("collector {host:?} has no IPv4 address"))
}

/// Non-blocking UDP socket with an enlarged send buffer, so a full buffer
/// surfaces as WouldBlock and the sender can back off.
fn make_stream_socket(send_buffer: usize) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    if let Err(e) = socket.set_send_buffer_size(send_buffer) {
        tracing::warn!(error = %e, send_buffer, "SO_SNDBUF not applied");
    }
    socket.set_nonblocking(true).context("O_NONBLOCK")?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&addr.into()).context("bind stream socket")?;
    Ok(socket)
}
