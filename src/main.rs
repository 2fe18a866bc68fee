//! `pinbridge` binary.
//!
//! Connects to the MQTT broker first, then to the device server, brings the
//! session up and bridges until the session ends or Ctrl-C is pressed.

mod cli;

use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use pinbridge::{
    BridgeConfig,
    MessageBus,
    MqttBus,
    MqttSettings,
    Session,
    SessionConfig,
    SessionEnd,
    TopicMapping,
    transport::{self, ServerAddress, SocketOptions},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

const BUS_QUEUE_CAPACITY: usize = 64;

fn init_tracing(dump: bool) {
    let default = if dump { "debug,rumqttc=info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_from(cli: &Cli) -> BridgeConfig {
    let mapping = if cli.mappings.is_empty() {
        TopicMapping::with_defaults(&cli.topic)
    } else {
        TopicMapping::new(&cli.topic, cli.mappings.iter().cloned())
    };
    let mut session = SessionConfig::new(cli.token.clone(), mapping);
    session.bridges.clone_from(&cli.bridges);
    session.heartbeat_period = Duration::from_secs(cli.heartbeat_secs);
    session.response_timeout = Duration::from_millis(cli.response_timeout_ms);
    session.max_missed_heartbeats = cli.max_missed_heartbeats.map(std::num::NonZeroU32::get);
    session.max_send_rate = cli.max_send_rate;

    let mut socket = SocketOptions::default().nodelay(cli.nodelay);
    if let Some(size) = cli.sndbuf.filter(|size| *size > 0) {
        socket = socket.send_buffer_size(size);
    }
    if let Some(size) = cli.rcvbuf.filter(|size| *size > 0) {
        socket = socket.recv_buffer_size(size);
    }

    BridgeConfig {
        server: ServerAddress::new(cli.server.clone(), cli.port),
        socket,
        connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
        mqtt: MqttSettings {
            host: cli.mqtt_server.clone(),
            port: cli.mqtt_port,
            client_id: cli.mqtt_client_id.clone(),
            ..MqttSettings::default()
        },
        session,
        dump: cli.dump,
        metrics_addr: cli.metrics_addr,
    }
}

async fn run(config: BridgeConfig) -> pinbridge::Result<SessionEnd> {
    #[cfg(feature = "metrics")]
    if let Some(addr) = config.metrics_addr {
        match pinbridge::metrics::install_exporter(addr) {
            Ok(()) => info!(%addr, "serving metrics"),
            Err(e) => warn!(%addr, error = %e, "metrics exporter not installed"),
        }
    }
    #[cfg(not(feature = "metrics"))]
    if config.metrics_addr.is_some() {
        warn!("built without metrics support; --metrics-addr ignored");
    }

    let (bus, pump) = MqttBus::connect(&config.mqtt).await?;
    let bus = Arc::new(bus);
    bus.subscribe(&config.session.mapping.subscription()).await?;

    info!(server = %config.server, dump = config.dump, "connecting to device server");
    let stream = transport::connect(&config.server, config.socket, config.connect_timeout).await?;
    let mut session = Session::new(config.session, stream);
    session.establish().await?;
    let handle = session.start(bus)?;

    let (inbound_tx, inbound_rx) = mpsc::channel(BUS_QUEUE_CAPACITY);
    let pump_stop = CancellationToken::new();
    let pump_task = tokio::spawn(pump.run(inbound_tx, pump_stop.clone()));
    let router_task = tokio::spawn(handle.router().run(inbound_rx, handle.shutdown_token()));

    let shutdown = handle.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            shutdown.cancel();
        }
    });

    let end = handle.closed().await;
    pump_stop.cancel();
    if let Err(e) = pump_task.await {
        warn!(error = %e, "bus pump task failed");
    }
    if let Err(e) = router_task.await {
        warn!(error = %e, "router task failed");
    }
    Ok(end)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.dump);

    let config = config_from(&cli);
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::from(2);
    }

    match run(config).await {
        Ok(end) if end.is_requested() => ExitCode::SUCCESS,
        Ok(end) => {
            error!(%end, "session ended");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "bridge failed");
            ExitCode::FAILURE
        }
    }
}
