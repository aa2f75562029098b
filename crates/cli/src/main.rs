use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    milesguard_channels::{ChannelRegistry, NotificationChannel},
    milesguard_common::WatchEvent,
    milesguard_config::MilesguardConfig,
    milesguard_file_log::FileLogChannel,
    milesguard_telegram::TelegramChannel,
    milesguard_watcher::Watcher,
    milesguard_whatsapp::{SidecarConfig, SidecarProcess, SidecarTransport, start_sidecar},
    tokio::sync::mpsc::UnboundedReceiver,
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(
    name = "milesguard",
    version,
    about = "Watch WhatsApp groups for miles and points offers"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: ./milesguard.toml, then ~/.config/milesguard/).
    #[arg(long, global = true, env = "MILESGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the watcher until interrupted (default).
    Run,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "milesguard starting");

    match cli.command {
        None | Some(Commands::Run) => run(cli.config).await,
    }
}

async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = milesguard_config::load_runtime_config(config_path.as_deref())?;

    let mut sidecar = if config.whatsapp.auto_start_sidecar {
        let sidecar_config = SidecarConfig::from_config(&config.whatsapp)
            .context("failed to locate the WhatsApp sidecar")?;
        Some(
            start_sidecar(&sidecar_config)
                .await
                .context("failed to start the WhatsApp sidecar")?,
        )
    } else {
        None
    };

    let channels = build_channels(&config).await?;
    info!(channels = ?channels.names(), "notification channels registered");

    let transport = Arc::new(SidecarTransport::from_config(&config.whatsapp));
    let (watcher, events) = Watcher::start(config, transport, channels);
    let reporter = tokio::spawn(report_events(events));

    wait_for_shutdown_signal().await;
    watcher.shutdown().await;

    let status = watcher.status();
    info!(
        received = status.messages_received,
        relevant = status.messages_relevant,
        dispatched = status.dispatch.dispatched,
        uptime_secs = status.uptime_secs,
        "final status"
    );
    drop(watcher);
    if let Err(e) = reporter.await {
        warn!(error = %e, "event reporter failed");
    }

    if let Some(sidecar) = sidecar.as_mut() {
        stop_sidecar(sidecar).await;
    }
    info!("milesguard stopped");
    Ok(())
}

async fn build_channels(config: &MilesguardConfig) -> anyhow::Result<ChannelRegistry> {
    let mut registry = ChannelRegistry::new();

    let telegram = TelegramChannel::from_config(&config.channels.telegram)
        .context("failed to set up the Telegram channel")?;
    if telegram.is_enabled()
        && telegram.is_configured()
        && let Err(e) = telegram.verify().await
    {
        warn!(error = %e, "telegram bot verification failed, notifications may not arrive");
    }
    registry.register(Arc::new(telegram));

    if config.channels.file.enabled {
        registry.register(Arc::new(FileLogChannel::from_config(&config.channels.file)));
    }
    Ok(registry)
}

async fn stop_sidecar(sidecar: &mut SidecarProcess) {
    if sidecar.is_running() {
        sidecar.stop().await;
    }
}

/// Log every host event until the watcher drops its senders.
async fn report_events(mut events: UnboundedReceiver<WatchEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            WatchEvent::CredentialRequired { qr } => {
                warn!(event = event.name(), "scan this pairing code in WhatsApp: {qr}");
            },
            WatchEvent::ConnectionFailed { reason, attempts } => {
                error!(event = event.name(), ?reason, attempts, "WhatsApp connection failed");
            },
            WatchEvent::MessageRelevant { message } => info!(
                event = event.name(),
                message_id = message.id(),
                group = message.message.conversation_name(),
                keywords = ?message.matched_keywords,
                "relevant message"
            ),
            _ => match serde_json::to_string(&event) {
                Ok(json) => info!(event = event.name(), "{json}"),
                Err(e) => warn!(event = event.name(), error = %e, "failed to serialize event"),
            },
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c().await;
            },
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }

    info!("shutdown signal received");
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c, shutting down");
    }
}
