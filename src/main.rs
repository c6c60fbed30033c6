use color_eyre::{eyre::eyre, Result};
use mqtt_dashboard::config::Settings;
use mqtt_dashboard::mqtt::rumqtt::RumqttTransport;
use mqtt_dashboard::persistence::{ConfigStore, WidgetStore};
use mqtt_dashboard::{Dashboard, DashboardSettings};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    // Optional path to a settings file, otherwise the per-user default
    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::load(&path).await,
        None => Settings::load_default().await,
    }
    .map_err(|e| eyre!("Failed to load settings: {}", e))?;
    info!("Using data directory {}", settings.data_dir.display());

    let widgets = WidgetStore::open(settings.widgets_path())
        .await
        .map_err(|e| eyre!("Failed to open widget store: {}", e))?;
    let connections = ConfigStore::open(settings.connection_path(), settings.default_connection())
        .await
        .map_err(|e| eyre!("Failed to open connection store: {}", e))?;

    for widget in widgets.list() {
        info!("Widget {}", widget);
    }

    let transport = Arc::new(RumqttTransport::new(
        settings.request_capacity,
        settings.reconnect_delay(),
    ));
    let dashboard = Dashboard::start(
        transport,
        widgets.watch(),
        DashboardSettings {
            session: settings.session_settings(),
            subscribe_qos: settings.subscribe_qos,
            update_capacity: settings.notification_capacity,
        },
    );

    let config = connections.get().await;
    if config.host.is_empty() {
        warn!(
            "No broker configured, add one to {}",
            settings.connection_path().display()
        );
    } else if let Err(e) = dashboard.connect(config).await {
        error!("Initial connect failed: {}", e);
    }

    watch_dashboard(&dashboard).await;

    dashboard.shutdown().await;
    Ok(())
}

/// Logs widget updates, state changes and errors until ctrl-c
async fn watch_dashboard(dashboard: &Dashboard) {
    let mut updates = dashboard.widget_updates();
    let mut changes = dashboard.state_changes();
    let mut errors = dashboard.errors();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
                info!("Shutting down");
                break;
            }
            update = updates.recv() => match update {
                Ok(update) => info!("Widget {} <- {}", update.widget, update.message),
                Err(RecvError::Lagged(missed)) => warn!("Skipped {} widget updates", missed),
                Err(RecvError::Closed) => break,
            },
            change = changes.recv() => match change {
                Ok(change) => info!("Session is {}", change.state),
                Err(RecvError::Lagged(_)) => info!("Session is {}", dashboard.state()),
                Err(RecvError::Closed) => break,
            },
            event = errors.recv() => match event {
                Ok(event) => error!("{}", event),
                Err(RecvError::Lagged(missed)) => warn!("Skipped {} error events", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
