use anyhow::{Context, Result, bail};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info, warn};
use plant_link::{
    backend_client::{BackendApi, DeviceRegistration, HttpBackendClient},
    config::AppConfig,
    device_client::HttpDeviceTransport,
    services::{
        connectivity::ConnectivityMonitor,
        offline_queue::OfflineQueue,
        provisioning::{ProvisioningOutcome, ProvisioningSession},
        sync::SyncEngine,
    },
    session::PersistedSession,
    storage::{JsonStore, SavedNetworks},
};
use std::{env, io::Write, sync::Arc};
use tokio::signal::unix::{SignalKind, signal};

#[tokio::main]
async fn main() {
    initialize();

    if let Err(e) = run().await {
        error!("{e:#}");
        std::process::exit(1);
    }

    debug!("good bye");
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}

async fn run() -> Result<()> {
    let config = AppConfig::get();
    let command = env::args().nth(1).unwrap_or_else(|| "watch".to_string());

    let store = JsonStore::new(&config.paths.data_dir)?;
    let tokens = PersistedSession::new(store.clone());
    let backend = HttpBackendClient::new(
        &config.backend.url,
        config.timing.request_timeout,
        tokens.clone(),
    )?;

    match command.as_str() {
        "provision" => provision(config, store, backend, tokens).await,
        "sync" => {
            let queue = Arc::new(OfflineQueue::new(store));
            let engine = SyncEngine::new(backend, queue, config.sync());
            let result = engine.replay_all().await?;

            info!(
                "synced {} of {} operations",
                result.successful_operations, result.total_operations
            );
            for e in &result.errors {
                warn!("{} failed: {}", e.operation_id, e.error);
            }
            if !result.stale_operations.is_empty() {
                warn!(
                    "{} synced operations could not be removed and will be sent again",
                    result.stale_operations.len()
                );
            }
            if !result.success {
                bail!("{} operations remain queued", result.failed_operations);
            }
            Ok(())
        }
        "watch" => watch(config, store, backend).await,
        other => bail!("unknown command {other:?}, expected provision, sync or watch"),
    }
}

async fn provision(
    config: &AppConfig,
    store: JsonStore,
    backend: HttpBackendClient<PersistedSession>,
    tokens: PersistedSession,
) -> Result<()> {
    let provisioning = config.provisioning();
    let device_id = provisioning.device_id.clone();
    let transport = HttpDeviceTransport::new(provisioning.request_timeout)?;
    let networks = Arc::new(SavedNetworks::new(store));
    let session = ProvisioningSession::new(
        provisioning,
        transport,
        backend.clone(),
        tokens,
        networks,
    );

    let mut updates = session.subscribe();
    let reporter = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            match &snapshot.error {
                Some(e) => info!("provisioning {}: {e}", snapshot.status),
                None => info!("provisioning {}", snapshot.status),
            }
        }
    });

    session.begin().await;

    let outcome = tokio::select! {
        outcome = session.submit_credentials(&config.wifi.ssid, &config.wifi.password) => outcome,
        _ = tokio::signal::ctrl_c() => {
            debug!("ctrl-c");
            session.close();
            return Ok(());
        }
    };

    drop(session);
    reporter.await.context("failed to join status reporter")?;

    match outcome? {
        ProvisioningOutcome::Confirmed {
            ip,
            token_delivered,
        } => {
            info!("device joined the network at {ip}");
            if !token_delivered {
                warn!("device may not have received the backend token");
            }

            let registration = DeviceRegistration {
                device_name: device_id.clone(),
                device_id,
            };
            if let Err(e) = backend.register_device(&registration).await {
                warn!("failed to register device: {e}");
            }
        }
        ProvisioningOutcome::Unconfirmed => {
            warn!("device did not confirm the connection, check the Wi-Fi credentials if it stays offline");
        }
    }

    Ok(())
}

async fn watch(
    config: &AppConfig,
    store: JsonStore,
    backend: HttpBackendClient<PersistedSession>,
) -> Result<()> {
    let queue = Arc::new(OfflineQueue::new(store));
    let pending = queue.pending_count()?;
    info!("{pending} operations pending");

    let monitor = ConnectivityMonitor::new(backend.clone(), config.connectivity());
    let engine = Arc::new(SyncEngine::new(backend, queue, config.sync()));
    let connectivity = monitor.subscribe();

    let monitor_task = tokio::spawn(monitor.run());
    let engine_task = tokio::spawn(engine.run(connectivity));

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("ctrl-c"),
        _ = sigterm.recv() => debug!("SIGTERM"),
    }

    monitor_task.abort();
    engine_task.abort();

    Ok(())
}
