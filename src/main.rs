use actix_server::ServerHandle;
use actix_web::{
    App, HttpServer,
    web::{self, Data},
};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info};
use serial_gateway::{
    api::Api,
    command::SystemCommandRunner,
    config::AppConfig,
    services::{
        bridge::{BridgeSupervisor, RestoreOutcome, SystemProcessControl},
        config_store::ConfigStore,
        network::{NetworkApplier, NetworkInspector, NetworkWatchdog},
    },
};
use std::{io::Write, sync::Arc};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::Mutex,
};

type GatewayApi = Api<SystemCommandRunner, SystemProcessControl<SystemCommandRunner>>;
type Supervisor = Arc<Mutex<BridgeSupervisor<SystemProcessControl<SystemCommandRunner>>>>;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let config = AppConfig::get();
    let runner = Arc::new(SystemCommandRunner);
    let store = Arc::new(ConfigStore::new(&config.paths.state_file));

    // 1. make the device reachable before anything else is exposed
    let outcome = NetworkWatchdog::new(
        NetworkInspector::new(runner.clone()),
        NetworkApplier::new(runner.clone()),
        store.clone(),
        config.watchdog.clone(),
    )
    .run_once()
    .await;
    info!("network watchdog finished: {outcome:?}");

    // 2. bring back the bridge that was running before power was lost
    let supervisor = Arc::new(Mutex::new(BridgeSupervisor::new(
        SystemProcessControl::new(runner.clone()),
        store.clone(),
        &config.bridge.executable,
    )));

    match supervisor.lock().await.restore_on_boot().await {
        RestoreOutcome::Started(status) if !status.running => {
            error!("bridge restore failed to start the bridge")
        }
        outcome => debug!("bridge restore: {outcome:?}"),
    }

    // 3. serve the control surface
    let api = GatewayApi::new(supervisor.clone(), runner, store, &config.bridge.device_dir);
    let (server_handle, server_task) = run_server(api)?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("ctrl-c received"),
        _ = sigterm.recv() => debug!("SIGTERM received"),
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
        },
    }

    info!("shutting down");
    shutdown(server_handle, supervisor).await;
    info!("shutdown complete");

    Ok(())
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

    info!(
        "module version: {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_SHORT_REV")
    );
}

fn run_server(
    api: GatewayApi,
) -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    let ui_port = AppConfig::get().ui.port;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(api.clone()))
            .route("/", web::get().to(GatewayApi::status))
            .route("/status", web::get().to(GatewayApi::status))
            .route("/bridge/start", web::post().to(GatewayApi::start_bridge))
            .route("/bridge/stop", web::post().to(GatewayApi::stop_bridge))
            .route("/devices", web::get().to(GatewayApi::devices))
            .route("/network", web::get().to(GatewayApi::network))
            .route("/network", web::post().to(GatewayApi::set_network))
            .route("/fallback", web::post().to(GatewayApi::set_fallback))
            .route("/version", web::get().to(GatewayApi::version))
    })
    .bind(("0.0.0.0", ui_port))
    .context("failed to bind server")?
    .disable_signals()
    .run();

    info!("listening on port {ui_port}");

    Ok((server.handle(), tokio::spawn(server)))
}

/// Stop serving and terminate the bridge; the persisted desired state is kept
/// so the bridge is restored on the next boot
async fn shutdown(server_handle: ServerHandle, supervisor: Supervisor) {
    server_handle.stop(true).await;
    supervisor.lock().await.shutdown().await;
}
