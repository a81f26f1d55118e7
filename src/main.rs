use color_eyre::Report;
use std::sync::Arc;
use tokio::spawn;
use tokio::sync::RwLock;
use tracing::{error, info};

use akvarium::detector::Detector;
use akvarium::docker::{Engine, SharedEngine};
use akvarium::lifecycle::Controller;
use akvarium::{config, db_connect, sweeper};

mod server;

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let args = argh::from_env::<config::Args>();
    let config = args.get_config()?;
    args.setup_logging()?;

    let db = db_connect(&config.database.url()).await?;
    db.migrate().await?;

    let controller = Controller::new(db.clone(), config.clone());
    controller.pool().seed(&config.docker).await?;

    // an unreachable engine is an operator problem to surface, not a crash;
    // requests fail until an admin fixes the config and reinitializes
    let engine: SharedEngine = Arc::new(RwLock::new(match Engine::connect(&config.docker).await {
        Ok(engine) => {
            info!("engine connected at {}", config.docker.api_url);
            Some(engine)
        }
        Err(e) => {
            error!("engine initialization failed: {e}");
            None
        }
    }));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let sweeper_handle = spawn(sweeper::run(
        db.clone(),
        engine.clone(),
        controller.clone(),
        config.clone(),
        shutdown_rx,
    ));

    let addr = config.server.http_server.parse()?;
    let state = Arc::new(server::AppState {
        detector: Detector::new(db.clone()),
        db,
        engine,
        controller,
        config,
    });
    let server_handle = spawn(async move { server::run(addr, state).await });

    tokio::signal::ctrl_c().await?;
    info!("shutting down, letting the sweeper finish its pass");
    shutdown_tx.send(true)?;
    let _ = sweeper_handle.await;
    server_handle.abort();

    Ok(())
}
