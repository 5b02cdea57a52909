use crystal::config::Config;
use crystal::responder::IntentResponder;
use crystal::{shutdown, Server};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = config.responder_workers,
        model = %config.model,
        retrain = config.retrain,
        "Starting crystal server"
    );

    let responder = IntentResponder::open(
        &config.intents,
        &config.model_dir,
        &config.model,
        config.retrain,
    )?;
    let model = responder.model();
    info!(
        model = %model.name,
        intents = model.classes.len(),
        trained_at = %model.trained_at,
        "Intent model ready"
    );

    let server = Server::bind(&config, Arc::new(responder))?;
    info!(addr = %server.local_addr(), "Listening");

    shutdown::on_signals(server.shutdown_handle())?;

    if let Err(e) = server.run() {
        error!(error = %e, "Event loop failed");
        return Err(e.into());
    }

    info!("Server stopped");
    Ok(())
}
