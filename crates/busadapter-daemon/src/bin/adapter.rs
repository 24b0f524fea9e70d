//! `bus-adapter`
//!
//! Runs the configured worker process, feeding it the subscribed bus
//! messages and publishing what it writes to stdout.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use busadapter_core::{ConsoleLogger, Settings};
use busadapter_daemon::Adapter;
use busadapter_daemon::runtime::{
    CommonArgs, Connections, build_logger, fatal, wait_for_shutdown,
};
use busadapter_daemon::worker::{ProcessService, WorkerEnv};

#[derive(Parser, Debug)]
#[command(name = "bus-adapter")]
#[command(version, about = "Run a worker process behind an MQTT bus")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    busadapter_core::tracing_init::init_tracing(&args.common.log_filter, args.common.log_json);

    let settings = match Settings::adapter(|name| std::env::var(name).ok()) {
        Ok(settings) => settings,
        Err(e) => fatal(&ConsoleLogger::default(), &format!("can't create config: {e}")),
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %settings.service_name,
        uuid = %settings.service_uuid,
        listener = %settings.listener_url,
        publisher = %settings.publisher_url,
        "Starting bus-adapter"
    );

    let logger = build_logger(&settings);
    let connections = match Connections::open(&settings, logger.clone()) {
        Ok(connections) => connections,
        Err(e) => fatal(logger.as_ref(), &format!("can't create MQTT client: {e}")),
    };
    logger.attach(connections.publisher());

    let service = ProcessService::new(
        settings.service_cmd_line.clone().unwrap_or_default(),
        WorkerEnv::from_settings(&settings),
        logger.clone(),
    );
    let adapter = Adapter::new(
        connections.listener(),
        connections.publisher(),
        settings.subscriptions.clone(),
        Arc::new(service),
        logger.clone(),
    );
    let done = match adapter.start().await {
        Ok(done) => done,
        Err(e) => fatal(logger.as_ref(), &format!("can't start adapter: {e}")),
    };

    wait_for_shutdown(done).await?;
    connections.close().await;
    info!("bus-adapter stopped");
    Ok(())
}
