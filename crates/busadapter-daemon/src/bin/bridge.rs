//! `bus-bridge`
//!
//! Relays subscribed messages from the listener namespace into the
//! publisher namespace.

use clap::Parser;
use tracing::info;

use busadapter_core::{ConsoleLogger, Settings};
use busadapter_daemon::Bridge;
use busadapter_daemon::runtime::{
    CommonArgs, Connections, build_logger, fatal, wait_for_shutdown,
};

#[derive(Parser, Debug)]
#[command(name = "bus-bridge")]
#[command(version, about = "Relay MQTT messages between namespaces")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    busadapter_core::tracing_init::init_tracing(&args.common.log_filter, args.common.log_json);

    let settings = match Settings::bridge(|name| std::env::var(name).ok()) {
        Ok(settings) => settings,
        Err(e) => fatal(&ConsoleLogger::default(), &format!("can't create config: {e}")),
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        from = %settings.namespace_listener,
        to = %settings.namespace_publisher,
        "Starting bus-bridge"
    );

    let logger = build_logger(&settings);
    let connections = match Connections::open(&settings, logger.clone()) {
        Ok(connections) => connections,
        Err(e) => fatal(logger.as_ref(), &format!("can't create MQTT client: {e}")),
    };
    logger.attach(connections.publisher());

    let bridge = Bridge::new(
        connections.listener(),
        connections.publisher(),
        settings.namespace_listener.clone(),
        settings.namespace_publisher.clone(),
        settings.subscriptions.clone(),
        logger.clone(),
    );
    let done = match bridge.start().await {
        Ok(done) => done,
        Err(e) => fatal(logger.as_ref(), &format!("can't start bridge: {e}")),
    };

    wait_for_shutdown(done).await?;
    connections.close().await;
    info!("bus-bridge stopped");
    Ok(())
}
