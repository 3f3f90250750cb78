use std::path::PathBuf;

use miette::Result;
use tracing::info;

use lattica::prelude::*;
use lattica::worker::{Driver, Exit};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Port to listen on for halo and control traffic.
    #[arg(long, short)]
    port: Option<u16>,

    /// Broker address to register with.
    #[arg(long, short)]
    broker: Option<String>,

    /// Address advertised to the broker for dial-back. Defaults to the
    /// locally bound address.
    #[arg(long)]
    advertise: Option<String>,

    /// Path to an alternative config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
pub async fn run(args: &Args) -> Result<()> {
    let mut config = crate::common::load_config(&args.config)?;

    if let Some(port) = args.port {
        config.worker.listen_address = format!("0.0.0.0:{port}");
    }

    if let Some(broker) = &args.broker {
        config.worker.broker_address = broker.clone();
    }

    if let Some(advertise) = &args.advertise {
        config.worker.advertise_address = Some(advertise.clone());
    }

    crate::common::setup_tracing(&config.logging)?;

    let exit = crate::common::hook_exit_token();
    let policy = crate::common::define_gasket_policy(&config.retries);

    let driver = Driver::connect(&config.worker, exit).await?;
    let id = driver.id();
    let control = driver.control();

    match driver.run(policy).await? {
        Exit::BrokerShutdown => info!("stopped by broker"),
        Exit::Cancelled => {
            // voluntary exit owes the broker a goodbye
            let _ = control.call(Request::WorkerDisconnect { id }).await;
            info!("deregistered from broker");
        }
    }

    Ok(())
}
