use std::path::PathBuf;

use miette::Result;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Port to listen on for controller and worker connections.
    #[arg(long, short)]
    port: Option<u16>,

    /// Path to an alternative config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
pub async fn run(args: &Args) -> Result<()> {
    let mut config = crate::common::load_config(&args.config)?;

    if let Some(port) = args.port {
        config.broker.listen_address = format!("0.0.0.0:{port}");
    }

    crate::common::setup_tracing(&config.logging)?;

    let exit = crate::common::hook_exit_token();
    let policy = crate::common::define_gasket_policy(&config.retries);

    let driver = lattica::broker::Driver::bind(&config.broker, exit).await?;
    driver.run(policy).await?;

    Ok(())
}
