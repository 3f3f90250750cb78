use std::path::PathBuf;
use std::time::Duration;

use miette::{Context as _, IntoDiagnostic};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{filter::Targets, prelude::*};

use lattica::prelude::{
    BrokerConfig, ControllerConfig, LoggingConfig, RetryConfig, WorkerConfig,
};

#[derive(Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub retries: Option<RetryConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

pub fn load_config(explicit: &Option<PathBuf>) -> miette::Result<Config> {
    let mut settings = config::Config::builder();

    settings = match explicit {
        Some(path) => settings.add_source(
            config::File::with_name(path.to_str().unwrap_or_default()).required(true),
        ),
        None => settings.add_source(config::File::with_name("lattica.toml").required(false)),
    };

    settings
        .add_source(config::Environment::with_prefix("LATTICA"))
        .build()
        .into_diagnostic()?
        .try_deserialize()
        .into_diagnostic()
        .context("loading configuration")
}

pub fn setup_tracing(config: &LoggingConfig) -> miette::Result<()> {
    let level = config.max_level;

    let mut filter = Targets::new().with_target("lattica", level);

    if config.include_gasket {
        filter = filter.with_target("gasket", level);
    }

    if config.include_tokio {
        filter = filter.with_target("tokio", level);
    }

    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish()
        .with(filter)
        .init();

    Ok(())
}

pub fn hook_exit_token() -> CancellationToken {
    let cancel = CancellationToken::new();

    let hooked = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        warn!("exit requested");
        hooked.cancel();
    });

    cancel
}

pub fn define_gasket_policy(config: &Option<RetryConfig>) -> gasket::runtime::Policy {
    let default_retries = gasket::retries::Policy {
        max_retries: 20,
        backoff_unit: Duration::from_secs(1),
        backoff_factor: 2,
        max_backoff: Duration::from_secs(60),
        dismissible: false,
    };

    let retries = match config {
        Some(config) => gasket::retries::Policy {
            max_retries: config.max_retries,
            backoff_unit: Duration::from_secs(config.backoff_unit_sec),
            backoff_factor: config.backoff_factor,
            max_backoff: Duration::from_secs(config.max_backoff_sec),
            dismissible: config.dismissible,
        },
        None => default_retries,
    };

    gasket::runtime::Policy {
        // generous tick timeout, stages legitimately block on halo awaits
        tick_timeout: Duration::from_secs(600).into(),
        bootstrap_retry: retries.clone(),
        work_retry: retries.clone(),
        teardown_retry: retries.clone(),
    }
}
