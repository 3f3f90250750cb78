use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BrokerConfig {
    pub listen_address: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8030".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkerConfig {
    pub listen_address: String,
    pub broker_address: String,

    /// Address advertised to the broker for dial-back. Defaults to the
    /// locally bound address, which only works when broker and worker share
    /// a network.
    #[serde(default)]
    pub advertise_address: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8040".into(),
            broker_address: "127.0.0.1:8030".into(),
            advertise_address: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ControllerConfig {
    pub listen_address: String,
    pub broker_address: String,

    #[serde(default)]
    pub advertise_address: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8050".into(),
            broker_address: "127.0.0.1:8030".into(),
            advertise_address: None,
        }
    }
}

#[derive(Clone, Deserialize, Serialize, Default, Debug)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub backoff_unit_sec: u64,
    pub backoff_factor: u32,
    pub max_backoff_sec: u64,
    pub dismissible: bool,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug)]
pub struct LoggingConfig {
    #[serde_as(as = "DisplayFromStr")]
    pub max_level: tracing::Level,

    #[serde(default)]
    pub include_tokio: bool,

    #[serde(default)]
    pub include_gasket: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_level: tracing::Level::INFO,
            include_tokio: Default::default(),
            include_gasket: Default::default(),
        }
    }
}
