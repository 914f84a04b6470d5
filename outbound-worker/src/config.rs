use std::str::FromStr;

use envconfig::Envconfig;

use outbound_common::config::{
    CacheConfig, ConsumerConfig, EnrichmentConfig, EnvMsDuration, KafkaConfig, StorageConfig,
    TokenizerConfig,
};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "stream")]
    pub mode: Mode,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested = true)]
    pub tokenizer: TokenizerConfig,

    #[envconfig(nested = true)]
    pub cache: CacheConfig,

    #[envconfig(nested = true)]
    pub enrichment: EnrichmentConfig,

    #[envconfig(nested = true)]
    pub storage: StorageConfig,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(from = "KAFKA_TARGET_TOPIC", default = "cdc_changes_outbound")]
    pub kafka_target_topic: String,

    // Upper bound on the delivery of one broker call, every ack included
    #[envconfig(default = "30000")]
    pub broker_batch_timeout: EnvMsDuration,

    // Largest number of messages handed to the producer in one call
    #[envconfig(default = "100")]
    pub broker_max_batch_size: usize,

    #[envconfig(default = "500")]
    pub batch_size: usize,

    // How long to wait for a batch to fill up before processing it anyway
    #[envconfig(default = "1000")]
    pub batch_linger: EnvMsDuration,

    #[envconfig(default = "true")]
    pub filter_test_accounts: bool,

    #[envconfig(default = "export.jsonl")]
    pub bulk_file_path: String,

    #[envconfig(default = "60000")]
    pub liveness_deadline: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "100000")]
    pub maximum_interval: EnvMsDuration,

    // 0 means unlimited retries
    #[envconfig(default = "0")]
    pub max_attempts: u32,
}

/// What the worker feeds the pipeline with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Consume the change stream and publish with fallback.
    Stream,
    /// Publish a newline-delimited JSON export, with an audit trail.
    Bulk,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseModeError(String);

impl std::fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} is not a valid mode, expected stream or bulk", self.0)
    }
}

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stream" => Ok(Mode::Stream),
            "bulk" => Ok(Mode::Bulk),
            invalid => Err(ParseModeError(invalid.to_owned())),
        }
    }
}
