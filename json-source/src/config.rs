use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::ingest::FailurePolicy;
use crate::sink::kafka::KafkaConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    /// Path of the log file to tail.
    pub source_filename: PathBuf,

    // Logged on startup only, schemas are resolved from the bootstrap set
    #[envconfig(default = "http://localhost:8081")]
    pub schema_registry_url: String,

    pub topic: NonEmptyString,

    pub json_source_connector_nodename: NonEmptyString,

    #[envconfig(default = "2000")]
    pub poll_interval_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub max_lines_per_cycle: usize, // 0 means no limit

    #[envconfig(default = "abort")]
    pub decode_failure_policy: FailurePolicy,

    #[envconfig(default = "json-source-offsets.json")]
    pub offset_store_path: PathBuf,

    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
