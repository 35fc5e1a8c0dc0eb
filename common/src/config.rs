use config::{Config, ConfigError};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageSettings,
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    #[serde(default)]
    pub verify_buckets: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    pub input_root: String,
    pub output_root: String,
    #[serde(default = "default_song_data")]
    pub song_data: String,
    #[serde(default = "default_log_data")]
    pub log_data: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingSettings {
    #[serde(default)]
    pub json: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            access_key_id: String::new(),
            secret_key: String::new(),
            region: default_region(),
            endpoint: None,
            allow_http: false,
            verify_buckets: false,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_song_data() -> String {
    "song_data/*/*/*/*.json".to_string()
}

fn default_log_data() -> String {
    "log_data/*/*/*.json".to_string()
}

fn default_batch_size() -> usize {
    8192
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;

        // no credentials in logs
        debug!(
            input_root = %settings.pipeline.input_root,
            output_root = %settings.pipeline.output_root,
            region = %settings.storage.region,
            endpoint = ?settings.storage.endpoint,
            "Loaded pipeline settings"
        );

        Ok(settings)
    }
}
