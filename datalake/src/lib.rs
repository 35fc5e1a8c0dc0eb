pub mod processor;
pub mod schema;
pub mod storage;
pub mod utils;

use common::Result;
use common::config::{LoggingSettings, Settings};
use processor::{PipelineContext, PipelineProcessor, RecordSource, RunReport};
use storage::StorageManager;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_tracing(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(e) = installed {
        eprintln!("Tracing subscriber already installed: {}", e);
    }
}

/// Loads the config file at `config_path`, installs logging as it
/// configures, and runs the complete song-play pipeline.
pub async fn run_pipeline(config_path: &str) -> Result<RunReport> {
    let settings = Settings::new(config_path)?;
    init_tracing(&settings.logging);
    info!(config = config_path, "Starting pipeline");

    run_with_settings(&settings).await
}

pub async fn run_with_settings(settings: &Settings) -> Result<RunReport> {
    let pipeline = &settings.pipeline;
    let manager = StorageManager::new(settings.storage.clone());

    if settings.storage.verify_buckets {
        manager
            .verify_roots(&[pipeline.input_root.as_str(), pipeline.output_root.as_str()])
            .await?;
    }

    let input = manager.storage_for(&pipeline.input_root)?;
    let output = manager.storage_for(&pipeline.output_root)?;

    let catalog_source = RecordSource::new(input.clone(), &pipeline.song_data)?;
    let event_source = RecordSource::new(input, &pipeline.log_data)?;

    let processor = PipelineProcessor::new(PipelineContext::new(pipeline.batch_size)?, output);
    let report = processor.run(&catalog_source, &event_source).await?;

    if report.catalog_rejected + report.events_rejected > 0 {
        warn!(
            catalog_rejected = report.catalog_rejected,
            events_rejected = report.events_rejected,
            "Some input records were dropped"
        );
    }
    for table in &report.tables {
        info!(table = %table.table, rows = table.rows, files = table.files.len(), "Published");
    }

    Ok(report)
}
