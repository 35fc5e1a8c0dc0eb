use anyhow::Context;
use clap::{Arg, Command};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let matches = Command::new("datalake-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Builds the song-play star schema from song and event logs")
        .subcommand(
            Command::new("run")
                .about("Rebuild every output table from the configured inputs")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .default_value("config/datalake.toml")
                        .help("Sets a custom config file"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("run", run_matches)) => {
            let config_path = run_matches
                .get_one::<String>("config")
                .map(|s| s.as_str())
                .unwrap_or("config/datalake.toml");

            if let Err(e) = run(config_path).await {
                error!("Pipeline failed: {:#}", e);
                eprintln!("Pipeline error: {:#}", e);
                process::exit(1);
            }
        }
        _ => {
            println!("No subcommand specified. Use --help for usage information.");
            process::exit(1);
        }
    }
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    let report = datalake::run_pipeline(config_path)
        .await
        .with_context(|| format!("pipeline run with {} failed", config_path))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
