//! Stageload - bulk-load NDJSON into the warehouse via S3 staging

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::info;

use stageload::{config::parse_max_errors, LoadPipeline, PipelineConfig, StampTransform};
use stageload_common::logging::{init_logging, LogConfig, LogLevel};
use stageload_common::types::parse_record;

#[derive(Parser, Debug)]
#[command(name = "stageload")]
#[command(author, version, about = "Stage NDJSON records in S3 and load them into the warehouse")]
struct Cli {
    /// NDJSON input file; reads stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Target table (overrides STAGELOAD_TABLE)
    #[arg(short, long)]
    table: Option<String>,

    /// Number of parallel shards (overrides STAGELOAD_SHARDS)
    #[arg(short, long)]
    shards: Option<usize>,

    /// Retries after a serializable-isolation conflict
    #[arg(long)]
    max_retries: Option<u32>,

    /// Malformed rows COPY tolerates; "none" omits the limit
    #[arg(long, value_parser = parse_max_errors_arg)]
    max_errors: Option<MaxErrors>,

    /// Add a generated `id` and a `received_at` timestamp to each record
    #[arg(long)]
    stamp: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy)]
struct MaxErrors(Option<u64>);

fn parse_max_errors_arg(raw: &str) -> Result<MaxErrors, String> {
    parse_max_errors(raw).map(MaxErrors).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flags.
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("stageload")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let mut config = PipelineConfig::from_env().context("Failed to load configuration")?;
    if let Some(table) = cli.table {
        config.warehouse.table = table;
    }
    if let Some(shards) = cli.shards {
        config.shards = shards;
    }
    if let Some(retries) = cli.max_retries {
        config.max_retries = retries;
    }
    if let Some(MaxErrors(max_errors)) = cli.max_errors {
        config.max_errors = max_errors;
    }

    let stamp = cli.stamp.then(|| stamp_transform(&config));
    let mut builder = LoadPipeline::from_config(config);
    if let Some(stamp) = stamp {
        builder = builder.transform(stamp);
    }
    let mut pipeline = builder.build()?;

    match &cli.input {
        Some(path) => {
            info!(input = %path.display(), "Reading records");
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            feed(&mut pipeline, BufReader::new(file)).await?;
        },
        None => {
            info!("Reading records from stdin");
            feed(&mut pipeline, BufReader::new(tokio::io::stdin())).await?;
        },
    }

    let report = pipeline.finish().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!(records = report.records, "Load complete");
    Ok(())
}

/// Stamp ids into the column the load replaces on.
fn stamp_transform(config: &PipelineConfig) -> StampTransform {
    StampTransform::with_id_column(config.warehouse.id_column.clone())
}

/// Write every non-blank NDJSON line of `reader` into the pipeline.
async fn feed<R>(pipeline: &mut LoadPipeline, reader: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_number = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record =
            parse_record(&line).with_context(|| format!("Invalid record on line {}", line_number))?;
        pipeline.write(record).await?;
    }

    Ok(())
}
