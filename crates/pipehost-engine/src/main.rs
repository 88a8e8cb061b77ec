//! Pipehost - runs the built-in wordcount pipeline

use anyhow::{Context, Result};
use clap::Parser;
use pipehost_common::logging::{init_logging, LogConfig, LogLevel};
use pipehost_engine::wordcount::{self, WordCount};
use pipehost_engine::{
    Caller, DatabaseHandle, EngineSettings, InMemoryDatabase, Provisioner, TracingMessenger,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pipehost")]
#[command(author, version, about = "Self-scaling ETL pipeline host")]
struct Cli {
    /// Text file to count words in; reads the inline lines when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Lines to count when no input file is given
    #[arg(default_values_t = vec![
        "the quick brown fox".to_string(),
        "jumps over the lazy dog".to_string(),
    ])]
    lines: Vec<String>,

    /// Initial transform workers
    #[arg(long, default_value_t = 2)]
    transform_workers: u32,

    /// Initial load workers
    #[arg(long, default_value_t = 1)]
    load_workers: u32,

    /// Print the word tally as JSON when done
    #[arg(long, env = "PIPEHOST_PRINT_TALLY")]
    print_tally: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("pipehost")
        .build();
    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = init_logging(&log_config)?;

    let settings = EngineSettings::load()?;
    let (db, _db_task) =
        DatabaseHandle::spawn(InMemoryDatabase::new(settings.stats_history), &settings);
    db.ping().await.context("database subsystem did not answer")?;

    let lines = match &cli.input {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?
            .lines()
            .map(str::to_string)
            .collect(),
        None => cli.lines.clone(),
    };
    info!(lines = lines.len(), "Counting words");

    let provisioner = Provisioner::new(db, Arc::new(TracingMessenger));
    let words = Arc::new(WordCount::new(lines));
    provisioner.register_module(wordcount::MODULE, words.module())?;
    provisioner
        .put_config(
            wordcount::MODULE,
            WordCount::config(&settings).with_workers(cli.transform_workers, cli.load_workers),
        )
        .await?;
    provisioner.mount_module(wordcount::MODULE).await?;
    provisioner
        .mount_cluster(wordcount::MODULE, wordcount::CLUSTER)
        .await?;

    let mut done = provisioner.subscribe();
    let id = provisioner
        .provision(
            wordcount::MODULE,
            wordcount::CLUSTER,
            serde_json::json!({ "source": cli.input.as_ref().map(|p| p.display().to_string()) }),
            None,
            Caller::External,
        )
        .await?;
    info!(supervisor_id = id, "Run provisioned");

    let report = done.recv().await.context("run finished without a report")?;
    info!(
        supervisor_id = report.supervisor_id,
        crashed = report.crashed,
        elapsed_ms = report.elapsed.as_millis() as u64,
        statistics = %serde_json::to_string(&report.statistics)?,
        "Run complete"
    );

    let tally = words.tally();
    info!(distinct = tally.len(), total = tally.values().sum::<u64>(), "Word tally");
    if cli.print_tally {
        println!("{}", serde_json::to_string_pretty(&tally)?);
    }

    Ok(())
}
