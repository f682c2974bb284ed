use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use llm_watch_pipeline::store::{AlertFilter, AlertStore};
use llm_watch_pipeline::{logging, metrics, rules, Event, MemoryStore, Pipeline, PipelineConfig, Severity};

#[derive(Parser)]
#[command(name = "llm-watch")]
#[command(version, about = "Replay LLM traffic events through the detection pipeline")]
struct Cli {
    /// Pipeline configuration (TOML or YAML). Defaults plus LLM_WATCH_* env when omitted.
    #[arg(long, env = "LLM_WATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Detection rule definitions (JSON array)
    #[arg(long)]
    rules: PathBuf,

    /// Alert rule definitions (JSON array)
    #[arg(long)]
    alert_rules: Option<PathBuf>,

    /// Events as JSON lines; reads stdin when omitted or "-"
    #[arg(long)]
    events: Option<PathBuf>,

    /// Print Prometheus metrics to stderr after the run
    #[arg(long)]
    print_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::from_env().context("loading config from environment")?,
    };
    logging::init(&config.logging);

    let store = Arc::new(MemoryStore::new());
    let pipeline = Arc::new(Pipeline::new(config, store.clone()).context("building pipeline")?);

    let defs = rules::load_definitions(&cli.rules).with_context(|| format!("reading {}", cli.rules.display()))?;
    let report = pipeline.publish_rules(defs).await;
    if report.accepted == 0 {
        tracing::warn!("no detection rules accepted; every event will score 0");
    }
    if let Some(path) = &cli.alert_rules {
        let defs = rules::load_definitions(path).with_context(|| format!("reading {}", path.display()))?;
        pipeline.publish_alert_rules(defs).await;
    }

    let (handle, mut processed) = pipeline.clone().start().await;
    let printer = tokio::spawn(async move {
        while let Some(p) = processed.recv().await {
            match serde_json::to_string(&p.assessment) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!(error = %e, "failed to encode assessment"),
            }
        }
    });

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &cli.events {
        Some(path) if path.as_os_str() != "-" => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        _ => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut lines = reader.lines();
    let mut line_no = 0u64;
    let mut malformed = 0u64;
    while let Some(line) = lines.next_line().await.context("reading events")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => handle.submit(event).await?,
            Err(e) => {
                malformed += 1;
                tracing::warn!(line = line_no, error = %e, "skipping malformed event");
            }
        }
    }

    let closed = handle.shutdown().await;
    printer.await.context("printer task")?;

    let alerts = store.list_alerts(&AlertFilter::default()).await?;
    let by_severity = |s: Severity| alerts.iter().filter(|a| a.severity == s).count();
    let summary = json!({
        "summary": {
            "events_read": line_no,
            "malformed": malformed,
            "sessions_closed": closed.len(),
            "alerts": alerts.len(),
            "critical": by_severity(Severity::Critical),
            "high": by_severity(Severity::High),
            "medium": by_severity(Severity::Medium),
            "low": by_severity(Severity::Low),
            "titles": alerts.iter().map(|a| &a.title).collect::<Vec<_>>(),
        }
    });
    println!("{}", summary);

    if cli.print_metrics {
        eprintln!("{}", metrics::gather());
    }
    Ok(())
}
