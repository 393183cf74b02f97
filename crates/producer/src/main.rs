use anyhow::{Context, Result};
use bench_core::{Benchmark, Config, HttpSender, MessageSender, MockSender, RunSummary};
use clap::{CommandFactory, Parser};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "producer")]
#[command(about = "Message queue producer benchmark - saturates a topic and reports TPS and RT")]
struct Args {
    /// Optional TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Topic name
    #[arg(short = 't', long)]
    topic: Option<String>,

    /// Name server addresses, comma separated
    #[arg(short = 'n', long)]
    name_server: Option<String>,

    /// Producer group id
    #[arg(short = 'g', long)]
    group_id: Option<String>,

    /// Number of concurrent send loops
    #[arg(short = 'i', long)]
    instance_count: Option<u32>,

    /// Test duration in minutes
    #[arg(short = 'm', long)]
    test_minutes: Option<u64>,

    /// Message body size in bytes
    #[arg(short = 's', long)]
    body_size: Option<usize>,

    /// Sender mode: mock or http
    #[arg(long, default_value = "http")]
    mode: String,

    /// Give up a send loop after this many consecutive transport errors
    #[arg(long)]
    max_retries: Option<u32>,

    /// Pause before retrying a failed send, in milliseconds
    #[arg(long)]
    retry_backoff_ms: Option<u64>,

    /// Write the run summary as JSON into this directory
    #[arg(long)]
    results_dir: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        let producer = &mut config.producer;
        if let Some(topic) = &self.topic {
            producer.topic = topic.clone();
        }
        if let Some(name_server) = &self.name_server {
            producer.name_server = name_server.clone();
        }
        if let Some(group_id) = &self.group_id {
            producer.group_id = group_id.clone();
        }
        if let Some(instance_count) = self.instance_count {
            producer.instance_count = instance_count;
        }
        if let Some(test_minutes) = self.test_minutes {
            producer.test_minutes = test_minutes;
        }
        if let Some(body_size) = self.body_size {
            producer.body_size = body_size;
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = Some(max_retries);
        }
        if let Some(backoff_ms) = self.retry_backoff_ms {
            config.retry.backoff_ms = backoff_ms;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    args.apply(&mut config);

    if let Err(e) = config.validate() {
        eprintln!("{e}");
        Args::command().print_help()?;
        std::process::exit(2);
    }

    let sender: Arc<dyn MessageSender> = match args.mode.as_str() {
        "mock" => Arc::new(MockSender::new(5)), // 5ms simulated latency
        "http" => Arc::new(
            HttpSender::new(
                &config.producer.name_servers(),
                config.producer.send_timeout_ms,
            )
            .context("Failed to create HTTP sender")?,
        ),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };

    let test_duration = config.producer.test_duration();
    info!(
        "Running for {}s against {}",
        test_duration.as_secs(),
        config.producer.name_server
    );

    let summary = Benchmark::new(config, sender)
        .run(async move {
            tokio::select! {
                _ = tokio::time::sleep(test_duration) => info!("Test duration elapsed"),
                _ = shutdown_signal() => info!("Received stop signal"),
            }
        })
        .await?;

    if let Some(dir) = &args.results_dir {
        let path = write_summary(dir, &summary)?;
        info!("Results written to {}", path.display());
    }

    println!("TEST DONE");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn write_summary(dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create results dir {:?}", dir))?;
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("producer_{}_{}.json", summary.topic, timestamp));
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(&path, json)?;
    Ok(path)
}
