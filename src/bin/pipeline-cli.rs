use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde_json::Value;
use telemetry_pipeline::http::X_CORRELATION_ID;

#[derive(Parser)]
#[command(name = "pipeline-cli")]
#[command(about = "Operator CLI for the telemetry pipeline", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:3001")]
    url: String,

    /// Correlation id sent with the request (generated by the server if omitted)
    #[arg(short, long)]
    correlation_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check pipeline health
    Health,
    /// Print the raw Prometheus exposition
    Metrics,
    /// Print the aggregated metrics snapshot
    Snapshot,
    /// Post a batch JSON file to the ingestion endpoint
    Send {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let request = match &cli.command {
        Commands::Health => client.get(format!("{base}/health")),
        Commands::Metrics => client.get(format!("{base}/metrics")),
        Commands::Snapshot => client.get(format!("{base}/api/metrics")),
        Commands::Send { file } => {
            let body = std::fs::read(file)?;
            serde_json::from_slice::<Value>(&body)?;
            client
                .post(format!("{base}/api/frontend-metrics"))
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(body)
        }
    };

    let request = match &cli.correlation_id {
        Some(id) => request.header(X_CORRELATION_ID, HeaderValue::from_str(id)?),
        None => request,
    };

    let res = request.send().await?;
    if let Some(id) = res.headers().get(X_CORRELATION_ID).and_then(|v| v.to_str().ok()) {
        eprintln!("correlation id: {id}");
    }

    match cli.command {
        Commands::Metrics => print_text(res).await,
        _ => print_json(res).await,
    }
}

async fn print_text(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: pipeline returned status {}", status);
    }
    println!("{}", text);
    Ok(())
}

async fn print_json(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: pipeline returned status {}", status);
    }

    let text = res.text().await?;
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}
