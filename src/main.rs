//! docfeed - Feed Documents to a Remote Index
//!
//! Reads a TOML configuration and a JSONL file of documents (one upsert per
//! line, `documentId` plus arbitrary metadata fields), batches them under
//! the configured size budget, and publishes each batch through the
//! container rotation workflow.
//!
//! ```text
//! docfeed <config.toml> <documents.jsonl>
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | DOCFEED_BASE_URL | Override the index API base URL |
//! | DOCFEED_API_KEY | Override the bearer token |
//! | DOCFEED_SOURCE_ID | Override the target source |
//! | DOCFEED_MAX_QUEUE_SIZE | Override the batch size budget, in bytes |
//! | RUST_LOG | Log filter (default `info`) |

use docfeed::{ContainerRotator, Document, FeedConfig, HttpControlPlane, PushQueue};
use std::path::Path;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (config_path, input_path) = match (args.next(), args.next()) {
        (Some(config), Some(input)) => (config, input),
        _ => {
            eprintln!("usage: docfeed <config.toml> <documents.jsonl>");
            std::process::exit(2);
        }
    };

    let config = FeedConfig::from_toml_file(Path::new(&config_path))?.apply_env()?;
    if !config.api.is_complete() {
        return Err("base_url, api_key, and source_id must all be configured".into());
    }

    info!(
        source_id = %config.api.source_id,
        max_queue_size = config.queue.max_queue_size,
        "starting feed"
    );

    let control = HttpControlPlane::new(
        config.api.base_url.clone(),
        config.api.api_key.clone(),
        config.backoff.clone(),
    );
    let rotator = ContainerRotator::new(control, config.api.source_id.clone());
    let mut queue = PushQueue::new(&config.queue, rotator)?;

    let text = std::fs::read_to_string(&input_path)?;
    let mut fed = 0usize;
    let mut skipped = 0usize;
    for (line_number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let document: Document = match serde_json::from_str(line) {
            Ok(document) => document,
            Err(e) => {
                error!(line = line_number + 1, error = %e, "skipping unparseable document");
                skipped += 1;
                continue;
            }
        };
        queue.add_document(document).await?;
        fed += 1;
    }
    queue.flush().await?;

    info!(documents = fed, skipped, "feed complete");
    Ok(())
}
