use std::sync::Arc;
use std::time::Duration;

use bincode::{Decode, Encode};
use jobqueue_mongodb::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Encode, Decode)]
struct TranslateArticle {
    article_id: u64,
    target_language: String,
}

struct Translator;

#[async_trait]
impl JobProcessor for Translator {
    fn job_types(&self) -> Vec<String> {
        vec!["translate_article".into()]
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(120))
    }

    async fn process_job(&self, job: &Job, cancellation: CancellationToken) -> anyhow::Result<()> {
        let payload: TranslateArticle = job.decode_payload()?;
        tracing::info!(?payload, attempt = job.attempts, "translating article");
        tokio::select! {
            _ = cancellation.cancelled() => anyhow::bail!("translation cancelled"),
            _ = tokio::time::sleep(Duration::from_millis(200)) => Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let uri = std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017/queues".into());
    let cert_file = std::env::var("MONGODB_CA_FILE").ok();
    let workers = std::env::var("JOBQUEUE_WORKERS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(4);

    let queue = MongoDbQueue::new(&uri, cert_file)
        .await?
        .with_options(QueueOptions::default().with_default_max_attempts(5));
    queue.ensure_indexes().await?;

    // Producers only need the queue.
    let _jid = queue
        .enqueue(NewJob::encode(
            "translate_article",
            &TranslateArticle {
                article_id: 42,
                target_language: "de".into(),
            },
        )?)
        .await?;

    let mut registry = ProcessorRegistry::new();
    registry.register(Translator)?;

    let pool = WorkerPool::new(
        Arc::new(queue),
        registry,
        PoolOptions::default()
            .with_workers(workers)
            .with_dequeue_timeout(Duration::from_secs(1))
            .with_shutdown_timeout(Duration::from_secs(10)),
    );
    pool.start().await?;

    // Run until Ctrl+C, then drain in-flight jobs.
    tokio::signal::ctrl_c().await?;
    let stats = pool.get_stats().await?;
    tracing::info!(stats = %serde_json::to_string(&stats)?, "shutting down");
    pool.stop().await?;
    Ok(())
}
