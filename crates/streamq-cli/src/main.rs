mod handlers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use streamq_core::impls::RedisStore;
use streamq_core::{Consumer, QueueBuilder, QueueConfig, TaskId, TaskOptions};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::{FlakyHandler, FlakyPayload, LogHandler};

/// Pause before restarting a consumer whose fetch failed.
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "streamq", about = "Background task queue on Redis Streams")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Append one task to the stream.
    Enqueue {
        #[arg(long)]
        handler: String,

        /// JSON payload.
        #[arg(long, default_value = "{}")]
        data: String,

        #[arg(long, default_value_t = streamq_core::domain::task::DEFAULT_RETRY_COUNT)]
        retry_count: u32,

        /// Seconds.
        #[arg(long, default_value_t = streamq_core::domain::task::DEFAULT_RETRY_DELAY_SECS)]
        retry_delay: u64,

        /// Seconds.
        #[arg(long, default_value_t = streamq_core::domain::task::DEFAULT_TIMEOUT_SECS)]
        timeout: u64,
    },

    /// Remove the lock of a task whose consumer died holding it.
    Unlock {
        #[arg(long)]
        task_id: String,
    },

    /// Run consumers with the demo handlers (`log`, `flaky`) until Ctrl-C.
    Work {
        #[arg(long, default_value_t = 1)]
        consumers: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "streamq=info,streamq_core=info".into());
    let json = std::env::var("STREAMQ_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = QueueConfig::from_env().context("loading STREAMQ_* configuration")?;

    let store = RedisStore::connect(&config.redis.url())
        .await
        .context("connecting to redis")?
        .with_ack_group(config.ack_group.clone());

    let queue = QueueBuilder::new(config)
        .store(Arc::new(store))
        .register("log", LogHandler)?
        .register_typed::<FlakyPayload, _>(FlakyHandler::default())?
        .build()?;

    match cli.command {
        Command::Enqueue {
            handler,
            data,
            retry_count,
            retry_delay,
            timeout,
        } => {
            let data: serde_json::Value = serde_json::from_str(&data).context("--data is not valid JSON")?;
            let options = TaskOptions::default()
                .with_retry_count(retry_count)
                .with_retry_delay(Duration::from_secs(retry_delay))
                .with_timeout(Duration::from_secs(timeout));
            let id = queue.enqueuer().try_add_task(handler, data, options).await?;
            println!("{id}");
        }
        Command::Unlock { task_id } => {
            let id: TaskId = task_id.parse().context("--task-id is not a ULID")?;
            if queue.locks().force_release(&id).await? {
                tracing::warn!(task_id = %id, "lock removed");
            } else {
                tracing::info!(task_id = %id, "no lock held");
            }
        }
        Command::Work { consumers } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let workers: Vec<_> = (0..consumers.max(1))
                .map(|n| tokio::spawn(supervise(n, queue.consumer(), shutdown_rx.clone())))
                .collect();
            tracing::info!(consumers = workers.len(), handlers = ?queue.registry().registered_names(), "worker started");

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown requested, finishing in-flight tasks");
            let _ = shutdown_tx.send(true);
            let panicked = join_workers(workers).await;
            tracing::info!(panicked, "worker shutdown complete");
        }
    }
    Ok(())
}

/// Wait for every supervisor. Returns how many of them panicked.
async fn join_workers(workers: Vec<JoinHandle<()>>) -> usize {
    let mut panicked = 0;
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "consumer supervisor panicked");
            panicked += 1;
        }
    }
    panicked
}

/// Run `consumer` until shutdown, restarting it after fetch failures.
async fn supervise(n: usize, mut consumer: Consumer, mut shutdown: watch::Receiver<bool>) {
    loop {
        match consumer.run(shutdown.clone()).await {
            Ok(()) => break,
            Err(e) => {
                tracing::error!(consumer = n, error = %e, "consumer stopped on fetch failure, restarting");
            }
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }
        if *shutdown.borrow() {
            break;
        }
    }
}
