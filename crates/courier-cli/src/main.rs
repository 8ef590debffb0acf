use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use courier_core::impls::SqliteTaskStore;
use courier_core::{DispatcherOptions, EngineConfig, NewTask, SchedulerBuilder, Task, TaskStore};

mod handlers;
use handlers::{
    EmailHandler, FanOutHandler, FanOutNotification, PushHandler, SendEmail, SendPush,
};

#[derive(Parser, Debug)]
#[clap(version, about = "Background notification task engine")]
struct CliArgs {
    /// Path to the SQLite task database.
    #[clap(long, default_value = "courier.db")]
    pub db: PathBuf,

    /// Path to a TOML engine config. Defaults apply when omitted.
    #[clap(long)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine until Ctrl-C.
    Run,

    /// Store a fan-out task for a post. A running engine picks it up on its
    /// next poll.
    Enqueue {
        #[clap(long)]
        post_id: i64,

        /// Subscriber ids, comma separated.
        #[clap(long, value_delimiter = ',', required = true)]
        subscribers: Vec<i64>,

        /// Do not dispatch before this many seconds from now.
        #[clap(long)]
        delay_secs: Option<i64>,
    },

    /// Print the number of stored tasks.
    Pending,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let config = match &cli_args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {path:?}"))?,
        None => EngineConfig::default(),
    };

    let store: Arc<dyn TaskStore> = Arc::new(
        SqliteTaskStore::open(&cli_args.db)
            .with_context(|| format!("Failed to open task database at {:?}", cli_args.db))?,
    );

    match cli_args.command {
        Command::Run => run(store, config).await,
        Command::Enqueue {
            post_id,
            subscribers,
            delay_secs,
        } => {
            let mut task = NewTask::of(&FanOutNotification {
                post_id,
                subscriber_ids: subscribers,
            })?;
            if let Some(secs) = delay_secs {
                task = task.wait_until(chrono::Utc::now() + chrono::Duration::seconds(secs));
            }
            let record = store.insert(task).await?;
            info!(task_id = %record.id, post_id, "enqueued fan-out task");
            Ok(())
        }
        Command::Pending => {
            println!("{}", store.count_pending().await?);
            Ok(())
        }
    }
}

async fn run(store: Arc<dyn TaskStore>, config: EngineConfig) -> Result<()> {
    let builder = SchedulerBuilder::new().with_config(config);
    let fan_out = FanOutHandler::new(Arc::clone(&store), builder.notifier());

    let (manager, handle) = builder
        .register::<SendEmail, _>(EmailHandler, DispatcherOptions::new(2, 20))?
        .register::<SendPush, _>(PushHandler, DispatcherOptions::new(4, 50))?
        .register::<FanOutNotification, _>(
            fan_out,
            DispatcherOptions::new(1, 10).handles_deletion(true),
        )?
        .expect_tasks(&[SendEmail::TYPE, SendPush::TYPE, FanOutNotification::TYPE])
        .build(store)?;

    let cancel = CancellationToken::new();
    let join = manager.start(cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");
    if let Ok(status) = handle.status().await {
        info!(status = %serde_json::to_string(&status)?, "engine status at shutdown");
    }
    cancel.cancel();
    join.await.context("Background task manager panicked")?;
    Ok(())
}
