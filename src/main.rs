//! Pullwatch - follow long-running remote tasks to completion
//!
//! Runs against the in-process loopback download server, or replays a
//! recorded progress stream through the monitor.

use anyhow::Context;
use clap::Parser;
use pullwatch::{
    config::AppConfig,
    logging,
    monitor::{ProgressMonitor, ProgressReader, ProgressRecord, TaskSpec, WaitError},
    session::{
        loopback::LoopbackSession,
        scripted::{Script, ScriptedSession},
        SessionFacade,
    },
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Pull a model from the loopback server and follow its progress
    Pull {
        /// Model name
        model: String,
        /// Alias to register the model under
        #[arg(long)]
        alias: Option<String>,
        /// Hugging Face token passed through to the server
        #[arg(long)]
        hf_token: Option<String>,
        /// Make the download fail once it reaches this percentage
        #[arg(long)]
        fail_at: Option<u8>,
        /// Server keeps downloading after a cancel request
        #[arg(long)]
        ignore_cancel: bool,
        /// Server refuses subscriptions, progress is polled only
        #[arg(long)]
        no_push: bool,
        /// Cancel the pull after this many milliseconds
        #[arg(long)]
        cancel_after_ms: Option<u64>,
        /// Overall deadline in seconds (overrides config)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Replay a JSON array of progress records through the monitor
    Replay {
        /// File with the recorded records
        file: PathBuf,
        /// Delay between pushed records
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// List models known to the loopback server
    Models {
        /// Include models that are not downloaded yet
        #[arg(long)]
        all: bool,
    },
}

#[derive(Parser, Debug)]
#[command(name = "pullwatch")]
#[command(author = "MadKoding")]
#[command(version)]
#[command(about = "Follow long-running remote tasks to completion", long_about = None)]
struct Args {
    /// Configuration file path (overrides defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    logging::init_tracing(args.verbose || config.debug, args.log_file.as_deref())
        .context("Failed to initialize logging")?;

    match args.command {
        Command::Pull {
            model,
            alias,
            hf_token,
            fail_at,
            ignore_cancel,
            no_push,
            cancel_after_ms,
            timeout_secs,
        } => {
            if let Some(secs) = timeout_secs {
                config.monitor.timeout_secs = secs;
            }
            config.validate()?;

            let session = LoopbackSession::builder(config.loopback.clone())
                .fail_at(fail_at)
                .ignore_cancel(ignore_cancel)
                .push_enabled(!no_push)
                .tool_name(config.monitor.tool_name.clone())
                .resource_prefix(config.monitor.resource_prefix.clone())
                .build();
            let spec = config
                .monitor
                .pull_spec(&model, alias.as_deref(), hf_token.as_deref());
            run_monitor(Arc::new(session), spec, &config, cancel_after_ms).await
        }
        Command::Replay { file, interval_ms } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {:?}", file))?;
            let records: Vec<ProgressRecord> =
                serde_json::from_str(&content).context("Replay file must be a JSON array of progress records")?;
            let first = records.first().context("Replay file has no records")?;
            tracing::info!("Replaying {} records for task {}", records.len(), first.task_id);

            let task_id = first.task_id.clone();
            let delay = Duration::from_millis(interval_ms);
            let mut script = records
                .iter()
                .cloned()
                .fold(Script::new(), |script, record| script.push(delay, record))
                .close_push_when_done();
            if let Some(last) = records.last() {
                script = script.read(last.clone());
            }

            let spec = TaskSpec::new(
                task_id.clone(),
                "replay",
                serde_json::Value::Null,
                format!("replay://{}", task_id),
            );
            run_monitor(Arc::new(ScriptedSession::new(script)), spec, &config, None).await
        }
        Command::Models { all } => {
            let session = LoopbackSession::new(config.loopback.clone());
            for model in session.list_models(all).await {
                println!("{}", model);
            }
            Ok(())
        }
    }
}

async fn run_monitor(
    session: Arc<dyn SessionFacade>,
    spec: TaskSpec,
    config: &AppConfig,
    cancel_after_ms: Option<u64>,
) -> anyhow::Result<()> {
    let task_id = spec.task_id.clone();
    let monitor = ProgressMonitor::new(session, spec, config.monitor.clone());
    let handle = monitor.handle();
    let printer = spawn_progress_printer(handle.progress());

    let canceller = handle.clone();
    tokio::spawn(async move {
        match cancel_after_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
            }
        }
        tracing::info!("Cancelling task");
        canceller.cancel();
    });

    let result = monitor.run_with_timeout().await;
    printer.await.ok();

    let record = result.with_context(|| format!("Monitoring {} did not finish cleanly", task_id))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn spawn_progress_printer(reader: ProgressReader) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = reader.snapshot();
        eprintln!("{}", last);
        loop {
            match reader.wait_for_change(last.sequence, Duration::from_secs(60)).await {
                Ok(record) => {
                    eprintln!("{}", record);
                    last = record;
                }
                Err(WaitError::Timeout(_)) => continue,
                Err(WaitError::Closed) => break,
            }
        }
    })
}
