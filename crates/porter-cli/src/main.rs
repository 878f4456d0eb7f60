mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, SubsecRound, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use porter_session::{
    Call, CoordinatorOptions, HttpTransport, HttpTransportConfig, PersistedRequestInfo,
    SessionCoordinator, TaskDescriptor, event_channel,
};
use porter_types::{CommitInfo, FileMetadata, FinishBatchEntry};
use porter_upload::routes::ARG_HEADER;
use porter_upload::{ApiRoutes, BatchOutcome, BatchProgress, BatchUploader, ProgressHandler};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "porter", version, about = "Chunked batch uploads and resumable transfers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload files into a remote folder and commit them as one batch
    Upload {
        remote_dir: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Download a file; with a journal it survives a restart
    Download {
        remote_path: String,
        destination: PathBuf,
        #[arg(long)]
        overwrite: bool,
    },
    /// Collect transfers left behind by an earlier run
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "porter=info,porter_session=info,porter_upload=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Upload { remote_dir, files } => upload(&config, &remote_dir, files).await,
        Command::Download {
            remote_path,
            destination,
            overwrite,
        } => download(&config, &remote_path, destination, overwrite).await,
        Command::Reconcile => reconcile(&config).await,
    }
}

fn coordinator(
    transport_config: HttpTransportConfig,
    options: CoordinatorOptions,
) -> anyhow::Result<SessionCoordinator<HttpTransport>> {
    let (sink, events) = event_channel();
    let transport = HttpTransport::new(transport_config, sink)?;
    Ok(SessionCoordinator::new(transport, events, options))
}

async fn upload(config: &Config, remote_dir: &str, files: Vec<PathBuf>) -> anyhow::Result<()> {
    let coordinator = coordinator(config.foreground_transport(), CoordinatorOptions::default())?;
    let uploader = BatchUploader::new(
        ApiRoutes::new(coordinator.clone(), config.routes()),
        config.batch(),
    );

    let batch = files
        .iter()
        .map(|file| Ok((file.clone(), commit_info(remote_dir, file)?)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let progress: ProgressHandler = Arc::new(|progress: BatchProgress| {
        debug!(
            completed = progress.completed_bytes,
            total = progress.total_bytes,
            "upload progress"
        );
    });

    let (tx, mut rx) = oneshot::channel();
    let handle = uploader.submit_batch_upload(batch, Some(progress), move |outcome| {
        let _ = tx.send(outcome);
    })?;
    info!(job = %handle.id(), files = files.len(), remote_dir, "upload started");

    let outcome = tokio::select! {
        outcome = &mut rx => outcome?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job = %handle.id(), "interrupted, cancelling upload");
            handle.cancel();
            rx.await?
        }
    };

    coordinator.shutdown();
    report_upload(&outcome)
}

fn commit_info(remote_dir: &str, file: &Path) -> anyhow::Result<CommitInfo> {
    let name = file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("{} has no usable file name", file.display()))?;
    let mut commit = CommitInfo::new(format!("{}/{name}", remote_dir.trim_end_matches('/')));
    commit.client_modified = std::fs::metadata(file)
        .and_then(|meta| meta.modified())
        .ok()
        .map(|modified| DateTime::<Utc>::from(modified).trunc_subsecs(0));
    Ok(commit)
}

fn report_upload(outcome: &BatchOutcome) -> anyhow::Result<()> {
    let mut failed = outcome.file_errors.len();

    if let Some(results) = &outcome.results {
        let mut sorted: Vec<_> = results.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (source, entry) in sorted {
            match entry {
                FinishBatchEntry::Success(FileMetadata {
                    path_display, size, ..
                }) => println!("{} -> {path_display} ({size} bytes)", source.display()),
                FinishBatchEntry::Failure { reason } => {
                    failed += 1;
                    println!("{}: commit failed: {reason}", source.display());
                }
            }
        }
    }
    for (source, err) in &outcome.file_errors {
        println!("{}: {err}", source.display());
    }

    if outcome.is_cancelled() {
        bail!("upload cancelled");
    }
    if let Some(err) = &outcome.finish_error {
        bail!("{err}");
    }
    if failed > 0 {
        bail!("{failed} file(s) failed");
    }
    Ok(())
}

async fn download(
    config: &Config,
    remote_path: &str,
    destination: PathBuf,
    overwrite: bool,
) -> anyhow::Result<()> {
    let transport_config = match config.background_transport() {
        Some(background) => background,
        None => {
            warn!("PORTER_JOURNAL_PATH is not set, download will not survive a restart");
            config.foreground_transport()
        }
    };
    let coordinator = coordinator(transport_config, CoordinatorOptions::default())?;

    let arg = serde_json::json!({ "path": remote_path });
    let descriptor = TaskDescriptor::download(format!("{}/files/download", config.content_url))
        .header("Authorization", format!("Bearer {}", config.access_token))
        .header(ARG_HEADER, arg.to_string())
        .tag("download");
    let info = PersistedRequestInfo::download_file("files", "download", &destination, overwrite);
    let call: Call<FileMetadata> = Call::new(coordinator.download_task(descriptor, info));
    info!(task = %call.id(), remote_path, "download started");

    let result = tokio::select! {
        result = call.response_with_file() => result,
        _ = tokio::signal::ctrl_c() => {
            // The journal keeps the task; `porter reconcile` picks it up.
            warn!(task = %call.id(), "interrupted, leaving download to the next run");
            return Ok(());
        }
    };
    let (metadata, file) = result.with_context(|| format!("downloading {remote_path}"))?;
    println!("{} -> {}", metadata.path_display, file.display());
    Ok(())
}

async fn reconcile(config: &Config) -> anyhow::Result<()> {
    let Some(transport_config) = config.background_transport() else {
        bail!("PORTER_JOURNAL_PATH is not set, there is nothing to reconcile");
    };
    let options = CoordinatorOptions {
        on_background_events_finished: Some(Arc::new(|| {
            info!("restored transfers have delivered their events")
        })),
        ..CoordinatorOptions::default()
    };
    let coordinator = coordinator(transport_config, options)?;

    let pending = coordinator.reconcile_pending_transfers().await;
    if pending.is_empty() {
        println!("no pending transfers");
        return Ok(());
    }

    let mut waiting = JoinSet::new();
    for entry in pending {
        match entry {
            Ok(reconnected) => {
                let id = reconnected.request.id();
                let route = format!(
                    "{}/{}",
                    reconnected.info.route_namespace(),
                    reconnected.info.route_name()
                );
                info!(task = %id, %route, "resuming transfer");
                waiting.spawn(async move { (id, route, reconnected.request.response().await) });
            }
            Err(err) => {
                warn!(task = %err.task_id, error = %err.kind, "cancelling transfer that cannot be resumed");
                err.request.cancel();
            }
        }
    }

    let mut failed = 0;
    while let Some(joined) = waiting.join_next().await {
        let (id, route, result) = joined?;
        match result {
            Ok(response) => match response.file {
                Some(file) => println!("task {id} ({route}): saved to {}", file.display()),
                None => println!("task {id} ({route}): completed with status {}", response.status),
            },
            Err(failure) => {
                failed += 1;
                println!("task {id} ({route}): failed: {failure:?}");
            }
        }
    }

    coordinator.shutdown();
    if failed > 0 {
        bail!("{failed} transfer(s) failed");
    }
    Ok(())
}
