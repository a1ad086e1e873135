use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};

use fieldsync_lib::time::to_rfc3339;
use fieldsync_lib::{
    setup_auto_sync, AutoSyncOptions, ConnectivityMonitor, ConnectivityProbe, EntityKind,
    FullSyncReport, HaltReason, HttpApiClient, MutationAction, OfflineContext, OfflineMutation,
    RemoteApi, Session, SkipReason, SyncConfig, TokenStore,
};

/// Exit code when a sync pass left failed items behind.
const EXIT_SYNC_FAILURES: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "fieldsync", about = "Offline work-order queue and sync", version)]
struct Cli {
    /// Data directory (defaults to FIELDSYNC_DATA_DIR or the platform data dir).
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    /// API base URL (defaults to FIELDSYNC_API_URL).
    #[arg(long, global = true, value_name = "URL")]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Inspect and edit the mutation queue.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Queue and list job photos.
    #[command(subcommand)]
    Photos(PhotosCommand),
    /// Run one sync pass now.
    Sync(JsonFlag),
    /// Keep syncing on reconnect and on a timer until Ctrl-C.
    Watch,
    /// Cached API reads.
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Session tokens used for replay.
    #[command(subcommand)]
    Auth(AuthCommand),
    /// Queue counts and connectivity.
    Status(JsonFlag),
}

#[derive(Debug, Args)]
struct JsonFlag {
    /// Emit JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// List pending and failed mutations in replay order.
    List {
        #[arg(long = "type", value_name = "TYPE")]
        entity_type: Option<EntityKind>,
        #[arg(long)]
        json: bool,
    },
    /// Queue a mutation.
    Add {
        #[arg(long = "type", value_name = "TYPE")]
        entity_type: EntityKind,
        #[arg(long)]
        action: MutationAction,
        /// Entity id; omitted for creates to get a local placeholder.
        #[arg(long)]
        target: Option<String>,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// List failed mutations.
    Failed {
        #[arg(long)]
        json: bool,
    },
    /// Put a failed mutation back to pending and sync.
    Retry { id: String },
    /// Abandon a mutation.
    Dismiss { id: String },
}

#[derive(Debug, Subcommand)]
enum PhotosCommand {
    /// Spool a photo file for a job.
    Add {
        #[arg(long)]
        job: String,
        path: PathBuf,
    },
    /// List queued photos.
    List {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Drop all cached reads. Queued writes are kept.
    Clear,
}

#[derive(Debug, Subcommand)]
enum AuthCommand {
    /// Store an access token.
    Login {
        #[arg(long)]
        token: String,
        /// Expiry as epoch milliseconds.
        #[arg(long, value_name = "MS")]
        expires_at: Option<i64>,
    },
    /// Remove the stored token.
    Logout,
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    };

    let log_guard = if matches!(cli.command, Commands::Watch) {
        match fieldsync_lib::init_file_logging(&config.logs_dir()) {
            Ok(guard) => Some(guard),
            Err(err) => {
                fieldsync_lib::init_logging();
                tracing::warn!(target: "fieldsync", event = "file_logging_unavailable", error = %err);
                None
            }
        }
    } else {
        fieldsync_lib::init_logging();
        None
    };
    tracing::debug!(target: "fieldsync", event = "cli_start", git_hash = fieldsync_lib::GIT_HASH);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start runtime: {err}");
            process::exit(1);
        }
    };
    let code = match runtime.block_on(handle_cli(cli.command, config)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    drop(runtime);
    drop(log_guard);
    process::exit(code);
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = SyncConfig::from_env().context("read configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(url) = &cli.api_url {
        config.api_url = url.trim_end_matches('/').to_string();
    }
    Ok(config)
}

struct Wiring {
    ctx: OfflineContext,
    api: Arc<dyn RemoteApi>,
}

async fn open(config: &SyncConfig) -> Result<Wiring> {
    let tokens = TokenStore::new(config.session_path());
    let api: Arc<dyn RemoteApi> = Arc::new(HttpApiClient::new(config, tokens)?);
    let ctx = OfflineContext::open(config, Arc::clone(&api), ConnectivityMonitor::new())
        .await
        .with_context(|| format!("open queue in {}", config.data_dir.display()))?;
    Ok(Wiring { ctx, api })
}

async fn probe_connectivity(wiring: &Wiring) {
    let reachable = wiring.api.probe().await;
    wiring.ctx.monitor().set_online(reachable);
}

async fn handle_cli(command: Commands, config: SyncConfig) -> Result<i32> {
    match command {
        Commands::Auth(auth) => handle_auth(auth, &config),
        Commands::Queue(queue) => handle_queue(queue, &config).await,
        Commands::Photos(photos) => handle_photos(photos, &config).await,
        Commands::Sync(flag) => {
            let wiring = open(&config).await?;
            probe_connectivity(&wiring).await;
            let report = wiring.ctx.sync_now().await.unwrap_or_default();
            print_report(&report, flag.json)?;
            Ok(report_exit_code(&report))
        }
        Commands::Watch => handle_watch(&config).await,
        Commands::Cache(CacheCommand::Clear) => {
            let wiring = open(&config).await?;
            let removed = wiring.ctx.clear_cache().await?;
            println!("Cleared {removed} cached entries.");
            Ok(0)
        }
        Commands::Status(flag) => {
            let wiring = open(&config).await?;
            probe_connectivity(&wiring).await;
            let snapshot = wiring.ctx.refresh().await?;
            if flag.json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("online:          {}", snapshot.online);
                println!("pending:         {}", snapshot.pending_count);
                println!("pending photos:  {}", snapshot.pending_photos);
                println!("failed:          {}", snapshot.failed_mutations.len());
                println!("data dir:        {}", config.data_dir.display());
            }
            Ok(0)
        }
    }
}

fn handle_auth(command: AuthCommand, config: &SyncConfig) -> Result<i32> {
    let tokens = TokenStore::new(config.session_path());
    match command {
        AuthCommand::Login { token, expires_at } => {
            let mut session = Session::new(token);
            session.expires_at = expires_at;
            tokens.save_tokens(&session).context("save session")?;
            println!("Session saved.");
        }
        AuthCommand::Logout => {
            if tokens.clear_tokens().context("clear session")? {
                println!("Session removed.");
            } else {
                println!("No session stored.");
            }
        }
    }
    Ok(0)
}

async fn handle_queue(command: QueueCommand, config: &SyncConfig) -> Result<i32> {
    let wiring = open(config).await?;
    let ctx = &wiring.ctx;
    match command {
        QueueCommand::List { entity_type, json } => {
            let mutations = match entity_type {
                Some(kind) => ctx.get_pending_mutations_by_type(kind).await?,
                None => ctx.get_pending_mutations().await?,
            };
            print_mutations(&mutations, json)?;
        }
        QueueCommand::Add {
            entity_type,
            action,
            target,
            payload,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("parse --payload as JSON")?;
            let mutation = ctx
                .enqueue(entity_type, action, target.as_deref(), payload)
                .await?;
            println!("{}", mutation.id);
        }
        QueueCommand::Failed { json } => {
            let failed = ctx.store().failed_mutations().await?;
            print_mutations(&failed, json)?;
        }
        QueueCommand::Retry { id } => {
            probe_connectivity(&wiring).await;
            let report = ctx.retry_mutation(&id).await?.unwrap_or_default();
            print_report(&report, false)?;
            return Ok(report_exit_code(&report));
        }
        QueueCommand::Dismiss { id } => {
            if ctx.dismiss_mutation(&id).await? {
                println!("Dismissed {id}.");
            } else {
                eprintln!("No mutation with id {id}.");
                return Ok(1);
            }
        }
    }
    Ok(0)
}

async fn handle_photos(command: PhotosCommand, config: &SyncConfig) -> Result<i32> {
    let wiring = open(config).await?;
    match command {
        PhotosCommand::Add { job, path } => {
            let bytes =
                std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("photo")
                .to_string();
            let photo = wiring.ctx.enqueue_photo(&job, &file_name, &bytes).await?;
            println!("{}", photo.id);
        }
        PhotosCommand::List { json } => {
            let photos = wiring.ctx.photos().pending().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&photos)?);
            } else if photos.is_empty() {
                println!("No queued photos.");
            } else {
                for photo in photos {
                    println!(
                        "{}  job={}  {}  {} bytes  {}",
                        photo.id,
                        photo.job_id,
                        photo.mime,
                        photo.byte_len,
                        photo.status.as_str()
                    );
                }
            }
        }
    }
    Ok(0)
}

async fn handle_watch(config: &SyncConfig) -> Result<i32> {
    let wiring = open(config).await?;
    let probe = ConnectivityProbe::spawn(
        wiring.ctx.monitor().clone(),
        Arc::clone(&wiring.api),
        config.probe_interval,
    );
    let handle = setup_auto_sync(wiring.ctx.clone(), AutoSyncOptions::from_config(config));
    println!("Watching {}; press Ctrl-C to stop.", config.data_dir.display());

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    probe.stop();
    handle.stop().await;
    wiring.ctx.shutdown();
    Ok(0)
}

fn print_mutations(mutations: &[OfflineMutation], as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(mutations)?);
        return Ok(());
    }
    if mutations.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for m in mutations {
        let mut line = format!(
            "{}  {}  {:<8} {:<6} {:<40} retries={} {}",
            m.id,
            to_rfc3339(m.created_at),
            m.entity_type.as_str(),
            m.action.as_str(),
            m.target_id,
            m.retry_count,
            m.status.as_str()
        );
        if let Some(error) = &m.last_error {
            line.push_str(&format!("  ({error})"));
        }
        println!("{line}");
    }
    Ok(())
}

fn print_report(report: &FullSyncReport, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if let Some(reason) = report.skipped {
        let why = match reason {
            SkipReason::Offline => "server unreachable",
            SkipReason::NoSession => "not signed in; run `fieldsync auth login`",
            SkipReason::StoreUnavailable => "queue database unavailable",
        };
        println!("Sync skipped: {why}.");
        return Ok(());
    }
    let summary = json!({
        "mutations": report.mutations,
        "photos": report.photos,
    });
    println!("{summary}");
    if let Some(reason) = report.halted {
        let why = match reason {
            HaltReason::Unauthenticated => "session rejected by the server",
            HaltReason::WentOffline => "connection lost",
            HaltReason::Cancelled => "cancelled",
        };
        println!("Sync stopped early: {why}.");
    }
    Ok(())
}

fn report_exit_code(report: &FullSyncReport) -> i32 {
    if report.combined().failed > 0 || report.halted == Some(HaltReason::Unauthenticated) {
        EXIT_SYNC_FAILURES
    } else {
        0
    }
}
