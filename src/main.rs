use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use offline_mode::config::{Config, TOKEN_ENV_VAR};
use offline_mode::logging::{self, LogMode};
use offline_mode::paths::AppPaths;
use offline_mode::service::{self, daemon, ServiceController, ServiceSpec, StatusFile};
use offline_mode::storage::{Database, SyncCycleRecord};
use offline_mode::sync::{ConfiguredRunner, CycleRunner};

/// Keeps an offline copy of your Raindrop.io bookmarks in sync.
#[derive(Parser, Debug)]
#[command(name = "offline-mode", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register the background service with the OS service manager
    Install,
    /// Start the installed background service
    Start,
    /// Stop the background service after its current item
    Stop,
    /// Unregister the background service (stop it first)
    Remove,
    /// Run the service in the foreground with log output on the console
    Debug,
    /// Service entry point used by the OS service manager
    #[command(hide = true)]
    Run,
    /// Show service state, item counts and recent cycles
    Status {
        /// Number of recent cycles to show
        #[arg(long, default_value_t = 5)]
        cycles: i64,
    },
    /// Sync now: ask the running service, or run one cycle here
    SyncNow,
    /// Retry items that reached the failure ceiling
    Retry,
}

const CONFIG_TEMPLATE: &str = r#"# offline-mode configuration. Every key is optional.

# Raindrop.io API token (or set OFFLINE_MODE_API_TOKEN)
# api_token = ""

# Folder that receives the "Offline Mode" tree
# download_path = "/home/me/Downloads"

# video_enabled = false
# video_resolution = 720          # 360, 480, 720, 1080 or "best"
# sync_interval_seconds = 43200
# retry_ceiling = 3
# concurrency = 3
# article_format = "html"         # "html" or "markdown"
"#;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = AppPaths::resolve()?;
    paths.ensure_dirs()?;

    let mode = match cli.command {
        Command::Debug => LogMode::Console,
        _ => LogMode::File,
    };
    let _guard = logging::init(&paths.log_dir(), mode)?;

    let controller = ServiceController::new(
        service::platform_manager(),
        StatusFile::new(paths.status_file()),
    );

    match cli.command {
        Command::Install => install(&paths, &controller).await,
        Command::Start => {
            controller.start().await.context("Failed to start service")?;
            println!("Service started.");
            Ok(())
        }
        Command::Stop => {
            controller.stop().await.context("Failed to stop service")?;
            println!("Service stop requested.");
            Ok(())
        }
        Command::Remove => {
            controller.remove().await.context("Failed to remove service")?;
            println!("Service removed.");
            Ok(())
        }
        Command::Debug => {
            println!("Running in the foreground. Press Ctrl+C to stop.");
            daemon::run(&paths).await
        }
        Command::Run => daemon::run(&paths).await,
        Command::Status { cycles } => status(&paths, &controller, cycles).await,
        Command::SyncNow => sync_now(&paths, &controller).await,
        Command::Retry => retry(&paths).await,
    }
}

async fn open_store(paths: &AppPaths) -> Result<Database> {
    let store = paths.store_file();
    Database::open(&store.to_string_lossy())
        .await
        .with_context(|| format!("Failed to open state store '{}'", store.display()))
}

async fn install(paths: &AppPaths, controller: &ServiceController) -> Result<()> {
    let config_file = paths.config_file();
    if !config_file.exists() {
        std::fs::write(&config_file, CONFIG_TEMPLATE).with_context(|| {
            format!("Failed to write config template '{}'", config_file.display())
        })?;
        println!("Wrote config template: {}", config_file.display());
    }

    let config = Config::load(&config_file).context("Failed to load configuration")?;
    if config.api_token().is_none() {
        println!(
            "Note: no API token configured yet; set api_token in {} or {}.",
            config_file.display(),
            TOKEN_ENV_VAR
        );
    }

    let spec = ServiceSpec {
        executable: std::env::current_exe().context("Cannot locate the running executable")?,
        data_dir: paths.data_dir.clone(),
        config_dir: paths.config_dir.clone(),
        stop_timeout_secs: config.shutdown_grace_seconds + 15,
    };
    controller
        .install(&spec)
        .await
        .context("Failed to install service")?;
    println!("Service installed. Run `offline-mode start` to begin syncing.");
    Ok(())
}

fn print_cycle(record: &SyncCycleRecord) {
    let seconds = (record.finished_at - record.started_at).num_seconds();
    println!(
        "  {}  {:<15} +{} added, {} archived, {} failed ({}s){}",
        record.started_at.format("%Y-%m-%d %H:%M:%S"),
        record.outcome.to_string(),
        record.items_added,
        record.items_archived,
        record.items_failed,
        seconds,
        if record.cancelled { ", cancelled" } else { "" }
    );
}

async fn status(paths: &AppPaths, controller: &ServiceController, cycles: i64) -> Result<()> {
    match controller.live_status() {
        Some(s) => println!(
            "Service: {} (pid {}{})",
            s.state,
            s.pid,
            if s.stop_requested { ", stopping" } else { "" }
        ),
        None if controller.is_installed() => println!("Service: installed, not running"),
        None => println!("Service: not running"),
    }

    let db = open_store(paths).await?;
    let counts = db.status_counts().await.context("Failed to count items")?;
    println!(
        "Items: {} fetched, {} failed, {} pending, {} archived",
        counts.fetched, counts.failed, counts.pending, counts.archived
    );

    let recent = db
        .recent_cycles(cycles)
        .await
        .context("Failed to read cycle history")?;
    if recent.is_empty() {
        println!("No sync cycles recorded yet.");
    } else {
        println!("Recent cycles:");
        recent.iter().for_each(print_cycle);
    }
    println!("Log: {}", paths.log_dir().join(logging::LOG_FILE_NAME).display());
    Ok(())
}

async fn sync_now(paths: &AppPaths, controller: &ServiceController) -> Result<()> {
    if let Some(live) = controller.live_status() {
        daemon::request_sync(paths).context("Failed to signal the running service")?;
        println!("Sync requested from the running service (pid {}).", live.pid);
        return Ok(());
    }

    let db = open_store(paths).await?;
    let runner = ConfiguredRunner::new(paths.config_file(), db.clone());
    let cancel = CancellationToken::new();

    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, finishing in-flight items");
            on_interrupt.cancel();
        }
    });

    println!("Running one sync cycle...");
    let record = runner
        .run_cycle(cancel)
        .await
        .context("Sync cycle could not run")?;
    db.close().await;

    print_cycle(&record);
    Ok(())
}

async fn retry(paths: &AppPaths) -> Result<()> {
    let db = open_store(paths).await?;
    let reset = db
        .reset_failures()
        .await
        .context("Failed to reset failure counts")?;
    db.close().await;
    println!("{reset} failed item(s) will be retried on the next cycle.");
    Ok(())
}
