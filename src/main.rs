use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use airpatch::publish::{self, PublishOptions};
use airpatch::{Command, Config, Host, HostEvent, UpdateManager, UpdateService};

#[derive(Parser)]
#[command(name = "airpatch", about = "Over-the-air bundle updater")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the bundle generations
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Base URI patches are served from
    #[arg(long, global = true)]
    server: Option<String>,
    /// Version of the bundle shipped with the host application
    #[arg(long, global = true)]
    bundled_version: Option<u32>,
    /// Host install time keying the generation directories
    #[arg(long, global = true)]
    install_stamp: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the active generation and known versions
    Status,
    /// Ask the server for the newest patch version
    Check,
    /// Download the next patch into the staging generation
    Download,
    /// Install the downloaded patch
    Install {
        /// Report the installed version instead of requesting a restart
        #[arg(long)]
        restart_manually: bool,
    },
    /// Drop the active generation after a crash
    Rollback,
    /// Lay out patches for a static server from an assets directory
    Publish {
        /// Directory with the new bundle and its assets
        #[arg(long)]
        assets: PathBuf,
        /// Server root the patches are written under
        #[arg(long, short)]
        out: PathBuf,
        /// Version to publish (default: highest published + 1)
        #[arg(long)]
        version: Option<u32>,
    },
}

/// Prints host events; a restart request is only reported.
#[derive(Default)]
struct ConsoleHost {
    failed: bool,
    last_percent: Option<u64>,
}

impl Host for ConsoleHost {
    fn emit(&mut self, event: HostEvent) {
        match event {
            HostEvent::Checked { version } => println!("Update available: version {version}"),
            HostEvent::Progress { downloaded, total } => {
                if total == 0 {
                    println!("  {downloaded} bytes");
                    return;
                }
                let percent = downloaded * 100 / total;
                if self.last_percent.map_or(true, |last| percent >= last + 10 || percent == 100) {
                    println!("  {downloaded}/{total} bytes ({percent}%)");
                    self.last_percent = Some(percent);
                }
            }
            HostEvent::Downloaded { version } => println!("Patch {version} downloaded"),
            HostEvent::Installed { version } => println!("Patch {version} installed"),
            HostEvent::Error { message } => {
                eprintln!("Error: {message}");
                self.failed = true;
            }
        }
    }

    fn restart(&mut self) {
        println!("Restart requested: relaunch the application to load the new bundle");
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(root) = &cli.root {
        config.storage_root = root.clone();
    }
    if let Some(server) = &cli.server {
        config.server_uri = Some(server.clone());
    }
    if let Some(version) = cli.bundled_version {
        config.bundled_version = version;
    }
    if let Some(stamp) = &cli.install_stamp {
        config.install_stamp = Some(stamp.clone());
    }
    Ok(config)
}

fn open_manager(config: &Config) -> anyhow::Result<UpdateManager> {
    UpdateManager::open(config).context("Failed to open the bundle store")
}

fn print_status(manager: &UpdateManager) {
    let status = manager.status();
    println!("Current version: {}", status.current_version);
    match &status.active {
        Some(active) => println!(
            "Active: {} generation, version {} ({})",
            active.kind,
            active.version,
            active.bundle.display()
        ),
        None => println!("Active: bundled asset"),
    }
    println!("Downloaded patch waiting: {}", if status.temp_ready { "yes" } else { "no" });
}

fn rollback(mut manager: UpdateManager) -> anyhow::Result<()> {
    let rolled_back = manager.rollback().context("Nothing to roll back")?;
    if !rolled_back {
        bail!("Rollback failed; the active bundle could not be moved");
    }
    match manager.bundle_path() {
        Some(bundle) => println!("Rolled back; now loading {}", bundle.display()),
        None => println!("Rolled back; now loading the bundled asset"),
    }
    Ok(())
}

async fn publish_patches(options: PublishOptions, start: Instant) -> anyhow::Result<()> {
    let summary = tokio::task::spawn_blocking(move || publish::publish(&options))
        .await?
        .context("Failed to publish patches")?;
    println!("Published version {}", summary.version);
    println!("  Delta patches built: {}", summary.patches_built);
    println!("  Archive size: {} bytes", summary.archive_size);
    println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Run one lifecycle command on the update worker and print its events.
async fn run_command(manager: UpdateManager, command: Command, start: Instant) -> anyhow::Result<()> {
    let mut service = UpdateService::spawn(manager);
    service.submit(command);
    let mut host = ConsoleHost::default();
    service.shutdown(&mut host).await;
    if host.failed {
        bail!("Update command failed");
    }
    println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("airpatch=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let start = Instant::now();

    match cli.command {
        Commands::Publish {
            assets,
            out,
            version,
        } => {
            let options = PublishOptions {
                assets_dir: assets,
                server_root: out,
                platform: config.platform.clone(),
                bundle_name: config.bundle_name.clone(),
                version,
            };
            publish_patches(options, start).await
        }
        Commands::Status => {
            print_status(&open_manager(&config)?);
            Ok(())
        }
        Commands::Rollback => rollback(open_manager(&config)?),
        Commands::Check => run_command(open_manager(&config)?, Command::CheckForUpdate, start).await,
        Commands::Download => run_command(open_manager(&config)?, Command::DownloadPatch, start).await,
        Commands::Install { restart_manually } => {
            let command = Command::InstallPatch { restart_manually };
            run_command(open_manager(&config)?, command, start).await
        }
    }
}
