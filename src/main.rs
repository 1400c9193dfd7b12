mod cli;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use cli::{Cli, Commands};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use quest_downgrade::adb::device::{DeviceManager, TcpDeviceManager};
use quest_downgrade::adb::usb::UsbDeviceManager;
use quest_downgrade::manifest::VersionManifest;
use quest_downgrade::patch::{
    http_client, install_apk, HttpFetcher, PatchOutcome, PatchPipeline, XdeltaEngine,
};
use quest_downgrade::resolver::VersionResolver;
use quest_downgrade::services::{EntryKind, RemoteFiles, RemoteShell};
use quest_downgrade::{BridgeError, Config, SessionManager, SessionStage};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("quest_downgrade={}", cli.log_level())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    let result = run(&cli.command, &config).await;
    if let Err(e) = &result {
        if let Some(bridge) = e.downcast_ref::<BridgeError>() {
            eprintln!("{} {}", "error:".red().bold(), bridge);
            if let Some(detail) = bridge.detail() {
                eprintln!("       {}", detail.dimmed());
            }
            std::process::exit(1);
        }
    }
    result
}

async fn run(command: &Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Devices => list_devices(config).await,
        Commands::Init => init(config).await,
        Commands::Shell { command } => shell(config, &command.join(" ")).await,
        Commands::Pull { remote, local } => {
            let sessions = SessionManager::from_config(config);
            let sync = sessions.sync().await?;
            let data = sync.read_file(remote).await?;
            tokio::fs::write(local, &data)
                .await
                .with_context(|| format!("Failed to write {}", local.display()))?;
            println!("{} {} ({} bytes)", "pulled".green(), remote, data.len());
            Ok(())
        }
        Commands::Push { local, remote } => {
            let data = tokio::fs::read(local)
                .await
                .with_context(|| format!("Failed to read {}", local.display()))?;
            let len = data.len();
            let sessions = SessionManager::from_config(config);
            let sync = sessions.sync().await?;
            sync.write_file(remote, Bytes::from(data)).await?;
            println!("{} {} ({} bytes)", "pushed".green(), remote, len);
            Ok(())
        }
        Commands::Ls { remote } => list_dir(config, remote).await,
        Commands::Check => check(config).await,
        Commands::Patch { install } => patch(config, *install).await,
    }
}

async fn list_devices(config: &Config) -> Result<()> {
    let manager: Box<dyn DeviceManager> = match &config.tcp_address {
        Some(address) => Box::new(TcpDeviceManager::new(address.clone())),
        None => Box::new(UsbDeviceManager::new()),
    };
    let devices = manager.devices().await?;
    if devices.is_empty() {
        println!("{}", "No ADB devices found".yellow());
    }
    for device in devices {
        println!("{}", device.description());
    }
    Ok(())
}

async fn init(config: &Config) -> Result<()> {
    let sessions = SessionManager::from_config(config);
    let stage = sessions.initialize().await;
    if stage == SessionStage::SessionReady {
        println!("{} {}", "ready:".green().bold(), stage);
    } else {
        println!("{} {}", "stopped at:".yellow().bold(), stage);
    }
    Ok(())
}

async fn shell(config: &Config, command: &str) -> Result<()> {
    let sessions = SessionManager::from_config(config);
    let output = sessions.shell().await?.run_command(command).await?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    match output.exit_code {
        Some(code) if code != 0 => std::process::exit(code as i32),
        _ => Ok(()),
    }
}

async fn list_dir(config: &Config, remote: &str) -> Result<()> {
    let sessions = SessionManager::from_config(config);
    let mut entries = sessions.sync().await?.read_dir(remote).await?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    for entry in entries {
        let mtime = chrono::DateTime::from_timestamp(entry.mtime as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let name = match entry.kind {
            EntryKind::Directory => format!("{}/", entry.name).blue().to_string(),
            EntryKind::Symlink => entry.name.cyan().to_string(),
            _ => entry.name,
        };
        println!("{:o} {:>12} {} {}", entry.mode, entry.size, mtime, name);
    }
    Ok(())
}

async fn load_resolver(
    config: &Config,
    sessions: &SessionManager,
    client: &reqwest::Client,
) -> Result<VersionResolver> {
    let manifest = VersionManifest::load(config, client).await?;
    let shell: Arc<dyn RemoteShell> = Arc::new(sessions.shell().await?);
    Ok(VersionResolver::new(
        shell,
        config.app_id.clone(),
        Arc::new(manifest),
    ))
}

async fn check(config: &Config) -> Result<()> {
    let sessions = SessionManager::from_config(config);
    let client = http_client()?;
    let resolver = load_resolver(config, &sessions, &client).await?;

    let Some(app) = resolver.installed_app().await? else {
        println!("{} {} is not installed", "!".yellow(), config.app_id);
        return Ok(());
    };
    println!(
        "Installed: {} {} ({} bytes)",
        config.app_id,
        app.version.bold(),
        app.byte_size
    );
    println!("APK: {}", app.apk_path);

    let candidates = resolver.candidates_for(&app);
    if candidates.is_empty() {
        println!("{}", "No compatible downgrades".yellow());
    }
    for record in candidates {
        let target = record.target_version.as_deref().unwrap_or("?");
        println!("  {} -> {}  {}", record.source_version, target.green(), record.download);
    }
    Ok(())
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

async fn patch(config: &Config, install: bool) -> Result<()> {
    let sessions = SessionManager::from_config(config);
    let client = http_client()?;
    let resolver = Arc::new(load_resolver(config, &sessions, &client).await?);
    let sync = Arc::new(sessions.sync().await?);

    let pipeline = PatchPipeline::new(
        resolver,
        sync.clone(),
        Arc::new(HttpFetcher::new(client)),
        Arc::new(XdeltaEngine::new(config.xdelta_program.clone())),
        config.output_dir.clone(),
    );

    let pb = spinner("Patching");
    let outcome = pipeline.run().await;
    pb.finish_and_clear();

    let report = match outcome? {
        PatchOutcome::NoCompatibleDowngrade { installed: None } => {
            println!("{} {} is not installed", "!".yellow(), config.app_id);
            return Ok(());
        }
        PatchOutcome::NoCompatibleDowngrade {
            installed: Some(app),
        } => {
            println!(
                "{} No compatible downgrades for {} ({} bytes)",
                "i".blue(),
                app.version,
                app.byte_size
            );
            return Ok(());
        }
        PatchOutcome::Patched(report) => report,
    };

    println!(
        "{} {} ({} bytes)",
        "patched:".green().bold(),
        report.output.display(),
        report.bytes_written
    );

    if install {
        let pb = spinner("Installing");
        let shell = sessions.shell().await?;
        let result = install_apk(sync.as_ref(), &shell, &report.output).await;
        pb.finish_and_clear();
        result?;
        println!("{} {}", "installed:".green().bold(), report.output.display());
    }
    Ok(())
}
