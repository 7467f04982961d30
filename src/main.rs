mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use kegger::error::{KegError, Result};
use kegger::manifest::ArchiveKind;
use kegger::platform::{Arch, Os, Platform};
use kegger::{Installer, Layout, Settings, colors};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keg")]
#[command(author, version, about = "Install prebuilt release artifacts from manifests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Installation prefix (contains Cellar/, bin/, opt/)
    #[arg(long, global = true, env = "KEG_PREFIX")]
    prefix: Option<PathBuf>,

    /// Target platform, e.g. arm64-macos-15.5 (default: this machine)
    #[arg(long, global = true)]
    platform: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Hide progress bars
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Seconds allowed per download attempt
    #[arg(long, global = true, value_name = "SECS")]
    fetch_timeout: Option<u64>,

    /// Download attempts before giving up
    #[arg(long, global = true, value_name = "N")]
    attempts: Option<u32>,

    /// Seconds allowed for extraction and staging
    #[arg(long, global = true, value_name = "SECS")]
    extract_timeout: Option<u64>,

    /// Seconds to wait for another keg process working on the same package
    #[arg(long, global = true, value_name = "SECS")]
    lock_timeout: Option<u64>,

    /// Seconds allowed for a package's smoke test
    #[arg(long, global = true, value_name = "SECS")]
    test_timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages from manifest files
    Install {
        /// Manifest paths
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },

    /// Uninstall packages
    Uninstall {
        /// Package names
        #[arg(required = true)]
        names: Vec<String>,

        /// Ignore dependents (force uninstall)
        #[arg(long)]
        force: bool,
    },

    /// Point a package's commands at an installed version
    Activate {
        name: String,
        version: String,
    },

    /// List installed packages
    List {
        /// Show all installed versions
        #[arg(long)]
        versions: bool,
    },

    /// Remove inactive versions and stale downloads
    Cleanup {
        /// Only this package
        name: Option<String>,
    },

    /// Run a package's smoke test
    Test {
        name: String,
    },

    /// Generate a manifest from a GitHub release
    Generate {
        /// Manifest to take everything but version and variants from
        #[arg(long)]
        template: PathBuf,

        /// Repository (owner/name)
        #[arg(long, default_value = "GAM-team/GAM")]
        repo: String,

        /// Read the release document from a file instead of the API
        #[arg(long)]
        release_json: Option<PathBuf>,

        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long, default_value = "macos", value_parser = parse_os)]
        os: Os,

        #[arg(long = "arch", default_values = ["arm64", "x86_64"], value_parser = parse_arch)]
        arches: Vec<Arch>,

        #[arg(long, default_value = "tar.xz", value_parser = parse_archive)]
        archive: ArchiveKind,
    },
}

fn parse_os(s: &str) -> std::result::Result<Os, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn parse_arch(s: &str) -> std::result::Result<Arch, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn parse_archive(s: &str) -> std::result::Result<ArchiveKind, String> {
    match s {
        "tar.gz" | "tgz" => Ok(ArchiveKind::TarGz),
        "tar.xz" | "txz" => Ok(ArchiveKind::TarXz),
        "tar" => Ok(ArchiveKind::Tar),
        "raw" => Ok(ArchiveKind::Raw),
        other => Err(format!("unknown archive format: {}", other)),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn settings(cli: &Cli) -> Settings {
    let mut settings = Settings {
        progress: !cli.quiet && std::io::stderr().is_terminal(),
        ..Settings::default()
    };
    if let Some(secs) = cli.fetch_timeout {
        settings.fetch_timeout = Duration::from_secs(secs);
    }
    if let Some(attempts) = cli.attempts {
        settings.fetch_attempts = attempts.max(1);
    }
    if let Some(secs) = cli.extract_timeout {
        settings.extract_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.lock_timeout {
        settings.lock_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.test_timeout {
        settings.test_timeout = Duration::from_secs(secs);
    }
    settings
}

async fn run(cli: Cli) -> Result<()> {
    let layout = cli
        .prefix
        .clone()
        .map(Layout::new)
        .unwrap_or_else(Layout::detect);
    let installer = Installer::new(layout, settings(&cli))?;

    let platform = || -> Result<Platform> {
        match &cli.platform {
            Some(p) => p.parse().map_err(KegError::Other),
            None => Platform::detect().map_err(KegError::Other),
        }
    };

    match cli.command {
        Commands::Install { ref manifests } => {
            commands::install(&installer, manifests, &platform()?).await
        }
        Commands::Uninstall { ref names, force } => {
            commands::uninstall(&installer, names, force).await
        }
        Commands::Activate {
            ref name,
            ref version,
        } => commands::activate(&installer, name, version).await,
        Commands::List { versions } => commands::list(&installer, versions),
        Commands::Cleanup { ref name } => commands::cleanup(&installer, name.as_deref()).await,
        Commands::Test { ref name } => commands::test(&installer, name).await,
        Commands::Generate {
            ref template,
            ref repo,
            ref release_json,
            ref output,
            os,
            ref arches,
            archive,
        } => {
            commands::generate(commands::GenerateArgs {
                template,
                repo,
                release_file: release_json.as_deref(),
                output: output.as_deref(),
                os,
                arches: arches.clone(),
                archive,
            })
            .await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    colors::init_colors();

    tokio::select! {
        result = run(cli) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{} {:#}", "Error:".red().bold(), e);
                ExitCode::from(e.exit_code())
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{} interrupted; partial work discarded", "Error:".red().bold());
            ExitCode::from(130)
        }
    }
}
