// cli/src/main.rs: lzbt entrypoint

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::debug;

use lanzatool::config::{FileConfig, InstallConfig, Overrides, CONFIG_ENV};
use lanzatool::esp::Esp;
use lanzatool::inspect::{inspect_esp, print_human};
use lanzatool::install::{InstallReport, Installer};
use lanzatool::logging;
use lanzatool::Result;

#[derive(Parser)]
#[command(
    name = "lzbt",
    version,
    about = "lzbt: Secure Boot installer for NixOS",
    long_about = "lzbt signs NixOS generations and installs them onto the EFI system partition as lanzaboote UKIs, one per generation, and removes entries that are no longer retained."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// More diagnostics on stderr (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the given generations and collect garbage
    Install(InstallArgs),
    /// Check the entries currently on the ESP
    Status {
        #[arg(long)]
        esp: Option<PathBuf>,
    },
}

#[derive(Args)]
struct InstallArgs {
    #[arg(long)]
    esp: Option<PathBuf>,
    #[arg(long)]
    stub: Option<PathBuf>,
    #[arg(long)]
    public_key: Option<PathBuf>,
    #[arg(long)]
    private_key: Option<PathBuf>,
    /// Keep at most this many generations
    #[arg(long)]
    configuration_limit: Option<usize>,
    /// systemd-boot binary to sign and install
    #[arg(long)]
    systemd_boot: Option<PathBuf>,
    #[arg(long)]
    store_dir: Option<PathBuf>,
    /// `/nix/var/nix/profiles/system-<N>-link` paths
    #[arg(required = true)]
    generations: Vec<PathBuf>,
}

impl InstallArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            esp: self.esp.clone(),
            stub: self.stub.clone(),
            public_key: self.public_key.clone(),
            private_key: self.private_key.clone(),
            configuration_limit: self.configuration_limit,
            systemd_boot: self.systemd_boot.clone(),
            store_dir: self.store_dir.clone(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {e}", "[lzbt]".red().bold());
            ExitCode::from(2)
        }
    }
}

/// `Ok(false)` means the command ran but something in it failed.
fn run(cli: &Cli) -> Result<bool> {
    let file = FileConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Install(args) => {
            let config = InstallConfig::resolve(file, args.overrides())?;
            debug!(?config, "resolved configuration");
            let installer = Installer::from_config(config)?;
            let report = installer.install(&args.generations)?;
            if cli.json {
                print_json(&report)?;
            } else {
                print_report(&report);
            }
            Ok(report.succeeded())
        }
        Commands::Status { esp } => {
            let esp = Esp::open(&file.esp(esp.clone()))?;
            let entries = inspect_esp(&esp)?;
            if cli.json {
                print_json(&entries)?;
            } else {
                print_human(&entries);
            }
            Ok(entries.iter().all(|e| e.bootable()))
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| lanzatool::InstallError::Config(format!("cannot encode report: {e}")))?;
    println!("{text}");
    Ok(())
}

fn print_report(report: &InstallReport) {
    for id in &report.installed {
        println!("[{}] {id}", "installed".green());
    }
    for id in &report.unchanged {
        println!("[{}] {id}", "unchanged".dimmed());
    }
    for id in &report.dropped {
        println!("[{}] {id} (store paths gone)", "dropped".yellow());
    }
    for number in &report.kept {
        println!("[{}] generation {number} (stands in for an entry that is not bootable)", "kept".yellow());
    }
    if let Some(gc) = &report.gc {
        for path in &gc.removed {
            println!("[{}] {path}", "removed".yellow());
        }
        if gc.artifacts_skipped {
            println!("[{}] unreadable entry on the ESP, kept all kernels and initrds", "gc".yellow());
        }
    }
    for failure in &report.failed {
        println!("[{}] {}: {}", "failed".red().bold(), failure.target, failure.error);
    }
}
