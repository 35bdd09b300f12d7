use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use chrome_troubleshooter::config::AppConfig;
use chrome_troubleshooter::telemetry;

mod cmd;

#[derive(Parser)]
#[command(name = "chrome-troubleshooter")]
#[command(version, about = "Launch Chrome through progressively safer fallback stages")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config.toml (defaults to the user config directory)
    #[arg(long, global = true)]
    pub config_file: Option<PathBuf>,

    /// Directory that holds session logs. Overrides config and CT_BASE_DIR.
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch the browser, falling back through stages until one is stable
    Launch {
        /// Browser executable (skips discovery)
        #[arg(short, long)]
        executable: Option<PathBuf>,

        /// Read the environment snapshot from a JSON file instead of probing
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Maximum number of stages to try
        #[arg(long)]
        max_attempts: Option<usize>,

        /// Seconds the browser must stay alive to count as launched
        #[arg(long)]
        timeout: Option<u64>,

        /// Extra flag appended to every attempt (repeatable)
        #[arg(long = "extra-flag", allow_hyphen_values = true)]
        extra_flags: Vec<String>,

        /// Do not try Flatpak Chromium after all stages fail
        #[arg(long)]
        no_flatpak: bool,

        /// Skip kernel and journal collection after failed attempts
        #[arg(long)]
        no_diagnostics: bool,

        /// Follow the kernel log while each attempt runs
        #[arg(long)]
        kernel_monitor: bool,
    },
    /// Show the stage plan for this machine
    Stages {
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,

        /// Read the environment snapshot from a JSON file instead of probing
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Print the detected environment snapshot as JSON
    Probe,
    /// Inspect recorded sessions
    Logs {
        /// List all sessions
        #[arg(long)]
        list: bool,

        /// Show the most recent session
        #[arg(long)]
        latest: bool,

        /// Show a session by directory name
        #[arg(long)]
        session: Option<String>,

        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Append kernel and journal diagnostics to a recorded session
    Diag {
        /// Session directory name (defaults to the latest)
        #[arg(long)]
        session: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default config.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(AppConfig::default_path)
    }

    /// File, then `CT_*` environment, then global CLI flags.
    pub fn load_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig::load_or_default(&self.config_path())?;
        config.apply_env();
        if let Some(dir) = &self.base_dir {
            config.logging.base_dir = Some(dir.clone());
        }
        config.clamp();
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    if let Err(err) = telemetry::initialise(&config, cli.verbose) {
        eprintln!("warning: tracing disabled: {}", err);
    }

    match &cli.command {
        Commands::Launch {
            executable,
            snapshot,
            max_attempts,
            timeout,
            extra_flags,
            no_flatpak,
            no_diagnostics,
            kernel_monitor,
        } => {
            let opts = cmd::launch::LaunchOptions {
                executable: executable.clone(),
                snapshot: snapshot.clone(),
                max_attempts: *max_attempts,
                timeout: *timeout,
                extra_flags: extra_flags.clone(),
                no_flatpak: *no_flatpak,
                no_diagnostics: *no_diagnostics,
                kernel_monitor: *kernel_monitor,
            };
            return cmd::cmd_launch(config, opts).await;
        }
        Commands::Stages { json, snapshot } => {
            cmd::cmd_stages(&config, snapshot.as_deref(), *json).await?
        }
        Commands::Probe => cmd::cmd_probe().await?,
        Commands::Logs {
            list,
            latest,
            session,
            format,
        } => cmd::cmd_logs(&config, *list, *latest, session.as_deref(), format)?,
        Commands::Diag { session } => cmd::cmd_diag(&config, session.as_deref()).await?,
        Commands::Config { command } => cmd::cmd_config(&cli, &config, command.clone())?,
    }

    Ok(ExitCode::SUCCESS)
}
