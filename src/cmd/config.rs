//! Configuration view and validation commands (`config`).

use anyhow::{Result, bail};
use console::style;

use chrome_troubleshooter::config::AppConfig;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, config: &AppConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = cli.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {} (using defaults)", config_path.display());
            }
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!();
            print!("{}", toml::to_string_pretty(config)?);
            println!();
            println!("  base_dir  = {}", config.base_dir().display());
            println!("  lock_path = {}", config.lock_path().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            if config_path.exists() {
                // Re-read so syntax errors surface here, not as defaults.
                AppConfig::load(&config_path)?;
            }
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{} Configuration is valid", style("✓").green().bold());
            } else {
                for warning in &warnings {
                    println!("{} {}", style("!").yellow().bold(), warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                bail!(
                    "{} already exists. Use --force to overwrite.",
                    config_path.display()
                );
            }
            AppConfig::default().save(&config_path)?;
            println!(
                "{} Wrote default configuration to {}",
                style("✓").green().bold(),
                config_path.display()
            );
        }
    }

    Ok(())
}
