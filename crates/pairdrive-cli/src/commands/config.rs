//! `pairdrive config` - inspect the effective configuration

use std::path::Path;

use anyhow::Result;
use clap::Subcommand;

use pairdrive_core::config::Config;

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as YAML
    Show,
    /// Print the path the configuration is loaded from
    Path,
}

impl ConfigCommand {
    pub fn run(&self, config: Config, path: &Path) -> Result<()> {
        match self {
            ConfigCommand::Show => {
                let mut shown = config;
                // the token never reaches a terminal
                if !shown.network.token.is_empty() {
                    shown.network.token = "<set>".to_string();
                }
                print!("{}", serde_yaml::to_string(&shown)?);
            }
            ConfigCommand::Path => println!("{}", path.display()),
        }
        Ok(())
    }
}
