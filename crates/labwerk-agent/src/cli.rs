// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command-line flags and how they layer over the settings file.

use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use tracing::info;

use labwerk_core::config::AgentConfig;
use labwerk_core::error::Result;

use crate::data_dir::SETTINGS_FILE;

/// `-h` is the controller host, so help is `--help` only.
#[derive(Debug, Parser)]
#[command(
    name = "labwerk",
    version,
    about = "Labwerk edge agent: label printers and barcode scanners for a lab controller",
    disable_help_flag = true
)]
pub struct Cli {
    /// Controller host
    #[arg(short = 'h', long)]
    pub host: Option<String>,

    /// Controller port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Scanner device: video device, hidraw path or vvvv:pppp USB ids
    #[arg(short, long)]
    pub device: Option<String>,

    /// Capture pipeline override for webcam scanning
    #[arg(short = 'c', long = "cmd")]
    pub capture_command: Option<String>,

    /// Accept any controller certificate
    #[arg(short, long)]
    pub insecure: bool,

    /// Verbose logging
    #[arg(short = 'D', long)]
    pub debug: bool,

    /// Settings file (defaults to settings.json in the data directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory holding settings and the node id
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    #[allow(dead_code)]
    help: Option<bool>,
}

impl Cli {
    /// Load the settings file and apply flag overrides.
    ///
    /// An explicitly named file must exist; the default one is optional.
    pub fn load_config(&self, data_dir: &Path) -> Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)?,
            None => {
                let path = data_dir.join(SETTINGS_FILE);
                if path.exists() {
                    AgentConfig::load(&path)?
                } else {
                    info!(path = %path.display(), "no settings file, using defaults");
                    AgentConfig::default()
                }
            }
        };
        self.apply(&mut config);
        Ok(config)
    }

    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(device) = &self.device {
            config.scanner.device = device.clone();
        }
        if let Some(command) = &self.capture_command {
            config.scanner.capture_command = Some(command.clone());
        }
        if self.insecure {
            config.tls.insecure = true;
        }
        if self.debug {
            config.debug = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_settings() {
        let cli = Cli::try_parse_from([
            "labwerk", "-h", "ctrl.lab", "-p", "6000", "-d", "0c2e:0b61", "-i", "-D",
        ])
        .unwrap();
        let mut config = AgentConfig::default();
        config.host = "old.lab".into();
        cli.apply(&mut config);

        assert_eq!(config.host, "ctrl.lab");
        assert_eq!(config.port, 6000);
        assert_eq!(config.scanner.device, "0c2e:0b61");
        assert!(config.tls.insecure);
        assert!(config.debug);
    }

    #[test]
    fn absent_flags_leave_settings_alone() {
        let cli = Cli::try_parse_from(["labwerk"]).unwrap();
        let mut config = AgentConfig::default();
        config.host = "ctrl.lab".into();
        config.port = 7000;
        cli.apply(&mut config);
        assert_eq!(config.host, "ctrl.lab");
        assert_eq!(config.port, 7000);
        assert!(!config.tls.insecure);
    }

    #[test]
    fn long_help_still_works() {
        let err = Cli::try_parse_from(["labwerk", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn settings_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut stored = AgentConfig::default();
        stored.host = "ctrl.lab".into();
        stored.persist(dir.path().join(SETTINGS_FILE)).unwrap();

        let cli = Cli::try_parse_from(["labwerk", "--port", "6001"]).unwrap();
        let config = cli.load_config(dir.path()).unwrap();
        assert_eq!(config.host, "ctrl.lab");
        assert_eq!(config.port, 6001);
    }

    #[test]
    fn missing_explicit_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let cli = Cli::try_parse_from(["labwerk", "--config", missing.to_str().unwrap()]).unwrap();
        assert!(cli.load_config(dir.path()).is_err());
    }
}
