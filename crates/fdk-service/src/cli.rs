// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command-line surface of the service assembly.

use clap::Parser;
use std::path::PathBuf;

/// Command-line options common to every application service.
#[derive(Debug, Clone, Parser)]
#[command(version, about = "Edge application functions service")]
pub struct CommandLine {
    /// Directory containing the configuration file.
    #[arg(short = 'c', long = "config-dir", default_value = "./res")]
    pub config_dir: PathBuf,

    /// Name of the configuration file inside the config directory.
    #[arg(short = 'f', long = "config-file", default_value = "configuration.toml")]
    pub config_file: String,

    /// URL of a remote configuration provider (resolved by an external
    /// bootstrapper; recorded here for parity).
    #[arg(short = 'P', long = "config-provider")]
    pub config_provider: Option<String>,

    /// Location of the shared common configuration.
    #[arg(short = 'C', long = "common-config")]
    pub common_config: Option<String>,

    /// Configuration profile; selects a subdirectory of the config dir.
    #[arg(short = 'p', long = "profile")]
    pub profile: Option<String>,

    /// Register this service with the service registry.
    #[arg(short = 'r', long = "registry")]
    pub use_registry: bool,

    /// Overwrite configuration in the provider with local values.
    #[arg(short = 'o', long = "overwrite")]
    pub overwrite: bool,

    /// Skip the core-contract version compatibility check.
    #[arg(short = 's', long = "skip-version-check")]
    pub skip_version_check: bool,

    /// Override the service key the service registers and stores under.
    #[arg(short = 'k', long = "service-key")]
    pub service_key: Option<String>,

    /// Run in developer mode (local hosts take precedence).
    #[arg(short = 'd', long = "dev")]
    pub dev_mode: bool,

    /// Comma-separated local, remote, and bind host names for remote
    /// service mode.
    #[arg(short = 'H', long = "remote-service-hosts")]
    pub remote_service_hosts: Option<String>,
}

impl CommandLine {
    /// The effective configuration file path: `config_dir[/profile]/file`.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        let mut path = self.config_dir.clone();
        if let Some(profile) = &self.profile {
            path.push(profile);
        }
        path.push(&self.config_file);
        path
    }

    /// Parse the three remote-service host names, when provided.
    ///
    /// Returns `None` when the flag is absent or does not carry exactly
    /// three comma-separated names.
    #[must_use]
    pub fn remote_hosts(&self) -> Option<[String; 3]> {
        let raw = self.remote_service_hosts.as_deref()?;
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [local, remote, bind] if !local.is_empty() && !remote.is_empty() && !bind.is_empty() => {
                Some([
                    (*local).to_string(),
                    (*remote).to_string(),
                    (*bind).to_string(),
                ])
            }
            _ => None,
        }
    }
}
