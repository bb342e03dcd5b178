//! Configuration for launching PTY sessions
//!
//! Config precedence: CLI > env > file > defaults. The file is TOML and lives
//! at `<config_dir>/pty-session/config.toml` unless `--config` names another.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::pty::FIXED_SHELL;

/// Environment variable overriding [`LaunchConfig::shell`]
pub const ENV_SHELL: &str = "PTY_SESSION_SHELL";
/// Environment variable overriding [`LaunchConfig::shell_policy`]
pub const ENV_SHELL_POLICY: &str = "PTY_SESSION_SHELL_POLICY";

/// CLI arguments for the `pty-session` binary
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "pty-session")]
#[command(version)]
#[command(about = "Launch a shell on a new PTY session and report on it", long_about = None)]
pub struct CliArgs {
    /// Path to custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Shell to launch (absolute path)
    #[arg(short, long, value_name = "SHELL")]
    pub shell: Option<String>,

    /// Whether to honour the shell path or always run /bin/sh (requested, fixed)
    #[arg(short, long, value_name = "POLICY")]
    pub policy: Option<String>,

    /// Print the session report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Which program the launcher execs in the child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShellPolicy {
    /// Exec the shell path passed to `launch`
    #[default]
    Requested,
    /// Always exec `/bin/sh`, ignoring the requested path
    Fixed,
}

impl ShellPolicy {
    /// Pick the program to exec for a requested shell path
    pub fn resolve<'a>(self, requested: &'a str) -> &'a str {
        match self {
            ShellPolicy::Requested => requested,
            ShellPolicy::Fixed => FIXED_SHELL,
        }
    }
}

impl FromStr for ShellPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "requested" => Ok(ShellPolicy::Requested),
            "fixed" => Ok(ShellPolicy::Fixed),
            other => Err(ConfigError {
                message: format!("Unknown shell policy '{}'. Expected 'requested' or 'fixed'", other),
                field: Some("shell_policy".to_string()),
            }),
        }
    }
}

impl fmt::Display for ShellPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellPolicy::Requested => f.write_str("requested"),
            ShellPolicy::Fixed => f.write_str("fixed"),
        }
    }
}

/// Launch configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Shell to launch
    pub shell: String,
    /// Whether `shell` is honoured
    pub shell_policy: ShellPolicy,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            shell: FIXED_SHELL.to_string(),
            shell_policy: ShellPolicy::default(),
        }
    }
}

/// Configuration error with an optional offending field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "Config error in '{}': {}", field, self.message)
        } else {
            write!(f, "Config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl LaunchConfig {
    /// Load configuration with full precedence:
    /// CLI args > environment variables > config file > defaults
    pub fn load_with_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            // An explicitly named file must load
            Some(path) => Self::load_from_file(path)?,
            None => Self::default_config_path()
                .filter(|path| path.exists())
                .and_then(|path| match Self::load_from_file(&path) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                        None
                    },
                })
                .unwrap_or_default(),
        };

        config.apply_env_vars()?;
        config.apply_cli_args(args)?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("Failed to read config file {}: {}", path.display(), e),
            field: None,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError {
            message: format!("Failed to parse config file: {}", e),
            field: None,
        })
    }

    /// Apply environment variables to config
    pub fn apply_env_vars(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| env::var(key).ok())
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(shell) = lookup(ENV_SHELL) {
            self.shell = shell;
        }
        if let Some(policy) = lookup(ENV_SHELL_POLICY) {
            self.shell_policy = policy.parse()?;
        }
        Ok(())
    }

    /// Apply CLI arguments to config
    pub fn apply_cli_args(&mut self, args: &CliArgs) -> Result<(), ConfigError> {
        if let Some(shell) = &args.shell {
            self.shell = shell.clone();
        }
        if let Some(policy) = &args.policy {
            self.shell_policy = policy.parse()?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_shell_path(&self.shell).map_err(|reason| ConfigError {
            message: format!("Invalid shell '{}': {}", self.shell, reason),
            field: Some("shell".to_string()),
        })
    }

    /// The program the launcher will exec for this config
    pub fn effective_shell(&self) -> &str {
        self.shell_policy.resolve(&self.shell)
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("pty-session").join("config.toml"))
    }
}

/// Check that `path` can be handed to `execve` as-is.
///
/// `execve` does not search `PATH`, so the shell must be absolute.
pub(crate) fn check_shell_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("path is empty");
    }
    if path.contains('\0') {
        return Err("path contains a NUL byte");
    }
    if !Path::new(path).is_absolute() {
        return Err("not an absolute path");
    }
    Ok(())
}
