use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::trace::dependency_tree::DependencyFilter;

/// Serve the trace exploration API.
#[derive(Debug, Parser)]
#[command(name = "traverse-api", version, about)]
pub struct Cli {
    /// Directory where the bundled data is already / will be stored.
    #[arg(long = "db_dir", default_value = "/tmp/traverse")]
    pub db_dir: PathBuf,
    /// Port to serve the interface from. Overrides TRAVERSE_PORT if specified.
    #[arg(long = "port")]
    pub port: Option<u16>,
    /// Store additional information for debugging source files, etc.
    #[arg(long = "debug")]
    pub debug: bool,
    /// Tracing filter level; info and above also display parsing logs.
    #[arg(long = "log_level", default_value = "info")]
    pub log_level: String,
    /// Optional engine tunables file.
    #[arg(long = "config", default_value = "traverse.toml")]
    pub config: PathBuf,
}

impl Cli {
    pub fn resolved_port(&self) -> u16 {
        self.port
            .or_else(|| {
                std::env::var("TRAVERSE_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
            })
            .unwrap_or(8000)
    }
}

/// Engine tunables loaded from `traverse.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub dependency_tree: DependencyTreeConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DependencyTreeConfig {
    /// Which interval roots are admitted into the dependency tree. The trace
    /// format's two naming generations make this a configuration choice.
    #[serde(default)]
    pub filter: DependencyFilter,
}

impl EngineConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_excludes_apex_main() {
        let config = EngineConfig::default();
        assert_eq!(
            config.dependency_tree.filter,
            DependencyFilter::ExcludeApexMain
        );
    }

    #[test]
    fn toml_selects_dollar_filter() {
        let config: EngineConfig =
            toml::from_str("[dependency_tree]\nfilter = \"require-dollar\"\n").unwrap();
        assert_eq!(
            config.dependency_tree.filter,
            DependencyFilter::RequireDollar
        );
    }
}
