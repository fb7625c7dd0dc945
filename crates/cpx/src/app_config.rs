//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing.", said every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment. Each section lives next to the code that reads it:
//! `runtime` with the supervisor, `input` with the readers, `output` with the writers,
//! `destination` with the backends. This file just stitches them together.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::DestinationConfig;
use crate::commands::CommandKind;
use crate::common::Split;
use crate::readers::InputConfig;
use crate::supervisors::RuntimeConfig;
use crate::writers::OutputConfig;

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    /// 🎭 import, export, or copy
    #[serde(default)]
    pub command: CommandKind,
    #[serde(default, alias = "supervisor_config")]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    /// 🗺️ partition id → host. Only meaningful on the fast path.
    #[serde(default)]
    pub partition_map: Option<BTreeMap<String, String>>,
    /// 🏠 Hosts for round-robin placement when there is no partition map.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// 🧩 The resolved work list. Whoever planned the job put it here.
    #[serde(default)]
    pub splits: Vec<Split>,
    /// 📂 Shorthand: each path becomes one whole-file split.
    #[serde(default, alias = "input_file_path")]
    pub input_paths: Vec<PathBuf>,
}

/// 🚀 Load the config, from a file, from env vars, or from the sheer power of hoping.
///
/// 🔧 Merges environment variables (`CPX_*`, nested keys joined by `__`) with an optional TOML
/// file. If a file is given, it wins on conflicts. No file means env vars only. No pizza defaults.
///
/// 💀 Returns an error if config is unparseable. The message says which layer was involved.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("CPX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (CPX_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (CPX_*). \
                 No file was provided, this one's all on the environment. Classic."
            .to_string(),
    };

    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readers::InputType;
    use std::fs;

    fn write_test_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("cpx.toml");
        fs::write(&path, contents).expect("💀 Failed to write test config. The filesystem said 'new phone who dis'.");
        path
    }

    #[test]
    fn the_one_where_every_section_finds_its_apartment() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_test_config(
            &dir,
            r#"
            command = "import"
            hosts = ["h1", "h2"]

            [runtime]
            thread_count = 8
            per_split_thread_count = 3
            queue_capacity = 16

            [input]
            input_type = "delimited_text"
            uri_id = "id"
            input_file_pattern = "^A.*"

            [output]
            batch_size = 50
            output_directory = "/landing"
            output_cleandir = true
            output_permissions = ["reader", "read"]
            output_uri_replace = ["wiki", "'wiki1'"]
            copy_quality = false

            [destination.Http]
            url = "http://store-1:8000"
            api_key = "k"

            [partition_map]
            p1 = "http://store-1:8000"

            [[splits]]
            path = "/data/big.csv"
            length = 100
            "#,
        );

        let config = load_config(Some(path.as_path()))?;
        assert_eq!(config.command, CommandKind::Import);
        assert_eq!(config.runtime.worker_count, 8);
        assert_eq!(config.runtime.per_split_thread_count, 3);
        assert_eq!(config.runtime.queue_capacity, 16);
        assert_eq!(config.input.input_type, InputType::DelimitedText);
        assert_eq!(config.output.batch_size, 50);
        assert_eq!(config.output.destination_prefix.as_deref(), Some("/landing"));
        assert!(config.output.clean_destination);
        assert_eq!(config.output.access_grants, vec!["reader", "read"]);
        assert_eq!(config.output.uri_replace, vec!["wiki", "'wiki1'"]);
        assert!(!config.output.copy_quality);
        assert!(config.output.copy_collections);
        assert_eq!(config.input.input_file_pattern.as_deref(), Some("^A.*"));
        assert_eq!(config.hosts, vec!["h1", "h2"]);
        assert_eq!(config.splits, vec![Split::new("/data/big.csv", 0, 100)]);
        match config.destination {
            DestinationConfig::Http(http) => assert_eq!(http.api_key.as_deref(), Some("k")),
            honestly_who_knows => panic!(
                "💀 Expected an Http destination, but serde took us to {:?}. Plot twist energy.",
                honestly_who_knows
            ),
        }
        assert_eq!(config.partition_map.map(|m| m.len()), Some(1));
        Ok(())
    }

    #[test]
    fn the_one_where_defaults_show_up_uninvited_but_helpful() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_test_config(&dir, "");
        let config: AppConfig = Figment::new().merge(Toml::file(path.as_path())).extract()?;

        assert_eq!(config.command, CommandKind::Import);
        assert_eq!(config.runtime.worker_count, 4);
        assert_eq!(config.runtime.per_split_thread_count, 0);
        assert!(config.runtime.thread_cap_enforced);
        assert_eq!(config.output.batch_size, 100);
        assert_eq!(config.output.transaction_size, 10);
        assert_eq!(config.input.delimiter_char, ',');
        assert!(matches!(config.destination, DestinationConfig::InMemory(_)));
        assert!(config.partition_map.is_none());
        Ok(())
    }
}
