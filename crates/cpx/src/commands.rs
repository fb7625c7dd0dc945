//! 🎭 Commands: import, export, copy. Tagged data, not a class hierarchy.
//!
//! Each command kind knows two things: which options it reads (`option_schema`) and how a
//! config turns into a job plan (`plan`). Planning is pure: it looks at the config and nothing
//! else. Turning input paths into splits is the one step that touches the disk, and it lives in
//! `collect_splits` so nobody mistakes it for planning.

use serde::Deserialize;
use tracing::warn;

use anyhow::Result;

use crate::app_config::AppConfig;
use crate::backends::DestinationConfig;
use crate::common::Split;
use crate::errors::PumpError;
use crate::readers::{CompressionCodec, InputType, ReaderKind};

/// 🎭 What the job does.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// files → store
    #[default]
    Import,
    /// store → directory
    Export,
    /// store → store
    Copy,
}

/// 📜 One option a command understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionSpec {
    /// dotted config key
    pub key: &'static str,
    pub help: &'static str,
}

const fn opt(key: &'static str, help: &'static str) -> OptionSpec {
    OptionSpec { key, help }
}

const IMPORT_OPTIONS: &[OptionSpec] = &[
    opt("runtime.worker_count", "splits processed at once (W)"),
    opt("runtime.per_split_thread_count", "writer tasks per split (T), 0 = inline"),
    opt("runtime.thread_cap_enforced", "clamp T to W/2 when several splits are queued"),
    opt("runtime.queue_capacity", "records buffered between a reader and its writers"),
    opt("input.input_type", "documents | aggregates | delimited_text | archive"),
    opt("input.record_element_name", "element that makes one record in an aggregate"),
    opt("input.record_namespace", "namespace of the record element"),
    opt("input.id_field_name", "@attribute, child element, or column that names each document"),
    opt("input.delimiter_char", "field delimiter for delimited text"),
    opt("input.compression_codec", "none | archive | gzip"),
    opt("input.allow_empty_metadata", "accept archive content entries without metadata"),
    opt("input.content_kind", "xml | text | binary | mixed"),
    opt("input.filename_as_collection", "add the source file name as a collection"),
    opt("input.input_file_pattern", "regex a file name must match to be read from a directory"),
    opt("output.batch_size", "documents per submission"),
    opt("output.transaction_size", "batches per transaction"),
    opt("output.fast_path_enabled", "write straight to partitions"),
    opt("output.destination_prefix", "URI directory every document lands under"),
    opt("output.clean_destination", "clear the destination prefix first"),
    opt("output.access_grants", "flat role, capability pairs"),
    opt("output.collections", "collections added to every document"),
    opt("output.uri_prefix", "prepended to every URI"),
    opt("output.uri_suffix", "appended to every URI"),
    opt("output.quality", "quality stamped on every document"),
    opt("output.uri_replace", "pattern, replacement pairs applied to every URI"),
    opt("output.copy_collections", "keep an archived document's collections"),
    opt("output.copy_permissions", "keep an archived document's permissions"),
    opt("output.copy_properties", "keep an archived document's properties"),
    opt("output.copy_quality", "keep an archived document's quality"),
    opt("destination", "Http | File | InMemory"),
    opt("partition_map", "partition id → host, for the fast path"),
    opt("hosts", "hosts for round-robin placement"),
    opt("splits", "resolved split list"),
    opt("input_paths", "files or directories, one whole-file split each"),
];

const EXPORT_OPTIONS: &[OptionSpec] = &[
    opt("runtime.worker_count", "splits processed at once (W)"),
    opt("runtime.per_split_thread_count", "writer tasks per split (T), 0 = inline"),
    opt("runtime.queue_capacity", "records buffered between a reader and its writers"),
    opt("input.source", "credentials for the source store"),
    opt("input.content_kind", "xml | text | binary | mixed"),
    opt("output.uri_prefix", "prepended to every exported path"),
    opt("output.uri_suffix", "appended to every exported path"),
    opt("output.uri_replace", "pattern, replacement pairs applied to every exported path"),
    opt("destination.File.root", "directory the documents are written under"),
    opt("splits", "source host URL, start offset, and length per split"),
];

const COPY_OPTIONS: &[OptionSpec] = &[
    opt("runtime.worker_count", "splits processed at once (W)"),
    opt("runtime.per_split_thread_count", "writer tasks per split (T), 0 = inline"),
    opt("runtime.thread_cap_enforced", "clamp T to W/2 when several splits are queued"),
    opt("runtime.queue_capacity", "records buffered between a reader and its writers"),
    opt("input.source", "credentials for the source store"),
    opt("output.batch_size", "documents per submission"),
    opt("output.transaction_size", "batches per transaction"),
    opt("output.fast_path_enabled", "write straight to partitions"),
    opt("output.destination_prefix", "URI directory every document lands under"),
    opt("output.clean_destination", "clear the destination prefix first"),
    opt("output.access_grants", "flat role, capability pairs"),
    opt("output.collections", "collections added to every document"),
    opt("output.quality", "quality stamped on every document"),
    opt("output.uri_replace", "pattern, replacement pairs applied to every URI"),
    opt("output.copy_collections", "keep the source document's collections"),
    opt("output.copy_permissions", "keep the source document's permissions"),
    opt("output.copy_properties", "keep the source document's properties"),
    opt("output.copy_quality", "keep the source document's quality"),
    opt("destination", "Http | InMemory"),
    opt("partition_map", "partition id → host, for the fast path"),
    opt("hosts", "hosts for round-robin placement"),
    opt("splits", "source host URL, start offset, and length per split"),
];

/// 🗺️ What a job will do, decided before anything runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPlan {
    pub command: CommandKind,
    pub reader: ReaderKind,
}

impl CommandKind {
    pub fn option_schema(&self) -> &'static [OptionSpec] {
        match self {
            CommandKind::Import => IMPORT_OPTIONS,
            CommandKind::Export => EXPORT_OPTIONS,
            CommandKind::Copy => COPY_OPTIONS,
        }
    }

    /// 🗺️ Pick the reader and check the command's destination and patterns. Pure; no I/O.
    pub fn plan(&self, config: &AppConfig) -> Result<JobPlan> {
        config.output.uri_replacements()?;
        let reader = match self {
            CommandKind::Import => {
                config.input.file_pattern()?;
                import_reader(config)?
            }
            CommandKind::Export => {
                if !matches!(config.destination, DestinationConfig::File(_)) {
                    return Err(PumpError::config("export writes to a File destination").into());
                }
                ReaderKind::StoreDocument
            }
            CommandKind::Copy => {
                if matches!(config.destination, DestinationConfig::File(_)) {
                    return Err(PumpError::config("copy writes to a store; use export for a directory").into());
                }
                ReaderKind::StoreDocument
            }
        };
        Ok(JobPlan {
            command: *self,
            reader,
        })
    }
}

fn import_reader(config: &AppConfig) -> Result<ReaderKind> {
    let compressed = config.input.compression_codec != CompressionCodec::None;
    Ok(match (config.input.input_type, compressed) {
        (InputType::DelimitedText, true) => ReaderKind::CompressedDelimited,
        (InputType::DelimitedText, false) => ReaderKind::Delimited,
        (InputType::Aggregates, false) => ReaderKind::Aggregate,
        (InputType::Documents, false) => ReaderKind::RawDocument,
        (InputType::Archive, _) => ReaderKind::Archive,
        (other, true) => {
            return Err(PumpError::config(format!(
                "compression_codec only applies to delimited text and archives, not {other:?}"
            ))
            .into());
        }
    })
}

/// 📂 The configured splits, plus one whole-file split per input path.
pub(crate) fn collect_splits(config: &AppConfig) -> Result<Vec<Split>> {
    if config.command != CommandKind::Import {
        if !config.input_paths.is_empty() {
            warn!("⚠️ input_paths only mean something to import; ignoring them");
        }
        return Ok(config.splits.clone());
    }
    let mut splits = config
        .splits
        .iter()
        .map(Split::as_whole_file)
        .collect::<Result<Vec<_>>>()?;
    for path in &config.input_paths {
        splits.push(Split::whole(path)?);
    }
    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::FileStoreConfig;
    use crate::errors::is_configuration_error;
    use crate::readers::InputConfig;

    fn import_of(input_type: InputType, codec: CompressionCodec) -> AppConfig {
        AppConfig {
            input: InputConfig {
                input_type,
                compression_codec: codec,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn the_one_where_import_picks_the_right_reader_for_the_job() -> Result<()> {
        let cases = [
            (InputType::Documents, CompressionCodec::None, ReaderKind::RawDocument),
            (InputType::Aggregates, CompressionCodec::None, ReaderKind::Aggregate),
            (InputType::DelimitedText, CompressionCodec::None, ReaderKind::Delimited),
            (InputType::DelimitedText, CompressionCodec::Gzip, ReaderKind::CompressedDelimited),
            (InputType::Archive, CompressionCodec::None, ReaderKind::Archive),
        ];
        for (input_type, codec, expected) in cases {
            let plan = CommandKind::Import.plan(&import_of(input_type, codec))?;
            assert_eq!(plan.reader, expected, "{input_type:?} + {codec:?}");
        }
        let err = CommandKind::Import
            .plan(&import_of(InputType::Aggregates, CompressionCodec::Gzip))
            .expect_err("compressed aggregates are not a thing here");
        assert!(is_configuration_error(&err));
        Ok(())
    }

    #[test]
    fn the_one_where_export_insists_on_a_directory() -> Result<()> {
        let err = CommandKind::Export
            .plan(&AppConfig::default())
            .expect_err("in-memory is not a directory");
        assert!(is_configuration_error(&err));

        let config = AppConfig {
            command: CommandKind::Export,
            destination: DestinationConfig::File(FileStoreConfig {
                root: "/tmp/out".into(),
            }),
            ..Default::default()
        };
        assert_eq!(CommandKind::Export.plan(&config)?.reader, ReaderKind::StoreDocument);
        assert!(CommandKind::Copy.plan(&config).is_err());
        assert_eq!(CommandKind::Copy.plan(&AppConfig::default())?.reader, ReaderKind::StoreDocument);
        Ok(())
    }

    #[test]
    fn the_one_where_every_command_can_explain_itself() {
        for command in [CommandKind::Import, CommandKind::Export, CommandKind::Copy] {
            let schema = command.option_schema();
            assert!(schema.iter().any(|o| o.key == "runtime.worker_count"));
            assert!(schema.iter().any(|o| o.key == "splits"));
        }
        assert!(CommandKind::Import.option_schema().iter().any(|o| o.key == "input.delimiter_char"));
        assert!(!CommandKind::Export.option_schema().iter().any(|o| o.key == "output.fast_path_enabled"));
    }

    #[test]
    fn the_one_where_bad_patterns_are_caught_at_planning() {
        let mut config = import_of(InputType::Documents, CompressionCodec::None);
        config.input.input_file_pattern = Some("[unclosed".to_string());
        let err = CommandKind::Import.plan(&config).err().expect("bad file pattern");
        assert!(is_configuration_error(&err), "{err:#}");

        let mut config = import_of(InputType::Documents, CompressionCodec::None);
        config.output.uri_replace = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let err = CommandKind::Import.plan(&config).err().expect("odd replace list");
        assert!(is_configuration_error(&err), "{err:#}");
    }

    #[test]
    fn the_one_where_input_paths_become_whole_file_splits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("a.csv");
        std::fs::write(&file, "x\n1\n")?;
        let config = AppConfig {
            splits: vec![Split::new("given", 0, 1)],
            input_paths: vec![file.clone()],
            ..Default::default()
        };
        let splits = collect_splits(&config)?;
        assert_eq!(splits, vec![Split::new("given", 0, 1), Split::new(&file, 0, 4)]);
        Ok(())
    }

    #[test]
    fn the_one_where_configured_splits_must_swallow_the_whole_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("rows.csv");
        std::fs::write(&file, "id,v\n1,a\n2,b\n3,c\n")?;

        let halves = AppConfig {
            splits: vec![Split::new(&file, 0, 8), Split::new(&file, 8, 8)],
            ..Default::default()
        };
        let err = collect_splits(&halves).err().ok_or_else(|| anyhow::anyhow!("halves accepted"))?;
        assert!(is_configuration_error(&err), "{err:#}");

        let unmeasured = AppConfig {
            splits: vec![Split::new(&file, 0, 0)],
            ..Default::default()
        };
        assert_eq!(collect_splits(&unmeasured)?, vec![Split::new(&file, 0, 17)]);
        Ok(())
    }
}
