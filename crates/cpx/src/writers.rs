//! ✍️ Writers: where records stop being promises and start being rows in somebody's database.
//!
//! 🧭 The pieces, in the order a document meets them:
//! - `Decoration`: prefix, suffix, collections, grants, quality. Makeup before the show.
//! - `PartitionRouter`: which connection handle does this URI go to?
//! - `ContentWriter`: batches per destination, transactions around batches, rollback on failure.
//! - `preflight`: the bouncer. Checks the destination once before anybody writes anything.
//!
//! 🦆 The duck reviewed this module and asked only that the batches be kept small.

use anyhow::Result;
use regex::Regex;
use serde::Deserialize;

use crate::common::{AccessGrant, Document, DocumentMetadata};
use crate::errors::PumpError;

pub(crate) mod content_writer;
pub(crate) mod preflight;
pub(crate) mod router;

pub(crate) use content_writer::ContentWriter;
pub(crate) use router::{PartitionMap, PartitionRouter};

/// 🔧 Writer knobs, with the old option names kept as aliases.
#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// 📦 Documents per submission.
    #[serde(default = "default_batch_size", alias = "batchsize")]
    pub batch_size: usize,
    /// 🧾 Batches per transaction. 1 = every batch auto-commits.
    #[serde(default = "default_transaction_size", alias = "transaction")]
    pub transaction_size: usize,
    /// 🏎️ Write straight to partitions instead of letting the store place documents.
    #[serde(default, alias = "fastload")]
    pub fast_path_enabled: bool,
    /// 📂 Directory-like URI prefix every document lands under.
    #[serde(default, alias = "output_directory")]
    pub destination_prefix: Option<String>,
    /// 🧹 Clear the destination prefix before writing instead of refusing to start.
    #[serde(default, alias = "output_cleandir")]
    pub clean_destination: bool,
    /// 🔒 Flat role, capability, role, capability...
    #[serde(default, alias = "output_permissions")]
    pub access_grants: Vec<String>,
    #[serde(default, alias = "output_collections")]
    pub collections: Vec<String>,
    #[serde(default, alias = "output_uri_prefix")]
    pub uri_prefix: Option<String>,
    #[serde(default, alias = "output_uri_suffix")]
    pub uri_suffix: Option<String>,
    #[serde(default, alias = "output_quality")]
    pub quality: Option<i32>,
    /// 🔁 Flat pattern, replacement, pattern, replacement... run over each URI before the
    /// prefix and suffix go on. A replacement may be wrapped in single quotes.
    #[serde(default, alias = "output_uri_replace")]
    pub uri_replace: Vec<String>,
    /// 📋 Keep the collections a copied or archived document arrives with.
    #[serde(default = "default_true")]
    pub copy_collections: bool,
    #[serde(default = "default_true")]
    pub copy_permissions: bool,
    #[serde(default = "default_true")]
    pub copy_properties: bool,
    #[serde(default = "default_true")]
    pub copy_quality: bool,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

fn default_transaction_size() -> usize {
    10
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            transaction_size: default_transaction_size(),
            fast_path_enabled: false,
            destination_prefix: None,
            clean_destination: false,
            access_grants: Vec::new(),
            collections: Vec::new(),
            uri_prefix: None,
            uri_suffix: None,
            quality: None,
            uri_replace: Vec::new(),
            copy_collections: true,
            copy_permissions: true,
            copy_properties: true,
            copy_quality: true,
        }
    }
}

impl OutputConfig {
    /// 🏎️ Fast path is on when asked for, or when a destination prefix comes with a partition map.
    pub(crate) fn fast_path(&self, has_partition_map: bool) -> bool {
        self.fast_path_enabled || (self.destination_prefix.is_some() && has_partition_map)
    }

    /// 🔁 `uri_replace`, compiled into (pattern, replacement) pairs.
    pub(crate) fn uri_replacements(&self) -> Result<Vec<(Regex, String)>> {
        if self.uri_replace.len() % 2 != 0 {
            return Err(PumpError::config(format!(
                "uri_replace takes pattern, replacement pairs; got {} values",
                self.uri_replace.len()
            ))
            .into());
        }
        self.uri_replace
            .chunks_exact(2)
            .map(|pair| -> Result<(Regex, String)> {
                let (pattern, replacement) = (&pair[0], &pair[1]);
                let regex = Regex::new(pattern).map_err(|e| {
                    PumpError::config(format!("uri_replace pattern '{pattern}' is not a valid regex: {e}"))
                })?;
                let replacement = replacement
                    .strip_prefix('\'')
                    .and_then(|r| r.strip_suffix('\''))
                    .unwrap_or(replacement);
                Ok((regex, replacement.to_string()))
            })
            .collect()
    }
}

/// 📋 Which pieces of a document's own metadata survive the trip.
#[derive(Debug, Clone, Copy)]
struct MetadataCarry {
    collections: bool,
    grants: bool,
    properties: bool,
    quality: bool,
}

impl MetadataCarry {
    fn strip(&self, metadata: &mut DocumentMetadata) {
        if !self.collections {
            metadata.collections.clear();
        }
        if !self.grants {
            metadata.grants.clear();
        }
        if !self.properties {
            metadata.properties.clear();
        }
        if !self.quality {
            metadata.quality = 0;
        }
    }
}

/// 💄 What every outgoing document gets dressed in. Built once per job, shared by all writers.
#[derive(Debug, Clone, Default)]
pub(crate) struct Decoration {
    uri_replace: Vec<(Regex, String)>,
    uri_prefix: String,
    uri_suffix: String,
    destination_prefix: Option<String>,
    collections: Vec<String>,
    grants: Vec<AccessGrant>,
    quality: Option<i32>,
    /// None: whatever metadata a document carries is kept as is.
    carry: Option<MetadataCarry>,
}

impl Decoration {
    /// `source_metadata` says documents arrive with metadata of their own (copies and
    /// archives); only then do the `copy_*` switches apply.
    pub(crate) fn new(output: &OutputConfig, grants: Vec<AccessGrant>, source_metadata: bool) -> Result<Self> {
        let carry = source_metadata.then_some(MetadataCarry {
            collections: output.copy_collections,
            grants: output.copy_permissions,
            properties: output.copy_properties,
            quality: output.copy_quality,
        });
        Ok(Self {
            uri_replace: output.uri_replacements()?,
            uri_prefix: output.uri_prefix.clone().unwrap_or_default(),
            uri_suffix: output.uri_suffix.clone().unwrap_or_default(),
            destination_prefix: output.destination_prefix.clone(),
            collections: output.collections.clone(),
            grants,
            quality: output.quality,
            carry,
        })
    }

    /// 🔗 Replacements first, then `prefix + uri + suffix`, then tucked under the destination
    /// directory.
    pub(crate) fn uri(&self, uri: &str) -> String {
        let mut replaced = uri.to_string();
        for (pattern, replacement) in &self.uri_replace {
            replaced = pattern.replace_all(&replaced, replacement.as_str()).into_owned();
        }
        let decorated = format!("{}{}{}", self.uri_prefix, replaced, self.uri_suffix);
        match &self.destination_prefix {
            Some(dir) => format!(
                "{}/{}",
                dir.trim_end_matches('/'),
                decorated.trim_start_matches('/')
            ),
            None => decorated,
        }
    }

    pub(crate) fn apply(&self, uri: &str, mut document: Document) -> (String, Document) {
        let decorated = self.uri(uri);
        if let (Some(carry), Some(metadata)) = (self.carry, document.metadata.as_mut()) {
            carry.strip(metadata);
        }
        if !self.collections.is_empty() || !self.grants.is_empty() || self.quality.is_some() {
            let metadata = document.metadata_mut();
            for collection in &self.collections {
                metadata.add_collection(collection.as_str());
            }
            for grant in &self.grants {
                if !metadata.grants.contains(grant) {
                    metadata.grants.push(grant.clone());
                }
            }
            if let Some(quality) = self.quality {
                metadata.quality = quality;
            }
        }
        (decorated, document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Capability, ContentKind};

    #[test]
    fn the_one_where_the_uri_gets_its_full_outfit() {
        let output = OutputConfig {
            uri_prefix: Some("pre-".to_string()),
            uri_suffix: Some(".xml".to_string()),
            destination_prefix: Some("/landing/".to_string()),
            ..Default::default()
        };
        let decoration = Decoration::new(&output, Vec::new(), false).expect("valid");
        assert_eq!(decoration.uri("row-1"), "/landing/pre-row-1.xml");
        assert_eq!(Decoration::default().uri("/as/is"), "/as/is");
    }

    #[test]
    fn the_one_where_metadata_is_added_not_replaced() {
        let output = OutputConfig {
            collections: vec!["batch".to_string()],
            quality: Some(5),
            ..Default::default()
        };
        let grant = AccessGrant {
            role: "reader".to_string(),
            capability: Capability::Read,
        };
        let decoration = Decoration::new(&output, vec![grant.clone()], false).expect("valid");
        let mut doc = Document::new(b"x".to_vec(), ContentKind::Text);
        doc.metadata_mut().add_collection("own");

        let (_, doc) = decoration.apply("/x", doc);
        let meta = doc.metadata.expect("decorated");
        assert_eq!(meta.collections, vec!["own", "batch"]);
        assert_eq!(meta.grants, vec![grant]);
        assert_eq!(meta.quality, 5);
    }

    #[test]
    fn the_one_where_wiki_becomes_wiki1_before_the_prefix_lands() -> Result<()> {
        let output = OutputConfig {
            uri_replace: vec!["wiki".to_string(), "'wiki1'".to_string(), r"\.xml$".to_string(), ".txt".to_string()],
            uri_prefix: Some("/wiki/".to_string()),
            ..Default::default()
        };
        let decoration = Decoration::new(&output, Vec::new(), false)?;
        assert_eq!(decoration.uri("data/wiki/AbacuS.xml"), "/wiki/data/wiki1/AbacuS.txt");
        assert_eq!(decoration.uri("plain"), "/wiki/plain", "no match, no change");
        Ok(())
    }

    #[test]
    fn the_one_where_uri_replace_refuses_to_guess() {
        for broken in [vec!["lonely".to_string()], vec!["(".to_string(), "x".to_string()]] {
            let output = OutputConfig {
                uri_replace: broken,
                ..Default::default()
            };
            let err = Decoration::new(&output, Vec::new(), false).err().expect("refused");
            assert!(crate::errors::is_configuration_error(&err), "{err:#}");
        }
    }

    #[test]
    fn the_one_where_copies_leave_some_luggage_behind() -> Result<()> {
        let output = OutputConfig {
            collections: vec!["landed".to_string()],
            copy_collections: false,
            copy_quality: false,
            ..Default::default()
        };
        let grant = AccessGrant {
            role: "reader".to_string(),
            capability: Capability::Read,
        };
        let arriving = || {
            let mut doc = Document::new(b"x".to_vec(), ContentKind::Text);
            let meta = doc.metadata_mut();
            meta.add_collection("from-source");
            meta.grants.push(grant.clone());
            meta.quality = 7;
            meta.properties.insert("k".to_string(), "v".to_string());
            doc
        };

        let (_, copied) = Decoration::new(&output, Vec::new(), true)?.apply("/x", arriving());
        let meta = copied.metadata.expect("decorated");
        assert_eq!(meta.collections, vec!["landed"], "source collections dropped, ours added");
        assert_eq!(meta.grants, vec![grant.clone()]);
        assert_eq!(meta.quality, 0);
        assert_eq!(meta.properties.get("k").map(String::as_str), Some("v"));

        let (_, imported) = Decoration::new(&output, Vec::new(), false)?.apply("/x", arriving());
        let meta = imported.metadata.expect("decorated");
        assert_eq!(meta.collections, vec!["from-source", "landed"], "switches only bind carried metadata");
        assert_eq!(meta.quality, 7);
        Ok(())
    }

    #[test]
    fn the_one_where_a_prefix_alone_does_not_mean_fast() {
        let output = OutputConfig {
            destination_prefix: Some("/out".to_string()),
            ..Default::default()
        };
        assert!(!output.fast_path(false));
        assert!(output.fast_path(true));
        assert!(OutputConfig { fast_path_enabled: true, ..Default::default() }.fast_path(false));
    }
}
