//! 📡 Store documents: the reader behind Export and Copy.
//!
//! The split path is a source host URL; offset and length pick a window of that host's
//! document listing. The window comes back in one bulk-framed response and is handed out one
//! document at a time. Readers run on a blocking thread, so this one uses the blocking client.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::backends::{BulkEntry, HttpStoreConfig, bulk};
use crate::common::{Document, Split};
use crate::errors::PumpError;
use crate::readers::{InputConfig, ReaderCore, RecordReader};

#[derive(Debug, Default)]
pub(crate) struct StoreDocumentReader {
    core: ReaderCore,
    fetched: VecDeque<BulkEntry>,
    total: usize,
    exhausted: bool,
}

fn fetch_window(split: &Split, source: &HttpStoreConfig) -> Result<Vec<u8>> {
    let base = split.display_name();
    let raw = format!("{}/v1/documents", base.trim_end_matches('/'));
    let start = split.offset.to_string();
    let length = split.length.to_string();
    let url = reqwest::Url::parse_with_params(&raw, &[("start", start.as_str()), ("length", length.as_str())])
        .with_context(|| format!("💀 '{raw}' is not a URL anyone can send a request to"))?;

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(source.timeout_secs))
        .build()
        .context("💀 The blocking HTTP client refused to be born.")?;
    let mut request = client.get(url);
    if let Some(ref api_key) = source.api_key {
        request = request.header("Authorization", format!("ApiKey {}", api_key));
    } else if let Some(ref username) = source.username {
        request = request.basic_auth(username, source.password.as_ref());
    }

    let response = request
        .send()
        .map_err(|e| PumpError::stream(&base, format!("document listing failed: {e}")))?;
    let status = response.status();
    let body = response
        .bytes()
        .map_err(|e| PumpError::stream(&base, format!("reading document listing: {e}")))?;
    if !status.is_success() {
        return Err(PumpError::stream(
            &base,
            format!("document listing returned {status}: {}", String::from_utf8_lossy(&body)),
        )
        .into());
    }
    Ok(body.to_vec())
}

impl RecordReader for StoreDocumentReader {
    fn core(&self) -> &ReaderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReaderCore {
        &mut self.core
    }

    fn initialize(&mut self, split: &Split, config: &InputConfig) -> Result<()> {
        self.core.begin(split, config);
        let source = config.source.clone().unwrap_or_default();
        let body = fetch_window(split, &source)?;
        let entries = bulk::decode(&split.display_name(), &body)?;
        debug!(host = %split.display_name(), start = split.offset, documents = entries.len(), "📡 window fetched");
        self.total = entries.len();
        self.fetched = entries.into();
        self.exhausted = false;
        Ok(())
    }

    fn advance(&mut self) -> Result<bool> {
        self.core.clear();
        let Some(entry) = self.fetched.pop_front() else {
            self.exhausted = true;
            return Ok(false);
        };
        let mut document: Document = entry.document;
        if let Some(kind) = self.core.config.content_kind.fixed() {
            if !document.is_naked() {
                document.kind = kind;
            }
        }
        self.core.emit(entry.uri, document, None);
        Ok(true)
    }

    fn progress(&self) -> f32 {
        if self.exhausted || self.total == 0 {
            return if self.exhausted { 1.0 } else { 0.0 };
        }
        let taken = self.total - self.fetched.len();
        (taken as f64 / self.total as f64) as f32
    }

    fn close(&mut self) -> Result<()> {
        self.fetched.clear();
        self.core.clear();
        Ok(())
    }
}
