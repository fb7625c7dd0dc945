//! 🧾 Delimited text reader: CSV (and friends) in, one small XML document per row out.
//!
//! The first non-blank line of every file is its header. Each following row becomes
//! `<root><column>value</column>...</root>`. A row with the wrong number of fields is logged,
//! counted, and skipped. Directory splits walk every file in sorted order, each with its own
//! header, without the split ever noticing the seams.
//!
//! 🧠 All header and column state lives in the `DelimitedParser` instance. Two readers never
//! share a header, even when they read the same file. 🦆

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, error};

use crate::common::{ContentKind, Document, Split};
use crate::errors::PumpError;
use crate::readers::{InputConfig, ReaderCore, RecordReader, fraction, split_files};

/// ⏭️ One step of a parser.
#[derive(Debug, PartialEq)]
pub(crate) enum RowOutcome {
    Row { id: Option<String>, xml: Vec<u8> },
    Skipped,
    Exhausted,
}

/// 🧾 A CSV parser over one stream, with that stream's header.
pub(crate) struct DelimitedParser {
    csv: csv::Reader<Box<dyn Read + Send>>,
    source_name: String,
    id_column: Option<String>,
    header: Option<Vec<String>>,
    id_index: Option<usize>,
    record: csv::StringRecord,
}

impl fmt::Debug for DelimitedParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelimitedParser")
            .field("source_name", &self.source_name)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// 🔤 The delimiter has to fit in one byte. '⌘' does not.
pub(crate) fn delimiter_byte(delimiter: char) -> Result<u8> {
    u8::try_from(delimiter)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| PumpError::config(format!("delimiter '{delimiter}' is not a single ASCII character")).into())
}

/// 🏷️ Column headers become element names, so they have to look like element names.
fn element_name(raw: &str) -> String {
    let mut name: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') { c } else { '_' })
        .collect();
    if name.is_empty() || !name.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        name.insert(0, '_');
    }
    name
}

impl DelimitedParser {
    pub(crate) fn new(
        stream: Box<dyn Read + Send>,
        source_name: impl Into<String>,
        config: &InputConfig,
    ) -> Result<Self> {
        let csv = csv::ReaderBuilder::new()
            .delimiter(delimiter_byte(config.delimiter_char)?)
            .has_headers(false)
            .flexible(true)
            .from_reader(stream);
        Ok(Self {
            csv,
            source_name: source_name.into(),
            id_column: config
                .id_field_name
                .as_ref()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            header: None,
            id_index: None,
            record: csv::StringRecord::new(),
        })
    }

    /// 📏 Bytes of this stream consumed so far.
    pub(crate) fn position(&self) -> u64 {
        self.csv.position().byte()
    }

    fn read_header(&mut self) -> Result<bool> {
        if !self.csv.read_record(&mut self.record).map_err(|e| {
            PumpError::stream(&self.source_name, format!("unreadable header: {e}"))
        })? {
            return Ok(false);
        }
        let header: Vec<String> = self
            .record
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let field = if i == 0 { field.trim_start_matches('\u{feff}') } else { field };
                field.trim().to_string()
            })
            .collect();
        if let Some(column) = &self.id_column {
            let index = header.iter().position(|h| h == column).ok_or_else(|| {
                PumpError::config(format!(
                    "id column '{column}' is not in the header of '{}'",
                    self.source_name
                ))
            })?;
            self.id_index = Some(index);
        }
        debug!(source = %self.source_name, columns = header.len(), "🧾 header read");
        self.header = Some(header);
        Ok(true)
    }

    /// ⏭️ The next row, rendered. Bad rows come back as `Skipped`, already logged.
    pub(crate) fn next_row(&mut self) -> Result<RowOutcome> {
        if self.header.is_none() && !self.read_header()? {
            return Ok(RowOutcome::Exhausted);
        }
        match self.csv.read_record(&mut self.record) {
            Ok(false) => return Ok(RowOutcome::Exhausted),
            Ok(true) => {}
            Err(e) if e.is_io_error() => {
                return Err(PumpError::stream(&self.source_name, format!("read failed: {e}")).into());
            }
            Err(e) => {
                error!(source = %self.source_name, "💀 unreadable row skipped: {e}");
                return Ok(RowOutcome::Skipped);
            }
        }
        let Some(header) = &self.header else {
            return Ok(RowOutcome::Exhausted);
        };
        let line = self.record.position().map(|p| p.line()).unwrap_or(0);
        if self.record.len() != header.len() {
            error!(
                source = %self.source_name,
                line,
                expected = header.len(),
                found = self.record.len(),
                "💀 field count does not match the header; row skipped"
            );
            return Ok(RowOutcome::Skipped);
        }
        let id = match self.id_index {
            Some(index) => {
                let value = self.record.get(index).unwrap_or_default().trim();
                if value.is_empty() {
                    error!(source = %self.source_name, line, "💀 empty id value; row skipped");
                    return Ok(RowOutcome::Skipped);
                }
                Some(value.to_string())
            }
            None => None,
        };
        Ok(RowOutcome::Row {
            id,
            xml: render_row(header, &self.record),
        })
    }
}

/// 🏗️ `<root><a>1</a><b>2</b></root>`, values escaped.
fn render_row(header: &[String], record: &csv::StringRecord) -> Vec<u8> {
    let mut xml = String::from("<root>");
    for (name, value) in header.iter().zip(record.iter()) {
        let name = element_name(name);
        xml.push('<');
        xml.push_str(&name);
        xml.push('>');
        xml.push_str(&quick_xml::escape::escape(value));
        xml.push_str("</");
        xml.push_str(&name);
        xml.push('>');
    }
    xml.push_str("</root>");
    xml.into_bytes()
}

/// 🔁 Pull rows until one is emitted (`true`) or the parser runs dry (`false`).
pub(crate) fn emit_next_row(
    core: &mut ReaderCore,
    parser: &mut DelimitedParser,
    source_file: &Path,
) -> Result<bool> {
    loop {
        match parser.next_row()? {
            RowOutcome::Row { id, xml } => {
                let uri = match id {
                    Some(id) => id,
                    None => core.next_generated_id(),
                };
                core.emit(uri, Document::new(xml, ContentKind::Xml), Some(source_file));
                return Ok(true);
            }
            RowOutcome::Skipped => core.skip(),
            RowOutcome::Exhausted => return Ok(false),
        }
    }
}

/// 🧾 Delimited files on disk: one file, or a directory of them.
#[derive(Debug, Default)]
pub(crate) struct DelimitedReader {
    core: ReaderCore,
    pending: VecDeque<PathBuf>,
    parser: Option<(PathBuf, DelimitedParser)>,
    consumed_before: u64,
    exhausted: bool,
}

impl RecordReader for DelimitedReader {
    fn core(&self) -> &ReaderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReaderCore {
        &mut self.core
    }

    fn initialize(&mut self, split: &Split, config: &InputConfig) -> Result<()> {
        self.core.begin(split, config);
        delimiter_byte(config.delimiter_char)?;
        self.pending = split_files(split, config)?.into();
        self.parser = None;
        self.consumed_before = 0;
        self.exhausted = false;
        Ok(())
    }

    fn advance(&mut self) -> Result<bool> {
        self.core.clear();
        while !self.exhausted {
            if self.parser.is_none() {
                let Some(path) = self.pending.pop_front() else {
                    self.exhausted = true;
                    break;
                };
                let file = File::open(&path)
                    .with_context(|| format!("💀 Could not open '{}'", path.display()))?;
                let stream: Box<dyn Read + Send> = Box::new(BufReader::new(file));
                let parser = DelimitedParser::new(stream, path.to_string_lossy(), &self.core.config)?;
                self.parser = Some((path, parser));
            }
            if let Some((path, parser)) = self.parser.as_mut() {
                if emit_next_row(&mut self.core, parser, path.as_path())? {
                    return Ok(true);
                }
                self.consumed_before += parser.position();
            }
            // -- this file is done; the next loop opens the next one
            self.parser = None;
        }
        Ok(false)
    }

    fn progress(&self) -> f32 {
        let current = self.parser.as_ref().map(|(_, p)| p.position()).unwrap_or(0);
        fraction(self.consumed_before + current, self.core.split_length(), self.exhausted)
    }

    fn close(&mut self) -> Result<()> {
        self.parser = None;
        self.pending.clear();
        self.core.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::{READER, RECORDS_READ, RECORDS_SKIPPED};

    fn read_all(reader: &mut DelimitedReader) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        while reader.advance()? {
            let (uri, doc) = reader.take_current().expect("a record was promised");
            out.push((uri, doc.content_str().unwrap_or_default().to_string()));
        }
        Ok(out)
    }

    #[test]
    fn the_one_where_the_crooked_row_is_left_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("people.csv");
        std::fs::write(&path, "\u{feff}a,b,c\n1,2,3\n4,5\n6,7,8\n\"x, y\",<&>,9\n")?;
        let split = Split::whole(&path)?;
        let mut reader = DelimitedReader::default();
        reader.initialize(&split, &InputConfig::default())?;
        let rows = read_all(&mut reader)?;

        assert_eq!(rows.len(), 3, "k rows minus the mismatched one");
        assert_eq!(rows[0].1, "<root><a>1</a><b>2</b><c>3</c></root>");
        assert_eq!(rows[2].1, "<root><a>x, y</a><b>&lt;&amp;&gt;</b><c>9</c></root>");
        assert_eq!(rows[0].0, format!("{}-1", split.tag()));
        let counters = reader.take_counters();
        assert_eq!(counters.get(READER, RECORDS_READ), 3);
        assert_eq!(counters.get(READER, RECORDS_SKIPPED), 1);
        assert_eq!(reader.progress(), 1.0);
        Ok(())
    }

    #[test]
    fn the_one_where_every_file_brings_its_own_header() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("1.csv"), "id|name\nk1|ann\n")?;
        std::fs::write(dir.path().join("2.csv"), "name|id\nbob|k2\n|k3\nzed|\n")?;
        let split = Split::whole(dir.path())?;
        let config = InputConfig {
            delimiter_char: '|',
            id_field_name: Some("id".to_string()),
            filename_as_collection: true,
            ..Default::default()
        };
        let mut reader = DelimitedReader::default();
        reader.initialize(&split, &config)?;

        assert!(reader.advance()?);
        assert_eq!(reader.current_key(), Some("k1"));
        assert_eq!(
            reader.current_value().and_then(|d| d.metadata.as_ref()).map(|m| m.collections.clone()),
            Some(vec!["1.csv".to_string()])
        );
        let rest = read_all(&mut reader)?;
        assert_eq!(
            rest.iter().map(|(uri, _)| uri.as_str()).collect::<Vec<_>>(),
            vec!["k2", "k3"]
        );
        assert_eq!(rest[1].1, "<root><name></name><id>k3</id></root>");
        assert_eq!(reader.take_counters().get(READER, RECORDS_SKIPPED), 1, "zed had no id");
        Ok(())
    }

    #[test]
    fn the_one_where_the_id_column_went_missing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("x.csv");
        std::fs::write(&path, "a,b\n1,2\n")?;
        let config = InputConfig {
            id_field_name: Some("uri".to_string()),
            ..Default::default()
        };
        let mut reader = DelimitedReader::default();
        reader.initialize(&Split::whole(&path)?, &config)?;
        assert!(reader.advance().is_err());
        Ok(())
    }

    #[test]
    fn the_one_where_headers_get_a_name_tag_makeover() {
        assert_eq!(element_name("first name"), "first_name");
        assert_eq!(element_name("1st"), "_1st");
        assert_eq!(element_name(""), "_");
        assert!(delimiter_byte('⌘').is_err());
    }
}
