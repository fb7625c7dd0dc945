//! 🧩 Aggregate XML reader: one big XML file in, many little XML documents out.
//!
//! 🎬 *[a 4GB XML file loads. somewhere inside, ten million `<record>` elements wait.]*
//!
//! The reader streams tokens and keeps a small explicit state machine:
//! - how deep we are, and which namespace prefixes each open element declared
//! - prefix → stack of URIs, so a record can take its ancestors' namespaces with it
//! - the latched record boundary (depth + name), found on the first matching element
//! - the record being rebuilt, token by token, escapes and all
//!
//! When the boundary element closes, the rebuilt bytes become a standalone XML document.
//! Broken structure (mismatched tags, a declaration mid-record, an id element with children)
//! fails the split. A record with no id when ids are required, or a file that ends mid-record,
//! costs only that record. 🦆

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::{error, warn};

use crate::common::{ContentKind, Document, Split};
use crate::errors::PumpError;
use crate::readers::{InputConfig, ReaderCore, RecordReader, fraction};

/// 🔑 Where the record's URI comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum IdField {
    #[default]
    Generated,
    Attribute(Vec<u8>),
    Element(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
struct Settings {
    record_local: Option<Vec<u8>>,
    record_namespace: Option<String>,
    id: IdField,
}

impl Settings {
    fn from_config(config: &InputConfig) -> Self {
        let id = match config.id_field_name.as_deref().map(str::trim) {
            None | Some("") => IdField::Generated,
            Some(name) => match name.strip_prefix('@') {
                Some(attr) => IdField::Attribute(attr.as_bytes().to_vec()),
                None => IdField::Element(name.as_bytes().to_vec()),
            },
        };
        Self {
            record_local: config.record_element_name.as_ref().map(|n| n.as_bytes().to_vec()),
            record_namespace: config.record_namespace.clone().filter(|ns| !ns.is_empty()),
            id,
        }
    }
}

/// 📐 The latched record boundary. Records are elements with this name at this depth.
#[derive(Debug, Clone)]
struct Boundary {
    depth: usize,
    local: Vec<u8>,
    namespace: Option<String>,
}

/// 🧱 A record being rebuilt.
#[derive(Debug, Default)]
struct RecordBuffer {
    bytes: Vec<u8>,
    id: Option<String>,
    id_matched: bool,
    // -- (depth of the id element, text so far)
    capture: Option<(usize, String)>,
}

/// ⏭️ What one token did to the state machine.
enum Step {
    Continue,
    Record { bytes: Vec<u8>, id: Option<String> },
    Truncated,
    Eof,
}

/// 🧠 The rebuild state. Owned by exactly one reader, never shared.
#[derive(Debug, Default)]
struct RebuildState {
    namespaces: BTreeMap<String, Vec<String>>,
    frames: Vec<Vec<String>>,
    boundary: Option<Boundary>,
    record: Option<RecordBuffer>,
}

fn qualified(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl RebuildState {
    fn depth(&self) -> usize {
        self.frames.len()
    }

    /// 📥 Push the namespace declarations on a start tag. Returns the declared prefixes.
    fn push_namespaces(&mut self, start: &BytesStart<'_>, source: &str) -> Result<Vec<String>> {
        let mut declared = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| PumpError::stream(source, format!("bad attribute: {e}")))?;
            let key = attr.key.as_ref();
            let prefix = if key == b"xmlns" {
                String::new()
            } else if let Some(rest) = key.strip_prefix(b"xmlns:") {
                qualified(rest)
            } else {
                continue;
            };
            let uri = attr
                .unescape_value()
                .map_err(|e| PumpError::stream(source, format!("bad namespace value: {e}")))?
                .into_owned();
            self.namespaces.entry(prefix.clone()).or_default().push(uri);
            declared.push(prefix);
        }
        Ok(declared)
    }

    /// 📤 Symmetric pop for a closing element.
    fn pop_namespaces(&mut self, declared: Vec<String>) {
        for prefix in declared {
            if let Some(stack) = self.namespaces.get_mut(&prefix) {
                stack.pop();
                if stack.is_empty() {
                    self.namespaces.remove(&prefix);
                }
            }
        }
    }

    /// 🔍 The namespace URI an element name is bound to right now.
    fn resolve(&self, start: &BytesStart<'_>) -> Option<String> {
        let name = start.name();
        let prefix = name.prefix().map(|p| qualified(p.as_ref())).unwrap_or_default();
        self.namespaces
            .get(&prefix)
            .and_then(|stack| stack.last())
            .filter(|uri| !uri.is_empty())
            .cloned()
    }

    /// 📐 Is this element (at `depth`) a record root? Latches the boundary on first match.
    fn is_record_root(&mut self, start: &BytesStart<'_>, depth: usize, settings: &Settings) -> bool {
        let local = start.local_name();
        let local = local.as_ref();
        if let Some(boundary) = &self.boundary {
            return depth == boundary.depth
                && local == boundary.local.as_slice()
                && self.resolve(start) == boundary.namespace;
        }
        // -- no configured namespace means "no namespace", not "any namespace"
        let matched = match &settings.record_local {
            Some(wanted) => local == wanted.as_slice() && self.resolve(start) == settings.record_namespace,
            // -- no record name: the first child of the document root is the template
            None => depth == 2,
        };
        if matched {
            let namespace = match &settings.record_local {
                Some(_) => settings.record_namespace.clone(),
                None => self.resolve(start),
            };
            self.boundary = Some(Boundary {
                depth,
                local: local.to_vec(),
                namespace,
            });
        }
        matched
    }

    /// 🏗️ The record root tag, carrying every in-scope namespace it doesn't declare itself.
    fn standalone_root(&self, start: &BytesStart<'_>, declared: &[String]) -> BytesStart<'static> {
        let mut root = start.clone().into_owned();
        for (prefix, stack) in &self.namespaces {
            if declared.contains(prefix) {
                continue;
            }
            let Some(uri) = stack.last() else { continue };
            if prefix.is_empty() && uri.is_empty() {
                continue;
            }
            let attr_name = if prefix.is_empty() {
                "xmlns".to_string()
            } else {
                format!("xmlns:{prefix}")
            };
            root.push_attribute((attr_name.as_str(), uri.as_str()));
        }
        root
    }

    fn attribute_id(start: &BytesStart<'_>, wanted: &[u8], source: &str) -> Result<Option<String>> {
        for attr in start.attributes() {
            let attr = attr.map_err(|e| PumpError::stream(source, format!("bad attribute: {e}")))?;
            if attr.key.local_name().as_ref() == wanted {
                let value = attr
                    .unescape_value()
                    .map_err(|e| PumpError::stream(source, format!("bad id attribute: {e}")))?;
                return Ok(Some(value.into_owned()));
            }
        }
        Ok(None)
    }

    fn open_record(
        &mut self,
        start: &BytesStart<'_>,
        declared: &[String],
        settings: &Settings,
        source: &str,
    ) -> Result<RecordBuffer> {
        let mut record = RecordBuffer::default();
        if let IdField::Attribute(wanted) = &settings.id {
            record.id = Self::attribute_id(start, wanted, source)?;
            record.id_matched = record.id.is_some();
        }
        let root = self.standalone_root(start, declared);
        write(&mut record.bytes, Event::Start(root), source)?;
        Ok(record)
    }

    /// 🔑 An element inside the record might be the id element.
    fn note_child(
        record: &mut RecordBuffer,
        start: &BytesStart<'_>,
        depth: usize,
        settings: &Settings,
        source: &str,
    ) -> Result<()> {
        if record.capture.is_some() {
            return Err(PumpError::stream(
                source,
                format!(
                    "id element contains <{}>; it must be a simple text node",
                    qualified(start.name().as_ref())
                ),
            )
            .into());
        }
        let IdField::Element(wanted) = &settings.id else {
            return Ok(());
        };
        if start.local_name().as_ref() == wanted.as_slice() {
            if record.id_matched {
                warn!(source, "⚠️ duplicate id element in one record; keeping the first");
            } else {
                record.id_matched = true;
                record.capture = Some((depth, String::new()));
            }
        }
        Ok(())
    }

    fn consume(&mut self, event: Event<'_>, settings: &Settings, source: &str) -> Result<Step> {
        match event {
            Event::Start(start) => {
                let declared = self.push_namespaces(&start, source)?;
                self.frames.push(declared.clone());
                let depth = self.depth();
                if let Some(mut record) = self.record.take() {
                    Self::note_child(&mut record, &start, depth, settings, source)?;
                    write(&mut record.bytes, Event::Start(start), source)?;
                    self.record = Some(record);
                } else if self.is_record_root(&start, depth, settings) {
                    self.record = Some(self.open_record(&start, &declared, settings, source)?);
                }
                Ok(Step::Continue)
            }
            Event::Empty(start) => {
                let declared = self.push_namespaces(&start, source)?;
                let depth = self.depth() + 1;
                let step = if let Some(mut record) = self.record.take() {
                    Self::note_child(&mut record, &start, depth, settings, source)?;
                    // -- an empty id element is a present-but-blank id
                    if let Some((_, text)) = record.capture.take() {
                        record.id = Some(text);
                    }
                    write(&mut record.bytes, Event::Empty(start), source)?;
                    self.record = Some(record);
                    Step::Continue
                } else if self.is_record_root(&start, depth, settings) {
                    let mut record = RecordBuffer::default();
                    if let IdField::Attribute(wanted) = &settings.id {
                        record.id = Self::attribute_id(&start, wanted, source)?;
                    }
                    let root = self.standalone_root(&start, &declared);
                    write(&mut record.bytes, Event::Empty(root), source)?;
                    Step::Record {
                        bytes: record.bytes,
                        id: record.id,
                    }
                } else {
                    Step::Continue
                };
                self.pop_namespaces(declared);
                Ok(step)
            }
            Event::End(end) => {
                let depth = self.depth();
                let mut step = Step::Continue;
                if let Some(mut record) = self.record.take() {
                    write(&mut record.bytes, Event::End(end), source)?;
                    if record.capture.as_ref().is_some_and(|(d, _)| *d == depth) {
                        record.id = record.capture.take().map(|(_, text)| text);
                    }
                    let closes_record = self.boundary.as_ref().is_some_and(|b| b.depth == depth);
                    if closes_record {
                        step = Step::Record {
                            bytes: record.bytes,
                            id: record.id,
                        };
                    } else {
                        self.record = Some(record);
                    }
                }
                if let Some(declared) = self.frames.pop() {
                    self.pop_namespaces(declared);
                }
                Ok(step)
            }
            Event::Text(text) => {
                if let Some(record) = self.record.as_mut() {
                    if let Some((_, captured)) = record.capture.as_mut() {
                        let unescaped = text
                            .unescape()
                            .map_err(|e| PumpError::stream(source, format!("bad text: {e}")))?;
                        captured.push_str(&unescaped);
                    }
                    write(&mut record.bytes, Event::Text(text), source)?;
                }
                Ok(Step::Continue)
            }
            Event::CData(cdata) => {
                if let Some(record) = self.record.as_mut() {
                    if let Some((_, captured)) = record.capture.as_mut() {
                        captured.push_str(&String::from_utf8_lossy(&cdata));
                    }
                    write(&mut record.bytes, Event::CData(cdata), source)?;
                }
                Ok(Step::Continue)
            }
            Event::Decl(_) => {
                if self.record.is_some() {
                    return Err(PumpError::stream(source, "XML declaration inside a record").into());
                }
                Ok(Step::Continue)
            }
            Event::Eof => {
                if self.record.take().is_some() {
                    Ok(Step::Truncated)
                } else {
                    Ok(Step::Eof)
                }
            }
            // -- comments, processing instructions, doctype: verbatim when inside a record
            other => {
                if let Some(record) = self.record.as_mut() {
                    write(&mut record.bytes, other, source)?;
                }
                Ok(Step::Continue)
            }
        }
    }
}

fn write(buffer: &mut Vec<u8>, event: Event<'_>, source: &str) -> Result<()> {
    Writer::new(buffer)
        .write_event(event)
        .map_err(|e| PumpError::stream(source, format!("could not re-serialize token: {e}")))?;
    Ok(())
}

/// 🧩 The reader itself: a token stream plus the rebuild state.
#[derive(Default)]
pub(crate) struct AggregateReader {
    core: ReaderCore,
    xml: Option<Reader<BufReader<File>>>,
    settings: Settings,
    state: RebuildState,
    buf: Vec<u8>,
    exhausted: bool,
}

impl fmt::Debug for AggregateReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateReader")
            .field("split", &self.core.split)
            .field("depth", &self.state.depth())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl RecordReader for AggregateReader {
    fn core(&self) -> &ReaderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReaderCore {
        &mut self.core
    }

    fn initialize(&mut self, split: &Split, config: &InputConfig) -> Result<()> {
        self.core.begin(split, config);
        let file = File::open(&split.path).with_context(|| {
            format!("💀 Could not open aggregate input '{}'", split.path.display())
        })?;
        self.xml = Some(Reader::from_reader(BufReader::new(file)));
        self.settings = Settings::from_config(config);
        self.state = RebuildState::default();
        self.exhausted = false;
        Ok(())
    }

    fn advance(&mut self) -> Result<bool> {
        self.core.clear();
        if self.exhausted {
            return Ok(false);
        }
        let source = self.core.source_name();
        let Some(xml) = self.xml.as_mut() else {
            return Err(PumpError::stream(source, "reader used before initialize").into());
        };
        loop {
            self.buf.clear();
            let event = xml.read_event_into(&mut self.buf).map_err(|e| {
                PumpError::stream(&source, format!("{e} (near byte {})", xml.buffer_position()))
            })?;
            match self.state.consume(event, &self.settings, &source)? {
                Step::Continue => continue,
                Step::Record { bytes, id } => {
                    let id = id.filter(|id| !id.trim().is_empty());
                    let uri = match (&self.settings.id, id) {
                        (IdField::Generated, _) => self.core.next_generated_id(),
                        (_, Some(id)) => id,
                        (_, None) => {
                            error!(source = %source, "💀 record closed without an id; skipped");
                            self.core.skip();
                            continue;
                        }
                    };
                    let path = self.core.split.as_ref().map(|s| s.path.clone());
                    self.core.emit(uri, Document::new(bytes, ContentKind::Xml), path.as_deref());
                    return Ok(true);
                }
                Step::Truncated => {
                    error!(source = %source, "💀 input ended in the middle of a record; record dropped");
                    self.core.skip();
                    self.exhausted = true;
                    return Ok(false);
                }
                Step::Eof => {
                    self.exhausted = true;
                    return Ok(false);
                }
            }
        }
    }

    fn progress(&self) -> f32 {
        let consumed = self.xml.as_ref().map(|x| x.buffer_position() as u64).unwrap_or(0);
        fraction(consumed, self.core.split_length(), self.exhausted)
    }

    fn close(&mut self) -> Result<()> {
        self.xml = None;
        self.core.clear();
        Ok(())
    }
}
