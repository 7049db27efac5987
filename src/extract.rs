//! Document summaries for PDF, EPUB, OpenDocument and OOXML files.
//!
//! Extraction works on in-memory bytes plus the sniffed mime type and never
//! panics: unreadable or unsupported input is an [`ExtractError`]. Every ZIP
//! entry read is bounded.

use std::collections::HashMap;
use std::io::{Cursor, Read};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_EPUB: &str = "application/epub+zip";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const MIME_ODF_PREFIX: &str = "application/vnd.oasis.opendocument.";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum spine documents read from one EPUB.
const EPUB_MAX_DOCUMENTS: usize = 2_000;
/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

#[derive(Debug)]
pub enum ExtractError {
    UnsupportedContentType(String),
    Pdf(String),
    Epub(String),
    Ooxml(String),
    OpenDocument(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedContentType(ct) => {
                write!(f, "unsupported content-type: {}", ct)
            }
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Epub(e) => write!(f, "EPUB extraction failed: {}", e),
            ExtractError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
            ExtractError::OpenDocument(e) => write!(f, "OpenDocument extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// One table-of-contents entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chapter {
    pub title: String,
    pub page: Option<i64>,
    pub children: Vec<Chapter>,
}

/// What a document says about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub title: Option<String>,
    pub author: Option<String>,
    pub pages: Option<i64>,
    pub words: i64,
    pub characters: i64,
    pub chapters: Vec<Chapter>,
    /// Free-form `(name, value)` pairs, in document order.
    pub metadata: Vec<(String, String)>,
}

impl ExtractedDocument {
    fn count_text(&mut self, text: &str) {
        let (words, characters) = count_words(text);
        self.words += words;
        self.characters += characters;
    }

    /// Fill title and author from metadata when not already set.
    fn adopt_title_and_author(&mut self) {
        for (name, value) in &self.metadata {
            match name.as_str() {
                "title" if self.title.is_none() => self.title = Some(value.clone()),
                "creator" | "author" | "initial-creator" if self.author.is_none() => {
                    self.author = Some(value.clone())
                }
                _ => {}
            }
        }
    }
}

/// Summarize a document.
pub fn extract_document(bytes: &[u8], mime: &str) -> Result<ExtractedDocument, ExtractError> {
    match mime {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        m if m.starts_with("application/epub") => extract_epub(bytes),
        m if m.starts_with(MIME_ODF_PREFIX) => extract_odf(bytes),
        _ => Err(ExtractError::UnsupportedContentType(mime.to_string())),
    }
}

/// Words are whitespace-separated tokens containing at least one letter or
/// digit; characters are the total length of those tokens.
pub fn count_words(text: &str) -> (i64, i64) {
    let mut words = 0i64;
    let mut characters = 0i64;
    for token in text.split_whitespace() {
        if token.chars().any(char::is_alphanumeric) {
            words += 1;
            characters += token.chars().count() as i64;
        }
    }
    (words, characters)
}

// ═══════════════════════════════════════════════════════════════════════
// PDF
// ═══════════════════════════════════════════════════════════════════════

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
    let pdf = lopdf::Document::load_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;

    let mut doc = ExtractedDocument {
        pages: Some(pdf.get_pages().len() as i64),
        ..Default::default()
    };

    let info = match pdf.trailer.get(b"Info") {
        Ok(lopdf::Object::Reference(id)) => pdf.get_dictionary(*id).ok(),
        Ok(lopdf::Object::Dictionary(dict)) => Some(dict),
        _ => None,
    };
    if let Some(info) = info {
        for (key, value) in info.iter() {
            if let Some(text) = pdf_text(value) {
                doc.metadata.push((pdf_meta_name(key), text));
            }
        }
    }
    doc.adopt_title_and_author();

    // Encrypted or image-only documents still yield their info dictionary.
    match pdf_extract::extract_text_from_mem(bytes) {
        Ok(text) => doc.count_text(&text),
        Err(e) => tracing::debug!(error = %e, "no text layer"),
    }
    Ok(doc)
}

/// `/Title` → `title`, `/CreationDate` → `creationDate`.
fn pdf_meta_name(key: &[u8]) -> String {
    let name = String::from_utf8_lossy(key);
    let name = name.trim_start_matches('/');
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Decode a PDF text string (UTF-16BE with BOM, otherwise byte text).
fn pdf_text(value: &lopdf::Object) -> Option<String> {
    let bytes = match value {
        lopdf::Object::String(bytes, _) => bytes,
        lopdf::Object::Name(name) => name,
        _ => return None,
    };
    let text = if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(_) => bytes.iter().map(|&b| b as char).collect(),
        }
    };
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

// ═══════════════════════════════════════════════════════════════════════
// EPUB
// ═══════════════════════════════════════════════════════════════════════

fn extract_epub(bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
    let err = |e: String| ExtractError::Epub(e);
    let mut archive = open_archive(bytes).map_err(err)?;

    let container = read_zip_entry_bounded(&mut archive, "META-INF/container.xml").map_err(err)?;
    let opf_path = first_attribute(&container, b"rootfile", b"full-path")
        .map_err(err)?
        .ok_or_else(|| ExtractError::Epub("container.xml has no rootfile".to_string()))?;
    let opf = read_zip_entry_bounded(&mut archive, &opf_path).map_err(err)?;
    let package = parse_opf(&opf).map_err(err)?;
    let base = match opf_path.rfind('/') {
        Some(i) => &opf_path[..=i],
        None => "",
    };

    let mut doc = ExtractedDocument {
        metadata: package.metadata,
        ..Default::default()
    };
    doc.adopt_title_and_author();

    for idref in package.spine.iter().take(EPUB_MAX_DOCUMENTS) {
        let Some(href) = package.manifest.get(idref) else {
            continue;
        };
        let xhtml = read_zip_entry_bounded(&mut archive, &format!("{}{}", base, href))
            .map_err(err)?;
        doc.count_text(&xml_text(&xhtml, &[b"script", b"style", b"head"]));
    }

    if let Some(href) = package.toc.and_then(|id| package.manifest.get(&id).cloned()) {
        let ncx = read_zip_entry_bounded(&mut archive, &format!("{}{}", base, href))
            .map_err(err)?;
        doc.chapters = parse_ncx(&ncx).map_err(err)?;
    }
    Ok(doc)
}

#[derive(Debug, Default)]
struct OpfPackage {
    metadata: Vec<(String, String)>,
    manifest: HashMap<String, String>,
    spine: Vec<String>,
    toc: Option<String>,
}

fn parse_opf(xml: &[u8]) -> Result<OpfPackage, String> {
    let mut package = OpfPackage::default();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_metadata = false;
    let mut current: Option<String> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"metadata" => in_metadata = true,
                    b"spine" => package.toc = attribute(&e, b"toc"),
                    _ if in_metadata => current = Some(String::from_utf8_lossy(&name).into_owned()),
                    _ => {}
                }
            }
            Ok(quick_xml::events::Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => {
                    if let (Some(id), Some(href)) = (attribute(&e, b"id"), attribute(&e, b"href")) {
                        package.manifest.insert(id, href);
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attribute(&e, b"idref") {
                        package.spine.push(idref);
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) => {
                if let Some(name) = &current {
                    let value = text_of(&te);
                    if !value.is_empty() {
                        package.metadata.push((name.clone(), value));
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"metadata" {
                    in_metadata = false;
                }
                current = None;
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(package)
}

/// Nested `navPoint`s of an NCX table of contents.
fn parse_ncx(xml: &[u8]) -> Result<Vec<Chapter>, String> {
    let mut roots = Vec::new();
    let mut stack: Vec<Chapter> = Vec::new();
    let mut in_label = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"navPoint" => stack.push(Chapter {
                    page: attribute(&e, b"playOrder").and_then(|p| p.parse().ok()),
                    ..Default::default()
                }),
                b"navLabel" => in_label = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_label => {
                if let Some(top) = stack.last_mut() {
                    top.title.push_str(&text_of(&te));
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"navLabel" => in_label = false,
                b"navPoint" => {
                    if let Some(done) = stack.pop() {
                        match stack.last_mut() {
                            Some(parent) => parent.children.push(done),
                            None => roots.push(done),
                        }
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(roots)
}

// ═══════════════════════════════════════════════════════════════════════
// OpenDocument
// ═══════════════════════════════════════════════════════════════════════

fn extract_odf(bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
    let err = |e: String| ExtractError::OpenDocument(e);
    let mut archive = open_archive(bytes).map_err(err)?;

    let mut doc = ExtractedDocument::default();
    if archive.index_for_name("meta.xml").is_some() {
        let meta = read_zip_entry_bounded(&mut archive, "meta.xml").map_err(err)?;
        doc.metadata = xml_leaf_values(&meta).map_err(err)?;
        doc.pages = first_attribute(&meta, b"document-statistic", b"page-count")
            .map_err(err)?
            .and_then(|p| p.parse().ok());
    }
    doc.adopt_title_and_author();

    let content = read_zip_entry_bounded(&mut archive, "content.xml").map_err(err)?;
    doc.count_text(&xml_text(&content, &[]));
    Ok(doc)
}

// ═══════════════════════════════════════════════════════════════════════
// OOXML
// ═══════════════════════════════════════════════════════════════════════

fn ooxml_properties(archive: &mut Archive<'_>, doc: &mut ExtractedDocument) -> Result<(), ExtractError> {
    let err = |e: String| ExtractError::Ooxml(e);
    if archive.index_for_name("docProps/core.xml").is_some() {
        let core = read_zip_entry_bounded(archive, "docProps/core.xml").map_err(err)?;
        doc.metadata = xml_leaf_values(&core).map_err(err)?;
    }
    if archive.index_for_name("docProps/app.xml").is_some() {
        let app = read_zip_entry_bounded(archive, "docProps/app.xml").map_err(err)?;
        doc.pages = xml_leaf_values(&app)
            .map_err(err)?
            .into_iter()
            .find(|(name, _)| name == "Pages" || name == "Slides")
            .and_then(|(_, value)| value.parse().ok());
    }
    doc.adopt_title_and_author();
    Ok(())
}

fn extract_docx(bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
    let mut archive = open_archive(bytes).map_err(ExtractError::Ooxml)?;
    let mut doc = ExtractedDocument::default();
    ooxml_properties(&mut archive, &mut doc)?;
    let body = read_zip_entry_bounded(&mut archive, "word/document.xml").map_err(ExtractError::Ooxml)?;
    doc.count_text(&extract_t_elements(&body).map_err(ExtractError::Ooxml)?);
    Ok(doc)
}

fn extract_pptx(bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
    let mut archive = open_archive(bytes).map_err(ExtractError::Ooxml)?;
    let mut doc = ExtractedDocument::default();
    ooxml_properties(&mut archive, &mut doc)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    if doc.pages.is_none() {
        doc.pages = Some(slides.len() as i64);
    }
    for name in slides {
        let xml = read_zip_entry_bounded(&mut archive, &name).map_err(ExtractError::Ooxml)?;
        doc.count_text(&extract_t_elements(&xml).map_err(ExtractError::Ooxml)?);
    }
    Ok(doc)
}

fn extract_xlsx(bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
    let mut archive = open_archive(bytes).map_err(ExtractError::Ooxml)?;
    let mut doc = ExtractedDocument::default();
    ooxml_properties(&mut archive, &mut doc)?;
    // Shared strings hold every distinct text cell once.
    if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        let strings = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml")
            .map_err(ExtractError::Ooxml)?;
        doc.count_text(&extract_t_elements(&strings).map_err(ExtractError::Ooxml)?);
    }
    let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
    doc.pages = Some(sheets.len().min(XLSX_MAX_SHEETS) as i64);
    Ok(doc)
}

/// Text of every `<t>` element (`w:t`, `a:t`, shared-string `t`), space separated.
fn extract_t_elements(xml: &[u8]) -> Result<String, String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        if !out.is_empty() {
                            out.push(' ');
                        }
                        out.push_str(&text_of(&te));
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// `<prefix>N.xml` entries sorted by N.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

// ═══════════════════════════════════════════════════════════════════════
// ZIP and XML helpers
// ═══════════════════════════════════════════════════════════════════════

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, String> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| e.to_string())
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, String> {
    let entry = archive
        .by_name(name)
        .map_err(|e| format!("{}: {}", name, e))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| format!("{}: {}", name, e))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        ));
    }
    Ok(out)
}

fn text_of(te: &quick_xml::events::BytesText<'_>) -> String {
    match te.unescape() {
        Ok(text) => text.trim().to_string(),
        // Undeclared entities such as `&nbsp;` in XHTML.
        Err(_) => String::from_utf8_lossy(te).trim().to_string(),
    }
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Value of `key` on the first `element` (start or empty tag).
fn first_attribute(xml: &[u8], element: &[u8], key: &[u8]) -> Result<Option<String>, String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e))
                if e.local_name().as_ref() == element =>
            {
                return Ok(attribute(&e, key));
            }
            Ok(quick_xml::events::Event::Eof) => return Ok(None),
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
}

/// `(local name, text)` for every element that directly holds text.
fn xml_leaf_values(xml: &[u8]) -> Result<Vec<(String, String)>, String> {
    let mut values = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                current = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(quick_xml::events::Event::Text(te)) => {
                if let Some(name) = &current {
                    let value = text_of(&te);
                    if !value.is_empty() {
                        values.push((name.clone(), value));
                    }
                }
            }
            Ok(quick_xml::events::Event::End(_)) => current = None,
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(values)
}

/// All character data, space separated, skipping the contents of `skip` elements.
fn xml_text(xml: &[u8], skip: &[&[u8]]) -> String {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;
    let mut buf = Vec::new();
    let mut skipping = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if skipping > 0 || skip.contains(&e.local_name().as_ref()) {
                    skipping += 1;
                }
            }
            Ok(quick_xml::events::Event::End(_)) => skipping = skipping.saturating_sub(1),
            Ok(quick_xml::events::Event::Text(te)) if skipping == 0 => {
                let text = text_of(&te);
                if !text.is_empty() {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(&text);
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            // Keep what was read from malformed markup.
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    out
}
