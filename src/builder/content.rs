//! Content Renderer
//!
//! This module serializes a parsed [`Document`] into XHTML content documents.
//!
//! ## Usage
//! ```rust
//! # fn main() -> Result<(), fb2_epub::error::ConvertError> {
//! use fb2_epub::{
//!     builder::content::ContentRenderer,
//!     config::ConversionConfig,
//!     parser::Fb2Parser,
//!     report::Diagnostics,
//! };
//!
//! let source = br#"<FictionBook>
//!   <body><section><title><p>Chapter 1</p></title><p>Hello.</p></section></body>
//! </FictionBook>"#;
//!
//! let config = ConversionConfig::default();
//! let mut diagnostics = Diagnostics::new();
//! let document = Fb2Parser::new(&config).parse(source, &mut diagnostics)?;
//! let book = ContentRenderer::new(&document, &config).render(&mut diagnostics)?;
//!
//! assert_eq!(book.documents.len(), 1);
//! assert_eq!(book.documents[0].file_name, "chapter-001.xhtml");
//! # Ok(())
//! # }
//! ```
//!
//! ## Notes
//!
//! - Each top-level section becomes one content document, unless a chapter
//!   split threshold is configured.
//! - Elements without a rendering rule are written as plain text and reported
//!   as warnings, they never abort the rendering.

use std::{collections::HashMap, io::Cursor};

use log::debug;
use quick_xml::{
    Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};

use crate::{
    builder::XmlWriter,
    config::{ConversionConfig, FootnoteStyle},
    error::{ConvertError, ErrorKind},
    model::{
        Document, Footnote, FootnoteKind, Inline, Node, Poem, REFERENCE_ID_PREFIX, Section,
        TableCell, Title,
    },
    report::Diagnostics,
    utils::{LocalizedTerms, localized_terms},
};

/// File name of the footnotes document
pub const NOTES_FILE: &str = "notes.xhtml";

const COVER_FILE: &str = "cover.xhtml";
const TITLE_PAGE_FILE: &str = "titlepage.xhtml";
const ANNOTATION_FILE: &str = "annotation.xhtml";
const COPYRIGHT_FILE: &str = "copyright.xhtml";

/// Stylesheet location relative to a content document
const STYLESHEET_HREF: &str = "../Styles/style.css";

/// Image folder relative to a content document
const IMAGES_HREF: &str = "../Images";

/// The part of the book a rendered document holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentRole {
    Cover,
    TitlePage,
    Annotation,
    Chapter,
    Copyright,
    Notes,
}

/// A rendered XHTML content document
#[derive(Debug, Clone)]
pub struct RenderedDocument {
    /// Manifest id
    pub id: String,

    /// File name inside the text folder of the package
    pub file_name: String,

    /// Document title, the first section title for chapters
    pub title: String,

    pub role: DocumentRole,

    /// Whether the document is part of the linear reading order
    pub linear: bool,

    pub data: Vec<u8>,
}

/// All content documents of a book
#[derive(Debug, Clone, Default)]
pub struct RenderedBook {
    /// Documents in reading order
    pub documents: Vec<RenderedDocument>,

    /// Element id to the file name of the document holding it
    pub anchors: HashMap<String, String>,
}

impl RenderedBook {
    /// Chapter documents in reading order
    pub fn chapters(&self) -> impl Iterator<Item = &RenderedDocument> {
        self.documents
            .iter()
            .filter(|document| document.role == DocumentRole::Chapter)
    }

    /// Returns the document with the specified role
    pub fn document(&self, role: DocumentRole) -> Option<&RenderedDocument> {
        self.documents.iter().find(|document| document.role == role)
    }

    /// Returns the file name of the document holding an element id
    pub fn file_of(&self, anchor: &str) -> Option<&str> {
        self.anchors.get(anchor).map(String::as_str)
    }
}

/// A run of sections rendered into one chapter document
#[derive(Debug)]
struct Chunk<'d> {
    parts: Vec<ChunkPart<'d>>,
    size: usize,
}

#[derive(Debug, Clone, Copy)]
struct ChunkPart<'d> {
    section: &'d Section,
    level: usize,

    /// Whether subsections are rendered in the same document
    whole: bool,
}

impl<'d> Chunk<'d> {
    fn whole(section: &'d Section, level: usize) -> Self {
        Self {
            parts: vec![ChunkPart {
                section,
                level,
                whole: true,
            }],
            size: section.text_len(),
        }
    }
}

/// Distribute top-level sections over chapter documents
///
/// Without a threshold every top-level section is one document. With one,
/// oversized sections are split at their subsections and untitled sections
/// are merged into the preceding document while it stays under the threshold.
fn plan_chunks(sections: &[Section], threshold: Option<usize>) -> Vec<Chunk<'_>> {
    let mut chunks: Vec<Chunk> = Vec::new();

    for section in sections {
        let Some(limit) = threshold else {
            chunks.push(Chunk::whole(section, 1));
            continue;
        };

        let size = section.text_len();
        if section.title.is_none() {
            if let Some(last) = chunks.last_mut() {
                if last.size + size <= limit {
                    last.parts.push(ChunkPart {
                        section,
                        level: 1,
                        whole: true,
                    });
                    last.size += size;
                    continue;
                }
            }
        }

        if size > limit && !section.children.is_empty() {
            split_section(section, 1, limit, &mut chunks);
        } else {
            chunks.push(Chunk::whole(section, 1));
        }
    }

    chunks
}

fn split_section<'d>(
    section: &'d Section,
    level: usize,
    limit: usize,
    chunks: &mut Vec<Chunk<'d>>,
) {
    chunks.push(Chunk {
        parts: vec![ChunkPart {
            section,
            level,
            whole: false,
        }],
        size: section.own_text_len(),
    });

    for child in &section.children {
        if child.text_len() > limit && !child.children.is_empty() {
            split_section(child, level + 1, limit, chunks);
        } else {
            chunks.push(Chunk::whole(child, level + 1));
        }
    }
}

/// Collect the element ids carried by a run of nodes
fn collect_node_ids<'n>(nodes: &'n [Node], ids: &mut Vec<&'n str>) {
    for node in nodes {
        match node {
            Node::Paragraph { id, .. }
            | Node::Subtitle { id, .. }
            | Node::Image { id, .. }
            | Node::Table { id, .. } => ids.extend(id.as_deref()),

            Node::Epigraph { id, nodes, .. } | Node::Cite { id, nodes, .. } => {
                ids.extend(id.as_deref());
                collect_node_ids(nodes, ids);
            }

            Node::Poem(poem) => {
                ids.extend(poem.id.as_deref());
                collect_node_ids(&poem.epigraphs, ids);
            }

            Node::List { items, .. } => {
                for item in items {
                    collect_node_ids(item, ids);
                }
            }

            Node::Annotation(nodes) => collect_node_ids(nodes, ids),

            Node::EmptyLine | Node::Heading { .. } | Node::Opaque { .. } => {}
        }
    }
}

fn chapter_id(index: usize) -> String {
    format!("chapter-{:03}", index + 1)
}

/// Start tag with optional id and class
fn tag<'b>(name: &'b str, id: Option<&'b str>, class: Option<&'b str>) -> BytesStart<'b> {
    let mut tag = BytesStart::new(name);
    if let Some(id) = id {
        tag.push_attribute(("id", id));
    }
    if let Some(class) = class {
        tag.push_attribute(("class", class));
    }

    tag
}

/// Class name usable in CSS, derived from a free form style name
fn style_class(name: &str) -> Option<String> {
    let class = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>();

    match class.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => Some(class),
        Some(_) => Some(format!("style-{}", class)),
        None => None,
    }
}

fn write_text_element(
    writer: &mut XmlWriter,
    name: &str,
    class: Option<&str>,
    text: &str,
) -> Result<(), ConvertError> {
    writer.write_event(Event::Start(tag(name, None, class)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;

    Ok(())
}

/// XHTML renderer
///
/// Renders the chapters, the footnotes document and the optional front matter
/// of a [`Document`]. Footnote reference counts and the first reference of
/// every footnote are tracked while rendering so that the footnotes document
/// can link back to them.
pub struct ContentRenderer<'a> {
    document: &'a Document,
    config: &'a ConversionConfig,
    terms: &'static LocalizedTerms,

    /// Element id to file name
    anchors: HashMap<String, String>,

    /// Footnote id to its 1-based position in the document
    ordinals: HashMap<String, usize>,

    /// Footnote id to the number of references rendered so far
    reference_counts: HashMap<String, usize>,

    /// Footnote id to the location of its first reference
    first_references: HashMap<String, String>,

    /// File name of the document being rendered
    current_file: String,

    /// Set while the children of a link are written; links do not nest
    in_link: bool,
}

impl<'a> ContentRenderer<'a> {
    pub fn new(document: &'a Document, config: &'a ConversionConfig) -> Self {
        let ordinals = document
            .footnotes
            .iter()
            .enumerate()
            .map(|(index, note)| (note.id.clone(), index + 1))
            .collect();

        Self {
            document,
            config,
            terms: localized_terms(&document.metadata.language),
            anchors: HashMap::new(),
            ordinals,
            reference_counts: HashMap::new(),
            first_references: HashMap::new(),
            current_file: String::new(),
            in_link: false,
        }
    }

    /// Render the book
    ///
    /// ## Parameters
    /// - `diagnostics`: Sink for recovered problems
    ///
    /// ## Return
    /// - `Ok(RenderedBook)`: All documents in reading order
    /// - `Err(ConvertError)`: Writing the XML failed
    pub fn render(mut self, diagnostics: &mut Diagnostics) -> Result<RenderedBook, ConvertError> {
        let document = self.document;
        let chunks = plan_chunks(&document.sections, self.config.chapter_split_threshold);
        debug!(
            "rendering {} sections into {} chapter documents",
            document.sections.len(),
            chunks.len().max(1)
        );

        let with_annotation =
            self.config.annotation_page && !document.metadata.annotation.is_empty();
        let with_cover = self.config.cover_page
            && document
                .metadata
                .cover
                .as_deref()
                .is_some_and(|cover| document.binary(cover).is_some());

        self.index_anchors(&chunks, with_annotation);

        let mut documents = Vec::new();

        if with_cover {
            documents.push(self.render_cover()?);
        }
        if self.config.title_page {
            documents.push(self.render_title_page()?);
        }
        if with_annotation {
            documents.push(self.render_annotation(diagnostics)?);
        }

        if chunks.is_empty() {
            documents.push(self.render_chapter(0, None, diagnostics)?);
        }
        for (index, chunk) in chunks.iter().enumerate() {
            documents.push(self.render_chapter(index, Some(chunk), diagnostics)?);
        }

        if self.config.copyright_page && !document.metadata.publication_info.is_empty() {
            documents.push(self.render_copyright()?);
        }

        if !document.footnotes.is_empty() {
            documents.push(self.render_notes(diagnostics)?);
        }

        Ok(RenderedBook {
            documents,
            anchors: self.anchors,
        })
    }

    /// Map every element id to the file that will hold it
    fn index_anchors(&mut self, chunks: &[Chunk], with_annotation: bool) {
        let document = self.document;
        let mut entries: Vec<(&str, String)> = Vec::new();

        let first_chapter = format!("{}.xhtml", chapter_id(0));
        let mut ids = Vec::new();
        collect_node_ids(&document.preamble, &mut ids);
        entries.extend(ids.drain(..).map(|id| (id, first_chapter.clone())));

        fn section_ids<'s>(section: &'s Section, whole: bool, ids: &mut Vec<&'s str>) {
            ids.push(&section.anchor);
            collect_node_ids(&section.nodes, ids);
            if whole {
                for child in &section.children {
                    section_ids(child, true, ids);
                }
            }
        }

        for (index, chunk) in chunks.iter().enumerate() {
            let file = format!("{}.xhtml", chapter_id(index));
            for part in &chunk.parts {
                section_ids(part.section, part.whole, &mut ids);
            }
            entries.extend(ids.drain(..).map(|id| (id, file.clone())));
        }

        if with_annotation {
            collect_node_ids(&document.metadata.annotation, &mut ids);
            entries.extend(ids.drain(..).map(|id| (id, ANNOTATION_FILE.to_string())));
        }

        for note in &document.footnotes {
            ids.push(&note.id);
            collect_node_ids(&note.nodes, &mut ids);
        }
        entries.extend(ids.drain(..).map(|id| (id, NOTES_FILE.to_string())));

        for (id, file) in entries {
            self.anchors.entry(id.to_string()).or_insert(file);
        }
    }

    /// Write the XML declaration, the head and open the body
    fn start_document(
        &self,
        writer: &mut XmlWriter,
        title: &str,
        body_type: Option<&str>,
    ) -> Result<(), ConvertError> {
        let language = self.document.metadata.language.as_str();

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::DocType(BytesText::from_escaped("html")))?;
        writer.write_event(Event::Start(BytesStart::new("html").with_attributes([
            ("xmlns", "http://www.w3.org/1999/xhtml"),
            ("xmlns:epub", "http://www.idpf.org/2007/ops"),
            ("xml:lang", language),
            ("lang", language),
        ])))?;

        // make head
        writer.write_event(Event::Start(BytesStart::new("head")))?;
        writer.write_event(Event::Empty(
            BytesStart::new("meta").with_attributes([("charset", "utf-8")]),
        ))?;
        write_text_element(writer, "title", None, title)?;
        writer.write_event(Event::Empty(BytesStart::new("link").with_attributes([
            ("rel", "stylesheet"),
            ("type", "text/css"),
            ("href", STYLESHEET_HREF),
        ])))?;
        writer.write_event(Event::End(BytesEnd::new("head")))?;

        let mut body = BytesStart::new("body");
        if let Some(body_type) = body_type {
            body.push_attribute(("epub:type", body_type));
        }
        writer.write_event(Event::Start(body))?;

        Ok(())
    }

    fn finish_document(mut writer: XmlWriter) -> Result<Vec<u8>, ConvertError> {
        writer.write_event(Event::End(BytesEnd::new("body")))?;
        writer.write_event(Event::End(BytesEnd::new("html")))?;

        Ok(writer.into_inner().into_inner())
    }

    fn render_chapter(
        &mut self,
        index: usize,
        chunk: Option<&Chunk>,
        diagnostics: &mut Diagnostics,
    ) -> Result<RenderedDocument, ConvertError> {
        let document = self.document;
        let id = chapter_id(index);
        let file_name = format!("{}.xhtml", id);
        self.current_file = file_name.clone();

        let title = chunk
            .and_then(|chunk| chunk.parts.first())
            .and_then(|part| part.section.title.as_ref())
            .map(Title::plain_text)
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| document.metadata.title.clone());

        let mut writer = Writer::new(Cursor::new(Vec::new()));
        self.start_document(&mut writer, &title, Some("bodymatter"))?;

        if index == 0 {
            self.write_nodes(&mut writer, &document.preamble, 1, diagnostics)?;

            // A book without any content still gets a readable first page
            if chunk.is_none() && document.preamble.is_empty() {
                write_text_element(&mut writer, "h1", Some("title"), &document.metadata.title)?;
            }
        }

        if let Some(chunk) = chunk {
            for part in &chunk.parts {
                self.write_section(&mut writer, part.section, part.level, part.whole, diagnostics)?;
            }
        }

        Ok(RenderedDocument {
            id,
            file_name,
            title,
            role: DocumentRole::Chapter,
            linear: true,
            data: Self::finish_document(writer)?,
        })
    }

    fn render_cover(&mut self) -> Result<RenderedDocument, ConvertError> {
        let document = self.document;
        self.current_file = COVER_FILE.to_string();

        let mut writer = Writer::new(Cursor::new(Vec::new()));
        self.start_document(&mut writer, self.terms.cover, None)?;

        let file_name = document
            .metadata
            .cover
            .as_deref()
            .and_then(|cover| document.binary(cover))
            .map(|binary| binary.file_name.as_str())
            .unwrap_or_default();
        let src = format!("{}/{}", IMAGES_HREF, file_name);

        writer.write_event(Event::Start(
            tag("section", None, Some("cover")).with_attributes([("epub:type", "cover")]),
        ))?;
        writer.write_event(Event::Empty(BytesStart::new("img").with_attributes([
            ("src", src.as_str()),
            ("alt", self.terms.cover),
        ])))?;
        writer.write_event(Event::End(BytesEnd::new("section")))?;

        Ok(RenderedDocument {
            id: "cover".to_string(),
            file_name: COVER_FILE.to_string(),
            title: self.terms.cover.to_string(),
            role: DocumentRole::Cover,
            linear: true,
            data: Self::finish_document(writer)?,
        })
    }

    fn render_title_page(&mut self) -> Result<RenderedDocument, ConvertError> {
        let document = self.document;
        let metadata = &document.metadata;
        self.current_file = TITLE_PAGE_FILE.to_string();

        let mut writer = Writer::new(Cursor::new(Vec::new()));
        self.start_document(&mut writer, &metadata.title, None)?;

        writer.write_event(Event::Start(
            tag("section", None, Some("titlepage")).with_attributes([("epub:type", "titlepage")]),
        ))?;

        if !metadata.authors.is_empty() {
            let authors = metadata
                .authors
                .iter()
                .map(|author| author.display_name())
                .collect::<Vec<_>>()
                .join(", ");
            write_text_element(&mut writer, "p", Some("title-authors"), &authors)?;
        }

        write_text_element(&mut writer, "h1", Some("title"), &metadata.title)?;

        if let Some(sequence) = &metadata.sequence {
            let series = match &sequence.number {
                Some(number) => format!("{}: {} #{}", self.terms.series, sequence.name, number),
                None => format!("{}: {}", self.terms.series, sequence.name),
            };
            write_text_element(&mut writer, "p", Some("title-series"), &series)?;
        }

        if !metadata.translators.is_empty() {
            let translators = format!(
                "{}: {}",
                self.terms.translated_by,
                metadata
                    .translators
                    .iter()
                    .map(|translator| translator.display_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            write_text_element(&mut writer, "p", Some("title-translators"), &translators)?;
        }

        writer.write_event(Event::End(BytesEnd::new("section")))?;

        Ok(RenderedDocument {
            id: "titlepage".to_string(),
            file_name: TITLE_PAGE_FILE.to_string(),
            title: metadata.title.clone(),
            role: DocumentRole::TitlePage,
            linear: true,
            data: Self::finish_document(writer)?,
        })
    }

    fn render_annotation(
        &mut self,
        diagnostics: &mut Diagnostics,
    ) -> Result<RenderedDocument, ConvertError> {
        let document = self.document;
        self.current_file = ANNOTATION_FILE.to_string();

        let mut writer = Writer::new(Cursor::new(Vec::new()));
        self.start_document(&mut writer, self.terms.annotation, Some("frontmatter"))?;

        writer.write_event(Event::Start(
            tag("section", None, Some("annotation")).with_attributes([("epub:type", "preface")]),
        ))?;
        write_text_element(&mut writer, "h1", Some("title"), self.terms.annotation)?;
        self.write_nodes(&mut writer, &document.metadata.annotation, 2, diagnostics)?;
        writer.write_event(Event::End(BytesEnd::new("section")))?;

        Ok(RenderedDocument {
            id: "annotation".to_string(),
            file_name: ANNOTATION_FILE.to_string(),
            title: self.terms.annotation.to_string(),
            role: DocumentRole::Annotation,
            linear: true,
            data: Self::finish_document(writer)?,
        })
    }

    /// Render the publication details as definition lists, one per info group
    fn render_copyright(&mut self) -> Result<RenderedDocument, ConvertError> {
        let document = self.document;
        self.current_file = COPYRIGHT_FILE.to_string();

        let mut writer = Writer::new(Cursor::new(Vec::new()));
        self.start_document(&mut writer, self.terms.copyright, Some("backmatter"))?;

        writer.write_event(Event::Start(
            tag("section", None, Some("copyright"))
                .with_attributes([("epub:type", "copyright-page")]),
        ))?;
        write_text_element(&mut writer, "h1", Some("title"), self.terms.copyright)?;

        for group in &document.metadata.publication_info {
            write_text_element(&mut writer, "h2", None, self.terms.info_group(group.kind))?;
            writer.write_event(Event::Start(BytesStart::new("dl")))?;
            for (field, value) in &group.entries {
                write_text_element(&mut writer, "dt", None, self.terms.info_field(*field))?;
                write_text_element(&mut writer, "dd", None, value)?;
            }
            writer.write_event(Event::End(BytesEnd::new("dl")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("section")))?;

        Ok(RenderedDocument {
            id: "copyright".to_string(),
            file_name: COPYRIGHT_FILE.to_string(),
            title: self.terms.copyright.to_string(),
            role: DocumentRole::Copyright,
            linear: true,
            data: Self::finish_document(writer)?,
        })
    }

    /// Render the footnotes document
    ///
    /// Notes and comments are written as separate groups, each under its
    /// localized heading.
    fn render_notes(&mut self, diagnostics: &mut Diagnostics) -> Result<RenderedDocument, ConvertError> {
        let document = self.document;
        self.current_file = NOTES_FILE.to_string();

        let mut writer = Writer::new(Cursor::new(Vec::new()));
        self.start_document(&mut writer, self.terms.notes, Some("backmatter"))?;

        for (kind, heading) in [
            (FootnoteKind::Note, self.terms.notes),
            (FootnoteKind::Comment, self.terms.comments),
        ] {
            let group = document
                .footnotes
                .iter()
                .filter(|note| note.kind == kind)
                .collect::<Vec<_>>();
            if group.is_empty() {
                continue;
            }

            match self.config.footnote_style {
                FootnoteStyle::Popup => {
                    writer.write_event(Event::Start(tag("section", None, Some("footnotes"))))?;
                    write_text_element(&mut writer, "h1", Some("title"), heading)?;
                    for note in group {
                        self.write_footnote(&mut writer, note, diagnostics)?;
                    }
                    writer.write_event(Event::End(BytesEnd::new("section")))?;
                }

                FootnoteStyle::Endnote => {
                    writer.write_event(Event::Start(
                        tag("section", None, Some("endnotes")).with_attributes([
                            ("epub:type", "endnotes"),
                            ("role", "doc-endnotes"),
                        ]),
                    ))?;
                    write_text_element(&mut writer, "h1", Some("title"), heading)?;
                    writer.write_event(Event::Start(BytesStart::new("ol")))?;
                    for note in group {
                        self.write_footnote(&mut writer, note, diagnostics)?;
                    }
                    writer.write_event(Event::End(BytesEnd::new("ol")))?;
                    writer.write_event(Event::End(BytesEnd::new("section")))?;
                }
            }
        }

        Ok(RenderedDocument {
            id: "notes".to_string(),
            file_name: NOTES_FILE.to_string(),
            title: self.terms.notes.to_string(),
            role: DocumentRole::Notes,
            linear: self.config.footnote_style == FootnoteStyle::Endnote,
            data: Self::finish_document(writer)?,
        })
    }

    fn write_footnote(
        &mut self,
        writer: &mut XmlWriter,
        note: &Footnote,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ConvertError> {
        let (name, class, epub_type, role) = match self.config.footnote_style {
            FootnoteStyle::Popup => ("aside", "footnote", "footnote", "doc-footnote"),
            FootnoteStyle::Endnote => ("li", "endnote", "endnote", "doc-endnote"),
        };

        writer.write_event(Event::Start(
            tag(name, Some(note.id.as_str()), Some(class))
                .with_attributes([("epub:type", epub_type), ("role", role)]),
        ))?;

        let ordinal = self.ordinals.get(&note.id).copied().unwrap_or_default();
        let label = note.label(ordinal);

        writer.write_event(Event::Start(tag("p", None, Some("note-label"))))?;
        match self.first_references.get(&note.id) {
            Some(href) => {
                writer.write_event(Event::Start(
                    BytesStart::new("a")
                        .with_attributes([("href", href.as_str()), ("role", "doc-backlink")]),
                ))?;
                writer.write_event(Event::Text(BytesText::new(&label)))?;
                writer.write_event(Event::End(BytesEnd::new("a")))?;
            }
            None => writer.write_event(Event::Text(BytesText::new(&label)))?,
        }
        writer.write_event(Event::End(BytesEnd::new("p")))?;

        self.write_nodes(writer, &note.nodes, 2, diagnostics)?;

        writer.write_event(Event::End(BytesEnd::new(name)))?;

        Ok(())
    }

    fn write_section(
        &mut self,
        writer: &mut XmlWriter,
        section: &Section,
        level: usize,
        whole: bool,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ConvertError> {
        let mut start = tag("section", Some(section.anchor.as_str()), None);
        if level == 1 {
            start.push_attribute(("epub:type", "chapter"));
        }
        writer.write_event(Event::Start(start))?;

        if let Some(title) = &section.title {
            self.write_title(writer, title, level, diagnostics)?;
        }

        self.write_nodes(writer, &section.nodes, level + 1, diagnostics)?;

        if whole {
            for child in &section.children {
                self.write_section(writer, child, level + 1, true, diagnostics)?;
            }
        }

        writer.write_event(Event::End(BytesEnd::new("section")))?;

        Ok(())
    }

    /// Write a title as heading, lines separated by line breaks
    fn write_title(
        &mut self,
        writer: &mut XmlWriter,
        title: &Title,
        level: usize,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ConvertError> {
        let name = format!("h{}", level.clamp(1, 6));
        writer.write_event(Event::Start(tag(&name, None, Some("title"))))?;

        for (index, line) in title.lines.iter().enumerate() {
            if index > 0 {
                writer.write_event(Event::Empty(BytesStart::new("br")))?;
            }
            self.write_inlines(writer, line, diagnostics)?;
        }

        writer.write_event(Event::End(BytesEnd::new(name)))?;

        Ok(())
    }

    /// Write a run of blocks
    ///
    /// Blocks without a rendering rule are written as plain text paragraphs
    /// and recorded as warnings.
    fn write_nodes(
        &mut self,
        writer: &mut XmlWriter,
        nodes: &[Node],
        level: usize,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ConvertError> {
        for node in nodes {
            match self.write_node(writer, node, level, diagnostics) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnsupportedStructure => {
                    diagnostics.recover(err);
                    write_text_element(writer, "p", Some("unsupported"), &node.plain_text())?;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Write a single block
    ///
    /// Returns `UnsupportedStructure` before writing anything for blocks
    /// without a rendering rule.
    fn write_node(
        &mut self,
        writer: &mut XmlWriter,
        node: &Node,
        level: usize,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ConvertError> {
        match node {
            Node::Paragraph { id, inlines } => {
                writer.write_event(Event::Start(tag("p", id.as_deref(), None)))?;
                self.write_inlines(writer, inlines, diagnostics)?;
                writer.write_event(Event::End(BytesEnd::new("p")))?;
            }

            Node::Subtitle { id, inlines } => {
                writer.write_event(Event::Start(tag("p", id.as_deref(), Some("subtitle"))))?;
                self.write_inlines(writer, inlines, diagnostics)?;
                writer.write_event(Event::End(BytesEnd::new("p")))?;
            }

            Node::EmptyLine => {
                writer.write_event(Event::Empty(tag("p", None, Some("empty-line"))))?;
            }

            Node::Heading { level, title } => {
                self.write_title(writer, title, *level, diagnostics)?;
            }

            Node::Image { id, binary_id, alt, title } => {
                let Some(binary) = self.document.binary(binary_id) else {
                    diagnostics.recover(ConvertError::ResourceResolution {
                        reference: format!("#{}", binary_id),
                    });

                    writer.write_event(Event::Start(tag("p", id.as_deref(), Some("image"))))?;
                    let alt = alt.as_deref().unwrap_or("");
                    write_text_element(writer, "span", Some("missing-image"), alt)?;
                    writer.write_event(Event::End(BytesEnd::new("p")))?;
                    return Ok(());
                };

                let src = format!("{}/{}", IMAGES_HREF, binary.file_name);
                let alt = alt.as_deref().or(title.as_deref()).unwrap_or("");

                writer.write_event(Event::Start(tag("figure", id.as_deref(), Some("image"))))?;
                writer.write_event(Event::Empty(
                    BytesStart::new("img").with_attributes([("src", src.as_str()), ("alt", alt)]),
                ))?;
                if let Some(title) = title {
                    write_text_element(writer, "figcaption", None, title)?;
                }
                writer.write_event(Event::End(BytesEnd::new("figure")))?;
            }

            Node::Table { id, rows } => {
                writer.write_event(Event::Start(tag("table", id.as_deref(), None)))?;
                writer.write_event(Event::Start(BytesStart::new("tbody")))?;
                for row in rows {
                    writer.write_event(Event::Start(BytesStart::new("tr")))?;
                    for cell in &row.cells {
                        self.write_table_cell(writer, cell, diagnostics)?;
                    }
                    writer.write_event(Event::End(BytesEnd::new("tr")))?;
                }
                writer.write_event(Event::End(BytesEnd::new("tbody")))?;
                writer.write_event(Event::End(BytesEnd::new("table")))?;
            }

            Node::List { ordered, items } => {
                let name = if *ordered { "ol" } else { "ul" };
                writer.write_event(Event::Start(BytesStart::new(name)))?;
                for item in items {
                    writer.write_event(Event::Start(BytesStart::new("li")))?;
                    self.write_nodes(writer, item, level, diagnostics)?;
                    writer.write_event(Event::End(BytesEnd::new("li")))?;
                }
                writer.write_event(Event::End(BytesEnd::new(name)))?;
            }

            Node::Epigraph { id, nodes, authors } => {
                self.write_quote(writer, "epigraph", id.as_deref(), nodes, authors, level, diagnostics)?;
            }

            Node::Cite { id, nodes, authors } => {
                self.write_quote(writer, "cite", id.as_deref(), nodes, authors, level, diagnostics)?;
            }

            Node::Poem(poem) => self.write_poem(writer, poem, level, diagnostics)?,

            Node::Annotation(nodes) => {
                writer.write_event(Event::Start(tag("section", None, Some("annotation"))))?;
                self.write_nodes(writer, nodes, level, diagnostics)?;
                writer.write_event(Event::End(BytesEnd::new("section")))?;
            }

            Node::Opaque { name, .. } => {
                return Err(ConvertError::UnsupportedStructure {
                    element: name.clone(),
                });
            }
        }

        Ok(())
    }

    fn write_table_cell(
        &mut self,
        writer: &mut XmlWriter,
        cell: &TableCell,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ConvertError> {
        let name = if cell.header { "th" } else { "td" };

        let mut start = BytesStart::new(name);
        if let Some(colspan) = &cell.colspan {
            start.push_attribute(("colspan", colspan.as_str()));
        }
        if let Some(rowspan) = &cell.rowspan {
            start.push_attribute(("rowspan", rowspan.as_str()));
        }
        let align = cell
            .align
            .as_deref()
            .filter(|align| matches!(*align, "left" | "right" | "center" | "justify"))
            .map(|align| format!("text-align: {}", align));
        if let Some(align) = &align {
            start.push_attribute(("style", align.as_str()));
        }

        writer.write_event(Event::Start(start))?;
        self.write_inlines(writer, &cell.inlines, diagnostics)?;
        writer.write_event(Event::End(BytesEnd::new(name)))?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_quote(
        &mut self,
        writer: &mut XmlWriter,
        class: &str,
        id: Option<&str>,
        nodes: &[Node],
        authors: &[Vec<Inline>],
        level: usize,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ConvertError> {
        writer.write_event(Event::Start(tag("blockquote", id, Some(class))))?;
        self.write_nodes(writer, nodes, level, diagnostics)?;

        for author in authors {
            writer.write_event(Event::Start(tag("p", None, Some("text-author"))))?;
            self.write_inlines(writer, author, diagnostics)?;
            writer.write_event(Event::End(BytesEnd::new("p")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("blockquote")))?;

        Ok(())
    }

    fn write_poem(
        &mut self,
        writer: &mut XmlWriter,
        poem: &Poem,
        level: usize,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ConvertError> {
        writer.write_event(Event::Start(tag("section", poem.id.as_deref(), Some("poem"))))?;

        if let Some(title) = &poem.title {
            self.write_title(writer, title, level, diagnostics)?;
        }

        self.write_nodes(writer, &poem.epigraphs, level, diagnostics)?;

        for stanza in &poem.stanzas {
            if let Some(title) = &stanza.title {
                self.write_title(writer, title, level + 1, diagnostics)?;
            }
            if let Some(subtitle) = &stanza.subtitle {
                writer.write_event(Event::Start(tag("p", None, Some("subtitle"))))?;
                self.write_inlines(writer, subtitle, diagnostics)?;
                writer.write_event(Event::End(BytesEnd::new("p")))?;
            }

            writer.write_event(Event::Start(tag("p", None, Some("stanza"))))?;
            for (index, verse) in stanza.verses.iter().enumerate() {
                if index > 0 {
                    writer.write_event(Event::Empty(BytesStart::new("br")))?;
                }
                writer.write_event(Event::Start(tag("span", None, Some("verse"))))?;
                self.write_inlines(writer, verse, diagnostics)?;
                writer.write_event(Event::End(BytesEnd::new("span")))?;
            }
            writer.write_event(Event::End(BytesEnd::new("p")))?;
        }

        for author in &poem.authors {
            writer.write_event(Event::Start(tag("p", None, Some("text-author"))))?;
            self.write_inlines(writer, author, diagnostics)?;
            writer.write_event(Event::End(BytesEnd::new("p")))?;
        }

        if let Some(date) = &poem.date {
            write_text_element(writer, "p", Some("date"), date)?;
        }

        writer.write_event(Event::End(BytesEnd::new("section")))?;

        Ok(())
    }

    /// Write a run of inlines
    ///
    /// Inlines without a rendering rule are written as plain text spans and
    /// recorded as warnings.
    fn write_inlines(
        &mut self,
        writer: &mut XmlWriter,
        inlines: &[Inline],
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ConvertError> {
        for inline in inlines {
            match self.write_inline(writer, inline, diagnostics) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnsupportedStructure => {
                    diagnostics.recover(err);
                    let text = Inline::plain_text(std::slice::from_ref(inline));
                    write_text_element(writer, "span", Some("unsupported"), &text)?;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    fn write_inline(
        &mut self,
        writer: &mut XmlWriter,
        inline: &Inline,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ConvertError> {
        let (name, children) = match inline {
            Inline::Text(text) => {
                writer.write_event(Event::Text(BytesText::new(text)))?;
                return Ok(());
            }

            Inline::Strong(children) => ("strong", children),
            Inline::Emphasis(children) => ("em", children),
            Inline::Strikethrough(children) => ("s", children),
            Inline::Superscript(children) => ("sup", children),
            Inline::Subscript(children) => ("sub", children),
            Inline::Code(children) => ("code", children),

            Inline::Style { name, children } => {
                let class = style_class(name);
                writer.write_event(Event::Start(tag("span", None, class.as_deref())))?;
                self.write_inlines(writer, children, diagnostics)?;
                writer.write_event(Event::End(BytesEnd::new("span")))?;
                return Ok(());
            }

            Inline::NoteRef { note_id, children } => {
                return self.write_note_reference(writer, note_id, children);
            }

            Inline::InternalLink { target, children } => {
                let href = self
                    .anchors
                    .get(target)
                    .map(|file| format!("{}#{}", file, target));

                match href {
                    Some(href) if !self.in_link => {
                        writer.write_event(Event::Start(
                            BytesStart::new("a").with_attributes([("href", href.as_str())]),
                        ))?;
                        self.write_link_children(writer, children, diagnostics)?;
                        writer.write_event(Event::End(BytesEnd::new("a")))?;
                    }
                    Some(_) => self.write_inlines(writer, children, diagnostics)?,
                    None => {
                        diagnostics.recover(ConvertError::ResourceResolution {
                            reference: format!("#{}", target),
                        });
                        self.write_inlines(writer, children, diagnostics)?;
                    }
                }
                return Ok(());
            }

            Inline::ExternalLink { href, children } => {
                if self.in_link {
                    self.write_inlines(writer, children, diagnostics)?;
                } else {
                    writer.write_event(Event::Start(
                        tag("a", None, Some("external")).with_attributes([("href", href.as_str())]),
                    ))?;
                    self.write_link_children(writer, children, diagnostics)?;
                    writer.write_event(Event::End(BytesEnd::new("a")))?;
                }
                return Ok(());
            }

            Inline::Image { binary_id, alt } => {
                let alt = alt.as_deref().unwrap_or("");
                match self.document.binary(binary_id) {
                    Some(binary) => {
                        let src = format!("{}/{}", IMAGES_HREF, binary.file_name);
                        writer.write_event(Event::Empty(BytesStart::new("img").with_attributes([
                            ("src", src.as_str()),
                            ("alt", alt),
                            ("class", "inline-image"),
                        ])))?;
                    }
                    None => {
                        diagnostics.recover(ConvertError::ResourceResolution {
                            reference: format!("#{}", binary_id),
                        });
                        write_text_element(writer, "span", Some("missing-image"), alt)?;
                    }
                }
                return Ok(());
            }

            // Already reported by the parser
            Inline::Unresolved { children, .. } => {
                return self.write_inlines(writer, children, diagnostics);
            }

            Inline::Opaque { name, .. } => {
                return Err(ConvertError::UnsupportedStructure {
                    element: name.clone(),
                });
            }
        };

        writer.write_event(Event::Start(BytesStart::new(name)))?;
        self.write_inlines(writer, children, diagnostics)?;
        writer.write_event(Event::End(BytesEnd::new(name)))?;

        Ok(())
    }

    fn write_link_children(
        &mut self,
        writer: &mut XmlWriter,
        children: &[Inline],
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ConvertError> {
        self.in_link = true;
        let result = self.write_inlines(writer, children, diagnostics);
        self.in_link = false;

        result
    }

    /// Write a footnote reference
    ///
    /// Every reference gets its own id so that the footnote body can link
    /// back to its first reference.
    fn write_note_reference(
        &mut self,
        writer: &mut XmlWriter,
        note_id: &str,
        children: &[Inline],
    ) -> Result<(), ConvertError> {
        let text = Inline::plain_text(children).trim().to_string();
        let label = if text.is_empty() {
            let ordinal = self.ordinals.get(note_id).copied().unwrap_or_default();
            self.document
                .footnote(note_id)
                .map(|note| note.label(ordinal))
                .unwrap_or_else(|| ordinal.to_string())
        } else {
            text
        };

        if self.in_link {
            writer.write_event(Event::Text(BytesText::new(&label)))?;
            return Ok(());
        }

        let count = self.reference_counts.entry(note_id.to_string()).or_insert(0);
        *count += 1;
        let reference_id = format!("{}{}-{}", REFERENCE_ID_PREFIX, note_id, count);
        self.first_references
            .entry(note_id.to_string())
            .or_insert_with(|| format!("{}#{}", self.current_file, reference_id));

        let href = format!("{}#{}", NOTES_FILE, note_id);
        writer.write_event(Event::Start(BytesStart::new("a").with_attributes([
            ("class", "noteref"),
            ("epub:type", "noteref"),
            ("role", "doc-noteref"),
            ("href", href.as_str()),
            ("id", reference_id.as_str()),
        ])))?;
        writer.write_event(Event::Text(BytesText::new(&label)))?;
        writer.write_event(Event::End(BytesEnd::new("a")))?;

        Ok(())
    }
}
