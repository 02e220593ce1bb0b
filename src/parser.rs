//! FB2 parser
//!
//! Interprets a FictionBook 2 document into the [`Document`] model.
//!
//! ## Usage
//!
//! ```rust
//! use fb2_epub::{config::ConversionConfig, parser::Fb2Parser, report::Diagnostics};
//!
//! let source = br#"<?xml version="1.0" encoding="UTF-8"?>
//! <FictionBook xmlns="http://www.gribuser.ru/xml/fictionbook/2.0">
//!   <description><title-info><book-title>Sample</book-title></title-info></description>
//!   <body><section><title><p>Chapter 1</p></title><p>Hello.</p></section></body>
//! </FictionBook>"#;
//!
//! let config = ConversionConfig::default();
//! let mut diagnostics = Diagnostics::new();
//! let document = Fb2Parser::new(&config).parse(source, &mut diagnostics).unwrap();
//!
//! assert_eq!(document.metadata.title, "Sample");
//! assert_eq!(document.sections.len(), 1);
//! ```
//!
//! The parser is fail-soft: only input that cannot be read as a FictionBook
//! document at all is rejected. Everything else is kept, degraded if needed,
//! and reported through [`Diagnostics`].

use std::collections::{HashMap, HashSet};

use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use indexmap::IndexMap;
use log::{debug, info};

use crate::{
    config::ConversionConfig,
    error::ConvertError,
    model::{
        BinaryResource, Document, Footnote, FootnoteKind, InfoField, InfoGroup, InfoGroupKind,
        Inline, MAX_SECTION_DEPTH, Metadata, Node, Person, Poem, REFERENCE_ID_PREFIX, Section, Sequence, Stanza, StylesheetRef,
        TableCell, TableRow, Title,
    },
    report::{Diagnostics, WarningKind},
    utils::{
        NormalizeWhitespace, XmlElement, XmlNode, XmlReader, derive_identifier,
        detect_media_type, extension_for_media_type, normalize_language, sanitize_id,
    },
};

/// Base64 engine accepting payloads with or without padding
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Names of bodies that hold footnotes or comments rather than book content
const NOTE_BODY_NAMES: [&str; 3] = ["notes", "comments", "footnotes"];

/// FB2 document parser
pub struct Fb2Parser<'a> {
    config: &'a ConversionConfig,
}

impl<'a> Fb2Parser<'a> {
    pub fn new(config: &'a ConversionConfig) -> Self {
        Self { config }
    }

    /// Parse an FB2 document
    ///
    /// ## Parameters
    /// - `bytes`: The raw document, in any encoding declared by the document itself
    /// - `diagnostics`: Sink for recoverable problems
    ///
    /// ## Return
    /// - `Ok(Document)`: The parsed document
    /// - `Err(ConvertError)`: `MalformedInput` for unparseable XML or a non FB2 root,
    ///   `EncodingError` for undecodable input
    pub fn parse(
        &self,
        bytes: &[u8],
        diagnostics: &mut Diagnostics,
    ) -> Result<Document, ConvertError> {
        let root = XmlReader::parse_bytes(bytes)?;
        if root.name != "FictionBook" {
            return Err(ConvertError::MalformedInput {
                reason: format!(
                    "the root element is \"{}\", expected \"FictionBook\"",
                    root.tag_name()
                ),
            });
        }

        let (note_bodies, main_bodies): (Vec<&XmlElement>, Vec<&XmlElement>) = root
            .find_children_by_name("body")
            .partition(|body| is_note_body(body));

        if main_bodies.is_empty() {
            return Err(ConvertError::MalformedInput {
                reason: "the document has no content body".to_string(),
            });
        }

        let mut walker = BodyWalker::new(diagnostics);
        for body in main_bodies.iter().chain(note_bodies.iter()) {
            walker.register_ids(body);
        }
        for body in &note_bodies {
            walker.register_footnote_ids(body);
        }

        let footnotes = note_bodies
            .iter()
            .flat_map(|body| walker.collect_footnotes(body))
            .collect::<Vec<_>>();

        let mut metadata = self.parse_metadata(&root, bytes, &mut walker);

        let mut preamble = Vec::new();
        let mut sections = Vec::new();
        for (index, body) in main_bodies.iter().enumerate() {
            let (head, body_sections) = walker.walk_body(body);

            if index == 0 {
                preamble = head;
                sections.extend(body_sections);
                continue;
            }

            // Additional bodies become a titled wrapper section when they have a title
            let mut head = head.into_iter().peekable();
            match head.peek() {
                Some(Node::Heading { .. }) => {
                    let mut wrapper = Section::new(&walker.ids.generate("body"));
                    if let Some(Node::Heading { title, .. }) = head.next() {
                        wrapper.title = Some(title);
                    }
                    wrapper.nodes.extend(head);
                    wrapper.children = body_sections;
                    sections.push(wrapper);
                }
                Some(_) => {
                    let mut wrapper = Section::new(&walker.ids.generate("body"));
                    wrapper.nodes.extend(head);
                    sections.push(wrapper);
                    sections.extend(body_sections);
                }
                None => sections.extend(body_sections),
            }
        }

        let mut binaries = walker.parse_binaries(&root);

        if let Some(cover) = &metadata.cover {
            if binaries.contains_key(cover) {
                walker.images.insert(cover.clone());
            } else {
                walker.diagnostics.warn(
                    WarningKind::ResourceResolution,
                    format!("cover image \"#{}\" does not exist, the cover is ignored", cover),
                );
                metadata.cover = None;
            }
        }

        binaries.retain(|id, _| {
            let referenced = walker.images.contains(id);
            if !referenced {
                debug!("binary \"{}\" is never referenced and is dropped", id);
            }
            referenced
        });

        let stylesheet = match &self.config.custom_css_path {
            Some(path) => StylesheetRef::Custom(path.clone()),
            None => StylesheetRef::Default,
        };

        Ok(Document {
            metadata,
            preamble,
            sections,
            footnotes,
            binaries,
            stylesheet,
        })
    }

    fn parse_metadata(
        &self,
        root: &XmlElement,
        bytes: &[u8],
        walker: &mut BodyWalker,
    ) -> Metadata {
        let description = root.find_child("description");
        let title_info = description.and_then(|element| element.find_child("title-info"));
        let document_info = description.and_then(|element| element.find_child("document-info"));
        let publish_info = description.and_then(|element| element.find_child("publish-info"));
        let src_title_info = description.and_then(|element| element.find_child("src-title-info"));

        let mut metadata = Metadata::default();

        metadata.title = match title_info.and_then(|info| info.child_text("book-title")) {
            Some(title) => title,
            None => {
                info!("the book has no title, using \"Untitled\"");
                "Untitled".to_string()
            }
        };

        metadata.language = match title_info.and_then(|info| info.child_text("lang")) {
            Some(lang) => match normalize_language(&lang) {
                Some(lang) => lang,
                None => {
                    info!(
                        "invalid book language \"{}\", using \"{}\"",
                        lang, self.config.default_language
                    );
                    self.config.default_language.clone()
                }
            },
            None => {
                info!(
                    "the book has no language, using \"{}\"",
                    self.config.default_language
                );
                self.config.default_language.clone()
            }
        };

        metadata.identifier = match document_info.and_then(|info| info.child_text("id")) {
            Some(id) if looks_like_uuid(&id) => format!("urn:uuid:{}", id.to_ascii_lowercase()),
            Some(id) => id,
            None => {
                let id = derive_identifier(bytes);
                info!("the book has no identifier, using derived \"{}\"", id);
                id
            }
        };

        if let Some(title_info) = title_info {
            metadata.authors = parse_persons(title_info, "author");
            metadata.translators = parse_persons(title_info, "translator");

            metadata.genres = title_info
                .find_children_by_name("genre")
                .map(|genre| genre.text().normalize_whitespace())
                .filter(|genre| !genre.is_empty())
                .collect();

            metadata.keywords = title_info
                .child_text("keywords")
                .map(|keywords| {
                    keywords
                        .split(',')
                        .map(str::trim)
                        .filter(|keyword| !keyword.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();

            metadata.date = parse_date(title_info);
            metadata.source_language = title_info
                .child_text("src-lang")
                .and_then(|lang| normalize_language(&lang));

            metadata.sequence = title_info.find_child("sequence").and_then(|sequence| {
                let name = sequence.get_attr("name")?.normalize_whitespace();
                if name.is_empty() {
                    return None;
                }

                Some(Sequence {
                    name,
                    number: sequence
                        .get_attr("number")
                        .map(|number| number.trim().to_string())
                        .filter(|number| !number.is_empty()),
                })
            });

            metadata.cover = title_info
                .find_child("coverpage")
                .and_then(|coverpage| coverpage.find_child("image"))
                .and_then(|image| image.get_attr_local("href"))
                .map(|href| href.trim_start_matches('#').to_string())
                .filter(|href| !href.is_empty());

            if let Some(annotation) = title_info.find_child("annotation") {
                metadata.annotation = walker.parse_blocks(annotation);
                let description = metadata
                    .annotation
                    .iter()
                    .map(Node::plain_text)
                    .map(|text| text.normalize_whitespace())
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");

                if !description.is_empty() {
                    metadata.description = Some(description);
                }
            }
        }

        if metadata.date.is_none() {
            metadata.date = document_info.and_then(parse_date);
        }

        if let Some(publish_info) = publish_info {
            metadata.publisher = publish_info.child_text("publisher");
            metadata.isbn = publish_info.child_text("isbn");
            metadata.year = publish_info.child_text("year");
        }

        metadata.publication_info = [
            (InfoGroupKind::Publication, publish_info),
            (InfoGroupKind::SourcePublication, src_title_info),
            (InfoGroupKind::Document, document_info),
        ]
        .into_iter()
        .filter_map(|(kind, info)| {
            let entries = info_entries(kind, info?);
            (!entries.is_empty()).then_some(InfoGroup { kind, entries })
        })
        .collect();

        metadata
    }
}

fn is_note_body(body: &XmlElement) -> bool {
    body.get_attr("name")
        .is_some_and(|name| NOTE_BODY_NAMES.contains(&name.trim().to_lowercase().as_str()))
}

fn looks_like_uuid(value: &str) -> bool {
    value.len() == 36
        && value.chars().enumerate().all(|(index, c)| match index {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

/// Collect the displayable details of an info element
fn info_entries(kind: InfoGroupKind, info: &XmlElement) -> Vec<(InfoField, String)> {
    let fields: &[(&str, InfoField)] = match kind {
        InfoGroupKind::Publication => &[
            ("book-name", InfoField::Title),
            ("publisher", InfoField::Publisher),
            ("city", InfoField::City),
            ("year", InfoField::Year),
            ("isbn", InfoField::Isbn),
        ],
        InfoGroupKind::SourcePublication => &[
            ("book-title", InfoField::Title),
            ("author", InfoField::Author),
            ("lang", InfoField::Language),
            ("date", InfoField::Date),
        ],
        InfoGroupKind::Document => &[
            ("author", InfoField::Author),
            ("program-used", InfoField::ProgramUsed),
            ("date", InfoField::Date),
            ("id", InfoField::Identifier),
            ("version", InfoField::Version),
        ],
    };

    fields
        .iter()
        .filter_map(|&(tag, field)| {
            let value = match field {
                InfoField::Author => Some(
                    parse_persons(info, tag)
                        .iter()
                        .filter(|person| !person.is_empty())
                        .map(Person::display_name)
                        .collect::<Vec<_>>()
                        .join(", "),
                )
                .filter(|names| !names.is_empty()),
                InfoField::Date => info.child_text(tag).or_else(|| parse_date(info)),
                _ => info.child_text(tag),
            }?;

            Some((field, value))
        })
        .collect()
}

fn parse_persons(info: &XmlElement, tag: &str) -> Vec<Person> {
    info.find_children_by_name(tag)
        .map(|element| Person {
            first_name: element.child_text("first-name"),
            middle_name: element.child_text("middle-name"),
            last_name: element.child_text("last-name"),
            nickname: element.child_text("nickname"),
        })
        .filter(|person| !person.is_empty())
        .collect()
}

/// The machine readable `value` of a date element, or its text
fn parse_date(info: &XmlElement) -> Option<String> {
    let date = info.find_child("date")?;
    date.get_attr("value")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| Some(date.text().normalize_whitespace()))
        .filter(|value| !value.is_empty())
}

/// Id bookkeeping for one document
///
/// Every id found in the source is registered up front under a sanitized,
/// unique form so that links can be resolved before their targets are walked.
#[derive(Default)]
struct IdRegistry {
    /// Source id to sanitized id
    map: HashMap<String, String>,

    /// Source ids already attached to an element
    claimed: HashSet<String>,

    /// Sanitized ids in use, including generated ones
    used: HashSet<String>,

    counter: usize,
}

impl IdRegistry {
    fn register(&mut self, raw: &str) {
        if self.map.contains_key(raw) {
            return;
        }

        let mut base = sanitize_id(raw);
        if base.starts_with(REFERENCE_ID_PREFIX) {
            base.insert_str(0, "id-");
        }

        let mut id = base.clone();
        let mut suffix = 1;
        while self.used.contains(&id) {
            suffix += 1;
            id = format!("{}-{}", base, suffix);
        }

        self.used.insert(id.clone());
        self.map.insert(raw.to_string(), id);
    }

    fn resolve(&self, raw: &str) -> Option<&String> {
        self.map.get(raw)
    }

    /// Attach a source id to an element, only the first occurrence gets it
    fn claim(&mut self, raw: &str) -> Option<String> {
        if self.claimed.insert(raw.to_string()) {
            self.map.get(raw).cloned()
        } else {
            None
        }
    }

    /// Generate a fresh id with the given prefix
    fn generate(&mut self, prefix: &str) -> String {
        loop {
            self.counter += 1;
            let id = format!("{}-{}", prefix, self.counter);
            if self.used.insert(id.clone()) {
                return id;
            }
        }
    }
}

/// Walks body elements and builds model nodes
struct BodyWalker<'d> {
    ids: IdRegistry,

    /// Source ids of footnote bodies
    footnote_ids: HashSet<String>,

    /// Binary ids referenced by images
    images: HashSet<String>,

    diagnostics: &'d mut Diagnostics,
}

impl<'d> BodyWalker<'d> {
    fn new(diagnostics: &'d mut Diagnostics) -> Self {
        Self {
            ids: IdRegistry::default(),
            footnote_ids: HashSet::new(),
            images: HashSet::new(),
            diagnostics,
        }
    }

    fn register_ids(&mut self, element: &XmlElement) {
        if let Some(id) = element.get_attr("id") {
            self.ids.register(&id);
        }

        for child in element.elements() {
            self.register_ids(child);
        }
    }

    fn register_footnote_ids(&mut self, body: &XmlElement) {
        for section in body.find_children_by_name("section") {
            match section.get_attr("id") {
                Some(id) => {
                    self.footnote_ids.insert(id);
                }
                None => self.register_footnote_ids(section),
            }
        }
    }

    fn claim_id(&mut self, element: &XmlElement) -> Option<String> {
        let raw = element.get_attr("id")?;
        let id = self.ids.claim(&raw);
        if id.is_none() {
            self.diagnostics.warn(
                WarningKind::Structure,
                format!("duplicate id \"{}\" on <{}> is dropped", raw, element.name),
            );
        }

        id
    }

    /// Collect footnotes from a note body
    ///
    /// Sections with an id are footnotes; sections without one are descended into.
    fn collect_footnotes(&mut self, body: &XmlElement) -> Vec<Footnote> {
        let kind = match body.get_attr("name").map(|name| name.trim().to_lowercase()) {
            Some(name) if name == "comments" => FootnoteKind::Comment,
            _ => FootnoteKind::Note,
        };

        let mut footnotes = Vec::new();
        self.collect_footnotes_into(body, kind, &mut footnotes);
        footnotes
    }

    fn collect_footnotes_into(
        &mut self,
        parent: &XmlElement,
        kind: FootnoteKind,
        footnotes: &mut Vec<Footnote>,
    ) {
        for section in parent.find_children_by_name("section") {
            if section.get_attr("id").is_none() {
                self.collect_footnotes_into(section, kind, footnotes);
                continue;
            }

            let Some(id) = self.claim_id(section) else {
                continue;
            };

            let mut title = None;
            let mut nodes = Vec::new();
            for child in section.elements() {
                match child.name.as_str() {
                    "title" if title.is_none() && nodes.is_empty() => {
                        title = Some(self.parse_title(child));
                    }
                    "section" => nodes.extend(self.flatten_section(child, 2)),
                    _ => nodes.extend(self.parse_block(child)),
                }
            }

            footnotes.push(Footnote {
                id,
                title,
                kind,
                nodes,
            });
        }
    }

    /// Walk a main body
    ///
    /// Returns the body head (title, epigraphs and loose content before the
    /// first section) and the top-level sections.
    fn walk_body(&mut self, body: &XmlElement) -> (Vec<Node>, Vec<Section>) {
        let mut head = Vec::new();
        let mut sections: Vec<Section> = Vec::new();
        let mut loose: Option<usize> = None;

        for child in body.elements() {
            match child.name.as_str() {
                "section" => {
                    sections.push(self.parse_section(child, 1));
                    loose = None;
                }
                "title" if sections.is_empty() => {
                    let title = self.parse_title(child);
                    if !title.is_empty() {
                        head.push(Node::Heading { level: 1, title });
                    }
                }
                _ => {
                    let Some(node) = self.parse_block(child) else {
                        continue;
                    };

                    if sections.is_empty() {
                        head.push(node);
                        continue;
                    }

                    // Content between sections goes into an untitled section
                    let index = match loose {
                        Some(index) => index,
                        None => {
                            sections.push(Section::new(&self.ids.generate("section")));
                            sections.len() - 1
                        }
                    };
                    sections[index].nodes.push(node);
                    loose = Some(index);
                }
            }
        }

        (head, sections)
    }

    fn parse_section(&mut self, element: &XmlElement, depth: usize) -> Section {
        let anchor = match self.claim_id(element) {
            Some(id) => id,
            None => self.ids.generate("section"),
        };

        let mut section = Section::new(&anchor);
        let mut trailing: Option<usize> = None;

        for child in element.elements() {
            match child.name.as_str() {
                "title"
                    if section.title.is_none()
                        && section.nodes.is_empty()
                        && section.children.is_empty() =>
                {
                    let title = self.parse_title(child);
                    if !title.is_empty() {
                        section.title = Some(title);
                    }
                }

                "section" if depth >= MAX_SECTION_DEPTH => {
                    self.diagnostics.warn(
                        WarningKind::Structure,
                        format!(
                            "sections nested deeper than {} levels are flattened",
                            MAX_SECTION_DEPTH
                        ),
                    );

                    let nodes = self.flatten_section(child, depth + 1);
                    section.nodes.extend(nodes);
                }

                "section" => {
                    section.children.push(self.parse_section(child, depth + 1));
                    trailing = None;
                }

                _ => {
                    let Some(node) = self.parse_block(child) else {
                        continue;
                    };

                    if section.children.is_empty() {
                        section.nodes.push(node);
                        continue;
                    }

                    // Content after subsections keeps its place in an untitled subsection
                    let index = match trailing {
                        Some(index) => index,
                        None => {
                            section
                                .children
                                .push(Section::new(&self.ids.generate("section")));
                            section.children.len() - 1
                        }
                    };
                    section.children[index].nodes.push(node);
                    trailing = Some(index);
                }
            }
        }

        section
    }

    /// Turn a section into plain nodes, its title becoming a heading
    fn flatten_section(&mut self, element: &XmlElement, depth: usize) -> Vec<Node> {
        let mut nodes = Vec::new();

        for child in element.elements() {
            match child.name.as_str() {
                "title" => {
                    let title = self.parse_title(child);
                    if !title.is_empty() {
                        nodes.push(Node::Heading {
                            level: depth.min(6),
                            title,
                        });
                    }
                }
                "section" => nodes.extend(self.flatten_section(child, depth + 1)),
                _ => nodes.extend(self.parse_block(child)),
            }
        }

        nodes
    }

    fn parse_title(&mut self, element: &XmlElement) -> Title {
        let mut lines = Vec::new();
        let has_paragraphs = element
            .elements()
            .any(|child| child.name == "p" || child.name == "empty-line");

        if has_paragraphs {
            for child in element.find_children_by_name("p") {
                let line = self.parse_inlines(child);
                if !Inline::plain_text(&line).trim().is_empty() {
                    lines.push(line);
                }
            }
        } else {
            let line = self.parse_inlines(element);
            if !Inline::plain_text(&line).trim().is_empty() {
                lines.push(line);
            }
        }

        Title { lines }
    }

    /// Parse all child elements as blocks
    fn parse_blocks(&mut self, element: &XmlElement) -> Vec<Node> {
        element
            .elements()
            .filter_map(|child| self.parse_block(child))
            .collect()
    }

    fn parse_block(&mut self, element: &XmlElement) -> Option<Node> {
        let node = match element.name.as_str() {
            "p" | "v" | "text-author" | "date" => Node::Paragraph {
                id: self.claim_id(element),
                inlines: self.parse_inlines(element),
            },

            "subtitle" => Node::Subtitle {
                id: self.claim_id(element),
                inlines: self.parse_inlines(element),
            },

            // A stray title inside content, rendered like a subtitle
            "title" => Node::Subtitle {
                id: self.claim_id(element),
                inlines: self
                    .parse_title(element)
                    .lines
                    .into_iter()
                    .enumerate()
                    .flat_map(|(index, line)| {
                        let separator = (index > 0).then(|| Inline::Text(" ".to_string()));
                        separator.into_iter().chain(line)
                    })
                    .collect(),
            },

            "empty-line" => Node::EmptyLine,

            "image" => self.parse_image(element),

            "table" => Node::Table {
                id: self.claim_id(element),
                rows: element
                    .find_children_by_name("tr")
                    .map(|row| self.parse_table_row(row))
                    .collect(),
            },

            "poem" => Node::Poem(self.parse_poem(element)),

            "stanza" => Node::Poem(Poem {
                stanzas: vec![self.parse_stanza(element)],
                ..Default::default()
            }),

            "cite" => {
                let (nodes, authors) = self.parse_quote(element);
                Node::Cite {
                    id: self.claim_id(element),
                    nodes,
                    authors,
                }
            }

            "epigraph" => {
                let (nodes, authors) = self.parse_quote(element);
                Node::Epigraph {
                    id: self.claim_id(element),
                    nodes,
                    authors,
                }
            }

            "annotation" => Node::Annotation(self.parse_blocks(element)),

            "ol" | "ul" => Node::List {
                ordered: element.name == "ol",
                items: element
                    .find_children_by_name("li")
                    .map(|item| {
                        if item.elements().any(|child| is_block_element(&child.name)) {
                            self.parse_blocks(item)
                        } else {
                            vec![Node::Paragraph {
                                id: None,
                                inlines: self.parse_inlines(item),
                            }]
                        }
                    })
                    .collect(),
            },

            _ => Node::Opaque {
                name: element.tag_name(),
                text: element.text().normalize_whitespace(),
            },
        };

        Some(node)
    }

    fn parse_image(&mut self, element: &XmlElement) -> Node {
        let binary_id = element
            .get_attr_local("href")
            .map(|href| href.trim().trim_start_matches('#').to_string())
            .unwrap_or_default();
        self.images.insert(binary_id.clone());

        Node::Image {
            id: self.claim_id(element),
            binary_id,
            alt: element.get_attr("alt").filter(|alt| !alt.trim().is_empty()),
            title: element.get_attr("title").filter(|title| !title.trim().is_empty()),
        }
    }

    fn parse_table_row(&mut self, row: &XmlElement) -> TableRow {
        let cells = row
            .elements()
            .filter(|cell| cell.name == "th" || cell.name == "td")
            .map(|cell| TableCell {
                header: cell.name == "th",
                inlines: self.parse_inlines(cell),
                colspan: cell.get_attr("colspan"),
                rowspan: cell.get_attr("rowspan"),
                align: cell.get_attr("align"),
            })
            .collect();

        TableRow { cells }
    }

    /// Parse the content of a cite or epigraph, separating its authors
    fn parse_quote(&mut self, element: &XmlElement) -> (Vec<Node>, Vec<Vec<Inline>>) {
        let mut nodes = Vec::new();
        let mut authors = Vec::new();

        for child in element.elements() {
            if child.name == "text-author" {
                authors.push(self.parse_inlines(child));
            } else {
                nodes.extend(self.parse_block(child));
            }
        }

        (nodes, authors)
    }

    fn parse_poem(&mut self, element: &XmlElement) -> Poem {
        let mut poem = Poem {
            id: self.claim_id(element),
            ..Default::default()
        };

        for child in element.elements() {
            match child.name.as_str() {
                "title" => poem.title = Some(self.parse_title(child)),
                "epigraph" => poem.epigraphs.extend(self.parse_block(child)),
                "stanza" => poem.stanzas.push(self.parse_stanza(child)),
                "text-author" => poem.authors.push(self.parse_inlines(child)),
                "date" => {
                    let date = child.text().normalize_whitespace();
                    if !date.is_empty() {
                        poem.date = Some(date);
                    }
                }
                // Verses outside a stanza
                "v" => {
                    let verse = self.parse_inlines(child);
                    match poem.stanzas.last_mut() {
                        Some(stanza) => stanza.verses.push(verse),
                        None => poem.stanzas.push(Stanza {
                            verses: vec![verse],
                            ..Default::default()
                        }),
                    }
                }
                _ => poem.epigraphs.extend(self.parse_block(child)),
            }
        }

        poem
    }

    fn parse_stanza(&mut self, element: &XmlElement) -> Stanza {
        let mut stanza = Stanza::default();

        for child in element.elements() {
            match child.name.as_str() {
                "title" => stanza.title = Some(self.parse_title(child)),
                "subtitle" => stanza.subtitle = Some(self.parse_inlines(child)),
                _ => stanza.verses.push(self.parse_inlines(child)),
            }
        }

        stanza
    }

    fn parse_inlines(&mut self, element: &XmlElement) -> Vec<Inline> {
        let mut inlines = Vec::new();

        for child in &element.children {
            match child {
                XmlNode::Text(text) => inlines.push(Inline::Text(text.clone())),
                XmlNode::Element(child) => inlines.push(self.parse_inline(child)),
            }
        }

        inlines
    }

    fn parse_inline(&mut self, element: &XmlElement) -> Inline {
        match element.name.as_str() {
            "strong" => Inline::Strong(self.parse_inlines(element)),
            "emphasis" => Inline::Emphasis(self.parse_inlines(element)),
            "strikethrough" => Inline::Strikethrough(self.parse_inlines(element)),
            "sup" => Inline::Superscript(self.parse_inlines(element)),
            "sub" => Inline::Subscript(self.parse_inlines(element)),
            "code" => Inline::Code(self.parse_inlines(element)),
            "style" => Inline::Style {
                name: element.get_attr("name").unwrap_or_default(),
                children: self.parse_inlines(element),
            },
            "a" => self.parse_link(element),
            "image" => {
                let binary_id = element
                    .get_attr_local("href")
                    .map(|href| href.trim().trim_start_matches('#').to_string())
                    .unwrap_or_default();
                self.images.insert(binary_id.clone());

                Inline::Image {
                    binary_id,
                    alt: element.get_attr("alt").filter(|alt| !alt.trim().is_empty()),
                }
            }
            _ => Inline::Opaque {
                name: element.tag_name(),
                text: element.text(),
            },
        }
    }

    /// Resolve a link to a footnote reference, an internal or an external link
    fn parse_link(&mut self, element: &XmlElement) -> Inline {
        let children = self.parse_inlines(element);
        let href = element
            .get_attr_local("href")
            .map(|href| href.trim().to_string())
            .unwrap_or_default();

        if let Some(raw) = href.strip_prefix('#') {
            if self.footnote_ids.contains(raw) {
                if let Some(note_id) = self.ids.resolve(raw) {
                    return Inline::NoteRef {
                        note_id: note_id.clone(),
                        children,
                    };
                }
            }

            if let Some(target) = self.ids.resolve(raw) {
                return Inline::InternalLink {
                    target: target.clone(),
                    children,
                };
            }
        } else if !href.is_empty() {
            return Inline::ExternalLink { href, children };
        }

        self.diagnostics.warn(
            WarningKind::ResourceResolution,
            format!("link target \"{}\" does not exist, kept as plain text", href),
        );

        Inline::Unresolved {
            reference: href,
            children,
        }
    }

    /// Decode the binary attachments of the document
    fn parse_binaries(&mut self, root: &XmlElement) -> IndexMap<String, BinaryResource> {
        let mut binaries = IndexMap::new();
        let mut file_names = HashSet::new();

        for binary in root.find_children_by_name("binary") {
            let Some(id) = binary.get_attr("id").map(|id| id.trim().to_string()) else {
                self.diagnostics.warn(
                    WarningKind::ResourceResolution,
                    "a binary without id is skipped",
                );
                continue;
            };

            if binaries.contains_key(&id) {
                self.diagnostics.warn(
                    WarningKind::ResourceResolution,
                    format!("duplicate binary \"{}\" is skipped", id),
                );
                continue;
            }

            let payload = binary
                .text()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>();

            let data = match LENIENT_BASE64.decode(payload.as_bytes()) {
                Ok(data) if !data.is_empty() => data,
                Ok(_) => {
                    self.diagnostics.warn(
                        WarningKind::ResourceResolution,
                        format!("binary \"{}\" is empty and is skipped", id),
                    );
                    continue;
                }
                Err(err) => {
                    self.diagnostics.warn(
                        WarningKind::ResourceResolution,
                        format!("binary \"{}\" is not valid base64 ({}) and is skipped", id, err),
                    );
                    continue;
                }
            };

            let declared = binary.get_attr("content-type");
            let Some(media_type) = detect_media_type(&data, declared.as_deref()) else {
                self.diagnostics.warn(
                    WarningKind::ResourceResolution,
                    format!("binary \"{}\" has an unknown media type and is skipped", id),
                );
                continue;
            };

            let file_name = unique_file_name(&id, &media_type, &mut file_names);
            binaries.insert(
                id.clone(),
                BinaryResource {
                    id,
                    media_type,
                    data,
                    file_name,
                },
            );
        }

        binaries
    }
}

fn is_block_element(name: &str) -> bool {
    matches!(
        name,
        "p" | "poem" | "cite" | "epigraph" | "table" | "image" | "subtitle" | "empty-line" | "ol" | "ul"
    )
}

/// Build a collision free file name from a binary id and its media type
fn unique_file_name(id: &str, media_type: &str, used: &mut HashSet<String>) -> String {
    let extension = extension_for_media_type(media_type);

    let stem = match id.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => id,
    };
    let mut stem = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>();
    if stem.is_empty() {
        stem = "image".to_string();
    }

    let mut file_name = format!("{}.{}", stem, extension);
    let mut counter = 1;
    while !used.insert(file_name.clone()) {
        counter += 1;
        file_name = format!("{}-{}.{}", stem, counter, extension);
    }

    file_name
}

#[cfg(test)]
mod tests {
    use crate::{
        config::ConversionConfig,
        error::ConvertError,
        model::{
            Document, FootnoteKind, InfoField, InfoGroup, InfoGroupKind, Inline,
            MAX_SECTION_DEPTH, Node, Section,
        },
        parser::Fb2Parser,
        report::{Diagnostics, WarningKind},
    };

    const PNG_BASE64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    fn parse(source: &str) -> (Result<Document, ConvertError>, Diagnostics) {
        let config = ConversionConfig::default();
        let mut diagnostics = Diagnostics::new();
        let result = Fb2Parser::new(&config).parse(source.as_bytes(), &mut diagnostics);
        (result, diagnostics)
    }

    fn book(description: &str, bodies: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<FictionBook xmlns="http://www.gribuser.ru/xml/fictionbook/2.0" xmlns:l="http://www.w3.org/1999/xlink">
<description>{}</description>
{}
</FictionBook>"#,
            description, bodies
        )
    }

    fn sample() -> String {
        book(
            r#"<title-info>
                 <genre>sf</genre>
                 <author><first-name>Jane</first-name><last-name>Doe</last-name></author>
                 <book-title>Sample</book-title>
                 <annotation><p>A short <emphasis>sample</emphasis>.</p></annotation>
                 <lang>en</lang>
                 <sequence name="Samples" number="2"/>
               </title-info>
               <document-info><id>sample-id-1</id></document-info>
               <publish-info><publisher>ACME</publisher><isbn>978-3-16-148410-0</isbn></publish-info>"#,
            r##"<body>
                 <title><p>Sample</p></title>
                 <section id="ch1">
                   <title><p>Chapter 1</p></title>
                   <p>First paragraph<a l:href="#n1" type="note">[1]</a>.</p>
                   <p>Second <a l:href="#ch1">paragraph</a>.</p>
                 </section>
               </body>
               <body name="notes">
                 <section id="n1"><title><p>1</p></title><p>The note.</p></section>
               </body>"##,
        )
    }

    /// Test parsing of a small well-formed book
    #[test]
    fn test_parse_sample() {
        let (result, diagnostics) = parse(&sample());
        let document = result.unwrap();

        assert!(diagnostics.is_empty());
        assert_eq!(document.metadata.title, "Sample");
        assert_eq!(document.metadata.language, "en");
        assert_eq!(document.metadata.identifier, "sample-id-1");
        assert_eq!(document.metadata.authors[0].display_name(), "Jane Doe");
        assert_eq!(document.metadata.genres, vec!["sf"]);
        assert_eq!(document.metadata.description.as_deref(), Some("A short sample."));
        assert_eq!(document.metadata.publisher.as_deref(), Some("ACME"));
        let sequence = document.metadata.sequence.as_ref().unwrap();
        assert_eq!(sequence.name, "Samples");
        assert_eq!(sequence.number.as_deref(), Some("2"));

        assert_eq!(document.preamble.len(), 1);
        assert_eq!(document.sections.len(), 1);

        let chapter = &document.sections[0];
        assert_eq!(chapter.anchor, "ch1");
        assert_eq!(chapter.title.as_ref().unwrap().plain_text(), "Chapter 1");
        assert_eq!(chapter.nodes.len(), 2);

        let Node::Paragraph { inlines, .. } = &chapter.nodes[0] else {
            panic!("expected a paragraph");
        };
        assert!(inlines.iter().any(|inline| matches!(
            inline,
            Inline::NoteRef { note_id, .. } if note_id == "n1"
        )));

        let Node::Paragraph { inlines, .. } = &chapter.nodes[1] else {
            panic!("expected a paragraph");
        };
        assert!(inlines.iter().any(|inline| matches!(
            inline,
            Inline::InternalLink { target, .. } if target == "ch1"
        )));

        assert_eq!(document.footnotes.len(), 1);
        assert_eq!(document.footnotes[0].id, "n1");
        assert_eq!(document.footnotes[0].kind, FootnoteKind::Note);
    }

    /// Test the metadata fallbacks of a minimal document
    #[test]
    fn test_metadata_fallbacks() {
        let source = book("", "<body><section><p>Text</p></section></body>");
        let (result, diagnostics) = parse(&source);
        let document = result.unwrap();

        assert!(diagnostics.is_empty());
        assert_eq!(document.metadata.title, "Untitled");
        assert_eq!(document.metadata.language, "en");
        assert!(document.metadata.authors.is_empty());
        assert!(document.metadata.identifier.starts_with("urn:uuid:"));

        // derived identifiers are stable
        let (again, _) = parse(&source);
        assert_eq!(again.unwrap().metadata.identifier, document.metadata.identifier);
    }

    #[test]
    fn test_uuid_identifier_and_language_normalization() {
        let source = book(
            "<title-info><lang>RU</lang></title-info>\
             <document-info><id>0F5B3D0E-1C39-4B8B-9D5C-2B0A6A6A1F11</id></document-info>",
            "<body><section><p>Text</p></section></body>",
        );
        let document = parse(&source).0.unwrap();

        assert_eq!(document.metadata.language, "ru");
        assert_eq!(
            document.metadata.identifier,
            "urn:uuid:0f5b3d0e-1c39-4b8b-9d5c-2b0a6a6a1f11"
        );
    }

    /// Test rejection of documents that are not FictionBook
    #[test]
    fn test_reject_non_fictionbook() {
        let (result, _) = parse("<html><body/></html>");
        assert!(matches!(result, Err(ConvertError::MalformedInput { .. })));

        let (result, _) = parse("<FictionBook><body><p>unclosed</body></FictionBook>");
        assert!(matches!(result, Err(ConvertError::MalformedInput { .. })));

        let (result, _) = parse("");
        assert!(matches!(result, Err(ConvertError::MalformedInput { .. })));
    }

    /// Test that an unresolvable link degrades to plain text with a warning
    #[test]
    fn test_unresolved_link() {
        let source = book(
            "",
            r##"<body><section><p>See <a l:href="#missing">here</a>.</p></section></body>"##,
        );
        let (result, diagnostics) = parse(&source);
        let document = result.unwrap();

        assert_eq!(diagnostics.warnings().len(), 1);
        assert_eq!(
            diagnostics.warnings()[0].kind,
            WarningKind::ResourceResolution
        );

        let Node::Paragraph { inlines, .. } = &document.sections[0].nodes[0] else {
            panic!("expected a paragraph");
        };
        assert!(matches!(&inlines[1], Inline::Unresolved { reference, .. } if reference == "#missing"));
    }

    /// Test flattening of sections nested beyond the depth limit
    #[test]
    fn test_deep_sections_are_flattened() {
        let depth = MAX_SECTION_DEPTH + 3;
        let mut body = String::new();
        for level in 0..depth {
            body.push_str(&format!("<section><title><p>Level {}</p></title><p>x</p>", level));
        }
        for _ in 0..depth {
            body.push_str("</section>");
        }

        let source = book("", &format!("<body>{}</body>", body));
        let (result, diagnostics) = parse(&source);
        let document = result.unwrap();

        assert_eq!(document.sections[0].depth(), MAX_SECTION_DEPTH);
        assert!(
            diagnostics
                .warnings()
                .iter()
                .any(|warning| warning.kind == WarningKind::Structure)
        );

        fn deepest(section: &Section) -> &Section {
            match section.children.first() {
                Some(child) => deepest(child),
                None => section,
            }
        }
        let leaf = deepest(&document.sections[0]);
        assert!(
            leaf.nodes
                .iter()
                .any(|node| matches!(node, Node::Heading { title, .. } if title.plain_text() == format!("Level {}", depth - 1)))
        );
    }

    /// Test that content following subsections keeps its position
    #[test]
    fn test_content_after_subsections() {
        let source = book(
            "",
            "<body><section><title><p>Part</p></title><p>lead</p>\
             <section><title><p>Chapter</p></title><p>body</p></section>\
             <p>tail</p></section></body>",
        );
        let document = parse(&source).0.unwrap();
        let part = &document.sections[0];

        assert_eq!(part.nodes.len(), 1);
        assert_eq!(part.children.len(), 2);
        assert!(part.children[1].title.is_none());
        assert_eq!(part.children[1].nodes[0].plain_text(), "tail");
    }

    /// Test binary decoding, file naming and reference filtering
    #[test]
    fn test_binaries() {
        let source = book(
            r##"<title-info><coverpage><image l:href="#cover.png"/></coverpage></title-info>"##,
            &format!(
                r##"<body><section><image l:href="#pic"/></section></body>
                <binary id="cover.png" content-type="image/png">{png}</binary>
                <binary id="pic" content-type="application/octet-stream">
                  {png}
                </binary>
                <binary id="unused" content-type="image/png">{png}</binary>
                <binary id="broken" content-type="image/png">***</binary>"##,
                png = PNG_BASE64
            ),
        );
        let (result, diagnostics) = parse(&source);
        let document = result.unwrap();

        assert_eq!(document.metadata.cover.as_deref(), Some("cover.png"));
        assert_eq!(
            document.binaries.keys().collect::<Vec<_>>(),
            vec!["cover.png", "pic"]
        );

        let cover = document.binary("cover.png").unwrap();
        assert_eq!(cover.media_type, "image/png");
        assert_eq!(cover.file_name, "cover.png");
        assert_eq!(&cover.data[1..4], b"PNG");

        let pic = document.binary("pic").unwrap();
        assert_eq!(pic.media_type, "image/png");
        assert_eq!(pic.file_name, "pic.png");

        assert_eq!(diagnostics.warnings().len(), 1);
        assert!(diagnostics.warnings()[0].message.contains("broken"));
    }

    #[test]
    fn test_missing_cover_is_ignored() {
        let source = book(
            r##"<title-info><coverpage><image l:href="#nope"/></coverpage></title-info>"##,
            "<body><section><p>Text</p></section></body>",
        );
        let (result, diagnostics) = parse(&source);

        assert!(result.unwrap().metadata.cover.is_none());
        assert_eq!(diagnostics.warnings().len(), 1);
    }

    /// Test that unknown elements are preserved as opaque nodes
    #[test]
    fn test_unknown_element_is_opaque() {
        let source = book(
            "",
            "<body><section><p>a</p><video>clip text</video></section></body>",
        );
        let document = parse(&source).0.unwrap();

        assert_eq!(
            document.sections[0].nodes[1],
            Node::Opaque {
                name: "video".to_string(),
                text: "clip text".to_string()
            }
        );
    }

    /// Test additional bodies and comment bodies
    #[test]
    fn test_multiple_bodies() {
        let source = book(
            "",
            r##"<body><section><p>main</p></section></body>
            <body><title><p>Appendix</p></title><section><p>extra</p></section></body>
            <body name="comments"><section><section id="c1"><p>comment</p></section></section></body>"##,
        );
        let document = parse(&source).0.unwrap();

        assert_eq!(document.sections.len(), 2);
        assert_eq!(
            document.sections[1].title.as_ref().unwrap().plain_text(),
            "Appendix"
        );
        assert_eq!(document.sections[1].children.len(), 1);

        assert_eq!(document.footnotes.len(), 1);
        assert_eq!(document.footnotes[0].kind, FootnoteKind::Comment);
        assert_eq!(document.footnotes[0].id, "c1");
    }

    /// Test windows-1251 encoded input
    #[test]
    fn test_parse_windows_1251() {
        let mut source = b"<?xml version=\"1.0\" encoding=\"windows-1251\"?>\
            <FictionBook><description><title-info><book-title>"
            .to_vec();
        source.extend_from_slice(&[0xCA, 0xED, 0xE8, 0xE3, 0xE0]);
        source.extend_from_slice(
            b"</book-title></title-info></description><body><section><p>x</p></section></body></FictionBook>",
        );

        let config = ConversionConfig::default();
        let mut diagnostics = Diagnostics::new();
        let document = Fb2Parser::new(&config)
            .parse(&source, &mut diagnostics)
            .unwrap();

        assert_eq!(document.metadata.title, "Книга");
    }

    /// Test sanitizing and de-duplication of ids
    #[test]
    fn test_duplicate_and_invalid_ids() {
        let source = book(
            "",
            r##"<body><section id="1 a"><p id="dup">a</p><p id="dup">b</p></section></body>"##,
        );
        let (result, diagnostics) = parse(&source);
        let document = result.unwrap();
        let section = &document.sections[0];

        assert_eq!(section.anchor, "id-1_a");
        assert!(matches!(&section.nodes[0], Node::Paragraph { id: Some(id), .. } if id == "dup"));
        assert!(matches!(&section.nodes[1], Node::Paragraph { id: None, .. }));
        assert_eq!(diagnostics.warnings().len(), 1);
    }

    /// Test the publication details collected for the copyright page
    #[test]
    fn test_publication_info() {
        let source = book(
            r#"<title-info><book-title>Kobzar</book-title><lang>uk</lang></title-info>
               <src-title-info>
                 <author><first-name>Taras</first-name><last-name>Shevchenko</last-name></author>
                 <book-title>Кобзар</book-title>
                 <date value="1840-01-01">1840</date>
                 <lang>uk</lang>
               </src-title-info>
               <document-info>
                 <author><nickname>scanner</nickname></author>
                 <program-used>FB Editor</program-used>
                 <date value="2004-05-17"></date>
                 <id>doc-1</id>
                 <version>1.1</version>
               </document-info>
               <publish-info><book-name>Kobzar</book-name><city>Kyiv</city><year>2004</year><isbn> </isbn></publish-info>"#,
            "<body><section><p>a</p></section></body>",
        );
        let (result, _) = parse(&source);
        let info = result.unwrap().metadata.publication_info;

        assert_eq!(
            info,
            vec![
                InfoGroup {
                    kind: InfoGroupKind::Publication,
                    entries: vec![
                        (InfoField::Title, "Kobzar".to_string()),
                        (InfoField::City, "Kyiv".to_string()),
                        (InfoField::Year, "2004".to_string()),
                    ],
                },
                InfoGroup {
                    kind: InfoGroupKind::SourcePublication,
                    entries: vec![
                        (InfoField::Title, "Кобзар".to_string()),
                        (InfoField::Author, "Taras Shevchenko".to_string()),
                        (InfoField::Language, "uk".to_string()),
                        (InfoField::Date, "1840".to_string()),
                    ],
                },
                InfoGroup {
                    kind: InfoGroupKind::Document,
                    entries: vec![
                        (InfoField::Author, "scanner".to_string()),
                        (InfoField::ProgramUsed, "FB Editor".to_string()),
                        (InfoField::Date, "2004-05-17".to_string()),
                        (InfoField::Identifier, "doc-1".to_string()),
                        (InfoField::Version, "1.1".to_string()),
                    ],
                },
            ]
        );

        let (result, _) = parse(&book("", "<body><section><p>a</p></section></body>"));
        assert!(result.unwrap().metadata.publication_info.is_empty());
    }

    /// Test that source ids cannot take the footnote reference id space
    #[test]
    fn test_reference_prefix_is_reserved() {
        let source = book(
            "",
            r##"<body><section id="ref-n1-1"><p>a<a l:href="#ref-n1-1">self</a></p></section></body>"##,
        );
        let (result, _) = parse(&source);
        let document = result.unwrap();
        let section = &document.sections[0];

        assert_eq!(section.anchor, "id-ref-n1-1");
        assert!(matches!(
            &section.nodes[0],
            Node::Paragraph { inlines, .. }
                if matches!(&inlines[1], Inline::InternalLink { target, .. } if target == "id-ref-n1-1")
        ));
    }
}
