//! Document model
//!
//! The in-memory representation of a parsed FB2 book. The parser builds a
//! [`Document`] once; the renderer and the package assembler only read it.
//!
//! Trees are owned by value: a [`Section`] owns its children, a [`Node`] owns
//! its inline runs. Cross references (footnote references, internal links,
//! images) are plain ids resolved by lookup at render time.

use std::path::PathBuf;

use indexmap::IndexMap;

use crate::utils::NormalizeWhitespace;

/// Maximum nesting depth of sections
///
/// Deeper sections are flattened into their ancestor at this depth.
pub const MAX_SECTION_DEPTH: usize = 16;

/// Prefix of generated footnote reference ids, never given to source ids
pub const REFERENCE_ID_PREFIX: &str = "ref-";

/// A parsed book
#[derive(Debug, Clone)]
pub struct Document {
    pub metadata: Metadata,

    /// Body title and epigraphs, rendered ahead of the first section
    pub preamble: Vec<Node>,

    /// Top-level sections in reading order
    pub sections: Vec<Section>,

    /// Footnote and comment bodies in document order
    pub footnotes: Vec<Footnote>,

    /// Referenced binary resources, keyed by FB2 id
    pub binaries: IndexMap<String, BinaryResource>,

    pub stylesheet: StylesheetRef,
}

impl Document {
    /// Returns the footnote with the specified id
    pub fn footnote(&self, id: &str) -> Option<&Footnote> {
        self.footnotes.iter().find(|note| note.id == id)
    }

    /// Returns the binary resource with the specified id
    pub fn binary(&self, id: &str) -> Option<&BinaryResource> {
        self.binaries.get(id)
    }

    /// Whether any section of the book has a title
    pub fn has_titled_sections(&self) -> bool {
        fn titled(section: &Section) -> bool {
            section.title.is_some() || section.children.iter().any(titled)
        }

        self.sections.iter().any(titled)
    }
}

/// Stylesheet used for the rendered book
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StylesheetRef {
    /// The built-in stylesheet only
    #[default]
    Default,

    /// A user stylesheet, combined with the built-in one per the configured policy
    Custom(PathBuf),
}

/// A person credited in the book, author or translator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Person {
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub nickname: Option<String>,
}

impl Person {
    /// Full name in reading order, falling back to the nickname
    pub fn display_name(&self) -> String {
        let name = [&self.first_name, &self.middle_name, &self.last_name]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");

        if name.is_empty() {
            self.nickname.clone().unwrap_or_default()
        } else {
            name
        }
    }

    /// Name in catalogue order ("Last, First Middle")
    pub fn file_as(&self) -> String {
        let given = [&self.first_name, &self.middle_name]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");

        match (&self.last_name, given.is_empty()) {
            (Some(last), false) => format!("{}, {}", last, given),
            (Some(last), true) => last.clone(),
            (None, _) => self.display_name(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.display_name().is_empty()
    }
}

/// Series membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub name: String,
    pub number: Option<String>,
}

/// Book level metadata
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub title: String,
    pub authors: Vec<Person>,
    pub translators: Vec<Person>,

    /// A valid BCP 47 style language tag
    pub language: String,

    /// Unique identifier of the publication
    pub identifier: String,

    /// Plain text rendering of the annotation, used for `dc:description`
    pub description: Option<String>,

    /// Structured annotation, used for the annotation page
    pub annotation: Vec<Node>,

    /// Binary id of the cover image
    pub cover: Option<String>,

    pub genres: Vec<String>,
    pub keywords: Vec<String>,
    pub sequence: Option<Sequence>,
    pub date: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<String>,
    pub isbn: Option<String>,
    pub source_language: Option<String>,

    /// Publication details for the copyright page, empty groups left out
    pub publication_info: Vec<InfoGroup>,
}

/// Origin of a group of publication details
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoGroupKind {
    /// The printed edition, from `publish-info`
    Publication,

    /// The original work of a translation, from `src-title-info`
    SourcePublication,

    /// The FB2 file itself, from `document-info`
    Document,
}

/// Field of a publication detail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoField {
    Title,
    Author,
    Publisher,
    City,
    Year,
    Isbn,
    Language,
    Date,
    ProgramUsed,
    Identifier,
    Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoGroup {
    pub kind: InfoGroupKind,
    pub entries: Vec<(InfoField, String)>,
}

/// A section of the book
#[derive(Debug, Clone, Default)]
pub struct Section {
    /// Unique XHTML id of the section
    pub anchor: String,
    pub title: Option<Title>,
    pub nodes: Vec<Node>,
    pub children: Vec<Section>,
}

impl Section {
    pub fn new(anchor: &str) -> Self {
        Self {
            anchor: anchor.to_string(),
            ..Default::default()
        }
    }

    /// Nesting depth of the subtree, 1 for a leaf section
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(Section::depth).max().unwrap_or(0)
    }

    /// Number of text characters in the section and all subsections
    pub fn text_len(&self) -> usize {
        self.own_text_len() + self.children.iter().map(Section::text_len).sum::<usize>()
    }

    /// Number of text characters in the title and direct content only
    pub fn own_text_len(&self) -> usize {
        let title = self
            .title
            .as_ref()
            .map(|title| title.plain_text().chars().count())
            .unwrap_or(0);

        title + self.nodes.iter().map(Node::text_len).sum::<usize>()
    }
}

/// A multi-line title
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Title {
    pub lines: Vec<Vec<Inline>>,
}

impl Title {
    /// The title as a single line of normalized text
    pub fn plain_text(&self) -> String {
        self.lines
            .iter()
            .map(|line| Inline::plain_text(line))
            .collect::<Vec<_>>()
            .join(" ")
            .normalize_whitespace()
    }

    /// The title as a table of contents label, footnote references left out
    pub fn toc_text(&self) -> String {
        self.lines
            .iter()
            .map(|line| {
                let mut label = String::new();
                for inline in line {
                    inline.push_text(&mut label, false);
                }
                label
            })
            .collect::<Vec<_>>()
            .join(" ")
            .normalize_whitespace()
    }

    pub fn is_empty(&self) -> bool {
        self.plain_text().is_empty()
    }
}

/// Block level content
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Paragraph {
        id: Option<String>,
        inlines: Vec<Inline>,
    },

    Subtitle {
        id: Option<String>,
        inlines: Vec<Inline>,
    },

    EmptyLine,

    /// A title outside the section tree: a body title or the title of a
    /// section that was flattened into its ancestor
    Heading { level: usize, title: Title },

    Image {
        id: Option<String>,
        binary_id: String,
        alt: Option<String>,
        title: Option<String>,
    },

    Table {
        id: Option<String>,
        rows: Vec<TableRow>,
    },

    List {
        ordered: bool,
        items: Vec<Vec<Node>>,
    },

    Epigraph {
        id: Option<String>,
        nodes: Vec<Node>,
        authors: Vec<Vec<Inline>>,
    },

    Cite {
        id: Option<String>,
        nodes: Vec<Node>,
        authors: Vec<Vec<Inline>>,
    },

    Poem(Poem),

    Annotation(Vec<Node>),

    /// An element without a dedicated variant, with its text content
    Opaque { name: String, text: String },
}

impl Node {
    /// Number of text characters carried by the node
    pub fn text_len(&self) -> usize {
        fn inlines_len(inlines: &[Inline]) -> usize {
            Inline::plain_text(inlines).chars().count()
        }

        match self {
            Node::Paragraph { inlines, .. } | Node::Subtitle { inlines, .. } => {
                inlines_len(inlines)
            }
            Node::EmptyLine | Node::Image { .. } => 0,
            Node::Heading { title, .. } => title.plain_text().chars().count(),
            Node::Table { rows, .. } => rows
                .iter()
                .flat_map(|row| row.cells.iter())
                .map(|cell| inlines_len(&cell.inlines))
                .sum(),
            Node::List { items, .. } => items.iter().flatten().map(Node::text_len).sum(),
            Node::Epigraph { nodes, authors, .. } | Node::Cite { nodes, authors, .. } => {
                nodes.iter().map(Node::text_len).sum::<usize>()
                    + authors.iter().map(|line| inlines_len(line)).sum::<usize>()
            }
            Node::Poem(poem) => poem
                .stanzas
                .iter()
                .flat_map(|stanza| stanza.verses.iter())
                .map(|verse| inlines_len(verse))
                .sum(),
            Node::Annotation(nodes) => nodes.iter().map(Node::text_len).sum(),
            Node::Opaque { text, .. } => text.chars().count(),
        }
    }

    /// Plain text of the node, used for descriptions
    pub fn plain_text(&self) -> String {
        match self {
            Node::Paragraph { inlines, .. } | Node::Subtitle { inlines, .. } => {
                Inline::plain_text(inlines)
            }
            Node::Heading { title, .. } => title.plain_text(),
            Node::Epigraph { nodes, .. } | Node::Cite { nodes, .. } | Node::Annotation(nodes) => {
                nodes
                    .iter()
                    .map(Node::plain_text)
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Node::Opaque { text, .. } => text.clone(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Poem {
    pub id: Option<String>,
    pub title: Option<Title>,
    pub epigraphs: Vec<Node>,
    pub stanzas: Vec<Stanza>,
    pub authors: Vec<Vec<Inline>>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stanza {
    pub title: Option<Title>,
    pub subtitle: Option<Vec<Inline>>,
    pub verses: Vec<Vec<Inline>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRow {
    pub cells: Vec<TableCell>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableCell {
    /// `th` rather than `td`
    pub header: bool,
    pub inlines: Vec<Inline>,
    pub colspan: Option<String>,
    pub rowspan: Option<String>,
    pub align: Option<String>,
}

/// Inline content
#[derive(Debug, Clone, PartialEq)]
pub enum Inline {
    Text(String),
    Strong(Vec<Inline>),
    Emphasis(Vec<Inline>),
    Strikethrough(Vec<Inline>),
    Superscript(Vec<Inline>),
    Subscript(Vec<Inline>),
    Code(Vec<Inline>),

    /// Named character style
    Style {
        name: String,
        children: Vec<Inline>,
    },

    /// Reference to a footnote by id
    NoteRef {
        note_id: String,
        children: Vec<Inline>,
    },

    /// Link to an element of the main content by id
    InternalLink {
        target: String,
        children: Vec<Inline>,
    },

    ExternalLink {
        href: String,
        children: Vec<Inline>,
    },

    Image {
        binary_id: String,
        alt: Option<String>,
    },

    /// A link whose target could not be resolved, kept as plain text
    Unresolved {
        reference: String,
        children: Vec<Inline>,
    },

    /// An element without a dedicated variant, with its text content
    Opaque {
        name: String,
        text: String,
    },
}

impl Inline {
    /// Concatenated text of a run of inlines
    pub fn plain_text(inlines: &[Inline]) -> String {
        let mut result = String::new();
        for inline in inlines {
            inline.push_text(&mut result, true);
        }

        result
    }

    fn push_text(&self, buf: &mut String, with_notes: bool) {
        match self {
            Inline::NoteRef { .. } if !with_notes => {}
            Inline::Text(text) | Inline::Opaque { text, .. } => buf.push_str(text),
            Inline::Strong(children)
            | Inline::Emphasis(children)
            | Inline::Strikethrough(children)
            | Inline::Superscript(children)
            | Inline::Subscript(children)
            | Inline::Code(children)
            | Inline::Style { children, .. }
            | Inline::NoteRef { children, .. }
            | Inline::InternalLink { children, .. }
            | Inline::ExternalLink { children, .. }
            | Inline::Unresolved { children, .. } => {
                for child in children {
                    child.push_text(buf, with_notes);
                }
            }
            Inline::Image { .. } => {}
        }
    }
}

/// Whether a note body holds footnotes or comments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FootnoteKind {
    Note,
    Comment,
}

/// A footnote or comment body
#[derive(Debug, Clone)]
pub struct Footnote {
    pub id: String,
    pub title: Option<Title>,
    pub kind: FootnoteKind,
    pub nodes: Vec<Node>,
}

impl Footnote {
    /// Label shown at reference sites and in front of the body
    pub fn label(&self, ordinal: usize) -> String {
        match &self.title {
            Some(title) if !title.is_empty() => title.plain_text(),
            _ => ordinal.to_string(),
        }
    }
}

/// A decoded binary attachment
#[derive(Debug, Clone)]
pub struct BinaryResource {
    pub id: String,
    pub media_type: String,
    pub data: Vec<u8>,

    /// Unique file name inside the package image folder
    pub file_name: String,
}
