use std::collections::HashMap;

use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE};
use infer::Infer;
use quick_xml::{Reader, events::Event};
use sha1::{Digest, Sha1};

use crate::{
    error::ConvertError,
    model::{InfoField, InfoGroupKind},
};

/// Maximum element nesting accepted by [`XmlReader`]
pub const MAX_XML_DEPTH: usize = 512;

/// Provides functionality to decode byte data into strings
///
/// The encoding is detected from the byte order mark first, then from the
/// `encoding` attribute of the XML declaration. Documents without either are
/// read as UTF-8. Decoding never substitutes replacement characters: a byte
/// sequence that is invalid for the detected encoding is an error.
///
/// ## Notes
/// - A BOM that contradicts the declared encoding is reported as an
///   `EncodingError`. UTF-16 declarations are compatible with either byte order.
pub trait DecodeBytes {
    fn decode(&self) -> Result<String, ConvertError>;
}

impl DecodeBytes for [u8] {
    fn decode(&self) -> Result<String, ConvertError> {
        if self.iter().all(u8::is_ascii_whitespace) {
            return Err(ConvertError::MalformedInput {
                reason: "the input is empty".to_string(),
            });
        }

        // Check BOM (UTF-8, UTF-16 LE, UTF-16 BE)
        if let Some((encoding, bom_len)) = Encoding::for_bom(self) {
            let text = decode_strict(encoding, &self[bom_len..], encoding.name())?;

            if let Some(label) = sniff_declared_encoding(text.as_bytes()) {
                match Encoding::for_label(label.as_bytes()) {
                    Some(declared) if is_compatible(declared, encoding) => {}
                    _ => {
                        return Err(ConvertError::EncodingError {
                            declared: label,
                            reason: format!("the byte order mark indicates {}", encoding.name()),
                        });
                    }
                }
            }

            return Ok(text);
        }

        // UTF-16 without BOM, recognizable by the zero byte next to '<'
        match self {
            [b'<', 0, b'?', 0, ..] => return decode_strict(UTF_16LE, self, UTF_16LE.name()),
            [0, b'<', 0, b'?', ..] => return decode_strict(UTF_16BE, self, UTF_16BE.name()),
            _ => {}
        }

        match sniff_declared_encoding(self) {
            Some(label) => {
                let encoding = match Encoding::for_label(label.as_bytes()) {
                    Some(encoding) => encoding,
                    None => {
                        return Err(ConvertError::EncodingError {
                            declared: label,
                            reason: "unknown encoding".to_string(),
                        });
                    }
                };

                // A declaration readable as ASCII cannot be UTF-16 encoded
                if encoding == UTF_16LE || encoding == UTF_16BE {
                    return Err(ConvertError::EncodingError {
                        declared: label,
                        reason: "the declaration itself is not UTF-16 encoded".to_string(),
                    });
                }

                decode_strict(encoding, self, &label)
            }

            None => decode_strict(UTF_8, self, "UTF-8 (default)"),
        }
    }
}

impl DecodeBytes for Vec<u8> {
    fn decode(&self) -> Result<String, ConvertError> {
        self.as_slice().decode()
    }
}

fn decode_strict(
    encoding: &'static Encoding,
    bytes: &[u8],
    declared: &str,
) -> Result<String, ConvertError> {
    match encoding.decode_without_bom_handling_and_without_replacement(bytes) {
        Some(text) => Ok(text.into_owned()),
        None => Err(ConvertError::EncodingError {
            declared: declared.to_string(),
            reason: format!("the input contains byte sequences invalid in {}", encoding.name()),
        }),
    }
}

fn is_compatible(declared: &'static Encoding, actual: &'static Encoding) -> bool {
    let utf16 = |encoding: &'static Encoding| encoding == UTF_16LE || encoding == UTF_16BE;
    declared == actual || (utf16(declared) && utf16(actual))
}

/// Extracts the `encoding` value of a leading XML declaration
///
/// Only the ASCII compatible prefix of the input is inspected.
pub fn sniff_declared_encoding(bytes: &[u8]) -> Option<String> {
    let start = bytes.iter().position(|byte| !byte.is_ascii_whitespace())?;
    let rest = &bytes[start..];
    if !rest.starts_with(b"<?xml") {
        return None;
    }

    let end = rest.windows(2).position(|window| window == b"?>")?;
    let declaration = String::from_utf8_lossy(&rest[..end]);

    let position = declaration.find("encoding")?;
    let value = declaration[position + "encoding".len()..].trim_start();
    let value = value.strip_prefix('=')?.trim_start();

    let quote = value.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &value[1..];
    let close = value.find(quote)?;

    Some(value[..close].trim().to_string())
}

/// Provides functionality for normalizing whitespace characters
///
/// This trait normalizes various sequences of whitespace characters
/// (including spaces, tabs, newlines, etc.) in a string into a single
/// whitespace character, removing leading and trailing whitespace characters.
pub trait NormalizeWhitespace {
    fn normalize_whitespace(&self) -> String;
}

impl NormalizeWhitespace for &str {
    fn normalize_whitespace(&self) -> String {
        self.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl NormalizeWhitespace for String {
    fn normalize_whitespace(&self) -> String {
        self.as_str().normalize_whitespace()
    }
}

/// A child of an XML element: either an element or a run of text
#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

/// Represents an element node in an XML document
///
/// Unlike a data oriented DOM, the children keep text and elements
/// interleaved in document order so that mixed content survives.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    /// The local name of the element (excluding namespace prefix)
    pub name: String,

    /// The namespace prefix of the element
    pub prefix: Option<String>,

    /// The attributes of the element, keyed by their qualified name
    pub attributes: HashMap<String, String>,

    /// The children of the element in document order
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    /// Create a new element
    pub fn new(name: String) -> Self {
        Self {
            name,
            prefix: None,
            attributes: HashMap::new(),
            children: Vec::new(),
        }
    }

    /// Get the full tag name of the element
    pub fn tag_name(&self) -> String {
        if let Some(prefix) = &self.prefix {
            format!("{}:{}", prefix, self.name)
        } else {
            self.name.clone()
        }
    }

    /// Gets the text content of the element and all its descendants
    ///
    /// Whitespace is kept as is.
    pub fn text(&self) -> String {
        let mut result = String::new();
        self.collect_text(&mut result);
        result
    }

    fn collect_text(&self, buf: &mut String) {
        for child in &self.children {
            match child {
                XmlNode::Text(text) => buf.push_str(text),
                XmlNode::Element(element) => element.collect_text(buf),
            }
        }
    }

    /// Returns the value of the specified attribute
    pub fn get_attr(&self, name: &str) -> Option<String> {
        self.attributes.get(name).cloned()
    }

    /// Returns the value of an attribute by local name, whatever its prefix
    ///
    /// FB2 documents bind the XLink namespace to arbitrary prefixes
    /// (`l:href`, `xlink:href`), so links are looked up this way.
    pub fn get_attr_local(&self, local_name: &str) -> Option<String> {
        if let Some(value) = self.attributes.get(local_name) {
            return Some(value.clone());
        }

        let mut keys = self
            .attributes
            .keys()
            .filter(|key| {
                key.split_once(':')
                    .is_some_and(|(prefix, local)| prefix != "xmlns" && local == local_name)
            })
            .collect::<Vec<_>>();
        keys.sort();

        keys.first().and_then(|key| self.attributes.get(*key)).cloned()
    }

    /// Get child elements, skipping text
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|child| match child {
            XmlNode::Element(element) => Some(element),
            XmlNode::Text(_) => None,
        })
    }

    /// Find the first child element with the specified name
    pub fn find_child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|child| child.name == name)
    }

    /// Find all child elements with the specified name
    pub fn find_children_by_name(&self, name: &str) -> impl Iterator<Item = &XmlElement> {
        self.elements().filter(move |child| child.name == name)
    }

    /// Find all elements with the specified name in the subtree, in document order
    pub fn find_elements_by_name(&self, name: &str) -> Vec<&XmlElement> {
        let mut result = Vec::new();
        self.collect_elements(name, &mut result);
        result
    }

    fn collect_elements<'a>(&'a self, name: &str, result: &mut Vec<&'a XmlElement>) {
        if self.name == name {
            result.push(self);
        }

        for child in self.elements() {
            child.collect_elements(name, result);
        }
    }

    /// Normalized text of the first child element with the specified name
    pub fn child_text(&self, name: &str) -> Option<String> {
        self.find_child(name)
            .map(|child| child.text().normalize_whitespace())
            .filter(|text| !text.is_empty())
    }
}

/// XML parser used to parse XML content and build a mixed-content element tree
pub struct XmlReader {}

impl XmlReader {
    /// Parses an XML from string and builds the root element
    ///
    /// Entity and character references are resolved, whitespace in text is preserved,
    /// comments and processing instructions are dropped.
    ///
    /// ## Return
    /// - `Ok(XmlElement)`: The root element of the XML element tree
    /// - `Err(ConvertError)`: The content is not well-formed, or nests deeper
    ///   than [`MAX_XML_DEPTH`]
    pub fn parse(content: &str) -> Result<XmlElement, ConvertError> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(false);

        let mut stack = Vec::<XmlElement>::new();
        let mut root = None;

        loop {
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(err) => {
                    return Err(ConvertError::MalformedInput {
                        reason: format!("{} (at byte {})", err, reader.error_position()),
                    });
                }
            };

            match event {
                Event::Eof => break,

                Event::Start(e) => {
                    if stack.len() >= MAX_XML_DEPTH {
                        return Err(ConvertError::MalformedInput {
                            reason: format!("elements nest deeper than {}", MAX_XML_DEPTH),
                        });
                    }

                    stack.push(Self::make_element(&e));
                }

                Event::End(_) => {
                    if let Some(element) = stack.pop() {
                        match stack.last_mut() {
                            Some(parent) => parent.children.push(XmlNode::Element(element)),
                            None if root.is_none() => root = Some(element),
                            None => {}
                        }
                    }
                }

                Event::Empty(e) => {
                    let element = Self::make_element(&e);
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(XmlNode::Element(element)),
                        None if root.is_none() => root = Some(element),
                        None => {}
                    }
                }

                Event::Text(e) => {
                    if let Some(element) = stack.last_mut() {
                        Self::push_text(element, &String::from_utf8_lossy(e.as_ref()));
                    }
                }

                Event::CData(e) => {
                    if let Some(element) = stack.last_mut() {
                        Self::push_text(element, &String::from_utf8_lossy(e.as_ref()));
                    }
                }

                Event::GeneralRef(e) => {
                    if let Some(element) = stack.last_mut() {
                        let name = String::from_utf8_lossy(e.as_ref()).to_string();
                        let text = match resolve_entity(&name) {
                            Some(text) => text,
                            None => format!("&{};", name),
                        };
                        Self::push_text(element, &text);
                    }
                }

                // Comment, PI, Declaration, Doctype
                _ => continue,
            }
        }

        if !stack.is_empty() {
            return Err(ConvertError::MalformedInput {
                reason: format!(
                    "unexpected end of document, element \"{}\" is not closed",
                    stack.last().map(XmlElement::tag_name).unwrap_or_default()
                ),
            });
        }

        root.ok_or(ConvertError::MalformedInput {
            reason: "the document has no root element".to_string(),
        })
    }

    /// Parse XML from bytes and builds the root element
    pub fn parse_bytes(bytes: &[u8]) -> Result<XmlElement, ConvertError> {
        let content = bytes.decode()?;
        Self::parse(&content)
    }

    fn make_element(e: &quick_xml::events::BytesStart) -> XmlElement {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
        let mut element = XmlElement::new(name);

        if let Some(prefix) = e.name().prefix() {
            element.prefix = Some(String::from_utf8_lossy(prefix.as_ref()).to_string());
        }

        for attr in e.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let raw = String::from_utf8_lossy(&attr.value).to_string();
            let value = match quick_xml::escape::unescape(&raw) {
                Ok(value) => value.to_string(),
                Err(_) => raw,
            };

            element.attributes.insert(key, value);
        }

        element
    }

    /// Append text, merging with a preceding text node
    fn push_text(element: &mut XmlElement, text: &str) {
        if let Some(XmlNode::Text(last)) = element.children.last_mut() {
            last.push_str(text);
        } else {
            element.children.push(XmlNode::Text(text.to_string()));
        }
    }
}

/// Resolves a predefined entity or a character reference
///
/// ## Parameters
/// - `name`: The reference without '&' and ';', e.g. "amp", "#x41" or "#65"
pub fn resolve_entity(name: &str) -> Option<String> {
    match name {
        "amp" => Some("&".to_string()),
        "lt" => Some("<".to_string()),
        "gt" => Some(">".to_string()),
        "quot" => Some("\"".to_string()),
        "apos" => Some("'".to_string()),
        "nbsp" => Some("\u{a0}".to_string()),
        _ => {
            let code = if let Some(hex) = name
                .strip_prefix("#x")
                .or_else(|| name.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse::<u32>().ok()?
            };

            char::from_u32(code).map(String::from)
        }
    }
}

/// Turns an arbitrary string into a valid XML id
///
/// Characters that are not allowed in an id are replaced by '_', ids that do
/// not start with a letter or '_' get an "id-" prefix.
pub fn sanitize_id(raw: &str) -> String {
    let mut id = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();

    match id.chars().next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => id.insert_str(0, "id-"),
    }

    id
}

/// Checks if the value looks like a BCP 47 language tag
///
/// The primary subtag must consist of 2 to 8 letters, further subtags of 1 to 8
/// letters or digits.
pub fn is_valid_language_tag(tag: &str) -> bool {
    let mut subtags = tag.split('-');

    let primary_valid = subtags.next().is_some_and(|primary| {
        (2..=8).contains(&primary.len()) && primary.chars().all(|c| c.is_ascii_alphabetic())
    });

    primary_valid
        && subtags.all(|subtag| {
            (1..=8).contains(&subtag.len()) && subtag.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

/// Normalizes a language value found in a document
///
/// Underscores are accepted as separators ("ru_RU"), the primary subtag is
/// lowercased. Returns `None` for values that are not language tags.
pub fn normalize_language(raw: &str) -> Option<String> {
    let tag = raw.trim().replace('_', "-");
    if !is_valid_language_tag(&tag) {
        return None;
    }

    let mut subtags = tag.split('-');
    let primary = subtags.next()?.to_ascii_lowercase();

    Some(
        std::iter::once(primary)
            .chain(subtags.map(String::from))
            .collect::<Vec<_>>()
            .join("-"),
    )
}

/// Derives a stable `urn:uuid:` identifier from the input bytes
///
/// The UUID is name based (version 5 layout) over a SHA-1 digest, so the same
/// input always yields the same identifier.
pub fn derive_identifier(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(b"fb2epub:");
    hasher.update(data);
    let hash = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    bytes[6] = (bytes[6] & 0x0F) | 0x50;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;

    let hex = bytes.iter().map(|byte| format!("{:02x}", byte)).collect::<String>();
    format!(
        "urn:uuid:{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Fixed texts of generated pages and navigation, per book language
#[derive(Debug, PartialEq, Eq)]
pub struct LocalizedTerms {
    pub table_of_contents: &'static str,
    pub landmarks: &'static str,
    pub notes: &'static str,
    pub comments: &'static str,
    pub cover: &'static str,
    pub annotation: &'static str,
    pub title_page: &'static str,
    pub start: &'static str,
    pub series: &'static str,
    pub translated_by: &'static str,
    pub copyright: &'static str,
    pub publication: &'static str,
    pub source_publication: &'static str,
    pub document_info: &'static str,

    /// Labels of publication details, in [InfoField] declaration order
    pub info_fields: [&'static str; 11],
}

impl LocalizedTerms {
    pub fn info_group(&self, kind: InfoGroupKind) -> &'static str {
        match kind {
            InfoGroupKind::Publication => self.publication,
            InfoGroupKind::SourcePublication => self.source_publication,
            InfoGroupKind::Document => self.document_info,
        }
    }

    pub fn info_field(&self, field: InfoField) -> &'static str {
        self.info_fields[field as usize]
    }
}

static TERMS_EN: LocalizedTerms = LocalizedTerms {
    table_of_contents: "Table of Contents",
    landmarks: "Landmarks",
    notes: "Notes",
    comments: "Comments",
    cover: "Cover",
    annotation: "Annotation",
    title_page: "Title Page",
    start: "Start of Content",
    series: "Series",
    translated_by: "Translated by",
    copyright: "Copyright",
    publication: "Publication Info",
    source_publication: "Original Publication",
    document_info: "Document Info",
    info_fields: [
        "Title",
        "Author",
        "Publisher",
        "City",
        "Year",
        "ISBN",
        "Language",
        "Date",
        "Program used",
        "Identifier",
        "Version",
    ],
};

static TERMS_RU: LocalizedTerms = LocalizedTerms {
    table_of_contents: "Содержание",
    landmarks: "Ориентиры",
    notes: "Примечания",
    comments: "Комментарии",
    cover: "Обложка",
    annotation: "Аннотация",
    title_page: "Титульная страница",
    start: "Начало",
    series: "Серия",
    translated_by: "Перевод",
    copyright: "Выходные данные",
    publication: "Издание",
    source_publication: "Оригинальное издание",
    document_info: "Информация о документе",
    info_fields: [
        "Название",
        "Автор",
        "Издательство",
        "Город",
        "Год",
        "ISBN",
        "Язык",
        "Дата",
        "Программа",
        "Идентификатор",
        "Версия",
    ],
};

static TERMS_UK: LocalizedTerms = LocalizedTerms {
    table_of_contents: "Зміст",
    landmarks: "Орієнтири",
    notes: "Примітки",
    comments: "Коментарі",
    cover: "Обкладинка",
    annotation: "Анотація",
    title_page: "Титульна сторінка",
    start: "Початок",
    series: "Серія",
    translated_by: "Переклад",
    copyright: "Вихідні дані",
    publication: "Видання",
    source_publication: "Оригінальне видання",
    document_info: "Інформація про документ",
    info_fields: [
        "Назва",
        "Автор",
        "Видавництво",
        "Місто",
        "Рік",
        "ISBN",
        "Мова",
        "Дата",
        "Програма",
        "Ідентифікатор",
        "Версія",
    ],
};

/// Returns the terms for a language tag, English when the language is not covered
pub fn localized_terms(language: &str) -> &'static LocalizedTerms {
    let primary = language.split('-').next().unwrap_or_default().to_ascii_lowercase();

    match primary.as_str() {
        "ru" => &TERMS_RU,
        "uk" => &TERMS_UK,
        _ => &TERMS_EN,
    }
}

/// Determines the media type of a binary resource
///
/// The declared content type is trusted when it names a concrete image type,
/// otherwise the type is sniffed from the data.
pub fn detect_media_type(data: &[u8], declared: Option<&str>) -> Option<String> {
    let declared = declared
        .map(|mime| mime.trim().to_ascii_lowercase())
        .filter(|mime| !mime.is_empty());

    match declared.as_deref() {
        Some("image/jpg") | Some("image/pjpeg") => return Some("image/jpeg".to_string()),
        Some(mime) if mime.starts_with("image/") && mime != "image/*" => {
            return Some(mime.to_string());
        }
        _ => {}
    }

    match Infer::new().get(data) {
        Some(kind) => Some(kind.mime_type().to_string()),
        None => declared,
    }
}

/// Returns the usual file extension of a media type
pub fn extension_for_media_type(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/tiff" => "tif",
        _ => "bin",
    }
}
