//! Epub Builder
//!
//! This module assembles EPUB 3 packages. The `EpubBuilder` structure writes
//! the container, package document, navigation document and NCX, and zips
//! them with all resources into an archive held in memory. The
//! `PackageAssembler` feeds a builder from a parsed [`Document`] and its
//! rendered content documents.
//!
//! ## Usage
//!
//! ```rust
//! # fn main() -> Result<(), fb2_epub::error::ConvertError> {
//! use fb2_epub::{
//!     builder::EpubBuilder,
//!     types::{ManifestItem, MetadataItem, NavPoint, SpineItem},
//! };
//!
//! let mut builder = EpubBuilder::new();
//! builder
//!     .add_metadata(MetadataItem::new("title", "Test Book"))
//!     .add_metadata(MetadataItem::new("language", "en"))
//!     .add_metadata(MetadataItem::new("identifier", "urn:isbn:0000").with_id("pub-id").build())
//!     .add_manifest(
//!         b"<html xmlns=\"http://www.w3.org/1999/xhtml\"/>".to_vec(),
//!         ManifestItem::new("chapter", "Text/chapter.xhtml")?.set_mime("application/xhtml+xml"),
//!     )?
//!     .add_spine(SpineItem::new("chapter"))
//!     .add_catalog_item(NavPoint::new("Chapter").with_content("Text/chapter.xhtml"));
//!
//! let epub = builder.make()?;
//! assert!(epub.starts_with(b"PK"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Notes
//!
//! - The `mimetype` entry is written first and uncompressed, all entries carry
//!   a fixed timestamp, so identical input yields byte-identical archives.
//! - The navigation document and the NCX are generated from the same catalog.

pub mod content;
pub mod style;

use std::{
    collections::{HashMap, HashSet},
    io::{Cursor, Write},
};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use indexmap::IndexMap;
use infer::Infer;
use log::{debug, info};
use quick_xml::{
    Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::{
    builder::{
        content::{DocumentRole, RenderedBook},
        style::Stylesheet,
    },
    config::{ConversionConfig, ModifiedDate},
    error::{ConvertError, PackagingError},
    model::{Document, Person, Section},
    report::Diagnostics,
    types::{
        ELEMENT_IN_DC_NAMESPACE, Landmark, ManifestItem, MetadataItem, MetadataRefinement,
        NavPoint, SpineItem,
    },
    utils::{localized_terms, sanitize_id},
};

pub(crate) type XmlWriter = Writer<Cursor<Vec<u8>>>;

/// Location of the package document inside the archive
pub const PACKAGE_DOCUMENT: &str = "OEBPS/content.opf";

/// Folder of the package document, all manifest paths are relative to it
const PACKAGE_DIR: &str = "OEBPS";

const TEXT_DIR: &str = "Text";
const IMAGES_DIR: &str = "Images";
const STYLESHEET_PATH: &str = "Styles/style.css";
const NAV_PATH: &str = "Text/nav.xhtml";
const NCX_PATH: &str = "toc.ncx";

/// EPUB Builder
///
/// Collects package data and resources in memory and writes an EPUB 3.0
/// archive with EPUB 2 compatibility data (NCX and guide).
pub struct EpubBuilder {
    /// List of metadata items
    metadata: Vec<MetadataItem>,

    /// Manifest items in insertion order, keyed by id
    manifest: IndexMap<String, ManifestItem>,

    /// Resource data, keyed by manifest id
    resources: HashMap<String, Vec<u8>>,

    /// List of spine items, defining the reading order
    spine: Vec<SpineItem>,

    catalog_title: String,

    /// List of catalog navigation points
    catalog: Vec<NavPoint>,

    landmarks_title: String,
    landmarks: Vec<Landmark>,

    /// Value of `dcterms:modified`
    modified: DateTime<Utc>,
}

impl Default for EpubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EpubBuilder {
    /// Create a new `EpubBuilder` instance
    ///
    /// The modification date defaults to the Unix epoch.
    pub fn new() -> Self {
        EpubBuilder {
            metadata: vec![],
            manifest: IndexMap::new(),
            resources: HashMap::new(),
            spine: vec![],

            catalog_title: String::new(),
            catalog: vec![],

            landmarks_title: "Landmarks".to_string(),
            landmarks: vec![],

            modified: DateTime::UNIX_EPOCH,
        }
    }

    /// Add metadata item
    ///
    /// Required metadata includes title, language, and an identifier with 'pub-id'.
    /// Missing this data will result in an error when building the epub file.
    ///
    /// # Parameters
    /// - `item`: Metadata items to add
    pub fn add_metadata(&mut self, item: MetadataItem) -> &mut Self {
        self.metadata.push(item);
        self
    }

    /// Add manifest item and its resource data
    ///
    /// An item without media type gets one inferred from the data and the
    /// file extension.
    ///
    /// # Parameters
    /// - `data` - Resource content
    /// - `manifest_item` - Manifest item information
    ///
    /// # Return
    /// - `Ok(&mut Self)` - Successful addition, returns a reference to itself
    /// - `Err(ConvertError)` - The id is already used
    pub fn add_manifest(
        &mut self,
        data: Vec<u8>,
        manifest_item: ManifestItem,
    ) -> Result<&mut Self, ConvertError> {
        if self.manifest.contains_key(&manifest_item.id) {
            return Err(PackagingError::DuplicateManifestId {
                manifest_id: manifest_item.id,
            }
            .into());
        }

        let manifest_item = if manifest_item.mime.is_empty() {
            let extension = manifest_item
                .path
                .rsplit_once('.')
                .map(|(_, extension)| extension.to_lowercase())
                .unwrap_or_default();
            let infer_mime = Infer::new()
                .get(&data)
                .map(|kind| kind.mime_type())
                .unwrap_or("application/octet-stream");

            let mime = refine_mime_type(infer_mime, &extension);
            manifest_item.set_mime(&mime)
        } else {
            manifest_item
        };

        self.resources.insert(manifest_item.id.clone(), data);
        self.manifest.insert(manifest_item.id.clone(), manifest_item);
        Ok(self)
    }

    /// Add spine item
    ///
    /// The spine item defines the reading order of the book.
    ///
    /// # Parameters
    /// - `item`: Spine item to add
    pub fn add_spine(&mut self, item: SpineItem) -> &mut Self {
        self.spine.push(item);
        self
    }

    /// Set catalog title
    ///
    /// # Parameters
    /// - `title`: Catalog title
    pub fn set_catalog_title(&mut self, title: &str) -> &mut Self {
        self.catalog_title = title.to_string();
        self
    }

    /// Add catalog item
    ///
    /// Added directory items will be added to the end of the existing list.
    ///
    /// # Parameters
    /// - `item`: Catalog item to add
    pub fn add_catalog_item(&mut self, item: NavPoint) -> &mut Self {
        self.catalog.push(item);
        self
    }

    /// Re-/ Set catalog
    ///
    /// The passed list will overwrite existing data.
    ///
    /// # Parameters
    /// - `catalog`: Catalog to set
    pub fn set_catalog(&mut self, catalog: Vec<NavPoint>) -> &mut Self {
        self.catalog = catalog;
        self
    }

    pub fn set_landmarks_title(&mut self, title: &str) -> &mut Self {
        self.landmarks_title = title.to_string();
        self
    }

    /// Add landmark, written to the guide and the landmarks navigation
    pub fn add_landmark(&mut self, landmark: Landmark) -> &mut Self {
        self.landmarks.push(landmark);
        self
    }

    pub fn set_modified(&mut self, modified: DateTime<Utc>) -> &mut Self {
        self.modified = modified;
        self
    }

    /// Builds the EPUB archive
    ///
    /// # Return
    /// - `Ok(Vec<u8>)`: The archive content
    /// - `Err(ConvertError)`: The package data is incomplete or inconsistent,
    ///   or writing the archive failed
    pub fn make(mut self) -> Result<Vec<u8>, ConvertError> {
        // nav and ncx add themselves to the manifest, so they go before the OPF
        NavPoint::assign_play_order(&mut self.catalog, 1);
        self.make_navigation_document()?;
        self.make_ncx()?;
        let container = self.make_container_xml()?;
        let package = self.make_opf_file()?;

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let stored = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(zip::DateTime::default());
        let deflated = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default());

        zip.start_file("mimetype", stored)?;
        zip.write_all(b"application/epub+zip")?;

        zip.start_file("META-INF/container.xml", deflated)?;
        zip.write_all(&container)?;

        zip.start_file(PACKAGE_DOCUMENT, deflated)?;
        zip.write_all(&package)?;

        for (id, item) in &self.manifest {
            let Some(data) = self.resources.get(id) else {
                continue;
            };

            zip.start_file(format!("{}/{}", PACKAGE_DIR, item.path), deflated)?;
            zip.write_all(data)?;
        }

        let archive = zip.finish()?.into_inner();
        debug!(
            "packaged {} manifest items into {} bytes",
            self.manifest.len(),
            archive.len()
        );

        Ok(archive)
    }

    fn metadata_value(&self, property: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|item| item.property == property)
            .map(|item| item.value.as_str())
    }

    fn unique_identifier(&self) -> Option<&str> {
        self.metadata
            .iter()
            .find(|item| {
                item.property == "identifier" && item.id.as_deref() == Some("pub-id")
            })
            .map(|item| item.value.as_str())
    }

    /// Creates the `container.xml` file
    fn make_container_xml(&self) -> Result<Vec<u8>, ConvertError> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        writer.write_event(Event::Start(BytesStart::new("container").with_attributes(
            [
                ("version", "1.0"),
                ("xmlns", "urn:oasis:names:tc:opendocument:xmlns:container"),
            ],
        )))?;
        writer.write_event(Event::Start(BytesStart::new("rootfiles")))?;
        writer.write_event(Event::Empty(BytesStart::new("rootfile").with_attributes([
            ("full-path", PACKAGE_DOCUMENT),
            ("media-type", "application/oebps-package+xml"),
        ])))?;
        writer.write_event(Event::End(BytesEnd::new("rootfiles")))?;
        writer.write_event(Event::End(BytesEnd::new("container")))?;

        Ok(writer.into_inner().into_inner())
    }

    /// Creates the `navigation document`
    ///
    /// An error will occur if navigation information is not initialized.
    fn make_navigation_document(&mut self) -> Result<(), ConvertError> {
        if self.catalog.is_empty() {
            return Err(PackagingError::NavigationInfoUninitialized.into());
        }

        let language = self.metadata_value("language").unwrap_or_default().to_string();
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::DocType(BytesText::from_escaped("html")))?;
        writer.write_event(Event::Start(BytesStart::new("html").with_attributes([
            ("xmlns", "http://www.w3.org/1999/xhtml"),
            ("xmlns:epub", "http://www.idpf.org/2007/ops"),
            ("xml:lang", language.as_str()),
            ("lang", language.as_str()),
        ])))?;

        // make head
        writer.write_event(Event::Start(BytesStart::new("head")))?;
        writer.write_event(Event::Start(BytesStart::new("title")))?;
        writer.write_event(Event::Text(BytesText::new(&self.catalog_title)))?;
        writer.write_event(Event::End(BytesEnd::new("title")))?;
        writer.write_event(Event::End(BytesEnd::new("head")))?;

        // make body
        writer.write_event(Event::Start(BytesStart::new("body")))?;
        writer.write_event(Event::Start(
            BytesStart::new("nav").with_attributes([("epub:type", "toc"), ("id", "toc")]),
        ))?;

        if !self.catalog_title.is_empty() {
            writer.write_event(Event::Start(BytesStart::new("h1")))?;
            writer.write_event(Event::Text(BytesText::new(&self.catalog_title)))?;
            writer.write_event(Event::End(BytesEnd::new("h1")))?;
        }

        Self::make_nav(&mut writer, &self.catalog)?;

        writer.write_event(Event::End(BytesEnd::new("nav")))?;

        if !self.landmarks.is_empty() {
            writer.write_event(Event::Start(BytesStart::new("nav").with_attributes([
                ("epub:type", "landmarks"),
                ("id", "landmarks"),
                ("hidden", "hidden"),
            ])))?;
            writer.write_event(Event::Start(BytesStart::new("h2")))?;
            writer.write_event(Event::Text(BytesText::new(&self.landmarks_title)))?;
            writer.write_event(Event::End(BytesEnd::new("h2")))?;
            writer.write_event(Event::Start(BytesStart::new("ol")))?;

            for landmark in &self.landmarks {
                let href = nav_relative(&landmark.href);
                writer.write_event(Event::Start(BytesStart::new("li")))?;
                writer.write_event(Event::Start(BytesStart::new("a").with_attributes([
                    ("epub:type", landmark.epub_type.as_str()),
                    ("href", href.as_str()),
                ])))?;
                writer.write_event(Event::Text(BytesText::new(&landmark.title)))?;
                writer.write_event(Event::End(BytesEnd::new("a")))?;
                writer.write_event(Event::End(BytesEnd::new("li")))?;
            }

            writer.write_event(Event::End(BytesEnd::new("ol")))?;
            writer.write_event(Event::End(BytesEnd::new("nav")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("body")))?;
        writer.write_event(Event::End(BytesEnd::new("html")))?;

        let item = ManifestItem::new("nav", NAV_PATH)?
            .set_mime("application/xhtml+xml")
            .append_property("nav");
        self.add_manifest(writer.into_inner().into_inner(), item)?;

        Ok(())
    }

    fn make_nav(writer: &mut XmlWriter, navigations: &[NavPoint]) -> Result<(), ConvertError> {
        writer.write_event(Event::Start(BytesStart::new("ol")))?;

        for nav in navigations {
            writer.write_event(Event::Start(BytesStart::new("li")))?;

            if let Some(path) = &nav.content {
                let href = nav_relative(path);
                writer.write_event(Event::Start(
                    BytesStart::new("a").with_attributes([("href", href.as_str())]),
                ))?;
                writer.write_event(Event::Text(BytesText::new(nav.label.as_str())))?;
                writer.write_event(Event::End(BytesEnd::new("a")))?;
            } else {
                writer.write_event(Event::Start(BytesStart::new("span")))?;
                writer.write_event(Event::Text(BytesText::new(nav.label.as_str())))?;
                writer.write_event(Event::End(BytesEnd::new("span")))?;
            }

            if !nav.children.is_empty() {
                Self::make_nav(writer, &nav.children)?;
            }

            writer.write_event(Event::End(BytesEnd::new("li")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("ol")))?;

        Ok(())
    }

    /// Creates the EPUB 2 `NCX` file from the catalog
    fn make_ncx(&mut self) -> Result<(), ConvertError> {
        let uid = self.unique_identifier().unwrap_or_default().to_string();
        let title = self.metadata_value("title").unwrap_or_default().to_string();
        let language = self.metadata_value("language").unwrap_or_default().to_string();
        let depth = self.catalog.iter().map(NavPoint::depth).max().unwrap_or(1).to_string();

        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("ncx").with_attributes([
            ("xmlns", "http://www.daisy.org/z3986/2005/ncx/"),
            ("version", "2005-1"),
            ("xml:lang", language.as_str()),
        ])))?;

        writer.write_event(Event::Start(BytesStart::new("head")))?;
        for (name, content) in [
            ("dtb:uid", uid.as_str()),
            ("dtb:depth", depth.as_str()),
            ("dtb:totalPageCount", "0"),
            ("dtb:maxPageNumber", "0"),
        ] {
            writer.write_event(Event::Empty(
                BytesStart::new("meta").with_attributes([("name", name), ("content", content)]),
            ))?;
        }
        writer.write_event(Event::End(BytesEnd::new("head")))?;

        writer.write_event(Event::Start(BytesStart::new("docTitle")))?;
        writer.write_event(Event::Start(BytesStart::new("text")))?;
        writer.write_event(Event::Text(BytesText::new(&title)))?;
        writer.write_event(Event::End(BytesEnd::new("text")))?;
        writer.write_event(Event::End(BytesEnd::new("docTitle")))?;

        writer.write_event(Event::Start(BytesStart::new("navMap")))?;
        Self::make_nav_points(&mut writer, &self.catalog)?;
        writer.write_event(Event::End(BytesEnd::new("navMap")))?;

        writer.write_event(Event::End(BytesEnd::new("ncx")))?;

        let item = ManifestItem::new("ncx", NCX_PATH)?.set_mime("application/x-dtbncx+xml");
        self.add_manifest(writer.into_inner().into_inner(), item)?;

        Ok(())
    }

    fn make_nav_points(writer: &mut XmlWriter, points: &[NavPoint]) -> Result<(), ConvertError> {
        for point in points {
            // NCX entries must point somewhere, use the first target below a bare heading
            let Some(src) = point.content.as_deref().or_else(|| first_content(&point.children))
            else {
                Self::make_nav_points(writer, &point.children)?;
                continue;
            };

            let order = point.play_order.unwrap_or_default();
            let id = format!("navpoint-{}", order);
            let order = order.to_string();

            writer.write_event(Event::Start(BytesStart::new("navPoint").with_attributes([
                ("id", id.as_str()),
                ("playOrder", order.as_str()),
            ])))?;
            writer.write_event(Event::Start(BytesStart::new("navLabel")))?;
            writer.write_event(Event::Start(BytesStart::new("text")))?;
            writer.write_event(Event::Text(BytesText::new(&point.label)))?;
            writer.write_event(Event::End(BytesEnd::new("text")))?;
            writer.write_event(Event::End(BytesEnd::new("navLabel")))?;
            writer.write_event(Event::Empty(
                BytesStart::new("content").with_attributes([("src", src)]),
            ))?;

            Self::make_nav_points(writer, &point.children)?;

            writer.write_event(Event::End(BytesEnd::new("navPoint")))?;
        }

        Ok(())
    }

    /// Creates the `OPF` file
    ///
    /// # Error conditions
    /// - Missing necessary metadata
    /// - Not exactly one manifest item with the `nav` property
    /// - Empty spine, or spine items missing from the manifest
    fn make_opf_file(&mut self) -> Result<Vec<u8>, ConvertError> {
        if !self.validate_metadata() {
            return Err(PackagingError::MissingNecessaryMetadata.into());
        }
        self.validate_manifest_nav()?;
        self.validate_spine()?;

        let language = self.metadata_value("language").unwrap_or_default().to_string();
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        writer.write_event(Event::Start(BytesStart::new("package").with_attributes([
            ("xmlns", "http://www.idpf.org/2007/opf"),
            ("xmlns:dc", "http://purl.org/dc/elements/1.1/"),
            ("unique-identifier", "pub-id"),
            ("version", "3.0"),
            ("xml:lang", language.as_str()),
        ])))?;

        self.make_opf_metadata(&mut writer)?;
        self.make_opf_manifest(&mut writer)?;
        self.make_opf_spine(&mut writer)?;
        self.make_opf_guide(&mut writer)?;

        writer.write_event(Event::End(BytesEnd::new("package")))?;

        Ok(writer.into_inner().into_inner())
    }

    fn make_opf_metadata(&mut self, writer: &mut XmlWriter) -> Result<(), ConvertError> {
        self.metadata.push(MetadataItem::new(
            "dcterms:modified",
            &self.modified.to_rfc3339_opts(SecondsFormat::Secs, true),
        ));

        writer.write_event(Event::Start(BytesStart::new("metadata")))?;

        for metadata in &self.metadata {
            let tag_name = if ELEMENT_IN_DC_NAMESPACE.contains(&metadata.property.as_str()) {
                format!("dc:{}", metadata.property)
            } else {
                "meta".to_string()
            };

            writer.write_event(Event::Start(
                BytesStart::new(tag_name.as_str()).with_attributes(metadata.attributes()),
            ))?;
            writer.write_event(Event::Text(BytesText::new(metadata.value.as_str())))?;
            writer.write_event(Event::End(BytesEnd::new(tag_name.as_str())))?;

            let refines = metadata.id.as_ref().map(|id| format!("#{}", id));
            for refinement in &metadata.refined {
                let Some(refines) = &refines else {
                    continue;
                };

                writer.write_event(Event::Start(
                    BytesStart::new("meta").with_attributes(refinement.attributes(refines)),
                ))?;
                writer.write_event(Event::Text(BytesText::new(refinement.value.as_str())))?;
                writer.write_event(Event::End(BytesEnd::new("meta")))?;
            }
        }

        // EPUB 2 reading systems find the cover through this element
        if let Some(cover) = self.manifest.values().find(|item| item.has_property("cover-image")) {
            writer.write_event(Event::Empty(BytesStart::new("meta").with_attributes([
                ("name", "cover"),
                ("content", cover.id.as_str()),
            ])))?;
        }

        writer.write_event(Event::End(BytesEnd::new("metadata")))?;

        Ok(())
    }

    fn make_opf_manifest(&self, writer: &mut XmlWriter) -> Result<(), ConvertError> {
        writer.write_event(Event::Start(BytesStart::new("manifest")))?;

        for manifest in self.manifest.values() {
            writer.write_event(Event::Empty(
                BytesStart::new("item").with_attributes(manifest.attributes()),
            ))?;
        }

        writer.write_event(Event::End(BytesEnd::new("manifest")))?;

        Ok(())
    }

    fn make_opf_spine(&self, writer: &mut XmlWriter) -> Result<(), ConvertError> {
        writer.write_event(Event::Start(
            BytesStart::new("spine").with_attributes([("toc", "ncx")]),
        ))?;

        for spine in &self.spine {
            writer.write_event(Event::Empty(
                BytesStart::new("itemref").with_attributes(spine.attributes()),
            ))?;
        }

        writer.write_event(Event::End(BytesEnd::new("spine")))?;

        Ok(())
    }

    fn make_opf_guide(&self, writer: &mut XmlWriter) -> Result<(), ConvertError> {
        if self.landmarks.is_empty() {
            return Ok(());
        }

        writer.write_event(Event::Start(BytesStart::new("guide")))?;

        for landmark in &self.landmarks {
            writer.write_event(Event::Empty(BytesStart::new("reference").with_attributes([
                ("type", landmark.guide_type.as_str()),
                ("title", landmark.title.as_str()),
                ("href", landmark.href.as_str()),
            ])))?;
        }

        writer.write_event(Event::End(BytesEnd::new("guide")))?;

        Ok(())
    }

    /// Verify metadata integrity
    ///
    /// Check if the required metadata items are included: title, language, and identifier with pub-id.
    fn validate_metadata(&self) -> bool {
        let has_title = self.metadata.iter().any(|item| item.property == "title");
        let has_language = self.metadata.iter().any(|item| item.property == "language");
        let has_identifier = self.unique_identifier().is_some();

        has_title && has_identifier && has_language
    }

    /// Validate navigation list items
    ///
    /// Check if there is only one list item with the `nav` property.
    fn validate_manifest_nav(&self) -> Result<(), ConvertError> {
        if self
            .manifest
            .values()
            .filter(|item| item.has_property("nav"))
            .count()
            == 1
        {
            Ok(())
        } else {
            Err(PackagingError::TooManyNavFlags.into())
        }
    }

    /// Validate that the spine is not empty and only refers to manifest items
    fn validate_spine(&self) -> Result<(), ConvertError> {
        if self.spine.is_empty() {
            return Err(PackagingError::EmptySpine.into());
        }

        match self
            .spine
            .iter()
            .find(|item| !self.manifest.contains_key(&item.idref))
        {
            Some(item) => Err(PackagingError::SpineItemNotInManifest {
                idref: item.idref.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }
}

/// Rewrite a path relative to the package document as seen from the navigation document
fn nav_relative(href: &str) -> String {
    match href.strip_prefix("Text/") {
        Some(href) => href.to_string(),
        None => format!("../{}", href),
    }
}

fn first_content(points: &[NavPoint]) -> Option<&str> {
    points.iter().find_map(|point| {
        point
            .content
            .as_deref()
            .or_else(|| first_content(&point.children))
    })
}

/// Refine the mime type
///
/// Optimize mime types inferred from file content based on file extensions
fn refine_mime_type(infer_mime: &str, extension: &str) -> String {
    match (infer_mime, extension) {
        ("text/xml", "xhtml")
        | ("text/html", "xhtml")
        | ("application/xml", "xhtml")
        | ("application/octet-stream", "xhtml") => "application/xhtml+xml".to_string(),

        ("text/xml", "ncx")
        | ("application/xml", "ncx")
        | ("application/octet-stream", "ncx") => "application/x-dtbncx+xml".to_string(),

        ("text/plain", "css") | ("application/octet-stream", "css") => "text/css".to_string(),
        ("text/xml", "svg") | ("application/octet-stream", "svg") => "image/svg+xml".to_string(),

        _ => infer_mime.to_string(),
    }
}

/// Assembles the EPUB package of a converted book
///
/// Builds the package metadata, manifest, spine, table of contents and
/// landmarks from a [`Document`] and its [`RenderedBook`], then writes the
/// archive with an [`EpubBuilder`].
pub struct PackageAssembler<'a> {
    document: &'a Document,
    config: &'a ConversionConfig,
}

impl<'a> PackageAssembler<'a> {
    pub fn new(document: &'a Document, config: &'a ConversionConfig) -> Self {
        Self { document, config }
    }

    /// Assemble the archive
    ///
    /// ## Parameters
    /// - `book`: The rendered content documents
    /// - `stylesheet`: The stylesheet linked by every content document
    /// - `diagnostics`: Sink for recovered problems
    ///
    /// ## Return
    /// - `Ok(Vec<u8>)`: The EPUB archive
    /// - `Err(ConvertError)`: A `PackagingError` or an archive failure
    pub fn assemble(
        &self,
        book: RenderedBook,
        stylesheet: Stylesheet,
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<u8>, ConvertError> {
        let metadata = &self.document.metadata;
        let terms = localized_terms(&metadata.language);
        let mut builder = EpubBuilder::new();

        self.add_metadata(&mut builder);
        builder.set_modified(self.modified_date());

        builder.add_manifest(
            stylesheet.content.into_bytes(),
            ManifestItem::new("css", STYLESHEET_PATH)?.set_mime("text/css"),
        )?;

        let catalog = self.make_catalog(&book);
        let first_chapter = book.chapters().next().map(|document| document.file_name.clone());

        for document in &book.documents {
            let href = format!("{}/{}", TEXT_DIR, document.file_name);
            let landmark = match document.role {
                DocumentRole::Cover => Some(("cover", "cover", terms.cover)),
                DocumentRole::TitlePage => Some(("titlepage", "title-page", terms.title_page)),
                DocumentRole::Annotation => Some(("preface", "preface", terms.annotation)),
                DocumentRole::Copyright => Some(("copyright-page", "copyright-page", terms.copyright)),
                DocumentRole::Chapter if first_chapter.as_ref() == Some(&document.file_name) => {
                    Some(("bodymatter", "text", terms.start))
                }
                _ => None,
            };
            if let Some((epub_type, guide_type, title)) = landmark {
                builder.add_landmark(Landmark::new(epub_type, guide_type, title, &href));
            }

            let item =
                ManifestItem::new(&document.id, &href)?.set_mime("application/xhtml+xml");
            builder.add_manifest(document.data.clone(), item)?;

            let spine = SpineItem::new(&document.id);
            builder.add_spine(if document.linear { spine } else { spine.non_linear() });
        }

        builder.add_landmark(Landmark::new(
            "toc",
            "toc",
            terms.table_of_contents,
            NAV_PATH,
        ));

        self.add_images(&mut builder)?;

        builder
            .set_catalog_title(terms.table_of_contents)
            .set_catalog(catalog)
            .set_landmarks_title(terms.landmarks);

        let archive = builder.make()?;
        info!(
            "assembled \"{}\": {} documents, {} images, {} warnings",
            metadata.title,
            book.documents.len(),
            self.document.binaries.len(),
            diagnostics.warnings().len()
        );

        Ok(archive)
    }

    fn add_metadata(&self, builder: &mut EpubBuilder) {
        let metadata = &self.document.metadata;

        builder
            .add_metadata(
                MetadataItem::new("identifier", &metadata.identifier)
                    .with_id("pub-id")
                    .build(),
            )
            .add_metadata(MetadataItem::new("title", &metadata.title).with_id("title").build())
            .add_metadata(MetadataItem::new("language", &metadata.language));

        let people = metadata
            .authors
            .iter()
            .map(|person| (person, "aut"))
            .chain(metadata.translators.iter().map(|person| (person, "trl")));
        for (index, (person, role)) in people.enumerate() {
            builder.add_metadata(creator(person, role, index + 1));
        }

        if let Some(description) = &metadata.description {
            builder.add_metadata(MetadataItem::new("description", description));
        }

        for subject in metadata.genres.iter().chain(metadata.keywords.iter()) {
            builder.add_metadata(MetadataItem::new("subject", subject));
        }

        if let Some(publisher) = &metadata.publisher {
            builder.add_metadata(MetadataItem::new("publisher", publisher));
        }

        let date = metadata
            .year
            .as_deref()
            .or(metadata.date.as_deref())
            .filter(|date| {
                date.get(..4)
                    .is_some_and(|year| year.chars().all(|c| c.is_ascii_digit()))
            });
        if let Some(date) = date {
            builder.add_metadata(MetadataItem::new("date", date));
        }

        if let Some(isbn) = &metadata.isbn {
            builder.add_metadata(
                MetadataItem::new("identifier", &format!("urn:isbn:{}", isbn))
                    .with_id("isbn")
                    .build(),
            );
        }

        if let Some(sequence) = &metadata.sequence {
            let mut series = MetadataItem::new("belongs-to-collection", &sequence.name);
            series
                .with_id("series")
                .append_refinement(MetadataRefinement::new("collection-type", "series"));
            if let Some(number) = &sequence.number {
                series.append_refinement(MetadataRefinement::new("group-position", number));
            }
            builder.add_metadata(series);
        }
    }

    /// Add the binaries of the document as image resources
    fn add_images(&self, builder: &mut EpubBuilder) -> Result<(), ConvertError> {
        let cover = self.document.metadata.cover.as_deref();
        let mut used_ids = HashSet::new();

        for (id, binary) in &self.document.binaries {
            let path = format!("{}/{}", IMAGES_DIR, binary.file_name);

            let item = if cover == Some(id.as_str()) {
                ManifestItem::new("cover-image", &path)?.append_property("cover-image")
            } else {
                let base = sanitize_id(&format!("img-{}", binary.file_name));
                let mut manifest_id = base.clone();
                let mut counter = 1;
                while manifest_id == "cover-image" || !used_ids.insert(manifest_id.clone()) {
                    counter += 1;
                    manifest_id = format!("{}-{}", base, counter);
                }
                ManifestItem::new(&manifest_id, &path)?
            };

            builder.add_manifest(binary.data.clone(), item.set_mime(&binary.media_type))?;
        }

        Ok(())
    }

    /// Build the table of contents shared by the navigation document and the NCX
    fn make_catalog(&self, book: &RenderedBook) -> Vec<NavPoint> {
        if !self.document.has_titled_sections() {
            let target = book
                .chapters()
                .next()
                .or_else(|| book.documents.first())
                .map(|document| format!("{}/{}", TEXT_DIR, document.file_name));

            let mut point = NavPoint::new(&self.document.metadata.title);
            if let Some(target) = target {
                point = point.with_content(&target);
            }
            return vec![point];
        }

        let mut catalog = Vec::new();
        build_catalog(
            &self.document.sections,
            book,
            1,
            self.config.toc_depth,
            &mut catalog,
        );

        catalog
    }

    fn modified_date(&self) -> DateTime<Utc> {
        match self.config.modified {
            ModifiedDate::Fixed(date) => date,
            ModifiedDate::Now => Utc::now(),
            ModifiedDate::FromSource => self
                .document
                .metadata
                .date
                .as_deref()
                .and_then(parse_source_date)
                .unwrap_or(DateTime::UNIX_EPOCH),
        }
    }
}

/// Depth-first traversal of the section tree, one entry per titled section
///
/// Untitled sections have no entry, their children are lifted to the current level.
fn build_catalog(
    sections: &[Section],
    book: &RenderedBook,
    depth: usize,
    max_depth: Option<usize>,
    points: &mut Vec<NavPoint>,
) {
    for section in sections {
        let Some(title) = &section.title else {
            build_catalog(&section.children, book, depth, max_depth, points);
            continue;
        };

        if max_depth.is_some_and(|max| depth > max) {
            continue;
        }

        let mut label = title.toc_text();
        if label.is_empty() {
            label = title.plain_text();
        }

        let mut point = NavPoint::new(&label);
        if let Some(file) = book.file_of(&section.anchor) {
            point = point.with_content(&format!("{}/{}#{}", TEXT_DIR, file, section.anchor));
        }

        build_catalog(&section.children, book, depth + 1, max_depth, &mut point.children);
        points.push(point);
    }
}

fn creator(person: &Person, role: &str, index: usize) -> MetadataItem {
    let mut item = MetadataItem::new("creator", &person.display_name());
    item.with_id(&format!("creator-{:02}", index))
        .append_refinement(MetadataRefinement::new("role", role).with_scheme("marc:relators"))
        .append_refinement(MetadataRefinement::new("file-as", &person.file_as()));

    item
}

/// Parse a document date ("2004", "2004-05" or "2004-05-17")
fn parse_source_date(date: &str) -> Option<DateTime<Utc>> {
    let date = date.trim();
    let parsed = match date.len() {
        4 => NaiveDate::from_ymd_opt(date.parse().ok()?, 1, 1),
        7 => NaiveDate::parse_from_str(&format!("{}-01", date), "%Y-%m-%d").ok(),
        _ => NaiveDate::parse_from_str(date.get(..10)?, "%Y-%m-%d").ok(),
    }?;

    Some(parsed.and_hms_opt(0, 0, 0)?.and_utc())
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use zip::{CompressionMethod, ZipArchive};

    use crate::{
        builder::{
            EpubBuilder, PackageAssembler, content::ContentRenderer, nav_relative,
            parse_source_date, refine_mime_type, style::Stylesheet,
        },
        config::{ConversionConfig, ModifiedDate},
        error::{ConvertError, PackagingError},
        parser::Fb2Parser,
        report::Diagnostics,
        types::{ManifestItem, MetadataItem, NavPoint, SpineItem},
        utils::{XmlElement, XmlReader},
    };

    const PNG_BASE64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    fn read_entry(archive: &[u8], name: &str) -> String {
        let mut archive = ZipArchive::new(Cursor::new(archive)).unwrap();
        let mut content = String::new();
        archive.by_name(name).unwrap().read_to_string(&mut content).unwrap();
        content
    }

    fn read_xml(archive: &[u8], name: &str) -> XmlElement {
        XmlReader::parse(&read_entry(archive, name)).unwrap()
    }

    fn minimal_builder() -> EpubBuilder {
        let mut builder = EpubBuilder::new();
        builder
            .add_metadata(MetadataItem::new("title", "Test Book"))
            .add_metadata(MetadataItem::new("language", "en"))
            .add_metadata(MetadataItem::new("identifier", "test-id").with_id("pub-id").build())
            .add_spine(SpineItem::new("chapter"))
            .add_catalog_item(NavPoint::new("Chapter").with_content("Text/chapter.xhtml"));
        builder
            .add_manifest(
                b"<html/>".to_vec(),
                ManifestItem::new("chapter", "Text/chapter.xhtml").unwrap(),
            )
            .unwrap();

        builder
    }

    fn convert(source: &str, config: &ConversionConfig) -> (Vec<u8>, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let document = Fb2Parser::new(config)
            .parse(source.as_bytes(), &mut diagnostics)
            .unwrap();
        let book = ContentRenderer::new(&document, config)
            .render(&mut diagnostics)
            .unwrap();
        let archive = PackageAssembler::new(&document, config)
            .assemble(book, Stylesheet::default(), &mut diagnostics)
            .unwrap();

        (archive, diagnostics)
    }

    fn sample(description: &str) -> String {
        format!(
            r##"<?xml version="1.0" encoding="UTF-8"?>
<FictionBook xmlns="http://www.gribuser.ru/xml/fictionbook/2.0" xmlns:l="http://www.w3.org/1999/xlink">
<description><title-info><book-title>Sample</book-title>{}</title-info></description>
<body>
  <section id="ch1">
    <title><p>Chapter 1</p></title>
    <p>First paragraph<a l:href="#n1" type="note">1</a>.</p>
    <p>Second paragraph.</p>
  </section>
</body>
<body name="notes"><section id="n1"><p>The note.</p></section></body>
<binary id="cover.png" content-type="image/png">{}</binary>
</FictionBook>"##,
            description, PNG_BASE64
        )
    }

    mod epub_builder_tests {
        use std::io::Cursor;

        use zip::{CompressionMethod, ZipArchive};

        use crate::{
            builder::{
                EpubBuilder,
                tests::{minimal_builder, read_entry, read_xml},
            },
            error::{ConvertError, PackagingError},
            types::{ManifestItem, MetadataItem, NavPoint, SpineItem},
        };

        /// Test the archive layout of a minimal package
        #[test]
        fn test_make_layout() {
            let archive = minimal_builder().make().unwrap();

            let mut zip = ZipArchive::new(Cursor::new(archive.as_slice())).unwrap();
            let first = zip.by_index(0).unwrap();
            assert_eq!(first.name(), "mimetype");
            assert_eq!(first.compression(), CompressionMethod::Stored);
            drop(first);

            let names = zip.file_names().collect::<Vec<_>>();
            assert!(names.contains(&"META-INF/container.xml"));
            assert!(names.contains(&"OEBPS/content.opf"));
            assert!(names.contains(&"OEBPS/Text/chapter.xhtml"));
            assert!(names.contains(&"OEBPS/Text/nav.xhtml"));
            assert!(names.contains(&"OEBPS/toc.ncx"));

            assert_eq!(read_entry(&archive, "mimetype"), "application/epub+zip");

            let container = read_xml(&archive, "META-INF/container.xml");
            let rootfile = container.find_elements_by_name("rootfile")[0];
            assert_eq!(rootfile.get_attr("full-path").as_deref(), Some("OEBPS/content.opf"));

            let package = read_xml(&archive, "OEBPS/content.opf");
            assert_eq!(package.get_attr("unique-identifier").as_deref(), Some("pub-id"));
            let modified = package
                .find_elements_by_name("meta")
                .into_iter()
                .find(|meta| meta.get_attr("property").as_deref() == Some("dcterms:modified"))
                .unwrap();
            assert_eq!(modified.text(), "1970-01-01T00:00:00Z");

            let chapter = package
                .find_elements_by_name("item")
                .into_iter()
                .find(|item| item.get_attr("id").as_deref() == Some("chapter"))
                .unwrap();
            // inferred from the extension
            assert_eq!(
                chapter.get_attr("media-type").as_deref(),
                Some("application/xhtml+xml")
            );

            let spine = package.find_elements_by_name("spine")[0];
            assert_eq!(spine.get_attr("toc").as_deref(), Some("ncx"));
        }

        #[test]
        fn test_make_without_metadata() {
            let mut builder = EpubBuilder::new();
            builder
                .add_metadata(MetadataItem::new("title", "Test Book"))
                .add_spine(SpineItem::new("chapter"))
                .add_catalog_item(NavPoint::new("Chapter"));

            assert_eq!(
                builder.make().unwrap_err(),
                ConvertError::PackagingError {
                    source: PackagingError::MissingNecessaryMetadata
                }
            );
        }

        #[test]
        fn test_make_without_catalog() {
            let mut builder = minimal_builder();
            builder.set_catalog(vec![]);

            assert_eq!(
                builder.make().unwrap_err(),
                ConvertError::PackagingError {
                    source: PackagingError::NavigationInfoUninitialized
                }
            );
        }

        /// Test the spine and manifest consistency checks
        #[test]
        fn test_make_with_inconsistent_spine() {
            let mut builder = minimal_builder();
            builder.add_spine(SpineItem::new("missing"));

            assert_eq!(
                builder.make().unwrap_err(),
                ConvertError::PackagingError {
                    source: PackagingError::SpineItemNotInManifest {
                        idref: "missing".to_string()
                    }
                }
            );

            let mut builder = minimal_builder();
            builder
                .add_manifest(
                    b"<html/>".to_vec(),
                    ManifestItem::new("second-nav", "Text/other.xhtml")
                        .unwrap()
                        .append_property("nav"),
                )
                .unwrap();
            assert_eq!(
                builder.make().unwrap_err(),
                ConvertError::PackagingError {
                    source: PackagingError::TooManyNavFlags
                }
            );
        }

        #[test]
        fn test_add_duplicate_manifest() {
            let mut builder = minimal_builder();
            let result = builder.add_manifest(
                vec![],
                ManifestItem::new("chapter", "Text/again.xhtml").unwrap(),
            );

            assert!(matches!(
                result,
                Err(ConvertError::PackagingError {
                    source: PackagingError::DuplicateManifestId { .. }
                })
            ));
        }

        /// Test that navigation document and NCX are generated from the same catalog
        #[test]
        fn test_nav_and_ncx_consistency() {
            let mut builder = minimal_builder();
            let mut part = NavPoint::new("Part").with_content("Text/chapter.xhtml#part");
            part.children
                .push(NavPoint::new("Inner").with_content("Text/chapter.xhtml#inner"));
            builder.add_catalog_item(part);

            let archive = builder.make().unwrap();
            let nav = read_xml(&archive, "OEBPS/Text/nav.xhtml");
            let ncx = read_xml(&archive, "OEBPS/toc.ncx");

            let nav_labels = nav
                .find_elements_by_name("a")
                .into_iter()
                .map(|a| a.text())
                .collect::<Vec<_>>();
            let ncx_labels = ncx
                .find_elements_by_name("navLabel")
                .into_iter()
                .map(|label| label.text())
                .collect::<Vec<_>>();
            assert_eq!(nav_labels, vec!["Chapter", "Part", "Inner"]);
            assert_eq!(nav_labels, ncx_labels);

            let nav_hrefs = nav
                .find_elements_by_name("a")
                .into_iter()
                .filter_map(|a| a.get_attr("href"))
                .collect::<Vec<_>>();
            let ncx_srcs = ncx
                .find_elements_by_name("content")
                .into_iter()
                .filter_map(|content| content.get_attr("src"))
                .map(|src| src.trim_start_matches("Text/").to_string())
                .collect::<Vec<_>>();
            assert_eq!(nav_hrefs, ncx_srcs);

            let orders = ncx
                .find_elements_by_name("navPoint")
                .into_iter()
                .filter_map(|point| point.get_attr("playOrder"))
                .collect::<Vec<_>>();
            assert_eq!(orders, vec!["1", "2", "3"]);
        }
    }

    /// Test the package of the sample book
    #[test]
    fn test_assemble_sample() {
        let (archive, diagnostics) = convert(&sample(""), &ConversionConfig::default());
        assert!(diagnostics.is_empty());

        let package = read_xml(&archive, "OEBPS/content.opf");
        let items = package.find_elements_by_name("item");
        let documents = items
            .iter()
            .filter(|item| item.get_attr("media-type").as_deref() == Some("application/xhtml+xml"))
            .filter(|item| !item.get_attr("properties").is_some_and(|p| p.contains("nav")))
            .filter_map(|item| item.get_attr("id"))
            .collect::<Vec<_>>();
        assert_eq!(documents, vec!["chapter-001", "notes"]);

        let itemrefs = package.find_elements_by_name("itemref");
        assert_eq!(itemrefs.len(), 2);
        assert_eq!(itemrefs[1].get_attr("linear").as_deref(), Some("no"));

        let language = package.find_elements_by_name("language")[0];
        assert_eq!(language.text(), "en");

        let nav = read_xml(&archive, "OEBPS/Text/nav.xhtml");
        let toc = nav
            .find_elements_by_name("nav")
            .into_iter()
            .find(|nav| nav.get_attr("epub:type").as_deref() == Some("toc"))
            .unwrap();
        let entries = toc.find_elements_by_name("a");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text(), "Chapter 1");
        assert_eq!(
            entries[0].get_attr("href").as_deref(),
            Some("chapter-001.xhtml#ch1")
        );

        let ncx = read_xml(&archive, "OEBPS/toc.ncx");
        let points = ncx.find_elements_by_name("navPoint");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].find_elements_by_name("text")[0].text(), "Chapter 1");
        assert_eq!(
            points[0].find_elements_by_name("content")[0].get_attr("src").as_deref(),
            Some("Text/chapter-001.xhtml#ch1")
        );

        // the unreferenced binary is not packaged
        assert!(
            !items
                .iter()
                .any(|item| item.get_attr("media-type").as_deref() == Some("image/png"))
        );
    }

    /// Test the cover image declarations
    #[test]
    fn test_assemble_cover() {
        let source = sample(r##"<coverpage><image l:href="#cover.png"/></coverpage>"##);
        let (archive, _) = convert(&source, &ConversionConfig::default());

        let package = read_xml(&archive, "OEBPS/content.opf");
        let cover = package
            .find_elements_by_name("item")
            .into_iter()
            .find(|item| item.get_attr("media-type").as_deref() == Some("image/png"))
            .unwrap();
        assert_eq!(cover.get_attr("id").as_deref(), Some("cover-image"));
        assert_eq!(cover.get_attr("href").as_deref(), Some("Images/cover.png"));
        assert_eq!(cover.get_attr("properties").as_deref(), Some("cover-image"));

        let meta = package
            .find_elements_by_name("meta")
            .into_iter()
            .find(|meta| meta.get_attr("name").as_deref() == Some("cover"))
            .unwrap();
        assert_eq!(meta.get_attr("content").as_deref(), Some("cover-image"));

        let guide = package.find_elements_by_name("reference");
        assert_eq!(guide[0].get_attr("type").as_deref(), Some("cover"));
        assert_eq!(guide[0].get_attr("href").as_deref(), Some("Text/cover.xhtml"));

        let mut zip = ZipArchive::new(Cursor::new(archive.as_slice())).unwrap();
        let mut data = Vec::new();
        zip.by_name("OEBPS/Images/cover.png")
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(&data[1..4], b"PNG");
    }

    /// Test that converting the same input twice yields identical archives
    #[test]
    fn test_assemble_deterministic() {
        let source = sample(
            r##"<author><first-name>Jane</first-name><last-name>Doe</last-name></author>
                <coverpage><image l:href="#cover.png"/></coverpage><date value="2004-05-17"/>"##,
        );
        let config = ConversionConfig::default();

        let (first, _) = convert(&source, &config);
        let (second, _) = convert(&source, &config);
        assert_eq!(first, second);

        let package = read_xml(&first, "OEBPS/content.opf");
        let modified = package
            .find_elements_by_name("meta")
            .into_iter()
            .find(|meta| meta.get_attr("property").as_deref() == Some("dcterms:modified"))
            .unwrap();
        assert_eq!(modified.text(), "2004-05-17T00:00:00Z");

        let mut zip = ZipArchive::new(Cursor::new(first.as_slice())).unwrap();
        assert_eq!(zip.by_index(0).unwrap().compression(), CompressionMethod::Stored);
    }

    /// Test creator and series metadata
    #[test]
    fn test_assemble_metadata() {
        let source = sample(
            r#"<author><first-name>Jane</first-name><last-name>Doe</last-name></author>
               <translator><first-name>Ivan</first-name><last-name>Petrov</last-name></translator>
               <genre>sf</genre><lang>ru</lang><sequence name="Saga" number="2"/>"#,
        );
        let (archive, _) = convert(&source, &ConversionConfig::default());
        let package = read_xml(&archive, "OEBPS/content.opf");

        let creators = package.find_elements_by_name("creator");
        assert_eq!(creators.len(), 2);
        assert_eq!(creators[0].text(), "Jane Doe");

        let refinements = package
            .find_elements_by_name("meta")
            .into_iter()
            .filter(|meta| meta.get_attr("refines").is_some())
            .map(|meta| (meta.get_attr("property").unwrap_or_default(), meta.text()))
            .collect::<Vec<_>>();
        assert!(refinements.contains(&("role".to_string(), "aut".to_string())));
        assert!(refinements.contains(&("role".to_string(), "trl".to_string())));
        assert!(refinements.contains(&("file-as".to_string(), "Doe, Jane".to_string())));
        assert!(refinements.contains(&("group-position".to_string(), "2".to_string())));

        assert_eq!(package.find_elements_by_name("subject")[0].text(), "sf");
        assert_eq!(package.find_elements_by_name("language")[0].text(), "ru");

        // localized navigation title
        let nav = read_xml(&archive, "OEBPS/Text/nav.xhtml");
        assert_eq!(nav.find_elements_by_name("h1")[0].text(), "Содержание");
    }

    /// Test the TOC of untitled and deeply nested sections
    #[test]
    fn test_catalog_policies() {
        let source = r#"<FictionBook><body>
              <section><title><p>Part</p></title>
                <section><title><p>Chapter</p></title><p>a</p></section>
              </section>
              <section><section><title><p>Lifted</p></title><p>b</p></section></section>
            </body></FictionBook>"#;

        let (archive, _) = convert(source, &ConversionConfig::default());
        let ncx = read_xml(&archive, "OEBPS/toc.ncx");
        let labels = ncx
            .find_elements_by_name("text")
            .into_iter()
            .skip(1)
            .map(|text| text.text())
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["Part", "Chapter", "Lifted"]);

        let config = ConversionConfig::builder().toc_depth(1).build().unwrap();
        let (archive, _) = convert(source, &config);
        let nav = read_xml(&archive, "OEBPS/Text/nav.xhtml");
        let toc = nav
            .find_elements_by_name("nav")
            .into_iter()
            .find(|nav| nav.get_attr("epub:type").as_deref() == Some("toc"))
            .unwrap();
        let labels = toc
            .find_elements_by_name("a")
            .into_iter()
            .map(|a| a.text())
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["Part", "Lifted"]);
        assert_eq!(read_xml(&archive, "OEBPS/toc.ncx").find_elements_by_name("navPoint").len(), 2);
    }

    /// Test the single entry TOC of a book without titled sections
    #[test]
    fn test_catalog_without_titles() {
        let source = r#"<FictionBook><description><title-info><book-title>Plain</book-title></title-info></description>
            <body><section><p>text</p></section></body></FictionBook>"#;
        let (archive, _) = convert(source, &ConversionConfig::default());

        let ncx = read_xml(&archive, "OEBPS/toc.ncx");
        let points = ncx.find_elements_by_name("navPoint");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].find_elements_by_name("text")[0].text(), "Plain");
        assert_eq!(
            points[0].find_elements_by_name("content")[0].get_attr("src").as_deref(),
            Some("Text/chapter-001.xhtml")
        );
    }

    /// Test the copyright page entry of the guide and the landmarks
    #[test]
    fn test_assemble_copyright_page() {
        let source = sample("").replace(
            "</description>",
            "<publish-info><publisher>ACME</publisher></publish-info></description>",
        );
        let config = ConversionConfig::builder().copyright_page(true).build().unwrap();
        let (archive, _) = convert(&source, &config);

        let package = read_xml(&archive, "OEBPS/content.opf");
        let reference = package
            .find_elements_by_name("reference")
            .into_iter()
            .find(|reference| reference.get_attr("type").as_deref() == Some("copyright-page"))
            .unwrap();
        assert_eq!(reference.get_attr("href").as_deref(), Some("Text/copyright.xhtml"));

        let spine = package
            .find_elements_by_name("itemref")
            .into_iter()
            .filter_map(|itemref| itemref.get_attr("idref"))
            .collect::<Vec<_>>();
        assert_eq!(spine, vec!["chapter-001", "copyright", "notes"]);

        let nav = read_xml(&archive, "OEBPS/Text/nav.xhtml");
        let landmark = nav
            .find_elements_by_name("a")
            .into_iter()
            .find(|a| a.get_attr("epub:type").as_deref() == Some("copyright-page"))
            .unwrap();
        assert_eq!(landmark.get_attr("href").as_deref(), Some("copyright.xhtml"));
        assert_eq!(landmark.text(), "Copyright");
    }

    /// Test that footnote references in titles stay out of TOC labels
    #[test]
    fn test_catalog_labels_without_note_refs() {
        let source = r##"<FictionBook xmlns:l="http://www.w3.org/1999/xlink"><body>
              <section id="ch1"><title><p>Chapter 1<a l:href="#n1" type="note">[1]</a></p></title><p>a</p></section>
            </body>
            <body name="notes"><section id="n1"><p>The note.</p></section></body></FictionBook>"##;

        let (archive, _) = convert(source, &ConversionConfig::default());

        let nav = read_xml(&archive, "OEBPS/Text/nav.xhtml");
        let toc = nav
            .find_elements_by_name("nav")
            .into_iter()
            .find(|nav| nav.get_attr("epub:type").as_deref() == Some("toc"))
            .unwrap();
        let nav_labels = toc
            .find_elements_by_name("a")
            .into_iter()
            .map(|a| a.text())
            .collect::<Vec<_>>();
        assert_eq!(nav_labels, vec!["Chapter 1"]);

        let ncx = read_xml(&archive, "OEBPS/toc.ncx");
        let ncx_labels = ncx
            .find_elements_by_name("text")
            .into_iter()
            .skip(1)
            .map(|text| text.text())
            .collect::<Vec<_>>();
        assert_eq!(ncx_labels, vec!["Chapter 1"]);

        // the heading itself keeps its note reference
        let chapter = read_entry(&archive, "OEBPS/Text/chapter-001.xhtml");
        assert!(chapter.contains("[1]"));
    }

    #[test]
    fn test_fixed_modified_date() {
        let date = parse_source_date("2020-02-03").unwrap();
        let config = ConversionConfig::builder()
            .modified(ModifiedDate::Fixed(date))
            .build()
            .unwrap();
        let (archive, _) = convert(&sample(""), &config);

        let package = read_entry(&archive, "OEBPS/content.opf");
        assert!(package.contains("2020-02-03T00:00:00Z"));
    }

    #[test]
    fn test_parse_source_date() {
        assert_eq!(
            parse_source_date("1999").unwrap().to_rfc3339(),
            "1999-01-01T00:00:00+00:00"
        );
        assert_eq!(
            parse_source_date("1999-07").unwrap().to_rfc3339(),
            "1999-07-01T00:00:00+00:00"
        );
        assert!(parse_source_date("summer").is_none());
    }

    #[test]
    fn test_nav_relative() {
        assert_eq!(nav_relative("Text/chapter-001.xhtml#a"), "chapter-001.xhtml#a");
        assert_eq!(nav_relative("Images/cover.png"), "../Images/cover.png");
    }

    #[test]
    fn test_refine_mime_type() {
        assert_eq!(refine_mime_type("text/xml", "xhtml"), "application/xhtml+xml");
        assert_eq!(refine_mime_type("application/octet-stream", "css"), "text/css");
        assert_eq!(refine_mime_type("image/png", "png"), "image/png");
    }

    /// Test that a package error surfaces as a fatal error
    #[test]
    fn test_packaging_error_is_fatal() {
        let err: ConvertError = PackagingError::EmptySpine.into();
        assert!(err.is_fatal());
    }
}
