//! EPUB package types
//!
//! Plain data types describing the package document (OPF) and navigation
//! structures written by [`crate::builder::EpubBuilder`].

use crate::error::PackagingError;

/// Represents a metadata item in the EPUB publication
///
/// Items whose property belongs to the Dublin Core namespace are written as
/// `dc:*` elements, every other item is written as a `meta` element carrying
/// the property as attribute.
///
/// In EPUB 3.0, metadata items can have refinements that provide additional details about
/// the main metadata item, for example the role of a creator.
#[derive(Debug, Clone)]
pub struct MetadataItem {
    /// Optional unique identifier for this metadata item
    ///
    /// Required for items that have refinements.
    pub id: Option<String>,

    /// The metadata property name, e.g. "title", "creator" or "dcterms:modified"
    pub property: String,

    /// The metadata value
    pub value: String,

    /// Refinements of this metadata item
    pub refined: Vec<MetadataRefinement>,
}

impl MetadataItem {
    pub fn new(property: &str, value: &str) -> Self {
        Self {
            id: None,
            property: property.to_string(),
            value: value.to_string(),
            refined: vec![],
        }
    }

    pub fn with_id(&mut self, id: &str) -> &mut Self {
        self.id = Some(id.to_string());
        self
    }

    /// Append a refinement
    ///
    /// Refinements are only written when the item has an id.
    pub fn append_refinement(&mut self, refinement: MetadataRefinement) -> &mut Self {
        self.refined.push(refinement);
        self
    }

    pub fn build(&self) -> Self {
        self.clone()
    }

    /// Whether the item is written as a `dc:*` element
    pub fn is_dublin_core(&self) -> bool {
        ELEMENT_IN_DC_NAMESPACE.contains(&self.property.as_str())
    }

    /// Attributes of the metadata element
    pub fn attributes(&self) -> Vec<(&str, &str)> {
        let mut attributes = Vec::new();

        if !self.is_dublin_core() {
            attributes.push(("property", self.property.as_str()));
        }

        if let Some(id) = &self.id {
            attributes.push(("id", id.as_str()));
        }

        attributes
    }
}

/// Elements of the Dublin Core namespace that may appear in the package metadata
pub(crate) const ELEMENT_IN_DC_NAMESPACE: [&str; 15] = [
    "contributor",
    "coverage",
    "creator",
    "date",
    "description",
    "format",
    "identifier",
    "language",
    "publisher",
    "relation",
    "rights",
    "source",
    "subject",
    "title",
    "type",
];

/// Represents a refinement of a metadata item in an EPUB 3.0 publication
///
/// Written as a `meta` element whose `refines` attribute points to the id of
/// the parent metadata item.
#[derive(Debug, Clone)]
pub struct MetadataRefinement {
    /// The refinement property name, e.g. "role", "file-as" or "title-type"
    pub property: String,

    /// The refinement value
    pub value: String,

    /// Optional scheme identifier for this refinement, e.g. "marc:relators"
    pub scheme: Option<String>,
}

impl MetadataRefinement {
    pub fn new(property: &str, value: &str) -> Self {
        Self {
            property: property.to_string(),
            value: value.to_string(),
            scheme: None,
        }
    }

    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = Some(scheme.to_string());
        self
    }

    /// Attributes of the refinement element
    ///
    /// ## Parameters
    /// - `refines`: The id reference of the parent item, including the leading '#'
    pub fn attributes<'a>(&'a self, refines: &'a str) -> Vec<(&'a str, &'a str)> {
        let mut attributes = vec![
            ("refines", refines),
            ("property", self.property.as_str()),
        ];

        if let Some(scheme) = &self.scheme {
            attributes.push(("scheme", scheme.as_str()));
        }

        attributes
    }
}

/// Represents a resource item declared in the EPUB manifest
#[derive(Debug, Clone)]
pub struct ManifestItem {
    /// The unique id of the resource
    pub id: String,

    /// The path to the resource file, relative to the package document
    pub path: String,

    /// The media type of the resource
    pub mime: String,

    /// Optional space-separated list of properties, such as "nav" or "cover-image"
    pub properties: Option<String>,
}

impl ManifestItem {
    /// Create a new manifest item
    ///
    /// ## Return
    /// - `Ok(ManifestItem)`: The item was created
    /// - `Err(PackagingError)`: The path starts with "../" or "/", which would
    ///   point outside the package
    pub fn new(id: &str, path: &str) -> Result<Self, PackagingError> {
        if path.starts_with("../") || path.starts_with('/') {
            return Err(PackagingError::IllegalManifestPath {
                manifest_id: id.to_string(),
            });
        }

        Ok(Self {
            id: id.to_string(),
            path: path.to_string(),
            mime: String::new(),
            properties: None,
        })
    }

    pub fn set_mime(mut self, mime: &str) -> Self {
        self.mime = mime.to_string();
        self
    }

    pub fn append_property(mut self, property: &str) -> Self {
        self.properties = match self.properties {
            Some(properties) => Some(format!("{} {}", properties, property)),
            None => Some(property.to_string()),
        };
        self
    }

    /// Whether the item carries the specified property
    pub fn has_property(&self, property: &str) -> bool {
        self.properties
            .as_ref()
            .is_some_and(|properties| properties.split_whitespace().any(|p| p == property))
    }

    /// Attributes of the `item` element
    pub fn attributes(&self) -> Vec<(&str, &str)> {
        let mut attributes = vec![
            ("id", self.id.as_str()),
            ("href", self.path.as_str()),
            ("media-type", self.mime.as_str()),
        ];

        if let Some(properties) = &self.properties {
            attributes.push(("properties", properties.as_str()));
        }

        attributes
    }
}

/// Represents an item in the EPUB spine, defining the reading order of the publication
///
/// Non-linear items, such as a pop-up footnote document, are reachable through
/// links but are not part of the main reading flow.
#[derive(Debug, Clone)]
pub struct SpineItem {
    /// The ID reference to a manifest item
    pub idref: String,

    /// Indicates whether this item is part of the linear reading order
    pub linear: bool,
}

impl SpineItem {
    pub fn new(idref: &str) -> Self {
        Self {
            idref: idref.to_string(),
            linear: true,
        }
    }

    pub fn non_linear(mut self) -> Self {
        self.linear = false;
        self
    }

    /// Attributes of the `itemref` element
    pub fn attributes(&self) -> Vec<(&str, &str)> {
        let mut attributes = vec![("idref", self.idref.as_str())];
        if !self.linear {
            attributes.push(("linear", "no"));
        }

        attributes
    }
}

/// A structural landmark of the book
///
/// Written both as an EPUB 2 `guide` reference and as an entry of the
/// EPUB 3 `landmarks` navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Landmark {
    /// The `epub:type` used by the landmarks navigation, e.g. "bodymatter"
    pub epub_type: String,

    /// The guide reference type, e.g. "text"
    pub guide_type: String,

    pub title: String,

    /// Path relative to the package document
    pub href: String,
}

impl Landmark {
    pub fn new(epub_type: &str, guide_type: &str, title: &str, href: &str) -> Self {
        Self {
            epub_type: epub_type.to_string(),
            guide_type: guide_type.to_string(),
            title: title.to_string(),
            href: href.to_string(),
        }
    }
}

/// Represents a navigation point in the table of contents
///
/// The same catalog of navigation points produces both the EPUB 3 navigation
/// document and the EPUB 2 NCX file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavPoint {
    /// The display label of this navigation point
    pub label: String,

    /// The referenced content, relative to the package document,
    /// including an optional fragment
    pub content: Option<String>,

    /// Child navigation points (sub-sections)
    pub children: Vec<NavPoint>,

    /// The reading order position of this navigation point
    pub play_order: Option<usize>,
}

impl NavPoint {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            content: None,
            children: vec![],
            play_order: None,
        }
    }

    pub fn with_content(mut self, content: &str) -> Self {
        self.content = Some(content.to_string());
        self
    }

    /// Depth of this subtree, 1 for a leaf
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(NavPoint::depth).max().unwrap_or(0)
    }

    /// Assign play orders in depth-first order, starting at `next`
    ///
    /// Returns the next unused play order.
    pub fn assign_play_order(points: &mut [NavPoint], mut next: usize) -> usize {
        for point in points.iter_mut() {
            point.play_order = Some(next);
            next = Self::assign_play_order(&mut point.children, next + 1);
        }

        next
    }
}

#[cfg(test)]
mod tests {
    mod metadata_tests {
        use crate::types::{MetadataItem, MetadataRefinement};

        /// Test attributes of Dublin Core and meta items
        #[test]
        fn test_metadata_attributes() {
            let title = MetadataItem::new("title", "Sample")
                .with_id("main-title")
                .build();
            assert!(title.is_dublin_core());
            assert_eq!(
                title.attributes(),
                vec![("id", "main-title")]
            );

            let modified = MetadataItem::new("dcterms:modified", "1970-01-01T00:00:00Z");
            assert!(!modified.is_dublin_core());
            assert_eq!(modified.attributes(), vec![("property", "dcterms:modified")]);
        }

        #[test]
        fn test_refinement_attributes() {
            let role = MetadataRefinement::new("role", "aut").with_scheme("marc:relators");
            assert_eq!(
                role.attributes("#creator-1"),
                vec![
                    ("refines", "#creator-1"),
                    ("property", "role"),
                    ("scheme", "marc:relators")
                ]
            );
        }
    }

    mod manifest_tests {
        use crate::{error::PackagingError, types::ManifestItem};

        /// Test rejection of paths leaving the package
        #[test]
        fn test_manifest_item_illegal_path() {
            let result = ManifestItem::new("bad", "../outside.xhtml");
            assert_eq!(
                result.unwrap_err(),
                PackagingError::IllegalManifestPath {
                    manifest_id: "bad".to_string()
                }
            );

            assert!(ManifestItem::new("bad", "/root.xhtml").is_err());
        }

        #[test]
        fn test_manifest_item_properties() {
            let item = ManifestItem::new("cover-image", "Images/cover.png")
                .unwrap()
                .set_mime("image/png")
                .append_property("cover-image")
                .append_property("svg");

            assert!(item.has_property("cover-image"));
            assert!(!item.has_property("nav"));
            assert_eq!(
                item.attributes(),
                vec![
                    ("id", "cover-image"),
                    ("href", "Images/cover.png"),
                    ("media-type", "image/png"),
                    ("properties", "cover-image svg"),
                ]
            );
        }
    }

    mod spine_tests {
        use crate::types::SpineItem;

        #[test]
        fn test_spine_item_linear() {
            assert_eq!(SpineItem::new("c1").attributes(), vec![("idref", "c1")]);
            assert_eq!(
                SpineItem::new("notes").non_linear().attributes(),
                vec![("idref", "notes"), ("linear", "no")]
            );
        }
    }

    mod navpoint_tests {
        use crate::types::NavPoint;

        /// Testing the equality comparison of NavPoint
        #[test]
        fn test_navpoint_partial_eq() {
            let mut nav1 = NavPoint::new("Chapter 1").with_content("Text/chapter-001.xhtml");
            let mut nav2 = NavPoint::new("Chapter 1").with_content("Text/chapter-002.xhtml");
            let mut nav3 = NavPoint::new("Chapter 2").with_content("Text/chapter-001.xhtml");
            nav1.play_order = Some(1);
            nav2.play_order = Some(1);
            nav3.play_order = Some(2);

            assert_eq!(nav1, nav2); // Same play_order, different contents, should be equal
            assert_ne!(nav1, nav3); // Different play_order, Same contents, should be unequal
        }

        /// Test depth-first play order assignment
        #[test]
        fn test_assign_play_order() {
            let mut chapter1 = NavPoint::new("Chapter 1");
            chapter1.children = vec![NavPoint::new("1.1"), NavPoint::new("1.2")];
            let mut points = vec![chapter1, NavPoint::new("Chapter 2")];

            let next = NavPoint::assign_play_order(&mut points, 1);

            assert_eq!(next, 5);
            assert_eq!(points[0].play_order, Some(1));
            assert_eq!(points[0].children[0].play_order, Some(2));
            assert_eq!(points[0].children[1].play_order, Some(3));
            assert_eq!(points[1].play_order, Some(4));
        }

        #[test]
        fn test_navpoint_depth() {
            let mut section = NavPoint::new("1.1");
            section.children.push(NavPoint::new("1.1.1"));
            let mut chapter = NavPoint::new("1");
            chapter.children.push(section);

            assert_eq!(NavPoint::new("2").depth(), 1);
            assert_eq!(chapter.depth(), 3);
        }
    }
}
