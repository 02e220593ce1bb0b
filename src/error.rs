//! Error Type Definition Module
//!
//! This module defines the error types that may be encountered while converting
//! an FB2 document into an EPUB package. All errors are uniformly wrapped in the
//! `ConvertError` enumeration for convenient error handling by the caller.
//!
//! ## Main Error Types
//!
//! - [ConvertError] - Enumeration of errors during conversion
//! - [PackagingError] - Specific errors raised while assembling the EPUB container
//!
//! Only some of the variants are fatal. `UnsupportedStructure` and
//! `ResourceResolution` are raised locally by the parser and renderer, caught
//! at the nearest block boundary and turned into warnings of the per-file report.

use thiserror::Error;

/// Types of errors that can occur during conversion
#[derive(Debug, Error)]
pub enum ConvertError {
    /// ZIP archive related errors
    ///
    /// Raised while writing the EPUB container.
    #[error("Archive error: {source}")]
    ArchiveError { source: zip::result::ZipError },

    /// The conversion was cancelled before it started
    #[error("Cancelled: The conversion was cancelled before it started.")]
    Cancelled,

    /// Encoding error
    ///
    /// The byte stream cannot be decoded with the encoding declared by the
    /// document, or the declared encoding is unknown.
    #[error("Encoding error: Unable to decode input declared as \"{declared}\": {reason}")]
    EncodingError { declared: String, reason: String },

    /// Invalid configuration error
    ///
    /// Raised by [`crate::config::ConversionConfigBuilder::build`] for options
    /// that cannot be honoured.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// IO error
    ///
    /// Raised while reading the input. Failures writing the output are
    /// reported as [PackagingError::WriteFailed].
    #[error("IO error: {source}")]
    IOError { source: std::io::Error },

    /// Malformed input error
    ///
    /// The input is not well-formed XML or is not a FictionBook document.
    #[error("Malformed input: {reason}")]
    MalformedInput { reason: String },

    /// A conversion panicked
    ///
    /// Batch workers catch panics of a single file and record them as failures.
    #[error("Conversion panicked: {reason}")]
    Panicked { reason: String },

    #[error("Packaging error: {source}")]
    PackagingError { source: PackagingError },

    /// QuickXml error
    ///
    /// This error occurs when parsing or writing XML data using the QuickXml library.
    #[error("QuickXml error: {source}")]
    QuickXmlError { source: quick_xml::Error },

    /// Unresolvable reference
    ///
    /// A link, image or cover points to an id that does not exist in the document.
    #[error("Resource resolution error: Unable to resolve reference \"{reference}\".")]
    ResourceResolution { reference: String },

    /// Unsupported structure
    ///
    /// An element has no rendering rule.
    #[error("Unsupported structure: The \"{element}\" element has no rendering rule.")]
    UnsupportedStructure { element: String },

    /// WalkDir error
    ///
    /// This error occurs when traversing an input directory of a batch.
    #[cfg(feature = "batch")]
    #[error("WalkDir error: {source}")]
    WalkDirError { source: walkdir::Error },
}

/// Coarse classification of a [ConvertError], as recorded in conversion reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Cancelled,
    Encoding,
    InvalidConfig,
    Io,
    MalformedInput,
    Packaging,
    Panicked,
    ResourceResolution,
    UnsupportedStructure,
}

impl ConvertError {
    /// Returns the report classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::ArchiveError { .. } | ConvertError::PackagingError { .. } => {
                ErrorKind::Packaging
            }
            ConvertError::Cancelled => ErrorKind::Cancelled,
            ConvertError::EncodingError { .. } => ErrorKind::Encoding,
            ConvertError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            ConvertError::IOError { .. } => ErrorKind::Io,
            ConvertError::MalformedInput { .. } | ConvertError::QuickXmlError { .. } => {
                ErrorKind::MalformedInput
            }
            ConvertError::Panicked { .. } => ErrorKind::Panicked,
            ConvertError::ResourceResolution { .. } => ErrorKind::ResourceResolution,
            ConvertError::UnsupportedStructure { .. } => ErrorKind::UnsupportedStructure,
            #[cfg(feature = "batch")]
            ConvertError::WalkDirError { .. } => ErrorKind::Io,
        }
    }

    /// Whether the error aborts the conversion of the current file
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::UnsupportedStructure | ErrorKind::ResourceResolution
        )
    }
}

impl From<zip::result::ZipError> for ConvertError {
    fn from(value: zip::result::ZipError) -> Self {
        ConvertError::ArchiveError { source: value }
    }
}

impl From<quick_xml::Error> for ConvertError {
    fn from(value: quick_xml::Error) -> Self {
        ConvertError::QuickXmlError { source: value }
    }
}

impl From<std::io::Error> for ConvertError {
    fn from(value: std::io::Error) -> Self {
        ConvertError::IOError { source: value }
    }
}

impl From<PackagingError> for ConvertError {
    fn from(value: PackagingError) -> Self {
        ConvertError::PackagingError { source: value }
    }
}

#[cfg(feature = "batch")]
impl From<walkdir::Error> for ConvertError {
    fn from(value: walkdir::Error) -> Self {
        ConvertError::WalkDirError { source: value }
    }
}

#[cfg(test)]
impl PartialEq for ConvertError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::EncodingError {
                    declared: l_declared,
                    reason: l_reason,
                },
                Self::EncodingError {
                    declared: r_declared,
                    reason: r_reason,
                },
            ) => l_declared == r_declared && l_reason == r_reason,
            (Self::MalformedInput { reason: l_reason }, Self::MalformedInput { reason: r_reason }) => {
                l_reason == r_reason
            }
            (Self::InvalidConfig { reason: l_reason }, Self::InvalidConfig { reason: r_reason })
            | (Self::Panicked { reason: l_reason }, Self::Panicked { reason: r_reason }) => {
                l_reason == r_reason
            }
            (
                Self::ResourceResolution {
                    reference: l_reference,
                },
                Self::ResourceResolution {
                    reference: r_reference,
                },
            ) => l_reference == r_reference,
            (
                Self::UnsupportedStructure { element: l_element },
                Self::UnsupportedStructure { element: r_element },
            ) => l_element == r_element,
            (
                Self::PackagingError { source: l_source },
                Self::PackagingError { source: r_source },
            ) => l_source == r_source,

            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

/// Types of errors that can occur while assembling the EPUB package
///
/// These errors are raised by the package builder when the collected package
/// data would not form a valid EPUB container.
#[derive(Debug, Error)]
pub enum PackagingError {
    /// Illegal manifest path error
    ///
    /// This error is triggered when the path corresponding to a resource ID
    /// in the manifest begins with "../" or is absolute.
    #[error(
        "A manifest with id '{manifest_id}' should not use a path starting with '../' or '/'."
    )]
    IllegalManifestPath { manifest_id: String },

    /// Duplicate manifest id error
    #[error("The manifest id '{manifest_id}' is used more than once.")]
    DuplicateManifestId { manifest_id: String },

    /// Missing necessary metadata error
    ///
    /// The following must be included: title, language, and an identifier with a 'pub-id' ID.
    #[error("Requires at least one 'title', 'language', and 'identifier' with id 'pub-id'.")]
    MissingNecessaryMetadata,

    /// Navigation information uninitialized error
    ///
    /// This error is triggered when attempting to build an EPUB without any navigation entry.
    #[error("Navigation information is not set.")]
    NavigationInfoUninitialized,

    /// Spine item not in manifest error
    #[error("Spine item '{idref}' does not exist in manifest.")]
    SpineItemNotInManifest { idref: String },

    /// Empty spine error
    #[error("The spine does not contain any content document.")]
    EmptySpine,

    /// Invalid output path error
    ///
    /// This error is triggered when the output path has no file name.
    #[error("Expect a file path, but '{target_path}' is not a valid output file path.")]
    InvalidOutputPath { target_path: String },

    /// Output write error
    ///
    /// The archive could not be written to disk, for example because a parent
    /// of the target path is a regular file.
    #[error("Unable to write '{target_path}': {source}")]
    WriteFailed {
        target_path: String,
        source: std::io::Error,
    },

    /// Too many nav flags error
    ///
    /// The manifest must contain **exactly one** item with the `nav` property.
    #[error("There must be exactly one item with 'nav' property in the manifest.")]
    TooManyNavFlags,
}

#[cfg(test)]
impl PartialEq for PackagingError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::IllegalManifestPath { manifest_id: l_id },
                Self::IllegalManifestPath { manifest_id: r_id },
            )
            | (
                Self::DuplicateManifestId { manifest_id: l_id },
                Self::DuplicateManifestId { manifest_id: r_id },
            ) => l_id == r_id,
            (
                Self::SpineItemNotInManifest { idref: l_idref },
                Self::SpineItemNotInManifest { idref: r_idref },
            ) => l_idref == r_idref,
            (
                Self::InvalidOutputPath { target_path: l_path },
                Self::InvalidOutputPath { target_path: r_path },
            )
            | (
                Self::WriteFailed { target_path: l_path, .. },
                Self::WriteFailed { target_path: r_path, .. },
            ) => l_path == r_path,

            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{ConvertError, ErrorKind, PackagingError};

    /// Test classification of fatal and recoverable errors
    #[test]
    fn test_error_kind_and_fatality() {
        let err = ConvertError::MalformedInput { reason: "empty".to_string() };
        assert_eq!(err.kind(), ErrorKind::MalformedInput);
        assert!(err.is_fatal());

        let err = ConvertError::UnsupportedStructure { element: "video".to_string() };
        assert_eq!(err.kind(), ErrorKind::UnsupportedStructure);
        assert!(!err.is_fatal());

        let err = ConvertError::ResourceResolution { reference: "#n1".to_string() };
        assert!(!err.is_fatal());

        let err: ConvertError = PackagingError::TooManyNavFlags.into();
        assert_eq!(err.kind(), ErrorKind::Packaging);
        assert!(err.is_fatal());

        let err = ConvertError::InvalidConfig { reason: "toc depth".to_string() };
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(err.is_fatal());
    }

    /// Test the display text of nested packaging errors
    #[test]
    fn test_packaging_error_display() {
        let err: ConvertError = PackagingError::SpineItemNotInManifest {
            idref: "chapter-001".to_string(),
        }
        .into();

        assert_eq!(
            err.to_string(),
            "Packaging error: Spine item 'chapter-001' does not exist in manifest."
        );
    }
}
