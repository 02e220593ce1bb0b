//! Conversion reports
//!
//! Recoverable problems found while parsing or rendering a book are collected
//! as [`Warning`]s by a [`Diagnostics`] sink instead of aborting the
//! conversion. The pipeline turns them into a [`ConversionReport`] per file.

use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{ConvertError, ErrorKind};

/// Category of a recoverable problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningKind {
    /// An element had no rendering rule and was emitted as plain text
    UnsupportedStructure,

    /// A link, image or cover reference could not be resolved
    ResourceResolution,

    /// The document structure was adjusted, e.g. a section nested too deeply
    Structure,
}

/// A recoverable problem recorded during conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Warning sink shared by parser and renderer
///
/// Every recorded warning is also logged at `warn` level.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning
    pub fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);

        self.warnings.push(Warning { kind, message });
    }

    /// Record a recovered error as a warning
    ///
    /// Fatal errors are not expected here; they are recorded as structure
    /// warnings so that nothing gets lost.
    pub fn recover(&mut self, err: ConvertError) {
        let kind = match err.kind() {
            ErrorKind::UnsupportedStructure => WarningKind::UnsupportedStructure,
            ErrorKind::ResourceResolution => WarningKind::ResourceResolution,
            _ => WarningKind::Structure,
        };

        self.warn(kind, err.to_string());
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }
}

/// Outcome of a single file conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStatus {
    /// Converted without any warning
    Success,

    /// Converted, but with at least one warning
    Partial,

    /// No output was produced
    Failure,
}

/// Per-file conversion report
#[derive(Debug)]
pub struct ConversionReport {
    /// The input file
    pub source: PathBuf,

    /// The written EPUB file, `None` on failure
    pub output: Option<PathBuf>,

    pub status: ConversionStatus,

    pub warnings: Vec<Warning>,

    /// The fatal error, present only when `status` is `Failure`
    pub error: Option<ConvertError>,
}

impl ConversionReport {
    /// Report of a conversion that produced an output file
    pub fn succeeded(source: &Path, output: &Path, warnings: Vec<Warning>) -> Self {
        let status = if warnings.is_empty() {
            ConversionStatus::Success
        } else {
            ConversionStatus::Partial
        };

        Self {
            source: source.to_path_buf(),
            output: Some(output.to_path_buf()),
            status,
            warnings,
            error: None,
        }
    }

    /// Report of a conversion aborted by a fatal error
    pub fn failed(source: &Path, error: ConvertError, warnings: Vec<Warning>) -> Self {
        Self {
            source: source.to_path_buf(),
            output: None,
            status: ConversionStatus::Failure,
            warnings,
            error: Some(error),
        }
    }

    /// The kind of the fatal error, if any
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(ConvertError::kind)
    }

    pub fn is_success(&self) -> bool {
        self.status != ConversionStatus::Failure
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::{
        error::{ConvertError, ErrorKind},
        report::{ConversionReport, ConversionStatus, Diagnostics, WarningKind},
    };

    /// Test that recovered errors keep their classification
    #[test]
    fn test_diagnostics_recover() {
        let mut diagnostics = Diagnostics::new();
        assert!(diagnostics.is_empty());

        diagnostics.recover(ConvertError::UnsupportedStructure {
            element: "video".to_string(),
        });
        diagnostics.recover(ConvertError::ResourceResolution {
            reference: "#missing".to_string(),
        });
        diagnostics.warn(WarningKind::Structure, "flattened");

        let warnings = diagnostics.into_warnings();
        assert_eq!(warnings.len(), 3);
        assert_eq!(warnings[0].kind, WarningKind::UnsupportedStructure);
        assert_eq!(warnings[1].kind, WarningKind::ResourceResolution);
        assert!(warnings[1].message.contains("#missing"));
        assert_eq!(warnings[2].kind, WarningKind::Structure);
    }

    /// Test status derivation of reports
    #[test]
    fn test_report_status() {
        let source = Path::new("book.fb2");
        let output = Path::new("book.epub");

        let report = ConversionReport::succeeded(source, output, vec![]);
        assert_eq!(report.status, ConversionStatus::Success);
        assert!(report.error_kind().is_none());

        let mut diagnostics = Diagnostics::new();
        diagnostics.warn(WarningKind::Structure, "something");
        let report = ConversionReport::succeeded(source, output, diagnostics.into_warnings());
        assert_eq!(report.status, ConversionStatus::Partial);
        assert!(report.is_success());

        let report = ConversionReport::failed(
            source,
            ConvertError::MalformedInput { reason: "x".to_string() },
            vec![],
        );
        assert_eq!(report.status, ConversionStatus::Failure);
        assert_eq!(report.error_kind(), Some(ErrorKind::MalformedInput));
        assert!(report.output.is_none());
    }
}
