//! Conversion pipeline
//!
//! The [`Converter`] runs parser, renderer and package assembler for a single
//! book. Input may be FB2 bytes or a zip archive holding one `.fb2` entry.
//!
//! ## Usage
//!
//! ```rust, no_run
//! use fb2_epub::{config::ConversionConfig, pipeline::Converter};
//!
//! let converter = Converter::new(ConversionConfig::default());
//! let report = converter.convert_file("book.fb2", "book.epub");
//!
//! println!("{:?}: {} warnings", report.status, report.warnings.len());
//! ```
//!
//! ## Notes
//!
//! - Output is written to a `.part` sibling and renamed into place, a failed
//!   conversion never leaves a partial archive behind.
//! - Recoverable problems do not fail the conversion, they end up as warnings
//!   in the [`ConversionReport`].

use std::{
    fs,
    io::{Cursor, Read},
    path::{Path, PathBuf},
};

use log::{debug, error, info};
use zip::ZipArchive;

use crate::{
    builder::{PackageAssembler, content::ContentRenderer, style::Stylesheet},
    config::ConversionConfig,
    error::{ConvertError, PackagingError},
    parser::Fb2Parser,
    report::{ConversionReport, Diagnostics},
};

/// Suffix of the temporary file written next to the output
const PARTIAL_SUFFIX: &str = ".part";

/// Single book converter
#[derive(Debug, Clone, Default)]
pub struct Converter {
    config: ConversionConfig,
}

impl Converter {
    pub fn new(config: ConversionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Convert an FB2 document held in memory
    ///
    /// ## Parameters
    /// - `bytes`: FB2 XML, or a zip archive holding one `.fb2` entry
    /// - `diagnostics`: Sink for recovered problems
    ///
    /// ## Return
    /// - `Ok(Vec<u8>)`: The EPUB archive
    /// - `Err(ConvertError)`: A fatal error, the warnings recorded so far stay
    ///   in `diagnostics`
    pub fn convert_bytes(
        &self,
        bytes: &[u8],
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<u8>, ConvertError> {
        let unpacked;
        let source = if infer::archive::is_zip(bytes) {
            unpacked = extract_fb2(bytes)?;
            unpacked.as_slice()
        } else {
            bytes
        };

        let document = Fb2Parser::new(&self.config).parse(source, diagnostics)?;
        let stylesheet =
            Stylesheet::resolve(&document.stylesheet, self.config.css_policy, diagnostics);
        let book = ContentRenderer::new(&document, &self.config).render(diagnostics)?;

        PackageAssembler::new(&document, &self.config).assemble(book, stylesheet, diagnostics)
    }

    /// Convert a file and write the EPUB archive
    ///
    /// Never fails; fatal errors are recorded in the returned report.
    ///
    /// ## Parameters
    /// - `input`: An `.fb2` or `.fb2.zip` file
    /// - `output`: Path of the EPUB file, parent folders are created
    pub fn convert_file<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input: P,
        output: Q,
    ) -> ConversionReport {
        let (input, output) = (input.as_ref(), output.as_ref());
        let mut diagnostics = Diagnostics::new();

        let result = fs::read(input)
            .map_err(ConvertError::from)
            .and_then(|bytes| self.convert_bytes(&bytes, &mut diagnostics))
            .and_then(|archive| write_atomic(output, &archive));

        match result {
            Ok(()) => {
                info!(
                    "converted {} -> {} ({} warnings)",
                    input.display(),
                    output.display(),
                    diagnostics.warnings().len()
                );
                ConversionReport::succeeded(input, output, diagnostics.into_warnings())
            }
            Err(err) => {
                error!("failed to convert {}: {}", input.display(), err);
                ConversionReport::failed(input, err, diagnostics.into_warnings())
            }
        }
    }
}

/// Returns the content of the `.fb2` entry of a zip archive, the first by name if several
fn extract_fb2(bytes: &[u8]) -> Result<Vec<u8>, ConvertError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let name = archive
        .file_names()
        .filter(|name| name.to_lowercase().ends_with(".fb2"))
        .min()
        .map(str::to_string)
        .ok_or_else(|| ConvertError::MalformedInput {
            reason: "the archive does not contain an .fb2 file".to_string(),
        })?;

    debug!("reading archive entry {}", name);
    let mut data = Vec::new();
    archive.by_name(&name)?.read_to_end(&mut data)?;

    Ok(data)
}

/// Write data to a sibling temporary file and rename it over the target
fn write_atomic(output: &Path, data: &[u8]) -> Result<(), ConvertError> {
    let file_name = match output.file_name() {
        Some(name) if !output.is_dir() => name.to_string_lossy().to_string(),
        _ => {
            return Err(PackagingError::InvalidOutputPath {
                target_path: output.to_string_lossy().to_string(),
            }
            .into());
        }
    };

    let write_failed = |source: std::io::Error| PackagingError::WriteFailed {
        target_path: output.to_string_lossy().to_string(),
        source,
    };

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(write_failed)?;
        }
    }

    let partial = partial_path(output, &file_name);
    if let Err(err) = fs::write(&partial, data).and_then(|_| fs::rename(&partial, output)) {
        let _ = fs::remove_file(&partial);
        return Err(write_failed(err).into());
    }

    Ok(())
}

fn partial_path(output: &Path, file_name: &str) -> PathBuf {
    output.with_file_name(format!("{}{}", file_name, PARTIAL_SUFFIX))
}
