//! FB2 to EPUB library
//!
//! A Rust library for converting FictionBook2 (FB2) books into EPUB 3 packages.
//!
//! The conversion keeps the section structure and the metadata of the book,
//! produces a navigable table of contents and stays readable for EPUB 2
//! reading systems through an NCX file and an OPF guide. Footnotes, images,
//! poems, tables and the other FB2 constructs are mapped to semantic XHTML.
//!
//! ## Features
//!
//! - Parse FB2 documents in any encoding supported by `encoding_rs`, plain or zipped.
//! - Fail-soft rendering: unknown elements and broken references become warnings.
//! - Deterministic output: the same input always yields the same archive.
//! - Parallel batch conversion via the 'batch' feature.
//!
//! ## Quick Start
//!
//! ### Convert a single book
//!
//! ```rust, no_run
//! # use fb2_epub::{config::ConversionConfig, pipeline::Converter, report::ConversionStatus};
//! let config = ConversionConfig::builder()
//!     .default_language("en")
//!     .toc_depth(2)
//!     .build()
//!     .unwrap();
//!
//! let report = Converter::new(config).convert_file("book.fb2", "book.epub");
//! if report.status == ConversionStatus::Partial {
//!     for warning in &report.warnings {
//!         println!("{}", warning);
//!     }
//! }
//! ```
//!
//! ### Convert in memory
//!
//! ```rust
//! # use fb2_epub::{pipeline::Converter, report::Diagnostics};
//! # fn main() -> Result<(), fb2_epub::error::ConvertError> {
//! let fb2 = r#"<FictionBook><body><section><p>Hello</p></section></body></FictionBook>"#;
//!
//! let mut diagnostics = Diagnostics::new();
//! let epub = Converter::default().convert_bytes(fb2.as_bytes(), &mut diagnostics)?;
//! assert!(epub.starts_with(b"PK"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `batch` (default): Enable `fb2_epub::batch`, converts files and whole folders
//!   on a pool of worker threads.
//!
//! ## Logging
//!
//! The crate logs through the `log` facade and never installs a logger.
//! Recovered problems are logged at `warn` level.

pub(crate) mod utils;

#[cfg(feature = "batch")]
pub mod batch;
pub mod builder;
pub mod config;
pub mod error;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod report;
pub mod types;

pub use config::ConversionConfig;
pub use error::ConvertError;
pub use pipeline::Converter;
pub use utils::DecodeBytes;
