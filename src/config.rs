//! Conversion configuration
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], either
//! by using [`ConversionConfig::default()`] or by building one with
//! [`ConversionConfig::builder()`]. The builder validates the options that
//! would otherwise surface as confusing errors halfway through a conversion.
//!
//! ```rust
//! use fb2_epub::config::{ConversionConfig, FootnoteStyle};
//!
//! let config = ConversionConfig::builder()
//!     .default_language("uk")
//!     .footnote_style(FootnoteStyle::Endnote)
//!     .chapter_split_threshold(40_000)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.default_language, "uk");
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::{error::ConvertError, utils::is_valid_language_tag};

/// How footnote bodies are presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FootnoteStyle {
    /// `aside` elements marked `epub:type="footnote"`, shown as pop-ups by
    /// reading systems that support them; the notes document is non-linear
    #[default]
    Popup,

    /// A numbered endnote list that is part of the linear reading order
    Endnote,
}

/// How a custom stylesheet combines with the built-in one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CssPolicy {
    /// The custom rules are appended after the built-in rules and win on conflict
    #[default]
    Merge,

    /// The custom stylesheet replaces the built-in one
    Replace,
}

/// Source of the `dcterms:modified` timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModifiedDate {
    /// Derived from the document date; falls back to the Unix epoch so that
    /// repeated conversions stay byte-identical
    #[default]
    FromSource,

    /// A caller supplied timestamp
    Fixed(DateTime<Utc>),

    /// The wall clock at conversion time, output is no longer reproducible
    Now,
}

/// Configuration for a single FB2 to EPUB conversion
#[derive(Debug, Clone)]
pub struct ConversionConfig {
    /// Optional path to a stylesheet combined with the built-in one
    pub custom_css_path: Option<PathBuf>,

    pub css_policy: CssPolicy,

    /// Size, in characters of text, above which a top-level section is split
    /// into several content documents at subsection boundaries
    ///
    /// `None` keeps exactly one content document per top-level section.
    pub chapter_split_threshold: Option<usize>,

    pub footnote_style: FootnoteStyle,

    /// Language used when the document does not declare a valid one
    pub default_language: String,

    /// Maximum depth of the table of contents, applied to nav and NCX alike
    pub toc_depth: Option<usize>,

    /// Emit a cover page when the document declares a cover image
    pub cover_page: bool,

    /// Emit a page with the book annotation
    pub annotation_page: bool,

    /// Emit a generated title page with title, authors and series
    pub title_page: bool,

    /// Emit a back matter page listing the publication details of the book
    pub copyright_page: bool,

    pub modified: ModifiedDate,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            custom_css_path: None,
            css_policy: CssPolicy::Merge,
            chapter_split_threshold: None,
            footnote_style: FootnoteStyle::Popup,
            default_language: "en".to_string(),
            toc_depth: None,
            cover_page: true,
            annotation_page: true,
            title_page: false,
            copyright_page: false,
            modified: ModifiedDate::FromSource,
        }
    }
}

impl ConversionConfig {
    /// Create a builder seeded with the default configuration
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: ConversionConfig::default(),
        }
    }
}

/// Builder for [`ConversionConfig`]
#[derive(Debug, Clone)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn custom_css_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.custom_css_path = Some(path.into());
        self
    }

    pub fn css_policy(mut self, policy: CssPolicy) -> Self {
        self.config.css_policy = policy;
        self
    }

    pub fn chapter_split_threshold(mut self, chars: usize) -> Self {
        self.config.chapter_split_threshold = Some(chars);
        self
    }

    pub fn footnote_style(mut self, style: FootnoteStyle) -> Self {
        self.config.footnote_style = style;
        self
    }

    pub fn default_language(mut self, language: impl Into<String>) -> Self {
        self.config.default_language = language.into();
        self
    }

    pub fn toc_depth(mut self, depth: usize) -> Self {
        self.config.toc_depth = Some(depth);
        self
    }

    pub fn cover_page(mut self, enabled: bool) -> Self {
        self.config.cover_page = enabled;
        self
    }

    pub fn annotation_page(mut self, enabled: bool) -> Self {
        self.config.annotation_page = enabled;
        self
    }

    pub fn title_page(mut self, enabled: bool) -> Self {
        self.config.title_page = enabled;
        self
    }

    pub fn copyright_page(mut self, enabled: bool) -> Self {
        self.config.copyright_page = enabled;
        self
    }

    pub fn modified(mut self, modified: ModifiedDate) -> Self {
        self.config.modified = modified;
        self
    }

    /// Validate and return the configuration
    ///
    /// ## Return
    /// - `Ok(ConversionConfig)`: The options are consistent
    /// - `Err(ConvertError)`: The default language is not a language tag,
    ///   or a size limit is zero
    pub fn build(self) -> Result<ConversionConfig, ConvertError> {
        let config = self.config;

        if !is_valid_language_tag(&config.default_language) {
            return Err(ConvertError::InvalidConfig {
                reason: format!(
                    "default language \"{}\" is not a valid language tag",
                    config.default_language
                ),
            });
        }

        if config.chapter_split_threshold == Some(0) {
            return Err(ConvertError::InvalidConfig {
                reason: "chapter split threshold must be greater than zero".to_string(),
            });
        }

        if config.toc_depth == Some(0) {
            return Err(ConvertError::InvalidConfig {
                reason: "toc depth must be greater than zero".to_string(),
            });
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::{ConversionConfig, CssPolicy, FootnoteStyle, ModifiedDate},
        error::{ConvertError, ErrorKind},
    };

    /// Test documented defaults
    #[test]
    fn test_default_config() {
        let config = ConversionConfig::default();

        assert_eq!(config.default_language, "en");
        assert_eq!(config.footnote_style, FootnoteStyle::Popup);
        assert_eq!(config.css_policy, CssPolicy::Merge);
        assert_eq!(config.modified, ModifiedDate::FromSource);
        assert!(config.custom_css_path.is_none());
        assert!(config.chapter_split_threshold.is_none());
        assert!(config.toc_depth.is_none());
        assert!(config.cover_page);
        assert!(!config.title_page);
        assert!(!config.copyright_page);
    }

    #[test]
    fn test_builder_sets_options() {
        let config = ConversionConfig::builder()
            .custom_css_path("book.css")
            .css_policy(CssPolicy::Replace)
            .chapter_split_threshold(1000)
            .toc_depth(2)
            .title_page(true)
            .copyright_page(true)
            .build()
            .unwrap();

        assert_eq!(config.custom_css_path.unwrap().to_str(), Some("book.css"));
        assert_eq!(config.css_policy, CssPolicy::Replace);
        assert_eq!(config.chapter_split_threshold, Some(1000));
        assert_eq!(config.toc_depth, Some(2));
        assert!(config.title_page);
        assert!(config.copyright_page);
    }

    /// Test rejection of inconsistent options
    #[test]
    fn test_builder_rejects_invalid_options() {
        let err = ConversionConfig::builder().toc_depth(0).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert_eq!(
            err,
            ConvertError::InvalidConfig {
                reason: "toc depth must be greater than zero".to_string()
            }
        );

        assert!(ConversionConfig::builder().default_language("").build().is_err());
        assert!(
            ConversionConfig::builder()
                .default_language("not a tag")
                .build()
                .is_err()
        );
        assert!(
            ConversionConfig::builder()
                .chapter_split_threshold(0)
                .build()
                .is_err()
        );
        assert!(ConversionConfig::builder().toc_depth(0).build().is_err());
    }
}
