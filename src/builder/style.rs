//! Stylesheet resolution
//!
//! Every content document links a single stylesheet. It is the built-in one,
//! optionally combined with a user stylesheet according to [`CssPolicy`].

use std::fs;

use log::debug;

use crate::{
    config::CssPolicy,
    error::ConvertError,
    model::StylesheetRef,
    report::Diagnostics,
};

/// Built-in stylesheet
pub const DEFAULT_CSS: &str = r#"@charset "UTF-8";

body {
    margin: 0 1em;
    text-align: justify;
    hyphens: auto;
}

h1, h2, h3, h4, h5, h6 {
    text-align: center;
    text-indent: 0;
    hyphens: none;
    page-break-after: avoid;
}

h1 { font-size: 1.6em; margin: 1.5em 0 1em; }
h2 { font-size: 1.4em; margin: 1.3em 0 0.8em; }
h3 { font-size: 1.2em; margin: 1.2em 0 0.6em; }
h4, h5, h6 { font-size: 1em; margin: 1em 0 0.5em; }

p {
    margin: 0;
    text-indent: 1.5em;
}

p.subtitle {
    font-weight: bold;
    text-align: center;
    text-indent: 0;
    margin: 1em 0 0.5em;
}

p.empty-line {
    height: 1em;
}

p.text-author {
    font-style: italic;
    text-align: right;
    text-indent: 0;
}

blockquote.epigraph {
    margin: 1em 0 1em 30%;
    font-style: italic;
}

blockquote.cite {
    margin: 1em 2em;
}

section.poem {
    margin: 1em 0 1em 2em;
}

section.poem p {
    text-indent: 0;
}

p.stanza {
    margin: 0.5em 0;
}

span.verse {
    display: block;
    padding-left: 1em;
    text-indent: -1em;
}

figure.image {
    margin: 1em 0;
    text-align: center;
}

figure.image img {
    max-width: 100%;
}

section.cover {
    text-align: center;
}

section.cover img {
    height: 100%;
    max-width: 100%;
}

table {
    border-collapse: collapse;
    margin: 1em auto;
}

th, td {
    border: 1px solid #888;
    padding: 0.2em 0.4em;
}

a.noteref {
    font-size: 0.75em;
    vertical-align: super;
    line-height: 0;
    text-decoration: none;
}

aside.footnote, li.endnote {
    margin: 0.5em 0;
}

p.note-label {
    font-weight: bold;
    text-indent: 0;
}

span.missing-image, .unsupported {
    color: #888;
}

p.title-authors, p.title-series, p.title-translators {
    text-align: center;
    text-indent: 0;
    margin: 0.5em 0;
}
"#;

/// The resolved stylesheet of a book
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stylesheet {
    pub content: String,
}

impl Stylesheet {
    /// Resolve the stylesheet of a book
    ///
    /// An unreadable user stylesheet is reported as a warning and the
    /// built-in stylesheet is used alone.
    pub fn resolve(
        reference: &StylesheetRef,
        policy: CssPolicy,
        diagnostics: &mut Diagnostics,
    ) -> Self {
        let custom = match reference {
            StylesheetRef::Default => return Self::default(),
            StylesheetRef::Custom(path) => path,
        };

        let custom_css = match fs::read_to_string(custom) {
            Ok(css) => css,
            Err(_) => {
                diagnostics.recover(ConvertError::ResourceResolution {
                    reference: custom.to_string_lossy().to_string(),
                });
                return Self::default();
            }
        };

        debug!("using custom stylesheet {} ({:?})", custom.display(), policy);
        let content = match policy {
            CssPolicy::Merge => format!("{}\n/* custom */\n{}", DEFAULT_CSS, custom_css),
            CssPolicy::Replace => custom_css,
        };

        Self { content }
    }
}

impl Default for Stylesheet {
    fn default() -> Self {
        Self {
            content: DEFAULT_CSS.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{env, fs};

    use crate::{
        builder::style::{DEFAULT_CSS, Stylesheet},
        config::CssPolicy,
        model::StylesheetRef,
        report::{Diagnostics, WarningKind},
    };

    #[test]
    fn test_default_stylesheet() {
        let mut diagnostics = Diagnostics::new();
        let stylesheet =
            Stylesheet::resolve(&StylesheetRef::Default, CssPolicy::Replace, &mut diagnostics);

        assert_eq!(stylesheet.content, DEFAULT_CSS);
        assert!(diagnostics.is_empty());
    }

    /// Test both combination policies with a user stylesheet
    #[test]
    fn test_custom_stylesheet_policies() {
        let path = env::temp_dir().join("fb2epub-style-test-policies.css");
        fs::write(&path, "p { color: red; }").unwrap();
        let reference = StylesheetRef::Custom(path.clone());

        let mut diagnostics = Diagnostics::new();
        let merged = Stylesheet::resolve(&reference, CssPolicy::Merge, &mut diagnostics);
        assert!(merged.content.starts_with(DEFAULT_CSS));
        assert!(merged.content.ends_with("p { color: red; }"));

        let replaced = Stylesheet::resolve(&reference, CssPolicy::Replace, &mut diagnostics);
        assert_eq!(replaced.content, "p { color: red; }");
        assert!(diagnostics.is_empty());

        fs::remove_file(path).unwrap();
    }

    /// Test the fallback for a stylesheet that cannot be read
    #[test]
    fn test_missing_custom_stylesheet() {
        let reference = StylesheetRef::Custom(env::temp_dir().join("fb2epub-no-such-file.css"));
        let mut diagnostics = Diagnostics::new();
        let stylesheet = Stylesheet::resolve(&reference, CssPolicy::Merge, &mut diagnostics);

        assert_eq!(stylesheet, Stylesheet::default());
        assert_eq!(diagnostics.warnings()[0].kind, WarningKind::ResourceResolution);
    }
}
