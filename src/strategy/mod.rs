pub mod absolute_links;
pub mod anchor;
pub mod extraction;
pub mod google_image;
pub mod preprocess;
pub mod search_image;

use std::fmt;

use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::{IngestError, Result};
use crate::utils::config::TagConfig;

pub use extraction::{Extraction, ImageRef, RawTag, UrlEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Parser,
    Mode,
    TagPreprocessor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Parser => "parser",
            Role::Mode => "mode",
            Role::TagPreprocessor => "tag preprocessor",
        })
    }
}

/// Name and description of a registered strategy, for selection menus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyInfo {
    pub name: String,
    pub description: String,
    pub role: Role,
}

/// Turns a raw page body into the intermediate extraction shape.
pub trait Parser: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// `source` is the page's final URL; relative links are only followed
    /// when it is known.
    fn parse(&self, body: &str, source: Option<&Url>) -> Result<Extraction>;
}

/// Knows how to ask one search engine for `(term, page)` and which parser
/// reads the answer.
pub trait Mode: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn build_request(&self, term: &str, page: u32) -> Result<Url>;
    /// Registry name of the parser for this mode's responses.
    fn parser(&self) -> &str;

    /// Tags attached to every Url resolved by one run of this mode.
    fn global_tags(&self, term: &str) -> Vec<RawTag> {
        vec![(Some("query".to_string()), term.to_string())]
    }
}

pub trait TagPreprocessor: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn process(&self, tags: Vec<RawTag>) -> Vec<RawTag>;
}

/// Named strategies, populated once at start-up.
#[derive(Default)]
pub struct Registry {
    parsers: Vec<Box<dyn Parser>>,
    modes: Vec<Box<dyn Mode>>,
    preprocessors: Vec<Box<dyn TagPreprocessor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in strategy.
    pub fn with_defaults(tags: &TagConfig) -> Self {
        let mut registry = Self::new();
        registry
            .register_parser(google_image::GoogleImageParser)
            .register_parser(anchor::AnchorParser::default())
            .register_parser(anchor::AnchorImageParser)
            .register_parser(absolute_links::AbsoluteLinksParser)
            .register_mode(google_image::GoogleImageMode)
            .register_mode(anchor::a_tag_mode())
            .register_mode(anchor::a_tag_on_img_tag_mode())
            .register_mode(absolute_links::absolute_links_mode())
            .register_preprocessor(preprocess::GoogleImageTagPreprocessor::from_config(tags));
        registry
    }

    /// Registers a parser; a parser with the same name is replaced.
    pub fn register_parser(&mut self, parser: impl Parser + 'static) -> &mut Self {
        self.parsers.retain(|p| p.name() != parser.name());
        debug!(name = parser.name(), "registered parser");
        self.parsers.push(Box::new(parser));
        self
    }

    pub fn register_mode(&mut self, mode: impl Mode + 'static) -> &mut Self {
        self.modes.retain(|m| m.name() != mode.name());
        debug!(name = mode.name(), "registered mode");
        self.modes.push(Box::new(mode));
        self
    }

    /// Preprocessors run in registration order.
    pub fn register_preprocessor(&mut self, preprocessor: impl TagPreprocessor + 'static) -> &mut Self {
        self.preprocessors.retain(|p| p.name() != preprocessor.name());
        debug!(name = preprocessor.name(), "registered tag preprocessor");
        self.preprocessors.push(Box::new(preprocessor));
        self
    }

    pub fn parser(&self, name: &str) -> Result<&dyn Parser> {
        self.parsers
            .iter()
            .find(|p| p.name() == name)
            .map(|p| &**p)
            .ok_or_else(|| unknown(Role::Parser, name))
    }

    pub fn mode(&self, name: &str) -> Result<&dyn Mode> {
        self.modes
            .iter()
            .find(|m| m.name() == name)
            .map(|m| &**m)
            .ok_or_else(|| unknown(Role::Mode, name))
    }

    pub fn preprocessor(&self, name: &str) -> Result<&dyn TagPreprocessor> {
        self.preprocessors
            .iter()
            .find(|p| p.name() == name)
            .map(|p| &**p)
            .ok_or_else(|| unknown(Role::TagPreprocessor, name))
    }

    /// Runs every registered preprocessor over `tags`.
    pub fn preprocess(&self, tags: Vec<RawTag>) -> Vec<RawTag> {
        self.preprocessors
            .iter()
            .fold(tags, |tags, preprocessor| preprocessor.process(tags))
    }

    pub fn list(&self, role: Role) -> Vec<StrategyInfo> {
        let info = |name: &str, description: &str| StrategyInfo {
            name: name.to_string(),
            description: description.to_string(),
            role,
        };
        match role {
            Role::Parser => self.parsers.iter().map(|p| info(p.name(), p.description())).collect(),
            Role::Mode => self.modes.iter().map(|m| info(m.name(), m.description())).collect(),
            Role::TagPreprocessor => self
                .preprocessors
                .iter()
                .map(|p| info(p.name(), p.description()))
                .collect(),
        }
    }
}

fn unknown(role: Role, name: &str) -> IngestError {
    IngestError::UnknownStrategy {
        role,
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl TagPreprocessor for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "uppercases values"
        }
        fn process(&self, tags: Vec<RawTag>) -> Vec<RawTag> {
            tags.into_iter().map(|(ns, v)| (ns, v.to_uppercase())).collect()
        }
    }

    #[test]
    fn defaults_cover_every_role() {
        let registry = Registry::with_defaults(&TagConfig::default());
        let parsers: Vec<String> = registry.list(Role::Parser).into_iter().map(|i| i.name).collect();
        assert_eq!(
            parsers,
            vec!["google-image", "a-tag", "a-tag-on-img-tag", "absolute-links"]
        );
        assert_eq!(registry.list(Role::Mode).len(), 4);
        assert_eq!(registry.list(Role::TagPreprocessor)[0].name, "google-image");
        for mode in registry.list(Role::Mode) {
            let mode = registry.mode(&mode.name).unwrap();
            assert!(registry.parser(mode.parser()).is_ok());
        }
    }

    #[test]
    fn unknown_names_fail() {
        let registry = Registry::with_defaults(&TagConfig::default());
        match registry.mode("bing") {
            Err(IngestError::UnknownStrategy { role, name }) => {
                assert_eq!(role, Role::Mode);
                assert_eq!(name, "bing");
            }
            _ => panic!("expected UnknownStrategy"),
        }
        assert!(registry.parser("").is_err());
    }

    #[test]
    fn preprocessors_chain_in_order() {
        let mut registry = Registry::with_defaults(&TagConfig::default());
        registry.register_preprocessor(Upper);
        let out = registry.preprocess(vec![(Some("pt".into()), "cat".into())]);
        assert_eq!(out, vec![(Some("picture title".into()), "CAT".into())]);
    }

    #[test]
    fn same_name_replaces() {
        let mut registry = Registry::new();
        registry.register_preprocessor(Upper).register_preprocessor(Upper);
        assert_eq!(registry.list(Role::TagPreprocessor).len(), 1);
    }

    #[test]
    fn role_display_matches_error_text() {
        assert_eq!(Role::TagPreprocessor.to_string(), "tag preprocessor");
    }
}
