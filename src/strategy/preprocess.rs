use tracing::debug;

use crate::strategy::{RawTag, TagPreprocessor};
use crate::utils::config::TagConfig;

/// Engine bookkeeping fields that never become tags.
const DROPPED_NAMESPACES: &[&str] = &[
    "cb", "cl", "cr", "id", "msm", "rt", "sm", "tu", "th", "tw", "ou", "ow", "oh",
];

const RENAME_TABLE: &[(&str, &str)] = &[
    ("page url", "page url"),
    ("pt", "picture title"),
    ("ru", "page url"),
    ("s", "picture subtitle"),
    ("st", "site title"),
    ("title", "picture title"),
];

const COPY_TABLE: &[(&str, &str)] = &[
    ("imgref url", "page url"),
    ("isu", "site"),
    ("rh", "site"),
];

/// Cleans the tag stream coming out of google-image metadata blocks.
#[derive(Debug, Clone)]
pub struct GoogleImageTagPreprocessor {
    noise: Vec<(String, String)>,
    dropped: Vec<String>,
    copy: Vec<(String, String)>,
    rename: Vec<(String, String)>,
}

fn owned(table: &[(&str, &str)]) -> Vec<(String, String)> {
    table.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

impl GoogleImageTagPreprocessor {
    pub fn from_config(config: &TagConfig) -> Self {
        Self {
            noise: config.noise.clone(),
            dropped: DROPPED_NAMESPACES.iter().map(|s| s.to_string()).collect(),
            copy: owned(COPY_TABLE),
            rename: owned(RENAME_TABLE),
        }
    }

    fn is_noise(&self, namespace: Option<&str>, value: &str) -> bool {
        namespace.is_some_and(|ns| self.noise.iter().any(|(n, v)| n == ns && v == value))
    }

    fn process_one(&self, namespace: Option<String>, value: String, out: &mut Vec<RawTag>) {
        if self.is_noise(namespace.as_deref(), &value) {
            debug!(?namespace, value = %value, "noise tag dropped");
            return;
        }
        if is_falsy(&value) {
            debug!(?namespace, value = %value, "tag value is false");
            return;
        }
        let Some(ns) = namespace else {
            out.push((None, value));
            return;
        };
        if self.dropped.iter().any(|d| *d == ns) {
            return;
        }
        for (from, to) in &self.copy {
            if *from == ns {
                out.push((Some(to.clone()), value.clone()));
            }
        }
        let target = self
            .rename
            .iter()
            .find(|(from, _)| *from == ns)
            .map(|(_, to)| to.clone())
            .unwrap_or(ns);
        out.push((Some(target), value));
    }
}

fn is_falsy(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == "0"
}

impl TagPreprocessor for GoogleImageTagPreprocessor {
    fn name(&self) -> &str {
        "google-image"
    }

    fn description(&self) -> &str {
        "drops google image bookkeeping fields and maps their namespaces to readable ones"
    }

    fn process(&self, tags: Vec<RawTag>) -> Vec<RawTag> {
        let mut out = Vec::with_capacity(tags.len());
        for (namespace, value) in tags {
            self.process_one(namespace, value, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(ns: &str, value: &str) -> RawTag {
        (Some(ns.to_string()), value.to_string())
    }

    fn preprocessor() -> GoogleImageTagPreprocessor {
        GoogleImageTagPreprocessor::from_config(&TagConfig::default())
    }

    #[test]
    fn renames_and_passes_through() {
        let out = preprocessor().process(vec![tag("pt", "cat"), tag("st", "Site"), tag("zz", "keep")]);
        assert_eq!(
            out,
            vec![tag("picture title", "cat"), tag("site title", "Site"), tag("zz", "keep")]
        );
    }

    #[test]
    fn drops_noise_falsy_and_bookkeeping() {
        let out = preprocessor().process(vec![
            tag("sc", "1"),
            tag("ity", ""),
            tag("pt", "  "),
            tag("pt", "0"),
            tag("tu", "http://x/t.jpg"),
            tag("ow", "100"),
            (None, String::new()),
        ]);
        assert!(out.is_empty(), "{out:?}");
    }

    #[test]
    fn sc_other_than_one_is_kept() {
        let out = preprocessor().process(vec![tag("sc", "2")]);
        assert_eq!(out, vec![tag("sc", "2")]);
    }

    #[test]
    fn copy_emits_extra_tuple_before_original() {
        let out = preprocessor().process(vec![tag("isu", "x.com"), tag("imgref url", "http://x/p")]);
        assert_eq!(
            out,
            vec![
                tag("site", "x.com"),
                tag("isu", "x.com"),
                tag("page url", "http://x/p"),
                tag("imgref url", "http://x/p"),
            ]
        );
    }

    #[test]
    fn copy_and_rename_on_same_namespace_yield_both() {
        let mut p = preprocessor();
        p.copy.push(("pt".into(), "caption".into()));
        let out = p.process(vec![tag("pt", "cat")]);
        assert_eq!(out, vec![tag("caption", "cat"), tag("picture title", "cat")]);
    }

    #[test]
    fn first_rename_rule_wins() {
        let mut p = preprocessor();
        p.rename.push(("pt".into(), "later".into()));
        assert_eq!(p.process(vec![tag("pt", "cat")]), vec![tag("picture title", "cat")]);
    }

    #[test]
    fn noise_list_is_configurable() {
        let mut config = TagConfig::default();
        config.noise.clear();
        config.noise.push(("st".into(), "spam".into()));
        let p = GoogleImageTagPreprocessor::from_config(&config);
        assert!(p.process(vec![tag("st", "spam")]).is_empty());
        assert_eq!(p.process(vec![tag("sc", "1")]), vec![tag("sc", "1")]);
    }

    #[test]
    fn bare_tags_pass() {
        assert_eq!(
            preprocessor().process(vec![(None, "cat".into())]),
            vec![(None, "cat".to_string())]
        );
    }
}
