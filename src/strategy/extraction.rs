use std::collections::HashMap;

use scraper::{ElementRef, Selector};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

/// A `(namespace, value)` tag before persistence. `None` is a bare tag.
pub type RawTag = (Option<String>, String);

const RELATIVE_PREFIXES: [char; 3] = ['#', '.', '/'];
const ACCEPTED_SCHEMES: [&str; 3] = ["http", "https", "data"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    pub value: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ImageRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            width: None,
            height: None,
        }
    }

    pub fn sized(value: impl Into<String>, width: Option<u32>, height: Option<u32>) -> Self {
        Self {
            value: value.into(),
            width,
            height,
        }
    }
}

/// Everything one page said about a single result URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrlEntry {
    pub url: ImageRef,
    pub thumbnails: Vec<ImageRef>,
    pub tags: Vec<RawTag>,
    /// Raw metadata blobs the entry was read from.
    pub provenance: Vec<Value>,
}

impl UrlEntry {
    pub fn new(url: ImageRef) -> Self {
        Self {
            url,
            thumbnails: Vec::new(),
            tags: Vec::new(),
            provenance: Vec::new(),
        }
    }

    pub fn add_thumbnail(&mut self, thumbnail: ImageRef) {
        match self.thumbnails.iter_mut().find(|t| t.value == thumbnail.value) {
            Some(existing) => fill_size(existing, &thumbnail),
            None => self.thumbnails.push(thumbnail),
        }
    }

    pub fn add_provenance(&mut self, blob: Value) {
        if !self.provenance.contains(&blob) {
            self.provenance.push(blob);
        }
    }
}

fn fill_size(target: &mut ImageRef, other: &ImageRef) {
    target.width = target.width.or(other.width);
    target.height = target.height.or(other.height);
}

/// The strategy-agnostic parser output: result URLs in page order, each
/// with its thumbnails and tags, plus tags that apply to all of them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Extraction {
    entries: Vec<UrlEntry>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    pub global_tags: Vec<RawTag>,
    /// Links that were not followed (relative with no source, bad scheme).
    pub skipped: Vec<String>,
    /// Blocks dropped as malformed.
    pub malformed: usize,
}

impl Extraction {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for `url`, created on first sighting. A known entry only
    /// picks up a width/height it did not have yet.
    pub fn entry(&mut self, url: ImageRef) -> &mut UrlEntry {
        let position = match self.index.get(&url.value) {
            Some(&position) => {
                fill_size(&mut self.entries[position].url, &url);
                position
            }
            None => {
                self.index.insert(url.value.clone(), self.entries.len());
                self.entries.push(UrlEntry::new(url));
                self.entries.len() - 1
            }
        };
        &mut self.entries[position]
    }

    pub fn get(&self, url: &str) -> Option<&UrlEntry> {
        self.index.get(url).map(|&position| &self.entries[position])
    }

    pub fn entries(&self) -> &[UrlEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn skip(&mut self, link: impl Into<String>) {
        let link = link.into();
        debug!(link = %link, "link skipped");
        self.skipped.push(link);
    }

    /// Resolves an extracted href/src, recording it as skipped when it
    /// cannot be followed.
    pub fn link(&mut self, raw: &str, source: Option<&Url>) -> Option<String> {
        let resolved = resolve_link(raw, source);
        if resolved.is_none() && !raw.trim().is_empty() {
            self.skip(raw.trim());
        }
        resolved
    }

    /// Folds `other` into this extraction, keeping first-seen order.
    pub fn merge(&mut self, other: Extraction) {
        for incoming in other.entries {
            let entry = self.entry(incoming.url);
            for thumbnail in incoming.thumbnails {
                entry.add_thumbnail(thumbnail);
            }
            entry.tags.extend(incoming.tags);
            for blob in incoming.provenance {
                entry.add_provenance(blob);
            }
        }
        self.global_tags.extend(other.global_tags);
        self.skipped.extend(other.skipped);
        self.malformed += other.malformed;
    }

    /// Rewrites the per-entry tag lists. Global tags are left alone.
    pub fn map_tags<F>(&mut self, mut f: F)
    where
        F: FnMut(Vec<RawTag>) -> Vec<RawTag>,
    {
        for entry in &mut self.entries {
            let tags = std::mem::take(&mut entry.tags);
            entry.tags = f(tags);
        }
    }
}

/// Absolute form of an extracted link, or `None` when it must not become a
/// Url: relative links with no known source, and schemes other than
/// http(s) and data.
pub fn resolve_link(raw: &str, source: Option<&Url>) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = if raw.starts_with(RELATIVE_PREFIXES) {
        source?.join(raw).ok()?
    } else {
        match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => source?.join(raw).ok()?,
            Err(_) => return None,
        }
    };
    if ACCEPTED_SCHEMES.contains(&parsed.scheme()) {
        Some(parsed.into())
    } else {
        None
    }
}

/// Compiles an ordered selector list, dropping any that fail to parse.
pub fn selectors(list: &[&str]) -> Vec<Selector> {
    list.iter().filter_map(|s| Selector::parse(s).ok()).collect()
}

/// First element matched by the first selector that matches anything.
pub fn first_match<'a>(scope: ElementRef<'a>, selectors: &[Selector]) -> Option<ElementRef<'a>> {
    selectors.iter().find_map(|selector| scope.select(selector).next())
}

/// All elements of the first selector that matches anything.
pub fn all_matches<'a>(scope: ElementRef<'a>, selectors: &[Selector]) -> Vec<ElementRef<'a>> {
    selectors
        .iter()
        .map(|selector| scope.select(selector).collect::<Vec<_>>())
        .find(|found| !found.is_empty())
        .unwrap_or_default()
}

/// Whitespace-normalised text content of an element.
pub fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Query parameters of an href, relative or not.
pub fn query_params(href: &str) -> HashMap<String, String> {
    let query = href.split_once('?').map(|(_, q)| q).unwrap_or("");
    let query = query.split_once('#').map(|(q, _)| q).unwrap_or(query);
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    fn source() -> Url {
        Url::parse("http://example.com/gallery/index.html").unwrap()
    }

    #[test]
    fn relative_links_need_a_source() {
        assert_eq!(resolve_link("#foo", None), None);
        assert_eq!(resolve_link("/a.jpg", None), None);
        assert_eq!(resolve_link("./a.jpg", None), None);
        assert_eq!(resolve_link("a.jpg", None), None);
        assert_eq!(
            resolve_link("/a.jpg", Some(&source())).as_deref(),
            Some("http://example.com/a.jpg")
        );
        assert_eq!(
            resolve_link("./a.jpg", Some(&source())).as_deref(),
            Some("http://example.com/gallery/a.jpg")
        );
    }

    #[test]
    fn only_web_schemes_are_followed() {
        assert_eq!(resolve_link("javascript:void(0)", Some(&source())), None);
        assert_eq!(resolve_link("mailto:a@b.c", None), None);
        assert!(resolve_link("data:image/png;base64,AAAA", None).is_some());
        assert_eq!(
            resolve_link("  http://x/1.jpg ", None).as_deref(),
            Some("http://x/1.jpg")
        );
    }

    #[test]
    fn skipped_links_are_recorded() {
        let mut extraction = Extraction::new();
        assert_eq!(extraction.link("#foo", None), None);
        assert_eq!(extraction.link("", None), None);
        assert_eq!(extraction.skipped, vec!["#foo".to_string()]);
    }

    #[test]
    fn entries_keep_first_seen_order_and_fill_sizes() {
        let mut extraction = Extraction::new();
        extraction.entry(ImageRef::new("http://x/2.jpg"));
        extraction.entry(ImageRef::new("http://x/1.jpg"));
        extraction.entry(ImageRef::sized("http://x/2.jpg", Some(10), Some(20)));
        extraction.entry(ImageRef::sized("http://x/2.jpg", Some(99), Some(99)));

        let urls: Vec<&str> = extraction.entries().iter().map(|e| e.url.value.as_str()).collect();
        assert_eq!(urls, vec!["http://x/2.jpg", "http://x/1.jpg"]);
        let entry = extraction.get("http://x/2.jpg").unwrap();
        assert_eq!((entry.url.width, entry.url.height), (Some(10), Some(20)));
    }

    #[test]
    fn merge_dedupes_thumbnails() {
        let mut left = Extraction::new();
        left.entry(ImageRef::new("http://x/1.jpg"))
            .add_thumbnail(ImageRef::new("http://x/t.jpg"));
        let mut right = Extraction::new();
        let entry = right.entry(ImageRef::new("http://x/1.jpg"));
        entry.add_thumbnail(ImageRef::new("http://x/t.jpg"));
        entry.tags.push((None, "cat".into()));
        right.skip("#top");

        left.merge(right);
        assert_eq!(left.len(), 1);
        assert_eq!(left.entries()[0].thumbnails.len(), 1);
        assert_eq!(left.entries()[0].tags, vec![(None, "cat".to_string())]);
        assert_eq!(left.skipped, vec!["#top".to_string()]);
    }

    #[test]
    fn selector_fallback_takes_first_non_empty() {
        let html = Html::parse_document(r#"<div class="b"><a href="/second">2</a></div>"#);
        let list = selectors(&["div.a a", "div.b a", "a"]);
        let found = first_match(html.root_element(), &list).unwrap();
        assert_eq!(found.value().attr("href"), Some("/second"));

        let missing = selectors(&["div.a a", "p"]);
        assert!(first_match(html.root_element(), &missing).is_none());
        assert!(all_matches(html.root_element(), &missing).is_empty());
    }

    #[test]
    fn query_params_of_relative_href() {
        let params = query_params("/imgres?imgurl=http%3A%2F%2Fx%2F1.jpg&w=100&h=80#frag");
        assert_eq!(params.get("imgurl").map(String::as_str), Some("http://x/1.jpg"));
        assert_eq!(params.get("h").map(String::as_str), Some("80"));
        assert!(query_params("no-query").is_empty());
    }
}
